//! Collection of change-annotated vertices of a unified program.
//!
//! The shadow engine only pays for dual evaluation when a unified CFG
//! actually carries change annotations; this pass finds the labels that
//! do, across the whole callee graph.

use cyclist_ir::cfg::Cfg;
use cyclist_ir::expression::Label;
use cyclist_ir::instruction::Instruction;
use std::collections::{BTreeMap, BTreeSet};

/// Labels of vertices whose instructions contain a change annotation,
/// keyed by CFG name.
pub fn collect_change_labels(cfg: &Cfg) -> BTreeMap<String, BTreeSet<Label>> {
    let mut collected = BTreeMap::new();
    let mut visited = BTreeSet::new();
    collect(cfg, &mut collected, &mut visited);
    collected
}

fn collect(
    cfg: &Cfg,
    collected: &mut BTreeMap<String, BTreeSet<Label>>,
    visited: &mut BTreeSet<String>,
) {
    if !visited.insert(cfg.name().to_string()) {
        return;
    }
    for (_, callee) in cfg.callees() {
        collect(callee, collected, visited);
    }
    let mut labels = BTreeSet::new();
    for vertex in cfg.vertices() {
        if let Some(instruction) = vertex.instruction() {
            if instruction_contains_change(instruction) {
                labels.insert(vertex.label());
            }
        }
    }
    if !labels.is_empty() {
        collected.insert(cfg.name().to_string(), labels);
    }
}

fn instruction_contains_change(instruction: &Instruction) -> bool {
    match instruction {
        Instruction::Assignment(assignment) => assignment.rhs.contains_change(),
        Instruction::If { condition, .. } | Instruction::While { condition, .. } => {
            condition.contains_change()
        }
        Instruction::Sequence(members) => members.iter().any(instruction_contains_change),
        Instruction::Havoc { .. } | Instruction::Call(_) | Instruction::Goto { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyclist_ir::builder::Builder;
    use cyclist_ir::expression::{BinaryOperator, Expression, VariableAccess};
    use cyclist_ir::interface::Interface;
    use cyclist_ir::module::{Module, ModuleKind, Project};
    use cyclist_ir::types::DataType;
    use cyclist_ir::variable::{StorageType, Variable};
    use std::collections::BTreeMap as Map;

    #[test]
    fn test_collects_annotated_guard() {
        let x = Variable::shared("x", DataType::INT, StorageType::Input);
        let y = Variable::shared("y", DataType::INT, StorageType::Output);
        let interface = Interface::new(vec![x.clone(), y.clone()]);
        let mut instructions = Map::new();
        instructions.insert(
            1,
            Instruction::If {
                condition: Expression::change(
                    Expression::binary(
                        BinaryOperator::GreaterThan,
                        Expression::variable(x.clone()),
                        Expression::IntegerConstant(0),
                    ),
                    Expression::binary(
                        BinaryOperator::GreaterThanOrEqualTo,
                        Expression::variable(x),
                        Expression::IntegerConstant(0),
                    ),
                ),
                then_label: 2,
                else_label: 4,
            },
        );
        instructions.insert(
            2,
            Instruction::assignment(VariableAccess::new(y.clone()), Expression::IntegerConstant(1)),
        );
        instructions.insert(3, Instruction::Goto { label: 6 });
        instructions.insert(
            4,
            Instruction::assignment(VariableAccess::new(y), Expression::IntegerConstant(2)),
        );
        instructions.insert(5, Instruction::Goto { label: 6 });
        let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 6);
        let project = Project::new(vec![module], "P").unwrap();
        let cfg = Builder::new(&project).build().unwrap();
        let collected = collect_change_labels(&cfg);
        assert_eq!(collected.len(), 1);
        assert!(collected["P"].contains(&1));
    }

    #[test]
    fn test_unannotated_program_collects_nothing() {
        let y = Variable::shared("y", DataType::INT, StorageType::Output);
        let interface = Interface::new(vec![y.clone()]);
        let mut instructions = Map::new();
        instructions.insert(
            1,
            Instruction::assignment(VariableAccess::new(y), Expression::IntegerConstant(1)),
        );
        instructions.insert(2, Instruction::Goto { label: 3 });
        let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 3);
        let project = Project::new(vec![module], "P").unwrap();
        let cfg = Builder::new(&project).build().unwrap();
        assert!(collect_change_labels(&cfg).is_empty());
    }
}
