//! Three-address conversion.
//!
//! Recursively descends expressions; any strict sub-expression that is a
//! binary or unary application is hoisted into a fresh temporary
//! `temp_k : <type>` whose type is inferred from the hoisted expression
//! (arithmetic -> `INT`, boolean -> `BOOL`). `If` and `While` guards that
//! are still compound after descent become temporaries as well; the
//! hoisted guard computation lands in the same vertex as the branch, so a
//! while back edge re-evaluates it. Havoc and call instructions are
//! already in three-address form and are preserved verbatim, as are
//! parameter in/out assignments.

use cyclist_ir::cfg::{Cfg, Vertex, VertexKind};
use cyclist_ir::error::IrError;
use cyclist_ir::expression::{Expression, ExpressionType, Label, VariableAccess};
use cyclist_ir::instruction::{Assignment, AssignmentKind, Instruction};
use cyclist_ir::interface::Interface;
use cyclist_ir::types::DataType;
use cyclist_ir::variable::{StorageType, Variable};
use std::collections::BTreeMap;
use std::rc::Rc;

const TEMPORARY_VARIABLE_NAME_PREFIX: &str = "temp";

/// The three-address conversion pass. A single instance may be applied to
/// several CFGs; temporaries stay unique across all of them.
pub struct TacPass {
    transformed: BTreeMap<String, Rc<Cfg>>,
    next_value: u32,
}

impl TacPass {
    pub fn new() -> Self {
        TacPass {
            transformed: BTreeMap::new(),
            next_value: 0,
        }
    }

    /// Applies the pass, transforming callees first and sharing them
    /// between callers.
    pub fn apply(&mut self, cfg: &Cfg) -> Result<Rc<Cfg>, IrError> {
        let mut callees = BTreeMap::new();
        for (name, callee) in cfg.callees() {
            let transformed = match self.transformed.get(name) {
                Some(existing) => existing.clone(),
                None => {
                    let fresh = self.apply(callee)?;
                    self.transformed.insert(name.clone(), fresh.clone());
                    fresh
                }
            };
            callees.insert(name.clone(), transformed);
        }

        let mut lowering = Lowering {
            pass: self,
            label_to_instructions: BTreeMap::new(),
            temporaries: Vec::new(),
        };
        for vertex in cfg.vertices() {
            match vertex.kind() {
                VertexKind::Entry | VertexKind::Exit => {
                    // Entry and exit instructions, if any, are move
                    // sequences and therefore already in TAC form.
                    if let Some(instruction) = vertex.instruction() {
                        lowering
                            .label_to_instructions
                            .entry(vertex.label())
                            .or_default()
                            .push(instruction.clone());
                    }
                }
                VertexKind::Regular => {
                    let instruction = vertex.instruction().ok_or_else(|| {
                        IrError::invalid(format!(
                            "regular vertex L{} holds no instruction",
                            vertex.label()
                        ))
                    })?;
                    lowering.lower(vertex.label(), instruction)?;
                }
            }
        }
        tracing::trace!(
            cfg = cfg.name(),
            temporaries = lowering.temporaries.len(),
            "three-address conversion finished"
        );

        let mut variables: Vec<Rc<Variable>> = cfg.interface().variables().cloned().collect();
        variables.extend(lowering.temporaries.iter().cloned());
        let label_to_instructions = lowering.label_to_instructions;

        let mut vertices = BTreeMap::new();
        for vertex in cfg.vertices() {
            vertices.insert(
                vertex.label(),
                repackage(vertex, label_to_instructions.get(&vertex.label())),
            );
        }
        let edges = cfg.edges().cloned().collect();

        Ok(Rc::new(Cfg::new(
            cfg.kind(),
            cfg.name(),
            Interface::new(variables),
            callees,
            vertices,
            edges,
            cfg.entry_label(),
            cfg.exit_label(),
        )))
    }
}

impl Default for TacPass {
    fn default() -> Self {
        TacPass::new()
    }
}

/// Per-CFG lowering state.
struct Lowering<'a> {
    pass: &'a mut TacPass,
    label_to_instructions: BTreeMap<Label, Vec<Instruction>>,
    temporaries: Vec<Rc<Variable>>,
}

impl Lowering<'_> {
    fn lower(&mut self, label: Label, instruction: &Instruction) -> Result<(), IrError> {
        match instruction {
            Instruction::Assignment(assignment) => match assignment.kind {
                AssignmentKind::Regular => {
                    let rhs = self.lower_expression(label, &assignment.rhs)?;
                    self.push(
                        label,
                        Instruction::Assignment(Assignment {
                            target: assignment.target.clone(),
                            rhs,
                            kind: AssignmentKind::Regular,
                        }),
                    );
                }
                // Parameter moves are explicit and already flat.
                AssignmentKind::ParameterIn | AssignmentKind::ParameterOut => {
                    self.push(label, Instruction::Assignment(assignment.clone()));
                }
            },
            Instruction::Havoc { .. } | Instruction::Call(_) => {
                self.push(label, instruction.clone());
            }
            Instruction::If {
                condition,
                then_label,
                else_label,
            } => {
                let condition = self.lower_guard(label, condition)?;
                self.push(
                    label,
                    Instruction::If {
                        condition,
                        then_label: *then_label,
                        else_label: *else_label,
                    },
                );
            }
            Instruction::While {
                condition,
                body_label,
                exit_label,
            } => {
                // The hoisted guard lands in the header vertex, which the
                // back edge re-enters, so the temporary recomputes on
                // every iteration.
                let condition = self.lower_guard(label, condition)?;
                self.push(
                    label,
                    Instruction::While {
                        condition,
                        body_label: *body_label,
                        exit_label: *exit_label,
                    },
                );
            }
            Instruction::Sequence(members) => {
                for member in members {
                    self.lower(label, member)?;
                }
            }
            Instruction::Goto { .. } => {
                return Err(IrError::NotImplemented(
                    "goto instructions in compiled CFGs".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Lowers an expression, hoisting compound strict sub-expressions.
    fn lower_expression(&mut self, label: Label, expression: &Expression) -> Result<Expression, IrError> {
        match expression {
            Expression::Binary { op, left, right } => {
                let left = self.lower_operand(label, left)?;
                let right = self.lower_operand(label, right)?;
                Ok(Expression::binary(*op, left, right))
            }
            Expression::Unary { op, operand } => {
                let operand = self.lower_operand(label, operand)?;
                Ok(Expression::unary(*op, operand))
            }
            Expression::BooleanToIntegerCast(inner) => {
                let inner = self.lower_operand(label, inner)?;
                Ok(Expression::BooleanToIntegerCast(Box::new(inner)))
            }
            Expression::IntegerToBooleanCast(inner) => {
                let inner = self.lower_operand(label, inner)?;
                Ok(Expression::IntegerToBooleanCast(Box::new(inner)))
            }
            // Change annotations stay intact: hoisting either version out
            // of the annotation would lose the old/new pairing.
            _ => Ok(expression.clone()),
        }
    }

    fn lower_operand(&mut self, label: Label, operand: &Expression) -> Result<Expression, IrError> {
        let lowered = self.lower_expression(label, operand)?;
        if lowered.is_compound() {
            let access = self.introduce_temporary(label, lowered)?;
            Ok(Expression::VariableAccess(access))
        } else {
            Ok(lowered)
        }
    }

    /// Lowers a guard; a guard that is still compound becomes a temporary
    /// so the branch condition is a plain access.
    fn lower_guard(&mut self, label: Label, guard: &Expression) -> Result<Expression, IrError> {
        let lowered = self.lower_expression(label, guard)?;
        if lowered.is_compound() {
            let access = self.introduce_temporary(label, lowered)?;
            Ok(Expression::VariableAccess(access))
        } else {
            Ok(lowered)
        }
    }

    fn introduce_temporary(
        &mut self,
        label: Label,
        expression: Expression,
    ) -> Result<VariableAccess, IrError> {
        let data_type = match expression.expression_type() {
            ExpressionType::Arithmetic => DataType::INT,
            ExpressionType::Boolean => DataType::BOOL,
            ExpressionType::Undefined => {
                return Err(IrError::invalid(format!(
                    "cannot infer the type of hoisted expression {}",
                    expression
                )));
            }
        };
        let name = format!("{}{}", TEMPORARY_VARIABLE_NAME_PREFIX, self.pass.next_value);
        self.pass.next_value += 1;
        let temporary = Variable::shared(name, data_type, StorageType::Temporary);
        self.temporaries.push(temporary.clone());
        let access = VariableAccess::new(temporary);
        self.push(
            label,
            Instruction::Assignment(Assignment::regular(access.clone(), expression)),
        );
        Ok(access)
    }

    fn push(&mut self, label: Label, instruction: Instruction) {
        self.label_to_instructions
            .entry(label)
            .or_default()
            .push(instruction);
    }
}

/// Packages a label's lowered instruction list back into a vertex; more
/// than one instruction becomes a sequence.
fn repackage(vertex: &Vertex, instructions: Option<&Vec<Instruction>>) -> Vertex {
    match instructions {
        None => Vertex::new(vertex.label(), vertex.kind()),
        Some(list) if list.len() == 1 => {
            Vertex::with_instruction(vertex.label(), vertex.kind(), list[0].clone())
        }
        Some(list) => Vertex::with_instruction(
            vertex.label(),
            vertex.kind(),
            Instruction::Sequence(list.clone()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyclist_ir::builder::Builder;
    use cyclist_ir::expression::BinaryOperator;
    use cyclist_ir::module::{Module, ModuleKind, Project};

    // y := (a + b) * c as a labelled module.
    fn make_compound_project() -> Project {
        let a = Variable::shared("a", DataType::INT, StorageType::Input);
        let b = Variable::shared("b", DataType::INT, StorageType::Input);
        let c = Variable::shared("c", DataType::INT, StorageType::Input);
        let y = Variable::shared("y", DataType::INT, StorageType::Output);
        let interface = Interface::new(vec![a.clone(), b.clone(), c.clone(), y.clone()]);
        let mut instructions = BTreeMap::new();
        instructions.insert(
            1,
            Instruction::assignment(
                VariableAccess::new(y),
                Expression::binary(
                    BinaryOperator::Multiply,
                    Expression::binary(
                        BinaryOperator::Add,
                        Expression::variable(a),
                        Expression::variable(b),
                    ),
                    Expression::variable(c),
                ),
            ),
        );
        instructions.insert(2, Instruction::Goto { label: 3 });
        let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 3);
        Project::new(vec![module], "P").unwrap()
    }

    #[test]
    fn test_hoists_strict_subexpressions() {
        let project = make_compound_project();
        let cfg = Builder::new(&project).build().unwrap();
        let tac = TacPass::new().apply(&cfg).unwrap();
        // The vertex now holds [temp0 := (a + b); y := (temp0 * c)].
        let vertex = tac.vertex(1).unwrap();
        let members = vertex.instruction().unwrap().members();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].to_string(), "temp0 := (a + b)");
        assert_eq!(members[1].to_string(), "y := (temp0 * c)");
        // The temporary joined the interface.
        assert!(tac.interface().variable("temp0").is_some());
        assert_eq!(
            tac.interface().variable("temp0").unwrap().storage(),
            StorageType::Temporary
        );
    }

    #[test]
    fn test_tac_is_idempotent() {
        let project = make_compound_project();
        let cfg = Builder::new(&project).build().unwrap();
        let once = TacPass::new().apply(&cfg).unwrap();
        let twice = TacPass::new().apply(&once).unwrap();
        // A second application hoists nothing further.
        assert_eq!(
            once.interface().temporary_variables().count(),
            twice.interface().temporary_variables().count()
        );
        assert_eq!(
            once.vertex(1).unwrap().instruction().unwrap().members().len(),
            twice.vertex(1).unwrap().instruction().unwrap().members().len()
        );
    }

    #[test]
    fn test_compound_guard_becomes_temporary() {
        let x = Variable::shared("x", DataType::INT, StorageType::Input);
        let y = Variable::shared("y", DataType::INT, StorageType::Output);
        let interface = Interface::new(vec![x.clone(), y.clone()]);
        let mut instructions = BTreeMap::new();
        instructions.insert(
            1,
            Instruction::If {
                condition: Expression::binary(
                    BinaryOperator::GreaterThan,
                    Expression::variable(x),
                    Expression::IntegerConstant(10),
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
        let tac = TacPass::new().apply(&cfg).unwrap();
        let members = tac.vertex(1).unwrap().instruction().unwrap().members().to_vec();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].to_string(), "temp0 := (x > 10)");
        match &members[1] {
            Instruction::If { condition, .. } => {
                assert_eq!(condition.to_string(), "temp0");
            }
            other => panic!("unexpected instruction {}", other),
        }
    }
}
