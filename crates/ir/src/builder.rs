//! Compilation of labelled modules into control-flow graphs.
//!
//! Each module becomes one CFG; variables of derived type pull in the
//! type-representative module of their callee, which is compiled first and
//! shared between all of its callers. Goto instructions denote explicit
//! jumps after the preceding instruction and become plain edges; call
//! sites expand into the call / call-to-return / return edge triple.

use crate::cfg::{Cfg, CfgKind, Edge, EdgeKind, Vertex, VertexKind};
use crate::error::IrError;
use crate::expression::Label;
use crate::instruction::Instruction;
use crate::module::{Module, ModuleKind, Project};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// Builds CFGs for every module of a project; [`Builder::build`] returns
/// the CFG of the designated main program.
pub struct Builder<'p> {
    project: &'p Project,
    name_to_cfg: BTreeMap<String, Rc<Cfg>>,
    in_progress: BTreeSet<String>,
}

impl<'p> Builder<'p> {
    pub fn new(project: &'p Project) -> Self {
        Builder {
            project,
            name_to_cfg: BTreeMap::new(),
            in_progress: BTreeSet::new(),
        }
    }

    /// Compiles every module and returns the main program's CFG.
    pub fn build(mut self) -> Result<Rc<Cfg>, IrError> {
        for module in self.project.modules() {
            self.build_module(module)?;
        }
        let main = self.project.main().name().to_string();
        let cfg = self
            .name_to_cfg
            .get(&main)
            .cloned()
            .ok_or_else(|| IrError::invalid(format!("main cfg {} was not built", main)))?;
        cfg.check_invariants()?;
        Ok(cfg)
    }

    fn build_module(&mut self, module: &Module) -> Result<(), IrError> {
        let name = module.name().to_string();
        if self.name_to_cfg.contains_key(&name) {
            return Ok(());
        }
        if !self.in_progress.insert(name.clone()) {
            return Err(IrError::invalid(format!(
                "cyclic call graph through module {}",
                name
            )));
        }

        // Compile type representatives first; the call graph is acyclic,
        // so the recursion terminates.
        let mut callees = BTreeMap::new();
        for variable in module.interface().variables() {
            if let Some(type_name) = variable.data_type().derived_name() {
                let callee_module = self.project.module(type_name)?;
                self.build_module(callee_module)?;
                let callee = self.name_to_cfg[type_name].clone();
                callees.insert(type_name.to_string(), callee);
            }
        }

        let kind = match module.kind() {
            ModuleKind::Program => CfgKind::Program,
            ModuleKind::FunctionBlock => CfgKind::FunctionBlock,
            ModuleKind::Function => CfgKind::Function,
        };

        let entry_label = module.entry_label();
        let exit_label = module.exit_label();
        let mut vertices = BTreeMap::new();
        vertices.insert(entry_label, Vertex::new(entry_label, VertexKind::Entry));
        vertices.insert(exit_label, Vertex::new(exit_label, VertexKind::Exit));
        let mut edges = vec![Edge::new(
            entry_label,
            entry_label + 1,
            EdgeKind::Intraprocedural,
        )];

        for (&label, instruction) in module.instructions() {
            self.compile_instruction(&name, &callees, label, instruction, &mut vertices, &mut edges)?;
        }

        let cfg = Rc::new(Cfg::new(
            kind,
            name.clone(),
            module.interface().clone(),
            callees,
            vertices,
            edges,
            entry_label,
            exit_label,
        ));
        self.in_progress.remove(&name);
        self.name_to_cfg.insert(name, cfg);
        Ok(())
    }

    fn compile_instruction(
        &self,
        caller: &str,
        callees: &BTreeMap<String, Rc<Cfg>>,
        label: Label,
        instruction: &Instruction,
        vertices: &mut BTreeMap<Label, Vertex>,
        edges: &mut Vec<Edge>,
    ) -> Result<(), IrError> {
        match instruction {
            Instruction::Assignment(_) | Instruction::Havoc { .. } => {
                vertices.insert(
                    label,
                    Vertex::with_instruction(label, VertexKind::Regular, instruction.clone()),
                );
            }
            Instruction::Goto { label: target } => {
                // A goto is an explicit jump after the preceding
                // instruction; it yields an edge, not a vertex.
                edges.push(Edge::new(label - 1, *target, EdgeKind::Intraprocedural));
            }
            Instruction::If {
                then_label,
                else_label,
                ..
            } => {
                vertices.insert(
                    label,
                    Vertex::with_instruction(label, VertexKind::Regular, instruction.clone()),
                );
                edges.push(Edge::new(label, *then_label, EdgeKind::TrueBranch));
                edges.push(Edge::new(label, *else_label, EdgeKind::FalseBranch));
            }
            Instruction::While {
                body_label,
                exit_label,
                ..
            } => {
                vertices.insert(
                    label,
                    Vertex::with_instruction(label, VertexKind::Regular, instruction.clone()),
                );
                edges.push(Edge::new(label, *body_label, EdgeKind::TrueBranch));
                edges.push(Edge::new(label, *exit_label, EdgeKind::FalseBranch));
            }
            Instruction::Call(call) => {
                vertices.insert(
                    label,
                    Vertex::with_instruction(label, VertexKind::Regular, instruction.clone()),
                );
                let type_name = call
                    .callee
                    .variable()
                    .data_type()
                    .derived_name()
                    .ok_or_else(|| {
                        IrError::invalid(format!(
                            "call at L{} does not invoke a derived-typed variable",
                            label
                        ))
                    })?
                    .to_string();
                let callee = callees.get(&type_name).ok_or_else(|| {
                    IrError::invalid(format!("no type representative cfg for {} exists", type_name))
                })?;
                edges.push(Edge::new(
                    label,
                    call.entry_label,
                    EdgeKind::InterproceduralCall,
                ));
                edges.push(Edge::new(
                    label,
                    call.return_label,
                    EdgeKind::IntraproceduralCallToReturn,
                ));
                edges.push(Edge::new(
                    callee.exit_label(),
                    call.return_label,
                    EdgeKind::InterproceduralReturn {
                        caller: caller.to_string(),
                        call_label: label,
                    },
                ));
            }
            Instruction::Sequence(_) => {
                return Err(IrError::NotImplemented(
                    "sequence instructions in front-end modules".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{BinaryOperator, Expression, VariableAccess};
    use crate::instruction::Call;
    use crate::interface::Interface;
    use crate::types::DataType;
    use crate::variable::{StorageType, Variable};

    // IF x THEN y := 1 ELSE y := 2 END_IF as a labelled module:
    //   0: ENTRY
    //   1: IF x THEN L2 ELSE L4
    //   2: y := 1      3: GOTO 6
    //   4: y := 2      5: GOTO 6
    //   6: EXIT
    fn make_branching_project() -> Project {
        let x = Variable::shared("x", DataType::BOOL, StorageType::Input);
        let y = Variable::shared("y", DataType::INT, StorageType::Output);
        let interface = Interface::new(vec![x.clone(), y.clone()]);
        let mut instructions = BTreeMap::new();
        instructions.insert(
            1,
            Instruction::If {
                condition: Expression::variable(x),
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
        Project::new(vec![module], "P").unwrap()
    }

    #[test]
    fn test_branching_edges() {
        let project = make_branching_project();
        let cfg = Builder::new(&project).build().unwrap();
        assert_eq!(cfg.true_edge(1).unwrap().target(), 2);
        assert_eq!(cfg.false_edge(1).unwrap().target(), 4);
        assert_eq!(cfg.succeeding_labels(0), vec![1]);
        // Both arms join at the exit through their gotos.
        assert_eq!(cfg.single_successor(2).unwrap(), 6);
        assert_eq!(cfg.single_successor(4).unwrap(), 6);
        cfg.check_invariants().unwrap();
    }

    #[test]
    fn test_missing_then_branch_still_has_two_edges() {
        // IF x THEN y := 1 END_IF: the else side targets the join directly.
        let x = Variable::shared("x", DataType::BOOL, StorageType::Input);
        let y = Variable::shared("y", DataType::INT, StorageType::Output);
        let interface = Interface::new(vec![x.clone(), y.clone()]);
        let mut instructions = BTreeMap::new();
        instructions.insert(
            1,
            Instruction::If {
                condition: Expression::variable(x),
                then_label: 2,
                else_label: 4,
            },
        );
        instructions.insert(
            2,
            Instruction::assignment(VariableAccess::new(y), Expression::IntegerConstant(1)),
        );
        instructions.insert(3, Instruction::Goto { label: 4 });
        let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 4);
        let project = Project::new(vec![module], "P").unwrap();
        let cfg = Builder::new(&project).build().unwrap();
        assert_eq!(cfg.succeeding_labels(1).len(), 2);
        assert_eq!(cfg.false_edge(1).unwrap().target(), 4);
        assert_eq!(cfg.exit_label(), 4);
    }

    // P calls f : Fb1; Fb1 increments its input.
    //   P:   0 ENTRY, 1 f.i := 3, 2 GOTO 3, 3 CALL f (ret 5, entry 10),
    //        4 GOTO 5 is implied by call-to-return, 5 y := f.o, 6 GOTO 7, 7 EXIT
    //   Fb1: 10 ENTRY, 11 o := i + 1, 12 GOTO 13, 13 EXIT
    fn make_call_project() -> Project {
        let i = Variable::shared("i", DataType::INT, StorageType::Input);
        let o = Variable::shared("o", DataType::INT, StorageType::Output);
        let fb_interface = Interface::new(vec![i.clone(), o.clone()]);
        let mut fb_instructions = BTreeMap::new();
        fb_instructions.insert(
            11,
            Instruction::assignment(
                VariableAccess::new(o),
                Expression::binary(
                    BinaryOperator::Add,
                    Expression::variable(i),
                    Expression::IntegerConstant(1),
                ),
            ),
        );
        fb_instructions.insert(12, Instruction::Goto { label: 13 });
        let fb = Module::new(
            ModuleKind::FunctionBlock,
            "Fb1",
            fb_interface,
            fb_instructions,
            10,
            13,
        );

        let f = Variable::shared("f", DataType::Derived { name: "Fb1".to_string() }, StorageType::Local);
        let y = Variable::shared("y", DataType::INT, StorageType::Output);
        let fi = Variable::shared("i", DataType::INT, StorageType::Input);
        let fo = Variable::shared("o", DataType::INT, StorageType::Output);
        let interface = Interface::new(vec![f.clone(), y.clone()]);
        let mut instructions = BTreeMap::new();
        use crate::expression::{FieldAccess, VariableReference};
        instructions.insert(
            1,
            Instruction::assignment(
                FieldAccess::new(
                    VariableAccess::new(f.clone()),
                    VariableReference::Variable(VariableAccess::new(fi)),
                ),
                Expression::IntegerConstant(3),
            ),
        );
        instructions.insert(2, Instruction::Goto { label: 3 });
        instructions.insert(
            3,
            Instruction::Call(Call::new(VariableAccess::new(f.clone()), 5, 10)),
        );
        instructions.insert(
            5,
            Instruction::assignment(
                VariableAccess::new(y),
                Expression::FieldAccess(FieldAccess::new(
                    VariableAccess::new(f),
                    VariableReference::Variable(VariableAccess::new(fo)),
                )),
            ),
        );
        instructions.insert(6, Instruction::Goto { label: 7 });
        let main = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 7);
        Project::new(vec![main, fb], "P").unwrap()
    }

    #[test]
    fn test_call_edge_triple() {
        let project = make_call_project();
        let cfg = Builder::new(&project).build().unwrap();
        assert_eq!(cfg.interprocedural_call_edge(3).unwrap().target(), 10);
        assert_eq!(cfg.call_to_return_edge(3).unwrap().target(), 5);
        let return_edge = cfg.interprocedural_return_edge(5).unwrap();
        assert_eq!(return_edge.source(), 13);
        match return_edge.kind() {
            EdgeKind::InterproceduralReturn { caller, call_label } => {
                assert_eq!(caller, "P");
                assert_eq!(*call_label, 3);
            }
            other => panic!("unexpected edge kind {:?}", other),
        }
        let callee = cfg.callee(3).unwrap();
        assert_eq!(callee.name(), "Fb1");
        assert_eq!(cfg.call_labels("Fb1").unwrap(), vec![3]);
    }

    #[test]
    fn test_flattened_interface_expands_derived() {
        let project = make_call_project();
        let cfg = Builder::new(&project).build().unwrap();
        let names: Vec<_> = cfg
            .flattened_interface()
            .iter()
            .map(|v| v.name().to_string())
            .collect();
        assert_eq!(names, vec!["f.i", "f.o", "y"]);
    }
}
