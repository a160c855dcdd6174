//! Basic-block formation.
//!
//! Leaders are: the entry and its successor, any vertex with more than one
//! predecessor, the target of a call-to-return edge, both successors of an
//! `If`, a `While` header and both its successors, and the exit. A
//! straight-line run between consecutive leaders is packaged into a single
//! sequence vertex at the run's leader; a run may absorb a trailing `If`
//! or `Call`, whose branch or call edges are then re-sourced to the
//! leader.

use cyclist_ir::cfg::{Cfg, Edge, EdgeKind, Vertex, VertexKind};
use cyclist_ir::error::IrError;
use cyclist_ir::expression::Label;
use cyclist_ir::instruction::Instruction;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// The basic-block formation pass with per-type-representative
/// memoization.
pub struct BasicBlockPass {
    transformed: BTreeMap<String, Rc<Cfg>>,
}

/// The instruction kind that decides a vertex's control-flow role; for a
/// sequence this is its final member.
enum TerminalKind {
    StraightLine,
    Call,
    Branch,
    WhileHeader,
}

fn terminal_kind(instruction: &Instruction) -> Result<TerminalKind, IrError> {
    let terminal = instruction.members().last().ok_or_else(|| {
        IrError::invalid("a vertex holds an empty instruction sequence".to_string())
    })?;
    match terminal {
        Instruction::Assignment(_) | Instruction::Havoc { .. } => Ok(TerminalKind::StraightLine),
        Instruction::Call(_) => Ok(TerminalKind::Call),
        Instruction::If { .. } => Ok(TerminalKind::Branch),
        Instruction::While { .. } => Ok(TerminalKind::WhileHeader),
        Instruction::Sequence(_) => Err(IrError::invalid(
            "nested instruction sequences are not expected".to_string(),
        )),
        Instruction::Goto { .. } => Err(IrError::NotImplemented(
            "goto instructions in compiled CFGs".to_string(),
        )),
    }
}

impl BasicBlockPass {
    pub fn new() -> Self {
        BasicBlockPass {
            transformed: BTreeMap::new(),
        }
    }

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

        let leaders = self.leaders(cfg)?;
        let mut vertices = BTreeMap::new();
        let mut edges = Vec::new();

        for &leader in &leaders {
            if leader == cfg.entry_label() {
                let entry = cfg.entry();
                vertices.insert(
                    leader,
                    match entry.instruction() {
                        Some(instruction) => {
                            Vertex::with_instruction(leader, VertexKind::Entry, instruction.clone())
                        }
                        None => Vertex::new(leader, VertexKind::Entry),
                    },
                );
                let outgoing = cfg.outgoing_edges(leader);
                if outgoing.len() != 1 {
                    return Err(IrError::invalid(format!(
                        "entry L{} does not have exactly one successor",
                        leader
                    )));
                }
                edges.push(outgoing[0].clone());
            } else if leader == cfg.exit_label() {
                let exit = cfg.exit();
                vertices.insert(
                    leader,
                    match exit.instruction() {
                        Some(instruction) => {
                            Vertex::with_instruction(leader, VertexKind::Exit, instruction.clone())
                        }
                        None => Vertex::new(leader, VertexKind::Exit),
                    },
                );
            } else {
                self.package_run(cfg, &leaders, leader, &mut vertices, &mut edges)?;
            }
        }

        Ok(Rc::new(Cfg::new(
            cfg.kind(),
            cfg.name(),
            cfg.interface().clone(),
            callees,
            vertices,
            edges,
            cfg.entry_label(),
            cfg.exit_label(),
        )))
    }

    fn leaders(&self, cfg: &Cfg) -> Result<BTreeSet<Label>, IrError> {
        let mut leaders = BTreeSet::new();
        for vertex in cfg.vertices() {
            let label = vertex.label();
            if cfg.preceding_labels(label).len() > 1 {
                leaders.insert(label);
            }
            match vertex.kind() {
                VertexKind::Entry => {
                    leaders.insert(label);
                    leaders.insert(cfg.single_successor(label)?);
                }
                VertexKind::Exit => {
                    leaders.insert(label);
                }
                VertexKind::Regular => {
                    let instruction = vertex.instruction().ok_or_else(|| {
                        IrError::invalid(format!("regular vertex L{} holds no instruction", label))
                    })?;
                    match terminal_kind(instruction)? {
                        TerminalKind::StraightLine => {}
                        TerminalKind::Call => {
                            leaders.insert(cfg.call_to_return_edge(label)?.target());
                        }
                        TerminalKind::Branch => {
                            leaders.insert(cfg.true_edge(label)?.target());
                            leaders.insert(cfg.false_edge(label)?.target());
                        }
                        TerminalKind::WhileHeader => {
                            // The while header is always its own block.
                            leaders.insert(label);
                            leaders.insert(cfg.true_edge(label)?.target());
                            leaders.insert(cfg.false_edge(label)?.target());
                        }
                    }
                }
            }
        }
        Ok(leaders)
    }

    /// Packages the straight-line run starting at `leader`, absorbing a
    /// trailing `If` or `Call` into the block.
    fn package_run(
        &self,
        cfg: &Cfg,
        leaders: &BTreeSet<Label>,
        leader: Label,
        vertices: &mut BTreeMap<Label, Vertex>,
        edges: &mut Vec<Edge>,
    ) -> Result<(), IrError> {
        let leader_vertex = cfg.vertex(leader)?;
        let instruction = leader_vertex.instruction().ok_or_else(|| {
            IrError::invalid(format!("regular vertex L{} holds no instruction", leader))
        })?;

        // Branch headers, while headers, and standalone calls keep their
        // vertex and edges unchanged.
        match terminal_kind(instruction)? {
            TerminalKind::Branch | TerminalKind::WhileHeader => {
                vertices.insert(
                    leader,
                    Vertex::with_instruction(leader, VertexKind::Regular, instruction.clone()),
                );
                for edge in cfg.outgoing_edges(leader) {
                    edges.push(edge.clone());
                }
                return Ok(());
            }
            TerminalKind::Call => {
                vertices.insert(
                    leader,
                    Vertex::with_instruction(leader, VertexKind::Regular, instruction.clone()),
                );
                edges.push(cfg.interprocedural_call_edge(leader)?.clone());
                let call_to_return = cfg.call_to_return_edge(leader)?.clone();
                let return_site = call_to_return.target();
                edges.push(call_to_return);
                edges.push(cfg.interprocedural_return_edge(return_site)?.clone());
                return Ok(());
            }
            TerminalKind::StraightLine => {}
        }

        // Follow the chain of straight-line vertices until the next
        // leader; a trailing if or call joins the block.
        let mut labels = vec![leader];
        let mut label = leader;
        loop {
            let next = cfg.single_successor(label)?;
            if leaders.contains(&next) {
                break;
            }
            let next_vertex = cfg.vertex(next)?;
            let next_instruction = next_vertex.instruction().ok_or_else(|| {
                IrError::invalid(format!("regular vertex L{} holds no instruction", next))
            })?;
            match terminal_kind(next_instruction)? {
                TerminalKind::StraightLine => {
                    labels.push(next);
                    label = next;
                }
                TerminalKind::Call | TerminalKind::Branch => {
                    labels.push(next);
                    break;
                }
                TerminalKind::WhileHeader => {
                    // Unreachable: while headers are leaders.
                    return Err(IrError::invalid(format!(
                        "while header L{} was not classified as a leader",
                        next
                    )));
                }
            }
        }

        if labels.len() == 1 {
            vertices.insert(
                leader,
                Vertex::with_instruction(leader, VertexKind::Regular, instruction.clone()),
            );
            for edge in cfg.outgoing_edges(leader) {
                edges.push(edge.clone());
            }
            return Ok(());
        }

        let mut members = Vec::new();
        for &l in &labels {
            let vertex = cfg.vertex(l)?;
            let instruction = vertex.instruction().ok_or_else(|| {
                IrError::invalid(format!("regular vertex L{} holds no instruction", l))
            })?;
            members.extend(instruction.members().iter().cloned());
        }
        let last = *labels.last().expect("runs are non-empty");
        vertices.insert(
            leader,
            Vertex::with_instruction(leader, VertexKind::Regular, Instruction::Sequence(members)),
        );
        for edge in cfg.outgoing_edges(last) {
            edges.push(Edge::new(leader, edge.target(), edge.kind().clone()));
        }
        // A block ending in a call re-sources the return edge's call label
        // to the block leader.
        let last_instruction = cfg.vertex(last)?.instruction().ok_or_else(|| {
            IrError::invalid(format!("regular vertex L{} holds no instruction", last))
        })?;
        if matches!(terminal_kind(last_instruction)?, TerminalKind::Call) {
            let return_site = cfg.call_to_return_edge(last)?.target();
            let return_edge = cfg.interprocedural_return_edge(return_site)?;
            match return_edge.kind() {
                EdgeKind::InterproceduralReturn { caller, .. } => {
                    edges.push(Edge::new(
                        return_edge.source(),
                        return_edge.target(),
                        EdgeKind::InterproceduralReturn {
                            caller: caller.clone(),
                            call_label: leader,
                        },
                    ));
                }
                other => {
                    return Err(IrError::invalid(format!(
                        "expected an interprocedural return edge, found {:?}",
                        other
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for BasicBlockPass {
    fn default() -> Self {
        BasicBlockPass::new()
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

    // 0 ENTRY, 1 a := 1, 2 goto, 3 b := 2, 4 goto, 5 IF x, then 6 c := 3
    // (7 goto), else 8 c := 4 (9 goto), join at 10 EXIT.
    fn make_project() -> Project {
        let x = Variable::shared("x", DataType::BOOL, StorageType::Input);
        let a = Variable::shared("a", DataType::INT, StorageType::Local);
        let b = Variable::shared("b", DataType::INT, StorageType::Local);
        let c = Variable::shared("c", DataType::INT, StorageType::Local);
        let interface = Interface::new(vec![x.clone(), a.clone(), b.clone(), c.clone()]);
        let mut instructions = BTreeMap::new();
        instructions.insert(
            1,
            Instruction::assignment(VariableAccess::new(a), Expression::IntegerConstant(1)),
        );
        instructions.insert(2, Instruction::Goto { label: 3 });
        instructions.insert(
            3,
            Instruction::assignment(VariableAccess::new(b), Expression::IntegerConstant(2)),
        );
        instructions.insert(4, Instruction::Goto { label: 5 });
        instructions.insert(
            5,
            Instruction::If {
                condition: Expression::variable(x),
                then_label: 6,
                else_label: 8,
            },
        );
        instructions.insert(
            6,
            Instruction::assignment(VariableAccess::new(c.clone()), Expression::IntegerConstant(3)),
        );
        instructions.insert(7, Instruction::Goto { label: 10 });
        instructions.insert(
            8,
            Instruction::assignment(VariableAccess::new(c), Expression::IntegerConstant(4)),
        );
        instructions.insert(9, Instruction::Goto { label: 10 });
        let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 10);
        Project::new(vec![module], "P").unwrap()
    }

    #[test]
    fn test_straight_line_run_absorbs_trailing_if() {
        let project = make_project();
        let cfg = Builder::new(&project).build().unwrap();
        let blocks = BasicBlockPass::new().apply(&cfg).unwrap();
        // L1 absorbs a := 1, b := 2, and the branch itself.
        let block = blocks.vertex(1).unwrap().instruction().unwrap();
        let members = block.members();
        assert_eq!(members.len(), 3);
        assert!(matches!(members[2], Instruction::If { .. }));
        assert!(block.contains_if());
        // The branch edges leave the block leader.
        assert_eq!(blocks.true_edge(1).unwrap().target(), 6);
        assert_eq!(blocks.false_edge(1).unwrap().target(), 8);
        // Interior labels are gone.
        assert!(blocks.vertex(3).is_err());
        assert!(blocks.vertex(5).is_err());
        // Branch targets survive as single-instruction blocks.
        assert!(blocks.vertex(6).is_ok());
        assert!(blocks.vertex(8).is_ok());
        assert_eq!(blocks.single_successor(6).unwrap(), 10);
    }

    #[test]
    fn test_while_header_is_its_own_block() {
        // 0 ENTRY, 1 i := 0, 2 goto, 3 WHILE x body 4 exit 7, 4 i := i+1,
        // 5 goto 3 (back edge), 7 EXIT.
        let x = Variable::shared("x", DataType::BOOL, StorageType::Input);
        let i = Variable::shared("i", DataType::INT, StorageType::Local);
        let interface = Interface::new(vec![x.clone(), i.clone()]);
        let mut instructions = BTreeMap::new();
        instructions.insert(
            1,
            Instruction::assignment(VariableAccess::new(i.clone()), Expression::IntegerConstant(0)),
        );
        instructions.insert(2, Instruction::Goto { label: 3 });
        instructions.insert(
            3,
            Instruction::While {
                condition: Expression::variable(x),
                body_label: 4,
                exit_label: 7,
            },
        );
        instructions.insert(
            4,
            Instruction::assignment(
                VariableAccess::new(i.clone()),
                Expression::binary(
                    BinaryOperator::Add,
                    Expression::variable(i),
                    Expression::IntegerConstant(1),
                ),
            ),
        );
        instructions.insert(5, Instruction::Goto { label: 3 });
        let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 7);
        let project = Project::new(vec![module], "P").unwrap();
        let cfg = Builder::new(&project).build().unwrap();
        let blocks = BasicBlockPass::new().apply(&cfg).unwrap();
        // The header keeps its own vertex with both branch edges.
        assert!(matches!(
            blocks.vertex(3).unwrap().instruction().unwrap(),
            Instruction::While { .. }
        ));
        assert_eq!(blocks.true_edge(3).unwrap().target(), 4);
        assert_eq!(blocks.false_edge(3).unwrap().target(), 7);
        // The body loops back to the header.
        assert_eq!(blocks.single_successor(4).unwrap(), 3);
    }
}
