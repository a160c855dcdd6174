//! Control-flow graphs over labelled vertices and typed edges.
//!
//! A CFG is built per module. Callee CFGs are shared (`Rc`) between every
//! caller referencing the same type-representative module; call graphs are
//! acyclic by front-end precondition, so sharing cannot form cycles.
//! Cyclic control flow *inside* a CFG (while loops, phi predecessors) is
//! fine: it lives entirely in label-indexed maps, never in pointer graphs.

use crate::error::IrError;
use crate::expression::Label;
use crate::instruction::Instruction;
use crate::interface::Interface;
use crate::variable::Variable;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Write as _;
use std::rc::Rc;

/// The role of a vertex within its CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexKind {
    Entry,
    Regular,
    Exit,
}

/// A labelled vertex, optionally holding an instruction. Entry and exit
/// vertices of program CFGs hold none; entry and exit vertices of callees
/// receive move sequences during the call transformation.
#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    label: Label,
    kind: VertexKind,
    instruction: Option<Instruction>,
}

impl Vertex {
    pub fn new(label: Label, kind: VertexKind) -> Self {
        Vertex {
            label,
            kind,
            instruction: None,
        }
    }

    pub fn with_instruction(label: Label, kind: VertexKind, instruction: Instruction) -> Self {
        Vertex {
            label,
            kind,
            instruction: Some(instruction),
        }
    }

    pub fn label(&self) -> Label {
        self.label
    }

    pub fn kind(&self) -> VertexKind {
        self.kind
    }

    pub fn instruction(&self) -> Option<&Instruction> {
        self.instruction.as_ref()
    }

    pub fn set_instruction(&mut self, instruction: Instruction) {
        self.instruction = Some(instruction);
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}:", self.label)?;
        match (&self.instruction, self.kind) {
            (Some(instruction), _) => write!(f, " {}", instruction),
            (None, VertexKind::Entry) => write!(f, " ENTRY"),
            (None, VertexKind::Exit) => write!(f, " EXIT"),
            (None, VertexKind::Regular) => Ok(()),
        }
    }
}

/// The kind of a directed edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeKind {
    Intraprocedural,
    /// From a call site to its return site within the caller.
    IntraproceduralCallToReturn,
    /// From a call site to the callee's entry.
    InterproceduralCall,
    /// From a callee's exit back to the caller's return site; carries the
    /// caller's name and the label of the originating call site.
    InterproceduralReturn { caller: String, call_label: Label },
    TrueBranch,
    FalseBranch,
}

/// A directed edge between labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    source: Label,
    target: Label,
    kind: EdgeKind,
}

impl Edge {
    pub fn new(source: Label, target: Label, kind: EdgeKind) -> Self {
        Edge {
            source,
            target,
            kind,
        }
    }

    pub fn source(&self) -> Label {
        self.source
    }

    pub fn target(&self) -> Label {
        self.target
    }

    pub fn kind(&self) -> &EdgeKind {
        &self.kind
    }
}

/// The kind of a CFG, mirroring the module kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgKind {
    Program,
    FunctionBlock,
    Function,
}

/// A control-flow graph for one module, with shared callee CFGs keyed by
/// type-representative name.
#[derive(Debug, Clone, PartialEq)]
pub struct Cfg {
    kind: CfgKind,
    name: String,
    interface: Interface,
    callees: BTreeMap<String, Rc<Cfg>>,
    vertices: BTreeMap<Label, Vertex>,
    edges: Vec<Edge>,
    entry_label: Label,
    exit_label: Label,
}

impl Cfg {
    pub fn new(
        kind: CfgKind,
        name: impl Into<String>,
        interface: Interface,
        callees: BTreeMap<String, Rc<Cfg>>,
        vertices: BTreeMap<Label, Vertex>,
        edges: Vec<Edge>,
        entry_label: Label,
        exit_label: Label,
    ) -> Self {
        Cfg {
            kind,
            name: name.into(),
            interface,
            callees,
            vertices,
            edges,
            entry_label,
            exit_label,
        }
    }

    pub fn kind(&self) -> CfgKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn entry_label(&self) -> Label {
        self.entry_label
    }

    pub fn exit_label(&self) -> Label {
        self.exit_label
    }

    pub fn entry(&self) -> &Vertex {
        &self.vertices[&self.entry_label]
    }

    pub fn exit(&self) -> &Vertex {
        &self.vertices[&self.exit_label]
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn vertex(&self, label: Label) -> Result<&Vertex, IrError> {
        self.vertices
            .get(&label)
            .ok_or_else(|| IrError::invalid(format!("no vertex with label {} exists", label)))
    }

    // ------------------------------------------------------------------
    // Edge queries
    // ------------------------------------------------------------------

    pub fn outgoing_edges(&self, label: Label) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == label).collect()
    }

    pub fn incoming_edges(&self, label: Label) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.target == label).collect()
    }

    pub fn preceding_labels(&self, label: Label) -> Vec<Label> {
        self.edges
            .iter()
            .filter(|e| e.target == label)
            .map(|e| e.source)
            .collect()
    }

    pub fn succeeding_labels(&self, label: Label) -> Vec<Label> {
        self.edges
            .iter()
            .filter(|e| e.source == label)
            .map(|e| e.target)
            .collect()
    }

    /// The unique successor of a straight-line vertex.
    pub fn single_successor(&self, label: Label) -> Result<Label, IrError> {
        let succeeding = self.succeeding_labels(label);
        match succeeding.as_slice() {
            [next] => Ok(*next),
            _ => Err(IrError::invalid(format!(
                "expected exactly one successor of L{}, found {}",
                label,
                succeeding.len()
            ))),
        }
    }

    pub fn true_edge(&self, label: Label) -> Result<&Edge, IrError> {
        self.outgoing_of_kind(label, &EdgeKind::TrueBranch)
            .ok_or_else(|| IrError::invalid(format!("no true edge leaves L{}", label)))
    }

    pub fn false_edge(&self, label: Label) -> Result<&Edge, IrError> {
        self.outgoing_of_kind(label, &EdgeKind::FalseBranch)
            .ok_or_else(|| IrError::invalid(format!("no false edge leaves L{}", label)))
    }

    pub fn intraprocedural_edge(&self, label: Label) -> Result<&Edge, IrError> {
        self.outgoing_of_kind(label, &EdgeKind::Intraprocedural)
            .ok_or_else(|| IrError::invalid(format!("no intraprocedural edge leaves L{}", label)))
    }

    pub fn call_to_return_edge(&self, label: Label) -> Result<&Edge, IrError> {
        self.outgoing_of_kind(label, &EdgeKind::IntraproceduralCallToReturn)
            .ok_or_else(|| {
                IrError::invalid(format!("no call-to-return edge leaves L{}", label))
            })
    }

    pub fn interprocedural_call_edge(&self, label: Label) -> Result<&Edge, IrError> {
        self.outgoing_of_kind(label, &EdgeKind::InterproceduralCall)
            .ok_or_else(|| {
                IrError::invalid(format!("no interprocedural call edge leaves L{}", label))
            })
    }

    /// The interprocedural return edge arriving at the given return site.
    pub fn interprocedural_return_edge(&self, label: Label) -> Result<&Edge, IrError> {
        self.edges
            .iter()
            .find(|e| {
                e.target == label && matches!(e.kind, EdgeKind::InterproceduralReturn { .. })
            })
            .ok_or_else(|| {
                IrError::invalid(format!("no interprocedural return edge arrives at L{}", label))
            })
    }

    fn outgoing_of_kind(&self, label: Label, kind: &EdgeKind) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|e| e.source == label && e.kind == *kind)
    }

    pub fn add_edge(&mut self, source: Label, target: Label, kind: EdgeKind) {
        self.edges.push(Edge::new(source, target, kind));
    }

    pub fn remove_incoming_edges(&mut self, label: Label) {
        self.edges.retain(|e| e.target != label);
    }

    pub fn remove_outgoing_edges(&mut self, label: Label) {
        self.edges.retain(|e| e.source != label);
    }

    // ------------------------------------------------------------------
    // Callees
    // ------------------------------------------------------------------

    pub fn callees(&self) -> impl Iterator<Item = (&String, &Rc<Cfg>)> {
        self.callees.iter()
    }

    /// The type-representative CFG for a derived type name.
    pub fn cfg(&self, name: &str) -> Result<&Rc<Cfg>, IrError> {
        self.callees.get(name).ok_or_else(|| {
            IrError::invalid(format!("no type representative cfg for {} exists", name))
        })
    }

    /// The callee reached by the interprocedural call edge of a call site.
    pub fn callee(&self, label: Label) -> Result<&Rc<Cfg>, IrError> {
        let entry = self.interprocedural_call_edge(label)?.target();
        self.callees
            .values()
            .find(|c| c.entry_label() == entry)
            .ok_or_else(|| IrError::invalid(format!("no callee for call site L{} exists", label)))
    }

    /// All call sites invoking the named type representative.
    pub fn call_labels(&self, name: &str) -> Result<Vec<Label>, IrError> {
        let callee = self.cfg(name)?;
        Ok(self
            .edges
            .iter()
            .filter(|e| {
                e.kind == EdgeKind::InterproceduralCall && e.target == callee.entry_label()
            })
            .map(|e| e.source)
            .collect())
    }

    /// Transitive callees, deduplicated by name.
    pub fn flattened_callees(&self) -> Vec<Rc<Cfg>> {
        let mut seen = BTreeSet::new();
        let mut flattened = Vec::new();
        self.collect_callees(&mut seen, &mut flattened);
        flattened
    }

    fn collect_callees(&self, seen: &mut BTreeSet<String>, out: &mut Vec<Rc<Cfg>>) {
        for (name, callee) in &self.callees {
            if seen.insert(name.clone()) {
                out.push(callee.clone());
                callee.collect_callees(seen, out);
            }
        }
    }

    // ------------------------------------------------------------------
    // Interface
    // ------------------------------------------------------------------

    /// The flattened interface: derived-typed variables expanded inline
    /// through the callee graph, with the type-representative prefix of
    /// each nested name replaced by the instance name (`Fb1.x` under
    /// `f : Fb1` contributes `f.x`).
    ///
    /// Computed on demand through the shared callee CFGs, so callers never
    /// observe a stale view after interface mutation.
    pub fn flattened_interface(&self) -> Vec<Rc<Variable>> {
        let mut flattened = Vec::new();
        for variable in self.interface.variables() {
            match variable.data_type().derived_name() {
                Some(type_name) => {
                    // A missing callee is tolerated here and caught by the
                    // CFG invariant check instead.
                    if let Some(callee) = self.callees.get(type_name) {
                        for nested in callee.flattened_interface() {
                            let name = format!("{}.{}", variable.name(), nested.name());
                            flattened.push(Rc::new(nested.renamed(name)));
                        }
                    }
                }
                None => flattened.push(variable.clone()),
            }
        }
        flattened
    }

    /// Adds a variable to the interface. Callers observe the change through
    /// their computed flattened interfaces without further bookkeeping.
    pub fn add_variable(&mut self, variable: Rc<Variable>) {
        self.interface.add_variable(variable);
    }

    pub fn remove_variable(&mut self, name: &str) {
        self.interface.remove_variable(name);
    }

    // ------------------------------------------------------------------
    // Vertices
    // ------------------------------------------------------------------

    /// Allocates a fresh vertex under the smallest label above every label
    /// of this CFG and its transitive callees. Front-end labels are
    /// disjoint across modules, so this cannot collide with callers either.
    pub fn add_vertex(&mut self) -> Label {
        let mut next_free = self
            .vertices
            .keys()
            .max()
            .map(|label| label + 1)
            .unwrap_or(0);
        for callee in self.flattened_callees() {
            if callee.exit_label() >= next_free {
                next_free = callee.exit_label() + 1;
            }
            if let Some(max) = callee.vertices.keys().max() {
                if *max >= next_free {
                    next_free = max + 1;
                }
            }
        }
        self.vertices
            .insert(next_free, Vertex::new(next_free, VertexKind::Regular));
        next_free
    }

    pub fn remove_vertex(&mut self, label: Label) -> Result<(), IrError> {
        self.vertices
            .remove(&label)
            .map(|_| ())
            .ok_or_else(|| IrError::invalid(format!("no vertex with label {} exists", label)))
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Checks the structural invariants: one entry, one exit, edge shape
    /// of call sites and branch vertices.
    pub fn check_invariants(&self) -> Result<(), IrError> {
        if self.vertex(self.entry_label)?.kind() != VertexKind::Entry {
            return Err(IrError::invalid(format!(
                "{}: entry label L{} does not name an entry vertex",
                self.name, self.entry_label
            )));
        }
        if self.vertex(self.exit_label)?.kind() != VertexKind::Exit {
            return Err(IrError::invalid(format!(
                "{}: exit label L{} does not name an exit vertex",
                self.name, self.exit_label
            )));
        }
        for vertex in self.vertices.values() {
            match vertex.kind() {
                VertexKind::Entry if vertex.label() != self.entry_label => {
                    return Err(IrError::invalid(format!(
                        "{}: more than one entry vertex",
                        self.name
                    )));
                }
                VertexKind::Exit if vertex.label() != self.exit_label => {
                    return Err(IrError::invalid(format!(
                        "{}: more than one exit vertex",
                        self.name
                    )));
                }
                _ => {}
            }
            match vertex.instruction() {
                Some(Instruction::Call(_)) => {
                    self.interprocedural_call_edge(vertex.label())?;
                    let return_site = self.call_to_return_edge(vertex.label())?.target();
                    self.interprocedural_return_edge(return_site)?;
                }
                Some(Instruction::If { .. }) | Some(Instruction::While { .. }) => {
                    self.true_edge(vertex.label())?;
                    self.false_edge(vertex.label())?;
                    if self.succeeding_labels(vertex.label()).len() != 2 {
                        return Err(IrError::invalid(format!(
                            "{}: branch vertex L{} does not have exactly two successors",
                            self.name,
                            vertex.label()
                        )));
                    }
                }
                _ => {}
            }
        }
        for callee in self.callees.values() {
            callee.check_invariants()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Visualization
    // ------------------------------------------------------------------

    /// Emits a GraphViz digraph with one subgraph cluster per CFG. Edge
    /// colors: intraprocedural black, call blue, return dashed blue (plus
    /// an orange dashed return-to-call annotation), call-to-return dashed
    /// grey, true green, false red.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let graph_name = self.name.replace('.', "_");
        let _ = writeln!(out, "digraph {} {{", graph_name);
        let mut visited = BTreeSet::new();
        self.dot_subgraph(&mut out, &mut visited);
        out.push('}');
        out
    }

    fn dot_subgraph(&self, out: &mut String, visited: &mut BTreeSet<String>) {
        if !visited.insert(self.name.clone()) {
            return;
        }
        for callee in self.callees.values() {
            callee.dot_subgraph(out, visited);
        }
        let _ = writeln!(out, "subgraph cluster_{} {{", self.name.replace('.', "_"));
        let _ = writeln!(out, "label=\"{}\";", self.name);
        for vertex in self.vertices.values() {
            let label = vertex.label();
            let ranked = label == self.entry_label || label == self.exit_label;
            if label == self.entry_label {
                out.push_str("{rank=source; ");
            } else if label == self.exit_label {
                out.push_str("{rank=sink; ");
            }
            let text = match vertex.instruction() {
                Some(instruction) => format!("{}", instruction),
                None if vertex.kind() == VertexKind::Entry => "ENTRY".to_string(),
                None if vertex.kind() == VertexKind::Exit => "EXIT".to_string(),
                None => String::new(),
            };
            let _ = write!(
                out,
                "{}[label=\"L{}:\\n{}\"",
                label,
                label,
                text.replace('"', "\\\"")
            );
            if ranked {
                out.push_str(",shape=doublecircle]}");
            } else {
                out.push(']');
            }
            out.push('\n');
        }
        for edge in &self.edges {
            match edge.kind() {
                EdgeKind::Intraprocedural => {
                    let _ = writeln!(out, "{} -> {}[];", edge.source(), edge.target());
                }
                EdgeKind::IntraproceduralCallToReturn => {
                    let _ = writeln!(
                        out,
                        "{} -> {}[color=grey,style=dashed];",
                        edge.source(),
                        edge.target()
                    );
                }
                EdgeKind::InterproceduralCall => {
                    let _ = writeln!(
                        out,
                        "{} -> {}[color=blue];",
                        edge.source(),
                        edge.target()
                    );
                }
                EdgeKind::InterproceduralReturn { caller, call_label } => {
                    let _ = writeln!(
                        out,
                        "{} -> {}[color=blue,style=dashed];",
                        edge.source(),
                        edge.target()
                    );
                    // Return-to-call annotation.
                    let _ = writeln!(
                        out,
                        "{} -> {}[color=orange,style=dashed,label=\"{}\"];",
                        edge.source(),
                        call_label,
                        caller
                    );
                }
                EdgeKind::TrueBranch => {
                    let _ = writeln!(
                        out,
                        "{} -> {}[color=green];",
                        edge.source(),
                        edge.target()
                    );
                }
                EdgeKind::FalseBranch => {
                    let _ = writeln!(out, "{} -> {}[color=red];", edge.source(), edge.target());
                }
            }
        }
        out.push_str("}\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Expression, VariableAccess};
    use crate::types::DataType;
    use crate::variable::StorageType;

    // A minimal straight-line program CFG: 0:ENTRY -> 1:[y := 1] -> 2:EXIT.
    fn make_straight_line() -> Cfg {
        let y = Variable::shared("y", DataType::INT, StorageType::Output);
        let interface = Interface::new(vec![y.clone()]);
        let mut vertices = BTreeMap::new();
        vertices.insert(0, Vertex::new(0, VertexKind::Entry));
        vertices.insert(
            1,
            Vertex::with_instruction(
                1,
                VertexKind::Regular,
                Instruction::assignment(VariableAccess::new(y), Expression::IntegerConstant(1)),
            ),
        );
        vertices.insert(2, Vertex::new(2, VertexKind::Exit));
        let edges = vec![
            Edge::new(0, 1, EdgeKind::Intraprocedural),
            Edge::new(1, 2, EdgeKind::Intraprocedural),
        ];
        Cfg::new(
            CfgKind::Program,
            "P",
            interface,
            BTreeMap::new(),
            vertices,
            edges,
            0,
            2,
        )
    }

    #[test]
    fn test_edge_queries() {
        let cfg = make_straight_line();
        assert_eq!(cfg.succeeding_labels(0), vec![1]);
        assert_eq!(cfg.preceding_labels(2), vec![1]);
        assert_eq!(cfg.single_successor(1).unwrap(), 2);
        assert_eq!(cfg.intraprocedural_edge(1).unwrap().target(), 2);
        assert!(cfg.true_edge(1).is_err());
    }

    #[test]
    fn test_invariants_hold() {
        let cfg = make_straight_line();
        cfg.check_invariants().unwrap();
    }

    #[test]
    fn test_add_vertex_allocates_smallest_unused() {
        let mut cfg = make_straight_line();
        let label = cfg.add_vertex();
        assert_eq!(label, 3);
        assert_eq!(cfg.vertex(3).unwrap().kind(), VertexKind::Regular);
        cfg.remove_vertex(3).unwrap();
        assert!(cfg.vertex(3).is_err());
    }

    #[test]
    fn test_flattened_interface_without_derived_is_identity() {
        let cfg = make_straight_line();
        let flattened = cfg.flattened_interface();
        assert_eq!(flattened.len(), 1);
        assert_eq!(flattened[0].name(), "y");
    }

    #[test]
    fn test_to_dot_mentions_vertices_and_colors() {
        let cfg = make_straight_line();
        let dot = cfg.to_dot();
        assert!(dot.starts_with("digraph P {"));
        assert!(dot.contains("subgraph cluster_P"));
        assert!(dot.contains("doublecircle"));
        assert!(dot.contains("0 -> 1[];"));
    }
}
