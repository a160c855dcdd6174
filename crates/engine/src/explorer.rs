//! Context scheduling and coverage tracking.
//!
//! The explorer keeps a priority queue of contexts ordered by a
//! breadth-first heuristic: lower cycles first, then shallower frames,
//! then lower labels, with stable FIFO tie-breaking. Coverage is a
//! monotone observable: statements flip to covered when their vertex is
//! left, branch slots when the corresponding successor is taken.

use crate::context::Context;
use crate::simulator::ExecutionHistory;
use cyclist_ir::cfg::{Cfg, EdgeKind, VertexKind};
use cyclist_ir::expression::Label;
use cyclist_ir::instruction::Instruction;
use std::collections::{BTreeMap, BinaryHeap};
use std::rc::Rc;

// ----------------------------------------------------------------------
// Coverage
// ----------------------------------------------------------------------

/// Statement and branch coverage over a CFG and its callees.
#[derive(Debug, Clone, Default)]
pub struct Coverage {
    covered_statements: BTreeMap<Label, bool>,
    covered_branches: BTreeMap<Label, (bool, bool)>,
    statement_coverage: f64,
    branch_coverage: f64,
}

impl Coverage {
    pub fn new() -> Self {
        Coverage::default()
    }

    /// Seeds the maps: every entry/regular/exit vertex contributes a
    /// statement; branch vertices (and sequences ending in a branch)
    /// contribute a true/false slot pair.
    pub fn initialize(&mut self, cfg: &Cfg) {
        self.seed(cfg);
        for callee in cfg.flattened_callees() {
            self.seed(&callee);
        }
        self.recompute();
    }

    fn seed(&mut self, cfg: &Cfg) {
        for vertex in cfg.vertices() {
            self.covered_statements.insert(vertex.label(), false);
            if vertex.kind() != VertexKind::Regular {
                continue;
            }
            match vertex.instruction() {
                Some(Instruction::If { .. }) | Some(Instruction::While { .. }) => {
                    self.covered_branches.insert(vertex.label(), (false, false));
                }
                Some(instruction @ Instruction::Sequence(_)) if instruction.contains_if() => {
                    self.covered_branches.insert(vertex.label(), (false, false));
                }
                _ => {}
            }
        }
    }

    /// Records that `label` was just left towards `successor` within
    /// `cfg`; returns whether statement and branch coverage increased.
    pub fn update(&mut self, cfg: &Cfg, label: Label, successor: Label) -> (bool, bool) {
        let statement_before = self.statement_coverage;
        let branch_before = self.branch_coverage;
        if let Some(covered) = self.covered_statements.get_mut(&label) {
            *covered = true;
        }
        if self.covered_branches.contains_key(&label) {
            for edge in cfg.outgoing_edges(label) {
                if edge.target() == successor {
                    match edge.kind() {
                        EdgeKind::TrueBranch => {
                            if let Some(slots) = self.covered_branches.get_mut(&label) {
                                slots.0 = true;
                            }
                        }
                        EdgeKind::FalseBranch => {
                            if let Some(slots) = self.covered_branches.get_mut(&label) {
                                slots.1 = true;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        self.recompute();
        (
            self.statement_coverage > statement_before,
            self.branch_coverage > branch_before,
        )
    }

    /// Seeds coverage from a replayed execution history, stopping at the
    /// label a divergent context was enqueued at: coverage beyond that
    /// point must still be earned by phase-2 exploration.
    pub fn seed_from_history(&mut self, root: &Rc<Cfg>, history: &ExecutionHistory, stop: Label) {
        let mut cfgs: BTreeMap<String, Rc<Cfg>> = BTreeMap::new();
        cfgs.insert(root.name().to_string(), root.clone());
        for callee in root.flattened_callees() {
            cfgs.insert(callee.name().to_string(), callee);
        }
        'seeding: for runs in history.values() {
            for segment in runs {
                let Some(cfg) = cfgs.get(&segment.cfg) else {
                    continue;
                };
                let labels = &segment.labels;
                for &label in labels {
                    if label == stop {
                        break 'seeding;
                    }
                    if let Some(covered) = self.covered_statements.get_mut(&label) {
                        *covered = true;
                    }
                    if self.covered_branches.contains_key(&label) {
                        for edge in cfg.outgoing_edges(label) {
                            if labels.contains(&edge.target()) {
                                match edge.kind() {
                                    EdgeKind::TrueBranch => {
                                        if let Some(slots) = self.covered_branches.get_mut(&label)
                                        {
                                            slots.0 = true;
                                        }
                                    }
                                    EdgeKind::FalseBranch => {
                                        if let Some(slots) = self.covered_branches.get_mut(&label)
                                        {
                                            slots.1 = true;
                                        }
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                }
            }
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        let covered = self.covered_statements.values().filter(|c| **c).count();
        self.statement_coverage = if self.covered_statements.is_empty() {
            0.0
        } else {
            covered as f64 / self.covered_statements.len() as f64
        };
        let covered_slots: usize = self
            .covered_branches
            .values()
            .map(|(t, f)| usize::from(*t) + usize::from(*f))
            .sum();
        self.branch_coverage = if self.covered_branches.is_empty() {
            0.0
        } else {
            covered_slots as f64 / (2 * self.covered_branches.len()) as f64
        };
    }

    pub fn statement_coverage(&self) -> f64 {
        self.statement_coverage
    }

    pub fn branch_coverage(&self) -> f64 {
        self.branch_coverage
    }

    /// Full branch coverage means exploration can stop early.
    pub fn is_complete(&self) -> bool {
        self.statement_coverage >= 1.0 && self.branch_coverage >= 1.0
    }
}

// ----------------------------------------------------------------------
// Explorer
// ----------------------------------------------------------------------

struct Prioritized<'ctx> {
    key: (u32, usize, Label, u64),
    context: Context<'ctx>,
}

impl PartialEq for Prioritized<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Prioritized<'_> {}

impl PartialOrd for Prioritized<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prioritized<'_> {
    // BinaryHeap pops the maximum; reversing the key comparison turns it
    // into a min-queue over (cycle, depth, label, sequence).
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.key.cmp(&self.key)
    }
}

/// The context queue ordered by the breadth-first heuristic.
pub struct Explorer<'ctx> {
    queue: BinaryHeap<Prioritized<'ctx>>,
    sequence: u64,
}

impl<'ctx> Explorer<'ctx> {
    pub fn new() -> Self {
        Explorer {
            queue: BinaryHeap::new(),
            sequence: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn push(&mut self, context: Context<'ctx>) {
        let key = (
            context.cycle(),
            context.frame_depth(),
            context.state().label(),
            self.sequence,
        );
        self.sequence += 1;
        self.queue.push(Prioritized { key, context });
    }

    pub fn pop(&mut self) -> Option<Context<'ctx>> {
        self.queue.pop().map(|p| p.context)
    }
}

impl Default for Explorer<'_> {
    fn default() -> Self {
        Explorer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyclist_ir::cfg::{CfgKind, Edge, Vertex};
    use cyclist_ir::interface::Interface;

    fn make_cfg_with_entry(entry: Label, exit: Label) -> Rc<Cfg> {
        let mut vertices = BTreeMap::new();
        vertices.insert(entry, Vertex::new(entry, VertexKind::Entry));
        vertices.insert(exit, Vertex::new(exit, VertexKind::Exit));
        Rc::new(Cfg::new(
            CfgKind::Program,
            "P",
            Interface::default(),
            BTreeMap::new(),
            vertices,
            vec![Edge::new(entry, exit, EdgeKind::Intraprocedural)],
            entry,
            exit,
        ))
    }

    #[test]
    fn test_queue_prefers_lower_cycles_then_lower_labels() {
        let mut explorer = Explorer::new();

        let mut late = Context::new(make_cfg_with_entry(0, 9));
        late.set_cycle(1);
        explorer.push(late);

        let early_high_label = Context::new(make_cfg_with_entry(5, 9));
        explorer.push(early_high_label);

        let early_low_label = Context::new(make_cfg_with_entry(2, 9));
        explorer.push(early_low_label);

        let first = explorer.pop().unwrap();
        assert_eq!((first.cycle(), first.state().label()), (0, 2));
        let second = explorer.pop().unwrap();
        assert_eq!((second.cycle(), second.state().label()), (0, 5));
        let third = explorer.pop().unwrap();
        assert_eq!(third.cycle(), 1);
        assert!(explorer.pop().is_none());
    }

    #[test]
    fn test_queue_ties_are_fifo() {
        let mut explorer = Explorer::new();
        let a = Context::new(make_cfg_with_entry(0, 9));
        let b = Context::new(make_cfg_with_entry(0, 9));
        explorer.push(a);
        explorer.push(b);
        // Both share (cycle, depth, label); the first push pops first.
        assert_eq!(explorer.len(), 2);
        let _ = explorer.pop().unwrap();
        let _ = explorer.pop().unwrap();
    }

    #[test]
    fn test_coverage_ratios() {
        let mut coverage = Coverage::new();
        let cfg = make_cfg_with_entry(0, 1);
        coverage.initialize(&cfg);
        assert_eq!(coverage.statement_coverage(), 0.0);
        let (stmt, branch) = coverage.update(&cfg, 0, 1);
        assert!(stmt);
        assert!(!branch);
        assert_eq!(coverage.statement_coverage(), 0.5);
        let (stmt, _) = coverage.update(&cfg, 0, 1);
        assert!(!stmt, "re-covering does not increase coverage");
    }
}
