//! Execution contexts: one state plus a cycle counter and a call stack.

use crate::error::EngineError;
use crate::solver::Solver;
use crate::state::State;
use cyclist_ir::cfg::Cfg;
use cyclist_ir::error::IrError;
use cyclist_ir::expression::Label;
use std::fmt;
use std::rc::Rc;
use z3::ast::Bool;
use z3::Model;

/// One activation record: the executing CFG, the dotted scope of instance
/// names from the main program down, and the label to return to.
#[derive(Debug, Clone)]
pub struct Frame {
    cfg: Rc<Cfg>,
    scope: String,
    return_label: Label,
}

impl Frame {
    pub fn new(cfg: Rc<Cfg>, scope: impl Into<String>, return_label: Label) -> Self {
        Frame {
            cfg,
            scope: scope.into(),
            return_label,
        }
    }

    pub fn cfg(&self) -> &Rc<Cfg> {
        &self.cfg
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn return_label(&self) -> Label {
        self.return_label
    }
}

/// An execution context. Contexts are forked immutably: the fork clones
/// the complete state, and parent and child share nothing mutable.
#[derive(Debug, Clone)]
pub struct Context<'ctx> {
    cycle: u32,
    state: State<'ctx>,
    call_stack: Vec<Frame>,
}

impl<'ctx> Context<'ctx> {
    /// A root context at cycle 0 with the root frame on the stack; the
    /// root frame returns to the entry, closing the cyclic loop.
    pub fn new(cfg: Rc<Cfg>) -> Self {
        let entry = cfg.entry_label();
        let scope = cfg.name().to_string();
        Context {
            cycle: 0,
            state: State::new(entry),
            call_stack: vec![Frame::new(cfg, scope, entry)],
        }
    }

    /// Assembles a context from explicit parts, e.g. when the shadow
    /// engine seeds phase-2 exploration from a divergent context.
    pub(crate) fn from_parts(cycle: u32, state: State<'ctx>, call_stack: Vec<Frame>) -> Self {
        Context {
            cycle,
            state,
            call_stack,
        }
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub(crate) fn call_stack(&self) -> &[Frame] {
        &self.call_stack
    }

    pub fn set_cycle(&mut self, cycle: u32) {
        self.cycle = cycle;
    }

    pub fn state(&self) -> &State<'ctx> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State<'ctx> {
        &mut self.state
    }

    /// The active frame.
    pub fn frame(&self) -> &Frame {
        self.call_stack
            .last()
            .expect("the call stack always holds the root frame")
    }

    /// The root program's frame.
    pub fn main_frame(&self) -> &Frame {
        self.call_stack
            .first()
            .expect("the call stack always holds the root frame")
    }

    pub fn frame_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.call_stack.push(frame);
    }

    pub fn pop_frame(&mut self) -> Result<Frame, EngineError> {
        if self.call_stack.len() <= 1 {
            return Err(EngineError::Ir(IrError::invalid(
                "attempted to pop the root frame".to_string(),
            )));
        }
        Ok(self
            .call_stack
            .pop()
            .expect("length was checked above"))
    }

    /// Forks this context at a branch: the child continues at `label`
    /// with its concrete store updated from the model and the branch
    /// expression appended to its path constraint.
    pub fn fork(
        &self,
        solver: &'ctx Solver,
        label: Label,
        model: &Model<'ctx>,
        expression: &Bool<'ctx>,
    ) -> Result<Context<'ctx>, EngineError> {
        Ok(Context {
            cycle: self.cycle,
            state: self.state.fork(solver, label, model, expression)?,
            call_stack: self.call_stack.clone(),
        })
    }
}

impl fmt::Display for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(cycle: {}, depth: {}, scope: {}, state: {})",
            self.cycle,
            self.call_stack.len(),
            self.frame().scope(),
            self.state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyclist_ir::cfg::{CfgKind, Edge, EdgeKind, Vertex, VertexKind};
    use cyclist_ir::interface::Interface;
    use std::collections::BTreeMap;

    fn make_cfg() -> Rc<Cfg> {
        let mut vertices = BTreeMap::new();
        vertices.insert(0, Vertex::new(0, VertexKind::Entry));
        vertices.insert(1, Vertex::new(1, VertexKind::Exit));
        Rc::new(Cfg::new(
            CfgKind::Program,
            "P",
            Interface::default(),
            BTreeMap::new(),
            vertices,
            vec![Edge::new(0, 1, EdgeKind::Intraprocedural)],
            0,
            1,
        ))
    }

    #[test]
    fn test_root_context_shape() {
        let context = Context::new(make_cfg());
        assert_eq!(context.cycle(), 0);
        assert_eq!(context.frame_depth(), 1);
        assert_eq!(context.frame().scope(), "P");
        assert_eq!(context.frame().return_label(), 0);
        assert_eq!(context.state().label(), 0);
    }

    #[test]
    fn test_root_frame_cannot_be_popped() {
        let mut context = Context::new(make_cfg());
        assert!(context.pop_frame().is_err());
        context.push_frame(Frame::new(make_cfg(), "P.f", 1));
        assert_eq!(context.frame_depth(), 2);
        assert!(context.pop_frame().is_ok());
        assert_eq!(context.frame_depth(), 1);
    }
}
