//! Divergent state: the concolic state extended with shadow valuations.

use crate::context::Frame;
use crate::error::EngineError;
use crate::solver::{Solver, Term};
use crate::state::State;
use cyclist_ir::cfg::Cfg;
use cyclist_ir::error::IrError;
use cyclist_ir::expression::Label;
use std::collections::BTreeMap;
use std::rc::Rc;
use z3::ast::Bool;
use z3::Model;

/// A state carrying, in addition to the plain stores, paired old/new
/// valuations keyed by shadow-constant or contextualized name, and the
/// per-version path constraints.
#[derive(Debug, Clone)]
pub struct DivergentState<'ctx> {
    base: State<'ctx>,
    concrete_shadow_valuations: BTreeMap<String, (Term<'ctx>, Term<'ctx>)>,
    symbolic_shadow_valuations: BTreeMap<String, (Term<'ctx>, Term<'ctx>)>,
    old_path_constraint: Vec<Bool<'ctx>>,
    new_path_constraint: Vec<Bool<'ctx>>,
    shadow_counter: u32,
}

impl<'ctx> DivergentState<'ctx> {
    pub fn new(label: Label) -> Self {
        DivergentState {
            base: State::new(label),
            concrete_shadow_valuations: BTreeMap::new(),
            symbolic_shadow_valuations: BTreeMap::new(),
            old_path_constraint: Vec::new(),
            new_path_constraint: Vec::new(),
            shadow_counter: 0,
        }
    }

    pub fn base(&self) -> &State<'ctx> {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut State<'ctx> {
        &mut self.base
    }

    /// A fresh shadow constant name; the counter travels with the state
    /// so forked contexts keep allocating unique names.
    pub fn fresh_shadow_name(&mut self) -> String {
        let name = format!("shadow_{}", self.shadow_counter);
        self.shadow_counter += 1;
        name
    }

    pub fn concrete_shadow_valuations(&self) -> &BTreeMap<String, (Term<'ctx>, Term<'ctx>)> {
        &self.concrete_shadow_valuations
    }

    pub fn concrete_shadow_valuation(&self, name: &str) -> Option<&(Term<'ctx>, Term<'ctx>)> {
        self.concrete_shadow_valuations.get(name)
    }

    pub fn set_concrete_shadow_valuation(
        &mut self,
        name: impl Into<String>,
        old: Term<'ctx>,
        new: Term<'ctx>,
    ) {
        self.concrete_shadow_valuations.insert(name.into(), (old, new));
    }

    pub fn symbolic_shadow_valuations(&self) -> &BTreeMap<String, (Term<'ctx>, Term<'ctx>)> {
        &self.symbolic_shadow_valuations
    }

    pub fn set_symbolic_shadow_valuation(
        &mut self,
        name: impl Into<String>,
        old: Term<'ctx>,
        new: Term<'ctx>,
    ) {
        self.symbolic_shadow_valuations.insert(name.into(), (old, new));
    }

    pub fn old_path_constraint(&self) -> &[Bool<'ctx>] {
        &self.old_path_constraint
    }

    pub fn push_old_path_constraint(&mut self, expression: Bool<'ctx>) {
        self.old_path_constraint.push(expression);
    }

    pub fn new_path_constraint(&self) -> &[Bool<'ctx>] {
        &self.new_path_constraint
    }

    pub fn push_new_path_constraint(&mut self, expression: Bool<'ctx>) {
        self.new_path_constraint.push(expression);
    }

    /// A fresh divergent state for a diff path: located at `label`, the
    /// concrete store updated from the model, the per-version constraints
    /// extended with their encoded guards.
    pub fn divergent_fork(
        &self,
        solver: &'ctx Solver,
        label: Label,
        model: &Model<'ctx>,
        old_expression: &Bool<'ctx>,
        new_expression: &Bool<'ctx>,
    ) -> Result<DivergentState<'ctx>, EngineError> {
        // The plain path constraint is unchanged; the diff conjunction
        // lives in the per-version constraints.
        let mut forked = DivergentState {
            base: self.base.forked_at(solver, label, model)?,
            concrete_shadow_valuations: self.concrete_shadow_valuations.clone(),
            symbolic_shadow_valuations: self.symbolic_shadow_valuations.clone(),
            old_path_constraint: self.old_path_constraint.clone(),
            new_path_constraint: self.new_path_constraint.clone(),
            shadow_counter: self.shadow_counter,
        };
        forked.old_path_constraint.push(old_expression.clone());
        forked.new_path_constraint.push(new_expression.clone());
        Ok(forked)
    }
}

/// A context over a divergent state.
#[derive(Debug, Clone)]
pub struct DivergentContext<'ctx> {
    cycle: u32,
    state: DivergentState<'ctx>,
    call_stack: Vec<Frame>,
}

impl<'ctx> DivergentContext<'ctx> {
    pub fn new(cfg: Rc<Cfg>) -> Self {
        let entry = cfg.entry_label();
        let scope = cfg.name().to_string();
        DivergentContext {
            cycle: 0,
            state: DivergentState::new(entry),
            call_stack: vec![Frame::new(cfg, scope, entry)],
        }
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn set_cycle(&mut self, cycle: u32) {
        self.cycle = cycle;
    }

    pub fn state(&self) -> &DivergentState<'ctx> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut DivergentState<'ctx> {
        &mut self.state
    }

    pub fn frame(&self) -> &Frame {
        self.call_stack
            .last()
            .expect("the call stack always holds the root frame")
    }

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
        Ok(self.call_stack.pop().expect("length was checked above"))
    }

    pub fn call_stack(&self) -> &[Frame] {
        &self.call_stack
    }

    pub fn divergent_fork(
        &self,
        solver: &'ctx Solver,
        label: Label,
        model: &Model<'ctx>,
        old_expression: &Bool<'ctx>,
        new_expression: &Bool<'ctx>,
    ) -> Result<DivergentContext<'ctx>, EngineError> {
        Ok(DivergentContext {
            cycle: self.cycle,
            state: self
                .state
                .divergent_fork(solver, label, model, old_expression, new_expression)?,
            call_stack: self.call_stack.clone(),
        })
    }
}
