//! The divergence executor.
//!
//! Drives a unified program in dual-valuation mode. Every guard that
//! transitively mentions a shadow expression is evaluated concretely
//! under both versions: a disagreement stops the context as divergent;
//! agreement attempts a divergent fork into each still-feasible diff path
//! and continues down the common branch under both per-version path
//! constraints.

use crate::context::Frame;
use crate::error::EngineError;
use crate::shadow::lowering;
use crate::shadow::state::DivergentContext;
use crate::shadow::ShadowProcessingMode;
use crate::solver::{as_bool_literal, as_value, constant_name, CheckResult, Solver, Term};
use crate::state::contextualized_name;
use crate::testsuite::TestCase;
use cyclist_ir::cfg::{CfgKind, VertexKind};
use cyclist_ir::error::IrError;
use cyclist_ir::expression::{Expression, VariableReference};
use cyclist_ir::instruction::{Assignment, Call, Instruction};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use z3::ast::{Ast, Bool};

/// What one step of shadow execution observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Both versions behave identically so far.
    ExpectedBehavior,
    /// Both versions agree concretely, but a diff path is feasible.
    PotentialDivergentBehavior,
    /// The versions concretely disagree at the current guard.
    DivergentBehavior,
}

/// The shadow divergence executor.
pub struct DivergenceExecutor<'ctx> {
    solver: &'ctx Solver,
    versions: BTreeMap<String, u32>,
    whole_program_inputs: BTreeSet<String>,
    /// Concrete inputs to replay per cycle; absent cycles fall back to
    /// random values.
    input_plan: Option<TestCase>,
}

impl<'ctx> DivergenceExecutor<'ctx> {
    pub fn new(solver: &'ctx Solver) -> Self {
        DivergenceExecutor {
            solver,
            versions: BTreeMap::new(),
            whole_program_inputs: BTreeSet::new(),
            input_plan: None,
        }
    }

    /// Replays the given test case's inputs instead of random values.
    pub fn with_input_plan(solver: &'ctx Solver, plan: TestCase) -> Self {
        DivergenceExecutor {
            solver,
            versions: BTreeMap::new(),
            whole_program_inputs: BTreeSet::new(),
            input_plan: Some(plan),
        }
    }

    pub fn initialize(&mut self, cfg: &cyclist_ir::cfg::Cfg) {
        for variable in cfg.flattened_interface() {
            let flattened = format!("{}.{}", cfg.name(), variable.name());
            self.versions.insert(flattened, 0);
        }
        for input in cfg.interface().input_variables() {
            if !input.data_type().is_derived() {
                self.whole_program_inputs
                    .insert(format!("{}.{}", cfg.name(), input.name()));
            }
        }
    }

    pub fn is_whole_program_input(&self, flattened_name: &str) -> bool {
        self.whole_program_inputs.contains(flattened_name)
    }

    fn planned_input(&self, flattened: &str, cycle: u32) -> Option<Term<'ctx>> {
        let plan = self.input_plan.as_ref()?;
        let value = plan.cycle_inputs().get(&cycle)?.get(flattened)?;
        Some(self.solver.make_literal(*value))
    }

    /// The root divergent context at cycle 0.
    pub fn initial_context(
        &mut self,
        cfg: &Rc<cyclist_ir::cfg::Cfg>,
    ) -> Result<DivergentContext<'ctx>, EngineError> {
        self.initialize(cfg);
        let mut context = DivergentContext::new(cfg.clone());
        for variable in cfg.flattened_interface() {
            let flattened = format!("{}.{}", cfg.name(), variable.name());
            let name = contextualized_name(&flattened, 0, 0);
            let (concrete, symbolic) = if self.is_whole_program_input(&flattened) {
                let symbolic = self.solver.make_constant(&name, variable.data_type())?;
                let concrete = match self.planned_input(&flattened, 0) {
                    Some(value) => value,
                    None => self.solver.make_random_value(variable.data_type())?,
                };
                (concrete, symbolic)
            } else {
                let plan_value = self
                    .input_plan
                    .as_ref()
                    .and_then(|plan| plan.initial_state().get(&flattened))
                    .map(|value| self.solver.make_literal(*value));
                let value = match plan_value {
                    Some(value) => value,
                    None => match variable.initialization() {
                        Some(initialization) => self.solver.make_value(initialization)?,
                        None => self.solver.make_default_value(variable.data_type())?,
                    },
                };
                (value.clone(), value)
            };
            let state = context.state_mut().base_mut();
            state.set_concrete_valuation(name.clone(), concrete);
            state.set_symbolic_valuation(name, symbolic);
            state.set_version(flattened, 0);
        }
        Ok(context)
    }

    /// Advances the context by one vertex; divergent forks, if any, are
    /// returned alongside.
    pub fn execute(
        &mut self,
        mut context: DivergentContext<'ctx>,
    ) -> Result<
        (
            ExecutionStatus,
            DivergentContext<'ctx>,
            Vec<DivergentContext<'ctx>>,
        ),
        EngineError,
    > {
        let cfg = context.frame().cfg().clone();
        let label = context.state().base().label();
        let vertex = cfg.vertex(label)?;

        match (vertex.kind(), cfg.kind()) {
            (VertexKind::Entry, CfgKind::Program) | (VertexKind::Entry, CfgKind::FunctionBlock) => {
                let instruction = vertex.instruction().cloned();
                if let Some(instruction) = instruction {
                    self.apply_effects(&mut context, instruction.members())?;
                }
                let next = cfg.single_successor(label)?;
                context.state_mut().base_mut().move_to(next);
                Ok((ExecutionStatus::ExpectedBehavior, context, Vec::new()))
            }
            (VertexKind::Regular, _) => self.handle_regular_vertex(context),
            (VertexKind::Exit, CfgKind::Program) => {
                let instruction = vertex.instruction().cloned();
                if let Some(instruction) = instruction {
                    self.apply_effects(&mut context, instruction.members())?;
                }
                self.handle_program_exit(&mut context)?;
                Ok((ExecutionStatus::ExpectedBehavior, context, Vec::new()))
            }
            (VertexKind::Exit, CfgKind::FunctionBlock) => {
                let instruction = vertex.instruction().cloned();
                if let Some(instruction) = instruction {
                    self.apply_effects(&mut context, instruction.members())?;
                }
                let return_label = context.frame().return_label();
                context.pop_frame()?;
                context.state_mut().base_mut().move_to(return_label);
                Ok((ExecutionStatus::ExpectedBehavior, context, Vec::new()))
            }
            (_, CfgKind::Function) => Err(EngineError::Ir(IrError::NotSupported(
                "function CFGs in the execution engine".to_string(),
            ))),
        }
    }

    fn handle_regular_vertex(
        &mut self,
        mut context: DivergentContext<'ctx>,
    ) -> Result<
        (
            ExecutionStatus,
            DivergentContext<'ctx>,
            Vec<DivergentContext<'ctx>>,
        ),
        EngineError,
    > {
        let cfg = context.frame().cfg().clone();
        let label = context.state().base().label();
        let instruction = cfg.vertex(label)?.instruction().cloned().ok_or_else(|| {
            IrError::invalid(format!("regular vertex L{} holds no instruction", label))
        })?;
        let members = instruction.members();
        let (terminal, effects) = members.split_last().ok_or_else(|| {
            IrError::invalid(format!("vertex L{} holds an empty sequence", label))
        })?;
        self.apply_effects(&mut context, effects)?;

        match terminal {
            Instruction::Assignment(assignment) => {
                self.apply_assignment(&mut context, assignment)?;
                let next = cfg.intraprocedural_edge(label)?.target();
                context.state_mut().base_mut().move_to(next);
                Ok((ExecutionStatus::ExpectedBehavior, context, Vec::new()))
            }
            Instruction::Havoc { target } => {
                self.apply_havoc(&mut context, target)?;
                let next = cfg.intraprocedural_edge(label)?.target();
                context.state_mut().base_mut().move_to(next);
                Ok((ExecutionStatus::ExpectedBehavior, context, Vec::new()))
            }
            Instruction::Call(call) => {
                self.handle_call(&mut context, call)?;
                Ok((ExecutionStatus::ExpectedBehavior, context, Vec::new()))
            }
            Instruction::If { condition, .. } => self.handle_if(context, condition),
            Instruction::While { .. } => Err(EngineError::Ir(IrError::NotSupported(
                "while loops in the shadow pipeline".to_string(),
            ))),
            Instruction::Sequence(_) => Err(EngineError::Ir(IrError::invalid(
                "nested instruction sequences".to_string(),
            ))),
            Instruction::Goto { .. } => Err(EngineError::Ir(IrError::NotImplemented(
                "goto instructions in compiled CFGs".to_string(),
            ))),
        }
    }

    fn apply_effects(
        &mut self,
        context: &mut DivergentContext<'ctx>,
        members: &[Instruction],
    ) -> Result<(), EngineError> {
        for member in members {
            match member {
                Instruction::Assignment(assignment) => {
                    self.apply_assignment(context, assignment)?;
                }
                Instruction::Havoc { target } => {
                    self.apply_havoc(context, target)?;
                }
                other => {
                    return Err(EngineError::Ir(IrError::invalid(format!(
                        "instruction {} may not precede the terminal of a sequence",
                        other
                    ))));
                }
            }
        }
        Ok(())
    }

    fn bump_version(
        &mut self,
        context: &mut DivergentContext<'ctx>,
        flattened: &str,
    ) -> Result<u32, EngineError> {
        let global = self.versions.get(flattened).copied().ok_or_else(|| {
            EngineError::Ir(IrError::invalid(format!(
                "assignment to unknown flattened name {}",
                flattened
            )))
        })?;
        let local = context.state().base().version(flattened).unwrap_or(0);
        let version = global.max(local) + 1;
        self.versions.insert(flattened.to_string(), version);
        context.state_mut().base_mut().set_version(flattened, version);
        Ok(version)
    }

    /// Assignments evaluate under both versions; a concrete disagreement
    /// is remembered as a shadow pair so later reads can resolve per
    /// version, while the plain cell carries the new version's value.
    fn apply_assignment(
        &mut self,
        context: &mut DivergentContext<'ctx>,
        assignment: &Assignment,
    ) -> Result<(), EngineError> {
        let scope = context.frame().scope().to_string();
        let cycle = context.cycle();
        let encoded = lowering::encode(
            self.solver,
            &assignment.rhs,
            &scope,
            cycle,
            context.state_mut(),
            ShadowProcessingMode::Both,
        )?;
        let old_value = lowering::evaluate(
            self.solver,
            &assignment.rhs,
            &scope,
            cycle,
            context.state(),
            ShadowProcessingMode::Old,
        )?;
        let new_value = lowering::evaluate(
            self.solver,
            &assignment.rhs,
            &scope,
            cycle,
            context.state(),
            ShadowProcessingMode::New,
        )?;

        let flattened = format!("{}.{}", scope, assignment.target.name());
        let version = self.bump_version(context, &flattened)?;
        let name = contextualized_name(&flattened, version, cycle);
        let diverged = as_value(&old_value) != as_value(&new_value);
        let state = context.state_mut();
        if diverged {
            state.set_concrete_shadow_valuation(name.clone(), old_value, new_value.clone());
        }
        state.base_mut().set_concrete_valuation(name.clone(), new_value);
        state.base_mut().set_symbolic_valuation(name, encoded);
        Ok(())
    }

    fn apply_havoc(
        &mut self,
        context: &mut DivergentContext<'ctx>,
        target: &VariableReference,
    ) -> Result<(), EngineError> {
        let flattened = format!("{}.{}", context.frame().scope(), target.name());
        let cycle = context.cycle();
        let version = self.bump_version(context, &flattened)?;
        let name = contextualized_name(&flattened, version, cycle);
        let data_type = target.variable().data_type().clone();
        let symbolic = self.solver.make_constant(&name, &data_type)?;
        let concrete = self.solver.make_random_value(&data_type)?;
        let state = context.state_mut().base_mut();
        state.set_concrete_valuation(name.clone(), concrete);
        state.set_symbolic_valuation(name, symbolic);
        Ok(())
    }

    fn handle_call(
        &mut self,
        context: &mut DivergentContext<'ctx>,
        call: &Call,
    ) -> Result<(), EngineError> {
        let caller = context.frame().cfg().clone();
        let label = context.state().base().label();
        let return_label = caller.call_to_return_edge(label)?.target();
        let entry_label = caller.interprocedural_call_edge(label)?.target();
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
            })?;
        let callee = caller.cfg(type_name)?.clone();
        let scope = format!("{}.{}", context.frame().scope(), call.callee.name());
        context.push_frame(Frame::new(callee, scope, return_label));
        context.state_mut().base_mut().move_to(entry_label);
        Ok(())
    }

    fn handle_if(
        &mut self,
        mut context: DivergentContext<'ctx>,
        condition: &Expression,
    ) -> Result<
        (
            ExecutionStatus,
            DivergentContext<'ctx>,
            Vec<DivergentContext<'ctx>>,
        ),
        EngineError,
    > {
        let scope = context.frame().scope().to_string();
        let cycle = context.cycle();
        let cfg = context.frame().cfg().clone();
        let label = context.state().base().label();
        let true_target = cfg.true_edge(label)?.target();
        let false_target = cfg.false_edge(label)?.target();

        let encoded = lowering::encode(
            self.solver,
            condition,
            &scope,
            cycle,
            context.state_mut(),
            ShadowProcessingMode::Both,
        )?;

        if self.contains_shadow_expression(&context, &encoded)? {
            let old_evaluated = lowering::evaluate(
                self.solver,
                condition,
                &scope,
                cycle,
                context.state(),
                ShadowProcessingMode::Old,
            )?;
            let new_evaluated = lowering::evaluate(
                self.solver,
                condition,
                &scope,
                cycle,
                context.state(),
                ShadowProcessingMode::New,
            )?;
            let old_value = as_bool_literal(&old_evaluated).ok_or_else(|| {
                EngineError::Ir(IrError::invalid(format!(
                    "guard {} did not evaluate to a boolean literal",
                    condition
                )))
            })?;
            let new_value = as_bool_literal(&new_evaluated).ok_or_else(|| {
                EngineError::Ir(IrError::invalid(format!(
                    "guard {} did not evaluate to a boolean literal",
                    condition
                )))
            })?;

            if old_value != new_value {
                // The concrete executions diverge here; the context stays
                // at this guard for phase-2 exploration.
                tracing::info!(
                    label,
                    cycle,
                    "divergent behavior: old {} vs new {}",
                    old_value,
                    new_value
                );
                return Ok((ExecutionStatus::DivergentBehavior, context, Vec::new()));
            }

            let old_encoded = lowering::encode(
                self.solver,
                condition,
                &scope,
                cycle,
                context.state_mut(),
                ShadowProcessingMode::Old,
            )?
            .as_bool()
            .ok_or_else(|| {
                EngineError::Ir(IrError::invalid(format!(
                    "guard {} does not encode to a boolean term",
                    condition
                )))
            })?;
            let new_encoded = lowering::encode(
                self.solver,
                condition,
                &scope,
                cycle,
                context.state_mut(),
                ShadowProcessingMode::New,
            )?
            .as_bool()
            .ok_or_else(|| {
                EngineError::Ir(IrError::invalid(format!(
                    "guard {} does not encode to a boolean term",
                    condition
                )))
            })?;

            // Each still-feasible diff conjunction yields a divergent
            // fork: (!old && new) drives into the true branch, (old &&
            // !new) into the false branch.
            let mut divergent_contexts = Vec::new();
            if let Some(forked) = self.try_divergent_fork(
                &context,
                &old_encoded.not(),
                &new_encoded,
                true_target,
            )? {
                divergent_contexts.push(forked);
            }
            if let Some(forked) = self.try_divergent_fork(
                &context,
                &old_encoded,
                &new_encoded.not(),
                false_target,
            )? {
                divergent_contexts.push(forked);
            }

            let status = if divergent_contexts.is_empty() {
                ExecutionStatus::ExpectedBehavior
            } else {
                ExecutionStatus::PotentialDivergentBehavior
            };
            let state = context.state_mut();
            if old_value {
                state.push_old_path_constraint(old_encoded);
                state.push_new_path_constraint(new_encoded);
                state.base_mut().move_to(true_target);
            } else {
                state.push_old_path_constraint(old_encoded.not());
                state.push_new_path_constraint(new_encoded.not());
                state.base_mut().move_to(false_target);
            }
            Ok((status, context, divergent_contexts))
        } else {
            // No shadow influence: resume plain concrete branching.
            let evaluated = lowering::evaluate(
                self.solver,
                condition,
                &scope,
                cycle,
                context.state(),
                ShadowProcessingMode::None,
            )?;
            let value = as_bool_literal(&evaluated).ok_or_else(|| {
                EngineError::Ir(IrError::invalid(format!(
                    "guard {} did not evaluate to a boolean literal",
                    condition
                )))
            })?;
            let encoded = encoded.as_bool().ok_or_else(|| {
                EngineError::Ir(IrError::invalid(format!(
                    "guard {} does not encode to a boolean term",
                    condition
                )))
            })?;
            let state = context.state_mut();
            if value {
                state.base_mut().push_path_constraint(encoded);
                state.base_mut().move_to(true_target);
            } else {
                state.base_mut().push_path_constraint(encoded.not());
                state.base_mut().move_to(false_target);
            }
            Ok((ExecutionStatus::ExpectedBehavior, context, Vec::new()))
        }
    }

    /// Structurally like `tryFork`, but asserts the combined plain, old,
    /// and new path constraints plus both per-version expressions, and
    /// excludes shadow-carrying symbolic valuations from the hard
    /// constraints: their renditions were already lowered per version.
    fn try_divergent_fork(
        &mut self,
        context: &DivergentContext<'ctx>,
        old_expression: &Bool<'ctx>,
        new_expression: &Bool<'ctx>,
        target: cyclist_ir::expression::Label,
    ) -> Result<Option<DivergentContext<'ctx>>, EngineError> {
        let state = context.state();
        let mut terms: Vec<Bool<'ctx>> = state.base().path_constraint().to_vec();
        terms.extend(state.old_path_constraint().iter().cloned());
        terms.extend(state.new_path_constraint().iter().cloned());
        terms.push(old_expression.clone());
        terms.push(new_expression.clone());
        for (name, valuation) in state.base().symbolic_valuations() {
            if self.contains_shadow_expression(context, valuation)? {
                continue;
            }
            if let Some(value) = valuation.as_bool() {
                terms.push(self.solver.make_boolean_constant(name)._eq(&value));
            } else if let Some(value) = valuation.as_int() {
                terms.push(self.solver.make_integer_constant(name)._eq(&value));
            } else {
                return Err(EngineError::Ir(IrError::invalid(format!(
                    "symbolic cell {} holds a term of unexpected sort",
                    name
                ))));
            }
        }
        match self.solver.check(&terms) {
            CheckResult::Sat(model) => {
                tracing::debug!(
                    "divergent fork to L{} on old {} / new {}",
                    target,
                    old_expression,
                    new_expression
                );
                Ok(Some(context.divergent_fork(
                    self.solver,
                    target,
                    &model,
                    old_expression,
                    new_expression,
                )?))
            }
            CheckResult::Unsat => Ok(None),
            CheckResult::Unknown => Err(EngineError::SolverUnknown),
        }
    }

    /// Whether a term transitively mentions a shadow constant, through
    /// the symbolic store.
    fn contains_shadow_expression(
        &self,
        context: &DivergentContext<'ctx>,
        term: &Term<'ctx>,
    ) -> Result<bool, EngineError> {
        let state = context.state();
        if let Some(name) = constant_name(term) {
            if state.symbolic_shadow_valuations().contains_key(&name) {
                return Ok(true);
            }
        }
        for constant in self.solver.uninterpreted_constants(term) {
            let name = constant_name(&constant).ok_or_else(|| {
                EngineError::Ir(IrError::invalid(
                    "uninterpreted constant without a name".to_string(),
                ))
            })?;
            if state.symbolic_shadow_valuations().contains_key(&name) {
                return Ok(true);
            }
            let nested = state.base().symbolic_valuation(&name)?.clone();
            // Self-references are truly symbolic cells; nothing nested.
            if constant_name(&nested).as_deref() == Some(name.as_str()) {
                continue;
            }
            if self.contains_shadow_expression(context, &nested)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Cycle closure, as in the plain executor; planned inputs replace
    /// random values where the input plan provides them. Path constraints
    /// (plain and per-version) are carried across the boundary: phase-2
    /// seeding needs the full divergence history.
    fn handle_program_exit(
        &mut self,
        context: &mut DivergentContext<'ctx>,
    ) -> Result<(), EngineError> {
        let cfg = context.main_frame().cfg().clone();
        let cycle = context.cycle();
        let next_cycle = cycle + 1;
        let flattened_interface = cfg.flattened_interface();
        for variable in &flattened_interface {
            let flattened = format!("{}.{}", cfg.name(), variable.name());
            self.versions.insert(flattened.clone(), 0);
            let next_name = contextualized_name(&flattened, 0, next_cycle);
            if self.is_whole_program_input(&flattened) {
                let symbolic = self.solver.make_constant(&next_name, variable.data_type())?;
                let concrete = match self.planned_input(&flattened, next_cycle) {
                    Some(value) => value,
                    None => self.solver.make_random_value(variable.data_type())?,
                };
                let state = context.state_mut().base_mut();
                state.set_concrete_valuation(next_name.clone(), concrete);
                state.set_symbolic_valuation(next_name, symbolic);
            } else {
                let highest = context.state().base().highest_version(&flattened, cycle)?;
                let prior_name = contextualized_name(&flattened, highest, cycle);
                let concrete = context
                    .state()
                    .base()
                    .concrete_valuation(&prior_name)?
                    .clone();
                let symbolic = context
                    .state()
                    .base()
                    .symbolic_valuation(&prior_name)?
                    .clone();
                // A shadow pair reaching the end of the cycle carries
                // over with the cell.
                let shadow_pair = context
                    .state()
                    .concrete_shadow_valuation(&prior_name)
                    .cloned();
                let state = context.state_mut();
                if let Some((old, new)) = shadow_pair {
                    state.set_concrete_shadow_valuation(next_name.clone(), old, new);
                }
                state
                    .base_mut()
                    .set_concrete_valuation(next_name.clone(), concrete);
                state.base_mut().set_symbolic_valuation(next_name, symbolic);
            }
        }
        for variable in &flattened_interface {
            let flattened = format!("{}.{}", cfg.name(), variable.name());
            context.state_mut().base_mut().set_version(flattened, 0);
        }
        let return_label = context.main_frame().return_label();
        context.state_mut().base_mut().move_to(return_label);
        context.set_cycle(next_cycle);
        Ok(())
    }
}
