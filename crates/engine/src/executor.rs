//! Instruction-driven transition of execution contexts.
//!
//! `execute` advances a context by one vertex and returns the primary
//! context plus, when a branch forks, the context for the alternative
//! outcome. The executor owns the global version counter and the set of
//! whole-program inputs; both are shared by every context it drives.

use crate::context::{Context, Frame};
use crate::encoder::Encoder;
use crate::error::EngineError;
use crate::evaluator::Evaluator;
use crate::solver::{as_bool_literal, constant_name, CheckResult, Solver, Term};
use crate::state::{contextualized_name, State};
use cyclist_ir::cfg::{CfgKind, VertexKind};
use cyclist_ir::error::IrError;
use cyclist_ir::expression::{Expression, Label};
use cyclist_ir::instruction::{Assignment, Call, Instruction};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use z3::ast::{Ast, Bool, Dynamic};

/// The concolic executor.
pub struct Executor<'ctx> {
    solver: &'ctx Solver,
    encoder: Encoder<'ctx>,
    evaluator: Evaluator<'ctx>,
    versions: BTreeMap<String, u32>,
    whole_program_inputs: BTreeSet<String>,
}

impl<'ctx> Executor<'ctx> {
    pub fn new(solver: &'ctx Solver) -> Self {
        Executor {
            solver,
            encoder: Encoder::new(solver),
            evaluator: Evaluator::new(solver),
            versions: BTreeMap::new(),
            whole_program_inputs: BTreeSet::new(),
        }
    }

    /// Registers the flattened interface of the root program: version 0
    /// for every flattened name, and the root's input variables as
    /// whole-program inputs.
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

    pub fn version(&self, flattened_name: &str) -> Option<u32> {
        self.versions.get(flattened_name).copied()
    }

    /// The root context at cycle 0: inputs bound to fresh symbolic
    /// constants and random concrete values, everything else to its
    /// initializer or the type default in both stores.
    pub fn initial_context(
        &mut self,
        cfg: &Rc<cyclist_ir::cfg::Cfg>,
    ) -> Result<Context<'ctx>, EngineError> {
        self.initialize(cfg);
        let mut context = Context::new(cfg.clone());
        for variable in cfg.flattened_interface() {
            let flattened = format!("{}.{}", cfg.name(), variable.name());
            let name = contextualized_name(&flattened, 0, 0);
            let (concrete, symbolic) = if self.is_whole_program_input(&flattened) {
                let symbolic = self.solver.make_constant(&name, variable.data_type())?;
                let concrete = self.solver.make_random_value(variable.data_type())?;
                (concrete, symbolic)
            } else {
                let value = match variable.initialization() {
                    Some(initialization) => self.solver.make_value(initialization)?,
                    None => self.solver.make_default_value(variable.data_type())?,
                };
                (value.clone(), value)
            };
            let state = context.state_mut();
            state.set_concrete_valuation(name.clone(), concrete);
            state.set_symbolic_valuation(name, symbolic);
            state.set_version(flattened, 0);
        }
        Ok(context)
    }

    /// Advances the context by one vertex.
    pub fn execute(
        &mut self,
        mut context: Context<'ctx>,
    ) -> Result<(Context<'ctx>, Option<Context<'ctx>>), EngineError> {
        let cfg = context.frame().cfg().clone();
        let label = context.state().label();
        let vertex = cfg.vertex(label)?;
        tracing::trace!(cfg = cfg.name(), label, cycle = context.cycle(), "executing {}", vertex);

        match (vertex.kind(), cfg.kind()) {
            (VertexKind::Entry, CfgKind::Program) | (VertexKind::Entry, CfgKind::FunctionBlock) => {
                let instruction = vertex.instruction().cloned();
                if let Some(instruction) = instruction {
                    self.apply_effects(&mut context, instruction.members())?;
                }
                let next = cfg.single_successor(label)?;
                context.state_mut().move_to(next);
                Ok((context, None))
            }
            (VertexKind::Regular, _) => self.handle_regular_vertex(context),
            (VertexKind::Exit, CfgKind::Program) => {
                let instruction = vertex.instruction().cloned();
                if let Some(instruction) = instruction {
                    self.apply_effects(&mut context, instruction.members())?;
                }
                self.handle_program_exit(&mut context)?;
                Ok((context, None))
            }
            (VertexKind::Exit, CfgKind::FunctionBlock) => {
                let instruction = vertex.instruction().cloned();
                if let Some(instruction) = instruction {
                    self.apply_effects(&mut context, instruction.members())?;
                }
                let return_label = context.frame().return_label();
                context.pop_frame()?;
                context.state_mut().move_to(return_label);
                Ok((context, None))
            }
            (_, CfgKind::Function) => Err(EngineError::Ir(IrError::NotSupported(
                "function CFGs in the execution engine".to_string(),
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Regular vertices
    // ------------------------------------------------------------------

    fn handle_regular_vertex(
        &mut self,
        mut context: Context<'ctx>,
    ) -> Result<(Context<'ctx>, Option<Context<'ctx>>), EngineError> {
        let cfg = context.frame().cfg().clone();
        let label = context.state().label();
        let instruction = cfg
            .vertex(label)?
            .instruction()
            .cloned()
            .ok_or_else(|| {
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
                context.state_mut().move_to(next);
                Ok((context, None))
            }
            Instruction::Havoc { target } => {
                self.apply_havoc(&mut context, target)?;
                let next = cfg.intraprocedural_edge(label)?.target();
                context.state_mut().move_to(next);
                Ok((context, None))
            }
            Instruction::Call(call) => {
                self.handle_call(&mut context, call)?;
                Ok((context, None))
            }
            Instruction::If { condition, .. } => self.handle_if(context, condition),
            Instruction::While { .. } => Err(EngineError::Ir(IrError::NotSupported(
                "while loops in the execution engine".to_string(),
            ))),
            Instruction::Sequence(_) => Err(EngineError::Ir(IrError::invalid(
                "nested instruction sequences".to_string(),
            ))),
            Instruction::Goto { .. } => Err(EngineError::Ir(IrError::NotImplemented(
                "goto instructions in compiled CFGs".to_string(),
            ))),
        }
    }

    /// Applies the store effects of non-terminal sequence members; only
    /// assignments and havocs may occur there.
    fn apply_effects(
        &mut self,
        context: &mut Context<'ctx>,
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

    /// Bumps the version of a flattened name for a write. The fresh
    /// version exceeds both the global counter and the context's local
    /// one: cycle closure resets the global counter while sibling
    /// contexts may still be mid-cycle, and a bump below their local
    /// version would rebind an existing store cell.
    fn bump_version(
        &mut self,
        context: &mut Context<'ctx>,
        flattened: &str,
    ) -> Result<u32, EngineError> {
        let global = self.versions.get(flattened).copied().ok_or_else(|| {
            EngineError::Ir(IrError::invalid(format!(
                "assignment to unknown flattened name {}",
                flattened
            )))
        })?;
        let local = context.state().version(flattened).unwrap_or(0);
        let version = global.max(local) + 1;
        self.versions.insert(flattened.to_string(), version);
        context.state_mut().set_version(flattened, version);
        Ok(version)
    }

    fn apply_assignment(
        &mut self,
        context: &mut Context<'ctx>,
        assignment: &Assignment,
    ) -> Result<(), EngineError> {
        let encoded = self.encoder.encode(&assignment.rhs, context)?;
        let evaluated = self.evaluator.evaluate(&assignment.rhs, context)?;

        let flattened = format!("{}.{}", context.frame().scope(), assignment.target.name());
        let cycle = context.cycle();
        let version = self.bump_version(context, &flattened)?;
        let name = contextualized_name(&flattened, version, cycle);
        let state = context.state_mut();
        state.set_concrete_valuation(name.clone(), evaluated);
        state.set_symbolic_valuation(name, encoded);
        Ok(())
    }

    fn apply_havoc(
        &mut self,
        context: &mut Context<'ctx>,
        target: &cyclist_ir::expression::VariableReference,
    ) -> Result<(), EngineError> {
        let flattened = format!("{}.{}", context.frame().scope(), target.name());
        let cycle = context.cycle();
        let version = self.bump_version(context, &flattened)?;
        let name = contextualized_name(&flattened, version, cycle);
        let data_type = target.variable().data_type().clone();
        // A fresh unconstrained constant in the symbolic store, a random
        // literal in the concrete store.
        let symbolic = self.solver.make_constant(&name, &data_type)?;
        let concrete = self.solver.make_random_value(&data_type)?;
        let state = context.state_mut();
        state.set_concrete_valuation(name.clone(), concrete);
        state.set_symbolic_valuation(name, symbolic);
        Ok(())
    }

    fn handle_call(&mut self, context: &mut Context<'ctx>, call: &Call) -> Result<(), EngineError> {
        let caller = context.frame().cfg().clone();
        let label = context.state().label();
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
        context.state_mut().move_to(entry_label);
        Ok(())
    }

    fn handle_if(
        &mut self,
        mut context: Context<'ctx>,
        condition: &Expression,
    ) -> Result<(Context<'ctx>, Option<Context<'ctx>>), EngineError> {
        let evaluated = self.evaluator.evaluate(condition, &context)?;
        let value = as_bool_literal(&evaluated).ok_or_else(|| {
            EngineError::Ir(IrError::invalid(format!(
                "guard {} did not evaluate to a boolean literal",
                condition
            )))
        })?;
        let encoded = self
            .encoder
            .encode(condition, &context)?
            .as_bool()
            .ok_or_else(|| {
                EngineError::Ir(IrError::invalid(format!(
                    "guard {} does not encode to a boolean term",
                    condition
                )))
            })?;

        let cfg = context.frame().cfg().clone();
        let label = context.state().label();
        let true_target = cfg.true_edge(label)?.target();
        let false_target = cfg.false_edge(label)?.target();

        let (taken, untaken, constraint, fork_expression) = if value {
            (true_target, false_target, encoded.clone(), encoded.not())
        } else {
            (false_target, true_target, encoded.not(), encoded)
        };
        let forked = self.try_fork(&context, &fork_expression, untaken)?;
        let state = context.state_mut();
        state.push_path_constraint(constraint);
        state.move_to(taken);
        Ok((context, forked))
    }

    // ------------------------------------------------------------------
    // Forking
    // ------------------------------------------------------------------

    /// Attempts to fork on the untaken branch outcome.
    ///
    /// Forks require the branch expression to contain an *unconstrained*
    /// uninterpreted constant: one whose symbolic valuation is itself,
    /// i.e. a whole-program input or a havoc'd cell. The query conjoins
    /// the path constraint, the branch expression, and hard constraints
    /// binding every store constant to its symbolic term.
    fn try_fork(
        &mut self,
        context: &Context<'ctx>,
        expression: &Bool<'ctx>,
        target: Label,
    ) -> Result<Option<Context<'ctx>>, EngineError> {
        let state = context.state();
        let dynamic = Dynamic::from_ast(expression);
        if !self.contains_unconstrained_constant(state, &dynamic)? {
            tracing::trace!(
                "no unconstrained constant in {}, not forking",
                expression
            );
            return Ok(None);
        }
        let mut terms: Vec<Bool<'ctx>> = state.path_constraint().to_vec();
        terms.push(expression.clone());
        self.push_hard_constraints(state, &mut terms)?;
        match self.solver.check(&terms) {
            CheckResult::Sat(model) => {
                tracing::debug!("forking to L{} on {}", target, expression);
                Ok(Some(context.fork(self.solver, target, &model, expression)?))
            }
            CheckResult::Unsat => Ok(None),
            CheckResult::Unknown => Err(EngineError::SolverUnknown),
        }
    }

    /// Hard constraints: every symbolic store cell equals its term. The
    /// narrowed extraction of only-necessary constraints is deliberately
    /// not implemented; the full store is asserted.
    fn push_hard_constraints(
        &self,
        state: &State<'ctx>,
        terms: &mut Vec<Bool<'ctx>>,
    ) -> Result<(), EngineError> {
        for (name, valuation) in state.symbolic_valuations() {
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
        Ok(())
    }

    /// Whether the expression transitively mentions an uninterpreted
    /// constant that is a fixed point of the symbolic store.
    pub(crate) fn contains_unconstrained_constant(
        &self,
        state: &State<'ctx>,
        expression: &Term<'ctx>,
    ) -> Result<bool, EngineError> {
        let simplified = expression.simplify();
        let constants = self.solver.uninterpreted_constants(&simplified);
        match constants.as_slice() {
            [] => Ok(false),
            [constant] => {
                let name = constant_name(constant).ok_or_else(|| {
                    EngineError::Ir(IrError::invalid(
                        "uninterpreted constant without a name".to_string(),
                    ))
                })?;
                let nested = state.symbolic_valuation(&name)?.clone();
                let nested_constants = self.solver.uninterpreted_constants(&nested);
                match nested_constants.as_slice() {
                    [] => Ok(false),
                    [nested_constant] => {
                        let nested_name = constant_name(nested_constant).ok_or_else(|| {
                            EngineError::Ir(IrError::invalid(
                                "uninterpreted constant without a name".to_string(),
                            ))
                        })?;
                        // A self-reference marks a truly symbolic cell: a
                        // whole-program input or a havoc'd variable.
                        if name == nested_name {
                            Ok(true)
                        } else {
                            self.contains_unconstrained_constant(state, &nested)
                        }
                    }
                    _ => self.contains_unconstrained_constant(state, &nested),
                }
            }
            _ => {
                for constant in &constants {
                    if self.contains_unconstrained_constant(state, constant)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------
    // Cycle closure
    // ------------------------------------------------------------------

    /// On reaching the program exit of cycle k: reset every version to 0;
    /// bind `v_0__{k+1}` for every flattened variable, inputs to fresh
    /// symbolic constants and random concrete values, everything else to
    /// its cycle-k terminal valuation; clear the path constraint; and
    /// re-enter at the root frame's return label.
    fn handle_program_exit(&mut self, context: &mut Context<'ctx>) -> Result<(), EngineError> {
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
                let concrete = self.solver.make_random_value(variable.data_type())?;
                let state = context.state_mut();
                state.set_concrete_valuation(next_name.clone(), concrete);
                state.set_symbolic_valuation(next_name, symbolic);
            } else {
                let highest = context.state().highest_version(&flattened, cycle)?;
                let prior_name = contextualized_name(&flattened, highest, cycle);
                let concrete = context.state().concrete_valuation(&prior_name)?.clone();
                let symbolic = context.state().symbolic_valuation(&prior_name)?.clone();
                let state = context.state_mut();
                state.set_concrete_valuation(next_name.clone(), concrete);
                state.set_symbolic_valuation(next_name, symbolic);
            }
        }
        // Local versions reset only after the carry, otherwise the
        // terminal valuations of cycle k are unreachable above.
        for variable in &flattened_interface {
            let flattened = format!("{}.{}", cfg.name(), variable.name());
            context.state_mut().set_version(flattened, 0);
        }
        context.state_mut().clear_path_constraint();

        let return_label = context.main_frame().return_label();
        context.state_mut().move_to(return_label);
        context.set_cycle(next_cycle);
        tracing::debug!(cycle = next_cycle, "cycle closed");
        Ok(())
    }
}
