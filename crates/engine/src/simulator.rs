//! Concrete replay of test cases.
//!
//! The simulator drives the executor's transition rules in purely
//! concrete mode: no forks, no symbolic store, store cells keyed by the
//! version-less `<flattened>__<cycle>`. It reconstructs the execution
//! history (which labels ran, per scope and cycle) and the terminal
//! valuations of every cycle; the shadow engine's second phase seeds its
//! coverage from that history.

use crate::context::Frame;
use crate::error::EngineError;
use crate::ops;
use crate::shadow::ShadowProcessingMode;
use crate::solver::{as_bool_literal, as_value, Solver, Term};
use crate::testsuite::TestCase;
use crate::value::Value;
use cyclist_ir::cfg::{Cfg, CfgKind, VertexKind};
use cyclist_ir::error::IrError;
use cyclist_ir::expression::{Expression, Label};
use cyclist_ir::instruction::{Assignment, Call, Instruction};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// One run of labels visited within a single scope; a new segment starts
/// whenever control crosses a call or return.
#[derive(Debug, Clone)]
pub struct HistorySegment {
    pub scope: String,
    pub cfg: String,
    pub labels: Vec<Label>,
}

/// The visited label runs of a replay, per cycle.
pub type ExecutionHistory = BTreeMap<u32, Vec<HistorySegment>>;

/// What a replay produced.
#[derive(Debug)]
pub struct SimulationOutcome {
    pub execution_history: ExecutionHistory,
    /// Terminal non-input valuations per executed cycle.
    pub terminal_valuations: BTreeMap<u32, BTreeMap<String, Value>>,
}

struct Replay<'ctx> {
    cycle: u32,
    label: Label,
    entered_from: Option<Label>,
    valuations: BTreeMap<String, Term<'ctx>>,
    call_stack: Vec<Frame>,
}

impl Replay<'_> {
    fn frame(&self) -> &Frame {
        self.call_stack
            .last()
            .expect("the call stack always holds the root frame")
    }

    fn move_to(&mut self, label: Label) {
        self.entered_from = Some(self.label);
        self.label = label;
    }
}

fn cell_name(flattened: &str, cycle: u32) -> String {
    format!("{}__{}", flattened, cycle)
}

/// The test-case replay simulator.
pub struct Simulator<'ctx> {
    solver: &'ctx Solver,
    mode: ShadowProcessingMode,
    whole_program_inputs: BTreeSet<String>,
}

impl<'ctx> Simulator<'ctx> {
    pub fn new(solver: &'ctx Solver, mode: ShadowProcessingMode) -> Self {
        Simulator {
            solver,
            mode,
            whole_program_inputs: BTreeSet::new(),
        }
    }

    /// Replays one test case against the program.
    pub fn run(
        &mut self,
        cfg: &Rc<Cfg>,
        test_case: &TestCase,
    ) -> Result<SimulationOutcome, EngineError> {
        self.whole_program_inputs.clear();
        for input in cfg.interface().input_variables() {
            if !input.data_type().is_derived() {
                self.whole_program_inputs
                    .insert(format!("{}.{}", cfg.name(), input.name()));
            }
        }

        let mut replay = Replay {
            cycle: 0,
            label: cfg.entry_label(),
            entered_from: None,
            valuations: BTreeMap::new(),
            call_stack: vec![Frame::new(cfg.clone(), cfg.name(), cfg.entry_label())],
        };
        for variable in cfg.flattened_interface() {
            let flattened = format!("{}.{}", cfg.name(), variable.name());
            let term = if self.whole_program_inputs.contains(&flattened) {
                // Inputs are overwritten by the test case per cycle.
                self.solver.make_default_value(variable.data_type())?
            } else {
                match test_case.initial_state().get(&flattened) {
                    Some(value) => self.solver.make_literal(*value),
                    None => match variable.initialization() {
                        Some(initialization) => self.solver.make_value(initialization)?,
                        None => self.solver.make_default_value(variable.data_type())?,
                    },
                }
            };
            replay.valuations.insert(cell_name(&flattened, 0), term);
        }

        let mut history = ExecutionHistory::new();
        let mut terminal_valuations = BTreeMap::new();
        let mut budget: u64 = 1_000_000;
        for (&cycle, inputs) in test_case.cycle_inputs() {
            if cycle != replay.cycle {
                return Err(EngineError::SuiteIo(format!(
                    "test case skips from cycle {} to {}",
                    replay.cycle, cycle
                )));
            }
            for (flattened, value) in inputs {
                replay
                    .valuations
                    .insert(cell_name(flattened, cycle), self.solver.make_literal(*value));
            }
            while replay.cycle == cycle {
                if budget == 0 {
                    return Err(EngineError::Ir(IrError::invalid(
                        "simulation did not terminate".to_string(),
                    )));
                }
                budget -= 1;
                self.record(&mut history, &replay);
                self.step(&mut replay)?;
            }
            let mut valuations = BTreeMap::new();
            for variable in cfg.flattened_interface() {
                let flattened = format!("{}.{}", cfg.name(), variable.name());
                if self.whole_program_inputs.contains(&flattened) {
                    continue;
                }
                let term = replay
                    .valuations
                    .get(&cell_name(&flattened, cycle))
                    .ok_or_else(|| EngineError::UndefinedValue(flattened.clone()))?;
                let value = as_value(term).ok_or_else(|| {
                    EngineError::UndefinedValue(format!("{} holds no literal", flattened))
                })?;
                valuations.insert(flattened, value);
            }
            terminal_valuations.insert(cycle, valuations);
        }
        Ok(SimulationOutcome {
            execution_history: history,
            terminal_valuations,
        })
    }

    fn record(&self, history: &mut ExecutionHistory, replay: &Replay<'ctx>) {
        let scope = replay.frame().scope();
        let runs = history.entry(replay.cycle).or_default();
        match runs.last_mut() {
            Some(segment) if segment.scope == scope => segment.labels.push(replay.label),
            _ => runs.push(HistorySegment {
                scope: scope.to_string(),
                cfg: replay.frame().cfg().name().to_string(),
                labels: vec![replay.label],
            }),
        }
    }

    fn step(&mut self, replay: &mut Replay<'ctx>) -> Result<(), EngineError> {
        let cfg = replay.frame().cfg().clone();
        let label = replay.label;
        let vertex = cfg.vertex(label)?;
        match (vertex.kind(), cfg.kind()) {
            (VertexKind::Entry, CfgKind::Program) | (VertexKind::Entry, CfgKind::FunctionBlock) => {
                if let Some(instruction) = vertex.instruction().cloned() {
                    self.apply_effects(replay, instruction.members())?;
                }
                let next = cfg.single_successor(label)?;
                replay.move_to(next);
                Ok(())
            }
            (VertexKind::Regular, _) => self.step_regular(replay, &cfg),
            (VertexKind::Exit, CfgKind::Program) => {
                if let Some(instruction) = vertex.instruction().cloned() {
                    self.apply_effects(replay, instruction.members())?;
                }
                self.close_cycle(replay, &cfg)
            }
            (VertexKind::Exit, CfgKind::FunctionBlock) => {
                if let Some(instruction) = vertex.instruction().cloned() {
                    self.apply_effects(replay, instruction.members())?;
                }
                let return_label = replay.frame().return_label();
                if replay.call_stack.len() <= 1 {
                    return Err(EngineError::Ir(IrError::invalid(
                        "function block exit on the root frame".to_string(),
                    )));
                }
                replay.call_stack.pop();
                replay.move_to(return_label);
                Ok(())
            }
            (_, CfgKind::Function) => Err(EngineError::Ir(IrError::NotSupported(
                "function CFGs in the simulator".to_string(),
            ))),
        }
    }

    fn step_regular(&mut self, replay: &mut Replay<'ctx>, cfg: &Rc<Cfg>) -> Result<(), EngineError> {
        let label = replay.label;
        let instruction = cfg.vertex(label)?.instruction().cloned().ok_or_else(|| {
            IrError::invalid(format!("regular vertex L{} holds no instruction", label))
        })?;
        let members = instruction.members();
        let (terminal, effects) = members.split_last().ok_or_else(|| {
            IrError::invalid(format!("vertex L{} holds an empty sequence", label))
        })?;
        self.apply_effects(replay, effects)?;
        match terminal {
            Instruction::Assignment(assignment) => {
                self.apply_assignment(replay, assignment)?;
                let next = cfg.intraprocedural_edge(label)?.target();
                replay.move_to(next);
                Ok(())
            }
            Instruction::Havoc { target } => {
                let flattened = format!("{}.{}", replay.frame().scope(), target.name());
                let value = self
                    .solver
                    .make_random_value(target.variable().data_type())?;
                replay
                    .valuations
                    .insert(cell_name(&flattened, replay.cycle), value);
                let next = cfg.intraprocedural_edge(label)?.target();
                replay.move_to(next);
                Ok(())
            }
            Instruction::Call(call) => self.apply_call(replay, cfg, call),
            Instruction::If { condition, .. } => {
                let value = self.evaluate(replay, condition)?;
                let taken = if value {
                    cfg.true_edge(label)?.target()
                } else {
                    cfg.false_edge(label)?.target()
                };
                replay.move_to(taken);
                Ok(())
            }
            Instruction::While { .. } => Err(EngineError::Ir(IrError::NotSupported(
                "while loops in the simulator".to_string(),
            ))),
            Instruction::Sequence(_) => Err(EngineError::Ir(IrError::invalid(
                "nested instruction sequences".to_string(),
            ))),
            Instruction::Goto { .. } => Err(EngineError::Ir(IrError::NotImplemented(
                "goto instructions in compiled CFGs".to_string(),
            ))),
        }
    }

    fn apply_call(
        &mut self,
        replay: &mut Replay<'ctx>,
        caller: &Rc<Cfg>,
        call: &Call,
    ) -> Result<(), EngineError> {
        let label = replay.label;
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
        let scope = format!("{}.{}", replay.frame().scope(), call.callee.name());
        replay
            .call_stack
            .push(Frame::new(callee, scope, return_label));
        replay.move_to(entry_label);
        Ok(())
    }

    fn apply_effects(
        &mut self,
        replay: &mut Replay<'ctx>,
        members: &[Instruction],
    ) -> Result<(), EngineError> {
        for member in members {
            match member {
                Instruction::Assignment(assignment) => self.apply_assignment(replay, assignment)?,
                Instruction::Havoc { target } => {
                    let flattened = format!("{}.{}", replay.frame().scope(), target.name());
                    let value = self
                        .solver
                        .make_random_value(target.variable().data_type())?;
                    replay
                        .valuations
                        .insert(cell_name(&flattened, replay.cycle), value);
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

    fn apply_assignment(
        &mut self,
        replay: &mut Replay<'ctx>,
        assignment: &Assignment,
    ) -> Result<(), EngineError> {
        let value = self.lower(replay, &assignment.rhs)?;
        let flattened = format!("{}.{}", replay.frame().scope(), assignment.target.name());
        replay
            .valuations
            .insert(cell_name(&flattened, replay.cycle), value.simplify_to_literal()?);
        Ok(())
    }

    fn close_cycle(&mut self, replay: &mut Replay<'ctx>, cfg: &Rc<Cfg>) -> Result<(), EngineError> {
        let cycle = replay.cycle;
        let next_cycle = cycle + 1;
        for variable in cfg.flattened_interface() {
            let flattened = format!("{}.{}", cfg.name(), variable.name());
            let term = if self.whole_program_inputs.contains(&flattened) {
                self.solver.make_default_value(variable.data_type())?
            } else {
                replay
                    .valuations
                    .get(&cell_name(&flattened, cycle))
                    .ok_or_else(|| EngineError::UndefinedValue(flattened.clone()))?
                    .clone()
            };
            replay
                .valuations
                .insert(cell_name(&flattened, next_cycle), term);
        }
        let return_label = replay
            .call_stack
            .first()
            .expect("the call stack always holds the root frame")
            .return_label();
        replay.move_to(return_label);
        replay.cycle = next_cycle;
        Ok(())
    }

    fn evaluate(&self, replay: &Replay<'ctx>, expression: &Expression) -> Result<bool, EngineError> {
        let term = self.lower(replay, expression)?.simplify_to_literal()?;
        as_bool_literal(&term).ok_or_else(|| {
            EngineError::Ir(IrError::invalid(format!(
                "guard {} did not evaluate to a boolean literal",
                expression
            )))
        })
    }

    fn lower(&self, replay: &Replay<'ctx>, expression: &Expression) -> Result<Term<'ctx>, EngineError> {
        match expression {
            Expression::Binary { op, left, right } => {
                let left = self.lower(replay, left)?;
                let right = self.lower(replay, right)?;
                ops::apply_binary(self.solver, *op, &left, &right)
            }
            Expression::Unary { op, operand } => {
                let operand = self.lower(replay, operand)?;
                ops::apply_unary(*op, &operand)
            }
            Expression::BooleanConstant(_)
            | Expression::IntegerConstant(_)
            | Expression::TimeConstant(_)
            | Expression::EnumeratedValue { .. } => self.solver.make_value(expression),
            Expression::Nondeterministic(_) => Err(EngineError::Ir(IrError::NotSupported(
                "nondeterministic constants outside havoc instructions".to_string(),
            ))),
            Expression::Undefined => Err(EngineError::UndefinedValue(
                "undefined expression".to_string(),
            )),
            Expression::VariableAccess(access) => self.read(replay, access.name()),
            Expression::FieldAccess(field) => self.read(replay, &field.name()),
            Expression::BooleanToIntegerCast(inner) => {
                let inner = self.lower(replay, inner)?;
                ops::bool_to_int(self.solver, &inner)
            }
            Expression::IntegerToBooleanCast(inner) => {
                let inner = self.lower(replay, inner)?;
                ops::int_to_bool(self.solver, &inner)
            }
            Expression::Change { old, new } => match self.mode {
                ShadowProcessingMode::Old => self.lower(replay, old),
                ShadowProcessingMode::New | ShadowProcessingMode::None => self.lower(replay, new),
                ShadowProcessingMode::Both => Err(EngineError::Ir(IrError::invalid(
                    "dual-mode evaluation in the simulator".to_string(),
                ))),
            },
            Expression::Phi(phi) => {
                let entered_from = replay.entered_from.ok_or_else(|| {
                    EngineError::Ir(IrError::invalid(
                        "phi evaluation without a recorded entry label".to_string(),
                    ))
                })?;
                let operand = phi.operand_for(entered_from).ok_or_else(|| {
                    EngineError::Ir(IrError::invalid(format!(
                        "phi for {} has no operand for predecessor L{}",
                        phi.target().name(),
                        entered_from
                    )))
                })?;
                self.read(replay, operand.name())
            }
        }
    }

    fn read(&self, replay: &Replay<'ctx>, name: &str) -> Result<Term<'ctx>, EngineError> {
        let flattened = format!("{}.{}", replay.frame().scope(), name);
        replay
            .valuations
            .get(&cell_name(&flattened, replay.cycle))
            .cloned()
            .ok_or(EngineError::UndefinedValue(flattened))
    }
}

trait SimplifyToLiteral<'ctx> {
    fn simplify_to_literal(self) -> Result<Term<'ctx>, EngineError>;
}

impl<'ctx> SimplifyToLiteral<'ctx> for Term<'ctx> {
    fn simplify_to_literal(self) -> Result<Term<'ctx>, EngineError> {
        use z3::ast::Ast;
        let folded = self.simplify();
        if crate::solver::is_literal(&folded) {
            Ok(folded)
        } else {
            Err(EngineError::UndefinedValue(
                "expression did not fold to a literal".to_string(),
            ))
        }
    }
}
