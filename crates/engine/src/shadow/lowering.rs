//! Mode-aware encoding and evaluation over divergent states.
//!
//! The traversals mirror the plain encoder and evaluator; change
//! annotations resolve per [`ShadowProcessingMode`], and dual (`Both`)
//! encoding introduces fresh shadow constants whose old/new renditions
//! are registered in the symbolic shadow store.

use crate::encoder::resolve_name;
use crate::error::EngineError;
use crate::ops;
use crate::shadow::state::DivergentState;
use crate::shadow::ShadowProcessingMode;
use crate::solver::{is_literal, Solver, Term};
use cyclist_ir::error::IrError;
use cyclist_ir::expression::Expression;
use z3::ast::Ast;

/// Symbolically encodes an expression under a divergent state.
pub(crate) fn encode<'ctx>(
    solver: &'ctx Solver,
    expression: &Expression,
    scope: &str,
    cycle: u32,
    state: &mut DivergentState<'ctx>,
    mode: ShadowProcessingMode,
) -> Result<Term<'ctx>, EngineError> {
    match expression {
        Expression::Binary { op, left, right } => {
            let left = encode(solver, left, scope, cycle, state, mode)?;
            let right = encode(solver, right, scope, cycle, state, mode)?;
            ops::apply_binary(solver, *op, &left, &right)
        }
        Expression::Unary { op, operand } => {
            let operand = encode(solver, operand, scope, cycle, state, mode)?;
            ops::apply_unary(*op, &operand)
        }
        Expression::BooleanConstant(_)
        | Expression::IntegerConstant(_)
        | Expression::TimeConstant(_)
        | Expression::EnumeratedValue { .. } => solver.make_value(expression),
        Expression::Nondeterministic(_) => Err(EngineError::Ir(IrError::NotSupported(
            "nondeterministic constants outside havoc instructions".to_string(),
        ))),
        Expression::Undefined => Err(EngineError::UndefinedValue(
            "undefined expression".to_string(),
        )),
        Expression::VariableAccess(access) => {
            let name = resolve_name(state.base(), scope, access.name(), cycle)?;
            solver.make_constant(&name, access.variable().data_type())
        }
        Expression::FieldAccess(field) => {
            let name = resolve_name(state.base(), scope, &field.name(), cycle)?;
            solver.make_constant(&name, field.field().variable().data_type())
        }
        Expression::BooleanToIntegerCast(inner) => {
            let inner = encode(solver, inner, scope, cycle, state, mode)?;
            ops::bool_to_int(solver, &inner)
        }
        Expression::IntegerToBooleanCast(inner) => {
            let inner = encode(solver, inner, scope, cycle, state, mode)?;
            ops::int_to_bool(solver, &inner)
        }
        Expression::Change { old, new } => match mode {
            ShadowProcessingMode::Old => encode(solver, old, scope, cycle, state, mode),
            ShadowProcessingMode::New => encode(solver, new, scope, cycle, state, mode),
            ShadowProcessingMode::Both => {
                let old_term = encode(solver, old, scope, cycle, state, ShadowProcessingMode::Old)?;
                let new_term = encode(solver, new, scope, cycle, state, ShadowProcessingMode::New)?;
                let shadow_name = state.fresh_shadow_name();
                let constant = if old_term.as_bool().is_some() {
                    solver.make_constant(&shadow_name, &cyclist_ir::types::DataType::BOOL)?
                } else {
                    solver.make_constant(&shadow_name, &cyclist_ir::types::DataType::INT)?
                };
                state.set_symbolic_shadow_valuation(shadow_name, old_term, new_term);
                Ok(constant)
            }
            ShadowProcessingMode::None => Err(EngineError::Ir(IrError::invalid(
                "change annotation outside shadow processing".to_string(),
            ))),
        },
        Expression::Phi(phi) => {
            let operand = crate::encoder::phi_operand(phi, state.base())?;
            let name = resolve_name(state.base(), scope, operand.name(), cycle)?;
            solver.make_constant(&name, operand.data_type())
        }
    }
}

/// Concretely evaluates an expression under a divergent state; in `Old`
/// and `New` mode, variables with registered shadow pairs resolve to the
/// respective side.
pub(crate) fn evaluate<'ctx>(
    solver: &'ctx Solver,
    expression: &Expression,
    scope: &str,
    cycle: u32,
    state: &DivergentState<'ctx>,
    mode: ShadowProcessingMode,
) -> Result<Term<'ctx>, EngineError> {
    let term = lower(solver, expression, scope, cycle, state, mode)?;
    let folded = term.simplify();
    if is_literal(&folded) {
        Ok(folded)
    } else {
        Err(EngineError::UndefinedValue(format!(
            "{} did not fold to a literal",
            expression
        )))
    }
}

fn lower<'ctx>(
    solver: &'ctx Solver,
    expression: &Expression,
    scope: &str,
    cycle: u32,
    state: &DivergentState<'ctx>,
    mode: ShadowProcessingMode,
) -> Result<Term<'ctx>, EngineError> {
    match expression {
        Expression::Binary { op, left, right } => {
            let left = lower(solver, left, scope, cycle, state, mode)?;
            let right = lower(solver, right, scope, cycle, state, mode)?;
            ops::apply_binary(solver, *op, &left, &right)
        }
        Expression::Unary { op, operand } => {
            let operand = lower(solver, operand, scope, cycle, state, mode)?;
            ops::apply_unary(*op, &operand)
        }
        Expression::BooleanConstant(_)
        | Expression::IntegerConstant(_)
        | Expression::TimeConstant(_)
        | Expression::EnumeratedValue { .. } => solver.make_value(expression),
        Expression::Nondeterministic(_) => Err(EngineError::Ir(IrError::NotSupported(
            "nondeterministic constants outside havoc instructions".to_string(),
        ))),
        Expression::Undefined => Err(EngineError::UndefinedValue(
            "undefined expression".to_string(),
        )),
        Expression::VariableAccess(access) => {
            resolve_concrete(state, scope, access.name(), cycle, mode)
        }
        Expression::FieldAccess(field) => {
            resolve_concrete(state, scope, &field.name(), cycle, mode)
        }
        Expression::BooleanToIntegerCast(inner) => {
            let inner = lower(solver, inner, scope, cycle, state, mode)?;
            ops::bool_to_int(solver, &inner)
        }
        Expression::IntegerToBooleanCast(inner) => {
            let inner = lower(solver, inner, scope, cycle, state, mode)?;
            ops::int_to_bool(solver, &inner)
        }
        Expression::Change { old, new } => match mode {
            ShadowProcessingMode::Old => lower(solver, old, scope, cycle, state, mode),
            ShadowProcessingMode::New => lower(solver, new, scope, cycle, state, mode),
            ShadowProcessingMode::Both | ShadowProcessingMode::None => {
                Err(EngineError::Ir(IrError::invalid(
                    "change annotations require single-version evaluation".to_string(),
                )))
            }
        },
        Expression::Phi(phi) => {
            let operand = crate::encoder::phi_operand(phi, state.base())?;
            resolve_concrete(state, scope, operand.name(), cycle, mode)
        }
    }
}

fn resolve_concrete<'ctx>(
    state: &DivergentState<'ctx>,
    scope: &str,
    name: &str,
    cycle: u32,
    mode: ShadowProcessingMode,
) -> Result<Term<'ctx>, EngineError> {
    let contextualized = resolve_name(state.base(), scope, name, cycle)?;
    if let Some((old, new)) = state.concrete_shadow_valuation(&contextualized) {
        match mode {
            ShadowProcessingMode::Old => return Ok(old.clone()),
            ShadowProcessingMode::New => return Ok(new.clone()),
            ShadowProcessingMode::None | ShadowProcessingMode::Both => {}
        }
    }
    state.base().concrete_valuation(&contextualized).cloned()
}
