//! Symbolic encoding of IR expressions under a state.
//!
//! A variable access `v` at scope σ becomes the uninterpreted constant
//! `σ.v_<version>__<cycle>` for the state's current version of the
//! flattened name; operators map to their solver counterparts. The
//! symbolic store later ties each such constant to its defining term via
//! hard constraints, so encoded expressions stay shallow.

use crate::context::Context;
use crate::error::EngineError;
use crate::ops;
use crate::solver::{Solver, Term};
use crate::state::{contextualized_name, State};
use cyclist_ir::error::IrError;
use cyclist_ir::expression::{Expression, Phi};
use cyclist_ir::variable::Variable;
use std::rc::Rc;

/// Resolves a (possibly dotted) access name to its contextualized store
/// name under the given scope.
pub(crate) fn resolve_name(
    state: &State<'_>,
    scope: &str,
    name: &str,
    cycle: u32,
) -> Result<String, EngineError> {
    let flattened = format!("{}.{}", scope, name);
    let version = state
        .version(&flattened)
        .ok_or(EngineError::UndefinedValue(flattened.clone()))?;
    Ok(contextualized_name(&flattened, version, cycle))
}

/// Selects the phi operand for the predecessor the state entered from.
pub(crate) fn phi_operand<'p>(phi: &'p Phi, state: &State<'_>) -> Result<&'p Rc<Variable>, EngineError> {
    let entered_from = state.entered_from().ok_or_else(|| {
        EngineError::Ir(IrError::invalid(
            "phi evaluation without a recorded entry label".to_string(),
        ))
    })?;
    phi.operand_for(entered_from)
        .map(|access| access.variable())
        .ok_or_else(|| {
            EngineError::Ir(IrError::invalid(format!(
                "phi for {} has no operand for predecessor L{}",
                phi.target().name(),
                entered_from
            )))
        })
}

/// The symbolic encoder.
pub struct Encoder<'ctx> {
    solver: &'ctx Solver,
}

impl<'ctx> Encoder<'ctx> {
    pub fn new(solver: &'ctx Solver) -> Self {
        Encoder { solver }
    }

    pub fn encode(
        &self,
        expression: &Expression,
        context: &Context<'ctx>,
    ) -> Result<Term<'ctx>, EngineError> {
        self.encode_in(
            expression,
            context.frame().scope(),
            context.cycle(),
            context.state(),
        )
    }

    pub(crate) fn encode_in(
        &self,
        expression: &Expression,
        scope: &str,
        cycle: u32,
        state: &State<'ctx>,
    ) -> Result<Term<'ctx>, EngineError> {
        match expression {
            Expression::Binary { op, left, right } => {
                let left = self.encode_in(left, scope, cycle, state)?;
                let right = self.encode_in(right, scope, cycle, state)?;
                ops::apply_binary(self.solver, *op, &left, &right)
            }
            Expression::Unary { op, operand } => {
                let operand = self.encode_in(operand, scope, cycle, state)?;
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
            Expression::VariableAccess(access) => {
                let name = resolve_name(state, scope, access.name(), cycle)?;
                self.solver
                    .make_constant(&name, access.variable().data_type())
            }
            Expression::FieldAccess(field) => {
                let name = resolve_name(state, scope, &field.name(), cycle)?;
                self.solver
                    .make_constant(&name, field.field().variable().data_type())
            }
            Expression::BooleanToIntegerCast(inner) => {
                let inner = self.encode_in(inner, scope, cycle, state)?;
                ops::bool_to_int(self.solver, &inner)
            }
            Expression::IntegerToBooleanCast(inner) => {
                let inner = self.encode_in(inner, scope, cycle, state)?;
                ops::int_to_bool(self.solver, &inner)
            }
            // Outside shadow processing a change annotation denotes the
            // version under test: the new one.
            Expression::Change { new, .. } => self.encode_in(new, scope, cycle, state),
            Expression::Phi(phi) => {
                let operand = phi_operand(phi, state)?;
                let name = resolve_name(state, scope, operand.name(), cycle)?;
                self.solver.make_constant(&name, operand.data_type())
            }
        }
    }
}
