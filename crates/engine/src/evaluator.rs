//! Concrete evaluation of IR expressions under a state.
//!
//! The same traversal as the encoder, but leaves resolve through the
//! concrete store and operators fold to a ground literal. Evaluation
//! never produces a free term: an unbound or undefined name fails with
//! `UndefinedValue`.

use crate::context::Context;
use crate::encoder::{phi_operand, resolve_name};
use crate::error::EngineError;
use crate::ops;
use crate::solver::{is_literal, Solver, Term};
use crate::state::State;
use cyclist_ir::error::IrError;
use cyclist_ir::expression::Expression;
use z3::ast::Ast;

/// The concrete evaluator.
pub struct Evaluator<'ctx> {
    solver: &'ctx Solver,
}

impl<'ctx> Evaluator<'ctx> {
    pub fn new(solver: &'ctx Solver) -> Self {
        Evaluator { solver }
    }

    /// Evaluates an expression to a ground literal.
    pub fn evaluate(
        &self,
        expression: &Expression,
        context: &Context<'ctx>,
    ) -> Result<Term<'ctx>, EngineError> {
        self.evaluate_in(
            expression,
            context.frame().scope(),
            context.cycle(),
            context.state(),
        )
    }

    pub(crate) fn evaluate_in(
        &self,
        expression: &Expression,
        scope: &str,
        cycle: u32,
        state: &State<'ctx>,
    ) -> Result<Term<'ctx>, EngineError> {
        let term = self.lower(expression, scope, cycle, state)?;
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

    fn lower(
        &self,
        expression: &Expression,
        scope: &str,
        cycle: u32,
        state: &State<'ctx>,
    ) -> Result<Term<'ctx>, EngineError> {
        match expression {
            Expression::Binary { op, left, right } => {
                let left = self.lower(left, scope, cycle, state)?;
                let right = self.lower(right, scope, cycle, state)?;
                ops::apply_binary(self.solver, *op, &left, &right)
            }
            Expression::Unary { op, operand } => {
                let operand = self.lower(operand, scope, cycle, state)?;
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
                state.concrete_valuation(&name).cloned()
            }
            Expression::FieldAccess(field) => {
                let name = resolve_name(state, scope, &field.name(), cycle)?;
                state.concrete_valuation(&name).cloned()
            }
            Expression::BooleanToIntegerCast(inner) => {
                let inner = self.lower(inner, scope, cycle, state)?;
                ops::bool_to_int(self.solver, &inner)
            }
            Expression::IntegerToBooleanCast(inner) => {
                let inner = self.lower(inner, scope, cycle, state)?;
                ops::int_to_bool(self.solver, &inner)
            }
            // Outside shadow processing a change annotation denotes the
            // version under test: the new one.
            Expression::Change { new, .. } => self.lower(new, scope, cycle, state),
            Expression::Phi(phi) => {
                let operand = phi_operand(phi, state)?;
                let name = resolve_name(state, scope, operand.name(), cycle)?;
                state.concrete_valuation(&name).cloned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::as_value;
    use crate::state::contextualized_name;
    use crate::value::Value;
    use cyclist_ir::expression::BinaryOperator;
    use cyclist_ir::types::DataType;
    use cyclist_ir::variable::{StorageType, Variable};

    fn make_state<'ctx>(solver: &'ctx Solver) -> State<'ctx> {
        let mut state = State::new(0);
        state.set_version("P.x", 0);
        state.set_concrete_valuation(
            contextualized_name("P.x", 0, 0),
            solver.make_integer_value(5),
        );
        state
    }

    #[test]
    fn test_folds_bound_variables() {
        let solver = Solver::with_seed(1);
        let state = make_state(&solver);
        let x = Variable::shared("x", DataType::INT, StorageType::Input);
        let guard = Expression::binary(
            BinaryOperator::GreaterThan,
            Expression::variable(x),
            Expression::IntegerConstant(3),
        );
        let evaluator = Evaluator::new(&solver);
        let value = evaluator.evaluate_in(&guard, "P", 0, &state).unwrap();
        assert_eq!(as_value(&value), Some(Value::Bool(true)));
    }

    #[test]
    fn test_unbound_variable_is_undefined() {
        let solver = Solver::with_seed(1);
        let state = make_state(&solver);
        let y = Variable::shared("y", DataType::INT, StorageType::Local);
        let evaluator = Evaluator::new(&solver);
        let result = evaluator.evaluate_in(&Expression::variable(y), "P", 0, &state);
        assert!(matches!(result, Err(EngineError::UndefinedValue(_))));
    }

    #[test]
    fn test_undefined_expression_is_rejected() {
        let solver = Solver::with_seed(1);
        let state = make_state(&solver);
        let evaluator = Evaluator::new(&solver);
        assert!(matches!(
            evaluator.evaluate_in(&Expression::Undefined, "P", 0, &state),
            Err(EngineError::UndefinedValue(_))
        ));
    }
}
