//! Lowering of IR operators onto solver terms.
//!
//! Shared by the symbolic encoder, the concrete evaluator, and their
//! shadow variants: the traversals differ only in how leaves resolve.

use crate::error::EngineError;
use crate::solver::{Solver, Term};
use cyclist_ir::error::IrError;
use cyclist_ir::expression::{BinaryOperator, UnaryOperator};
use z3::ast::{Ast, Bool, Dynamic, Int};

fn as_int<'ctx>(term: &Term<'ctx>, op: &dyn std::fmt::Display) -> Result<Int<'ctx>, EngineError> {
    term.as_int().ok_or_else(|| {
        EngineError::Ir(IrError::invalid(format!(
            "operator {} applied to a non-arithmetic term",
            op
        )))
    })
}

fn as_bool<'ctx>(term: &Term<'ctx>, op: &dyn std::fmt::Display) -> Result<Bool<'ctx>, EngineError> {
    term.as_bool().ok_or_else(|| {
        EngineError::Ir(IrError::invalid(format!(
            "operator {} applied to a non-boolean term",
            op
        )))
    })
}

/// Applies a binary operator to two lowered operands.
pub(crate) fn apply_binary<'ctx>(
    solver: &'ctx Solver,
    op: BinaryOperator,
    left: &Term<'ctx>,
    right: &Term<'ctx>,
) -> Result<Term<'ctx>, EngineError> {
    let context = solver.context();
    match op {
        BinaryOperator::Add => {
            let (l, r) = (as_int(left, &op)?, as_int(right, &op)?);
            Ok(Dynamic::from_ast(&Int::add(context, &[&l, &r])))
        }
        BinaryOperator::Subtract => {
            let (l, r) = (as_int(left, &op)?, as_int(right, &op)?);
            Ok(Dynamic::from_ast(&Int::sub(context, &[&l, &r])))
        }
        BinaryOperator::Multiply => {
            let (l, r) = (as_int(left, &op)?, as_int(right, &op)?);
            Ok(Dynamic::from_ast(&Int::mul(context, &[&l, &r])))
        }
        BinaryOperator::Divide => {
            let (l, r) = (as_int(left, &op)?, as_int(right, &op)?);
            Ok(Dynamic::from_ast(&l.div(&r)))
        }
        // MOD truncates towards zero, following the dividend's sign.
        BinaryOperator::Modulo => {
            let (l, r) = (as_int(left, &op)?, as_int(right, &op)?);
            Ok(Dynamic::from_ast(&l.rem(&r)))
        }
        BinaryOperator::Exponentiate => Err(EngineError::Ir(IrError::NotImplemented(
            "exponentiation in the solver layer".to_string(),
        ))),
        BinaryOperator::GreaterThan => {
            let (l, r) = (as_int(left, &op)?, as_int(right, &op)?);
            Ok(Dynamic::from_ast(&l.gt(&r)))
        }
        BinaryOperator::LessThan => {
            let (l, r) = (as_int(left, &op)?, as_int(right, &op)?);
            Ok(Dynamic::from_ast(&l.lt(&r)))
        }
        BinaryOperator::GreaterThanOrEqualTo => {
            let (l, r) = (as_int(left, &op)?, as_int(right, &op)?);
            Ok(Dynamic::from_ast(&l.ge(&r)))
        }
        BinaryOperator::LessThanOrEqualTo => {
            let (l, r) = (as_int(left, &op)?, as_int(right, &op)?);
            Ok(Dynamic::from_ast(&l.le(&r)))
        }
        BinaryOperator::Equality => equality(left, right).map(|b| Dynamic::from_ast(&b)),
        BinaryOperator::Inequality => equality(left, right).map(|b| Dynamic::from_ast(&b.not())),
        BinaryOperator::And => {
            let (l, r) = (as_bool(left, &op)?, as_bool(right, &op)?);
            Ok(Dynamic::from_ast(&Bool::and(context, &[&l, &r])))
        }
        BinaryOperator::Or => {
            let (l, r) = (as_bool(left, &op)?, as_bool(right, &op)?);
            Ok(Dynamic::from_ast(&Bool::or(context, &[&l, &r])))
        }
        BinaryOperator::ExclusiveOr => {
            let (l, r) = (as_bool(left, &op)?, as_bool(right, &op)?);
            Ok(Dynamic::from_ast(&l.xor(&r)))
        }
    }
}

fn equality<'ctx>(left: &Term<'ctx>, right: &Term<'ctx>) -> Result<Bool<'ctx>, EngineError> {
    if let (Some(l), Some(r)) = (left.as_bool(), right.as_bool()) {
        return Ok(l._eq(&r));
    }
    if let (Some(l), Some(r)) = (left.as_int(), right.as_int()) {
        return Ok(l._eq(&r));
    }
    Err(EngineError::Ir(IrError::invalid(
        "equality between terms of different sorts".to_string(),
    )))
}

/// Applies a unary operator to a lowered operand.
pub(crate) fn apply_unary<'ctx>(
    op: UnaryOperator,
    operand: &Term<'ctx>,
) -> Result<Term<'ctx>, EngineError> {
    match op {
        UnaryOperator::Negation => {
            let value = as_int(operand, &op)?;
            Ok(Dynamic::from_ast(&value.unary_minus()))
        }
        UnaryOperator::Complement => {
            let value = as_bool(operand, &op)?;
            Ok(Dynamic::from_ast(&value.not()))
        }
    }
}

/// `BOOL_TO_INT(b)` is `ite(b, 1, 0)`.
pub(crate) fn bool_to_int<'ctx>(
    solver: &'ctx Solver,
    operand: &Term<'ctx>,
) -> Result<Term<'ctx>, EngineError> {
    let value = as_bool(operand, &"BOOL_TO_INT")?;
    let one = Int::from_i64(solver.context(), 1);
    let zero = Int::from_i64(solver.context(), 0);
    Ok(Dynamic::from_ast(&value.ite(&one, &zero)))
}

/// `INT_TO_BOOL(i)` is `i != 0`.
pub(crate) fn int_to_bool<'ctx>(
    solver: &'ctx Solver,
    operand: &Term<'ctx>,
) -> Result<Term<'ctx>, EngineError> {
    let value = as_int(operand, &"INT_TO_BOOL")?;
    let zero = Int::from_i64(solver.context(), 0);
    Ok(Dynamic::from_ast(&value._eq(&zero).not()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::as_value;
    use crate::value::Value;

    #[test]
    fn test_arithmetic_folds() {
        let solver = Solver::with_seed(1);
        let three = solver.make_integer_value(3);
        let four = solver.make_integer_value(4);
        let sum = apply_binary(&solver, BinaryOperator::Add, &three, &four).unwrap();
        assert_eq!(as_value(&sum.simplify()), Some(Value::Int(7)));
        let product = apply_binary(&solver, BinaryOperator::Multiply, &three, &four).unwrap();
        assert_eq!(as_value(&product.simplify()), Some(Value::Int(12)));
    }

    #[test]
    fn test_modulo_follows_dividend_sign() {
        let solver = Solver::with_seed(1);
        let minus_seven = solver.make_integer_value(-7);
        let two = solver.make_integer_value(2);
        let remainder =
            apply_binary(&solver, BinaryOperator::Modulo, &minus_seven, &two).unwrap();
        assert_eq!(as_value(&remainder.simplify()), Some(Value::Int(-1)));
    }

    #[test]
    fn test_sort_mismatch_is_rejected() {
        let solver = Solver::with_seed(1);
        let b = solver.make_boolean_value(true);
        let i = solver.make_integer_value(1);
        assert!(apply_binary(&solver, BinaryOperator::Add, &b, &i).is_err());
        assert!(apply_binary(&solver, BinaryOperator::Equality, &b, &i).is_err());
        assert!(apply_unary(UnaryOperator::Complement, &i).is_err());
    }

    #[test]
    fn test_casts() {
        let solver = Solver::with_seed(1);
        let b = solver.make_boolean_value(true);
        assert_eq!(
            as_value(&bool_to_int(&solver, &b).unwrap().simplify()),
            Some(Value::Int(1))
        );
        let zero = solver.make_integer_value(0);
        assert_eq!(
            as_value(&int_to_bool(&solver, &zero).unwrap().simplify()),
            Some(Value::Bool(false))
        );
    }
}
