//! Facade over the Z3 solver.
//!
//! Owns the solver context and the engine's random number generator.
//! Every satisfiability query is self-contained: a fresh `z3::Solver` is
//! created per query, so no assertion state leaks between exploration
//! steps. An `unknown` outcome is reported as such and never coerced.

use crate::error::EngineError;
use crate::value::Value;
use cyclist_ir::error::IrError;
use cyclist_ir::expression::Expression;
use cyclist_ir::types::{DataType, ElementaryType, SafetyType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::BTreeSet;
use z3::ast::{Ast, Bool, Dynamic, Int};
use z3::{AstKind, Context, DeclKind, Model, SatResult};

/// An SMT term; a handle into the solver context, freely shareable
/// within it.
pub type Term<'ctx> = Dynamic<'ctx>;

/// Outcome of a satisfiability query.
pub enum CheckResult<'ctx> {
    Sat(Model<'ctx>),
    Unsat,
    Unknown,
}

/// The sort a data type maps to on the solver side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSort {
    Bool,
    Int,
}

/// Solver-side sort of a data type. Durations and enumerations live on
/// the integer sort; reals have no mapping yet.
pub fn sort_of(data_type: &DataType) -> Result<TermSort, EngineError> {
    match data_type {
        DataType::Elementary(ElementaryType::Bool) => Ok(TermSort::Bool),
        DataType::Safety(SafetyType::SafeBool) => Ok(TermSort::Bool),
        DataType::Elementary(ElementaryType::Int) => Ok(TermSort::Int),
        DataType::Elementary(ElementaryType::Time) => Ok(TermSort::Int),
        DataType::Enumerated(_) => Ok(TermSort::Int),
        DataType::Elementary(ElementaryType::Real) => Err(EngineError::Ir(IrError::NotImplemented(
            "real-typed valuations".to_string(),
        ))),
        other => Err(EngineError::Ir(IrError::invalid(format!(
            "data type {} has no solver sort",
            other
        )))),
    }
}

/// The solver facade.
pub struct Solver {
    context: Context,
    rng: RefCell<StdRng>,
}

impl Solver {
    pub fn new() -> Self {
        Solver::with_seed(rand::random())
    }

    /// A facade with a fixed RNG seed, for reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        let config = z3::Config::new();
        Solver {
            context: Context::new(&config),
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// A facade configured per [`crate::config::EngineConfig`]: a fixed
    /// seed if the configuration pins one, entropy otherwise.
    pub fn from_config(config: &crate::config::EngineConfig) -> Self {
        match config.seed {
            Some(seed) => Solver::with_seed(seed),
            None => Solver::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    // ------------------------------------------------------------------
    // Term construction
    // ------------------------------------------------------------------

    pub fn make_boolean_constant(&self, name: &str) -> Bool<'_> {
        Bool::new_const(&self.context, name)
    }

    pub fn make_integer_constant(&self, name: &str) -> Int<'_> {
        Int::new_const(&self.context, name)
    }

    /// A typed uninterpreted constant.
    pub fn make_constant(&self, name: &str, data_type: &DataType) -> Result<Term<'_>, EngineError> {
        match sort_of(data_type)? {
            TermSort::Bool => Ok(Dynamic::from_ast(&self.make_boolean_constant(name))),
            TermSort::Int => Ok(Dynamic::from_ast(&self.make_integer_constant(name))),
        }
    }

    pub fn make_boolean_value(&self, value: bool) -> Term<'_> {
        Dynamic::from_ast(&Bool::from_bool(&self.context, value))
    }

    pub fn make_integer_value(&self, value: i64) -> Term<'_> {
        Dynamic::from_ast(&Int::from_i64(&self.context, value))
    }

    pub fn make_literal(&self, value: Value) -> Term<'_> {
        match value {
            Value::Bool(b) => self.make_boolean_value(b),
            Value::Int(i) => self.make_integer_value(i),
        }
    }

    /// A fresh type-appropriate literal with pseudo-random value:
    /// booleans uniform, integers over the 16-bit range of `INT`,
    /// durations bounded non-negative, enumerations over their tags.
    pub fn make_random_value(&self, data_type: &DataType) -> Result<Term<'_>, EngineError> {
        let mut rng = self.rng.borrow_mut();
        match data_type {
            DataType::Elementary(ElementaryType::Bool) | DataType::Safety(SafetyType::SafeBool) => {
                let value: bool = rng.r#gen();
                Ok(self.make_boolean_value(value))
            }
            DataType::Elementary(ElementaryType::Int) => {
                Ok(self.make_integer_value(rng.gen_range(i16::MIN as i64..=i16::MAX as i64)))
            }
            DataType::Elementary(ElementaryType::Time) => {
                Ok(self.make_integer_value(rng.gen_range(0..=60_000)))
            }
            DataType::Enumerated(enumeration) => {
                let upper = enumeration.values.len().max(1) as i64;
                Ok(self.make_integer_value(rng.gen_range(0..upper)))
            }
            other => match sort_of(other) {
                Err(error) => Err(error),
                Ok(_) => Err(EngineError::Ir(IrError::invalid(format!(
                    "no random value for data type {}",
                    other
                )))),
            },
        }
    }

    /// The language default for a type: `false`, `0`, zero duration, the
    /// first enumeration tag.
    pub fn make_default_value(&self, data_type: &DataType) -> Result<Term<'_>, EngineError> {
        match sort_of(data_type)? {
            TermSort::Bool => Ok(self.make_boolean_value(false)),
            TermSort::Int => Ok(self.make_integer_value(0)),
        }
    }

    /// Converts an IR constant to a term; enumeration tags lower to their
    /// declaration-order index.
    pub fn make_value(&self, expression: &Expression) -> Result<Term<'_>, EngineError> {
        match expression {
            Expression::BooleanConstant(value) => Ok(self.make_boolean_value(*value)),
            Expression::IntegerConstant(value) => Ok(self.make_integer_value(*value)),
            Expression::TimeConstant(value) => Ok(self.make_integer_value(*value)),
            Expression::EnumeratedValue { index, .. } => Ok(self.make_integer_value(*index)),
            other => Err(EngineError::Ir(IrError::invalid(format!(
                "{} is not a constant",
                other
            )))),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Satisfiability of a conjunction; each query runs on a fresh
    /// solver.
    pub fn check<'ctx>(&'ctx self, terms: &[Bool<'ctx>]) -> CheckResult<'ctx> {
        let solver = z3::Solver::new(&self.context);
        for term in terms {
            solver.assert(term);
        }
        match solver.check() {
            SatResult::Sat => match solver.get_model() {
                Some(model) => CheckResult::Sat(model),
                None => CheckResult::Unknown,
            },
            SatResult::Unsat => CheckResult::Unsat,
            SatResult::Unknown => CheckResult::Unknown,
        }
    }

    /// Satisfiability of a conjunction under extra assumptions, for
    /// incremental assumption-based queries.
    pub fn check_under_assumptions<'ctx>(
        &'ctx self,
        terms: &[Bool<'ctx>],
        assumptions: &[Bool<'ctx>],
    ) -> CheckResult<'ctx> {
        let solver = z3::Solver::new(&self.context);
        for term in terms {
            solver.assert(term);
        }
        match solver.check_assumptions(assumptions) {
            SatResult::Sat => match solver.get_model() {
                Some(model) => CheckResult::Sat(model),
                None => CheckResult::Unknown,
            },
            SatResult::Unsat => CheckResult::Unsat,
            SatResult::Unknown => CheckResult::Unknown,
        }
    }

    /// The free uninterpreted constants of a term, deduplicated by name.
    pub fn uninterpreted_constants<'ctx>(&'ctx self, term: &Term<'ctx>) -> Vec<Term<'ctx>> {
        let mut seen = BTreeSet::new();
        let mut constants = Vec::new();
        collect_uninterpreted(term, &mut seen, &mut constants);
        constants
    }
}

impl Default for Solver {
    fn default() -> Self {
        Solver::new()
    }
}

fn collect_uninterpreted<'ctx>(
    term: &Term<'ctx>,
    seen: &mut BTreeSet<String>,
    out: &mut Vec<Term<'ctx>>,
) {
    if term.kind() != AstKind::App {
        return;
    }
    let children = term.children();
    if children.is_empty() {
        let decl = term.decl();
        if decl.kind() == DeclKind::UNINTERPRETED && seen.insert(decl.name()) {
            out.push(term.clone());
        }
        return;
    }
    for child in children {
        collect_uninterpreted(&child, seen, out);
    }
}

// ----------------------------------------------------------------------
// Literal inspection
// ----------------------------------------------------------------------

/// The name of an uninterpreted constant, if the term is one.
pub fn constant_name(term: &Term<'_>) -> Option<String> {
    if term.kind() == AstKind::App && term.children().is_empty() {
        let decl = term.decl();
        if decl.kind() == DeclKind::UNINTERPRETED {
            return Some(decl.name());
        }
    }
    None
}

pub fn as_bool_literal(term: &Term<'_>) -> Option<bool> {
    term.as_bool().and_then(|b| b.as_bool())
}

pub fn as_int_literal(term: &Term<'_>) -> Option<i64> {
    term.as_int().and_then(|i| i.as_i64())
}

/// Extracts a ground literal from a term, if it is one.
pub fn as_value(term: &Term<'_>) -> Option<Value> {
    as_bool_literal(term)
        .map(Value::Bool)
        .or_else(|| as_int_literal(term).map(Value::Int))
}

pub fn is_literal(term: &Term<'_>) -> bool {
    as_value(term).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literals_round_trip() {
        let solver = Solver::with_seed(7);
        assert_eq!(as_value(&solver.make_boolean_value(true)), Some(Value::Bool(true)));
        assert_eq!(as_value(&solver.make_integer_value(-3)), Some(Value::Int(-3)));
        assert_eq!(
            as_value(&solver.make_literal(Value::Int(42))),
            Some(Value::Int(42))
        );
    }

    #[test]
    fn test_constants_are_not_literals() {
        let solver = Solver::with_seed(7);
        let constant = solver.make_constant("P.x_0__0", &DataType::BOOL).unwrap();
        assert!(!is_literal(&constant));
        assert_eq!(constant_name(&constant).as_deref(), Some("P.x_0__0"));
    }

    #[test]
    fn test_uninterpreted_constants_of_compound_term() {
        let solver = Solver::with_seed(7);
        let x = solver.make_integer_constant("x");
        let y = solver.make_integer_constant("y");
        let sum = Int::add(solver.context(), &[&x, &y]);
        let term = Dynamic::from_ast(&sum.gt(&Int::from_i64(solver.context(), 0)));
        let constants = solver.uninterpreted_constants(&term);
        let mut names: Vec<_> = constants.iter().filter_map(constant_name).collect();
        names.sort();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn test_check_sat_and_unsat() {
        let solver = Solver::with_seed(7);
        let x = solver.make_integer_constant("x");
        let positive = x.gt(&Int::from_i64(solver.context(), 0));
        match solver.check(&[positive.clone()]) {
            CheckResult::Sat(model) => {
                let witness = model.eval(&x, true).and_then(|i| i.as_i64());
                assert!(witness.is_some_and(|v| v > 0));
            }
            _ => panic!("x > 0 is satisfiable"),
        }
        let negative = x.lt(&Int::from_i64(solver.context(), 0));
        match solver.check(&[positive, negative]) {
            CheckResult::Unsat => {}
            _ => panic!("x > 0 and x < 0 is unsatisfiable"),
        }
    }

    #[test]
    fn test_default_and_random_values_are_typed() {
        let solver = Solver::with_seed(7);
        assert_eq!(
            as_value(&solver.make_default_value(&DataType::BOOL).unwrap()),
            Some(Value::Bool(false))
        );
        assert_eq!(
            as_value(&solver.make_default_value(&DataType::INT).unwrap()),
            Some(Value::Int(0))
        );
        let random = solver.make_random_value(&DataType::TIME).unwrap();
        match as_value(&random) {
            Some(Value::Int(ms)) => assert!((0..=60_000).contains(&ms)),
            other => panic!("unexpected duration literal {:?}", other),
        }
    }
}
