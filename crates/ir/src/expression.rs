//! Expressions of the intermediate representation.
//!
//! Expressions form a closed sum and are trees: no sharing between nodes,
//! every node deep-clones via `Clone`. Each expression carries a static
//! [`ExpressionType`] derived from its operator or constant kind.
//!
//! The C++-style const/non-const visitor pair collapses to plain `match`
//! dispatch; passes that rewrite expressions consume and rebuild nodes.

use crate::types::DataType;
use crate::variable::Variable;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Label type shared with the CFG layer: non-negative, assigned by the
/// front end, disjoint across modules.
pub type Label = u32;

/// The static type of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionType {
    Arithmetic,
    Boolean,
    Undefined,
}

/// Binary operators, grouped into arithmetic, relational, and boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Exponentiate,
    GreaterThan,
    LessThan,
    GreaterThanOrEqualTo,
    LessThanOrEqualTo,
    Equality,
    Inequality,
    And,
    ExclusiveOr,
    Or,
}

impl BinaryOperator {
    /// The static type of an application of this operator.
    pub fn expression_type(&self) -> ExpressionType {
        match self {
            BinaryOperator::Add
            | BinaryOperator::Subtract
            | BinaryOperator::Multiply
            | BinaryOperator::Divide
            | BinaryOperator::Modulo
            | BinaryOperator::Exponentiate => ExpressionType::Arithmetic,
            BinaryOperator::GreaterThan
            | BinaryOperator::LessThan
            | BinaryOperator::GreaterThanOrEqualTo
            | BinaryOperator::LessThanOrEqualTo
            | BinaryOperator::Equality
            | BinaryOperator::Inequality
            | BinaryOperator::And
            | BinaryOperator::ExclusiveOr
            | BinaryOperator::Or => ExpressionType::Boolean,
        }
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "MOD",
            BinaryOperator::Exponentiate => "**",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::LessThan => "<",
            BinaryOperator::GreaterThanOrEqualTo => ">=",
            BinaryOperator::LessThanOrEqualTo => "<=",
            BinaryOperator::Equality => "=",
            BinaryOperator::Inequality => "<>",
            BinaryOperator::And => "AND",
            BinaryOperator::ExclusiveOr => "XOR",
            BinaryOperator::Or => "OR",
        };
        write!(f, "{}", symbol)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    /// Arithmetic negation.
    Negation,
    /// Boolean complement.
    Complement,
}

impl UnaryOperator {
    pub fn expression_type(&self) -> ExpressionType {
        match self {
            UnaryOperator::Negation => ExpressionType::Arithmetic,
            UnaryOperator::Complement => ExpressionType::Boolean,
        }
    }
}

impl fmt::Display for UnaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOperator::Negation => write!(f, "-"),
            UnaryOperator::Complement => write!(f, "NOT"),
        }
    }
}

/// A reference to a declared variable.
///
/// The referenced [`Variable`] is shared with the declaring interface, so a
/// reference always knows its data type and storage class.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableAccess {
    variable: Rc<Variable>,
}

impl VariableAccess {
    pub fn new(variable: Rc<Variable>) -> Self {
        VariableAccess { variable }
    }

    pub fn variable(&self) -> &Rc<Variable> {
        &self.variable
    }

    pub fn name(&self) -> &str {
        self.variable.name()
    }
}

impl fmt::Display for VariableAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.variable.name())
    }
}

/// An access to a field of a function block instance, e.g. `f.x`.
///
/// The inner reference is itself a variable or field access; the name of
/// the whole access is the dotted join `record.inner`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldAccess {
    record: VariableAccess,
    inner: Box<VariableReference>,
}

impl FieldAccess {
    pub fn new(record: VariableAccess, inner: VariableReference) -> Self {
        FieldAccess {
            record,
            inner: Box::new(inner),
        }
    }

    pub fn record(&self) -> &VariableAccess {
        &self.record
    }

    pub fn inner(&self) -> &VariableReference {
        &self.inner
    }

    /// The dotted name of this access, e.g. `f.g.y`.
    pub fn name(&self) -> String {
        format!("{}.{}", self.record.name(), self.inner.name())
    }

    /// The innermost variable access, i.e. the field itself.
    pub fn field(&self) -> &VariableAccess {
        match self.inner.as_ref() {
            VariableReference::Variable(access) => access,
            VariableReference::Field(field) => field.field(),
        }
    }
}

impl fmt::Display for FieldAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.record, self.inner)
    }
}

/// Either a plain variable access or a field access; the assignable places
/// of the language.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableReference {
    Variable(VariableAccess),
    Field(FieldAccess),
}

impl VariableReference {
    /// The (possibly dotted) name of the referenced place.
    pub fn name(&self) -> String {
        match self {
            VariableReference::Variable(access) => access.name().to_string(),
            VariableReference::Field(field) => field.name(),
        }
    }

    /// The variable at the end of the access path.
    pub fn variable(&self) -> &Rc<Variable> {
        match self {
            VariableReference::Variable(access) => access.variable(),
            VariableReference::Field(field) => field.field().variable(),
        }
    }
}

impl fmt::Display for VariableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableReference::Variable(access) => write!(f, "{}", access),
            VariableReference::Field(field) => write!(f, "{}", field),
        }
    }
}

impl From<VariableAccess> for VariableReference {
    fn from(access: VariableAccess) -> Self {
        VariableReference::Variable(access)
    }
}

impl From<FieldAccess> for VariableReference {
    fn from(field: FieldAccess) -> Self {
        VariableReference::Field(field)
    }
}

/// A phi merge introduced by SSA construction: the target takes the value
/// of the operand associated with the predecessor the merge was entered
/// from.
#[derive(Debug, Clone, PartialEq)]
pub struct Phi {
    target: VariableAccess,
    operands: BTreeMap<Label, VariableAccess>,
}

impl Phi {
    pub fn new(target: VariableAccess, operands: BTreeMap<Label, VariableAccess>) -> Self {
        Phi { target, operands }
    }

    pub fn target(&self) -> &VariableAccess {
        &self.target
    }

    pub fn operands(&self) -> &BTreeMap<Label, VariableAccess> {
        &self.operands
    }

    pub fn operand_for(&self, predecessor: Label) -> Option<&VariableAccess> {
        self.operands.get(&predecessor)
    }
}

impl fmt::Display for Phi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phi(")?;
        let mut first = true;
        for (label, operand) in &self.operands {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "L{}: {}", label, operand)?;
        }
        write!(f, ")")
    }
}

/// The closed sum of expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
    BooleanConstant(bool),
    IntegerConstant(i64),
    /// A duration constant in milliseconds.
    TimeConstant(i64),
    /// A value of an enumerated type, e.g. `Mode#On`; the index is the
    /// tag's position in the declaration order, resolved by the front
    /// end.
    EnumeratedValue {
        enumeration: String,
        value: String,
        index: i64,
    },
    /// An unconstrained value of the given type, e.g. from sensor noise
    /// modelling; only meaningful to the symbolic engine.
    Nondeterministic(DataType),
    Undefined,
    VariableAccess(VariableAccess),
    FieldAccess(FieldAccess),
    BooleanToIntegerCast(Box<Expression>),
    IntegerToBooleanCast(Box<Expression>),
    /// A change annotation of a unified two-version program: the old and
    /// new renditions of the same sub-expression.
    Change {
        old: Box<Expression>,
        new: Box<Expression>,
    },
    Phi(Phi),
}

impl Expression {
    pub fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Self {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOperator, operand: Expression) -> Self {
        Expression::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn variable(variable: Rc<Variable>) -> Self {
        Expression::VariableAccess(VariableAccess::new(variable))
    }

    pub fn change(old: Expression, new: Expression) -> Self {
        Expression::Change {
            old: Box::new(old),
            new: Box::new(new),
        }
    }

    /// The static type of this expression.
    ///
    /// Variable and field accesses derive their type from the referenced
    /// variable's data type; a `Change` annotation is well-typed only if
    /// both versions agree, and is `Undefined` otherwise.
    pub fn expression_type(&self) -> ExpressionType {
        match self {
            Expression::Binary { op, .. } => op.expression_type(),
            Expression::Unary { op, .. } => op.expression_type(),
            Expression::BooleanConstant(_) => ExpressionType::Boolean,
            Expression::IntegerConstant(_) => ExpressionType::Arithmetic,
            Expression::TimeConstant(_) => ExpressionType::Arithmetic,
            Expression::EnumeratedValue { .. } => ExpressionType::Arithmetic,
            Expression::Nondeterministic(data_type) => data_type_expression_type(data_type),
            Expression::Undefined => ExpressionType::Undefined,
            Expression::VariableAccess(access) => {
                data_type_expression_type(access.variable().data_type())
            }
            Expression::FieldAccess(field) => {
                data_type_expression_type(field.field().variable().data_type())
            }
            Expression::BooleanToIntegerCast(_) => ExpressionType::Arithmetic,
            Expression::IntegerToBooleanCast(_) => ExpressionType::Boolean,
            Expression::Change { old, new } => {
                let old_type = old.expression_type();
                if old_type == new.expression_type() {
                    old_type
                } else {
                    ExpressionType::Undefined
                }
            }
            Expression::Phi(phi) => data_type_expression_type(phi.target().variable().data_type()),
        }
    }

    /// Whether this node is a compound (binary or unary) application,
    /// i.e. a candidate for three-address hoisting.
    pub fn is_compound(&self) -> bool {
        matches!(
            self,
            Expression::Binary { .. } | Expression::Unary { .. }
        )
    }

    /// Whether this expression is a constant leaf.
    pub fn is_constant(&self) -> bool {
        matches!(
            self,
            Expression::BooleanConstant(_)
                | Expression::IntegerConstant(_)
                | Expression::TimeConstant(_)
                | Expression::EnumeratedValue { .. }
        )
    }

    /// Whether any node of this tree is a change annotation.
    pub fn contains_change(&self) -> bool {
        match self {
            Expression::Change { .. } => true,
            Expression::Binary { left, right, .. } => {
                left.contains_change() || right.contains_change()
            }
            Expression::Unary { operand, .. } => operand.contains_change(),
            Expression::BooleanToIntegerCast(inner) | Expression::IntegerToBooleanCast(inner) => {
                inner.contains_change()
            }
            _ => false,
        }
    }
}

fn data_type_expression_type(data_type: &DataType) -> ExpressionType {
    use crate::types::{ElementaryType, SafetyType};
    match data_type {
        DataType::Elementary(ElementaryType::Bool) => ExpressionType::Boolean,
        DataType::Elementary(_) => ExpressionType::Arithmetic,
        DataType::Safety(SafetyType::SafeBool) => ExpressionType::Boolean,
        DataType::Enumerated(_) => ExpressionType::Arithmetic,
        DataType::Derived { .. } | DataType::Inconclusive | DataType::Simple { .. } => {
            ExpressionType::Undefined
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Binary { op, left, right } => write!(f, "({} {} {})", left, op, right),
            Expression::Unary { op, operand } => write!(f, "{}({})", op, operand),
            Expression::BooleanConstant(value) => write!(f, "{}", value),
            Expression::IntegerConstant(value) => write!(f, "{}", value),
            Expression::TimeConstant(value) => write!(f, "TIME#{}ms", value),
            Expression::EnumeratedValue {
                enumeration, value, ..
            } => {
                write!(f, "{}#{}", enumeration, value)
            }
            Expression::Nondeterministic(data_type) => write!(f, "nondet({})", data_type),
            Expression::Undefined => write!(f, "undefined"),
            Expression::VariableAccess(access) => write!(f, "{}", access),
            Expression::FieldAccess(field) => write!(f, "{}", field),
            Expression::BooleanToIntegerCast(inner) => write!(f, "BOOL_TO_INT({})", inner),
            Expression::IntegerToBooleanCast(inner) => write!(f, "INT_TO_BOOL({})", inner),
            Expression::Change { old, new } => write!(f, "change({}, {})", old, new),
            Expression::Phi(phi) => write!(f, "{}", phi),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::StorageType;

    fn make_variable(name: &str, data_type: DataType) -> Rc<Variable> {
        Variable::shared(name, data_type, StorageType::Local)
    }

    #[test]
    fn test_operator_types() {
        assert_eq!(
            BinaryOperator::Add.expression_type(),
            ExpressionType::Arithmetic
        );
        assert_eq!(
            BinaryOperator::GreaterThan.expression_type(),
            ExpressionType::Boolean
        );
        assert_eq!(
            UnaryOperator::Complement.expression_type(),
            ExpressionType::Boolean
        );
    }

    #[test]
    fn test_access_types_follow_variables() {
        let x = make_variable("x", DataType::BOOL);
        let y = make_variable("y", DataType::INT);
        assert_eq!(
            Expression::variable(x).expression_type(),
            ExpressionType::Boolean
        );
        assert_eq!(
            Expression::variable(y).expression_type(),
            ExpressionType::Arithmetic
        );
    }

    #[test]
    fn test_field_access_name_is_dotted() {
        let f = make_variable("f", DataType::Derived { name: "Fb1".to_string() });
        let x = make_variable("x", DataType::BOOL);
        let access = FieldAccess::new(
            VariableAccess::new(f),
            VariableReference::Variable(VariableAccess::new(x)),
        );
        assert_eq!(access.name(), "f.x");
        assert_eq!(access.to_string(), "f.x");
    }

    #[test]
    fn test_display_round_trip_recognizable() {
        let y = make_variable("y", DataType::INT);
        let expr = Expression::binary(
            BinaryOperator::Add,
            Expression::variable(y),
            Expression::IntegerConstant(1),
        );
        assert_eq!(expr.to_string(), "(y + 1)");
    }

    #[test]
    fn test_contains_change() {
        let x = make_variable("x", DataType::INT);
        let guard = Expression::change(
            Expression::binary(
                BinaryOperator::GreaterThan,
                Expression::variable(x.clone()),
                Expression::IntegerConstant(0),
            ),
            Expression::binary(
                BinaryOperator::GreaterThanOrEqualTo,
                Expression::variable(x),
                Expression::IntegerConstant(0),
            ),
        );
        assert!(guard.contains_change());
        assert!(!Expression::IntegerConstant(3).contains_change());
    }
}
