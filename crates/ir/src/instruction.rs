//! Instructions of the intermediate representation.
//!
//! Instructions are keyed by label inside a module; control flow between
//! them is expressed by goto labels carried on the instructions themselves
//! and materialized into edges by the CFG builder.

use crate::expression::{Expression, Label, VariableAccess, VariableReference};
use std::fmt;

/// How an assignment arose; parameter moves are introduced by the call
/// transformation and receive special treatment during SSA construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentKind {
    Regular,
    /// Copies a caller value into a callee `_input` variable before a call.
    ParameterIn,
    /// Copies a callee `_output` variable back into the caller after a call.
    ParameterOut,
}

/// An assignment `target := rhs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub target: VariableReference,
    pub rhs: Expression,
    pub kind: AssignmentKind,
}

impl Assignment {
    pub fn regular(target: impl Into<VariableReference>, rhs: Expression) -> Self {
        Assignment {
            target: target.into(),
            rhs,
            kind: AssignmentKind::Regular,
        }
    }

    pub fn parameter_in(target: impl Into<VariableReference>, rhs: Expression) -> Self {
        Assignment {
            target: target.into(),
            rhs,
            kind: AssignmentKind::ParameterIn,
        }
    }

    pub fn parameter_out(target: impl Into<VariableReference>, rhs: Expression) -> Self {
        Assignment {
            target: target.into(),
            rhs,
            kind: AssignmentKind::ParameterOut,
        }
    }
}

/// A call site of a function block instance.
///
/// `return_label` is the label of the instruction the callee returns to
/// (the target of the call-to-return edge); `entry_label` is the entry of
/// the callee. Labels of parameter pre-/post-assignments surrounding the
/// call site are recorded so passes can find them without re-scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub callee: VariableAccess,
    pub return_label: Label,
    pub entry_label: Label,
    pub pre_labels: Vec<Label>,
    pub post_labels: Vec<Label>,
}

impl Call {
    pub fn new(callee: VariableAccess, return_label: Label, entry_label: Label) -> Self {
        Call {
            callee,
            return_label,
            entry_label,
            pre_labels: Vec::new(),
            post_labels: Vec::new(),
        }
    }
}

/// The closed sum of instructions.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Assignment(Assignment),
    /// Scrambles the target: fresh symbolic constant, random concrete value.
    Havoc { target: VariableReference },
    Call(Call),
    If {
        condition: Expression,
        then_label: Label,
        else_label: Label,
    },
    While {
        condition: Expression,
        body_label: Label,
        exit_label: Label,
    },
    Sequence(Vec<Instruction>),
    Goto { label: Label },
}

impl Instruction {
    pub fn assignment(target: impl Into<VariableReference>, rhs: Expression) -> Self {
        Instruction::Assignment(Assignment::regular(target, rhs))
    }

    pub fn havoc(target: impl Into<VariableReference>) -> Self {
        Instruction::Havoc {
            target: target.into(),
        }
    }

    /// Whether any member of this instruction (recursively, for sequences)
    /// is an `If`; used when seeding branch coverage for basic blocks.
    pub fn contains_if(&self) -> bool {
        match self {
            Instruction::If { .. } => true,
            Instruction::Sequence(members) => members.iter().any(Instruction::contains_if),
            _ => false,
        }
    }

    /// Flat view of a sequence; a non-sequence instruction is its own
    /// single member.
    pub fn members(&self) -> &[Instruction] {
        match self {
            Instruction::Sequence(members) => members,
            _ => std::slice::from_ref(self),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Assignment(assignment) => {
                write!(f, "{} := {}", assignment.target, assignment.rhs)?;
                match assignment.kind {
                    AssignmentKind::Regular => Ok(()),
                    AssignmentKind::ParameterIn => write!(f, " (in)"),
                    AssignmentKind::ParameterOut => write!(f, " (out)"),
                }
            }
            Instruction::Havoc { target } => write!(f, "havoc({})", target),
            Instruction::Call(call) => write!(f, "CALL {}", call.callee),
            Instruction::If {
                condition,
                then_label,
                else_label,
            } => write!(f, "IF {} THEN L{} ELSE L{}", condition, then_label, else_label),
            Instruction::While {
                condition,
                body_label,
                exit_label,
            } => write!(f, "WHILE {} DO L{} EXIT L{}", condition, body_label, exit_label),
            Instruction::Sequence(members) => {
                write!(f, "[")?;
                for (index, member) in members.iter().enumerate() {
                    if index > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", member)?;
                }
                write!(f, "]")
            }
            Instruction::Goto { label } => write!(f, "GOTO L{}", label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{BinaryOperator, VariableAccess};
    use crate::types::DataType;
    use crate::variable::{StorageType, Variable};

    #[test]
    fn test_sequence_contains_if() {
        let x = Variable::shared("x", DataType::BOOL, StorageType::Input);
        let y = Variable::shared("y", DataType::INT, StorageType::Local);
        let sequence = Instruction::Sequence(vec![
            Instruction::assignment(
                VariableAccess::new(y.clone()),
                Expression::IntegerConstant(0),
            ),
            Instruction::If {
                condition: Expression::variable(x),
                then_label: 3,
                else_label: 4,
            },
        ]);
        assert!(sequence.contains_if());
        assert!(!Instruction::havoc(VariableAccess::new(y)).contains_if());
    }

    #[test]
    fn test_display() {
        let x = Variable::shared("x", DataType::INT, StorageType::Local);
        let instruction = Instruction::assignment(
            VariableAccess::new(x.clone()),
            Expression::binary(
                BinaryOperator::Add,
                Expression::variable(x),
                Expression::IntegerConstant(1),
            ),
        );
        assert_eq!(instruction.to_string(), "x := (x + 1)");
    }
}
