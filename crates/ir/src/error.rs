//! IR-level error types.
//!
//! Every structural violation surfaces as an [`IrError`]; callers decide
//! whether it aborts the current exploration step or the whole run.

use thiserror::Error;

/// Errors raised by IR construction, CFG queries, and passes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IrError {
    /// A structural invariant of the IR or CFG does not hold: a missing
    /// successor, an impossible vertex type, an expected instruction kind
    /// that is not present.
    #[error("invalid IR: {0}")]
    InvalidIr(String),

    /// A language feature the pipeline does not implement yet.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A language feature that is deliberately unsupported, e.g. functions
    /// as first-class callees.
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl IrError {
    /// Shorthand for [`IrError::InvalidIr`] with a formatted message.
    pub fn invalid(message: impl Into<String>) -> Self {
        IrError::InvalidIr(message.into())
    }
}
