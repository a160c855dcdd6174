//! Engine error types.
//!
//! Every variant is fatal to the current exploration step. Recoverable
//! conditions (an unsatisfiable fork, a duplicate test case) are not
//! errors and proceed silently.

use cyclist_ir::error::IrError;
use thiserror::Error;

/// Errors raised by the concolic and shadow engines.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A structural IR violation or an unsupported/unimplemented feature
    /// detected below the engine.
    #[error(transparent)]
    Ir(#[from] IrError),

    /// The evaluator encountered a name with no binding in the store.
    #[error("undefined value: {0} is unbound")]
    UndefinedValue(String),

    /// The SMT solver returned `unknown`; never coerced to sat or unsat.
    #[error("solver returned unknown")]
    SolverUnknown,

    /// Test-suite (de)serialization failures.
    #[error("test suite i/o: {0}")]
    SuiteIo(String),
}

impl EngineError {
    /// Process exit code for the command-line surface: 0 is success,
    /// 2 solver-unknown, 3 invalid IR, 1 everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::SolverUnknown => 2,
            EngineError::Ir(IrError::InvalidIr(_)) => 3,
            _ => 1,
        }
    }
}
