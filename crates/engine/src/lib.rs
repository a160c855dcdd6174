//! Concolic execution engine for cyclic controller programs.
//!
//! Maintains parallel concrete and symbolic stores over the IR, forks on
//! every conditional whose guard depends on symbolic input, decides path
//! feasibility with Z3, and threads local/output valuations from one
//! cycle of the controller loop into the next while re-symbolizing
//! inputs. The shadow extension detects and chases divergences between
//! the old and new versions of a unified program; the explorer turns
//! coverage growth into a de-duplicated XML test suite.
//!
//! # Pipeline
//!
//! ```text
//! Project -> Builder -> TacPass -> Engine::run -> TestSuite
//!                              \-> ShadowEngine::run (unified programs)
//! ```

pub mod config;
pub mod context;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod explorer;
mod ops;
pub mod shadow;
pub mod simulator;
pub mod solver;
pub mod state;
pub mod testsuite;
pub mod value;

pub use config::EngineConfig;
pub use context::{Context, Frame};
pub use engine::{Divergence, Engine, EngineOutcome, ShadowEngine, ShadowOutcome};
pub use error::EngineError;
pub use executor::Executor;
pub use explorer::{Coverage, Explorer};
pub use shadow::{DivergenceExecutor, DivergentContext, ExecutionStatus, ShadowProcessingMode};
pub use simulator::{ExecutionHistory, SimulationOutcome, Simulator};
pub use solver::{CheckResult, Solver};
pub use state::State;
pub use testsuite::{TestCase, TestSuite};
pub use value::Value;
