//! Shadow execution of unified two-version programs.
//!
//! A unified program carries `change(old, new)` annotations where the two
//! versions differ. The divergence executor evaluates every annotated
//! guard under both versions: a concrete disagreement is a divergence and
//! stops the context; agreement forks on the still-feasible "diff"
//! conjunctions so phase-2 exploration can chase potential divergences.

mod executor;
mod lowering;
mod state;

pub use executor::{DivergenceExecutor, ExecutionStatus};
pub use state::{DivergentContext, DivergentState};

/// Which version of a change annotation processing resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowProcessingMode {
    /// No shadow processing: change annotations are unexpected.
    None,
    /// Resolve annotations to their old version.
    Old,
    /// Resolve annotations to their new version.
    New,
    /// Track both versions through shadow constants.
    Both,
}
