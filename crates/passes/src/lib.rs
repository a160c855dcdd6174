//! CFG transformation passes.
//!
//! Each pass consumes a CFG immutably and yields a fresh one; callee CFGs
//! are transformed once per type-representative name and shared between
//! their callers. The standard pipeline is
//!
//! ```text
//! build -> tac -> call_transform -> basic_blocks -> ssa
//! ```
//!
//! where the execution engine consumes the call-transformed CFG and the
//! SSA form feeds phi-aware encoding and downstream analyses.

pub mod basic_blocks;
pub mod call_transform;
pub mod change_annotations;
pub mod ssa;
pub mod tac;

pub use basic_blocks::BasicBlockPass;
pub use call_transform::CallTransformationPass;
pub use change_annotations::collect_change_labels;
pub use ssa::{revert, SsaPass};
pub use tac::TacPass;
