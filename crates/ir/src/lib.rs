//! Intermediate representation for cyclic controller programs.
//!
//! Provides the typed expression and instruction sums, variables and
//! interfaces, the front-end module/project data model, and control-flow
//! graphs with interprocedural call/return edges.
//!
//! The layering is strictly bottom-up: front ends produce a [`Project`] of
//! labelled [`Module`]s, [`Builder`] compiles them to shared [`Cfg`]s, and
//! the pass and engine crates consume those CFGs immutably.

pub mod builder;
pub mod cfg;
pub mod error;
pub mod expression;
pub mod instruction;
pub mod interface;
pub mod module;
pub mod types;
pub mod variable;

pub use builder::Builder;
pub use cfg::{Cfg, CfgKind, Edge, EdgeKind, Vertex, VertexKind};
pub use error::IrError;
pub use expression::{
    BinaryOperator, Expression, ExpressionType, FieldAccess, Label, Phi, UnaryOperator,
    VariableAccess, VariableReference,
};
pub use instruction::{Assignment, AssignmentKind, Call, Instruction};
pub use interface::Interface;
pub use module::{Module, ModuleKind, Project};
pub use types::{DataType, ElementaryType, EnumeratedType, SafetyType};
pub use variable::{StorageType, Variable};
