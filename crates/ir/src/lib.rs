//! Graph-based CPS intermediate representation.
//!
//! Programs are a single directed graph of definitions: control flow is
//! expressed by tail-calls between first-class continuations (lambdas), data
//! flow by hash-consed primitive operations. The [`ir`] module owns the graph
//! store and the analyses and rewrites that consume it; [`types`] holds the
//! hash-consed type system the graph is typed with.

use std::sync::LazyLock;

use lasso::ThreadedRodeo;

pub mod ir;
pub mod types;

pub use ir::{ArithOp, BitOp, Box, CmpOp, DefId, LambdaAttr, NodeKind, ShiftOp, World};
pub use types::{PrimType, TypeId};

pub static INTERNER: LazyLock<ThreadedRodeo> = LazyLock::new(|| ThreadedRodeo::new());
