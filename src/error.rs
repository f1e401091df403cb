//! Error types for the differentiation engine.

use thiserror::Error;

/// Main error type for differentiation operations.
///
/// All errors are fatal to the in-progress call: the engine performs no
/// local recovery and never returns a partially populated result.
#[derive(Debug, Error)]
pub enum Error {
    /// The scalar differentiator has no rule for this expression kind.
    #[error("derivative of {kind} nodes is not implemented")]
    UnsupportedNode { kind: &'static str },

    /// The scalar differentiator has no rule for this intrinsic.
    #[error("derivative of intrinsic '{name}' is not implemented")]
    UnsupportedIntrinsic { name: String },

    /// The tensor Jacobian was asked for a tensor not produced by a compute op.
    #[error("jacobian requires a compute tensor, but '{op}' is not one")]
    UnsupportedOp { op: String },

    /// Tensor ranks or contracted shapes do not line up.
    #[error("rank mismatch: {detail}")]
    RankMismatch { detail: String },

    /// A registry call received arguments it cannot dispatch.
    #[error("registry: {0}")]
    Registry(String),
}

pub type Result<T> = std::result::Result<T, Error>;
