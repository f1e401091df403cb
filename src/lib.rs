//! Cotangent: symbolic reverse-mode differentiation for a tensor
//! expression IR.
//!
//! Given a tensor computed by a small pure expression language
//! (arithmetic, reductions, conditional selection, reads of other
//! tensors), the engine produces new tensor expressions computing the
//! gradient of that tensor with respect to a set of inputs, by composing
//! symbolic Jacobians in reverse dependency order.
//!
//! # Example
//!
//! ```rust
//! use cotangent::prelude::*;
//!
//! // O[i] = exp(I[i])
//! let input = placeholder(vec![Expr::from(4i32)], DType::f32(), "I");
//! let reader = input.clone();
//! let output = compute(
//!     vec![Expr::from(4i32)],
//!     move |idx| Expr::exp(reader.call(vec![idx[0].clone()])),
//!     "O",
//!     "",
//! );
//!
//! // Full Jacobian of O wrt I, shape [4, 4].
//! let grads = differentiate(&output, &[input.clone()], None, None).unwrap();
//! assert_eq!(grads.result[0].ndim(), 2);
//! ```

pub mod autodiff;
pub mod dtype;
pub mod error;
pub mod expr;
pub mod optimize;
pub mod reduction;
pub mod registry;
pub mod simplify;
pub mod tensor;
pub mod transform;

pub use autodiff::{
    derivative, diff_building_block, differentiate, generalized_matmul, jacobian,
    DifferentiationResult,
};
pub use dtype::{DType, DTypeKind};
pub use error::{Error, Result};
pub use expr::{CallKind, Expr, ExprKind, Var};
pub use reduction::{Combiner, IterVar, IterVarKind, Range};
pub use tensor::{compute, placeholder, ComputeOp, OpKind, Operation, Tensor};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::autodiff::{derivative, differentiate, jacobian};
    pub use crate::dtype::DType;
    pub use crate::expr::{Expr, Var};
    pub use crate::tensor::{compute, placeholder, Tensor};
}
