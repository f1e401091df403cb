//! Tensors and the operations that produce them.
//!
//! A [`Tensor`] is a handle `(op, value_index, shape, dtype)` into the
//! output tuple of an [`Operation`]. Operations and tensors are immutable
//! and shared through [`Arc`]; tensor identity (equality and hashing) is
//! the identity of the producing operation plus the output index, not
//! structural equality of the bodies.

use std::fmt;
use std::sync::Arc;

use crate::dtype::DType;
use crate::expr::{CallKind, Expr, Var};
use crate::reduction::{IterVar, Range};

/// The body of a computed operation: iteration axes and one scalar
/// expression per output.
#[derive(Debug, Clone)]
pub struct ComputeOp {
    pub tag: String,
    pub axis: Vec<IterVar>,
    pub body: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub enum OpKind {
    /// An input tensor with no body.
    Placeholder { shape: Vec<Expr>, dtype: DType },
    /// A tensor computed from a scalar expression over iteration axes.
    Compute(ComputeOp),
}

#[derive(Debug)]
pub struct OpData {
    pub name: String,
    pub kind: OpKind,
}

/// A computation producing one or more tensors, compared by identity.
#[derive(Debug, Clone)]
pub struct Operation(Arc<OpData>);

impl Operation {
    pub fn placeholder(name: &str, shape: Vec<Expr>, dtype: DType) -> Self {
        Self(Arc::new(OpData {
            name: name.to_string(),
            kind: OpKind::Placeholder { shape, dtype },
        }))
    }

    pub fn compute(name: &str, tag: &str, axis: Vec<IterVar>, body: Vec<Expr>) -> Self {
        assert!(!body.is_empty());
        Self(Arc::new(OpData {
            name: name.to_string(),
            kind: OpKind::Compute(ComputeOp {
                tag: tag.to_string(),
                axis,
                body,
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> &OpKind {
        &self.0.kind
    }

    pub fn as_compute(&self) -> Option<&ComputeOp> {
        match self.kind() {
            OpKind::Compute(op) => Some(op),
            _ => None,
        }
    }

    /// Number of output tensors.
    pub fn num_outputs(&self) -> usize {
        match self.kind() {
            OpKind::Placeholder { .. } => 1,
            OpKind::Compute(op) => op.body.len(),
        }
    }

    pub fn same_as(&self, other: &Operation) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Operation {}

impl std::hash::Hash for Operation {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

#[derive(Debug)]
pub struct TensorData {
    pub op: Operation,
    pub value_index: usize,
    pub shape: Vec<Expr>,
    pub dtype: DType,
}

/// A handle to one output of an [`Operation`].
#[derive(Debug, Clone)]
pub struct Tensor(Arc<TensorData>);

impl Tensor {
    pub fn new(op: Operation, value_index: usize, shape: Vec<Expr>, dtype: DType) -> Self {
        assert!(value_index < op.num_outputs());
        Self(Arc::new(TensorData {
            op,
            value_index,
            shape,
            dtype,
        }))
    }

    pub fn op(&self) -> &Operation {
        &self.0.op
    }

    pub fn value_index(&self) -> usize {
        self.0.value_index
    }

    pub fn shape(&self) -> &[Expr] {
        &self.0.shape
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn ndim(&self) -> usize {
        self.0.shape.len()
    }

    pub fn name(&self) -> &str {
        self.0.op.name()
    }

    /// `true` if both handles name the same output of the same operation.
    pub fn same_as(&self, other: &Tensor) -> bool {
        self.op().same_as(other.op()) && self.value_index() == other.value_index()
    }

    /// Builds the expression reading `self[indices]`.
    pub fn call(&self, indices: Vec<Expr>) -> Expr {
        assert_eq!(
            indices.len(),
            self.ndim(),
            "tensor '{}' read with {} indices but has rank {}",
            self.name(),
            indices.len(),
            self.ndim()
        );
        Expr::call(
            CallKind::Halide,
            self.name(),
            indices,
            Some(self.clone()),
            self.value_index(),
            self.dtype(),
        )
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Tensor {}

impl std::hash::Hash for Tensor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.op().addr().hash(state);
        self.value_index().hash(state);
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.name())?;
        for (i, e) in self.shape().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{e}")?;
        }
        write!(f, "]")
    }
}

/// Creates an input tensor with no body.
pub fn placeholder(shape: Vec<Expr>, dtype: DType, name: &str) -> Tensor {
    let op = Operation::placeholder(name, shape.clone(), dtype);
    Tensor::new(op, 0, shape, dtype)
}

/// Creates a computed tensor. `f` receives one index expression per axis
/// (axes are named `ax0, ax1, ...` with ranges `[0, shape[i])`).
pub fn compute(
    shape: Vec<Expr>,
    f: impl FnOnce(&[Expr]) -> Expr,
    name: &str,
    tag: &str,
) -> Tensor {
    let axis: Vec<IterVar> = shape
        .iter()
        .enumerate()
        .map(|(i, extent)| {
            IterVar::data(
                Var::new(&format!("ax{i}"), extent.dtype()),
                Range::from_extent(extent.clone()),
            )
        })
        .collect();
    let indices: Vec<Expr> = axis.iter().map(|iv| Expr::var(iv.var.clone())).collect();
    let body = f(&indices);
    let dtype = body.dtype();
    let op = Operation::compute(name, tag, axis, vec![body]);
    Tensor::new(op, 0, shape, dtype)
}

/// A tensor filled with a single constant value.
pub fn full(shape: Vec<Expr>, dtype: DType, value: f64) -> Tensor {
    compute(
        shape,
        |_| Expr::make_const(dtype, value),
        "full",
        "elemwise",
    )
}

/// Elementwise sum of two tensors of identical shape.
pub fn elemwise_add(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(
        a.shape(),
        b.shape(),
        "shape mismatch in elemwise_add: {a} vs {b}"
    );
    assert_eq!(a.dtype(), b.dtype());
    let (a, b) = (a.clone(), b.clone());
    compute(
        a.shape().to_vec(),
        |indices| {
            Expr::add(a.call(indices.to_vec()), b.call(indices.to_vec()))
        },
        "add",
        "elemwise",
    )
}
