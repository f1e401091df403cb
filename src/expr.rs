//! The scalar expression IR.
//!
//! Expressions form an immutable tree shared through [`Arc`]: every
//! constructor produces a new node and never mutates its operands, so
//! subtrees can be freely referenced from many places (the reverse-mode
//! driver relies on this). The set of expression kinds is closed and
//! dispatched by pattern matching.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use crate::dtype::DType;
use crate::reduction::{Combiner, IterVar};
use crate::tensor::Tensor;

thread_local! {
    static NEXT_VAR_ID: Cell<usize> = const { Cell::new(0) };
}

/// Generates a unique id for each [`Var`].
fn next_var_id() -> usize {
    NEXT_VAR_ID.with(|cell| {
        let id = cell.get();
        cell.set(id + 1);
        id
    })
}

pub type VarId = usize;

/// A scalar variable.
///
/// Variables have identity: two variables are the same variable iff their
/// ids are equal, regardless of their names. Cloning a `Var` preserves its
/// identity; [`Var::copy_with_suffix`] mints a fresh one.
#[derive(Debug, Clone)]
pub struct Var {
    pub id: VarId,
    pub name: String,
    pub dtype: DType,
}

impl Var {
    pub fn new(name: &str, dtype: DType) -> Self {
        Self {
            id: next_var_id(),
            name: name.to_string(),
            dtype,
        }
    }

    /// Returns a fresh variable named `self.name + suffix`.
    pub fn copy_with_suffix(&self, suffix: &str) -> Self {
        Self::new(&format!("{}{}", self.name, suffix), self.dtype)
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Var {}

impl std::hash::Hash for Var {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// How a [`ExprKind::Call`] is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// A read of one element of another tensor; `tensor` is the producer.
    Halide,
    /// A pure scalar intrinsic such as `exp` or `log`.
    PureIntrinsic,
}

/// The closed set of expression kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Var(Var),
    IntImm(i64),
    UIntImm(u64),
    FloatImm(f64),
    StringImm(String),
    Cast(Expr),
    Add(Expr, Expr),
    Sub(Expr, Expr),
    Mul(Expr, Expr),
    Div(Expr, Expr),
    Mod(Expr, Expr),
    Min(Expr, Expr),
    Max(Expr, Expr),
    Eq(Expr, Expr),
    Ne(Expr, Expr),
    Lt(Expr, Expr),
    Le(Expr, Expr),
    Gt(Expr, Expr),
    Ge(Expr, Expr),
    And(Expr, Expr),
    Or(Expr, Expr),
    Not(Expr),
    Select {
        condition: Expr,
        true_value: Expr,
        false_value: Expr,
    },
    Call {
        call_kind: CallKind,
        name: String,
        args: Vec<Expr>,
        tensor: Option<Tensor>,
        value_index: usize,
    },
    Reduce {
        combiner: Combiner,
        source: Vec<Expr>,
        axis: Vec<IterVar>,
        condition: Expr,
        value_index: usize,
    },
    Ramp {
        base: Expr,
        stride: Expr,
        lanes: u16,
    },
    Broadcast {
        value: Expr,
        lanes: u16,
    },
    Let {
        var: Var,
        value: Expr,
        body: Expr,
    },
    Load {
        buffer_var: Var,
        index: Expr,
        predicate: Expr,
    },
    Shuffle {
        vectors: Vec<Expr>,
        indices: Vec<Expr>,
    },
}

impl ExprKind {
    /// The node-kind name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ExprKind::Var(_) => "Var",
            ExprKind::IntImm(_) => "IntImm",
            ExprKind::UIntImm(_) => "UIntImm",
            ExprKind::FloatImm(_) => "FloatImm",
            ExprKind::StringImm(_) => "StringImm",
            ExprKind::Cast(_) => "Cast",
            ExprKind::Add(..) => "Add",
            ExprKind::Sub(..) => "Sub",
            ExprKind::Mul(..) => "Mul",
            ExprKind::Div(..) => "Div",
            ExprKind::Mod(..) => "Mod",
            ExprKind::Min(..) => "Min",
            ExprKind::Max(..) => "Max",
            ExprKind::Eq(..) => "EQ",
            ExprKind::Ne(..) => "NE",
            ExprKind::Lt(..) => "LT",
            ExprKind::Le(..) => "LE",
            ExprKind::Gt(..) => "GT",
            ExprKind::Ge(..) => "GE",
            ExprKind::And(..) => "And",
            ExprKind::Or(..) => "Or",
            ExprKind::Not(_) => "Not",
            ExprKind::Select { .. } => "Select",
            ExprKind::Call { .. } => "Call",
            ExprKind::Reduce { .. } => "Reduce",
            ExprKind::Ramp { .. } => "Ramp",
            ExprKind::Broadcast { .. } => "Broadcast",
            ExprKind::Let { .. } => "Let",
            ExprKind::Load { .. } => "Load",
            ExprKind::Shuffle { .. } => "Shuffle",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExprData {
    pub kind: ExprKind,
    pub dtype: DType,
}

/// A reference-counted, immutable scalar expression.
#[derive(Debug, Clone)]
pub struct Expr(Arc<ExprData>);

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl Expr {
    pub fn new(kind: ExprKind, dtype: DType) -> Self {
        Self(Arc::new(ExprData { kind, dtype }))
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    // --- Leaf constructors ---

    pub fn var(v: Var) -> Self {
        let dtype = v.dtype;
        Self::new(ExprKind::Var(v), dtype)
    }

    pub fn int(dtype: DType, value: i64) -> Self {
        debug_assert!(dtype.is_int());
        Self::new(ExprKind::IntImm(value), dtype)
    }

    pub fn uint(dtype: DType, value: u64) -> Self {
        debug_assert!(dtype.is_uint());
        Self::new(ExprKind::UIntImm(value), dtype)
    }

    pub fn float(dtype: DType, value: f64) -> Self {
        debug_assert!(dtype.is_float());
        Self::new(ExprKind::FloatImm(value), dtype)
    }

    pub fn string(value: &str) -> Self {
        Self::new(
            ExprKind::StringImm(value.to_string()),
            DType::new(crate::dtype::DTypeKind::Handle, 64, 1),
        )
    }

    /// A constant of the given type and value.
    pub fn make_const(dtype: DType, value: f64) -> Self {
        if dtype.is_float() {
            Self::float(dtype, value)
        } else if dtype.is_int() {
            Self::int(dtype, value as i64)
        } else {
            Self::uint(dtype, value as u64)
        }
    }

    /// The zero of the given type.
    pub fn make_zero(dtype: DType) -> Self {
        Self::make_const(dtype, 0.0)
    }

    pub fn const_true() -> Self {
        Self::uint(DType::u1(), 1)
    }

    pub fn const_false() -> Self {
        Self::uint(DType::u1(), 0)
    }

    // --- Arithmetic ---

    fn binary(
        make: fn(Expr, Expr) -> ExprKind,
        a: Expr,
        b: Expr,
    ) -> Self {
        assert_eq!(
            a.dtype(),
            b.dtype(),
            "operand type mismatch: {} vs {}",
            a.dtype(),
            b.dtype()
        );
        let dtype = a.dtype();
        Self::new(make(a, b), dtype)
    }

    pub fn add(a: Expr, b: Expr) -> Self {
        Self::binary(ExprKind::Add, a, b)
    }

    pub fn sub(a: Expr, b: Expr) -> Self {
        Self::binary(ExprKind::Sub, a, b)
    }

    pub fn mul(a: Expr, b: Expr) -> Self {
        Self::binary(ExprKind::Mul, a, b)
    }

    pub fn div(a: Expr, b: Expr) -> Self {
        Self::binary(ExprKind::Div, a, b)
    }

    pub fn rem(a: Expr, b: Expr) -> Self {
        Self::binary(ExprKind::Mod, a, b)
    }

    pub fn min(a: Expr, b: Expr) -> Self {
        Self::binary(ExprKind::Min, a, b)
    }

    pub fn max(a: Expr, b: Expr) -> Self {
        Self::binary(ExprKind::Max, a, b)
    }

    // --- Comparisons and logic (all produce `uint1`) ---

    fn compare(make: fn(Expr, Expr) -> ExprKind, a: Expr, b: Expr) -> Self {
        assert_eq!(
            a.dtype(),
            b.dtype(),
            "comparison type mismatch: {} vs {}",
            a.dtype(),
            b.dtype()
        );
        let lanes = a.dtype().lanes;
        Self::new(make(a, b), DType::u1().with_lanes(lanes))
    }

    pub fn eq(a: Expr, b: Expr) -> Self {
        Self::compare(ExprKind::Eq, a, b)
    }

    pub fn ne(a: Expr, b: Expr) -> Self {
        Self::compare(ExprKind::Ne, a, b)
    }

    pub fn lt(a: Expr, b: Expr) -> Self {
        Self::compare(ExprKind::Lt, a, b)
    }

    pub fn le(a: Expr, b: Expr) -> Self {
        Self::compare(ExprKind::Le, a, b)
    }

    pub fn gt(a: Expr, b: Expr) -> Self {
        Self::compare(ExprKind::Gt, a, b)
    }

    pub fn ge(a: Expr, b: Expr) -> Self {
        Self::compare(ExprKind::Ge, a, b)
    }

    pub fn and(a: Expr, b: Expr) -> Self {
        assert!(a.dtype().is_bool() && b.dtype().is_bool());
        Self::new(ExprKind::And(a, b), DType::u1())
    }

    pub fn or(a: Expr, b: Expr) -> Self {
        assert!(a.dtype().is_bool() && b.dtype().is_bool());
        Self::new(ExprKind::Or(a, b), DType::u1())
    }

    pub fn not(e: Expr) -> Self {
        assert!(e.dtype().is_bool());
        Self::new(ExprKind::Not(e), DType::u1())
    }

    // --- Structured nodes ---

    pub fn cast(dtype: DType, e: Expr) -> Self {
        Self::new(ExprKind::Cast(e), dtype)
    }

    pub fn select(condition: Expr, true_value: Expr, false_value: Expr) -> Self {
        assert!(condition.dtype().is_bool());
        assert_eq!(true_value.dtype(), false_value.dtype());
        let dtype = true_value.dtype();
        Self::new(
            ExprKind::Select {
                condition,
                true_value,
                false_value,
            },
            dtype,
        )
    }

    pub fn call(
        call_kind: CallKind,
        name: &str,
        args: Vec<Expr>,
        tensor: Option<Tensor>,
        value_index: usize,
        dtype: DType,
    ) -> Self {
        Self::new(
            ExprKind::Call {
                call_kind,
                name: name.to_string(),
                args,
                tensor,
                value_index,
            },
            dtype,
        )
    }

    fn intrinsic(name: &str, arg: Expr) -> Self {
        let dtype = arg.dtype();
        Self::call(CallKind::PureIntrinsic, name, vec![arg], None, 0, dtype)
    }

    pub fn exp(arg: Expr) -> Self {
        Self::intrinsic("exp", arg)
    }

    pub fn log(arg: Expr) -> Self {
        Self::intrinsic("log", arg)
    }

    pub fn sigmoid(arg: Expr) -> Self {
        Self::intrinsic("sigmoid", arg)
    }

    pub fn tanh(arg: Expr) -> Self {
        Self::intrinsic("tanh", arg)
    }

    pub fn fabs(arg: Expr) -> Self {
        Self::intrinsic("fabs", arg)
    }

    pub fn reduce(
        combiner: Combiner,
        source: Vec<Expr>,
        axis: Vec<IterVar>,
        condition: Expr,
        value_index: usize,
    ) -> Self {
        assert_eq!(combiner.arity(), source.len());
        assert!(value_index < source.len());
        let dtype = source[value_index].dtype();
        Self::new(
            ExprKind::Reduce {
                combiner,
                source,
                axis,
                condition,
                value_index,
            },
            dtype,
        )
    }

    pub fn ramp(base: Expr, stride: Expr, lanes: u16) -> Self {
        let dtype = base.dtype().with_lanes(lanes);
        Self::new(ExprKind::Ramp { base, stride, lanes }, dtype)
    }

    pub fn broadcast(value: Expr, lanes: u16) -> Self {
        let dtype = value.dtype().with_lanes(lanes);
        Self::new(ExprKind::Broadcast { value, lanes }, dtype)
    }

    pub fn let_(var: Var, value: Expr, body: Expr) -> Self {
        let dtype = body.dtype();
        Self::new(ExprKind::Let { var, value, body }, dtype)
    }

    pub fn load(dtype: DType, buffer_var: Var, index: Expr, predicate: Expr) -> Self {
        Self::new(
            ExprKind::Load {
                buffer_var,
                index,
                predicate,
            },
            dtype,
        )
    }

    // --- Constant inspection ---

    pub fn as_int_imm(&self) -> Option<i64> {
        match self.kind() {
            ExprKind::IntImm(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint_imm(&self) -> Option<u64> {
        match self.kind() {
            ExprKind::UIntImm(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float_imm(&self) -> Option<f64> {
        match self.kind() {
            ExprKind::FloatImm(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_const_zero(&self) -> bool {
        match self.kind() {
            ExprKind::IntImm(v) => *v == 0,
            ExprKind::UIntImm(v) => *v == 0,
            ExprKind::FloatImm(v) => *v == 0.0,
            _ => false,
        }
    }

    pub fn is_const_one(&self) -> bool {
        match self.kind() {
            ExprKind::IntImm(v) => *v == 1,
            ExprKind::UIntImm(v) => *v == 1,
            ExprKind::FloatImm(v) => *v == 1.0,
            _ => false,
        }
    }

    /// `Some(b)` if this is a boolean constant.
    pub fn const_bool_value(&self) -> Option<bool> {
        if !self.dtype().is_bool() {
            return None;
        }
        self.as_uint_imm().map(|v| v != 0)
    }

    /// Rebuilds this node with every direct child expression mapped through
    /// `f`. Leaves are returned unchanged. Recursion is the caller's
    /// business; this only touches one level.
    pub fn map_children(&self, f: &mut impl FnMut(&Expr) -> Expr) -> Expr {
        let dtype = self.dtype();
        let kind = match self.kind() {
            ExprKind::Var(_)
            | ExprKind::IntImm(_)
            | ExprKind::UIntImm(_)
            | ExprKind::FloatImm(_)
            | ExprKind::StringImm(_) => return self.clone(),
            ExprKind::Cast(e) => ExprKind::Cast(f(e)),
            ExprKind::Add(a, b) => ExprKind::Add(f(a), f(b)),
            ExprKind::Sub(a, b) => ExprKind::Sub(f(a), f(b)),
            ExprKind::Mul(a, b) => ExprKind::Mul(f(a), f(b)),
            ExprKind::Div(a, b) => ExprKind::Div(f(a), f(b)),
            ExprKind::Mod(a, b) => ExprKind::Mod(f(a), f(b)),
            ExprKind::Min(a, b) => ExprKind::Min(f(a), f(b)),
            ExprKind::Max(a, b) => ExprKind::Max(f(a), f(b)),
            ExprKind::Eq(a, b) => ExprKind::Eq(f(a), f(b)),
            ExprKind::Ne(a, b) => ExprKind::Ne(f(a), f(b)),
            ExprKind::Lt(a, b) => ExprKind::Lt(f(a), f(b)),
            ExprKind::Le(a, b) => ExprKind::Le(f(a), f(b)),
            ExprKind::Gt(a, b) => ExprKind::Gt(f(a), f(b)),
            ExprKind::Ge(a, b) => ExprKind::Ge(f(a), f(b)),
            ExprKind::And(a, b) => ExprKind::And(f(a), f(b)),
            ExprKind::Or(a, b) => ExprKind::Or(f(a), f(b)),
            ExprKind::Not(e) => ExprKind::Not(f(e)),
            ExprKind::Select {
                condition,
                true_value,
                false_value,
            } => ExprKind::Select {
                condition: f(condition),
                true_value: f(true_value),
                false_value: f(false_value),
            },
            ExprKind::Call {
                call_kind,
                name,
                args,
                tensor,
                value_index,
            } => ExprKind::Call {
                call_kind: *call_kind,
                name: name.clone(),
                args: args.iter().map(&mut *f).collect(),
                tensor: tensor.clone(),
                value_index: *value_index,
            },
            ExprKind::Reduce {
                combiner,
                source,
                axis,
                condition,
                value_index,
            } => ExprKind::Reduce {
                combiner: combiner.map_exprs(f),
                source: source.iter().map(&mut *f).collect(),
                axis: axis
                    .iter()
                    .map(|iv| iv.map_range(&mut *f))
                    .collect(),
                condition: f(condition),
                value_index: *value_index,
            },
            ExprKind::Ramp { base, stride, lanes } => ExprKind::Ramp {
                base: f(base),
                stride: f(stride),
                lanes: *lanes,
            },
            ExprKind::Broadcast { value, lanes } => ExprKind::Broadcast {
                value: f(value),
                lanes: *lanes,
            },
            ExprKind::Let { var, value, body } => ExprKind::Let {
                var: var.clone(),
                value: f(value),
                body: f(body),
            },
            ExprKind::Load {
                buffer_var,
                index,
                predicate,
            } => ExprKind::Load {
                buffer_var: buffer_var.clone(),
                index: f(index),
                predicate: f(predicate),
            },
            ExprKind::Shuffle { vectors, indices } => ExprKind::Shuffle {
                vectors: vectors.iter().map(&mut *f).collect(),
                indices: indices.iter().map(&mut *f).collect(),
            },
        };
        Expr::new(kind, dtype)
    }

    /// Visits every direct child expression.
    pub fn for_each_child(&self, f: &mut impl FnMut(&Expr)) {
        match self.kind() {
            ExprKind::Var(_)
            | ExprKind::IntImm(_)
            | ExprKind::UIntImm(_)
            | ExprKind::FloatImm(_)
            | ExprKind::StringImm(_) => {}
            ExprKind::Cast(e) | ExprKind::Not(e) => f(e),
            ExprKind::Add(a, b)
            | ExprKind::Sub(a, b)
            | ExprKind::Mul(a, b)
            | ExprKind::Div(a, b)
            | ExprKind::Mod(a, b)
            | ExprKind::Min(a, b)
            | ExprKind::Max(a, b)
            | ExprKind::Eq(a, b)
            | ExprKind::Ne(a, b)
            | ExprKind::Lt(a, b)
            | ExprKind::Le(a, b)
            | ExprKind::Gt(a, b)
            | ExprKind::Ge(a, b)
            | ExprKind::And(a, b)
            | ExprKind::Or(a, b) => {
                f(a);
                f(b);
            }
            ExprKind::Select {
                condition,
                true_value,
                false_value,
            } => {
                f(condition);
                f(true_value);
                f(false_value);
            }
            ExprKind::Call { args, .. } => args.iter().for_each(f),
            ExprKind::Reduce {
                combiner,
                source,
                axis,
                condition,
                ..
            } => {
                combiner.result.iter().for_each(&mut *f);
                combiner.identity.iter().for_each(&mut *f);
                source.iter().for_each(&mut *f);
                for iv in axis {
                    f(&iv.range.min);
                    f(&iv.range.extent);
                }
                f(condition);
            }
            ExprKind::Ramp { base, stride, .. } => {
                f(base);
                f(stride);
            }
            ExprKind::Broadcast { value, .. } => f(value),
            ExprKind::Let { value, body, .. } => {
                f(value);
                f(body);
            }
            ExprKind::Load {
                index, predicate, ..
            } => {
                f(index);
                f(predicate);
            }
            ExprKind::Shuffle { vectors, indices } => {
                vectors.iter().for_each(&mut *f);
                indices.iter().for_each(f);
            }
        }
    }
}

// --- Literal conversions ---

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::int(DType::i32(), v as i64)
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::int(DType::i64(), v)
    }
}

impl From<f32> for Expr {
    fn from(v: f32) -> Self {
        Expr::float(DType::f32(), v as f64)
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::float(DType::f64(), v)
    }
}

impl From<bool> for Expr {
    fn from(v: bool) -> Self {
        Expr::uint(DType::u1(), v as u64)
    }
}

impl From<Var> for Expr {
    fn from(v: Var) -> Self {
        Expr::var(v)
    }
}

// --- Operator overloads ---

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $ctor:ident) => {
        impl std::ops::$trait for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::$ctor(self, rhs)
            }
        }

        impl std::ops::$trait for &Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::$ctor(self.clone(), rhs.clone())
            }
        }
    };
}

impl_binop!(Add, add, add);
impl_binop!(Sub, sub, sub);
impl_binop!(Mul, mul, mul);
impl_binop!(Div, div, div);
impl_binop!(Rem, rem, rem);

// --- Printing ---

fn join(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ExprKind::Var(v) => write!(f, "{v}"),
            ExprKind::IntImm(v) => write!(f, "{v}"),
            ExprKind::UIntImm(v) => {
                if self.dtype().is_bool() {
                    write!(f, "(bool){v}")
                } else {
                    write!(f, "{v}")
                }
            }
            ExprKind::FloatImm(v) => write!(f, "{v}f"),
            ExprKind::StringImm(s) => write!(f, "{s:?}"),
            ExprKind::Cast(e) => write!(f, "{}({e})", self.dtype()),
            ExprKind::Add(a, b) => write!(f, "({a} + {b})"),
            ExprKind::Sub(a, b) => write!(f, "({a} - {b})"),
            ExprKind::Mul(a, b) => write!(f, "({a}*{b})"),
            ExprKind::Div(a, b) => write!(f, "({a}/{b})"),
            ExprKind::Mod(a, b) => write!(f, "({a} % {b})"),
            ExprKind::Min(a, b) => write!(f, "min({a}, {b})"),
            ExprKind::Max(a, b) => write!(f, "max({a}, {b})"),
            ExprKind::Eq(a, b) => write!(f, "({a} == {b})"),
            ExprKind::Ne(a, b) => write!(f, "({a} != {b})"),
            ExprKind::Lt(a, b) => write!(f, "({a} < {b})"),
            ExprKind::Le(a, b) => write!(f, "({a} <= {b})"),
            ExprKind::Gt(a, b) => write!(f, "({a} > {b})"),
            ExprKind::Ge(a, b) => write!(f, "({a} >= {b})"),
            ExprKind::And(a, b) => write!(f, "({a} && {b})"),
            ExprKind::Or(a, b) => write!(f, "({a} || {b})"),
            ExprKind::Not(e) => write!(f, "!{e}"),
            ExprKind::Select {
                condition,
                true_value,
                false_value,
            } => write!(f, "select({condition}, {true_value}, {false_value})"),
            ExprKind::Call { name, args, .. } => {
                write!(f, "{name}(")?;
                join(f, args)?;
                write!(f, ")")
            }
            ExprKind::Reduce {
                combiner,
                source,
                axis,
                condition,
                value_index,
            } => {
                write!(f, "reduce(combiner={combiner}, source=[")?;
                join(f, source)?;
                write!(f, "], axis=[")?;
                for (i, iv) in axis.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{iv}")?;
                }
                write!(f, "], where={condition}, value_index={value_index})")
            }
            ExprKind::Ramp { base, stride, lanes } => {
                write!(f, "ramp({base}, {stride}, {lanes})")
            }
            ExprKind::Broadcast { value, lanes } => {
                write!(f, "broadcast({value}, {lanes})")
            }
            ExprKind::Let { var, value, body } => {
                write!(f, "(let {var} = {value} in {body})")
            }
            ExprKind::Load {
                buffer_var, index, ..
            } => write!(f, "load({buffer_var}, {index})"),
            ExprKind::Shuffle { vectors, indices } => {
                write!(f, "shuffle([")?;
                join(f, vectors)?;
                write!(f, "], [")?;
                join(f, indices)?;
                write!(f, "])")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_identity() {
        let x = Var::new("x", DType::f32());
        let y = Var::new("x", DType::f32());
        assert_ne!(x, y);
        assert_eq!(x, x.clone());

        let z = x.copy_with_suffix(".der");
        assert_eq!(z.name, "x.der");
        assert_ne!(z, x);
    }

    #[test]
    fn test_binary_dtype() {
        let x = Expr::var(Var::new("x", DType::f32()));
        let y = Expr::var(Var::new("y", DType::f32()));
        assert_eq!(Expr::add(x.clone(), y.clone()).dtype(), DType::f32());
        assert_eq!(Expr::lt(x, y).dtype(), DType::u1());
    }

    #[test]
    fn test_display() {
        let x = Expr::var(Var::new("x", DType::f32()));
        let e = Expr::mul(Expr::add(x.clone(), Expr::from(2.0f32)), x);
        assert_eq!(e.to_string(), "((x + 2f)*x)");
    }

    #[test]
    fn test_structural_equality() {
        let v = Var::new("x", DType::f32());
        let a = Expr::add(Expr::var(v.clone()), Expr::from(1.0f32));
        let b = Expr::add(Expr::var(v), Expr::from(1.0f32));
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic]
    fn test_mixed_dtype_panics() {
        let x = Expr::var(Var::new("x", DType::f32()));
        let i = Expr::from(1i32);
        let _ = Expr::add(x, i);
    }
}
