//! Iteration ranges, iteration variables and reduction combiners.

use std::fmt;

use crate::dtype::DType;
use crate::expr::{Expr, Var};

/// A half-open iteration range `[min, min + extent)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub min: Expr,
    pub extent: Expr,
}

impl Range {
    pub fn new(min: Expr, extent: Expr) -> Self {
        Self { min, extent }
    }

    /// The range `[0, extent)`.
    pub fn from_extent(extent: Expr) -> Self {
        let zero = Expr::make_zero(extent.dtype());
        Self::new(zero, extent)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "range({}, {})", self.min, self.extent)
    }
}

/// How an [`IterVar`] iterates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterVarKind {
    /// A parallelizable data axis.
    DataPar,
    /// A commutative reduction axis.
    CommReduce,
}

/// A variable bound to an iteration range.
#[derive(Debug, Clone, PartialEq)]
pub struct IterVar {
    pub var: Var,
    pub range: Range,
    pub kind: IterVarKind,
}

impl IterVar {
    pub fn new(var: Var, range: Range, kind: IterVarKind) -> Self {
        Self { var, range, kind }
    }

    pub fn data(var: Var, range: Range) -> Self {
        Self::new(var, range, IterVarKind::DataPar)
    }

    pub fn reduce(var: Var, range: Range) -> Self {
        Self::new(var, range, IterVarKind::CommReduce)
    }

    /// Rebuilds this itervar with its range expressions mapped through `f`.
    pub fn map_range(&self, f: &mut impl FnMut(&Expr) -> Expr) -> Self {
        Self {
            var: self.var.clone(),
            range: Range::new(f(&self.range.min), f(&self.range.extent)),
            kind: self.kind,
        }
    }
}

impl fmt::Display for IterVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.var, self.range)
    }
}

/// An associative commutative n-ary fold specification.
///
/// `result[i]` combines the bound variables `lhs` (the accumulator tuple)
/// and `rhs` (the incoming tuple); `identity[i]` seeds the accumulator.
/// All four lists have the same length, the combiner's *arity*.
#[derive(Debug, Clone, PartialEq)]
pub struct Combiner {
    pub lhs: Vec<Var>,
    pub rhs: Vec<Var>,
    pub result: Vec<Expr>,
    pub identity: Vec<Expr>,
}

impl Combiner {
    pub fn new(lhs: Vec<Var>, rhs: Vec<Var>, result: Vec<Expr>, identity: Vec<Expr>) -> Self {
        assert_eq!(lhs.len(), rhs.len());
        assert_eq!(lhs.len(), result.len());
        assert_eq!(lhs.len(), identity.len());
        Self {
            lhs,
            rhs,
            result,
            identity,
        }
    }

    pub fn arity(&self) -> usize {
        self.result.len()
    }

    /// The stock `(x, y) -> x + y` combiner with identity `0`.
    pub fn sum(dtype: DType) -> Self {
        let x = Var::new("x", dtype);
        let y = Var::new("y", dtype);
        let result = Expr::add(Expr::var(x.clone()), Expr::var(y.clone()));
        Self::new(vec![x], vec![y], vec![result], vec![Expr::make_zero(dtype)])
    }

    /// `true` if this is a one-output sum combiner.
    pub fn is_sum(&self) -> bool {
        if self.arity() != 1 || !self.identity[0].is_const_zero() {
            return false;
        }
        match self.result[0].kind() {
            crate::expr::ExprKind::Add(a, b) => {
                let is = |e: &Expr, v: &Var| {
                    matches!(e.kind(), crate::expr::ExprKind::Var(u) if u == v)
                };
                (is(a, &self.lhs[0]) && is(b, &self.rhs[0]))
                    || (is(a, &self.rhs[0]) && is(b, &self.lhs[0]))
            }
            _ => false,
        }
    }

    /// Rebuilds the combiner with its result and identity expressions
    /// mapped through `f`. The bound variables are left untouched.
    pub fn map_exprs(&self, f: &mut impl FnMut(&Expr) -> Expr) -> Self {
        Self {
            lhs: self.lhs.clone(),
            rhs: self.rhs.clone(),
            result: self.result.iter().map(&mut *f).collect(),
            identity: self.identity.iter().map(f).collect(),
        }
    }
}

impl fmt::Display for Combiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
            for (i, e) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{e}")?;
            }
            Ok(())
        }
        fn vars(f: &mut fmt::Formatter<'_>, items: &[Var]) -> fmt::Result {
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{v}")?;
            }
            Ok(())
        }
        write!(f, "comm_reducer(result=[")?;
        list(f, &self.result)?;
        write!(f, "], lhs=[")?;
        vars(f, &self.lhs)?;
        write!(f, "], rhs=[")?;
        vars(f, &self.rhs)?;
        write!(f, "], identity=[")?;
        list(f, &self.identity)?;
        write!(f, "])")
    }
}

/// Builds a one-output sum reduction over `axis`.
pub fn sum(source: Expr, axis: Vec<IterVar>) -> Expr {
    let combiner = Combiner::sum(source.dtype());
    Expr::reduce(combiner, vec![source], axis, Expr::const_true(), 0)
}
