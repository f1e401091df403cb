//! Symbolic differentiation of scalar expressions and tensor bodies.
//!
//! The scalar differentiator walks the expression tree and emits a
//! derivative expression for every node kind. The only genuinely hard
//! case is `Reduce`: a reduction may use an arbitrary combiner, so its
//! derivative is computed by *pairing* the combiner. The paired combiner
//! carries a derivative component alongside every value component, and the
//! chain rule is applied symbolically to the combiner's own result
//! expressions. The resulting reduction returns a tuple of derivatives
//! followed by the original values (in exactly this order).

use log::trace;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::expr::{CallKind, Expr, ExprKind, Var};
use crate::reduction::{Combiner, IterVar, Range};
use crate::simplify::simplify;
use crate::tensor::{Operation, Tensor};
use crate::transform::{clone_reduction, simplify_combiner, substitute};
use crate::optimize::lift_nonzeroness_conditions;

/// What a scalar expression is being differentiated with respect to.
enum Wrt<'a> {
    /// An element `input[indices]`, matched by producer identity.
    Element {
        input: &'a Tensor,
        indices: &'a [Expr],
    },
    /// A free scalar variable.
    Variable(&'a Var),
}

struct Differentiator<'a> {
    wrt: Wrt<'a>,
}

impl Differentiator<'_> {
    fn diff(&self, e: &Expr) -> Result<Expr> {
        let dtype = e.dtype();
        match e.kind() {
            ExprKind::Var(v) => Ok(match &self.wrt {
                Wrt::Variable(u) if v == *u => Expr::make_const(dtype, 1.0),
                _ => Expr::make_zero(dtype),
            }),
            ExprKind::IntImm(_) | ExprKind::UIntImm(_) | ExprKind::FloatImm(_) => {
                Ok(Expr::make_zero(dtype))
            }
            ExprKind::Call {
                call_kind: CallKind::Halide,
                args,
                tensor,
                value_index,
                ..
            } => Ok(self.diff_tensor_read(e, args, tensor.as_ref(), *value_index)),
            ExprKind::Call {
                call_kind: CallKind::PureIntrinsic,
                name,
                args,
                ..
            } => self.diff_intrinsic(e, name, args),
            ExprKind::Add(a, b) => Ok(Expr::add(self.diff(a)?, self.diff(b)?)),
            ExprKind::Sub(a, b) => Ok(Expr::sub(self.diff(a)?, self.diff(b)?)),
            ExprKind::Mul(a, b) => Ok(Expr::add(
                Expr::mul(self.diff(a)?, b.clone()),
                Expr::mul(a.clone(), self.diff(b)?),
            )),
            ExprKind::Div(a, b) => Ok(Expr::div(
                Expr::sub(
                    Expr::mul(self.diff(a)?, b.clone()),
                    Expr::mul(a.clone(), self.diff(b)?),
                ),
                Expr::mul(b.clone(), b.clone()),
            )),
            ExprKind::Min(a, b) => Ok(Expr::select(
                Expr::le(a.clone(), b.clone()),
                self.diff(a)?,
                self.diff(b)?,
            )),
            ExprKind::Max(a, b) => Ok(Expr::select(
                Expr::ge(a.clone(), b.clone()),
                self.diff(a)?,
                self.diff(b)?,
            )),
            ExprKind::Select {
                condition,
                true_value,
                false_value,
            } => Ok(Expr::select(
                condition.clone(),
                self.diff(true_value)?,
                self.diff(false_value)?,
            )),
            ExprKind::Cast(inner) => {
                if dtype.is_float() {
                    Ok(Expr::cast(dtype, self.diff(inner)?))
                } else {
                    Ok(Expr::make_zero(dtype))
                }
            }
            ExprKind::Reduce { .. } => self.diff_reduce(e),
            kind => Err(Error::UnsupportedNode { kind: kind.name() }),
        }
    }

    /// A tensor read differentiates to an indicator: `1` exactly when the
    /// read indices equal the differentiation indices and the producer is
    /// the input tensor, `0` otherwise.
    fn diff_tensor_read(
        &self,
        e: &Expr,
        args: &[Expr],
        tensor: Option<&Tensor>,
        value_index: usize,
    ) -> Expr {
        let Wrt::Element { input, indices } = &self.wrt else {
            return Expr::make_zero(e.dtype());
        };
        let same = tensor
            .map(|t| t.op().same_as(input.op()) && value_index == input.value_index())
            .unwrap_or(false);
        if !same {
            return Expr::make_zero(e.dtype());
        }
        let mut condition = Expr::const_true();
        for (arg, index) in args.iter().zip(indices.iter()) {
            condition = Expr::and(condition, Expr::eq(index.clone(), arg.clone()));
        }
        Expr::cast(e.dtype(), condition)
    }

    fn diff_intrinsic(&self, e: &Expr, name: &str, args: &[Expr]) -> Result<Expr> {
        let x = &args[0];
        let one = Expr::make_const(e.dtype(), 1.0);
        match name {
            "exp" => Ok(Expr::mul(self.diff(x)?, e.clone())),
            "log" => Ok(Expr::div(self.diff(x)?, x.clone())),
            "sigmoid" => Ok(Expr::mul(
                self.diff(x)?,
                Expr::mul(e.clone(), Expr::sub(one, e.clone())),
            )),
            "tanh" => Ok(Expr::mul(
                self.diff(x)?,
                Expr::sub(one, Expr::mul(e.clone(), e.clone())),
            )),
            "fabs" => {
                let dtype = x.dtype();
                Ok(Expr::mul(
                    self.diff(x)?,
                    Expr::select(
                        Expr::ge(x.clone(), Expr::make_zero(dtype)),
                        Expr::make_const(dtype, 1.0),
                        Expr::make_const(dtype, -1.0),
                    ),
                ))
            }
            _ => Err(Error::UnsupportedIntrinsic {
                name: name.to_string(),
            }),
        }
    }

    /// Differentiates a reduction by pairing its combiner.
    ///
    /// The reduction axes are cloned first so the derivative can coexist
    /// with the original expression. The paired combiner's lhs and rhs
    /// are the derivative variables (suffixed `.der`) followed by the
    /// original variables; each derivative result applies the chain rule
    /// through the combiner's own result expression, and the original
    /// results and identities are appended unchanged so value components
    /// remain available to the derivative components that need them.
    fn diff_reduce(&self, e: &Expr) -> Result<Expr> {
        let cloned = clone_reduction(e);
        let ExprKind::Reduce {
            combiner,
            source,
            axis,
            condition,
            value_index,
        } = cloned.kind()
        else {
            unreachable!("clone_reduction preserves the node kind");
        };

        let arity = combiner.arity();
        let mut new_lhs: Vec<Var> = combiner
            .lhs
            .iter()
            .map(|v| v.copy_with_suffix(".der"))
            .collect();
        new_lhs.extend(combiner.lhs.iter().cloned());
        let mut new_rhs: Vec<Var> = combiner
            .rhs
            .iter()
            .map(|v| v.copy_with_suffix(".der"))
            .collect();
        new_rhs.extend(combiner.rhs.iter().cloned());

        // Derivative results: chain rule through the combiner itself, with
        // the combiner's bound variables treated as free scalars.
        let mut new_result = Vec::with_capacity(2 * arity);
        for res in &combiner.result {
            let mut acc = Expr::make_zero(res.dtype());
            for (i, lhs_var) in combiner.lhs.iter().enumerate() {
                let partial = derivative(res, lhs_var)?;
                acc = Expr::add(acc, Expr::mul(Expr::var(new_lhs[i].clone()), partial));
            }
            for (i, rhs_var) in combiner.rhs.iter().enumerate() {
                let partial = derivative(res, rhs_var)?;
                acc = Expr::add(acc, Expr::mul(Expr::var(new_rhs[i].clone()), partial));
            }
            new_result.push(acc);
        }
        new_result.extend(combiner.result.iter().cloned());

        let mut new_identity = Vec::with_capacity(2 * arity);
        for id in &combiner.identity {
            new_identity.push(self.diff(id)?);
        }
        new_identity.extend(combiner.identity.iter().cloned());

        let mut new_source = Vec::with_capacity(2 * arity);
        for src in source {
            new_source.push(self.diff(src)?);
        }
        new_source.extend(source.iter().cloned());

        let paired = Expr::reduce(
            Combiner::new(new_lhs, new_rhs, new_result, new_identity),
            new_source,
            axis.clone(),
            condition.clone(),
            *value_index,
        );
        // Drop value components the derivatives never read.
        Ok(simplify_combiner(&paired))
    }
}

/// Differentiates `expr` with respect to the element `input[indices]`.
///
/// The result has the same type as `expr`. Integer and boolean nodes
/// differentiate to exact zero of their declared type; node kinds with no
/// derivative rule fail.
pub fn jacobian_expr(expr: &Expr, input: &Tensor, indices: &[Expr]) -> Result<Expr> {
    Differentiator {
        wrt: Wrt::Element { input, indices },
    }
    .diff(expr)
}

/// Differentiates `expr` with respect to the variable `var`.
///
/// Every other variable is treated as a free constant. Conditions of
/// `Select` (and of the comparisons produced by `Min`/`Max`) are carried
/// into the derivative unchanged and are never differentiated through.
pub fn derivative(expr: &Expr, var: &Var) -> Result<Expr> {
    Differentiator {
        wrt: Wrt::Variable(var),
    }
    .diff(expr)
}

/// Computes the symbolic Jacobian of `output` with respect to `input` as a
/// tensor of shape `output.shape ++ input.shape`.
///
/// `output` must be produced by a compute op. When `optimize` is set, the
/// result is run through nonzeroness-condition lifting to collapse the
/// indicator-masked sums the differentiation produces.
pub fn jacobian(output: &Tensor, input: &Tensor, optimize: bool) -> Result<Tensor> {
    let Some(op) = output.op().as_compute() else {
        return Err(Error::UnsupportedOp {
            op: output.op().name().to_string(),
        });
    };
    trace!(
        "jacobian of '{}' wrt '{}'",
        output.name(),
        input.name()
    );

    // Clone the iteration axes so the Jacobian can be used together with
    // the original tensor.
    let mut new_axis = Vec::with_capacity(op.axis.len() + input.ndim());
    let mut vmap: FxHashMap<crate::expr::VarId, Expr> = FxHashMap::default();
    for iv in &op.axis {
        let new_var = iv.var.copy_with_suffix("");
        vmap.insert(iv.var.id, Expr::var(new_var.clone()));
        new_axis.push(IterVar::new(new_var, iv.range.clone(), iv.kind));
    }

    // Fresh iteration variables ranging over the input's shape.
    let mut input_indices = Vec::with_capacity(input.ndim());
    for (i, extent) in input.shape().iter().enumerate() {
        let iv = IterVar::data(
            Var::new(&format!("jac_i{i}"), extent.dtype()),
            Range::from_extent(extent.clone()),
        );
        input_indices.push(Expr::var(iv.var.clone()));
        new_axis.push(iv);
    }

    let body = substitute(&op.body[output.value_index()], &vmap);
    let new_body = simplify(&jacobian_expr(&body, input, &input_indices)?);

    // A reduction may return a tuple; the op then needs one body per
    // component, all sharing the combiner.
    let (new_bodies, value_index) = match new_body.kind() {
        ExprKind::Reduce {
            combiner,
            source,
            axis,
            condition,
            value_index,
        } => {
            let bodies = (0..source.len())
                .map(|i| {
                    Expr::reduce(
                        combiner.clone(),
                        source.clone(),
                        axis.clone(),
                        condition.clone(),
                        i,
                    )
                })
                .collect();
            (bodies, *value_index)
        }
        _ => (vec![new_body], 0),
    };

    let new_op = Operation::compute(
        &format!("{}.jacobian", output.op().name()),
        &op.tag,
        new_axis,
        new_bodies,
    );

    let mut new_shape = output.shape().to_vec();
    new_shape.extend(input.shape().iter().cloned());

    let mut tensor = Tensor::new(new_op, value_index, new_shape, output.dtype());
    if optimize {
        tensor = lift_nonzeroness_conditions(&tensor);
    }
    Ok(tensor)
}
