//! Zero-elimination passes over computed tensors.
//!
//! Gradient bodies are dominated by products of indicator factors
//! (`cast(uint1 -> float)` of index equalities) coming from differentiated
//! tensor reads. The passes here lift those indicators into `select`s,
//! move the conditions into reduction predicates, and collapse reduction
//! axes that are pinned by an equality, so a delta-masked sum turns back
//! into a direct read.

use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::expr::{Expr, ExprKind, VarId};
use crate::reduction::IterVar;
use crate::simplify::simplify;
use crate::tensor::{Operation, Tensor};
use crate::transform::{clone_reduction, substitute};

/// Rewrites the bodies of a computed tensor so that zero-producing
/// conditions become explicit and cheap: indicator factors turn into
/// `select`s, `select`s over zero migrate into reduction conditions, and
/// reduction axes fixed by an equality are eliminated. Non-compute
/// tensors are returned unchanged.
pub fn lift_nonzeroness_conditions(tensor: &Tensor) -> Tensor {
    let Some(op) = tensor.op().as_compute() else {
        return tensor.clone();
    };

    let new_bodies: Vec<Expr> = op
        .body
        .iter()
        .map(|body| simplify(&lift_body(body, &op.axis)))
        .collect();
    if new_bodies == op.body {
        return tensor.clone();
    }
    debug!("lifted nonzeroness conditions in '{}'", tensor.name());

    let new_op = Operation::compute(tensor.op().name(), &op.tag, op.axis.clone(), new_bodies);
    Tensor::new(
        new_op,
        tensor.value_index(),
        tensor.shape().to_vec(),
        tensor.dtype(),
    )
}

fn lift_body(body: &Expr, data_axis: &[IterVar]) -> Expr {
    let body = lift_zeros(body);
    match body.kind() {
        ExprKind::Reduce { combiner, .. } if combiner.is_sum() => {
            collapse_sum_reduce(&body, data_axis)
        }
        _ => body,
    }
}

/// Bottom-up rewrite normalizing zero-producing structure into
/// `select(cond, value, 0)` form: indicator casts become selects, selects
/// float out of products, nested and added zero-selects fuse.
fn lift_zeros(e: &Expr) -> Expr {
    let e = e.map_children(&mut |child| lift_zeros(child));
    let dtype = e.dtype();
    match e.kind() {
        // cast(uint1 cond) -> select(cond, 1, 0)
        ExprKind::Cast(inner) if inner.dtype().is_bool() && !dtype.is_bool() => Expr::select(
            inner.clone(),
            Expr::make_const(dtype, 1.0),
            Expr::make_zero(dtype),
        ),
        ExprKind::Mul(a, b) => {
            // e*select(cond, v, 0) in either position
            if let Some((cond, value)) = zero_select(b) {
                return lift_zeros(&Expr::select(
                    cond,
                    Expr::mul(a.clone(), value),
                    Expr::make_zero(dtype),
                ));
            }
            if let Some((cond, value)) = zero_select(a) {
                return lift_zeros(&Expr::select(
                    cond,
                    Expr::mul(value, b.clone()),
                    Expr::make_zero(dtype),
                ));
            }
            e
        }
        ExprKind::Add(a, b) => {
            // Selects guarded by the same condition add up inside it.
            if let (Some((ca, va)), Some((cb, vb))) = (zero_select(a), zero_select(b)) {
                if ca == cb {
                    return Expr::select(ca, Expr::add(va, vb), Expr::make_zero(dtype));
                }
            }
            e
        }
        ExprKind::Select {
            condition,
            true_value,
            false_value,
        } => {
            if false_value.is_const_zero() {
                // select(c1, select(c2, v, 0), 0) -> select(c1 && c2, v, 0)
                if let Some((inner_cond, value)) = zero_select(true_value) {
                    return Expr::select(
                        Expr::and(condition.clone(), inner_cond),
                        value,
                        false_value.clone(),
                    );
                }
                e
            } else if true_value.is_const_zero() {
                // Normalize the zero branch to the false position.
                lift_zeros(&Expr::select(
                    Expr::not(condition.clone()),
                    false_value.clone(),
                    true_value.clone(),
                ))
            } else {
                e
            }
        }
        _ => e,
    }
}

/// `Some((cond, value))` if `e` is `select(cond, value, 0)`.
fn zero_select(e: &Expr) -> Option<(Expr, Expr)> {
    match e.kind() {
        ExprKind::Select {
            condition,
            true_value,
            false_value,
        } if false_value.is_const_zero() => Some((condition.clone(), true_value.clone())),
        _ => None,
    }
}

fn conjoin(conds: Vec<Expr>) -> Expr {
    conds
        .into_iter()
        .reduce(Expr::and)
        .unwrap_or_else(Expr::const_true)
}

fn flatten_and(e: &Expr, out: &mut Vec<Expr>) {
    match e.kind() {
        ExprKind::And(a, b) => {
            flatten_and(a, out);
            flatten_and(b, out);
        }
        _ => {
            if e.const_bool_value() != Some(true) {
                out.push(e.clone());
            }
        }
    }
}

/// For a one-output sum reduction: moves a zero-select in the source into
/// the reduction condition, then eliminates every reduction axis pinned by
/// an equality conjunct, substituting the pinned value through the body.
/// When all axes are eliminated the reduction disappears entirely
/// (downstream passes reject reductions over an empty axis).
fn collapse_sum_reduce(body: &Expr, data_axis: &[IterVar]) -> Expr {
    let ExprKind::Reduce {
        combiner,
        source,
        axis,
        condition,
        value_index,
    } = body.kind()
    else {
        return body.clone();
    };

    let mut src = source[0].clone();
    let mut conjuncts = Vec::new();
    flatten_and(condition, &mut conjuncts);

    // Zero-selects wrapping the whole source move into the condition.
    while let Some((cond, value)) = zero_select(&src) {
        flatten_and(&cond, &mut conjuncts);
        src = value;
    }

    let mut remaining: Vec<IterVar> = axis.clone();

    // Repeatedly pin axes fixed by an equality conjunct.
    loop {
        let mut found = None;
        'scan: for (ci, conjunct) in conjuncts.iter().enumerate() {
            let ExprKind::Eq(a, b) = conjunct.kind() else {
                continue;
            };
            for (ai, iv) in remaining.iter().enumerate() {
                let pinned = if is_var(a, iv.var.id) && !references_var(b, iv.var.id) {
                    Some(b.clone())
                } else if is_var(b, iv.var.id) && !references_var(a, iv.var.id) {
                    Some(a.clone())
                } else {
                    None
                };
                if let Some(value) = pinned {
                    found = Some((ci, ai, value));
                    break 'scan;
                }
            }
        }
        let Some((ci, ai, value)) = found else { break };

        let iv = remaining.remove(ai);
        conjuncts.remove(ci);
        debug!("collapsing reduction axis '{}'", iv.var.name);

        let mut map = FxHashMap::default();
        map.insert(iv.var.id, value.clone());
        src = substitute(&src, &map);
        conjuncts = conjuncts.iter().map(|c| substitute(c, &map)).collect();

        if !in_range_by_construction(&value, &iv, data_axis) {
            conjuncts.push(Expr::ge(value.clone(), iv.range.min.clone()));
            conjuncts.push(Expr::lt(
                value,
                Expr::add(iv.range.min.clone(), iv.range.extent.clone()),
            ));
        }
    }

    let cond = simplify(&conjoin(conjuncts));
    if remaining.is_empty() {
        if cond.const_bool_value() == Some(true) {
            src
        } else {
            Expr::select(cond, src.clone(), Expr::make_zero(src.dtype()))
        }
    } else {
        Expr::reduce(
            combiner.clone(),
            vec![src],
            remaining,
            cond,
            *value_index,
        )
    }
}

fn is_var(e: &Expr, id: VarId) -> bool {
    matches!(e.kind(), ExprKind::Var(v) if v.id == id)
}

fn references_var(e: &Expr, id: VarId) -> bool {
    if is_var(e, id) {
        return true;
    }
    let mut found = false;
    e.for_each_child(&mut |child| {
        if !found && references_var(child, id) {
            found = true;
        }
    });
    found
}

/// `true` if `value` is itself an iteration variable of the surrounding
/// compute whose range equals the eliminated axis's range, so the pinned
/// index is in bounds by construction and no guard is needed.
fn in_range_by_construction(value: &Expr, axis: &IterVar, data_axis: &[IterVar]) -> bool {
    let ExprKind::Var(v) = value.kind() else {
        return false;
    };
    data_axis
        .iter()
        .any(|iv| iv.var.id == v.id && iv.range == axis.range)
}

/// Inlines reads of the given tensors into the body of `tensor`, but only
/// those whose body is not a reduction (inlining a reduction into another
/// body duplicates the reduction per use site).
pub fn inline_non_reductions(tensor: &Tensor, only: &[Tensor]) -> Tensor {
    let Some(op) = tensor.op().as_compute() else {
        return tensor.clone();
    };
    let only: FxHashSet<Tensor> = only.iter().cloned().collect();

    let new_bodies: Vec<Expr> = op
        .body
        .iter()
        .map(|body| simplify(&inline_calls(body, &only)))
        .collect();
    if new_bodies == op.body {
        return tensor.clone();
    }

    let new_op = Operation::compute(tensor.op().name(), &op.tag, op.axis.clone(), new_bodies);
    Tensor::new(
        new_op,
        tensor.value_index(),
        tensor.shape().to_vec(),
        tensor.dtype(),
    )
}

fn inline_calls(e: &Expr, only: &FxHashSet<Tensor>) -> Expr {
    let e = e.map_children(&mut |child| inline_calls(child, only));
    if let ExprKind::Call {
        tensor: Some(t),
        args,
        ..
    } = e.kind()
    {
        if only.contains(t) {
            if let Some(callee) = t.op().as_compute() {
                let body = &callee.body[t.value_index()];
                if !matches!(body.kind(), ExprKind::Reduce { .. }) {
                    let map: FxHashMap<VarId, Expr> = callee
                        .axis
                        .iter()
                        .zip(args)
                        .map(|(iv, arg)| (iv.var.id, arg.clone()))
                        .collect();
                    return inline_calls(&substitute(body, &map), only);
                }
            }
        }
    }
    e
}

/// If the tensor's body is exactly a read of another computed tensor,
/// splices the callee's body in (with fresh reduction axes when the callee
/// is a reduction).
pub fn inline_tail_call(tensor: &Tensor) -> Tensor {
    let Some(op) = tensor.op().as_compute() else {
        return tensor.clone();
    };
    if op.body.len() != 1 {
        return tensor.clone();
    }
    let ExprKind::Call {
        tensor: Some(callee),
        args,
        ..
    } = op.body[0].kind()
    else {
        return tensor.clone();
    };
    let Some(callee_op) = callee.op().as_compute() else {
        return tensor.clone();
    };

    debug!(
        "inlining tail call to '{}' into '{}'",
        callee.name(),
        tensor.name()
    );
    let map: FxHashMap<VarId, Expr> = callee_op
        .axis
        .iter()
        .zip(args)
        .map(|(iv, arg)| (iv.var.id, arg.clone()))
        .collect();
    let body = clone_reduction(&substitute(
        &callee_op.body[callee.value_index()],
        &map,
    ));

    let new_op = Operation::compute(tensor.op().name(), &op.tag, op.axis.clone(), vec![body]);
    Tensor::new(new_op, 0, tensor.shape().to_vec(), tensor.dtype())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::expr::Var;
    use crate::reduction::{sum, Range};
    use crate::tensor::{compute, placeholder};

    fn shape4() -> Vec<Expr> {
        vec![Expr::from(4i32)]
    }

    #[test]
    fn test_indicator_becomes_select() {
        let a = placeholder(shape4(), DType::f32(), "A");
        let t = compute(
            shape4(),
            |idx| {
                let cond = Expr::eq(idx[0].clone(), Expr::from(0i32));
                Expr::mul(Expr::cast(DType::f32(), cond), a.call(vec![idx[0].clone()]))
            },
            "T",
            "",
        );
        let lifted = lift_nonzeroness_conditions(&t);
        let body = &lifted.op().as_compute().unwrap().body[0];
        assert!(matches!(body.kind(), ExprKind::Select { .. }));
    }

    #[test]
    fn test_pinned_axis_collapses() {
        // T[i] = sum_k select(k == i, A[k], 0)  ->  T[i] = A[i]
        let a = placeholder(shape4(), DType::f32(), "A");
        let t = compute(
            shape4(),
            |idx| {
                let k = IterVar::reduce(
                    Var::new("k", DType::i32()),
                    Range::from_extent(Expr::from(4i32)),
                );
                let kv = Expr::var(k.var.clone());
                let body = Expr::select(
                    Expr::eq(kv.clone(), idx[0].clone()),
                    a.call(vec![kv]),
                    Expr::make_zero(DType::f32()),
                );
                sum(body, vec![k])
            },
            "T",
            "",
        );
        let lifted = lift_nonzeroness_conditions(&t);
        let body = &lifted.op().as_compute().unwrap().body[0];
        // The reduction is gone; the body reads A at the pinned index.
        assert!(matches!(body.kind(), ExprKind::Call { .. }));
    }

    #[test]
    fn test_constant_pin_bounds_fold() {
        // Pinning to a constant index adds a bounds guard, which then
        // folds to true for an in-range constant.
        let a = placeholder(shape4(), DType::f32(), "A");
        let t = compute(
            shape4(),
            |_idx| {
                let k = IterVar::reduce(
                    Var::new("k", DType::i32()),
                    Range::from_extent(Expr::from(4i32)),
                );
                let kv = Expr::var(k.var.clone());
                let body = Expr::select(
                    Expr::eq(kv.clone(), Expr::from(2i32)),
                    a.call(vec![kv]),
                    Expr::make_zero(DType::f32()),
                );
                sum(body, vec![k])
            },
            "T",
            "",
        );
        let lifted = lift_nonzeroness_conditions(&t);
        let body = &lifted.op().as_compute().unwrap().body[0];
        // Constant bounds fold away, leaving the direct read.
        assert!(matches!(body.kind(), ExprKind::Call { .. }));
    }

    #[test]
    fn test_inline_non_reductions() {
        let a = placeholder(shape4(), DType::f32(), "A");
        let inner = compute(
            shape4(),
            |idx| Expr::mul(a.call(vec![idx[0].clone()]), Expr::from(2.0f32)),
            "inner",
            "",
        );
        let inner2 = inner.clone();
        let outer = compute(
            shape4(),
            move |idx| Expr::add(inner2.call(vec![idx[0].clone()]), Expr::from(1.0f32)),
            "outer",
            "",
        );
        let inlined = inline_non_reductions(&outer, std::slice::from_ref(&inner));
        let body = &inlined.op().as_compute().unwrap().body[0];
        // The call to 'inner' is gone; 'A' is read directly.
        let ts = crate::transform::subtensors(body);
        assert_eq!(ts.len(), 1);
        assert!(ts[0].same_as(&a));
    }

    #[test]
    fn test_inline_tail_call() {
        let a = placeholder(shape4(), DType::f32(), "A");
        let inner = compute(
            shape4(),
            |idx| Expr::mul(a.call(vec![idx[0].clone()]), Expr::from(2.0f32)),
            "inner",
            "",
        );
        let inner2 = inner.clone();
        let outer = compute(
            shape4(),
            move |idx| inner2.call(vec![idx[0].clone()]),
            "outer",
            "",
        );
        let inlined = inline_tail_call(&outer);
        let body = &inlined.op().as_compute().unwrap().body[0];
        assert!(matches!(body.kind(), ExprKind::Mul(..)));
        assert_eq!(inlined.name(), "outer");
    }
}
