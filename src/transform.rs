//! Structural expression transforms: variable substitution, reduction axis
//! cloning, combiner pruning and sub-tensor discovery.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::expr::{Expr, ExprKind, VarId};
use crate::reduction::{Combiner, IterVar};
use crate::tensor::Tensor;

/// Replaces every variable whose id appears in `map` by the mapped
/// expression. The replacement is capture-free because variable ids are
/// globally unique.
pub fn substitute(expr: &Expr, map: &FxHashMap<VarId, Expr>) -> Expr {
    if let ExprKind::Var(v) = expr.kind() {
        if let Some(replacement) = map.get(&v.id) {
            return replacement.clone();
        }
    }
    expr.map_children(&mut |child| substitute(child, map))
}

/// Clones the reduction axes of a `Reduce` expression so the result can be
/// used alongside the original without sharing iteration variables.
/// Non-reduce expressions are returned unchanged.
pub fn clone_reduction(expr: &Expr) -> Expr {
    let ExprKind::Reduce {
        combiner,
        source,
        axis,
        condition,
        value_index,
    } = expr.kind()
    else {
        return expr.clone();
    };

    let mut vmap: FxHashMap<VarId, Expr> = FxHashMap::default();
    let new_axis: Vec<IterVar> = axis
        .iter()
        .map(|iv| {
            let new_var = iv.var.copy_with_suffix("");
            vmap.insert(iv.var.id, Expr::var(new_var.clone()));
            IterVar::new(new_var, iv.range.clone(), iv.kind)
        })
        .collect();

    let new_source: Vec<Expr> = source.iter().map(|s| substitute(s, &vmap)).collect();
    let new_condition = substitute(condition, &vmap);

    Expr::reduce(
        combiner.clone(),
        new_source,
        new_axis,
        new_condition,
        *value_index,
    )
}

/// Collects the variable ids referenced anywhere in an expression.
fn collect_var_ids(expr: &Expr, out: &mut FxHashSet<VarId>) {
    if let ExprKind::Var(v) = expr.kind() {
        out.insert(v.id);
    }
    expr.for_each_child(&mut |child| collect_var_ids(child, out));
}

/// Drops combiner components that are not transitively used by the
/// reduce's selected output, remapping `value_index` accordingly.
///
/// A component `i` is used if `i == value_index`, or if some used
/// component's result expression references `lhs[i]` or `rhs[i]`. This is
/// what collapses a paired (derivative, value) combiner back to a plain
/// one when the derivative does not actually need the original values.
pub fn simplify_combiner(expr: &Expr) -> Expr {
    let ExprKind::Reduce {
        combiner,
        source,
        axis,
        condition,
        value_index,
    } = expr.kind()
    else {
        return expr.clone();
    };

    let n = combiner.arity();
    let mut used = vec![false; n];
    used[*value_index] = true;

    loop {
        let mut changed = false;
        for i in 0..n {
            if !used[i] {
                continue;
            }
            let mut referenced = FxHashSet::default();
            collect_var_ids(&combiner.result[i], &mut referenced);
            for j in 0..n {
                if !used[j]
                    && (referenced.contains(&combiner.lhs[j].id)
                        || referenced.contains(&combiner.rhs[j].id))
                {
                    used[j] = true;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    if used.iter().all(|u| *u) {
        return expr.clone();
    }

    let keep = |items: &[Expr]| -> Vec<Expr> {
        items
            .iter()
            .zip(&used)
            .filter(|(_, u)| **u)
            .map(|(e, _)| e.clone())
            .collect()
    };
    let new_lhs: Vec<_> = combiner
        .lhs
        .iter()
        .zip(&used)
        .filter(|(_, u)| **u)
        .map(|(v, _)| v.clone())
        .collect();
    let new_rhs: Vec<_> = combiner
        .rhs
        .iter()
        .zip(&used)
        .filter(|(_, u)| **u)
        .map(|(v, _)| v.clone())
        .collect();
    let new_value_index = used[..*value_index].iter().filter(|u| **u).count();

    Expr::reduce(
        Combiner::new(
            new_lhs,
            new_rhs,
            keep(&combiner.result),
            keep(&combiner.identity),
        ),
        keep(source),
        axis.clone(),
        condition.clone(),
        new_value_index,
    )
}

/// Every tensor read by a `Call` anywhere in the expression, deduplicated,
/// in first-discovery order. The order is observable: the reverse-mode
/// driver sums adjoint contributions in it.
pub fn subtensors(expr: &Expr) -> Vec<Tensor> {
    let mut found = Vec::new();
    let mut seen: FxHashSet<Tensor> = FxHashSet::default();
    collect_subtensors(expr, &mut found, &mut seen);
    found
}

fn collect_subtensors(expr: &Expr, found: &mut Vec<Tensor>, seen: &mut FxHashSet<Tensor>) {
    if let ExprKind::Call {
        tensor: Some(t), ..
    } = expr.kind()
    {
        if seen.insert(t.clone()) {
            found.push(t.clone());
        }
    }
    expr.for_each_child(&mut |child| collect_subtensors(child, found, seen));
}
