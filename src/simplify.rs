//! Algebraic simplification of scalar expressions.
//!
//! Bottom-up rewriting applied until a fixed point is reached: identity and
//! annihilator elimination, constant folding, and branch pruning. Rules
//! preserve types exactly; folding an `int32` addition yields an `int32`
//! immediate. Variables are never rebuilt, so variable identity survives
//! simplification.

use crate::dtype::DType;
use crate::expr::{Expr, ExprKind};

/// Simplifies an expression by repeatedly applying the rewrite rules until
/// a fixed point is reached.
pub fn simplify(expr: &Expr) -> Expr {
    let mut current = expr.clone();
    loop {
        let next = simplify_once(&current);
        if next == current {
            return next;
        }
        current = next;
    }
}

#[derive(Debug, Clone, Copy)]
enum ConstVal {
    Int(i64),
    UInt(u64),
    Float(f64),
}

fn const_val(e: &Expr) -> Option<ConstVal> {
    match e.kind() {
        ExprKind::IntImm(v) => Some(ConstVal::Int(*v)),
        ExprKind::UIntImm(v) => Some(ConstVal::UInt(*v)),
        ExprKind::FloatImm(v) => Some(ConstVal::Float(*v)),
        _ => None,
    }
}

fn make(dtype: DType, v: ConstVal) -> Expr {
    match v {
        ConstVal::Int(v) => Expr::int(dtype, v),
        ConstVal::UInt(v) => Expr::uint(dtype, v),
        ConstVal::Float(v) => Expr::float(dtype, v),
    }
}

fn fold_arith(
    dtype: DType,
    a: ConstVal,
    b: ConstVal,
    int_op: fn(i64, i64) -> Option<i64>,
    uint_op: fn(u64, u64) -> Option<u64>,
    float_op: fn(f64, f64) -> f64,
) -> Option<Expr> {
    let v = match (a, b) {
        (ConstVal::Int(x), ConstVal::Int(y)) => ConstVal::Int(int_op(x, y)?),
        (ConstVal::UInt(x), ConstVal::UInt(y)) => ConstVal::UInt(uint_op(x, y)?),
        (ConstVal::Float(x), ConstVal::Float(y)) => ConstVal::Float(float_op(x, y)),
        _ => return None,
    };
    Some(make(dtype, v))
}

fn fold_compare(
    a: ConstVal,
    b: ConstVal,
    int_op: fn(&i64, &i64) -> bool,
    uint_op: fn(&u64, &u64) -> bool,
    float_op: fn(&f64, &f64) -> bool,
) -> Option<Expr> {
    let v = match (a, b) {
        (ConstVal::Int(x), ConstVal::Int(y)) => int_op(&x, &y),
        (ConstVal::UInt(x), ConstVal::UInt(y)) => uint_op(&x, &y),
        (ConstVal::Float(x), ConstVal::Float(y)) => float_op(&x, &y),
        _ => return None,
    };
    Some(if v {
        Expr::const_true()
    } else {
        Expr::const_false()
    })
}

fn simplify_once(e: &Expr) -> Expr {
    let dtype = e.dtype();
    match e.kind() {
        ExprKind::Add(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if a.is_const_zero() {
                return b;
            }
            if b.is_const_zero() {
                return a;
            }
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) = fold_arith(
                    dtype,
                    x,
                    y,
                    |x, y| Some(x + y),
                    |x, y| Some(x + y),
                    |x, y| x + y,
                ) {
                    return folded;
                }
            }
            Expr::add(a, b)
        }
        ExprKind::Sub(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if b.is_const_zero() {
                return a;
            }
            if a == b {
                return Expr::make_zero(dtype);
            }
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) = fold_arith(
                    dtype,
                    x,
                    y,
                    |x, y| Some(x - y),
                    u64::checked_sub,
                    |x, y| x - y,
                ) {
                    return folded;
                }
            }
            Expr::sub(a, b)
        }
        ExprKind::Mul(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if a.is_const_zero() {
                return a;
            }
            if b.is_const_zero() {
                return b;
            }
            if a.is_const_one() {
                return b;
            }
            if b.is_const_one() {
                return a;
            }
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) = fold_arith(
                    dtype,
                    x,
                    y,
                    |x, y| Some(x * y),
                    |x, y| Some(x * y),
                    |x, y| x * y,
                ) {
                    return folded;
                }
            }
            Expr::mul(a, b)
        }
        ExprKind::Div(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if a.is_const_zero() && !b.is_const_zero() {
                return a;
            }
            if b.is_const_one() {
                return a;
            }
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) =
                    fold_arith(dtype, x, y, i64::checked_div, u64::checked_div, |x, y| {
                        x / y
                    })
                {
                    return folded;
                }
            }
            Expr::div(a, b)
        }
        ExprKind::Mod(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if b.is_const_one() {
                return Expr::make_zero(dtype);
            }
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) =
                    fold_arith(dtype, x, y, i64::checked_rem, u64::checked_rem, |x, y| {
                        x % y
                    })
                {
                    return folded;
                }
            }
            Expr::rem(a, b)
        }
        ExprKind::Min(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if a == b {
                return a;
            }
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) = fold_arith(
                    dtype,
                    x,
                    y,
                    |x, y| Some(x.min(y)),
                    |x, y| Some(x.min(y)),
                    f64::min,
                ) {
                    return folded;
                }
            }
            Expr::min(a, b)
        }
        ExprKind::Max(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if a == b {
                return a;
            }
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) = fold_arith(
                    dtype,
                    x,
                    y,
                    |x, y| Some(x.max(y)),
                    |x, y| Some(x.max(y)),
                    f64::max,
                ) {
                    return folded;
                }
            }
            Expr::max(a, b)
        }
        ExprKind::Eq(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if a == b && !a.dtype().is_float() {
                return Expr::const_true();
            }
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) = fold_compare(x, y, i64::eq, u64::eq, f64::eq) {
                    return folded;
                }
            }
            Expr::eq(a, b)
        }
        ExprKind::Ne(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) = fold_compare(x, y, i64::ne, u64::ne, f64::ne) {
                    return folded;
                }
            }
            Expr::ne(a, b)
        }
        ExprKind::Lt(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) = fold_compare(x, y, i64::lt, u64::lt, f64::lt) {
                    return folded;
                }
            }
            Expr::lt(a, b)
        }
        ExprKind::Le(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if a == b && !a.dtype().is_float() {
                return Expr::const_true();
            }
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) = fold_compare(x, y, i64::le, u64::le, f64::le) {
                    return folded;
                }
            }
            Expr::le(a, b)
        }
        ExprKind::Gt(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) = fold_compare(x, y, i64::gt, u64::gt, f64::gt) {
                    return folded;
                }
            }
            Expr::gt(a, b)
        }
        ExprKind::Ge(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            if a == b && !a.dtype().is_float() {
                return Expr::const_true();
            }
            if let (Some(x), Some(y)) = (const_val(&a), const_val(&b)) {
                if let Some(folded) = fold_compare(x, y, i64::ge, u64::ge, f64::ge) {
                    return folded;
                }
            }
            Expr::ge(a, b)
        }
        ExprKind::And(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            match (a.const_bool_value(), b.const_bool_value()) {
                (Some(false), _) | (_, Some(false)) => Expr::const_false(),
                (Some(true), _) => b,
                (_, Some(true)) => a,
                _ => Expr::and(a, b),
            }
        }
        ExprKind::Or(a, b) => {
            let (a, b) = (simplify_once(a), simplify_once(b));
            match (a.const_bool_value(), b.const_bool_value()) {
                (Some(true), _) | (_, Some(true)) => Expr::const_true(),
                (Some(false), _) => b,
                (_, Some(false)) => a,
                _ => Expr::or(a, b),
            }
        }
        ExprKind::Not(inner) => {
            let inner = simplify_once(inner);
            match inner.const_bool_value() {
                Some(true) => Expr::const_false(),
                Some(false) => Expr::const_true(),
                None => match inner.kind() {
                    ExprKind::Not(x) => x.clone(),
                    _ => Expr::not(inner),
                },
            }
        }
        ExprKind::Select {
            condition,
            true_value,
            false_value,
        } => {
            let condition = simplify_once(condition);
            let true_value = simplify_once(true_value);
            let false_value = simplify_once(false_value);
            match condition.const_bool_value() {
                Some(true) => true_value,
                Some(false) => false_value,
                None => {
                    if true_value == false_value {
                        true_value
                    } else {
                        Expr::select(condition, true_value, false_value)
                    }
                }
            }
        }
        ExprKind::Cast(inner) => {
            let inner = simplify_once(inner);
            if inner.dtype() == dtype {
                return inner;
            }
            if let Some(v) = const_val(&inner) {
                let as_f64 = match v {
                    ConstVal::Int(x) => x as f64,
                    ConstVal::UInt(x) => x as f64,
                    ConstVal::Float(x) => x,
                };
                return Expr::make_const(dtype, as_f64);
            }
            Expr::cast(dtype, inner)
        }
        // The remaining kinds carry no local rules; their children are
        // still simplified.
        _ => e.map_children(&mut |child| simplify_once(child)),
    }
}
