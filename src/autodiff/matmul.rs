//! A generalization of matrix multiplication to tensors:
//! `C[i.., j..] = sum_{k..} A[i.., k..] * B[k.., j..]`, contracting the
//! last `ndims_to_reduce` axes of `A` against the first `ndims_to_reduce`
//! axes of `B`.

use crate::error::{Error, Result};
use crate::expr::{Expr, Var};
use crate::reduction::{sum, IterVar, Range};
use crate::tensor::{compute, Tensor};

/// Contracts `a` against `b` over `ndims_to_reduce` axes.
///
/// The output has shape `a.shape[..-n] ++ b.shape[n..]`. With
/// `ndims_to_reduce == 0` the result is a plain elementwise product with
/// no reduction at all, since downstream passes reject reductions over an
/// empty axis.
pub fn generalized_matmul(
    a: &Tensor,
    b: &Tensor,
    ndims_to_reduce: usize,
    name: &str,
) -> Result<Tensor> {
    if a.ndim() < ndims_to_reduce || b.ndim() < ndims_to_reduce {
        return Err(Error::RankMismatch {
            detail: format!(
                "cannot contract {ndims_to_reduce} axes of {a} against {b}"
            ),
        });
    }
    let a_outer = a.ndim() - ndims_to_reduce;
    for i in 0..ndims_to_reduce {
        if a.shape()[a_outer + i] != b.shape()[i] {
            return Err(Error::RankMismatch {
                detail: format!(
                    "contracted shapes differ at axis {i}: {} vs {}",
                    a.shape()[a_outer + i],
                    b.shape()[i]
                ),
            });
        }
    }

    let mut output_shape: Vec<Expr> = a.shape()[..a_outer].to_vec();
    output_shape.extend(b.shape()[ndims_to_reduce..].iter().cloned());

    let reduce_axes: Vec<IterVar> = b.shape()[..ndims_to_reduce]
        .iter()
        .enumerate()
        .map(|(i, extent)| {
            IterVar::reduce(
                Var::new(&format!("k{i}"), extent.dtype()),
                Range::from_extent(extent.clone()),
            )
        })
        .collect();

    let (a, b) = (a.clone(), b.clone());
    Ok(compute(
        output_shape,
        |indices| {
            let mut a_indices: Vec<Expr> = indices[..a_outer].to_vec();
            a_indices.extend(reduce_axes.iter().map(|iv| Expr::var(iv.var.clone())));
            let mut b_indices: Vec<Expr> = reduce_axes
                .iter()
                .map(|iv| Expr::var(iv.var.clone()))
                .collect();
            b_indices.extend(indices[a_outer..].iter().cloned());

            let product = Expr::mul(a.call(a_indices), b.call(b_indices));
            if reduce_axes.is_empty() {
                product
            } else {
                sum(product, reduce_axes.clone())
            }
        },
        name,
        "matmul",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::expr::ExprKind;
    use crate::tensor::placeholder;

    fn t(name: &str, dims: &[i32]) -> Tensor {
        placeholder(
            dims.iter().map(|d| Expr::from(*d)).collect(),
            DType::f32(),
            name,
        )
    }

    #[test]
    fn test_output_shape() {
        let a = t("A", &[2, 3]);
        let b = t("B", &[3, 4]);
        let c = generalized_matmul(&a, &b, 1, "C").unwrap();
        assert_eq!(
            c.shape(),
            &[Expr::from(2i32), Expr::from(4i32)]
        );
    }

    #[test]
    fn test_no_reduction_axes() {
        let a = t("A", &[2]);
        let b = t("B", &[3]);
        let c = generalized_matmul(&a, &b, 0, "C").unwrap();
        assert_eq!(c.ndim(), 2);
        let body = &c.op().as_compute().unwrap().body[0];
        assert!(matches!(body.kind(), ExprKind::Mul(..)));
    }

    #[test]
    fn test_rank_mismatch() {
        let a = t("A", &[2]);
        let b = t("B", &[3, 4]);
        assert!(matches!(
            generalized_matmul(&a, &b, 2, "C"),
            Err(crate::error::Error::RankMismatch { .. })
        ));
    }

    #[test]
    fn test_contracted_shape_mismatch() {
        let a = t("A", &[2, 3]);
        let b = t("B", &[4, 5]);
        assert!(matches!(
            generalized_matmul(&a, &b, 1, "C"),
            Err(crate::error::Error::RankMismatch { .. })
        ));
    }

    #[test]
    fn test_full_contraction_is_reduce() {
        let a = t("A", &[5]);
        let b = t("B", &[5]);
        let c = generalized_matmul(&a, &b, 1, "dot").unwrap();
        assert_eq!(c.ndim(), 0);
        let body = &c.op().as_compute().unwrap().body[0];
        assert!(matches!(body.kind(), ExprKind::Reduce { .. }));
    }
}
