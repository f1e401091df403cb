//! Reverse-mode differentiation over the tensor DAG.
//!
//! The driver discovers the reverse-dependency map of the graph rooted at
//! the output, then computes adjoints by memoized recursion: the adjoint
//! of a tensor is the sum of the contributions from every consumer, each
//! contribution produced by a per-edge function (the default composes the
//! Jacobian with the consumer's adjoint through a generalized matmul).
//!
//! The sum over consumers is a left fold in first-discovery order. That
//! order is part of the contract: floating-point addition is not
//! associative, so reordering the fold changes the emitted tensors.

use std::collections::hash_map::Entry;

use log::{debug, trace};
use rustc_hash::FxHashMap;

use super::jacobian::jacobian;
use super::matmul::generalized_matmul;
use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::optimize::{inline_non_reductions, inline_tail_call, lift_nonzeroness_conditions};
use crate::tensor::{compute, elemwise_add, full, Tensor};
use crate::transform::subtensors;

/// The per-edge gradient function: `(consumer, producer, consumer_adjoint)
/// -> producer_contribution`. Any function with this signature can drive
/// the reverse pass, enabling alternative back-ends.
pub type FDiff<'a> = dyn Fn(&Tensor, &Tensor, &Tensor) -> Result<Tensor> + 'a;

/// The outcome of one [`differentiate`] call.
///
/// Tensor keys compare by identity (producing op + output index), not by
/// structure. The container is immutable; the driver's working state is
/// discarded when the call returns.
#[derive(Debug, Clone)]
pub struct DifferentiationResult {
    /// Adjoints for the requested inputs, in request order. Empty when no
    /// inputs were requested.
    pub result: Vec<Tensor>,
    /// Adjoints for every tensor they were computed for.
    pub adjoints: FxHashMap<Tensor, Tensor>,
    /// Per-consumer breakdown of each adjoint: `adjoint_summands[t][c]` is
    /// the contribution of consumer `c` to the adjoint of `t`.
    pub adjoint_summands: FxHashMap<Tensor, FxHashMap<Tensor, Tensor>>,
}

/// The default per-edge gradient: contract the upstream adjoint against
/// the symbolic Jacobian of the `(consumer, producer)` edge, then clean
/// the result up.
///
/// The pass order is fixed: only the Jacobian itself is inlined (inlining
/// everything blows up reduction bodies), nonzeroness conditions are
/// lifted before the tail call is inlined so zero branches disappear
/// before they reach the consumer.
pub fn diff_building_block(consumer: &Tensor, producer: &Tensor, head: &Tensor) -> Result<Tensor> {
    let jac = jacobian(consumer, producer, true)?;
    let name = format!("{}.{}.grad", consumer.op().name(), producer.op().name());
    let mut result = generalized_matmul(head, &jac, consumer.ndim(), &name)?;
    result = inline_non_reductions(&result, std::slice::from_ref(&jac));
    result = lift_nonzeroness_conditions(&result);
    result = inline_tail_call(&result);
    Ok(result)
}

/// The identity tensor of shape `output.shape ++ output.shape`, cast to
/// the output's dtype. Used as the default head, which turns reverse mode
/// into full Jacobian extraction.
fn identity_head(output: &Tensor) -> Tensor {
    let rank = output.ndim();
    let mut shape = output.shape().to_vec();
    shape.extend(output.shape().iter().cloned());
    let dtype = output.dtype();
    compute(
        shape,
        |indices| {
            let condition = (0..rank)
                .map(|i| Expr::eq(indices[i].clone(), indices[rank + i].clone()))
                .reduce(Expr::and)
                .unwrap_or_else(Expr::const_true);
            Expr::cast(dtype, condition)
        },
        "identity",
        "",
    )
}

struct Driver<'a> {
    output: &'a Tensor,
    head: Tensor,
    fdiff: &'a FDiff<'a>,
    rdeps: FxHashMap<Tensor, Vec<Tensor>>,
    adjoints: FxHashMap<Tensor, Tensor>,
    summands: FxHashMap<Tensor, FxHashMap<Tensor, Tensor>>,
}

impl Driver<'_> {
    /// `head.shape[..h-r] ++ tensor.shape`, the shape every adjoint of
    /// `tensor` must have.
    fn adjoint_shape(&self, tensor: &Tensor) -> Vec<Expr> {
        let outer = self.head.ndim() - self.output.ndim();
        let mut shape = self.head.shape()[..outer].to_vec();
        shape.extend(tensor.shape().iter().cloned());
        shape
    }

    fn check_contribution(&self, producer: &Tensor, part: &Tensor) -> Result<()> {
        let expected = self.adjoint_shape(producer);
        if part.shape() != expected.as_slice() {
            return Err(Error::RankMismatch {
                detail: format!(
                    "adjoint contribution {part} for '{}' does not have the required shape",
                    producer.name()
                ),
            });
        }
        Ok(())
    }

    fn compute_adjoint(&mut self, tensor: &Tensor) -> Result<Tensor> {
        if let Some(adjoint) = self.adjoints.get(tensor) {
            return Ok(adjoint.clone());
        }

        let consumers = self.rdeps.get(tensor).cloned().unwrap_or_default();
        let adjoint = if consumers.is_empty() {
            // Nothing between this tensor and the output: its adjoint is
            // zero of the right shape rather than absent.
            trace!("'{}' has no consumers, adjoint is zero", tensor.name());
            self.summands
                .insert(tensor.clone(), FxHashMap::default());
            full(
                self.adjoint_shape(tensor),
                self.output.dtype(),
                0.0,
            )
        } else {
            let mut acc: Option<Tensor> = None;
            for consumer in &consumers {
                let consumer_adjoint = self.compute_adjoint(consumer)?;
                let part = (self.fdiff)(consumer, tensor, &consumer_adjoint)?;
                self.check_contribution(tensor, &part)?;
                acc = Some(match acc {
                    Some(sum) => elemwise_add(&sum, &part),
                    None => part.clone(),
                });
                self.summands
                    .entry(tensor.clone())
                    .or_default()
                    .insert(consumer.clone(), part);
            }
            let Some(adjoint) = acc else {
                unreachable!("consumer list is non-empty")
            };
            adjoint
        };

        self.adjoints.insert(tensor.clone(), adjoint.clone());
        Ok(adjoint)
    }
}

/// Reverse-mode differentiation of `output` with respect to `inputs`.
///
/// * `head` is the adjoint of `output` itself; when absent, the identity
///   tensor of shape `output.shape ++ output.shape` is used, so the
///   returned adjoints are full Jacobians.
/// * `fdiff` is the per-edge gradient function; when absent,
///   [`diff_building_block`] is used.
/// * With an empty `inputs`, adjoints are computed for every tensor the
///   output transitively reads (and `result` is empty).
pub fn differentiate(
    output: &Tensor,
    inputs: &[Tensor],
    head: Option<Tensor>,
    fdiff: Option<&FDiff<'_>>,
) -> Result<DifferentiationResult> {
    let head = match head {
        Some(head) => head,
        None => identity_head(output),
    };
    if head.ndim() < output.ndim()
        || head.shape()[head.ndim() - output.ndim()..] != *output.shape()
    {
        return Err(Error::RankMismatch {
            detail: format!(
                "head {head} does not end with the shape of output {output}"
            ),
        });
    }

    let default_fdiff = |c: &Tensor, p: &Tensor, h: &Tensor| diff_building_block(c, p, h);
    let fdiff: &FDiff<'_> = match fdiff {
        Some(f) => f,
        None => &default_fdiff,
    };

    // Reverse dependencies: rdeps[child] lists every tensor whose body
    // reads child, in first-discovery order. Each tensor is expanded once.
    let mut rdeps: FxHashMap<Tensor, Vec<Tensor>> = FxHashMap::default();
    let mut discovered: Vec<Tensor> = Vec::new();
    let mut stack = vec![output.clone()];
    while let Some(tensor) = stack.pop() {
        if let Some(op) = tensor.op().as_compute() {
            for child in subtensors(&op.body[tensor.value_index()]) {
                match rdeps.entry(child.clone()) {
                    Entry::Occupied(mut entry) => entry.get_mut().push(tensor.clone()),
                    Entry::Vacant(entry) => {
                        entry.insert(vec![tensor.clone()]);
                        discovered.push(child.clone());
                        stack.push(child);
                    }
                }
            }
        }
    }
    debug!(
        "differentiating '{}': {} tensors discovered",
        output.name(),
        discovered.len()
    );

    let mut driver = Driver {
        output,
        head: head.clone(),
        fdiff,
        rdeps,
        adjoints: FxHashMap::default(),
        summands: FxHashMap::default(),
    };
    driver.adjoints.insert(output.clone(), head);

    let result = if inputs.is_empty() {
        for tensor in &discovered {
            driver.compute_adjoint(tensor)?;
        }
        Vec::new()
    } else {
        let mut result = Vec::with_capacity(inputs.len());
        for input in inputs {
            result.push(driver.compute_adjoint(input)?);
        }
        result
    };

    Ok(DifferentiationResult {
        result,
        adjoints: driver.adjoints,
        adjoint_summands: driver.summands,
    })
}
