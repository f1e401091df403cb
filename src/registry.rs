//! A process-wide, string-keyed registry exposing the engine's entry
//! points to an external dispatch layer.
//!
//! Arguments travel through a uniform [`Value`] container and calls are
//! dispatched on arity, so a caller that only knows names and value lists
//! can reach every entry point. The engine itself never requires the
//! registry; it is surface glue over the plain library functions.

use std::fmt;
use std::sync::{Arc, LazyLock, RwLock};

use rustc_hash::FxHashMap;

use crate::autodiff::{
    derivative, diff_building_block, differentiate, jacobian, DifferentiationResult,
};
use crate::error::{Error, Result};
use crate::expr::{Expr, Var};
use crate::tensor::Tensor;

/// A per-edge differentiation function passed by value through the
/// registry; the same signature as [`crate::autodiff::FDiff`].
pub type DiffFn = Arc<dyn Fn(&Tensor, &Tensor, &Tensor) -> Result<Tensor> + Send + Sync>;

/// The uniform argument and return container for registry calls.
#[derive(Clone)]
pub enum Value {
    Tensor(Tensor),
    Tensors(Vec<Tensor>),
    Expr(Expr),
    Var(Var),
    Bool(bool),
    Int(i64),
    Result(DifferentiationResult),
    Fn(DiffFn),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Tensor(t) => f.debug_tuple("Tensor").field(t).finish(),
            Value::Tensors(ts) => f.debug_tuple("Tensors").field(ts).finish(),
            Value::Expr(e) => f.debug_tuple("Expr").field(e).finish(),
            Value::Var(v) => f.debug_tuple("Var").field(v).finish(),
            Value::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Value::Int(i) => f.debug_tuple("Int").field(i).finish(),
            Value::Result(r) => f.debug_tuple("Result").field(r).finish(),
            Value::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

impl Value {
    fn as_tensor(&self) -> Result<&Tensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(Error::Registry(format!("expected a tensor, got {other:?}"))),
        }
    }

    fn as_tensors(&self) -> Result<&[Tensor]> {
        match self {
            Value::Tensors(ts) => Ok(ts),
            other => Err(Error::Registry(format!(
                "expected a tensor list, got {other:?}"
            ))),
        }
    }

    fn as_expr(&self) -> Result<&Expr> {
        match self {
            Value::Expr(e) => Ok(e),
            other => Err(Error::Registry(format!(
                "expected an expression, got {other:?}"
            ))),
        }
    }

    fn as_var(&self) -> Result<&Var> {
        match self {
            Value::Var(v) => Ok(v),
            other => Err(Error::Registry(format!(
                "expected a variable, got {other:?}"
            ))),
        }
    }

    fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(Error::Registry(format!("expected a bool, got {other:?}"))),
        }
    }

    fn as_fn(&self) -> Result<&DiffFn> {
        match self {
            Value::Fn(f) => Ok(f),
            other => Err(Error::Registry(format!(
                "expected a function, got {other:?}"
            ))),
        }
    }
}

pub type RegistryFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

static REGISTRY: LazyLock<RwLock<FxHashMap<String, RegistryFn>>> = LazyLock::new(|| {
    let mut map: FxHashMap<String, RegistryFn> = FxHashMap::default();
    install_entry_points(&mut map);
    RwLock::new(map)
});

fn install_entry_points(map: &mut FxHashMap<String, RegistryFn>) {
    map.insert(
        "autodiff.Jacobian".to_string(),
        Arc::new(|args| match args {
            [output, input] => Ok(Value::Tensor(jacobian(
                output.as_tensor()?,
                input.as_tensor()?,
                true,
            )?)),
            [output, input, optimize] => Ok(Value::Tensor(jacobian(
                output.as_tensor()?,
                input.as_tensor()?,
                optimize.as_bool()?,
            )?)),
            _ => Err(Error::Registry(
                "autodiff.Jacobian expects (output, input[, optimize])".to_string(),
            )),
        }),
    );
    map.insert(
        "autodiff.Derivative".to_string(),
        Arc::new(|args| match args {
            [expr, var] => Ok(Value::Expr(derivative(expr.as_expr()?, var.as_var()?)?)),
            _ => Err(Error::Registry(
                "autodiff.Derivative expects (expr, var)".to_string(),
            )),
        }),
    );
    map.insert(
        "autodiff.DiffBuildingBlock".to_string(),
        Arc::new(|args| match args {
            [consumer, producer, head] => Ok(Value::Tensor(diff_building_block(
                consumer.as_tensor()?,
                producer.as_tensor()?,
                head.as_tensor()?,
            )?)),
            _ => Err(Error::Registry(
                "autodiff.DiffBuildingBlock expects (consumer, producer, head)".to_string(),
            )),
        }),
    );
    map.insert(
        "autodiff.Differentiate".to_string(),
        Arc::new(|args| {
            let result = match args {
                [output] => differentiate(output.as_tensor()?, &[], None, None)?,
                [output, inputs] => {
                    differentiate(output.as_tensor()?, inputs.as_tensors()?, None, None)?
                }
                [output, inputs, head] => differentiate(
                    output.as_tensor()?,
                    inputs.as_tensors()?,
                    Some(head.as_tensor()?.clone()),
                    None,
                )?,
                [output, inputs, head, fdiff] => {
                    // Wrap the supplied function as the per-edge strategy.
                    let f = fdiff.as_fn()?.clone();
                    let fdiff = move |c: &Tensor, p: &Tensor, h: &Tensor| f(c, p, h);
                    differentiate(
                        output.as_tensor()?,
                        inputs.as_tensors()?,
                        Some(head.as_tensor()?.clone()),
                        Some(&fdiff),
                    )?
                }
                _ => {
                    return Err(Error::Registry(
                        "autodiff.Differentiate expects (output[, inputs[, head[, fdiff]]])"
                            .to_string(),
                    ))
                }
            };
            Ok(Value::Result(result))
        }),
    );
}

/// Registers (or replaces) a function under the given name.
pub fn register(name: &str, f: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static) {
    REGISTRY
        .write()
        .unwrap()
        .insert(name.to_string(), Arc::new(f));
}

/// Looks up a registered function.
pub fn get(name: &str) -> Option<RegistryFn> {
    REGISTRY.read().unwrap().get(name).cloned()
}

/// Invokes a registered function by name.
pub fn call(name: &str, args: &[Value]) -> Result<Value> {
    let f = get(name).ok_or_else(|| Error::Registry(format!("no function named '{name}'")))?;
    f(args)
}
