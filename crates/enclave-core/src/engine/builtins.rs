//! Native functions exposed under `tensor.*` and `nn.*`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::tensor::{self, Tensor};
use crate::value::Value;

use super::{Ctx, Module, Namespace, Slot};

type BuiltinFn = fn(&Ctx, &[&Slot]) -> Result<Slot>;

/// A native function registered in a namespace.
pub(crate) struct Builtin {
    pub(crate) module: Namespace,
    pub(crate) name: &'static str,
    func: BuiltinFn,
}

impl Builtin {
    pub(crate) fn call(&self, ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
        (self.func)(ctx, args).map_err(|e| match e {
            Error::InvocationFailure(msg) => Error::invocation(format!(
                "{}.{}: {}",
                self.module.name(),
                self.name,
                msg
            )),
            other => other,
        })
    }
}

impl std::fmt::Debug for Builtin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<builtin {}.{}>", self.module.name(), self.name)
    }
}

static BUILTINS: &[Builtin] = &[
    Builtin { module: Namespace::Tensor, name: "empty", func: tensor_zeros },
    Builtin { module: Namespace::Tensor, name: "zeros", func: tensor_zeros },
    Builtin { module: Namespace::Tensor, name: "ones", func: tensor_ones },
    Builtin { module: Namespace::Tensor, name: "full", func: tensor_full },
    Builtin { module: Namespace::Tensor, name: "sigmoid", func: tensor_sigmoid },
    Builtin { module: Namespace::Tensor, name: "relu", func: tensor_relu },
    Builtin { module: Namespace::Tensor, name: "tanh", func: tensor_tanh },
    Builtin { module: Namespace::Tensor, name: "add", func: tensor_add },
    Builtin { module: Namespace::Tensor, name: "mul", func: tensor_mul },
    Builtin { module: Namespace::Tensor, name: "linear", func: tensor_linear },
    Builtin { module: Namespace::Tensor, name: "sum", func: tensor_sum },
    Builtin { module: Namespace::Nn, name: "Module", func: nn_module },
    Builtin { module: Namespace::Nn, name: "Linear", func: nn_linear },
    Builtin { module: Namespace::Nn, name: "ReLU", func: nn_relu },
    Builtin { module: Namespace::Nn, name: "Sigmoid", func: nn_sigmoid },
    Builtin { module: Namespace::Nn, name: "Tanh", func: nn_tanh },
    Builtin { module: Namespace::Nn, name: "Sequential", func: nn_sequential },
];

/// Find the builtin `name` in `module`.
pub(crate) fn lookup(module: Namespace, name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.module == module && b.name == name)
}

// =============================================================================
// Argument helpers
// =============================================================================

fn arity(args: &[&Slot], expected: usize) -> Result<()> {
    if args.len() != expected {
        return Err(Error::invocation(format!(
            "expected {} argument(s), got {}",
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn tensor_arg<'a>(ctx: &Ctx, slot: &'a Slot) -> Result<&'a Tensor> {
    match slot {
        Slot::Value(Value::Tensor(t)) => {
            ctx.check(t)?;
            Ok(t)
        }
        other => Err(Error::invocation(format!(
            "expected tensor, got {}",
            other.type_name()
        ))),
    }
}

fn dim_arg(slot: &Slot) -> Result<usize> {
    match slot {
        Slot::Value(Value::Int(n)) if *n >= 0 => Ok(*n as usize),
        Slot::Value(Value::Int(n)) => Err(Error::invocation(format!("negative dimension {}", n))),
        other => Err(Error::invocation(format!(
            "expected int dimension, got {}",
            other.type_name()
        ))),
    }
}

/// Dimensions given either as separate ints or as one tuple/list of ints.
fn shape_args(args: &[&Slot]) -> Result<Vec<usize>> {
    if let [Slot::Value(Value::Tuple(items) | Value::List(items))] = args {
        return items
            .iter()
            .map(|item| dim_arg(&Slot::Value(item.clone())))
            .collect();
    }
    args.iter().map(|slot| dim_arg(slot)).collect()
}

fn filled(ctx: &Ctx, shape: Vec<usize>, value: f32) -> Result<Slot> {
    let data = vec![value; tensor::allocation_size(&shape)?];
    Ok(Slot::Value(Value::Tensor(ctx.tensor((shape, data)))))
}

// =============================================================================
// tensor.*
// =============================================================================

fn tensor_zeros(ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    filled(ctx, shape_args(args)?, 0.0)
}

fn tensor_ones(ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    filled(ctx, shape_args(args)?, 1.0)
}

fn tensor_full(ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    let Some((fill, dims)) = args.split_last() else {
        return Err(Error::invocation("expected dimensions followed by a fill value"));
    };
    let value = match fill {
        Slot::Value(v) => v.as_float(),
        _ => None,
    }
    .ok_or_else(|| Error::invocation("fill value must be a number"))?;
    filled(ctx, shape_args(dims)?, value as f32)
}

fn unary(ctx: &Ctx, args: &[&Slot], f: fn(f32) -> f32) -> Result<Slot> {
    arity(args, 1)?;
    let input = tensor_arg(ctx, args[0])?;
    Ok(Slot::Value(Value::Tensor(ctx.tensor(tensor::map(input, f)))))
}

fn tensor_sigmoid(ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    unary(ctx, args, tensor::sigmoid)
}

fn tensor_relu(ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    unary(ctx, args, tensor::relu)
}

fn tensor_tanh(ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    unary(ctx, args, f32::tanh)
}

fn binary(ctx: &Ctx, args: &[&Slot], f: fn(f32, f32) -> f32) -> Result<Slot> {
    arity(args, 2)?;
    let a = tensor_arg(ctx, args[0])?;
    let b = tensor_arg(ctx, args[1])?;
    Ok(Slot::Value(Value::Tensor(ctx.tensor(tensor::zip_with(a, b, f)?))))
}

fn tensor_add(ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    binary(ctx, args, |a, b| a + b)
}

fn tensor_mul(ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    binary(ctx, args, |a, b| a * b)
}

fn tensor_linear(ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    let (input, weight, bias) = match args {
        [input, weight] => (tensor_arg(ctx, input)?, tensor_arg(ctx, weight)?, None),
        [input, weight, bias] => (
            tensor_arg(ctx, input)?,
            tensor_arg(ctx, weight)?,
            optional_tensor(ctx, bias)?,
        ),
        _ => return Err(Error::invocation("expected (input, weight[, bias])")),
    };
    Ok(Slot::Value(Value::Tensor(
        ctx.tensor(tensor::linear(input, weight, bias)?),
    )))
}

fn tensor_sum(ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    arity(args, 1)?;
    let input = tensor_arg(ctx, args[0])?;
    Ok(Slot::Value(Value::Float(tensor::sum(input) as f64)))
}

fn optional_tensor<'a>(ctx: &Ctx, slot: &'a Slot) -> Result<Option<&'a Tensor>> {
    match slot {
        Slot::Value(Value::None) => Ok(None),
        other => tensor_arg(ctx, other).map(Some),
    }
}

// =============================================================================
// nn.*
// =============================================================================

fn module(m: Module) -> Slot {
    Slot::Module(Arc::new(m))
}

fn nn_module(_ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    arity(args, 0)?;
    Ok(module(Module::Base {
        params: BTreeMap::new(),
    }))
}

fn nn_linear(ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    let (weight, bias) = match args {
        [weight] => (tensor_arg(ctx, weight)?, None),
        [weight, bias] => (tensor_arg(ctx, weight)?, optional_tensor(ctx, bias)?),
        _ => return Err(Error::invocation("expected (weight[, bias])")),
    };
    if weight.shape().len() != 2 {
        return Err(Error::invocation(format!(
            "weight must be 2-d, got shape {:?}",
            weight.shape()
        )));
    }
    Ok(module(Module::Linear {
        weight: weight.clone(),
        bias: bias.cloned(),
    }))
}

fn nn_relu(_ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    arity(args, 0)?;
    Ok(module(Module::Relu))
}

fn nn_sigmoid(_ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    arity(args, 0)?;
    Ok(module(Module::Sigmoid))
}

fn nn_tanh(_ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    arity(args, 0)?;
    Ok(module(Module::Tanh))
}

fn nn_sequential(_ctx: &Ctx, args: &[&Slot]) -> Result<Slot> {
    let layers = args
        .iter()
        .map(|slot| match slot {
            Slot::Module(m) => Ok(m.clone()),
            other => Err(Error::invocation(format!(
                "Sequential expects modules, got {}",
                other.type_name()
            ))),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(module(Module::Sequential(layers)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{InstanceId, Liveness};

    fn int(n: i64) -> Slot {
        Slot::Value(Value::Int(n))
    }

    #[test]
    fn test_lookup() {
        assert!(lookup(Namespace::Tensor, "sigmoid").is_some());
        assert!(lookup(Namespace::Nn, "Linear").is_some());
        assert!(lookup(Namespace::Nn, "sigmoid").is_none());
        assert!(lookup(Namespace::Root, "tensor").is_none());
    }

    #[test]
    fn test_empty_is_tagged_by_caller() {
        let live = Liveness::new(InstanceId::next(0));
        let ctx = Ctx::new(live.owner());
        let empty = lookup(Namespace::Tensor, "empty").unwrap();

        let Slot::Value(Value::Tensor(t)) = empty.call(&ctx, &[&int(2)]).unwrap() else {
            panic!("expected tensor");
        };
        assert_eq!(t.shape(), &[2]);
        assert_eq!(t.owner(), Some(ctx.id()));
    }

    #[test]
    fn test_oversized_shape_is_invocation_failure() {
        let live = Liveness::new(InstanceId::next(0));
        let ctx = Ctx::new(live.owner());
        let zeros = lookup(Namespace::Tensor, "zeros").unwrap();

        let overflow = zeros.call(&ctx, &[&int(1 << 33), &int(1 << 33)]);
        assert!(matches!(overflow, Err(Error::InvocationFailure(_))));

        let too_large = zeros.call(&ctx, &[&int(1 << 20), &int(1 << 20)]);
        assert!(matches!(too_large, Err(Error::InvocationFailure(_))));

        let full = lookup(Namespace::Tensor, "full").unwrap();
        let fill = Slot::Value(Value::Float(1.0));
        let overflow = full.call(&ctx, &[&int(1 << 40), &int(1 << 40), &fill]);
        assert!(matches!(overflow, Err(Error::InvocationFailure(_))));
    }

    #[test]
    fn test_shape_from_tuple() {
        let shape = Slot::Value(Value::Tuple(vec![Value::Int(10), Value::Int(20)]));
        assert_eq!(shape_args(&[&shape]).unwrap(), vec![10, 20]);
        assert!(shape_args(&[&int(-1)]).is_err());
    }

    #[test]
    fn test_errors_name_the_builtin() {
        let live = Liveness::new(InstanceId::next(0));
        let ctx = Ctx::new(live.owner());
        let sigmoid = lookup(Namespace::Tensor, "sigmoid").unwrap();

        let err = sigmoid
            .call(&ctx, &[&Slot::Value(Value::from("nope"))])
            .unwrap_err();
        assert!(err.to_string().contains("tensor.sigmoid"));
    }

    #[test]
    fn test_sequential_rejects_values() {
        let live = Liveness::new(InstanceId::next(0));
        let ctx = Ctx::new(live.owner());
        assert!(nn_sequential(&ctx, &[&int(1)]).is_err());
        assert!(nn_sequential(&ctx, &[&module(Module::Relu)]).is_ok());
    }
}
