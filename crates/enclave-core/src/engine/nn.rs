//! Callable modules.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::tensor::{self, Tensor};
use crate::value::Value;

use super::{Ctx, Method, Slot};

/// Name of the single `forward` parameter, for keyword calls.
pub(crate) const FORWARD_PARAM: &str = "input";

#[derive(Debug)]
pub(crate) enum Module {
    /// Plain container with named parameters and no `forward`.
    Base { params: BTreeMap<String, Value> },
    Linear {
        weight: Tensor,
        bias: Option<Tensor>,
    },
    Relu,
    Sigmoid,
    Tanh,
    Sequential(Vec<Arc<Module>>),
}

impl Module {
    pub(crate) fn class(&self) -> &'static str {
        match self {
            Module::Base { .. } => "nn.Module",
            Module::Linear { .. } => "nn.Linear",
            Module::Relu => "nn.ReLU",
            Module::Sigmoid => "nn.Sigmoid",
            Module::Tanh => "nn.Tanh",
            Module::Sequential(_) => "nn.Sequential",
        }
    }

    pub(crate) fn forward(&self, ctx: &Ctx, input: &Tensor) -> Result<Tensor> {
        ctx.check(input)?;
        let buffer = match self {
            Module::Base { .. } => {
                return Err(Error::invocation(format!(
                    "{} does not implement forward",
                    self.class()
                )));
            }
            Module::Linear { weight, bias } => {
                ctx.check(weight)?;
                if let Some(bias) = bias {
                    ctx.check(bias)?;
                }
                tensor::linear(input, weight, bias.as_ref())?
            }
            Module::Relu => tensor::map(input, tensor::relu),
            Module::Sigmoid => tensor::map(input, tensor::sigmoid),
            Module::Tanh => tensor::map(input, f32::tanh),
            Module::Sequential(layers) => {
                let mut current = input.clone();
                for layer in layers {
                    current = layer.forward(ctx, &current)?;
                }
                return Ok(current);
            }
        };
        Ok(ctx.tensor(buffer))
    }

    /// Attribute lookup on a module held in `this`.
    pub(crate) fn attr(this: &Arc<Module>, name: &str) -> Option<Slot> {
        if name == "forward" {
            return Some(Slot::Method(Method::Forward(this.clone())));
        }
        match this.as_ref() {
            Module::Base { params } => params.get(name).cloned().map(Slot::Value),
            Module::Linear { weight, bias } => match name {
                "weight" => Some(Slot::Value(Value::Tensor(weight.clone()))),
                "bias" => Some(Slot::Value(
                    bias.clone().map(Value::Tensor).unwrap_or(Value::None),
                )),
                _ => None,
            },
            Module::Sequential(layers) => name
                .parse::<usize>()
                .ok()
                .and_then(|i| layers.get(i))
                .map(|layer| Slot::Module(layer.clone())),
            Module::Relu | Module::Sigmoid | Module::Tanh => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{InstanceId, Liveness};

    #[test]
    fn test_sequential_forward() {
        let live = Liveness::new(InstanceId::next(0));
        let ctx = Ctx::new(live.owner());

        let weight = ctx.tensor((vec![1, 2], vec![1.0, -1.0]));
        let model = Module::Sequential(vec![
            Arc::new(Module::Linear { weight, bias: None }),
            Arc::new(Module::Relu),
        ]);

        let input = ctx.tensor((vec![2, 2], vec![3.0, 1.0, 1.0, 3.0]));
        let output = model.forward(&ctx, &input).unwrap();
        assert_eq!(output.shape(), &[2, 1]);
        assert_eq!(output.data(), &[2.0, 0.0]);
        assert_eq!(output.owner(), Some(ctx.id()));
    }

    #[test]
    fn test_forward_rejects_foreign_input() {
        let a = Liveness::new(InstanceId::next(0));
        let b = Liveness::new(InstanceId::next(1));
        let foreign = Ctx::new(b.owner()).tensor((vec![1], vec![1.0]));

        let err = Module::Sigmoid
            .forward(&Ctx::new(a.owner()), &foreign)
            .unwrap_err();
        assert!(matches!(err, Error::TagMismatch { .. }));
    }

    #[test]
    fn test_base_module_has_no_forward() {
        let live = Liveness::new(InstanceId::next(0));
        let ctx = Ctx::new(live.owner());
        let module = Module::Base {
            params: BTreeMap::new(),
        };
        let input = ctx.tensor((vec![1], vec![0.0]));
        assert!(matches!(
            module.forward(&ctx, &input),
            Err(Error::InvocationFailure(_))
        ));
    }

    #[test]
    fn test_sequential_children_by_index() {
        let seq = Arc::new(Module::Sequential(vec![Arc::new(Module::Tanh)]));
        assert!(matches!(Module::attr(&seq, "0"), Some(Slot::Module(_))));
        assert!(Module::attr(&seq, "1").is_none());
        assert!(matches!(
            Module::attr(&seq, "forward"),
            Some(Slot::Method(Method::Forward(_)))
        ));
    }
}
