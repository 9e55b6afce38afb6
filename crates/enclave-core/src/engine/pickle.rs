//! Stored object format.
//!
//! `Pickled` is the portable form of an instance object: what a package stores
//! under `<key>/<name>` and what a replicated object captures as its recipe.
//! Unpickling always allocates fresh buffers owned by the unpickling instance,
//! so two materializations never share storage.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tensor::{self, Tensor};
use crate::value::Value;

use super::{Ctx, Module, Namespace, Slot, lookup_builtin};

/// Serialized object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pickled {
    None,
    Bool {
        value: bool,
    },
    Int {
        value: i64,
    },
    Float {
        value: f64,
    },
    Str {
        value: String,
    },
    Tensor {
        shape: Vec<usize>,
        data: Vec<f32>,
    },
    Tuple {
        items: Vec<Pickled>,
    },
    List {
        items: Vec<Pickled>,
    },
    Module {
        class: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: BTreeMap<String, Pickled>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        children: Vec<Pickled>,
    },
    /// Reference to a builtin, e.g. `tensor.sigmoid`.
    Global {
        module: String,
        name: String,
    },
}

impl Pickled {
    /// Copy of a tensor's shape and contents.
    pub fn tensor(t: &Tensor) -> Self {
        Pickled::Tensor {
            shape: t.shape().to_vec(),
            data: t.data().to_vec(),
        }
    }

    /// Empty module of the given class.
    pub fn module(class: impl Into<String>) -> Self {
        Pickled::Module {
            class: class.into(),
            params: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// `nn.Linear` with the given parameters.
    pub fn linear(weight: &Tensor, bias: Option<&Tensor>) -> Self {
        let mut linear = Self::module("nn.Linear").with_param("weight", Self::tensor(weight));
        if let Some(bias) = bias {
            linear = linear.with_param("bias", Self::tensor(bias));
        }
        linear
    }

    /// `nn.Sequential` over `layers`.
    pub fn sequential(layers: impl IntoIterator<Item = Pickled>) -> Self {
        Pickled::Module {
            class: "nn.Sequential".to_string(),
            params: BTreeMap::new(),
            children: layers.into_iter().collect(),
        }
    }

    /// Add a parameter; no-op on non-module values.
    pub fn with_param(mut self, name: impl Into<String>, value: Pickled) -> Self {
        if let Pickled::Module { params, .. } = &mut self {
            params.insert(name.into(), value);
        }
        self
    }

    /// Portable form of a boundary value.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::None => Pickled::None,
            Value::Bool(value) => Pickled::Bool { value: *value },
            Value::Int(value) => Pickled::Int { value: *value },
            Value::Float(value) => Pickled::Float { value: *value },
            Value::Str(value) => Pickled::Str {
                value: value.clone(),
            },
            Value::Tensor(t) => Self::tensor(t),
            Value::Tuple(items) => Pickled::Tuple {
                items: items.iter().map(Self::from_value).collect(),
            },
            Value::List(items) => Pickled::List {
                items: items.iter().map(Self::from_value).collect(),
            },
        }
    }
}

// =============================================================================
// Pickling
// =============================================================================

pub(crate) fn pickle(slot: &Slot) -> Result<Pickled> {
    match slot {
        Slot::Value(value) => Ok(Pickled::from_value(value)),
        Slot::Module(module) => Ok(pickle_module(module)),
        Slot::Builtin(builtin) => Ok(Pickled::Global {
            module: builtin.module.name().to_string(),
            name: builtin.name.to_string(),
        }),
        other => Err(Error::invocation(format!(
            "{} cannot be pickled",
            other.type_name()
        ))),
    }
}

fn pickle_module(module: &Module) -> Pickled {
    match module {
        Module::Base { params } => {
            let mut pickled = Pickled::module(module.class());
            for (name, value) in params {
                pickled = pickled.with_param(name.clone(), Pickled::from_value(value));
            }
            pickled
        }
        Module::Linear { weight, bias } => Pickled::linear(weight, bias.as_ref()),
        Module::Sequential(layers) => {
            Pickled::sequential(layers.iter().map(|layer| pickle_module(layer)))
        }
        Module::Relu | Module::Sigmoid | Module::Tanh => Pickled::module(module.class()),
    }
}

// =============================================================================
// Unpickling
// =============================================================================

pub(crate) fn unpickle(ctx: &Ctx, pickled: &Pickled) -> Result<Slot> {
    match pickled {
        Pickled::Module { .. } => Ok(Slot::Module(Arc::new(unpickle_module(ctx, pickled)?))),
        Pickled::Global { module, name } => {
            let builtin = Namespace::from_name(module)
                .and_then(|ns| lookup_builtin(ns, name))
                .ok_or_else(|| Error::load(format!("unknown global {}.{}", module, name)))?;
            Ok(Slot::Builtin(builtin))
        }
        value => Ok(Slot::Value(unpickle_value(ctx, value)?)),
    }
}

fn unpickle_value(ctx: &Ctx, pickled: &Pickled) -> Result<Value> {
    Ok(match pickled {
        Pickled::None => Value::None,
        Pickled::Bool { value } => Value::Bool(*value),
        Pickled::Int { value } => Value::Int(*value),
        Pickled::Float { value } => Value::Float(*value),
        Pickled::Str { value } => Value::Str(value.clone()),
        Pickled::Tensor { shape, data } => Value::Tensor(unpickle_tensor(ctx, shape, data)?),
        Pickled::Tuple { items } => Value::Tuple(unpickle_items(ctx, items)?),
        Pickled::List { items } => Value::List(unpickle_items(ctx, items)?),
        Pickled::Module { class, .. } => {
            return Err(Error::load(format!("module {} nested inside a value", class)));
        }
        Pickled::Global { module, name } => {
            return Err(Error::load(format!("global {}.{} nested inside a value", module, name)));
        }
    })
}

fn unpickle_items(ctx: &Ctx, items: &[Pickled]) -> Result<Vec<Value>> {
    items.iter().map(|item| unpickle_value(ctx, item)).collect()
}

fn unpickle_tensor(ctx: &Ctx, shape: &[usize], data: &[f32]) -> Result<Tensor> {
    let Some(expected) = tensor::element_count(shape) else {
        return Err(Error::load(format!("tensor shape {:?} overflows the element count", shape)));
    };
    if data.len() != expected {
        return Err(Error::load(format!(
            "tensor of shape {:?} stores {} elements, expected {}",
            shape,
            data.len(),
            expected
        )));
    }
    Ok(ctx.tensor((shape.to_vec(), data.to_vec())))
}

fn unpickle_module(ctx: &Ctx, pickled: &Pickled) -> Result<Module> {
    let Pickled::Module {
        class,
        params,
        children,
    } = pickled
    else {
        return Err(Error::load(format!("expected module, found {:?}", pickled)));
    };

    let param_tensor = |name: &str| -> Result<Option<Tensor>> {
        match params.get(name) {
            None | Some(Pickled::None) => Ok(None),
            Some(Pickled::Tensor { shape, data }) => unpickle_tensor(ctx, shape, data).map(Some),
            Some(other) => Err(Error::load(format!(
                "{} parameter {} must be a tensor, found {:?}",
                class, name, other
            ))),
        }
    };

    let module = match class.as_str() {
        "nn.Module" => Module::Base {
            params: params
                .iter()
                .map(|(name, p)| Ok((name.clone(), unpickle_value(ctx, p)?)))
                .collect::<Result<_>>()?,
        },
        "nn.Linear" => {
            let weight = param_tensor("weight")?
                .ok_or_else(|| Error::load("nn.Linear is missing its weight"))?;
            if weight.shape().len() != 2 {
                return Err(Error::load(format!(
                    "nn.Linear weight must be 2-d, got shape {:?}",
                    weight.shape()
                )));
            }
            Module::Linear {
                weight,
                bias: param_tensor("bias")?,
            }
        }
        "nn.ReLU" => Module::Relu,
        "nn.Sigmoid" => Module::Sigmoid,
        "nn.Tanh" => Module::Tanh,
        "nn.Sequential" => Module::Sequential(
            children
                .iter()
                .map(|child| unpickle_module(ctx, child).map(Arc::new))
                .collect::<Result<_>>()?,
        ),
        other => return Err(Error::load(format!("unknown module class {}", other))),
    };
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{InstanceId, Liveness};

    fn ctx() -> (Liveness, Ctx) {
        let live = Liveness::new(InstanceId::next(0));
        let ctx = Ctx::new(live.owner());
        (live, ctx)
    }

    #[test]
    fn test_json_layout() {
        let json = serde_json::to_value(Pickled::module("nn.ReLU")).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "module", "class": "nn.ReLU" }));

        let parsed: Pickled =
            serde_json::from_str(r#"{"type":"tensor","shape":[2],"data":[0.5,1.5]}"#).unwrap();
        assert_eq!(
            parsed,
            Pickled::Tensor {
                shape: vec![2],
                data: vec![0.5, 1.5]
            }
        );
    }

    #[test]
    fn test_unpickle_allocates_owned_copy() {
        let (_live, ctx) = ctx();
        let host = Tensor::ones(&[3]).unwrap();
        let Slot::Value(Value::Tensor(copy)) = unpickle(&ctx, &Pickled::tensor(&host)).unwrap()
        else {
            panic!("expected tensor");
        };
        assert!(!copy.ptr_eq(&host));
        assert!(copy.equal(&host));
        assert_eq!(copy.owner(), Some(ctx.id()));
        assert!(host.owner().is_none());
    }

    #[test]
    fn test_module_roundtrip_through_heap_form() {
        let (_live, ctx) = ctx();
        let weight = Tensor::new(vec![1, 2], vec![0.5, 0.25]).unwrap();
        let pickled = Pickled::sequential([
            Pickled::linear(&weight, None),
            Pickled::module("nn.Sigmoid"),
        ]);

        let slot = unpickle(&ctx, &pickled).unwrap();
        assert!(matches!(&slot, Slot::Module(m) if m.class() == "nn.Sequential"));
        assert_eq!(pickle(&slot).unwrap(), pickled);
    }

    #[test]
    fn test_overflowing_shape_is_load_failure() {
        let (_live, ctx) = ctx();
        let parsed: Pickled = serde_json::from_str(
            r#"{"type":"tensor","shape":[4294967296,4294967296],"data":[]}"#,
        )
        .unwrap();
        let err = unpickle(&ctx, &parsed).unwrap_err();
        assert!(matches!(err, Error::LoadFailure(_)));
    }

    #[test]
    fn test_unknown_class_is_load_failure() {
        let (_live, ctx) = ctx();
        let err = unpickle(&ctx, &Pickled::module("nn.Conv9d")).unwrap_err();
        assert!(matches!(err, Error::LoadFailure(_)));
    }

    #[test]
    fn test_bad_tensor_length_is_load_failure() {
        let (_live, ctx) = ctx();
        let bad = Pickled::Tensor {
            shape: vec![2, 2],
            data: vec![1.0],
        };
        assert!(matches!(unpickle(&ctx, &bad), Err(Error::LoadFailure(_))));
    }

    #[test]
    fn test_global_resolves_builtin() {
        let (_live, ctx) = ctx();
        let global = Pickled::Global {
            module: "tensor".to_string(),
            name: "relu".to_string(),
        };
        assert!(matches!(unpickle(&ctx, &global).unwrap(), Slot::Builtin(_)));
        assert_eq!(pickle(&unpickle(&ctx, &global).unwrap()).unwrap(), global);
    }
}
