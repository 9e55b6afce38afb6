//! Values that cross the instance boundary.

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::tag::InstanceId;
use crate::tensor::Tensor;

/// Keyword arguments for a call.
pub type Kwargs = FxHashMap<String, Value>;

/// A value passed into or returned from an instance.
///
/// Everything except tensors is copied across the boundary. Tensors are shared
/// buffers and go through the ownership check on the way in.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tensor(Tensor),
    Tuple(Vec<Value>),
    List(Vec<Value>),
}

impl Value {
    /// Name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tensor(_) => "tensor",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Unwrap a tensor, failing with an invocation error otherwise.
    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(Error::invocation(format!(
                "expected tensor, got {}",
                other.type_name()
            ))),
        }
    }

    /// Elements of a tuple or list.
    pub fn into_items(self) -> Result<Vec<Value>> {
        match self {
            Value::Tuple(items) | Value::List(items) => Ok(items),
            other => Err(Error::invocation(format!(
                "expected tuple or list, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Visit every tensor nested in this value.
    pub fn for_each_tensor<E>(
        &self,
        f: &mut impl FnMut(&Tensor) -> std::result::Result<(), E>,
    ) -> std::result::Result<(), E> {
        match self {
            Value::Tensor(t) => f(t),
            Value::Tuple(items) | Value::List(items) => {
                items.iter().try_for_each(|item| item.for_each_tensor(f))
            }
            _ => Ok(()),
        }
    }

    /// The single instance owning tensors in `values`, if any are tagged.
    ///
    /// Fails with `TagMismatch` when tensors owned by two different instances
    /// are mixed in one argument list.
    pub(crate) fn common_owner<'v>(
        values: impl IntoIterator<Item = &'v Value>,
    ) -> Result<Option<InstanceId>> {
        let mut found: Option<InstanceId> = None;
        for value in values {
            value.for_each_tensor(&mut |t: &Tensor| {
                match (found, t.owner()) {
                    (Some(a), Some(b)) if a != b => {
                        return Err(Error::TagMismatch {
                            owner: b,
                            requester: a,
                        });
                    }
                    (None, Some(b)) => found = Some(b),
                    _ => {}
                }
                Ok(())
            })?;
        }
        Ok(found)
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Tensor(t)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_owner_untagged() {
        let values = vec![Value::Tensor(Tensor::ones(&[2]).unwrap()), Value::Int(3)];
        assert!(Value::common_owner(&values).unwrap().is_none());
    }

    #[test]
    fn test_for_each_tensor_nested() {
        let value = Value::Tuple(vec![
            Value::Tensor(Tensor::ones(&[1]).unwrap()),
            Value::List(vec![Value::Tensor(Tensor::zeros(&[2]).unwrap()), Value::None]),
        ]);
        let mut count = 0;
        value
            .for_each_tensor(&mut |_| {
                count += 1;
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_into_tensor_rejects_other_types() {
        let err = Value::from("unexpected input").into_tensor().unwrap_err();
        assert!(matches!(err, Error::InvocationFailure(_)));
    }
}
