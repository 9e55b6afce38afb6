//! Callable handles over replicated objects.

use std::fmt;

use crate::error::Result;
use crate::replicated::ReplicatedObject;
use crate::session::Session;
use crate::value::{Kwargs, Value};

/// A callable object present in every instance bound to its package.
///
/// Each call picks an instance, imports the arguments there, invokes the
/// object and copies the result out. Calls from different threads land on
/// different instances when idle ones exist and run concurrently.
#[derive(Clone)]
pub struct Model {
    object: ReplicatedObject,
}

impl Model {
    /// Call with positional arguments.
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        self.call_kwargs(args, &Kwargs::default())
    }

    /// Call with keyword arguments only.
    pub fn call_kwargs_only(&self, kwargs: &Kwargs) -> Result<Value> {
        self.call_kwargs(&[], kwargs)
    }

    /// Call with positional and keyword arguments.
    ///
    /// When the arguments hold tensors already owned by an instance, the call
    /// is routed there.
    pub fn call_kwargs(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        let pinned = Value::common_owner(args.iter().chain(kwargs.values()))?;
        let session = self.object.acquire_for(pinned)?;
        session.self_obj().call_kwargs(args, kwargs)?.to_value()
    }

    pub fn replicated(&self) -> &ReplicatedObject {
        &self.object
    }

    /// A session whose `self_obj` is this model's copy.
    pub fn acquire_session(&self) -> Result<Session<'_>> {
        self.object.acquire_session()
    }
}

impl From<ReplicatedObject> for Model {
    fn from(object: ReplicatedObject) -> Self {
        Self { object }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Model").field(&self.object).finish()
    }
}
