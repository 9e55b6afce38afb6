//! Built-in reference engine.
//!
//! Each execution instance runs one copy of this engine: a private object heap,
//! a root namespace with the `tensor` and `nn` modules, and the importers of the
//! packages loaded into it. Nothing in here is shared between instances.
//!
//! # Module Structure
//!
//! - `archive` - Package directories and their manifest
//! - `builtins` - Native functions exposed under `tensor.*` and `nn.*`
//! - `heap` - Per-instance object slab
//! - `nn` - Callable modules
//! - `pickle` - Stored object format
//! - `protocol` - Commands an instance can run

pub mod archive;
mod builtins;
mod heap;
mod nn;
pub mod pickle;
pub mod protocol;

use std::sync::Arc;

use crate::error::Result;
use crate::package::PackageId;
use crate::tag::{InstanceId, Owner};
use crate::tensor::{Buffer, Tensor};
use crate::value::Value;

pub(crate) use builtins::{Builtin, lookup as lookup_builtin};
pub use heap::ObjId;
pub(crate) use heap::Heap;
pub(crate) use nn::{FORWARD_PARAM, Module};

/// Top-level namespaces of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Namespace {
    Root,
    Tensor,
    Nn,
}

impl Namespace {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Namespace::Root => "",
            Namespace::Tensor => "tensor",
            Namespace::Nn => "nn",
        }
    }

    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "tensor" => Some(Namespace::Tensor),
            "nn" => Some(Namespace::Nn),
            _ => None,
        }
    }
}

/// Callable bound to a receiver.
#[derive(Debug, Clone)]
pub(crate) enum Method {
    /// `importer.load_pickle(key, name)`
    LoadPickle(PackageId),
    /// `module.forward(input)`
    Forward(Arc<Module>),
}

/// One object on an instance heap.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Value(Value),
    Module(Arc<Module>),
    Builtin(&'static Builtin),
    Namespace(Namespace),
    Importer(PackageId),
    Method(Method),
}

impl Slot {
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Slot::Value(v) => v.type_name(),
            Slot::Module(m) => m.class(),
            Slot::Builtin(_) => "builtin",
            Slot::Namespace(_) => "namespace",
            Slot::Importer(_) => "package importer",
            Slot::Method(_) => "method",
        }
    }
}

/// Allocation context of the running instance.
///
/// Tensors built through it are tagged by the instance from birth, and
/// tensors read through it are checked against that tag before use.
pub(crate) struct Ctx {
    owner: Owner,
}

impl Ctx {
    pub(crate) fn new(owner: Owner) -> Self {
        Self { owner }
    }

    pub(crate) fn id(&self) -> InstanceId {
        self.owner.id()
    }

    pub(crate) fn tensor(&self, (shape, data): Buffer) -> Tensor {
        Tensor::owned(shape, data, &self.owner)
    }

    pub(crate) fn check(&self, tensor: &Tensor) -> Result<()> {
        tensor.tag().ensure(self.owner.id())
    }

    /// Claim every untagged tensor in `value` for this instance.
    pub(crate) fn claim(&self, value: &Value) -> Result<()> {
        value.for_each_tensor(&mut |t: &Tensor| t.tag().claim(&self.owner))
    }
}
