//! Pool of isolated engine instances with owner-tagged tensor buffers.
//!
//! This crate provides:
//! - A fixed-size [`Pool`] of independent instances, each with a private heap
//! - Scoped, exclusive [`Session`]s onto one instance
//! - [`Package`] loading replayed into every instance, all-or-nothing
//! - [`Model`]s and [`ReplicatedObject`]s that live in every instance at once
//! - Ownership tags on every tensor buffer, so a buffer owned by one instance
//!   is rejected by all others

pub mod config;
pub mod engine;
pub mod error;
mod instance;
pub mod model;
pub mod package;
pub mod pool;
pub mod replicated;
pub mod session;
pub mod tag;
pub mod tensor;
pub mod value;

pub use config::PoolConfig;
pub use engine::ObjId;
pub use engine::archive::{Archive, Manifest, PackageWriter};
pub use engine::pickle::Pickled;
pub use engine::protocol::{Command, Response};
pub use error::{Error, Result};
pub use model::Model;
pub use package::{Package, PackageId};
pub use pool::{InstanceHandle, Pool};
pub use replicated::ReplicatedObject;
pub use session::{Obj, Session};
pub use tag::{BufferTag, InstanceId};
pub use tensor::Tensor;
pub use value::{Kwargs, Value};
