//! Commands run inside an instance.
//!
//! A `Command` is the unit the pool replays into instances: loading and
//! unloading packages, materializing objects and releasing them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::package::PackageId;

use super::ObjId;
use super::pickle::Pickled;

/// Program sent to one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Open the package at `root` and register its importer.
    LoadPackage { package: PackageId, root: PathBuf },

    /// Drop the package importer.
    UnloadPackage { package: PackageId },

    /// Deserialize `<key>/<name>` from a loaded package onto the heap (pinned).
    LoadPickle {
        package: PackageId,
        key: String,
        name: String,
    },

    /// Materialize a captured object onto the heap (pinned).
    Unpickle { data: Pickled },

    /// Release heap objects.
    Release { objects: Vec<ObjId> },
}

/// Outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Done,
    Object(ObjId),
}

impl Response {
    pub fn object(self) -> Option<ObjId> {
        match self {
            Response::Object(id) => Some(id),
            Response::Done => None,
        }
    }
}
