//! Packages loaded into a pool.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::Model;
use crate::pool::PoolInner;
use crate::replicated::{Recipe, ReplicatedObject};
use crate::session::Session;

/// Identity of one package load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageId(Uuid);

impl PackageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PackageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "package-{}", self.0.simple())
    }
}

pub(crate) struct PackageInner {
    id: PackageId,
    root: PathBuf,
    pool: Weak<PoolInner>,
    instances: Vec<usize>,
}

impl Drop for PackageInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.unload_package(self.id, &self.instances);
            tracing::info!("unloaded package {}", self.id);
        }
    }
}

/// A package loaded into some or all instances of a pool.
///
/// The package stays loaded while this handle, or any model loaded from it,
/// is alive. Dropping the last one unloads it; the pool itself is unaffected.
#[derive(Clone)]
pub struct Package {
    inner: Arc<PackageInner>,
}

impl Package {
    pub(crate) fn new(id: PackageId, root: PathBuf, pool: Weak<PoolInner>, instances: Vec<usize>) -> Self {
        Self {
            inner: Arc::new(PackageInner {
                id,
                root,
                pool,
                instances,
            }),
        }
    }

    pub fn id(&self) -> PackageId {
        self.inner.id
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Slots the package was loaded into.
    pub fn instances(&self) -> &[usize] {
        &self.inner.instances
    }

    fn pool(&self) -> Result<Arc<PoolInner>> {
        self.inner
            .pool
            .upgrade()
            .ok_or_else(|| Error::UseAfterDestroy(format!("pool of {} was destroyed", self.inner.id)))
    }

    /// Load object `name` stored under `key` into every bound instance.
    ///
    /// Fails with `LoadFailure` if any instance cannot produce the object.
    pub fn load_object(&self, key: &str, name: &str) -> Result<Model> {
        let pool = self.pool()?;
        let object = ReplicatedObject::new(
            Arc::downgrade(&pool),
            Recipe::Load {
                package: self.inner.id,
                key: key.to_string(),
                name: name.to_string(),
            },
            self.inner.instances.clone(),
            Some(self.inner.clone()),
        );
        object.materialize_everywhere()?;
        tracing::debug!("loaded {}/{} from {}", key, name, self.inner.id);
        Ok(Model::from(object))
    }

    /// A session whose `self_obj` is this package's importer.
    pub fn acquire_session(&self) -> Result<Session<'_>> {
        let pool = self.pool()?;
        let (usage, ticket) = pool.enter_any(&self.inner.instances, None)?;
        let package = self.inner.id;
        Session::open(Arc::downgrade(&pool), usage, ticket, |instance| {
            instance.importer(package).ok_or_else(|| {
                Error::UseAfterDestroy(format!("{} is not loaded in {}", package, instance.id()))
            })
        })
    }
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Package")
            .field("id", &self.inner.id)
            .field("root", &self.inner.root)
            .field("instances", &self.inner.instances)
            .finish()
    }
}
