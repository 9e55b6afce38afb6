//! Objects replicated across instances.
//!
//! A [`ReplicatedObject`] holds a recipe captured once and builds an
//! independent copy in each instance the first time that instance needs it.
//! Copies are cached per slot together with the identity of the instance that
//! built them, so a slot whose instance was reset rebuilds on next access.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::engine::ObjId;
use crate::engine::pickle::Pickled;
use crate::engine::protocol::Command;
use crate::error::{Error, Result};
use crate::package::{PackageId, PackageInner};
use crate::pool::{InstanceSlot, PoolInner, Ticket};
use crate::session::Session;
use crate::tag::InstanceId;

/// How to build a copy inside one instance.
#[derive(Debug, Clone)]
pub(crate) enum Recipe {
    /// A captured object graph.
    Pickled(Pickled),
    /// An object stored in a loaded package.
    Load {
        package: PackageId,
        key: String,
        name: String,
    },
}

impl Recipe {
    fn command(&self) -> Command {
        match self {
            Recipe::Pickled(data) => Command::Unpickle { data: data.clone() },
            Recipe::Load { package, key, name } => Command::LoadPickle {
                package: *package,
                key: key.clone(),
                name: name.clone(),
            },
        }
    }
}

type CachedCopy = Option<(InstanceId, ObjId)>;

struct ReplicatedInner {
    pool: Weak<PoolInner>,
    recipe: Recipe,
    eligible: Vec<usize>,
    /// One entry per pool slot.
    copies: Vec<Mutex<CachedCopy>>,
    /// Keeps the source package loaded while copies may still be built.
    _package: Option<Arc<PackageInner>>,
}

impl ReplicatedInner {
    fn pool(&self) -> Result<Arc<PoolInner>> {
        self.pool
            .upgrade()
            .ok_or_else(|| Error::UseAfterDestroy("pool was destroyed".to_string()))
    }

    /// The copy living in the occupied slot, built if missing or stale.
    fn materialize(&self, ticket: &Ticket) -> Result<ObjId> {
        let slot = ticket.slot();
        let mut copy = self.copies[slot.index()].lock();
        slot.with_current(|instance| {
            if let Some((built_by, object)) = *copy
                && built_by == instance.id()
            {
                return Ok(object);
            }
            let object = instance
                .run(self.recipe.command())?
                .object()
                .ok_or_else(|| Error::load("recipe produced no object"))?;
            tracing::debug!("materialized {} in {}", object, instance.id());
            *copy = Some((instance.id(), object));
            Ok(object)
        })
    }

    /// Release every cached copy.
    fn release_all(&self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        for (index, copy) in self.copies.iter().enumerate() {
            let Some((built_by, object)) = copy.lock().take() else {
                continue;
            };
            let Ok(slot) = pool.slot(index) else {
                continue;
            };
            release(slot, built_by, object);
        }
    }
}

fn release(slot: &Arc<InstanceSlot>, built_by: InstanceId, object: ObjId) {
    let _ticket = slot.enter();
    let released = slot.with_instance(built_by, |instance| {
        instance.release(object);
        Ok(())
    });
    if let Err(e) = released {
        tracing::debug!("copy {} not released: {}", object, e);
    }
}

impl Drop for ReplicatedInner {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// One logical object with an independent copy per instance.
#[derive(Clone)]
pub struct ReplicatedObject {
    inner: Arc<ReplicatedInner>,
}

impl ReplicatedObject {
    pub(crate) fn new(
        pool: Weak<PoolInner>,
        recipe: Recipe,
        eligible: Vec<usize>,
        package: Option<Arc<PackageInner>>,
    ) -> Self {
        let size = pool.upgrade().map_or(0, |pool| pool.size());
        Self {
            inner: Arc::new(ReplicatedInner {
                pool,
                recipe,
                eligible,
                copies: (0..size).map(|_| Mutex::new(None)).collect(),
                _package: package,
            }),
        }
    }

    /// Slots this object can be materialized in.
    pub fn instances(&self) -> &[usize] {
        &self.inner.eligible
    }

    /// A session on some eligible instance, with `self_obj` set to this
    /// object's copy there.
    pub fn acquire_session(&self) -> Result<Session<'_>> {
        self.acquire_for(None)
    }

    /// A session on the instance at `index`.
    pub fn acquire_session_on(&self, index: usize) -> Result<Session<'_>> {
        let pool = self.inner.pool()?;
        if !self.inner.eligible.contains(&index) {
            return Err(Error::PoolExhausted {
                index,
                size: pool.size(),
            });
        }
        let (usage, ticket) = pool.enter(index)?;
        let object = self.inner.materialize(&ticket)?;
        Session::open(Arc::downgrade(&pool), usage, ticket, |_| Ok(object))
    }

    /// A session for a call whose tensors are owned by `pinned`, if any.
    pub(crate) fn acquire_for(&self, pinned: Option<InstanceId>) -> Result<Session<'_>> {
        let pool = self.inner.pool()?;
        let (usage, ticket) = pool.enter_any(&self.inner.eligible, pinned)?;
        let object = self.inner.materialize(&ticket)?;
        Session::open(Arc::downgrade(&pool), usage, ticket, |_| Ok(object))
    }

    /// Build the copy in every eligible instance now.
    pub(crate) fn materialize_everywhere(&self) -> Result<()> {
        let pool = self.inner.pool()?;
        for &index in &self.inner.eligible {
            let (_usage, ticket) = pool.enter(index)?;
            self.inner.materialize(&ticket)?;
        }
        Ok(())
    }

    /// Release every copy. Later access builds them again.
    pub fn unload(&self) {
        self.inner.release_all();
    }
}

impl fmt::Debug for ReplicatedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedObject")
            .field("recipe", &self.inner.recipe)
            .field("instances", &self.inner.eligible)
            .finish()
    }
}
