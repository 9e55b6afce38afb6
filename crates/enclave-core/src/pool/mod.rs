//! The interpreter pool.
//!
//! A [`Pool`] owns a fixed number of isolated instances, one per slot, built
//! eagerly when the pool is created and torn down with it. Packages are
//! replayed into the slots they are bound to; sessions reach a slot through
//! [`Pool::acquire_session`], [`Pool::acquire_one`], or the package and object
//! handles derived from the pool.
//!
//! # Module Structure
//!
//! - `slot` - Per-slot instance storage and exclusive occupancy
//! - `balance` - Choosing which slot services a request

mod balance;
mod slot;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::config::PoolConfig;
use crate::engine::protocol::{Command, Response};
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::package::{Package, PackageId};
use crate::session::Session;
use crate::tag::InstanceId;

pub(crate) use balance::UsageGuard;
pub(crate) use slot::{InstanceSlot, Ticket};

/// A package load that reset instances must replay.
struct LoadedPackage {
    id: PackageId,
    root: PathBuf,
    indices: Vec<usize>,
}

pub(crate) struct PoolInner {
    slots: Vec<Arc<InstanceSlot>>,
    config: PoolConfig,
    packages: Mutex<Vec<LoadedPackage>>,
    closed: AtomicBool,
}

impl PoolInner {
    pub(crate) fn size(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, index: usize) -> Result<&Arc<InstanceSlot>> {
        self.slots.get(index).ok_or(Error::PoolExhausted {
            index,
            size: self.slots.len(),
        })
    }

    /// Reserve a slot among `eligible` and occupy it.
    pub(crate) fn enter_any(
        &self,
        eligible: &[usize],
        pinned: Option<InstanceId>,
    ) -> Result<(UsageGuard, Ticket)> {
        if eligible.is_empty() {
            return Err(Error::PoolExhausted {
                index: 0,
                size: self.size(),
            });
        }
        let usage = balance::select(&self.slots, eligible, pinned);
        let ticket = usage.slot().enter();
        Ok((usage, ticket))
    }

    /// Reserve and occupy one specific slot.
    pub(crate) fn enter(&self, index: usize) -> Result<(UsageGuard, Ticket)> {
        let slot = self.slot(index)?;
        let usage = UsageGuard::reserve(slot);
        let ticket = slot.enter();
        Ok((usage, ticket))
    }

    /// Run a command on the instance currently in slot `index`.
    pub(crate) fn run_on(&self, index: usize, command: Command) -> Result<Response> {
        let slot = self.slot(index)?;
        let _ticket = slot.enter();
        slot.with_current(|instance| instance.run(command))
    }

    fn holds_any_slot(&self) -> bool {
        self.slots.iter().any(|slot| slot.held_by_current_thread())
    }

    /// Replay `command` into every slot in `indices`, collecting each outcome.
    fn broadcast(&self, indices: &[usize], command: &Command) -> Vec<(usize, Result<Response>)> {
        if self.config.parallel_load && indices.len() > 1 && !self.holds_any_slot() {
            indices
                .par_iter()
                .map(|&index| (index, self.run_on(index, command.clone())))
                .collect()
        } else {
            indices
                .iter()
                .map(|&index| (index, self.run_on(index, command.clone())))
                .collect()
        }
    }

    pub(crate) fn load_package(self: &Arc<Self>, root: &Path, indices: &[usize]) -> Result<Package> {
        let size = self.size();
        if indices.is_empty() {
            return Err(Error::PoolExhausted { index: 0, size });
        }
        let mut indices = indices.to_vec();
        indices.sort_unstable();
        indices.dedup();
        if let Some(&index) = indices.iter().find(|&&index| index >= size) {
            return Err(Error::PoolExhausted { index, size });
        }

        // Registered before any slot loads, so a concurrent reset of a slot
        // that already loaded replays the package into its successor.
        let id = PackageId::new();
        self.packages.lock().push(LoadedPackage {
            id,
            root: root.to_path_buf(),
            indices: indices.clone(),
        });

        let command = Command::LoadPackage {
            package: id,
            root: root.to_path_buf(),
        };
        let outcomes = self.broadcast(&indices, &command);

        let mut loaded = 0;
        let mut failure = None;
        for (index, outcome) in outcomes {
            match outcome {
                Ok(_) => loaded += 1,
                Err(e) if failure.is_none() => failure = Some((index, e)),
                Err(_) => {}
            }
        }

        if let Some((index, error)) = failure {
            tracing::warn!(
                "loading {} failed on instance {}, rolling back {} instance(s): {}",
                root.display(),
                index,
                loaded,
                error
            );
            // Every bound slot, not only the ones that succeeded: a reset may
            // have replayed the package into a slot whose own load failed.
            self.unload_package(id, &indices);
            return Err(error);
        }

        tracing::info!(
            "loaded package {} from {} into {} instance(s)",
            id,
            root.display(),
            indices.len()
        );
        Ok(Package::new(id, root.to_path_buf(), Arc::downgrade(self), indices))
    }

    /// Drop `package` from the given slots and forget it for reset replay.
    pub(crate) fn unload_package(&self, package: PackageId, indices: &[usize]) {
        self.packages.lock().retain(|loaded| loaded.id != package);
        let command = Command::UnloadPackage { package };
        for (index, outcome) in self.broadcast(indices, &command) {
            if let Err(e) = outcome {
                tracing::debug!("unloading {} from instance {}: {}", package, index, e);
            }
        }
    }

    fn reset(&self, index: usize) -> Result<InstanceId> {
        let slot = self.slot(index)?;
        let ticket = slot.enter();

        let mut successor = Instance::new(index);
        for loaded in self.packages.lock().iter() {
            if loaded.indices.contains(&index) {
                successor.run(Command::LoadPackage {
                    package: loaded.id,
                    root: loaded.root.clone(),
                })?;
            }
        }
        let id = successor.id();
        slot.replace(&ticket, Some(successor))?;
        tracing::info!("reset instance {} as {}", index, id);
        Ok(id)
    }

    /// Destroy every instance. Runs once; later calls succeed trivially.
    fn teardown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_error = None;
        for slot in &self.slots {
            let ticket = slot.enter();
            if let Err(e) = slot.replace(&ticket, None) {
                first_error.get_or_insert(e);
            }
        }
        tracing::info!("pool of {} instance(s) shut down", self.slots.len());
        first_error.map_or(Ok(()), Err)
    }
}

/// Fixed-size pool of isolated instances.
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool of `size` instances with the remaining settings at their
    /// defaults.
    pub fn new(size: usize) -> Result<Self> {
        Self::with_config(PoolConfig {
            size,
            ..PoolConfig::default()
        })
    }

    pub fn with_config(config: PoolConfig) -> Result<Self> {
        if config.size == 0 {
            return Err(Error::PoolExhausted { index: 0, size: 0 });
        }
        let slots = (0..config.size)
            .map(|index| Arc::new(InstanceSlot::new(index)))
            .collect();
        tracing::info!(
            "created pool with {} instance(s) (parallel load: {})",
            config.size,
            config.parallel_load
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                slots,
                config,
                packages: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Load the package at `path` into every instance.
    ///
    /// Either every instance ends up with the package or none does.
    pub fn load_package(&self, path: impl AsRef<Path>) -> Result<Package> {
        let all: Vec<usize> = (0..self.size()).collect();
        self.inner.load_package(path.as_ref(), &all)
    }

    /// Load the package at `path` into the instances at `indices` only.
    pub fn load_package_on(&self, path: impl AsRef<Path>, indices: &[usize]) -> Result<Package> {
        self.inner.load_package(path.as_ref(), indices)
    }

    /// A session on whichever instance the balancer picks.
    pub fn acquire_one(&self) -> Result<Session<'_>> {
        let all: Vec<usize> = (0..self.size()).collect();
        let (usage, ticket) = self.inner.enter_any(&all, None)?;
        Session::on_root(&self.inner, usage, ticket)
    }

    /// A session on the instance at `index`.
    pub fn acquire_session(&self, index: usize) -> Result<Session<'_>> {
        let (usage, ticket) = self.inner.enter(index)?;
        Session::on_root(&self.inner, usage, ticket)
    }

    /// Handles to every instance, in slot order.
    pub fn all_instances(&self) -> Vec<InstanceHandle<'_>> {
        (0..self.size())
            .map(|index| InstanceHandle { pool: self, index })
            .collect()
    }

    /// Replace the instance at `index` with a fresh one.
    ///
    /// Packages bound to the slot are loaded into the successor. Tensors owned
    /// by the old instance are rejected from then on. Fails with
    /// `InstanceBusy` when the calling thread still has a session there.
    pub fn reset_instance(&self, index: usize) -> Result<InstanceId> {
        self.inner.reset(index)
    }

    /// Destroy every instance, reporting a slot still held by this thread.
    pub fn shutdown(self) -> Result<()> {
        self.inner.teardown()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Err(e) = self.inner.teardown() {
            tracing::error!("pool dropped while in use: {}", e);
            if !thread::panicking() {
                panic!("pool dropped while in use: {e}");
            }
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.size())
            .field("config", self.config())
            .finish()
    }
}

/// One instance of a pool, for explicit per-instance control.
#[derive(Clone, Copy)]
pub struct InstanceHandle<'p> {
    pool: &'p Pool,
    index: usize,
}

impl<'p> InstanceHandle<'p> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identity of the instance currently in this slot.
    pub fn id(&self) -> Result<InstanceId> {
        self.pool.inner.slot(self.index)?.current_id().ok_or_else(|| {
            Error::UseAfterDestroy(format!("instance {} was destroyed", self.index))
        })
    }

    pub fn acquire_session(&self) -> Result<Session<'p>> {
        self.pool.acquire_session(self.index)
    }
}
