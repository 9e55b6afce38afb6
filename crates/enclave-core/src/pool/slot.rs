//! Pool slots and exclusive occupancy.
//!
//! A slot holds the instance living at one pool index. Sessions occupy the slot
//! for their whole lifetime: one thread at a time, reentrant for the occupying
//! thread so nested sessions on the same instance are legal. Threads wanting an
//! occupied slot block until it is released.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::tag::InstanceId;

#[derive(Debug, Default)]
struct Occupancy {
    owner: Option<ThreadId>,
    depth: usize,
}

pub(crate) struct InstanceSlot {
    index: usize,
    occupancy: Mutex<Occupancy>,
    released: Condvar,
    state: Mutex<Option<Instance>>,
    /// Outstanding load-balancer reservations.
    users: AtomicUsize,
}

impl InstanceSlot {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            occupancy: Mutex::new(Occupancy::default()),
            released: Condvar::new(),
            state: Mutex::new(Some(Instance::new(index))),
            users: AtomicUsize::new(0),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn users(&self) -> &AtomicUsize {
        &self.users
    }

    /// Occupy the slot, blocking while another thread holds it.
    pub(crate) fn enter(self: &Arc<Self>) -> Ticket {
        let me = thread::current().id();
        let mut occupancy = self.occupancy.lock();
        while occupancy.owner.is_some_and(|owner| owner != me) {
            self.released.wait(&mut occupancy);
        }
        occupancy.owner = Some(me);
        occupancy.depth += 1;
        Ticket { slot: self.clone() }
    }

    /// Whether the calling thread currently occupies the slot.
    pub(crate) fn held_by_current_thread(&self) -> bool {
        self.occupancy.lock().owner == Some(thread::current().id())
    }

    fn depth(&self) -> usize {
        self.occupancy.lock().depth
    }

    fn leave(&self) {
        let mut occupancy = self.occupancy.lock();
        occupancy.depth -= 1;
        if occupancy.depth == 0 {
            occupancy.owner = None;
            drop(occupancy);
            self.released.notify_one();
        }
    }

    /// Identity of the live instance, if any.
    pub(crate) fn current_id(&self) -> Option<InstanceId> {
        self.state.lock().as_ref().map(Instance::id)
    }

    /// Run `f` against the instance whose identity is `expected`.
    ///
    /// The caller must occupy the slot. Fails with `UseAfterDestroy` if the
    /// slot is empty or now holds a successor.
    pub(crate) fn with_instance<R>(
        &self,
        expected: InstanceId,
        f: impl FnOnce(&mut Instance) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock();
        match state.as_mut() {
            Some(instance) if instance.id() == expected => f(instance),
            Some(instance) => Err(Error::UseAfterDestroy(format!(
                "{} was replaced by {}",
                expected,
                instance.id()
            ))),
            None => Err(Error::UseAfterDestroy(format!("{} was destroyed", expected))),
        }
    }

    /// Run `f` against whatever instance currently lives in the slot.
    pub(crate) fn with_current<R>(&self, f: impl FnOnce(&mut Instance) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock();
        match state.as_mut() {
            Some(instance) => f(instance),
            None => Err(Error::UseAfterDestroy(format!(
                "instance {} was destroyed",
                self.index
            ))),
        }
    }

    /// Destroy the instance and optionally install a successor.
    ///
    /// `ticket` must be the caller's only occupancy of this slot; any deeper
    /// nesting means an open session on this thread still uses the instance.
    pub(crate) fn replace(&self, ticket: &Ticket, successor: Option<Instance>) -> Result<()> {
        debug_assert_eq!(ticket.slot.index, self.index);
        if self.depth() > 1 {
            return Err(Error::InstanceBusy { index: self.index });
        }
        let previous = std::mem::replace(&mut *self.state.lock(), successor);
        if let Some(previous) = previous {
            previous.destroy();
        }
        Ok(())
    }
}

/// Occupancy of one slot; released on drop.
pub(crate) struct Ticket {
    slot: Arc<InstanceSlot>,
}

impl Ticket {
    pub(crate) fn slot(&self) -> &Arc<InstanceSlot> {
        &self.slot
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.slot.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_reentrant_on_same_thread() {
        let slot = Arc::new(InstanceSlot::new(0));
        let outer = slot.enter();
        let inner = slot.enter();
        assert_eq!(slot.depth(), 2);
        drop(inner);
        drop(outer);
        assert_eq!(slot.depth(), 0);
        assert!(!slot.held_by_current_thread());
    }

    #[test]
    fn test_other_thread_blocks_until_release() {
        let slot = Arc::new(InstanceSlot::new(0));
        let entered = AtomicBool::new(false);
        let barrier = Barrier::new(2);

        let ticket = slot.enter();
        thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                let _ticket = slot.enter();
                entered.store(true, Ordering::SeqCst);
            });
            barrier.wait();
            assert!(!entered.load(Ordering::SeqCst));
            drop(ticket);
        });
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_replace_refuses_nested_occupancy() {
        let slot = Arc::new(InstanceSlot::new(2));
        let before = slot.current_id().unwrap();
        let outer = slot.enter();
        let inner = slot.enter();
        assert!(matches!(
            slot.replace(&inner, None),
            Err(Error::InstanceBusy { index: 2 })
        ));
        drop(inner);

        slot.replace(&outer, Some(Instance::new(2))).unwrap();
        let after = slot.current_id().unwrap();
        assert_ne!(before, after);
        assert_eq!(after.slot(), 2);
        assert!(matches!(
            slot.with_instance(before, |_| Ok(())),
            Err(Error::UseAfterDestroy(_))
        ));
    }
}
