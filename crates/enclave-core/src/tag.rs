//! Ownership tags for native buffers.
//!
//! Every tensor buffer carries one [`BufferTag`]. The tag starts empty when the
//! buffer is created on the host and is claimed exactly once, either when an
//! instance allocates the buffer or when an untagged buffer is first imported
//! into an instance. From then on only that instance may use the buffer.
//!
//! An owner is identified by `(slot, build)`. Build ids come from a
//! process-wide counter, so an instance constructed later in the same slot (in
//! the same pool or a new one) never aliases a tag left behind by its
//! predecessor.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::error::{Error, Result};

static NEXT_BUILD: AtomicU64 = AtomicU64::new(1);

/// Identity of one execution instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId {
    slot: usize,
    build: u64,
}

impl InstanceId {
    /// Allocate the identity for a new instance in `slot`.
    pub(crate) fn next(slot: usize) -> Self {
        Self {
            slot,
            build: NEXT_BUILD.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Pool slot index.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Storage epoch of the instance occupying the slot.
    pub fn build(&self) -> u64 {
        self.build
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance {} (build {})", self.slot, self.build)
    }
}

/// Keeps an instance's tags live. Dropped when the instance is destroyed.
#[derive(Debug)]
pub(crate) struct Liveness {
    id: InstanceId,
    alive: Arc<()>,
}

impl Liveness {
    pub(crate) fn new(id: InstanceId) -> Self {
        Self {
            id,
            alive: Arc::new(()),
        }
    }

    pub(crate) fn owner(&self) -> Owner {
        Owner {
            id: self.id,
            alive: Arc::downgrade(&self.alive),
        }
    }
}

/// Claim recorded in a tag.
#[derive(Debug, Clone)]
pub(crate) struct Owner {
    id: InstanceId,
    alive: Weak<()>,
}

impl Owner {
    pub(crate) fn id(&self) -> InstanceId {
        self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

/// Per-buffer ownership slot.
#[derive(Debug, Default)]
pub struct BufferTag {
    owner: OnceLock<Owner>,
}

impl BufferTag {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn claimed(owner: Owner) -> Self {
        Self {
            owner: OnceLock::from(owner),
        }
    }

    /// Instance that owns the buffer, if it has been claimed.
    pub fn owner(&self) -> Option<InstanceId> {
        self.owner.get().map(Owner::id)
    }

    /// Whether the buffer is still untagged.
    pub fn is_untagged(&self) -> bool {
        self.owner.get().is_none()
    }

    /// Claim the buffer for `claimant`, or confirm an existing claim.
    ///
    /// Concurrent claims on an untagged buffer race on a single
    /// initialisation: exactly one claimant is recorded and every other one
    /// observes the winner.
    pub(crate) fn claim(&self, claimant: &Owner) -> Result<()> {
        let current = self.owner.get_or_init(|| claimant.clone());
        Self::check_against(current, claimant.id)
    }

    /// Verify the buffer belongs to `requester` without claiming it.
    pub(crate) fn ensure(&self, requester: InstanceId) -> Result<()> {
        match self.owner.get() {
            Some(current) => Self::check_against(current, requester),
            None => Err(Error::invocation(format!(
                "untagged buffer reached {requester} without being imported"
            ))),
        }
    }

    fn check_against(current: &Owner, requester: InstanceId) -> Result<()> {
        if current.id == requester {
            Ok(())
        } else if current.is_alive() {
            tracing::debug!("rejecting buffer owned by {} in {}", current.id, requester);
            Err(Error::TagMismatch {
                owner: current.id,
                requester,
            })
        } else {
            Err(Error::UseAfterDestroy(format!(
                "buffer belongs to destroyed {}",
                current.id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ids_are_unique_per_slot() {
        let a = InstanceId::next(0);
        let b = InstanceId::next(0);
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a, b);
        assert!(b.build() > a.build());
    }

    #[test]
    fn test_claim_untagged() {
        let live = Liveness::new(InstanceId::next(0));
        let tag = BufferTag::new();
        assert!(tag.is_untagged());

        tag.claim(&live.owner()).unwrap();
        assert_eq!(tag.owner(), Some(live.owner().id()));

        // Re-claiming by the owner is idempotent.
        tag.claim(&live.owner()).unwrap();
    }

    #[test]
    fn test_claim_by_other_instance_rejected() {
        let a = Liveness::new(InstanceId::next(0));
        let b = Liveness::new(InstanceId::next(1));
        let tag = BufferTag::new();
        tag.claim(&a.owner()).unwrap();

        let err = tag.claim(&b.owner()).unwrap_err();
        assert!(matches!(err, Error::TagMismatch { owner, requester }
            if owner == a.owner().id() && requester == b.owner().id()));
        assert_eq!(tag.owner(), Some(a.owner().id()));
    }

    #[test]
    fn test_destroyed_owner_reports_use_after_destroy() {
        let old = Liveness::new(InstanceId::next(0));
        let tag = BufferTag::claimed(old.owner());
        drop(old);

        let successor = Liveness::new(InstanceId::next(0));
        let err = tag.claim(&successor.owner()).unwrap_err();
        assert!(matches!(err, Error::UseAfterDestroy(_)));
    }

    #[test]
    fn test_ensure_requires_claim() {
        let live = Liveness::new(InstanceId::next(3));
        let tag = BufferTag::new();
        assert!(tag.ensure(live.owner().id()).is_err());
        tag.claim(&live.owner()).unwrap();
        tag.ensure(live.owner().id()).unwrap();
    }
}
