//! Instance selection.
//!
//! Picks which slot services a request. In order of preference:
//!
//! 1. the slot owning the request's tensors, when it is eligible
//! 2. an eligible slot the calling thread already occupies
//! 3. the first idle eligible slot, scanning from this thread's last choice
//! 4. the eligible slot with the fewest outstanding reservations

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::tag::InstanceId;

use super::slot::InstanceSlot;

thread_local! {
    static LAST_CHOICE: Cell<usize> = const { Cell::new(0) };
}

/// A reservation on a slot, counted by the balancer until dropped.
pub(crate) struct UsageGuard {
    slot: Arc<InstanceSlot>,
}

impl UsageGuard {
    pub(crate) fn reserve(slot: &Arc<InstanceSlot>) -> Self {
        slot.users().fetch_add(1, Ordering::AcqRel);
        Self { slot: slot.clone() }
    }

    fn try_reserve_idle(slot: &Arc<InstanceSlot>) -> Option<Self> {
        slot.users()
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { slot: slot.clone() })
    }

    pub(crate) fn slot(&self) -> &Arc<InstanceSlot> {
        &self.slot
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        self.slot.users().fetch_sub(1, Ordering::AcqRel);
    }
}

/// Reserve one of the `eligible` slots. `eligible` must be non-empty.
pub(crate) fn select(
    slots: &[Arc<InstanceSlot>],
    eligible: &[usize],
    pinned: Option<InstanceId>,
) -> UsageGuard {
    debug_assert!(!eligible.is_empty());

    if let Some(owner) = pinned
        && eligible.contains(&owner.slot())
    {
        return UsageGuard::reserve(&slots[owner.slot()]);
    }

    if let Some(&index) = eligible
        .iter()
        .find(|&&index| slots[index].held_by_current_thread())
    {
        return UsageGuard::reserve(&slots[index]);
    }

    let start = LAST_CHOICE.with(Cell::get) % eligible.len();
    for offset in 0..eligible.len() {
        let position = (start + offset) % eligible.len();
        if let Some(guard) = UsageGuard::try_reserve_idle(&slots[eligible[position]]) {
            LAST_CHOICE.with(|last| last.set(position + 1));
            return guard;
        }
    }

    let (position, &index) = eligible
        .iter()
        .enumerate()
        .min_by_key(|&(_, &index)| slots[index].users().load(Ordering::Acquire))
        .unwrap_or((0, &eligible[0]));
    LAST_CHOICE.with(|last| last.set(position + 1));
    UsageGuard::reserve(&slots[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(n: usize) -> Vec<Arc<InstanceSlot>> {
        (0..n).map(|i| Arc::new(InstanceSlot::new(i))).collect()
    }

    #[test]
    fn test_prefers_idle_slots() {
        let slots = slots(3);
        let all = [0, 1, 2];
        let a = select(&slots, &all, None);
        let b = select(&slots, &all, None);
        let c = select(&slots, &all, None);
        let mut picked = vec![a.slot().index(), b.slot().index(), c.slot().index()];
        picked.sort();
        assert_eq!(picked, vec![0, 1, 2]);
    }

    #[test]
    fn test_least_used_when_all_busy() {
        let slots = slots(2);
        let _a = UsageGuard::reserve(&slots[0]);
        let _b = UsageGuard::reserve(&slots[0]);
        let _c = UsageGuard::reserve(&slots[1]);
        let chosen = select(&slots, &[0, 1], None);
        assert_eq!(chosen.slot().index(), 1);
    }

    #[test]
    fn test_only_eligible_slots() {
        let slots = slots(4);
        for _ in 0..8 {
            let guard = select(&slots, &[2], None);
            assert_eq!(guard.slot().index(), 2);
        }
    }

    #[test]
    fn test_pinned_owner_wins() {
        let slots = slots(3);
        let owner = slots[2].current_id().unwrap();
        let _busy = UsageGuard::reserve(&slots[2]);
        let guard = select(&slots, &[0, 1, 2], Some(owner));
        assert_eq!(guard.slot().index(), 2);
    }

    #[test]
    fn test_reuses_slot_held_by_thread() {
        let slots = slots(3);
        let _ticket = slots[1].enter();
        let guard = select(&slots, &[0, 1, 2], None);
        assert_eq!(guard.slot().index(), 1);
    }

    #[test]
    fn test_release_decrements() {
        let slots = slots(1);
        drop(select(&slots, &[0], None));
        assert_eq!(slots[0].users().load(Ordering::Acquire), 0);
    }
}
