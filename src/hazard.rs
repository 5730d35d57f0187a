//! Hazard-pointer registry: per-thread slots publishing currently-dereferenced
//! pointers, so that a concurrent retirer never frees memory another thread
//! is still walking through.
//!
//! The shape is a classic Michael hazard-pointer array, generalized to two
//! slot kinds per thread: a small ring of "hop" hazards used while
//! descending the trie, and a separate ring used while walking an L-node
//! chain, so a list walk never clobbers the hazard a recursive hop still
//! needs.

use crate::error::{CtrieError, CtrieResult};
use crate::sync::{fence, AtomicBool, AtomicPtr, AtomicUsize, Mutex, Ordering};

/// Primary hazard slots per thread, used while descending the trie.
pub(crate) const MAX_HAZARD: usize = 4;
/// List-traversal hazard slots per thread, used while walking an L-node chain.
pub(crate) const MAX_LIST_HAZARD: usize = 2;

/// Which ring a published pointer belongs to.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotKind {
    Primary,
    List,
}

/// One thread's hazard-pointer record. Lives inside the shared [`Registry`]
/// so that every thread's scan can read every other thread's slots.
pub(crate) struct HazardSlots {
    primary: [AtomicPtr<()>; MAX_HAZARD],
    list: [AtomicPtr<()>; MAX_LIST_HAZARD],
    next_hp: AtomicUsize,
    next_list_hp: AtomicUsize,
    claimed: AtomicBool,
}

impl HazardSlots {
    fn new() -> Self {
        HazardSlots {
            primary: [(); MAX_HAZARD].map(|_| AtomicPtr::new(std::ptr::null_mut())),
            list: [(); MAX_LIST_HAZARD].map(|_| AtomicPtr::new(std::ptr::null_mut())),
            next_hp: AtomicUsize::new(0),
            next_list_hp: AtomicUsize::new(0),
            claimed: AtomicBool::new(false),
        }
    }

    /// Publishes `ptr` into the next slot of `kind`, advances the ring
    /// cursor, and issues a full fence. Publication must happen-before any
    /// dereference of `ptr` (data model invariant, §4.2).
    pub(crate) fn publish<T>(&self, kind: SlotKind, ptr: *const T) {
        let ptr = ptr as *mut ();
        match kind {
            SlotKind::Primary => {
                let i = self.next_hp.load(Ordering::Relaxed);
                self.primary[i].store(ptr, Ordering::Relaxed);
                self.next_hp.store((i + 1) % MAX_HAZARD, Ordering::Relaxed);
            }
            SlotKind::List => {
                let i = self.next_list_hp.load(Ordering::Relaxed);
                self.list[i].store(ptr, Ordering::Relaxed);
                self.next_list_hp
                    .store((i + 1) % MAX_LIST_HAZARD, Ordering::Relaxed);
            }
        }
        fence(Ordering::SeqCst);
    }

    /// Overwrites the most recently published primary slot (used when a hop
    /// advances but the previous hazard is no longer needed).
    pub(crate) fn replace_last<T>(&self, ptr: *const T) {
        let i = self.next_hp.load(Ordering::Relaxed);
        let i = (i + MAX_HAZARD - 1) % MAX_HAZARD;
        self.primary[i].store(ptr as *mut (), Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Zeroes all slots. Called when a [`crate::ThreadCtx`] is released.
    pub(crate) fn release(&self) {
        for slot in &self.primary {
            slot.store(std::ptr::null_mut(), Ordering::Relaxed);
        }
        for slot in &self.list {
            slot.store(std::ptr::null_mut(), Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
    }

    fn snapshot_into(&self, out: &mut Vec<*mut ()>) {
        for slot in &self.primary {
            out.push(slot.load(Ordering::SeqCst));
        }
        for slot in &self.list {
            out.push(slot.load(Ordering::SeqCst));
        }
    }
}

/// Fixed-capacity set of per-thread hazard records, sized by `num_threads`
/// at construction (§2b: the registry never grows — growing it would
/// invalidate the `FREE_LIST_SIZE` sizing argument of §4.3).
pub struct Registry {
    pub(crate) slots: Box<[HazardSlots]>,
    pub(crate) global_garbage: Mutex<Vec<crate::retire::Retired>>,
}

impl Registry {
    /// Creates a registry with `num_threads` slots, none of them claimed.
    pub fn new(num_threads: usize) -> Self {
        let mut slots = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            slots.push(HazardSlots::new());
        }
        Registry {
            slots: slots.into_boxed_slice(),
            global_garbage: crate::retire::new_global_garbage(),
        }
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.slots.len()
    }

    /// Pins the calling thread to registry slot `index` for the lifetime of
    /// the returned [`crate::ThreadCtx`]. Fails with
    /// [`CtrieError::InvalidThreadSlot`] if `index` is out of range or
    /// already claimed by another live context (§2b).
    pub fn thread_ctx(&self, index: usize) -> CtrieResult<crate::retire::ThreadCtx<'_>> {
        crate::retire::ThreadCtx::new(self, index)
    }

    /// Claims `index` for a new [`crate::ThreadCtx`]. Fails with
    /// [`CtrieError::InvalidThreadSlot`] if the index is out of range or
    /// already claimed (§2b invariant: one live context per slot).
    pub(crate) fn claim(&self, index: usize) -> CtrieResult<()> {
        let slot = self
            .slots
            .get(index)
            .ok_or(CtrieError::InvalidThreadSlot { index })?;
        let was_claimed = slot.claimed.swap(true, Ordering::AcqRel);
        if was_claimed {
            return Err(CtrieError::InvalidThreadSlot { index });
        }
        Ok(())
    }

    pub(crate) fn unclaim(&self, index: usize) {
        self.slots[index].release();
        self.slots[index].claimed.store(false, Ordering::Release);
    }

    /// Collects every hazard slot of every thread into one sorted array, as
    /// required by the scan protocol (§4.3 step 1-3).
    pub(crate) fn snapshot_sorted(&self) -> Vec<*mut ()> {
        let mut all = Vec::with_capacity(self.slots.len() * (MAX_HAZARD + MAX_LIST_HAZARD));
        for slot in self.slots.iter() {
            slot.snapshot_into(&mut all);
        }
        all.sort_unstable();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn published_primary(slots: &HazardSlots) -> Vec<*mut ()> {
        let mut out = Vec::new();
        slots.snapshot_into(&mut out);
        out.truncate(MAX_HAZARD);
        out
    }

    #[test]
    fn publish_wraps_the_primary_ring_and_overwrites_the_oldest_slot() {
        let slots = HazardSlots::new();
        let pointers: Vec<i32> = (0..(MAX_HAZARD as i32 + 2)).collect();

        for p in &pointers {
            slots.publish(SlotKind::Primary, p as *const i32);
        }

        // MAX_HAZARD + 2 publishes into a ring of size MAX_HAZARD wrap
        // around past the start, so only the last MAX_HAZARD pointers
        // remain visible, regardless of which physical slot holds them.
        let mut seen: Vec<*mut ()> = published_primary(&slots);
        seen.sort_unstable();
        let mut expected: Vec<*mut ()> = pointers[pointers.len() - MAX_HAZARD..]
            .iter()
            .map(|p| p as *const i32 as *mut ())
            .collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn publish_wraps_the_list_ring_independently_of_the_primary_ring() {
        let slots = HazardSlots::new();
        let pointers: Vec<i32> = (0..(MAX_LIST_HAZARD as i32 + 1)).collect();

        for p in &pointers {
            slots.publish(SlotKind::List, p as *const i32);
        }

        let mut out = Vec::new();
        slots.snapshot_into(&mut out);
        let list_seen = &out[MAX_HAZARD..];
        // the first list pointer was overwritten once the ring wrapped
        let overwritten = &pointers[0] as *const i32 as *mut ();
        assert!(!list_seen.contains(&overwritten));
        let still_there = &pointers[1] as *const i32 as *mut ();
        assert!(list_seen.contains(&still_there));
    }

    #[test]
    fn release_zeroes_every_slot() {
        let slots = HazardSlots::new();
        let x = 7i32;
        slots.publish(SlotKind::Primary, &x as *const i32);
        slots.publish(SlotKind::List, &x as *const i32);

        slots.release();

        let mut out = Vec::new();
        slots.snapshot_into(&mut out);
        assert!(out.iter().all(|p| p.is_null()));
    }

    #[test]
    fn snapshot_sorted_merges_every_thread_in_the_registry() {
        let registry = Registry::new(2);
        let a = 1i32;
        let b = 2i32;
        registry.slots[0].publish(SlotKind::Primary, &a as *const i32);
        registry.slots[1].publish(SlotKind::List, &b as *const i32);

        let snapshot = registry.snapshot_sorted();
        assert!(snapshot.contains(&(&a as *const i32 as *mut ())));
        assert!(snapshot.contains(&(&b as *const i32 as *mut ())));
        assert!(snapshot.windows(2).all(|w| w[0] <= w[1]));
    }
}
