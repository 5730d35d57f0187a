//! Deferred-free lists and the scan protocol: a thread accumulates retired
//! nodes locally and only calls into the allocator once it has confirmed, by
//! scanning every thread's hazard slots, that nobody is still dereferencing
//! them. The retire/scan pair here widens the classic single-node-type
//! design to the trie's three retireable shapes (`MainNode`, `INode`,
//! `LNode`).

use crate::error::CtrieResult;
use crate::hazard::{HazardSlots, Registry, SlotKind};
use crate::node::{INode, LNode, MainNode};
use crate::sync::{Mutex, Ordering};

/// A node that has left the tree and is waiting for every hazard pointer
/// that might still reference it to clear before it can be freed.
pub(crate) enum Retired {
    Main(*mut MainNode),
    INode(*mut INode),
    LNode(*mut LNode),
}

unsafe impl Send for Retired {}

impl Retired {
    fn addr(&self) -> *mut () {
        match *self {
            Retired::Main(p) => p as *mut (),
            Retired::INode(p) => p as *mut (),
            Retired::LNode(p) => p as *mut (),
        }
    }

    /// Sets the node's own `marked` bit so that any thread still racing
    /// through it observes the tombstone and restarts instead of trusting
    /// stale content (data model invariants 5 & 6).
    unsafe fn mark(&self) {
        match *self {
            Retired::Main(p) => (*p).marked.store(true, Ordering::Release),
            Retired::INode(p) => (*p).marked.store(true, Ordering::Release),
            Retired::LNode(p) => (*p).marked.store(true, Ordering::Release),
        }
    }

    /// Frees the backing allocation. Caller must have already confirmed no
    /// hazard pointer anywhere in the registry still references it.
    unsafe fn free(self) {
        match self {
            Retired::Main(p) => drop(Box::from_raw(p)),
            Retired::INode(p) => drop(Box::from_raw(p)),
            Retired::LNode(p) => drop(Box::from_raw(p)),
        }
    }
}

/// Per-thread handle into the shared [`Registry`]. Created by
/// [`Registry::thread_ctx`] and released on `Drop`, mirroring
/// `thread_ctx_create`/`thread_ctx_release` of the original harness.
pub struct ThreadCtx<'a> {
    registry: &'a Registry,
    index: usize,
    retired: Vec<Retired>,
}

/// A thread's own deferred-free list is capped at `num_threads * MAX_HAZARD`
/// entries before a scan is forced — the only size provably sufficient to
/// guarantee scan makes progress, since that many outstanding hazards is the
/// most every other thread could simultaneously be holding against this
/// thread's garbage.
fn retired_capacity(num_threads: usize) -> usize {
    num_threads * crate::hazard::MAX_HAZARD
}

impl<'a> ThreadCtx<'a> {
    pub(crate) fn new(registry: &'a Registry, index: usize) -> CtrieResult<Self> {
        registry.claim(index)?;
        Ok(ThreadCtx {
            registry,
            index,
            retired: Vec::with_capacity(retired_capacity(registry.num_threads())),
        })
    }

    fn slots(&self) -> &HazardSlots {
        &self.registry.slots[self.index]
    }

    /// Publishes `ptr` as currently being dereferenced by this thread.
    pub(crate) fn protect<T>(&self, kind: SlotKind, ptr: *const T) {
        self.slots().publish(kind, ptr);
    }

    /// Moves the most recently published primary hazard forward without a
    /// round trip through an empty slot, used when a lookup/insert/remove
    /// hops from one I-node straight to the next.
    pub(crate) fn advance<T>(&self, ptr: *const T) {
        self.slots().replace_last(ptr);
    }

    /// Queues a node for reclamation. May trigger a scan if this thread's
    /// local retired list has filled up; if the scan frees nothing the
    /// thread yields once and retries, rather than blocking indefinitely.
    pub(crate) fn retire(&mut self, node: Retired) {
        unsafe { node.mark() };
        self.retired.push(node);
        while self.retired.len() >= retired_capacity(self.registry.num_threads()) {
            if self.scan() == 0 {
                std::thread::yield_now();
            }
        }
    }

    /// Runs one pass of the scan protocol over this thread's retired list:
    /// snapshot every hazard slot in the registry, then free whichever
    /// retired nodes no snapshot entry still points at. Returns the number
    /// of nodes freed.
    fn scan(&mut self) -> usize {
        let hazards = self.registry.snapshot_sorted();
        let before = self.retired.len();
        let mut holdover = Vec::with_capacity(before);
        let mut freed = 0;
        for node in self.retired.drain(..) {
            if hazards.binary_search(&node.addr()).is_ok() {
                holdover.push(node);
            } else {
                unsafe { node.free() };
                freed += 1;
            }
        }
        self.retired = holdover;
        freed
    }

    /// Drains every remaining retired node straight into the registry's
    /// global garbage pile, to be reclaimed lazily by whichever thread next
    /// scans. Used by `ThreadCtx::drop` so a thread exiting early never
    /// leaks nodes that are still hazarded by someone else.
    fn hand_off_remaining(&mut self) {
        if self.retired.is_empty() {
            return;
        }
        let mut garbage = self.registry.global_garbage.lock().unwrap();
        garbage.append(&mut self.retired);
    }

    /// Attempts to free whatever sits in the registry-wide garbage pile
    /// (populated by threads that released their context before their own
    /// retired list drained). Opportunistic: never blocks, never panics if
    /// another thread is running the same pass concurrently.
    pub(crate) fn reclaim_global_garbage(&self) {
        let mut garbage = self.registry.global_garbage.lock().unwrap();
        if garbage.is_empty() {
            return;
        }
        let hazards = self.registry.snapshot_sorted();
        let mut holdover = Vec::with_capacity(garbage.len());
        for node in garbage.drain(..) {
            if hazards.binary_search(&node.addr()).is_ok() {
                holdover.push(node);
            } else {
                unsafe { node.free() };
            }
        }
        *garbage = holdover;
    }
}

impl<'a> Drop for ThreadCtx<'a> {
    fn drop(&mut self) {
        self.scan();
        self.hand_off_remaining();
        self.registry.unclaim(self.index);
    }
}

pub(crate) fn new_global_garbage() -> Mutex<Vec<Retired>> {
    Mutex::new(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazard::Registry;
    use crate::node::{MainNode, TNode};

    fn boxed_tnode(key: i32) -> *mut MainNode {
        MainNode::tnode(TNode {
            snode: crate::node::SNode { key, value: key },
        })
    }

    #[test]
    fn retiring_an_unhazarded_node_frees_it_on_the_next_scan() {
        let registry = Registry::new(1);
        let mut ctx = registry.thread_ctx(0).unwrap();
        let node = boxed_tnode(1);

        ctx.retire(Retired::Main(node));
        assert_eq!(ctx.retired.len(), 1);

        let freed = ctx.scan();
        assert_eq!(freed, 1);
        assert!(ctx.retired.is_empty());
    }

    #[test]
    fn a_hazarded_node_survives_a_scan_and_is_freed_once_released() {
        let registry = Registry::new(1);
        let mut ctx = registry.thread_ctx(0).unwrap();
        let node = boxed_tnode(2);

        ctx.protect(SlotKind::Primary, node);
        ctx.retire(Retired::Main(node));

        let freed = ctx.scan();
        assert_eq!(freed, 0, "a published hazard must keep the node alive");
        assert_eq!(ctx.retired.len(), 1);

        ctx.slots().release();
        let freed = ctx.scan();
        assert_eq!(freed, 1);
    }

    #[test]
    fn retire_forces_a_scan_once_the_local_list_fills_up() {
        let registry = Registry::new(1);
        let mut ctx = registry.thread_ctx(0).unwrap();
        let capacity = retired_capacity(registry.num_threads());

        for key in 0..(capacity as i32 + 1) {
            ctx.retire(Retired::Main(boxed_tnode(key)));
        }

        // the forced scan(s) along the way must have kept the local list
        // from growing past the threshold that triggered them.
        assert!(ctx.retired.len() < capacity);
    }

    #[test]
    fn drop_hands_unreclaimed_nodes_off_to_the_global_garbage_pile() {
        let registry = Registry::new(1);
        let node = boxed_tnode(3);
        {
            let mut ctx = registry.thread_ctx(0).unwrap();
            ctx.protect(SlotKind::Primary, node);
            ctx.retire(Retired::Main(node));
            // dropped here still hazarded by itself, so hand-off is forced
        }

        let garbage = registry.global_garbage.lock().unwrap();
        assert_eq!(garbage.len(), 1);
        drop(garbage);

        // the hazard slot was released on drop, so a later reclaim pass
        // from a fresh context frees it.
        let ctx = registry.thread_ctx(0).unwrap();
        ctx.reclaim_global_garbage();
        assert!(registry.global_garbage.lock().unwrap().is_empty());
    }
}
