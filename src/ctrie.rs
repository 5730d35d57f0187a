//! The concurrent trie itself: lookup, insert, remove, and the
//! compression/contraction protocol that keeps the tree from accumulating
//! tombstones after removals.
//!
//! Every mutating path follows the same shape: read the current main node
//! under a hazard pointer, build a replacement by copying-and-modifying, CAS
//! it in, and on failure free the never-published replacement and retry
//! from the root. `Step::Restart` models the source algorithm's `RESTART`
//! sentinel; it never escapes the public methods below, which loop on it
//! until a `Step::Done` is produced.

use std::marker::PhantomData;

use crate::error::CtrieResult;
use crate::hazard::SlotKind;
use crate::node::{
    flag_for, pos_for, Branch, CNode, INode, LNode, MainNode, MainNodeContent, SNode, TNode, MAX_LEVEL, W,
};
use crate::retire::{Retired, ThreadCtx};
use crate::sync::{AtomicPtr, Ordering};

/// Derives the 32-bit hash a key is ordered by. The default, [`IdentityHash`],
/// orders entries by their raw key; tests may substitute a hash that
/// collides on purpose to exercise the L-node fallback.
pub trait HashFn {
    fn hash(key: i32) -> i32;
}

/// Orders entries by their key value unchanged.
pub struct IdentityHash;

impl HashFn for IdentityHash {
    fn hash(key: i32) -> i32 {
        key
    }
}

enum Step<T> {
    Done(T),
    Restart,
}

/// A lock-free map from `i32` to `i32`, ordered by hash, reclaimed with
/// hazard pointers. See [`crate::Registry`] for how callers obtain the
/// [`ThreadCtx`] every method here requires.
pub struct Ctrie<H: HashFn = IdentityHash> {
    root: AtomicPtr<INode>,
    _hash: PhantomData<H>,
}

impl<H: HashFn> Ctrie<H> {
    pub fn new() -> Self {
        let main = MainNode::cnode(CNode::empty());
        let root = INode::boxed(main);
        Ctrie {
            root: AtomicPtr::new(root),
            _hash: PhantomData,
        }
    }

    pub fn lookup(&self, key: i32, ctx: &mut ThreadCtx) -> CtrieResult<Option<i32>> {
        let hash = H::hash(key);
        loop {
            let root = self.root.load(Ordering::Acquire);
            match internal_lookup::<H>(root, key, hash, 0, None, ctx) {
                Step::Done(v) => return Ok(v),
                Step::Restart => continue,
            }
        }
    }

    pub fn insert(&self, key: i32, value: i32, ctx: &mut ThreadCtx) -> CtrieResult<()> {
        let hash = H::hash(key);
        loop {
            let root = self.root.load(Ordering::Acquire);
            match internal_insert::<H>(root, key, value, hash, 0, None, ctx) {
                Step::Done(()) => return Ok(()),
                Step::Restart => continue,
            }
        }
    }

    pub fn remove(&self, key: i32, ctx: &mut ThreadCtx) -> CtrieResult<Option<i32>> {
        let hash = H::hash(key);
        loop {
            let root = self.root.load(Ordering::Acquire);
            match internal_remove::<H>(root, key, hash, 0, None, ctx) {
                Step::Done(v) => return Ok(v),
                Step::Restart => continue,
            }
        }
    }
}

impl<H: HashFn> Default for Ctrie<H> {
    fn default() -> Self {
        Ctrie::new()
    }
}

impl<H: HashFn> Drop for Ctrie<H> {
    /// No hazard pointers or concurrent mutators can exist once `&mut self`
    /// is available, so the whole tree is freed by a plain recursive walk
    /// rather than going through the retire/scan protocol.
    fn drop(&mut self) {
        let root = *self.root.get_mut();
        unsafe { free_fresh_inode(root) };
    }
}

/// Publishes and re-validates `inode`'s current main pointer, per the
/// standard hazard-pointer load protocol: publish, fence, re-load, and
/// retry the publish if the pointer moved out from under us. Also honors
/// `inode.marked`: an I-node retired by a contraction must send every racing
/// reader back to the root rather than let it trust a main pointer that is
/// about to be freed out from under it.
fn protect_main(inode: *mut INode, ctx: &ThreadCtx) -> Step<*mut MainNode> {
    loop {
        if unsafe { (*inode).marked.load(Ordering::Acquire) } {
            return Step::Restart;
        }
        let m = unsafe { (*inode).load() };
        ctx.protect(SlotKind::Primary, m);
        if unsafe { (*inode).marked.load(Ordering::Acquire) } {
            return Step::Restart;
        }
        if unsafe { (*inode).load() } == m {
            return Step::Done(m);
        }
    }
}

fn internal_lookup<H: HashFn>(
    inode: *mut INode,
    key: i32,
    hash: i32,
    level: u32,
    parent: Option<*mut INode>,
    ctx: &mut ThreadCtx,
) -> Step<Option<i32>> {
    let main = match protect_main(inode, ctx) {
        Step::Done(m) => m,
        Step::Restart => return Step::Restart,
    };
    match unsafe { &(*main).content } {
        MainNodeContent::C(cnode) => {
            let pos = pos_for(hash, level);
            if !cnode.occupied(pos) {
                return Step::Done(None);
            }
            match cnode.array[pos].unwrap() {
                Branch::I(next) => internal_lookup::<H>(next, key, hash, level + W, Some(inode), ctx),
                Branch::S(snode) => {
                    if snode.key == key {
                        Step::Done(Some(snode.value))
                    } else {
                        Step::Done(None)
                    }
                }
            }
        }
        MainNodeContent::T(_) => {
            if let Some(p) = parent {
                clean::<H>(p, level.saturating_sub(W), ctx);
            }
            Step::Restart
        }
        MainNodeContent::L(head) => lnode_find(*head, key, ctx),
    }
}

fn internal_insert<H: HashFn>(
    inode: *mut INode,
    key: i32,
    value: i32,
    hash: i32,
    level: u32,
    parent: Option<*mut INode>,
    ctx: &mut ThreadCtx,
) -> Step<()> {
    let main = match protect_main(inode, ctx) {
        Step::Done(m) => m,
        Step::Restart => return Step::Restart,
    };
    match unsafe { &(*main).content } {
        MainNodeContent::C(cnode) => {
            let pos = pos_for(hash, level);
            let flag = flag_for(pos);
            if !cnode.occupied(pos) {
                let new_main = MainNode::cnode(cnode.inserted(pos, flag, Branch::S(SNode { key, value })));
                return cas_or_retry_shallow(inode, main, new_main, (), ctx);
            }
            match cnode.array[pos].unwrap() {
                Branch::I(next) => internal_insert::<H>(next, key, value, hash, level + W, Some(inode), ctx),
                Branch::S(existing) => {
                    if existing.key == key {
                        let new_main =
                            MainNode::cnode(cnode.updated(pos, Branch::S(SNode { key, value })));
                        cas_or_retry_shallow(inode, main, new_main, (), ctx)
                    } else {
                        let branch = create_branch::<H>(level + W, existing, SNode { key, value });
                        let new_main = MainNode::cnode(cnode.updated(pos, branch));
                        if unsafe { (*inode).cas(main, new_main) } {
                            ctx.retire(Retired::Main(main));
                            Step::Done(())
                        } else {
                            unsafe {
                                free_fresh_branch(branch);
                                free_main_shallow(new_main);
                            }
                            Step::Restart
                        }
                    }
                }
            }
        }
        MainNodeContent::T(_) => {
            if let Some(p) = parent {
                clean::<H>(p, level.saturating_sub(W), ctx);
            }
            Step::Restart
        }
        MainNodeContent::L(head) => {
            let old_head = *head;
            let cells = match collect_lnode(old_head, ctx) {
                Step::Done(cells) => cells,
                Step::Restart => return Step::Restart,
            };
            let new_cells = lnode_insert_cells(cells, key, value);
            let new_head = build_chain(&new_cells);
            let new_main = MainNode::lnode(new_head);
            if unsafe { (*inode).cas(main, new_main) } {
                retire_lnode_chain(old_head, ctx);
                ctx.retire(Retired::Main(main));
                Step::Done(())
            } else {
                unsafe { free_fresh_main_candidate(new_main) };
                Step::Restart
            }
        }
    }
}

fn internal_remove<H: HashFn>(
    inode: *mut INode,
    key: i32,
    hash: i32,
    level: u32,
    parent: Option<*mut INode>,
    ctx: &mut ThreadCtx,
) -> Step<Option<i32>> {
    let main = match protect_main(inode, ctx) {
        Step::Done(m) => m,
        Step::Restart => return Step::Restart,
    };
    match unsafe { &(*main).content } {
        MainNodeContent::C(cnode) => {
            let pos = pos_for(hash, level);
            let flag = flag_for(pos);
            if !cnode.occupied(pos) {
                return Step::Done(None);
            }
            match cnode.array[pos].unwrap() {
                Branch::I(next) => {
                    let result = internal_remove::<H>(next, key, hash, level + W, Some(inode), ctx);
                    if matches!(result, Step::Done(_)) {
                        if let Step::Done(cur) = protect_main(next, ctx) {
                            if matches!(unsafe { &(*cur).content }, MainNodeContent::T(_)) {
                                clean_parent::<H>(inode, next, hash, level, ctx);
                            }
                        }
                    }
                    result
                }
                Branch::S(existing) => {
                    if existing.key != key {
                        return Step::Done(None);
                    }
                    let new_main = to_contracted(cnode.removed(pos, flag), level);
                    if unsafe { (*inode).cas(main, new_main) } {
                        ctx.retire(Retired::Main(main));
                        if let Some(p) = parent {
                            if matches!(unsafe { &(*new_main).content }, MainNodeContent::T(_)) {
                                clean_parent::<H>(p, inode, hash, level.saturating_sub(W), ctx);
                            }
                        }
                        Step::Done(Some(existing.value))
                    } else {
                        unsafe { free_main_shallow(new_main) };
                        Step::Restart
                    }
                }
            }
        }
        MainNodeContent::T(_) => {
            if let Some(p) = parent {
                clean::<H>(p, level.saturating_sub(W), ctx);
            }
            Step::Restart
        }
        MainNodeContent::L(head) => {
            let old_head = *head;
            let cells = match collect_lnode(old_head, ctx) {
                Step::Done(cells) => cells,
                Step::Restart => return Step::Restart,
            };
            let (remaining, found) = lnode_remove_cells(cells, key);
            if found.is_none() {
                return Step::Done(None);
            }
            let new_main = match remaining.len() {
                // Steady-state L-nodes always hold >= 2 cells (createBranch
                // never builds a singleton one), so this is unreachable in
                // practice; fall back to an empty branch rather than panic.
                0 => MainNode::cnode(CNode::empty()),
                1 => MainNode::tnode(TNode { snode: remaining[0] }),
                _ => MainNode::lnode(build_chain(&remaining)),
            };
            if unsafe { (*inode).cas(main, new_main) } {
                retire_lnode_chain(old_head, ctx);
                ctx.retire(Retired::Main(main));
                if let Some(p) = parent {
                    if matches!(unsafe { &(*new_main).content }, MainNodeContent::T(_)) {
                        clean_parent::<H>(p, inode, hash, level.saturating_sub(W), ctx);
                    }
                }
                Step::Done(found)
            } else {
                unsafe { free_fresh_main_candidate(new_main) };
                Step::Restart
            }
        }
    }
}

/// CAS in `new_main`, whose only novel content (if any) is a leaf `SNode`
/// slot, never a fresh `INode` subtree — so on failure, freeing it is a
/// single non-recursive deallocation. On success the displaced `old` main
/// is handed to the retire list rather than freed immediately.
fn cas_or_retry_shallow<T>(
    inode: *mut INode,
    old: *mut MainNode,
    new_main: *mut MainNode,
    value: T,
    ctx: &mut ThreadCtx,
) -> Step<T> {
    if unsafe { (*inode).cas(old, new_main) } {
        ctx.retire(Retired::Main(old));
        Step::Done(value)
    } else {
        unsafe { free_main_shallow(new_main) };
        Step::Restart
    }
}

/// Retires every cell of a chain that has just been wholesale superseded
/// by a freshly built replacement (an L-node insert/remove copies rather
/// than mutates).
fn retire_lnode_chain(mut head: *mut LNode, ctx: &mut ThreadCtx) {
    while !head.is_null() {
        let next = unsafe { (*head).next };
        ctx.retire(Retired::LNode(head));
        head = next;
    }
}

/// Builds the subtree replacing a single-slot collision between `existing`
/// and `new`: a sibling pair if they land in different slots at this level,
/// otherwise a chain of singleton C-nodes recursing one level at a time
/// until they split or the hash is exhausted into an L-node.
fn create_branch<H: HashFn>(level: u32, existing: SNode, new: SNode) -> Branch {
    if level >= MAX_LEVEL {
        let tail = LNode::new_boxed(existing, std::ptr::null_mut());
        let head = LNode::new_boxed(new, tail);
        return Branch::I(INode::boxed(MainNode::lnode(head)));
    }
    let pos_existing = pos_for(H::hash(existing.key), level);
    let pos_new = pos_for(H::hash(new.key), level);
    let main = if pos_existing != pos_new {
        let cnode = CNode::empty()
            .inserted(pos_existing, flag_for(pos_existing), Branch::S(existing))
            .inserted(pos_new, flag_for(pos_new), Branch::S(new));
        MainNode::cnode(cnode)
    } else {
        let inner = create_branch::<H>(level + W, existing, new);
        let cnode = CNode::empty().inserted(pos_existing, flag_for(pos_existing), inner);
        MainNode::cnode(cnode)
    };
    Branch::I(INode::boxed(main))
}

/// Collapses a C-node with exactly one surviving `SNode` branch into a
/// tombstone, so a sibling removal can later contract the parent; the root
/// (`level == 0`) is never tombstoned.
fn to_contracted(cnode: CNode, level: u32) -> *mut MainNode {
    if level > 0 && cnode.length == 1 {
        if let Some(Branch::S(snode)) = cnode.array[cnode.only_occupied_index()] {
            return MainNode::tnode(TNode { snode });
        }
    }
    MainNode::cnode(cnode)
}

/// Resurrects `inode`'s branch inside `parent` once `inode`'s main has been
/// observed to be a tombstone: replaces the branch with a plain `SNode`
/// carrying the tombstoned pair and contracts `parent` in the same step if
/// that leaves it eligible. Gives up quietly if either node has since moved
/// on, since that means another thread already resolved it.
fn clean_parent<H: HashFn>(parent: *mut INode, inode: *mut INode, hash: i32, level: u32, ctx: &mut ThreadCtx) {
    loop {
        let pmain = match protect_main(parent, ctx) {
            Step::Done(m) => m,
            Step::Restart => continue,
        };
        let cnode = match unsafe { &(*pmain).content } {
            MainNodeContent::C(cnode) => cnode,
            _ => return,
        };
        let pos = pos_for(hash, level);
        if !cnode.occupied(pos) {
            return;
        }
        match cnode.array[pos].unwrap() {
            Branch::I(child) if child == inode => {}
            _ => return,
        }
        let cur_main = match protect_main(inode, ctx) {
            Step::Done(m) => m,
            Step::Restart => continue,
        };
        let tnode = match unsafe { &(*cur_main).content } {
            MainNodeContent::T(t) => *t,
            _ => return,
        };
        let resurrected = cnode.updated(pos, Branch::S(tnode.snode));
        let new_main = to_contracted(resurrected, level);
        if unsafe { (*parent).cas(pmain, new_main) } {
            ctx.retire(Retired::Main(pmain));
            ctx.retire(Retired::Main(cur_main));
            ctx.retire(Retired::INode(inode));
            return;
        }
        unsafe { free_main_shallow(new_main) };
    }
}

/// Replaces every `INode -> TNode` branch of `parent`'s current C-node with
/// a resurrected `SNode`, contracting the result if that leaves a single
/// branch (§4.4 `compress`). Best-effort: a lost CAS or a main that has
/// since stopped being a C-node simply means another thread got there first.
fn compress<H: HashFn>(inode: *mut INode, old_main: *mut MainNode, cnode: &CNode, level: u32, ctx: &mut ThreadCtx) {
    let mut new_cnode = *cnode;
    let mut retired_inodes = Vec::new();
    let mut retired_mains = Vec::new();
    for slot in new_cnode.array.iter_mut() {
        if let Some(Branch::I(child)) = *slot {
            let child_main = match protect_main(child, ctx) {
                Step::Done(m) => m,
                Step::Restart => continue,
            };
            if let MainNodeContent::T(t) = unsafe { &(*child_main).content } {
                *slot = Some(Branch::S(t.snode));
                retired_inodes.push(child);
                retired_mains.push(child_main);
            }
        }
    }
    if retired_inodes.is_empty() {
        return;
    }
    let new_main = to_contracted(new_cnode, level);
    if unsafe { (*inode).cas(old_main, new_main) } {
        ctx.retire(Retired::Main(old_main));
        for m in retired_mains {
            ctx.retire(Retired::Main(m));
        }
        for i in retired_inodes {
            ctx.retire(Retired::INode(i));
        }
    } else {
        unsafe { free_main_shallow(new_main) };
    }
}

/// Runs `compress` on `inode` if its current main is a C-node (§4.4 `clean`);
/// a no-op on a T-node or L-node main, since those aren't `compress`'s job.
fn clean<H: HashFn>(inode: *mut INode, level: u32, ctx: &mut ThreadCtx) {
    let main = match protect_main(inode, ctx) {
        Step::Done(m) => m,
        Step::Restart => return,
    };
    if let MainNodeContent::C(cnode) = unsafe { &(*main).content } {
        compress::<H>(inode, main, cnode, level, ctx);
    }
}

/// Publishes each hop of an L-node chain as a list hazard and stops at the
/// first key match; restarts if a cell is observed marked mid-walk (§4.4
/// `Lookup`'s L-node case).
fn lnode_find(mut head: *const LNode, key: i32, ctx: &ThreadCtx) -> Step<Option<i32>> {
    loop {
        if head.is_null() {
            return Step::Done(None);
        }
        ctx.protect(SlotKind::List, head);
        let node = unsafe { &*head };
        if node.marked.load(Ordering::Acquire) {
            return Step::Restart;
        }
        if node.snode.key == key {
            return Step::Done(Some(node.snode.value));
        }
        head = node.next;
    }
}

/// Copies an L-node chain cell-by-cell under the same hazard/restart
/// discipline as `lnode_find`, for callers that need the whole chain's
/// contents to build a replacement (insert/remove never mutate in place).
fn collect_lnode(mut head: *const LNode, ctx: &ThreadCtx) -> Step<Vec<SNode>> {
    let mut out = Vec::new();
    loop {
        if head.is_null() {
            return Step::Done(out);
        }
        ctx.protect(SlotKind::List, head);
        let node = unsafe { &*head };
        if node.marked.load(Ordering::Acquire) {
            return Step::Restart;
        }
        out.push(node.snode);
        head = node.next;
    }
}

/// Sets `key`'s value in `cells`, appending a fresh cell if absent.
fn lnode_insert_cells(mut cells: Vec<SNode>, key: i32, value: i32) -> Vec<SNode> {
    match cells.iter_mut().find(|s| s.key == key) {
        Some(s) => s.value = value,
        None => cells.push(SNode { key, value }),
    }
    cells
}

/// Drops `key`'s cell from `cells`, returning the survivors and the removed
/// value (if any).
fn lnode_remove_cells(cells: Vec<SNode>, key: i32) -> (Vec<SNode>, Option<i32>) {
    let found = cells.iter().find(|s| s.key == key).map(|s| s.value);
    let remaining = cells.into_iter().filter(|s| s.key != key).collect();
    (remaining, found)
}

fn build_chain(cells: &[SNode]) -> *mut LNode {
    let mut head: *mut LNode = std::ptr::null_mut();
    for s in cells.iter().rev() {
        head = LNode::new_boxed(*s, head);
    }
    head
}

unsafe fn free_main_shallow(main: *mut MainNode) {
    drop(Box::from_raw(main));
}

/// Frees a just-built, never-published `MainNode` candidate that lost its
/// installing CAS, including any L-node chain it owns.
unsafe fn free_fresh_main_candidate(main: *mut MainNode) {
    if let MainNodeContent::L(head) = &(*main).content {
        free_lnode_chain(*head);
    }
    free_main_shallow(main);
}

unsafe fn free_lnode_chain(mut head: *mut LNode) {
    while !head.is_null() {
        let next = (*head).next;
        drop(Box::from_raw(head));
        head = next;
    }
}

unsafe fn free_fresh_branch(branch: Branch) {
    if let Branch::I(inode) = branch {
        free_fresh_inode(inode);
    }
}

/// Deep-frees a subtree that is known to be exclusively owned: either a
/// just-built candidate that lost its publishing CAS, or the whole trie
/// once `Ctrie::drop` holds `&mut self`. Never call this on a node that
/// might still be shared with the live tree.
unsafe fn free_fresh_inode(inode: *mut INode) {
    free_fresh_main(INode::load(&*inode));
    drop(Box::from_raw(inode));
}

unsafe fn free_fresh_main(main: *mut MainNode) {
    match &(*main).content {
        MainNodeContent::C(cnode) => {
            for branch in cnode.array.iter().flatten() {
                if let Branch::I(inner) = branch {
                    free_fresh_inode(*inner);
                }
            }
        }
        MainNodeContent::L(head) => free_lnode_chain(*head),
        MainNodeContent::T(_) => {}
    }
    drop(Box::from_raw(main));
}
