//! A lock-free, concurrent hash-array-mapped trie keyed on `i32`, ordered by
//! hash and reclaimed with hazard pointers instead of reference counting.
//!
//! A [`Ctrie`] is shared across threads through a plain reference; each
//! participating thread borrows a [`ThreadCtx`] from a [`Registry`] sized up
//! front for the number of threads that will ever touch the trie, and
//! passes that context into every [`Ctrie::lookup`], [`Ctrie::insert`], and
//! [`Ctrie::remove`] call.
//!
//! ```
//! use ctrie::{Ctrie, Registry};
//!
//! let registry = Registry::new(1);
//! let mut ctx = registry.thread_ctx(0).unwrap();
//! let trie: Ctrie = Ctrie::new();
//!
//! trie.insert(1, 100, &mut ctx).unwrap();
//! assert_eq!(trie.lookup(1, &mut ctx).unwrap(), Some(100));
//! assert_eq!(trie.remove(1, &mut ctx).unwrap(), Some(100));
//! assert_eq!(trie.lookup(1, &mut ctx).unwrap(), None);
//! ```

mod ctrie;
mod error;
mod hazard;
mod node;
mod retire;
mod sync;

pub use crate::ctrie::{Ctrie, HashFn, IdentityHash};
pub use crate::error::{CtrieError, CtrieResult};
pub use crate::hazard::Registry;
pub use crate::retire::ThreadCtx;
