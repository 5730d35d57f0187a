//! Error types surfaced at the public API boundary.
//!
//! The internal algorithms also produce a `RESTART` outcome, but it is
//! resolved by retrying from the root and never escapes `Ctrie`'s public
//! methods; only a terminal allocation failure or a misuse of a
//! [`crate::ThreadCtx`] becomes a [`CtrieError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CtrieError {
    /// The allocator could not satisfy a node allocation. Rust's global
    /// allocator aborts the process on OOM rather than returning control
    /// here, so this variant exists for parity with the source algorithm's
    /// `FAILED` outcome and is not reachable through the default allocator.
    #[error("allocation failed while installing a new node")]
    AllocFailed,

    /// A [`crate::Registry`] slot was addressed outside `0..num_threads`,
    /// or a second context was requested for a slot still held by another.
    #[error("thread registry slot {index} is out of range or already claimed")]
    InvalidThreadSlot { index: usize },
}

pub type CtrieResult<T> = Result<T, CtrieError>;
