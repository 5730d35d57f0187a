//! Indirection over the atomic primitives so the same algorithm can run
//! against `loom`'s instrumented atomics under `--cfg loom` for exhaustive
//! interleaving checks, and against `std::sync::atomic` otherwise.

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};

#[cfg(not(loom))]
pub(crate) use std::sync::Mutex;

#[cfg(loom)]
pub(crate) use loom::sync::Mutex;
