//! Thread-caching size-class allocator.
//!
//! Small requests (up to [`MAX_SMALL_SIZE`]) are rounded to one of
//! [`CLASS_COUNT`] size classes and served from 64 KiB spans. Each thread
//! keeps a bounded free list per class and trades slots with a per-class
//! central store a batch at a time. Larger requests get a dedicated mapping.
//! Idle spans go back to the OS on [`Heap::trim`].
//!
//! [`Heap`] is an explicit allocator instance, [`global`] the process-wide one
//! (with [`SpanAlloc`] for `#[global_allocator]` and, under the `c_api`
//! feature, the C `malloc` family).

#![allow(clippy::missing_safety_doc)]

mod central;
mod config;
mod error;
pub mod global;
mod heap;
mod lock;
mod platform;
mod size_class;
mod span;
mod thread_cache;

#[cfg(feature = "c_api")]
pub mod c_api;
#[cfg(feature = "overflow-detection")]
pub mod guard;

pub use config::{
  Config, DEFAULT_POOL_SPANS, DEFAULT_RETAINED_SPANS, MIN_ALIGN, SPAN_HEADER_SIZE, SPAN_SIZE,
};
pub use error::{AllocError, Result};
pub use global::SpanAlloc;
pub use heap::{Heap, HeapStats, LocalHeap};
pub use platform::{CountingPages, OsPages, PageSource};
pub use size_class::{CLASS_COUNT, CLASSES, MAX_SMALL_SIZE, SizeClass, class_for, slot_size};

// Transfer-stack tags live in the top 16 bits of a 64-bit word.
const _: () = assert!(usize::BITS == 64);
