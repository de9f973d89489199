//! Binned boundary-tag heap allocator over a one-way break pointer.
//!
//! The heap is a single contiguous region grown upward by a break-pointer
//! primitive ([`HeapRegion`]). Blocks carry replicated boundary tags, freed
//! blocks are coalesced with their neighbors and kept on segregated
//! size-class lists, and [`BinnedHeap`] ties it together with the classic
//! allocate / free / reallocate surface plus a structural checker.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("tagheap supports only 64-bit targets.");

// public module: contains implementation details (hidden via pub(crate))
pub mod mem;

// allocator surface
pub use mem::engine::{BinnedHeap, DEFAULT_CAPACITY};

// break-pointer heap region
pub use mem::brk::{HeapError, HeapRegion};

// diagnostics
pub use mem::check::IntegrityError;
pub use mem::stats::HeapStats;
