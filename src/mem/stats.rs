//! Diagnostic-only counters.
//!
//! Counter values are for display and test assertions. Do NOT use them for
//! allocation decisions; the engine's behavior must depend only on the heap
//! structure itself.

/// Snapshot of one heap's activity since construction. Counters are
/// cumulative across [`reset`](crate::BinnedHeap::reset) calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Successful `allocate` calls (including the allocate half of a moving
    /// `reallocate`).
    pub allocations: u64,
    /// `free` calls (including the free half of a moving `reallocate`).
    pub frees: u64,
    /// Successful `reallocate` calls, any branch.
    pub reallocations: u64,
    /// Allocations satisfied by pulling a block from a bin.
    pub bin_reuses: u64,
    /// Allocations satisfied by extending a free block at the heap top.
    pub top_extensions: u64,
    /// Blocks born by advancing the break.
    pub break_growths: u64,
    /// Total bytes the break has advanced.
    pub bytes_grown: u64,
    /// Largest heap extent observed, in bytes.
    pub peak_heap_bytes: u64,
}

impl HeapStats {
    /// Record a break advance of `n` bytes that left the heap `extent`
    /// bytes large.
    #[inline]
    pub(crate) fn on_grow(&mut self, n: usize, extent: usize) {
        self.bytes_grown += n as u64;
        self.peak_heap_bytes = self.peak_heap_bytes.max(extent as u64);
    }
}
