use std::ptr::NonNull;

use super::bins::{bin_of, FreeBins, MAX_POW, NUM_BINS};
use super::block::{align_up, BlockRef, HEADER_SIZE, LINKS_SIZE, MIN_BLOCK_SIZE, SHRINK_MIN_SIZE};
use super::brk::{HeapError, HeapRegion};
use super::stats::HeapStats;

/// Reservation used by [`BinnedHeap::new`]. Address space only; pages are
/// committed as the break advances.
pub const DEFAULT_CAPACITY: usize = 256 * 1024 * 1024;

/// Largest block the engine will create for a single request.
const MAX_REQUEST_BLOCK: usize = 1 << MAX_POW;

/// A binned boundary-tag allocator over a one-way break pointer.
///
/// The heap is a single contiguous range `[heap_lo, heap_hi)` exactly tiled
/// by blocks. Freed blocks are coalesced with free neighbors and kept on
/// segregated size-class lists; allocation reuses the first fitting binned
/// block, extends a free block at the top, or advances the break.
///
/// One value is one independent heap: all state (region bounds, bin heads,
/// last-block anchor, counters) lives inside it, so tests can run any number
/// of heaps side by side.
///
/// ```no_run
/// use tagheap::BinnedHeap;
///
/// let mut heap = BinnedHeap::with_capacity(1 << 20)?;
/// let p = heap.allocate(100).expect("heap exhausted");
/// let p = unsafe { heap.reallocate(Some(p), 300) }.expect("heap exhausted");
/// unsafe { heap.free(p) };
/// # Ok::<(), tagheap::HeapError>(())
/// ```
pub struct BinnedHeap {
    pub(crate) region: HeapRegion,
    pub(crate) bins: FreeBins,
    /// The last block in memory (its right edge is the break), or `None`
    /// while the heap is empty. Lets the engine answer "is the top block
    /// free?" without a walk.
    pub(crate) top: Option<BlockRef>,
    pub(crate) stats: HeapStats,
}

// Safety: BinnedHeap owns its region; the raw block pointers never escape
// the instance.
unsafe impl Send for BinnedHeap {}

impl BinnedHeap {
    /// A heap with the default reservation.
    ///
    /// # Errors
    ///
    /// Propagates reservation failure from the host memory layer.
    pub fn new() -> Result<Self, HeapError> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A heap that can never extend past `capacity` bytes. Useful for
    /// exhaustion testing with a small cap.
    ///
    /// # Errors
    ///
    /// `InvalidCapacity` for a zero or oversized cap; otherwise reservation
    /// failure.
    pub fn with_capacity(capacity: usize) -> Result<Self, HeapError> {
        Ok(Self {
            region: HeapRegion::new(capacity)?,
            bins: FreeBins::new(),
            top: None,
            stats: HeapStats::default(),
        })
    }

    /// Allocate `n` bytes. The returned payload is 8-byte aligned and lies
    /// entirely inside `[heap_lo, heap_hi)`.
    ///
    /// Returns `None` when the request is unsatisfiable — the break cannot
    /// advance far enough, or `n` exceeds the largest supported request. In
    /// either case the heap is left exactly as it was.
    pub fn allocate(&mut self, n: usize) -> Option<NonNull<u8>> {
        let req = Self::request_size(n)?;
        let payload = self.allocate_block(req)?;
        self.stats.allocations += 1;
        Some(payload)
    }

    /// Release the block owning `ptr`, merging it with free neighbors.
    ///
    /// # Safety
    ///
    /// `ptr` must be a payload returned by [`allocate`](Self::allocate) or
    /// [`reallocate`](Self::reallocate) on this heap and not yet freed.
    /// Freeing a foreign or stale pointer is a precondition violation:
    /// debug builds assert, release builds corrupt the heap.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        // Safety: per this function's contract, ptr is a live payload.
        let block = unsafe { BlockRef::from_payload(ptr) };
        self.assert_live(block);
        self.coalesce(block);
        self.stats.frees += 1;
    }

    /// Resize the allocation at `ptr` to `n` bytes.
    ///
    /// `ptr == None` is a plain [`allocate`](Self::allocate); `n == 0`
    /// frees and returns `None`. Otherwise the engine tries, in order:
    /// returning `ptr` unchanged, shrinking in place, growing the heap
    /// under the last block, absorbing a free right neighbor, and finally
    /// moving to a fresh block (copying the payload prefix).
    ///
    /// Returns `None` on exhaustion; the original allocation is then still
    /// live and untouched.
    ///
    /// # Safety
    ///
    /// A `Some(ptr)` argument has the same contract as
    /// [`free`](Self::free): it must be a live payload from this heap.
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        n: usize,
    ) -> Option<NonNull<u8>> {
        let Some(p) = ptr else {
            return self.allocate(n);
        };
        if n == 0 {
            // Safety: p is a live payload per this function's contract.
            unsafe { self.free(p) };
            return None;
        }

        let req = Self::request_size(n)?;
        // Safety: p is a live payload per this function's contract.
        let block = unsafe { BlockRef::from_payload(p) };
        self.assert_live(block);

        let cur = block.size();

        if req == cur {
            self.stats.reallocations += 1;
            return Some(p);
        }

        if req < cur {
            self.shrink(block, req);
            self.stats.reallocations += 1;
            return Some(p);
        }

        // Last block: grow the heap underneath it and resize in place.
        if block.right().base() == self.region.high() {
            let diff = (req - cur) as usize;
            self.grow(diff).ok()?;
            block.write_size(req, false, self.region.high());
            self.stats.reallocations += 1;
            return Some(p);
        }

        // A free right neighbor that closes the gap: absorb it, trim the
        // excess back off.
        let hi = self.region.high();
        let right = block.right();
        if right.is_free() && cur + right.size() >= req {
            self.bins.extract(right);
            block.write_size(cur + right.size(), false, hi);
            self.update_top(block);
            self.shrink(block, req);
            self.stats.reallocations += 1;
            return Some(p);
        }

        // Move. On allocation failure the original block stays live.
        let new = self.allocate(n)?;
        let copy_len = (block.payload_size() as usize).min(n);
        // Safety: both payloads are live and belong to distinct blocks;
        // copy_len fits in each.
        unsafe { std::ptr::copy_nonoverlapping(p.as_ptr(), new.as_ptr(), copy_len) };
        // Safety: p is still the live old payload.
        unsafe { self.free(p) };
        self.stats.reallocations += 1;
        Some(new)
    }

    /// Collapse the heap to empty and forget every block, as between two
    /// trace runs. Counters are kept; the reservation is reused.
    pub fn reset(&mut self) {
        self.region.reset();
        self.bins.clear();
        self.top = None;
    }

    /// Inclusive low bound of the heap.
    #[inline]
    pub fn heap_lo(&self) -> *const u8 {
        self.region.low()
    }

    /// Exclusive high bound of the heap.
    #[inline]
    pub fn heap_hi(&self) -> *const u8 {
        self.region.high()
    }

    /// Current heap extent in bytes.
    #[inline]
    pub fn heap_size(&self) -> usize {
        self.region.len()
    }

    /// Diagnostic counters since construction.
    #[inline]
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    // -----------------------------------------------------------------
    // internals
    // -----------------------------------------------------------------

    /// Round a request up to a full block size: header plus payload,
    /// aligned, with enough payload to hold the free-list links the block
    /// will need once freed. `None` if the request is out of range.
    fn request_size(n: usize) -> Option<u32> {
        if n < LINKS_SIZE {
            return Some(MIN_BLOCK_SIZE);
        }
        let gross = n.checked_add(HEADER_SIZE)?;
        if gross > MAX_REQUEST_BLOCK {
            return None;
        }
        Some(align_up(gross) as u32)
    }

    fn allocate_block(&mut self, req: u32) -> Option<NonNull<u8>> {
        let hi = self.region.high();

        // Reuse: first fit across the bins, smallest class first.
        for bin in bin_of(req)..NUM_BINS {
            if let Some(block) = self.bins.pull_fit(req, bin, hi) {
                self.shrink(block, req);
                self.stats.bin_reuses += 1;
                return Some(block.payload());
            }
        }

        // A free block at the top only needs the difference grown under it.
        if let Some(top) = self.top {
            if top.is_free() {
                // Anything >= req would have been pulled from a bin above.
                debug_assert!(top.size() < req);
                let diff = (req - top.size()) as usize;
                if self.grow(diff).is_err() {
                    // A fresh block would need strictly more than diff;
                    // fail with the heap untouched.
                    return None;
                }
                self.bins.extract(top);
                top.write_size(req, false, self.region.high());
                self.stats.top_extensions += 1;
                return Some(top.payload());
            }
        }

        // Fresh block at the break.
        let prev_word = self.top.map_or(0, BlockRef::size_word);
        let base = self.grow(req as usize).ok()?;
        // Safety: [base, base + req) was just grown; base is aligned.
        let block = unsafe { BlockRef::from_base(base) };
        block.init_at_break(req, prev_word);
        self.top = Some(block);
        self.stats.break_growths += 1;
        Some(block.payload())
    }

    fn grow(&mut self, n: usize) -> Result<NonNull<u8>, HeapError> {
        let p = self.region.grow(n)?;
        self.stats.on_grow(n, self.region.len());
        Ok(p)
    }

    /// Merge `block` with its free neighbors and put the survivor on a free
    /// list. Right-merge runs before left-merge so the left neighbor
    /// absorbs the full combined size and the last-block anchor settles
    /// correctly.
    fn coalesce(&mut self, block: BlockRef) {
        let hi = self.region.high();

        let right = block.right();
        if right.base().cast_const() < hi && right.is_free() {
            self.bins.extract(right);
            block.write_size(block.size() + right.size(), false, hi);
            self.update_top(block);
        }

        if block.prev_size() > 0 {
            let left = block.left();
            if left.is_free() {
                self.bins.extract(left);
                left.write_size(left.size() + block.size(), true, hi);
                self.update_top(left);
                self.bins.push(left, hi);
                return;
            }
        }
        self.bins.push(block, hi);
    }

    /// Split `block` into a `req`-sized head (keeping the block's address
    /// and in-use state) and a free tail, unless the tail would be too
    /// small to stand alone. The tail is coalesced so it can fuse with a
    /// free block further right.
    fn shrink(&mut self, block: BlockRef, req: u32) {
        debug_assert!(req <= block.size());
        debug_assert!(!block.is_free());

        let rem = block.size() - req;
        if rem < SHRINK_MIN_SIZE {
            return;
        }

        let hi = self.region.high();
        block.write_size(req, false, hi);

        let tail = block.right();
        tail.write_size(rem, false, hi);
        self.update_top(tail);
        self.coalesce(tail);
    }

    /// Re-anchor `top` if `block` now ends at the break.
    #[inline]
    fn update_top(&mut self, block: BlockRef) {
        if block.right().base() == self.region.high() {
            self.top = Some(block);
        }
    }

    /// Precondition checks on a caller-supplied live block. Compiled out in
    /// release builds.
    fn assert_live(&self, block: BlockRef) {
        debug_assert!(
            self.region.contains(block.base()),
            "pointer outside the heap: {block:?}"
        );
        debug_assert!(
            block.base() as usize + block.size() as usize <= self.region.high() as usize,
            "block overruns the heap: {block:?}"
        );
        debug_assert!(!block.is_free(), "block already free: {block:?}");
        let right = block.right();
        if right.base().cast_const() < self.region.high() {
            debug_assert_eq!(
                right.prev_word(),
                block.size_word(),
                "boundary tag mismatch at {block:?}"
            );
        }
    }
}
