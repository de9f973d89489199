use std::fmt;
use std::ptr::NonNull;

use fixedbitset::FixedBitSet;

use super::bins::{bin_of, NUM_BINS};
use super::block::{BlockRef, ALIGNMENT, MIN_BLOCK_SIZE};
use super::engine::BinnedHeap;

/// A structural violation found by [`BinnedHeap::check`]. Addresses are
/// block base addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityError {
    /// A block's size is below the minimum or not alignment-granular.
    BadBlockSize { at: usize, size: usize },
    /// The block walk ran past the heap top instead of landing on it.
    BrokenTiling { at: usize, block_end: usize, heap_hi: usize },
    /// A block's boundary tag disagrees with its left neighbor's size word.
    BoundaryTagMismatch { at: usize, tag: u32, left_word: u32 },
    /// Two blocks that touch in memory are both free.
    AdjacentFreeBlocks { left: usize, right: usize },
    /// The last-block anchor does not point at the last block.
    TopAnchorMismatch { expected: usize, actual: usize },
    /// A bin links to an address that is not a free block base.
    BinEntryNotAFreeBlock { bin: usize, at: usize },
    /// A free block is reachable from more than one list position.
    DoubleBinned { bin: usize, at: usize },
    /// A block sits on a bin that does not match its size class.
    WrongBin { at: usize, bin: usize, expected: usize },
    /// A bin's prev links disagree with its next links.
    BrokenBinLinks { bin: usize, at: usize },
    /// A bin list is longer than the number of free blocks in the heap.
    FreeListCycle { bin: usize },
    /// Free blocks in the walk outnumber blocks reachable from the bins.
    UnbinnedFreeBlock { walked: usize, binned: usize },
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            IntegrityError::BadBlockSize { at, size } => {
                write!(f, "block at {at:#x} has invalid size {size}")
            }
            IntegrityError::BrokenTiling {
                at,
                block_end,
                heap_hi,
            } => write!(
                f,
                "block at {at:#x} ends at {block_end:#x}, past heap top {heap_hi:#x}"
            ),
            IntegrityError::BoundaryTagMismatch { at, tag, left_word } => write!(
                f,
                "block at {at:#x} carries tag {tag:#x} but its left neighbor's size word is {left_word:#x}"
            ),
            IntegrityError::AdjacentFreeBlocks { left, right } => {
                write!(f, "adjacent free blocks at {left:#x} and {right:#x}")
            }
            IntegrityError::TopAnchorMismatch { expected, actual } => write!(
                f,
                "last-block anchor is {actual:#x}, but the walk ends at {expected:#x}"
            ),
            IntegrityError::BinEntryNotAFreeBlock { bin, at } => {
                write!(f, "bin {bin} links to {at:#x}, which is not a free block")
            }
            IntegrityError::DoubleBinned { bin, at } => {
                write!(f, "free block at {at:#x} reachable twice (second time via bin {bin})")
            }
            IntegrityError::WrongBin { at, bin, expected } => write!(
                f,
                "block at {at:#x} sits on bin {bin} but belongs on bin {expected}"
            ),
            IntegrityError::BrokenBinLinks { bin, at } => {
                write!(f, "bin {bin}: prev link of {at:#x} disagrees with the next chain")
            }
            IntegrityError::FreeListCycle { bin } => write!(f, "bin {bin} is cyclic"),
            IntegrityError::UnbinnedFreeBlock { walked, binned } => write!(
                f,
                "{walked} free blocks in the heap but {binned} reachable from bins"
            ),
        }
    }
}

impl std::error::Error for IntegrityError {}

impl BinnedHeap {
    /// Verify the heap's structural invariants: exact tiling of
    /// `[heap_lo, heap_hi)`, boundary-tag agreement between neighbors, no
    /// two adjacent free blocks, a correct last-block anchor, and an exact
    /// one-to-one correspondence between free blocks and bin entries (each
    /// on the bin of its size class).
    ///
    /// Runs in time linear in the number of blocks; meant for tests and
    /// debugging, not for the allocation path.
    ///
    /// # Errors
    ///
    /// The first violation found, innermost structure first (the block walk
    /// is verified before the bins, since the bin checks trust it).
    pub fn check(&self) -> Result<(), IntegrityError> {
        let lo = self.region.low() as usize;
        let hi = self.region.high() as usize;

        if lo == hi {
            if let Some(top) = self.top {
                return Err(IntegrityError::TopAnchorMismatch {
                    expected: 0,
                    actual: top.base() as usize,
                });
            }
            for bin in 0..NUM_BINS {
                if let Some(head) = self.bins.head(bin) {
                    return Err(IntegrityError::BinEntryNotAFreeBlock {
                        bin,
                        at: head.base() as usize,
                    });
                }
            }
            return Ok(());
        }

        // One bit per possible block base.
        let slots = (hi - lo) / ALIGNMENT;
        let mut free_bases = FixedBitSet::with_capacity(slots);
        let mut walked_free = 0usize;

        let mut addr = lo;
        let mut prev_word = 0u32;
        let mut prev_free = false;
        let mut prev_base = 0usize;
        let mut last = None;

        while addr < hi {
            // Safety: addr started at lo and advances by block sizes that
            // have been bounds-checked against hi.
            let block = unsafe { BlockRef::from_base(NonNull::new_unchecked(addr as *mut u8)) };
            let size = block.size() as usize;

            if size < MIN_BLOCK_SIZE as usize || size % ALIGNMENT != 0 {
                return Err(IntegrityError::BadBlockSize { at: addr, size });
            }
            if addr + size > hi {
                return Err(IntegrityError::BrokenTiling {
                    at: addr,
                    block_end: addr + size,
                    heap_hi: hi,
                });
            }
            if block.prev_word() != prev_word {
                return Err(IntegrityError::BoundaryTagMismatch {
                    at: addr,
                    tag: block.prev_word(),
                    left_word: prev_word,
                });
            }
            if block.is_free() {
                if prev_free {
                    return Err(IntegrityError::AdjacentFreeBlocks {
                        left: prev_base,
                        right: addr,
                    });
                }
                free_bases.insert((addr - lo) / ALIGNMENT);
                walked_free += 1;
            }

            prev_word = block.size_word();
            prev_free = block.is_free();
            prev_base = addr;
            last = Some(block);
            addr += size;
        }
        // The loop's bound check makes the walk land exactly on hi.
        debug_assert_eq!(addr, hi);

        if self.top != last {
            return Err(IntegrityError::TopAnchorMismatch {
                expected: last.map_or(0, |b| b.base() as usize),
                actual: self.top.map_or(0, |b| b.base() as usize),
            });
        }

        // Every bin entry must be a free block from the walk, linked
        // consistently, on the right bin, and reachable exactly once.
        let mut seen = FixedBitSet::with_capacity(slots);
        let mut binned = 0usize;

        for bin in 0..NUM_BINS {
            let mut hops = 0usize;
            let mut expected_prev: Option<BlockRef> = None;
            let mut cursor = self.bins.head(bin);
            while let Some(block) = cursor {
                // Validate membership before touching the node's links: a
                // corrupt head could point anywhere.
                let at = block.base() as usize;
                let in_heap = at >= lo && at < hi && (at - lo) % ALIGNMENT == 0;
                if !in_heap || !free_bases.contains((at - lo) / ALIGNMENT) {
                    return Err(IntegrityError::BinEntryNotAFreeBlock { bin, at });
                }
                let idx = (at - lo) / ALIGNMENT;
                if seen.contains(idx) {
                    return Err(IntegrityError::DoubleBinned { bin, at });
                }
                seen.insert(idx);

                if block.prev_free() != expected_prev {
                    return Err(IntegrityError::BrokenBinLinks { bin, at });
                }

                let expected = bin_of(block.size());
                if expected != bin {
                    return Err(IntegrityError::WrongBin { at, bin, expected });
                }

                hops += 1;
                if hops > walked_free {
                    return Err(IntegrityError::FreeListCycle { bin });
                }
                expected_prev = Some(block);
                cursor = block.next_free();
            }
            binned += hops;
        }

        if binned != walked_free {
            return Err(IntegrityError::UnbinnedFreeBlock {
                walked: walked_free,
                binned,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> BinnedHeap {
        BinnedHeap::with_capacity(1 << 20).unwrap()
    }

    fn block_of(p: NonNull<u8>) -> BlockRef {
        // Safety: test pointers come straight from allocate.
        unsafe { BlockRef::from_payload(p) }
    }

    #[test]
    fn empty_heap_is_clean() {
        let h = heap();
        h.check().unwrap();
    }

    #[test]
    fn live_heap_with_bins_is_clean() {
        let mut h = heap();
        let a = h.allocate(100).unwrap();
        let b = h.allocate(2000).unwrap();
        let _c = h.allocate(40).unwrap();
        // Safety: a and b are live.
        unsafe {
            h.free(a);
            h.free(b);
        }
        h.check().unwrap();
    }

    #[test]
    fn detects_boundary_tag_corruption() {
        let mut h = heap();
        let a = h.allocate(24).unwrap();
        let _b = h.allocate(24).unwrap();

        // Flip a's free bit without fixing the neighbor's tag.
        let word = block_of(a).size_word();
        // Safety: writing inside a's header, which we own for this test.
        unsafe {
            block_of(a).base().add(4).cast::<u32>().write(word | 1);
        }

        match h.check() {
            Err(IntegrityError::BoundaryTagMismatch { .. }) => {}
            other => panic!("expected BoundaryTagMismatch, got {other:?}"),
        }
    }

    #[test]
    fn detects_free_block_missing_from_bins() {
        let mut h = heap();
        let _a = h.allocate(24).unwrap();
        let b = h.allocate(24).unwrap();

        // Raw-set the free bit on the top block (no neighbor tag to fix)
        // without pushing it onto a bin.
        let word = block_of(b).size_word();
        // Safety: writing inside b's header, which we own for this test.
        unsafe {
            block_of(b).base().add(4).cast::<u32>().write(word | 1);
        }

        match h.check() {
            Err(IntegrityError::UnbinnedFreeBlock { walked: 1, binned: 0 }) => {}
            other => panic!("expected UnbinnedFreeBlock, got {other:?}"),
        }
    }

    #[test]
    fn detects_adjacent_free_blocks() {
        let mut h = heap();
        let a = h.allocate(24).unwrap();
        let b = h.allocate(24).unwrap();
        let _c = h.allocate(24).unwrap();
        // Safety: a is live.
        unsafe { h.free(a) };

        // Fake-free b by hand, fixing its mirror so the tag check passes
        // and the adjacency rule is the first thing to trip.
        let ba = block_of(a);
        let bb = block_of(b);
        let word = bb.size_word() | 1;
        // Safety: writing b's header and c's tag, both inside the heap.
        unsafe {
            bb.base().add(4).cast::<u32>().write(word);
            bb.right().base().cast::<u32>().write(word);
        }

        match h.check() {
            Err(IntegrityError::AdjacentFreeBlocks { left, right }) => {
                assert_eq!(left, ba.base() as usize);
                assert_eq!(right, bb.base() as usize);
            }
            other => panic!("expected AdjacentFreeBlocks, got {other:?}"),
        }
    }

    #[test]
    fn detects_stale_top_anchor() {
        let mut h = heap();
        let _a = h.allocate(24).unwrap();
        h.top = None;

        match h.check() {
            Err(IntegrityError::TopAnchorMismatch { actual: 0, .. }) => {}
            other => panic!("expected TopAnchorMismatch, got {other:?}"),
        }
    }

    #[test]
    fn detects_undersized_block() {
        let mut h = heap();
        let a = h.allocate(24).unwrap();

        // Safety: writing a's header, which we own for this test.
        unsafe {
            block_of(a).base().add(4).cast::<u32>().write(8);
        }

        match h.check() {
            Err(IntegrityError::BadBlockSize { size: 8, .. }) => {}
            other => panic!("expected BadBlockSize, got {other:?}"),
        }
    }
}
