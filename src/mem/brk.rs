use std::fmt;
use std::ptr::NonNull;

use super::block::ALIGNMENT;

/// Hard ceiling on a region's reserved capacity. Block sizes are stored in
/// 32-bit boundary tags, so no block (and therefore no heap) may span more
/// than this.
pub(crate) const MAX_REGION_BYTES: usize = 1 << 31;

#[derive(Debug)]
pub enum HeapError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    Exhausted { requested: usize, available: usize },
    InvalidCapacity { requested: usize, max: usize },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::ReservationFailed(e) => write!(f, "heap reservation failed: {e}"),
            HeapError::CommitFailed(e) => write!(f, "heap commit failed: {e}"),
            HeapError::Exhausted {
                requested,
                available,
            } => write!(
                f,
                "heap exhausted: break advance of {requested} bytes exceeds remaining {available}"
            ),
            HeapError::InvalidCapacity { requested, max } => write!(
                f,
                "invalid heap capacity: {requested} bytes (must be nonzero and at most {max})"
            ),
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HeapError::ReservationFailed(e) | HeapError::CommitFailed(e) => Some(e),
            HeapError::Exhausted { .. } | HeapError::InvalidCapacity { .. } => None,
        }
    }
}

/// A one-way break-pointer heap over a single reserved address range.
///
/// The full capacity is reserved once at construction; physical pages are
/// committed lazily as [`grow`](Self::grow) advances the break. The break
/// only moves up — there is no shrink, only [`reset`](Self::reset), which
/// collapses the region to empty between runs.
///
/// The region knows nothing about block structure; it hands out raw byte
/// ranges and keeps the `[low, high)` bounds.
#[derive(Debug)]
pub struct HeapRegion {
    base: NonNull<u8>,
    brk: usize,
    committed: usize,
    reserved: usize,
}

// Safety: HeapRegion owns its reservation exclusively.
unsafe impl Send for HeapRegion {}

impl HeapRegion {
    /// Reserve a region of (at least) `capacity` bytes. The capacity is
    /// rounded up to the page size; the base address is page-aligned, which
    /// also makes the heap bottom cache-line aligned.
    ///
    /// # Errors
    ///
    /// `InvalidCapacity` if `capacity` is zero or exceeds
    /// [`MAX_REGION_BYTES`]; `ReservationFailed` if the host refuses the
    /// reservation.
    pub fn new(capacity: usize) -> Result<Self, HeapError> {
        if capacity == 0 || capacity > MAX_REGION_BYTES {
            return Err(HeapError::InvalidCapacity {
                requested: capacity,
                max: MAX_REGION_BYTES,
            });
        }
        let reserved = capacity.next_multiple_of(sys::page_size());

        // Safety: reserved is nonzero.
        let base = unsafe { sys::reserve(reserved)? };
        debug_assert_eq!(base.as_ptr() as usize % sys::page_size(), 0);

        Ok(Self {
            base,
            brk: 0,
            committed: 0,
            reserved,
        })
    }

    /// Advance the break by `n` bytes and return the *previous* break — the
    /// base address of the newly usable range. `n` must be a multiple of
    /// [`ALIGNMENT`].
    ///
    /// On failure nothing changes: the break, the committed watermark, and
    /// all previously returned ranges stay valid.
    ///
    /// # Errors
    ///
    /// `Exhausted` if the advance would pass the reservation limit;
    /// `CommitFailed` if backing pages cannot be committed.
    pub fn grow(&mut self, n: usize) -> Result<NonNull<u8>, HeapError> {
        debug_assert!(
            n % ALIGNMENT == 0,
            "break advance of {n} bytes is not {ALIGNMENT}-byte aligned"
        );

        let new_brk = match self.brk.checked_add(n) {
            Some(v) if v <= self.reserved => v,
            _ => {
                return Err(HeapError::Exhausted {
                    requested: n,
                    available: self.reserved - self.brk,
                })
            }
        };

        if new_brk > self.committed {
            // reserved is a page multiple, so the rounded target never
            // passes it.
            let target = new_brk.next_multiple_of(sys::page_size());
            // Safety: committed offset is within the reservation.
            let start = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.committed)) };
            // Safety: [committed, target) lies within the reservation.
            unsafe { sys::commit(start, target - self.committed)? };
            self.committed = target;
        }

        // Safety: brk is within the reservation.
        let old = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk)) };
        self.brk = new_brk;
        Ok(old)
    }

    /// Collapse the region to empty: after this, `low() == high()`.
    ///
    /// All blocks previously carved out of the region are discarded without
    /// any per-block teardown; the caller must also drop its own block
    /// bookkeeping (bin heads, anchors). Committed pages are kept for the
    /// next run.
    pub fn reset(&mut self) {
        self.brk = 0;
    }

    /// Inclusive low bound of the heap.
    #[inline]
    pub fn low(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Exclusive high bound of the heap (the current break).
    #[inline]
    pub fn high(&self) -> *mut u8 {
        // Safety: brk is within the reservation.
        unsafe { self.base.as_ptr().add(self.brk) }
    }

    /// Whether `p` lies inside `[low, high)`.
    #[inline]
    pub fn contains(&self, p: *const u8) -> bool {
        let addr = p as usize;
        let lo = self.base.as_ptr() as usize;
        addr >= lo && addr < lo + self.brk
    }

    /// Current heap extent in bytes (`high - low`).
    #[inline]
    pub fn len(&self) -> usize {
        self.brk
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.brk == 0
    }

    /// Total reserved capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.reserved
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // Safety: base/reserved describe the reservation made in new().
        unsafe { sys::release(self.base, self.reserved) };
    }
}

// ---------------------------------------------------------------------------
// Backing primitive.
//
// On unix the reservation is a PROT_NONE mapping and commit is mprotect; the
// break advancing over uncommitted pages is what actually consumes memory.
// Under Miri (or off unix) the whole capacity is a single zeroed heap
// allocation and commit is a no-op — enough to check the pointer logic, not
// the paging behavior.
// ---------------------------------------------------------------------------

#[cfg(all(unix, not(miri)))]
mod sys {
    use super::{HeapError, NonNull};
    use std::io;

    pub unsafe fn reserve(size: usize) -> Result<NonNull<u8>, HeapError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(HeapError::ReservationFailed(io::Error::last_os_error()));
        }

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| HeapError::ReservationFailed(io::Error::other("mmap returned null")))
    }

    pub unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), HeapError> {
        // Safety: FFI call to mprotect.
        if unsafe {
            libc::mprotect(
                ptr.as_ptr().cast::<libc::c_void>(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        } != 0
        {
            return Err(HeapError::CommitFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub unsafe fn release(ptr: NonNull<u8>, size: usize) {
        // Safety: FFI call to munmap. Failure here is unrecoverable and
        // ignored, matching every other Drop in the crate.
        unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) };
    }

    pub fn page_size() -> usize {
        use std::sync::OnceLock;
        static CACHED: OnceLock<usize> = OnceLock::new();
        *CACHED.get_or_init(|| {
            // Safety: FFI call to sysconf.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            assert!(
                raw > 0,
                "sysconf(_SC_PAGESIZE) failed: {}",
                io::Error::last_os_error()
            );
            raw as usize
        })
    }
}

#[cfg(any(miri, not(unix)))]
mod sys {
    use super::{HeapError, NonNull};

    const FALLBACK_PAGE: usize = 4096;

    pub unsafe fn reserve(size: usize) -> Result<NonNull<u8>, HeapError> {
        let layout = std::alloc::Layout::from_size_align(size, FALLBACK_PAGE)
            .map_err(|e| HeapError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has nonzero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            HeapError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    pub unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), HeapError> {
        Ok(()) // heap memory is always accessible
    }

    pub unsafe fn release(ptr: NonNull<u8>, size: usize) {
        let Ok(layout) = std::alloc::Layout::from_size_align(size, FALLBACK_PAGE) else {
            return;
        };
        // Safety: ptr was allocated with the same layout in reserve().
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }

    pub fn page_size() -> usize {
        FALLBACK_PAGE
    }
}
