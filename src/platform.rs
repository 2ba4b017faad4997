use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for the two ways this allocator obtains raw memory from the
/// operating system: contiguous growth of the data segment and standalone
/// anonymous page mappings. The engine does not care about the APIs offered
/// by the underlying kernel, only about this contract.
pub trait PageSource {
    /// Grows (or, for a negative `delta`, shrinks) the contiguous heap
    /// segment and returns the *old* end of the segment, `sbrk` style. The
    /// first successful call establishes the segment origin. Subsequent
    /// calls must return addresses contiguous with the previous end; if the
    /// segment moved underneath the source (someone else called `sbrk`),
    /// the source must report failure so the engine can fall back to page
    /// mappings.
    ///
    /// # Safety
    ///
    /// Shrinking below the high-water mark of memory still in use frees
    /// memory the engine has handed out. The engine only ever shrinks by
    /// amounts it knows to be surplus.
    unsafe fn extend_heap(&mut self, delta: isize) -> Pointer<u8>;

    /// Returns a page-aligned read/write mapping of exactly `length` bytes,
    /// or `None` when the kernel refuses. Distinct mappings need not be
    /// contiguous with anything. The contents are unspecified; callers that
    /// need zeroed memory clear it themselves.
    unsafe fn map_pages(&mut self, length: usize) -> Pointer<u8>;

    /// Releases a mapping previously returned by
    /// [`PageSource::map_pages`] with the same base and length. Must not
    /// fail for such a mapping.
    unsafe fn unmap_pages(&mut self, base: NonNull<u8>, length: usize);

    /// Attempts to resize a mapping in place (or by moving it, if the
    /// kernel can do that cheaply). Sources without a resize primitive keep
    /// the default and return `None`, which makes the caller fall back to
    /// allocate-copy-free.
    unsafe fn remap_pages(
        &mut self,
        base: NonNull<u8>,
        old_length: usize,
        new_length: usize,
    ) -> Pointer<u8> {
        let _ = (base, old_length, new_length);
        None
    }

    /// Virtual memory page size in bytes. Constant for the process.
    fn page_size(&self) -> usize;
}

/// The real operating system, reached through `libc`. Unix only: the
/// contiguous half of the design needs an `sbrk` style primitive, which has
/// no portable analog elsewhere. Under Miri there are no foreign calls at
/// all, so the source degrades to a [`SlabSource`] internally, which is also
/// useful for detecting leaks in our own code.
pub struct SystemSource {
    /// Where we left the program break, to detect foreign `sbrk` activity.
    #[cfg(all(unix, not(miri)))]
    expected_break: Pointer<u8>,
    #[cfg(not(all(unix, not(miri))))]
    fallback: SlabSource,
}

impl SystemSource {
    pub const fn new() -> Self {
        Self {
            #[cfg(all(unix, not(miri)))]
            expected_break: None,
            #[cfg(not(all(unix, not(miri))))]
            fallback: SlabSource::new(64 * 1024 * 1024),
        }
    }
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(unix, not(miri)))]
mod unix {
    use std::ptr::{self, NonNull};

    use log::trace;

    use super::{PageSource, SystemSource};
    use crate::Pointer;

    /// Virtual memory page size. 4096 bytes on most computers. This should
    /// be a constant but we don't know the value at compile time.
    static mut PAGE_SIZE: usize = 0;

    impl PageSource for SystemSource {
        unsafe fn extend_heap(&mut self, delta: isize) -> Pointer<u8> {
            let current = libc::sbrk(0);
            if current == usize::MAX as *mut libc::c_void {
                return None;
            }

            // Somebody else moved the break since our last call. The
            // segment is no longer ours to grow; report failure so the
            // engine switches to mappings.
            if let Some(expected) = self.expected_break {
                if expected.as_ptr() != current.cast() {
                    trace!("extend_heap: foreign sbrk detected, refusing");
                    return None;
                }
            }

            let old = libc::sbrk(delta as libc::intptr_t);
            if old == usize::MAX as *mut libc::c_void {
                return None;
            }

            self.expected_break = NonNull::new(current.cast::<u8>().offset(delta));
            trace!("extend_heap({delta}) -> {old:?}");
            NonNull::new(old.cast())
        }

        unsafe fn map_pages(&mut self, length: usize) -> Pointer<u8> {
            // Private anonymous read/write pages. For all the options that
            // `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            trace!("map_pages({length})");
            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn unmap_pages(&mut self, base: NonNull<u8>, length: usize) {
            trace!("unmap_pages({base:?}, {length})");
            if libc::munmap(base.cast().as_ptr(), length) != 0 {
                // The region was ours and the arguments are the ones mmap
                // returned, so this only happens if the caller's bookkeeping
                // is broken. The memory stays mapped either way.
                log::error!("munmap({base:?}, {length}) failed");
            }
        }

        #[cfg(target_os = "linux")]
        unsafe fn remap_pages(
            &mut self,
            base: NonNull<u8>,
            old_length: usize,
            new_length: usize,
        ) -> Pointer<u8> {
            trace!("remap_pages({base:?}, {old_length} -> {new_length})");
            match libc::mremap(
                base.cast().as_ptr(),
                old_length,
                new_length,
                libc::MREMAP_MAYMOVE,
            ) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        fn page_size(&self) -> usize {
            // We only know the value at runtime by calling `sysconf`, so
            // call it once and reuse the result.
            unsafe {
                if PAGE_SIZE == 0 {
                    PAGE_SIZE = libc::sysconf(libc::_SC_PAGE_SIZE) as usize;
                }
                PAGE_SIZE
            }
        }
    }
}

#[cfg(not(all(unix, not(miri))))]
impl PageSource for SystemSource {
    unsafe fn extend_heap(&mut self, delta: isize) -> Pointer<u8> {
        self.fallback.extend_heap(delta)
    }

    unsafe fn map_pages(&mut self, length: usize) -> Pointer<u8> {
        self.fallback.map_pages(length)
    }

    unsafe fn unmap_pages(&mut self, base: NonNull<u8>, length: usize) {
        self.fallback.unmap_pages(base, length)
    }

    fn page_size(&self) -> usize {
        self.fallback.page_size()
    }
}

/// Page size reported by [`SlabSource`]. Fixed so that tests behave the
/// same on every host.
const SLAB_PAGE_SIZE: usize = 4096;

/// A [`PageSource`] over a single fixed-capacity slab obtained from the
/// global allocator, with mappings forwarded to the global allocator as
/// well. The slab plays the role of the data segment: `extend_heap` bumps a
/// break inside it, so extension is always contiguous and always either
/// succeeds or cleanly reports exhaustion.
///
/// This is what the test suite runs the engine against (real `sbrk` inside
/// a test harness would fight the harness's own allocator over the break),
/// and it doubles as an embedder's tool for running an allocator instance
/// inside a preallocated budget. Do not install a [`crate::Tagalloc`] backed
/// by this source as the global allocator: the source would then call the
/// allocator it backs.
pub struct SlabSource {
    slab: Pointer<u8>,
    capacity: usize,
    /// Current break, as an offset into the slab.
    brk: usize,
}

impl SlabSource {
    pub const fn new(capacity: usize) -> Self {
        Self {
            slab: None,
            capacity,
            brk: 0,
        }
    }

    fn slab_layout(&self) -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(self.capacity, SLAB_PAGE_SIZE).unwrap()
    }

    fn map_layout(length: usize) -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(length, SLAB_PAGE_SIZE).unwrap()
    }

    /// Allocates the slab on first use.
    unsafe fn slab(&mut self) -> Pointer<u8> {
        if self.slab.is_none() {
            self.slab = NonNull::new(std::alloc::alloc(self.slab_layout()));
        }
        self.slab
    }

    /// Bytes of the slab currently handed out. Tests use this to prove the
    /// engine gave everything back.
    pub fn bytes_in_use(&self) -> usize {
        self.brk
    }
}

impl PageSource for SlabSource {
    unsafe fn extend_heap(&mut self, delta: isize) -> Pointer<u8> {
        let slab = self.slab()?;
        let old = self.brk;

        if delta >= 0 {
            if delta as usize > self.capacity - self.brk {
                return None;
            }
            self.brk += delta as usize;
        } else {
            let shrink = delta.unsigned_abs();
            if shrink > self.brk {
                return None;
            }
            self.brk -= shrink;
        }

        Some(NonNull::new_unchecked(slab.as_ptr().add(old)))
    }

    unsafe fn map_pages(&mut self, length: usize) -> Pointer<u8> {
        NonNull::new(std::alloc::alloc(Self::map_layout(length)))
    }

    unsafe fn unmap_pages(&mut self, base: NonNull<u8>, length: usize) {
        std::alloc::dealloc(base.as_ptr(), Self::map_layout(length));
    }

    fn page_size(&self) -> usize {
        SLAB_PAGE_SIZE
    }
}

impl Drop for SlabSource {
    fn drop(&mut self) {
        if let Some(slab) = self.slab {
            unsafe { std::alloc::dealloc(slab.as_ptr(), self.slab_layout()) };
        }
    }
}

// The pointers are either the process break or exclusively owned blocks, so
// the source can hop threads with the arena that owns it.
unsafe impl Send for SystemSource {}
unsafe impl Send for SlabSource {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_extension_is_contiguous() {
        let mut source = SlabSource::new(16 * SLAB_PAGE_SIZE);
        unsafe {
            let first = source.extend_heap(SLAB_PAGE_SIZE as isize).unwrap();
            let second = source.extend_heap(SLAB_PAGE_SIZE as isize).unwrap();
            assert_eq!(
                second.as_ptr() as usize,
                first.as_ptr() as usize + SLAB_PAGE_SIZE
            );
            assert_eq!(source.bytes_in_use(), 2 * SLAB_PAGE_SIZE);

            // Shrinking hands the tail back.
            source.extend_heap(-(SLAB_PAGE_SIZE as isize)).unwrap();
            assert_eq!(source.bytes_in_use(), SLAB_PAGE_SIZE);
        }
    }

    #[test]
    fn slab_reports_exhaustion() {
        let mut source = SlabSource::new(2 * SLAB_PAGE_SIZE);
        unsafe {
            assert!(source.extend_heap(3 * SLAB_PAGE_SIZE as isize).is_none());
            assert!(source.extend_heap(2 * SLAB_PAGE_SIZE as isize).is_some());
            assert!(source.extend_heap(1).is_none());
        }
    }

    #[test]
    fn slab_mappings_round_trip() {
        let mut source = SlabSource::new(SLAB_PAGE_SIZE);
        unsafe {
            let mapping = source.map_pages(2 * SLAB_PAGE_SIZE).unwrap();
            assert_eq!(mapping.as_ptr() as usize % SLAB_PAGE_SIZE, 0);
            mapping.as_ptr().write_bytes(0xAB, 2 * SLAB_PAGE_SIZE);
            source.unmap_pages(mapping, 2 * SLAB_PAGE_SIZE);
        }
    }
}
