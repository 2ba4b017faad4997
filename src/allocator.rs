use std::{
    alloc::{AllocError, Allocator, GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{
    arena::Arena,
    chunk::CHUNK_ALIGN,
    platform::{PageSource, SystemSource},
    stats::ArenaStats,
};

/// Runtime-tunable thresholds, the `mallopt` analog. Unknown parameters do
/// not exist by construction; out-of-range values are rejected with `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneParameter {
    /// Request-size bound for the fast bins, accepted in `0..=80`. Zero
    /// disables fast bins entirely.
    MaxFast,
    /// Top surplus in bytes beyond which a free shrinks the heap.
    TrimThreshold,
    /// Slack in bytes requested on top of every heap extension.
    TopPad,
    /// Request size at which allocation switches to page mappings.
    MmapThreshold,
    /// Maximum number of simultaneous page mappings.
    MmapMax,
}

/// The process-facing allocator: one arena behind one process-wide lock.
///
/// All operations take `&self` and serialize on the lock, so a single
/// instance can back any number of threads. The heavy lifting happens in
/// the arena; this type only adds the lock, the null-pointer conventions of
/// the classic `malloc` surface, and the standard allocator traits.
///
/// # Examples
///
/// ## Standalone
///
/// ```no_run
/// use tagalloc::Tagalloc;
///
/// let allocator = Tagalloc::new();
///
/// let pointer = allocator.allocate(128);
/// assert!(!pointer.is_null());
/// unsafe {
///     assert!(allocator.usable_size(pointer) >= 128);
///     allocator.free(pointer);
/// }
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use tagalloc::Tagalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Tagalloc = Tagalloc::new();
///
/// fn main() {
///     let number = Box::new(5);
///     assert_eq!(*number, 5);
/// }
/// ```
pub struct Tagalloc<P: PageSource = SystemSource> {
    allocator: Mutex<Arena<P>>,
}

impl Tagalloc {
    /// An allocator backed by the operating system (`sbrk` + anonymous
    /// mappings).
    pub const fn new() -> Self {
        Self::with_source(SystemSource::new())
    }
}

impl Default for Tagalloc {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PageSource> Tagalloc<P> {
    /// An allocator drawing raw memory from the given source. Useful for
    /// running inside a fixed budget, see [`crate::SlabSource`].
    pub const fn with_source(source: P) -> Self {
        Self {
            allocator: Mutex::new(Arena::new(source)),
        }
    }

    /// Allocates `size` bytes, aligned for any fundamental type. Returns
    /// null when `size` is zero or the request cannot be satisfied.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        match self.allocator.lock() {
            Ok(mut arena) => unsafe { arena.allocate(size) }
                .map_or(ptr::null_mut(), |pointer| pointer.as_ptr()),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Allocates a zeroed array of `count` elements of `elem_size` bytes.
    /// Returns null when the total size overflows, without touching the
    /// arena, and on ordinary exhaustion.
    pub fn allocate_zeroed(&self, count: usize, elem_size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(elem_size) else {
            return ptr::null_mut();
        };
        let pointer = self.allocate(total);
        if !pointer.is_null() {
            unsafe { pointer.write_bytes(0, total) };
        }
        pointer
    }

    /// Allocates `size` bytes whose address is a multiple of `alignment`.
    /// Returns null when `alignment` is not a power of two.
    pub fn allocate_aligned(&self, alignment: usize, size: usize) -> *mut u8 {
        match self.allocator.lock() {
            Ok(mut arena) => unsafe { arena.allocate_aligned(alignment, size) }
                .map_or(ptr::null_mut(), |pointer| pointer.as_ptr()),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Allocates `size` bytes on a page boundary, the `valloc` analog.
    pub fn allocate_page_aligned(&self, size: usize) -> *mut u8 {
        match self.allocator.lock() {
            Ok(mut arena) => {
                let page = arena.page_size();
                unsafe { arena.allocate_aligned(page, size) }
                    .map_or(ptr::null_mut(), |pointer| pointer.as_ptr())
            }
            Err(_) => ptr::null_mut(),
        }
    }

    /// Resizes the allocation at `pointer` to `new_size` bytes, moving it
    /// when it cannot grow in place. A null `pointer` allocates, a zero
    /// `new_size` frees. On failure the old allocation stays intact and
    /// null is returned.
    ///
    /// # Safety
    ///
    /// `pointer` must be null or previously returned by this allocator and
    /// not freed since.
    pub unsafe fn reallocate(&self, pointer: *mut u8, new_size: usize) -> *mut u8 {
        if pointer.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            self.free(pointer);
            return ptr::null_mut();
        }
        match self.allocator.lock() {
            Ok(mut arena) => arena
                .reallocate(NonNull::new_unchecked(pointer), new_size)
                .map_or(ptr::null_mut(), |new_pointer| new_pointer.as_ptr()),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Releases an allocation. Null is silently ignored.
    ///
    /// # Safety
    ///
    /// `pointer` must be null or previously returned by this allocator and
    /// not freed since.
    pub unsafe fn free(&self, pointer: *mut u8) {
        let Some(pointer) = NonNull::new(pointer) else {
            return;
        };
        if let Ok(mut arena) = self.allocator.lock() {
            arena.free(pointer);
        }
    }

    /// Bytes actually usable behind `pointer`, at least what was requested.
    /// Zero for null or unrecognizable pointers.
    ///
    /// # Safety
    ///
    /// `pointer` must be null or a live pointer from this allocator.
    pub unsafe fn usable_size(&self, pointer: *const u8) -> usize {
        let Some(pointer) = NonNull::new(pointer.cast_mut()) else {
            return 0;
        };
        match self.allocator.lock() {
            Ok(_arena) => Arena::<P>::usable_size(pointer),
            Err(_) => 0,
        }
    }

    /// Adjusts a threshold at runtime. Returns whether the value was
    /// accepted.
    pub fn tune(&self, parameter: TuneParameter, value: usize) -> bool {
        match self.allocator.lock() {
            Ok(mut arena) => arena.tune(parameter, value),
            Err(_) => false,
        }
    }

    /// Read-only snapshot of the resource counters and thresholds.
    pub fn stats(&self) -> ArenaStats {
        self.allocator
            .lock()
            .map(|arena| arena.stats())
            .unwrap_or_default()
    }

    /// Consolidates deferred free chunks and releases top surplus beyond
    /// `pad` bytes back to the operating system, the `malloc_trim` analog.
    /// Returns whether any memory was released.
    pub fn trim(&self, pad: usize) -> bool {
        match self.allocator.lock() {
            Ok(mut arena) => unsafe { arena.trim(pad) },
            Err(_) => false,
        }
    }

    /// Chooses the response to detected heap corruption: abort the process
    /// with a diagnostic (the default), or turn the offending operation
    /// into a silent no-op.
    pub fn set_abort_on_corruption(&self, enabled: bool) {
        if let Ok(mut arena) = self.allocator.lock() {
            arena.set_abort_on_corruption(enabled);
        }
    }
}

/// A zero-size allocation has no memory behind it; hand out an aligned
/// non-null address that is never dereferenced and never freed.
fn zero_sized(layout: Layout) -> NonNull<[u8]> {
    let dangling = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
    NonNull::slice_from_raw_parts(dangling, 0)
}

unsafe impl<P: PageSource> Allocator for Tagalloc<P> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(zero_sized(layout));
        }

        let Ok(mut arena) = self.allocator.lock() else {
            return Err(AllocError);
        };
        let pointer = unsafe {
            if layout.align() <= CHUNK_ALIGN {
                arena.allocate(layout.size())
            } else {
                arena.allocate_aligned(layout.align(), layout.size())
            }
        }
        .ok_or(AllocError)?;

        let usable = unsafe { Arena::<P>::usable_size(pointer) };
        Ok(NonNull::slice_from_raw_parts(pointer, usable))
    }

    unsafe fn deallocate(&self, pointer: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        if let Ok(mut arena) = self.allocator.lock() {
            arena.free(pointer);
        }
    }

    unsafe fn grow(
        &self,
        pointer: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        if old_layout.size() == 0 {
            return Allocator::allocate(self, new_layout);
        }

        if new_layout.align() <= CHUNK_ALIGN {
            let Ok(mut arena) = self.allocator.lock() else {
                return Err(AllocError);
            };
            let new_pointer = arena
                .reallocate(pointer, new_layout.size())
                .ok_or(AllocError)?;
            let usable = Arena::<P>::usable_size(new_pointer);
            return Ok(NonNull::slice_from_raw_parts(new_pointer, usable));
        }

        // Plain reallocation cannot promise an oversized alignment, so the
        // block moves through a fresh aligned allocation.
        let new_block = Allocator::allocate(self, new_layout)?;
        ptr::copy_nonoverlapping(
            pointer.as_ptr(),
            new_block.as_ptr().cast::<u8>(),
            old_layout.size(),
        );
        self.deallocate(pointer, old_layout);
        Ok(new_block)
    }

    unsafe fn grow_zeroed(
        &self,
        pointer: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let new_block = self.grow(pointer, old_layout, new_layout)?;
        let raw = new_block.as_ptr().cast::<u8>();
        raw.add(old_layout.size())
            .write_bytes(0, new_block.len() - old_layout.size());
        Ok(new_block)
    }

    unsafe fn shrink(
        &self,
        pointer: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        if new_layout.size() == 0 {
            self.deallocate(pointer, old_layout);
            return Ok(zero_sized(new_layout));
        }
        if old_layout.size() == 0 {
            return Allocator::allocate(self, new_layout);
        }

        if new_layout.align() <= CHUNK_ALIGN {
            let Ok(mut arena) = self.allocator.lock() else {
                return Err(AllocError);
            };
            let new_pointer = arena
                .reallocate(pointer, new_layout.size())
                .ok_or(AllocError)?;
            let usable = Arena::<P>::usable_size(new_pointer);
            return Ok(NonNull::slice_from_raw_parts(new_pointer, usable));
        }

        let new_block = Allocator::allocate(self, new_layout)?;
        ptr::copy_nonoverlapping(
            pointer.as_ptr(),
            new_block.as_ptr().cast::<u8>(),
            new_layout.size(),
        );
        self.deallocate(pointer, old_layout);
        Ok(new_block)
    }
}

unsafe impl<P: PageSource> GlobalAlloc for Tagalloc<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= CHUNK_ALIGN {
            self.allocate(layout.size())
        } else {
            self.allocate_aligned(layout.align(), layout.size())
        }
    }

    unsafe fn dealloc(&self, pointer: *mut u8, _layout: Layout) {
        self.free(pointer);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let pointer = self.alloc(layout);
        if !pointer.is_null() {
            pointer.write_bytes(0, layout.size());
        }
        pointer
    }

    unsafe fn realloc(&self, pointer: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= CHUNK_ALIGN {
            return self.reallocate(pointer, new_size);
        }

        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        let new_pointer = self.alloc(new_layout);
        if !new_pointer.is_null() {
            ptr::copy_nonoverlapping(pointer, new_pointer, layout.size().min(new_size));
            self.free(pointer);
        }
        new_pointer
    }
}
