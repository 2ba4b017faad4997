use std::ptr::{self, NonNull};

use log::error;

use crate::{
    align::{align_down, align_up, is_aligned},
    allocator::TuneParameter,
    bins::{
        bin_index, fastbin_index, in_smallbin_range, largebin_index, map_bit, map_word,
        smallbin_index, BinDirectory, BINMAP_WORDS, DIRECTORY_BYTES, NBINS, NFASTBINS, UNSORTED,
    },
    chunk::{
        is_user_aligned, request_to_chunk_size, Chunk, CHUNK_ALIGN, CHUNK_ALIGN_MASK,
        CHUNK_OVERHEAD, IS_MMAPPED, MIN_CHUNK_SIZE, MMAP_OVERHEAD, PREV_INUSE,
    },
    platform::PageSource,
    stats::ArenaStats,
    Pointer,
};

/// Default fast-bin threshold: requests up to 64 bytes take the fast path.
const DEFAULT_MAX_FAST: usize = align_up(64 + CHUNK_OVERHEAD, CHUNK_ALIGN);

/// Default top surplus beyond which a free shrinks the heap segment.
const DEFAULT_TRIM_THRESHOLD: usize = 128 * 1024;

/// Default extra slack added to every heap extension.
const DEFAULT_TOP_PAD: usize = 0;

/// Default request size at which allocation switches to page mappings.
const DEFAULT_MMAP_THRESHOLD: usize = 128 * 1024;

/// Default cap on simultaneous page mappings.
const DEFAULT_MMAP_MAX: usize = 65536;

/// Freeing a chunk at least this big consolidates the fast bins, on the
/// theory that a program releasing large blocks is near a phase change and
/// deferred coalescing has done its job.
const FASTBIN_CONSOLIDATION_THRESHOLD: usize = 64 * 1024;

/// Upper bound on chunks examined per unsorted-bin drain, so one allocation
/// can never stall on an arbitrarily long backlog.
const MAX_UNSORTED_SCAN: usize = 10_000;

/// A discontiguous heap extension seals the old segment behind two minimal
/// in-use chunks that nothing can coalesce across.
const FENCE_SIZE: usize = MIN_CHUNK_SIZE;

/// The allocation engine and all of its state: the top chunk, the fast
/// bins, the sorted-bin directory with its occupancy bitmap, the resource
/// counters and the runtime tunables.
///
/// One arena owns one contiguous heap segment (plus any standalone page
/// mappings) and is strictly single-threaded: every method takes `&mut
/// self` and runs to completion. [`crate::Tagalloc`] provides the locked
/// multi-threaded wrapper.
///
/// The serving order for an allocation, fastest to slowest:
///
/// ```text
///  request -> fast bin -> small bin -> unsorted drain -> large bins
///                 |                                          |
///                 v                                          v
///            exact size,                               best fit, split
///            no coalescing                             remainder kept
///                                                           |
///             top chunk  <-  consolidate + retry  <---------+
///                 |
///                 v
///            page mapping (large requests) / heap extension
/// ```
pub(crate) struct Arena<P: PageSource> {
    source: P,
    /// Sorted-bin sentinels, mapped on first use.
    directory: Option<BinDirectory>,
    /// One bit per bin: set when the bin may contain chunks. Bits go stale
    /// when a bin empties through an exact-fit serve and are cleared lazily
    /// by the next scan.
    binmap: [u32; BINMAP_WORDS],
    /// Singly linked LIFO lists of same-sized small chunks.
    fastbins: [Pointer<Chunk>; NFASTBINS],
    have_fast_chunks: bool,
    /// The wilderness chunk at the high end of the segment. `None` before
    /// the first extension and after the top is consumed whole.
    top: Pointer<Chunk>,
    /// The raw segment break, for contiguity checks against the source.
    break_end: Pointer<u8>,
    /// End of chunk-covered memory. At most [`CHUNK_ALIGN`] bytes below
    /// [`Self::break_end`] (alignment slack of the initial break).
    arena_end: Pointer<u8>,
    max_fast: usize,
    trim_threshold: usize,
    top_pad: usize,
    mmap_threshold: usize,
    mmap_max: usize,
    /// Corruption response: terminate loudly, or turn the operation into a
    /// no-op and keep limping.
    abort_on_corruption: bool,
    heap_bytes: usize,
    max_heap_bytes: usize,
    mapped_bytes: usize,
    max_mapped_bytes: usize,
    mapping_count: usize,
    max_mapping_count: usize,
}

// The raw chunk pointers all target memory exclusively owned by the arena.
unsafe impl<P: PageSource + Send> Send for Arena<P> {}

impl<P: PageSource> Arena<P> {
    pub const fn new(source: P) -> Self {
        Self {
            source,
            directory: None,
            binmap: [0; BINMAP_WORDS],
            fastbins: [None; NFASTBINS],
            have_fast_chunks: false,
            top: None,
            break_end: None,
            arena_end: None,
            max_fast: DEFAULT_MAX_FAST,
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
            top_pad: DEFAULT_TOP_PAD,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            mmap_max: DEFAULT_MMAP_MAX,
            abort_on_corruption: true,
            heap_bytes: 0,
            max_heap_bytes: 0,
            mapped_bytes: 0,
            max_mapped_bytes: 0,
            mapping_count: 0,
            max_mapping_count: 0,
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.source.page_size()
    }

    pub fn set_abort_on_corruption(&mut self, enabled: bool) {
        self.abort_on_corruption = enabled;
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            bytes_via_heap_extend: self.heap_bytes,
            max_bytes_via_heap_extend: self.max_heap_bytes,
            bytes_via_mapping: self.mapped_bytes,
            max_bytes_via_mapping: self.max_mapped_bytes,
            mapping_count: self.mapping_count,
            max_mapping_count: self.max_mapping_count,
            max_fast: self.max_fast,
            trim_threshold: self.trim_threshold,
            top_pad: self.top_pad,
            mmap_threshold: self.mmap_threshold,
            mmap_max: self.mmap_max,
        }
    }

    pub fn tune(&mut self, parameter: TuneParameter, value: usize) -> bool {
        match parameter {
            TuneParameter::MaxFast => {
                if value > 80 {
                    return false;
                }
                // 0 disables the fast bins entirely.
                self.max_fast = if value == 0 {
                    0
                } else {
                    request_to_chunk_size(value).unwrap()
                };
                true
            }
            TuneParameter::TrimThreshold => {
                self.trim_threshold = value;
                true
            }
            TuneParameter::TopPad => {
                self.top_pad = value;
                true
            }
            TuneParameter::MmapThreshold => {
                self.mmap_threshold = value;
                true
            }
            TuneParameter::MmapMax => {
                self.mmap_max = value;
                true
            }
        }
    }

    /// Handles detected metadata corruption: dies loudly when configured
    /// to, otherwise the caller turns the operation into a no-op.
    fn report_corruption(&self, context: &str) {
        error!("heap corruption detected: {context}");
        if self.abort_on_corruption {
            std::process::abort();
        }
    }

    #[inline]
    fn mark_bin(&mut self, index: usize) {
        self.binmap[map_word(index)] |= map_bit(index);
    }

    #[inline]
    fn clear_bin(&mut self, index: usize) {
        self.binmap[map_word(index)] &= !map_bit(index);
    }

    /// One-shot lazy initialization of the bin directory. The sentinels are
    /// self-referential, so they live in a mapping whose address never
    /// changes rather than in this (movable) struct.
    unsafe fn directory(&mut self) -> Option<BinDirectory> {
        if self.directory.is_none() {
            let length = align_up(DIRECTORY_BYTES, self.page_size());
            let base = self.source.map_pages(length)?;
            self.directory = Some(BinDirectory::init(base));
        }
        self.directory
    }

    // === Allocation ======================================================

    /// Serves a user request of `request` bytes, or `None` for a zero-sized
    /// or unsatisfiable request.
    pub unsafe fn allocate(&mut self, request: usize) -> Pointer<u8> {
        if request == 0 {
            return None;
        }
        let size = request_to_chunk_size(request)?;
        let chunk = self.allocate_chunk(size)?;
        Some(Chunk::user_pointer_of(chunk))
    }

    /// The allocation priority chain, on a normalized chunk size.
    unsafe fn allocate_chunk(&mut self, size: usize) -> Pointer<Chunk> {
        let directory = self.directory()?;

        // Fast bin: exact size, no flag updates. Fast chunks stay "in use"
        // to their neighbors, so serving one is a single pop.
        if size <= self.max_fast {
            let index = fastbin_index(size);
            if let Some(chunk) = self.fastbins[index] {
                if Chunk::size(chunk) != size {
                    self.report_corruption("malloc(): memory corruption (fast)");
                    return None;
                }
                self.fastbins[index] = Chunk::fd(chunk);
                Chunk::set_fd(chunk, None);
                return Some(chunk);
            }
        }

        // Small bin: exact size, oldest first.
        if in_smallbin_range(size) {
            let index = smallbin_index(size);
            if let Some(chunk) = directory.last(index) {
                if directory.unlink(chunk).is_err() {
                    self.report_corruption("malloc(): corrupted small bin");
                    return None;
                }
                if directory.is_empty(index) {
                    self.clear_bin(index);
                }
                Chunk::set_inuse(chunk);
                return Some(chunk);
            }
        }

        let mut consolidated = false;
        loop {
            if let Some(chunk) = self.drain_unsorted(size) {
                return Some(chunk);
            }
            if let Some(chunk) = self.search_bins(size) {
                return Some(chunk);
            }
            if let Some(chunk) = self.split_top(size) {
                return Some(chunk);
            }

            // Everything missed: fold the fast bins back into real free
            // chunks and give the bins one more chance.
            if !consolidated && self.have_fast_chunks {
                self.consolidate();
                consolidated = true;
            } else {
                break;
            }
        }

        // Large requests become standalone mappings and never touch the
        // segment.
        if size >= self.mmap_threshold && self.mapping_count < self.mmap_max {
            if let Some(chunk) = self.mmap_chunk(size) {
                return Some(chunk);
            }
        }

        // Grow the heap. If the segment cannot grow at all, a mapping is
        // the last resort regardless of the threshold.
        if self.extend_heap_for(size) {
            if let Some(chunk) = self.split_top(size) {
                return Some(chunk);
            }
        } else if let Some(chunk) = self.mmap_chunk(size) {
            return Some(chunk);
        }

        None
    }

    /// Takes chunks off the unsorted bin one at a time: an exact fit is
    /// served on the spot, everything else is sorted into its permanent
    /// bin. Bounded so a huge backlog cannot stall one allocation.
    unsafe fn drain_unsorted(&mut self, wanted: usize) -> Pointer<Chunk> {
        let directory = self.directory.unwrap();

        for _ in 0..MAX_UNSORTED_SCAN {
            let Some(chunk) = directory.last(UNSORTED) else {
                break;
            };

            let size = Chunk::size(chunk);
            if size < MIN_CHUNK_SIZE || !is_aligned(size, CHUNK_ALIGN) || size > self.heap_bytes {
                self.report_corruption("malloc(): corrupted unsorted chunks");
                break;
            }
            if directory.unlink(chunk).is_err() {
                self.report_corruption("malloc(): corrupted unsorted chunks");
                break;
            }

            if size == wanted {
                Chunk::set_inuse(chunk);
                return Some(chunk);
            }

            let index = bin_index(size);
            if in_smallbin_range(size) {
                directory.insert_small(index, chunk);
            } else {
                directory.insert_large(index, chunk);
            }
            self.mark_bin(index);
        }

        None
    }

    /// Best-fit search over the sorted bins: the large bin covering the
    /// size first, then the bitmap scan across every later (bigger) bin.
    unsafe fn search_bins(&mut self, wanted: usize) -> Pointer<Chunk> {
        let directory = self.directory.unwrap();

        let mut index = if in_smallbin_range(wanted) {
            // The exact small bin already missed; the scan below covers the
            // larger ones.
            smallbin_index(wanted)
        } else {
            let index = largebin_index(wanted);
            if let Some(chunk) = directory.smallest_at_least(index, wanted) {
                if directory.unlink(chunk).is_err() {
                    self.report_corruption("malloc(): corrupted large bin");
                    return None;
                }
                if directory.is_empty(index) {
                    self.clear_bin(index);
                }
                return Some(self.split_or_serve(chunk, wanted));
            }
            index
        };

        // Any chunk in a later bin is big enough, so the smallest chunk of
        // the first non-empty bin is the best fit.
        index += 1;
        while index < NBINS {
            if self.binmap[map_word(index)] & map_bit(index) == 0 {
                if self.binmap[map_word(index)] == 0 {
                    // Whole block of 32 bins empty: skip it.
                    index = (map_word(index) + 1) * 32;
                } else {
                    index += 1;
                }
                continue;
            }

            match directory.last(index) {
                None => {
                    // Stale bit left behind by an exact-fit serve.
                    self.clear_bin(index);
                    index += 1;
                }
                Some(chunk) => {
                    if directory.unlink(chunk).is_err() {
                        self.report_corruption("malloc(): corrupted bin");
                        return None;
                    }
                    if directory.is_empty(index) {
                        self.clear_bin(index);
                    }
                    return Some(self.split_or_serve(chunk, wanted));
                }
            }
        }

        None
    }

    /// Serves a free chunk for a `wanted`-byte request, splitting off the
    /// tail as a new unsorted chunk whenever it can stand on its own.
    unsafe fn split_or_serve(&mut self, chunk: NonNull<Chunk>, wanted: usize) -> NonNull<Chunk> {
        let size = Chunk::size(chunk);

        if size - wanted < MIN_CHUNK_SIZE {
            Chunk::set_inuse(chunk);
            return chunk;
        }

        Chunk::set_size(chunk, wanted);
        let remainder = Chunk::next(chunk);
        Chunk::set_head(remainder, size - wanted, PREV_INUSE);
        Chunk::set_free(remainder);
        self.directory.unwrap().insert_unsorted(remainder);

        chunk
    }

    /// Carves the low `wanted` bytes off the top chunk, or consumes the top
    /// whole when it fits the request but cannot leave a viable remainder.
    unsafe fn split_top(&mut self, wanted: usize) -> Pointer<Chunk> {
        let top = self.top?;
        let top_size = Chunk::size(top);

        if top_size >= wanted + MIN_CHUNK_SIZE {
            Chunk::set_size(top, wanted);
            let new_top = Chunk::next(top);
            Chunk::set_head(new_top, top_size - wanted, PREV_INUSE);
            self.top = Some(new_top);
            Some(top)
        } else if top_size >= wanted {
            // The next free of the chunk ending at the segment end revives
            // the top.
            self.top = None;
            Some(top)
        } else {
            None
        }
    }

    // === Raw memory ======================================================

    /// Grows the segment enough to serve `wanted` bytes from the top.
    unsafe fn extend_heap_for(&mut self, wanted: usize) -> bool {
        let page = self.page_size();
        let Some(padded) = wanted
            .checked_add(self.top_pad)
            .and_then(|n| n.checked_add(MIN_CHUNK_SIZE))
            .and_then(|n| n.checked_add(page - 1))
        else {
            return false;
        };
        let delta = padded & !(page - 1);
        if delta > isize::MAX as usize {
            return false;
        }

        let Some(base) = self.source.extend_heap(delta as isize) else {
            return false;
        };

        self.heap_bytes += delta;
        self.max_heap_bytes = self.max_heap_bytes.max(self.heap_bytes);

        match self.break_end {
            Some(expected) if expected == base => {
                // Contiguous with our segment: the top absorbs the new
                // memory (or restarts at the old coverage end if it had
                // been consumed whole).
                if let Some(top) = self.top {
                    Chunk::set_size(top, Chunk::size(top) + delta);
                } else {
                    let top = Chunk::at(self.arena_end.unwrap());
                    Chunk::set_head(top, delta, PREV_INUSE);
                    self.top = Some(top);
                }
                self.arena_end = advance(self.arena_end, delta);
            }
            Some(_) => self.start_new_segment(base, delta),
            None => {
                // First extension. The initial break is not necessarily
                // aligned; the front pad is simply discarded.
                let misalign = base.as_ptr() as usize & CHUNK_ALIGN_MASK;
                let pad = if misalign == 0 {
                    0
                } else {
                    CHUNK_ALIGN - misalign
                };
                let start = NonNull::new_unchecked(base.as_ptr().add(pad));
                let usable = align_down(delta - pad, CHUNK_ALIGN);
                let top = Chunk::at(start);
                Chunk::set_head(top, usable, PREV_INUSE);
                self.top = Some(top);
                self.arena_end = Some(NonNull::new_unchecked(start.as_ptr().add(usable)));
            }
        }

        self.break_end = Some(NonNull::new_unchecked(base.as_ptr().add(delta)));
        true
    }

    /// The source produced memory that is not adjacent to our segment.
    /// Seal the old segment: fence the old top behind two minimal in-use
    /// chunks nothing can coalesce across, recycle what is left of it, and
    /// start over at the new base.
    unsafe fn start_new_segment(&mut self, base: NonNull<u8>, delta: usize) {
        if let Some(old_top) = self.top.take() {
            let old_size = Chunk::size(old_top);
            if old_size >= MIN_CHUNK_SIZE + 2 * FENCE_SIZE {
                let keep = old_size - 2 * FENCE_SIZE;
                Chunk::set_size(old_top, keep);

                let fence = Chunk::next(old_top);
                Chunk::set_head(fence, FENCE_SIZE, PREV_INUSE);
                let backstop = Chunk::next(fence);
                Chunk::set_head(backstop, FENCE_SIZE, PREV_INUSE);

                self.free_heap_chunk(old_top);
            }
            // A top too small to fence is abandoned: at most a few words,
            // at most once per discontinuity.
        }

        let misalign = base.as_ptr() as usize & CHUNK_ALIGN_MASK;
        let pad = if misalign == 0 {
            0
        } else {
            CHUNK_ALIGN - misalign
        };
        let start = NonNull::new_unchecked(base.as_ptr().add(pad));
        let usable = align_down(delta - pad, CHUNK_ALIGN);
        let top = Chunk::at(start);
        Chunk::set_head(top, usable, PREV_INUSE);
        self.top = Some(top);
        self.arena_end = Some(NonNull::new_unchecked(start.as_ptr().add(usable)));
    }

    /// Serves `size` bytes as a standalone page mapping.
    unsafe fn mmap_chunk(&mut self, size: usize) -> Pointer<Chunk> {
        let page = self.page_size();
        let Some(padded) = size
            .checked_add(CHUNK_OVERHEAD)
            .and_then(|n| n.checked_add(page - 1))
        else {
            return None;
        };
        let length = padded & !(page - 1);

        let base = self.source.map_pages(length)?;
        debug_assert!(is_user_aligned(base.as_ptr() as usize));

        let chunk = Chunk::at(base);
        Chunk::set_prev_size(chunk, 0);
        Chunk::set_head(chunk, length, IS_MMAPPED);

        self.mapping_count += 1;
        self.max_mapping_count = self.max_mapping_count.max(self.mapping_count);
        self.mapped_bytes += length;
        self.max_mapped_bytes = self.max_mapped_bytes.max(self.mapped_bytes);

        Some(chunk)
    }

    /// Returns a mapped chunk to the kernel. `prev_size` holds the front
    /// correction an aligned allocation may have introduced.
    unsafe fn free_mapped_chunk(&mut self, chunk: NonNull<Chunk>) {
        let correction = Chunk::prev_size(chunk);
        let total = Chunk::size(chunk) + correction;
        let base = NonNull::new_unchecked(chunk.as_ptr().cast::<u8>().sub(correction));

        self.mapping_count = self.mapping_count.saturating_sub(1);
        self.mapped_bytes = self.mapped_bytes.saturating_sub(total);
        self.source.unmap_pages(base, total);
    }

    // === Free ============================================================

    /// Releases a user pointer back to the arena.
    pub unsafe fn free(&mut self, user: NonNull<u8>) {
        if !is_user_aligned(user.as_ptr() as usize) {
            self.report_corruption("free(): invalid pointer");
            return;
        }

        let chunk = Chunk::from_user_pointer(user);
        if Chunk::is_mmapped(chunk) {
            self.free_mapped_chunk(chunk);
            return;
        }

        self.free_chunk(chunk);
    }

    /// Frees an in-heap chunk: small ones park in a fast bin and stay
    /// "in use" to their neighbors, the rest take the regular coalescing
    /// path.
    unsafe fn free_chunk(&mut self, chunk: NonNull<Chunk>) {
        let size = Chunk::size(chunk);
        if size < MIN_CHUNK_SIZE || !is_aligned(size, CHUNK_ALIGN) || size > self.heap_bytes {
            self.report_corruption("free(): invalid size");
            return;
        }

        if size <= self.max_fast {
            let index = fastbin_index(size);
            // The head of the bin being the chunk itself is the classic
            // immediate double free.
            if self.fastbins[index] == Some(chunk) {
                self.report_corruption("free(): double free (fast)");
                return;
            }
            Chunk::set_fd(chunk, self.fastbins[index]);
            self.fastbins[index] = Some(chunk);
            self.have_fast_chunks = true;
            return;
        }

        self.free_heap_chunk(chunk);
    }

    /// The regular free path: validate, coalesce with both neighbors, park
    /// the result (unsorted bin, or the top), then see whether the segment
    /// can shrink.
    unsafe fn free_heap_chunk(&mut self, chunk: NonNull<Chunk>) {
        if self.directory.is_none() || self.arena_end.is_none() {
            self.report_corruption("free(): invalid pointer");
            return;
        }

        if Some(chunk) == self.top {
            self.report_corruption("free(): releasing top chunk");
            return;
        }

        let size = Chunk::size(chunk);
        let next_address = chunk.as_ptr() as usize + size;
        let end_address = self.arena_end.unwrap().as_ptr() as usize;

        // The chunk ending exactly at the coverage end while the top is
        // gone becomes the new top; in every other case there is a real
        // successor to validate against.
        let becomes_top = next_address == end_address;
        if becomes_top && self.top.is_some() {
            self.report_corruption("free(): invalid next size");
            return;
        }

        if !becomes_top {
            let next = Chunk::next(chunk);
            if !Chunk::prev_inuse(next) {
                self.report_corruption("free(): double free or corruption");
                return;
            }
            if Some(next) != self.top {
                let next_size = Chunk::size(next);
                if next_size < FENCE_SIZE || next_size > self.heap_bytes {
                    self.report_corruption("free(): invalid next size");
                    return;
                }
            }
        }

        let Some(size) = self.coalesce_and_park(chunk) else {
            return;
        };

        if size >= FASTBIN_CONSOLIDATION_THRESHOLD && self.have_fast_chunks {
            self.consolidate();
        }

        if let Some(top) = self.top {
            if Chunk::size(top) >= self.trim_threshold {
                self.release_top_surplus(self.top_pad);
            }
        }
    }

    /// Merges `chunk` with free neighbors and parks the result in the
    /// unsorted bin, or in the top when it borders it. Returns the
    /// coalesced size, or `None` when a broken bin link stopped the
    /// operation before any state changed.
    unsafe fn coalesce_and_park(&mut self, chunk: NonNull<Chunk>) -> Option<usize> {
        let directory = self.directory.unwrap();
        let end_address = self.arena_end.unwrap().as_ptr() as usize;

        let mut chunk = chunk;
        let mut size = Chunk::size(chunk);

        // Backward merge. The footer of a free predecessor must agree with
        // its header; a mismatch means something scribbled over one of
        // them.
        if !Chunk::prev_inuse(chunk) {
            let prev_size = Chunk::prev_size(chunk);
            let prev = Chunk::prev(chunk);
            if Chunk::size(prev) != prev_size {
                self.report_corruption("free(): corrupted size vs. prev_size");
                return None;
            }
            if directory.unlink(prev).is_err() {
                self.report_corruption("free(): corrupted double-linked list");
                return None;
            }
            chunk = prev;
            size += prev_size;
        }

        let next_address = chunk.as_ptr() as usize + size;

        if next_address == end_address && self.top.is_none() {
            // Revive the top. After backward merging the predecessor is in
            // use by definition, so PREV_INUSE is the truth.
            Chunk::set_head(chunk, size, PREV_INUSE);
            self.top = Some(chunk);
            return Some(size);
        }

        let next = Chunk::next(chunk);

        if Some(next) == self.top {
            let combined = size + Chunk::size(next);
            Chunk::set_head(chunk, combined, PREV_INUSE);
            self.top = Some(chunk);
            return Some(combined);
        }

        // Forward merge. A free chunk ending at the coverage end would be
        // the top, so reaching here with such a successor means it is in
        // use and its trailing neighbor's header (which would lie outside
        // the segment) is never read.
        let next_end = next_address + Chunk::size(next);
        let next_inuse = (next_end == end_address && self.top.is_none()) || Chunk::inuse(next);
        if !next_inuse {
            if directory.unlink(next).is_err() {
                self.report_corruption("free(): corrupted double-linked list");
                return None;
            }
            size += Chunk::size(next);
        }

        Chunk::set_head(chunk, size, PREV_INUSE);
        Chunk::set_free(chunk);
        directory.insert_unsorted(chunk);

        Some(size)
    }

    /// Folds every fast bin back into the regular free machinery: each
    /// chunk is fully coalesced and parked like a normal free. Reached from
    /// the allocation retry, from large frees, and from the explicit trim
    /// hook.
    pub unsafe fn consolidate(&mut self) {
        if self.directory.is_none() {
            return;
        }
        self.have_fast_chunks = false;

        for index in 0..NFASTBINS {
            let mut current = self.fastbins[index].take();
            while let Some(chunk) = current {
                current = Chunk::fd(chunk);
                Chunk::set_fd(chunk, None);
                let _ = self.coalesce_and_park(chunk);
            }
        }
    }

    /// Shrinks the segment, keeping `pad` bytes of slack beyond the minimal
    /// top. Returns whether any memory went back to the source.
    unsafe fn release_top_surplus(&mut self, pad: usize) -> bool {
        let Some(top) = self.top else {
            return false;
        };
        let top_size = Chunk::size(top);
        let Some(reserve) = pad.checked_add(MIN_CHUNK_SIZE) else {
            return false;
        };
        if top_size <= reserve {
            return false;
        }

        let extra = align_down(top_size - reserve, self.page_size());
        if extra == 0 || extra > isize::MAX as usize {
            return false;
        }
        if self.source.extend_heap(-(extra as isize)).is_none() {
            return false;
        }

        Chunk::set_size(top, top_size - extra);
        self.break_end = retreat(self.break_end, extra);
        self.arena_end = retreat(self.arena_end, extra);
        self.heap_bytes -= extra;
        true
    }

    /// The `malloc_trim` analog: consolidate, then give back top surplus
    /// beyond `pad` bytes.
    pub unsafe fn trim(&mut self, pad: usize) -> bool {
        self.consolidate();
        self.release_top_surplus(pad)
    }

    // === Reallocation ====================================================

    /// Resizes the allocation at `user` to `request` bytes, in place when
    /// the neighborhood allows it. Returns `None` (with the old block
    /// intact) when the request cannot be satisfied.
    pub unsafe fn reallocate(&mut self, user: NonNull<u8>, request: usize) -> Pointer<u8> {
        let wanted = request_to_chunk_size(request)?;

        if !is_user_aligned(user.as_ptr() as usize) {
            self.report_corruption("realloc(): invalid pointer");
            return None;
        }

        let chunk = Chunk::from_user_pointer(user);
        if Chunk::is_mmapped(chunk) {
            return self.reallocate_mapped(chunk, user, request, wanted);
        }

        let size = Chunk::size(chunk);
        if size < MIN_CHUNK_SIZE || !is_aligned(size, CHUNK_ALIGN) || size > self.heap_bytes {
            self.report_corruption("realloc(): invalid old size");
            return None;
        }

        // Shrink in place; the tail is recycled when it can stand alone.
        if wanted <= size {
            if size - wanted >= MIN_CHUNK_SIZE {
                self.split_inuse_tail(chunk, wanted);
            }
            return Some(user);
        }

        let next_address = chunk.as_ptr() as usize + size;

        // Grow in place into the top...
        if let Some(top) = self.top {
            if next_address == top.as_ptr() as usize {
                let combined = size + Chunk::size(top);
                if combined >= wanted + MIN_CHUNK_SIZE {
                    Chunk::set_size(chunk, wanted);
                    let new_top = Chunk::next(chunk);
                    Chunk::set_head(new_top, combined - wanted, PREV_INUSE);
                    self.top = Some(new_top);
                    return Some(user);
                }
            }
        }

        // ...or by absorbing a free successor.
        let end_address = match self.arena_end {
            Some(end) => end.as_ptr() as usize,
            None => 0,
        };
        if next_address < end_address {
            let next = Chunk::next(chunk);
            if Some(next) != self.top {
                let next_size = Chunk::size(next);
                let next_end = next_address + next_size;
                let in_bounds = next_size >= FENCE_SIZE && next_end <= end_address;
                let next_free = in_bounds
                    && !(next_end == end_address && self.top.is_none())
                    && !Chunk::inuse(next);

                if next_free && size + next_size >= wanted {
                    if self.directory.unwrap().unlink(next).is_err() {
                        self.report_corruption("realloc(): corrupted double-linked list");
                        return None;
                    }
                    let combined = size + next_size;
                    Chunk::set_size(chunk, combined);
                    Chunk::set_inuse(chunk);
                    if combined - wanted >= MIN_CHUNK_SIZE {
                        self.split_inuse_tail(chunk, wanted);
                    }
                    return Some(user);
                }
            }
        }

        // Move: allocate, copy, free.
        let new_chunk = self.allocate_chunk(wanted)?;
        let new_user = Chunk::user_pointer_of(new_chunk);
        let copy = (size - CHUNK_OVERHEAD).min(request);
        ptr::copy_nonoverlapping(user.as_ptr(), new_user.as_ptr(), copy);
        self.free_chunk(chunk);
        Some(new_user)
    }

    /// Reallocation of a standalone mapping: let the kernel move the pages
    /// when it can, fall back to allocate-copy-free when it cannot.
    unsafe fn reallocate_mapped(
        &mut self,
        chunk: NonNull<Chunk>,
        user: NonNull<u8>,
        request: usize,
        wanted: usize,
    ) -> Pointer<u8> {
        let page = self.page_size();
        let old_size = Chunk::size(chunk);
        let correction = Chunk::prev_size(chunk);
        let old_total = old_size + correction;

        let Some(padded) = wanted
            .checked_add(MMAP_OVERHEAD)
            .and_then(|n| n.checked_add(correction))
            .and_then(|n| n.checked_add(page - 1))
        else {
            return None;
        };
        let new_total = padded & !(page - 1);

        if new_total == old_total {
            return Some(user);
        }

        let base = NonNull::new_unchecked(chunk.as_ptr().cast::<u8>().sub(correction));
        if let Some(new_base) = self.source.remap_pages(base, old_total, new_total) {
            self.mapped_bytes = self.mapped_bytes - old_total + new_total;
            self.max_mapped_bytes = self.max_mapped_bytes.max(self.mapped_bytes);

            let new_chunk = Chunk::at(NonNull::new_unchecked(new_base.as_ptr().add(correction)));
            Chunk::set_prev_size(new_chunk, correction);
            Chunk::set_head(new_chunk, new_total - correction, IS_MMAPPED);
            return Some(Chunk::user_pointer_of(new_chunk));
        }

        // No kernel help. Shrinking still fits where it is.
        if wanted <= old_size {
            return Some(user);
        }

        let new_chunk = self.allocate_chunk(wanted)?;
        let new_user = Chunk::user_pointer_of(new_chunk);
        let copy = (old_size - MMAP_OVERHEAD).min(request);
        ptr::copy_nonoverlapping(user.as_ptr(), new_user.as_ptr(), copy);
        self.free_mapped_chunk(chunk);
        Some(new_user)
    }

    /// Splits the tail off an in-use chunk and routes it through the
    /// regular free path, where it can coalesce with whatever follows.
    unsafe fn split_inuse_tail(&mut self, chunk: NonNull<Chunk>, keep: usize) {
        let size = Chunk::size(chunk);
        Chunk::set_size(chunk, keep);
        let remainder = Chunk::next(chunk);
        // The old successor already records this area as in use, so the
        // remainder is born in-use and freed normally.
        Chunk::set_head(remainder, size - keep, PREV_INUSE);
        self.free_chunk(remainder);
    }

    // === Aligned allocation ==============================================

    /// Serves `request` bytes whose user pointer is `alignment`-aligned.
    /// Alignments at or below the universal one take the normal path; the
    /// rest over-allocate and carve the misaligned lead off as an
    /// independent free chunk.
    pub unsafe fn allocate_aligned(&mut self, alignment: usize, request: usize) -> Pointer<u8> {
        if !alignment.is_power_of_two() {
            return None;
        }
        if alignment <= CHUNK_ALIGN {
            return self.allocate(request);
        }
        if request == 0 {
            return None;
        }

        let wanted = request_to_chunk_size(request)?;
        let padded = wanted
            .checked_add(alignment)?
            .checked_add(MIN_CHUNK_SIZE)?;
        if padded > usize::MAX / 2 {
            return None;
        }

        let mut chunk = self.allocate_chunk(padded)?;
        let user_address = Chunk::user_pointer_of(chunk).as_ptr() as usize;

        if !is_aligned(user_address, alignment) {
            let mut aligned_address = align_up(user_address, alignment);
            // The lead must be a whole chunk; step one more alignment
            // boundary forward when it is too thin. The over-allocation
            // above guarantees the room.
            if aligned_address - user_address < MIN_CHUNK_SIZE {
                aligned_address += alignment;
            }
            let lead = aligned_address - user_address;

            let aligned_user = NonNull::new_unchecked(aligned_address as *mut u8);
            let aligned_chunk = Chunk::from_user_pointer(aligned_user);
            let total = Chunk::size(chunk);

            if Chunk::is_mmapped(chunk) {
                // Mapped chunks record the unused front pages and give them
                // back wholesale on free.
                Chunk::set_prev_size(aligned_chunk, Chunk::prev_size(chunk) + lead);
                Chunk::set_head(aligned_chunk, total - lead, IS_MMAPPED);
            } else {
                Chunk::set_head(aligned_chunk, total - lead, PREV_INUSE);
                Chunk::set_size(chunk, lead);
                self.free_chunk(chunk);
            }

            chunk = aligned_chunk;
        }

        if !Chunk::is_mmapped(chunk) {
            let size = Chunk::size(chunk);
            if size - wanted >= MIN_CHUNK_SIZE {
                self.split_inuse_tail(chunk, wanted);
            }
        }

        Some(Chunk::user_pointer_of(chunk))
    }

    // === Queries =========================================================

    /// Bytes actually usable behind a previously returned pointer.
    pub unsafe fn usable_size(user: NonNull<u8>) -> usize {
        if !is_user_aligned(user.as_ptr() as usize) {
            return 0;
        }
        let chunk = Chunk::from_user_pointer(user);
        let size = Chunk::size(chunk);
        if size < MIN_CHUNK_SIZE {
            return 0;
        }
        Chunk::usable_size(chunk)
    }
}

#[inline]
fn advance(pointer: Pointer<u8>, bytes: usize) -> Pointer<u8> {
    pointer.map(|p| unsafe { NonNull::new_unchecked(p.as_ptr().add(bytes)) })
}

#[inline]
fn retreat(pointer: Pointer<u8>, bytes: usize) -> Pointer<u8> {
    pointer.map(|p| unsafe { NonNull::new_unchecked(p.as_ptr().sub(bytes)) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SlabSource;

    const SLAB: usize = 4 * 1024 * 1024;
    const PAGE: usize = 4096;

    fn arena() -> Arena<SlabSource> {
        let mut arena = Arena::new(SlabSource::new(SLAB));
        // Tests must observe silent no-ops, not a dead process.
        arena.abort_on_corruption = false;
        arena
    }

    unsafe fn fill(pointer: NonNull<u8>, len: usize, value: u8) {
        pointer.as_ptr().write_bytes(value, len);
    }

    unsafe fn check(pointer: NonNull<u8>, len: usize, value: u8) {
        for i in 0..len {
            assert_eq!(*pointer.as_ptr().add(i), value, "byte {i} corrupted");
        }
    }

    #[test]
    fn zero_request_returns_null() {
        let mut arena = arena();
        unsafe {
            assert_eq!(arena.allocate(0), None);
        }
    }

    #[test]
    fn absurd_requests_fail_cleanly() {
        let mut arena = arena();
        unsafe {
            assert_eq!(arena.allocate(usize::MAX), None);
            assert_eq!(arena.allocate(usize::MAX / 2), None);
        }
    }

    /// A source with nothing to give: every allocation path must surface
    /// plain exhaustion, never panic.
    struct BarrenSource;

    impl PageSource for BarrenSource {
        unsafe fn extend_heap(&mut self, _delta: isize) -> Pointer<u8> {
            None
        }

        unsafe fn map_pages(&mut self, _length: usize) -> Pointer<u8> {
            None
        }

        unsafe fn unmap_pages(&mut self, _base: NonNull<u8>, _length: usize) {}

        fn page_size(&self) -> usize {
            PAGE
        }
    }

    #[test]
    fn source_exhaustion_surfaces_as_null() {
        let mut arena = Arena::new(BarrenSource);
        arena.abort_on_corruption = false;
        unsafe {
            assert_eq!(arena.allocate(100), None);
            assert_eq!(arena.allocate(1 << 20), None);
            assert_eq!(arena.allocate_aligned(64, 100), None);
        }
    }

    #[test]
    fn first_allocation_grows_the_heap_by_pages() {
        let mut arena = arena();
        unsafe {
            let pointer = arena.allocate(100).unwrap();
            assert!(is_user_aligned(pointer.as_ptr() as usize));
            assert!(Arena::<SlabSource>::usable_size(pointer) >= 100);

            let stats = arena.stats();
            assert_eq!(stats.bytes_via_heap_extend % PAGE, 0);
            assert!(stats.bytes_via_heap_extend >= PAGE);
            assert_eq!(stats.bytes_via_mapping, 0);

            fill(pointer, 100, 0x5A);
            check(pointer, 100, 0x5A);
        }
    }

    #[test]
    fn sequential_allocations_carve_the_top_upward() {
        let mut arena = arena();
        unsafe {
            let first = arena.allocate(24).unwrap();
            let second = arena.allocate(24).unwrap();
            let third = arena.allocate(24).unwrap();

            let size = request_to_chunk_size(24).unwrap();
            assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, size);
            assert_eq!(third.as_ptr() as usize - second.as_ptr() as usize, size);
        }
    }

    #[test]
    fn fast_bin_reuse_is_lifo_and_exact() {
        let mut arena = arena();
        unsafe {
            let first = arena.allocate(24).unwrap();
            let second = arena.allocate(24).unwrap();
            let guard = arena.allocate(24).unwrap();

            arena.free(first);
            arena.free(second);

            // Most recently freed comes back first, at the same address.
            assert_eq!(arena.allocate(24), Some(second));
            assert_eq!(arena.allocate(24), Some(first));

            arena.free(guard);
        }
    }

    #[test]
    fn disabling_fast_bins_routes_small_frees_to_the_bins() {
        let mut arena = arena();
        unsafe {
            assert!(arena.tune(TuneParameter::MaxFast, 0));

            let pointer = arena.allocate(24).unwrap();
            let _guard = arena.allocate(24).unwrap();
            arena.free(pointer);

            assert!(!arena.have_fast_chunks);
            assert!(arena.fastbins.iter().all(Option::is_none));

            // Still reusable through the unsorted bin.
            assert_eq!(arena.allocate(24), Some(pointer));
        }
    }

    #[test]
    fn regular_free_reuses_exact_sizes_through_unsorted() {
        let mut arena = arena();
        unsafe {
            let pointer = arena.allocate(200).unwrap();
            let _guard = arena.allocate(200).unwrap();

            arena.free(pointer);
            assert_eq!(arena.allocate(200), Some(pointer));
        }
    }

    #[test]
    fn coalescing_merges_adjacent_chunks_both_orders() {
        for reversed in [false, true] {
            let mut arena = arena();
            unsafe {
                let first = arena.allocate(500).unwrap();
                let second = arena.allocate(500).unwrap();
                let guard = arena.allocate(100).unwrap();

                if reversed {
                    arena.free(second);
                    arena.free(first);
                } else {
                    arena.free(first);
                    arena.free(second);
                }

                // The merged chunk spans both, and the boundary tag agrees:
                // the guard sees a free predecessor of the combined size.
                let size = request_to_chunk_size(500).unwrap();
                let guard_chunk = Chunk::from_user_pointer(guard);
                assert!(!Chunk::prev_inuse(guard_chunk), "reversed={reversed}");
                assert_eq!(Chunk::prev_size(guard_chunk), 2 * size);

                // A request for the combined size is served at the first
                // address.
                let combined = arena.allocate(2 * size - CHUNK_OVERHEAD).unwrap();
                assert_eq!(combined, first, "reversed={reversed}");
            }
        }
    }

    #[test]
    fn freeing_next_to_the_top_merges_into_it() {
        let mut arena = arena();
        unsafe {
            let pointer = arena.allocate(600).unwrap();
            let heap_before = arena.stats().bytes_via_heap_extend;
            arena.free(pointer);

            // Nothing is parked in any bin: the chunk went back to the top.
            let directory = arena.directory.unwrap();
            assert!(directory.last(UNSORTED).is_none());
            assert_eq!(arena.stats().bytes_via_heap_extend, heap_before);

            assert_eq!(arena.allocate(600), Some(pointer));
        }
    }

    #[test]
    fn consuming_the_top_whole_and_reviving_it() {
        let mut arena = arena();
        unsafe {
            let first = arena.allocate(100).unwrap();
            let top_size = Chunk::size(arena.top.unwrap());

            // Consume the entire top in one request.
            let all = arena.allocate(top_size - CHUNK_OVERHEAD).unwrap();
            assert!(arena.top.is_none());

            // Freeing it revives the top instead of binning.
            arena.free(all);
            assert!(arena.top.is_some());
            assert_eq!(Chunk::size(arena.top.unwrap()), top_size);

            arena.free(first);
        }
    }

    #[test]
    fn large_bins_serve_best_fit_and_split() {
        let mut arena = arena();
        unsafe {
            // Three large free chunks of distinct sizes, kept apart by
            // guards so they cannot coalesce.
            let mut freed = Vec::new();
            for request in [2000, 4000, 3000] {
                let pointer = arena.allocate(request).unwrap();
                let _guard = arena.allocate(24).unwrap();
                freed.push((request, pointer));
            }
            for (_, pointer) in &freed {
                arena.free(*pointer);
            }

            // A request beyond the fast/small range forces a drain: the
            // three chunks get sorted into their large bins. Then the best
            // fit (the 3000-byte chunk) is chosen and split.
            let served = arena.allocate(2500).unwrap();
            let expected = freed.iter().find(|(r, _)| *r == 3000).unwrap().1;
            assert_eq!(served, expected);
            assert!(Arena::<SlabSource>::usable_size(served) >= 2500);
        }
    }

    #[test]
    fn consolidation_rebuilds_split_chunks_from_fast_bins() {
        let mut arena = arena();
        unsafe {
            let first = arena.allocate(24).unwrap();
            let second = arena.allocate(24).unwrap();
            let guard = arena.allocate(100).unwrap();

            arena.free(first);
            arena.free(second);
            assert!(arena.have_fast_chunks);

            arena.consolidate();
            assert!(!arena.have_fast_chunks);
            assert!(arena.fastbins.iter().all(Option::is_none));

            // The two neighbors merged into one unsorted chunk.
            let size = request_to_chunk_size(24).unwrap();
            let merged = arena.directory.unwrap().last(UNSORTED).unwrap();
            assert_eq!(merged, Chunk::from_user_pointer(first));
            assert_eq!(Chunk::size(merged), 2 * size);

            arena.free(guard);
        }
    }

    #[test]
    fn mapping_serves_large_requests_and_returns_them() {
        let mut arena = arena();
        unsafe {
            assert!(arena.tune(TuneParameter::MmapThreshold, 4096));

            let pointer = arena.allocate(8000).unwrap();
            assert!(is_user_aligned(pointer.as_ptr() as usize));
            assert!(Arena::<SlabSource>::usable_size(pointer) >= 8000);

            let stats = arena.stats();
            assert_eq!(stats.mapping_count, 1);
            assert_eq!(stats.max_mapping_count, 1);
            assert!(stats.bytes_via_mapping >= 8000);
            assert_eq!(stats.bytes_via_mapping % PAGE, 0);

            fill(pointer, 8000, 0x42);
            check(pointer, 8000, 0x42);

            arena.free(pointer);
            let stats = arena.stats();
            assert_eq!(stats.mapping_count, 0);
            assert_eq!(stats.bytes_via_mapping, 0);
            assert!(stats.max_bytes_via_mapping >= 8000);
        }
    }

    #[test]
    fn mapping_cap_forces_the_heap_path() {
        let mut arena = arena();
        unsafe {
            assert!(arena.tune(TuneParameter::MmapThreshold, 4096));
            assert!(arena.tune(TuneParameter::MmapMax, 0));

            let pointer = arena.allocate(8000).unwrap();
            assert_eq!(arena.stats().mapping_count, 0);
            assert!(arena.stats().bytes_via_heap_extend >= 8000);

            arena.free(pointer);
        }
    }

    #[test]
    fn trim_gives_surplus_back_to_the_source() {
        let mut arena = arena();
        unsafe {
            assert!(arena.tune(TuneParameter::MmapMax, 0));
            assert!(arena.tune(TuneParameter::TrimThreshold, usize::MAX));

            let pointer = arena.allocate(200_000).unwrap();
            let peak = arena.stats().bytes_via_heap_extend;
            arena.free(pointer);

            // Nothing trimmed yet: the threshold is out of reach.
            assert_eq!(arena.stats().bytes_via_heap_extend, peak);

            assert!(arena.trim(0));
            let trimmed = arena.stats().bytes_via_heap_extend;
            assert!(trimmed < peak);
            assert_eq!(arena.source.bytes_in_use(), trimmed);

            // The arena still works after shrinking.
            let again = arena.allocate(1000).unwrap();
            arena.free(again);
        }
    }

    #[test]
    fn free_triggers_trim_past_the_threshold() {
        let mut arena = arena();
        unsafe {
            assert!(arena.tune(TuneParameter::MmapMax, 0));
            assert!(arena.tune(TuneParameter::TrimThreshold, 8 * PAGE));

            let pointer = arena.allocate(64 * PAGE).unwrap();
            let peak = arena.stats().bytes_via_heap_extend;

            arena.free(pointer);
            assert!(arena.stats().bytes_via_heap_extend < peak);
        }
    }

    #[test]
    fn realloc_shrinks_in_place() {
        let mut arena = arena();
        unsafe {
            let pointer = arena.allocate(1000).unwrap();
            fill(pointer, 1000, 0x77);

            let shrunk = arena.reallocate(pointer, 100).unwrap();
            assert_eq!(shrunk, pointer);
            assert!(Arena::<SlabSource>::usable_size(shrunk) >= 100);
            check(shrunk, 100, 0x77);

            arena.free(shrunk);
        }
    }

    #[test]
    fn realloc_grows_into_the_top_in_place() {
        let mut arena = arena();
        unsafe {
            let pointer = arena.allocate(100).unwrap();
            fill(pointer, 100, 0xA1);

            // The chunk borders the top, so growth is in place.
            let grown = arena.reallocate(pointer, 2000).unwrap();
            assert_eq!(grown, pointer);
            assert!(Arena::<SlabSource>::usable_size(grown) >= 2000);
            check(grown, 100, 0xA1);

            arena.free(grown);
        }
    }

    #[test]
    fn realloc_absorbs_a_free_successor() {
        let mut arena = arena();
        unsafe {
            let first = arena.allocate(504).unwrap();
            let second = arena.allocate(504).unwrap();
            let _guard = arena.allocate(100).unwrap();

            fill(first, 504, 0x3C);
            arena.free(second);

            let size = request_to_chunk_size(504).unwrap();
            let grown = arena.reallocate(first, 2 * size - CHUNK_OVERHEAD).unwrap();
            assert_eq!(grown, first, "growth into the free successor moved");
            check(grown, 504, 0x3C);

            arena.free(grown);
        }
    }

    #[test]
    fn realloc_moves_and_preserves_content_when_blocked() {
        let mut arena = arena();
        unsafe {
            let pointer = arena.allocate(100).unwrap();
            let _guard = arena.allocate(100).unwrap();
            fill(pointer, 100, 0xB4);

            let moved = arena.reallocate(pointer, 5000).unwrap();
            assert_ne!(moved, pointer);
            check(moved, 100, 0xB4);

            // The old spot is free again.
            assert_eq!(arena.allocate(100), Some(pointer));
        }
    }

    #[test]
    fn realloc_of_a_mapping_copies_without_kernel_support() {
        let mut arena = arena();
        unsafe {
            assert!(arena.tune(TuneParameter::MmapThreshold, 4096));

            let pointer = arena.allocate(8000).unwrap();
            fill(pointer, 8000, 0x66);
            assert_eq!(arena.stats().mapping_count, 1);

            // SlabSource has no remap, so growth goes allocate-copy-free.
            let grown = arena.reallocate(pointer, 50_000).unwrap();
            check(grown, 8000, 0x66);
            assert_eq!(arena.stats().mapping_count, 1);

            // Shrinking a mapping keeps it in place.
            let shrunk = arena.reallocate(grown, 6000).unwrap();
            assert_eq!(shrunk, grown);

            arena.free(shrunk);
            assert_eq!(arena.stats().mapping_count, 0);
        }
    }

    #[test]
    fn aligned_allocations_hit_every_alignment() {
        let mut arena = arena();
        unsafe {
            for alignment in [32, 64, 256, 1024, 4096] {
                let pointer = arena.allocate_aligned(alignment, 1000).unwrap();
                assert_eq!(
                    pointer.as_ptr() as usize % alignment,
                    0,
                    "alignment {alignment}"
                );
                assert!(Arena::<SlabSource>::usable_size(pointer) >= 1000);
                fill(pointer, 1000, 0x91);
                check(pointer, 1000, 0x91);
                arena.free(pointer);
            }
        }
    }

    #[test]
    fn aligned_allocation_recycles_the_lead_pad() {
        let mut arena = arena();
        unsafe {
            let aligned = arena.allocate_aligned(1024, 100).unwrap();
            assert_eq!(aligned.as_ptr() as usize % 1024, 0);

            // The carved-off lead is a real free chunk: a small allocation
            // can land in it, below the aligned block.
            let small = arena.allocate(24).unwrap();
            assert!((small.as_ptr() as usize) < aligned.as_ptr() as usize);

            arena.free(aligned);
            arena.free(small);
        }
    }

    #[test]
    fn aligned_allocation_of_a_mapping() {
        let mut arena = arena();
        unsafe {
            assert!(arena.tune(TuneParameter::MmapThreshold, 4096));

            let pointer = arena.allocate_aligned(2 * PAGE, 20_000).unwrap();
            assert_eq!(pointer.as_ptr() as usize % (2 * PAGE), 0);
            assert_eq!(arena.stats().mapping_count, 1);

            fill(pointer, 20_000, 0x18);
            check(pointer, 20_000, 0x18);

            arena.free(pointer);
            assert_eq!(arena.stats().mapping_count, 0);
            assert_eq!(arena.stats().bytes_via_mapping, 0);
        }
    }

    #[test]
    fn small_alignments_delegate_to_the_normal_path() {
        let mut arena = arena();
        unsafe {
            let pointer = arena.allocate_aligned(CHUNK_ALIGN, 100).unwrap();
            assert!(is_user_aligned(pointer.as_ptr() as usize));
            arena.free(pointer);

            assert_eq!(arena.allocate_aligned(24, 100), None, "not a power of two");
            assert_eq!(arena.allocate_aligned(64, 0), None, "zero size");
        }
    }

    #[test]
    fn fast_bin_double_free_is_detected_and_ignored() {
        let mut arena = arena();
        unsafe {
            let pointer = arena.allocate(24).unwrap();
            let _guard = arena.allocate(24).unwrap();

            arena.free(pointer);
            // Second free of the same pointer: silently dropped.
            arena.free(pointer);

            // The chunk exists once, not twice.
            assert_eq!(arena.allocate(24), Some(pointer));
            assert_ne!(arena.allocate(24), Some(pointer));
        }
    }

    #[test]
    fn misaligned_free_is_ignored() {
        let mut arena = arena();
        unsafe {
            let pointer = arena.allocate(100).unwrap();
            let stats = arena.stats();

            arena.free(NonNull::new_unchecked(pointer.as_ptr().add(1)));
            assert_eq!(arena.stats(), stats);

            arena.free(pointer);
        }
    }

    #[test]
    fn tune_validates_ranges() {
        let mut arena = arena();
        assert!(arena.tune(TuneParameter::MaxFast, 0));
        assert_eq!(arena.max_fast, 0);
        assert!(arena.tune(TuneParameter::MaxFast, 80));
        assert_eq!(arena.max_fast, request_to_chunk_size(80).unwrap());
        assert!(!arena.tune(TuneParameter::MaxFast, 81));

        assert!(arena.tune(TuneParameter::TrimThreshold, 0));
        assert!(arena.tune(TuneParameter::TopPad, 1 << 20));
        assert!(arena.tune(TuneParameter::MmapThreshold, 1));
        assert!(arena.tune(TuneParameter::MmapMax, 3));
        let stats = arena.stats();
        assert_eq!(stats.trim_threshold, 0);
        assert_eq!(stats.top_pad, 1 << 20);
        assert_eq!(stats.mmap_threshold, 1);
        assert_eq!(stats.mmap_max, 3);
    }

    #[test]
    fn balanced_workload_leaves_no_mappings_behind() {
        let mut arena = arena();
        unsafe {
            assert!(arena.tune(TuneParameter::MmapThreshold, 4096));

            let mut live = Vec::new();
            for round in 0..8 {
                for request in [16, 200, 1000, 5000, 9000] {
                    let pointer = arena.allocate(request + round).unwrap();
                    fill(pointer, request, (round + 1) as u8);
                    live.push((pointer, request, (round + 1) as u8));
                }
            }
            for (pointer, request, value) in live.drain(..) {
                check(pointer, request, value);
                arena.free(pointer);
            }

            assert_eq!(arena.stats().mapping_count, 0);
            assert_eq!(arena.stats().bytes_via_mapping, 0);
        }
    }

    /// A source whose heap jumps to a second disjoint slab when the first
    /// fills up, to exercise the fencepost protocol.
    struct DisjointSource {
        first: SlabSource,
        second: SlabSource,
        exhausted: bool,
    }

    impl DisjointSource {
        fn new(first: usize, second: usize) -> Self {
            Self {
                first: SlabSource::new(first),
                second: SlabSource::new(second),
                exhausted: false,
            }
        }
    }

    impl PageSource for DisjointSource {
        unsafe fn extend_heap(&mut self, delta: isize) -> Pointer<u8> {
            if !self.exhausted {
                if let Some(base) = self.first.extend_heap(delta) {
                    return Some(base);
                }
                self.exhausted = true;
            }
            self.second.extend_heap(delta)
        }

        unsafe fn map_pages(&mut self, length: usize) -> Pointer<u8> {
            self.second.map_pages(length)
        }

        unsafe fn unmap_pages(&mut self, base: NonNull<u8>, length: usize) {
            self.second.unmap_pages(base, length)
        }

        fn page_size(&self) -> usize {
            self.first.page_size()
        }
    }

    #[test]
    fn discontiguous_extension_fences_and_recycles_the_old_segment() {
        let mut arena = Arena::new(DisjointSource::new(16 * PAGE, 256 * PAGE));
        arena.abort_on_corruption = false;
        unsafe {
            assert!(arena.tune(TuneParameter::MmapMax, 0));

            // Fill most of the first slab (the bin directory mapping comes
            // from elsewhere).
            let first = arena.allocate(8 * PAGE).unwrap();
            fill(first, 8 * PAGE, 0xC3);

            // Too big for what is left of slab one: the heap jumps.
            let second = arena.allocate(32 * PAGE).unwrap();
            fill(second, 32 * PAGE, 0x3C);
            check(first, 8 * PAGE, 0xC3);

            // The old top was fenced and recycled: a small request fits in
            // the old segment, below the jump.
            let recycled = arena.allocate(100).unwrap();
            assert!((recycled.as_ptr() as usize) < second.as_ptr() as usize);

            // Frees in the old segment stop at the fence and stay sane.
            arena.free(first);
            arena.free(recycled);
            arena.free(second);

            let revived = arena.allocate(8 * PAGE).unwrap();
            assert_eq!(revived, first);
            arena.free(revived);
        }
    }
}
