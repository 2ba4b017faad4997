use std::{mem, ptr::NonNull};

use crate::{
    align::align_up,
    chunk::{Chunk, CHUNK_ALIGN, CHUNK_OVERHEAD},
    Pointer,
};

/// Total number of doubly linked bins. Bin 0 is unused, bin 1 is the
/// unsorted bin, bins 2..64 hold exact small sizes and the rest are the
/// geometric large classes. The last slot is never indexed but keeps the
/// directory a round power of two.
pub(crate) const NBINS: usize = 128;

/// The unsorted bin: every freed or split chunk lands here first and is
/// sorted into its permanent bin lazily by the allocation path.
pub(crate) const UNSORTED: usize = 1;

/// Chunk sizes below this map to a small bin of exactly that size; sizes at
/// or above it map to a large bin spanning a size range.
pub(crate) const MIN_LARGE_SIZE: usize = 512;

/// Upper bound on the fast-bin size threshold. `tune` accepts requests up
/// to 80 bytes for `MAX_FAST`, which normalizes to this chunk size.
pub(crate) const MAX_FAST_BOUND: usize = align_up(80 + CHUNK_OVERHEAD, CHUNK_ALIGN);

/// Number of fast-bin slots, enough to index every size up to
/// [`MAX_FAST_BOUND`].
pub(crate) const NFASTBINS: usize = (MAX_FAST_BOUND >> 3) - 2 + 1;

/// Words in the non-empty-bin bitmap, one bit per bin.
pub(crate) const BINMAP_WORDS: usize = NBINS / u32::BITS as usize;

/// Bytes of the sentinel directory backing the doubly linked bins.
pub(crate) const DIRECTORY_BYTES: usize = NBINS * mem::size_of::<Chunk>();

/// Index of the fast bin holding chunks of exactly `size` bytes.
#[inline]
pub(crate) fn fastbin_index(size: usize) -> usize {
    (size >> 3) - 2
}

/// Index of the small bin holding chunks of exactly `size` bytes. Valid for
/// `size < MIN_LARGE_SIZE`.
#[inline]
pub(crate) fn smallbin_index(size: usize) -> usize {
    size >> 3
}

#[inline]
pub(crate) fn in_smallbin_range(size: usize) -> bool {
    size < MIN_LARGE_SIZE
}

/// Index of the large bin whose size class covers `size`. Piecewise
/// logarithmic: 64 bytes apart up to ~2.5 KiB, then 512 bytes, 4 KiB,
/// 32 KiB and 256 KiB apart, with one final catch-all bin.
#[inline]
pub(crate) fn largebin_index(size: usize) -> usize {
    if size >> 6 <= 38 {
        56 + (size >> 6)
    } else if size >> 9 <= 20 {
        91 + (size >> 9)
    } else if size >> 12 <= 10 {
        110 + (size >> 12)
    } else if size >> 15 <= 4 {
        119 + (size >> 15)
    } else if size >> 18 <= 2 {
        124 + (size >> 18)
    } else {
        126
    }
}

/// Maps any valid chunk size to its permanent bin.
#[inline]
pub(crate) fn bin_index(size: usize) -> usize {
    if in_smallbin_range(size) {
        smallbin_index(size)
    } else {
        largebin_index(size)
    }
}

/// Which binmap word holds the bit for bin `index`.
#[inline]
pub(crate) fn map_word(index: usize) -> usize {
    index >> 5
}

/// The bit for bin `index` within its binmap word.
#[inline]
pub(crate) fn map_bit(index: usize) -> u32 {
    1 << (index & 31)
}

/// The doubly linked bins, materialized as a table of sentinel chunks in a
/// dedicated mapping owned by the arena.
///
/// Each sentinel is a chunk-shaped header whose `fd`/`bk` links close a
/// circular list with the free chunks of its bin:
///
/// ```text
///            directory (one mapping)                 heap chunks
///          +---------------------------+
/// bin 1 -> | sentinel | fd ------------|----> +-------+      +-------+
///          |          | bk <----------|----+ | Free  | <--> | Free  |
///          +---------------------------+   | +-------+      +---|---+
/// bin 2 -> | sentinel | fd=bk=self     |   +--------------------+
///          +---------------------------+
///          |            ...            |
///          +---------------------------+
/// ```
///
/// A sentinel makes unlinking branchless: removing a chunk never needs to
/// know whether it sits at an end of its list, which is what lets the
/// coalescing code pull a neighbor out of *whatever* bin it is in. The
/// sentinels cannot live inside the arena struct itself because they are
/// self-referential and Rust values move; a dedicated mapping pins them for
/// the lifetime of the arena instead.
#[derive(Clone, Copy)]
pub(crate) struct BinDirectory {
    base: NonNull<Chunk>,
}

impl BinDirectory {
    /// Builds the directory in the given mapping, which must hold at least
    /// [`DIRECTORY_BYTES`] writable bytes aligned for [`Chunk`]. Every bin
    /// starts out as an empty self-cycle.
    pub unsafe fn init(base: NonNull<u8>) -> Self {
        let directory = Self { base: base.cast() };

        for index in 0..NBINS {
            let bin = directory.bin_at(index);
            Chunk::set_prev_size(bin, 0);
            Chunk::set_head(bin, 0, 0);
            Chunk::set_fd(bin, Some(bin));
            Chunk::set_bk(bin, Some(bin));
            Chunk::set_fd_nextsize(bin, None);
            Chunk::set_bk_nextsize(bin, None);
        }

        directory
    }

    /// Sentinel of bin `index`.
    #[inline]
    pub fn bin_at(&self, index: usize) -> NonNull<Chunk> {
        debug_assert!(index < NBINS);
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index)) }
    }

    #[inline]
    pub unsafe fn is_empty(&self, index: usize) -> bool {
        let bin = self.bin_at(index);
        Chunk::fd(bin) == Some(bin)
    }

    /// The chunk at the tail of bin `index`, which is where small bins and
    /// the unsorted bin are served from, or `None` if the bin is empty.
    #[inline]
    pub unsafe fn last(&self, index: usize) -> Pointer<Chunk> {
        let bin = self.bin_at(index);
        let tail = Chunk::bk(bin).unwrap();
        if tail == bin {
            None
        } else {
            Some(tail)
        }
    }

    /// Splices `chunk` into a list between `bck` and `fwd`.
    #[inline]
    unsafe fn splice(bck: NonNull<Chunk>, chunk: NonNull<Chunk>, fwd: NonNull<Chunk>) {
        Chunk::set_bk(chunk, Some(bck));
        Chunk::set_fd(chunk, Some(fwd));
        Chunk::set_bk(fwd, Some(chunk));
        Chunk::set_fd(bck, Some(chunk));
    }

    /// Pushes `chunk` onto the head of the unsorted bin. The skip-chain
    /// links are cleared because only chunks sorted into a large bin carry
    /// meaningful ones.
    pub unsafe fn insert_unsorted(&self, chunk: NonNull<Chunk>) {
        Chunk::set_fd_nextsize(chunk, None);
        Chunk::set_bk_nextsize(chunk, None);
        let bin = self.bin_at(UNSORTED);
        let first = Chunk::fd(bin).unwrap();
        Self::splice(bin, chunk, first);
    }

    /// Inserts `chunk` at the head of its small bin. Together with
    /// [`BinDirectory::last`] this makes small bins FIFO.
    pub unsafe fn insert_small(&self, index: usize, chunk: NonNull<Chunk>) {
        let bin = self.bin_at(index);
        let first = Chunk::fd(bin).unwrap();
        Self::splice(bin, chunk, first);
    }

    /// Inserts `chunk` into its large bin, keeping the list sorted by size
    /// descending and threading the `fd_nextsize` chain over the distinct
    /// sizes. The first chunk of each size is the chain member; duplicates
    /// are parked right behind it so they can be unlinked without touching
    /// the chain.
    pub unsafe fn insert_large(&self, index: usize, chunk: NonNull<Chunk>) {
        let bin = self.bin_at(index);
        let size = Chunk::size(chunk);

        if self.is_empty(index) {
            Chunk::set_fd_nextsize(chunk, Some(chunk));
            Chunk::set_bk_nextsize(chunk, Some(chunk));
            Self::splice(bin, chunk, bin);
            return;
        }

        let first = Chunk::fd(bin).unwrap();
        let tail = Chunk::bk(bin).unwrap();

        if size < Chunk::size(tail) {
            // New smallest size: append at the tail and wrap the skip chain
            // around through the head.
            let smallest = Chunk::bk_nextsize(first).unwrap();
            Chunk::set_fd_nextsize(chunk, Some(first));
            Chunk::set_bk_nextsize(chunk, Some(smallest));
            Chunk::set_bk_nextsize(first, Some(chunk));
            Chunk::set_fd_nextsize(smallest, Some(chunk));
            Self::splice(tail, chunk, bin);
            return;
        }

        // Walk the distinct sizes down until ours fits.
        let mut fwd = first;
        while size < Chunk::size(fwd) {
            fwd = Chunk::fd_nextsize(fwd).unwrap();
        }

        if size == Chunk::size(fwd) {
            // Same size already present: park behind the chain member.
            let fwd = Chunk::fd(fwd).unwrap();
            Chunk::set_fd_nextsize(chunk, None);
            Chunk::set_bk_nextsize(chunk, None);
            let bck = Chunk::bk(fwd).unwrap();
            Self::splice(bck, chunk, fwd);
        } else {
            // New distinct size: becomes a chain member in front of `fwd`.
            let larger = Chunk::bk_nextsize(fwd).unwrap();
            Chunk::set_fd_nextsize(chunk, Some(fwd));
            Chunk::set_bk_nextsize(chunk, Some(larger));
            Chunk::set_bk_nextsize(fwd, Some(chunk));
            Chunk::set_fd_nextsize(larger, Some(chunk));
            let bck = Chunk::bk(fwd).unwrap();
            Self::splice(bck, chunk, fwd);
        }
    }

    /// Finds the smallest chunk in large bin `index` whose size is at least
    /// `wanted`, without unlinking it. Prefers the second chunk of a size
    /// group over the chain member so the skip chain survives the unlink.
    pub unsafe fn smallest_at_least(&self, index: usize, wanted: usize) -> Pointer<Chunk> {
        let bin = self.bin_at(index);
        if self.is_empty(index) {
            return None;
        }

        let first = Chunk::fd(bin).unwrap();
        if Chunk::size(first) < wanted {
            return None;
        }

        // Start from the smallest size and climb until one fits.
        let mut victim = Chunk::bk_nextsize(first).unwrap();
        while Chunk::size(victim) < wanted {
            victim = Chunk::bk_nextsize(victim).unwrap();
        }

        if Some(victim) != Chunk::bk(bin) {
            let next = Chunk::fd(victim).unwrap();
            if Chunk::size(next) == Chunk::size(victim) {
                victim = next;
            }
        }

        Some(victim)
    }

    /// Removes `chunk` from whatever doubly linked bin it is in, fixing up
    /// the large-bin skip chain when `chunk` is a chain member. Fails
    /// without mutating anything when the surrounding links do not point
    /// back at `chunk`, which is the signature of heap corruption.
    pub unsafe fn unlink(&self, chunk: NonNull<Chunk>) -> Result<(), ()> {
        let size = Chunk::size(chunk);
        let (Some(fd), Some(bk)) = (Chunk::fd(chunk), Chunk::bk(chunk)) else {
            return Err(());
        };
        if Chunk::bk(fd) != Some(chunk) || Chunk::fd(bk) != Some(chunk) {
            return Err(());
        }

        if let Some(fd_next) = Chunk::fd_nextsize(chunk) {
            // Chain member of a large bin.
            let Some(bk_next) = Chunk::bk_nextsize(chunk) else {
                return Err(());
            };
            if Chunk::bk_nextsize(fd_next) != Some(chunk)
                || Chunk::fd_nextsize(bk_next) != Some(chunk)
            {
                return Err(());
            }

            let bin = self.bin_at(largebin_index(size));
            if fd != bin && Chunk::size(fd) == size {
                // A duplicate follows: promote it to chain member.
                if fd_next == chunk {
                    Chunk::set_fd_nextsize(fd, Some(fd));
                    Chunk::set_bk_nextsize(fd, Some(fd));
                } else {
                    Chunk::set_fd_nextsize(fd, Some(fd_next));
                    Chunk::set_bk_nextsize(fd, Some(bk_next));
                    Chunk::set_bk_nextsize(fd_next, Some(fd));
                    Chunk::set_fd_nextsize(bk_next, Some(fd));
                }
            } else if fd_next != chunk {
                // Last of its size: drop it from the chain.
                Chunk::set_bk_nextsize(fd_next, Some(bk_next));
                Chunk::set_fd_nextsize(bk_next, Some(fd_next));
            }
        }

        Chunk::set_bk(fd, Some(bk));
        Chunk::set_fd(bk, Some(fd));
        Chunk::set_fd(chunk, None);
        Chunk::set_bk(chunk, None);
        Chunk::set_fd_nextsize(chunk, None);
        Chunk::set_bk_nextsize(chunk, None);

        Ok(())
    }
}
