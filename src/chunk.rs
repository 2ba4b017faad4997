use std::{mem, ptr::NonNull};

use crate::{
    align::{align_up, is_aligned},
    Pointer,
};

/// Machine word size in bytes. 8 on the 64 bit machines this crate mostly
/// runs on, 4 on 32 bit targets.
pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>();

/// Every user pointer handed out by the allocator is aligned to this, and
/// every chunk size is a multiple of it.
pub(crate) const CHUNK_ALIGN: usize = 2 * WORD_SIZE;

/// Bit mask version of [`CHUNK_ALIGN`].
pub(crate) const CHUNK_ALIGN_MASK: usize = CHUNK_ALIGN - 1;

/// Overhead of an in-use heap chunk. Only the size word counts: the
/// `prev_size` word of the *successor* chunk belongs to this chunk's user
/// range while this chunk is in use (see [`Chunk`]).
pub(crate) const CHUNK_OVERHEAD: usize = WORD_SIZE;

/// Overhead of a mapped chunk. A mapped chunk has no successor whose
/// `prev_size` word it could borrow, so both header words are overhead.
pub(crate) const MMAP_OVERHEAD: usize = 2 * WORD_SIZE;

/// Smallest chunk the allocator will ever carve. A free chunk must be able
/// to hold its two header words plus the `fd`/`bk` links, so the minimum is
/// four words rounded up to [`CHUNK_ALIGN`].
pub(crate) const MIN_CHUNK_SIZE: usize = align_up(4 * WORD_SIZE, CHUNK_ALIGN);

/// Set when the chunk immediately before this one in address order is in
/// use. The first chunk of every segment has it set by convention.
pub(crate) const PREV_INUSE: usize = 0x1;

/// Set when the chunk is a standalone page mapping rather than part of the
/// heap segment. Mapped chunks are never binned and never coalesced.
pub(crate) const IS_MMAPPED: usize = 0x2;

/// Reserved flag bit. Always zero in this single-arena design.
#[allow(dead_code)]
pub(crate) const RESERVED_FLAG: usize = 0x4;

/// Low bits of the size word that hold flags instead of size.
pub(crate) const FLAG_MASK: usize = 0x7;

/// A chunk is a contiguous byte range whose metadata lives at its own low
/// addresses. This is how one looks in memory:
///
/// ```text
///               +----------------------------+
/// chunk ->      | size of previous chunk     | <- meaningful only when the
///               +----------------------------+    previous chunk is free
///               | size of this chunk | flags |
///               +----------------------------+
/// user ->       | forward link (fd)          | <-+
///               +----------------------------+   |
///               | backward link (bk)         |   | Only while the chunk is
///               +----------------------------+   | free. While in use this
///               | fd_nextsize (large bins)   |   | is plain user content.
///               +----------------------------+   |
///               | bk_nextsize (large bins)   | <-+
///               +----------------------------+
///               |            ...             |
///               +----------------------------+
/// next chunk -> | size of this chunk         | <- the footer: the successor's
///               +----------------------------+    `prev_size` slot mirrors our
///               |            ...             |    size while we are free
/// ```
///
/// Two details carry the whole design:
///
/// * The `prev_size` slot of the *successor* overlaps the last word of this
///   chunk. While this chunk is in use, that word is user content and must
///   never be written by the allocator; only when this chunk is free does it
///   become the size footer that lets the successor find our header with a
///   single subtraction. The `PREV_INUSE` flag is the sole guarantor of
///   which interpretation is current.
/// * The size word packs three flag bits into its low bits, which is fine
///   because sizes are multiples of [`CHUNK_ALIGN`]. Nothing outside this
///   module reads the word raw; everything goes through the accessors below
///   that mask and OR explicitly.
///
/// All accessors take `NonNull<Chunk>` instead of `&self` on purpose: a
/// `&Chunk` would assert validity over all six words, but a minimum-sized
/// chunk only owns four and an in-use chunk's link words belong to the user.
/// Field projections through raw pointers keep Miri happy, see
/// [Stacked Borrows](https://github.com/rust-lang/unsafe-code-guidelines/blob/master/wip/stacked-borrows.md).
#[repr(C)]
pub(crate) struct Chunk {
    /// Size of the previous chunk, if the previous chunk is free. Owned by
    /// the previous chunk's user range otherwise.
    prev_size: usize,
    /// Size of this chunk ORed with the flag bits.
    head: usize,
    /// Next chunk in the same bin.
    fd: Pointer<Chunk>,
    /// Previous chunk in the same bin.
    bk: Pointer<Chunk>,
    /// Next distinct-size leader in a large bin.
    fd_nextsize: Pointer<Chunk>,
    /// Previous distinct-size leader in a large bin.
    bk_nextsize: Pointer<Chunk>,
}

impl Chunk {
    /// Returns the chunk whose user region starts at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be a pointer previously produced by
    /// [`Chunk::user_pointer_of`], i.e. one that the allocator handed out.
    #[inline]
    pub unsafe fn from_user_pointer(address: NonNull<u8>) -> NonNull<Chunk> {
        NonNull::new_unchecked(address.as_ptr().sub(2 * WORD_SIZE).cast())
    }

    /// Returns the address of the chunk's user region, right after the two
    /// header words.
    #[inline]
    pub unsafe fn user_pointer_of(chunk: NonNull<Chunk>) -> NonNull<u8> {
        NonNull::new_unchecked(chunk.as_ptr().cast::<u8>().add(2 * WORD_SIZE))
    }

    /// Reinterprets `address` as a chunk header. The caller is asserting
    /// that a valid header lives there.
    #[inline]
    pub unsafe fn at(address: NonNull<u8>) -> NonNull<Chunk> {
        address.cast()
    }

    /// Chunk size in bytes with the flag bits masked out.
    #[inline]
    pub unsafe fn size(chunk: NonNull<Chunk>) -> usize {
        (*chunk.as_ptr()).head & !FLAG_MASK
    }

    /// Writes the size word, ORing `size` with the given flag bits.
    #[inline]
    pub unsafe fn set_head(chunk: NonNull<Chunk>, size: usize, flags: usize) {
        (*chunk.as_ptr()).head = size | flags;
    }

    /// Replaces the size while keeping whatever flags are currently set.
    #[inline]
    pub unsafe fn set_size(chunk: NonNull<Chunk>, size: usize) {
        let flags = (*chunk.as_ptr()).head & FLAG_MASK;
        (*chunk.as_ptr()).head = size | flags;
    }

    /// Whether the chunk immediately before this one is in use.
    #[inline]
    pub unsafe fn prev_inuse(chunk: NonNull<Chunk>) -> bool {
        (*chunk.as_ptr()).head & PREV_INUSE != 0
    }

    /// Whether this chunk is a standalone page mapping.
    #[inline]
    pub unsafe fn is_mmapped(chunk: NonNull<Chunk>) -> bool {
        (*chunk.as_ptr()).head & IS_MMAPPED != 0
    }

    /// Size of the previous (free) chunk, read from the shared slot.
    #[inline]
    pub unsafe fn prev_size(chunk: NonNull<Chunk>) -> usize {
        (*chunk.as_ptr()).prev_size
    }

    /// Writes the shared slot. Only legal while the previous chunk is free
    /// (or while this chunk is a mapped chunk using the slot for its page
    /// alignment correction).
    #[inline]
    pub unsafe fn set_prev_size(chunk: NonNull<Chunk>, size: usize) {
        (*chunk.as_ptr()).prev_size = size;
    }

    /// The chunk right after this one in address order.
    #[inline]
    pub unsafe fn next(chunk: NonNull<Chunk>) -> NonNull<Chunk> {
        NonNull::new_unchecked(chunk.as_ptr().cast::<u8>().add(Self::size(chunk)).cast())
    }

    /// The chunk right before this one in address order. Only meaningful
    /// when [`Chunk::prev_inuse`] is false, because only then does the
    /// shared slot hold the predecessor's size.
    #[inline]
    pub unsafe fn prev(chunk: NonNull<Chunk>) -> NonNull<Chunk> {
        let distance = Self::prev_size(chunk);
        NonNull::new_unchecked(chunk.as_ptr().cast::<u8>().sub(distance).cast())
    }

    /// Whether this chunk is in use, as recorded in the successor's header.
    #[inline]
    pub unsafe fn inuse(chunk: NonNull<Chunk>) -> bool {
        Self::prev_inuse(Self::next(chunk))
    }

    /// Marks this chunk in use by setting the successor's `PREV_INUSE` bit.
    #[inline]
    pub unsafe fn set_inuse(chunk: NonNull<Chunk>) {
        let next = Self::next(chunk);
        (*next.as_ptr()).head |= PREV_INUSE;
    }

    /// Marks this chunk free in the successor's header and mirrors the size
    /// into the footer so the successor can navigate back to us.
    #[inline]
    pub unsafe fn set_free(chunk: NonNull<Chunk>) {
        let next = Self::next(chunk);
        (*next.as_ptr()).head &= !PREV_INUSE;
        Self::set_prev_size(next, Self::size(chunk));
    }

    /// Bin links. Only valid while the chunk is free.
    #[inline]
    pub unsafe fn fd(chunk: NonNull<Chunk>) -> Pointer<Chunk> {
        (*chunk.as_ptr()).fd
    }

    #[inline]
    pub unsafe fn set_fd(chunk: NonNull<Chunk>, fd: Pointer<Chunk>) {
        (*chunk.as_ptr()).fd = fd;
    }

    #[inline]
    pub unsafe fn bk(chunk: NonNull<Chunk>) -> Pointer<Chunk> {
        (*chunk.as_ptr()).bk
    }

    #[inline]
    pub unsafe fn set_bk(chunk: NonNull<Chunk>, bk: Pointer<Chunk>) {
        (*chunk.as_ptr()).bk = bk;
    }

    /// Skip-chain links threading the distinct sizes of a large bin. Only
    /// valid for chunks in a large bin; `None` everywhere else.
    #[inline]
    pub unsafe fn fd_nextsize(chunk: NonNull<Chunk>) -> Pointer<Chunk> {
        (*chunk.as_ptr()).fd_nextsize
    }

    #[inline]
    pub unsafe fn set_fd_nextsize(chunk: NonNull<Chunk>, link: Pointer<Chunk>) {
        (*chunk.as_ptr()).fd_nextsize = link;
    }

    #[inline]
    pub unsafe fn bk_nextsize(chunk: NonNull<Chunk>) -> Pointer<Chunk> {
        (*chunk.as_ptr()).bk_nextsize
    }

    #[inline]
    pub unsafe fn set_bk_nextsize(chunk: NonNull<Chunk>, link: Pointer<Chunk>) {
        (*chunk.as_ptr()).bk_nextsize = link;
    }

    /// Bytes the user may actually touch through the pointer we handed out.
    #[inline]
    pub unsafe fn usable_size(chunk: NonNull<Chunk>) -> usize {
        if Self::is_mmapped(chunk) {
            Self::size(chunk) - MMAP_OVERHEAD
        } else {
            Self::size(chunk) - CHUNK_OVERHEAD
        }
    }
}

/// Converts a user-requested byte count into the canonical chunk size:
/// request plus one word of overhead, rounded up to [`CHUNK_ALIGN`] and to
/// at least [`MIN_CHUNK_SIZE`]. Returns `None` when the request is so large
/// that the padded size would overflow the address space.
#[inline]
pub(crate) fn request_to_chunk_size(request: usize) -> Option<usize> {
    let padded = request.checked_add(CHUNK_OVERHEAD + CHUNK_ALIGN_MASK)?;
    // Half the address space is plenty and keeps later size additions
    // (alignment slack, page rounding) free of overflow checks.
    if padded > usize::MAX / 2 {
        return None;
    }
    Some((padded & !CHUNK_ALIGN_MASK).max(MIN_CHUNK_SIZE))
}

/// Whether `address` could have been returned by the allocator at all.
#[inline]
pub(crate) fn is_user_aligned(address: usize) -> bool {
    is_aligned(address, CHUNK_ALIGN)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Word-aligned scratch buffer that the tests carve fake chunks from.
    #[repr(align(16))]
    struct Scratch([usize; 64]);

    fn scratch() -> Scratch {
        Scratch([0; 64])
    }

    unsafe fn chunk_in(buffer: &mut Scratch, word: usize) -> NonNull<Chunk> {
        NonNull::new_unchecked(buffer.0.as_mut_ptr().add(word).cast())
    }

    #[test]
    fn request_normalization() {
        assert_eq!(request_to_chunk_size(0), Some(MIN_CHUNK_SIZE));
        assert_eq!(request_to_chunk_size(1), Some(MIN_CHUNK_SIZE));
        assert_eq!(
            request_to_chunk_size(MIN_CHUNK_SIZE - CHUNK_OVERHEAD),
            Some(MIN_CHUNK_SIZE)
        );
        assert_eq!(
            request_to_chunk_size(MIN_CHUNK_SIZE - CHUNK_OVERHEAD + 1),
            Some(MIN_CHUNK_SIZE + CHUNK_ALIGN)
        );

        // Normalized sizes are always aligned and cover the request.
        for request in 1..512 {
            let size = request_to_chunk_size(request).unwrap();
            assert_eq!(size & CHUNK_ALIGN_MASK, 0);
            assert!(size - CHUNK_OVERHEAD >= request);
        }

        assert_eq!(request_to_chunk_size(usize::MAX), None);
        assert_eq!(request_to_chunk_size(usize::MAX / 2), None);
    }

    #[test]
    fn head_word_packs_size_and_flags() {
        let mut buffer = scratch();
        unsafe {
            let chunk = chunk_in(&mut buffer, 0);

            Chunk::set_head(chunk, 96, PREV_INUSE);
            assert_eq!(Chunk::size(chunk), 96);
            assert!(Chunk::prev_inuse(chunk));
            assert!(!Chunk::is_mmapped(chunk));

            Chunk::set_size(chunk, 128);
            assert_eq!(Chunk::size(chunk), 128);
            assert!(Chunk::prev_inuse(chunk), "set_size must keep flags");

            Chunk::set_head(chunk, 4096, IS_MMAPPED);
            assert!(Chunk::is_mmapped(chunk));
            assert!(!Chunk::prev_inuse(chunk));
        }
    }

    #[test]
    fn user_pointer_round_trip() {
        let mut buffer = scratch();
        unsafe {
            let chunk = chunk_in(&mut buffer, 0);
            let user = Chunk::user_pointer_of(chunk);

            assert_eq!(
                user.as_ptr() as usize - chunk.as_ptr() as usize,
                2 * WORD_SIZE
            );
            assert!(is_user_aligned(user.as_ptr() as usize));
            assert_eq!(Chunk::from_user_pointer(user), chunk);
        }
    }

    #[test]
    fn neighbor_navigation_through_boundary_tags() {
        let mut buffer = scratch();
        unsafe {
            // Two adjacent chunks: a free one of 4 words and its successor.
            let first = chunk_in(&mut buffer, 0);
            Chunk::set_head(first, 4 * WORD_SIZE, PREV_INUSE);

            let second = Chunk::next(first);
            assert_eq!(second, chunk_in(&mut buffer, 4));
            Chunk::set_head(second, 6 * WORD_SIZE, PREV_INUSE);

            assert!(Chunk::inuse(first));

            // Marking the first chunk free mirrors its size into the shared
            // slot, which is what lets the successor navigate back.
            Chunk::set_free(first);
            assert!(!Chunk::inuse(first));
            assert!(!Chunk::prev_inuse(second));
            assert_eq!(Chunk::prev_size(second), 4 * WORD_SIZE);
            assert_eq!(Chunk::prev(second), first);

            Chunk::set_inuse(first);
            assert!(Chunk::inuse(first));
        }
    }

    #[test]
    fn usable_size_per_chunk_kind() {
        let mut buffer = scratch();
        unsafe {
            let chunk = chunk_in(&mut buffer, 0);

            Chunk::set_head(chunk, 96, PREV_INUSE);
            assert_eq!(Chunk::usable_size(chunk), 96 - CHUNK_OVERHEAD);

            Chunk::set_head(chunk, 4096, IS_MMAPPED);
            assert_eq!(Chunk::usable_size(chunk), 4096 - MMAP_OVERHEAD);
        }
    }
}
