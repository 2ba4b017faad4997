/// Read-only snapshot of an arena's resource accounting, taken under the
/// facade lock by [`crate::Tagalloc::stats`]. All byte counts are what the
/// arena obtained from its page source, not what users requested.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes currently obtained through heap extension.
    pub bytes_via_heap_extend: usize,
    /// High-water mark of [`Self::bytes_via_heap_extend`].
    pub max_bytes_via_heap_extend: usize,
    /// Bytes currently obtained through page mappings.
    pub bytes_via_mapping: usize,
    /// High-water mark of [`Self::bytes_via_mapping`].
    pub max_bytes_via_mapping: usize,
    /// Live page mappings.
    pub mapping_count: usize,
    /// High-water mark of [`Self::mapping_count`].
    pub max_mapping_count: usize,
    /// Current fast-bin size threshold (chunk size, 0 disables fast bins).
    pub max_fast: usize,
    /// Top surplus beyond which free releases memory back to the kernel.
    pub trim_threshold: usize,
    /// Extra slack requested with every heap extension and kept on trim.
    pub top_pad: usize,
    /// Request size at which allocation switches to page mappings.
    pub mmap_threshold: usize,
    /// Maximum number of simultaneous page mappings.
    pub mmap_max: usize,
}
