//! Buffer allocation flags.

use bitflags::bitflags;

bitflags! {
    /// Bit-set of per-buffer allocation flags.
    ///
    /// Flags are fixed at allocation time and never change for the lifetime
    /// of the buffer. They select the caching policy, the user-mapping
    /// strategy, and a handful of diagnostic markers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Buffer is CPU-cached and requires explicit sync before a device
        /// may observe CPU writes.
        const CACHED = 1 << 0;
        /// Cached buffer using the fault-driven page-tracking path rather
        /// than a single coherent mapping. Implies per-page dirty tracking.
        const CACHED_NEEDS_SYNC = 1 << 1;
        /// Backing pages were not zeroed at allocation. Such buffers must
        /// never be user-mapped.
        const NOZEROED = 1 << 2;
        /// Buffer was reclaimed by memory pressure (diagnostic marker).
        const SHRINKER_FREE = 1 << 3;
        /// Buffer contents were migrated between backing stores.
        const MIGRATED = 1 << 4;
        /// Backing pages are known-initialized and ready for use.
        const READY_TO_USE = 1 << 5;
    }
}

impl BufferFlags {
    /// True if the buffer is CPU-cached (either caching flag).
    #[inline]
    pub fn is_cached(self) -> bool {
        self.intersects(BufferFlags::CACHED | BufferFlags::CACHED_NEEDS_SYNC)
    }

    /// True if user mappings of this buffer are built page-by-page on fault,
    /// with per-page dirty tracking, instead of one eager mapping.
    ///
    /// Both cache bits are required: `CACHED_NEEDS_SYNC` qualifies *how* a
    /// cached buffer is kept coherent and has no meaning on its own, so a
    /// buffer carrying it without `CACHED` stays on the eager path.
    #[inline]
    pub fn fault_mapped(self) -> bool {
        self.contains(BufferFlags::CACHED | BufferFlags::CACHED_NEEDS_SYNC)
    }

    /// True if user mapping is forbidden for this buffer.
    #[inline]
    pub fn mmap_forbidden(self) -> bool {
        self.contains(BufferFlags::NOZEROED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_mapped_requires_both_cache_flags() {
        assert!(!BufferFlags::CACHED.fault_mapped());
        assert!(!BufferFlags::CACHED_NEEDS_SYNC.fault_mapped());
        assert!((BufferFlags::CACHED | BufferFlags::CACHED_NEEDS_SYNC).fault_mapped());
    }

    #[test]
    fn test_nozeroed_forbids_mmap() {
        assert!(BufferFlags::NOZEROED.mmap_forbidden());
        assert!(!BufferFlags::CACHED.mmap_forbidden());
    }
}
