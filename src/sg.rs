//! Scatter-gather descriptions of buffer backing memory.
//!
//! A buffer's backing store is described as an ordered list of segments,
//! each covering a contiguous byte range of a memfd-backed region. Segments
//! reference [`PageFrame`]s: page-granular units that may or may not carry a
//! persistent linear mapping. Frames without one (the highmem analog) can
//! only be touched through a temporary mapping — either a single-page kmap
//! or a slot in the device's bounded sync-window pool.

use rustix::fd::OwnedFd;
use smallvec::SmallVec;
use std::ptr::NonNull;
use std::sync::Arc;

/// Page size used throughout the allocator. Allocation lengths are rounded
/// up to this granularity.
pub const PAGE_SIZE: usize = 4096;

/// Round `len` up to the next page boundary.
#[inline]
pub fn page_align(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// One page of backing store.
///
/// A frame is addressed as `(fd, offset)` within its heap's memfd region.
/// `linear` is the heap's persistent mapping of the page, when it keeps one;
/// `None` models a highmem page that must be mapped on demand.
#[derive(Clone)]
pub struct PageFrame {
    fd: Arc<OwnedFd>,
    offset: u64,
    linear: Option<NonNull<u8>>,
}

// SAFETY: the frame only carries an address; all access goes through
// methods whose callers uphold aliasing rules. The fd is Send + Sync.
unsafe impl Send for PageFrame {}
unsafe impl Sync for PageFrame {}

impl PageFrame {
    /// Create a frame with a persistent linear mapping (lowmem analog).
    pub fn with_linear(fd: Arc<OwnedFd>, offset: u64, linear: NonNull<u8>) -> Self {
        Self {
            fd,
            offset,
            linear: Some(linear),
        }
    }

    /// Create a frame without a persistent mapping (highmem analog).
    pub fn unmapped(fd: Arc<OwnedFd>, offset: u64) -> Self {
        Self {
            fd,
            offset,
            linear: None,
        }
    }

    /// The memfd backing this frame.
    pub fn fd(&self) -> &Arc<OwnedFd> {
        &self.fd
    }

    /// Byte offset of this frame within its backing fd.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The frame's persistent linear mapping, if the heap keeps one.
    pub fn linear(&self) -> Option<NonNull<u8>> {
        self.linear
    }

    /// Derive the frame `pages` pages after this one within the same
    /// contiguous backing range.
    pub(crate) fn advance(&self, pages: usize) -> Self {
        let delta = (pages * PAGE_SIZE) as u64;
        Self {
            fd: Arc::clone(&self.fd),
            offset: self.offset + delta,
            linear: self
                .linear
                .map(|p| unsafe { NonNull::new_unchecked(p.as_ptr().add(pages * PAGE_SIZE)) }),
        }
    }
}

impl std::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFrame")
            .field("offset", &self.offset)
            .field("linear", &self.linear.is_some())
            .finish()
    }
}

/// One contiguous span of backing memory.
///
/// `offset` and `len` are relative to `frame` and may describe a sub-page
/// span; bulk operations treat page-aligned and unaligned segments
/// differently (see the window pool).
#[derive(Clone, Debug)]
pub struct SgSegment {
    /// First frame of the span.
    pub frame: PageFrame,
    /// Byte offset into the first frame.
    pub offset: u32,
    /// Span length in bytes. May cover multiple contiguous frames.
    pub len: u32,
}

impl SgSegment {
    /// True if this segment starts and ends on page boundaries.
    pub fn is_page_aligned(&self) -> bool {
        self.offset as usize % PAGE_SIZE == 0 && self.len as usize % PAGE_SIZE == 0
    }
}

/// An ordered scatter-gather list describing a buffer's backing memory.
#[derive(Clone, Debug, Default)]
pub struct SgTable {
    segments: SmallVec<[SgSegment; 4]>,
}

impl SgTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment.
    pub fn push(&mut self, segment: SgSegment) {
        self.segments.push(segment);
    }

    /// The segments in order.
    pub fn segments(&self) -> &[SgSegment] {
        &self.segments
    }

    /// Total byte length covered by the table.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len as usize).sum()
    }

    /// True if the table covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if every segment is page-aligned.
    pub fn is_page_aligned(&self) -> bool {
        self.segments.iter().all(SgSegment::is_page_aligned)
    }

    /// Number of whole pages covered, assuming page alignment.
    pub fn page_count(&self) -> usize {
        self.len().div_ceil(PAGE_SIZE)
    }

    /// Flatten the table into a per-page frame array.
    ///
    /// Fault-driven user mapping needs page-granular access to the backing
    /// store; this walks every aligned segment and yields one frame per page.
    pub fn pages(&self) -> Vec<PageFrame> {
        let mut out = Vec::with_capacity(self.page_count());
        for seg in &self.segments {
            debug_assert!(seg.is_page_aligned(), "page array over unaligned segment");
            let pages = seg.len as usize / PAGE_SIZE;
            let first = seg.frame.advance(seg.offset as usize / PAGE_SIZE);
            for i in 0..pages {
                out.push(first.advance(i));
            }
        }
        out
    }

    /// Build a table covering only the listed pages of `pages`, one
    /// page-sized segment each. Used by the sync path to flush a dirty
    /// subset of a buffer.
    pub fn from_page_subset(pages: &[PageFrame], indices: &[usize]) -> Self {
        let mut table = Self::new();
        for &i in indices {
            table.push(SgSegment {
                frame: pages[i].clone(),
                offset: 0,
                len: PAGE_SIZE as u32,
            });
        }
        table
    }
}
