//! # Segment Directory
//!
//! An ordered list of physically separate backing buffers that together form
//! one logical, monotonically increasing offset space.
//!
//! ```text
//!   segment 0            segment 1                  segment 2
//! +-----------+ +-----------------------+ +-------------------------------+
//! | 0 .. S0   | | S0 .. S0+S1           | | S0+S1 .. S0+S1+S2             |
//! +-----------+ +-----------------------+ +-------------------------------+
//! ```
//!
//! Every other component addresses memory through [`Addr`], a logical offset
//! into this space. Segments are created once and never resized or freed.

use std::fmt;

use bytemuck::Pod;

use crate::error::{MemoryError, MemoryResult};

/// A logical address in the combined segment space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Addr(usize);

impl Addr {
    /// Creates an address from a logical offset.
    #[inline]
    #[must_use]
    pub const fn new(offset: usize) -> Self {
        Self(offset)
    }

    /// Returns the logical offset.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }

    /// Returns the address `bytes` further along.
    #[inline]
    #[must_use]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// One physically distinct backing buffer.
pub struct Segment {
    /// Starting logical offset.
    base: usize,
    /// Capacity in bytes.
    size: usize,
    /// Bytes occupied by hunk records.
    used: usize,
    /// Backing storage.
    memory: Box<[u8]>,
}

impl Segment {
    /// Returns the starting logical offset.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Returns the capacity in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the bytes occupied by hunk records.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Returns the logical offset one past the last byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.size
    }

    #[inline]
    const fn contains(&self, offset: usize) -> bool {
        self.base <= offset && offset < self.base + self.size
    }

    #[inline]
    pub(crate) fn set_used(&mut self, used: usize) {
        debug_assert!(used <= self.size);
        self.used = used;
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

/// Owns every segment and translates logical addresses to backing bytes.
#[derive(Debug)]
pub struct SegmentDirectory {
    segments: Vec<Segment>,
    max_segments: usize,
}

impl SegmentDirectory {
    /// Creates a directory with a single segment of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::BackingAllocation`] if the buffer cannot be allocated.
    pub fn new(size: usize, max_segments: usize) -> MemoryResult<Self> {
        let memory = allocate_backing(size)?;
        let mut segments = Vec::with_capacity(max_segments);
        segments.push(Segment {
            base: 0,
            size,
            used: 0,
            memory,
        });
        Ok(Self {
            segments,
            max_segments,
        })
    }

    /// Returns the number of segments.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Always false: the directory holds at least one segment.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the segment count limit.
    #[inline]
    #[must_use]
    pub const fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// Returns the segment at `index`.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    /// Returns the newest segment.
    #[inline]
    #[must_use]
    pub fn last(&self) -> &Segment {
        &self.segments[self.segments.len() - 1]
    }

    /// Iterates over the segments in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    #[inline]
    pub(crate) fn segment_mut(&mut self, index: usize) -> &mut Segment {
        &mut self.segments[index]
    }

    /// Returns the end of the logical address space.
    #[inline]
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.last().end()
    }

    /// Finds the segment whose range contains `offset`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::BadOffset`] if no segment contains it.
    pub fn offset_to_segment(&self, offset: usize) -> MemoryResult<usize> {
        self.segments
            .iter()
            .rposition(|seg| seg.contains(offset))
            .ok_or(MemoryError::BadOffset {
                offset,
                max: self.total_size(),
            })
    }

    /// Finds the segment whose backing buffer contains `ptr`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::BadPointer`] if no segment contains it.
    pub fn pointer_to_segment(&self, ptr: *const u8) -> MemoryResult<usize> {
        self.segments
            .iter()
            .rposition(|seg| seg.memory.as_ptr_range().contains(&ptr))
            .ok_or(MemoryError::BadPointer)
    }

    /// Converts a pointer into backing memory back to its logical address.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::BadPointer`] if no segment contains it.
    pub fn addr_of(&self, ptr: *const u8) -> MemoryResult<Addr> {
        let index = self.pointer_to_segment(ptr)?;
        let seg = &self.segments[index];
        let local = ptr as usize - seg.memory.as_ptr() as usize;
        Ok(Addr(seg.base + local))
    }

    /// Appends a segment of `max(last.size * 2, requested)` bytes.
    ///
    /// Callers must evict every cache entry first: the cache may only live
    /// in the last segment.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::SegmentOverflow`] at the segment limit and
    /// [`MemoryError::BackingAllocation`] if the buffer cannot be allocated.
    pub(crate) fn grow(&mut self, requested: usize) -> MemoryResult<usize> {
        if self.segments.len() >= self.max_segments {
            return Err(MemoryError::SegmentOverflow {
                max: self.max_segments,
            });
        }

        let last = self.last();
        let base = last.end();
        let size = last.size.saturating_mul(2).max(requested);

        tracing::info!(
            base,
            size,
            "allocating new hunk segment: {:.2} MiB",
            size as f64 / 1_048_576.0
        );

        let memory = allocate_backing(size)?;
        self.segments.push(Segment {
            base,
            size,
            used: 0,
            memory,
        });
        Ok(self.segments.len() - 1)
    }

    /// Locates `len` bytes at `addr` inside a single segment.
    fn span(&self, addr: Addr, len: usize) -> MemoryResult<(usize, usize)> {
        let index = self.offset_to_segment(addr.0)?;
        let seg = &self.segments[index];
        let local = addr.0 - seg.base;
        if len > seg.size - local {
            return Err(MemoryError::BadOffset {
                offset: addr.0 + len,
                max: seg.end(),
            });
        }
        Ok((index, local))
    }

    /// Borrows `len` bytes starting at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::BadOffset`] if the range is not inside one segment.
    pub fn bytes(&self, addr: Addr, len: usize) -> MemoryResult<&[u8]> {
        let (index, local) = self.span(addr, len)?;
        Ok(&self.segments[index].memory[local..local + len])
    }

    /// Mutably borrows `len` bytes starting at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::BadOffset`] if the range is not inside one segment.
    pub fn bytes_mut(&mut self, addr: Addr, len: usize) -> MemoryResult<&mut [u8]> {
        let (index, local) = self.span(addr, len)?;
        Ok(&mut self.segments[index].memory[local..local + len])
    }

    /// Reads a header struct stored at `addr`.
    pub(crate) fn read_pod<T: Pod>(&self, addr: Addr) -> MemoryResult<T> {
        let bytes = self.bytes(addr, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Writes a header struct at `addr`.
    pub(crate) fn write_pod<T: Pod>(&mut self, addr: Addr, value: &T) -> MemoryResult<()> {
        let bytes = self.bytes_mut(addr, std::mem::size_of::<T>())?;
        bytes.copy_from_slice(bytemuck::bytes_of(value));
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dst`; both ranges must share a segment.
    pub(crate) fn copy_within(&mut self, src: Addr, dst: Addr, len: usize) -> MemoryResult<()> {
        let (src_index, src_local) = self.span(src, len)?;
        let (dst_index, dst_local) = self.span(dst, len)?;
        if src_index != dst_index {
            return Err(MemoryError::BadOffset {
                offset: dst.0,
                max: self.segments[src_index].end(),
            });
        }
        self.segments[src_index]
            .memory
            .copy_within(src_local..src_local + len, dst_local);
        Ok(())
    }
}

/// Allocates a zeroed backing buffer without aborting on failure.
fn allocate_backing(size: usize) -> MemoryResult<Box<[u8]>> {
    let mut memory = Vec::new();
    memory
        .try_reserve_exact(size)
        .map_err(|_| MemoryError::BackingAllocation { size })?;
    memory.resize(size, 0u8);
    Ok(memory.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_lookup_across_segments() {
        let mut dir = SegmentDirectory::new(1024, 4).unwrap();
        let index = dir.grow(100).unwrap();
        assert_eq!(index, 1);
        assert_eq!(dir.get(1).unwrap().base(), 1024);
        assert_eq!(dir.get(1).unwrap().size(), 2048);

        assert_eq!(dir.offset_to_segment(0).unwrap(), 0);
        assert_eq!(dir.offset_to_segment(1023).unwrap(), 0);
        assert_eq!(dir.offset_to_segment(1024).unwrap(), 1);
        assert_eq!(dir.total_size(), 3072);
        assert_eq!(
            dir.offset_to_segment(3072),
            Err(MemoryError::BadOffset { offset: 3072, max: 3072 })
        );
    }

    #[test]
    fn test_grow_honors_large_request() {
        let mut dir = SegmentDirectory::new(1024, 4).unwrap();
        dir.grow(10_000).unwrap();
        assert_eq!(dir.last().size(), 10_000);
        assert_eq!(dir.last().base(), 1024);
    }

    #[test]
    fn test_segment_limit() {
        let mut dir = SegmentDirectory::new(64, 2).unwrap();
        dir.grow(0).unwrap();
        assert_eq!(dir.grow(0), Err(MemoryError::SegmentOverflow { max: 2 }));
    }

    #[test]
    fn test_pointer_lookup_round_trips() {
        let mut dir = SegmentDirectory::new(256, 4).unwrap();
        dir.grow(0).unwrap();
        let ptr = dir.bytes(Addr::new(300), 4).unwrap().as_ptr();
        assert_eq!(dir.pointer_to_segment(ptr).unwrap(), 1);
        assert_eq!(dir.addr_of(ptr).unwrap(), Addr::new(300));

        let outside = [0u8; 4];
        assert_eq!(dir.pointer_to_segment(outside.as_ptr()), Err(MemoryError::BadPointer));
    }

    #[test]
    fn test_ranges_never_span_segments() {
        let mut dir = SegmentDirectory::new(256, 4).unwrap();
        dir.grow(0).unwrap();
        assert!(dir.bytes(Addr::new(250), 6).is_ok());
        assert!(dir.bytes(Addr::new(250), 7).is_err());
    }
}
