//! # Hunk Arena
//!
//! A segmented, append-only stack allocator. Memory is released only by
//! resetting the low mark to an earlier save point.
//!
//! Every record starts with a [`HunkHeader`] and records are packed
//! back-to-back inside a segment:
//!
//! ```text
//! +--------+---------+--------+---------+--------+---------------------+
//! | header | payload | header | payload | header | payload |  (cache)  |
//! +--------+---------+--------+---------+--------+---------------------+
//! ^ segment base                                 ^ low mark
//! ```
//!
//! Growth is coupled to the cache: every allocation that advances the low
//! mark relocates or evicts cache entries that now lie below it, and adding a
//! segment flushes the cache entirely.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::cache::Cache;
use crate::error::{MemoryError, MemoryResult};
use crate::segment::{Addr, SegmentDirectory};

/// Magic value at the start of every hunk record.
pub const HUNK_SENTINEL: u32 = 0x1DF0_01ED;

/// Bytes reserved for a record name, including the terminator.
pub const HUNK_NAME_LEN: usize = 24;

/// Size of the header preceding every hunk payload.
pub const HUNK_HEADER_SIZE: usize = std::mem::size_of::<HunkHeader>();

/// Header embedded at the start of every hunk record.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct HunkHeader {
    sentinel: u32,
    /// Header plus rounded payload.
    size: u32,
    name: [u8; HUNK_NAME_LEN],
}

/// Whether a new hunk record is cleared before it is returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HunkFill {
    /// Payload is zero-filled.
    Zeroed,
    /// Payload keeps whatever bytes were there.
    Uninit,
}

/// A restore point returned by [`Hunk::low_mark`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HunkMark(usize);

impl HunkMark {
    /// Returns the logical offset of the mark.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }
}

/// Rounds `size` up to a multiple of 16.
#[inline]
pub(crate) fn align16(size: usize) -> Option<usize> {
    size.checked_add(15).map(|s| s & !15)
}

/// Encodes a diagnostic name, truncated at a char boundary to leave a terminator.
pub(crate) fn encode_name<const N: usize>(name: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let mut len = name.len().min(N - 1);
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

/// Decodes a name written by [`encode_name`].
pub(crate) fn decode_name(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

/// Index of the segment a mark falls in; a full hunk maps past the last one.
fn segment_for_mark(segments: &SegmentDirectory, mark: usize) -> MemoryResult<usize> {
    if mark == segments.total_size() {
        Ok(segments.len())
    } else {
        segments.offset_to_segment(mark)
    }
}

/// One live hunk record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HunkRecord {
    /// Logical offset of the record header.
    pub offset: usize,
    /// Header plus rounded payload.
    pub size: usize,
    /// Diagnostic name.
    pub name: String,
}

/// Stack-discipline allocator state.
#[derive(Debug, Default)]
pub struct Hunk {
    /// Current extent of hunk usage.
    low_mark: usize,
}

impl Hunk {
    /// Creates an empty hunk.
    #[must_use]
    pub const fn new() -> Self {
        Self { low_mark: 0 }
    }

    /// Returns the current low mark as a restore point.
    #[inline]
    #[must_use]
    pub const fn low_mark(&self) -> HunkMark {
        HunkMark(self.low_mark)
    }

    /// Allocates a named record and returns its payload address.
    ///
    /// A size of zero allocates nothing and returns `None`.
    pub(crate) fn allocate(
        &mut self,
        segments: &mut SegmentDirectory,
        cache: &mut Cache,
        size: usize,
        name: Option<&str>,
        fill: HunkFill,
    ) -> MemoryResult<Option<Addr>> {
        if size == 0 {
            return Ok(None);
        }

        let record = align16(size)
            .and_then(|s| s.checked_add(HUNK_HEADER_SIZE))
            .filter(|s| u32::try_from(*s).is_ok())
            .ok_or(MemoryError::InvalidSize { op: "hunk alloc", size })?;

        // Skip segments that can't hold the whole record. Their tails are wasted.
        let mut mark = self.low_mark;
        let mut index = segment_for_mark(segments, mark)?;
        while let Some(seg) = segments.get(index) {
            if (mark - seg.base()) + record <= seg.size() {
                break;
            }
            mark = seg.end();
            index += 1;
        }

        if index == segments.len() {
            if segments.len() >= segments.max_segments() {
                return Err(MemoryError::SegmentOverflow {
                    max: segments.max_segments(),
                });
            }
            cache.flush_all(segments)?;
            index = segments.grow(record)?;
            mark = segments.last().base();
        }

        let start = mark;
        self.low_mark = mark + record;
        let seg = segments.segment_mut(index);
        let used = self.low_mark - seg.base();
        seg.set_used(used);

        cache.reclaim_below(segments, self.low_mark)?;

        let addr = Addr::new(start);
        if fill == HunkFill::Zeroed {
            segments.bytes_mut(addr, record)?.fill(0);
        }
        let header = HunkHeader {
            sentinel: HUNK_SENTINEL,
            size: record as u32,
            name: name.map_or([0; HUNK_NAME_LEN], encode_name::<HUNK_NAME_LEN>),
        };
        segments.write_pod(addr, &header)?;

        tracing::trace!(offset = start, size = record, name = name.unwrap_or(""), "hunk alloc");
        Ok(Some(addr.add(HUNK_HEADER_SIZE)))
    }

    /// Discards every record at or above `mark`.
    pub(crate) fn reset_to(&mut self, segments: &mut SegmentDirectory, mark: HunkMark) -> MemoryResult<()> {
        if mark.0 > self.low_mark {
            return Err(MemoryError::BadMark {
                mark: mark.0,
                low_mark: self.low_mark,
            });
        }

        self.low_mark = mark.0;
        let first = segment_for_mark(segments, mark.0)?;
        for index in first..segments.len() {
            let seg = segments.segment_mut(index);
            let used = mark.0.saturating_sub(seg.base());
            seg.set_used(used);
        }
        tracing::trace!(mark = mark.0, "hunk reset");
        Ok(())
    }

    /// Walks every live record, verifying sentinels and sizes.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::HunkSentinel`] or [`MemoryError::HunkBadSize`]
    /// for the first damaged record.
    pub fn records(&self, segments: &SegmentDirectory) -> MemoryResult<Vec<HunkRecord>> {
        let mut records = Vec::new();

        for seg in segments.iter().take_while(|seg| seg.base() < self.low_mark) {
            let mut ofs = 0;
            while ofs < seg.used() {
                let offset = seg.base() + ofs;
                let header: HunkHeader = segments
                    .read_pod(Addr::new(offset))
                    .map_err(|_| MemoryError::HunkBadSize { offset, size: 0 })?;
                if header.sentinel != HUNK_SENTINEL {
                    return Err(MemoryError::HunkSentinel { offset });
                }
                let size = header.size as usize;
                if size < HUNK_HEADER_SIZE || ofs + size > seg.used() {
                    return Err(MemoryError::HunkBadSize { offset, size });
                }
                records.push(HunkRecord {
                    offset,
                    size,
                    name: decode_name(&header.name),
                });
                ofs += size;
            }
        }

        Ok(records)
    }

    /// Runs consistency and sentinel trashing checks.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::HunkSentinel`] or [`MemoryError::HunkBadSize`].
    pub fn check(&self, segments: &SegmentDirectory) -> MemoryResult<()> {
        self.records(segments).map(|_| ())
    }

    /// Builds the diagnostic dump.
    ///
    /// With `all` every record is listed; otherwise consecutive records with
    /// the same name are totaled.
    ///
    /// # Errors
    ///
    /// Fails like [`Hunk::records`] on a damaged record.
    pub fn report(&self, segments: &SegmentDirectory, all: bool) -> MemoryResult<HunkReport> {
        let records = self.records(segments)?;
        let mut rows: Vec<HunkRow> = Vec::new();

        for record in &records {
            let name = if record.name.is_empty() {
                "unknown"
            } else {
                record.name.as_str()
            };
            match rows.last_mut() {
                Some(row) if !all && row.name == name => {
                    row.count += 1;
                    row.size += record.size;
                }
                _ => rows.push(HunkRow {
                    offset: record.offset,
                    count: 1,
                    size: record.size,
                    name: name.to_owned(),
                }),
            }
        }

        Ok(HunkReport {
            all,
            segments: segments.iter().map(|s| (s.base(), s.size())).collect(),
            rows,
            total_records: records.len(),
            used: self.low_mark,
            total: segments.total_size(),
        })
    }
}

/// One line of a [`HunkReport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HunkRow {
    /// Offset of the first record in the row.
    pub offset: usize,
    /// Number of records totaled.
    pub count: usize,
    /// Total bytes including headers.
    pub size: usize,
    /// Record name.
    pub name: String,
}

/// Diagnostic dump of the hunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HunkReport {
    /// Whether every record is listed individually.
    pub all: bool,
    /// `(base, size)` of every segment.
    pub segments: Vec<(usize, usize)>,
    /// Listed rows.
    pub rows: Vec<HunkRow>,
    /// Number of live records.
    pub total_records: usize,
    /// Current low mark.
    pub used: usize,
    /// End of the address space.
    pub total: usize,
}

impl HunkReport {
    /// Bytes above the low mark.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.total - self.used
    }
}

impl fmt::Display for HunkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const RULE: &str = "---------------------------------";

        if self.segments.len() > 1 {
            writeln!(f, "             Segments")?;
            writeln!(f, "{RULE}")?;
            writeln!(f, "id :     offset :       size")?;
            writeln!(f, "{RULE}")?;
            for (id, (base, size)) in self.segments.iter().enumerate() {
                writeln!(f, "{id:2} : {base:10} : {size:10}")?;
            }
            writeln!(f, "{RULE}")?;
            writeln!(f)?;
            writeln!(f, "           Allocations")?;
            writeln!(f, "{RULE}")?;
        }

        if self.all {
            writeln!(f, "    offset :       size : name")?;
        } else {
            writeln!(f, "allocs :       size : name")?;
        }
        writeln!(f, "{RULE}")?;
        for row in &self.rows {
            if self.all {
                writeln!(f, "{:10} : {:10} : {}", row.offset, row.size, row.name)?;
            } else {
                writeln!(f, "{:6} : {:10} : {}", row.count, row.size, row.name)?;
            }
        }
        writeln!(f, "{RULE}")?;

        let plural = if self.total_records == 1 { "" } else { "s" };
        if self.all {
            writeln!(f, "{:10}   {:10}   USED ({} alloc{plural})", "", self.used, self.total_records)?;
            writeln!(f, "{:10}   {:10}   REMAINING", "", self.remaining())?;
            writeln!(f, "{:10}   {:10}   TOTAL", "", self.total)
        } else {
            writeln!(f, "{:6} : {:10} : USED", self.total_records, self.used)?;
            writeln!(f, "{:6} : {:10} : REMAINING", "", self.remaining())?;
            writeln!(f, "{:6} : {:10} : TOTAL", "", self.total)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(size: usize) -> (SegmentDirectory, Cache, Hunk) {
        (SegmentDirectory::new(size, 4).unwrap(), Cache::new(), Hunk::new())
    }

    #[test]
    fn test_header_is_sixteen_byte_multiple() {
        assert_eq!(HUNK_HEADER_SIZE, 32);
    }

    #[test]
    fn test_zero_size_is_noop() {
        let (mut segs, mut cache, mut hunk) = setup(1024);
        let addr = hunk.allocate(&mut segs, &mut cache, 0, Some("none"), HunkFill::Zeroed).unwrap();
        assert!(addr.is_none());
        assert_eq!(hunk.low_mark().offset(), 0);
    }

    #[test]
    fn test_allocation_rounds_and_advances() {
        let (mut segs, mut cache, mut hunk) = setup(1024);
        let a = hunk.allocate(&mut segs, &mut cache, 10, Some("a"), HunkFill::Zeroed).unwrap().unwrap();
        assert_eq!(a.offset(), HUNK_HEADER_SIZE);
        assert_eq!(hunk.low_mark().offset(), HUNK_HEADER_SIZE + 16);

        let b = hunk.allocate(&mut segs, &mut cache, 16, Some("b"), HunkFill::Zeroed).unwrap().unwrap();
        assert_eq!(b.offset(), 2 * HUNK_HEADER_SIZE + 16);
        assert_eq!(segs.last().used(), hunk.low_mark().offset());
    }

    #[test]
    fn test_reset_reuses_bytes() {
        let (mut segs, mut cache, mut hunk) = setup(1024);
        hunk.allocate(&mut segs, &mut cache, 64, Some("keep"), HunkFill::Zeroed).unwrap();
        let mark = hunk.low_mark();
        let first = hunk.allocate(&mut segs, &mut cache, 100, Some("temp"), HunkFill::Zeroed).unwrap();
        hunk.reset_to(&mut segs, mark).unwrap();
        assert_eq!(hunk.low_mark(), mark);
        let second = hunk.allocate(&mut segs, &mut cache, 100, Some("temp"), HunkFill::Zeroed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reset_cannot_roll_forward() {
        let (mut segs, mut cache, mut hunk) = setup(1024);
        hunk.allocate(&mut segs, &mut cache, 64, None, HunkFill::Zeroed).unwrap();
        let high = hunk.low_mark();
        hunk.reset_to(&mut segs, HunkMark(0)).unwrap();
        assert_eq!(
            hunk.reset_to(&mut segs, high),
            Err(MemoryError::BadMark { mark: high.offset(), low_mark: 0 })
        );
    }

    #[test]
    fn test_undersized_segment_tail_is_skipped() {
        let (mut segs, mut cache, mut hunk) = setup(256);
        hunk.allocate(&mut segs, &mut cache, 160, Some("first"), HunkFill::Zeroed).unwrap();
        let addr = hunk.allocate(&mut segs, &mut cache, 100, Some("second"), HunkFill::Zeroed).unwrap().unwrap();
        assert_eq!(segs.len(), 2);
        assert_eq!(addr.offset(), 256 + HUNK_HEADER_SIZE);
        assert!(hunk.check(&segs).is_ok());
    }

    #[test]
    fn test_check_detects_trashed_sentinel() {
        let (mut segs, mut cache, mut hunk) = setup(1024);
        let addr = hunk.allocate(&mut segs, &mut cache, 32, Some("victim"), HunkFill::Zeroed).unwrap().unwrap();
        segs.bytes_mut(Addr::new(addr.offset() - HUNK_HEADER_SIZE), 4).unwrap().fill(0xAA);
        assert_eq!(hunk.check(&segs), Err(MemoryError::HunkSentinel { offset: 0 }));
    }

    #[test]
    fn test_check_detects_bad_size() {
        let (mut segs, mut cache, mut hunk) = setup(1024);
        let addr = hunk.allocate(&mut segs, &mut cache, 32, Some("victim"), HunkFill::Zeroed).unwrap().unwrap();
        hunk.allocate(&mut segs, &mut cache, 32, Some("after"), HunkFill::Zeroed).unwrap();
        let size_field = Addr::new(addr.offset() - HUNK_HEADER_SIZE + 4);
        segs.bytes_mut(size_field, 4).unwrap().copy_from_slice(&1000u32.to_le_bytes());
        assert_eq!(hunk.check(&segs), Err(MemoryError::HunkBadSize { offset: 0, size: 1000 }));

        segs.bytes_mut(size_field, 4).unwrap().copy_from_slice(&8u32.to_le_bytes());
        assert_eq!(hunk.check(&segs), Err(MemoryError::HunkBadSize { offset: 0, size: 8 }));
    }

    #[test]
    fn test_failed_growth_keeps_low_mark() {
        let mut segs = SegmentDirectory::new(1024, 1).unwrap();
        let (mut cache, mut hunk) = (Cache::new(), Hunk::new());
        hunk.allocate(&mut segs, &mut cache, 100, Some("first"), HunkFill::Zeroed).unwrap();
        let before = hunk.low_mark();

        assert_eq!(
            hunk.allocate(&mut segs, &mut cache, 2000, Some("huge"), HunkFill::Zeroed),
            Err(MemoryError::SegmentOverflow { max: 1 })
        );
        assert_eq!(hunk.low_mark(), before);
        assert_eq!(segs.get(0).unwrap().used(), before.0);

        let addr = hunk.allocate(&mut segs, &mut cache, 100, Some("second"), HunkFill::Zeroed).unwrap().unwrap();
        assert_eq!(addr.offset(), before.0 + HUNK_HEADER_SIZE);
        assert!(hunk.check(&segs).is_ok());
    }

    #[test]
    fn test_report_aggregates_same_names() {
        let (mut segs, mut cache, mut hunk) = setup(4096);
        for _ in 0..3 {
            hunk.allocate(&mut segs, &mut cache, 16, Some("model"), HunkFill::Zeroed).unwrap();
        }
        hunk.allocate(&mut segs, &mut cache, 16, None, HunkFill::Uninit).unwrap();

        let totals = hunk.report(&segs, false).unwrap();
        assert_eq!(totals.rows.len(), 2);
        assert_eq!(totals.rows[0].count, 3);
        assert_eq!(totals.rows[0].size, 3 * 48);
        assert_eq!(totals.rows[1].name, "unknown");

        let all = hunk.report(&segs, true).unwrap();
        assert_eq!(all.rows.len(), 4);
        assert!(all.to_string().contains("USED (4 allocs)"));
    }

    #[test]
    fn test_names_truncate_on_char_boundary() {
        let name: [u8; HUNK_NAME_LEN] = encode_name("ééééééééééééééééééé");
        let decoded = decode_name(&name);
        assert!(decoded.len() < HUNK_NAME_LEN);
        assert!(decoded.chars().all(|c| c == 'é'));
    }
}
