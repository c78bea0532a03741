//! # Memory System
//!
//! The explicit context object owning every tier. Constructed once at
//! startup and passed to every caller; there is no global allocator state.
//!
//! ```text
//! segment 0                                        segment N (last)
//! +------+-----------------------------+    +---------------+-------------+
//! | zone | hunk records ...            | .. | hunk records  | cache       |
//! +------+-----------------------------+    +---------------+-------------+
//! ```
//!
//! The zone is the first hunk record and is never released. Resetting the
//! hunk below it is refused.

use crate::cache::{Cache, CacheEntryInfo, CacheReport, CacheUser, EvictionHook};
use crate::config::MemoryConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::hunk::{align16, Hunk, HunkFill, HunkMark, HunkRecord, HunkReport};
use crate::segment::{Addr, SegmentDirectory};
use crate::zone::{Zone, ZoneReport};

/// Hunk, zone and cache sharing one segmented address space.
#[derive(Debug)]
pub struct Memory {
    config: MemoryConfig,
    segments: SegmentDirectory,
    hunk: Hunk,
    zone: Zone,
    cache: Cache,
    /// Lowest mark the hunk may be reset to.
    floor: HunkMark,
}

impl Memory {
    /// Allocates the first segment and carves the zone out of it.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] for an unusable configuration, or
    /// [`MemoryError::BackingAllocation`] if the backing buffer is unavailable.
    pub fn new(config: MemoryConfig) -> MemoryResult<Self> {
        config.validate()?;

        let mut segments = SegmentDirectory::new(config.heap_size, config.max_segments)?;
        let mut hunk = Hunk::new();
        let mut cache = Cache::new();

        let zone_size = align16(config.zone_size).ok_or(MemoryError::InvalidSize {
            op: "zone init",
            size: config.zone_size,
        })?;
        let base = hunk
            .allocate(&mut segments, &mut cache, zone_size, Some("zone"), HunkFill::Uninit)?
            .ok_or(MemoryError::InvalidSize { op: "zone init", size: zone_size })?;
        let zone = Zone::new(base, segments.bytes_mut(base, zone_size)?)?;
        let floor = hunk.low_mark();

        tracing::info!(
            heap_mib = config.heap_size as f64 / (1024.0 * 1024.0),
            zone_kib = zone_size / 1024,
            max_segments = config.max_segments,
            "memory initialized"
        );

        Ok(Self {
            config,
            segments,
            hunk,
            zone,
            cache,
            floor,
        })
    }

    /// Returns the configuration this system was built from.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Returns the segment directory.
    #[inline]
    #[must_use]
    pub const fn segments(&self) -> &SegmentDirectory {
        &self.segments
    }

    fn paranoid_check(&self) -> MemoryResult<()> {
        if self.config.paranoid {
            self.hunk.check(&self.segments)?;
            self.zone_check()?;
        }
        Ok(())
    }

    // =========================================================================
    // Hunk
    // =========================================================================

    /// Allocates a zero-filled hunk record. A size of zero returns `None`.
    ///
    /// # Errors
    ///
    /// Fails if the size cannot be encoded or the segment limit is reached.
    pub fn hunk_alloc(&mut self, size: usize, name: Option<&str>) -> MemoryResult<Option<Addr>> {
        self.paranoid_check()?;
        self.hunk
            .allocate(&mut self.segments, &mut self.cache, size, name, HunkFill::Zeroed)
    }

    /// Allocates a hunk record without clearing it.
    ///
    /// # Errors
    ///
    /// Fails if the size cannot be encoded or the segment limit is reached.
    pub fn hunk_alloc_no_fill(&mut self, size: usize, name: Option<&str>) -> MemoryResult<Option<Addr>> {
        self.paranoid_check()?;
        self.hunk
            .allocate(&mut self.segments, &mut self.cache, size, name, HunkFill::Uninit)
    }

    /// Copies `text` plus a terminator into the hunk.
    ///
    /// # Errors
    ///
    /// Fails if the segment limit is reached.
    pub fn hunk_strdup(&mut self, text: &str, name: Option<&str>) -> MemoryResult<Addr> {
        let len = text.len() + 1;
        let addr = self
            .hunk_alloc_no_fill(len, name)?
            .ok_or(MemoryError::InvalidSize { op: "hunk strdup", size: len })?;
        let bytes = self.segments.bytes_mut(addr, len)?;
        bytes[..text.len()].copy_from_slice(text.as_bytes());
        bytes[text.len()] = 0;
        Ok(addr)
    }

    /// Returns the current low mark as a restore point.
    #[inline]
    #[must_use]
    pub const fn hunk_low_mark(&self) -> HunkMark {
        self.hunk.low_mark()
    }

    /// Discards every hunk record allocated after `mark` was taken.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::BadMark`] if `mark` is above the low mark or
    /// below the zone.
    pub fn hunk_reset_to(&mut self, mark: HunkMark) -> MemoryResult<()> {
        if mark < self.floor {
            return Err(MemoryError::BadMark {
                mark: mark.offset(),
                low_mark: self.hunk.low_mark().offset(),
            });
        }
        self.hunk.reset_to(&mut self.segments, mark)
    }

    /// Lists every live hunk record.
    ///
    /// # Errors
    ///
    /// Fails on a trashed sentinel or a bad record size.
    pub fn hunk_records(&self) -> MemoryResult<Vec<HunkRecord>> {
        self.hunk.records(&self.segments)
    }

    /// Verifies every hunk sentinel and record size.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::HunkSentinel`] or [`MemoryError::HunkBadSize`].
    pub fn hunk_check(&self) -> MemoryResult<()> {
        self.hunk.check(&self.segments)
    }

    /// Builds the hunk dump, optionally listing every record.
    ///
    /// # Errors
    ///
    /// Fails on hunk corruption.
    pub fn hunk_report(&self, all: bool) -> MemoryResult<HunkReport> {
        self.hunk.report(&self.segments, all)
    }

    // =========================================================================
    // Zone
    // =========================================================================

    fn zone_region(&self) -> MemoryResult<&[u8]> {
        self.segments.bytes(self.zone.base(), self.zone.size())
    }

    /// Allocates `size` zero-filled bytes from the zone.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidSize`] for zero and
    /// [`MemoryError::ZoneExhausted`] when nothing fits.
    pub fn zone_alloc(&mut self, size: usize) -> MemoryResult<Addr> {
        self.paranoid_check()?;
        let region = self.segments.bytes_mut(self.zone.base(), self.zone.size())?;
        self.zone.allocate_zeroed(region, size)
    }

    /// Allocates from the zone without clearing the payload.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidSize`] for zero and
    /// [`MemoryError::ZoneExhausted`] when nothing fits.
    pub fn zone_alloc_uninit(&mut self, size: usize) -> MemoryResult<Addr> {
        self.paranoid_check()?;
        let region = self.segments.bytes_mut(self.zone.base(), self.zone.size())?;
        self.zone
            .allocate_raw(region, size)?
            .ok_or(MemoryError::ZoneExhausted { size })
    }

    /// Releases a zone block. `None` is rejected.
    ///
    /// # Errors
    ///
    /// Fails on a null or foreign pointer, a double free, or a trashed canary.
    pub fn zone_free(&mut self, addr: Option<Addr>) -> MemoryResult<()> {
        let addr = addr.ok_or(MemoryError::BadPointer)?;
        let region = self.segments.bytes_mut(self.zone.base(), self.zone.size())?;
        self.zone.free(region, addr)
    }

    /// Resizes a zone block, keeping its contents. `None` allocates.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ZoneExhausted`] with the old block intact if
    /// nothing fits.
    pub fn zone_realloc(&mut self, addr: Option<Addr>, size: usize) -> MemoryResult<Addr> {
        self.paranoid_check()?;
        let region = self.segments.bytes_mut(self.zone.base(), self.zone.size())?;
        self.zone.reallocate(region, addr, size)
    }

    /// Copies `text` plus a terminator into the zone.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ZoneExhausted`] when nothing fits.
    pub fn zone_strdup(&mut self, text: &str) -> MemoryResult<Addr> {
        self.paranoid_check()?;
        let region = self.segments.bytes_mut(self.zone.base(), self.zone.size())?;
        self.zone.duplicate_string(region, text)
    }

    /// Reads back a string stored with [`Memory::zone_strdup`].
    ///
    /// # Errors
    ///
    /// Fails if `addr` is not a live zone block.
    pub fn zone_cstr(&self, addr: Addr) -> MemoryResult<&[u8]> {
        self.zone.cstr(self.zone_region()?, addr)
    }

    /// Usable payload bytes of a zone block.
    ///
    /// # Errors
    ///
    /// Fails if `addr` is not a live zone block.
    pub fn zone_capacity(&self, addr: Addr) -> MemoryResult<usize> {
        self.zone.capacity(self.zone_region()?, addr)
    }

    /// Verifies zone tiling, back links and canaries.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ZoneLinkage`] or [`MemoryError::ZoneCanary`].
    pub fn zone_check(&self) -> MemoryResult<()> {
        self.zone.check(self.zone_region()?)
    }

    /// Builds the zone dump.
    ///
    /// # Errors
    ///
    /// Fails only if a link points outside the zone.
    pub fn zone_report(&self) -> MemoryResult<ZoneReport> {
        self.zone.report(self.zone_region()?)
    }

    // =========================================================================
    // Cache
    // =========================================================================

    /// Installs or removes the callback run when an owner is notified of an
    /// eviction.
    pub fn set_eviction_hook(&mut self, hook: Option<EvictionHook>) {
        self.cache.set_eviction_hook(hook);
    }

    /// Allocates cached data for `user`, evicting older entries as needed.
    ///
    /// # Errors
    ///
    /// Fails if `user` already holds data, on zero size, or when even an
    /// empty cache cannot hold the request.
    pub fn cache_alloc(&mut self, user: &CacheUser, size: usize, name: &str) -> MemoryResult<Addr> {
        let low_mark = self.hunk.low_mark().offset();
        self.cache.allocate(&mut self.segments, low_mark, user, size, name)
    }

    /// Returns the cached data, marking it most recently used.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CacheCorrupt`] if the entry header is damaged.
    pub fn cache_check(&mut self, user: &CacheUser) -> MemoryResult<Option<Addr>> {
        self.cache.touch(&self.segments, user)
    }

    /// Frees the data held by `user`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CacheNotAllocated`] if `user` holds nothing.
    pub fn cache_free(&mut self, user: &CacheUser, notify_owner: bool) -> MemoryResult<()> {
        self.cache.free(&self.segments, user, notify_owner)
    }

    /// Evicts every cache entry.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CacheCorrupt`] if an entry header is damaged.
    pub fn cache_flush(&mut self) -> MemoryResult<()> {
        self.cache.flush_all(&self.segments)
    }

    /// Lists cache entries in address order.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CacheCorrupt`] if an entry header is damaged.
    pub fn cache_entries(&self) -> MemoryResult<Vec<CacheEntryInfo>> {
        self.cache.entries(&self.segments)
    }

    /// Payload addresses from most to least recently used.
    #[must_use]
    pub fn cache_lru(&self) -> Vec<Addr> {
        self.cache.lru_order()
    }

    /// Summarizes cache usage.
    #[must_use]
    pub fn cache_report(&self) -> CacheReport {
        self.cache
            .report(&self.segments, self.hunk.low_mark().offset())
    }

    // =========================================================================
    // Raw access
    // =========================================================================

    /// Borrows `len` bytes at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::BadOffset`] if the range leaves its segment.
    pub fn bytes(&self, addr: Addr, len: usize) -> MemoryResult<&[u8]> {
        self.segments.bytes(addr, len)
    }

    /// Mutably borrows `len` bytes at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::BadOffset`] if the range leaves its segment.
    pub fn bytes_mut(&mut self, addr: Addr, len: usize) -> MemoryResult<&mut [u8]> {
        self.segments.bytes_mut(addr, len)
    }

    /// Maps a pointer into a segment buffer back to its address.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::BadPointer`] if `ptr` is outside every segment.
    pub fn addr_of(&self, ptr: *const u8) -> MemoryResult<Addr> {
        self.segments.addr_of(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Memory {
        Memory::new(MemoryConfig::with_heap_size(64 * 1024).with_zone_kib(4)).unwrap()
    }

    #[test]
    fn test_zone_is_first_hunk_record() {
        let memory = small();
        let records = memory.hunk_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "zone");
        assert!(memory.zone_check().is_ok());
    }

    #[test]
    fn test_reset_below_zone_is_refused() {
        let small_mark = small().hunk_low_mark();
        let mut memory = Memory::new(MemoryConfig::with_heap_size(64 * 1024).with_zone_kib(8)).unwrap();
        let err = memory.hunk_reset_to(small_mark).unwrap_err();
        assert!(matches!(err, MemoryError::BadMark { .. }));
    }

    #[test]
    fn test_hunk_strdup_round_trip() {
        let mut memory = small();
        let addr = memory.hunk_strdup("maps/e1m1.bsp", Some("mapname")).unwrap();
        assert_eq!(memory.bytes(addr, 14).unwrap(), b"maps/e1m1.bsp\0");
    }

    #[test]
    fn test_zone_free_rejects_null() {
        let mut memory = small();
        assert_eq!(memory.zone_free(None), Err(MemoryError::BadPointer));
    }

    #[test]
    fn test_paranoid_mode_catches_trashed_hunk() {
        let mut config = MemoryConfig::with_heap_size(64 * 1024).with_zone_kib(4);
        config.paranoid = true;
        let mut memory = Memory::new(config).unwrap();

        let victim = memory.hunk_alloc(16, Some("victim")).unwrap().unwrap();
        let header = Addr::new(victim.offset() - crate::hunk::HUNK_HEADER_SIZE);
        memory.bytes_mut(header, 4).unwrap().fill(0xAA);

        assert!(matches!(
            memory.zone_alloc(8),
            Err(MemoryError::HunkSentinel { .. })
        ));
        assert!(matches!(
            memory.zone_strdup("maps/e1m1.bsp"),
            Err(MemoryError::HunkSentinel { .. })
        ));
    }

    #[test]
    fn test_addr_of_round_trip() {
        let mut memory = small();
        let addr = memory.hunk_alloc(64, None).unwrap().unwrap();
        let ptr = memory.bytes(addr, 1).unwrap().as_ptr();
        assert_eq!(memory.addr_of(ptr).unwrap(), addr);
    }
}
