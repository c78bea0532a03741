//! # Cache Manager
//!
//! LRU-evicting allocator for reloadable assets. Entries are packed into the
//! free tail of the last segment, between the hunk low mark and the segment
//! end:
//!
//! ```text
//! last segment
//! +-----------------+------+-------+------+---------+------+
//! | hunk records    | gap  | entry | gap  | entry   | free |
//! +-----------------+------+-------+------+---------+------+
//!                   ^ low mark
//! ```
//!
//! Each entry starts with an in-buffer [`CacheHeader`]. Bookkeeping lives in a
//! slot table: every slot carries two independent index links, one for
//! address order (gap search) and one for LRU order (eviction). Slot 0 is the
//! head of both circular lists.

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};

use bytemuck::{Pod, Zeroable};

use crate::error::{MemoryError, MemoryResult};
use crate::hunk::{align16, decode_name, encode_name};
use crate::segment::{Addr, SegmentDirectory};

/// Magic value at the start of every cache entry.
pub const CACHE_SENTINEL: u32 = 0xCAC4_E5E7;

/// Bytes reserved for an entry name, including the terminator.
pub const CACHE_NAME_LEN: usize = 32;

/// Size of the header preceding every cache payload.
pub const CACHE_HEADER_SIZE: usize = std::mem::size_of::<CacheHeader>();

/// Slot index of the list head.
const HEAD: usize = 0;

/// Header stored in front of every cache payload.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct CacheHeader {
    sentinel: u32,
    size: u32,
    slot: u32,
    _pad: u32,
    name: [u8; CACHE_NAME_LEN],
}

/// Caller-owned handle to cached data.
///
/// The handle exposes one value: the payload address, or `None` once the
/// entry has been evicted. The cache only keeps a weak back-reference.
#[derive(Debug, Default)]
pub struct CacheUser {
    data: Rc<Cell<Option<Addr>>>,
}

impl CacheUser {
    /// Creates an unallocated handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the payload address, or `None` if nothing is cached.
    #[inline]
    #[must_use]
    pub fn data(&self) -> Option<Addr> {
        self.data.get()
    }

    fn downgrade(&self) -> Weak<Cell<Option<Addr>>> {
        Rc::downgrade(&self.data)
    }
}

/// Notification passed to the eviction hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictedEntry {
    /// Diagnostic name of the entry.
    pub name: String,
    /// Entry size including header.
    pub size: usize,
}

/// Callback invoked when an entry is freed with owner notification.
pub type EvictionHook = Box<dyn FnMut(&EvictedEntry)>;

/// One entry as listed by [`Cache::entries`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntryInfo {
    /// Payload address.
    pub addr: Addr,
    /// Entry size including header.
    pub size: usize,
    /// Diagnostic name.
    pub name: String,
}

/// Cache usage summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheReport {
    /// Bytes above the hunk low mark.
    pub free_bytes: usize,
    /// Number of live entries.
    pub entries: usize,
    /// Bytes held by live entries.
    pub cached_bytes: usize,
}

impl fmt::Display for CacheReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:4.1} megabyte data cache ({} entries, {} bytes cached)",
            self.free_bytes as f64 / (1024.0 * 1024.0),
            self.entries,
            self.cached_bytes
        )
    }
}

#[derive(Clone, Copy, Debug)]
enum List {
    Order,
    Lru,
}

#[derive(Clone, Copy, Debug, Default)]
struct Links {
    prev: usize,
    next: usize,
}

#[derive(Debug, Default)]
struct Node {
    order: Links,
    lru: Links,
    /// Logical offset of the entry header.
    addr: usize,
    /// Header plus payload, 16-byte aligned.
    size: usize,
    owner: Weak<Cell<Option<Addr>>>,
    live: bool,
}

impl Node {
    #[inline]
    const fn links(&self, list: List) -> Links {
        match list {
            List::Order => self.order,
            List::Lru => self.lru,
        }
    }

    #[inline]
    fn links_mut(&mut self, list: List) -> &mut Links {
        match list {
            List::Order => &mut self.order,
            List::Lru => &mut self.lru,
        }
    }
}

/// LRU cache state.
pub struct Cache {
    nodes: Vec<Node>,
    free_slots: Vec<usize>,
    eviction_hook: Option<EvictionHook>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("entries", &self.len())
            .field("slots", &self.nodes.len())
            .field("eviction_hook", &self.eviction_hook.is_some())
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        let head = Node {
            order: Links { prev: HEAD, next: HEAD },
            lru: Links { prev: HEAD, next: HEAD },
            ..Node::default()
        };
        Self {
            nodes: vec![head],
            free_slots: Vec::new(),
            eviction_hook: None,
        }
    }

    /// Installs the callback run when an owner is notified of eviction.
    pub fn set_eviction_hook(&mut self, hook: Option<EvictionHook>) {
        self.eviction_hook = hook;
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len() - 1 - self.free_slots.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes[HEAD].order.next == HEAD
    }

    fn link_before(&mut self, list: List, slot: usize, before: usize) {
        let prev = self.nodes[before].links(list).prev;
        *self.nodes[slot].links_mut(list) = Links { prev, next: before };
        self.nodes[prev].links_mut(list).next = slot;
        self.nodes[before].links_mut(list).prev = slot;
    }

    fn unlink(&mut self, list: List, slot: usize) {
        let Links { prev, next } = self.nodes[slot].links(list);
        self.nodes[prev].links_mut(list).next = next;
        self.nodes[next].links_mut(list).prev = prev;
        *self.nodes[slot].links_mut(list) = Links::default();
    }

    fn make_most_recent(&mut self, slot: usize) {
        let first = self.nodes[HEAD].lru.next;
        self.link_before(List::Lru, slot, first);
    }

    /// Claims a slot for an entry at `addr` and splices it before `before`.
    fn place(&mut self, addr: usize, size: usize, before: usize) -> usize {
        let node = Node {
            addr,
            size,
            live: true,
            ..Node::default()
        };
        let slot = if let Some(slot) = self.free_slots.pop() {
            self.nodes[slot] = node;
            slot
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        };
        self.link_before(List::Order, slot, before);
        self.make_most_recent(slot);
        slot
    }

    /// Looks for a free range of `size` bytes above the hunk.
    ///
    /// `size` already includes the header and padding. With `forbid_bottom`
    /// the gap directly above the low mark is left for the hunk to grow into.
    /// Returns `None` if nothing fits.
    pub(crate) fn try_allocate(
        &mut self,
        segments: &SegmentDirectory,
        low_mark: usize,
        size: usize,
        forbid_bottom: bool,
    ) -> MemoryResult<Option<usize>> {
        let last = segments.last();
        let (seg_base, seg_end) = (last.base(), last.end());
        let gap_start = low_mark.max(seg_base);
        let first = self.nodes[HEAD].order.next;

        if first == HEAD {
            if forbid_bottom {
                return Ok(None);
            }
            if gap_start + size > seg_end {
                return Err(MemoryError::CacheExceedsSegment { size });
            }
            return Ok(Some(self.place(gap_start, size, HEAD)));
        }

        // Search from the bottom up for space.
        let mut candidate = gap_start;
        let mut cur = first;
        while cur != HEAD {
            let node = &self.nodes[cur];
            if (!forbid_bottom || cur != first)
                && node.addr >= candidate
                && node.addr - candidate >= size
            {
                return Ok(Some(self.place(candidate, size, cur)));
            }
            candidate = (node.addr + node.size).max(gap_start);
            cur = node.order.next;
        }

        if candidate + size <= seg_end {
            return Ok(Some(self.place(candidate, size, HEAD)));
        }

        Ok(None)
    }

    fn write_header(&self, segments: &mut SegmentDirectory, slot: usize, name: [u8; CACHE_NAME_LEN]) -> MemoryResult<()> {
        let node = &self.nodes[slot];
        let header = CacheHeader {
            sentinel: CACHE_SENTINEL,
            size: node.size as u32,
            slot: slot as u32,
            _pad: 0,
            name,
        };
        segments.write_pod(Addr::new(node.addr), &header)
    }

    fn read_name(&self, segments: &SegmentDirectory, slot: usize) -> MemoryResult<[u8; CACHE_NAME_LEN]> {
        let header: CacheHeader = segments.read_pod(Addr::new(self.nodes[slot].addr))?;
        Ok(header.name)
    }

    /// Maps a payload address back to its slot, validating the header.
    fn slot_for(&self, segments: &SegmentDirectory, addr: Addr) -> MemoryResult<usize> {
        let corrupt = MemoryError::CacheCorrupt { addr: addr.offset() };
        let header_addr = addr
            .offset()
            .checked_sub(CACHE_HEADER_SIZE)
            .ok_or_else(|| corrupt.clone())?;
        let header: CacheHeader = segments
            .read_pod(Addr::new(header_addr))
            .map_err(|_| corrupt.clone())?;
        let slot = header.slot as usize;

        match self.nodes.get(slot) {
            Some(node)
                if header.sentinel == CACHE_SENTINEL
                    && slot != HEAD
                    && node.live
                    && node.addr == header_addr =>
            {
                Ok(slot)
            }
            _ => Err(corrupt),
        }
    }

    /// Allocates `size` bytes for `user`, evicting least-recently-used
    /// entries until it fits.
    pub(crate) fn allocate(
        &mut self,
        segments: &mut SegmentDirectory,
        low_mark: usize,
        user: &CacheUser,
        size: usize,
        name: &str,
    ) -> MemoryResult<Addr> {
        if user.data().is_some() {
            return Err(MemoryError::CacheAlreadyAllocated { name: name.to_owned() });
        }
        if size == 0 {
            return Err(MemoryError::InvalidSize { op: "cache alloc", size });
        }

        let total = size
            .checked_add(CACHE_HEADER_SIZE)
            .and_then(align16)
            .filter(|s| u32::try_from(*s).is_ok())
            .ok_or(MemoryError::InvalidSize { op: "cache alloc", size })?;

        loop {
            if let Some(slot) = self.try_allocate(segments, low_mark, total, false)? {
                self.write_header(segments, slot, encode_name(name))?;
                self.nodes[slot].owner = user.downgrade();
                user.data.set(Some(Addr::new(self.nodes[slot].addr + CACHE_HEADER_SIZE)));
                break;
            }

            // Free the least recently used entry.
            let victim = self.nodes[HEAD].lru.prev;
            if victim == HEAD {
                return Err(MemoryError::CacheOutOfMemory {
                    name: name.to_owned(),
                    size,
                });
            }
            self.release(segments, victim, true)?;
        }

        self.touch(segments, user)?
            .ok_or(MemoryError::CacheNotAllocated)
    }

    /// Returns the cached data and moves it to the head of the LRU list.
    pub(crate) fn touch(&mut self, segments: &SegmentDirectory, user: &CacheUser) -> MemoryResult<Option<Addr>> {
        let Some(addr) = user.data() else {
            return Ok(None);
        };
        let slot = self.slot_for(segments, addr)?;
        self.unlink(List::Lru, slot);
        self.make_most_recent(slot);
        Ok(Some(addr))
    }

    /// Frees the entry owned by `user`.
    pub(crate) fn free(&mut self, segments: &SegmentDirectory, user: &CacheUser, notify_owner: bool) -> MemoryResult<()> {
        let addr = user.data().ok_or(MemoryError::CacheNotAllocated)?;
        let slot = self.slot_for(segments, addr)?;
        self.release(segments, slot, notify_owner)
    }

    /// Unlinks a slot from both lists and clears its owner.
    fn release(&mut self, segments: &SegmentDirectory, slot: usize, notify_owner: bool) -> MemoryResult<()> {
        let notice = if notify_owner {
            Some(EvictedEntry {
                name: decode_name(&self.read_name(segments, slot)?),
                size: self.nodes[slot].size,
            })
        } else {
            None
        };

        self.unlink(List::Order, slot);
        self.unlink(List::Lru, slot);
        let node = std::mem::take(&mut self.nodes[slot]);
        if let Some(owner) = node.owner.upgrade() {
            owner.set(None);
        }
        self.free_slots.push(slot);

        if let Some(notice) = notice {
            tracing::debug!(name = %notice.name, size = notice.size, "cache evict");
            if let Some(hook) = self.eviction_hook.as_mut() {
                hook(&notice);
            }
        }
        Ok(())
    }

    /// Moves an entry out of the way of the hunk, evicting it if nothing fits.
    fn relocate(&mut self, segments: &mut SegmentDirectory, low_mark: usize, slot: usize) -> MemoryResult<()> {
        let size = self.nodes[slot].size;

        // Clearing space at the bottom, so only take space above it.
        let Some(new_slot) = self.try_allocate(segments, low_mark, size, true)? else {
            return self.release(segments, slot, true);
        };

        let old = self.nodes[slot].addr;
        let new = self.nodes[new_slot].addr;
        segments.copy_within(
            Addr::new(old + CACHE_HEADER_SIZE),
            Addr::new(new + CACHE_HEADER_SIZE),
            size - CACHE_HEADER_SIZE,
        )?;
        let name = self.read_name(segments, slot)?;
        self.write_header(segments, new_slot, name)?;

        let owner = std::mem::take(&mut self.nodes[slot].owner);
        self.release(segments, slot, false)?;
        if let Some(cell) = owner.upgrade() {
            cell.set(Some(Addr::new(new + CACHE_HEADER_SIZE)));
        }
        self.nodes[new_slot].owner = owner;

        tracing::debug!(from = old, to = new, size, "cache move");
        Ok(())
    }

    /// Throws entries out until the hunk can be expanded to `target`.
    pub(crate) fn reclaim_below(&mut self, segments: &mut SegmentDirectory, target: usize) -> MemoryResult<()> {
        // Can only allocate space in the last segment.
        let target = target.max(segments.last().base());

        loop {
            let first = self.nodes[HEAD].order.next;
            if first == HEAD || self.nodes[first].addr >= target {
                return Ok(());
            }
            self.relocate(segments, target, first)?;
        }
    }

    /// Evicts every entry, notifying owners.
    pub(crate) fn flush_all(&mut self, segments: &SegmentDirectory) -> MemoryResult<()> {
        let count = self.len();
        while self.nodes[HEAD].order.next != HEAD {
            let first = self.nodes[HEAD].order.next;
            self.release(segments, first, true)?;
        }
        if count > 0 {
            tracing::debug!(count, "cache flush");
        }
        Ok(())
    }

    /// Lists entries in address order.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CacheCorrupt`] when an entry header is damaged.
    pub fn entries(&self, segments: &SegmentDirectory) -> MemoryResult<Vec<CacheEntryInfo>> {
        self.iter(List::Order)
            .map(|slot| {
                let node = &self.nodes[slot];
                Ok(CacheEntryInfo {
                    addr: Addr::new(node.addr + CACHE_HEADER_SIZE),
                    size: node.size,
                    name: decode_name(&self.read_name(segments, slot)?),
                })
            })
            .collect()
    }

    /// Payload addresses from most to least recently used.
    #[must_use]
    pub fn lru_order(&self) -> Vec<Addr> {
        self.iter(List::Lru)
            .map(|slot| Addr::new(self.nodes[slot].addr + CACHE_HEADER_SIZE))
            .collect()
    }

    /// Summarizes usage for a hunk at `low_mark`.
    #[must_use]
    pub fn report(&self, segments: &SegmentDirectory, low_mark: usize) -> CacheReport {
        let report = CacheReport {
            free_bytes: segments.total_size() - low_mark,
            entries: self.len(),
            cached_bytes: self.iter(List::Order).map(|slot| self.nodes[slot].size).sum(),
        };
        tracing::debug!("{report}");
        report
    }

    fn iter(&self, list: List) -> impl Iterator<Item = usize> + '_ {
        let mut cur = self.nodes[HEAD].links(list).next;
        std::iter::from_fn(move || {
            if cur == HEAD {
                return None;
            }
            let slot = cur;
            cur = self.nodes[slot].links(list).next;
            Some(slot)
        })
    }
}
