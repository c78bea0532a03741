//! # Zone Allocator
//!
//! Free-list allocator for small, individually freed objects such as
//! transient strings. The zone lives inside one permanent hunk record.
//!
//! The zone is always exactly tiled by blocks, in address order, with a
//! virtual end-cap closing the circular list. There is never any space
//! between blocks and never two adjacent free blocks.
//!
//! ```text
//!   end-cap <-> [used|hdr..payload..canary] <-> [free] <-> [used] <-> end-cap
//! ```
//!
//! The rover caches where the next search starts, so repeated allocation is
//! amortized linear. It can be left pointing at an in-use block.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::error::{MemoryError, MemoryResult};
use crate::segment::Addr;

/// Validation id stored in every block header and canary.
pub const ZONE_ID: u32 = 0x001D_4A11;

/// Smallest remainder split off as a separate free block.
pub const MIN_FRAGMENT: usize = 64;

/// Size of the header preceding every zone payload.
pub const ZONE_HEADER_SIZE: usize = std::mem::size_of::<ZoneBlock>();

/// Trailing canary bytes.
const CANARY_SIZE: usize = 4;

/// Header plus canary.
const OVERHEAD: usize = ZONE_HEADER_SIZE + CANARY_SIZE;

/// Link value naming the end-cap.
const END_CAP: u32 = u32::MAX;

/// Tag of an in-use block. Zero means free.
const IN_USE: u32 = 1;

/// Header stored at the start of every block.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct ZoneBlock {
    /// Including the header and possibly tiny fragments.
    size: u32,
    tag: u32,
    id: u32,
    next: u32,
    prev: u32,
    _pad: u32,
}

/// Block size needed for `size` payload bytes.
fn block_size(size: usize) -> Option<usize> {
    size.checked_add(OVERHEAD + 7)
        .map(|s| s & !7)
        .filter(|s| u32::try_from(*s).is_ok())
}

/// Zone state. Block headers live in the zone's region of the hunk.
#[derive(Debug)]
pub struct Zone {
    /// Address of the zone region.
    base: Addr,
    /// Total reserved bytes.
    size: usize,
    /// End-cap forward link: lowest block.
    first: u32,
    /// End-cap back link: highest block.
    last: u32,
    /// Where the next search starts.
    rover: u32,
}

impl Zone {
    /// Formats `region` as a single free block.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidSize`] if the region is too small or large.
    pub fn new(base: Addr, region: &mut [u8]) -> MemoryResult<Self> {
        let size = region.len();
        let size32 = u32::try_from(size)
            .ok()
            .filter(|s| *s as usize >= OVERHEAD)
            .ok_or(MemoryError::InvalidSize { op: "zone init", size })?;

        let mut zone = Self {
            base,
            size,
            first: 0,
            last: 0,
            rover: 0,
        };
        zone.write(
            region,
            0,
            ZoneBlock {
                size: size32,
                tag: 0,
                id: ZONE_ID,
                next: END_CAP,
                prev: END_CAP,
                _pad: 0,
            },
        )?;
        Ok(zone)
    }

    /// Returns the address of the zone region.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> Addr {
        self.base
    }

    /// Returns the total reserved size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    fn linkage(offset: u32, reason: &'static str) -> MemoryError {
        MemoryError::ZoneLinkage {
            offset: offset as usize,
            reason,
        }
    }

    fn read(&self, region: &[u8], at: u32) -> MemoryResult<ZoneBlock> {
        if at == END_CAP {
            return Ok(ZoneBlock {
                size: 0,
                tag: IN_USE,
                id: 0,
                next: self.first,
                prev: self.last,
                _pad: 0,
            });
        }
        let start = at as usize;
        region
            .get(start..start + ZONE_HEADER_SIZE)
            .map(bytemuck::pod_read_unaligned)
            .ok_or_else(|| Self::linkage(at, "block outside zone"))
    }

    fn write(&mut self, region: &mut [u8], at: u32, block: ZoneBlock) -> MemoryResult<()> {
        if at == END_CAP {
            self.first = block.next;
            self.last = block.prev;
            return Ok(());
        }
        let start = at as usize;
        region
            .get_mut(start..start + ZONE_HEADER_SIZE)
            .ok_or_else(|| Self::linkage(at, "block outside zone"))?
            .copy_from_slice(bytemuck::bytes_of(&block));
        Ok(())
    }

    fn set_prev(&mut self, region: &mut [u8], at: u32, prev: u32) -> MemoryResult<()> {
        let mut block = self.read(region, at)?;
        block.prev = prev;
        self.write(region, at, block)
    }

    #[inline]
    const fn payload_offset(at: u32) -> usize {
        at as usize + ZONE_HEADER_SIZE
    }

    #[inline]
    const fn payload_addr(&self, at: u32) -> Addr {
        self.base.add(Self::payload_offset(at))
    }

    fn canary_intact(region: &[u8], at: u32, block: &ZoneBlock) -> bool {
        let end = at as usize + block.size as usize;
        region
            .get(end - CANARY_SIZE..end)
            .is_some_and(|bytes| bytes == ZONE_ID.to_le_bytes())
    }

    /// Merges `gone` (the block after `keep`) into `keep`.
    fn absorb(&mut self, region: &mut [u8], keep: u32, gone: u32) -> MemoryResult<()> {
        let mut kept = self.read(region, keep)?;
        let absorbed = self.read(region, gone)?;
        kept.size += absorbed.size;
        kept.next = absorbed.next;
        self.write(region, keep, kept)?;
        self.set_prev(region, absorbed.next, keep)?;
        if self.rover == gone {
            self.rover = keep;
        }
        Ok(())
    }

    /// Splits the tail of a block off as a free fragment if it is big enough.
    fn split(&mut self, region: &mut [u8], at: u32, need: usize) -> MemoryResult<()> {
        let mut block = self.read(region, at)?;
        let extra = block.size as usize - need;
        if extra > MIN_FRAGMENT {
            let fragment = at + need as u32;
            self.write(
                region,
                fragment,
                ZoneBlock {
                    size: extra as u32,
                    tag: 0,
                    id: ZONE_ID,
                    next: block.next,
                    prev: at,
                    _pad: 0,
                },
            )?;
            self.set_prev(region, block.next, fragment)?;
            block.next = fragment;
            block.size = need as u32;
            self.write(region, at, block)?;
        }
        Ok(())
    }

    /// Marks a block in use and writes its canary.
    fn claim(&mut self, region: &mut [u8], at: u32) -> MemoryResult<()> {
        let mut block = self.read(region, at)?;
        block.tag = IN_USE;
        block.id = ZONE_ID;
        self.write(region, at, block)?;
        let end = at as usize + block.size as usize;
        region[end - CANARY_SIZE..end].copy_from_slice(&ZONE_ID.to_le_bytes());
        Ok(())
    }

    /// Validates a payload address and returns its block offset.
    fn block_for(&self, region: &[u8], addr: Addr, op: &'static str) -> MemoryResult<u32> {
        let bad_id = MemoryError::ZoneBadId { op, addr: addr.offset() };
        let at = addr
            .offset()
            .checked_sub(self.base.offset() + ZONE_HEADER_SIZE)
            .filter(|at| at + OVERHEAD <= self.size)
            .ok_or_else(|| bad_id.clone())?;
        let at = at as u32;

        let block = self.read(region, at).map_err(|_| bad_id.clone())?;
        if block.id != ZONE_ID {
            return Err(bad_id);
        }
        if block.tag == 0 {
            return Err(MemoryError::ZoneDoubleFree { op, addr: addr.offset() });
        }
        if (block.size as usize) < OVERHEAD || at as usize + block.size as usize > self.size {
            return Err(Self::linkage(at, "bad block size"));
        }
        if !Self::canary_intact(region, at, &block) {
            return Err(MemoryError::ZoneCanary { addr: addr.offset() });
        }
        Ok(at)
    }

    /// Returns the usable payload bytes of the block at `addr`.
    ///
    /// # Errors
    ///
    /// Fails if `addr` does not name a live block.
    pub fn capacity(&self, region: &[u8], addr: Addr) -> MemoryResult<usize> {
        let at = self.block_for(region, addr, "zone capacity")?;
        Ok(self.read(region, at)?.size as usize - OVERHEAD)
    }

    /// Allocates without clearing the payload. Returns `None` if no free
    /// block is large enough.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidSize`] for a zero or unencodable size.
    pub fn allocate_raw(&mut self, region: &mut [u8], size: usize) -> MemoryResult<Option<Addr>> {
        if size == 0 {
            return Err(MemoryError::InvalidSize { op: "zone alloc", size });
        }
        let need = block_size(size).ok_or(MemoryError::InvalidSize { op: "zone alloc", size })?;

        // Scan through the block list looking for the first free block of
        // sufficient size.
        let mut base = self.rover;
        let mut rover = base;
        let start = self.read(region, base)?.prev;
        loop {
            if rover == start {
                // Scanned all the way around the list.
                return Ok(None);
            }
            let current = self.read(region, rover)?;
            rover = current.next;
            if current.tag != 0 {
                base = rover;
            }
            let candidate = self.read(region, base)?;
            if candidate.tag == 0 && candidate.size as usize >= need {
                break;
            }
        }

        self.split(region, base, need)?;
        self.claim(region, base)?;
        // Next allocation will start looking here.
        self.rover = self.read(region, base)?.next;

        Ok(Some(self.payload_addr(base)))
    }

    /// Releases a block, merging it with free neighbours.
    ///
    /// # Errors
    ///
    /// Fails on a pointer without a zone id, a double free, or a trashed canary.
    pub fn free(&mut self, region: &mut [u8], addr: Addr) -> MemoryResult<()> {
        self.release(region, addr, "zone free")
    }

    fn release(&mut self, region: &mut [u8], addr: Addr, op: &'static str) -> MemoryResult<()> {
        let mut at = self.block_for(region, addr, op)?;
        let mut block = self.read(region, at)?;
        block.tag = 0;
        self.write(region, at, block)?;

        let prev = block.prev;
        if self.read(region, prev)?.tag == 0 {
            self.absorb(region, prev, at)?;
            at = prev;
        }

        let next = self.read(region, at)?.next;
        if self.read(region, next)?.tag == 0 {
            self.absorb(region, at, next)?;
        }
        Ok(())
    }

    /// Resizes an allocation without ever losing its contents.
    ///
    /// Grows or shrinks in place when the block and its free neighbours are
    /// large enough; otherwise allocates a new block before freeing the old
    /// one. Growth is zero-filled. `None` behaves as a fresh zeroed
    /// allocation.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ZoneExhausted`] if no room exists; the old block
    /// is left untouched.
    pub fn reallocate(&mut self, region: &mut [u8], addr: Option<Addr>, size: usize) -> MemoryResult<Addr> {
        let Some(addr) = addr else {
            return self.allocate_zeroed(region, size);
        };
        if size == 0 {
            return Err(MemoryError::InvalidSize { op: "zone realloc", size });
        }
        let need = block_size(size).ok_or(MemoryError::InvalidSize { op: "zone realloc", size })?;

        let at = self.block_for(region, addr, "zone realloc")?;
        let block = self.read(region, at)?;
        let old_capacity = block.size as usize - OVERHEAD;
        let keep = old_capacity.min(size);

        let next = self.read(region, block.next)?;
        let next_free = if next.tag == 0 { next.size as usize } else { 0 };
        let prev = self.read(region, block.prev)?;
        let prev_free = if prev.tag == 0 { prev.size as usize } else { 0 };

        let new_at = if block.size as usize + next_free >= need {
            if next_free > 0 {
                self.absorb(region, at, block.next)?;
            }
            at
        } else if prev_free + block.size as usize + next_free >= need {
            if next_free > 0 {
                self.absorb(region, at, block.next)?;
            }
            self.absorb(region, block.prev, at)?;
            region.copy_within(
                Self::payload_offset(at)..Self::payload_offset(at) + keep,
                Self::payload_offset(block.prev),
            );
            block.prev
        } else {
            let moved = self
                .allocate_raw(region, size)?
                .ok_or(MemoryError::ZoneExhausted { size })?;
            let src = Self::payload_offset(at);
            let dst = moved.offset() - self.base.offset();
            region.copy_within(src..src + keep, dst);
            if size > old_capacity {
                region[dst + old_capacity..dst + size].fill(0);
            }
            self.release(region, addr, "zone realloc")?;
            return Ok(moved);
        };

        self.split(region, new_at, need)?;
        self.claim(region, new_at)?;
        if size > old_capacity {
            let payload = Self::payload_offset(new_at);
            region[payload + old_capacity..payload + size].fill(0);
        }
        Ok(self.payload_addr(new_at))
    }

    /// Allocates and zero-fills `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ZoneExhausted`] if no free block fits.
    pub fn allocate_zeroed(&mut self, region: &mut [u8], size: usize) -> MemoryResult<Addr> {
        let addr = self
            .allocate_raw(region, size)?
            .ok_or(MemoryError::ZoneExhausted { size })?;
        let payload = addr.offset() - self.base.offset();
        region[payload..payload + size].fill(0);
        Ok(addr)
    }

    /// Copies `text` plus a terminator into a new block.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ZoneExhausted`] if no free block fits.
    pub fn duplicate_string(&mut self, region: &mut [u8], text: &str) -> MemoryResult<Addr> {
        let addr = self.allocate_zeroed(region, text.len() + 1)?;
        let payload = addr.offset() - self.base.offset();
        region[payload..payload + text.len()].copy_from_slice(text.as_bytes());
        Ok(addr)
    }

    /// Returns the bytes of a string written by [`Zone::duplicate_string`],
    /// without the terminator.
    ///
    /// # Errors
    ///
    /// Fails if `addr` does not name a live block.
    pub fn cstr<'a>(&self, region: &'a [u8], addr: Addr) -> MemoryResult<&'a [u8]> {
        let capacity = self.capacity(region, addr)?;
        let payload = addr.offset() - self.base.offset();
        let bytes = &region[payload..payload + capacity];
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(capacity);
        Ok(&bytes[..len])
    }

    /// Walks the block list verifying tiling, back links, canaries and that
    /// no two free blocks touch.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ZoneLinkage`] or [`MemoryError::ZoneCanary`].
    pub fn check(&self, region: &[u8]) -> MemoryResult<()> {
        let mut at = self.first;
        let mut prev = END_CAP;
        let mut covered = 0usize;

        loop {
            if at as usize != covered {
                return Err(Self::linkage(at, "block size does not touch the next block"));
            }
            let block = self.read(region, at)?;
            if block.prev != prev {
                return Err(Self::linkage(at, "next block doesn't have proper back link"));
            }
            if block.id != ZONE_ID || (block.size as usize) < OVERHEAD {
                return Err(Self::linkage(at, "bad block header"));
            }
            covered += block.size as usize;
            if covered > self.size {
                return Err(Self::linkage(at, "block runs past the end of the zone"));
            }
            if block.tag != 0 && !Self::canary_intact(region, at, &block) {
                return Err(MemoryError::ZoneCanary {
                    addr: self.payload_addr(at).offset(),
                });
            }
            if block.next == END_CAP {
                break;
            }
            if block.tag == 0 && self.read(region, block.next)?.tag == 0 {
                return Err(Self::linkage(at, "two consecutive free blocks"));
            }
            prev = at;
            at = block.next;
        }

        if covered != self.size || self.last != at {
            return Err(Self::linkage(at, "blocks do not tile the zone"));
        }
        Ok(())
    }

    /// Builds the diagnostic dump. Inconsistencies are reported per block
    /// rather than failing.
    ///
    /// # Errors
    ///
    /// Fails only if a link points outside the zone.
    pub fn report(&self, region: &[u8]) -> MemoryResult<ZoneReport> {
        let mut blocks = Vec::new();
        let mut at = self.first;

        while at != END_CAP && blocks.len() <= self.size / OVERHEAD {
            let block = self.read(region, at)?;
            let problem = if block.next == END_CAP {
                None
            } else if at as usize + block.size as usize != block.next as usize {
                Some("block size does not touch the next block")
            } else if self.read(region, block.next)?.prev != at {
                Some("next block doesn't have proper back link")
            } else if block.tag == 0 && self.read(region, block.next)?.tag == 0 {
                Some("two consecutive free blocks")
            } else {
                None
            };
            blocks.push(ZoneBlockInfo {
                offset: at as usize,
                size: block.size as usize,
                tag: block.tag,
                problem,
            });
            at = block.next;
        }

        Ok(ZoneReport {
            base: self.base,
            size: self.size,
            blocks,
        })
    }
}

/// One block as listed by [`Zone::report`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneBlockInfo {
    /// Zone-relative offset of the header.
    pub offset: usize,
    /// Block size including header and canary.
    pub size: usize,
    /// Zero for free blocks.
    pub tag: u32,
    /// Linkage problem found after this block, if any.
    pub problem: Option<&'static str>,
}

/// Diagnostic dump of the zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneReport {
    /// Address of the zone region.
    pub base: Addr,
    /// Total reserved bytes.
    pub size: usize,
    /// Blocks in address order.
    pub blocks: Vec<ZoneBlockInfo>,
}

impl ZoneReport {
    /// Bytes held by free blocks, headers included.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.blocks.iter().filter(|b| b.tag == 0).map(|b| b.size).sum()
    }

    /// Bytes held by in-use blocks, headers included.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.blocks.iter().filter(|b| b.tag != 0).map(|b| b.size).sum()
    }
}

impl fmt::Display for ZoneReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "zone size: {}  location: {}", self.size, self.base)?;
        for block in &self.blocks {
            writeln!(f, "block:{:#010x}    size:{:7}    tag:{:3}", block.offset, block.size, block.tag)?;
            if let Some(problem) = block.problem {
                writeln!(f, "ERROR: {problem}")?;
            }
        }
        Ok(())
    }
}
