//! # Memory Error Types
//!
//! Every condition the memory subsystem treats as fatal.
//!
//! Operations return [`MemoryResult`] so tests can assert on the exact
//! failure. Production callers that cannot continue with a presumed-corrupt
//! allocator use [`OrFatal::or_fatal`], which logs and aborts the process.

use thiserror::Error;

/// Errors that can occur in the memory subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// A size argument was rejected (zero where disallowed, or too large to encode).
    #[error("{op}: bad size {size}")]
    InvalidSize {
        /// Operation that rejected the size.
        op: &'static str,
        /// The requested size.
        size: usize,
    },

    /// A logical offset lies outside every segment.
    #[error("bad offset {offset} (max: {max})")]
    BadOffset {
        /// The offending offset.
        offset: usize,
        /// Current end of the address space.
        max: usize,
    },

    /// A raw pointer does not belong to any segment.
    #[error("bad pointer: not inside any hunk segment")]
    BadPointer,

    /// The segment count limit was reached.
    #[error("segment overflow: limit of {max} segments reached")]
    SegmentOverflow {
        /// Maximum number of segments.
        max: usize,
    },

    /// The backing buffer for a segment could not be allocated.
    #[error("failed to allocate backing buffer of {size} bytes")]
    BackingAllocation {
        /// Requested buffer size.
        size: usize,
    },

    /// Attempted to reset the hunk to a mark above the current low mark.
    #[error("bad mark {mark} (low mark: {low_mark})")]
    BadMark {
        /// The requested mark.
        mark: usize,
        /// The current low mark.
        low_mark: usize,
    },

    /// A hunk record sentinel was overwritten.
    #[error("hunk check: trashed sentinel at offset {offset}")]
    HunkSentinel {
        /// Offset of the trashed record.
        offset: usize,
    },

    /// A hunk record size does not tile its segment.
    #[error("hunk check: bad size {size} at offset {offset}")]
    HunkBadSize {
        /// Offset of the record.
        offset: usize,
        /// Size stored in the record.
        size: usize,
    },

    /// A zone pointer does not reference a valid block.
    #[error("{op}: pointer at {addr} has no zone id")]
    ZoneBadId {
        /// Operation that validated the pointer.
        op: &'static str,
        /// The offending address.
        addr: usize,
    },

    /// A zone block was released twice.
    #[error("{op}: pointer at {addr} was already freed")]
    ZoneDoubleFree {
        /// Operation that found the free block.
        op: &'static str,
        /// The offending address.
        addr: usize,
    },

    /// The trailing canary of a zone block was overwritten.
    #[error("zone block at {addr} has a trashed canary")]
    ZoneCanary {
        /// Address of the block payload.
        addr: usize,
    },

    /// The zone block list is inconsistent.
    #[error("zone check: {reason} at zone offset {offset}")]
    ZoneLinkage {
        /// Zone-relative offset of the bad block.
        offset: usize,
        /// What went wrong.
        reason: &'static str,
    },

    /// The zone has no free block large enough.
    #[error("zone: failed on allocation of {size} bytes")]
    ZoneExhausted {
        /// Requested payload size.
        size: usize,
    },

    /// A cache handle already owns data.
    #[error("cache alloc: '{name}' is already allocated")]
    CacheAlreadyAllocated {
        /// Diagnostic name of the request.
        name: String,
    },

    /// A cache handle owns no data.
    #[error("cache free: not allocated")]
    CacheNotAllocated,

    /// A cache entry header does not match its bookkeeping.
    #[error("cache entry at {addr} is corrupt")]
    CacheCorrupt {
        /// Payload address of the entry.
        addr: usize,
    },

    /// A cache request exceeds the entire free region of the last segment.
    #[error("cache: {size} is greater than free hunk")]
    CacheExceedsSegment {
        /// Entry size including header.
        size: usize,
    },

    /// Every cache entry was evicted and the request still does not fit.
    #[error("cache alloc: out of memory for '{name}' ({size} bytes)")]
    CacheOutOfMemory {
        /// Diagnostic name of the request.
        name: String,
        /// Requested payload size.
        size: usize,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unknown console command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Terminates the process after logging the error.
///
/// This is the single abort path for the subsystem.
#[cold]
pub fn fatal(err: &MemoryError) -> ! {
    tracing::error!(error = %err, "memory subsystem failure, aborting");
    eprintln!("Error: {err}");
    std::process::abort()
}

/// Converts a [`MemoryResult`] into its value, aborting on error.
pub trait OrFatal<T> {
    /// Returns the value or terminates the process through [`fatal`].
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for MemoryResult<T> {
    #[inline]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(&err),
        }
    }
}
