//! # EMBER Memory
//!
//! Three-tier memory manager carved out of a few large backing buffers:
//! - **Hunk** - segmented stack arena, released only by resetting to a mark
//! - **Zone** - free-list allocator for small, individually freed objects
//! - **Cache** - LRU-evicting allocator for reloadable assets, living in the
//!   unused tail of the last segment
//!
//! ## Architecture Rules
//!
//! 1. **Addresses are offsets** - [`Addr`] indexes the combined segment space
//! 2. **Headers live in the buffer** - bounds-checked `Pod` reads, no `unsafe`
//! 3. **One context object** - [`Memory`] owns every tier
//! 4. **Errors, then abort** - operations return [`MemoryResult`]; callers that
//!    cannot continue use [`OrFatal::or_fatal`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_memory::{CacheUser, Memory, MemoryConfig};
//!
//! let mut memory = Memory::new(MemoryConfig::default())?;
//! let mark = memory.hunk_low_mark();
//! let level = memory.hunk_alloc(900_000, Some("level"))?;
//!
//! let sound = CacheUser::new();
//! memory.cache_alloc(&sound, 50_000, "sound/misc/menu1.wav")?;
//!
//! memory.hunk_reset_to(mark)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod cache;
pub mod config;
pub mod console;
pub mod error;
pub mod hunk;
pub mod segment;
pub mod system;
pub mod zone;

pub use cache::{CacheEntryInfo, CacheReport, CacheUser, EvictedEntry, EvictionHook};
pub use config::MemoryConfig;
pub use console::MemoryCommand;
pub use error::{fatal, MemoryError, MemoryResult, OrFatal};
pub use hunk::{HunkMark, HunkRecord, HunkReport};
pub use segment::{Addr, Segment, SegmentDirectory};
pub use system::Memory;
pub use zone::{ZoneBlockInfo, ZoneReport};
