//! # Console Commands
//!
//! Diagnostic commands exposed to the developer console.
//!
//! | Command          | Effect                                      |
//! |------------------|---------------------------------------------|
//! | `hunk_print`     | hunk dump, same-named records totaled        |
//! | `hunk_print all` | hunk dump, every record listed               |
//! | `hunk_check`     | sentinel and size verification               |
//! | `zone_print`     | zone block dump                              |
//! | `zone_check`     | zone linkage and canary verification         |
//! | `cache_print`    | cache entries in address order               |
//! | `cache_report`   | free space above the hunk                    |
//! | `flush`          | evict every cache entry                      |

use std::str::FromStr;

use crate::error::{MemoryError, MemoryResult};
use crate::system::Memory;

/// A parsed console command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryCommand {
    /// Prints the hunk, listing every record when `all` is set.
    HunkPrint {
        /// List records individually.
        all: bool,
    },
    /// Verifies the hunk.
    HunkCheck,
    /// Prints the zone.
    ZonePrint,
    /// Verifies the zone.
    ZoneCheck,
    /// Lists cache entries.
    CachePrint,
    /// Reports cache free space.
    CacheReport,
    /// Evicts every cache entry.
    Flush,
}

impl FromStr for MemoryCommand {
    type Err = MemoryError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default();
        let arg = words.next();

        let parsed = match (command, arg) {
            ("hunk_print", None) => Self::HunkPrint { all: false },
            ("hunk_print", Some("all")) => Self::HunkPrint { all: true },
            ("hunk_check", None) => Self::HunkCheck,
            ("zone_print", None) => Self::ZonePrint,
            ("zone_check", None) => Self::ZoneCheck,
            ("cache_print", None) => Self::CachePrint,
            ("cache_report", None) => Self::CacheReport,
            ("flush", None) => Self::Flush,
            _ => return Err(MemoryError::UnknownCommand(line.trim().to_owned())),
        };
        if words.next().is_some() {
            return Err(MemoryError::UnknownCommand(line.trim().to_owned()));
        }
        Ok(parsed)
    }
}

impl MemoryCommand {
    /// Runs the command and returns its console output.
    ///
    /// # Errors
    ///
    /// Propagates any corruption the command detects.
    pub fn execute(self, memory: &mut Memory) -> MemoryResult<String> {
        let mut out = String::new();
        match self {
            Self::HunkPrint { all } => {
                out.push_str(&memory.hunk_report(all)?.to_string());
            }
            Self::HunkCheck => {
                memory.hunk_check()?;
                out.push_str("hunk ok\n");
            }
            Self::ZonePrint => {
                out.push_str(&memory.zone_report()?.to_string());
            }
            Self::ZoneCheck => {
                memory.zone_check()?;
                out.push_str("zone ok\n");
            }
            Self::CachePrint => {
                for entry in memory.cache_entries()? {
                    out.push_str(&format!("{:8} : {}\n", entry.size, entry.name));
                }
            }
            Self::CacheReport => {
                out.push_str(&format!("{}\n", memory.cache_report()));
            }
            Self::Flush => {
                memory.cache_flush()?;
            }
        }
        Ok(out)
    }
}
