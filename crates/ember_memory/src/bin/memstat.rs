//! # Memory Statistics
//!
//! Initializes the memory system and runs console commands read from stdin.
//!
//! ```text
//! echo "hunk_print all" | memstat ember.toml
//! ```

use std::io::BufRead;

use ember_memory::{Memory, MemoryCommand, MemoryConfig, OrFatal};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help") {
        println!("Usage: memstat [config.toml]");
        println!();
        println!("Commands (one per line on stdin):");
        println!("  hunk_print [all]   hunk_check   zone_print   zone_check");
        println!("  cache_print        cache_report flush");
        return;
    }

    let config = match args.get(1) {
        Some(path) => MemoryConfig::load(path).or_fatal(),
        None => MemoryConfig::default(),
    };
    let mut memory = Memory::new(config).or_fatal();

    println!(
        "EMBER memory: {} segment(s), {:.1} MiB, zone {} KiB",
        memory.segments().len(),
        memory.segments().total_size() as f64 / (1024.0 * 1024.0),
        memory.config().zone_size / 1024
    );

    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<MemoryCommand>() {
            Ok(command) => print!("{}", command.execute(&mut memory).or_fatal()),
            Err(e) => println!("{e}"),
        }
    }
}
