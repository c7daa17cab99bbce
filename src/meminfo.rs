// Memory information parser for /proc/meminfo
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};

use thiserror::Error;

const PROC_MEMINFO: &str = "/proc/meminfo";

#[derive(Error, Debug)]
pub enum MemInfoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

pub type Result<T> = std::result::Result<T, MemInfoError>;

/// Read memory stats from /proc/meminfo efficiently.
/// Reads only until all requested fields are found, then stops.
pub fn get_mem_stats(fields: &[&str]) -> Result<HashMap<String, u64>> {
    let file = File::open(PROC_MEMINFO)?;
    parse_mem_stats(BufReader::new(file), fields)
}

fn parse_mem_stats<R: BufRead>(reader: R, fields: &[&str]) -> Result<HashMap<String, u64>> {
    let mut stats = HashMap::new();
    let mut remaining: HashSet<&str> = fields.iter().copied().collect();

    for line in reader.lines() {
        let line = line?;

        // Parse "Key:   value kB" format
        if let Some(colon_pos) = line.find(':') {
            let key = &line[..colon_pos];

            if remaining.contains(key) {
                let value_part = line[colon_pos + 1..].trim();
                let parts: Vec<&str> = value_part.split_whitespace().collect();

                let value = if parts.len() >= 2 && parts[1] == "kB" {
                    parts[0]
                        .parse::<u64>()
                        .map_err(|e| MemInfoError::ParseError(e.to_string()))?
                        * 1024
                } else if !parts.is_empty() {
                    parts[0]
                        .parse::<u64>()
                        .map_err(|e| MemInfoError::ParseError(e.to_string()))?
                } else {
                    continue;
                };

                stats.insert(key.to_string(), value);
                remaining.remove(key);

                if remaining.is_empty() {
                    break;
                }
            }
        }
    }

    if !remaining.is_empty() {
        let mut missing: Vec<_> = remaining.into_iter().collect();
        missing.sort_unstable();
        return Err(MemInfoError::MissingField(missing.join(", ")));
    }

    Ok(stats)
}

/// Get total RAM in bytes
pub fn get_ram_size() -> Result<u64> {
    let stats = get_mem_stats(&["MemTotal"])?;
    Ok(stats["MemTotal"])
}

/// Get total active swap in bytes (all swap areas)
pub fn get_swap_total() -> Result<u64> {
    let stats = get_mem_stats(&["SwapTotal"])?;
    Ok(stats["SwapTotal"])
}

/// Get page size from system
pub fn get_page_size() -> u64 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .unwrap_or(4096) as u64
}
