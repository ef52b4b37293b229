//! Human-readable run summaries.

use std::fmt;
use std::time::Duration;

use crate::sync::SendStats;

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// One-line description of a finished run.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub stats: SendStats,
    /// Bytes in plus bytes out at the wire.
    pub wire_bytes: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.wire_bytes as f64 / secs) as u64
        } else {
            0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries scanned, {} updated, {} of content, {} on the wire in {} ({})",
            self.stats.scanned,
            self.stats.updated,
            format_bytes(self.stats.content_bytes),
            format_bytes(self.wire_bytes),
            format_duration(self.elapsed.as_secs()),
            format_speed(self.average_speed())
        )
    }
}
