//! Human-readable sizes, speeds and durations, plus a throughput meter for
//! the compression phase.

use std::time::{Duration, Instant};

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

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let whole = seconds as u64;
        format!("{}m {:.1}s", whole / 60, seconds - (whole / 60 * 60) as f64)
    } else {
        let whole = seconds as u64;
        format!("{}h {}m", whole / 3600, (whole % 3600) / 60)
    }
}

/// Tracks bytes processed and derives an instantaneous rate between samples
pub struct ThroughputMeter {
    start_time: Instant,
    last_sample_time: Instant,
    last_bytes: u64,
    bytes_per_second: u64,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_sample_time: now,
            last_bytes: 0,
            bytes_per_second: 0,
        }
    }

    /// Record the running byte count and return the current speed
    pub fn sample(&mut self, processed_bytes: u64) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample_time).as_secs_f64();

        if elapsed > 0.0 {
            let bytes_diff = processed_bytes.saturating_sub(self.last_bytes);
            self.bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }

        self.last_sample_time = now;
        self.last_bytes = processed_bytes;
        self.bytes_per_second
    }

    /// Time since the meter was created
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.last_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}
