//! Byte-level progress for long-running writes (container allocation).
//!
//! The tracker computes throughput and a completion estimate, and decides when
//! enough has happened since the last report to be worth logging again.

use std::time::{Duration, Instant};

/// Report at most this often...
const REPORT_INTERVAL: Duration = Duration::from_secs(5);
/// ...unless this many percentage points have passed.
const REPORT_STEP_PERCENT: f64 = 10.0;

/// Snapshot of a write in progress.
#[derive(Debug, Clone)]
pub struct WriteProgress {
    pub total_bytes: u64,
    pub written_bytes: u64,
    /// Instantaneous speed in bytes/second
    pub bytes_per_second: u64,
    pub eta_seconds: u64,
    pub percent_complete: f64,
}

impl WriteProgress {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            written_bytes: 0,
            bytes_per_second: 0,
            eta_seconds: 0,
            percent_complete: 0.0,
        }
    }

    fn update(&mut self, written_bytes: u64) {
        self.written_bytes = written_bytes;
        self.percent_complete = if self.total_bytes > 0 {
            (written_bytes as f64 / self.total_bytes as f64) * 100.0
        } else {
            100.0
        };
    }

    pub fn is_complete(&self) -> bool {
        self.written_bytes >= self.total_bytes
    }
}

/// Progress tracker with time-based speed calculation
pub struct ProgressTracker {
    start_time: Instant,
    last_update_time: Instant,
    last_bytes: u64,
    last_report: Option<(Instant, f64)>,
    progress: WriteProgress,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_update_time: now,
            last_bytes: 0,
            last_report: None,
            progress: WriteProgress::new(total_bytes),
        }
    }

    /// Record the new byte count and recompute speed and ETA.
    pub fn update(&mut self, written_bytes: u64) -> &WriteProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();

        if elapsed > 0.0 {
            let bytes_diff = written_bytes.saturating_sub(self.last_bytes);
            self.progress.bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }

        if self.progress.bytes_per_second > 0 {
            let remaining = self.progress.total_bytes.saturating_sub(written_bytes);
            self.progress.eta_seconds = remaining / self.progress.bytes_per_second;
        }

        self.progress.update(written_bytes);
        self.last_update_time = now;
        self.last_bytes = written_bytes;

        &self.progress
    }

    /// Whether the current state should be reported. The first call and the
    /// completing call always report.
    pub fn should_report(&mut self) -> bool {
        let now = Instant::now();
        let percent = self.progress.percent_complete;
        let due = match self.last_report {
            None => true,
            Some(_) if self.progress.is_complete() => true,
            Some((at, last_percent)) => {
                now.duration_since(at) >= REPORT_INTERVAL
                    || percent - last_percent >= REPORT_STEP_PERCENT
            }
        };
        if due {
            self.last_report = Some((now, percent));
        }
        due
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.progress.written_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &WriteProgress {
        &self.progress
    }
}

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
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
