//! Byte-level progress tracking for backup and restore operations.
//!
//! Tracks processed bytes against the expected total, derives speed and
//! completion estimates, and renders human-readable summaries.

use std::time::{Duration, Instant};

use crate::events::ProgressPayload;

/// Minimum interval between two emitted progress samples
const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Progress information for a running operation
#[derive(Debug, Clone, Default)]
pub struct OperationProgress {
    /// Total bytes the operation expects to process
    pub total_bytes: u64,

    /// Bytes processed so far
    pub processed_bytes: u64,

    /// Current processing speed in bytes/second
    pub bytes_per_second: u64,

    /// Estimated time remaining (seconds)
    pub eta_seconds: u64,

    /// Percentage complete (0-100)
    pub percent_complete: f64,

    pub files_processed: usize,

    pub total_files: usize,

    /// File currently being processed
    pub current_file: Option<String>,
}

impl OperationProgress {
    pub fn new(total_bytes: u64, total_files: usize) -> Self {
        Self {
            total_bytes,
            total_files,
            ..Default::default()
        }
    }

    fn set_processed(&mut self, processed_bytes: u64) {
        self.processed_bytes = processed_bytes;
        self.percent_complete = if self.total_bytes > 0 {
            (self.processed_bytes.min(self.total_bytes) as f64 / self.total_bytes as f64) * 100.0
        } else {
            100.0
        };
    }

    pub fn is_complete(&self) -> bool {
        self.processed_bytes >= self.total_bytes && self.files_processed >= self.total_files
    }

    pub fn to_payload(&self) -> ProgressPayload {
        ProgressPayload {
            percent: self.percent_complete,
            processed_bytes: self.processed_bytes,
            total_bytes: self.total_bytes,
            files_processed: self.files_processed,
            total_files: self.total_files,
            bytes_per_second: self.bytes_per_second,
            eta_seconds: self.eta_seconds,
            current_file: self.current_file.clone(),
        }
    }
}

/// Progress tracker with time-based speed calculation
pub struct ProgressTracker {
    start_time: Instant,
    last_sample: Option<Instant>,
    progress: OperationProgress,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, total_files: usize) -> Self {
        Self {
            start_time: Instant::now(),
            last_sample: None,
            progress: OperationProgress::new(total_bytes, total_files),
        }
    }

    /// Record one finished file. Returns a sample when one is due.
    pub fn file_done(&mut self, path: &str, bytes: u64) -> Option<&OperationProgress> {
        self.progress.files_processed += 1;
        self.progress.current_file = Some(path.to_string());
        let processed = self.progress.processed_bytes + bytes;
        self.progress.set_processed(processed);
        self.recompute_rates();

        let now = Instant::now();
        let due = match self.last_sample {
            Some(last) => now.duration_since(last) >= SAMPLE_INTERVAL,
            None => true,
        };
        if due || self.progress.is_complete() {
            self.last_sample = Some(now);
            Some(&self.progress)
        } else {
            None
        }
    }

    fn recompute_rates(&mut self) {
        self.progress.bytes_per_second = self.average_speed();
        if self.progress.bytes_per_second > 0 {
            let remaining = self.progress.total_bytes.saturating_sub(self.progress.processed_bytes);
            self.progress.eta_seconds = remaining / self.progress.bytes_per_second;
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.progress.processed_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &OperationProgress {
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
