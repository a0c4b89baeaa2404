//! Per-run counters for the hashing pipeline.
//!
//! A single [`Stats`] value is shared by the engine and the hasher for the
//! duration of one workflow. Counters are atomic so the value can be read
//! while a run is in progress; nothing here is persisted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Transient counters for one workflow run.
#[derive(Debug, Default)]
pub struct Stats {
    files_processed: AtomicU64,
    direct_read_bytes: AtomicU64,
    mapped_read_bytes: AtomicU64,
    timer: Mutex<Timer>,
}

#[derive(Debug, Default)]
struct Timer {
    started: Option<Instant>,
    elapsed: Duration,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all counters and starts the wall clock.
    pub fn reset(&self) {
        self.files_processed.store(0, Ordering::Relaxed);
        self.direct_read_bytes.store(0, Ordering::Relaxed);
        self.mapped_read_bytes.store(0, Ordering::Relaxed);
        let mut timer = self.timer.lock();
        timer.started = Some(Instant::now());
        timer.elapsed = Duration::ZERO;
    }

    /// Stops the wall clock, freezing [`Stats::elapsed`].
    pub fn stop(&self) {
        let mut timer = self.timer.lock();
        if let Some(started) = timer.started.take() {
            timer.elapsed = started.elapsed();
        }
    }

    pub fn count_file(&self) {
        self.files_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_direct_read(&self, bytes: u64) {
        self.direct_read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_mapped_read(&self, bytes: u64) {
        self.mapped_read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn files_processed(&self) -> u64 {
        self.files_processed.load(Ordering::Relaxed)
    }

    /// Bytes read through plain sequential I/O.
    pub fn direct_read_bytes(&self) -> u64 {
        self.direct_read_bytes.load(Ordering::Relaxed)
    }

    /// Bytes read through memory-mapped I/O.
    pub fn mapped_read_bytes(&self) -> u64 {
        self.mapped_read_bytes.load(Ordering::Relaxed)
    }

    pub fn total_read_bytes(&self) -> u64 {
        self.direct_read_bytes() + self.mapped_read_bytes()
    }

    /// Wall time between the last `reset` and `stop`; live if still running.
    pub fn elapsed(&self) -> Duration {
        let timer = self.timer.lock();
        match timer.started {
            Some(started) => started.elapsed(),
            None => timer.elapsed,
        }
    }
}

/// Formats a byte count with decimal units and per-unit precision.
pub fn format_bytes(size: u64) -> String {
    const LABELS: [&str; 5] = ["bytes", "kB", "MB", "GB", "TB"];
    const DIGITS: [usize; 5] = [0, 0, 1, 2, 3];

    let mut value = size as f64;
    let mut unit = 0;

    while value > 1000.0 && unit < LABELS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    format!("{value:.0$} {1}", DIGITS[unit], LABELS[unit])
}
