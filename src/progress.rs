//! Progress tracking for parallel archive operations.
//!
//! Per-worker atomic counters keep the hot path contention-free; an
//! interval-throttled callback surfaces aggregated state. Timeouts are
//! informational only and never affect the outcome of an operation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-worker counters, updated with relaxed atomics.
pub struct WorkerMetrics {
    items: AtomicU64,
    bytes: AtomicU64,
}

impl WorkerMetrics {
    fn new() -> Self {
        Self {
            items: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn record(&self, bytes: u64) {
        self.items.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Aggregated progress snapshot handed to the callback.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub items: u64,
    pub bytes: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub mb_per_sec: f64,
    pub percent: f64,
}

pub type ProgressCallback = dyn Fn(ProgressState) + Send + Sync;

pub struct ProgressTracker {
    metrics: Vec<Arc<WorkerMetrics>>,
    total_bytes: AtomicU64,
    start: Instant,
    interval: Duration,
    last_emit: Mutex<Instant>,
    callback: Option<Box<ProgressCallback>>,
}

impl ProgressTracker {
    pub fn new(ranks: usize, interval: Duration, callback: Option<Box<ProgressCallback>>) -> Self {
        Self {
            metrics: (0..ranks).map(|_| Arc::new(WorkerMetrics::new())).collect(),
            total_bytes: AtomicU64::new(0),
            start: Instant::now(),
            interval,
            last_emit: Mutex::new(Instant::now()),
            callback,
        }
    }

    pub fn set_total_bytes(&self, bytes: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn worker(&self, rank: usize) -> Arc<WorkerMetrics> {
        Arc::clone(&self.metrics[rank])
    }

    /// Emit through the callback if the interval has passed.
    pub fn maybe_emit(&self) {
        if self.callback.is_none() {
            return;
        }
        let now = Instant::now();
        let due = {
            let mut last = self.last_emit.lock().unwrap();
            if now.duration_since(*last) >= self.interval {
                *last = now;
                true
            } else {
                false
            }
        };
        if due {
            self.emit();
        }
    }

    /// Emit unconditionally (used at phase boundaries and completion).
    pub fn emit(&self) {
        if let Some(cb) = &self.callback {
            cb(self.state());
        }
    }

    pub fn state(&self) -> ProgressState {
        let (items, bytes) = self.metrics.iter().fold((0u64, 0u64), |(i, b), m| {
            (
                i + m.items.load(Ordering::Relaxed),
                b + m.bytes.load(Ordering::Relaxed),
            )
        });
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);
        let elapsed = self.start.elapsed();
        let mb_per_sec = if elapsed.as_secs_f64() > 0.0 {
            bytes as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let percent = if total_bytes > 0 {
            (bytes as f64 / total_bytes as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        ProgressState {
            items,
            bytes,
            total_bytes,
            elapsed,
            mb_per_sec,
            percent,
        }
    }
}
