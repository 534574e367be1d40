//! Rolling latency window for one RPC method on one node.

use serde::Serialize;
use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

/// Number of samples kept per method.
pub const DEFAULT_WINDOW: usize = 256;

/// Fixed-size ring buffer of call durations, in microseconds.
///
/// Recording is lock-free so `Node::call` never contends with status readers. Percentiles
/// copy the window and sort it, so they are meant for status snapshots, not the hot path.
pub struct LatencyTracker {
    samples: Box<[AtomicU64]>,
    write_index: AtomicUsize,
    count: AtomicUsize,
    /// Reference point for `last_record_us`.
    epoch: Instant,
    /// Microseconds since `epoch` of the last sample, offset by one so zero means never.
    last_record_us: AtomicU64,
}

/// Latency summary reported in [`NodeStatus`](super::NodeStatus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
}

impl LatencyTracker {
    #[must_use]
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: (0..window).map(|_| AtomicU64::new(0)).collect(),
            write_index: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            epoch: Instant::now(),
            last_record_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let index = self.write_index.fetch_add(1, Ordering::Relaxed) % self.samples.len();
        self.samples[index].store(micros, Ordering::Relaxed);
        self.count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_add(1).min(self.samples.len()))
            })
            .ok();

        let since_epoch = u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX - 1);
        self.last_record_us.store(since_epoch + 1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn window(&self) -> Vec<u64> {
        let count = self.sample_count();
        self.samples.iter().take(count).map(|s| s.load(Ordering::Relaxed)).collect()
    }

    /// Returns the sample at `quantile` (0.0 to 1.0), or `None` without samples.
    #[must_use]
    pub fn percentile(&self, quantile: f64) -> Option<Duration> {
        if !(0.0..=1.0).contains(&quantile) {
            return None;
        }
        let mut sorted = self.window();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let index = ((sorted.len() as f64 - 1.0) * quantile) as usize;
        Some(Duration::from_micros(sorted[index]))
    }

    #[must_use]
    pub fn average(&self) -> Option<Duration> {
        let window = self.window();
        if window.is_empty() {
            return None;
        }
        let sum: u64 = window.iter().fold(0u64, |acc, v| acc.saturating_add(*v));
        Some(Duration::from_micros(sum / window.len() as u64))
    }

    /// Time since the last sample, or `None` if nothing was recorded yet.
    #[must_use]
    pub fn time_since_last_record(&self) -> Option<Duration> {
        match self.last_record_us.load(Ordering::Relaxed) {
            0 => None,
            stamp => {
                let now = u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX);
                Some(Duration::from_micros(now.saturating_sub(stamp - 1)))
            }
        }
    }

    #[must_use]
    pub fn summary(&self) -> Option<LatencySummary> {
        let as_us = |d: Duration| u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
        Some(LatencySummary {
            samples: self.sample_count(),
            avg_us: as_us(self.average()?),
            p50_us: as_us(self.percentile(0.50)?),
            p95_us: as_us(self.percentile(0.95)?),
        })
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
