// SPDX-License-Identifier: GPL-3.0-only

//! Download progress accounting
//!
//! Workers bump atomic counters; a reporter samples them periodically. The
//! total is only known once the listing has been exhausted, so the ETA is
//! computed against the blocks discovered so far until then.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Progress {
    discovered: AtomicU64,
    completed: AtomicU64,
    bytes: AtomicU64,
    listing_complete: AtomicBool,
    started: Instant,
}

/// Point-in-time view of [`Progress`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub discovered: u64,
    pub bytes: u64,
    pub total_known: bool,
    pub elapsed: Duration,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    pub fn new() -> Self {
        Self {
            discovered: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            listing_complete: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    pub fn add_discovered(&self, blocks: u64) {
        self.discovered.fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn complete_block(&self, bytes: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn mark_listing_complete(&self) {
        self.listing_complete.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            discovered: self.discovered.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            total_known: self.listing_complete.load(Ordering::Acquire),
            elapsed: self.started.elapsed(),
        }
    }
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        compute_progress_percent(self.completed, self.discovered)
    }

    /// Blocks per second since the download started
    pub fn throughput(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        self.completed as f64 / self.elapsed.as_secs_f64()
    }
}

/// Exponentially smoothed ETA tracker fed with periodic snapshots
#[derive(Debug, Default)]
pub struct EtaEstimator {
    rate: Option<f64>,
    last: Option<(u64, Duration)>,
}

impl EtaEstimator {
    const ALPHA: f64 = 0.3;

    pub fn update(&mut self, snapshot: &ProgressSnapshot) -> Option<Duration> {
        if let Some((completed, at)) = self.last {
            let dt = snapshot.elapsed.saturating_sub(at);
            if !dt.is_zero() {
                let sample = snapshot.completed.saturating_sub(completed) as f64 / dt.as_secs_f64();
                self.rate = Some(ewma_update(self.rate, sample, Self::ALPHA));
            }
        } else if snapshot.completed > 0 {
            self.rate = Some(snapshot.throughput());
        }
        self.last = Some((snapshot.completed, snapshot.elapsed));

        compute_eta_from_throughput(
            snapshot.completed,
            snapshot.discovered,
            self.rate.unwrap_or(0.0),
        )
    }
}

pub fn compute_progress_percent(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }

    let ratio = processed as f64 / total as f64;
    (ratio * 100.0).clamp(0.0, 100.0)
}

pub fn compute_eta_from_throughput(processed: u64, total: u64, per_sec: f64) -> Option<Duration> {
    if total == 0 || processed == 0 {
        return None;
    }

    if processed >= total {
        return Some(Duration::from_secs(0));
    }

    if per_sec <= 0.0 {
        return None;
    }

    let remaining = (total - processed) as f64;
    Some(Duration::from_secs_f64((remaining / per_sec).max(0.0)))
}

pub fn ewma_update(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    let alpha = alpha.clamp(0.0, 1.0);
    match previous {
        Some(prev) => alpha * sample + (1.0 - alpha) * prev,
        None => sample,
    }
}

pub fn format_eta(eta: Option<Duration>) -> String {
    let Some(eta) = eta else {
        return "--:--:--".to_string();
    };

    let total_secs = eta.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
