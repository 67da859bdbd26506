// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use snapvol_fetch::progress::format_eta;
use snapvol_fetch::{EtaEstimator, Progress, ProgressSnapshot};
use snapvol_types::format_bytes;

/// Periodically log download progress until `stop` fires.
pub fn spawn(progress: Arc<Progress>, every: Duration, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut estimator = EtaEstimator::default();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = progress.snapshot();
                    let eta = estimator.update(&snapshot);
                    info!("{}", render(&snapshot, eta));
                }
            }
        }
    })
}

fn render(snapshot: &ProgressSnapshot, eta: Option<Duration>) -> String {
    let total = if snapshot.total_known {
        snapshot.discovered.to_string()
    } else {
        format!("{}+", snapshot.discovered)
    };
    let rate = if snapshot.elapsed.is_zero() {
        0
    } else {
        (snapshot.bytes as f64 / snapshot.elapsed.as_secs_f64()) as u64
    };
    format!(
        "{}/{} blocks ({:.1}%), {} written, {}/s, ETA {}",
        snapshot.completed,
        total,
        snapshot.percent(),
        format_bytes(snapshot.bytes),
        format_bytes(rate),
        format_eta(eta),
    )
}
