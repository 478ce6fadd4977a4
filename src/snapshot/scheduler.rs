//! Snapshot Scheduler
//!
//! One single-threaded periodic task per stash. Each tick checks the
//! stash's backup-dirty flag and invokes the writer only if a write
//! happened since the last committed snapshot. An I/O failure leaves the
//! flag set, so the next tick retries.
//!
//! Shutdown is cooperative: `stop()` (or dropping the handle) signals the
//! task, and the final tick is not guaranteed to complete before process
//! exit; the server takes its own best-effort snapshot at shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::snapshot::writer::write_snapshot;
use crate::stash::Stash;

/// Fixed delay between snapshot ticks when none is configured.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// A handle to a stash's periodic snapshot task.
///
/// Dropping the handle stops the task.
#[derive(Debug)]
pub struct SnapshotScheduler {
    shutdown_tx: watch::Sender<bool>,
}

impl SnapshotScheduler {
    /// Starts the periodic task for `stash` with the given fixed delay.
    pub fn start(stash: Arc<Stash>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(scheduler_loop(stash, interval, shutdown_rx));
        Self { shutdown_tx }
    }

    /// Stops the task. Called automatically on drop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for SnapshotScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn scheduler_loop(
    stash: Arc<Stash>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!(stash = %stash.name(), "Snapshot scheduler stopped");
                    return;
                }
            }
        }

        if !stash.backup_needed() {
            continue;
        }

        match write_snapshot(&stash).await {
            Ok(()) => stash.clear_backup_needed(),
            Err(e) => {
                // Dirty flag stays set; the next tick retries.
                info!(stash = %stash.name(), error = %e, "Snapshot failed");
            }
        }
    }
}
