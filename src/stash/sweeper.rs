//! Shared TTL Sweep Timer
//!
//! Active expiry counterpart to the lazy expiry done on access. Lazy expiry
//! alone leaks keys that are never touched again; this background task
//! periodically asks every stash's time wheel for its due keys and removes
//! them. Each sweep is bounded per stash by the wheel's batch limit, so a
//! mass expiration is spread over several ticks instead of one long stall.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::stash::StashManager;

/// Configuration for the TTL sweeper.
#[derive(Debug, Clone)]
pub struct TtlSweeperConfig {
    /// Interval between sweeps.
    pub interval: Duration,
}

impl Default for TtlSweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
        }
    }
}

/// A handle to the running sweep task. Dropping the handle stops it.
#[derive(Debug)]
pub struct TtlSweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl TtlSweeper {
    /// Starts the sweep task over every stash in the manager.
    pub fn start(manager: Arc<StashManager>, config: TtlSweeperConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sweeper_loop(manager, config, shutdown_rx));
        info!("TTL sweeper started");
        Self { shutdown_tx }
    }

    /// Stops the sweep task. Called automatically on drop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for TtlSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    manager: Arc<StashManager>,
    config: TtlSweeperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("TTL sweeper stopped");
                    return;
                }
            }
        }

        let expired = manager.expire_ttl_keys();
        if expired > 0 {
            debug!(expired, "TTL sweep removed keys");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicationFanout;
    use crate::stash::DEFAULT_STASH_NAME;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sweeper_removes_expired_keys() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(
            StashManager::new(
                dir.path().to_path_buf(),
                Arc::new(ReplicationFanout::new()),
                Duration::from_secs(60),
            )
            .unwrap(),
        );

        let stash = manager.get_stash(DEFAULT_STASH_NAME).unwrap();
        for i in 0..10 {
            stash
                .set_with_ttl(&format!("key{}", i), "v", 50, None)
                .unwrap();
        }
        stash.set("persistent", "v", None).unwrap();

        let _sweeper = TtlSweeper::start(
            Arc::clone(&manager),
            TtlSweeperConfig {
                interval: Duration::from_millis(20),
            },
        );

        tokio::time::sleep(Duration::from_millis(400)).await;

        // Only the persistent key survives, without any access driving
        // lazy expiry.
        assert_eq!(stash.len().unwrap(), 1);
        assert_eq!(
            stash.get("persistent", true).unwrap(),
            Some("v".to_string())
        );
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(
            StashManager::new(
                dir.path().to_path_buf(),
                Arc::new(ReplicationFanout::new()),
                Duration::from_secs(60),
            )
            .unwrap(),
        );
        let stash = manager.get_stash(DEFAULT_STASH_NAME).unwrap();

        {
            let _sweeper = TtlSweeper::start(
                Arc::clone(&manager),
                TtlSweeperConfig {
                    interval: Duration::from_millis(10),
                },
            );
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        stash.set_with_ttl("key", "v", 20, None).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // No sweeper running; the expired entry is still in the keyspace
        // until a non-read-only access reclaims it.
        assert_eq!(stash.len().unwrap(), 1);
        assert_eq!(stash.get("key", false).unwrap(), None);
        assert_eq!(stash.len().unwrap(), 0);
    }
}
