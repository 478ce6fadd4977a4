//! Stash Manager
//!
//! The directory of named stashes. The manager exclusively owns every
//! stash, enforces the global stash cap, and owns the default stash that
//! commands without a `NAME` argument target. Stashes are constructed
//! directly with their collaborators passed in. No registry, no globals.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::replication::ReplicationFanout;
use crate::snapshot::SnapshotScheduler;
use crate::stash::keyspace::{Keyspace, MappedStore, ShardedMap};
use crate::stash::{Stash, MAX_NAME_LENGTH};

/// Name of the stash used when a command doesn't specify one.
pub const DEFAULT_STASH_NAME: &str = "default";

/// Maximum number of stashes that can exist at once.
pub const MAX_NUM_STASHES: usize = 100;

/// Whether the default stash stores its values off-heap.
pub const DEFAULT_STASH_OFF_HEAP: bool = true;

/// Key limit of the default stash.
pub const DEFAULT_STASH_MAX_KEYS: u64 = crate::stash::DEFAULT_MAX_KEY_COUNT;

/// Errors from manager operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("stash name exceeds the max length of {MAX_NAME_LENGTH} characters")]
    NameTooLong,

    #[error("max number of stashes reached")]
    TooManyStashes,

    #[error("cannot drop the default stash")]
    CannotDropDefault,

    #[error("internal error: {0}")]
    Internal(String),
}

/// The directory of all stashes.
pub struct StashManager {
    stashes: RwLock<HashMap<String, Arc<Stash>>>,
    data_dir: PathBuf,
    fanout: Arc<ReplicationFanout>,
    snapshot_interval: Duration,
}

impl StashManager {
    /// Creates a manager with its default stash. Fails only if the default
    /// stash's backing store cannot be created.
    pub fn new(
        data_dir: PathBuf,
        fanout: Arc<ReplicationFanout>,
        snapshot_interval: Duration,
    ) -> Result<Self, ManagerError> {
        let manager = Self {
            stashes: RwLock::new(HashMap::new()),
            data_dir,
            fanout,
            snapshot_interval,
        };
        manager.create_stash(
            DEFAULT_STASH_NAME,
            DEFAULT_STASH_OFF_HEAP,
            DEFAULT_STASH_MAX_KEYS,
        )?;
        Ok(manager)
    }

    /// Creates a stash. Does nothing if the name is already taken.
    pub fn create_stash(
        &self,
        name: &str,
        off_heap: bool,
        max_key_count: u64,
    ) -> Result<(), ManagerError> {
        if name.len() > MAX_NAME_LENGTH {
            return Err(ManagerError::NameTooLong);
        }

        let mut stashes = self.stashes.write().unwrap();
        if stashes.contains_key(name) {
            return Ok(());
        }
        if stashes.len() >= MAX_NUM_STASHES {
            return Err(ManagerError::TooManyStashes);
        }

        let keyspace = if off_heap {
            Keyspace::OffHeap(
                MappedStore::open(&self.data_dir, name)
                    .map_err(|e| ManagerError::Internal(e.to_string()))?,
            )
        } else {
            Keyspace::OnHeap(ShardedMap::new())
        };

        let stash = Arc::new(Stash::new(
            name,
            max_key_count,
            off_heap,
            keyspace,
            Arc::clone(&self.fanout),
            self.data_dir.clone(),
        ));
        stash.attach_scheduler(SnapshotScheduler::start(
            Arc::clone(&stash),
            self.snapshot_interval,
        ));
        stashes.insert(name.to_string(), stash);

        info!(stash = %name, off_heap, max_key_count, "Created stash");
        Ok(())
    }

    /// Looks up a stash by name.
    pub fn get_stash(&self, name: &str) -> Option<Arc<Stash>> {
        self.stashes.read().unwrap().get(name).cloned()
    }

    pub fn contains_stash(&self, name: &str) -> bool {
        self.stashes.read().unwrap().contains_key(name)
    }

    /// Drops a stash: removes it from the directory, closes its backing
    /// store, and deletes its snapshot files. Dropping a name that doesn't
    /// exist does nothing. The default stash cannot be dropped.
    pub fn drop_stash(&self, name: &str) -> Result<(), ManagerError> {
        if name == DEFAULT_STASH_NAME {
            return Err(ManagerError::CannotDropDefault);
        }

        let removed = self.stashes.write().unwrap().remove(name);
        if let Some(stash) = removed {
            stash.destroy();
            info!(stash = %name, "Dropped stash");
        }
        Ok(())
    }

    /// Sweeps every stash's TTL index, removing due keys. Returns the
    /// total number of keys expired.
    pub fn expire_ttl_keys(&self) -> usize {
        let mut expired = 0;
        for stash in self.all_stashes() {
            // A stash closed mid-sweep just reports zero.
            expired += stash.expire_due().unwrap_or(0);
        }
        expired
    }

    /// Number of active stashes.
    pub fn num_stashes(&self) -> usize {
        self.stashes.read().unwrap().len()
    }

    /// Snapshot of the current stash set.
    pub fn all_stashes(&self) -> Vec<Arc<Stash>> {
        self.stashes.read().unwrap().values().cloned().collect()
    }

    pub fn fanout(&self) -> &Arc<ReplicationFanout> {
        &self.fanout
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Closes every stash after a final best-effort snapshot of the dirty
    /// ones. Called once by the process shutdown routine.
    pub async fn shutdown(&self) {
        let stashes: Vec<Arc<Stash>> = self.stashes.write().unwrap().drain().map(|(_, s)| s).collect();

        for stash in stashes {
            if stash.backup_needed() {
                if let Err(e) = crate::snapshot::write_snapshot(&stash).await {
                    debug!(stash = %stash.name(), error = %e, "Final snapshot failed");
                }
            }
            stash.close();
        }
    }
}
