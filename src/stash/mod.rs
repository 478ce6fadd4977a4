//! Stash Engine
//!
//! A stash is a single named table: a keyspace, a TTL index, and a capacity
//! policy. This module provides the unified, locked facade over the two
//! keyspace variants plus the manager that owns every stash.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Stash                              │
//! │   stripe locks (16)      keyspace          ttl wheel      │
//! │  ┌──┐┌──┐┌──┐ ... ┌──┐  ┌──────────┐    ┌─────────────┐   │
//! │  │m0││m1││m2│     │mF│  │ on-heap  │    │ exact map + │   │
//! │  └──┘└──┘└──┘     └──┘  │ shards / │    │ time wheel  │   │
//! │    hash(key) % 16       │ mmap pool│    │  (1 lock)   │   │
//! │                         └──────────┘    └─────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutation and every lazy-expiry action takes its key's stripe lock,
//! giving per-key linearizability without per-key lock overhead. Reads of
//! live keys go straight to the concurrent keyspace; a read that observes
//! expiration re-checks under the stripe lock before deleting anything.
//!
//! Replication ordering also hangs off the stripe lock: a write forwards
//! its wire frame to the follower sinks while the lock is still held, so
//! followers see each key's mutations in the leader's order.

pub mod keyspace;
pub mod manager;
pub mod sweeper;

pub use keyspace::{Keyspace, MappedStore, ShardedMap, StoreClosed};
pub use manager::{StashManager, DEFAULT_STASH_NAME, MAX_NUM_STASHES};
pub use sweeper::{TtlSweeper, TtlSweeperConfig};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::replication::ReplicationFanout;
use crate::snapshot::{self, SnapshotScheduler};
use crate::ttl::{now_ms, TtlTimeWheel};

/// Max key length in bytes.
pub const MAX_KEY_LENGTH: usize = 256;
/// Max value length in bytes.
pub const MAX_VALUE_LENGTH: usize = 65_536;
/// Max length of a stash's name in characters.
pub const MAX_NAME_LENGTH: usize = 64;
/// Key count for stashes created without an explicit limit.
pub const DEFAULT_MAX_KEY_COUNT: u64 = 1_000_000;
/// Number of stripe locks per stash.
const STRIPE_COUNT: usize = 16;

/// Errors surfaced by stash operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StashError {
    /// The stash's backing store was closed by a concurrent drop or
    /// shutdown. The current caller gets this error; other stashes and
    /// connections are unaffected.
    #[error("stash is closed")]
    Closed,

    /// Insert of a new key into a stash already at `max_key_count`.
    #[error("stash is at max capacity")]
    CapacityFull,

    #[error("key exceeds the max length of {MAX_KEY_LENGTH} bytes")]
    KeyTooLong,

    #[error("value exceeds the max length of {MAX_VALUE_LENGTH} bytes")]
    ValueTooLong,
}

impl From<StoreClosed> for StashError {
    fn from(_: StoreClosed) -> Self {
        StashError::Closed
    }
}

/// A named table of key-value pairs with optional per-key TTL.
pub struct Stash {
    name: String,
    max_key_count: u64,
    off_heap: bool,
    keyspace: Keyspace,
    ttl: TtlTimeWheel,
    stripes: Vec<Mutex<()>>,
    closed: AtomicBool,
    backup_dirty: AtomicBool,
    /// Leader-side follower sinks, shared with the manager. Empty on
    /// followers and on stashes that never replicate.
    fanout: Arc<ReplicationFanout>,
    /// Directory holding this stash's snapshot file pair.
    data_dir: PathBuf,
    scheduler: Mutex<Option<SnapshotScheduler>>,
}

impl std::fmt::Debug for Stash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stash")
            .field("name", &self.name)
            .field("max_key_count", &self.max_key_count)
            .field("off_heap", &self.off_heap)
            .finish()
    }
}

impl Stash {
    /// Creates a stash over the given keyspace. Snapshot scheduling is
    /// attached separately by the manager via [`Stash::attach_scheduler`].
    pub fn new(
        name: impl Into<String>,
        max_key_count: u64,
        off_heap: bool,
        keyspace: Keyspace,
        fanout: Arc<ReplicationFanout>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            name: name.into(),
            max_key_count,
            off_heap,
            keyspace,
            ttl: TtlTimeWheel::new(),
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect(),
            closed: AtomicBool::new(false),
            backup_dirty: AtomicBool::new(false),
            fanout,
            data_dir,
            scheduler: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_key_count(&self) -> u64 {
        self.max_key_count
    }

    pub fn is_off_heap(&self) -> bool {
        self.off_heap
    }

    #[inline]
    fn stripe(&self, key: &str) -> &Mutex<()> {
        &self.stripes[keyspace::hash_index(key, STRIPE_COUNT)]
    }

    fn check_open(&self) -> Result<(), StashError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StashError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_key(key: &str) -> Result<(), StashError> {
        if key.len() > MAX_KEY_LENGTH {
            Err(StashError::KeyTooLong)
        } else {
            Ok(())
        }
    }

    fn check_value(value: &str) -> Result<(), StashError> {
        if value.len() > MAX_VALUE_LENGTH {
            Err(StashError::ValueTooLong)
        } else {
            Ok(())
        }
    }

    /// Rejects an insert of a new key into a full stash. Overwrites of
    /// present keys always pass.
    fn check_capacity(&self, key: &str) -> Result<(), StashError> {
        if !self.keyspace.contains_key(key)? && self.keyspace.len()? >= self.max_key_count {
            return Err(StashError::CapacityFull);
        }
        Ok(())
    }

    /// Inserts or overwrites `key`. An existing live TTL on the key is
    /// preserved; a stale entry left by an already-expired TTL is cleared so
    /// the new value doesn't inherit a dead expiration.
    pub fn set(&self, key: &str, value: &str, propagate: Option<&Bytes>) -> Result<(), StashError> {
        self.check_open()?;
        Self::check_key(key)?;
        Self::check_value(value)?;

        let _guard = self.stripe(key).lock().unwrap();
        if self.ttl.is_expired(key) {
            self.ttl.remove(key);
        }
        self.check_capacity(key)?;
        self.keyspace.insert(key, value)?;
        self.mark_backup_needed();
        self.forward(propagate);
        Ok(())
    }

    /// Inserts or overwrites `key` and sets its expiration to now +
    /// `ttl_ms`, replacing any existing TTL.
    pub fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
        propagate: Option<&Bytes>,
    ) -> Result<(), StashError> {
        self.check_open()?;
        Self::check_key(key)?;
        Self::check_value(value)?;

        let _guard = self.stripe(key).lock().unwrap();
        self.check_capacity(key)?;
        self.keyspace.insert(key, value)?;
        self.ttl.add(key, ttl_ms);
        self.mark_backup_needed();
        self.forward(propagate);
        Ok(())
    }

    /// Returns the value for `key` if present and not expired.
    ///
    /// An expired key read through a non-read-only entry point is lazily
    /// removed (double-checked under the stripe lock). Read-only callers
    /// observe absence without mutating anything, so the expired entry
    /// stays for the leader's write path to reclaim.
    pub fn get(&self, key: &str, read_only: bool) -> Result<Option<String>, StashError> {
        self.check_open()?;

        if !self.ttl.is_expired(key) {
            return Ok(self.keyspace.get(key)?);
        }

        if !read_only {
            let _guard = self.stripe(key).lock().unwrap();
            if self.ttl.is_expired(key) {
                self.ttl.remove(key);
                self.keyspace.remove(key)?;
                self.mark_backup_needed();
                debug!(stash = %self.name, key = %key, "Lazy removed expired key");
            }
        }

        Ok(None)
    }

    /// Removes `key` and its TTL entry.
    pub fn delete(&self, key: &str, propagate: Option<&Bytes>) -> Result<(), StashError> {
        self.check_open()?;

        let _guard = self.stripe(key).lock().unwrap();
        self.keyspace.remove(key)?;
        self.ttl.remove(key);
        self.mark_backup_needed();
        self.forward(propagate);
        Ok(())
    }

    /// Sets the expiration of an existing key. Returns false if the key is
    /// absent; nothing is forwarded to followers in that case.
    pub fn update_ttl(
        &self,
        key: &str,
        ttl_ms: u64,
        propagate: Option<&Bytes>,
    ) -> Result<bool, StashError> {
        self.check_open()?;

        let _guard = self.stripe(key).lock().unwrap();
        if !self.keyspace.contains_key(key)? {
            return Ok(false);
        }
        self.ttl.add(key, ttl_ms);
        self.mark_backup_needed();
        self.forward(propagate);
        Ok(true)
    }

    /// Removes a batch of due keys found by the time wheel. Called by the
    /// shared TTL sweep timer.
    pub fn expire_due(&self) -> Result<usize, StashError> {
        self.check_open()?;

        let expired = self.ttl.expire_due();
        for key in &expired {
            let _guard = self.stripe(key).lock().unwrap();
            self.keyspace.remove(key)?;
        }

        if !expired.is_empty() {
            self.mark_backup_needed();
            debug!(stash = %self.name, count = expired.len(), "Expired keys");
        }
        Ok(expired.len())
    }

    /// Number of keys currently stored, including not-yet-reclaimed
    /// expired ones.
    pub fn len(&self) -> Result<u64, StashError> {
        Ok(self.keyspace.len()?)
    }

    pub fn is_empty(&self) -> Result<bool, StashError> {
        Ok(self.len()? == 0)
    }

    /// Multi-line summary served by the INFO command.
    pub fn info(&self) -> Result<String, StashError> {
        Ok(format!(
            "Name: {}\nNumber of keys: {}\nMax keys: {}\nOff-heap: {}",
            self.name,
            self.keyspace.len()?,
            self.max_key_count,
            self.off_heap
        ))
    }

    /// A fuzzy point-in-time view of the keyspace for the snapshot writer:
    /// `(key, value, expires_at_epoch_ms_or_zero)` triples. Concurrent
    /// mutations may or may not be observed.
    pub fn snapshot_entries(&self) -> Result<Vec<(String, String, u64)>, StashError> {
        self.check_open()?;

        Ok(self
            .keyspace
            .entries()?
            .into_iter()
            .map(|(key, value)| {
                let expires_at = self.ttl.expiration_of(&key);
                (key, value, expires_at)
            })
            .collect())
    }

    /// Loads one restored snapshot record, recomputing the remaining TTL.
    /// Records whose expiration already passed are skipped.
    pub fn restore_entry(
        &self,
        key: &str,
        value: &str,
        expires_at: u64,
    ) -> Result<(), StashError> {
        if expires_at == 0 {
            self.set(key, value, None)
        } else {
            let now = now_ms();
            if expires_at <= now {
                return Ok(());
            }
            self.set_with_ttl(key, value, expires_at - now, None)
        }
    }

    /// Flags that a write happened since the last committed snapshot.
    pub fn mark_backup_needed(&self) {
        self.backup_dirty.store(true, Ordering::Release);
    }

    pub fn clear_backup_needed(&self) {
        self.backup_dirty.store(false, Ordering::Release);
    }

    pub fn backup_needed(&self) -> bool {
        self.backup_dirty.load(Ordering::Acquire)
    }

    /// Hands the stash its periodic snapshot task. Called once by the
    /// manager right after construction.
    pub fn attach_scheduler(&self, scheduler: SnapshotScheduler) {
        *self.scheduler.lock().unwrap() = Some(scheduler);
    }

    /// Directory holding this stash's snapshot file pair.
    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    #[inline]
    fn forward(&self, propagate: Option<&Bytes>) {
        if let Some(frame) = propagate {
            self.fanout.forward(frame);
        }
    }

    /// Stops the snapshot scheduler and closes the keyspace. In-flight
    /// operations observe [`StashError::Closed`]. Idempotent; committed
    /// snapshot files stay on disk.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(scheduler) = self.scheduler.lock().unwrap().take() {
            scheduler.stop();
        }
        self.keyspace.close();
    }

    /// Close plus removal of the snapshot file pair. Used by DROP.
    pub fn destroy(&self) {
        self.close();
        snapshot::delete_snapshot_files(&self.data_dir, &self.name);
    }
}
