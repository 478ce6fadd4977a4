//! TTL Time Wheel
//!
//! A bucketed expiration index. Each entry maps a key to its absolute
//! expiration time in epoch milliseconds; entries are additionally grouped
//! into fixed-width time buckets so that "expire everything due now" only
//! touches the buckets at or before the current time instead of scanning the
//! whole index.
//!
//! The wheel is shared by all stripe owners of a stash, so it keeps one
//! coarse internal lock. The lock is only ever held for index bookkeeping,
//! never across keyspace operations.
//!
//! ## Accuracy
//!
//! Buckets are `BUCKET_WIDTH_MS` wide. `is_expired` always consults the
//! exact expiration time, so reads are precise; only the sweep batches by
//! bucket. A key whose TTL is replaced leaves a stale entry in its old
//! bucket, which the sweep revalidates against the exact map and skips.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Width of one expiration bucket.
pub const BUCKET_WIDTH_MS: u64 = 100;

/// Maximum number of keys removed by a single `expire_due` call. Keeps the
/// sweep latency bounded when a large batch of keys expires at once.
pub const MAX_EXPIRE_BATCH: usize = 1000;

/// Returns the current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct Inner {
    /// Exact expiration time per key.
    expirations: HashMap<String, u64>,
    /// Keys grouped by expiration bucket. May hold stale entries for keys
    /// whose TTL was replaced or removed; the sweep revalidates.
    buckets: BTreeMap<u64, Vec<String>>,
}

/// A bucketed index of key expirations.
#[derive(Debug, Default)]
pub struct TtlTimeWheel {
    inner: Mutex<Inner>,
}

impl TtlTimeWheel {
    /// Creates an empty time wheel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a TTL entry for `key` expiring `ttl_ms` from now. Replaces any
    /// existing entry for the key.
    pub fn add(&self, key: &str, ttl_ms: u64) {
        let expires_at = now_ms().saturating_add(ttl_ms);
        let bucket = expires_at / BUCKET_WIDTH_MS;

        let mut inner = self.inner.lock().unwrap();
        inner.expirations.insert(key.to_string(), expires_at);
        inner.buckets.entry(bucket).or_default().push(key.to_string());
    }

    /// Removes the TTL entry for `key`, if any. The bucket entry is left to
    /// be skipped by a later sweep.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.expirations.remove(key);
    }

    /// Returns true if `key` has a TTL entry that is due.
    ///
    /// A key without an entry never expires.
    pub fn is_expired(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .expirations
            .get(key)
            .is_some_and(|&expires_at| expires_at <= now_ms())
    }

    /// Returns the absolute expiration time of `key` in epoch milliseconds,
    /// or 0 if the key has no TTL. Used by the snapshot writer.
    pub fn expiration_of(&self, key: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.expirations.get(key).copied().unwrap_or(0)
    }

    /// Removes and returns all due keys, at most [`MAX_EXPIRE_BATCH`] per
    /// call. Callers delete the returned keys from the keyspace.
    pub fn expire_due(&self) -> Vec<String> {
        let now = now_ms();
        let current_bucket = now / BUCKET_WIDTH_MS;
        let mut expired = Vec::new();

        let mut inner = self.inner.lock().unwrap();
        let due_buckets: Vec<u64> = inner
            .buckets
            .range(..=current_bucket)
            .map(|(&bucket, _)| bucket)
            .collect();

        for bucket in due_buckets {
            if expired.len() >= MAX_EXPIRE_BATCH {
                break;
            }

            let mut keys = match inner.buckets.remove(&bucket) {
                Some(keys) => keys,
                None => continue,
            };

            while let Some(key) = keys.pop() {
                // Skip entries whose TTL was since replaced or removed.
                match inner.expirations.get(&key).copied() {
                    Some(expires_at) if expires_at <= now => {
                        inner.expirations.remove(&key);
                        expired.push(key);
                    }
                    Some(expires_at) => {
                        // Re-bucket: the key now expires later.
                        let new_bucket = expires_at / BUCKET_WIDTH_MS;
                        if new_bucket != bucket {
                            inner.buckets.entry(new_bucket).or_default().push(key);
                        } else {
                            // Same bucket but not yet due (sub-bucket
                            // accuracy); put it back for the next sweep.
                            inner.buckets.entry(bucket).or_default().push(key);
                        }
                    }
                    None => {}
                }

                if expired.len() >= MAX_EXPIRE_BATCH {
                    // Return the rest of this bucket for the next sweep.
                    if !keys.is_empty() {
                        inner.buckets.entry(bucket).or_default().append(&mut keys);
                    }
                    break;
                }
            }
        }

        expired
    }

    /// Returns the number of live TTL entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().expirations.len()
    }

    /// Returns true if the wheel holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
