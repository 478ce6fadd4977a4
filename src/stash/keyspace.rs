//! Keyspace Storage Variants
//!
//! A stash's keyspace comes in two flavors behind the [`Keyspace`] enum:
//!
//! - [`ShardedMap`]: an on-heap map split across independent `RwLock`
//!   shards so readers and writers of different keys don't contend.
//! - [`MappedStore`]: an off-heap store that keeps values in a
//!   memory-mapped file pool, for working sets that shouldn't live on the
//!   process heap. The index (key → extent) stays on-heap; payload bytes
//!   live in the mapping.
//!
//! Both expose the same fallible API. The on-heap variant never fails; the
//! mapped variant returns [`StoreClosed`] once another thread has closed it,
//! which the stash layer surfaces to the client as a stash-closed error
//! instead of tearing down the connection.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use memmap2::MmapMut;
use thiserror::Error;

/// Number of shards in the on-heap keyspace.
const NUM_SHARDS: usize = 16;

/// Initial size of the mapped file pool.
const INITIAL_POOL_BYTES: u64 = 4 * 1024 * 1024;

/// The store was closed by another thread while this call was in flight.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("store was closed")]
pub struct StoreClosed;

/// Result type for keyspace operations.
pub type StoreResult<T> = Result<T, StoreClosed>;

/// Selects the shard or stripe for a key.
#[inline]
pub fn hash_index(key: &str, buckets: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % buckets
}

// ---------------------------------------------------------------------------
// On-heap variant
// ---------------------------------------------------------------------------

/// An on-heap keyspace sharded across independent locks.
#[derive(Debug)]
pub struct ShardedMap {
    shards: Vec<RwLock<HashMap<String, String>>>,
    len: AtomicU64,
}

impl Default for ShardedMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedMap {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            len: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &str) -> &RwLock<HashMap<String, String>> {
        &self.shards[hash_index(key, NUM_SHARDS)]
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.shard(key).read().unwrap().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shard(key).read().unwrap().contains_key(key)
    }

    /// Inserts or overwrites. Returns true if the key was new.
    pub fn insert(&self, key: &str, value: &str) -> bool {
        let mut shard = self.shard(key).write().unwrap();
        let is_new = shard.insert(key.to_string(), value.to_string()).is_none();
        if is_new {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        is_new
    }

    /// Removes the key. Returns true if it was present.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.shard(key).write().unwrap().remove(key).is_some();
        if removed {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clones out every entry, shard by shard. The view is fuzzy under
    /// concurrent mutation, which is what the snapshot writer wants.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(self.len() as usize);
        for shard in &self.shards {
            let shard = shard.read().unwrap();
            out.extend(shard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().unwrap().clear();
        }
        self.len.store(0, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Off-heap variant
// ---------------------------------------------------------------------------

/// Location of a record's bytes within the mapped pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    offset: u64,
    len: u64,
}

#[derive(Debug)]
struct PoolState {
    file: File,
    path: PathBuf,
    map: MmapMut,
    /// Key → extent of `key bytes ++ value bytes` in the pool.
    index: HashMap<String, (Extent, u32)>,
    /// Reusable holes left by removed or overwritten records.
    free: Vec<Extent>,
    /// Bump-allocation frontier.
    tail: u64,
}

/// An off-heap keyspace backed by a memory-mapped file pool.
///
/// Values are written as extents into the mapping; an on-heap index maps
/// each key to its extent. Freed extents go on a first-fit free list; when
/// neither the free list nor the tail has room, the file is grown and
/// remapped.
///
/// `close()` drops the mapping and deletes the pool file. Any call racing
/// with the close observes [`StoreClosed`].
#[derive(Debug)]
pub struct MappedStore {
    state: RwLock<Option<PoolState>>,
}

impl MappedStore {
    /// Creates the pool file at `<dir>/<name>.pages` and maps it.
    pub fn open(dir: &Path, name: &str) -> std::io::Result<Self> {
        let path = dir.join(format!("{}.pages", name));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(INITIAL_POOL_BYTES)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            state: RwLock::new(Some(PoolState {
                file,
                path,
                map,
                index: HashMap::new(),
                free: Vec::new(),
                tail: 0,
            })),
        })
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let state = self.state.read().unwrap();
        let state = state.as_ref().ok_or(StoreClosed)?;

        Ok(state.index.get(key).map(|&(extent, key_len)| {
            let start = extent.offset as usize + key_len as usize;
            let end = (extent.offset + extent.len) as usize;
            String::from_utf8_lossy(&state.map[start..end]).into_owned()
        }))
    }

    pub fn contains_key(&self, key: &str) -> StoreResult<bool> {
        let state = self.state.read().unwrap();
        let state = state.as_ref().ok_or(StoreClosed)?;
        Ok(state.index.contains_key(key))
    }

    /// Inserts or overwrites. Returns true if the key was new.
    pub fn insert(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut state = self.state.write().unwrap();
        let state = state.as_mut().ok_or(StoreClosed)?;

        let record_len = (key.len() + value.len()) as u64;
        let extent = Self::allocate(state, record_len).map_err(|_| StoreClosed)?;

        let start = extent.offset as usize;
        state.map[start..start + key.len()].copy_from_slice(key.as_bytes());
        state.map[start + key.len()..start + key.len() + value.len()]
            .copy_from_slice(value.as_bytes());

        let is_new = match state
            .index
            .insert(key.to_string(), (extent, key.len() as u32))
        {
            Some((old_extent, _)) => {
                state.free.push(old_extent);
                false
            }
            None => true,
        };
        Ok(is_new)
    }

    /// Removes the key. Returns true if it was present.
    pub fn remove(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.state.write().unwrap();
        let state = state.as_mut().ok_or(StoreClosed)?;

        match state.index.remove(key) {
            Some((extent, _)) => {
                state.free.push(extent);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn len(&self) -> StoreResult<u64> {
        let state = self.state.read().unwrap();
        let state = state.as_ref().ok_or(StoreClosed)?;
        Ok(state.index.len() as u64)
    }

    /// Clones out every entry for the snapshot writer.
    pub fn entries(&self) -> StoreResult<Vec<(String, String)>> {
        let state = self.state.read().unwrap();
        let state = state.as_ref().ok_or(StoreClosed)?;

        Ok(state
            .index
            .iter()
            .map(|(key, &(extent, key_len))| {
                let start = extent.offset as usize + key_len as usize;
                let end = (extent.offset + extent.len) as usize;
                (
                    key.clone(),
                    String::from_utf8_lossy(&state.map[start..end]).into_owned(),
                )
            })
            .collect())
    }

    /// Drops the mapping and deletes the pool file. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.write().unwrap();
        if let Some(state) = state.take() {
            let path = state.path.clone();
            drop(state);
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().unwrap().is_none()
    }

    /// Finds room for `len` bytes: first fit from the free list, then the
    /// bump frontier, growing the file when the frontier runs out.
    fn allocate(state: &mut PoolState, len: u64) -> std::io::Result<Extent> {
        if let Some(pos) = state.free.iter().position(|e| e.len >= len) {
            let hole = state.free.swap_remove(pos);
            if hole.len > len {
                state.free.push(Extent {
                    offset: hole.offset + len,
                    len: hole.len - len,
                });
            }
            return Ok(Extent {
                offset: hole.offset,
                len,
            });
        }

        let capacity = state.map.len() as u64;
        if state.tail + len > capacity {
            let mut new_capacity = capacity.max(INITIAL_POOL_BYTES);
            while state.tail + len > new_capacity {
                new_capacity *= 2;
            }
            state.file.set_len(new_capacity)?;
            state.map = unsafe { MmapMut::map_mut(&state.file)? };
        }

        let extent = Extent {
            offset: state.tail,
            len,
        };
        state.tail += len;
        Ok(extent)
    }
}

impl Drop for MappedStore {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Unified facade
// ---------------------------------------------------------------------------

/// A stash keyspace: one of the two storage variants behind a common API.
#[derive(Debug)]
pub enum Keyspace {
    OnHeap(ShardedMap),
    OffHeap(MappedStore),
}

impl Keyspace {
    pub fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match self {
            Keyspace::OnHeap(map) => Ok(map.get(key)),
            Keyspace::OffHeap(store) => store.get(key),
        }
    }

    pub fn contains_key(&self, key: &str) -> StoreResult<bool> {
        match self {
            Keyspace::OnHeap(map) => Ok(map.contains_key(key)),
            Keyspace::OffHeap(store) => store.contains_key(key),
        }
    }

    pub fn insert(&self, key: &str, value: &str) -> StoreResult<bool> {
        match self {
            Keyspace::OnHeap(map) => Ok(map.insert(key, value)),
            Keyspace::OffHeap(store) => store.insert(key, value),
        }
    }

    pub fn remove(&self, key: &str) -> StoreResult<bool> {
        match self {
            Keyspace::OnHeap(map) => Ok(map.remove(key)),
            Keyspace::OffHeap(store) => store.remove(key),
        }
    }

    pub fn len(&self) -> StoreResult<u64> {
        match self {
            Keyspace::OnHeap(map) => Ok(map.len()),
            Keyspace::OffHeap(store) => store.len(),
        }
    }

    pub fn entries(&self) -> StoreResult<Vec<(String, String)>> {
        match self {
            Keyspace::OnHeap(map) => Ok(map.entries()),
            Keyspace::OffHeap(store) => store.entries(),
        }
    }

    /// Releases backing resources. On-heap keyspaces just clear.
    pub fn close(&self) {
        match self {
            Keyspace::OnHeap(map) => map.clear(),
            Keyspace::OffHeap(store) => store.close(),
        }
    }
}
