//! Snapshot Reader
//!
//! Restores stashes from committed snapshot files at startup. For each
//! `<name>.snap` in the data directory: read the metadata, create the stash
//! through the manager, and insert every record under its remaining TTL
//! (records whose absolute expiration already passed are skipped). A
//! malformed or truncated record stops the restore of that file; entries
//! loaded before it are kept. Stashes without a committed file start empty.

use std::io;
use std::path::Path;

use tokio::fs;
use tracing::{info, warn};

use crate::snapshot::format::{self, FormatError, SNAPSHOT_EXT};
use crate::stash::StashManager;

/// Restores every committed snapshot in `dir`. Returns the number of
/// snapshot files restored (fully or partially).
pub async fn restore_all(manager: &StashManager, dir: &Path) -> io::Result<usize> {
    let mut restored = 0;
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
            continue;
        }

        match restore_file(manager, &path).await {
            Ok(loaded) => {
                info!(file = %path.display(), entries = loaded, "Restored snapshot");
                restored += 1;
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Skipping unreadable snapshot");
            }
        }
    }

    Ok(restored)
}

/// Restores one snapshot file. Returns the number of entries loaded.
async fn restore_file(manager: &StashManager, path: &Path) -> io::Result<usize> {
    let bytes = fs::read(path).await?;

    let (meta, mut offset) =
        format::decode_metadata(&bytes).map_err(|e| io::Error::other(e.to_string()))?;

    manager
        .create_stash(&meta.name, meta.off_heap, meta.max_key_count)
        .map_err(|e| io::Error::other(e.to_string()))?;
    let stash = manager
        .get_stash(&meta.name)
        .ok_or_else(|| io::Error::other("stash vanished during restore"))?;

    let mut loaded = 0;
    loop {
        match format::decode_record(&bytes[offset..]) {
            Ok(Some(((key, value, expires_at), n))) => {
                offset += n;
                if let Err(e) = stash.restore_entry(&key, &value, expires_at) {
                    warn!(stash = %meta.name, key = %key, error = %e, "Skipping snapshot entry");
                    continue;
                }
                loaded += 1;
            }
            Ok(None) => break,
            Err(FormatError::Truncated) => {
                warn!(
                    stash = %meta.name,
                    offset,
                    "Truncated snapshot record, keeping entries loaded so far"
                );
                break;
            }
            Err(e) => {
                warn!(stash = %meta.name, offset, error = %e, "Malformed snapshot record, stopping restore");
                break;
            }
        }
    }

    // The restored state is exactly what's on disk; don't re-snapshot it.
    stash.clear_backup_needed();
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicationFanout;
    use crate::snapshot::writer::write_snapshot;
    use crate::stash::{Keyspace, ShardedMap, Stash};
    use crate::ttl::now_ms;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn manager_in(dir: &Path) -> StashManager {
        StashManager::new(
            dir.to_path_buf(),
            Arc::new(ReplicationFanout::new()),
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let stash = Stash::new(
            "restored",
            100,
            false,
            Keyspace::OnHeap(ShardedMap::new()),
            Arc::new(ReplicationFanout::new()),
            dir.path().to_path_buf(),
        );
        stash.set("plain", "v1", None).unwrap();
        stash.set_with_ttl("ttl", "v2", 600_000, None).unwrap();
        write_snapshot(&stash).await.unwrap();

        let manager = manager_in(dir.path()).await;
        let restored = restore_all(&manager, dir.path()).await.unwrap();
        assert_eq!(restored, 1);

        let stash = manager.get_stash("restored").unwrap();
        assert_eq!(stash.max_key_count(), 100);
        assert_eq!(stash.get("plain", false).unwrap(), Some("v1".to_string()));
        assert_eq!(stash.get("ttl", false).unwrap(), Some("v2".to_string()));
        assert!(!stash.backup_needed());
    }

    #[tokio::test]
    async fn test_restore_skips_already_expired_entries() {
        let dir = tempdir().unwrap();

        // Hand-build a snapshot with one live and one long-dead entry.
        let mut buf = Vec::new();
        format::encode_metadata(
            &mut buf,
            &format::SnapshotMeta {
                name: "mixed".to_string(),
                max_key_count: 100,
                off_heap: false,
            },
        );
        format::encode_record(&mut buf, "live", "v", now_ms() + 600_000);
        format::encode_record(&mut buf, "dead", "v", now_ms().saturating_sub(1000));
        std::fs::write(format::committed_path(dir.path(), "mixed"), &buf).unwrap();

        let manager = manager_in(dir.path()).await;
        restore_all(&manager, dir.path()).await.unwrap();

        let stash = manager.get_stash("mixed").unwrap();
        assert_eq!(stash.get("live", false).unwrap(), Some("v".to_string()));
        assert_eq!(stash.get("dead", false).unwrap(), None);
        assert_eq!(stash.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_restore_keeps_entries_before_truncation() {
        let dir = tempdir().unwrap();

        let mut buf = Vec::new();
        format::encode_metadata(
            &mut buf,
            &format::SnapshotMeta {
                name: "torn".to_string(),
                max_key_count: 100,
                off_heap: false,
            },
        );
        format::encode_record(&mut buf, "first", "v1", 0);
        format::encode_record(&mut buf, "second", "v2", 0);
        // Tear the last record in half.
        buf.truncate(buf.len() - 5);
        std::fs::write(format::committed_path(dir.path(), "torn"), &buf).unwrap();

        let manager = manager_in(dir.path()).await;
        let restored = restore_all(&manager, dir.path()).await.unwrap();
        assert_eq!(restored, 1);

        let stash = manager.get_stash("torn").unwrap();
        assert_eq!(stash.get("first", false).unwrap(), Some("v1".to_string()));
        assert_eq!(stash.get("second", false).unwrap(), None);
    }

    #[tokio::test]
    async fn test_restore_ignores_staging_and_foreign_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("leftover.snap.staging"), b"junk").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"junk").unwrap();

        let manager = manager_in(dir.path()).await;
        let restored = restore_all(&manager, dir.path()).await.unwrap();
        assert_eq!(restored, 0);
    }

    #[tokio::test]
    async fn test_restore_with_no_snapshots_starts_empty() {
        let dir = tempdir().unwrap();
        let manager = manager_in(dir.path()).await;
        assert_eq!(restore_all(&manager, dir.path()).await.unwrap(), 0);
        // Only the default stash exists.
        assert_eq!(manager.num_stashes(), 1);
    }
}
