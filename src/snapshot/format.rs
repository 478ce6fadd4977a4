//! Snapshot File Format
//!
//! Binary, little-endian. One file per stash:
//!
//! ```text
//! MAGIC(4) | VERSION(2) | NAME_LEN(2) | NAME | MAX_KEYS(8) | OFF_HEAP(1)
//! then repeated until EOF:
//! KEY_LEN(4) KEY VAL_LEN(4) VAL EXPIRES_AT(8)
//! ```
//!
//! `EXPIRES_AT = 0` means no TTL. Writes go to `<dir>/<name>.snap.staging`;
//! a successful write commits by renaming the staging file over
//! `<dir>/<name>.snap`. A malformed trailing record truncates the restore
//! at that point; everything before it is kept.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// File magic: "SSTH".
pub const MAGIC: [u8; 4] = *b"SSTH";

/// Current format version.
pub const VERSION: u16 = 1;

/// Extension of a committed snapshot.
pub const SNAPSHOT_EXT: &str = "snap";

/// Errors raised while decoding a snapshot file.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("bad snapshot magic")]
    BadMagic,

    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(u16),

    #[error("snapshot record truncated")]
    Truncated,

    #[error("snapshot contains invalid UTF-8")]
    InvalidUtf8,
}

/// The fixed-size metadata record at the head of every snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub name: String,
    pub max_key_count: u64,
    pub off_heap: bool,
}

/// Path of the committed snapshot for `name`.
pub fn committed_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, SNAPSHOT_EXT))
}

/// Path of the staging file for `name`.
pub fn staging_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}.staging", name, SNAPSHOT_EXT))
}

/// Appends the metadata record to `buf`.
pub fn encode_metadata(buf: &mut Vec<u8>, meta: &SnapshotMeta) {
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(meta.name.len() as u16).to_le_bytes());
    buf.extend_from_slice(meta.name.as_bytes());
    buf.extend_from_slice(&meta.max_key_count.to_le_bytes());
    buf.push(meta.off_heap as u8);
}

/// Decodes the metadata record from the head of `buf`, returning it and the
/// number of bytes consumed.
pub fn decode_metadata(buf: &[u8]) -> Result<(SnapshotMeta, usize), FormatError> {
    if buf.len() < 8 {
        return Err(FormatError::Truncated);
    }
    if buf[0..4] != MAGIC {
        return Err(FormatError::BadMagic);
    }

    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let name_len = u16::from_le_bytes([buf[6], buf[7]]) as usize;
    let end = 8 + name_len + 8 + 1;
    if buf.len() < end {
        return Err(FormatError::Truncated);
    }

    let name = std::str::from_utf8(&buf[8..8 + name_len])
        .map_err(|_| FormatError::InvalidUtf8)?
        .to_string();
    let max_key_count = u64::from_le_bytes(
        buf[8 + name_len..8 + name_len + 8]
            .try_into()
            .expect("length checked"),
    );
    let off_heap = buf[end - 1] != 0;

    Ok((
        SnapshotMeta {
            name,
            max_key_count,
            off_heap,
        },
        end,
    ))
}

/// Appends one `(key, value, expires_at)` record to `buf`.
pub fn encode_record(buf: &mut Vec<u8>, key: &str, value: &str, expires_at: u64) {
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(&expires_at.to_le_bytes());
}

/// Decodes one record from the head of `buf`.
///
/// `Ok(None)` at clean EOF; [`FormatError::Truncated`] if bytes remain but
/// don't form a whole record.
pub fn decode_record(
    buf: &[u8],
) -> Result<Option<((String, String, u64), usize)>, FormatError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < 4 {
        return Err(FormatError::Truncated);
    }

    let key_len = u32::from_le_bytes(buf[0..4].try_into().expect("length checked")) as usize;
    let val_len_at = 4 + key_len;
    if buf.len() < val_len_at + 4 {
        return Err(FormatError::Truncated);
    }

    let val_len = u32::from_le_bytes(
        buf[val_len_at..val_len_at + 4]
            .try_into()
            .expect("length checked"),
    ) as usize;
    let expires_at_pos = val_len_at + 4 + val_len;
    let end = expires_at_pos + 8;
    if buf.len() < end {
        return Err(FormatError::Truncated);
    }

    let key = std::str::from_utf8(&buf[4..4 + key_len])
        .map_err(|_| FormatError::InvalidUtf8)?
        .to_string();
    let value = std::str::from_utf8(&buf[val_len_at + 4..val_len_at + 4 + val_len])
        .map_err(|_| FormatError::InvalidUtf8)?
        .to_string();
    let expires_at = u64::from_le_bytes(
        buf[expires_at_pos..end].try_into().expect("length checked"),
    );

    Ok(Some(((key, value, expires_at), end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SnapshotMeta {
        SnapshotMeta {
            name: "sessions".to_string(),
            max_key_count: 5000,
            off_heap: true,
        }
    }

    #[test]
    fn test_metadata_roundtrip() {
        let mut buf = Vec::new();
        encode_metadata(&mut buf, &meta());

        let (decoded, consumed) = decode_metadata(&buf).unwrap();
        assert_eq!(decoded, meta());
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_metadata_bad_magic() {
        let mut buf = Vec::new();
        encode_metadata(&mut buf, &meta());
        buf[0] = b'X';
        assert_eq!(decode_metadata(&buf), Err(FormatError::BadMagic));
    }

    #[test]
    fn test_metadata_unsupported_version() {
        let mut buf = Vec::new();
        encode_metadata(&mut buf, &meta());
        buf[4] = 99;
        assert_eq!(
            decode_metadata(&buf),
            Err(FormatError::UnsupportedVersion(99))
        );
    }

    #[test]
    fn test_metadata_truncated() {
        let mut buf = Vec::new();
        encode_metadata(&mut buf, &meta());
        buf.truncate(buf.len() - 1);
        assert_eq!(decode_metadata(&buf), Err(FormatError::Truncated));
    }

    #[test]
    fn test_record_roundtrip() {
        let mut buf = Vec::new();
        encode_record(&mut buf, "key", "value", 123_456);

        let ((key, value, expires_at), consumed) = decode_record(&buf).unwrap().unwrap();
        assert_eq!(key, "key");
        assert_eq!(value, "value");
        assert_eq!(expires_at, 123_456);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_record_clean_eof() {
        assert_eq!(decode_record(b"").unwrap(), None);
    }

    #[test]
    fn test_record_truncated_tail() {
        let mut buf = Vec::new();
        encode_record(&mut buf, "key", "value", 0);
        buf.truncate(buf.len() - 3);
        assert_eq!(decode_record(&buf), Err(FormatError::Truncated));
    }

    #[test]
    fn test_paths() {
        let dir = Path::new("/data");
        assert_eq!(
            committed_path(dir, "default"),
            PathBuf::from("/data/default.snap")
        );
        assert_eq!(
            staging_path(dir, "default"),
            PathBuf::from("/data/default.snap.staging")
        );
    }
}
