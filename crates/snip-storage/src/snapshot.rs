//! File snapshots of the in-memory backend.
//!
//! The file holds a single line: a JSON array with one object per link,
//!
//! ```json
//! [{"short_url":"AbC123xY","original_url":"https://example.com","user_id":[1,2]}]
//! ```
//!
//! Owners whose edge is soft-deleted are additionally listed under
//! `deleted_user_id`, which is omitted when empty.

use crate::memory::InMemoryBackend;
use serde::{Deserialize, Deserializer, Serialize};
use snip_core::{Result, StorageError, UserId};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// The short code. Restores also accept a full short URL here.
    pub short_url: String,
    pub original_url: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub user_id: Vec<UserId>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub deleted_user_id: Vec<UserId>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<UserId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<UserId>>::deserialize(deserializer)?.unwrap_or_default())
}

pub fn encode(entries: &[SnapshotEntry]) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(entries)
        .map_err(|e| StorageError::Snapshot(format!("failed to serialize snapshot: {e}")))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decodes the first line of a snapshot file. An empty file holds no entries.
pub fn decode(bytes: &[u8]) -> Result<Vec<SnapshotEntry>> {
    let line = bytes.split(|&b| b == b'\n').next().unwrap_or_default();
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    serde_json::from_slice(line)
        .map_err(|e| StorageError::Snapshot(format!("failed to parse snapshot: {e}")))
}

/// Writes every link of `backend` to `path`, replacing the file atomically.
///
/// Returns the number of entries written.
pub async fn save(backend: &InMemoryBackend, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let entries = backend.export_entries();
    let bytes = encode(&entries)?;

    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| io_error("write", &tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error("rename", path, e))?;

    info!(path = %path.display(), entries = entries.len(), "saved snapshot");
    Ok(entries.len())
}

/// Loads the links stored at `path` into `backend`.
///
/// A missing file is not an error and restores nothing. A file that fails to
/// parse or conflicts with links already in `backend` leaves it untouched.
pub async fn restore(backend: &InMemoryBackend, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no snapshot to restore");
            return Ok(0);
        }
        Err(e) => return Err(io_error("read", path, e)),
    };

    let restored = backend.import_entries(decode(&bytes)?)?;
    info!(path = %path.display(), entries = restored, "restored snapshot");
    Ok(restored)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> StorageError {
    StorageError::Snapshot(format!("failed to {action} {}: {err}", path.display()))
}
