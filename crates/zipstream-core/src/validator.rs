//! Request validation: does the requested archive exist?
//!
//! Runs before any response head is produced so that a missing archive
//! becomes a clean 404 and no archiver is ever started for it.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};
use crate::identifier::ArchiveId;

/// A validated request for an existing archive directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub id: ArchiveId,
    /// `base_dir/<id>`.
    pub path: PathBuf,
}

/// Returns `true` if `base_dir/<id>` exists and is a directory.
///
/// Read-only; any metadata error counts as "does not exist".
pub async fn archive_exists(base_dir: &Path, id: &ArchiveId) -> bool {
    match tokio::fs::metadata(base_dir.join(id.as_str())).await {
        Ok(meta) => meta.is_dir(),
        Err(e) => {
            debug!(identifier = %id, error = %e, "archive lookup failed");
            false
        }
    }
}

/// Parse `raw` and confirm the archive exists.
pub async fn resolve(base_dir: &Path, raw: &str) -> ArchiveResult<ArchiveRequest> {
    let id = ArchiveId::parse(raw)?;
    if !archive_exists(base_dir, &id).await {
        return Err(ArchiveError::NotFound(id.to_string()));
    }
    Ok(ArchiveRequest {
        path: base_dir.join(id.as_str()),
        id,
    })
}
