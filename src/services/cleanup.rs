//! Best-effort removal of staged parts and partially written artifacts.
//!
//! Nothing here returns an error: a file that cannot be removed is logged
//! and skipped so the failure that triggered the cleanup is the one the
//! caller reports.

use crate::services::part_store::part_prefix;
use std::{io::ErrorKind, path::Path};
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub parts_removed: usize,
    pub artifact_removed: bool,
}

/// Remove every staged part of `upload_id` in `staging_dir` and, when given,
/// the artifact at `final_path`.
pub async fn cleanup(
    upload_id: &str,
    staging_dir: &Path,
    final_path: Option<&Path>,
) -> CleanupReport {
    let parts_removed = remove_parts(upload_id, staging_dir).await;

    let artifact_removed = match final_path {
        Some(path) => match fs::remove_file(path).await {
            Ok(()) => {
                debug!("removed partial artifact {}", path.display());
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                warn!("failed to remove partial artifact {}: {}", path.display(), err);
                false
            }
        },
        None => false,
    };

    CleanupReport {
        parts_removed,
        artifact_removed,
    }
}

/// Remove the staged parts of `upload_id`, returning how many were deleted.
pub async fn remove_parts(upload_id: &str, staging_dir: &Path) -> usize {
    let prefix = part_prefix(upload_id);
    let mut entries = match fs::read_dir(staging_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return 0,
        Err(err) => {
            warn!(
                "failed to scan staging directory {}: {}",
                staging_dir.display(),
                err
            );
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!("failed to read {}: {}", staging_dir.display(), err);
                break;
            }
        };
        let owned = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(&prefix));
        if !owned {
            continue;
        }

        let path = entry.path();
        match fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove staged part {}: {}", path.display(), err),
        }
    }
    removed
}
