//! PartStore: on-disk staging for chunk payloads awaiting reassembly.
//!
//! Layout beneath the staging root:
//!
//! ```text
//! {root}/{collection}/{upload_id}.part{index}   committed parts
//! {root}/{collection}/.incoming-{uuid}          payload still being received
//! ```
//!
//! Upload ids are restricted to `[A-Za-z0-9_-]`, so `{upload_id}.part` is a
//! prefix shared by exactly one upload's parts.

use crate::services::error::{IngestError, IngestResult};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

pub const PART_MARKER: &str = ".part";
pub const INCOMING_PREFIX: &str = ".incoming-";

/// Prefix shared by every staged part of `upload_id`.
pub fn part_prefix(upload_id: &str) -> String {
    format!("{upload_id}{PART_MARKER}")
}

/// Split a staged part file name into `(upload_id, index)`.
pub fn parse_part_name(file_name: &str) -> Option<(&str, u32)> {
    let (upload_id, index) = file_name.rsplit_once(PART_MARKER)?;
    if upload_id.is_empty() {
        return None;
    }
    index.parse().ok().map(|idx| (upload_id, idx))
}

/// A payload fully written to a temporary staging file but not yet
/// committed as a part.
#[derive(Debug)]
pub struct IncomingPart {
    path: PathBuf,
    size: u64,
}

impl IncomingPart {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Remove the temporary file. Best-effort.
    pub async fn discard(self) {
        if let Err(err) = fs::remove_file(&self.path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!("failed to discard {}: {}", self.path.display(), err);
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct PartStore {
    root: PathBuf,
}

impl PartStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging directory for one collection. Not created here.
    pub fn staging_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }

    pub fn part_path(&self, collection: &str, upload_id: &str, index: u32) -> PathBuf {
        self.staging_dir(collection)
            .join(format!("{}{}", part_prefix(upload_id), index))
    }

    /// Stream a payload into a temporary file in the collection's staging
    /// directory, creating the directory on first use.
    ///
    /// Rejects payloads larger than `limit` bytes. The temporary file is
    /// removed on every error path.
    pub async fn stage_incoming<S>(
        &self,
        collection: &str,
        stream: S,
        limit: u64,
    ) -> IngestResult<IncomingPart>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let dir = self.staging_dir(collection);
        fs::create_dir_all(&dir).await?;
        let tmp_path = dir.join(format!("{INCOMING_PREFIX}{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: u64 = 0;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(IngestError::Io(err));
                }
            };
            size += chunk.len() as u64;
            if size > limit {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(IngestError::ChunkTooLarge { limit });
            }
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(IngestError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(IngestError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(IngestError::Io(err));
        }

        Ok(IncomingPart {
            path: tmp_path,
            size,
        })
    }

    /// Move a staged payload into place as part `index` of `upload_id`,
    /// replacing any earlier submission of the same index.
    ///
    /// The rename makes the part appear whole or not at all.
    pub async fn commit(
        &self,
        collection: &str,
        incoming: IncomingPart,
        upload_id: &str,
        index: u32,
    ) -> IngestResult<PathBuf> {
        let part_path = self.part_path(collection, upload_id, index);
        if let Err(err) = fs::rename(&incoming.path, &part_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                let retried = match fs::remove_file(&part_path).await {
                    Ok(()) => fs::rename(&incoming.path, &part_path).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = retried {
                    incoming.discard().await;
                    return Err(IngestError::Io(err));
                }
            } else {
                incoming.discard().await;
                return Err(IngestError::Io(err));
            }
        }
        debug!(
            "staged part {} ({} bytes) at {}",
            index,
            incoming.size,
            part_path.display()
        );
        Ok(part_path)
    }

    /// Indices in `0..total` with no committed part.
    pub async fn missing_parts(
        &self,
        collection: &str,
        upload_id: &str,
        total: u32,
    ) -> IngestResult<Vec<u32>> {
        let present = self.list_parts(collection, upload_id).await?;
        Ok((0..total)
            .filter(|index| present.binary_search(index).is_err())
            .collect())
    }

    pub async fn open_part(
        &self,
        collection: &str,
        upload_id: &str,
        index: u32,
    ) -> IngestResult<File> {
        let path = self.part_path(collection, upload_id, index);
        Ok(File::open(&path).await?)
    }

    /// Indices of every committed part of `upload_id`, ascending.
    pub async fn list_parts(&self, collection: &str, upload_id: &str) -> IngestResult<Vec<u32>> {
        let dir = self.staging_dir(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(IngestError::Io(err)),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((owner, index)) = parse_part_name(name) {
                if owner == upload_id {
                    indices.push(index);
                }
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }
}
