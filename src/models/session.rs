//! Represents an in-flight chunked upload.

use crate::models::chunk::FinalizedArtifact;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;

/// Identifies an upload: the client's `uploadId` scoped to its collection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub collection: String,
    pub upload_id: String,
}

impl SessionKey {
    pub fn new(collection: impl Into<String>, upload_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            upload_id: upload_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.upload_id)
    }
}

/// Lifecycle state of an upload session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Chunks are still arriving.
    Receiving,
    /// Reassembly succeeded; kept so duplicate triggers can replay the result.
    Completed(FinalizedArtifact),
}

/// Short-lived record of an upload between its first chunk and its
/// reassembly or cleanup.
#[derive(Clone, Debug)]
pub struct UploadSession {
    pub key: SessionKey,

    /// Chunk count declared by the first chunk; later chunks must agree.
    pub total_chunks: u32,

    /// Indices staged so far.
    pub received: BTreeSet<u32>,

    pub created_at: DateTime<Utc>,

    /// Last time a chunk for this upload was seen.
    pub last_activity: DateTime<Utc>,

    pub state: SessionState,
}

impl UploadSession {
    pub fn new(key: SessionKey, total_chunks: u32, now: DateTime<Utc>) -> Self {
        Self {
            key,
            total_chunks,
            received: BTreeSet::new(),
            created_at: now,
            last_activity: now,
            state: SessionState::Receiving,
        }
    }

    /// The subset of `indices` this session recorded as received.
    pub fn received_among(&self, indices: &[u32]) -> Vec<u32> {
        indices
            .iter()
            .copied()
            .filter(|idx| self.received.contains(idx))
            .collect()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state, SessionState::Completed(_))
    }
}
