//! Represents chunk submissions and the outcome of receiving one.

use serde::{Deserialize, Serialize};

/// Text fields accompanying a chunk payload, exactly as the client sent them.
///
/// Every field is optional here; the chunk receiver decides which absences
/// or malformed values are validation failures.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ChunkForm {
    /// Client-chosen token identifying the upload (`fileId`).
    pub upload_id: Option<String>,

    /// Zero-based position of this chunk, unparsed.
    pub chunk_index: Option<String>,

    /// Number of chunks the upload is split into, unparsed.
    pub total_chunks: Option<String>,

    /// Hash of the final reassembled artifact (not of this chunk).
    pub content_hash: Option<String>,

    /// Filename the photo had on the client, if supplied.
    pub original_name: Option<String>,
}

impl ChunkForm {
    /// Whether every field the receiver requires has arrived.
    pub fn has_required_fields(&self) -> bool {
        self.upload_id.is_some()
            && self.chunk_index.is_some()
            && self.total_chunks.is_some()
            && self.content_hash.is_some()
    }
}

/// A chunk whose fields passed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkSpec {
    pub upload_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub content_hash: String,
    pub original_name: Option<String>,
}

impl ChunkSpec {
    /// Whether this chunk is the designated last one, which triggers reassembly.
    pub fn is_trigger(&self) -> bool {
        self.chunk_index + 1 == self.total_chunks
    }
}

/// A finalized artifact produced by reassembly.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedArtifact {
    /// Collection-scoped file name, e.g. `"3.jpg"`.
    pub artifact_name: String,

    /// Hash value registered for the artifact.
    pub content_hash: String,

    /// Number of bytes written.
    pub size_bytes: u64,

    /// True when another artifact already owned this hash, so no new
    /// registry row was inserted.
    pub already_registered: bool,

    /// Original filename declared by the client.
    pub original_name: Option<String>,
}

/// Result of receiving one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The chunk was staged; more chunks are expected.
    Pending { chunk_index: u32, total_chunks: u32 },
    /// The upload has been reassembled into an artifact.
    Complete(FinalizedArtifact),
}

impl ChunkOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, ChunkOutcome::Complete(_))
    }
}
