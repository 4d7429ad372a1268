use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("collection is required")]
    MissingCollection,
    #[error("collection `{name}` invalid: {reason}")]
    InvalidCollection { name: String, reason: String },
    #[error("chunk payload is required")]
    MissingPayload,
    #[error("exactly one chunk payload field is allowed")]
    MultiplePayloads,
    #[error("chunk payload exceeds the {limit} byte limit")]
    ChunkTooLarge { limit: u64 },
    #[error("fileId is required")]
    MissingUploadId,
    #[error("fileId `{name}` invalid: {reason}")]
    InvalidUploadId { name: String, reason: String },
    #[error("chunkIndex is required")]
    MissingChunkIndex,
    #[error("chunkIndex `{0}` is not a non-negative integer")]
    InvalidChunkIndex(String),
    #[error("totalChunks is required")]
    MissingTotalChunks,
    #[error("totalChunks `{0}` is not a positive integer")]
    InvalidTotalChunks(String),
    #[error("hash is required")]
    MissingContentHash,
    #[error("chunkIndex {index} is out of range for {total} chunks")]
    ChunkIndexOutOfRange { index: u32, total: u32 },
    #[error("upload `{upload_id}` declared {declared} chunks but this chunk says {received}")]
    TotalChunksMismatch {
        upload_id: String,
        declared: u32,
        received: u32,
    },
    #[error("upload `{upload_id}` is incomplete, missing chunks {missing:?}")]
    IncompleteUpload { upload_id: String, missing: Vec<u32> },
    #[error("no free artifact name in collection `{0}`")]
    ArtifactNamesExhausted(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IngestError {
    /// Client-side mistakes that leave no state behind.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            IngestError::IncompleteUpload { .. }
                | IngestError::ArtifactNamesExhausted(_)
                | IngestError::Sqlx(_)
                | IngestError::Io(_)
        )
    }
}

pub type IngestResult<T> = Result<T, IngestError>;
