//! Represents a content hash already stored for a collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row of the hash registry.
///
/// A `(collection, content_hash)` pair is registered at most once; the
/// artifact it points at is the first one finalized with that content.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct HashRecord {
    /// Collection (invitation photo space) the hash belongs to.
    pub collection: String,

    /// Digest identifying the bytes of a complete artifact.
    pub content_hash: String,

    /// Name of the artifact file holding that content (e.g. `"12.jpg"`).
    pub artifact_name: String,

    /// When the hash was first registered.
    pub created_at: DateTime<Utc>,
}
