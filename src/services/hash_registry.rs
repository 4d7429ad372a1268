//! Durable `(collection, content_hash) -> artifact_name` records.

use crate::{models::hash_record::HashRecord, services::error::IngestResult};
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{collections::HashSet, sync::Arc};
use tracing::debug;

/// SQLite caps bind parameters per statement; stay well below it.
const FILTER_BATCH: usize = 500;

#[derive(Clone)]
pub struct HashRegistry {
    db: Arc<SqlitePool>,
}

impl HashRegistry {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Record that `collection` holds `content_hash` in `artifact_name`.
    ///
    /// Atomic at the storage layer: the primary key on `(collection, content_hash)`
    /// turns a second registration into a no-op. Returns `true` when a row
    /// was inserted and `false` when the hash was already registered.
    pub async fn register_if_absent(
        &self,
        collection: &str,
        content_hash: &str,
        artifact_name: &str,
    ) -> IngestResult<bool> {
        let result = sqlx::query(
            "INSERT INTO hash_records (collection, content_hash, artifact_name, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(collection, content_hash) DO NOTHING",
        )
        .bind(collection)
        .bind(content_hash)
        .bind(artifact_name)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            debug!(collection, content_hash, "hash already registered");
        }
        Ok(inserted)
    }

    /// Return the subset of `hashes` already registered for `collection`.
    ///
    /// Duplicates in the input are collapsed; the output keeps the order in
    /// which hashes first appear. Empty input never touches the database.
    pub async fn filter_known(
        &self,
        collection: &str,
        hashes: &[String],
    ) -> IngestResult<Vec<String>> {
        let mut seen = HashSet::new();
        let candidates: Vec<&str> = hashes
            .iter()
            .map(String::as_str)
            .filter(|h| seen.insert(*h))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut known = HashSet::new();
        for batch in candidates.chunks(FILTER_BATCH) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "SELECT content_hash FROM hash_records WHERE collection = ",
            );
            builder.push_bind(collection);
            builder.push(" AND content_hash IN (");
            let mut separated = builder.separated(", ");
            for hash in batch {
                separated.push_bind(*hash);
            }
            separated.push_unseparated(")");

            let rows: Vec<String> = builder
                .build_query_scalar()
                .fetch_all(&*self.db)
                .await?;
            known.extend(rows);
        }

        Ok(candidates
            .into_iter()
            .filter(|h| known.contains(*h))
            .map(str::to_string)
            .collect())
    }

    pub async fn lookup(
        &self,
        collection: &str,
        content_hash: &str,
    ) -> IngestResult<Option<HashRecord>> {
        let record = sqlx::query_as::<_, HashRecord>(
            "SELECT collection, content_hash, artifact_name, created_at
             FROM hash_records WHERE collection = ? AND content_hash = ?",
        )
        .bind(collection)
        .bind(content_hash)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    /// Number of hashes registered for `collection`.
    pub async fn count(&self, collection: &str) -> IngestResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM hash_records WHERE collection = ?",
        )
        .bind(collection)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }
}
