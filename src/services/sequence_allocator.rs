//! Per-collection artifact numbering.

use crate::services::error::IngestResult;
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct SequenceAllocator {
    db: Arc<SqlitePool>,
}

impl SequenceAllocator {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Hand out the next artifact number for `collection`.
    ///
    /// Increment and read happen in a single upsert, so concurrent callers
    /// always receive distinct values. A collection's first allocation is
    /// seeded from its registered hash count, yielding `count + 1`.
    pub async fn next_index(&self, collection: &str) -> IngestResult<i64> {
        let next = sqlx::query_scalar::<_, i64>(
            "INSERT INTO collection_sequences (collection, last_index)
             VALUES (?, (SELECT COUNT(*) FROM hash_records WHERE collection = ?) + 1)
             ON CONFLICT(collection) DO UPDATE SET last_index = collection_sequences.last_index + 1
             RETURNING last_index",
        )
        .bind(collection)
        .bind(collection)
        .fetch_one(&*self.db)
        .await?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, services::hash_registry::HashRegistry};
    use std::collections::HashSet;

    async fn pool() -> (tempfile::TempDir, Arc<SqlitePool>) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let pool = db::connect(&url, 4).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        (dir, Arc::new(pool))
    }

    #[tokio::test]
    async fn numbers_increase_per_collection() {
        let (_dir, db) = pool().await;
        let allocator = SequenceAllocator::new(db);

        assert_eq!(allocator.next_index("wed1").await.unwrap(), 1);
        assert_eq!(allocator.next_index("wed1").await.unwrap(), 2);
        assert_eq!(allocator.next_index("wed2").await.unwrap(), 1);
        assert_eq!(allocator.next_index("wed1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn first_allocation_follows_existing_hash_count() {
        let (_dir, db) = pool().await;
        let registry = HashRegistry::new(db.clone());
        registry.register_if_absent("wed1", "a", "1.jpg").await.unwrap();
        registry.register_if_absent("wed1", "b", "2.jpg").await.unwrap();

        let allocator = SequenceAllocator::new(db);
        assert_eq!(allocator.next_index("wed1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn concurrent_allocations_are_distinct() {
        let (_dir, db) = pool().await;
        let allocator = SequenceAllocator::new(db);

        let tasks = (0..16).map(|_| {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.next_index("wed1").await.unwrap() })
        });
        let values: HashSet<i64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(values, (1..=16).collect());
    }
}
