//! Core data models for the chunked photo ingestion service.
//!
//! These entities describe chunk submissions, upload sessions, and the
//! content hash records that back per-collection deduplication. Registry
//! rows map to SQLite via `sqlx::FromRow`; outcomes serialize as JSON via `serde`.

pub mod chunk;
pub mod hash_record;
pub mod session;
