//! Ingestion services: staging, reassembly, deduplication, and cleanup.

pub mod cleanup;
pub mod content_hash;
pub mod error;
pub mod hash_registry;
pub mod ingest_service;
pub mod part_store;
pub mod sequence_allocator;
pub mod upload_sessions;
