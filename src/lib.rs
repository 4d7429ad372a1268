//! Chunked photo upload ingestion with per-collection content deduplication.
//!
//! Clients split a photo into chunks and send each one independently; the
//! last-indexed chunk triggers reassembly into a single numbered artifact,
//! whose content hash is registered so later uploads of the same bytes can
//! be skipped via the pre-check.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
