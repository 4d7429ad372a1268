//! src/services/ingest_service.rs
//!
//! IngestService: receives photo uploads chunk by chunk, reassembles each
//! upload into exactly one artifact, and deduplicates content per collection
//! through the hash registry. Payloads live on local disk:
//!
//! ```text
//! {base_path}/staging/{collection}/...        staged parts (see PartStore)
//! {base_path}/collections/{collection}/{n}.{ext}   finalized artifacts
//! ```

use crate::{
    models::{
        chunk::{ChunkForm, ChunkOutcome, ChunkSpec, FinalizedArtifact},
        session::SessionKey,
    },
    services::{
        cleanup::{CleanupReport, cleanup, remove_parts},
        content_hash::{ContentHashMode, ContentHasher},
        error::{IngestError, IngestResult},
        hash_registry::HashRegistry,
        part_store::{INCOMING_PREFIX, IncomingPart, PartStore, parse_part_name},
        sequence_allocator::SequenceAllocator,
        upload_sessions::{Observation, UploadSessions},
    },
};
use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use futures::{Stream, StreamExt, stream};
use sqlx::SqlitePool;
use std::{
    collections::HashSet,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

const MAX_NAME_LEN: usize = 128;
const MAX_EXTENSION_LEN: usize = 8;
const DEFAULT_EXTENSION: &str = "jpg";
/// Allocation retries when an artifact name is already taken on disk.
const MAX_NAME_ATTEMPTS: usize = 8;

/// Tunables for ingestion.
#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub max_chunk_bytes: u64,
    pub hash_mode: ContentHashMode,
    /// Idle time after which a session and its staged parts are swept.
    pub session_ttl: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 16 * 1024 * 1024,
            hash_mode: ContentHashMode::default(),
            session_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Totals from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_expired: usize,
    pub files_removed: usize,
}

/// An artifact file written and synced, not yet registered.
struct WrittenArtifact {
    name: String,
    path: PathBuf,
    size_bytes: u64,
    computed_hash: Option<String>,
}

/// Why writing an artifact failed, and what must be removed as a result.
struct WriteFailure {
    error: IngestError,
    partial: Option<PathBuf>,
}

impl WriteFailure {
    fn before_create(error: impl Into<IngestError>) -> Self {
        Self {
            error: error.into(),
            partial: None,
        }
    }

    fn after_create(error: impl Into<IngestError>, path: &Path) -> Self {
        Self {
            error: error.into(),
            partial: Some(path.to_path_buf()),
        }
    }
}

/// IngestService ties the ingestion components together:
/// - Chunk receiver: validates and stages chunk payloads
/// - Reassembly engine: concatenates parts into one artifact per upload
/// - Pre-check: tells clients which content a collection already holds
/// - Sweeper: garbage-collects abandoned uploads
#[derive(Clone)]
pub struct IngestService {
    /// Shared SQLite connection pool backing the registry and sequences.
    pub db: Arc<SqlitePool>,

    /// Base directory holding staging and artifact trees.
    pub base_path: PathBuf,

    parts: PartStore,
    registry: HashRegistry,
    sequences: SequenceAllocator,
    sessions: Arc<UploadSessions>,
    options: IngestOptions,
}

impl IngestService {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, options: IngestOptions) -> Self {
        let base_path = base_path.into();
        Self {
            parts: PartStore::new(base_path.join("staging")),
            registry: HashRegistry::new(db.clone()),
            sequences: SequenceAllocator::new(db.clone()),
            sessions: Arc::new(UploadSessions::new(
                TimeDelta::from_std(options.session_ttl).unwrap_or(TimeDelta::MAX),
            )),
            db,
            base_path,
            options,
        }
    }

    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    pub fn parts(&self) -> &PartStore {
        &self.parts
    }

    pub fn registry(&self) -> &HashRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &UploadSessions {
        &self.sessions
    }

    /// Directory holding a collection's finalized artifacts. Not created here.
    pub fn artifact_dir(&self, collection: &str) -> PathBuf {
        self.base_path.join("collections").join(collection)
    }

    /// Stream a chunk payload into the collection's staging area ahead of
    /// validating the rest of the chunk.
    ///
    /// The result is not a part yet; pass it to [`IngestService::receive_chunk`],
    /// which commits or discards it.
    pub async fn stage_payload<S>(&self, collection: &str, payload: S) -> IngestResult<IncomingPart>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        ensure_collection(collection)?;
        self.parts
            .stage_incoming(collection, payload, self.options.max_chunk_bytes)
            .await
    }

    /// Receive one chunk whose payload is already in memory.
    pub async fn receive_chunk_bytes(
        &self,
        collection: &str,
        form: ChunkForm,
        payload: Bytes,
    ) -> IngestResult<ChunkOutcome> {
        let staged = self
            .stage_payload(collection, stream::once(async move { Ok(payload) }))
            .await?;
        self.receive_chunk(collection, form, Some(staged)).await
    }

    /// Validate a chunk, stage it as a part, and reassemble the upload when
    /// the chunk is the designated last one.
    ///
    /// Validation failures discard `payload` and leave no part behind.
    pub async fn receive_chunk(
        &self,
        collection: &str,
        form: ChunkForm,
        payload: Option<IncomingPart>,
    ) -> IngestResult<ChunkOutcome> {
        if let Err(err) = ensure_collection(collection) {
            discard(payload).await;
            return Err(err);
        }
        let payload = match payload {
            Some(p) if !p.is_empty() => p,
            other => {
                discard(other).await;
                return Err(IngestError::MissingPayload);
            }
        };
        let spec = match validate_chunk(form) {
            Ok(spec) => spec,
            Err(err) => {
                payload.discard().await;
                return Err(err);
            }
        };

        let key = SessionKey::new(collection, &spec.upload_id);
        match self.sessions.observe(&key, spec.total_chunks, Utc::now()) {
            Ok(Observation::Active) => {}
            Ok(Observation::Completed(artifact)) => {
                payload.discard().await;
                debug!(upload = %key, "upload already finalized, replaying outcome");
                return Ok(ChunkOutcome::Complete(artifact));
            }
            Err(err) => {
                payload.discard().await;
                return Err(err);
            }
        }

        let size = payload.size();
        {
            // Serialized with reassembly: a late part must not outlive the purge.
            let gate = self.sessions.gate(&key);
            let _guard = gate.lock().await;
            if let Some(artifact) = self.sessions.completed(&key) {
                payload.discard().await;
                debug!(upload = %key, "chunk arrived after reassembly, replaying outcome");
                return Ok(ChunkOutcome::Complete(artifact));
            }
            self.parts
                .commit(collection, payload, &spec.upload_id, spec.chunk_index)
                .await?;
            self.sessions
                .mark_received(&key, spec.chunk_index, Utc::now());
        }
        debug!(
            upload = %key,
            chunk = spec.chunk_index,
            total = spec.total_chunks,
            size,
            "chunk staged"
        );

        if !spec.is_trigger() {
            return Ok(ChunkOutcome::Pending {
                chunk_index: spec.chunk_index,
                total_chunks: spec.total_chunks,
            });
        }

        self.reassemble(collection, &spec)
            .await
            .map(ChunkOutcome::Complete)
    }

    /// Concatenate every staged part of an upload into a new artifact,
    /// register its hash, and purge the parts.
    ///
    /// Serialized per upload: a concurrent second trigger waits and then
    /// returns the first one's artifact. Missing parts fail the trigger
    /// without waiting and remove the parts that did arrive.
    pub async fn reassemble(
        &self,
        collection: &str,
        spec: &ChunkSpec,
    ) -> IngestResult<FinalizedArtifact> {
        ensure_collection(collection)?;
        let key = SessionKey::new(collection, &spec.upload_id);
        let gate = self.sessions.gate(&key);
        let _guard = gate.lock().await;

        if let Some(artifact) = self.sessions.completed(&key) {
            debug!(upload = %key, "reassembly already done by a concurrent trigger");
            return Ok(artifact);
        }

        let recorded = self.sessions.snapshot(&key);
        let staging = self.parts.staging_dir(collection);
        let missing = match self
            .parts
            .missing_parts(collection, &spec.upload_id, spec.total_chunks)
            .await
        {
            Ok(missing) => missing,
            Err(err) => {
                self.abandon(&key, &staging, None).await;
                return Err(err);
            }
        };
        if let Some(session) = &recorded {
            let lost = session.received_among(&missing);
            if !lost.is_empty() {
                warn!(upload = %key, ?lost, "chunks recorded as received are no longer staged");
            }
        }
        if !missing.is_empty() {
            warn!(upload = %key, ?missing, "reassembly triggered with missing chunks");
            self.abandon(&key, &staging, None).await;
            return Err(IngestError::IncompleteUpload {
                upload_id: spec.upload_id.clone(),
                missing,
            });
        }

        let written = match self.write_artifact(collection, spec).await {
            Ok(written) => written,
            Err(failure) => {
                self.abandon(&key, &staging, failure.partial.as_deref()).await;
                return Err(failure.error);
            }
        };

        let content_hash = self.resolve_hash(&key, &spec.content_hash, written.computed_hash);
        let inserted = match self
            .registry
            .register_if_absent(collection, &content_hash, &written.name)
            .await
        {
            Ok(inserted) => inserted,
            Err(err) => {
                self.abandon(&key, &staging, Some(&written.path)).await;
                return Err(err);
            }
        };

        let removed = remove_parts(&spec.upload_id, &staging).await;
        if removed < spec.total_chunks as usize {
            warn!(
                upload = %key,
                removed,
                expected = spec.total_chunks,
                "some staged parts were not removed after reassembly"
            );
        }

        let artifact = FinalizedArtifact {
            artifact_name: written.name,
            content_hash,
            size_bytes: written.size_bytes,
            already_registered: !inserted,
            original_name: spec.original_name.clone(),
        };
        self.sessions
            .complete(&key, spec.total_chunks, artifact.clone(), Utc::now());
        info!(
            upload = %key,
            artifact = %artifact.artifact_name,
            size = artifact.size_bytes,
            duplicate = artifact.already_registered,
            "upload finalized"
        );
        Ok(artifact)
    }

    /// Return the candidate hashes `collection` already holds.
    ///
    /// When registered hashes are computed digests, candidates match
    /// case-insensitively and come back as the client spelled them.
    pub async fn precheck(&self, collection: &str, hashes: &[String]) -> IngestResult<Vec<String>> {
        ensure_collection(collection)?;
        if !self.options.hash_mode.computes_digest() {
            return self.registry.filter_known(collection, hashes).await;
        }

        let lowered: Vec<String> = hashes.iter().map(|h| h.to_ascii_lowercase()).collect();
        let known = self.registry.filter_known(collection, &lowered).await?;
        let known: HashSet<&str> = known.iter().map(String::as_str).collect();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut existing = Vec::new();
        for (original, lower) in hashes.iter().zip(&lowered) {
            if known.contains(lower.as_str()) && seen.insert(original.as_str()) {
                existing.push(original.clone());
            }
        }
        Ok(existing)
    }

    /// Drop sessions idle longer than `ttl`, cleaning the parts of unfinished
    /// ones, then remove staged files older than `ttl` that no live session owns.
    pub async fn sweep_expired(&self, ttl: Duration) -> IngestResult<SweepReport> {
        let mut report = SweepReport::default();
        let ttl_delta = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);

        for session in self.sessions.take_expired(Utc::now(), ttl_delta) {
            report.sessions_expired += 1;
            if session.is_completed() {
                continue;
            }
            let staging = self.parts.staging_dir(&session.key.collection);
            let CleanupReport { parts_removed, .. } =
                cleanup(&session.key.upload_id, &staging, None).await;
            debug!(upload = %session.key, parts_removed, "expired upload session swept");
            report.files_removed += parts_removed;
        }

        report.files_removed += self.sweep_stale_files(ttl).await?;
        if report != SweepReport::default() {
            info!(
                sessions = report.sessions_expired,
                files = report.files_removed,
                "sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_stale_files(&self, ttl: Duration) -> IngestResult<usize> {
        let mut collections = match fs::read_dir(self.parts.root()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(IngestError::Io(err)),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(dir) = collections.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let Some(collection) = dir.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let mut entries = fs::read_dir(dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let is_staged = name.starts_with(INCOMING_PREFIX) || parse_part_name(name).is_some();
                if !is_staged {
                    continue;
                }
                if let Some((upload_id, _)) = parse_part_name(name) {
                    let key = SessionKey::new(collection.as_str(), upload_id);
                    if self.sessions.contains(&key) {
                        continue;
                    }
                }

                let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                    continue;
                };
                let age = now.duration_since(modified).unwrap_or_default();
                if age <= ttl {
                    continue;
                }
                match fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => warn!("failed to sweep {}: {}", entry.path().display(), err),
                }
            }
        }
        Ok(removed)
    }

    /// Cleanup path shared by every reassembly failure.
    async fn abandon(&self, key: &SessionKey, staging: &Path, partial: Option<&Path>) {
        let report = cleanup(&key.upload_id, staging, partial).await;
        self.sessions.forget(key);
        debug!(
            upload = %key,
            parts_removed = report.parts_removed,
            artifact_removed = report.artifact_removed,
            "upload cleaned up"
        );
    }

    /// Allocate a name, create the artifact exclusively, and append every
    /// part in ascending index order.
    async fn write_artifact(
        &self,
        collection: &str,
        spec: &ChunkSpec,
    ) -> Result<WrittenArtifact, WriteFailure> {
        let dir = self.artifact_dir(collection);
        fs::create_dir_all(&dir)
            .await
            .map_err(WriteFailure::before_create)?;

        let extension = artifact_extension(spec.original_name.as_deref());
        let (name, path, mut file) = self
            .create_exclusive(collection, &dir, &extension)
            .await
            .map_err(WriteFailure::before_create)?;

        let mut hasher = ContentHasher::for_mode(self.options.hash_mode);
        let size_bytes = match self
            .append_parts(collection, spec, &mut file, &mut hasher)
            .await
        {
            Ok(size) => size,
            Err(err) => return Err(WriteFailure::after_create(err, &path)),
        };
        if let Err(err) = file.flush().await {
            return Err(WriteFailure::after_create(err, &path));
        }
        if let Err(err) = file.sync_all().await {
            return Err(WriteFailure::after_create(err, &path));
        }

        Ok(WrittenArtifact {
            name,
            path,
            size_bytes,
            computed_hash: hasher.finish(),
        })
    }

    async fn create_exclusive(
        &self,
        collection: &str,
        dir: &Path,
        extension: &str,
    ) -> IngestResult<(String, PathBuf, File)> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let index = self.sequences.next_index(collection).await?;
            let name = format!("{index}.{extension}");
            let path = dir.join(&name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((name, path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    warn!("artifact {} already exists, allocating another name", path.display());
                }
                Err(err) => return Err(IngestError::Io(err)),
            }
        }
        Err(IngestError::ArtifactNamesExhausted(collection.to_string()))
    }

    async fn append_parts(
        &self,
        collection: &str,
        spec: &ChunkSpec,
        file: &mut File,
        hasher: &mut ContentHasher,
    ) -> IngestResult<u64> {
        let mut size: u64 = 0;
        for index in 0..spec.total_chunks {
            let part = self
                .parts
                .open_part(collection, &spec.upload_id, index)
                .await?;
            let mut reader = ReaderStream::new(part);
            while let Some(chunk) = reader.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
                size += chunk.len() as u64;
            }
        }
        Ok(size)
    }

    /// Pick the hash to register: the digest computed from the artifact when
    /// the mode computes one, else the client's value.
    fn resolve_hash(&self, key: &SessionKey, supplied: &str, computed: Option<String>) -> String {
        match computed {
            Some(computed) => {
                if !computed.eq_ignore_ascii_case(supplied) {
                    warn!(
                        upload = %key,
                        supplied,
                        computed = %computed,
                        "client content hash does not match assembled bytes"
                    );
                }
                computed
            }
            None => supplied.to_string(),
        }
    }
}

async fn discard(payload: Option<IncomingPart>) {
    if let Some(payload) = payload {
        payload.discard().await;
    }
}

/// Collection ids become directory names.
pub fn ensure_collection(collection: &str) -> IngestResult<()> {
    if collection.is_empty() {
        return Err(IngestError::MissingCollection);
    }
    check_identifier(collection).map_err(|reason| IngestError::InvalidCollection {
        name: collection.to_string(),
        reason: reason.into(),
    })
}

/// Upload ids prefix staged part names, so they must not contain `.`.
pub fn ensure_upload_id(upload_id: &str) -> IngestResult<()> {
    if upload_id.is_empty() {
        return Err(IngestError::MissingUploadId);
    }
    check_identifier(upload_id).map_err(|reason| IngestError::InvalidUploadId {
        name: upload_id.to_string(),
        reason: reason.into(),
    })
}

fn check_identifier(value: &str) -> Result<(), &'static str> {
    if value.len() > MAX_NAME_LEN {
        return Err("must be at most 128 characters");
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("allowed characters are ASCII letters, digits, hyphens, and underscores");
    }
    Ok(())
}

/// Check the text fields of a chunk in a fixed order, so the first problem
/// found is the one reported.
pub fn validate_chunk(form: ChunkForm) -> IngestResult<ChunkSpec> {
    let upload_id = form.upload_id.unwrap_or_default().trim().to_string();
    ensure_upload_id(&upload_id)?;

    let chunk_index = match form.chunk_index.as_deref().map(str::trim) {
        None | Some("") => return Err(IngestError::MissingChunkIndex),
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| IngestError::InvalidChunkIndex(raw.to_string()))?,
    };

    let total_chunks = match form.total_chunks.as_deref().map(str::trim) {
        None | Some("") => return Err(IngestError::MissingTotalChunks),
        Some(raw) => match raw.parse::<u32>() {
            Ok(total) if total > 0 => total,
            _ => return Err(IngestError::InvalidTotalChunks(raw.to_string())),
        },
    };

    let content_hash = form.content_hash.unwrap_or_default().trim().to_string();
    if content_hash.is_empty() {
        return Err(IngestError::MissingContentHash);
    }

    if chunk_index >= total_chunks {
        return Err(IngestError::ChunkIndexOutOfRange {
            index: chunk_index,
            total: total_chunks,
        });
    }

    let original_name = form
        .original_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());

    Ok(ChunkSpec {
        upload_id,
        chunk_index,
        total_chunks,
        content_hash,
        original_name,
    })
}

/// Extension for an artifact: the declared file's own when it is short and
/// alphanumeric, else `jpg`.
pub fn artifact_extension(original_name: Option<&str>) -> String {
    original_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn service_with(mode: ContentHashMode) -> (tempfile::TempDir, IngestService) {
        service_with_options(IngestOptions {
            max_chunk_bytes: 1024,
            hash_mode: mode,
            ..IngestOptions::default()
        })
        .await
    }

    async fn service_with_options(options: IngestOptions) -> (tempfile::TempDir, IngestService) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let pool = db::connect(&url, 4).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let service = IngestService::new(Arc::new(pool), dir.path().join("data"), options);
        (dir, service)
    }

    fn form(upload_id: &str, index: u32, total: u32, hash: &str) -> ChunkForm {
        ChunkForm {
            upload_id: Some(upload_id.to_string()),
            chunk_index: Some(index.to_string()),
            total_chunks: Some(total.to_string()),
            content_hash: Some(hash.to_string()),
            original_name: None,
        }
    }

    async fn send(
        service: &IngestService,
        upload_id: &str,
        index: u32,
        total: u32,
        body: &'static [u8],
    ) -> IngestResult<ChunkOutcome> {
        service
            .receive_chunk_bytes(
                "wed1",
                form(upload_id, index, total, "h1"),
                Bytes::from_static(body),
            )
            .await
    }

    async fn staged_files(service: &IngestService) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut entries) = fs::read_dir(service.parts().staging_dir("wed1")).await else {
            return names;
        };
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names
    }

    async fn artifact_files(service: &IngestService) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut entries) = fs::read_dir(service.artifact_dir("wed1")).await else {
            return names;
        };
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names
    }

    #[test]
    fn validation_reports_the_first_problem() {
        let mut f = form("u1", 0, 1, "h1");
        f.upload_id = None;
        assert!(matches!(validate_chunk(f), Err(IngestError::MissingUploadId)));

        let mut f = form("u1", 0, 1, "h1");
        f.chunk_index = Some("-1".into());
        assert!(matches!(validate_chunk(f), Err(IngestError::InvalidChunkIndex(_))));

        let mut f = form("u1", 0, 1, "h1");
        f.total_chunks = Some("0".into());
        assert!(matches!(validate_chunk(f), Err(IngestError::InvalidTotalChunks(_))));

        let mut f = form("u1", 0, 1, "h1");
        f.content_hash = Some("  ".into());
        assert!(matches!(validate_chunk(f), Err(IngestError::MissingContentHash)));

        assert!(matches!(
            validate_chunk(form("u1", 3, 3, "h1")),
            Err(IngestError::ChunkIndexOutOfRange { index: 3, total: 3 })
        ));
        assert!(matches!(
            validate_chunk(form("../u1", 0, 1, "h1")),
            Err(IngestError::InvalidUploadId { .. })
        ));
    }

    #[test]
    fn extension_comes_from_original_name() {
        assert_eq!(artifact_extension(Some("IMG_0042.HEIC")), "heic");
        assert_eq!(artifact_extension(Some("photo")), "jpg");
        assert_eq!(artifact_extension(Some("weird.j p g")), "jpg");
        assert_eq!(artifact_extension(None), "jpg");
    }

    #[tokio::test]
    async fn out_of_order_chunks_reassemble_in_index_order() {
        let (_dir, service) = service_with_options(IngestOptions::default()).await;

        assert!(!send(&service, "u1", 1, 3, b"BBBB").await.unwrap().is_complete());
        assert!(!send(&service, "u1", 0, 3, b"AAAA").await.unwrap().is_complete());
        let ChunkOutcome::Complete(artifact) = send(&service, "u1", 2, 3, b"CC").await.unwrap()
        else {
            panic!("last chunk should complete the upload");
        };

        let path = service.artifact_dir("wed1").join(&artifact.artifact_name);
        assert_eq!(fs::read(&path).await.unwrap(), b"AAAABBBBCC");
        assert_eq!(artifact.artifact_name, "1.jpg");
        assert_eq!(artifact.size_bytes, 10);
        let record = service.registry().lookup("wed1", "h1").await.unwrap().unwrap();
        assert_eq!(record.artifact_name, artifact.artifact_name);
        assert!(staged_files(&service).await.is_empty());

        let known = service
            .precheck("wed1", &["h1".to_string(), "h2".to_string()])
            .await
            .unwrap();
        assert_eq!(known, vec!["h1".to_string()]);
    }

    #[tokio::test]
    async fn registry_failure_removes_artifact_and_parts() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;
        sqlx::query(
            "CREATE TRIGGER reject_registration BEFORE INSERT ON hash_records \
             BEGIN SELECT RAISE(ABORT, 'registry unavailable'); END",
        )
        .execute(&*service.db)
        .await
        .unwrap();

        send(&service, "u1", 0, 2, b"AAAA").await.unwrap();
        let err = send(&service, "u1", 1, 2, b"BB").await.unwrap_err();

        assert!(matches!(err, IngestError::Sqlx(_)));
        assert!(artifact_files(&service).await.is_empty());
        assert!(staged_files(&service).await.is_empty());
        assert!(!service.sessions().contains(&SessionKey::new("wed1", "u1")));
    }

    #[tokio::test]
    async fn recorded_part_missing_from_disk_fails_trigger() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;
        let key = SessionKey::new("wed1", "u1");

        send(&service, "u1", 0, 2, b"AAAA").await.unwrap();
        let session = service.sessions().snapshot(&key).unwrap();
        assert_eq!(session.received_among(&[0, 1]), vec![0]);
        fs::remove_file(service.parts().part_path("wed1", "u1", 0))
            .await
            .unwrap();

        let err = send(&service, "u1", 1, 2, b"BB").await.unwrap_err();
        match err {
            IngestError::IncompleteUpload { missing, .. } => assert_eq!(missing, vec![0]),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(staged_files(&service).await.is_empty());
        assert!(artifact_files(&service).await.is_empty());
        assert!(!service.sessions().contains(&key));
    }

    #[tokio::test]
    async fn chunk_arriving_during_reassembly_is_not_left_staged() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;
        let key = SessionKey::new("wed1", "u1");
        send(&service, "u1", 0, 3, b"AAAA").await.unwrap();

        let gate = service.sessions().gate(&key);
        let guard = gate.lock().await;
        let late = {
            let service = service.clone();
            tokio::spawn(async move { send(&service, "u1", 1, 3, b"BBBB").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let finished = FinalizedArtifact {
            artifact_name: "1.jpg".into(),
            content_hash: "h1".into(),
            size_bytes: 10,
            already_registered: false,
            original_name: None,
        };
        service
            .sessions()
            .complete(&key, 3, finished.clone(), Utc::now());
        drop(guard);

        let outcome = late.await.unwrap().unwrap();
        assert_eq!(outcome, ChunkOutcome::Complete(finished));
        assert!(!service.parts().part_path("wed1", "u1", 1).exists());
    }

    #[tokio::test]
    async fn missing_chunk_fails_trigger_and_removes_parts() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;

        send(&service, "u1", 0, 3, b"AAAA").await.unwrap();
        let err = send(&service, "u1", 2, 3, b"CC").await.unwrap_err();

        match err {
            IngestError::IncompleteUpload { upload_id, missing } => {
                assert_eq!(upload_id, "u1");
                assert_eq!(missing, vec![1]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(staged_files(&service).await.is_empty());
        assert_eq!(service.registry().count("wed1").await.unwrap(), 0);
        assert!(!fs::try_exists(service.artifact_dir("wed1").join("1.jpg")).await.unwrap());
        assert!(!service.sessions().contains(&SessionKey::new("wed1", "u1")));
    }

    #[tokio::test]
    async fn resubmitted_chunk_replaces_earlier_payload() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;

        send(&service, "u1", 0, 2, b"old!").await.unwrap();
        send(&service, "u1", 0, 2, b"new").await.unwrap();
        let ChunkOutcome::Complete(artifact) = send(&service, "u1", 1, 2, b"+").await.unwrap()
        else {
            panic!("expected completion");
        };

        let path = service.artifact_dir("wed1").join(&artifact.artifact_name);
        assert_eq!(fs::read(&path).await.unwrap(), b"new+");
    }

    #[tokio::test]
    async fn validation_failure_stages_nothing() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;

        let mut bad = form("u1", 0, 2, "h1");
        bad.total_chunks = Some("two".into());
        let err = service
            .receive_chunk_bytes("wed1", bad, Bytes::from_static(b"data"))
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert!(staged_files(&service).await.is_empty());
        assert!(service.sessions().is_empty());
    }

    #[tokio::test]
    async fn empty_payload_is_rejected() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;

        let err = send(&service, "u1", 0, 1, b"").await.unwrap_err();
        assert!(matches!(err, IngestError::MissingPayload));

        let err = service
            .receive_chunk("wed1", form("u1", 0, 1, "h1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::MissingPayload));
        assert!(staged_files(&service).await.is_empty());
    }

    #[tokio::test]
    async fn mismatched_total_is_rejected_without_staging() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;

        send(&service, "u1", 0, 3, b"AAAA").await.unwrap();
        let err = send(&service, "u1", 1, 4, b"BBBB").await.unwrap_err();

        assert!(matches!(err, IngestError::TotalChunksMismatch { .. }));
        assert_eq!(staged_files(&service).await, vec!["u1.part0".to_string()]);
    }

    #[tokio::test]
    async fn sha256_mode_registers_digest_of_assembled_bytes() {
        let (_dir, service) = service_with(ContentHashMode::Sha256).await;

        send(&service, "u1", 0, 2, b"ab").await.unwrap();
        let ChunkOutcome::Complete(artifact) = send(&service, "u1", 1, 2, b"c").await.unwrap()
        else {
            panic!("expected completion");
        };

        let digest = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert_eq!(artifact.content_hash, digest);
        assert!(service.registry().lookup("wed1", digest).await.unwrap().is_some());
        assert!(service.registry().lookup("wed1", "h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn digest_precheck_ignores_candidate_case() {
        let (_dir, service) = service_with(ContentHashMode::Sha256).await;
        send(&service, "u1", 0, 1, b"abc").await.unwrap();

        let upper =
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".to_ascii_uppercase();
        let known = service
            .precheck("wed1", &[upper.clone(), "h1".to_string(), upper.clone()])
            .await
            .unwrap();
        assert_eq!(known, vec![upper]);
    }

    #[tokio::test]
    async fn duplicate_content_keeps_first_registration() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;

        let ChunkOutcome::Complete(first) = send(&service, "a", 0, 1, b"same").await.unwrap()
        else {
            panic!("expected completion");
        };
        let ChunkOutcome::Complete(second) = send(&service, "b", 0, 1, b"same").await.unwrap()
        else {
            panic!("expected completion");
        };

        assert!(!first.already_registered);
        assert!(second.already_registered);
        assert_ne!(first.artifact_name, second.artifact_name);
        assert_eq!(service.registry().count("wed1").await.unwrap(), 1);
        let record = service.registry().lookup("wed1", "h1").await.unwrap().unwrap();
        assert_eq!(record.artifact_name, first.artifact_name);
    }

    #[tokio::test]
    async fn repeated_trigger_replays_the_finished_upload() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;

        send(&service, "u1", 0, 2, b"AA").await.unwrap();
        let first = send(&service, "u1", 1, 2, b"BB").await.unwrap();
        let again = send(&service, "u1", 1, 2, b"BB").await.unwrap();

        assert_eq!(first, again);
        assert!(staged_files(&service).await.is_empty());
        let mut entries = fs::read_dir(service.artifact_dir("wed1")).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn concurrent_triggers_produce_one_artifact() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;
        for (index, body) in [(0, b"AA"), (1, b"BB")] {
            let incoming = service
                .parts()
                .stage_incoming("wed1", stream::once(async move { Ok(Bytes::from_static(body)) }), 16)
                .await
                .unwrap();
            service.parts().commit("wed1", incoming, "u2", index).await.unwrap();
        }
        let spec = validate_chunk(form("u2", 1, 2, "h2")).unwrap();

        let triggers = (0..4).map(|_| {
            let service = service.clone();
            let spec = spec.clone();
            tokio::spawn(async move { service.reassemble("wed1", &spec).await.unwrap() })
        });
        let results: Vec<FinalizedArtifact> = futures::future::join_all(triggers)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(results.windows(2).all(|w| w[0] == w[1]));
        let path = service.artifact_dir("wed1").join(&results[0].artifact_name);
        assert_eq!(fs::read(&path).await.unwrap(), b"AABB");
    }

    #[tokio::test]
    async fn concurrent_uploads_get_distinct_names() {
        let (_dir, service) = service_with(ContentHashMode::Sha256).await;

        let uploads = (0..6).map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                let body = Bytes::from(format!("photo-{i}"));
                service
                    .receive_chunk_bytes("wed1", form(&format!("up{i}"), 0, 1, "x"), body)
                    .await
                    .unwrap()
            })
        });
        let mut names: Vec<String> = futures::future::join_all(uploads)
            .await
            .into_iter()
            .map(|r| match r.unwrap() {
                ChunkOutcome::Complete(artifact) => artifact.artifact_name,
                other => panic!("unexpected outcome {other:?}"),
            })
            .collect();
        names.sort();
        names.dedup();

        assert_eq!(names.len(), 6);
        assert_eq!(service.registry().count("wed1").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn taken_artifact_name_is_skipped() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;
        fs::create_dir_all(service.artifact_dir("wed1")).await.unwrap();
        fs::write(service.artifact_dir("wed1").join("1.jpg"), b"foreign")
            .await
            .unwrap();

        let ChunkOutcome::Complete(artifact) = send(&service, "u1", 0, 1, b"mine").await.unwrap()
        else {
            panic!("expected completion");
        };

        assert_eq!(artifact.artifact_name, "2.jpg");
        let foreign = fs::read(service.artifact_dir("wed1").join("1.jpg")).await.unwrap();
        assert_eq!(foreign, b"foreign");
    }

    #[tokio::test]
    async fn precheck_returns_known_subset() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;
        send(&service, "u1", 0, 1, b"data").await.unwrap();

        let known = service
            .precheck("wed1", &["h1".to_string(), "h2".to_string()])
            .await
            .unwrap();
        assert_eq!(known, vec!["h1".to_string()]);
        assert!(service.precheck("wed1", &[]).await.unwrap().is_empty());
        assert!(matches!(
            service.precheck("", &[]).await,
            Err(IngestError::MissingCollection)
        ));
    }

    #[tokio::test]
    async fn sweep_removes_expired_sessions_and_orphaned_parts() {
        let (_dir, service) = service_with(ContentHashMode::Client).await;
        send(&service, "u1", 0, 3, b"AAAA").await.unwrap();
        // An orphan from before a restart: staged but unknown to the session registry.
        let orphan = service.parts().staging_dir("wed1").join("ghost.part0");
        fs::write(&orphan, b"x").await.unwrap();

        let fresh = service.sweep_expired(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(fresh, SweepReport::default());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = service.sweep_expired(Duration::ZERO).await.unwrap();

        assert_eq!(report.sessions_expired, 1);
        assert_eq!(report.files_removed, 2);
        assert!(staged_files(&service).await.is_empty());
        assert!(service.sessions().is_empty());
    }
}
