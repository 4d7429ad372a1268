//! HTTP handlers for chunked uploads and the hash pre-check.
//! Chunk payloads are streamed straight into staging; all ingestion
//! decisions are delegated to `IngestService`.

use crate::{
    errors::AppError,
    models::chunk::{ChunkForm, ChunkOutcome},
    services::{
        error::IngestError,
        ingest_service::{IngestService, validate_chunk},
        part_store::IncomingPart,
    },
};
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::io;
use tracing::debug;

/// Body of `POST /collections/{collection}/precheck`.
#[derive(Debug, Deserialize)]
pub struct PrecheckReq {
    #[serde(default)]
    pub hashes: Vec<String>,
}

/// `POST /collections/{collection}/chunks`: receive one chunk of an upload.
///
/// Multipart fields: one binary payload (a field with a filename, or named
/// `file`/`chunk`) plus `fileId`, `chunkIndex`, `totalChunks`, `hash`, and
/// optionally `originalName`.
///
/// Malformed text fields are reported ahead of storage failures, whichever
/// order the fields arrive in.
pub async fn receive_chunk(
    State(service): State<IngestService>,
    Path(collection): Path<String>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut form = ChunkForm::default();
    let mut payload: Option<IncomingPart> = None;
    let mut extra_payload = false;
    let mut stage_error: Option<IngestError> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                discard(payload).await;
                return Err(err.into());
            }
        };
        let name = field.name().unwrap_or_default().to_string();

        if field.file_name().is_some() || matches!(name.as_str(), "file" | "chunk") {
            if payload.is_some() || stage_error.is_some() {
                extra_payload = true;
                continue;
            }
            if form.has_required_fields() {
                validate_chunk(form.clone())?;
            }
            let stream = field.map(|chunk| chunk.map_err(io::Error::other));
            match service.stage_payload(&collection, stream).await {
                Ok(staged) => payload = Some(staged),
                Err(err) if err.is_validation() => return Err(err.into()),
                Err(err) => stage_error = Some(err),
            }
            continue;
        }

        let text = match field.text().await {
            Ok(text) => text,
            Err(err) => {
                discard(payload).await;
                return Err(err.into());
            }
        };
        match name.as_str() {
            "fileId" => form.upload_id = Some(text),
            "chunkIndex" => form.chunk_index = Some(text),
            "totalChunks" => form.total_chunks = Some(text),
            "hash" => form.content_hash = Some(text),
            "originalName" => form.original_name = Some(text),
            other => debug!("ignoring unknown multipart field `{}`", other),
        }
    }

    if extra_payload {
        discard(payload).await;
        return Err(IngestError::MultiplePayloads.into());
    }
    if let Some(err) = stage_error {
        validate_chunk(form)?;
        return Err(err.into());
    }

    let response = match service.receive_chunk(&collection, form, payload).await? {
        ChunkOutcome::Pending {
            chunk_index,
            total_chunks,
        } => (
            StatusCode::OK,
            Json(json!({
                "status": "chunk_received",
                "chunkIndex": chunk_index,
                "totalChunks": total_chunks,
            })),
        ),
        ChunkOutcome::Complete(artifact) => (
            StatusCode::CREATED,
            Json(json!({
                "status": "complete",
                "filename": artifact.artifact_name,
                "originalName": artifact.original_name,
                "hash": artifact.content_hash,
                "sizeBytes": artifact.size_bytes,
                "alreadyRegistered": artifact.already_registered,
            })),
        ),
    };
    Ok(response.into_response())
}

/// `POST /collections/{collection}/precheck`: report which candidate hashes
/// the collection already holds.
pub async fn precheck(
    State(service): State<IngestService>,
    Path(collection): Path<String>,
    Json(req): Json<PrecheckReq>,
) -> Result<impl IntoResponse, AppError> {
    let existing = service.precheck(&collection, &req.hashes).await?;
    Ok(Json(json!({ "existing": existing })))
}

async fn discard(payload: Option<IncomingPart>) {
    if let Some(payload) = payload {
        payload.discard().await;
    }
}
