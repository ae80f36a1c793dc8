use super::error::ApiError;
use crate::core::Core;
use crate::workers::FinalizeJob;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use bundler_sql::multipart;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use jobs::{EnqueueOptions, Queue};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateUploadRequest {
    pub chunk_size_bytes: Option<u64>,
    pub chunks: Option<u32>,
    pub uploader_address: Option<String>,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadResponse {
    pub id: uuid::Uuid,
    pub chunk_size: u64,
    pub expires_at: DateTime<Utc>,
}

/// `POST /v1/upload`: allocate a multipart upload.
pub async fn create_upload(
    State(core): State<Arc<Core>>,
    body: Option<Json<CreateUploadRequest>>,
) -> Result<Json<CreateUploadResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let chunk_size = req
        .chunk_size_bytes
        .unwrap_or(core.config.multipart_chunk_size)
        .clamp(256 * 1024, core.config.max_data_item_bytes);
    let upload_id = uuid::Uuid::new_v4();
    let expires_at = Utc::now() + chrono::Duration::seconds(core.config.multipart_ttl_secs as i64);

    multipart::create_upload(
        upload_id,
        req.uploader_address.as_deref(),
        chunk_size as i64,
        req.chunks.map(|c| c as i32),
        expires_at,
        &core.pool,
    )
    .await?;

    Ok(Json(CreateUploadResponse {
        id: upload_id,
        chunk_size,
        expires_at,
    }))
}

/// `PUT /v1/upload/:id/:chunk`: stream one chunk into the store.
pub async fn put_chunk(
    State(core): State<Arc<Core>>,
    Path((upload_id, chunk_index)): Path<(uuid::Uuid, u32)>,
    body: axum::body::Body,
) -> Result<Json<serde_json::Value>, ApiError> {
    let upload = multipart::get_upload(upload_id, &core.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown upload"))?;
    if upload.finalized {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "AlreadyFinalized",
            anyhow::anyhow!("upload is already finalized"),
        ));
    }
    if upload.expires_at <= Utc::now() {
        return Err(ApiError::not_found("upload has expired"));
    }
    if let Some(expected) = upload.expected_chunks {
        if chunk_index as i32 >= expected {
            return Err(ApiError::bad_request("chunk index out of range"));
        }
    }

    let key = blobs::keys::multipart_part(upload_id, chunk_index);
    let mut writer = core.blobs.open_writer(&key, None);
    let mut stream = body.into_data_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|err| ApiError::bad_request(format!("request body error: {err}")))?;
        written += chunk.len() as u64;
        if written > upload.chunk_size as u64 {
            let _ = writer.abort().await;
            return Err(ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "SizeExceeded",
                anyhow::anyhow!("chunk exceeds the upload's chunk size"),
            ));
        }
        writer.write_all(&chunk).await.map_err(|err| {
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "DurabilityUnavailable",
                anyhow::anyhow!("failed to persist chunk: {err}"),
            )
        })?;
    }
    writer.shutdown().await.map_err(|err| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "DurabilityUnavailable",
            anyhow::anyhow!("failed to persist chunk: {err}"),
        )
    })?;

    multipart::record_chunk(upload_id, chunk_index as i32, &core.pool).await?;

    Ok(Json(serde_json::json!({
        "id": upload_id,
        "chunkIndex": chunk_index,
        "size": written,
    })))
}

/// `POST /v1/upload/:id`: enqueue assembly of the chunks into a data item.
pub async fn finalize_upload(
    State(core): State<Arc<Core>>,
    Path(upload_id): Path<uuid::Uuid>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let upload = multipart::get_upload(upload_id, &core.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown upload"))?;
    if upload.finalized {
        return Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "id": upload_id,
                "status": "finalized",
                "dataItemId": upload.data_item_id,
            })),
        ));
    }

    core.jobs
        .enqueue(
            Queue::FinalizeMultipart,
            &FinalizeJob { upload_id },
            EnqueueOptions {
                max_attempts: 5,
                dedupe_key: Some(format!("finalize-{upload_id}")),
                ..Default::default()
            },
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "id": upload_id,
            "status": "finalizing",
        })),
    ))
}

/// `DELETE /v1/upload/:id`: abort and discard staged chunks.
pub async fn abort_upload(
    State(core): State<Arc<Core>>,
    Path(upload_id): Path<uuid::Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let upload = multipart::get_upload(upload_id, &core.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown upload"))?;

    for index in 0..upload.received_chunks.max(0) as u32 {
        let _ = core
            .blobs
            .delete(&blobs::keys::multipart_part(upload_id, index))
            .await;
    }
    multipart::delete_upload(upload_id, &core.pool).await?;

    Ok(Json(serde_json::json!({ "id": upload_id, "status": "aborted" })))
}

/// `GET /v1/upload/:id`: progress report.
pub async fn get_progress(
    State(core): State<Arc<Core>>,
    Path(upload_id): Path<uuid::Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let upload = multipart::get_upload(upload_id, &core.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown upload"))?;

    Ok(Json(serde_json::json!({
        "id": upload_id,
        "chunkSize": upload.chunk_size,
        "receivedChunks": upload.received_chunks,
        "expectedChunks": upload.expected_chunks,
        "finalized": upload.finalized,
        "dataItemId": upload.data_item_id,
        "failure": upload.failure,
        "expiresAt": upload.expires_at,
    })))
}
