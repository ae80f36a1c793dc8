use super::error::ApiError;
use crate::admit::{admit_single, AdmitRequest};
use crate::core::Core;
use ans104::tags::Tag;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use bundler_sql::{data_items, offsets};
use bytes::{BufMut, BytesMut};
use futures::StreamExt;
use models::{DataItemId, SignatureType};
use std::sync::Arc;

fn declared_length(headers: &HeaderMap) -> Result<u64, ApiError> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::LENGTH_REQUIRED,
                "LengthRequired",
                anyhow::anyhow!("a Content-Length header is required"),
            )
        })
}

fn admit_request(headers: &HeaderMap, declared_len: u64) -> AdmitRequest {
    let tag_headers = headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().strip_prefix("x-tag-")?;
            let value = value.to_str().ok()?;
            Some(Tag::new(name, value))
        })
        .collect();

    AdmitRequest {
        declared_len,
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        tag_headers,
        paid_by: headers
            .get("x-paid-by")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

fn body_stream(
    body: axum::body::Body,
) -> impl futures::Stream<Item = std::io::Result<bytes::Bytes>> + Unpin + Send {
    Box::pin(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))),
    )
}

/// `POST /v1/tx`: admit a signed data item (or a raw upload).
pub async fn post_tx(
    State(core): State<Arc<Core>>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<Json<crate::admit::UploadAck>, ApiError> {
    let declared_len = declared_length(&headers)?;
    let req = admit_request(&headers, declared_len);
    let admitted = admit_single(&core, body_stream(body), req).await?;
    Ok(Json(admitted.ack().clone()))
}

/// `POST /v1/tx/:id`: admit an item whose signature arrives out-of-band in
/// headers, with the body carrying everything after the signature field.
pub async fn post_tx_external_signature(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<Json<crate::admit::UploadAck>, ApiError> {
    let expect: DataItemId = id
        .parse()
        .map_err(|_| ApiError::bad_request("invalid data item id"))?;

    let scheme = headers
        .get("x-signature-type")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(SignatureType::from_u16)
        .ok_or_else(|| ApiError::bad_request("missing or unsupported x-signature-type header"))?;

    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| base64::decode_config(v, base64::URL_SAFE_NO_PAD).ok())
        .ok_or_else(|| ApiError::bad_request("missing or invalid x-signature header"))?;
    if signature.len() != scheme.signature_len() {
        return Err(ApiError::bad_request("signature length does not match scheme"));
    }
    if DataItemId::from_signature(&signature) != expect {
        return Err(ApiError::bad_request("signature does not hash to the item id"));
    }

    let declared_body = declared_length(&headers)?;
    let declared_len = 2 + signature.len() as u64 + declared_body;

    let mut prefix = BytesMut::with_capacity(2 + signature.len());
    prefix.put_u16_le(scheme.as_u16());
    prefix.put_slice(&signature);

    let stream = Box::pin(
        futures::stream::iter(std::iter::once(Ok(prefix.freeze()))).chain(body_stream(body)),
    );

    let req = admit_request(&headers, declared_len);
    let admitted = admit_single(&core, stream, req).await?;
    Ok(Json(admitted.ack().clone()))
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub id: String,
    pub status: models::ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<models::FailureReason>,
}

/// `GET /v1/tx/:id/status`
pub async fn get_status(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let _: DataItemId = id
        .parse()
        .map_err(|_| ApiError::bad_request("invalid data item id"))?;

    let row = data_items::data_item_status(&id, &core.pool).await?;
    Ok(Json(StatusResponse {
        id,
        status: row.status,
        bundle_id: row.bundle_id,
        block_height: row.block_height,
        winc: row.winc.map(|w| w.to_string()),
        reason: row.reason,
    }))
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetResponse {
    pub data_item_id: String,
    pub root_bundle_id: String,
    pub start_offset_in_root_bundle: i64,
    pub raw_content_length: i64,
    pub payload_data_start: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_data_item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_offset_in_parent_payload: Option<i64>,
}

/// `GET /v1/tx/:id/offset`
pub async fn get_offset(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
) -> Result<Json<OffsetResponse>, ApiError> {
    let _: DataItemId = id
        .parse()
        .map_err(|_| ApiError::bad_request("invalid data item id"))?;

    let row = offsets::get_offset(&id, &core.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("no offset record for this item"))?;

    Ok(Json(OffsetResponse {
        data_item_id: row.data_item_id,
        root_bundle_id: row.root_bundle_id,
        start_offset_in_root_bundle: row.start_offset_in_root_bundle,
        raw_content_length: row.raw_content_length,
        payload_data_start: row.payload_data_start,
        payload_content_type: row.payload_content_type,
        parent_data_item_id: row.parent_data_item_id,
        start_offset_in_parent_payload: row.start_offset_in_parent_payload,
    }))
}
