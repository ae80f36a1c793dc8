//! The admission pipeline: validate a streamed data item, persist it
//! durably, reserve credit, commit its row, and only then sign a receipt.
//! The receipt ordering is the load-bearing invariant here: a client holding
//! a receipt is guaranteed a durable object at `raw/{id}` and a committed
//! `new_data_item` row.

use crate::core::Core;
use crate::credit::{CreditError, ReserveRequest};
use crate::receipt::sign_receipt;
use crate::workers::{OpticalJob, PlanJob, UnbundleJob};
use ans104::deep_hash::StreamHasher;
use ans104::parse::{ParseError, ParsedItem};
use ans104::tags::{self, Tag};
use ans104::{sign_header, ItemDraft, ItemSigner, Parser};
use bundler_sql::data_items::{self, DataItemRow, InsertOutcome, StatusRow};
use bytes::Bytes;
use futures::StreamExt;
use jobs::{enqueue_with, EnqueueOptions, Queue};
use models::{
    DataItemId, ItemStatus, PriorityClass, Receipt, SignatureType, SignedReceipt, Winston,
    RECEIPT_VERSION,
};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error("data item signature verification failed")]
    InvalidSignature,
    #[error("malformed data item: {0}")]
    MalformedItem(String),
    #[error("stream length disagrees with the declared content length")]
    SizeMismatch,
    #[error("data item exceeds the accepted size limit")]
    SizeExceeded,
    #[error("insufficient credit for this upload")]
    InsufficientCredit,
    #[error("durable storage is unavailable")]
    DurabilityUnavailable,
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),
}

impl AdmitError {
    /// Stable machine-readable error code surfaced to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "InvalidSignature",
            Self::MalformedItem(_) => "MalformedItem",
            Self::SizeMismatch => "SizeMismatch",
            Self::SizeExceeded => "SizeExceeded",
            Self::InsufficientCredit => "InsufficientCredit",
            Self::DurabilityUnavailable => "DurabilityUnavailable",
            Self::TransientUpstream(_) => "TransientUpstream",
        }
    }
}

impl From<ParseError> for AdmitError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::SignatureInvalid => Self::InvalidSignature,
            ParseError::SizeMismatch { .. } => Self::SizeMismatch,
            ParseError::SizeExceeded { .. } => Self::SizeExceeded,
            other => Self::MalformedItem(other.to_string()),
        }
    }
}

impl From<CreditError> for AdmitError {
    fn from(err: CreditError) -> Self {
        match err {
            CreditError::Insufficient => Self::InsufficientCredit,
            CreditError::Upstream(msg) => Self::TransientUpstream(msg),
        }
    }
}

fn transient(err: impl std::fmt::Display) -> AdmitError {
    AdmitError::TransientUpstream(err.to_string())
}

/// Request metadata accompanying the byte stream.
#[derive(Debug, Default)]
pub struct AdmitRequest {
    pub declared_len: u64,
    pub content_type: Option<String>,
    /// `X-Tag-*` headers, applied to raw-mode uploads.
    pub tag_headers: Vec<Tag>,
    pub paid_by: Option<String>,
}

/// The acknowledgment body returned for both fresh and duplicate uploads.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadAck {
    pub id: DataItemId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub winc: Winston,
    #[serde(rename = "dataCaches")]
    pub data_caches: Vec<String>,
    #[serde(rename = "fastFinalityIndexes")]
    pub fast_finality_indexes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<SignedReceipt>,
}

#[derive(Debug)]
pub enum Admitted {
    /// Freshly admitted, with a signed receipt.
    Fresh(UploadAck),
    /// The id was already in flight or known; stable ack, no new charge.
    Duplicate(UploadAck),
}

impl Admitted {
    pub fn ack(&self) -> &UploadAck {
        match self {
            Self::Fresh(ack) | Self::Duplicate(ack) => ack,
        }
    }
}

/// Metadata of an item that has been fully staged and validated, ready for
/// its admission transaction.
struct AdmissionMeta {
    id: DataItemId,
    owner_address: String,
    signature_type: SignatureType,
    byte_count: u64,
    payload_data_start: u64,
    content_type: Option<String>,
    priority: PriorityClass,
    is_bdi: bool,
}

/// Classify an item's priority from its tags.
pub fn priority_for(item_tags: &[Tag]) -> PriorityClass {
    if tags::find(item_tags, "Data-Protocol")
        .map(|v| v.eq_ignore_ascii_case("ao"))
        .unwrap_or(false)
    {
        PriorityClass::Ao
    } else if tags::find(item_tags, "App-Name")
        .map(|v| v.eq_ignore_ascii_case("warp"))
        .unwrap_or(false)
    {
        PriorityClass::Warp
    } else {
        PriorityClass::Default
    }
}

/// Does this item declare itself a nested bundle (BDI)?
pub fn is_bundle_item(item_tags: &[Tag]) -> bool {
    tags::find(item_tags, "Bundle-Format")
        .map(|v| v.eq_ignore_ascii_case("binary"))
        .unwrap_or(false)
        && tags::find(item_tags, "Bundle-Version")
            .map(|v| v.starts_with("2."))
            .unwrap_or(false)
}

/// Admit a single upload: a signed data item, or (when enabled) raw bytes
/// the service signs on the uploader's behalf.
pub async fn admit_single<S>(
    core: &Arc<Core>,
    mut body: S,
    req: AdmitRequest,
) -> Result<Admitted, AdmitError>
where
    S: futures::Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
{
    if req.declared_len < 2 {
        return Err(AdmitError::MalformedItem("upload is too short".to_string()));
    }

    // Peek the first two bytes to decide between the signed and raw paths.
    let mut first = bytes::BytesMut::new();
    while first.len() < 2 {
        match body.next().await {
            Some(Ok(chunk)) => first.extend_from_slice(&chunk),
            Some(Err(err)) => return Err(transient(err)),
            None => {
                return Err(AdmitError::MalformedItem("upload is too short".to_string()));
            }
        }
    }
    let first = first.freeze();
    let scheme = u16::from_le_bytes([first[0], first[1]]);

    if SignatureType::from_u16(scheme).is_some() {
        admit_signed(core, first, body, req).await
    } else if core.config.allow_raw_uploads {
        admit_raw(core, first, body, req).await
    } else {
        Err(AdmitError::MalformedItem(format!(
            "unsupported signature type {scheme}"
        )))
    }
}

enum IngestEnd {
    Parsed(ParsedItem),
    Duplicate {
        id: DataItemId,
        status: Option<StatusRow>,
    },
}

async fn admit_signed<S>(
    core: &Arc<Core>,
    first: Bytes,
    body: S,
    req: AdmitRequest,
) -> Result<Admitted, AdmitError>
where
    S: futures::Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
{
    let staging_token = uuid::Uuid::new_v4();
    let staging = blobs::keys::staging(staging_token);
    let mut writer = core.blobs.open_writer(&staging, None);
    let mut parser = Parser::new(req.declared_len, Some(core.config.max_data_item_bytes))?;

    let mut stream = futures::stream::iter(std::iter::once(Ok(first))).chain(body);
    let mut seen_id: Option<DataItemId> = None;
    let mut marker: Option<String> = None;
    let mut reserved: Option<(DataItemId, Winston)> = None;

    // The whole ingest runs under the request deadline; timing out takes
    // the same cleanup path as any other mid-stream failure.
    let ingest = async {
        loop {
            let Some(chunk) = stream.next().await else {
                break;
            };
            let chunk = chunk.map_err(transient)?;
            parser.push(&chunk)?;

            // The id becomes available as soon as the signature field has
            // streamed; duplicate and in-flight checks run immediately so a
            // known id never costs a second store write.
            if seen_id.is_none() {
                if let Some(id) = parser.id() {
                    seen_id = Some(id);

                    let status = data_items::data_item_status(&id.to_string(), &core.pool)
                        .await
                        .map_err(transient)?;
                    if status.status != ItemStatus::NotFound {
                        return Ok(IngestEnd::Duplicate {
                            id,
                            status: Some(status),
                        });
                    }

                    let key = cache::inflight_key(&id.to_string());
                    if !core
                        .cache
                        .set_nx(&key, "1", core.config.inflight_ttl())
                        .await
                    {
                        return Ok(IngestEnd::Duplicate { id, status: None });
                    }
                    marker = Some(key);
                }
            }

            // Reserve credit as soon as the owner is known, while the body
            // is still streaming.
            if reserved.is_none() {
                if let (Some(id), Some((scheme, owner))) = (parser.id(), parser.owner_address()) {
                    let winc = core
                        .credit
                        .reserve(ReserveRequest {
                            owner: &owner,
                            byte_count: req.declared_len,
                            data_item_id: id,
                            signature_type: scheme,
                            paid_by: req.paid_by.as_deref(),
                        })
                        .await?;
                    reserved = Some((id, winc));
                }
            }

            writer
                .write_all(&chunk)
                .await
                .map_err(|_| AdmitError::DurabilityUnavailable)?;
        }
        Ok(IngestEnd::Parsed(parser.finish()?))
    };
    let end: Result<IngestEnd, AdmitError> =
        match tokio::time::timeout(core.config.request_timeout(), ingest).await {
            Ok(end) => end,
            Err(_) => Err(AdmitError::TransientUpstream(
                "request deadline exceeded".to_string(),
            )),
        };

    match end {
        Err(err) => {
            abandon_staged(core, &mut writer, &staging, seen_id, staging_token, &err).await;
            release(core, marker, reserved).await;
            Err(err)
        }
        Ok(IngestEnd::Duplicate { id, status }) => {
            let _ = writer.abort().await;
            release(core, marker, reserved).await;
            Ok(Admitted::Duplicate(duplicate_ack(core, id, None, status)))
        }
        Ok(IngestEnd::Parsed(item)) => {
            // Durability first: the staged write must ack before anything
            // else happens.
            if writer.shutdown().await.is_err() {
                release(core, marker, reserved).await;
                return Err(AdmitError::DurabilityUnavailable);
            }

            // Read back the stored size and insist it matches the claim.
            let meta = match core.blobs.head(&staging).await {
                Ok(meta) => meta,
                Err(err) => {
                    release(core, marker, reserved).await;
                    return Err(transient(err));
                }
            };
            if meta.size as u64 != req.declared_len {
                let err = AdmitError::SizeMismatch;
                quarantine(core, &staging, &item.id.to_string()).await;
                release(core, marker, reserved).await;
                return Err(err);
            }

            let raw_key = blobs::keys::raw(item.id);
            if let Err(err) = core.blobs.rename(&staging, &raw_key).await {
                release(core, marker, reserved).await;
                return Err(transient(err));
            }

            let winc = reserved.map(|(_, winc)| winc).unwrap_or_default();
            let meta = AdmissionMeta {
                id: item.id,
                owner_address: item.owner_address.clone(),
                signature_type: item.signature_type,
                byte_count: item.byte_count,
                payload_data_start: item.payload_data_start,
                content_type: item.content_type.clone(),
                priority: priority_for(&item.tags),
                is_bdi: is_bundle_item(&item.tags),
            };
            finalize_admission(core, meta, winc, marker).await
        }
    }
}

async fn admit_raw<S>(
    core: &Arc<Core>,
    first: Bytes,
    body: S,
    req: AdmitRequest,
) -> Result<Admitted, AdmitError>
where
    S: futures::Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
{
    let payload_token = uuid::Uuid::new_v4();
    let payload_key = blobs::keys::staging(payload_token);
    let mut writer = core.blobs.open_writer(&payload_key, None);
    let mut hasher = StreamHasher::default();
    let mut stream = futures::stream::iter(std::iter::once(Ok(first))).chain(body);

    let ingest = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transient)?;
            if hasher.len() + chunk.len() as u64 > req.declared_len {
                return Err(AdmitError::SizeMismatch);
            }
            if hasher.len() + chunk.len() as u64 > core.config.max_data_item_bytes {
                return Err(AdmitError::SizeExceeded);
            }
            hasher.update(&chunk);
            writer
                .write_all(&chunk)
                .await
                .map_err(|_| AdmitError::DurabilityUnavailable)?;
        }
        if hasher.len() != req.declared_len {
            return Err(AdmitError::SizeMismatch);
        }
        Ok(())
    };
    let staged: Result<(), AdmitError> =
        match tokio::time::timeout(core.config.request_timeout(), ingest).await {
            Ok(staged) => staged,
            Err(_) => Err(AdmitError::TransientUpstream(
                "request deadline exceeded".to_string(),
            )),
        };

    if let Err(err) = staged {
        abandon_staged(core, &mut writer, &payload_key, None, payload_token, &err).await;
        return Err(err);
    }
    if writer.shutdown().await.is_err() {
        return Err(AdmitError::DurabilityUnavailable);
    }
    let (payload_len, payload_hash) = hasher.finalize();

    // Synthesize the signed item: service signature plus attribution tags.
    let payer = req
        .paid_by
        .clone()
        .unwrap_or_else(|| core.wallet.address());
    let content_type = req
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let mut item_tags = vec![
        Tag::new("Content-Type", content_type.clone()),
        Tag::new("Upload-Type", "raw"),
        Tag::new(
            "Upload-Timestamp",
            chrono::Utc::now().timestamp_millis().to_string(),
        ),
        Tag::new("Payer-Address", payer.clone()),
    ];
    for (name, value) in core.config.parsed_raw_tags() {
        item_tags.push(Tag::new(name, value));
    }
    item_tags.extend(req.tag_headers.iter().cloned());

    let draft = ItemDraft {
        target: None,
        anchor: None,
        tags: item_tags,
    };
    let signer = ItemSigner::Arweave(core.wallet.key().clone());
    let header = sign_header(&signer, &draft, payload_len, payload_hash)
        .map_err(|err| AdmitError::MalformedItem(err.to_string()))?;
    let sig_len = SignatureType::Arweave.signature_len();
    let id = DataItemId::from_signature(&header[2..2 + sig_len]);
    let byte_count = header.len() as u64 + payload_len;

    // Duplicate and in-flight handling, now that the id is known.
    let status = data_items::data_item_status(&id.to_string(), &core.pool)
        .await
        .map_err(transient)?;
    if status.status != ItemStatus::NotFound {
        let _ = core.blobs.delete(&payload_key).await;
        return Ok(Admitted::Duplicate(duplicate_ack(
            core,
            id,
            Some(core.wallet.address()),
            Some(status),
        )));
    }
    let marker_key = cache::inflight_key(&id.to_string());
    if !core
        .cache
        .set_nx(&marker_key, "1", core.config.inflight_ttl())
        .await
    {
        let _ = core.blobs.delete(&payload_key).await;
        return Ok(Admitted::Duplicate(duplicate_ack(
            core,
            id,
            Some(core.wallet.address()),
            None,
        )));
    }
    let marker = Some(marker_key);

    let reserve = core
        .credit
        .reserve(ReserveRequest {
            owner: &payer,
            byte_count,
            data_item_id: id,
            signature_type: SignatureType::Arweave,
            paid_by: None,
        })
        .await;
    let winc = match reserve {
        Ok(winc) => winc,
        Err(err) => {
            let _ = core.blobs.delete(&payload_key).await;
            release(core, marker, None).await;
            return Err(err.into());
        }
    };

    // Assemble header + payload into the final raw object.
    let assembled: Result<(), AdmitError> = async {
        let final_token = uuid::Uuid::new_v4();
        let final_key = blobs::keys::staging(final_token);
        let mut out = core.blobs.open_writer(&final_key, Some(&content_type));
        out.write_all(&header)
            .await
            .map_err(|_| AdmitError::DurabilityUnavailable)?;

        let mut payload = core.blobs.get_stream(&payload_key).await.map_err(transient)?;
        while let Some(chunk) = payload.next().await {
            let chunk = chunk.map_err(transient)?;
            out.write_all(&chunk)
                .await
                .map_err(|_| AdmitError::DurabilityUnavailable)?;
        }
        out.shutdown()
            .await
            .map_err(|_| AdmitError::DurabilityUnavailable)?;

        let stored = core.blobs.head(&final_key).await.map_err(transient)?;
        if stored.size as u64 != byte_count {
            quarantine(core, &final_key, &id.to_string()).await;
            return Err(AdmitError::SizeMismatch);
        }
        core.blobs
            .rename(&final_key, &blobs::keys::raw(id))
            .await
            .map_err(transient)?;
        Ok(())
    }
    .await;

    let _ = core.blobs.delete(&payload_key).await;
    if let Err(err) = assembled {
        release(core, marker, Some((id, winc))).await;
        return Err(err);
    }

    let meta = AdmissionMeta {
        id,
        owner_address: core.wallet.address(),
        signature_type: SignatureType::Arweave,
        byte_count,
        payload_data_start: header.len() as u64,
        content_type: Some(content_type),
        priority: priority_for(&draft.tags),
        is_bdi: false,
    };
    finalize_admission(core, meta, winc, marker).await
}

/// The short admission transaction: insert the row, enqueue follow-up jobs
/// atomically, then sign the receipt. Any failure after this point's store
/// write quarantines the object and refunds the reservation.
async fn finalize_admission(
    core: &Arc<Core>,
    meta: AdmissionMeta,
    winc: Winston,
    marker: Option<String>,
) -> Result<Admitted, AdmitError> {
    let deadline_height = core.height.get() + core.config.deadline_height_increment;
    let now = chrono::Utc::now();

    let row = DataItemRow {
        data_item_id: meta.id.to_string(),
        owner_address: meta.owner_address.clone(),
        signature_type: meta.signature_type.as_u16() as i16,
        byte_count: meta.byte_count as i64,
        payload_data_start: meta.payload_data_start as i64,
        payload_content_type: meta.content_type.clone(),
        priority: meta.priority,
        winc: winc.0 as i64,
        deadline_height: deadline_height as i64,
        retry_count: 0,
        uploaded_at: now,
    };

    let committed: Result<InsertOutcome, AdmitError> = async {
        let mut txn = core.pool.begin().await.map_err(transient)?;
        let outcome = data_items::insert_new_data_item(&row, &mut *txn)
            .await
            .map_err(transient)?;

        if outcome == InsertOutcome::Inserted {
            enqueue_with(
                Queue::Optical,
                &OpticalJob { id: row.data_item_id.clone() },
                EnqueueOptions {
                    max_attempts: 5,
                    ..Default::default()
                },
                &mut *txn,
            )
            .await
            .map_err(transient)?;

            if meta.is_bdi {
                enqueue_with(
                    Queue::Unbundle,
                    &UnbundleJob { id: row.data_item_id.clone() },
                    EnqueueOptions {
                        delay: std::time::Duration::from_secs(30),
                        max_attempts: 10,
                        ..Default::default()
                    },
                    &mut *txn,
                )
                .await
                .map_err(transient)?;
            }

            // Backlog pressure: nudge the planner for this class.
            enqueue_with(
                Queue::Plan,
                &PlanJob {
                    class: meta.priority,
                },
                EnqueueOptions {
                    delay: std::time::Duration::from_secs(10),
                    max_attempts: 3,
                    dedupe_key: Some(format!("plan-{}", meta.priority.as_str())),
                },
                &mut *txn,
            )
            .await
            .map_err(transient)?;
        }

        txn.commit().await.map_err(transient)?;
        Ok(outcome)
    }
    .await;

    match committed {
        Err(err) => {
            // The bytes are already at raw/{id}; a failed admission
            // transaction moves them aside for forensics.
            quarantine(core, &blobs::keys::raw(meta.id), &meta.id.to_string()).await;
            release(core, marker, Some((meta.id, winc))).await;
            Err(err)
        }
        Ok(InsertOutcome::Duplicate) => {
            // Lost a race with another instance: stable ack, single charge.
            release(core, marker, Some((meta.id, winc))).await;
            let status = data_items::data_item_status(&meta.id.to_string(), &core.pool)
                .await
                .ok();
            Ok(Admitted::Duplicate(duplicate_ack(
                core,
                meta.id,
                Some(meta.owner_address),
                status,
            )))
        }
        Ok(InsertOutcome::Inserted) => {
            let receipt = sign_receipt(
                &core.wallet,
                Receipt {
                    id: meta.id,
                    timestamp: now.timestamp_millis(),
                    winc,
                    version: RECEIPT_VERSION.to_string(),
                    deadline_height,
                },
            );

            if let Err(err) = core.credit.finalize(meta.id, meta.byte_count).await {
                tracing::warn!(id = %meta.id, ?err, "credit finalize failed (reservation stands)");
            }
            if let Some(marker) = marker {
                core.cache.del(&marker).await;
            }

            Ok(Admitted::Fresh(UploadAck {
                id: meta.id,
                owner: Some(meta.owner_address),
                winc,
                data_caches: core.config.data_caches.clone(),
                fast_finality_indexes: core.config.fast_finality_indexes.clone(),
                receipt: Some(receipt),
            }))
        }
    }
}

fn duplicate_ack(
    core: &Arc<Core>,
    id: DataItemId,
    owner: Option<String>,
    status: Option<StatusRow>,
) -> UploadAck {
    UploadAck {
        id,
        owner,
        winc: status
            .and_then(|s| s.winc)
            .map(|w| Winston(w.max(0) as u64))
            .unwrap_or_default(),
        data_caches: core.config.data_caches.clone(),
        fast_finality_indexes: core.config.fast_finality_indexes.clone(),
        receipt: None,
    }
}

/// Persist whatever was staged and move it under `quarantine/` so failed
/// admissions stay inspectable. Credit-rejections abort instead: nothing
/// was durably committed, so there is nothing to keep.
async fn abandon_staged(
    core: &Arc<Core>,
    writer: &mut blobs::BlobWriter,
    staging: &blobs::Path,
    id: Option<DataItemId>,
    token: uuid::Uuid,
    err: &AdmitError,
) {
    if matches!(err, AdmitError::InsufficientCredit) {
        let _ = writer.abort().await;
        return;
    }
    if writer.shutdown().await.is_ok() {
        let name = id.map(|id| id.to_string()).unwrap_or_else(|| token.to_string());
        quarantine(core, staging, &name).await;
    }
}

async fn quarantine(core: &Arc<Core>, from: &blobs::Path, name: &str) {
    let dest = blobs::keys::quarantine(name);
    if let Err(err) = core.blobs.rename(from, &dest).await {
        tracing::error!(%from, %dest, ?err, "failed to quarantine object");
    }
}

/// Drop the in-flight marker and refund any credit reservation.
async fn release(core: &Arc<Core>, marker: Option<String>, reserved: Option<(DataItemId, Winston)>) {
    if let Some((id, _)) = reserved {
        if let Err(err) = core.credit.refund(id).await {
            tracing::warn!(%id, ?err, "credit refund failed");
        }
    }
    if let Some(marker) = marker {
        core.cache.del(&marker).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn priority_is_classified_from_tags() {
        assert_eq!(priority_for(&[]), PriorityClass::Default);
        assert_eq!(
            priority_for(&[Tag::new("Data-Protocol", "ao")]),
            PriorityClass::Ao
        );
        assert_eq!(
            priority_for(&[Tag::new("App-Name", "Warp")]),
            PriorityClass::Warp
        );
        // ao wins over warp when both appear.
        assert_eq!(
            priority_for(&[
                Tag::new("App-Name", "Warp"),
                Tag::new("Data-Protocol", "AO")
            ]),
            PriorityClass::Ao
        );
    }

    #[test]
    fn bundle_items_need_both_markers() {
        assert!(is_bundle_item(&[
            Tag::new("Bundle-Format", "binary"),
            Tag::new("Bundle-Version", "2.0.0"),
        ]));
        assert!(!is_bundle_item(&[Tag::new("Bundle-Format", "binary")]));
        assert!(!is_bundle_item(&[
            Tag::new("Bundle-Format", "binary"),
            Tag::new("Bundle-Version", "1.0.0"),
        ]));
    }
}
