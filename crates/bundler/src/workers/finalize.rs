//! The multipart finalizer: concatenates an upload's staged parts into one
//! stream and runs it through the standard admission path, so a multipart
//! upload ends up indistinguishable from a single-shot one.

use super::FinalizeJob;
use crate::admit::{admit_single, AdmitError, AdmitRequest, Admitted};
use crate::core::Core;
use anyhow::Context;
use bundler_sql::multipart;
use futures::{StreamExt, TryStreamExt};
use jobs::{JobHandler, Queue};
use std::sync::Arc;

pub struct FinalizeHandler {
    pub core: Arc<Core>,
}

#[async_trait::async_trait]
impl JobHandler for FinalizeHandler {
    type Payload = FinalizeJob;

    fn queue(&self) -> Queue {
        Queue::FinalizeMultipart
    }

    async fn handle(&self, job: FinalizeJob) -> anyhow::Result<()> {
        finalize_upload(&self.core, job.upload_id).await
    }

    async fn exhausted(&self, job: FinalizeJob, error: &str) -> anyhow::Result<()> {
        multipart::mark_failure(job.upload_id, error, &self.core.pool).await?;
        tracing::error!(upload_id = %job.upload_id, error, "multipart finalize abandoned");
        Ok(())
    }
}

fn to_io(err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
}

async fn fetch_part(
    blobs: blobs::BlobStore,
    key: blobs::Path,
) -> std::io::Result<impl futures::Stream<Item = std::io::Result<bytes::Bytes>>> {
    blobs
        .get_stream(&key)
        .await
        .map(|inner| inner.map_err(to_io))
        .map_err(to_io)
}

async fn finalize_upload(core: &Arc<Core>, upload_id: uuid::Uuid) -> anyhow::Result<()> {
    let Some(upload) = multipart::get_upload(upload_id, &core.pool).await? else {
        tracing::warn!(%upload_id, "finalize skipped; upload row is gone");
        return Ok(());
    };
    if upload.finalized {
        return Ok(());
    }

    let part_count = upload
        .expected_chunks
        .unwrap_or(upload.received_chunks)
        .max(0) as u32;
    anyhow::ensure!(part_count > 0, "upload has no parts to assemble");

    // Every part must be present, and the declared length is their sum.
    let mut parts = Vec::with_capacity(part_count as usize);
    let mut total = 0u64;
    for index in 0..part_count {
        let key = blobs::keys::multipart_part(upload_id, index);
        let meta = core
            .blobs
            .head(&key)
            .await
            .with_context(|| format!("part {index} is missing"))?;
        total += meta.size as u64;
        parts.push(key);
    }

    let blobs = core.blobs.clone();
    let stream = Box::pin(
        futures::stream::iter(parts.clone())
            .then(move |key| fetch_part(blobs.clone(), key))
            .try_flatten(),
    );

    let req = AdmitRequest {
        declared_len: total,
        content_type: None,
        tag_headers: Vec::new(),
        paid_by: upload.uploader_address.clone(),
    };

    match admit_single(core, stream, req).await {
        Ok(admitted) => {
            let id = admitted.ack().id.to_string();
            multipart::mark_finalized(upload_id, &id, &core.pool).await?;
            cleanup_parts(core, &parts).await;
            if let Admitted::Fresh(_) = admitted {
                tracing::info!(%upload_id, id, parts = part_count, bytes = total, "multipart upload admitted");
            } else {
                tracing::info!(%upload_id, id, "multipart upload matched an existing item");
            }
            Ok(())
        }
        // Terminal admission failures will not improve with retries; record
        // them on the upload row and stop.
        Err(
            err @ (AdmitError::InvalidSignature
            | AdmitError::MalformedItem(_)
            | AdmitError::SizeMismatch
            | AdmitError::SizeExceeded
            | AdmitError::InsufficientCredit),
        ) => {
            multipart::mark_failure(upload_id, &err.to_string(), &core.pool).await?;
            cleanup_parts(core, &parts).await;
            tracing::warn!(%upload_id, %err, "multipart assembly produced an inadmissible item");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn cleanup_parts(core: &Arc<Core>, parts: &[blobs::Path]) {
    for key in parts {
        if let Err(err) = core.blobs.delete(key).await {
            tracing::warn!(%key, ?err, "failed to delete multipart part");
        }
    }
}
