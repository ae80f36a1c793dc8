//! The nested-bundle unbundler: when an admitted item is itself a bundle
//! (a BDI), parse its children out of the stored payload and index their
//! offsets, linked to the parent.
//!
//! Child offsets are anchored in the same root bundle as the parent, so the
//! job requires the parent's own offset record; until the preparer writes
//! it, this job fails and retries on backoff.

use super::{OffsetsJob, OpticalJob, UnbundleJob};
use crate::core::Core;
use anyhow::Context;
use bundler_sql::data_items;
use bundler_sql::offsets::{self, OffsetRow};
use jobs::{JobHandler, Queue};
use models::DataItemId;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Window for incremental reads of child items out of the parent payload.
const READ_WINDOW: u64 = 1024 * 1024;

pub struct UnbundleHandler {
    pub core: Arc<Core>,
}

#[async_trait::async_trait]
impl JobHandler for UnbundleHandler {
    type Payload = UnbundleJob;

    fn queue(&self) -> Queue {
        Queue::Unbundle
    }

    async fn handle(&self, job: UnbundleJob) -> anyhow::Result<()> {
        unbundle(&self.core, &job.id).await
    }

    async fn exhausted(&self, job: UnbundleJob, error: &str) -> anyhow::Result<()> {
        tracing::warn!(id = %job.id, error, "unbundling abandoned");
        Ok(())
    }
}

async fn unbundle(core: &Arc<Core>, id: &str) -> anyhow::Result<()> {
    let Some(parent) = data_items::find_item_row(id, &core.pool).await? else {
        tracing::debug!(id, "unbundle skipped; item row is gone");
        return Ok(());
    };
    let parent_offset = offsets::get_offset(id, &core.pool)
        .await?
        .context("parent has no offset record yet")?;

    let parent_id: DataItemId = id.parse().context("unbundle job carries an invalid id")?;
    let parent_key = blobs::keys::raw(parent_id);
    let payload_start = parent.payload_data_start as u64;
    let payload_len = (parent.byte_count - parent.payload_data_start) as u64;
    if payload_len < 8 {
        tracing::warn!(id, "BDI payload is too short to be a bundle");
        return Ok(());
    }

    // The nested bundle's header sits at the head of the parent's payload.
    let count_bytes = core
        .blobs
        .get_range(&parent_key, payload_start..payload_start + 8)
        .await?;
    let count = u64::from_le_bytes(count_bytes.as_ref().try_into().unwrap());
    let header_len = ans104::bundle::header_len(count);
    anyhow::ensure!(
        header_len <= payload_len,
        "nested bundle header ({header_len} bytes) exceeds the payload ({payload_len} bytes)"
    );
    let header = core
        .blobs
        .get_range(&parent_key, payload_start..payload_start + header_len)
        .await?;
    let entries = ans104::decode_header(&header).context("decoding nested bundle header")?;

    let expires_at =
        chrono::Utc::now() + chrono::Duration::seconds(core.config.offset_ttl_secs as i64);
    let mut rows = Vec::with_capacity(entries.len());
    let mut cursor = header_len; // Offset within the parent payload.

    for entry in &entries {
        let child_start = cursor;
        cursor += entry.size;
        anyhow::ensure!(
            cursor <= payload_len,
            "nested bundle entries overrun the parent payload"
        );

        match parse_child(core, &parent_key, payload_start + child_start, entry.size).await {
            Ok(child) => {
                if child.id != entry.id {
                    tracing::warn!(
                        id,
                        child = %entry.id,
                        parsed = %child.id,
                        "nested child id disagrees with the bundle header; skipping"
                    );
                    continue;
                }
                rows.push(OffsetRow {
                    data_item_id: child.id.to_string(),
                    root_bundle_id: parent_offset.root_bundle_id.clone(),
                    start_offset_in_root_bundle: parent_offset.start_offset_in_root_bundle
                        + parent.payload_data_start
                        + child_start as i64,
                    raw_content_length: entry.size as i64,
                    payload_data_start: child.payload_data_start as i64,
                    payload_content_type: child.content_type.clone(),
                    parent_data_item_id: Some(id.to_string()),
                    start_offset_in_parent_payload: Some(child_start as i64),
                    expires_at,
                });

                if core.config.unbundle_copy_children {
                    copy_child(core, &parent_key, payload_start + child_start, entry.size, child.id)
                        .await?;
                    core.jobs
                        .enqueue(
                            Queue::Optical,
                            &OpticalJob {
                                id: child.id.to_string(),
                            },
                            jobs::EnqueueOptions {
                                max_attempts: 5,
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
            Err(err) => {
                // A malformed child invalidates itself, not its siblings.
                tracing::warn!(id, child = %entry.id, ?err, "nested child failed to parse");
            }
        }
    }

    for batch in rows.chunks(500) {
        core.jobs
            .enqueue(
                Queue::Offsets,
                &OffsetsJob {
                    rows: batch.to_vec(),
                },
                jobs::EnqueueOptions {
                    max_attempts: 8,
                    ..Default::default()
                },
            )
            .await?;
    }

    tracing::info!(id, children = rows.len(), of = entries.len(), "BDI unbundled");
    Ok(())
}

/// Parse one child item off windowed range reads of the parent object.
async fn parse_child(
    core: &Arc<Core>,
    parent_key: &blobs::Path,
    abs_start: u64,
    size: u64,
) -> anyhow::Result<ans104::ParsedItem> {
    let mut parser = ans104::Parser::new(size, None)?;
    let mut read = 0u64;
    while read < size {
        let end = (read + READ_WINDOW).min(size);
        let window = core
            .blobs
            .get_range(parent_key, abs_start + read..abs_start + end)
            .await?;
        parser.push(&window)?;
        read = end;
    }
    Ok(parser.finish()?)
}

/// Copy a child's bytes into its own raw object so it can be served (and
/// optically forwarded) like a directly admitted item.
async fn copy_child(
    core: &Arc<Core>,
    parent_key: &blobs::Path,
    abs_start: u64,
    size: u64,
    child_id: DataItemId,
) -> anyhow::Result<()> {
    let child_key = blobs::keys::raw(child_id);
    if core.blobs.exists(&child_key).await? {
        return Ok(());
    }
    let mut writer = core.blobs.open_writer(&child_key, None);
    let mut read = 0u64;
    while read < size {
        let end = (read + READ_WINDOW).min(size);
        let window = core
            .blobs
            .get_range(parent_key, abs_start + read..abs_start + end)
            .await?;
        writer.write_all(&window).await?;
        read = end;
    }
    writer.shutdown().await?;
    Ok(())
}
