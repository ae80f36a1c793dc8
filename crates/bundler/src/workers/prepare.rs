//! The bundle preparer: assembles a plan's items into the bundle header and
//! payload objects, records retrieval offsets, and hands off to the poster.

use super::{OffsetsJob, PostJob, PrepareJob};
use crate::core::Core;
use ans104::bundle::{derive_bundle_id, encode_header, BundleEntry};
use anyhow::Context;
use bundler_sql::{bundles, data_items, offsets::OffsetRow};
use futures::StreamExt;
use jobs::{JobHandler, Queue};
use models::DataItemId;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Offset rows per indexer job.
const OFFSET_BATCH: usize = 500;

pub struct PrepareHandler {
    pub core: Arc<Core>,
}

#[async_trait::async_trait]
impl JobHandler for PrepareHandler {
    type Payload = PrepareJob;

    fn queue(&self) -> Queue {
        Queue::Prepare
    }

    async fn handle(&self, job: PrepareJob) -> anyhow::Result<()> {
        prepare_plan(&self.core, job.plan_id).await
    }

    async fn exhausted(&self, job: PrepareJob, error: &str) -> anyhow::Result<()> {
        // The plan cannot be assembled; release its items for a fresh plan.
        tracing::error!(plan_id = %job.plan_id, error, "prepare exhausted; releasing items");
        let mut txn = self.core.pool.begin().await?;
        let (released, failed) = data_items::release_items_for_repack(
            job.plan_id,
            None,
            self.core.config.max_repacks,
            &mut txn,
        )
        .await?;
        if bundles::get_bundle(job.plan_id, &mut *txn).await?.is_some() {
            bundles::mark_failed(job.plan_id, &mut *txn).await?;
        }
        txn.commit().await?;
        tracing::warn!(plan_id = %job.plan_id, released, failed, "plan abandoned");
        Ok(())
    }
}

pub async fn prepare_plan(core: &Arc<Core>, plan_id: uuid::Uuid) -> anyhow::Result<()> {
    // A bundle row means a prior run completed its writes; just move on.
    if bundles::get_bundle(plan_id, &core.pool).await?.is_some() {
        enqueue_post(core, plan_id).await?;
        return Ok(());
    }

    let items = data_items::load_planned_items(plan_id, &core.pool).await?;
    if items.is_empty() {
        tracing::warn!(%plan_id, "prepare found no planned items; nothing to do");
        return Ok(());
    }

    let ids: Vec<DataItemId> = items
        .iter()
        .map(|item| item.data_item_id.parse())
        .collect::<Result<_, _>>()
        .context("planned row holds an invalid data item id")?;
    let bundle_id = derive_bundle_id(&ids);

    let entries: Vec<BundleEntry> = items
        .iter()
        .zip(&ids)
        .map(|(item, &id)| BundleEntry {
            size: item.byte_count as u64,
            id,
        })
        .collect();
    let header = encode_header(&entries);
    let header_byte_count = header.len() as i64;

    core.blobs
        .put(
            &blobs::keys::bundle_header(bundle_id),
            header.into(),
            None,
        )
        .await
        .context("writing bundle header")?;

    // Concatenate items into the payload in planner order, tracking each
    // item's offset as it lands.
    let payload_key = blobs::keys::bundle_payload(bundle_id);
    let mut writer = core.blobs.open_writer(&payload_key, None);
    let mut position = 0i64;
    let mut offset_rows = Vec::with_capacity(items.len());
    let expires_at =
        chrono::Utc::now() + chrono::Duration::seconds(core.config.offset_ttl_secs as i64);

    for (item, id) in items.iter().zip(&ids) {
        let mut stream = core
            .blobs
            .get_stream(&blobs::keys::raw(*id))
            .await
            .with_context(|| format!("opening raw item {id}"))?;
        let mut copied = 0i64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("reading raw item {id}"))?;
            copied += chunk.len() as i64;
            writer
                .write_all(&chunk)
                .await
                .context("writing bundle payload")?;
        }
        anyhow::ensure!(
            copied == item.byte_count,
            "raw object for {id} is {copied} bytes but the row claims {}",
            item.byte_count,
        );

        offset_rows.push(OffsetRow {
            data_item_id: item.data_item_id.clone(),
            root_bundle_id: bundle_id.to_string(),
            start_offset_in_root_bundle: header_byte_count + position,
            raw_content_length: item.byte_count,
            payload_data_start: item.payload_data_start,
            payload_content_type: item.payload_content_type.clone(),
            parent_data_item_id: None,
            start_offset_in_parent_payload: None,
            expires_at,
        });
        position += copied;
    }
    writer.shutdown().await.context("finishing bundle payload")?;

    let priority = items[0].priority;
    bundles::insert_new_bundle(
        plan_id,
        &bundle_id.to_string(),
        priority,
        header_byte_count,
        position,
        &core.pool,
    )
    .await?;

    for batch in offset_rows.chunks(OFFSET_BATCH) {
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
    enqueue_post(core, plan_id).await?;

    tracing::info!(
        %plan_id,
        %bundle_id,
        items = items.len(),
        header_bytes = header_byte_count,
        payload_bytes = position,
        "bundle prepared"
    );
    Ok(())
}

async fn enqueue_post(core: &Arc<Core>, plan_id: uuid::Uuid) -> anyhow::Result<()> {
    core.jobs
        .enqueue(
            Queue::Post,
            &PostJob { plan_id },
            jobs::EnqueueOptions {
                max_attempts: core.config.max_post_attempts,
                dedupe_key: Some(format!("post-{plan_id}")),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}
