//! The seeder: uploads a posted bundle's data chunks to the network, then
//! schedules verification after the confirmation delay.

use super::{compute_chunked, read_bundle_range, SeedJob, VerifyJob};
use crate::core::Core;
use anyhow::Context;
use arweave::ChunkUpload;
use bundler_sql::bundles;
use futures::TryStreamExt;
use jobs::{JobHandler, Queue};
use models::BundleState;
use std::sync::Arc;

pub struct SeedHandler {
    pub core: Arc<Core>,
}

#[async_trait::async_trait]
impl JobHandler for SeedHandler {
    type Payload = SeedJob;

    fn queue(&self) -> Queue {
        Queue::Seed
    }

    async fn handle(&self, job: SeedJob) -> anyhow::Result<()> {
        seed_bundle(&self.core, job.plan_id).await
    }

    async fn exhausted(&self, job: SeedJob, error: &str) -> anyhow::Result<()> {
        tracing::error!(plan_id = %job.plan_id, error, "seeding exhausted; failing bundle");
        super::post::fail_bundle(&self.core, job.plan_id).await
    }
}

pub async fn seed_bundle(core: &Arc<Core>, plan_id: uuid::Uuid) -> anyhow::Result<()> {
    let bundle = bundles::get_bundle(plan_id, &core.pool)
        .await?
        .context("seed job for a plan with no bundle row")?;

    match bundle.state {
        BundleState::Posted => {}
        BundleState::Seeded | BundleState::Permanent => {
            return enqueue_verify(core, plan_id, std::time::Duration::ZERO).await;
        }
        BundleState::New => anyhow::bail!("bundle has not been posted yet"),
        _ => return Ok(()),
    }

    let (chunked, header) = compute_chunked(core, &bundle).await?;

    // Re-reading each chunk's bytes off the store bounds memory at one
    // chunk per in-flight upload.
    futures::stream::iter(chunked.chunks.iter().map(anyhow::Ok))
        .try_for_each_concurrent(core.config.seed_chunk_concurrency, |chunk| {
            let chunked = &chunked;
            let header = &header;
            let bundle = &bundle;
            async move {
                let bytes = read_bundle_range(
                    core,
                    bundle,
                    header,
                    chunk.min_byte_range,
                    chunk.max_byte_range,
                )
                .await?;
                let upload = ChunkUpload::build(chunked, chunk, &bytes);
                core.gateway
                    .post_chunk(&upload)
                    .await
                    .with_context(|| format!("posting chunk at {}", chunk.min_byte_range))?;
                Ok(())
            }
        })
        .await?;

    if bundles::mark_seeded(plan_id, &core.pool).await? {
        tracing::info!(
            %plan_id,
            bundle_id = %bundle.bundle_id,
            chunks = chunked.chunks.len(),
            "bundle seeded"
        );
    }
    enqueue_verify(core, plan_id, core.config.verify_delay()).await
}

pub(crate) async fn enqueue_verify(
    core: &Arc<Core>,
    plan_id: uuid::Uuid,
    delay: std::time::Duration,
) -> anyhow::Result<()> {
    core.jobs
        .enqueue(
            Queue::Verify,
            &VerifyJob { plan_id },
            jobs::EnqueueOptions {
                delay,
                max_attempts: 5,
                dedupe_key: None,
            },
        )
        .await?;
    Ok(())
}
