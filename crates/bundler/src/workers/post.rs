//! The bundle poster: builds and signs the Arweave-layer transaction and
//! submits its header. Chunk seeding is the next stage.

use super::{compute_chunked, PostJob, SeedJob};
use crate::core::Core;
use anyhow::Context;
use bundler_sql::{bundles, data_items};
use jobs::{JobHandler, Queue};
use models::BundleState;
use std::sync::Arc;

pub struct PostHandler {
    pub core: Arc<Core>,
}

#[async_trait::async_trait]
impl JobHandler for PostHandler {
    type Payload = PostJob;

    fn queue(&self) -> Queue {
        Queue::Post
    }

    async fn handle(&self, job: PostJob) -> anyhow::Result<()> {
        post_bundle(&self.core, job.plan_id).await
    }

    async fn exhausted(&self, job: PostJob, error: &str) -> anyhow::Result<()> {
        tracing::error!(plan_id = %job.plan_id, error, "posting exhausted; failing bundle");
        fail_bundle(&self.core, job.plan_id).await
    }
}

pub async fn post_bundle(core: &Arc<Core>, plan_id: uuid::Uuid) -> anyhow::Result<()> {
    let bundle = bundles::get_bundle(plan_id, &core.pool)
        .await?
        .context("post job for a plan with no bundle row")?;

    match bundle.state {
        BundleState::New => {}
        BundleState::Posted => {
            // Header already submitted; make sure seeding is queued.
            return enqueue_seed(core, plan_id).await;
        }
        // Seeded, permanent, or terminal: nothing left for this job.
        _ => return Ok(()),
    }

    let total = (bundle.header_byte_count + bundle.payload_byte_count) as u64;
    let (chunked, _header) = compute_chunked(core, &bundle).await?;

    let reward = core.gateway.price(total).await.context("estimating reward")?;
    let anchor = core.gateway.tx_anchor().await.context("fetching tx anchor")?;

    let bundle_id = bundle
        .bundle_id
        .parse()
        .context("bundle row holds an invalid bundle id")?;
    let tx = arweave::build_bundle_tx(
        &core.wallet,
        bundle_id,
        total,
        chunked.data_root,
        reward,
        &anchor,
        &[],
    )
    .context("building bundle transaction")?;

    core.gateway
        .submit_tx(&tx)
        .await
        .context("submitting bundle transaction")?;

    if !bundles::mark_posted(plan_id, reward as i64, &core.pool).await? {
        tracing::warn!(%plan_id, "bundle advanced past 'new' underneath the post job");
    } else {
        tracing::info!(%plan_id, bundle_id = %bundle.bundle_id, reward, "bundle posted");
    }
    enqueue_seed(core, plan_id).await
}

async fn enqueue_seed(core: &Arc<Core>, plan_id: uuid::Uuid) -> anyhow::Result<()> {
    core.jobs
        .enqueue(
            Queue::Seed,
            &SeedJob { plan_id },
            jobs::EnqueueOptions {
                max_attempts: core.config.max_post_attempts,
                dedupe_key: Some(format!("seed-{plan_id}")),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

/// Terminal failure for a bundle that could not be posted or seeded: mark
/// it failed and release its items for repack.
pub(crate) async fn fail_bundle(core: &Arc<Core>, plan_id: uuid::Uuid) -> anyhow::Result<()> {
    bundles::increment_failure_count(plan_id, &core.pool).await?;

    let mut txn = core.pool.begin().await?;
    bundles::mark_failed(plan_id, &mut *txn).await?;
    let (released, failed) = data_items::release_items_for_repack(
        plan_id,
        None,
        core.config.max_repacks,
        &mut txn,
    )
    .await?;
    txn.commit().await?;

    tracing::warn!(%plan_id, released, failed, "bundle failed; items released for repack");
    Ok(())
}
