//! The verifier: polls the chain for a seeded bundle's confirmations and
//! promotes it (and its items) to permanent, or recycles it when dropped.

use super::seed::enqueue_verify;
use super::VerifyJob;
use crate::core::Core;
use anyhow::Context;
use arweave::TxStatus;
use bundler_sql::{bundles, data_items};
use jobs::{JobHandler, Queue};
use models::BundleState;
use std::collections::HashSet;
use std::sync::Arc;

pub struct VerifyHandler {
    pub core: Arc<Core>,
}

#[async_trait::async_trait]
impl JobHandler for VerifyHandler {
    type Payload = VerifyJob;

    fn queue(&self) -> Queue {
        Queue::Verify
    }

    async fn handle(&self, job: VerifyJob) -> anyhow::Result<()> {
        verify_bundle(&self.core, job.plan_id).await
    }

    async fn exhausted(&self, job: VerifyJob, error: &str) -> anyhow::Result<()> {
        // Verification is cheap to re-arm; keep watching rather than
        // abandoning a bundle that may well confirm.
        tracing::warn!(plan_id = %job.plan_id, error, "verify exhausted; re-arming");
        enqueue_verify(&self.core, job.plan_id, self.core.config.verify_delay()).await
    }
}

pub async fn verify_bundle(core: &Arc<Core>, plan_id: uuid::Uuid) -> anyhow::Result<()> {
    let bundle = bundles::get_bundle(plan_id, &core.pool)
        .await?
        .context("verify job for a plan with no bundle row")?;

    match bundle.state {
        BundleState::Seeded => {}
        // Re-verifying a permanent (or terminal) bundle is a no-op.
        _ => return Ok(()),
    }

    let status = core
        .gateway
        .tx_status(&bundle.bundle_id)
        .await
        .context("querying bundle tx status")?;

    match status {
        TxStatus::NotFound | TxStatus::Pending => {
            let seeded_at = bundle.seeded_at.unwrap_or(bundle.created_at);
            let age = chrono::Utc::now() - seeded_at;
            if age > chrono::Duration::seconds(core.config.dropped_threshold_secs as i64) {
                drop_bundle(core, plan_id, &bundle.bundle_id).await
            } else {
                enqueue_verify(core, plan_id, core.config.verify_delay()).await
            }
        }
        TxStatus::Confirmed { confirmations, .. }
            if confirmations < core.config.permanent_threshold =>
        {
            enqueue_verify(core, plan_id, core.config.verify_delay()).await
        }
        TxStatus::Confirmed {
            block_height,
            confirmations,
        } => finalize_confirmed(core, &bundle, block_height, confirmations).await,
    }
}

async fn drop_bundle(core: &Arc<Core>, plan_id: uuid::Uuid, bundle_id: &str) -> anyhow::Result<()> {
    let mut txn = core.pool.begin().await?;
    if !bundles::mark_dropped(plan_id, &mut *txn).await? {
        return Ok(()); // Already transitioned elsewhere.
    }
    let (released, failed) = data_items::release_items_for_repack(
        plan_id,
        None,
        core.config.max_repacks,
        &mut txn,
    )
    .await?;
    txn.commit().await?;

    tracing::warn!(
        %plan_id,
        bundle_id,
        released,
        failed,
        "bundle dropped by the network; items recycled"
    );
    Ok(())
}

/// The bundle is confirmed deeply enough. Read the on-chain header back,
/// promote items it actually carries, and deal with any that went missing.
async fn finalize_confirmed(
    core: &Arc<Core>,
    bundle: &bundler_sql::BundleRow,
    block_height: u64,
    confirmations: u64,
) -> anyhow::Result<()> {
    let plan_id = bundle.plan_id;

    let header_bytes = core
        .gateway
        .fetch_data_range(&bundle.bundle_id, 0, bundle.header_byte_count as u64)
        .await
        .context("reading confirmed bundle header")?;
    let confirmed: HashSet<String> = ans104::decode_header(&header_bytes)
        .context("decoding confirmed bundle header")?
        .into_iter()
        .map(|entry| entry.id.to_string())
        .collect();

    let expected = data_items::load_planned_items(plan_id, &core.pool).await?;
    let (matched, missing): (Vec<_>, Vec<_>) = expected
        .iter()
        .map(|item| item.data_item_id.clone())
        .partition(|id| confirmed.contains(id));

    let mut txn = core.pool.begin().await?;
    if !matched.is_empty() {
        data_items::promote_items_permanent(
            plan_id,
            &matched,
            &bundle.bundle_id,
            block_height as i64,
            &mut txn,
        )
        .await?;
    }

    if missing.is_empty() {
        bundles::mark_permanent(plan_id, block_height as i64, &mut *txn).await?;
        txn.commit().await?;
        tracing::info!(
            %plan_id,
            bundle_id = %bundle.bundle_id,
            items = matched.len(),
            block_height,
            "bundle permanent"
        );
        return Ok(());
    }

    if confirmations >= core.config.repack_threshold {
        // The chain will not change its mind at this depth: whatever is
        // missing gets repacked, and the bundle settles with the rest.
        let (released, failed) = data_items::release_items_for_repack(
            plan_id,
            Some(missing.as_slice()),
            core.config.max_repacks,
            &mut txn,
        )
        .await?;
        bundles::mark_permanent(plan_id, block_height as i64, &mut *txn).await?;
        txn.commit().await?;
        tracing::warn!(
            %plan_id,
            bundle_id = %bundle.bundle_id,
            promoted = matched.len(),
            released,
            failed,
            "bundle permanent with missing items released for repack"
        );
        Ok(())
    } else {
        // Keep the promotions, keep polling for the stragglers.
        txn.commit().await?;
        enqueue_verify(core, plan_id, core.config.verify_delay()).await
    }
}
