//! The optical poster: best-effort forwarding of item headers to downstream
//! gateways so reads can be served before Arweave confirmation. Never
//! affects the item's own state machine.

use super::OpticalJob;
use crate::core::Core;
use anyhow::Context;
use bundler_sql::data_items;
use jobs::{JobHandler, Queue};
use models::DataItemId;
use std::sync::Arc;

pub struct OpticalHandler {
    pub core: Arc<Core>,
}

#[async_trait::async_trait]
impl JobHandler for OpticalHandler {
    type Payload = OpticalJob;

    fn queue(&self) -> Queue {
        Queue::Optical
    }

    async fn handle(&self, job: OpticalJob) -> anyhow::Result<()> {
        post_optically(&self.core, &job.id).await
    }

    async fn exhausted(&self, job: OpticalJob, error: &str) -> anyhow::Result<()> {
        // Best effort by contract: exhaustion is logged and dropped.
        tracing::warn!(id = %job.id, error, "optical posting abandoned");
        Ok(())
    }
}

async fn post_optically(core: &Arc<Core>, id: &str) -> anyhow::Result<()> {
    if core.config.optical_endpoints.is_empty() {
        return Ok(());
    }

    let Some(row) = data_items::find_item_row(id, &core.pool).await? else {
        // The item left the live tables (failed or unknown); nothing to do.
        tracing::debug!(id, "optical post skipped; item row is gone");
        return Ok(());
    };
    let item_id: DataItemId = id.parse().context("optical job carries an invalid id")?;

    let header = core
        .blobs
        .get_range(
            &blobs::keys::raw(item_id),
            0..row.payload_data_start as u64,
        )
        .await
        .context("reading item header")?;

    let body = serde_json::json!({
        "id": id,
        "owner": row.owner_address,
        "signature_type": row.signature_type,
        "byte_count": row.byte_count,
        "content_type": row.payload_content_type,
        "header": base64::encode_config(&header, base64::URL_SAFE_NO_PAD),
    });

    for endpoint in &core.config.optical_endpoints {
        let mut request = core.http.post(endpoint.clone()).json(&body);
        if let Some(key) = &core.config.optical_key {
            request = request.header("x-api-key", key.as_str());
        }
        request
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .with_context(|| format!("optical post to {endpoint}"))?;
    }
    tracing::debug!(id, endpoints = core.config.optical_endpoints.len(), "item posted optically");
    Ok(())
}
