//! The offset indexer: batch-writes retrieval offset records produced by
//! the preparer and the unbundler. Inserts are idempotent on
//! `(data_item_id, root_bundle_id)`, so queue retries are harmless.

use super::OffsetsJob;
use crate::core::Core;
use bundler_sql::offsets;
use jobs::{JobHandler, Queue};
use std::sync::Arc;

pub struct OffsetsHandler {
    pub core: Arc<Core>,
}

#[async_trait::async_trait]
impl JobHandler for OffsetsHandler {
    type Payload = OffsetsJob;

    fn queue(&self) -> Queue {
        Queue::Offsets
    }

    async fn handle(&self, job: OffsetsJob) -> anyhow::Result<()> {
        let total = job.rows.len();
        let inserted = offsets::batch_insert_offsets(&job.rows, &self.core.pool).await?;
        tracing::debug!(total, inserted, "offset batch written");
        Ok(())
    }
}
