//! The bundle planner: groups unplanned items into plans under the size and
//! count limits, one priority class at a time. Runs both on a timer and on
//! backlog pressure (admission enqueues a deduplicated plan job).

use super::{PlanJob, PrepareJob};
use crate::core::Core;
use ans104::bundle::header_len;
use bundler_sql::plans;
use jobs::{enqueue_with, EnqueueOptions, JobHandler, Queue};
use models::PriorityClass;
use std::sync::Arc;

pub struct PlannerHandler {
    pub core: Arc<Core>,
}

#[async_trait::async_trait]
impl JobHandler for PlannerHandler {
    type Payload = PlanJob;

    fn queue(&self) -> Queue {
        Queue::Plan
    }

    async fn handle(&self, job: PlanJob) -> anyhow::Result<()> {
        plan_class(&self.core, job.class).await
    }
}

/// Timer-driven planning across all classes.
pub async fn run_interval(core: Arc<Core>, shutdown: impl std::future::Future<Output = ()>) {
    let mut ticks = tokio::time::interval(std::time::Duration::from_secs(
        core.config.planner_interval_secs,
    ));
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => return,
            _ = ticks.tick() => {}
        }
        for class in PriorityClass::ALL {
            if let Err(err) = plan_class(&core, class).await {
                tracing::error!(class = class.as_str(), ?err, "planner pass failed");
            }
        }
    }
}

/// A packed group of candidate indices. `full` means the group closed
/// because the next item would not fit, as opposed to running out of input.
#[derive(Debug, PartialEq)]
pub struct Packed {
    pub indices: Vec<usize>,
    pub full: bool,
}

/// Greedy packing of candidate sizes, reserving the per-item header
/// overhead below the bundle byte limit. Pure, for the boundary tests.
pub fn pack_candidates(sizes: &[i64], max_bundle_bytes: u64, max_items: u64) -> Vec<Packed> {
    let mut groups = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_bytes = 0u64;

    for (index, &size) in sizes.iter().enumerate() {
        let size = size.max(0) as u64;
        let next_count = current.len() as u64 + 1;
        let fits = next_count <= max_items
            && header_len(next_count) + current_bytes + size <= max_bundle_bytes;

        if !fits && !current.is_empty() {
            groups.push(Packed {
                indices: std::mem::take(&mut current),
                full: true,
            });
            current_bytes = 0;
        }
        current.push(index);
        current_bytes += size;
    }
    if !current.is_empty() {
        groups.push(Packed {
            indices: current,
            full: false,
        });
    }
    groups
}

pub async fn plan_class(core: &Arc<Core>, class: PriorityClass) -> anyhow::Result<()> {
    let mut txn = core.pool.begin().await?;
    if !plans::try_planner_lock(class, &mut txn).await? {
        // Another planner owns this class right now.
        return Ok(());
    }

    let limit = (core.config.max_items_per_bundle * 4).min(10_000) as i64;
    let candidates = plans::select_unplanned(class, limit, &mut txn).await?;
    if candidates.is_empty() {
        return Ok(());
    }

    let sizes: Vec<i64> = candidates.iter().map(|c| c.byte_count).collect();
    let groups = pack_candidates(
        &sizes,
        core.config.max_bundle_bytes,
        core.config.max_items_per_bundle,
    );

    let now = chrono::Utc::now();
    let max_wait = chrono::Duration::seconds(core.config.max_plan_wait_secs as i64);
    let mut planned = 0usize;

    for group in groups {
        // A partial group stays open for more items unless its oldest
        // member has waited long enough.
        let oldest = candidates[group.indices[0]].uploaded_at;
        if !group.full && now - oldest < max_wait {
            continue;
        }

        let ids: Vec<String> = group
            .indices
            .iter()
            .map(|&i| candidates[i].data_item_id.clone())
            .collect();
        let byte_count_total: i64 = group.indices.iter().map(|&i| candidates[i].byte_count).sum();

        let plan_id = uuid::Uuid::new_v4();
        plans::create_plan(plan_id, class, &ids, byte_count_total, &mut txn).await?;
        enqueue_with(
            Queue::Prepare,
            &PrepareJob { plan_id },
            EnqueueOptions {
                max_attempts: 5,
                ..Default::default()
            },
            &mut *txn,
        )
        .await?;
        planned += 1;

        tracing::info!(
            class = class.as_str(),
            %plan_id,
            items = ids.len(),
            bytes = byte_count_total,
            "closed bundle plan"
        );
    }

    if planned > 0 {
        txn.commit().await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    const MAX_BYTES: u64 = 10_000;

    #[test]
    fn splits_on_item_count() {
        let sizes = vec![1i64; 7];
        let groups = pack_candidates(&sizes, MAX_BYTES, 3);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].indices, vec![0, 1, 2]);
        assert!(groups[0].full && groups[1].full);
        assert_eq!(groups[2].indices, vec![6]);
        assert!(!groups[2].full);
    }

    #[test]
    fn exactly_max_items_is_one_full_group_when_input_continues() {
        let sizes = vec![1i64; 4];
        let groups = pack_candidates(&sizes, MAX_BYTES, 4);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].indices.len(), 4);
        assert!(!groups[0].full);

        let sizes = vec![1i64; 5];
        let groups = pack_candidates(&sizes, MAX_BYTES, 4);
        assert_eq!(groups.len(), 2);
        assert!(groups[0].full);
    }

    #[test]
    fn reserves_header_overhead_below_byte_limit() {
        // Two items of 4_900 bytes: 8 + 2*40 + 9_800 = 9_888 <= 10_000, so
        // they share a group; a third forces a split on bytes.
        let sizes = vec![4_900i64, 4_900, 4_900];
        let groups = pack_candidates(&sizes, MAX_BYTES, 100);
        assert_eq!(groups[0].indices, vec![0, 1]);
        assert_eq!(groups[1].indices, vec![2]);

        // One byte over: header_len(2) + 2*4_957 = 9_914 + 88 > 10_000.
        let sizes = vec![4_957i64, 4_957];
        let groups = pack_candidates(&sizes, MAX_BYTES, 100);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn oversized_item_gets_its_own_group() {
        let sizes = vec![50_000i64, 10];
        let groups = pack_candidates(&sizes, MAX_BYTES, 100);
        assert_eq!(groups[0].indices, vec![0]);
        assert!(groups[0].full);
        assert_eq!(groups[1].indices, vec![1]);
    }
}
