//! Pipeline workers: each consumes one job queue and advances the bundle
//! state machine by one step. All handlers are idempotent, since the queue
//! is at-least-once.

use crate::core::Core;
use anyhow::Context;
use bytes::Bytes;
use models::PriorityClass;
use std::sync::Arc;

pub mod finalize;
pub mod offsets;
pub mod optical;
pub mod planner;
pub mod post;
pub mod prepare;
pub mod seed;
pub mod sweep;
pub mod unbundle;
pub mod verify;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct PlanJob {
    pub class: PriorityClass,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct PrepareJob {
    pub plan_id: uuid::Uuid,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct PostJob {
    pub plan_id: uuid::Uuid,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct SeedJob {
    pub plan_id: uuid::Uuid,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct VerifyJob {
    pub plan_id: uuid::Uuid,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct OffsetsJob {
    pub rows: Vec<bundler_sql::OffsetRow>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct OpticalJob {
    pub id: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct UnbundleJob {
    pub id: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct FinalizeJob {
    pub upload_id: uuid::Uuid,
}

/// Read `[start, end)` of a bundle's transaction data, which is the header
/// object followed by the payload object.
pub(crate) async fn read_bundle_range(
    core: &Core,
    bundle: &bundler_sql::BundleRow,
    header: &Bytes,
    start: u64,
    end: u64,
) -> anyhow::Result<Bytes> {
    let header_len = bundle.header_byte_count as u64;
    let mut out = bytes::BytesMut::with_capacity((end - start) as usize);

    if start < header_len {
        let head_end = end.min(header_len);
        out.extend_from_slice(&header[start as usize..head_end as usize]);
    }
    if end > header_len {
        let payload_start = start.max(header_len) - header_len;
        let payload_end = end - header_len;
        let bundle_id: models::BundleId = bundle
            .bundle_id
            .parse()
            .context("bundle row holds an invalid bundle id")?;
        let bytes = core
            .blobs
            .get_range(
                &blobs::keys::bundle_payload(bundle_id),
                payload_start..payload_end,
            )
            .await?;
        out.extend_from_slice(&bytes);
    }
    anyhow::ensure!(
        out.len() as u64 == end - start,
        "short read of bundle data: wanted {} bytes, got {}",
        end - start,
        out.len(),
    );
    Ok(out.freeze())
}

/// Chunk a bundle's transaction data without buffering it: walk the chunk
/// ranges, hashing each straight off range reads.
pub(crate) async fn compute_chunked(
    core: &Core,
    bundle: &bundler_sql::BundleRow,
) -> anyhow::Result<(arweave::ChunkedData, Bytes)> {
    use sha2::Digest;

    let bundle_id: models::BundleId = bundle
        .bundle_id
        .parse()
        .context("bundle row holds an invalid bundle id")?;
    let header = core
        .blobs
        .get_bytes(&blobs::keys::bundle_header(bundle_id))
        .await?;
    anyhow::ensure!(
        header.len() as i64 == bundle.header_byte_count,
        "stored bundle header length {} disagrees with the bundle row {}",
        header.len(),
        bundle.header_byte_count,
    );

    let total = (bundle.header_byte_count + bundle.payload_byte_count) as u64;
    let mut leaves = Vec::new();
    for (start, end) in arweave::chunk_ranges(total) {
        let bytes = read_bundle_range(core, bundle, &header, start, end).await?;
        let hash: [u8; 32] = sha2::Sha256::digest(&bytes).into();
        leaves.push((hash, start, end));
    }
    Ok((arweave::tree_from_leaf_hashes(leaves, total), header))
}

/// Spawn every queue consumer plus the interval loops. Resolves when all of
/// them have drained after `shutdown`.
pub fn spawn_all<F>(core: Arc<Core>, shutdown: F) -> Vec<tokio::task::JoinHandle<()>>
where
    F: std::future::Future<Output = ()> + Clone + Send + 'static,
{
    use jobs::ConsumerOptions;
    use std::time::Duration;

    let cfg = &core.config;
    let long_lease = Duration::from_secs(30 * 60);

    let mut handles = Vec::new();
    let mut consume = |handle: tokio::task::JoinHandle<()>| handles.push(handle);

    consume(jobs::spawn_consumer(
        core.pool.clone(),
        Arc::new(planner::PlannerHandler { core: core.clone() }),
        ConsumerOptions {
            concurrency: 1,
            ..Default::default()
        },
        shutdown.clone(),
    ));
    consume(jobs::spawn_consumer(
        core.pool.clone(),
        Arc::new(prepare::PrepareHandler { core: core.clone() }),
        ConsumerOptions {
            concurrency: cfg.prepare_concurrency,
            lease_timeout: long_lease,
            ..Default::default()
        },
        shutdown.clone(),
    ));
    consume(jobs::spawn_consumer(
        core.pool.clone(),
        Arc::new(post::PostHandler { core: core.clone() }),
        ConsumerOptions {
            concurrency: cfg.post_concurrency,
            lease_timeout: long_lease,
            ..Default::default()
        },
        shutdown.clone(),
    ));
    consume(jobs::spawn_consumer(
        core.pool.clone(),
        Arc::new(seed::SeedHandler { core: core.clone() }),
        ConsumerOptions {
            concurrency: cfg.seed_concurrency,
            lease_timeout: long_lease,
            ..Default::default()
        },
        shutdown.clone(),
    ));
    consume(jobs::spawn_consumer(
        core.pool.clone(),
        Arc::new(verify::VerifyHandler { core: core.clone() }),
        ConsumerOptions {
            concurrency: cfg.verify_concurrency,
            lease_timeout: Duration::from_secs(5 * 60),
            ..Default::default()
        },
        shutdown.clone(),
    ));
    consume(jobs::spawn_consumer(
        core.pool.clone(),
        Arc::new(offsets::OffsetsHandler { core: core.clone() }),
        ConsumerOptions {
            concurrency: cfg.offsets_concurrency,
            ..Default::default()
        },
        shutdown.clone(),
    ));
    consume(jobs::spawn_consumer(
        core.pool.clone(),
        Arc::new(optical::OpticalHandler { core: core.clone() }),
        ConsumerOptions {
            concurrency: cfg.optical_concurrency,
            ..Default::default()
        },
        shutdown.clone(),
    ));
    consume(jobs::spawn_consumer(
        core.pool.clone(),
        Arc::new(unbundle::UnbundleHandler { core: core.clone() }),
        ConsumerOptions {
            concurrency: cfg.unbundle_concurrency,
            lease_timeout: long_lease,
            ..Default::default()
        },
        shutdown.clone(),
    ));
    consume(jobs::spawn_consumer(
        core.pool.clone(),
        Arc::new(finalize::FinalizeHandler { core: core.clone() }),
        ConsumerOptions {
            concurrency: cfg.finalize_concurrency,
            lease_timeout: long_lease,
            ..Default::default()
        },
        shutdown.clone(),
    ));

    handles.push(tokio::spawn(planner::run_interval(
        core.clone(),
        shutdown.clone(),
    )));
    handles.push(tokio::spawn(sweep::run_sweeps(core.clone(), shutdown.clone())));
    handles.push(tokio::spawn(core.clone().refresh_height(shutdown)));

    handles
}
