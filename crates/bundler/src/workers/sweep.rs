//! Periodic housekeeping: offset TTL eviction, abandoned multipart
//! uploads, and garbage collection of orphaned staging objects left by
//! cancelled admissions.

use crate::core::Core;
use bundler_sql::{multipart, offsets};
use std::sync::Arc;

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(590);

pub async fn run_sweeps(core: Arc<Core>, shutdown: impl std::future::Future<Output = ()>) {
    let mut ticks = tokio::time::interval(SWEEP_INTERVAL);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => return,
            _ = ticks.tick() => {}
        }
        if let Err(err) = sweep_once(&core).await {
            tracing::error!(?err, "housekeeping sweep failed");
        }
    }
}

async fn sweep_once(core: &Arc<Core>) -> anyhow::Result<()> {
    let evicted = offsets::expire_offsets(&core.pool).await?;
    if evicted > 0 {
        tracing::info!(evicted, "expired offset records evicted");
    }

    // Abort abandoned multipart uploads: discard their staged parts and
    // drop the row.
    let expired = multipart::expired_uploads(100, &core.pool).await?;
    for upload in expired {
        for index in 0..upload.received_chunks.max(0) as u32 {
            let _ = core
                .blobs
                .delete(&blobs::keys::multipart_part(upload.upload_id, index))
                .await;
        }
        multipart::delete_upload(upload.upload_id, &core.pool).await?;
        tracing::info!(upload_id = %upload.upload_id, "expired multipart upload aborted");
    }

    // Admissions that were cancelled mid-stream may leave staged objects
    // behind; anything old under the staging prefix is dead.
    let staging_prefix = blobs::Path::from("raw/staging");
    // Anything staged for a day belongs to an admission that will never
    // complete.
    let cutoff = chrono::Utc::now() - chrono::Duration::hours(24);
    match core.blobs.list_prefix(&staging_prefix).await {
        Ok(metas) => {
            for meta in metas {
                if meta.last_modified < cutoff {
                    if core.blobs.delete(&meta.location).await.is_ok() {
                        tracing::info!(key = %meta.location, "orphaned staging object deleted");
                    }
                }
            }
        }
        Err(err) => {
            tracing::debug!(?err, "staging prefix listing unavailable; skipping GC");
        }
    }

    Ok(())
}
