use crate::{complete, dequeue, mark_dead, retry_later, JobHandler, LeasedJob};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub concurrency: u32,
    /// Idle polling interval; jittered 10% in either direction so retries
    /// spread across consumers.
    pub dequeue_interval: Duration,
    /// How long a dequeued job stays leased before another consumer may
    /// claim it. Must exceed the longest expected handling time.
    pub lease_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            dequeue_interval: Duration::from_secs(5),
            lease_timeout: Duration::from_secs(120),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Serve one queue until `shutdown` resolves, then drain running jobs.
pub async fn consume<H: JobHandler>(
    pool: sqlx::PgPool,
    handler: Arc<H>,
    opts: ConsumerOptions,
    shutdown: impl std::future::Future<Output = ()> + Send,
) {
    let semaphore = Arc::new(Semaphore::new(opts.concurrency as usize));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            () = consume_iter(&pool, &handler, &opts, &semaphore) => (),
        }
    }

    tracing::info!(queue = handler.queue().as_str(), "consumer stopping; draining running jobs");
    let _ = semaphore
        .acquire_many(opts.concurrency)
        .await
        .expect("semaphore is never closed");
}

async fn consume_iter<H: JobHandler>(
    pool: &sqlx::PgPool,
    handler: &Arc<H>,
    opts: &ConsumerOptions,
    semaphore: &Arc<Semaphore>,
) {
    // Block until at least one permit is available, then claim every free
    // permit and dequeue up to that many jobs.
    if semaphore.available_permits() == 0 {
        let _ = semaphore.clone().acquire_owned().await.unwrap();
    }
    let mut permits = semaphore
        .clone()
        .acquire_many_owned(semaphore.available_permits() as u32)
        .await
        .unwrap();

    let jobs = match dequeue(
        handler.queue(),
        permits.num_permits() as i64,
        opts.lease_timeout,
        pool,
    )
    .await
    {
        Ok(jobs) => jobs,
        Err(err) => {
            tracing::error!(queue = handler.queue().as_str(), ?err, "job dequeue failed (will retry)");
            Vec::new()
        }
    };

    for job in jobs {
        let permit = permits.split(1).unwrap();
        let pool = pool.clone();
        let handler = handler.clone();
        let opts = opts.clone();
        tokio::spawn(async move {
            run_job(job, permit, pool, handler, opts).await;
        });
    }

    // Permits remaining means the queue ran dry; sleep before polling again,
    // waking early when a running job finishes and frees a permit.
    if permits.num_permits() != 0 {
        let jitter = 0.9 + rand::random::<f64>() * 0.2; // [0.9, 1.1)
        tokio::select! {
            () = tokio::time::sleep(opts.dequeue_interval.mul_f64(jitter)) => (),
            _ = semaphore.clone().acquire_owned() => (),
        }
    }
}

async fn run_job<H: JobHandler>(
    job: LeasedJob,
    _permit: OwnedSemaphorePermit,
    pool: sqlx::PgPool,
    handler: Arc<H>,
    opts: ConsumerOptions,
) {
    let queue = handler.queue().as_str();
    let LeasedJob {
        job_id,
        payload: sqlx::types::Json(raw_payload),
        attempt,
        max_attempts,
    } = job;

    let payload: H::Payload = match serde_json::from_value(raw_payload.clone()) {
        Ok(payload) => payload,
        Err(err) => {
            // An undecodable payload will never succeed; kill it outright.
            tracing::error!(queue, job_id, ?err, "job payload failed to decode");
            if let Err(err) = mark_dead(job_id, &format!("bad payload: {err}"), &pool).await {
                tracing::error!(queue, job_id, ?err, "failed to mark job dead");
            }
            return;
        }
    };

    match handler.handle(payload).await {
        Ok(()) => {
            if let Err(err) = complete(job_id, &pool).await {
                // The lease will expire and the job re-runs: handlers must
                // stay idempotent for exactly this case.
                tracing::error!(queue, job_id, ?err, "failed to complete job");
            }
        }
        Err(handle_err) => {
            let error = format!("{handle_err:#}");
            if attempt >= max_attempts {
                tracing::error!(queue, job_id, attempt, error = %error, "job exhausted its attempts");
                if let Err(err) = mark_dead(job_id, &error, &pool).await {
                    tracing::error!(queue, job_id, ?err, "failed to mark job dead");
                    return;
                }
                // Re-decode for the exhausted hook; the payload decoded once
                // already, so this cannot fail.
                if let Ok(payload) = serde_json::from_value(raw_payload) {
                    if let Err(err) = handler.exhausted(payload, &error).await {
                        tracing::error!(queue, job_id, ?err, "exhausted hook failed");
                    }
                }
            } else {
                let backoff = exponential_backoff::Backoff::new(
                    u32::MAX,
                    opts.backoff_min,
                    Some(opts.backoff_max),
                );
                let delay = backoff
                    .next(attempt as u32)
                    .unwrap_or(opts.backoff_max);
                tracing::warn!(
                    queue,
                    job_id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = %error,
                    "job failed and will retry"
                );
                if let Err(err) = retry_later(job_id, delay, &error, &pool).await {
                    tracing::error!(queue, job_id, ?err, "failed to reschedule job");
                }
            }
        }
    }
}
