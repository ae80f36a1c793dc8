//! Durable named job queues over Postgres: delayed jobs, leases with
//! expiry, at-least-once delivery, and retries with exponential backoff.
//! The `job_queue` table is created by the service's migrations.

use std::sync::Arc;
use std::time::Duration;

mod consumer;
pub use consumer::{consume, ConsumerOptions};

/// The closed set of queues the pipeline runs on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Queue {
    Plan,
    Prepare,
    Post,
    Seed,
    Verify,
    Offsets,
    Optical,
    Unbundle,
    FinalizeMultipart,
}

impl Queue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Prepare => "prepare",
            Self::Post => "post",
            Self::Seed => "seed",
            Self::Verify => "verify",
            Self::Offsets => "offsets",
            Self::Optical => "optical",
            Self::Unbundle => "unbundle",
            Self::FinalizeMultipart => "finalize-multipart",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Earliest-run delay from now.
    pub delay: Duration,
    pub max_attempts: u32,
    /// When set, at most one live job with this key exists per queue.
    pub dedupe_key: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            max_attempts: 5,
            dedupe_key: None,
        }
    }
}

/// A handler for one queue. `handle` errors are retried with backoff up to
/// the job's `max_attempts`; `exhausted` then runs exactly once before the
/// job is marked dead.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: serde::de::DeserializeOwned + Send;

    fn queue(&self) -> Queue;

    async fn handle(&self, payload: Self::Payload) -> anyhow::Result<()>;

    async fn exhausted(&self, _payload: Self::Payload, _error: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Shared handle for enqueuing jobs.
#[derive(Clone)]
pub struct JobQueue {
    pool: sqlx::PgPool,
}

impl JobQueue {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    /// Enqueue a job. Returns the job id, or None when an equivalent live
    /// job already exists under the dedupe key.
    pub async fn enqueue<P: serde::Serialize>(
        &self,
        queue: Queue,
        payload: &P,
        opts: EnqueueOptions,
    ) -> sqlx::Result<Option<i64>> {
        enqueue_with(queue, payload, opts, &self.pool).await
    }
}

/// Enqueue against an arbitrary executor, e.g. inside an admission
/// transaction so the job commits with the row it refers to.
pub async fn enqueue_with<P: serde::Serialize>(
    queue: Queue,
    payload: &P,
    opts: EnqueueOptions,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Option<i64>> {
    let payload = serde_json::to_value(payload).expect("job payload serialization cannot fail");

    let job_id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO job_queue (queue, payload, dedupe_key, max_attempts, run_at)
        VALUES ($1, $2, $3, $4, NOW() + make_interval(secs => $5))
        ON CONFLICT (queue, dedupe_key) WHERE dedupe_key IS NOT NULL AND NOT dead
            DO NOTHING
        RETURNING job_id;
        "#,
    )
    .bind(queue.as_str())
    .bind(sqlx::types::Json(payload))
    .bind(&opts.dedupe_key)
    .bind(opts.max_attempts as i32)
    .bind(opts.delay.as_secs_f64())
    .fetch_optional(exec)
    .await?;

    Ok(job_id)
}

/// A dequeued job, leased to one consumer until `lease_until`.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct LeasedJob {
    pub job_id: i64,
    pub payload: sqlx::types::Json<serde_json::Value>,
    pub attempt: i32,
    pub max_attempts: i32,
}

pub(crate) async fn dequeue(
    queue: Queue,
    limit: i64,
    lease: Duration,
    pool: &sqlx::PgPool,
) -> sqlx::Result<Vec<LeasedJob>> {
    sqlx::query_as::<_, LeasedJob>(
        r#"
        WITH picked AS (
            SELECT job_id
            FROM job_queue
            WHERE queue = $1
              AND NOT dead
              AND run_at <= NOW()
              AND (lease_until IS NULL OR lease_until < NOW())
            ORDER BY run_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        UPDATE job_queue
        SET lease_until = NOW() + make_interval(secs => $3),
            attempt = attempt + 1
        WHERE job_id IN (SELECT job_id FROM picked)
        RETURNING job_id, payload, attempt, max_attempts;
        "#,
    )
    .bind(queue.as_str())
    .bind(limit)
    .bind(lease.as_secs_f64())
    .fetch_all(pool)
    .await
}

pub(crate) async fn complete(job_id: i64, pool: &sqlx::PgPool) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM job_queue WHERE job_id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub(crate) async fn retry_later(
    job_id: i64,
    delay: Duration,
    error: &str,
    pool: &sqlx::PgPool,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE job_queue
        SET run_at = NOW() + make_interval(secs => $2),
            lease_until = NULL,
            last_error = $3
        WHERE job_id = $1;
        "#,
    )
    .bind(job_id)
    .bind(delay.as_secs_f64())
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn mark_dead(job_id: i64, error: &str, pool: &sqlx::PgPool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE job_queue
        SET dead = TRUE, lease_until = NULL, last_error = $2
        WHERE job_id = $1;
        "#,
    )
    .bind(job_id)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// A convenience bundle of everything a worker needs to serve a queue.
pub fn spawn_consumer<H: JobHandler>(
    pool: sqlx::PgPool,
    handler: Arc<H>,
    opts: ConsumerOptions,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(consume(pool, handler, opts, shutdown))
}

#[cfg(test)]
mod test {
    use super::Queue;

    #[test]
    fn queue_names_are_stable() {
        assert_eq!(Queue::Prepare.as_str(), "prepare");
        assert_eq!(Queue::FinalizeMultipart.as_str(), "finalize-multipart");
        // Serde names match the queue-name strings, so payload routing and
        // queue naming cannot drift apart.
        for queue in [Queue::Plan, Queue::Verify, Queue::FinalizeMultipart] {
            let json = serde_json::to_string(&queue).unwrap();
            assert_eq!(json.trim_matches('"'), queue.as_str());
        }
    }
}
