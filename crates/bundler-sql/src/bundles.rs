use chrono::{DateTime, Utc};
use models::{BundleState, PriorityClass};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BundleRow {
    pub plan_id: uuid::Uuid,
    pub bundle_id: String,
    pub state: BundleState,
    pub priority: PriorityClass,
    pub reward: Option<i64>,
    pub header_byte_count: i64,
    pub payload_byte_count: i64,
    pub failure_count: i32,
    pub block_height: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
    pub seeded_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
}

const BUNDLE_COLUMNS: &str = r#"
    plan_id, bundle_id, state, priority, reward, header_byte_count,
    payload_byte_count, failure_count, block_height, created_at,
    posted_at, seeded_at, finalized_at
"#;

/// Record the prepared bundle for a plan. Idempotent for a re-run of the
/// prepare job: the bundle id is deterministic, so the conflict is benign.
pub async fn insert_new_bundle(
    plan_id: uuid::Uuid,
    bundle_id: &str,
    priority: PriorityClass,
    header_byte_count: i64,
    payload_byte_count: i64,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO bundles (plan_id, bundle_id, priority, header_byte_count, payload_byte_count)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (plan_id) DO NOTHING;
        "#,
    )
    .bind(plan_id)
    .bind(bundle_id)
    .bind(priority)
    .bind(header_byte_count)
    .bind(payload_byte_count)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn get_bundle(
    plan_id: uuid::Uuid,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Option<BundleRow>> {
    sqlx::query_as::<_, BundleRow>(&format!(
        "SELECT {BUNDLE_COLUMNS} FROM bundles WHERE plan_id = $1"
    ))
    .bind(plan_id)
    .fetch_optional(exec)
    .await
}

/// Guarded transition to `posted`. Returns false when the bundle is not in
/// `new`, which keeps the state machine monotonic under job retries.
pub async fn mark_posted(
    plan_id: uuid::Uuid,
    reward: i64,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE bundles
        SET state = 'posted', reward = $2, posted_at = NOW()
        WHERE plan_id = $1 AND state = 'new';
        "#,
    )
    .bind(plan_id)
    .bind(reward)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_seeded(
    plan_id: uuid::Uuid,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE bundles
        SET state = 'seeded', seeded_at = NOW()
        WHERE plan_id = $1 AND state = 'posted';
        "#,
    )
    .bind(plan_id)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_permanent(
    plan_id: uuid::Uuid,
    block_height: i64,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE bundles
        SET state = 'permanent', block_height = $2, finalized_at = NOW()
        WHERE plan_id = $1 AND state = 'seeded';
        "#,
    )
    .bind(plan_id)
    .bind(block_height)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Terminal failure exit, legal from any non-terminal state.
pub async fn mark_failed(
    plan_id: uuid::Uuid,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE bundles
        SET state = 'failed', finalized_at = NOW()
        WHERE plan_id = $1 AND state IN ('new', 'posted', 'seeded');
        "#,
    )
    .bind(plan_id)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// A seeded bundle that never confirmed within the drop threshold.
pub async fn mark_dropped(
    plan_id: uuid::Uuid,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE bundles
        SET state = 'dropped', finalized_at = NOW()
        WHERE plan_id = $1 AND state = 'seeded';
        "#,
    )
    .bind(plan_id)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Bump the failure counter, returning the new count.
pub async fn increment_failure_count(
    plan_id: uuid::Uuid,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<i32> {
    sqlx::query_scalar::<_, i32>(
        r#"
        UPDATE bundles
        SET failure_count = failure_count + 1
        WHERE plan_id = $1
        RETURNING failure_count;
        "#,
    )
    .bind(plan_id)
    .fetch_one(exec)
    .await
}
