use chrono::{DateTime, Utc};
use models::PriorityClass;

/// Candidate rows the planner considers, in packing order.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanCandidate {
    pub data_item_id: String,
    pub byte_count: i64,
    pub uploaded_at: DateTime<Utc>,
}

/// Take the per-class planner lock for the duration of the transaction.
/// Two planners can then never assemble overlapping plans for a class.
pub async fn try_planner_lock(
    class: PriorityClass,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<bool> {
    // Key space 0x62756e00 ("bun") + class ordinal, to stay clear of other
    // advisory-lock users of the same database.
    let key = 0x62756e00i64 + class as i64;
    sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_xact_lock($1)")
        .bind(key)
        .fetch_one(&mut *txn)
        .await
}

/// Select unplanned candidates of one priority class, oldest first, locking
/// the rows against a concurrent planner.
pub async fn select_unplanned(
    class: PriorityClass,
    limit: i64,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<Vec<PlanCandidate>> {
    sqlx::query_as::<_, PlanCandidate>(
        r#"
        SELECT data_item_id, byte_count, uploaded_at
        FROM new_data_item
        WHERE priority = $1
        ORDER BY uploaded_at, data_item_id
        LIMIT $2
        FOR UPDATE SKIP LOCKED;
        "#,
    )
    .bind(class)
    .bind(limit)
    .fetch_all(&mut *txn)
    .await
}

/// Create a plan row and move the selected items from `new_data_item` to
/// `planned_data_item`, in one transaction with the selection.
pub async fn create_plan(
    plan_id: uuid::Uuid,
    class: PriorityClass,
    item_ids: &[String],
    byte_count_total: i64,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO bundle_plan (plan_id, priority, item_count, byte_count_total)
        VALUES ($1, $2, $3, $4);
        "#,
    )
    .bind(plan_id)
    .bind(class)
    .bind(item_ids.len() as i32)
    .bind(byte_count_total)
    .execute(&mut *txn)
    .await?;

    sqlx::query(
        r#"
        WITH moved AS (
            DELETE FROM new_data_item
            WHERE data_item_id = ANY($2)
            RETURNING *
        )
        INSERT INTO planned_data_item (
            data_item_id, plan_id, owner_address, signature_type, byte_count,
            payload_data_start, payload_content_type, priority, winc,
            deadline_height, retry_count, uploaded_at
        )
        SELECT data_item_id, $1, owner_address, signature_type, byte_count,
               payload_data_start, payload_content_type, priority, winc,
               deadline_height, retry_count, uploaded_at
        FROM moved;
        "#,
    )
    .bind(plan_id)
    .bind(item_ids)
    .execute(&mut *txn)
    .await?;

    Ok(())
}

/// Age of the oldest unplanned item in a class, if any. Drives the
/// `MaxPlanWait` close-out of partial plans.
pub async fn oldest_unplanned_at(
    class: PriorityClass,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Option<DateTime<Utc>>> {
    sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
        "SELECT MIN(uploaded_at) FROM new_data_item WHERE priority = $1",
    )
    .bind(class)
    .fetch_one(exec)
    .await
}
