use chrono::{DateTime, Utc};
use models::{FailureReason, ItemStatus, PriorityClass};

/// A data item row, as held by whichever state table currently owns it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DataItemRow {
    pub data_item_id: String,
    pub owner_address: String,
    pub signature_type: i16,
    pub byte_count: i64,
    pub payload_data_start: i64,
    pub payload_content_type: Option<String>,
    pub priority: PriorityClass,
    pub winc: i64,
    pub deadline_height: i64,
    pub retry_count: i32,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Admit a data item into `new_data_item`. The insert is guarded against the
/// id existing in any other state table, so a duplicate admission in any
/// lifecycle phase reports `Duplicate`.
pub async fn insert_new_data_item(
    item: &DataItemRow,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<InsertOutcome> {
    let result = sqlx::query(
        r#"
        INSERT INTO new_data_item (
            data_item_id, owner_address, signature_type, byte_count,
            payload_data_start, payload_content_type, priority, winc,
            deadline_height, retry_count, uploaded_at
        )
        SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11
        WHERE NOT EXISTS (SELECT 1 FROM planned_data_item WHERE data_item_id = $1)
          AND NOT EXISTS (SELECT 1 FROM permanent_data_item WHERE data_item_id = $1)
          AND NOT EXISTS (SELECT 1 FROM failed_data_item WHERE data_item_id = $1)
        ON CONFLICT (data_item_id) DO NOTHING;
        "#,
    )
    .bind(&item.data_item_id)
    .bind(&item.owner_address)
    .bind(item.signature_type)
    .bind(item.byte_count)
    .bind(item.payload_data_start)
    .bind(&item.payload_content_type)
    .bind(item.priority)
    .bind(item.winc)
    .bind(item.deadline_height)
    .bind(item.retry_count)
    .bind(item.uploaded_at)
    .execute(exec)
    .await?;

    if result.rows_affected() == 1 {
        Ok(InsertOutcome::Inserted)
    } else {
        Ok(InsertOutcome::Duplicate)
    }
}

/// The externally visible status of a data item, per `GET /v1/tx/:id/status`.
#[derive(Debug, Clone)]
pub struct StatusRow {
    pub status: ItemStatus,
    pub bundle_id: Option<String>,
    pub block_height: Option<i64>,
    pub winc: Option<i64>,
    pub reason: Option<FailureReason>,
}

#[derive(sqlx::FromRow)]
struct PlannedStatus {
    winc: i64,
    bundle_id: Option<String>,
    bundle_state: Option<models::BundleState>,
}

/// Resolve the item's current state across the state tables. Reads go to the
/// primary pool, which is what the post-write existence checks require.
pub async fn data_item_status(id: &str, pool: &sqlx::PgPool) -> sqlx::Result<StatusRow> {
    if let Some(winc) =
        sqlx::query_scalar::<_, i64>("SELECT winc FROM new_data_item WHERE data_item_id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
    {
        return Ok(StatusRow {
            status: ItemStatus::New,
            bundle_id: None,
            block_height: None,
            winc: Some(winc),
            reason: None,
        });
    }

    if let Some(row) = sqlx::query_as::<_, PlannedStatus>(
        r#"
        SELECT p.winc, b.bundle_id, b.state AS bundle_state
        FROM planned_data_item p
        LEFT JOIN bundles b ON b.plan_id = p.plan_id
        WHERE p.data_item_id = $1;
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    {
        use models::BundleState;
        let status = match row.bundle_state {
            Some(BundleState::Posted) => ItemStatus::Posted,
            Some(BundleState::Seeded) => ItemStatus::Seeded,
            // A failed or dropped bundle releases its items shortly; until
            // then they still read as planned.
            _ => ItemStatus::Planned,
        };
        return Ok(StatusRow {
            status,
            bundle_id: row.bundle_id,
            block_height: None,
            winc: Some(row.winc),
            reason: None,
        });
    }

    if let Some((bundle_id, block_height, winc)) = sqlx::query_as::<_, (String, i64, i64)>(
        "SELECT bundle_id, block_height, winc FROM permanent_data_item WHERE data_item_id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    {
        return Ok(StatusRow {
            status: ItemStatus::Permanent,
            bundle_id: Some(bundle_id),
            block_height: Some(block_height),
            winc: Some(winc),
            reason: None,
        });
    }

    if let Some(reason) = sqlx::query_scalar::<_, FailureReason>(
        "SELECT reason FROM failed_data_item WHERE data_item_id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    {
        return Ok(StatusRow {
            status: ItemStatus::Failed,
            bundle_id: None,
            block_height: None,
            winc: None,
            reason: Some(reason),
        });
    }

    Ok(StatusRow {
        status: ItemStatus::NotFound,
        bundle_id: None,
        block_height: None,
        winc: None,
        reason: None,
    })
}

/// Locate an item's row in whichever live state table holds it. Workers
/// (optical, unbundler) use this for header geometry regardless of how far
/// the item has progressed.
pub async fn find_item_row(id: &str, pool: &sqlx::PgPool) -> sqlx::Result<Option<DataItemRow>> {
    sqlx::query_as::<_, DataItemRow>(
        r#"
        SELECT data_item_id, owner_address, signature_type, byte_count,
               payload_data_start, payload_content_type, priority, winc,
               deadline_height, retry_count, uploaded_at
        FROM new_data_item WHERE data_item_id = $1
        UNION ALL
        SELECT data_item_id, owner_address, signature_type, byte_count,
               payload_data_start, payload_content_type, priority, winc,
               deadline_height, retry_count, uploaded_at
        FROM planned_data_item WHERE data_item_id = $1
        UNION ALL
        SELECT data_item_id, owner_address, signature_type, byte_count,
               payload_data_start, payload_content_type, priority, winc,
               deadline_height, 0 AS retry_count, uploaded_at
        FROM permanent_data_item WHERE data_item_id = $1
        LIMIT 1;
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Load the planned items of a plan, in planner-selected order.
pub async fn load_planned_items(
    plan_id: uuid::Uuid,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<DataItemRow>> {
    sqlx::query_as::<_, DataItemRow>(
        r#"
        SELECT data_item_id, owner_address, signature_type, byte_count,
               payload_data_start, payload_content_type, priority, winc,
               deadline_height, retry_count, uploaded_at
        FROM planned_data_item
        WHERE plan_id = $1
        ORDER BY priority, uploaded_at, data_item_id;
        "#,
    )
    .bind(plan_id)
    .fetch_all(exec)
    .await
}

/// Release planned items back to `new_data_item` for repack, incrementing
/// `retry_count`. Items that have exhausted `max_repacks` move to
/// `failed_data_item` with reason `too_many_retries` instead. When `only`
/// is set, just those ids are released; otherwise the whole plan.
///
/// Returns `(released, failed)` counts.
pub async fn release_items_for_repack(
    plan_id: uuid::Uuid,
    only: Option<&[String]>,
    max_repacks: i32,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<(usize, usize)> {
    let rows: Vec<DataItemRow> = match only {
        Some(ids) => {
            sqlx::query_as::<_, DataItemRow>(
                r#"
                DELETE FROM planned_data_item
                WHERE plan_id = $1 AND data_item_id = ANY($2)
                RETURNING data_item_id, owner_address, signature_type, byte_count,
                          payload_data_start, payload_content_type, priority, winc,
                          deadline_height, retry_count, uploaded_at;
                "#,
            )
            .bind(plan_id)
            .bind(ids)
            .fetch_all(&mut *txn)
            .await?
        }
        None => {
            sqlx::query_as::<_, DataItemRow>(
                r#"
                DELETE FROM planned_data_item
                WHERE plan_id = $1
                RETURNING data_item_id, owner_address, signature_type, byte_count,
                          payload_data_start, payload_content_type, priority, winc,
                          deadline_height, retry_count, uploaded_at;
                "#,
            )
            .bind(plan_id)
            .fetch_all(&mut *txn)
            .await?
        }
    };

    let mut released = 0;
    let mut failed = 0;
    for mut row in rows {
        row.retry_count += 1;
        if row.retry_count >= max_repacks {
            insert_failed_item(&row, FailureReason::TooManyRetries, &mut *txn).await?;
            failed += 1;
        } else {
            let _ = insert_new_data_item(&row, &mut *txn).await?;
            released += 1;
        }
    }
    Ok((released, failed))
}

/// Move confirmed items of a plan to `permanent_data_item`.
pub async fn promote_items_permanent(
    plan_id: uuid::Uuid,
    ids: &[String],
    bundle_id: &str,
    block_height: i64,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<usize> {
    let result = sqlx::query(
        r#"
        WITH moved AS (
            DELETE FROM planned_data_item
            WHERE plan_id = $1 AND data_item_id = ANY($2)
            RETURNING *
        )
        INSERT INTO permanent_data_item (
            data_item_id, bundle_id, block_height, owner_address, signature_type,
            byte_count, payload_data_start, payload_content_type, priority, winc,
            deadline_height, uploaded_at
        )
        SELECT data_item_id, $3, $4, owner_address, signature_type,
               byte_count, payload_data_start, payload_content_type, priority, winc,
               deadline_height, uploaded_at
        FROM moved
        ON CONFLICT (data_item_id) DO NOTHING;
        "#,
    )
    .bind(plan_id)
    .bind(ids)
    .bind(bundle_id)
    .bind(block_height)
    .execute(&mut *txn)
    .await?;
    Ok(result.rows_affected() as usize)
}

/// Record a terminal failure for an item.
pub async fn insert_failed_item(
    item: &DataItemRow,
    reason: FailureReason,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO failed_data_item (
            data_item_id, reason, owner_address, signature_type, byte_count,
            payload_data_start, payload_content_type, priority, winc,
            deadline_height, retry_count, uploaded_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (data_item_id) DO NOTHING;
        "#,
    )
    .bind(&item.data_item_id)
    .bind(reason)
    .bind(&item.owner_address)
    .bind(item.signature_type)
    .bind(item.byte_count)
    .bind(item.payload_data_start)
    .bind(&item.payload_content_type)
    .bind(item.priority)
    .bind(item.winc)
    .bind(item.deadline_height)
    .bind(item.retry_count)
    .bind(item.uploaded_at)
    .execute(exec)
    .await?;
    Ok(())
}
