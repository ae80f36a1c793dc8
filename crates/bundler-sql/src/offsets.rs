use chrono::{DateTime, Utc};

/// A retrieval offset record, written by the preparer and the unbundler.
/// Serde support lets the offset-indexer job carry rows as its payload.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize, serde::Deserialize)]
pub struct OffsetRow {
    pub data_item_id: String,
    pub root_bundle_id: String,
    pub start_offset_in_root_bundle: i64,
    pub raw_content_length: i64,
    pub payload_data_start: i64,
    pub payload_content_type: Option<String>,
    pub parent_data_item_id: Option<String>,
    pub start_offset_in_parent_payload: Option<i64>,
    pub expires_at: DateTime<Utc>,
}

/// Batch insert of offset rows, idempotent on `(data_item_id,
/// root_bundle_id)` so a retried job is harmless.
pub async fn batch_insert_offsets(
    rows: &[OffsetRow],
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
        r#"
        INSERT INTO data_item_offsets (
            data_item_id, root_bundle_id, start_offset_in_root_bundle,
            raw_content_length, payload_data_start, payload_content_type,
            parent_data_item_id, start_offset_in_parent_payload, expires_at
        )
        "#,
    );
    builder.push_values(rows, |mut b, row| {
        b.push_bind(&row.data_item_id)
            .push_bind(&row.root_bundle_id)
            .push_bind(row.start_offset_in_root_bundle)
            .push_bind(row.raw_content_length)
            .push_bind(row.payload_data_start)
            .push_bind(&row.payload_content_type)
            .push_bind(&row.parent_data_item_id)
            .push_bind(row.start_offset_in_parent_payload)
            .push_bind(row.expires_at);
    });
    builder.push(" ON CONFLICT (data_item_id, root_bundle_id) DO NOTHING");

    let result = builder.build().execute(exec).await?;
    Ok(result.rows_affected())
}

/// The most recent live offset record for an item.
pub async fn get_offset(
    data_item_id: &str,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Option<OffsetRow>> {
    sqlx::query_as::<_, OffsetRow>(
        r#"
        SELECT data_item_id, root_bundle_id, start_offset_in_root_bundle,
               raw_content_length, payload_data_start, payload_content_type,
               parent_data_item_id, start_offset_in_parent_payload, expires_at
        FROM data_item_offsets
        WHERE data_item_id = $1 AND expires_at > NOW()
        ORDER BY expires_at DESC
        LIMIT 1;
        "#,
    )
    .bind(data_item_id)
    .fetch_optional(exec)
    .await
}

/// Evict expired offset records. Run periodically.
pub async fn expire_offsets(exec: impl sqlx::PgExecutor<'_>) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM data_item_offsets WHERE expires_at <= NOW()")
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}
