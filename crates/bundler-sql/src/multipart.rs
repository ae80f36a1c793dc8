use chrono::{DateTime, Utc};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MultipartUploadRow {
    pub upload_id: uuid::Uuid,
    pub uploader_address: Option<String>,
    pub chunk_size: i64,
    pub expected_chunks: Option<i32>,
    pub received_chunks: i32,
    pub finalized: bool,
    pub data_item_id: Option<String>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

const COLUMNS: &str = r#"
    upload_id, uploader_address, chunk_size, expected_chunks, received_chunks,
    finalized, data_item_id, failure, created_at, expires_at
"#;

pub async fn create_upload(
    upload_id: uuid::Uuid,
    uploader_address: Option<&str>,
    chunk_size: i64,
    expected_chunks: Option<i32>,
    expires_at: DateTime<Utc>,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO multipart_uploads (upload_id, uploader_address, chunk_size, expected_chunks, expires_at)
        VALUES ($1, $2, $3, $4, $5);
        "#,
    )
    .bind(upload_id)
    .bind(uploader_address)
    .bind(chunk_size)
    .bind(expected_chunks)
    .bind(expires_at)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn get_upload(
    upload_id: uuid::Uuid,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Option<MultipartUploadRow>> {
    sqlx::query_as::<_, MultipartUploadRow>(&format!(
        "SELECT {COLUMNS} FROM multipart_uploads WHERE upload_id = $1"
    ))
    .bind(upload_id)
    .fetch_optional(exec)
    .await
}

/// Record a received chunk. `received_chunks` tracks the highest contiguous
/// index bound seen, which the progress endpoint reports.
pub async fn record_chunk(
    upload_id: uuid::Uuid,
    chunk_index: i32,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE multipart_uploads
        SET received_chunks = GREATEST(received_chunks, $2 + 1)
        WHERE upload_id = $1 AND NOT finalized AND expires_at > NOW();
        "#,
    )
    .bind(upload_id)
    .bind(chunk_index)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Mark the upload assembled into the given data item.
pub async fn mark_finalized(
    upload_id: uuid::Uuid,
    data_item_id: &str,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE multipart_uploads
        SET finalized = TRUE, data_item_id = $2, failure = NULL
        WHERE upload_id = $1;
        "#,
    )
    .bind(upload_id)
    .bind(data_item_id)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn mark_failure(
    upload_id: uuid::Uuid,
    failure: &str,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE multipart_uploads SET failure = $2 WHERE upload_id = $1")
        .bind(upload_id)
        .bind(failure)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn delete_upload(
    upload_id: uuid::Uuid,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM multipart_uploads WHERE upload_id = $1")
        .bind(upload_id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Abandoned uploads past their expiry, for the cleanup sweep to abort.
pub async fn expired_uploads(
    limit: i64,
    exec: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<MultipartUploadRow>> {
    sqlx::query_as::<_, MultipartUploadRow>(&format!(
        r#"
        SELECT {COLUMNS} FROM multipart_uploads
        WHERE NOT finalized AND expires_at <= NOW()
        ORDER BY expires_at
        LIMIT $1;
        "#
    ))
    .bind(limit)
    .fetch_all(exec)
    .await
}
