//! Explicit SQL over the bundler's relational state machine. Queries use
//! prepared statements with runtime binding; schema changes are the ordered,
//! forward-only migrations under `./migrations`.

pub mod bundles;
pub mod data_items;
pub mod multipart;
pub mod offsets;
pub mod plans;

pub use bundles::BundleRow;
pub use data_items::{DataItemRow, InsertOutcome, StatusRow};
pub use multipart::MultipartUploadRow;
pub use offsets::OffsetRow;
pub use plans::PlanCandidate;

/// Embedded migrations, applied at service boot.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Run all pending migrations.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}
