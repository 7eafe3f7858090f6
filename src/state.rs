use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::db::Db;
use crate::error::IngestError;

/// The ingest_state table holds exactly one row; the schema's CHECK (id = 1)
/// primary key rejects any second insert.
const STATE_ID: i16 = 1;

/// Latest successfully ingested creation time, or the Unix epoch when no run
/// has completed yet.
#[instrument(skip(db))]
pub async fn load_high_water_mark(db: &Db) -> Result<DateTime<Utc>, IngestError> {
    let mark: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT last_ingested_at FROM ingest_state WHERE id = $1")
            .persistent(false)
            .bind(STATE_ID)
            .fetch_optional(&db.pool)
            .await?;
    Ok(mark.unwrap_or(DateTime::UNIX_EPOCH))
}

/// Advance the mark to `newest`. GREATEST keeps the mark monotonic even if a
/// slower run finishes after a faster one already moved it forward.
#[instrument(skip(db))]
pub async fn advance_high_water_mark(db: &Db, newest: DateTime<Utc>) -> Result<(), IngestError> {
    sqlx::query(
        "INSERT INTO ingest_state (id, last_ingested_at)
         VALUES ($1, $2)
         ON CONFLICT (id) DO UPDATE
            SET last_ingested_at = GREATEST(ingest_state.last_ingested_at, EXCLUDED.last_ingested_at)",
    )
    .persistent(false)
    .bind(STATE_ID)
    .bind(newest)
    .execute(&db.pool)
    .await?;
    info!(mark = %newest.to_rfc3339(), "high-water mark advanced");
    Ok(())
}
