use anyhow::Result;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

/// Destination schema. Idempotent so repeated bootstraps are safe against an
/// existing database; the singleton CHECK on ingest_state is what makes a
/// second high-water-mark row impossible.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS raw_games (
        firebase_key TEXT PRIMARY KEY,
        game_json    TEXT NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL
     )",
    "CREATE TABLE IF NOT EXISTS player_games (
        id           BIGSERIAL PRIMARY KEY,
        player_uid   TEXT NOT NULL,
        firebase_key TEXT NOT NULL REFERENCES raw_games(firebase_key),
        created_at   TIMESTAMPTZ NOT NULL,
        UNIQUE (player_uid, firebase_key)
     )",
    "CREATE TABLE IF NOT EXISTS ingest_state (
        id               SMALLINT PRIMARY KEY CHECK (id = 1),
        last_ingested_at TIMESTAMPTZ NOT NULL DEFAULT 'epoch'
     )",
];

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        // Ensure TLS is enabled when DSN contains sslmode=require
        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        // PgBouncer txn mode safe
        connect_options = connect_options.statement_cache_capacity(0);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to destination");
        Ok(Self { pool })
    }

    /// Apply the embedded schema (CREATE TABLE IF NOT EXISTS only).
    pub async fn ensure_schema(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::raw_sql(stmt).execute(&self.pool).await?;
        }
        info!("destination schema ensured");
        Ok(())
    }
}
