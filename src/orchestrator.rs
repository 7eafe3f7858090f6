use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::db::Db;
use crate::dedup::KeySnapshot;
use crate::error::IngestError;
use crate::record::{demo_records, RawRecord};
use crate::source::local::LocalDirSource;
use crate::source::remote::RemoteStoreSource;
use crate::source::{RecordSource, StaticSource};
use crate::state::{advance_high_water_mark, load_high_water_mark};
use crate::transform::{associations, transform, ValidationError};
use crate::writer::{BatchWriter, WriteStatement};

/// Running totals reported after each batch and at completion.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunTotals {
    /// Records processed as new this run.
    pub new_records: usize,
    /// Records dropped because their key was already in the destination.
    pub skipped: usize,
    /// Per-record failures (malformed payloads, undecodable entries).
    pub errors: usize,
    pub statements: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub dry_run: bool,
    pub batch_size: usize,
    pub page_size: usize,
    pub limit: Option<usize>,
}

/// Full import from a local export directory.
pub async fn run_import(
    db: &Db,
    dir: &std::path::Path,
    opts: &RunOptions,
    cancel: &CancelToken,
) -> Result<RunTotals, IngestError> {
    let mut source = LocalDirSource::open(dir, opts.page_size, opts.limit)?;
    let snapshot = KeySnapshot::load(db).await?;
    info!(
        source = source.label(),
        existing = snapshot.len(),
        dry_run = opts.dry_run,
        "import start"
    );
    let (totals, _) = drain_source(db, &mut source, &snapshot, opts, cancel, "import").await?;
    log_final("import", &totals);
    Ok(totals)
}

/// Incremental ingest from the remote document store, bounded below by the
/// high-water mark; advances the mark after a fully successful run.
pub async fn run_ingest(
    db: &Db,
    mut source: RemoteStoreSource,
    opts: &RunOptions,
    cancel: &CancelToken,
) -> Result<RunTotals, IngestError> {
    let snapshot = KeySnapshot::load(db).await?;
    let mark = load_high_water_mark(db).await?;
    source.set_lower_bound(mark);
    info!(
        source = source.label(),
        existing = snapshot.len(),
        mark = %mark.to_rfc3339(),
        dry_run = opts.dry_run,
        "ingest start"
    );
    let (totals, newest) =
        drain_source(db, &mut source, &snapshot, opts, cancel, "ingest").await?;
    if !opts.dry_run {
        if let Some(newest) = newest.filter(|n| *n > mark) {
            advance_high_water_mark(db, newest).await?;
        }
    }
    log_final("ingest", &totals);
    Ok(totals)
}

/// Regenerate player associations for records already in raw storage.
pub async fn run_backfill(
    db: &Db,
    opts: &RunOptions,
    cancel: &CancelToken,
) -> Result<RunTotals, IngestError> {
    info!(dry_run = opts.dry_run, "backfill start");
    let writer = BatchWriter {
        batch_size: opts.batch_size,
        dry_run: opts.dry_run,
    };
    let mut totals = RunTotals::default();
    let mut last_key: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            log_final("backfill", &totals);
            return Err(IngestError::Interrupted);
        }
        let remaining = opts.limit.map(|lim| lim.saturating_sub(totals.new_records));
        if remaining == Some(0) {
            break;
        }
        let fetch = remaining
            .unwrap_or(opts.page_size)
            .min(opts.page_size)
            .max(1);
        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT firebase_key, game_json, created_at
             FROM raw_games
             WHERE $1::text IS NULL OR firebase_key > $1
             ORDER BY firebase_key
             LIMIT $2",
        )
        .persistent(false)
        .bind(&last_key)
        .bind(fetch as i64)
        .fetch_all(&db.pool)
        .await?;
        if rows.is_empty() {
            break;
        }
        last_key = rows.last().map(|(key, _, _)| key.clone());

        let mut statements: Vec<WriteStatement> = Vec::new();
        for (key, game_json, created_at) in rows {
            let rec = RawRecord {
                key,
                game_json,
                created_at,
            };
            match associations(&rec) {
                Ok(stmts) => {
                    statements.extend(stmts);
                    totals.new_records += 1;
                }
                Err(err) => note_malformed(&mut totals, &rec.key, &err),
            }
        }
        let summary = writer.apply(db, statements, cancel).await?;
        totals.statements += summary.statements;
        totals.chunks += summary.chunks;
        log_batch("backfill", &totals);
        if summary.interrupted {
            log_final("backfill", &totals);
            return Err(IngestError::Interrupted);
        }
    }
    log_final("backfill", &totals);
    Ok(totals)
}

/// Load the bundled demo fixtures through the normal import path.
pub async fn run_seed(
    db: &Db,
    opts: &RunOptions,
    cancel: &CancelToken,
) -> Result<RunTotals, IngestError> {
    let mut source = StaticSource::new(demo_records(), opts.page_size, "fixtures");
    let snapshot = KeySnapshot::load(db).await?;
    info!(existing = snapshot.len(), dry_run = opts.dry_run, "seed start");
    let (totals, _) = drain_source(db, &mut source, &snapshot, opts, cancel, "seed").await?;
    log_final("seed", &totals);
    Ok(totals)
}

/// Shared page loop: filter against the key snapshot, transform, batch-write.
/// Returns the totals plus the newest creation time among records written.
async fn drain_source<S>(
    db: &Db,
    source: &mut S,
    snapshot: &KeySnapshot,
    opts: &RunOptions,
    cancel: &CancelToken,
    mode: &str,
) -> Result<(RunTotals, Option<DateTime<Utc>>), IngestError>
where
    S: RecordSource + Send + ?Sized,
{
    let writer = BatchWriter {
        batch_size: opts.batch_size,
        dry_run: opts.dry_run,
    };
    let mut totals = RunTotals::default();
    let mut newest: Option<DateTime<Utc>> = None;

    while let Some(page) = source.next_page().await? {
        if cancel.is_cancelled() {
            log_final(mode, &totals);
            return Err(IngestError::Interrupted);
        }
        totals.errors += page.malformed;
        let (fresh, skipped) = snapshot.filter_new(page.records);
        totals.skipped += skipped;

        let mut statements: Vec<WriteStatement> = Vec::new();
        for rec in &fresh {
            match transform(rec) {
                Ok(stmts) => {
                    statements.extend(stmts);
                    totals.new_records += 1;
                    newest = Some(newest.map_or(rec.created_at, |n| n.max(rec.created_at)));
                }
                Err(err) => note_malformed(&mut totals, &rec.key, &err),
            }
        }

        let summary = writer.apply(db, statements, cancel).await?;
        totals.statements += summary.statements;
        totals.chunks += summary.chunks;
        log_batch(mode, &totals);
        if summary.interrupted {
            log_final(mode, &totals);
            return Err(IngestError::Interrupted);
        }
    }
    Ok((totals, newest))
}

/// Per-record failures are logged with a running counter and never escalated.
fn note_malformed(totals: &mut RunTotals, key: &str, err: &ValidationError) {
    let err = IngestError::MalformedRecord {
        key: key.to_string(),
        reason: err.to_string(),
    };
    warn!(error = %err, "skipping record");
    totals.errors += 1;
}

fn log_batch(mode: &str, totals: &RunTotals) {
    info!(
        mode,
        new = totals.new_records,
        skipped = totals.skipped,
        errors = totals.errors,
        statements = totals.statements,
        chunks = totals.chunks,
        "batch complete"
    );
}

fn log_final(mode: &str, totals: &RunTotals) {
    info!(
        mode,
        new = totals.new_records,
        skipped = totals.skipped,
        errors = totals.errors,
        statements = totals.statements,
        chunks = totals.chunks,
        "run summary"
    );
}
