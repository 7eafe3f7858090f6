use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gamelog_ingest::cancel::{install_ctrl_c_handler, CancelToken};
use gamelog_ingest::db::Db;
use gamelog_ingest::error::IngestError;
use gamelog_ingest::orchestrator::{
    run_backfill, run_import, run_ingest, run_seed, RunOptions, RunTotals,
};
use gamelog_ingest::source::remote::{RemoteStoreClient, RemoteStoreSource};
use gamelog_ingest::util::env as env_util;

#[derive(Parser, Debug)]
#[command(name = "gamelog-ingest", version, about = "Game-log ingestion pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import records from a local export directory
    Import {
        /// Directory of JSON export files named with a leading ISO-8601 timestamp
        dir: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Incrementally ingest new records from the remote document store
    Ingest {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Regenerate player associations for records already in raw storage
    Backfill {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Load the bundled demo records (local development)
    Seed {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Debug, Default, Args)]
struct CommonArgs {
    /// Target the local destination instance instead of the default remote one
    #[arg(long)]
    local: bool,
    /// Report intended writes without applying them
    #[arg(long)]
    dry_run: bool,
    /// Cap the number of records processed
    #[arg(long)]
    limit: Option<usize>,
    /// Maximum statements per write chunk
    #[arg(long, default_value_t = 50)]
    batch_size: usize,
    /// Records fetched per source page
    #[arg(long, default_value_t = 100)]
    page_size: usize,
}

impl CommonArgs {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            dry_run: self.dry_run,
            batch_size: self.batch_size,
            page_size: self.page_size,
            limit: self.limit,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let common = match &cli.command {
        Command::Import { common, .. }
        | Command::Ingest { common }
        | Command::Backfill { common }
        | Command::Seed { common } => common,
    };

    let database_url = env_util::db_url(common.local)?;
    let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 4u32);
    let db = Db::connect(&database_url, max_conns)
        .await
        .context("connecting to destination")?;
    // Dry runs must leave the destination untouched, schema included.
    if !common.dry_run && env_util::env_flag("AUTO_MIGRATE", true) {
        db.ensure_schema().await?;
    }

    let cancel = CancelToken::new();
    install_ctrl_c_handler(cancel.clone());
    let opts = common.run_options();

    let result: Result<RunTotals, IngestError> = match &cli.command {
        Command::Import { dir, .. } => run_import(&db, dir, &opts, &cancel).await,
        Command::Ingest { common } => {
            let base_url = env_util::store_base_url()?;
            let client = RemoteStoreClient::new(
                &base_url,
                env_util::env_opt("STORE_TIMEOUT_SECS").and_then(|s| s.parse().ok()),
            )?
            .with_auth_token(env_util::store_auth_token());
            let source = RemoteStoreSource::new(
                client,
                &env_util::store_collection(),
                common.page_size as u32,
                common.limit,
            );
            run_ingest(&db, source, &opts, &cancel).await
        }
        Command::Backfill { .. } => run_backfill(&db, &opts, &cancel).await,
        Command::Seed { .. } => run_seed(&db, &opts, &cancel).await,
    };

    match result {
        Ok(totals) => {
            // Per-record errors were already counted and logged; completion
            // with a non-zero error count still exits 0.
            info!(
                new = totals.new_records,
                skipped = totals.skipped,
                errors = totals.errors,
                "done"
            );
            Ok(())
        }
        Err(IngestError::Interrupted) => {
            error!("run interrupted by operator");
            std::process::exit(130);
        }
        Err(err) => Err(err.into()),
    }
}
