use std::path::PathBuf;

use anyhow::Result;
use casa_core::SheetDate;
use casa_ingest::{
    backfill_dir, build_backend, migrate_backends, ArchiveConfig, ArchiveService, BackendChoice,
    IngestOutcome,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "casa-cli")]
#[command(about = "Car auction sheet archiver command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the configured source and ingest it if changed.
    Crawl {
        /// Override the claimed sheet date (YYMMDD).
        #[arg(long)]
        date: Option<String>,
        /// Override the configured source URL.
        #[arg(long)]
        url: Option<String>,
    },
    /// Serve the archive API.
    Serve,
    /// List stored dates, newest first.
    Dates,
    /// Ingest auction_data_YYMMDD.csv sheets from a local directory.
    Backfill { dir: PathBuf },
    /// Copy every stored date from one backend into the other.
    Migrate {
        /// Source backend: files or sqlite.
        #[arg(long)]
        from: String,
        /// Target backend: files or sqlite.
        #[arg(long)]
        to: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Crawl {
        date: None,
        url: None,
    }) {
        Commands::Crawl { date, url } => {
            let mut config = ArchiveConfig::from_env();
            if let Some(url) = url {
                config.source_url = url;
            }
            anyhow::ensure!(
                !config.source_url.is_empty(),
                "no source URL configured (set CASA_SOURCE_URL or pass --url)"
            );
            let claimed = match date {
                Some(raw) => Some(raw.parse::<SheetDate>()?),
                None => None,
            };
            let service = ArchiveService::from_config(config).await?;
            match service.trigger_ingestion(claimed).await? {
                IngestOutcome::Skipped => println!("crawl complete: upstream unchanged"),
                IngestOutcome::NoOpWrite { date } => {
                    println!("crawl complete: content identical for {date}")
                }
                IngestOutcome::Written {
                    date,
                    row_count,
                    warnings,
                    history_appended,
                    ..
                } => println!(
                    "crawl complete: date={date} rows={row_count} warnings={} history={}",
                    warnings.len(),
                    history_appended
                ),
            }
        }
        Commands::Serve => {
            casa_web::serve_from_env().await?;
        }
        Commands::Dates => {
            let service = ArchiveService::from_config(ArchiveConfig::from_env()).await?;
            for date in service.list_dates().await? {
                println!("{date}");
            }
        }
        Commands::Backfill { dir } => {
            let service = ArchiveService::from_config(ArchiveConfig::from_env()).await?;
            let summary = backfill_dir(&service, &dir).await?;
            println!(
                "backfill complete: ingested={} unchanged={} failed={}",
                summary.ingested, summary.unchanged, summary.failed
            );
        }
        Commands::Migrate { from, to } => {
            let base = ArchiveConfig::from_env();
            let source_choice: BackendChoice =
                from.parse().map_err(|err: String| anyhow::anyhow!(err))?;
            let target_choice: BackendChoice =
                to.parse().map_err(|err: String| anyhow::anyhow!(err))?;
            anyhow::ensure!(source_choice != target_choice, "--from and --to must differ");

            let source = build_backend(&ArchiveConfig {
                backend: source_choice,
                ..base.clone()
            })
            .await?;
            let target = build_backend(&ArchiveConfig {
                backend: target_choice,
                ..base
            })
            .await?;
            let summary = migrate_backends(source.as_ref(), target.as_ref()).await?;
            println!(
                "migrate complete: copied={} skipped={}",
                summary.copied, summary.skipped
            );
        }
    }

    Ok(())
}
