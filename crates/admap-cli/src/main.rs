mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use admap_core::Tier;
use admap_sync::{
    lookup_codes, migrate, report_recent_markdown, run_reconcile, run_seed, DiagnosticKind,
    RunOptions, SyncConfig,
};
use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::logging::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "admap")]
#[command(
    about = "Reconcile shipping provider administrative units against the canonical taxonomy"
)]
struct Cli {
    /// Repeat for more detail (-v debug, -vv trace). Ignored when RUST_LOG is set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, match and persist one provider's provinces, districts and wards.
    Reconcile {
        /// Provider code from the registry (defaults to ADMAP_PROVIDER).
        #[arg(long)]
        provider: Option<String>,
        /// Read provider data from a fixture file instead of calling the API.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Read the canonical taxonomy from a JSON snapshot instead of the database.
        #[arg(long)]
        canonical: Option<PathBuf>,
        /// Match and report without writing mappings.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Apply database migrations.
    Migrate,
    /// Load the canonical taxonomy from a JSON snapshot into the database.
    Seed {
        #[arg(long)]
        canonical: PathBuf,
    },
    /// Print stored provider codes for canonical ids.
    Lookup {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        province: i64,
        #[arg(long)]
        district: i64,
        #[arg(long)]
        ward: Option<i64>,
    },
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format);
    let config = SyncConfig::from_env()?;

    let command = cli.command.unwrap_or(Commands::Reconcile {
        provider: None,
        fixture: None,
        canonical: None,
        dry_run: false,
        concurrency: None,
    });

    match command {
        Commands::Reconcile {
            provider,
            fixture,
            canonical,
            dry_run,
            concurrency,
        } => {
            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received; finishing in-flight work");
                        cancel.cancel();
                    }
                }
            });

            let options = RunOptions {
                provider,
                fixture,
                canonical,
                dry_run,
                concurrency,
                cancel,
            };
            let (report, dir) = run_reconcile(&config, options).await?;

            println!(
                "reconcile complete: run_id={} provider={} digest={} report={}",
                report.run_id,
                report.provider_code,
                report.mapping_digest,
                dir.display()
            );
            for tier in Tier::ALL {
                let c = report.counts(tier);
                println!(
                    "  {tier:<8} fetched={} resolved={} unresolved={} ambiguous={} \
                     written={} unchanged={} persist_failed={}",
                    c.fetched,
                    c.resolved,
                    c.unresolved,
                    c.ambiguous,
                    c.written,
                    c.unchanged,
                    c.persist_failed
                );
            }

            if report.cancelled {
                eprintln!("run was cancelled; the report covers completed work only");
                return Ok(ExitCode::from(130));
            }
            if report.diagnostics_of(DiagnosticKind::PersistFailed).next().is_some() {
                eprintln!("some mapping batches were not persisted; see the report");
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Migrate => {
            migrate(&config).await?;
            println!("migrations applied");
        }
        Commands::Seed { canonical } => {
            let stats = run_seed(&config, &canonical).await?;
            println!("seeded canonical taxonomy from {}", canonical.display());
            for tier in Tier::ALL {
                let s = stats.tier(tier);
                println!("  {tier:<8} written={} unchanged={}", s.written, s.unchanged);
            }
        }
        Commands::Lookup {
            provider,
            province,
            district,
            ward,
        } => {
            let codes = lookup_codes(&config, &provider, province, district, ward).await?;
            let show = |code: Option<String>| code.unwrap_or_else(|| "-".to_string());
            println!("province={}", show(codes.province));
            println!("district={}", show(codes.district));
            if ward.is_some() {
                println!("ward={}", show(codes.ward));
            }
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
