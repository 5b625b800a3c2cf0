use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use doge_sync::{list_snapshots, run_sync_once_from_env, PipelineConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "doge-cli")]
#[command(about = "Incremental DOGE savings scraper")]
struct Cli {
    /// Which `.env.<environment>` file to load.
    #[arg(value_enum)]
    environment: Environment,

    #[arg(long, default_value = ".")]
    env_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Environment {
    Test,
    Prod,
}

impl Environment {
    fn file_name(self) -> &'static str {
        match self {
            Environment::Test => ".env.test",
            Environment::Prod => ".env.prod",
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape, diff, enrich and publish once.
    Run,
    /// List published snapshots in the project.
    Snapshots,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let env_file = cli.env_dir.join(cli.environment.file_name());
    match dotenvy::from_path(&env_file) {
        Ok(()) => info!(path = %env_file.display(), "loaded environment file"),
        Err(err) => warn!(path = %env_file.display(), error = %err, "environment file not loaded"),
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let report = run_sync_once_from_env().await?;
            println!(
                "run complete: run_id={} stamp={} new_rows={} uploaded={} failed={}",
                report.run_id,
                report.stamp,
                report.total_new_rows(),
                report.outcome.success.len(),
                report.outcome.failure.len()
            );
        }
        Commands::Snapshots => {
            let config = PipelineConfig::from_env().context("loading configuration")?;
            let pipeline = SyncPipeline::new(config)?;
            let project_id = pipeline.config().bln_project_id.clone();
            let listed = list_snapshots(pipeline.storage().as_ref(), &project_id).await?;
            for (category, files) in listed {
                for file in files {
                    println!("{category}\t{}\t{}", file.name, file.updated_at);
                }
            }
        }
    }

    Ok(())
}
