use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cinelog_ingest::{check_queue, IngestConfig, IngestPipeline, QueueGate};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cinelog")]
#[command(about = "Film diary ingestion pipeline")]
struct Cli {
    /// Workspace root holding cinelog.yaml and the data directory.
    /// Defaults to CINELOG_ROOT, then the current directory.
    #[arg(long)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Gate for the calling automation: exit 1 when nothing is pending.
    Check,
    /// Ingest the head-of-queue film.
    Process,
    /// Ingest every pending film, sequentially.
    ProcessAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let root = cli.root.unwrap_or_else(IngestConfig::root_from_env);

    match cli.command.unwrap_or(Commands::Process) {
        Commands::Check => match check_queue(&root).await? {
            QueueGate::Proceed { queued } => println!("{queued} film(s) pending"),
            QueueGate::Skip => {
                println!("pending queue empty; nothing to do");
                std::process::exit(1);
            }
        },
        Commands::Process => {
            let pipeline = IngestPipeline::from_config(IngestConfig::load(&root)?)?;
            print_summary(&pipeline.process_next().await?);
        }
        Commands::ProcessAll => {
            let pipeline = IngestPipeline::from_config(IngestConfig::load(&root)?)?;
            print_summary(&pipeline.process_all().await?);
        }
    }

    Ok(())
}

fn print_summary(summary: &cinelog_ingest::RunSummary) {
    println!(
        "run complete: run_id={} processed={} ingested={} skipped={} escalated={}",
        summary.run_id, summary.processed, summary.ingested, summary.skipped, summary.escalated
    );
}
