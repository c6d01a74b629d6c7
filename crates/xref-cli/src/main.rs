use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use xref_sync::{RunConfig, SimilarityConfig, MATCHES_TABLE};

#[derive(Debug, Parser)]
#[command(name = "xref-cli")]
#[command(about = "Links adviser fund filings to private-offering filings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Recompute the cross-reference match table.
    Run {
        /// Match and report without touching the output table.
        #[arg(long)]
        dry_run: bool,
        /// Also try edit-distance matching after key and name lookups fail.
        #[arg(long)]
        similarity: bool,
    },
    /// Print the number of rows in the match table.
    Count,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .try_init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        dry_run: false,
        similarity: false,
    });

    match command {
        Commands::Run {
            dry_run,
            similarity,
        } => {
            let mut config = RunConfig::from_env()?;
            config.dry_run |= dry_run;
            if similarity {
                config.similarity = Some(SimilarityConfig::default());
            }
            let summary = xref_sync::run_once(config).await?;
            let stats = summary.cascade;
            println!(
                "run complete: run_id={} processed={} key={} name={} similarity={} unmatched={} skipped={}",
                summary.run_id,
                stats.processed,
                stats.matched_by_key,
                stats.matched_by_name,
                stats.matched_by_similarity,
                stats.unmatched,
                stats.unusable
            );
        }
        Commands::Count => {
            let rows = xref_sync::output_row_count_from_env().await?;
            println!("{MATCHES_TABLE}: {rows} rows");
        }
    }

    Ok(())
}
