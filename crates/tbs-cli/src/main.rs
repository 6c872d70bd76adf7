use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tbs_storage::PgDirectory;
use tbs_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "tbs-cli")]
#[command(about = "The Bed Shop hierarchy sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a hierarchy workbook and sync it into the directory.
    Sync {
        /// Path to the .xlsx upload.
        file: PathBuf,
    },
    /// Apply pending database migrations.
    Migrate,
    /// Run the admin web API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync { file } => {
            let workbook = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read workbook at {}", file.display()))?;
            let pipeline = tbs_sync::pipeline_from_env().await?;
            let summary = pipeline.run(&workbook).await?;
            println!(
                "sync complete: run_id={} rows={} ok={} failed={} users=+{}/~{} stores=+{}/~{} assignments=+{}/~{}/-{} conflicts={}",
                summary.run_id,
                summary.total_rows,
                summary.succeeded_rows,
                summary.failed_rows,
                summary.users.created,
                summary.users.updated,
                summary.stores.created,
                summary.stores.updated,
                summary.assignments.created,
                summary.assignments.updated,
                summary.assignments.deactivated,
                summary.conflicts,
            );
            for error in &summary.errors {
                eprintln!("  rows {:?}: {}", error.row_numbers, error.message);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let directory = PgDirectory::connect(&config.database_url).await?;
            directory.run_migrations().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            tbs_web::serve_from_env().await?;
        }
    }

    Ok(())
}
