//! Packsync Administration CLI
//!
//! Works directly on a repository directory; do not run `repair`
//! against a repository a live server is writing to.

mod verify;

use anyhow::Result;
use clap::{Parser, Subcommand};
use packsync_core::Repository;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "packsync-admin")]
#[command(version)]
#[command(about = "Packsync repository administration tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new repository
    Init { path: PathBuf },

    /// List refs
    Refs {
        #[arg(short, long)]
        repo: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the update log
    Log {
        #[arg(short, long)]
        repo: PathBuf,
        /// Only records for this ref
        #[arg(long = "ref")]
        ref_name: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Check invariants without changing anything
    Verify {
        #[arg(short, long)]
        repo: PathBuf,
        #[arg(short, long)]
        quiet: bool,
    },

    /// Reconcile refs and log after a crash
    Repair {
        #[arg(short, long)]
        repo: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Init { path } => {
            std::fs::create_dir_all(&path)?;
            let repo = Repository::open(&path).await?;
            println!("Initialized repository at {}", path.display());
            println!("  UUID: {}", repo.uuid());
        }

        Commands::Refs { repo, json } => {
            let repo = Repository::open_existing(&repo)?;
            let refs = repo.coordinator().list_refs().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&refs)?);
            } else {
                for entry in refs {
                    println!("{:<40} {:<42} {}", entry.name, entry.oid, entry.pack_id);
                }
            }
        }

        Commands::Log {
            repo,
            ref_name,
            json,
        } => {
            let repo = Repository::open_existing(&repo)?;
            let records = repo.coordinator().log(ref_name.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for r in records {
                    let when = chrono::DateTime::from_timestamp(r.timestamp, 0)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| r.timestamp.to_string());
                    let old = if r.old_oid.is_empty() { "-" } else { r.old_oid.as_str() };
                    println!(
                        "{:>6}  {}  {}  {} -> {}  {} ({} bytes)",
                        r.seq, when, r.name, old, r.new_oid, r.pack_id, r.size
                    );
                }
            }
        }

        Commands::Verify { repo, quiet } => {
            verify::verify_repository(&repo, quiet).await?;
        }

        Commands::Repair { repo } => {
            verify::repair_repository(&repo).await?;
        }
    }

    Ok(())
}
