//! # Course Context CLI (`ccx`)
//!
//! Command-line front end for ingesting course materials and querying them.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ccx init` | Create the SQLite database and tables |
//! | `ccx ingest --course <c> <keys...>` | Ingest objects from storage into a course |
//! | `ccx search --course <c> "<query>"` | Retrieve the most relevant chunks |
//! | `ccx files --course <c>` | List files ingested into a course |
//! | `ccx delete --course <c> --s3-path <key>` | Remove a file's chunks |
//! | `ccx stats --course <c>` | Files and monitored queries for a course |
//!
//! Log verbosity follows `RUST_LOG` (default `course_context=info`); logs
//! go to stderr so command output stays machine-readable.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use course_context::config;
use course_context::context::AppContext;
use course_context::ingest::Ingestor;
use course_context::manage::CourseMaterials;
use course_context::migrate;
use course_context::models::IngestStatus;
use course_context::retrieval::Retriever;

/// Course Context: document ingestion and retrieval for course materials.
#[derive(Parser)]
#[command(name = "ccx", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ccx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest objects from storage into a course.
    ///
    /// Prints `{"success_ingest": [...], "failure_ingest": [...]}`.
    Ingest {
        /// Course the files belong to.
        #[arg(long)]
        course: String,

        /// Object keys to ingest (`.pdf`, `.docx`, `.ppt`/`.pptx`, `.srt`, `.txt`).
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Retrieve the chunks of a course most relevant to a query.
    Search {
        query: String,

        #[arg(long)]
        course: String,

        /// Number of chunks to return (default from `retrieval.default_top_k`).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// List the distinct files ingested into a course.
    Files {
        #[arg(long)]
        course: String,
    },

    /// Remove every chunk of one file from a course.
    Delete {
        #[arg(long)]
        course: String,

        #[arg(long)]
        s3_path: String,
    },

    /// Show file and query counts for a course.
    Stats {
        #[arg(long)]
        course: String,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "course_context=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn open(cfg: &config::Config) -> Result<Arc<AppContext>> {
    Ok(Arc::new(AppContext::from_config(cfg).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Ingest { course, keys } => {
            let report = Ingestor::new(open(&cfg).await?)?
                .bulk_ingest(&keys, &course)
                .await;
            for outcome in report.outcomes.iter() {
                if outcome.status == IngestStatus::Failure {
                    eprintln!("{}: {}", outcome.path, outcome.detail);
                }
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Search {
            query,
            course,
            top_k,
        } => {
            let retriever = Retriever::new(open(&cfg).await?);
            let hits = retriever.search(&query, &course, top_k).await?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
            retriever.flush_monitor().await;
        }
        Commands::Files { course } => {
            let files = CourseMaterials::new(open(&cfg).await?).list_files(&course).await?;
            println!("{}", serde_json::to_string_pretty(&files)?);
        }
        Commands::Delete { course, s3_path } => {
            let summary = CourseMaterials::new(open(&cfg).await?)
                .delete_document(&course, &s3_path)
                .await?;
            println!(
                "Deleted {} vector entries and {} log rows for {}",
                summary.vector_entries, summary.log_rows, s3_path
            );
        }
        Commands::Stats { course } => {
            let materials = CourseMaterials::new(open(&cfg).await?);
            let files = materials.list_files(&course).await?;
            let queries = materials.query_count(&course).await?;
            println!("Course:  {}", course);
            println!("Files:   {}", files.len());
            println!("Queries: {}", queries);
        }
    }

    Ok(())
}
