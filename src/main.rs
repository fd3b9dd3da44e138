//! Command-line inspector for run archives.
//!
//! Loads a JSONL document archive into the in-process store and answers the
//! usual operator questions: which runs are here, what streams do they carry,
//! what does a stream's schema look like, and what do the columns hold.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use daq_catalog::catalog::Catalog;
use daq_catalog::store::{MemStore, StoreCtx};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "daq-catalog", about = "Inspect a run archive", version)]
struct Cli {
    /// JSONL document archive to load.
    #[arg(long, global = true, default_value = "runs.jsonl")]
    archive: PathBuf,

    /// Optional TOML settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List runs with scan id, time, and exit status.
    List,
    /// List the streams of one run.
    Streams { uid: String },
    /// Show the schema of one stream.
    Schema { uid: String, stream: String },
    /// Materialize a stream and summarize its columns.
    Read {
        uid: String,
        stream: String,
        /// Restrict to one column.
        #[arg(long)]
        column: Option<String>,
    },
    /// Replay a run's documents, optionally as pages.
    Replay {
        uid: String,
        /// Batch events/datums into pages of this many rows.
        #[arg(long)]
        page_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = daq_catalog::CatalogSettings::load(cli.config.as_deref())
        .context("loading settings")?;

    let store = Arc::new(MemStore::new());
    let count = store
        .load_jsonl(&cli.archive)
        .with_context(|| format!("loading archive {}", cli.archive.display()))?;
    tracing::info!(documents = count, archive = %cli.archive.display(), "archive loaded");

    let catalog = Catalog::builder()
        .settings(settings)
        .store(store)
        .build()
        .context("building catalog")?;
    let ctx = StoreCtx::unbounded();

    match cli.command {
        Command::List => {
            let runs = catalog.runs()?.collect().await?;
            for run in runs {
                let status = run
                    .stop()
                    .map(|stop| format!("{:?}", stop.exit_status).to_lowercase())
                    .unwrap_or_else(|| "live".to_string());
                let started = chrono::DateTime::from_timestamp(run.start().time as i64, 0)
                    .map(|when| when.to_rfc3339())
                    .unwrap_or_else(|| run.start().time.to_string());
                println!(
                    "{}  scan_id={:<6} started={started}  {status}",
                    run.uid(),
                    run.scan_id(),
                );
            }
        }
        Command::Streams { uid } => {
            let run = catalog.get(&uid).await?;
            for name in run.stream_names() {
                println!("{name}");
            }
        }
        Command::Schema { uid, stream } => {
            let run = catalog.get(&uid).await?;
            let materializer = run.stream(&stream)?.data(&ctx).await?;
            let schema = materializer.schema(&ctx).await?;
            println!("rows: {}", schema.length);
            for (key, column) in &schema.columns {
                println!(
                    "{key}: dims={:?} shape={:?} dtype={:?} chunks={:?}",
                    column.dims, column.shape, column.dtype, column.chunks
                );
            }
        }
        Command::Read {
            uid,
            stream,
            column,
        } => {
            let run = catalog.get(&uid).await?;
            let materializer = run.stream(&stream)?.data(&ctx).await?;
            match column {
                Some(key) => {
                    let array = materializer.read_column(&ctx, &key).await?;
                    println!("{key}: shape={:?} dims={:?}", array.values.shape(), array.dims);
                }
                None => {
                    let dataset = materializer.read(&ctx).await?;
                    println!("time: {} rows", dataset.time.len());
                    for (key, array) in &dataset.arrays {
                        println!("{key}: shape={:?}", array.values.shape());
                    }
                }
            }
        }
        Command::Replay { uid, page_size } => {
            let run = catalog.get(&uid).await?;
            match page_size {
                None => {
                    let mut replay = run.single_documents(&ctx, false)?;
                    while let Some(doc) = replay.next().await? {
                        println!("{}", doc.name());
                    }
                }
                Some(size) => {
                    let mut replay = run.documents(&ctx, false, size)?;
                    while let Some(doc) = replay.next().await? {
                        println!("{}", doc.name());
                    }
                }
            }
        }
    }
    Ok(())
}
