//! docingest upload CLI entry point.

mod app;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser};
use docingest_protocol::Destination;
use tracing_subscriber::EnvFilter;

/// Upload documents to a docingest project or folder.
#[derive(Debug, Parser)]
#[command(name = "docingest-upload", version)]
#[command(group(ArgGroup::new("destination").required(true).args(["project", "folder"])))]
struct Cli {
    /// Service base URL, e.g. https://docs.example.com/api
    #[arg(long, env = "DOCINGEST_URL")]
    base_url: Option<String>,

    /// Bearer token
    #[arg(long, env = "DOCINGEST_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Upload into this project
    #[arg(long, value_name = "PROJECT_ID")]
    project: Option<String>,

    /// Upload into this folder
    #[arg(long, value_name = "FOLDER_ID")]
    folder: Option<String>,

    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Batch id shared by every file of this run (generated when absent)
    #[arg(long)]
    batch_id: Option<String>,

    /// Chunk size in bytes
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Chunks in flight per file
    #[arg(long)]
    parallel: Option<usize>,

    /// Files uploading at the same time
    #[arg(long)]
    active: Option<usize>,

    /// Files and folders to upload
    #[arg(required = true, value_name = "PATH")]
    paths: Vec<PathBuf>,
}

impl Cli {
    fn destination(&self) -> Option<Destination> {
        match (&self.project, &self.folder) {
            (Some(id), _) => Some(Destination::Project(id.clone())),
            (None, Some(id)) => Some(Destination::Folder(id.clone())),
            (None, None) => None,
        }
    }

    fn overrides(&self) -> config::Overrides {
        config::Overrides {
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            chunk_size: self.chunk_size,
            parallel_chunks: self.parallel,
            active_tasks: self.active,
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,docingest=debug")),
        )
        .init();

    let cli = Cli::parse();
    let destination = cli
        .destination()
        .ok_or_else(|| anyhow::anyhow!("either --project or --folder is required"))?;

    let config = config::Config::load(cli.config.as_deref())?.with_overrides(cli.overrides());

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(app::run(config, destination, cli.batch_id, cli.paths))?;

    tracing::info!(
        done = report.done,
        failed = report.failed,
        canceled = report.canceled,
        "upload finished"
    );
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
