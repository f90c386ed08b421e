//! `tagsync <TASK_ID> <TAG_NAME> [REQUEST_ID]`

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tagsync::{IngestAction, Services, TagSyncConfig, TagSyncRunner, TaskInvocation};
use tagsync_logging::LogConfig;

#[derive(Parser, Debug)]
#[command(
    name = "tagsync",
    version,
    about = "Sync one tag column from its HDFS extract into the warehouse"
)]
struct Cli {
    /// Tag sync task id
    task_id: String,

    /// Tag name, which is also the target column
    tag_name: String,

    /// Caller's request id, stored on the audit row
    request_id: Option<String>,

    /// Config file (default: ~/.tagsync/config.toml)
    #[arg(short, long, env = "TAGSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,

    /// Create the log and config tables if they are missing
    #[arg(long)]
    init_schema: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = tagsync_logging::init_logging(LogConfig {
        app_name: "tagsync",
        verbose: cli.verbose,
    }) {
        eprintln!("Warning: failed to initialise logging: {:#}", err);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let path = cli.config.clone().unwrap_or_else(TagSyncConfig::default_path);
    let config = Arc::new(
        TagSyncConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
    );

    let services = Services::connect(&config, cli.init_schema)
        .await
        .context("Failed to connect to stores")?;
    let runner = TagSyncRunner::new(config, services);

    let report = runner
        .run(&TaskInvocation {
            task_id: cli.task_id,
            tag_name: cli.tag_name,
            request_id: cli.request_id,
        })
        .await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let action = match report.action {
            IngestAction::Skipped => "unchanged".to_string(),
            IngestAction::Loaded { reason, rows_loaded, .. } => {
                format!("loaded {} rows ({})", rows_loaded, reason.as_str())
            }
        };
        println!(
            "{} @ {}: {}, merged {} rows from {} into {}",
            report.file_name,
            report.remote_timestamp,
            action,
            report.merged_rows,
            report.merge_source,
            report.target
        );
    }
    Ok(())
}
