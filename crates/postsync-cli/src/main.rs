use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lambda_runtime::{service_fn, LambdaEvent};
use postsync_core::{SyncResponse, Watermark};
use postsync_storage::WatermarkStore;
use postsync_sync::{
    handle_invocation, watermark_store_for, NotionSyncPipeline, SyncConfig, WatermarkConfig,
};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "postsync")]
#[command(about = "Incremental Notion to Postgres post sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and print the invocation response.
    Sync,
    /// Serve the sync handler under the AWS Lambda runtime.
    Lambda,
    /// Inspect or reset the stored sync timestamp.
    Watermark {
        #[command(subcommand)]
        action: WatermarkAction,
    },
}

#[derive(Debug, Subcommand)]
enum WatermarkAction {
    Show,
    /// Overwrite the watermark with an RFC 3339 timestamp.
    Set { value: String },
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("info");

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let config = SyncConfig::from_env().context("loading configuration")?;
            let pipeline = NotionSyncPipeline::from_config(&config).await?;
            let response = handle_invocation(&pipeline).await;
            pipeline.sink().close().await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.status_code != 200 {
                anyhow::bail!("sync failed with status {}", response.status_code);
            }
        }
        Commands::Lambda => {
            let config = SyncConfig::from_env().context("loading configuration")?;
            let pipeline = Arc::new(NotionSyncPipeline::from_config(&config).await?);
            info!("starting lambda runtime");
            lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
                let pipeline = Arc::clone(&pipeline);
                async move {
                    info!(request_id = %event.context.request_id, "sync invoked");
                    Ok::<SyncResponse, lambda_runtime::Error>(handle_invocation(&pipeline).await)
                }
            }))
            .await
            .map_err(|err| anyhow::anyhow!(err))?;
        }
        Commands::Watermark { action } => {
            let config = WatermarkConfig::from_env().context("loading watermark configuration")?;
            let store = watermark_store_for(&config).await;
            match action {
                WatermarkAction::Show => {
                    let watermark = store.get().await?;
                    println!("{}: {}", store.name(), watermark);
                }
                WatermarkAction::Set { value } => {
                    let watermark = Watermark::parse(&value)
                        .with_context(|| format!("parsing watermark {value:?}"))?;
                    store.put(&watermark).await?;
                    println!("{}: {}", store.name(), watermark);
                }
            }
        }
    }

    Ok(())
}
