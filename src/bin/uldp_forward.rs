use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::io::AsyncReadExt;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use uldpforward::client::UldpClient;
use uldpforward::forward::checkpoint::JsonFileCheckpointStore;
use uldpforward::forward::config::ForwarderConfig;
use uldpforward::forward::event_hub::{to_log_messages, EventHubMessage, EventHubSource};
use uldpforward::forward::forward_batch;
use uldpforward::forward::windows_events::{scan_table, InMemoryEventTable, WindowsEventRow};
use uldpforward::transport::TcpConnector;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Source {
    /// event hub batch of container cluster monitoring records
    Aks,
    /// event hub batch of directory audit records
    Ad,
    /// exported rows of a Windows event table
    WindowsRows,
}

/// Forwards cloud log records to a collector. The connection is configured through environment
///  variables (ULDP_HOST, ULDP_PORT, TLS_CA, ...).
#[derive(Parser)]
struct Args {
    #[clap(long, value_enum)]
    source: Source,

    /// JSON input file, stdin if omitted
    #[clap(long)]
    input: Option<PathBuf>,

    #[clap(long)]
    host: Option<String>,

    #[clap(long)]
    port: Option<u16>,

    /// checkpoint file for Windows event rows
    #[clap(long, default_value = "checkpoint.json")]
    checkpoint: PathBuf,

    /// stop reading further pages of Windows event rows after this many seconds
    #[clap(long, default_value_t = 300)]
    max_runtime_secs: u64,

    #[clap(long, default_value_t = 1000)]
    page_size: usize,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ForwarderConfig::from_env()?;
    if let Some(host) = args.host.clone() {
        config.uldp.host = host;
    }
    if let Some(port) = args.port {
        config.uldp.port = port;
    }
    config.uldp.validate()?;

    let default_level = if config.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .ok();

    let input = read_input(args.input.as_ref()).await?;

    match args.source {
        Source::Aks => forward_event_hub(&config, EventHubSource::ContainerMonitoring, &input).await,
        Source::Ad => forward_event_hub(&config, EventHubSource::DirectoryAudit, &input).await,
        Source::WindowsRows => forward_windows_rows(&config, &args, &input).await,
    }
}

async fn read_input(path: Option<&PathBuf>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path).await
            .with_context(|| format!("cannot read {:?}", path)),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            Ok(buf)
        }
    }
}

async fn forward_event_hub(config: &ForwarderConfig, source: EventHubSource, input: &[u8]) -> anyhow::Result<()> {
    let batch: Vec<EventHubMessage> = serde_json::from_slice(input)
        .context("input is not an array of event hub messages")?;
    let messages = to_log_messages(source, &batch, config.origin, config.flatten);
    forward_batch(config, Arc::new(TcpConnector), messages).await?;
    Ok(())
}

async fn forward_windows_rows(config: &ForwarderConfig, args: &Args, input: &[u8]) -> anyhow::Result<()> {
    let rows: Vec<WindowsEventRow> = serde_json::from_slice(input)
        .context("input is not an array of Windows event rows")?;
    let table = InMemoryEventTable::new(rows, args.page_size);
    let mut checkpoints = JsonFileCheckpointStore::new(&args.checkpoint);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.max_runtime_secs);

    let client = UldpClient::connect(config.uldp.clone()).await?;
    info!("connected to {}", config.uldp.endpoint());

    let result_count = scan_table(&table, &mut checkpoints, &client, config.origin, deadline).await?;
    let report = client.close().await?;
    info!("function terminated, resultCount={} ({})", result_count, report);
    Ok(())
}
