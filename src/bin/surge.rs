//! surge CLI: run the ingestion core, inspect documents, check host load, optimize images.

use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use surge_rs::batch::BatchProcessor;
use surge_rs::config::Config;
use surge_rs::context::Context;
use surge_rs::egress::LogNotifier;
use surge_rs::engine::{HandlerRegistry, IngestExit, ingest_until};
use surge_rs::media;
use surge_rs::model::{Document, Kind, Payload, QueueItem};
use surge_rs::reclaim::{MemoryProbe as _, SystemProbe};
use surge_rs::store::Store;
use surge_rs::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "surge", about = "Bounded event ingestion with an atomic JSON store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read NDJSON events from stdin and dispatch them until EOF or Ctrl-C
    Serve {
        /// Seconds to wait for in-flight handlers at shutdown
        #[arg(long, default_value_t = 10)]
        grace_secs: u64,
    },
    /// Document store operations
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
    /// Show system memory usage
    Memory,
    /// Show CPU, memory, disk and process counts
    System,
    /// Shrink and re-encode an image next to the original
    Image { path: PathBuf },
}

#[derive(Subcommand)]
enum StoreAction {
    /// Print a document
    Get { name: String },
    /// Replace a document with JSON from the argument or stdin
    Put {
        name: String,
        /// JSON object; read from stdin when omitted
        json: Option<String>,
    },
    /// Replace a document with an empty one
    Reset { name: String },
    /// List archived versions of a document
    Archives { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "surge".to_string(),
        default_filter: config.log_level.0.clone(),
    })?;

    match cli.command {
        Command::Serve { grace_secs } => cmd_serve(config, Duration::from_secs(grace_secs)).await,
        Command::Store { action } => {
            let store = Store::open(&config.store).await?;
            match action {
                StoreAction::Get { name } => cmd_store_get(&store, &name).await,
                StoreAction::Put { name, json } => cmd_store_put(&store, &name, json).await,
                StoreAction::Reset { name } => {
                    if !store.reset(&name).await? {
                        anyhow::bail!("could not reset {name}");
                    }
                    println!("Reset: {name}");
                    Ok(())
                }
                StoreAction::Archives { name } => {
                    let archives = store.list_archives(&name).await?;
                    if archives.is_empty() {
                        println!("No archives for {name}.");
                    }
                    for path in archives {
                        println!("{}", path.display());
                    }
                    Ok(())
                }
            }
        }
        Command::Memory => {
            let usage = SystemProbe::new().sample();
            println!("{}", serde_json::to_string_pretty(&usage)?);
            Ok(())
        }
        Command::System => {
            let report = tokio::task::spawn_blocking(|| SystemProbe::new().report()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Image { path } => {
            let batch = BatchProcessor::new(&config.batch)?;
            let report = media::optimize_image_on(&batch, path, config.media.clone()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn cmd_serve(config: Config, grace: Duration) -> anyhow::Result<()> {
    let ctx = Context::open(config, Arc::new(LogNotifier)).await?;
    let dispatcher = ctx.dispatcher(default_handlers(&ctx));
    let workers = dispatcher.start()?;

    let collector = ctx.stats_collector(dispatcher.clone());
    let stats_token = dispatcher.shutdown_token();
    let stats = tokio::spawn(async move { collector.run(stats_token).await });

    let input = std::io::BufReader::new(std::io::stdin());
    let failure = match ingest_until(&dispatcher, input, tokio::signal::ctrl_c()).await {
        IngestExit::Exhausted(summary) => {
            info!(accepted = summary.accepted, refused = summary.refused, "queues drained");
            None
        }
        IngestExit::Stopped => {
            info!("interrupted");
            None
        }
        IngestExit::Failed(e) => {
            error!("reading input failed: {e}");
            Some(e)
        }
    };

    let report = dispatcher.shutdown();
    if report.total_abandoned() > 0 {
        warn!(abandoned = report.total_abandoned(), "items left unhandled");
    }
    if !workers.join_timeout(grace).await {
        warn!("forced worker shutdown after grace period");
    }
    stats.await.ok();

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Handlers for the bundled `serve` command: replies go through the
/// notifier, callbacks are tallied in a store document, uploaded images are
/// optimized.
fn default_handlers(ctx: &Arc<Context>) -> HandlerRegistry {
    let messages = Arc::clone(ctx);
    let callbacks = Arc::clone(ctx);
    let files = Arc::clone(ctx);

    HandlerRegistry::empty()
        .register(Kind::Message, move |item| handle_message(Arc::clone(&messages), item))
        .register(Kind::Callback, move |item| handle_callback(Arc::clone(&callbacks), item))
        .register(Kind::File, move |item| handle_file(Arc::clone(&files), item))
}

async fn handle_message(ctx: Arc<Context>, item: QueueItem) -> anyhow::Result<()> {
    let chat = payload_str(&item.payload, "chat_id")?;
    let text = payload_str(&item.payload, "text").unwrap_or_default();
    let reply = format!("received: {text}");
    if !ctx.notifier.send(&chat, &reply, None).await {
        anyhow::bail!("reply to {chat} not delivered");
    }
    Ok(())
}

async fn handle_callback(ctx: Arc<Context>, item: QueueItem) -> anyhow::Result<()> {
    let data = payload_str(&item.payload, "data")?;
    let mut tally = ctx.store.load("callbacks").await?;
    let count = tally.get(&data).and_then(|v| v.as_u64()).unwrap_or(0);
    tally.insert(data, serde_json::Value::from(count + 1));
    ctx.store.try_save("callbacks", &tally).await?;
    Ok(())
}

async fn handle_file(ctx: Arc<Context>, item: QueueItem) -> anyhow::Result<()> {
    let name = payload_str(&item.payload, "file_name").unwrap_or_else(|_| "unnamed".to_string());
    info!(id = %item.id, file = %name, "file received");

    let Ok(path) = payload_str(&item.payload, "path").map(PathBuf::from) else {
        return Ok(());
    };
    if media::is_image_path(&path) {
        let report = ctx.optimize_image(path).await?;
        info!(
            id = %item.id,
            optimized = %report.optimized_path.display(),
            ratio = %format!("{:.2}", report.compression_ratio),
            "image optimized"
        );
    }
    Ok(())
}

fn payload_str(payload: &Payload, key: &str) -> anyhow::Result<String> {
    match payload.get(key) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => anyhow::bail!("payload has no {key}"),
    }
}

async fn cmd_store_get(store: &Store, name: &str) -> anyhow::Result<()> {
    let doc = store.load(name).await?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

async fn cmd_store_put(store: &Store, name: &str, json: Option<String>) -> anyhow::Result<()> {
    let json = match json {
        Some(json) => json,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let doc: Document = serde_json::from_str(&json)?;
    store.try_save(name, &doc).await?;
    println!("Saved: {name} ({} keys)", doc.len());
    Ok(())
}
