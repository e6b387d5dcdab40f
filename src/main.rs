//! agentnet CLI entrypoint

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing_subscriber::EnvFilter;

use agentnet::feed::LogEntry;
use agentnet::graph::read;
use agentnet::{
    Backfill, ConnectionState, Connector, DedupCache, HttpHistory, LiveFeed, OutboundMessage,
    Settings, Target,
};

#[derive(Parser)]
#[command(name = "agentnet", version, about = "Live agent-network feed")]
struct Cli {
    /// Log output format
    #[arg(long, global = true, env = "AGENTNET_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Settings file (defaults to ~/.agentnet/settings.json)
    #[arg(long, global = true, env = "AGENTNET_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Stream the live feed, printing log lines and pulses
    Watch {
        /// Skip the history backfill
        #[arg(long)]
        no_backfill: bool,

        /// Reconnect with backoff after the connection drops
        #[arg(long)]
        reconnect: bool,
    },

    /// Send one chat line and exit
    Send {
        text: String,

        /// Agent id, or "global" to broadcast
        #[arg(long, default_value = "global")]
        target: String,
    },

    /// Fetch recent history and print the resulting graph
    History {
        /// Events to request (the server caps this at 100)
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Inspect or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print one setting by dotted path
    Get { path: String },
    /// Set one setting by dotted path
    Set { path: String, value: String },
    /// Restore one setting to its default
    Reset { path: String },
    /// Print every setting
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let settings_path = cli.settings.clone().unwrap_or_else(Settings::default_path);

    match cli.command {
        Command::Config { action } => config(&settings_path, action),
        Command::Watch {
            no_backfill,
            reconnect,
        } => watch(load_settings(&settings_path), no_backfill, reconnect).await,
        Command::Send { text, target } => {
            send(&load_settings(&settings_path), text, Target::from(target)).await
        }
        Command::History { limit } => history(load_settings(&settings_path), limit).await,
    }
}

/// Settings file plus environment overrides.
fn load_settings(path: &std::path::Path) -> Settings {
    let mut settings = Settings::load_from(path);
    settings.apply_env(|key| std::env::var(key).ok());
    settings
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agentnet=info"));
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn build_backfill(settings: &Settings) -> Result<Backfill> {
    let source = HttpHistory::new(
        settings.backfill.api_url.clone(),
        settings.token(),
        Duration::from_millis(settings.backfill.timeout_ms),
    )
    .context("building history client")?;

    Ok(Backfill::new(Arc::new(source))
        .with_cache(settings.history_cache_path())
        .with_limit(settings.backfill.limit))
}

fn new_feed(settings: &Settings) -> LiveFeed {
    let cache = DedupCache::shared(settings.dedup.capacity, settings.dedup.evict_fraction);
    LiveFeed::new(settings, cache)
}

async fn watch(mut settings: Settings, no_backfill: bool, reconnect: bool) -> Result<()> {
    if reconnect {
        settings.transport.reconnect.enabled = true;
    }
    let reconnecting = settings.transport.reconnect.enabled;

    let mut feed = new_feed(&settings);
    if settings.backfill.enabled && !no_backfill {
        let report = feed.backfill(&build_backfill(&settings)?).await;
        println!("backfill: {} events ({})", report.applied, report.origin);
    }

    let handle = feed.handle();
    let task = tokio::spawn(feed.run());

    let mut log = WatchStream::new(handle.subscribe_log());
    let mut pulses = BroadcastStream::new(handle.pulses());
    let mut connection = handle.watch_connection();
    let mut printed: Option<u64> = None;

    if let Err(e) = handle.connect().await
        && !reconnecting
    {
        handle.stop();
        task.await?;
        return Err(e).context("connecting to the audit stream");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            Some(entries) = log.next() => print_new(&entries, &mut printed),
            Some(pulse) = pulses.next() => match pulse {
                Ok(pulse) => println!(
                    "~ pulse {} -> {}{}",
                    pulse.source_id,
                    pulse.target_id,
                    pulse.message.map(|m| format!(": {}", m)).unwrap_or_default()
                ),
                Err(e) => tracing::debug!("Pulse stream lagged: {}", e),
            },
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                if state == ConnectionState::Disconnected && !reconnecting {
                    break;
                }
            }
            else => break,
        }
    }

    handle.stop();
    task.await?;
    print_new(&handle.log(), &mut printed);

    let snapshot = handle.snapshot();
    println!(
        "graph: {} agents, {} links",
        snapshot.node_count(),
        snapshot.link_count()
    );
    Ok(())
}

fn print_new(entries: &[LogEntry], printed: &mut Option<u64>) {
    let last = *printed;
    for entry in entries.iter().filter(|e| last.is_none_or(|seq| e.seq > seq)) {
        println!(
            "{} {:<6} {}",
            entry.received_at.format("%H:%M:%S"),
            format!("{:?}", entry.kind).to_lowercase(),
            entry.text
        );
        *printed = Some(entry.seq);
    }
}

async fn send(settings: &Settings, text: String, target: Target) -> Result<()> {
    let (connector, _events) = Connector::new();
    connector
        .connect(&settings.endpoint())
        .await
        .context("connecting to the audit stream")?;

    let queued = connector.send(&OutboundMessage::new(text, target));
    connector.disconnect().await;

    if !queued {
        bail!("connection closed before the message could be sent");
    }
    println!("sent");
    Ok(())
}

async fn history(mut settings: Settings, limit: Option<u32>) -> Result<()> {
    if let Some(limit) = limit {
        settings.backfill.limit = limit;
    }

    let mut feed = new_feed(&settings);
    let report = feed.backfill(&build_backfill(&settings)?).await;
    println!("{} events ({})", report.applied, report.origin);

    let snapshot = feed.handle().snapshot();
    for node in snapshot.nodes.iter() {
        let node = read(node);
        match &node.mood {
            Some(mood) => println!("agent {} {} [{}]", node.id, node.name, mood),
            None => println!("agent {} {}", node.id, node.name),
        }
    }
    for link in snapshot.links.iter() {
        let link = read(link);
        println!(
            "link  {} -> {} x{} {}",
            link.source_id,
            link.target_id,
            link.interactions,
            link.message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn config(path: &std::path::Path, action: ConfigAction) -> Result<()> {
    let mut settings = Settings::load_from(path);

    match action {
        ConfigAction::Get { path: key } => match settings.get(&key) {
            Some(value) if key.ends_with("token") && value != "null" => println!("********"),
            Some(value) => println!("{}", value),
            None => bail!("Unknown setting: {}", key),
        },
        ConfigAction::Set { path: key, value } => {
            settings.set(&key, &value).map_err(anyhow::Error::msg)?;
            settings.save_to(path).map_err(anyhow::Error::msg)?;
        }
        ConfigAction::Reset { path: key } => {
            settings.reset(&key).map_err(anyhow::Error::msg)?;
            settings.save_to(path).map_err(anyhow::Error::msg)?;
        }
        ConfigAction::List => {
            for (key, value) in settings.list() {
                println!("{} = {}", key, value);
            }
        }
    }
    Ok(())
}
