//! `concern` — thin front-end over the sync engine. All reconciliation
//! lives in `concern-client`; this binary only wires config, logging, and
//! plain-text rendering.

use anyhow::Result;
use clap::{Parser, Subcommand};
use concern_client::{
    normalize_concern, time, Comment, Concern, EngineUpdate, HttpSnapshotSource, SnapshotSource,
    SyncConfig, SyncEngine, TcpTransport,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(
    name = "concern",
    version,
    about = "Concern thread client: periodic snapshots plus a live channel"
)]
struct Cli {
    /// Path to a TOML config file (./concern.toml is picked up when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Snapshot API base URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Live-channel relay address (host:port)
    #[arg(long, global = true)]
    channel_addr: Option<String>,

    /// Author label for outgoing comments ("company" marks the organization)
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch one snapshot and list all concerns, newest first
    List,
    /// Follow one concern's thread live
    Tail { concern_id: String },
    /// Send one comment to a concern
    Send { concern_id: String, text: String },
}

fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.target(env_logger::Target::Stderr).init();
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)?,
        None => {
            let default_path = PathBuf::from("concern.toml");
            if default_path.exists() {
                SyncConfig::load(&default_path)?
            } else {
                SyncConfig::default()
            }
        }
    };
    if let Some(api_url) = &cli.api_url {
        config.api_url = api_url.clone();
    }
    if let Some(channel_addr) = &cli.channel_addr {
        config.channel_addr = channel_addr.clone();
    }
    if let Some(user) = &cli.user {
        config.user_id = user.clone();
    }
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    match cli.command {
        Command::List => list(&config).await,
        Command::Tail { ref concern_id } => tail(&config, concern_id).await,
        Command::Send {
            ref concern_id,
            ref text,
        } => send(&config, concern_id, text).await,
    }
}

async fn list(config: &SyncConfig) -> Result<()> {
    let source = HttpSnapshotSource::new(&config.api_url);
    let records = source.fetch_all().await?;
    let mut concerns: Vec<Concern> = records.into_iter().map(normalize_concern).collect();
    concerns.reverse();

    if concerns.is_empty() {
        println!("no concerns available");
        return Ok(());
    }
    for concern in &concerns {
        println!(
            "{}  [{}]  {}",
            concern.id,
            concern.status_kind().as_str(),
            concern.display_name()
        );
        println!(
            "    submitted: {}  messages: {}  last update: {}",
            concern.date.as_deref().unwrap_or("unknown"),
            concern.comment_count(),
            time::format_timestamp(concern.last_update()),
        );
    }
    Ok(())
}

fn start_engine(config: &SyncConfig) -> SyncEngine {
    let source = Arc::new(HttpSnapshotSource::new(&config.api_url));
    let transport = Arc::new(TcpTransport::new(
        config.channel_addr.clone(),
        config.max_frame_bytes,
    ));
    SyncEngine::start(config.clone(), source, transport)
}

async fn tail(config: &SyncConfig, concern_id: &str) -> Result<()> {
    let engine = start_engine(config);
    let mut updates = engine.subscribe_updates();
    engine.select_concern(concern_id).await?;
    wait_for_snapshot(&mut updates).await;

    let view = engine.view(concern_id).await?;
    let mut printed: HashSet<String> = HashSet::new();
    if view.id.is_empty() {
        println!("concern {concern_id} is not in the store yet; waiting for updates");
    } else {
        println!(
            "{}  [{}]  {} messages",
            view.display_name(),
            view.status_kind().as_str(),
            view.comment_count()
        );
        for comment in &view.comments {
            printed.insert(comment.id.clone());
            print_comment(comment);
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(EngineUpdate::CommentAppended { concern_id: updated, comment })
                    if updated == concern_id =>
                {
                    if printed.insert(comment.id.clone()) {
                        print_comment(&comment);
                    }
                }
                Ok(EngineUpdate::SnapshotApplied { .. }) => {
                    // A replace may carry comments the channel missed.
                    for comment in engine.view(concern_id).await?.comments {
                        if printed.insert(comment.id.clone()) {
                            print_comment(&comment);
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    engine.shutdown().await;
    Ok(())
}

async fn send(config: &SyncConfig, concern_id: &str, text: &str) -> Result<()> {
    let engine = start_engine(config);
    let mut updates = engine.subscribe_updates();
    wait_for_snapshot(&mut updates).await;

    engine.select_concern(concern_id).await?;
    let Some(comment) = engine.compose(concern_id, text).await? else {
        anyhow::bail!("concern {concern_id} is unknown; run `concern list` for available ids");
    };

    // Give the outbound emit a moment to flush before tearing down.
    tokio::time::sleep(Duration::from_millis(500)).await;
    if !engine.channel_health().connected {
        log::warn!("live channel is down; the comment reaches the store via its own sync");
    }
    engine.shutdown().await;
    println!("sent {} to {}", comment.id, concern_id);
    Ok(())
}

fn print_comment(comment: &Comment) {
    println!(
        "[{}] {}: {}",
        time::format_timestamp(Some(&comment.timestamp)),
        comment.author,
        comment.text
    );
}

async fn wait_for_snapshot(updates: &mut broadcast::Receiver<EngineUpdate>) {
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match updates.recv().await {
                Ok(EngineUpdate::SnapshotApplied { .. })
                | Err(broadcast::error::RecvError::Closed) => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    })
    .await;
}
