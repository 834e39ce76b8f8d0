mod config;

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use dashboard_core::{
    DashboardStore, HostPrompts, HttpChannel, MediaFile, MessageChannel, ObjectUrlRegistry,
    PostDraft, StoreEvent, StoreState, WsBridge,
};
use shared::domain::{ChannelId, InlineButton, PostId};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dashboard", about = "Schedule and manage channel posts")]
struct Args {
    #[arg(long, default_value = "dashboard.toml")]
    config: PathBuf,
    #[arg(long, value_enum, default_value_t = TransportKind::Http)]
    transport: TransportKind,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    bridge_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    /// Answer yes to every confirmation.
    #[arg(long)]
    yes: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportKind {
    Http,
    Bridge,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print channels, scheduled posts and pending media.
    Fetch,
    AddChannel {
        username: String,
    },
    Schedule {
        #[arg(long)]
        channel: i64,
        /// RFC 3339 timestamp, e.g. 2030-01-01T10:00:00Z
        #[arg(long)]
        at: DateTime<Utc>,
        #[arg(long, default_value = "")]
        text: String,
        /// Upload this file first and attach it.
        #[arg(long)]
        media: Option<PathBuf>,
        /// `Label=https://...`; repeatable.
        #[arg(long = "button", value_parser = parse_button)]
        buttons: Vec<InlineButton>,
    },
    Delete {
        post_id: i64,
    },
    Upload {
        path: PathBuf,
    },
    /// Print every state change until interrupted.
    Watch,
}

fn parse_button(raw: &str) -> Result<InlineButton, String> {
    let (text, url) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected Label=URL, got {raw:?}"))?;
    Ok(InlineButton {
        text: text.trim().to_string(),
        url: url.trim().to_string(),
    })
}

struct StdinPrompts {
    assume_yes: bool,
}

#[async_trait]
impl HostPrompts for StdinPrompts {
    async fn confirm(&self, message: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        let message = message.to_string();
        tokio::task::spawn_blocking(move || {
            print!("{message} [y/N] ");
            let _ = io::stdout().flush();
            let mut answer = String::new();
            match io::stdin().read_line(&mut answer) {
                Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
                Err(_) => false,
            }
        })
        .await
        .unwrap_or(false)
    }

    fn alert(&self, message: &str) {
        eprintln!("{message}");
    }
}

async fn read_media(path: &Path) -> Result<MediaFile> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("upload")
        .to_string();
    let mime_type = mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string());
    Ok(MediaFile {
        filename,
        mime_type,
        bytes,
    })
}

fn print_state(state: &StoreState) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}

async fn watch(store: &Arc<DashboardStore>) -> Result<()> {
    let mut events = store.subscribe();
    store.fetch_data().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Ok(StoreEvent::StateChanged(state)) => print_state(&state)?,
                Ok(StoreEvent::LoadingTimedOut { operation }) => {
                    warn!(%operation, "no response; the outcome is unknown");
                }
                Ok(StoreEvent::ActionFailed { message, .. }) => eprintln!("error: {message}"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "watch fell behind"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings(&args.config)?;
    if let Some(url) = args.api_url {
        settings.api_url = url;
    }
    if args.bridge_url.is_some() {
        settings.bridge_url = args.bridge_url;
    }
    if args.token.is_some() {
        settings.auth_token = args.token;
    }

    let channel = match args.transport {
        TransportKind::Http => {
            let http = HttpChannel::new(&settings.api_url, settings.auth_token.clone())
                .with_context(|| format!("invalid api url {}", settings.api_url))?;
            info!(base_url = %http.base_url(), "using the http api");
            MessageChannel::Http(Arc::new(http))
        }
        TransportKind::Bridge => {
            let url = settings
                .bridge_url
                .as_deref()
                .context("--transport bridge needs --bridge-url or DASHBOARD_BRIDGE_URL")?;
            MessageChannel::Bridge(Arc::new(WsBridge::connect(url).await?))
        }
    };

    let store = DashboardStore::new_with_dependencies(
        channel,
        Arc::new(StdinPrompts {
            assume_yes: args.yes,
        }),
        Arc::new(ObjectUrlRegistry::new()),
        settings.store_config(),
    );
    store.attach().await;

    let mutated = match args.command {
        Command::Fetch => {
            store.fetch_data().await;
            false
        }
        Command::AddChannel { username } => {
            store.add_channel(&username).await?;
            true
        }
        Command::Schedule {
            channel,
            at,
            text,
            media,
            buttons,
        } => {
            if let Some(path) = media {
                store.upload_media(read_media(&path).await?).await?;
            }
            store
                .schedule_post(PostDraft {
                    channel_id: ChannelId(channel),
                    text,
                    schedule_time: at,
                    inline_buttons: buttons,
                })
                .await?;
            true
        }
        Command::Delete { post_id } => {
            store
                .delete_post(PostId(post_id))
                .await
                .context("delete task failed")?;
            true
        }
        Command::Upload { path } => {
            store.upload_media(read_media(&path).await?).await?;
            false
        }
        Command::Watch => {
            watch(&store).await?;
            store.shutdown().await;
            return Ok(());
        }
    };

    let mut state = store.wait_until_idle().await;
    if mutated {
        store.fetch_data().await;
        state = store.wait_until_idle().await;
    }
    print_state(&state)?;
    store.shutdown().await;
    Ok(())
}
