//! Command line interface. Initializes the store, runs the notification
//! service, and offers a few read-only inspection commands.

use std::{
    fs,
    io::{self, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use pushr::{
    apns::{ApnsClient, LogSender, PushSender},
    bus::{self, BusOptions},
    config::Settings,
    event::{EventId, PublicKey},
    filter::FilterSet,
    follow_change::FollowChangeBatch,
    notifications::{self, Validation, MAX_PAYLOAD_SIZE},
    pipeline::{self, FollowChangeNotifier, ProcessSavedEvent, SaveReceivedEvent},
    server,
    storage::{QueryItem, Store},
    supervisor::Supervisor,
    ws,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "pushr",
    author,
    version,
    about = "Push notifications for Nostr mentions",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the directory tree at `STORE_ROOT`.
    Init,
    /// Follow registered relays and serve the HTTP and WebSocket endpoints.
    Serve,
    /// Print stored events matching a filter (object or array) as NDJSON.
    Events { filters: String },
    /// Print the notifications generated for an event.
    Notifications { event_id: String },
    /// Report the size of a follow-change payload with `count` follows.
    FollowPayloadSize {
        #[arg(long)]
        count: usize,
        /// Enforce the follow-count ceiling instead of only measuring.
        #[arg(long)]
        validate: bool,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::new(cfg.store_root.clone());
    match cli.command {
        Commands::Init => store.init()?,
        Commands::Serve => serve(cfg, store).await?,
        Commands::Events { filters } => {
            let val: serde_json::Value = serde_json::from_str(&filters).context("parsing filters")?;
            let filters = FilterSet::from_value(&val)?;
            let mut out = io::stdout().lock();
            for item in store.get_events(filters) {
                match item {
                    QueryItem::Event(ev) => writeln!(out, "{}", ev.raw())?,
                    QueryItem::Error(e) => warn!("could not read event: {e:#}"),
                    QueryItem::EndOfStoredEvents => {}
                }
            }
        }
        Commands::Notifications { event_id } => {
            let id = EventId::from_hex(&event_id)?;
            let mut out = io::stdout().lock();
            for n in store.get_notifications(&id)? {
                writeln!(out, "{}", serde_json::to_string(&n)?)?;
            }
        }
        Commands::FollowPayloadSize { count, validate } => {
            let size = follow_payload_size(count, validate)?;
            println!("{size}");
            if size > MAX_PAYLOAD_SIZE {
                warn!(size, max = MAX_PAYLOAD_SIZE, "payload exceeds the APNs limit");
            }
        }
    }
    Ok(())
}

async fn serve(cfg: Settings, store: Store) -> anyhow::Result<()> {
    store.init()?;
    let http_addr: SocketAddr = cfg.bind_http.as_str().parse()?;
    let ws_addr: SocketAddr = cfg.bind_ws.as_str().parse()?;

    let sender: Arc<dyn PushSender> = match &cfg.apns {
        Some(apns) => {
            info!(topic = %apns.topic, environment = %apns.environment, "sending pushes through APNs");
            Arc::new(ApnsClient::from_pem_file(
                &apns.certificate_path,
                &apns.topic,
                apns.environment,
            )?)
        }
        None => {
            warn!("APNs is not configured, pushes will only be logged");
            Arc::new(LogSender)
        }
    };

    let root = CancellationToken::new();
    let _stop_all = root.clone().drop_guard();
    let ctrl_c = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            ctrl_c.cancel();
        }
    });

    let (received, received_sub) = bus::topic("received-events", 1024);
    let (saved, saved_sub) = bus::topic("event-saved", 1024);
    let (follow_changes, follow_changes_sub) = bus::topic::<FollowChangeBatch>("follow-changes", 256);

    let replay = saved.clone();
    tokio::spawn(received_sub.run(
        Arc::new(SaveReceivedEvent::new(store.clone(), saved)),
        BusOptions::default(),
        root.child_token(),
    ));
    tokio::spawn(saved_sub.run(
        Arc::new(ProcessSavedEvent::new(store.clone(), sender.clone())),
        BusOptions::default(),
        root.child_token(),
    ));
    tokio::spawn(follow_changes_sub.run(
        Arc::new(FollowChangeNotifier::new(store.clone(), sender)),
        BusOptions::default(),
        root.child_token(),
    ));
    pipeline::replay_pending(&store, &replay).await?;

    let supervisor = Supervisor::new(
        store.clone(),
        received,
        cfg.relay_options(),
        cfg.relay_poll,
        cfg.ignored_relay_suffixes.clone(),
    );
    let http_stop = root.clone();
    let ws_stop = root.clone();
    tokio::try_join!(
        server::serve_http(http_addr, store.clone(), follow_changes, async move {
            http_stop.cancelled().await
        }),
        ws::serve_ws(ws_addr, store, async move { ws_stop.cancelled().await }),
        supervisor.run(root.child_token()),
    )?;
    Ok(())
}

/// Size in bytes of a follow-change payload carrying `count` random follows.
fn follow_payload_size(count: usize, validate: bool) -> anyhow::Result<usize> {
    let batch = FollowChangeBatch {
        followee: PublicKey::from_bytes(rand::random()),
        friendly_follower: String::new(),
        follows: (0..count)
            .map(|_| PublicKey::from_bytes(rand::random()))
            .collect(),
        unfollows: vec![],
    };
    let validation = if validate {
        Validation::Enforce
    } else {
        Validation::Bypass
    };
    Ok(notifications::follow_change_payload_with(&batch, validation)?.len())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("pushr-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", display_path(&store_root)));
    content.push_str("BIND_HTTP=127.0.0.1:8008\n");
    content.push_str("BIND_WS=127.0.0.1:8009\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("APNS_TOPIC=\n");
    content.push_str("APNS_CERTIFICATE_PATH=\n");
    content.push_str("APNS_ENVIRONMENT=development\n");
    content.push_str("RELAY_POLL_SECS=60\n");
    content.push_str("RECONNECT_BACKOFF_SECS=10\n");
    content.push_str("SUBSCRIPTION_REFRESH_SECS=60\n");
    content.push_str("LOOKBACK_DAYS=365\n");
    content.push_str("IGNORED_RELAY_SUFFIXES=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}
