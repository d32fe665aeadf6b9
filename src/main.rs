use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camview::config::{CameraConfig, PreferenceStore, SignalingKind};
use camview::events::{EventKind, SessionEvent};
use camview::peer::PeerConfig;
use camview::session::{ConsumerHandle, SessionContext, SessionRegistry};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Headless camera viewer
#[derive(Parser, Debug)]
#[command(name = "camview")]
#[command(version, about = "Attach to a camera endpoint and log its session events", long_about = None)]
struct CliArgs {
    /// Endpoint configuration (JSON); other options override its fields
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Camera entity id
    #[arg(short = 'e', long)]
    entity: Option<String>,

    /// Signaling server URL
    #[arg(short = 'u', long)]
    url: Option<String>,

    /// Signaling protocol (go2rtc, websocket, whep, rtsptoweb)
    #[arg(short = 's', long)]
    signaling: Option<SignalingKind>,

    /// Still image URL for the snapshot fallback
    #[arg(long, value_name = "URL")]
    snapshot_url: Option<String>,

    /// Keep the session streaming while nobody is watching
    #[arg(short = 'b', long)]
    background: bool,

    /// Publish session trace lines
    #[arg(long)]
    debug: bool,

    /// Data directory for persisted preferences
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting camview v{}", env!("CARGO_PKG_VERSION"));

    let config = load_camera_config(&args).await?;
    config.validate()?;

    let data_dir = args.data_dir.clone().unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let preferences = PreferenceStore::open(&data_dir.join("camview.db")).await?;
    let registry = SessionRegistry::new(SessionContext::new(preferences, PeerConfig::default()));
    let session = registry.session(&config).await?;
    tracing::info!("Session {} ready", session.key());

    let mut kinds = EventKind::CONSUMER_DEFAULT.to_vec();
    kinds.push(EventKind::Release);
    let consumer = Arc::new(
        ConsumerHandle::new()
            .debug(args.debug || config.debug)
            .events(&kinds),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.attach(&consumer, tx);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    session.detach(&consumer);
    registry.shutdown().await;
    tracing::info!("camview stopped");
    Ok(())
}

async fn load_camera_config(args: &CliArgs) -> anyhow::Result<CameraConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path).await?;
            serde_json::from_str::<CameraConfig>(&raw)?
        }
        None => CameraConfig::default(),
    };

    if let Some(entity) = &args.entity {
        config.entity = entity.clone();
    }
    if let Some(url) = &args.url {
        config.url = Some(url.clone());
    }
    if let Some(signaling) = args.signaling {
        config.signaling = signaling;
    }
    if let Some(snapshot_url) = &args.snapshot_url {
        config.snapshot_url = Some(snapshot_url.clone());
    }
    if args.background {
        config.background = true;
    }
    Ok(config)
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Trace { message } => tracing::debug!("{}", message),
        SessionEvent::Heartbeat { .. } => tracing::trace!("{:?}", event),
        SessionEvent::Stream { call_id, stream } => tracing::info!(
            "Stream for call {}: {} tracks",
            call_id,
            stream.as_ref().map(|s| s.tracks().len()).unwrap_or(0)
        ),
        _ => match serde_json::to_string(event) {
            Ok(json) => tracing::info!("{}", json),
            Err(_) => tracing::info!("{:?}", event),
        },
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camview=error,webrtc=error",
        LogLevel::Warn => "camview=warn,webrtc=warn",
        LogLevel::Info => "camview=info,webrtc=warn",
        LogLevel::Verbose => "camview=debug,webrtc=warn",
        LogLevel::Debug => "camview=debug,webrtc=info",
        LogLevel::Trace => "camview=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("CAMVIEW_DATA_DIR") {
        return PathBuf::from(path);
    }

    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local/share/camview"),
        Err(_) => PathBuf::from("/var/lib/camview"),
    }
}
