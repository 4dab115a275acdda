use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nowplaying_bridge_artwork::{ArtworkResolver, ThumbnailFetcher};
use nowplaying_bridge_core::{AppConfig, NormalizedSnapshot};
use nowplaying_bridge_sources::detect_source;
use nowplaying_bridge_tracker::{normalize, PlaybackTracker};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "nowplaying-bridge",
    about = "Native media session -> normalized snapshots on stdout"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run,
    Doctor,
    Status,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cmd = cli.command.unwrap_or(Commands::Run);
    let cfg_path = cli.config.unwrap_or_else(default_config_path);

    match cmd {
        Commands::Config {
            action: ConfigAction::Init,
        } => {
            init_config(&cfg_path)?;
            println!("Initialized config at {}", cfg_path.display());
            Ok(())
        }
        Commands::Doctor => {
            let cfg = load_or_default(&cfg_path)?;
            init_logging(&cfg.log_level);
            doctor(&cfg).await
        }
        Commands::Status => {
            let cfg = load_or_default(&cfg_path)?;
            init_logging(&cfg.log_level);
            status(&cfg).await
        }
        Commands::Run => {
            let cfg = load_or_default(&cfg_path)?;
            init_logging(&cfg.log_level);
            run(cfg, cfg_path).await
        }
    }
}

enum RunEnd {
    Reload,
    Rebuild,
    Shutdown,
}

async fn run(mut cfg: AppConfig, cfg_path: PathBuf) -> Result<()> {
    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(4);
    spawn_reload_watchers(
        cfg_path.clone(),
        cfg.intervals.file_watch_poll_ms,
        reload_tx,
    )
    .await?;

    loop {
        let source = detect_source(
            &cfg.source_priority,
            Duration::from_millis(cfg.intervals.source_poll_ms),
        )
        .context("no usable media session source")?;
        info!(source = source.name(), "nowplaying-bridge started");

        let resolver: Arc<dyn ArtworkResolver> = Arc::new(
            ThumbnailFetcher::new(Duration::from_millis(cfg.intervals.artwork_timeout_ms))
                .context("failed to build the artwork fetcher")?,
        );
        let mut tracker = PlaybackTracker::setup(source, resolver)
            .await
            .context("failed to attach to the media session")?;
        let mut snapshots = tracker.subscribe();

        let end = loop {
            tokio::select! {
                snapshot = snapshots.recv() => match snapshot {
                    Ok(snapshot) => print_snapshot(&snapshot),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "snapshot consumer lagged; skipping ahead");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("tracker stopped unexpectedly; rebuilding");
                        break RunEnd::Rebuild;
                    }
                },
                msg = reload_rx.recv() => {
                    if msg.is_some() {
                        break RunEnd::Reload;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received ctrl-c; shutting down");
                    break RunEnd::Shutdown;
                }
            }
        };

        tracker.cleanup().await;

        match end {
            RunEnd::Reload => match load_or_default(&cfg_path) {
                Ok(new_cfg) => {
                    cfg = new_cfg;
                    info!("configuration reloaded");
                }
                Err(err) => {
                    error!(error = %err, "failed to reload config");
                }
            },
            RunEnd::Rebuild => {}
            RunEnd::Shutdown => return Ok(()),
        }
    }
}

// One snapshot per line on stdout; consumers treat this as NDJSON.
fn print_snapshot(snapshot: &NormalizedSnapshot) {
    match serde_json::to_string(snapshot) {
        Ok(line) => println!("{line}"),
        Err(err) => warn!(error = %err, "failed to serialize snapshot"),
    }
}

async fn doctor(cfg: &AppConfig) -> Result<()> {
    println!("== nowplaying-bridge doctor ==");

    let detected = detect_source(
        &cfg.source_priority,
        Duration::from_millis(cfg.intervals.source_poll_ms),
    );
    let mut source = match detected {
        Ok(source) => source,
        Err(err) => {
            println!("Media session source: {err}");
            print_platform_hints();
            return Ok(());
        }
    };
    println!("Media session source: {}", source.name());

    let (events_tx, _events_rx) = mpsc::channel(4);
    if let Err(err) = source.subscribe(events_tx).await {
        println!("Subscribe failed: {err}");
        print_platform_hints();
        return Ok(());
    }

    match source.now_playing().await {
        Ok(Some(event)) => {
            println!(
                "Now playing: {}",
                event.track_name.as_deref().unwrap_or("<unknown>")
            );
            match event.thumbnail.as_deref() {
                Some(reference) if reference.starts_with("data:") => {
                    println!("Artwork reference: inline data URI ({} bytes)", reference.len());
                }
                Some(reference) => println!("Artwork reference: {reference}"),
                None => println!("Artwork reference: <none>"),
            }
        }
        Ok(None) => println!("No active media session"),
        Err(err) => println!("State query failed: {err}"),
    }
    let _ = source.unsubscribe().await;

    print_platform_hints();
    Ok(())
}

fn print_platform_hints() {
    #[cfg(target_os = "macos")]
    {
        println!(
            "macOS automation: verify System Settings > Privacy & Security > Automation allows Terminal (or your shell) to control Music"
        );
    }
    #[cfg(target_os = "linux")]
    {
        println!("MPRIS: an active player must be registered on the DBus session bus");
    }
}

async fn status(cfg: &AppConfig) -> Result<()> {
    let mut source = detect_source(
        &cfg.source_priority,
        Duration::from_millis(cfg.intervals.source_poll_ms),
    )
    .context("no usable media session source")?;

    let (events_tx, _events_rx) = mpsc::channel(4);
    source
        .subscribe(events_tx)
        .await
        .context("failed to subscribe to the media session")?;
    let event = source.now_playing().await;
    let _ = source.unsubscribe().await;

    println!("source: {}", source.name());
    match event {
        Ok(Some(event)) => match normalize(&event, None) {
            Some(snapshot) => {
                println!(
                    "state: {}",
                    if snapshot.is_playing { "playing" } else { "paused" }
                );
                println!(
                    "track: {} - {}",
                    snapshot.track.artists.join(", "),
                    snapshot.track.name
                );
                if !snapshot.track.album.is_empty() {
                    println!("album: {}", snapshot.track.album);
                }
                let position = snapshot.track.duration;
                println!(
                    "position: {}s / {}s",
                    position.current_ms / 1_000,
                    position.total_ms / 1_000
                );
            }
            None => println!("track: <none>"),
        },
        Ok(None) => println!("track: <none>"),
        Err(err) => println!("error: {err}"),
    }

    Ok(())
}

fn default_config_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("nowplaying-bridge").join("config.toml")
}

fn init_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let cfg = AppConfig::default();
    let toml = toml::to_string_pretty(&cfg)?;
    std::fs::write(path, toml)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}

fn load_or_default(path: &Path) -> Result<AppConfig> {
    let mut cfg = if !path.exists() {
        AppConfig::default()
    } else {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))?
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}

async fn spawn_reload_watchers(path: PathBuf, poll_ms: u64, tx: mpsc::Sender<()>) -> Result<()> {
    let tx_poll = tx.clone();
    tokio::spawn(async move {
        let mut known_mtime = file_mtime(&path);
        let sleep = Duration::from_millis(poll_ms.max(2_000));
        loop {
            tokio::time::sleep(sleep).await;
            let current = file_mtime(&path);
            if current.is_some() && current != known_mtime {
                known_mtime = current;
                let _ = tx_poll.send(()).await;
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let tx_hup = tx.clone();
        tokio::spawn(async move {
            if let Ok(mut sig) = signal(SignalKind::hangup()) {
                while sig.recv().await.is_some() {
                    let _ = tx_hup.send(()).await;
                }
            }
        });
    }

    Ok(())
}

fn file_mtime(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

fn apply_env_overrides(cfg: &mut AppConfig) {
    if let Ok(v) = std::env::var("NOWPLAYING_BRIDGE_LOG_LEVEL") {
        if !v.trim().is_empty() {
            cfg.log_level = v;
        }
    }
    if let Ok(v) = std::env::var("NOWPLAYING_BRIDGE_SOURCES") {
        let sources: Vec<String> = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !sources.is_empty() {
            cfg.source_priority = sources;
        }
    }
}
