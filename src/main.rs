use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Duration;
use std::{fmt, fs};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc::{self, UnboundedSender},
};

use manager::{
    download_manager::{
        DownloadCommand, DownloadConfig, DownloadEvent, DownloadManager, DownloadStatus, Priority,
        DEFAULT_MAX_CONCURRENT_DOWNLOADS,
    },
    swarm_manager::{SwarmConfig, SwarmHandle, SwarmManager, DEFAULT_MAX_PEERS},
};
use metadata::manifest::{ResourceId, ResourceMetadata, DEFAULT_PIECE_SIZE_B};
use protocol::peer_messages::MAX_PIECE_SIZE_B;
use registry::HttpRegistry;
use rtc::{tcp_engine::TcpRtcEngine, IceConfig, DEFAULT_ICE_SERVERS};
use tracker::{TcpTrackerConnector, DEFAULT_CONNECT_TIMEOUT};

mod manager;
mod metadata;
mod persistence;
mod protocol;
mod registry;
mod rtc;
mod tracker;
mod util;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("SKILLSWARM_GIT_COMMIT"), ")");
const SEED_STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(version = VERSION, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Participant id on the platform (random if not provided)
    #[arg(long, env, global = true)]
    participant_id: Option<u64>,

    /// Address (host:port) of the tracker
    #[arg(long, env, global = true, default_value = "127.0.0.1:8080")]
    tracker_addr: String,

    /// Base url of the resource registry
    #[arg(long, env, global = true, default_value = "http://127.0.0.1:3000/")]
    registry_url: String,

    /// Port where peers connect to us (0 picks a free one)
    #[arg(long, env, global = true, default_value_t = 0)]
    listen_port: u16,

    /// Host advertised to peers in connection offers
    #[arg(long, env, global = true, default_value = "127.0.0.1")]
    advertised_host: String,

    /// ICE server urls handed to the peer transport (repeatable)
    #[arg(long = "ice-server", env = "ICE_SERVERS", global = true, value_delimiter = ',', default_values_t = DEFAULT_ICE_SERVERS.map(String::from))]
    ice_servers: Vec<String>,

    /// Piece size in bytes for new resources
    #[arg(long, env, global = true, default_value_t = DEFAULT_PIECE_SIZE_B)]
    piece_size: u64,

    /// Maximum number of peer sessions
    #[arg(long, env, global = true, default_value_t = DEFAULT_MAX_PEERS)]
    max_peers: usize,

    /// Optional log level
    #[arg(short, long, env, global = true, default_value_t = LogLevels::Info)]
    log_level: LogLevels,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a file as a new resource and seed it until interrupted
    Seed {
        /// Path of the file to share
        file: PathBuf,

        /// Title of the resource (the file name if not provided)
        #[arg(long)]
        title: Option<String>,

        /// Comma separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        #[arg(long, default_value = "application/octet-stream")]
        mime_type: String,
    },
    /// Download resources, at most `--max-concurrent-downloads` at a time
    Fetch {
        #[arg(required = true)]
        resource_ids: Vec<ResourceId>,

        /// Put the resources at the front of the queue
        #[arg(long)]
        high_priority: bool,

        /// Directory where downloaded files are written (created if it does not exist)
        #[arg(short, long, env, default_value = ".")]
        output_dir: PathBuf,

        #[arg(long, env, default_value_t = DEFAULT_MAX_CONCURRENT_DOWNLOADS)]
        max_concurrent_downloads: usize,

        /// Keep seeding the downloaded resources until interrupted
        #[arg(long)]
        keep_seeding: bool,
    },
}

#[derive(clap::ValueEnum, Debug, Clone)]
enum LogLevels {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevels {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // init logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or("LOG_LEVEL", args.log_level.to_string()),
    );
    log::info!("skillswarm {VERSION}");

    if args.piece_size == 0 || args.piece_size > MAX_PIECE_SIZE_B {
        log::error!(
            "piece size must be between 1 and {MAX_PIECE_SIZE_B} bytes, got {}",
            args.piece_size
        );
        exit(1);
    }

    let mut config = SwarmConfig {
        piece_size: args.piece_size,
        max_peers: args.max_peers,
        ..SwarmConfig::default()
    };
    if let Some(participant_id) = args.participant_id {
        config.participant_id = participant_id;
    }
    log::info!("participating as {}", config.participant_id);

    let registry = match HttpRegistry::new(&args.registry_url) {
        Ok(r) => r,
        Err(e) => {
            log::error!("invalid registry url {}: {e}", args.registry_url);
            exit(1);
        }
    };
    let connector = TcpTrackerConnector::new(args.tracker_addr.clone(), DEFAULT_CONNECT_TIMEOUT);
    let (rtc_events_tx, rtc_events_rx) = mpsc::unbounded_channel();
    let ice_config = IceConfig {
        ice_servers: args.ice_servers.clone(),
        ..IceConfig::default()
    };
    let engine = match TcpRtcEngine::bind(
        config.participant_id,
        args.listen_port,
        args.advertised_host.clone(),
        ice_config,
        rtc_events_tx,
    )
    .await
    {
        Ok(e) => e,
        Err(e) => {
            log::error!("could not open the peer listener on port {}: {e}", args.listen_port);
            exit(1);
        }
    };

    let (manager, handle) =
        SwarmManager::new(config, registry, connector, Box::new(engine), rtc_events_rx);
    let manager_task = tokio::spawn(manager.start());

    let ok = match args.command {
        Command::Seed {
            file,
            title,
            tags,
            mime_type,
        } => seed(&handle, &file, title, tags, mime_type).await,
        Command::Fetch {
            resource_ids,
            high_priority,
            output_dir,
            max_concurrent_downloads,
            keep_seeding,
        } => {
            let config = DownloadConfig {
                max_concurrent: max_concurrent_downloads,
                ..DownloadConfig::default()
            };
            let priority = if high_priority {
                Priority::High
            } else {
                Priority::Normal
            };
            let ok = fetch(&handle, resource_ids, priority, &output_dir, config).await;
            if ok && keep_seeding {
                wait_for_interrupt().await;
            }
            ok
        }
    };

    handle.shutdown().await;
    let _ = manager_task.await;
    exit(if ok { 0 } else { 1 });
}

async fn seed(
    handle: &SwarmHandle,
    file: &Path,
    title: Option<String>,
    tags: Vec<String>,
    mime_type: String,
) -> bool {
    let payload = match fs::read(file) {
        Ok(c) => c,
        Err(e) => {
            log::error!("could not read {}: {e}", file.display());
            return false;
        }
    };
    let title = title.unwrap_or_else(|| {
        file.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    });
    let metadata = ResourceMetadata {
        title,
        tags,
        ..Default::default()
    };
    match handle.create_and_seed(payload, mime_type, metadata).await {
        Ok(resource_id) => {
            log::info!("seeding resource {resource_id}, interrupt to stop");
            let interrupt = wait_for_interrupt();
            tokio::pin!(interrupt);
            let mut stats = tokio::time::interval(SEED_STATS_INTERVAL);
            loop {
                tokio::select! {
                    _ = stats.tick() => {
                        if let Some(snapshot) = handle.snapshot(resource_id).await {
                            log::info!(
                                "resource {resource_id}: {} uploaded, connected peers {:?}",
                                util::pretty_size(snapshot.uploaded_bytes as f64),
                                snapshot.peers
                            );
                        }
                    }
                    _ = &mut interrupt => break,
                }
            }
            true
        }
        Err(failure) => {
            log::error!("could not share {}: {failure}", file.display());
            false
        }
    }
}

async fn fetch(
    handle: &SwarmHandle,
    resource_ids: Vec<ResourceId>,
    priority: Priority,
    output_dir: &Path,
    config: DownloadConfig,
) -> bool {
    if let Err(e) = fs::create_dir_all(output_dir) {
        log::error!("could not create {}: {e}", output_dir.display());
        return false;
    }
    let swarm_events = match handle.subscribe().await {
        Ok(rx) => rx,
        Err(failure) => {
            log::error!("{failure}");
            return false;
        }
    };
    let mut downloads = DownloadManager::new(handle.clone(), config, swarm_events);
    let mut download_events = downloads.subscribe();
    tokio::spawn(async move {
        while let Some(event) = download_events.recv().await {
            match &event {
                DownloadEvent::Progress { .. } => log::debug!("{}: {event:?}", event.name()),
                _ => log::info!("{}: {event:?}", event.name()),
            }
        }
    });
    for resource_id in resource_ids.iter() {
        downloads.enqueue(*resource_id, priority).await;
    }
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_download_commands(commands_tx));
    log::info!("type pause|resume|cancel <id> or status [<id>] to control the downloads");
    let interrupted = tokio::select! {
        _ = downloads.run(commands_rx) => false,
        _ = wait_for_interrupt() => true,
    };
    if interrupted {
        log::warn!("interrupted, cancelling {} active downloads", downloads.active_downloads().len());
        downloads.cleanup().await;
    }

    for completed in downloads.history() {
        let path = output_dir.join(completed.file_name.replace(['/', '\\'], "_"));
        match fs::write(&path, completed.payload.as_slice()) {
            Ok(()) => log::info!(
                "resource {} written to {} in {:?}",
                completed.resource_id,
                path.display(),
                completed.elapsed
            ),
            Err(e) => log::error!("could not write {}: {e}", path.display()),
        }
    }
    let stats = downloads.statistics();
    log::info!(
        "{} completed, {} failed, {} downloaded",
        stats.completed,
        stats.failed,
        util::pretty_size(stats.downloaded_bytes as f64)
    );
    resource_ids
        .iter()
        .all(|id| downloads.status(*id) == Some(DownloadStatus::Completed))
}

async fn read_download_commands(commands_tx: UnboundedSender<DownloadCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match line.parse::<DownloadCommand>() {
                Ok(command) => {
                    if commands_tx.send(command).is_err() {
                        return;
                    }
                }
                Err(e) => log::warn!("{e:#}"),
            },
            Ok(None) => return,
            Err(e) => {
                log::debug!("stopped reading commands: {e}");
                return;
            }
        }
    }
}

async fn wait_for_interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("could not listen for interrupts: {e}");
    }
}
