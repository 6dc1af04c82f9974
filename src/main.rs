use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webrtc_bridge::config::{BridgeConfig, ConfigStore};
use webrtc_bridge::events::EventBus;
use webrtc_bridge::http::ReqwestHttpClient;
use webrtc_bridge::manager::ConnectionManager;
use webrtc_bridge::p2p::{P2PConfig, P2PSession, SignalBundle};
use webrtc_bridge::sfu::{WhepClient, WhepConfig, WhipClient, WhipConfig};
use webrtc_bridge::webrtc::{
    FrameCallback, IceCandidate, MediaFrame, MediaKind, PeerConnection, PeerConnectionConfig,
    PeerState, SdpType,
};

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

/// webrtc-bridge command line arguments
#[derive(Parser, Debug)]
#[command(name = "webrtc-bridge")]
#[command(version, about = "WHIP/WHEP and manual P2P WebRTC sessions from the terminal", long_about = None)]
struct CliArgs {
    /// Configuration file (JSON); defaults are used when it does not exist
    #[arg(short = 'c', long, value_name = "FILE", default_value = "webrtc-bridge.json")]
    config: PathBuf,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a session to a WHIP endpoint
    Whip {
        #[arg(long)]
        url: String,
        /// Bearer token
        #[arg(long)]
        token: Option<String>,
    },
    /// Receive media from a WHEP endpoint
    Whep {
        #[arg(long)]
        url: String,
        /// Bearer token
        #[arg(long)]
        token: Option<String>,
        /// Do not request audio
        #[arg(long)]
        no_audio: bool,
    },
    /// Manually signaled peer-to-peer session
    P2p {
        #[command(subcommand)]
        role: P2pRole,
    },
}

#[derive(Subcommand, Debug)]
enum P2pRole {
    /// Create an offer and wait for the answer token
    Host,
    /// Answer an offer token (read from stdin when omitted)
    Join {
        #[arg(long)]
        offer: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting webrtc-bridge v{}", env!("CARGO_PKG_VERSION"));

    let store = ConfigStore::load(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;
    let config = store.get();

    let events = Arc::new(EventBus::new());
    spawn_event_logger(&events);
    let manager = Arc::new(
        ConnectionManager::new(config.manager.clone())?.with_event_bus(events.clone()),
    );

    match args.command {
        Command::Whip { url, token } => run_whip(&config, &manager, url, token).await,
        Command::Whep {
            url,
            token,
            no_audio,
        } => run_whep(&config, &manager, url, token, no_audio).await,
        Command::P2p { role } => run_p2p(&config, &manager, role).await,
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
        LogLevel::Error => "webrtc_bridge=error,webrtc=error",
        LogLevel::Warn => "webrtc_bridge=warn,webrtc=warn",
        LogLevel::Info => "webrtc_bridge=info,webrtc=warn",
        LogLevel::Verbose => "webrtc_bridge=debug,webrtc=warn",
        LogLevel::Debug => "webrtc_bridge=debug,webrtc=info",
        LogLevel::Trace => "webrtc_bridge=trace,webrtc=debug",
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

fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            tracing::debug!("[event] {} {}", event.event_name(), event.connection_id());
        }
    });
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for CTRL+C: {}", e);
        return;
    }
    tracing::info!("Shutdown signal received");
}

async fn read_token(prompt: &str) -> anyhow::Result<String> {
    eprintln!("{}", prompt);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if !line.is_empty() {
            return Ok(line.to_string());
        }
    }
    bail!("stdin closed before a token was entered")
}

async fn run_whip(
    config: &BridgeConfig,
    manager: &Arc<ConnectionManager>,
    url: String,
    token: Option<String>,
) -> anyhow::Result<()> {
    let id = manager.create_connection(&url, "whip")?;
    let http = Arc::new(ReqwestHttpClient::new(&config.http)?);
    let whip = Arc::new(WhipClient::new(
        WhipConfig {
            bearer_token: token,
            ..WhipConfig::new(url)
        },
        http,
    )?);

    let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel::<IceCandidate>();
    let state_manager = manager.clone();
    let state_id = id.clone();
    let peer = PeerConnection::new(PeerConnectionConfig {
        ice_servers: config.ice.ice_servers(),
        mdns_mode: config.ice.mdns_mode,
        on_state: Some(Arc::new(move |state: PeerState| {
            let _ = state_manager.update_connection_state(&state_id, state);
        })),
        on_local_ice_candidate: Some(Arc::new(move |candidate: IceCandidate| {
            let _ = candidate_tx.send(candidate);
        })),
        ..Default::default()
    })
    .await?;

    if let Err(e) = whip.publish(&peer).await {
        manager.report_error(&id, &e.to_string());
        peer.close().await;
        return Err(e.into());
    }

    // Candidates gathered before the resource existed were queued in the channel
    let trickle_whip = whip.clone();
    let trickle = tokio::spawn(async move {
        while let Some(candidate) = candidate_rx.recv().await {
            if let Err(e) = trickle_whip
                .send_ice_candidate(&candidate.candidate, &candidate.mid)
                .await
            {
                tracing::debug!("Candidate not delivered: {}", e);
            }
        }
    });

    tracing::info!(
        "Publishing, resource {}",
        whip.resource_url().unwrap_or_default()
    );
    wait_for_shutdown().await;

    trickle.abort();
    whip.disconnect().await;
    peer.close().await;
    manager.remove_connection(&id);
    Ok(())
}

async fn run_whep(
    config: &BridgeConfig,
    manager: &Arc<ConnectionManager>,
    url: String,
    token: Option<String>,
    no_audio: bool,
) -> anyhow::Result<()> {
    let id = manager.create_connection(&url, "whep")?;

    let video_packets = Arc::new(AtomicU64::new(0));
    let audio_packets = Arc::new(AtomicU64::new(0));
    let video_counter = video_packets.clone();
    let audio_counter = audio_packets.clone();

    let state_manager = manager.clone();
    let state_id = id.clone();
    let error_manager = manager.clone();
    let error_id = id.clone();

    let whep_config = WhepConfig {
        bearer_token: token,
        ice_servers: config.ice.ice_servers(),
        mdns_mode: config.ice.mdns_mode,
        on_state: Some(Arc::new(move |state: PeerState| {
            let _ = state_manager.update_connection_state(&state_id, state);
        })),
        on_error: Some(Arc::new(move |message: &str| {
            error_manager.report_error(&error_id, message);
        })),
        on_video_frame: Some(Arc::new(move |frame: MediaFrame| {
            if frame.kind == MediaKind::Video {
                video_counter.fetch_add(1, Ordering::Relaxed);
            }
        })),
        on_audio_frame: (!no_audio).then(|| -> FrameCallback {
            Arc::new(move |_frame: MediaFrame| {
                audio_counter.fetch_add(1, Ordering::Relaxed);
            })
        }),
        reconnect: Some(config.reconnect.clone()),
        on_reconnecting: Some(Arc::new(|active: bool, attempt: u32| {
            if active {
                tracing::info!("Reconnecting (attempt {})", attempt);
            }
        })),
        ..WhepConfig::new(url)
    };

    let whep = WhepClient::with_http_config(whep_config, &config.http).await?;
    if let Err(e) = whep.connect().await {
        if !e.is_transient() {
            whep.disconnect().await;
            return Err(e.into());
        }
        tracing::warn!("Initial connect failed, retrying in background: {}", e);
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                tracing::info!(
                    "Received {} video / {} audio packets (state {:?})",
                    video_packets.load(Ordering::Relaxed),
                    audio_packets.load(Ordering::Relaxed),
                    whep.peer_state()
                );
            }
        }
    }

    whep.disconnect().await;
    manager.remove_connection(&id);
    Ok(())
}

async fn run_p2p(
    config: &BridgeConfig,
    manager: &Arc<ConnectionManager>,
    role: P2pRole,
) -> anyhow::Result<()> {
    let id = manager.create_connection("p2p", "p2p")?;
    let state_manager = manager.clone();
    let state_id = id.clone();

    let session = P2PSession::new(P2PConfig {
        answer_timeout_ms: config.p2p.answer_timeout_ms,
        on_state: Some(Arc::new(move |state: PeerState| {
            let _ = state_manager.update_connection_state(&state_id, state);
        })),
        on_connected: Some(Arc::new(|| tracing::info!("Peer connected"))),
        ..P2PConfig::from_ice(&config.ice)
    });

    let result = match role {
        P2pRole::Host => host_session(&session).await,
        P2pRole::Join { offer } => join_session(&session, offer).await,
    };

    if let Err(ref e) = result {
        manager.report_error(&id, &e.to_string());
    } else {
        wait_for_shutdown().await;
    }

    session.disconnect().await;
    manager.remove_connection(&id);
    result
}

async fn host_session(session: &P2PSession) -> anyhow::Result<()> {
    let session_id = session.initialize_as_host().await?;
    let offer = session.create_offer().await?;

    println!("{}", SignalBundle::offer(session_id.clone(), offer).encode()?);
    let token = read_token("Send the token above to the other side, then paste their answer:").await?;

    let bundle = SignalBundle::decode(&token)?;
    if bundle.sdp_type != SdpType::Answer || bundle.session_id != session_id {
        bail!("expected an answer for session {}", session_id);
    }
    session.set_remote_answer(&bundle.sdp).await?;
    tracing::info!("Answer applied, waiting for the connection (CTRL+C to quit)");
    Ok(())
}

async fn join_session(session: &P2PSession, offer: Option<String>) -> anyhow::Result<()> {
    let token = match offer {
        Some(token) => token,
        None => read_token("Paste the offer token:").await?,
    };
    let bundle = SignalBundle::decode(&token)?;
    if bundle.sdp_type != SdpType::Offer {
        bail!("expected an offer token");
    }

    session.initialize_as_client(&bundle.session_id).await?;
    let answer = session.set_remote_offer(&bundle.sdp).await?;

    println!("{}", SignalBundle::answer(bundle.session_id, answer).encode()?);
    eprintln!("Send the token above back to the host (CTRL+C to quit)");
    Ok(())
}
