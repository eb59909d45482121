use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use roomcast::{Conference, McuHub, SfuHub};
use roomcast_core::config::{Config, TransportConfig};
use roomcast_core::logging;
use roomcast_core::media::Media;
use roomcast_core::signaling::hub::SignalingHub;
use roomcast_core::topology::Topology;
use roomcast_core::transport::memory::MemoryTransportFactory;
use roomcast_core::transport::webrtc::WebRtcTransportFactory;
use roomcast_core::transport::TransportFactory;
use roomcast_core::types::PeerId;
use roomcast_mixer::{PlaceholderMedia, PlaceholderOptions};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Run a room of simulated participants in one process
#[derive(Parser, Debug)]
#[command(name = "roomcast", about = "Roomcast conference simulator", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "ROOMCAST_CONFIG")]
    config: Option<String>,

    /// Number of participants to join
    #[arg(long, env = "ROOMCAST_PARTICIPANTS", default_value = "3")]
    participants: usize,

    /// Stop after this many seconds instead of waiting for a signal
    #[arg(long, env = "ROOMCAST_DURATION_SECS")]
    duration_secs: Option<u64>,

    /// Topology the room starts in; defaults to `topology.initial`
    #[arg(long, env = "ROOMCAST_TOPOLOGY")]
    topology: Option<String>,
}

fn transport_factory(config: &TransportConfig) -> Result<Arc<dyn TransportFactory>> {
    Ok(match config.kind.as_str() {
        "memory" => Arc::new(MemoryTransportFactory::new()),
        _ => Arc::new(WebRtcTransportFactory::new(config)?),
    })
}

struct Participant {
    conference: Conference,
    media: Arc<PlaceholderMedia>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    logging::init_logging(&config.logging)?;

    let topology: Topology = args
        .topology
        .as_deref()
        .unwrap_or(&config.topology.initial)
        .parse()?;
    info!(participants = args.participants, %topology, "Roomcast starting...");

    let hub = SignalingHub::new(topology);
    let sfu = SfuHub::join(&hub, &config, transport_factory(&config.transport)?)?;
    let mcu = McuHub::join(&hub, &config, transport_factory(&config.transport)?)?;
    mcu.start();
    info!(transport = %config.transport.kind, "Media hubs joined");

    let mut participants = Vec::with_capacity(args.participants);
    for n in 1..=args.participants {
        let name = PeerId::from(format!("user-{n}").as_str());
        let (link, rx) = hub.join(name.clone());
        let conference = Conference::new(
            name,
            &config,
            transport_factory(&config.transport)?,
            Arc::new(link),
        )?;

        let media = Arc::new(PlaceholderMedia::new(PlaceholderOptions {
            enable: true,
            ..PlaceholderOptions::default()
        }));
        media.start();
        conference.add_local_media(Media::Stream(media.stream()))?;

        conference.listen(rx);
        conference.start();
        participants.push(Participant { conference, media });
    }

    let status = {
        let hub = hub.clone();
        let hub_sessions = [sfu.directory().clone(), mcu.directory().clone()];
        let conferences: Vec<Conference> = participants
            .iter()
            .map(|p| p.conference.clone())
            .collect();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            loop {
                ticker.tick().await;
                info!(topology = %hub.topology(), members = hub.members().len(), "Room status");
                for conference in &conferences {
                    let phases: Vec<String> = conference
                        .mesh()
                        .sessions()
                        .iter()
                        .map(|s| format!("{}={:?}", s.peer(), s.phase()))
                        .collect();
                    info!(
                        name = %conference.name(),
                        topology = %conference.topology(),
                        sources = conference.video().source_ids().len(),
                        speakers = ?conference.detector().speakers(),
                        phases = ?phases,
                        "Participant status"
                    );
                }
                for directory in &hub_sessions {
                    for session in directory.sessions() {
                        match session.snapshot().await {
                            Ok(snapshot) => match serde_json::to_string(&snapshot) {
                                Ok(json) => debug!(session = %json, "Hub session"),
                                Err(e) => warn!(error = %e, "Failed to encode session snapshot"),
                            },
                            Err(e) => warn!(peer = %session.peer(), error = %e, "Failed to sample session"),
                        }
                    }
                }
            }
        })
    };

    match args.duration_secs {
        Some(secs) => tokio::select! {
            () = shutdown_signal() => {}
            () = tokio::time::sleep(Duration::from_secs(secs)) => {
                info!("Run duration elapsed");
            }
        },
        None => shutdown_signal().await,
    }

    info!("Shutting down...");
    status.abort();
    for participant in &participants {
        participant.media.stop();
        participant.conference.close().await;
        if !participant.conference.closed() {
            warn!(name = %participant.conference.name(), "Conference did not close cleanly");
        }
    }
    sfu.close().await;
    mcu.close().await;
    info!("Roomcast stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
