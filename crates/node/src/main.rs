mod bridge_livekit;
mod cli;
mod config;
mod signaling;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use relay_core::coordinator::{Coordinator, CoordinatorEvent};
use relay_core::probe::{RawStatsSample, StatsSource};
use relay_protocol::peer::{DeviceClass, LinkClass, PowerState};

use bridge_livekit::LiveKitConnection;
use signaling::WsSignaling;

/// Placeholder transport-stats source until a concrete one (ICE connection
/// stats, OS socket counters) is wired in by the embedding deployment; the
/// Probe still runs on schedule and feeds the Election candidate table with
/// these samples (§4.4).
struct NullStatsSource;

#[async_trait::async_trait]
impl StatsSource for NullStatsSource {
    async fn sample(&self) -> RawStatsSample {
        RawStatsSample {
            rtt_ms: 0,
            jitter_ms: 0,
            packet_loss_pct: 0.0,
            available_bandwidth_kbps: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::parse_args()?;
    info!(room_id = %args.room_id, peer_id = %args.peer_id, signaling_url = %args.signaling_url, "starting relay-node");

    let config = config::load_config(&args.config_path)?;
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{issue}");
            } else {
                warn!("{issue}");
            }
        }
        if has_errors {
            anyhow::bail!("invalid configuration, see errors above");
        }
    }

    let (signaling, mut inbound) = WsSignaling::connect(args.signaling_url.clone(), args.room_id.clone(), args.peer_id.clone());

    let (sfu_events_tx, sfu_events_rx) = mpsc::channel(256);
    let livekit_url = std::env::var("RELAY_LIVEKIT_URL").unwrap_or_else(|_| args.signaling_url.clone());
    let sfu_connection = LiveKitConnection::new(livekit_url, sfu_events_tx);

    let coordinator = Arc::new(Coordinator::new(
        args.room_id.clone(),
        args.peer_id.clone(),
        config,
        signaling,
        Arc::new(NullStatsSource),
        sfu_connection,
        sfu_events_rx,
    ));

    if let Some(token) = &args.bot_token {
        coordinator.set_bot_token(token.clone()).await;
    }

    coordinator.set_on_event(|event| match &event {
        CoordinatorEvent::BecomeRelay { epoch, score } => {
            info!(epoch, score, "became relay");
        }
        CoordinatorEvent::RelayChanged { relay_id, epoch, score } => {
            info!(%relay_id, epoch, score, "relay changed");
        }
        CoordinatorEvent::RelayFailed { reason } => {
            warn!(%reason, "relay role failed");
        }
        CoordinatorEvent::PeerJoined { peer_id } => {
            info!(%peer_id, "peer joined");
        }
        CoordinatorEvent::PeerLeft { peer_id } => {
            info!(%peer_id, "peer left");
        }
    });

    // Local device info defaults to a plugged-in, wired desktop; a richer
    // deployment would detect this and call update_local_device_info again.
    coordinator
        .update_local_device_info(DeviceClass::Pc, LinkClass::Ethernet, PowerState::Plugged)
        .await;
    Arc::clone(&coordinator).start().await.context("failed to start coordinator")?;

    let dispatch_coordinator = coordinator.clone();
    let dispatch = tokio::spawn(async move {
        while let Some(event) = inbound.recv().await {
            dispatch_coordinator.handle_signaling_event(event).await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        _ = dispatch => {
            warn!("signaling dispatch loop exited");
        }
    }

    coordinator.close().await;
    info!("relay-node shutdown complete");
    Ok(())
}
