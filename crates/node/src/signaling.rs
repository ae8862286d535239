//! Reference WebSocket `Signaling` implementation (§10.1), grounded in the
//! teacher's `agent/signaling.rs` reconnect-with-backoff loop. The core never
//! owns the inbound path directly (§4.1, §9 "Dynamic message typing") — this
//! module hands the Coordinator's caller a `Signaling` handle for outbound
//! sends and a channel of `SignalingEvent`s for inbound traffic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use relay_protocol::error::RelayError;
use relay_protocol::messages::{Signaling, SignalingEvent, SignalingMessage};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub(crate) struct WsSignaling {
    outbound_tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl WsSignaling {
    /// Spawns the connection task and returns a send handle plus the
    /// inbound event stream. Reconnects with exponential backoff for as
    /// long as the process runs; the caller never has to notice a drop.
    pub(crate) fn connect(url: String, room_id: String, local_peer_id: String) -> (Arc<Self>, mpsc::Receiver<SignalingEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(128);
        tokio::spawn(run_with_reconnect(url, room_id, local_peer_id, outbound_rx, inbound_tx));
        (Arc::new(Self { outbound_tx }), inbound_rx)
    }
}

#[async_trait]
impl Signaling for WsSignaling {
    async fn send(&self, message: SignalingMessage) -> Result<(), RelayError> {
        self.outbound_tx
            .send(message)
            .map_err(|_| RelayError::Closed { what: "signaling transport" })
    }
}

async fn run_with_reconnect(
    url: String,
    room_id: String,
    local_peer_id: String,
    mut outbound_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    inbound_tx: mpsc::Sender<SignalingEvent>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        info!(url = %url, room_id = %room_id, "connecting to signaling server");
        match connect_and_handle(&url, &room_id, &local_peer_id, &mut outbound_rx, &inbound_tx).await {
            Ok(()) => {
                info!("signaling connection closed cleanly");
                break;
            }
            Err(e) => {
                warn!(%e, "signaling connection error");
                info!(backoff_secs = backoff.as_secs(), "reconnecting");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

fn build_tls_connector() -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().expect("could not load platform certs") {
        let _ = root_store.add(cert);
    }
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}

/// Pulls the sender identity back out of a parsed message so inbound events
/// can be tagged uniformly, without the core ever seeing the wire shape.
fn sender_of(message: &SignalingMessage) -> String {
    match message {
        SignalingMessage::Join { peer_id, .. }
        | SignalingMessage::Leave { peer_id, .. }
        | SignalingMessage::Ping { peer_id, .. }
        | SignalingMessage::Pong { peer_id, .. }
        | SignalingMessage::RelayClaim { peer_id, .. }
        | SignalingMessage::RelayChanged { peer_id, .. }
        | SignalingMessage::Offer { peer_id, .. }
        | SignalingMessage::Answer { peer_id, .. }
        | SignalingMessage::Candidate { peer_id, .. }
        | SignalingMessage::ScreenShare { peer_id, .. } => peer_id.clone(),
        SignalingMessage::Error { .. } => String::new(),
    }
}

async fn connect_and_handle(
    url: &str,
    room_id: &str,
    local_peer_id: &str,
    outbound_rx: &mut mpsc::UnboundedReceiver<SignalingMessage>,
    inbound_tx: &mpsc::Sender<SignalingEvent>,
) -> anyhow::Result<()> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let full_url = format!(
        "{url}?room={}&peer={}",
        urlencoding::encode(room_id),
        urlencoding::encode(local_peer_id)
    );

    let connector = build_tls_connector();
    let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(&full_url, None, false, Some(connector))
        .await
        .map_err(anyhow::Error::from)?;
    info!("connected to signaling server");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(message) => {
                                let from = sender_of(&message);
                                if inbound_tx.send(SignalingEvent::Message { from, message }).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => warn!(%e, "failed to parse inbound signaling message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    _ => {}
                }
            }
            Some(message) = outbound_rx.recv() => {
                let text = serde_json::to_string(&message)?;
                ws_tx.send(Message::Text(text.into())).await?;
            }
        }
    }
}
