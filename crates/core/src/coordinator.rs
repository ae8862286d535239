//! Glue state machine (§4.9): owns the Signaling subscription, sequences
//! Keepalive/Probe/Election/Failover, and is the sole owner of the Bridge and
//! Relay Room once this peer becomes the Relay.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc_util::marshal::Unmarshal;

use relay_protocol::config::RelayConfig;
use relay_protocol::error::RelayError;
use relay_protocol::messages::{Signaling, SignalingEvent, SignalingMessage};
use relay_protocol::peer::{Candidate, DeviceClass, LinkClass, NetworkQuality, PowerState};

use crate::bridge::{Bridge, SfuConnection, SfuEvent};
use crate::election;
use crate::failover::FailoverManager;
use crate::keepalive::{Keepalive, PingSender};
use crate::probe::{NetworkProbe, StatsSource, DEFAULT_PROBE_CADENCE, DEFAULT_RING_SIZE};
use crate::relay_room::{RelayRoom, RelayRoomEvents};
use crate::stats::TrafficStats;
use crate::switcher::{MediaKind, Source, SourceSwitcher, SwitcherEvents};

/// Uniform event stream leaving the core so the embedding UI is a pure
/// consumer (§9 "Callbacks vs channels").
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    RelayChanged { relay_id: String, epoch: u64, score: u8 },
    BecomeRelay { epoch: u64, score: u8 },
    RelayFailed { reason: String },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
}

/// `GetStatus()` snapshot (§6).
#[derive(Debug, Clone)]
pub struct RoomStatus {
    pub room_id: String,
    pub local_peer_id: String,
    pub is_relay: bool,
    pub current_relay: Option<String>,
    pub current_epoch: u64,
    pub peer_count: usize,
    pub subscriber_count: usize,
    pub traffic: crate::stats::TrafficStatsSnapshot,
}

/// Events routed internally from Keepalive/Failover's value-typed callbacks
/// back into the Coordinator's own async methods, resolving the cyclic
/// ownership that a direct `Arc<Coordinator>` back-reference would create
/// (§9 "Cyclic ownership").
enum InternalEvent {
    KeepaliveOffline(String),
    BecomeRelay(u64, u8),
    RelayConflict(String, u64, u8),
    BridgeError(String),
}

/// Adapts the Coordinator's `Signaling` handle into the `PingSender` contract
/// Keepalive depends on, without Keepalive ever knowing about Signaling.
struct SignalingPingSender {
    signaling: Arc<dyn Signaling>,
    room_id: String,
    local_peer_id: String,
}

#[async_trait::async_trait]
impl PingSender for SignalingPingSender {
    async fn send_ping(&self, peer_id: &str) {
        let message = SignalingMessage::Ping {
            room_id: self.room_id.clone(),
            peer_id: self.local_peer_id.clone(),
            target_peer_id: Some(peer_id.to_string()),
        };
        if let Err(e) = self.signaling.send(message).await {
            warn!(%e, peer_id, "failed to send ping");
        }
    }
}

/// Forwards the Switcher's track-replacement callback into the Relay Room,
/// the one place in the design where a component-to-component notification
/// has exactly one subscriber and so is wired as a direct callback (§9).
struct SwitcherToRoom {
    relay_room: Mutex<Option<Arc<RelayRoom>>>,
}

impl SwitcherEvents for SwitcherToRoom {
    fn on_source_changed(&self, _source: Source) {}

    fn on_track_changed(&self, video: Arc<TrackLocalStaticRTP>, audio: Arc<TrackLocalStaticRTP>) {
        let Ok(room) = self.relay_room.try_lock() else {
            return;
        };
        let Some(room) = room.clone() else {
            return;
        };
        tokio::spawn(async move {
            room.update_tracks(video, audio).await;
        });
    }
}

/// Forwards Relay Room events (keyframe requests, renegotiation, subscriber
/// departure) out to the Bridge and the Signaling transport.
struct RoomEventsAdapter {
    signaling: Arc<dyn Signaling>,
    room_id: String,
    local_peer_id: String,
    bridge: Mutex<Option<Arc<Bridge>>>,
}

impl RelayRoomEvents for RoomEventsAdapter {
    fn on_keyframe_request(&self) {
        let Ok(bridge) = self.bridge.try_lock() else {
            return;
        };
        let Some(bridge) = bridge.clone() else {
            return;
        };
        tokio::spawn(async move {
            bridge.request_keyframe().await;
        });
    }

    fn on_subscriber_left(&self, peer_id: &str) {
        debug!(peer_id, "subscriber left the relay room");
    }

    fn on_need_renegotiate(&self, peer_id: &str, offer_sdp: &str) {
        let message = SignalingMessage::Offer {
            room_id: self.room_id.clone(),
            peer_id: self.local_peer_id.clone(),
            target_peer_id: peer_id.to_string(),
            sdp: offer_sdp.to_string(),
        };
        let signaling = self.signaling.clone();
        tokio::spawn(async move {
            if let Err(e) = signaling.send(message).await {
                warn!(%e, "failed to send renegotiation offer");
            }
        });
    }
}

/// Everything that exists only while this peer is the Relay. Constructed on
/// `BecomeRelay`, torn down on leaving Relay (§4.9's "Transition to/away
/// from Relay").
struct RelayResources {
    switcher: Arc<SourceSwitcher>,
    relay_room: Arc<RelayRoom>,
    bridge: Arc<Bridge>,
    bridge_task: tokio::task::JoinHandle<()>,
}

/// Single long-lived object per room (§4.9). Generic over the concrete
/// signaling transport, SFU connection, and transport-stats source — all
/// three are host-supplied adapters, following the same seam already used by
/// `PingSender`/`StatsSource`/`SfuConnection`.
pub struct Coordinator {
    room_id: String,
    local_peer_id: String,
    config: RelayConfig,
    signaling: Arc<dyn Signaling>,
    candidates: Mutex<HashMap<String, Candidate>>,
    local_device: Mutex<(DeviceClass, LinkClass, PowerState)>,
    keepalive: Arc<Keepalive>,
    failover: Arc<FailoverManager>,
    probe: Arc<NetworkProbe>,
    sfu_connection: Arc<dyn SfuConnection>,
    sfu_events: Mutex<Option<mpsc::Receiver<SfuEvent>>>,
    relay: Mutex<Option<RelayResources>>,
    stats: Arc<TrafficStats>,
    bot_token: Mutex<Option<String>>,
    on_event: Mutex<Option<Arc<dyn Fn(CoordinatorEvent) + Send + Sync>>>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: Mutex<Option<mpsc::UnboundedReceiver<InternalEvent>>>,
    keepalive_stop: Mutex<Option<oneshot::Sender<()>>>,
    probe_stop: Mutex<Option<oneshot::Sender<()>>>,
    election_stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl Coordinator {
    pub fn new(
        room_id: impl Into<String>,
        local_peer_id: impl Into<String>,
        config: RelayConfig,
        signaling: Arc<dyn Signaling>,
        stats_source: Arc<dyn StatsSource>,
        sfu_connection: Arc<dyn SfuConnection>,
        sfu_events: mpsc::Receiver<SfuEvent>,
    ) -> Self {
        let room_id = room_id.into();
        let local_peer_id = local_peer_id.into();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let ping_sender = Arc::new(SignalingPingSender {
            signaling: signaling.clone(),
            room_id: room_id.clone(),
            local_peer_id: local_peer_id.clone(),
        });
        let keepalive_tx = internal_tx.clone();
        let keepalive = Arc::new(Keepalive::new(
            config.keepalive.clone(),
            ping_sender,
            move |peer_id| {
                let _ = keepalive_tx.send(InternalEvent::KeepaliveOffline(peer_id.to_string()));
            },
            |_peer_id| {},
        ));

        let become_relay_tx = internal_tx.clone();
        let conflict_tx = internal_tx.clone();
        let failover = Arc::new(FailoverManager::new(
            config.failover.clone(),
            local_peer_id.clone(),
            move |epoch, score| {
                let _ = become_relay_tx.send(InternalEvent::BecomeRelay(epoch, score));
            },
            move |peer_id, epoch, score| {
                let _ = conflict_tx.send(InternalEvent::RelayConflict(peer_id.to_string(), epoch, score));
            },
        ));

        let probe = Arc::new(NetworkProbe::new(stats_source, DEFAULT_RING_SIZE, |_quality| {}));

        Self {
            room_id,
            local_peer_id,
            config,
            signaling,
            candidates: Mutex::new(HashMap::new()),
            local_device: Mutex::new((DeviceClass::Unknown, LinkClass::Unknown, PowerState::Battery)),
            keepalive,
            failover,
            probe,
            sfu_connection,
            sfu_events: Mutex::new(Some(sfu_events)),
            relay: Mutex::new(None),
            stats: Arc::new(TrafficStats::new()),
            bot_token: Mutex::new(None),
            on_event: Mutex::new(None),
            internal_tx,
            internal_rx: Mutex::new(Some(internal_rx)),
            keepalive_stop: Mutex::new(None),
            probe_stop: Mutex::new(None),
            election_stop: Mutex::new(None),
        }
    }

    pub async fn set_bot_token(&self, token: impl Into<String>) {
        *self.bot_token.lock().await = Some(token.into());
    }

    pub fn set_on_event(&self, cb: impl Fn(CoordinatorEvent) + Send + Sync + 'static) {
        // Can't use try_lock/async here since this is a sync setter; the
        // Mutex is uncontended at setup time so blocking_lock is safe.
        *self.on_event.blocking_lock() = Some(Arc::new(cb));
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Ok(guard) = self.on_event.try_lock()
            && let Some(cb) = guard.as_ref()
        {
            cb(event);
        }
    }

    /// Registers this peer as a candidate and starts the background loops
    /// (Keepalive ticker, Probe ticker, internal event dispatcher). §4.9.
    pub async fn start(self: Arc<Self>) -> Result<(), RelayError> {
        let (device, link, power) = *self.local_device.lock().await;
        self.candidates
            .lock()
            .await
            .insert(self.local_peer_id.clone(), Candidate::new(self.local_peer_id.clone(), device, link, power));

        let (keepalive_stop_tx, keepalive_stop_rx) = oneshot::channel();
        *self.keepalive_stop.lock().await = Some(keepalive_stop_tx);
        tokio::spawn(Arc::clone(&self.keepalive).run(keepalive_stop_rx));

        let (probe_stop_tx, probe_stop_rx) = oneshot::channel();
        *self.probe_stop.lock().await = Some(probe_stop_tx);
        tokio::spawn(Arc::clone(&self.probe).run(DEFAULT_PROBE_CADENCE, probe_stop_rx));

        let (election_stop_tx, election_stop_rx) = oneshot::channel();
        *self.election_stop.lock().await = Some(election_stop_tx);
        tokio::spawn(self.clone().run_election_ticker(election_stop_rx));

        let internal_rx = self.internal_rx.lock().await.take();
        if let Some(internal_rx) = internal_rx {
            let this = self.clone();
            tokio::spawn(this.run_internal_dispatch(internal_rx));
        }

        info!(room_id = %self.room_id, peer_id = %self.local_peer_id, "coordinator started");
        Ok(())
    }

    async fn run_internal_dispatch(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<InternalEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                InternalEvent::KeepaliveOffline(peer_id) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.on_keepalive_offline(&peer_id).await });
                }
                InternalEvent::BecomeRelay(epoch, score) => {
                    self.transition_to_relay(epoch, score).await;
                }
                InternalEvent::RelayConflict(relay_id, epoch, score) => {
                    self.transition_away_from_relay(&relay_id, epoch, score).await;
                }
                InternalEvent::BridgeError(reason) => {
                    self.emit(CoordinatorEvent::RelayFailed { reason });
                }
            }
        }
    }

    /// Periodic Election ticker (§4.9): Election itself never schedules
    /// itself (§4.2), so this just keeps the local candidate's
    /// `NetworkQuality` fresh from the Probe's latest sample at
    /// `election.interval_ms` cadence, so whenever Failover does request an
    /// election it scores against current conditions rather than whatever
    /// was true at `AddPeer` time.
    async fn run_election_ticker(self: Arc<Self>, mut stop: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(self.config.election.interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(quality) = self.probe.latest().await {
                        self.update_peer_quality(&self.local_peer_id, quality).await;
                    }
                }
                _ = &mut stop => return,
            }
        }
    }

    async fn on_keepalive_offline(&self, peer_id: &str) {
        if self.failover.current_relay().await.map(|r| r.peer_id) != Some(peer_id.to_string()) {
            return;
        }
        let local_score = self.local_score().await;
        let candidates = self.candidates.lock().await.values().cloned().collect::<Vec<_>>();
        let config = self.config.election.clone();
        self.failover
            .handle_relay_offline(peer_id, local_score, move || election::elect(&candidates, &config))
            .await;
    }

    async fn local_score(&self) -> u8 {
        let candidates = self.candidates.lock().await;
        let Some(local) = candidates.get(&self.local_peer_id).cloned() else {
            return 0;
        };
        drop(candidates);
        election::elect(&[local], &self.config.election).map(|(_, score)| score).unwrap_or(0)
    }

    /// `AddPeer(peerId, device, link, power)` (§6): begins watching the peer
    /// for keepalive and makes it an election candidate.
    pub async fn add_peer(&self, peer_id: &str, device_class: DeviceClass, link_class: LinkClass, power_state: PowerState) {
        self.candidates
            .lock()
            .await
            .insert(peer_id.to_string(), Candidate::new(peer_id, device_class, link_class, power_state));
        self.keepalive.watch(peer_id).await;
        self.emit(CoordinatorEvent::PeerJoined { peer_id: peer_id.to_string() });
    }

    pub async fn remove_peer(&self, peer_id: &str) {
        self.candidates.lock().await.remove(peer_id);
        self.keepalive.unwatch(peer_id).await;
        self.emit(CoordinatorEvent::PeerLeft { peer_id: peer_id.to_string() });
    }

    /// Per-candidate network-metrics update (§4.2): feeds subsequent
    /// elections without waiting for a fresh `AddPeer`.
    pub async fn update_peer_quality(&self, peer_id: &str, quality: NetworkQuality) {
        if let Some(candidate) = self.candidates.lock().await.get_mut(peer_id) {
            candidate.quality = quality;
        }
    }

    pub async fn update_local_device_info(&self, device_class: DeviceClass, link_class: LinkClass, power_state: PowerState) {
        *self.local_device.lock().await = (device_class, link_class, power_state);
        let mut candidates = self.candidates.lock().await;
        if let Some(local) = candidates.get_mut(&self.local_peer_id) {
            local.device_class = device_class;
            local.link_class = link_class;
            local.power_state = power_state;
        }
    }

    /// `HandlePong(peerId)` (§4.9): Keepalive.HandlePong + Failover.ResetOfflineCount.
    pub async fn handle_pong(&self, peer_id: &str) {
        self.keepalive.handle_pong(peer_id).await;
        self.failover.note_pong(peer_id).await;
    }

    pub async fn set_current_relay(&self, relay_id: &str, epoch: u64, score: u8) {
        self.failover.set_current_relay(relay_id, epoch, score).await;
    }

    pub async fn receive_relay_claim(&self, peer_id: &str, epoch: u64, score: u8) {
        let local_score = self.local_score().await;
        self.failover.receive_claim(peer_id, epoch, score, local_score).await;
    }

    /// Dispatches one inbound signaling event (§4.9's dispatch table). The
    /// embedding transport owns the inbound channel (§4.1) and is expected to
    /// call this for everything it receives.
    pub async fn handle_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Message { from, message } => self.handle_signaling_message(&from, message).await,
            SignalingEvent::PeerConnected { peer_id } => {
                debug!(peer_id, "signaling transport reports peer connected");
            }
            SignalingEvent::PeerDisconnected { peer_id } => {
                debug!(peer_id, "signaling transport reports peer disconnected");
            }
        }
    }

    async fn handle_signaling_message(&self, from: &str, message: SignalingMessage) {
        match message {
            SignalingMessage::Join { peer_id, device_class, link_class, power_state, .. } => {
                self.add_peer(&peer_id, device_class, link_class, power_state).await;
            }
            SignalingMessage::Leave { peer_id, .. } => {
                self.remove_peer(&peer_id).await;
            }
            SignalingMessage::Ping { .. } => {
                let reply = SignalingMessage::Pong {
                    room_id: self.room_id.clone(),
                    peer_id: self.local_peer_id.clone(),
                    target_peer_id: Some(from.to_string()),
                };
                if let Err(e) = self.signaling.send(reply).await {
                    warn!(%e, "failed to reply with pong");
                }
            }
            SignalingMessage::Pong { .. } => {
                self.handle_pong(from).await;
            }
            SignalingMessage::RelayClaim { epoch, score, .. } => {
                self.receive_relay_claim(from, epoch, score).await;
            }
            SignalingMessage::RelayChanged { relay_id, epoch, score, .. } => {
                self.set_current_relay(&relay_id, epoch, score).await;
            }
            SignalingMessage::Offer { sdp, .. } => {
                self.handle_offer(from, &sdp).await;
            }
            SignalingMessage::Answer { sdp, .. } => {
                if let Some(relay) = self.relay.lock().await.as_ref() {
                    if let Err(e) = relay.relay_room.handle_answer(from, &sdp).await {
                        warn!(%e, peer_id = from, "handle_answer failed");
                    }
                }
            }
            SignalingMessage::Candidate { candidate, .. } => {
                if let Some(relay) = self.relay.lock().await.as_ref() {
                    if let Err(e) = relay.relay_room.add_ice_candidate(from, &candidate).await {
                        warn!(%e, peer_id = from, "add_ice_candidate failed");
                    }
                }
            }
            SignalingMessage::ScreenShare { is_sharing, .. } => {
                self.handle_screen_share(from, is_sharing).await;
            }
            SignalingMessage::Error { message } => {
                debug!(%message, "signaling reported an error, dropping");
            }
        }
    }

    async fn handle_offer(&self, from: &str, sdp: &str) {
        let Some(relay) = self.relay.lock().await.as_ref().map(|r| r.relay_room.clone()) else {
            warn!(peer_id = from, "received offer while not the relay, ignoring");
            return;
        };
        match relay.add_subscriber(from, sdp).await {
            Ok(answer_sdp) => {
                let message = SignalingMessage::Answer {
                    room_id: self.room_id.clone(),
                    peer_id: self.local_peer_id.clone(),
                    target_peer_id: from.to_string(),
                    sdp: answer_sdp,
                };
                if let Err(e) = self.signaling.send(message).await {
                    warn!(%e, peer_id = from, "failed to send answer");
                }
            }
            Err(e) => warn!(%e, peer_id = from, "add_subscriber failed"),
        }
    }

    async fn handle_screen_share(&self, from: &str, is_sharing: bool) {
        let Some(switcher) = self.relay.lock().await.as_ref().map(|r| r.switcher.clone()) else {
            return;
        };
        if is_sharing {
            switcher.start_local_share(from).await;
        } else {
            switcher.stop_local_share().await;
        }
    }

    /// `InjectSFUPacket(kind, bytes)` (§6): parses raw RTP and feeds it into
    /// the Switcher as the SFU input. A no-op when not the relay.
    pub async fn inject_sfu_packet(&self, kind: MediaKind, bytes: &[u8]) -> Result<(), RelayError> {
        self.inject_packet(Source::Sfu, kind, bytes).await
    }

    /// `InjectLocalPacket(kind, bytes)` (§6): same as above for the Local
    /// (screen-share) input.
    pub async fn inject_local_packet(&self, kind: MediaKind, bytes: &[u8]) -> Result<(), RelayError> {
        self.inject_packet(Source::Local, kind, bytes).await
    }

    async fn inject_packet(&self, source: Source, kind: MediaKind, bytes: &[u8]) -> Result<(), RelayError> {
        let Some(switcher) = self.relay.lock().await.as_ref().map(|r| r.switcher.clone()) else {
            return Err(RelayError::invalid_state("relay", "not currently relay"));
        };
        let mut buf = bytes::Bytes::copy_from_slice(bytes);
        let packet = rtp::packet::Packet::unmarshal(&mut buf).map_err(|e| RelayError::Marshal(e.to_string()))?;
        self.stats.record_sent(bytes.len());
        switcher.write_packet(source, kind, &packet).await;
        Ok(())
    }

    pub async fn start_local_share(&self, sharer_id: &str) -> Result<(), RelayError> {
        let Some(switcher) = self.relay.lock().await.as_ref().map(|r| r.switcher.clone()) else {
            return Err(RelayError::invalid_state("relay", "not currently relay"));
        };
        switcher.start_local_share(sharer_id).await;
        let message = SignalingMessage::ScreenShare {
            room_id: self.room_id.clone(),
            peer_id: self.local_peer_id.clone(),
            is_sharing: true,
        };
        let _ = self.signaling.send(message).await;
        Ok(())
    }

    pub async fn stop_local_share(&self) -> Result<(), RelayError> {
        let Some(switcher) = self.relay.lock().await.as_ref().map(|r| r.switcher.clone()) else {
            return Err(RelayError::invalid_state("relay", "not currently relay"));
        };
        switcher.stop_local_share().await;
        let message = SignalingMessage::ScreenShare {
            room_id: self.room_id.clone(),
            peer_id: self.local_peer_id.clone(),
            is_sharing: false,
        };
        let _ = self.signaling.send(message).await;
        Ok(())
    }

    /// `Transition to Relay` (§4.9): instantiates the Relay Room and
    /// Switcher if absent, broadcasts the claim, and connects the Bridge if
    /// a bot token is available.
    async fn transition_to_relay(&self, epoch: u64, score: u8) {
        if self.relay.lock().await.is_some() {
            return;
        }

        let video_codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        };
        let audio_codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        };
        let switcher_events = Arc::new(SwitcherToRoom { relay_room: Mutex::new(None) });
        let switcher = Arc::new(SourceSwitcher::new(&self.config.switcher, video_codec, audio_codec, switcher_events.clone()));

        let room_events = Arc::new(RoomEventsAdapter {
            signaling: self.signaling.clone(),
            room_id: self.room_id.clone(),
            local_peer_id: self.local_peer_id.clone(),
            bridge: Mutex::new(None),
        });
        let relay_room = match RelayRoom::new(&self.config.ice, switcher.clone(), room_events.clone()) {
            Ok(room) => Arc::new(room),
            Err(e) => {
                warn!(%e, "failed to build relay room, aborting become-relay");
                self.emit(CoordinatorEvent::RelayFailed { reason: e.to_string() });
                return;
            }
        };
        *switcher_events.relay_room.lock().await = Some(relay_room.clone());

        let bridge_error_tx = self.internal_tx.clone();
        let bridge = Arc::new(Bridge::new(self.sfu_connection.clone(), switcher.clone(), move |e| {
            let _ = bridge_error_tx.send(InternalEvent::BridgeError(e.to_string()));
        }));
        *room_events.bridge.lock().await = Some(bridge.clone());

        let bridge_task = if let Some(events) = self.sfu_events.lock().await.take() {
            let bridge_for_task = bridge.clone();
            tokio::spawn(async move { bridge_for_task.run(events).await })
        } else {
            tokio::spawn(async {})
        };

        if let Some(token) = self.bot_token.lock().await.clone() {
            if let Err(e) = bridge.connect(&token).await {
                warn!(%e, "bridge connect failed");
            }
        }

        *self.relay.lock().await = Some(RelayResources {
            switcher,
            relay_room,
            bridge,
            bridge_task,
        });

        let claim = SignalingMessage::RelayClaim {
            room_id: self.room_id.clone(),
            peer_id: self.local_peer_id.clone(),
            epoch,
            score,
        };
        let changed = SignalingMessage::RelayChanged {
            room_id: self.room_id.clone(),
            peer_id: self.local_peer_id.clone(),
            relay_id: self.local_peer_id.clone(),
            epoch,
            score,
        };
        let _ = self.signaling.send(claim).await;
        let _ = self.signaling.send(changed).await;

        info!(room_id = %self.room_id, epoch, score, "became relay");
        self.emit(CoordinatorEvent::BecomeRelay { epoch, score });
    }

    /// `Transition away from Relay` (§4.9): tears down the Bridge and Relay
    /// Room; this peer remains a subscriber of whoever the new Relay is.
    async fn transition_away_from_relay(&self, relay_id: &str, epoch: u64, score: u8) {
        let relay = self.relay.lock().await.take();
        let Some(relay) = relay else {
            return;
        };
        relay.bridge.disconnect().await;
        relay.bridge_task.abort();
        relay.relay_room.close().await;
        info!(room_id = %self.room_id, new_relay = relay_id, epoch, "left relay role, yielded to conflicting claim");
        self.emit(CoordinatorEvent::RelayChanged {
            relay_id: relay_id.to_string(),
            epoch,
            score,
        });
    }

    pub async fn get_status(&self) -> RoomStatus {
        let subscriber_count = match self.relay.lock().await.as_ref() {
            Some(relay) => relay.relay_room.subscriber_count().await,
            None => 0,
        };
        let current_relay = self.failover.current_relay().await;
        RoomStatus {
            room_id: self.room_id.clone(),
            local_peer_id: self.local_peer_id.clone(),
            is_relay: self.failover.is_local_relay().await,
            current_relay: current_relay.as_ref().map(|r| r.peer_id.clone()),
            current_epoch: self.failover.current_epoch().await,
            peer_count: self.candidates.lock().await.len(),
            subscriber_count,
            traffic: self.stats.snapshot(),
        }
    }

    /// `Close()` (§5's orderly shutdown): stops the background loops and
    /// tears down any Relay-side resources.
    pub async fn close(&self) {
        if let Some(stop) = self.keepalive_stop.lock().await.take() {
            let _ = stop.send(());
        }
        if let Some(stop) = self.probe_stop.lock().await.take() {
            let _ = stop.send(());
        }
        if let Some(stop) = self.election_stop.lock().await.take() {
            let _ = stop.send(());
        }
        if let Some(relay) = self.relay.lock().await.take() {
            relay.bridge.disconnect().await;
            relay.bridge_task.abort();
            relay.relay_room.close().await;
        }
        info!(room_id = %self.room_id, "coordinator closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct NullSignaling {
        sent: StdMutex<Vec<SignalingMessage>>,
    }

    impl NullSignaling {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: StdMutex::new(Vec::new()) })
        }
    }

    #[async_trait::async_trait]
    impl Signaling for NullSignaling {
        async fn send(&self, message: SignalingMessage) -> Result<(), RelayError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    struct ZeroStats;

    #[async_trait::async_trait]
    impl StatsSource for ZeroStats {
        async fn sample(&self) -> crate::probe::RawStatsSample {
            crate::probe::RawStatsSample {
                rtt_ms: 10,
                jitter_ms: 1,
                packet_loss_pct: 0.0,
                available_bandwidth_kbps: 5000,
                bytes_sent: 0,
                bytes_received: 0,
            }
        }
    }

    struct NullSfuConnection;

    #[async_trait::async_trait]
    impl SfuConnection for NullSfuConnection {
        async fn connect(&self, _token: &str) -> Result<(), RelayError> {
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn set_subscribed(&self, _track_sid: &str, _subscribed: bool) -> Result<(), RelayError> {
            Ok(())
        }
        async fn request_quality(&self, _track_sid: &str, _quality: crate::bridge::TrackQuality) -> Result<(), RelayError> {
            Ok(())
        }
    }

    fn test_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.failover.offline_threshold = 1;
        config.failover.backoff_per_point_ms = 1;
        config.failover.max_backoff_ms = 50;
        config.keepalive.interval_ms = 10;
        config.keepalive.timeout_ms = 30;
        config
    }

    fn make_coordinator(local_peer_id: &str, signaling: Arc<NullSignaling>) -> Arc<Coordinator> {
        let (_tx, rx) = mpsc::channel(8);
        Arc::new(Coordinator::new(
            "room-a",
            local_peer_id,
            test_config(),
            signaling,
            Arc::new(ZeroStats),
            Arc::new(NullSfuConnection),
            rx,
        ))
    }

    /// Adding and removing a peer keeps the candidate table and keepalive
    /// watch list in sync, and fires the expected join/leave events.
    #[tokio::test]
    async fn add_and_remove_peer_round_trips_through_candidate_table() {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        let coordinator = make_coordinator("local", NullSignaling::new());
        coordinator.set_on_event(move |e| events_clone.lock().unwrap().push(format!("{e:?}")));

        coordinator.add_peer("peer-b", DeviceClass::Pc, LinkClass::Ethernet, PowerState::Plugged).await;
        assert_eq!(coordinator.candidates.lock().await.len(), 1);

        coordinator.remove_peer("peer-b").await;
        assert!(coordinator.candidates.lock().await.is_empty());

        let logged = events.lock().unwrap();
        assert!(logged.iter().any(|e| e.contains("PeerJoined")));
        assert!(logged.iter().any(|e| e.contains("PeerLeft")));
    }

    /// A higher-scored inbound relay claim at a newer epoch is adopted.
    #[tokio::test]
    async fn receive_relay_claim_adopts_newer_epoch() {
        let coordinator = make_coordinator("local", NullSignaling::new());
        Arc::clone(&coordinator).start().await.unwrap();
        coordinator.receive_relay_claim("other", 1, 90).await;
        assert_eq!(coordinator.get_status().await.current_relay, Some("other".to_string()));
        assert_eq!(coordinator.get_status().await.current_epoch, 1);
    }

    /// Becoming relay broadcasts a claim and a relayChanged message and
    /// fires the BecomeRelay event.
    #[tokio::test]
    async fn become_relay_broadcasts_claim_and_fires_event() {
        let became = Arc::new(AtomicU32::new(0));
        let became_clone = became.clone();
        let signaling = NullSignaling::new();
        let coordinator = make_coordinator("local", signaling.clone());
        coordinator.set_on_event(move |e| {
            if matches!(e, CoordinatorEvent::BecomeRelay { .. }) {
                became_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        coordinator.transition_to_relay(1, 80).await;
        assert_eq!(became.load(Ordering::SeqCst), 1);
        assert!(coordinator.relay.lock().await.is_some());

        let sent = signaling.sent.lock().unwrap();
        assert!(sent.iter().any(|m| matches!(m, SignalingMessage::RelayClaim { .. })));
        assert!(sent.iter().any(|m| matches!(m, SignalingMessage::RelayChanged { .. })));
    }

    /// The periodic Election ticker (§4.9) keeps the local candidate's
    /// `NetworkQuality` refreshed from the Probe's latest sample, rather than
    /// leaving it at whatever was true when `AddPeer`/`start` ran.
    #[tokio::test(start_paused = true)]
    async fn election_ticker_refreshes_local_candidate_quality() {
        let mut config = test_config();
        config.election.interval_ms = 50;
        let coordinator = Arc::new(Coordinator::new(
            "room-a",
            "local",
            config,
            NullSignaling::new(),
            Arc::new(ZeroStats),
            Arc::new(NullSfuConnection),
            mpsc::channel(8).1,
        ));
        Arc::clone(&coordinator).start().await.unwrap();

        tokio::time::advance(std::time::Duration::from_millis(1100)).await;
        // Let the spawned probe/election tasks observe the advanced clock.
        tokio::task::yield_now().await;

        let candidates = coordinator.candidates.lock().await;
        let local = candidates.get("local").expect("local peer registers itself as a candidate on start");
        assert_eq!(local.quality.latency_ms, 10, "quality should match the probe's fixed sample");
        drop(candidates);
        coordinator.close().await;
    }

    /// Injecting a packet while not the relay is rejected rather than
    /// silently dropped.
    #[tokio::test]
    async fn inject_packet_without_relay_role_errors() {
        let coordinator = make_coordinator("local", NullSignaling::new());
        let packet = rtp::packet::Packet {
            header: rtp::header::Header::default(),
            payload: bytes::Bytes::from_static(b"x"),
        };
        use webrtc_util::marshal::Marshal;
        let buf = packet.marshal().unwrap();
        let result = coordinator.inject_sfu_packet(MediaKind::Video, &buf).await;
        assert!(result.is_err());
    }
}
