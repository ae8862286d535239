//! Terminates subscriber WebRTC sessions and multiplexes the Switcher's
//! outbound track pair out to all of them (§4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use relay_protocol::config::IceConfig;
use relay_protocol::error::RelayError;

/// RTCP PT=206 (payload-specific feedback), FMT=1 (Picture Loss Indication).
/// webrtc-rs surfaces this as a typed `PictureLossIndication`/`FullIntraRequest`
/// downcast rather than the raw PT/FMT pair, but these are the wire values
/// being matched against.
const PLI_THROTTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl SubscriberState {
    fn as_u8(self) -> u8 {
        match self {
            SubscriberState::Connecting => 0,
            SubscriberState::Connected => 1,
            SubscriberState::Disconnected => 2,
            SubscriberState::Failed => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => SubscriberState::Connected,
            2 => SubscriberState::Disconnected,
            3 => SubscriberState::Failed,
            _ => SubscriberState::Connecting,
        }
    }
}

struct SubscriberSession {
    peer_connection: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    audio_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    state: AtomicU8,
    last_activity: Mutex<Instant>,
}

/// Callbacks fired by the Relay Room, invoked outside its subscriber-table
/// lock (§5's "copy references under lock, invoke outside" pattern).
pub trait RelayRoomEvents: Send + Sync {
    /// A subscriber observed a PLI/FIR keyframe request; forward it to the
    /// Bridge so the next SFU frame is a keyframe.
    fn on_keyframe_request(&self);
    fn on_subscriber_left(&self, peer_id: &str);
    /// A renegotiation offer was created for `peer_id` and needs to be
    /// shipped to that peer over signaling.
    fn on_need_renegotiate(&self, peer_id: &str, offer_sdp: &str);
}

/// Holds the set of Subscriber Sessions keyed by peer-id plus a reference to
/// the Source Switcher whose tracks every session forwards (§4.7).
pub struct RelayRoom {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    switcher: Arc<super::switcher::SourceSwitcher>,
    subscribers: Mutex<HashMap<String, Arc<SubscriberSession>>>,
    events: Arc<dyn RelayRoomEvents>,
}

impl RelayRoom {
    pub fn new(
        ice: &IceConfig,
        switcher: Arc<super::switcher::SourceSwitcher>,
        events: Arc<dyn RelayRoomEvents>,
    ) -> Result<Self, RelayError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| RelayError::Connection(format!("media engine setup: {e}")))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| RelayError::Connection(format!("interceptor setup: {e}")))?;
        let api = Arc::new(
            APIBuilder::new()
                .with_media_engine(media_engine)
                .with_interceptor_registry(registry)
                .build(),
        );
        let ice_servers = ice_servers_from_config(ice);
        Ok(Self {
            api,
            ice_servers,
            switcher,
            subscribers: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// `AddSubscriber(peerId, offerSDP) -> answerSDP` (§4.7): creates a new
    /// PeerConnection, attaches the Switcher's current tracks, drains RTCP
    /// for PLI, negotiates, then re-points the senders at whatever the
    /// Switcher's current tracks are (they may have advanced between the
    /// initial `add_track` and now) and requests an immediate keyframe.
    pub async fn add_subscriber(&self, peer_id: &str, offer_sdp: &str) -> Result<String, RelayError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| RelayError::Connection(format!("new_peer_connection: {e}")))?,
        );

        let (video_track, audio_track) = self.switcher.current_tracks().await;
        let video_sender = peer_connection
            .add_track(video_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| RelayError::Connection(format!("add video track: {e}")))?;
        let audio_sender = peer_connection
            .add_track(audio_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| RelayError::Connection(format!("add audio track: {e}")))?;

        let session = Arc::new(SubscriberSession {
            peer_connection: peer_connection.clone(),
            video_sender: Mutex::new(Some(video_sender.clone())),
            audio_sender: Mutex::new(Some(audio_sender.clone())),
            state: AtomicU8::new(SubscriberState::Connecting.as_u8()),
            last_activity: Mutex::new(Instant::now()),
        });
        spawn_rtcp_drain(video_sender, self.events.clone());
        spawn_rtcp_drain(audio_sender, self.events.clone());

        {
            let peer_id = peer_id.to_string();
            let session = session.clone();
            peer_connection.on_peer_connection_state_change(Box::new(move |state| {
                let new_state = match state {
                    RTCPeerConnectionState::Connected => SubscriberState::Connected,
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        SubscriberState::Disconnected
                    }
                    RTCPeerConnectionState::Failed => SubscriberState::Failed,
                    _ => return Box::pin(async {}),
                };
                session.state.store(new_state.as_u8(), Ordering::SeqCst);
                info!(peer_id = %peer_id, ?state, "subscriber connection state changed");
                Box::pin(async {})
            }));
        }

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| RelayError::Marshal(format!("offer sdp: {e}")))?;
        peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| RelayError::Connection(format!("set_remote_description: {e}")))?;
        let answer = peer_connection
            .create_answer(None)
            .await
            .map_err(|e| RelayError::Connection(format!("create_answer: {e}")))?;
        peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| RelayError::Connection(format!("set_local_description: {e}")))?;

        self.subscribers.lock().await.insert(peer_id.to_string(), session.clone());

        // The Switcher may have moved on since we fetched tracks above —
        // re-point the senders and force a keyframe so this subscriber
        // doesn't wait for the natural keyframe cadence (I4, S6).
        let (video_track, audio_track) = self.switcher.current_tracks().await;
        replace_sender_track(&session.video_sender, video_track).await;
        replace_sender_track(&session.audio_sender, audio_track).await;
        self.events.on_keyframe_request();

        Ok(answer.sdp)
    }

    /// Called from the Switcher's `onTrackChanged` (§4.7). Existing senders
    /// get `ReplaceTrack`; subscribers with no sender yet for `kind` get
    /// `AddTrack` and are marked for renegotiation.
    pub async fn update_tracks(&self, video: Arc<TrackLocalStaticRTP>, audio: Arc<TrackLocalStaticRTP>) {
        let subscribers: Vec<(String, Arc<SubscriberSession>)> = {
            let map = self.subscribers.lock().await;
            map.iter().map(|(id, s)| (id.clone(), s.clone())).collect()
        };
        for (peer_id, session) in subscribers {
            let mut needs_renegotiate = false;
            needs_renegotiate |= self
                .replace_or_add_track(&session, &session.video_sender, video.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await;
            needs_renegotiate |= self
                .replace_or_add_track(&session, &session.audio_sender, audio.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await;
            if needs_renegotiate {
                self.renegotiate(&peer_id, &session).await;
            }
        }
    }

    async fn replace_or_add_track(
        &self,
        session: &SubscriberSession,
        slot: &Mutex<Option<Arc<RTCRtpSender>>>,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> bool {
        let mut slot = slot.lock().await;
        match slot.as_ref() {
            Some(sender) => {
                if let Err(e) = sender.replace_track(Some(track)).await {
                    warn!(%e, "ReplaceTrack failed");
                }
                false
            }
            None => match session.peer_connection.add_track(track).await {
                Ok(sender) => {
                    spawn_rtcp_drain(sender.clone(), self.events.clone());
                    *slot = Some(sender);
                    true
                }
                Err(e) => {
                    warn!(%e, "AddTrack failed");
                    false
                }
            },
        }
    }

    /// Renegotiation is only safe while `signaling_state == stable`;
    /// otherwise it's skipped and the next `on_negotiation_needed` retries.
    async fn renegotiate(&self, peer_id: &str, session: &SubscriberSession) {
        if session.peer_connection.signaling_state() != RTCSignalingState::Stable {
            return;
        }
        let offer = match session.peer_connection.create_offer(None).await {
            Ok(o) => o,
            Err(e) => {
                warn!(%e, "create_offer for renegotiation failed");
                return;
            }
        };
        if let Err(e) = session.peer_connection.set_local_description(offer.clone()).await {
            warn!(%e, "set_local_description for renegotiation failed");
            return;
        }
        self.events.on_need_renegotiate(peer_id, &offer.sdp);
    }

    /// Applies a remote answer from a renegotiation cycle. Ignored (not an
    /// error) if the subscriber isn't in `have-local-offer` — a reordered or
    /// duplicate answer is simply stale.
    pub async fn handle_answer(&self, peer_id: &str, sdp: &str) -> Result<(), RelayError> {
        let session = self.get(peer_id).await?;
        if session.peer_connection.signaling_state() != RTCSignalingState::HaveLocalOffer {
            return Ok(());
        }
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| RelayError::Marshal(format!("answer sdp: {e}")))?;
        session
            .peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| RelayError::Connection(format!("set_remote_description: {e}")))?;
        Ok(())
    }

    pub async fn add_ice_candidate(&self, peer_id: &str, candidate: &str) -> Result<(), RelayError> {
        let session = self.get(peer_id).await?;
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            ..Default::default()
        };
        session
            .peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| RelayError::Connection(format!("add_ice_candidate: {e}")))
    }

    pub async fn remove_subscriber(&self, peer_id: &str) -> Result<(), RelayError> {
        let session = self.subscribers.lock().await.remove(peer_id);
        let Some(session) = session else {
            return Err(RelayError::not_found("subscriber", peer_id));
        };
        let _ = session.peer_connection.close().await;
        self.events.on_subscriber_left(peer_id);
        Ok(())
    }

    pub async fn subscriber_state(&self, peer_id: &str) -> Option<SubscriberState> {
        let map = self.subscribers.lock().await;
        map.get(peer_id).map(|s| SubscriberState::from_u8(s.state.load(Ordering::SeqCst)))
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Closes every subscriber's PeerConnection (part of Coordinator.Stop's
    /// orderly shutdown, §5).
    pub async fn close(&self) {
        let sessions: Vec<Arc<SubscriberSession>> = {
            let mut map = self.subscribers.lock().await;
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            let _ = session.peer_connection.close().await;
        }
    }

    async fn get(&self, peer_id: &str) -> Result<Arc<SubscriberSession>, RelayError> {
        self.subscribers
            .lock()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| RelayError::not_found("subscriber", peer_id))
    }
}

async fn replace_sender_track(slot: &Mutex<Option<Arc<RTCRtpSender>>>, track: Arc<TrackLocalStaticRTP>) {
    if let Some(sender) = slot.lock().await.as_ref()
        && let Err(e) = sender.replace_track(Some(track as Arc<dyn TrackLocal + Send + Sync>)).await
    {
        warn!(%e, "ReplaceTrack on newly added subscriber failed");
    }
}

fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>, events: Arc<dyn RelayRoomEvents>) {
    tokio::spawn(async move {
        let mut last_request: Option<Instant> = None;
        while let Ok((packets, _)) = sender.read_rtcp().await {
            for pkt in &packets {
                let pkt_any = pkt.as_any();
                let is_pli = pkt_any
                    .is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                    || pkt_any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>();
                if !is_pli {
                    continue;
                }
                let now = Instant::now();
                let should_fire = last_request.is_none_or(|t| now.duration_since(t) >= PLI_THROTTLE);
                if should_fire {
                    last_request = Some(now);
                    events.on_keyframe_request();
                }
            }
        }
    });
}

fn ice_servers_from_config(ice: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !ice.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.stun_urls.clone(),
            ..Default::default()
        });
    }
    if !ice.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone().unwrap_or_default(),
            credential: ice.turn_credential.clone().unwrap_or_default(),
        });
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_state_roundtrips_through_u8() {
        for state in [
            SubscriberState::Connecting,
            SubscriberState::Connected,
            SubscriberState::Disconnected,
            SubscriberState::Failed,
        ] {
            assert_eq!(SubscriberState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn ice_servers_from_empty_config_has_no_turn_entry() {
        let ice = IceConfig {
            stun_urls: vec!["stun:example.com:3478".to_string()],
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        };
        let servers = ice_servers_from_config(&ice);
        assert_eq!(servers.len(), 1);
    }
}
