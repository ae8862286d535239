//! Connects a "bot" identity to the cloud SFU and forwards incoming RTP
//! into the Source Switcher (§4.8).
//!
//! The concrete SFU connection (LiveKit, in `relay-node`) lives behind
//! [`SfuConnection`] so this crate never links against a specific SFU SDK —
//! the same abstraction shape as [`crate::keepalive::PingSender`] and
//! [`crate::probe::StatsSource`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use relay_protocol::error::RelayError;

use crate::switcher::{MediaKind, Source, SourceSwitcher};

const DISABLE_ENABLE_GAP: Duration = Duration::from_millis(50);
const KEYFRAME_REQUEST_THROTTLE: Duration = Duration::from_millis(200);
const QUALITY_RAMPUP_DELAYS: [Duration; 3] = [Duration::ZERO, Duration::from_millis(500), Duration::from_secs(2)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackQuality {
    Low,
    Medium,
    High,
}

/// Abstracts the cloud SFU connection: bot-identity auth, per-track
/// subscription control, and quality requests. The concrete implementation
/// also owns the RTP read loop and pushes what it reads through the
/// `SfuEvent` channel passed to [`Bridge::run`] — this trait only covers the
/// outbound control calls.
#[async_trait]
pub trait SfuConnection: Send + Sync {
    async fn connect(&self, token: &str) -> Result<(), RelayError>;
    async fn disconnect(&self);
    async fn set_subscribed(&self, track_sid: &str, subscribed: bool) -> Result<(), RelayError>;
    async fn request_quality(&self, track_sid: &str, quality: TrackQuality) -> Result<(), RelayError>;
}

/// Inbound traffic from the concrete SFU connection.
#[derive(Debug, Clone)]
pub enum SfuEvent {
    TrackSubscribed {
        track_sid: String,
        kind: MediaKind,
        codec: RTCRtpCodecCapability,
        ssrc: u32,
    },
    TrackUnsubscribed {
        track_sid: String,
    },
    RtpPacket {
        kind: MediaKind,
        packet: rtp::packet::Packet,
    },
    Disconnected {
        reason: String,
    },
}

struct TrackState {
    track_sid: Mutex<Option<String>>,
    ssrc: Mutex<Option<u32>>,
}

impl TrackState {
    fn empty() -> Self {
        Self {
            track_sid: Mutex::new(None),
            ssrc: Mutex::new(None),
        }
    }
}

/// One bridge connection per Coordinator (§9 "Singletons / global state" —
/// the Bridge is owned by its Coordinator rather than kept in a global
/// registry keyed by room id).
pub struct Bridge {
    connection: Arc<dyn SfuConnection>,
    switcher: Arc<SourceSwitcher>,
    video: TrackState,
    audio: TrackState,
    connected: AtomicBool,
    last_keyframe_request: Mutex<Option<Instant>>,
    on_error: Box<dyn Fn(RelayError) + Send + Sync>,
}

impl Bridge {
    pub fn new(
        connection: Arc<dyn SfuConnection>,
        switcher: Arc<SourceSwitcher>,
        on_error: impl Fn(RelayError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            connection,
            switcher,
            video: TrackState::empty(),
            audio: TrackState::empty(),
            connected: AtomicBool::new(false),
            last_keyframe_request: Mutex::new(None),
            on_error: Box::new(on_error),
        }
    }

    /// Connects using a bot token supplied by the embedding application at
    /// `Start`/bridge-connect time (§9 "Bot identity / multi-room" — this
    /// crate never mints the token itself). The bot subscribes hidden,
    /// subscribe-only, to exactly the room's one audio and one video track;
    /// that identity shaping happens inside the concrete `SfuConnection`.
    pub async fn connect(&self, token: &str) -> Result<(), RelayError> {
        self.connection.connect(token).await.inspect_err(|e| {
            (self.on_error)(RelayError::Connection(e.to_string()));
        })?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Disconnect from the SFU. Per §4.8's failure semantics this does not
    /// tear down the Relay Room — subscribers stay attached and freeze on
    /// the Switcher's last frame until reconnect or a source change.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drives the bridge's reaction to SFU events until `events` closes
    /// (spawned as its own task by the Coordinator, §5).
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<SfuEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&self, event: SfuEvent) {
        match event {
            SfuEvent::TrackSubscribed { track_sid, kind, codec, ssrc } => {
                self.handle_track_subscribed(track_sid, kind, codec, ssrc).await;
            }
            SfuEvent::TrackUnsubscribed { track_sid } => {
                self.forget_track(&track_sid).await;
            }
            SfuEvent::RtpPacket { kind, packet } => {
                self.switcher.write_packet(Source::Sfu, kind, &packet).await;
            }
            SfuEvent::Disconnected { reason } => {
                self.connected.store(false, Ordering::SeqCst);
                (self.on_error)(RelayError::Connection(reason));
            }
        }
    }

    async fn handle_track_subscribed(&self, track_sid: String, kind: MediaKind, codec: RTCRtpCodecCapability, ssrc: u32) {
        let state = self.track_state(kind);
        *state.track_sid.lock().await = Some(track_sid.clone());
        *state.ssrc.lock().await = Some(ssrc);

        match kind {
            MediaKind::Video => self.switcher.set_video_codec(codec).await,
            MediaKind::Audio => self.switcher.set_audio_codec(codec).await,
        }

        let connection = self.connection.clone();
        tokio::spawn(async move {
            for delay in QUALITY_RAMPUP_DELAYS {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if let Err(e) = connection.request_quality(&track_sid, TrackQuality::High).await {
                    warn!(%e, track_sid, "HIGH quality request failed");
                }
            }
        });
    }

    async fn forget_track(&self, track_sid: &str) {
        for state in [&self.video, &self.audio] {
            let mut slot = state.track_sid.lock().await;
            if slot.as_deref() == Some(track_sid) {
                *slot = None;
            }
        }
    }

    fn track_state(&self, kind: MediaKind) -> &TrackState {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    /// Forces a fresh I-frame by disabling and re-enabling the video
    /// subscription with a 50 ms gap, globally throttled to 200 ms so a
    /// burst of subscriber PLIs collapses into one upstream request.
    pub async fn request_keyframe(&self) {
        {
            let mut last = self.last_keyframe_request.lock().await;
            let now = Instant::now();
            if last.is_some_and(|t| now.duration_since(t) < KEYFRAME_REQUEST_THROTTLE) {
                return;
            }
            *last = Some(now);
        }
        let Some(track_sid) = self.video.track_sid.lock().await.clone() else {
            return;
        };
        if let Err(e) = self.connection.set_subscribed(&track_sid, false).await {
            warn!(%e, "disable subscription for keyframe request failed");
            return;
        }
        tokio::time::sleep(DISABLE_ENABLE_GAP).await;
        if let Err(e) = self.connection.set_subscribed(&track_sid, true).await {
            warn!(%e, "re-enable subscription for keyframe request failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switcher::SwitcherEvents;
    use relay_protocol::config::SwitcherConfig;
    use std::sync::Mutex as StdMutex;
    use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
    use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

    struct RecordingConnection {
        subscribed_calls: StdMutex<Vec<(String, bool)>>,
        quality_calls: StdMutex<Vec<(String, TrackQuality)>>,
    }

    impl RecordingConnection {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                subscribed_calls: StdMutex::new(Vec::new()),
                quality_calls: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SfuConnection for RecordingConnection {
        async fn connect(&self, _token: &str) -> Result<(), RelayError> {
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn set_subscribed(&self, track_sid: &str, subscribed: bool) -> Result<(), RelayError> {
            self.subscribed_calls.lock().unwrap().push((track_sid.to_string(), subscribed));
            Ok(())
        }
        async fn request_quality(&self, track_sid: &str, quality: TrackQuality) -> Result<(), RelayError> {
            self.quality_calls.lock().unwrap().push((track_sid.to_string(), quality));
            Ok(())
        }
    }

    struct NullEvents;
    impl SwitcherEvents for NullEvents {
        fn on_source_changed(&self, _source: Source) {}
        fn on_track_changed(&self, _video: Arc<TrackLocalStaticRTP>, _audio: Arc<TrackLocalStaticRTP>) {}
    }

    fn test_switcher() -> Arc<SourceSwitcher> {
        Arc::new(SourceSwitcher::new(
            &SwitcherConfig {
                video_clock_rate: 90000,
                video_frame_interval: 3000,
                audio_clock_rate: 48000,
                audio_frame_interval: 960,
            },
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            Arc::new(NullEvents),
        ))
    }

    #[tokio::test]
    async fn keyframe_request_is_throttled() {
        let connection = RecordingConnection::new();
        let bridge = Bridge::new(connection.clone(), test_switcher(), |_| {});
        *bridge.video.track_sid.lock().await = Some("video-track".to_string());

        bridge.request_keyframe().await;
        bridge.request_keyframe().await;

        let calls = connection.subscribed_calls.lock().unwrap();
        assert_eq!(calls.len(), 2, "second call within the throttle window must be dropped");
        assert_eq!(calls[0], ("video-track".to_string(), false));
        assert_eq!(calls[1], ("video-track".to_string(), true));
    }

    #[tokio::test]
    async fn keyframe_request_without_video_track_is_a_no_op() {
        let connection = RecordingConnection::new();
        let bridge = Bridge::new(connection.clone(), test_switcher(), |_| {});
        bridge.request_keyframe().await;
        assert!(connection.subscribed_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_reports_error_and_clears_connected_flag() {
        let connection = RecordingConnection::new();
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let errors_clone = errors.clone();
        let bridge = Arc::new(Bridge::new(connection, test_switcher(), move |e| {
            errors_clone.lock().unwrap().push(e.to_string());
        }));
        bridge.connected.store(true, Ordering::SeqCst);
        bridge.handle_event(SfuEvent::Disconnected { reason: "ws closed".to_string() }).await;
        assert!(!bridge.is_connected());
        assert_eq!(errors.lock().unwrap().len(), 1);
    }
}
