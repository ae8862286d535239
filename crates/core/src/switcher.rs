//! Owns the outbound video/audio track pair and rewrites RTP across source
//! and codec changes so subscribers never observe a sequence-number or
//! timestamp discontinuity (§4.6).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::warn;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use relay_protocol::config::SwitcherConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Sfu,
    Local,
}

impl Source {
    fn as_u8(self) -> u8 {
        match self {
            Source::Sfu => 0,
            Source::Local => 1,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Source::Local,
            _ => Source::Sfu,
        }
    }
}

const WRITE_ERROR_LOG_THROTTLE: Duration = Duration::from_secs(1);

struct RewriteState {
    sn_offset: u16,
    ts_offset: u32,
    last_output_sn: Option<u16>,
    last_output_ts: Option<u32>,
    /// True until the next packet on this kind has re-derived offsets —
    /// set on construction, on every source switch, and on a same-MIME
    /// codec rebind.
    reset_pending: bool,
}

impl RewriteState {
    fn fresh() -> Self {
        Self {
            sn_offset: 0,
            ts_offset: 0,
            last_output_sn: None,
            last_output_ts: None,
            reset_pending: true,
        }
    }
}

struct KindState {
    track: RwLock<Arc<TrackLocalStaticRTP>>,
    rewrite: Mutex<RewriteState>,
    frame_interval: u32,
    last_write_error_log: Mutex<Option<Instant>>,
}

/// Callbacks fired by the Switcher, invoked outside its locks (§4.6, §5).
pub trait SwitcherEvents: Send + Sync {
    fn on_source_changed(&self, source: Source);
    fn on_track_changed(&self, video: Arc<TrackLocalStaticRTP>, audio: Arc<TrackLocalStaticRTP>);
}

pub struct SourceSwitcher {
    video: KindState,
    audio: KindState,
    active: AtomicU8,
    sharer: Mutex<Option<String>>,
    events: Arc<dyn SwitcherEvents>,
}

impl SourceSwitcher {
    pub fn new(
        config: &SwitcherConfig,
        video_codec: RTCRtpCodecCapability,
        audio_codec: RTCRtpCodecCapability,
        events: Arc<dyn SwitcherEvents>,
    ) -> Self {
        Self {
            video: KindState {
                track: RwLock::new(Arc::new(TrackLocalStaticRTP::new(
                    video_codec,
                    "video".to_string(),
                    "relay".to_string(),
                ))),
                rewrite: Mutex::new(RewriteState::fresh()),
                frame_interval: config.video_frame_interval,
                last_write_error_log: Mutex::new(None),
            },
            audio: KindState {
                track: RwLock::new(Arc::new(TrackLocalStaticRTP::new(
                    audio_codec,
                    "audio".to_string(),
                    "relay".to_string(),
                ))),
                rewrite: Mutex::new(RewriteState::fresh()),
                frame_interval: config.audio_frame_interval,
                last_write_error_log: Mutex::new(None),
            },
            active: AtomicU8::new(Source::Sfu.as_u8()),
            sharer: Mutex::new(None),
            events,
        }
    }

    fn kind_state(&self, kind: MediaKind) -> &KindState {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    pub fn active_source(&self) -> Source {
        Source::from_u8(self.active.load(Ordering::SeqCst))
    }

    pub async fn current_tracks(&self) -> (Arc<TrackLocalStaticRTP>, Arc<TrackLocalStaticRTP>) {
        (self.video.track.read().await.clone(), self.audio.track.read().await.clone())
    }

    pub async fn video_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.video.track.read().await.clone()
    }

    pub async fn audio_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.audio.track.read().await.clone()
    }

    /// Write path (§4.6): drops the packet if `input` isn't the active
    /// source, else rewrites sn/ts so the outbound stream stays monotonic
    /// (I1) and writes it to the current track object for `kind`.
    pub async fn write_packet(&self, input: Source, kind: MediaKind, packet: &rtp::packet::Packet) {
        if input != self.active_source() {
            return;
        }
        let kind_state = self.kind_state(kind);
        let (output_sn, output_ts) = {
            let mut rewrite = kind_state.rewrite.lock().await;
            if rewrite.reset_pending {
                match (rewrite.last_output_sn, rewrite.last_output_ts) {
                    (Some(last_sn), Some(last_ts)) => {
                        rewrite.sn_offset = last_sn.wrapping_add(1).wrapping_sub(packet.header.sequence_number);
                        rewrite.ts_offset = last_ts
                            .wrapping_add(kind_state.frame_interval)
                            .wrapping_sub(packet.header.timestamp);
                    }
                    _ => {
                        rewrite.sn_offset = 0;
                        rewrite.ts_offset = 0;
                    }
                }
                rewrite.reset_pending = false;
            }
            let output_sn = packet.header.sequence_number.wrapping_add(rewrite.sn_offset);
            let output_ts = packet.header.timestamp.wrapping_add(rewrite.ts_offset);
            rewrite.last_output_sn = Some(output_sn);
            rewrite.last_output_ts = Some(output_ts);
            (output_sn, output_ts)
        };

        let track = kind_state.track.read().await.clone();
        let mut outbound = packet.clone();
        outbound.header.sequence_number = output_sn;
        outbound.header.timestamp = output_ts;
        if let Err(err) = track.write_rtp(&outbound).await {
            self.log_write_error(kind, kind_state, err).await;
        }
    }

    async fn log_write_error(&self, kind: MediaKind, kind_state: &KindState, err: webrtc::Error) {
        let mut last_log = kind_state.last_write_error_log.lock().await;
        let now = Instant::now();
        let should_log = last_log.is_none_or(|t| now.duration_since(t) >= WRITE_ERROR_LOG_THROTTLE);
        if should_log {
            warn!(?kind, %err, "WriteRTP failed");
            *last_log = Some(now);
        }
    }

    async fn mark_reset_pending(&self) {
        self.video.rewrite.lock().await.reset_pending = true;
        self.audio.rewrite.lock().await.reset_pending = true;
    }

    pub async fn start_local_share(&self, sharer_id: impl Into<String>) {
        self.active.store(Source::Local.as_u8(), Ordering::SeqCst);
        *self.sharer.lock().await = Some(sharer_id.into());
        self.mark_reset_pending().await;
        self.events.on_source_changed(Source::Local);
    }

    pub async fn stop_local_share(&self) {
        self.active.store(Source::Sfu.as_u8(), Ordering::SeqCst);
        *self.sharer.lock().await = None;
        self.mark_reset_pending().await;
        self.events.on_source_changed(Source::Sfu);
    }

    /// Idempotent explicit override — a no-op if `source` is already active.
    pub async fn switch_to_source(&self, source: Source) {
        if self.active_source() == source {
            return;
        }
        self.active.store(source.as_u8(), Ordering::SeqCst);
        if source != Source::Local {
            *self.sharer.lock().await = None;
        }
        self.mark_reset_pending().await;
        self.events.on_source_changed(source);
    }

    pub async fn local_sharer(&self) -> Option<String> {
        self.sharer.lock().await.clone()
    }

    pub async fn set_video_codec(&self, capability: RTCRtpCodecCapability) {
        self.set_codec(MediaKind::Video, capability).await;
    }

    pub async fn set_audio_codec(&self, capability: RTCRtpCodecCapability) {
        self.set_codec(MediaKind::Audio, capability).await;
    }

    async fn set_codec(&self, kind: MediaKind, capability: RTCRtpCodecCapability) {
        let kind_state = self.kind_state(kind);
        let same_mime = kind_state.track.read().await.codec().mime_type == capability.mime_type;
        if same_mime {
            kind_state.rewrite.lock().await.reset_pending = true;
        } else {
            let id = match kind {
                MediaKind::Video => "video",
                MediaKind::Audio => "audio",
            };
            let new_track = Arc::new(TrackLocalStaticRTP::new(capability, id.to_string(), "relay".to_string()));
            *kind_state.track.write().await = new_track;
            *kind_state.rewrite.lock().await = RewriteState::fresh();
        }
        let (video, audio) = self.current_tracks().await;
        self.events.on_track_changed(video, audio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};

    struct RecordingEvents {
        source_changes: StdMutex<Vec<Source>>,
        track_changes: StdMutex<u32>,
    }

    impl RecordingEvents {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                source_changes: StdMutex::new(Vec::new()),
                track_changes: StdMutex::new(0),
            })
        }
    }

    impl SwitcherEvents for RecordingEvents {
        fn on_source_changed(&self, source: Source) {
            self.source_changes.lock().unwrap().push(source);
        }

        fn on_track_changed(&self, _video: Arc<TrackLocalStaticRTP>, _audio: Arc<TrackLocalStaticRTP>) {
            *self.track_changes.lock().unwrap() += 1;
        }
    }

    fn video_cap() -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        }
    }

    fn audio_cap() -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        }
    }

    fn packet(sn: u16, ts: u32) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                sequence_number: sn,
                timestamp: ts,
                ..Default::default()
            },
            payload: bytes::Bytes::from_static(b"x"),
        }
    }

    async fn last_output(switcher: &SourceSwitcher, kind: MediaKind) -> (u16, u32) {
        let state = switcher.kind_state(kind);
        let rewrite = state.rewrite.lock().await;
        (rewrite.last_output_sn.unwrap(), rewrite.last_output_ts.unwrap())
    }

    fn new_switcher() -> SourceSwitcher {
        SourceSwitcher::new(
            &SwitcherConfig {
                video_clock_rate: 90000,
                video_frame_interval: 3000,
                audio_clock_rate: 48000,
                audio_frame_interval: 960,
            },
            video_cap(),
            audio_cap(),
            RecordingEvents::new(),
        )
    }

    /// The very first packet ever written on a kind starts at a zero offset.
    #[tokio::test]
    async fn first_packet_has_zero_offset() {
        let switcher = new_switcher();
        switcher.write_packet(Source::Sfu, MediaKind::Video, &packet(1000, 90000)).await;
        assert_eq!(last_output(&switcher, MediaKind::Video).await, (1000, 90000));
    }

    /// Codec rebind to the same MIME type re-derives offsets, keeping
    /// sn/ts continuous with the prior output.
    #[tokio::test]
    async fn codec_rebind_keeps_continuity() {
        let switcher = new_switcher();
        switcher.write_packet(Source::Sfu, MediaKind::Video, &packet(999, 87000)).await;
        assert_eq!(last_output(&switcher, MediaKind::Video).await, (999, 87000));
        // Force state to the scenario's starting point.
        {
            let mut rewrite = switcher.video.rewrite.lock().await;
            rewrite.last_output_sn = Some(1000);
            rewrite.last_output_ts = Some(90000);
        }
        switcher.set_video_codec(video_cap()).await;

        switcher.write_packet(Source::Sfu, MediaKind::Video, &packet(200, 4_500_000)).await;
        assert_eq!(last_output(&switcher, MediaKind::Video).await, (1001, 93000));

        switcher.write_packet(Source::Sfu, MediaKind::Video, &packet(201, 4_503_000)).await;
        assert_eq!(last_output(&switcher, MediaKind::Video).await, (1002, 96000));
    }

    /// Screen-share takeover drops the next SFU packet and resyncs on
    /// the first Local packet, then resyncs again on stop.
    #[tokio::test]
    async fn screen_share_takeover_resyncs_on_each_switch() {
        let switcher = new_switcher();
        switcher.write_packet(Source::Sfu, MediaKind::Video, &packet(500, 45000)).await;
        assert_eq!(last_output(&switcher, MediaKind::Video).await, (500, 45000));

        switcher.start_local_share("alice").await;
        switcher.write_packet(Source::Sfu, MediaKind::Video, &packet(501, 48000)).await;
        assert_eq!(
            last_output(&switcher, MediaKind::Video).await,
            (500, 45000),
            "SFU packets must be dropped while Local is active"
        );

        switcher.write_packet(Source::Local, MediaKind::Video, &packet(50, 7000)).await;
        assert_eq!(last_output(&switcher, MediaKind::Video).await, (501, 48000));

        switcher.stop_local_share().await;
        switcher.write_packet(Source::Sfu, MediaKind::Video, &packet(600, 60000)).await;
        let (sn, ts) = last_output(&switcher, MediaKind::Video).await;
        assert_eq!(sn, 502);
        assert_eq!(ts, 51000);
    }

    #[tokio::test]
    async fn switch_to_source_is_idempotent() {
        let events = RecordingEvents::new();
        let switcher = SourceSwitcher::new(
            &SwitcherConfig {
                video_clock_rate: 90000,
                video_frame_interval: 3000,
                audio_clock_rate: 48000,
                audio_frame_interval: 960,
            },
            video_cap(),
            audio_cap(),
            events.clone(),
        );
        switcher.switch_to_source(Source::Sfu).await;
        assert!(events.source_changes.lock().unwrap().is_empty());
        switcher.switch_to_source(Source::Local).await;
        assert_eq!(events.source_changes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn different_mime_codec_swap_creates_new_track() {
        let switcher = new_switcher();
        let original = switcher.video_track().await;
        switcher.set_video_codec(RTCRtpCodecCapability {
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            ..Default::default()
        }).await;
        let replaced = switcher.video_track().await;
        assert!(!Arc::ptr_eq(&original, &replaced));
    }
}
