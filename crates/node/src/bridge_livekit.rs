//! LiveKit-backed `SfuConnection` (§10.1). Connects the bot identity to the
//! room with `auto_subscribe` so the Relay Room's inputs come from whatever
//! the SFU publishes, then forwards track subscription and RTP events into
//! the channel the Coordinator was built with. `Bridge` (relay-core) owns
//! the quality-rampup and keyframe-request policy; this type only speaks
//! LiveKit's wire protocol.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use livekit::prelude::*;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use relay_core::bridge::{SfuConnection, SfuEvent, TrackQuality};
use relay_core::switcher::MediaKind;
use relay_protocol::error::RelayError;

pub(crate) struct LiveKitConnection {
    url: String,
    room: Mutex<Option<Arc<Room>>>,
    publications: Arc<Mutex<HashMap<String, RemoteTrackPublication>>>,
    events_tx: mpsc::Sender<SfuEvent>,
}

impl LiveKitConnection {
    pub(crate) fn new(url: impl Into<String>, events_tx: mpsc::Sender<SfuEvent>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            room: Mutex::new(None),
            publications: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
        })
    }
}

#[async_trait]
impl SfuConnection for LiveKitConnection {
    /// Joins as a hidden, subscribe-only participant (§4.8) using the
    /// bot-identity token minted by the embedding application.
    async fn connect(&self, token: &str) -> Result<(), RelayError> {
        let options = RoomOptions { auto_subscribe: true, ..Default::default() };
        let (room, mut room_events) = Room::connect(&self.url, token, options)
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))?;
        let room = Arc::new(room);
        *self.room.lock().await = Some(room.clone());

        let events_tx = self.events_tx.clone();
        let publications = self.publications.clone();
        tokio::spawn(async move {
            while let Some(event) = room_events.recv().await {
                handle_room_event(event, &events_tx, &publications).await;
            }
        });

        info!(url = %self.url, "connected to livekit room");
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(room) = self.room.lock().await.take() {
            room.close().await.ok();
        }
        self.publications.lock().await.clear();
    }

    async fn set_subscribed(&self, track_sid: &str, subscribed: bool) -> Result<(), RelayError> {
        let publications = self.publications.lock().await;
        let Some(publication) = publications.get(track_sid) else {
            return Err(RelayError::not_found("track", track_sid.to_string()));
        };
        publication.set_subscribed(subscribed);
        Ok(())
    }

    async fn request_quality(&self, track_sid: &str, quality: TrackQuality) -> Result<(), RelayError> {
        let publications = self.publications.lock().await;
        let Some(publication) = publications.get(track_sid) else {
            return Err(RelayError::not_found("track", track_sid.to_string()));
        };
        publication.set_video_quality(match quality {
            TrackQuality::Low => VideoQuality::Low,
            TrackQuality::Medium => VideoQuality::Medium,
            TrackQuality::High => VideoQuality::High,
        });
        Ok(())
    }
}

async fn handle_room_event(
    event: RoomEvent,
    events_tx: &mpsc::Sender<SfuEvent>,
    publications: &Arc<Mutex<HashMap<String, RemoteTrackPublication>>>,
) {
    match event {
        RoomEvent::TrackSubscribed { track, publication, .. } => {
            let track_sid = publication.sid().to_string();
            publications.lock().await.insert(track_sid.clone(), publication);

            let (kind, rtc_track) = match &track {
                RemoteTrack::Audio(t) => (MediaKind::Audio, t.rtc_track()),
                RemoteTrack::Video(t) => (MediaKind::Video, t.rtc_track()),
            };
            let ssrc = rtc_track.ssrc();
            let codec = rtc_track.codec().capability;
            let _ = events_tx
                .send(SfuEvent::TrackSubscribed { track_sid: track_sid.clone(), kind, codec, ssrc })
                .await;

            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                loop {
                    match rtc_track.read_rtp().await {
                        Ok((packet, _attributes)) => {
                            if events_tx.send(SfuEvent::RtpPacket { kind, packet }).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(%e, %track_sid, "livekit rtp read loop ended");
                            return;
                        }
                    }
                }
            });
        }
        RoomEvent::TrackUnsubscribed { publication, .. } => {
            let track_sid = publication.sid().to_string();
            publications.lock().await.remove(&track_sid);
            let _ = events_tx.send(SfuEvent::TrackUnsubscribed { track_sid }).await;
        }
        RoomEvent::Disconnected { reason } => {
            let _ = events_tx.send(SfuEvent::Disconnected { reason: format!("{reason:?}") }).await;
        }
        _ => {}
    }
}
