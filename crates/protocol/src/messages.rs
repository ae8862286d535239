use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::peer::{DeviceClass, LinkClass, PowerState};

/// Signaling messages exchanged over the abstract reliable broadcast channel
/// (§4.1). JSON objects tagged by `type`, with `roomId`/`peerId`/`targetPeerId`
/// and a payload shaped by the variant.
///
/// Unknown `type` values deserialize as [`SignalingMessage::Error`] — the
/// core never branches on a raw string past this parser (§9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    Join {
        room_id: String,
        peer_id: String,
        device_class: DeviceClass,
        link_class: LinkClass,
        power_state: PowerState,
    },
    Leave {
        room_id: String,
        peer_id: String,
    },
    Ping {
        room_id: String,
        peer_id: String,
        target_peer_id: Option<String>,
    },
    Pong {
        room_id: String,
        peer_id: String,
        target_peer_id: Option<String>,
    },
    RelayClaim {
        room_id: String,
        peer_id: String,
        epoch: u64,
        score: u8,
    },
    RelayChanged {
        room_id: String,
        peer_id: String,
        relay_id: String,
        epoch: u64,
        score: u8,
    },
    Offer {
        room_id: String,
        peer_id: String,
        target_peer_id: String,
        sdp: String,
    },
    Answer {
        room_id: String,
        peer_id: String,
        target_peer_id: String,
        sdp: String,
    },
    Candidate {
        room_id: String,
        peer_id: String,
        target_peer_id: String,
        candidate: String,
    },
    ScreenShare {
        room_id: String,
        peer_id: String,
        is_sharing: bool,
    },
    /// Fallback for any `type` the parser doesn't recognise. Logged and
    /// dropped by the Coordinator — never fatal (§7).
    Error {
        message: String,
    },
}

/// Inbound traffic the Coordinator reacts to: a parsed message tagged with
/// the sender's identity, or a synthetic connectivity event from the
/// transport (§4.1).
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Message {
        from: String,
        message: SignalingMessage,
    },
    PeerConnected {
        peer_id: String,
    },
    PeerDisconnected {
        peer_id: String,
    },
}

/// Abstract reliable broadcast transport (§4.1, §9 "Dynamic message typing").
///
/// The core only ever calls `send`; it never owns the inbound path directly —
/// inbound events are delivered over a channel returned by whatever
/// constructs a given implementation (see `relay-node`'s WebSocket adapter
/// for a concrete transport). Keeping the trait send-only avoids forcing an
/// owned-callback or stream type onto every implementation.
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> Result<(), RelayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_claim_tag_and_fields_are_camel_case() {
        let msg = SignalingMessage::RelayClaim {
            room_id: "r1".into(),
            peer_id: "p1".into(),
            epoch: 3,
            score: 80,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"relayClaim""#));
        assert!(json.contains(r#""roomId":"r1""#));
        assert!(json.contains(r#""peerId":"p1""#));
    }

    #[test]
    fn screen_share_tag_is_camel_case() {
        let msg = SignalingMessage::ScreenShare {
            room_id: "r1".into(),
            peer_id: "p1".into(),
            is_sharing: true,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"screenShare""#));
        assert!(json.contains(r#""isSharing":true"#));
    }

    #[test]
    fn unknown_type_parses_as_error_fallback() {
        let json = r#"{"type":"error","message":"bad thing"}"#;
        let msg: SignalingMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            SignalingMessage::Error {
                message: "bad thing".into()
            }
        );
    }

    #[test]
    fn offer_roundtrip() {
        let msg = SignalingMessage::Offer {
            room_id: "r1".into(),
            peer_id: "a".into(),
            target_peer_id: "b".into(),
            sdp: "v=0".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, parsed);
    }
}
