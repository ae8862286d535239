use serde::{Deserialize, Serialize};

/// Coarse device category, used as an election scoring input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Pc,
    Mobile,
    Tablet,
    Unknown,
}

impl Default for DeviceClass {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Coarse network link category, used as an election scoring input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkClass {
    Ethernet,
    Wifi,
    Cellular,
    Unknown,
}

impl Default for LinkClass {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Power source of the candidate's device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Plugged,
    Battery,
}

impl Default for PowerState {
    fn default() -> Self {
        Self::Battery
    }
}

/// Observed network quality for a candidate, refreshed by the Network Probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkQuality {
    pub bandwidth_kbps: u32,
    pub latency_ms: u32,
    pub packet_loss_pct: f32,
    pub jitter_ms: u32,
}

impl Default for NetworkQuality {
    /// Optimistic defaults for a peer that hasn't been probed yet — full
    /// bandwidth, zero latency/loss/jitter — so a freshly joined peer isn't
    /// penalized before its first probe sample arrives.
    fn default() -> Self {
        Self {
            bandwidth_kbps: u32::MAX,
            latency_ms: 0,
            packet_loss_pct: 0.0,
            jitter_ms: 0,
        }
    }
}

/// An election input (§3 Candidate). Rebuilt per election, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub peer_id: String,
    pub device_class: DeviceClass,
    pub link_class: LinkClass,
    pub power_state: PowerState,
    pub quality: NetworkQuality,
}

impl Candidate {
    pub fn new(peer_id: impl Into<String>, device_class: DeviceClass, link_class: LinkClass, power_state: PowerState) -> Self {
        Self {
            peer_id: peer_id.into(),
            device_class,
            link_class,
            power_state,
            quality: NetworkQuality::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_class_serializes_snake_case() {
        let json = serde_json::to_string(&DeviceClass::Pc).unwrap();
        assert_eq!(json, "\"pc\"");
    }

    #[test]
    fn candidate_defaults_to_optimistic_quality() {
        let c = Candidate::new("alice", DeviceClass::Pc, LinkClass::Ethernet, PowerState::Plugged);
        assert_eq!(c.quality.latency_ms, 0);
        assert_eq!(c.quality.packet_loss_pct, 0.0);
    }
}
