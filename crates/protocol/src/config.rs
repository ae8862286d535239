use serde::{Deserialize, Serialize};

/// Top-level relay configuration (§6 "Config keys", §10.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub switcher: SwitcherConfig,
    #[serde(default)]
    pub jitter_buffer: JitterBufferConfig,
    #[serde(default)]
    pub ice: IceConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keepalive: KeepaliveConfig::default(),
            failover: FailoverConfig::default(),
            election: ElectionConfig::default(),
            switcher: SwitcherConfig::default(),
            jitter_buffer: JitterBufferConfig::default(),
            ice: IceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_keepalive_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_keepalive_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_keepalive_interval_ms(),
            timeout_ms: default_keepalive_timeout_ms(),
            slow_threshold_ms: default_slow_threshold_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_backoff_per_point_ms")]
    pub backoff_per_point_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            backoff_per_point_ms: default_backoff_per_point_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            claim_timeout_ms: default_claim_timeout_ms(),
            offline_threshold: default_offline_threshold(),
        }
    }
}

/// Election scoring weights and quality breakpoints (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    #[serde(default = "default_election_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub device_weights: DeviceWeights,
    #[serde(default)]
    pub link_weights: LinkWeights,
    #[serde(default)]
    pub power_weights: PowerWeights,
    /// Relative contribution of each scoring term; need not sum to 1.0 but
    /// by convention do, so the combined score stays within the same 0..100
    /// scale as its components.
    #[serde(default)]
    pub term_weights: TermWeights,
    #[serde(default)]
    pub quality: QualityBreakpoints,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_election_interval_ms(),
            device_weights: DeviceWeights::default(),
            link_weights: LinkWeights::default(),
            power_weights: PowerWeights::default(),
            term_weights: TermWeights::default(),
            quality: QualityBreakpoints::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceWeights {
    #[serde(default = "default_100")]
    pub pc: f64,
    #[serde(default = "default_70")]
    pub tablet: f64,
    #[serde(default = "default_40")]
    pub mobile: f64,
    #[serde(default = "default_50")]
    pub unknown: f64,
}

impl Default for DeviceWeights {
    fn default() -> Self {
        Self {
            pc: default_100(),
            tablet: default_70(),
            mobile: default_40(),
            unknown: default_50(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinkWeights {
    #[serde(default = "default_100")]
    pub ethernet: f64,
    #[serde(default = "default_70")]
    pub wifi: f64,
    #[serde(default = "default_30")]
    pub cellular: f64,
    #[serde(default = "default_50")]
    pub unknown: f64,
}

impl Default for LinkWeights {
    fn default() -> Self {
        Self {
            ethernet: default_100(),
            wifi: default_70(),
            cellular: default_30(),
            unknown: default_50(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PowerWeights {
    #[serde(default = "default_100")]
    pub plugged: f64,
    #[serde(default = "default_60")]
    pub battery: f64,
}

impl Default for PowerWeights {
    fn default() -> Self {
        Self {
            plugged: default_100(),
            battery: default_60(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TermWeights {
    #[serde(default = "default_term_weight_structural")]
    pub device: f64,
    #[serde(default = "default_term_weight_structural")]
    pub link: f64,
    #[serde(default = "default_term_weight_power")]
    pub power: f64,
    #[serde(default = "default_term_weight_quality")]
    pub quality: f64,
}

impl Default for TermWeights {
    fn default() -> Self {
        Self {
            device: default_term_weight_structural(),
            link: default_term_weight_structural(),
            power: default_term_weight_power(),
            quality: default_term_weight_quality(),
        }
    }
}

/// Latency/loss/jitter breakpoints for the quality subscore (§4.2): full
/// quality at or below the floor, `quality_penalty_cap` at or above the
/// ceiling, linear in between.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityBreakpoints {
    #[serde(default = "default_latency_floor_ms")]
    pub latency_floor_ms: f64,
    #[serde(default = "default_latency_ceiling_ms")]
    pub latency_ceiling_ms: f64,
    #[serde(default = "default_loss_floor_pct")]
    pub loss_floor_pct: f64,
    #[serde(default = "default_loss_ceiling_pct")]
    pub loss_ceiling_pct: f64,
    #[serde(default = "default_jitter_floor_ms")]
    pub jitter_floor_ms: f64,
    #[serde(default = "default_jitter_ceiling_ms")]
    pub jitter_ceiling_ms: f64,
    #[serde(default = "default_quality_floor")]
    pub quality_floor: f64,
    #[serde(default = "default_quality_penalty_cap")]
    pub quality_penalty_cap: f64,
}

impl Default for QualityBreakpoints {
    fn default() -> Self {
        Self {
            latency_floor_ms: default_latency_floor_ms(),
            latency_ceiling_ms: default_latency_ceiling_ms(),
            loss_floor_pct: default_loss_floor_pct(),
            loss_ceiling_pct: default_loss_ceiling_pct(),
            jitter_floor_ms: default_jitter_floor_ms(),
            jitter_ceiling_ms: default_jitter_ceiling_ms(),
            quality_floor: default_quality_floor(),
            quality_penalty_cap: default_quality_penalty_cap(),
        }
    }
}

/// RTP rewrite frame intervals per media kind (§4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SwitcherConfig {
    #[serde(default = "default_video_clock_rate")]
    pub video_clock_rate: u32,
    #[serde(default = "default_video_frame_interval")]
    pub video_frame_interval: u32,
    #[serde(default = "default_audio_clock_rate")]
    pub audio_clock_rate: u32,
    #[serde(default = "default_audio_frame_interval")]
    pub audio_frame_interval: u32,
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        Self {
            video_clock_rate: default_video_clock_rate(),
            video_frame_interval: default_video_frame_interval(),
            audio_clock_rate: default_audio_clock_rate(),
            audio_frame_interval: default_audio_frame_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JitterBufferConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_jb_min_delay_ms")]
    pub min_delay_ms: u32,
    #[serde(default = "default_jb_target_delay_ms")]
    pub target_delay_ms: u32,
    #[serde(default = "default_jb_max_delay_ms")]
    pub max_delay_ms: u32,
    #[serde(default = "default_jb_max_packets")]
    pub max_packets: u32,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_delay_ms: default_jb_min_delay_ms(),
            target_delay_ms: default_jb_target_delay_ms(),
            max_delay_ms: default_jb_max_delay_ms(),
            max_packets: default_jb_max_packets(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl RelayConfig {
    /// Validate the configuration, returning all issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal) or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.keepalive.interval_ms == 0 {
            issues.push("ERROR: keepalive.interval_ms must be >= 1.".to_string());
        }
        if self.keepalive.timeout_ms <= self.keepalive.interval_ms {
            issues.push(format!(
                "ERROR: keepalive.timeout_ms ({}) must be greater than keepalive.interval_ms ({}), \
                 or every peer trips offline before its first ping round-trips.",
                self.keepalive.timeout_ms, self.keepalive.interval_ms
            ));
        }
        if self.keepalive.max_retries == 0 {
            issues.push(
                "WARNING: keepalive.max_retries is 0 — a single missed pong classifies offline."
                    .to_string(),
            );
        }

        if self.failover.offline_threshold == 0 {
            issues.push("ERROR: failover.offline_threshold must be >= 1.".to_string());
        }
        if self.failover.max_backoff_ms == 0 {
            issues.push("ERROR: failover.max_backoff_ms must be >= 1.".to_string());
        }

        if self.election.interval_ms == 0 {
            issues.push("ERROR: election.interval_ms must be >= 1.".to_string());
        }
        let q = &self.election.quality;
        if q.latency_ceiling_ms <= q.latency_floor_ms {
            issues.push(
                "ERROR: election.quality.latency_ceiling_ms must exceed latency_floor_ms."
                    .to_string(),
            );
        }
        if q.loss_ceiling_pct <= q.loss_floor_pct {
            issues.push(
                "ERROR: election.quality.loss_ceiling_pct must exceed loss_floor_pct.".to_string(),
            );
        }
        if q.jitter_ceiling_ms <= q.jitter_floor_ms {
            issues.push(
                "ERROR: election.quality.jitter_ceiling_ms must exceed jitter_floor_ms."
                    .to_string(),
            );
        }
        if q.quality_penalty_cap > q.quality_floor {
            issues.push(
                "WARNING: election.quality.quality_penalty_cap is greater than quality_floor — \
                 the penalty cap should be the worst-case score, not the best."
                    .to_string(),
            );
        }

        if self.switcher.video_clock_rate == 0 || self.switcher.audio_clock_rate == 0 {
            issues.push("ERROR: switcher clock rates must be >= 1.".to_string());
        }

        if self.jitter_buffer.enabled
            && self.jitter_buffer.min_delay_ms > self.jitter_buffer.max_delay_ms
        {
            issues.push(
                "ERROR: jitter_buffer.min_delay_ms must not exceed jitter_buffer.max_delay_ms."
                    .to_string(),
            );
        }

        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{url}' must start with 'stun:' or 'stuns:'."
                ));
            }
        }
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{url}' must start with 'turn:' or 'turns:'."
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_keepalive_interval_ms() -> u64 {
    3000
}
fn default_keepalive_timeout_ms() -> u64 {
    10_000
}
fn default_slow_threshold_ms() -> u64 {
    3000
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_per_point_ms() -> u64 {
    10
}
fn default_max_backoff_ms() -> u64 {
    2000
}
fn default_claim_timeout_ms() -> u64 {
    500
}
fn default_offline_threshold() -> u32 {
    2
}
fn default_election_interval_ms() -> u64 {
    5000
}
fn default_100() -> f64 {
    100.0
}
fn default_70() -> f64 {
    70.0
}
fn default_60() -> f64 {
    60.0
}
fn default_50() -> f64 {
    50.0
}
fn default_40() -> f64 {
    40.0
}
fn default_30() -> f64 {
    30.0
}
fn default_term_weight_structural() -> f64 {
    0.25
}
fn default_term_weight_power() -> f64 {
    0.15
}
fn default_term_weight_quality() -> f64 {
    0.35
}
fn default_latency_floor_ms() -> f64 {
    50.0
}
fn default_latency_ceiling_ms() -> f64 {
    300.0
}
fn default_loss_floor_pct() -> f64 {
    0.0
}
fn default_loss_ceiling_pct() -> f64 {
    5.0
}
fn default_jitter_floor_ms() -> f64 {
    20.0
}
fn default_jitter_ceiling_ms() -> f64 {
    100.0
}
fn default_quality_floor() -> f64 {
    100.0
}
fn default_quality_penalty_cap() -> f64 {
    80.0
}
fn default_video_clock_rate() -> u32 {
    90_000
}
fn default_video_frame_interval() -> u32 {
    3000
}
fn default_audio_clock_rate() -> u32 {
    48_000
}
fn default_audio_frame_interval() -> u32 {
    960
}
fn default_jb_min_delay_ms() -> u32 {
    20
}
fn default_jb_target_delay_ms() -> u32 {
    60
}
fn default_jb_max_delay_ms() -> u32 {
    200
}
fn default_jb_max_packets() -> u32 {
    500
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
