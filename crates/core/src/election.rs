//! Pure function from candidate set to winner (§4.2). No I/O, no locks —
//! the Coordinator decides when to call it, this module never schedules
//! itself.

use relay_protocol::config::{ElectionConfig, QualityBreakpoints};
use relay_protocol::peer::{Candidate, DeviceClass, LinkClass, NetworkQuality, PowerState};

/// Runs an election over `candidates`, returning the winning peer id and its
/// score (0..=100). `None` if `candidates` is empty.
///
/// Tie-break is (score desc, peer-id lexicographic asc) — ties are resolved
/// deterministically so two independent invocations over the same input
/// agree.
pub fn elect(candidates: &[Candidate], config: &ElectionConfig) -> Option<(String, u8)> {
    let mut best: Option<(&Candidate, f64)> = None;
    for candidate in candidates {
        let score = score_candidate(candidate, config);
        best = match best {
            None => Some((candidate, score)),
            Some((best_candidate, best_score)) => {
                if score > best_score
                    || (score == best_score && candidate.peer_id < best_candidate.peer_id)
                {
                    Some((candidate, score))
                } else {
                    Some((best_candidate, best_score))
                }
            }
        };
    }
    best.map(|(candidate, score)| (candidate.peer_id.clone(), clamp_to_u8(score)))
}

fn clamp_to_u8(score: f64) -> u8 {
    score.round().clamp(0.0, 100.0) as u8
}

fn score_candidate(candidate: &Candidate, config: &ElectionConfig) -> f64 {
    let device = device_weight(candidate.device_class, config);
    let link = link_weight(candidate.link_class, config);
    let power = power_weight(candidate.power_state, config);
    let quality = quality_subscore(&candidate.quality, &config.quality);
    let w = &config.term_weights;
    w.device * device + w.link * link + w.power * power + w.quality * quality
}

fn device_weight(class: DeviceClass, config: &ElectionConfig) -> f64 {
    match class {
        DeviceClass::Pc => config.device_weights.pc,
        DeviceClass::Tablet => config.device_weights.tablet,
        DeviceClass::Mobile => config.device_weights.mobile,
        DeviceClass::Unknown => config.device_weights.unknown,
    }
}

fn link_weight(class: LinkClass, config: &ElectionConfig) -> f64 {
    match class {
        LinkClass::Ethernet => config.link_weights.ethernet,
        LinkClass::Wifi => config.link_weights.wifi,
        LinkClass::Cellular => config.link_weights.cellular,
        LinkClass::Unknown => config.link_weights.unknown,
    }
}

fn power_weight(state: PowerState, config: &ElectionConfig) -> f64 {
    match state {
        PowerState::Plugged => config.power_weights.plugged,
        PowerState::Battery => config.power_weights.battery,
    }
}

/// Quality subscore (§4.2): full quality (`quality_floor`) at or below every
/// floor, `quality_penalty_cap` once any metric reaches its ceiling, linear
/// in between. The worst of the three metrics drives the subscore — a link
/// with great latency and 5% loss is still a bad link.
fn quality_subscore(quality: &NetworkQuality, bp: &QualityBreakpoints) -> f64 {
    let latency_penalty = linear_penalty(quality.latency_ms as f64, bp.latency_floor_ms, bp.latency_ceiling_ms);
    let loss_penalty = linear_penalty(
        quality.packet_loss_pct as f64,
        bp.loss_floor_pct,
        bp.loss_ceiling_pct,
    );
    let jitter_penalty = linear_penalty(quality.jitter_ms as f64, bp.jitter_floor_ms, bp.jitter_ceiling_ms);
    let worst = latency_penalty.max(loss_penalty).max(jitter_penalty);
    bp.quality_floor - worst * (bp.quality_floor - bp.quality_penalty_cap)
}

fn linear_penalty(value: f64, floor: f64, ceiling: f64) -> f64 {
    if value <= floor {
        0.0
    } else if value >= ceiling {
        1.0
    } else {
        (value - floor) / (ceiling - floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate_with_quality(
        peer_id: &str,
        device: DeviceClass,
        link: LinkClass,
        latency_ms: u32,
        loss_pct: f32,
        jitter_ms: u32,
    ) -> Candidate {
        let mut c = Candidate::new(peer_id, device, link, PowerState::Plugged);
        c.quality = NetworkQuality {
            bandwidth_kbps: 10_000,
            latency_ms,
            packet_loss_pct: loss_pct,
            jitter_ms,
        };
        c
    }

    /// A PC on ethernet with a clean link beats a mobile on cellular with
    /// a poor link, which in turn beats a PC on wifi with a mediocre link.
    #[test]
    fn score_ordered_election_prefers_better_device_link_and_quality() {
        let config = ElectionConfig::default();
        let a = candidate_with_quality("a", DeviceClass::Pc, LinkClass::Ethernet, 10, 0.0, 5);
        let b = candidate_with_quality("b", DeviceClass::Mobile, LinkClass::Cellular, 250, 4.0, 90);
        let c = candidate_with_quality("c", DeviceClass::Pc, LinkClass::Wifi, 80, 1.0, 30);

        let candidates = vec![a, b, c];
        let (winner, winner_score) = elect(&candidates, &config).unwrap();
        assert_eq!(winner, "a");

        let b_score = clamp_to_u8(score_candidate(&candidates[1], &config));
        let c_score = clamp_to_u8(score_candidate(&candidates[2], &config));
        assert!(winner_score > b_score);
        assert!(winner_score > c_score);
    }

    /// Equal scores resolve to the lexicographically smaller peer id.
    #[test]
    fn tie_break_prefers_smaller_peer_id() {
        let config = ElectionConfig::default();
        let a = Candidate::new("a", DeviceClass::Pc, LinkClass::Ethernet, PowerState::Plugged);
        let b = Candidate::new("b", DeviceClass::Pc, LinkClass::Ethernet, PowerState::Plugged);
        let (winner, _) = elect(&[a, b], &config).unwrap();
        assert_eq!(winner, "a");
    }

    /// Electing twice over the same input is deterministic.
    #[test]
    fn election_is_deterministic() {
        let config = ElectionConfig::default();
        let candidates = vec![
            candidate_with_quality("x", DeviceClass::Tablet, LinkClass::Wifi, 60, 0.5, 40),
            candidate_with_quality("y", DeviceClass::Pc, LinkClass::Ethernet, 20, 0.0, 10),
        ];
        let first = elect(&candidates, &config);
        let second = elect(&candidates, &config);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_candidate_set_has_no_winner() {
        let config = ElectionConfig::default();
        assert_eq!(elect(&[], &config), None);
    }
}
