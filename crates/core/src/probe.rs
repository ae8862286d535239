//! Samples a PeerConnection's transport statistics into a quality score (§4.4).

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use relay_protocol::peer::NetworkQuality;

pub const DEFAULT_PROBE_CADENCE: Duration = Duration::from_secs(1);
pub const DEFAULT_RING_SIZE: usize = 60;

/// One raw sample pulled from the WebRTC stack's transport stats. Kept
/// separate from [`NetworkQuality`] because the stack reports cumulative
/// byte counters alongside the instantaneous metrics we care about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawStatsSample {
    pub rtt_ms: u32,
    pub jitter_ms: u32,
    pub packet_loss_pct: f32,
    pub available_bandwidth_kbps: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Abstracts the concrete `RTCPeerConnection::get_stats()` call so the probe
/// is unit-testable without a real PeerConnection.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn sample(&self) -> RawStatsSample;
}

/// Rings the last `capacity` samples and exposes the latest one plus a
/// running average, firing `on_sampled` with the latest sample turned into a
/// [`NetworkQuality`] for feeding into Election.
pub struct NetworkProbe {
    source: std::sync::Arc<dyn StatsSource>,
    ring: Mutex<VecDeque<RawStatsSample>>,
    capacity: usize,
    on_sampled: Box<dyn Fn(NetworkQuality) + Send + Sync>,
}

impl NetworkProbe {
    pub fn new(
        source: std::sync::Arc<dyn StatsSource>,
        capacity: usize,
        on_sampled: impl Fn(NetworkQuality) + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            on_sampled: Box::new(on_sampled),
        }
    }

    pub async fn sample_once(&self) -> NetworkQuality {
        let sample = self.source.sample().await;
        {
            let mut ring = self.ring.lock().await;
            ring.push_back(sample);
            while ring.len() > self.capacity {
                ring.pop_front();
            }
        }
        let quality = to_quality(&sample);
        (self.on_sampled)(quality);
        quality
    }

    pub async fn latest(&self) -> Option<NetworkQuality> {
        self.ring.lock().await.back().map(to_quality)
    }

    pub async fn average(&self) -> Option<NetworkQuality> {
        let ring = self.ring.lock().await;
        if ring.is_empty() {
            return None;
        }
        let n = ring.len() as f64;
        let (mut rtt, mut jitter, mut loss, mut bw) = (0f64, 0f64, 0f64, 0f64);
        for s in ring.iter() {
            rtt += s.rtt_ms as f64;
            jitter += s.jitter_ms as f64;
            loss += s.packet_loss_pct as f64;
            bw += s.available_bandwidth_kbps as f64;
        }
        Some(NetworkQuality {
            bandwidth_kbps: (bw / n) as u32,
            latency_ms: (rtt / n) as u32,
            packet_loss_pct: (loss / n) as f32,
            jitter_ms: (jitter / n) as u32,
        })
    }

    pub async fn run(self: std::sync::Arc<Self>, cadence: Duration, mut stop: tokio::sync::oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(cadence);
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.sample_once().await; }
                _ = &mut stop => return,
            }
        }
    }
}

fn to_quality(sample: &RawStatsSample) -> NetworkQuality {
    NetworkQuality {
        bandwidth_kbps: sample.available_bandwidth_kbps,
        latency_ms: sample.rtt_ms,
        packet_loss_pct: sample.packet_loss_pct,
        jitter_ms: sample.jitter_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FixedSource {
        rtt_ms: AtomicU32,
    }

    #[async_trait]
    impl StatsSource for FixedSource {
        async fn sample(&self) -> RawStatsSample {
            RawStatsSample {
                rtt_ms: self.rtt_ms.load(Ordering::SeqCst),
                jitter_ms: 5,
                packet_loss_pct: 0.0,
                available_bandwidth_kbps: 5000,
                bytes_sent: 0,
                bytes_received: 0,
            }
        }
    }

    #[tokio::test]
    async fn latest_reflects_most_recent_sample() {
        let source = Arc::new(FixedSource { rtt_ms: AtomicU32::new(20) });
        let probe = NetworkProbe::new(source.clone(), 60, |_| {});
        probe.sample_once().await;
        source.rtt_ms.store(80, Ordering::SeqCst);
        probe.sample_once().await;
        assert_eq!(probe.latest().await.unwrap().latency_ms, 80);
    }

    #[tokio::test]
    async fn average_across_samples() {
        let source = Arc::new(FixedSource { rtt_ms: AtomicU32::new(10) });
        let probe = NetworkProbe::new(source.clone(), 60, |_| {});
        probe.sample_once().await;
        source.rtt_ms.store(30, Ordering::SeqCst);
        probe.sample_once().await;
        assert_eq!(probe.average().await.unwrap().latency_ms, 20);
    }

    #[tokio::test]
    async fn ring_evicts_beyond_capacity() {
        let source = Arc::new(FixedSource { rtt_ms: AtomicU32::new(1) });
        let probe = NetworkProbe::new(source, 2, |_| {});
        probe.sample_once().await;
        probe.sample_once().await;
        probe.sample_once().await;
        assert_eq!(probe.ring.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn on_sampled_callback_fires() {
        let source = Arc::new(FixedSource { rtt_ms: AtomicU32::new(42) });
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = Arc::clone(&seen);
        let probe = NetworkProbe::new(source, 60, move |q| {
            seen_clone.store(q.latency_ms, Ordering::SeqCst);
        });
        probe.sample_once().await;
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }
}
