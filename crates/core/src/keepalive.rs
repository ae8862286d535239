//! Per-peer heartbeat state: ping, pong, RTT, offline classification (§4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use relay_protocol::config::KeepaliveConfig;

/// Host-provided ping transport. The Coordinator supplies the concrete
/// implementation (a signaling `ping` send); Keepalive never knows about
/// Signaling directly, keeping the dependency one-directional (§9 "Cyclic
/// ownership").
#[async_trait]
pub trait PingSender: Send + Sync {
    async fn send_ping(&self, peer_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Unknown,
    Online,
    Slow,
    Offline,
}

#[derive(Debug, Clone)]
struct HeartbeatRecord {
    last_ping_sent: Option<Instant>,
    last_pong_received: Option<Instant>,
    /// Start of the current unanswered-ping streak, used by [`Keepalive::sweep`]
    /// to clock a timeout for a peer that has never sent a single pong. Reset
    /// to `now` whenever a streak begins (on watch, and after a pong closes
    /// out the previous one); left untouched while the streak continues, so
    /// re-pinging a silent peer doesn't keep pushing its timeout back.
    first_unanswered_at: Option<Instant>,
    smoothed_rtt: Option<Duration>,
    missed_pongs: u32,
    classification: Classification,
    offline_reported: bool,
}

impl HeartbeatRecord {
    fn new() -> Self {
        Self {
            last_ping_sent: None,
            last_pong_received: None,
            first_unanswered_at: Some(Instant::now()),
            smoothed_rtt: None,
            missed_pongs: 0,
            classification: Classification::Unknown,
            offline_reported: false,
        }
    }
}

/// Holds one [`HeartbeatRecord`] per watched peer and runs the ping/sweep
/// cycle described in §4.3. `on_offline`/`on_slow` are value-typed callbacks
/// supplied at construction — Keepalive never holds a reference back to its
/// owner.
pub struct Keepalive {
    config: KeepaliveConfig,
    records: Mutex<HashMap<String, HeartbeatRecord>>,
    sender: Arc<dyn PingSender>,
    on_offline: Box<dyn Fn(&str) + Send + Sync>,
    on_slow: Box<dyn Fn(&str) + Send + Sync>,
}

impl Keepalive {
    pub fn new(
        config: KeepaliveConfig,
        sender: Arc<dyn PingSender>,
        on_offline: impl Fn(&str) + Send + Sync + 'static,
        on_slow: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
            sender,
            on_offline: Box::new(on_offline),
            on_slow: Box::new(on_slow),
        }
    }

    pub async fn watch(&self, peer_id: &str) {
        let mut records = self.records.lock().await;
        records.entry(peer_id.to_string()).or_insert_with(HeartbeatRecord::new);
    }

    pub async fn unwatch(&self, peer_id: &str) {
        self.records.lock().await.remove(peer_id);
    }

    /// One ping-then-sweep cycle (§4.3). Intended to be driven by a ticker
    /// loop (see [`Keepalive::run`]) but exposed directly so tests can step
    /// it without a real timer.
    pub async fn tick(&self) {
        let peer_ids: Vec<String> = self.records.lock().await.keys().cloned().collect();
        for peer_id in &peer_ids {
            self.sender.send_ping(peer_id).await;
            let mut records = self.records.lock().await;
            if let Some(record) = records.get_mut(peer_id) {
                let prior_ping = record.last_ping_sent;
                let prior_answered = record.last_pong_received.is_some_and(|pong| prior_ping.is_some_and(|sent| pong >= sent));
                if prior_ping.is_some() {
                    if prior_answered {
                        record.first_unanswered_at = Some(Instant::now());
                    } else {
                        record.missed_pongs += 1;
                    }
                }
                record.last_ping_sent = Some(Instant::now());
            }
        }
        self.sweep().await;
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let mut newly_offline = Vec::new();
        let mut newly_slow = Vec::new();
        {
            let mut records = self.records.lock().await;
            for (peer_id, record) in records.iter_mut() {
                let missed = record.missed_pongs >= self.config.max_retries;
                let timed_out = match record.last_pong_received {
                    Some(last_pong) => now.duration_since(last_pong) > Duration::from_millis(self.config.timeout_ms),
                    None => record
                        .first_unanswered_at
                        .is_some_and(|sent| now.duration_since(sent) > Duration::from_millis(self.config.timeout_ms)),
                };
                if timed_out || missed {
                    if record.classification != Classification::Offline {
                        record.classification = Classification::Offline;
                    }
                    if !record.offline_reported {
                        record.offline_reported = true;
                        newly_offline.push(peer_id.clone());
                    }
                    continue;
                }
                record.offline_reported = false;
                if let Some(rtt) = record.smoothed_rtt
                    && rtt > Duration::from_millis(self.config.slow_threshold_ms)
                {
                    if record.classification != Classification::Slow {
                        newly_slow.push(peer_id.clone());
                    }
                    record.classification = Classification::Slow;
                } else if record.last_pong_received.is_some() {
                    record.classification = Classification::Online;
                }
            }
        }
        for peer_id in &newly_offline {
            (self.on_offline)(peer_id);
        }
        for peer_id in &newly_slow {
            (self.on_slow)(peer_id);
        }
    }

    /// `HandlePong(peer)` (§4.3): update RTT, clear the missed counter, and
    /// transition back to online.
    pub async fn handle_pong(&self, peer_id: &str) {
        let now = Instant::now();
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(peer_id) else {
            return;
        };
        if let Some(sent) = record.last_ping_sent {
            record.smoothed_rtt = Some(now.duration_since(sent));
        }
        record.last_pong_received = Some(now);
        record.first_unanswered_at = None;
        record.missed_pongs = 0;
        record.offline_reported = false;
        record.classification = Classification::Online;
        debug!(peer_id, "pong received, peer online");
    }

    pub async fn classification(&self, peer_id: &str) -> Option<Classification> {
        self.records.lock().await.get(peer_id).map(|r| r.classification)
    }

    /// Drives [`Keepalive::tick`] on `interval_ms` until `stop` fires.
    pub async fn run(self: Arc<Self>, mut stop: tokio::sync::oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = &mut stop => {
                    debug!("keepalive loop stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullSender;

    #[async_trait]
    impl PingSender for NullSender {
        async fn send_ping(&self, _peer_id: &str) {}
    }

    fn test_config() -> KeepaliveConfig {
        KeepaliveConfig {
            interval_ms: 50,
            timeout_ms: 200,
            slow_threshold_ms: 100,
            max_retries: 3,
        }
    }

    /// `on_offline` fires exactly once per continuous offline span, and not
    /// before `timeout` has elapsed.
    #[tokio::test(start_paused = true)]
    async fn offline_fires_once_not_before_timeout() {
        let offline_count = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&offline_count);
        let keepalive = Arc::new(Keepalive::new(
            test_config(),
            Arc::new(NullSender),
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        ));
        keepalive.watch("peer-a").await;

        keepalive.tick().await;
        assert_eq!(offline_count.load(Ordering::SeqCst), 0, "must not fire before timeout");

        tokio::time::advance(Duration::from_millis(250)).await;
        keepalive.tick().await;
        assert_eq!(offline_count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(250)).await;
        keepalive.tick().await;
        assert_eq!(offline_count.load(Ordering::SeqCst), 1, "must only report once per continuous offline span");
    }

    #[tokio::test(start_paused = true)]
    async fn handle_pong_clears_offline_and_resets_reporting() {
        let offline_count = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&offline_count);
        let keepalive = Arc::new(Keepalive::new(
            test_config(),
            Arc::new(NullSender),
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        ));
        keepalive.watch("peer-a").await;
        tokio::time::advance(Duration::from_millis(250)).await;
        keepalive.tick().await;
        assert_eq!(offline_count.load(Ordering::SeqCst), 1);

        keepalive.handle_pong("peer-a").await;
        assert_eq!(keepalive.classification("peer-a").await, Some(Classification::Online));

        tokio::time::advance(Duration::from_millis(250)).await;
        keepalive.tick().await;
        assert_eq!(offline_count.load(Ordering::SeqCst), 2, "a fresh offline span after recovery reports again");
    }

    /// `missed_pongs >= max_retries` (§4.3 / I5) must report offline on its
    /// own, independent of the `timeout_ms` clock. `test_config` gives a
    /// 200ms timeout and a 3-retry limit; this advances the clock only 30ms
    /// per tick (90ms total across the 3 ticks that follow the first), well
    /// under the timeout, so the clock path could not have fired it.
    #[tokio::test(start_paused = true)]
    async fn offline_fires_via_missed_pongs_before_timeout_elapses() {
        let offline_count = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&offline_count);
        let keepalive = Arc::new(Keepalive::new(
            test_config(),
            Arc::new(NullSender),
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        ));
        keepalive.watch("peer-a").await;

        // First tick only establishes the initial outstanding ping; nothing
        // was unanswered before it, so missed_pongs stays at 0.
        keepalive.tick().await;
        assert_eq!(offline_count.load(Ordering::SeqCst), 0);

        // Each subsequent tick finds the previous ping still unanswered and
        // bumps missed_pongs. max_retries is 3, so the third such tick (the
        // fourth overall) crosses the threshold.
        for expected_missed_pongs in 1..=3u32 {
            tokio::time::advance(Duration::from_millis(30)).await;
            keepalive.tick().await;
            if expected_missed_pongs < 3 {
                assert_eq!(offline_count.load(Ordering::SeqCst), 0, "must not fire before max_retries is reached");
            }
        }

        assert_eq!(offline_count.load(Ordering::SeqCst), 1, "must fire once missed_pongs reaches max_retries");
        assert_eq!(keepalive.classification("peer-a").await, Some(Classification::Offline));
    }
}
