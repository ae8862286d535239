//! Orchestrates detection → backoff → claim → handover across peers (§4.5).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use relay_protocol::config::FailoverConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Idle,
    Detecting,
    Waiting,
    Electing,
    Transitioning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayClaim {
    pub peer_id: String,
    pub epoch: u64,
    pub score: u8,
}

struct Inner {
    state: FailoverState,
    current_relay: Option<RelayClaim>,
    local_is_relay: bool,
    offline_count: u32,
    claims_during_wait: Vec<RelayClaim>,
}

/// One instance per local peer. `on_become_relay`/`on_conflict` are
/// value-typed callbacks fixed at construction (§9 "Cyclic ownership") —
/// this type never holds a reference back to its Coordinator.
pub struct FailoverManager {
    config: FailoverConfig,
    local_peer_id: String,
    inner: Mutex<Inner>,
    cancel: Notify,
    on_become_relay: Box<dyn Fn(u64, u8) + Send + Sync>,
    on_conflict: Box<dyn Fn(&str, u64, u8) + Send + Sync>,
}

impl FailoverManager {
    pub fn new(
        config: FailoverConfig,
        local_peer_id: impl Into<String>,
        on_become_relay: impl Fn(u64, u8) + Send + Sync + 'static,
        on_conflict: impl Fn(&str, u64, u8) + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            local_peer_id: local_peer_id.into(),
            inner: Mutex::new(Inner {
                state: FailoverState::Idle,
                current_relay: None,
                local_is_relay: false,
                offline_count: 0,
                claims_during_wait: Vec::new(),
            }),
            cancel: Notify::new(),
            on_become_relay: Box::new(on_become_relay),
            on_conflict: Box::new(on_conflict),
        }
    }

    pub async fn current_relay(&self) -> Option<RelayClaim> {
        self.inner.lock().await.current_relay.clone()
    }

    pub async fn current_epoch(&self) -> u64 {
        self.inner.lock().await.current_relay.as_ref().map(|r| r.epoch).unwrap_or(0)
    }

    pub async fn state(&self) -> FailoverState {
        self.inner.lock().await.state
    }

    pub async fn is_local_relay(&self) -> bool {
        self.inner.lock().await.local_is_relay
    }

    /// Explicit `relayChanged` adoption: takes effect only if `epoch` is
    /// strictly newer than what's currently observed (§4.9).
    pub async fn set_current_relay(&self, relay_id: &str, epoch: u64, score: u8) {
        let mut inner = self.inner.lock().await;
        let current_epoch = inner.current_relay.as_ref().map(|r| r.epoch).unwrap_or(0);
        if epoch > current_epoch {
            inner.current_relay = Some(RelayClaim { peer_id: relay_id.to_string(), epoch, score });
            inner.local_is_relay = relay_id == self.local_peer_id;
            inner.offline_count = 0;
        }
    }

    /// Resets the cumulative offline counter when a pong arrives from the
    /// peer currently tracked as Relay, so a flapping link doesn't accumulate
    /// offline hits across keepalive cycles once it's responsive again.
    pub async fn note_pong(&self, peer_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.current_relay.as_ref().map(|r| r.peer_id.as_str()) == Some(peer_id) {
            inner.offline_count = 0;
        }
    }

    /// Step 1-6 of §4.5's "handling a Relay offline event" protocol. Meant
    /// to be spawned as its own task by the caller so a long backoff wait
    /// doesn't block dispatch of other signaling traffic.
    pub async fn handle_relay_offline(
        &self,
        offline_peer: &str,
        local_score: u8,
        elect: impl FnOnce() -> Option<(String, u8)>,
    ) {
        {
            let mut inner = self.inner.lock().await;
            let is_current_relay =
                inner.current_relay.as_ref().map(|r| r.peer_id.as_str()) == Some(offline_peer);
            if !is_current_relay {
                return;
            }
            inner.offline_count += 1;
            if inner.offline_count < self.config.offline_threshold {
                return;
            }
            if inner.state != FailoverState::Idle {
                return;
            }
            inner.state = FailoverState::Detecting;
            inner.claims_during_wait.clear();
            inner.state = FailoverState::Waiting;
        }

        let backoff_ms = ((100u32.saturating_sub(local_score as u32)) as u64 * self.config.backoff_per_point_ms)
            .min(self.config.max_backoff_ms);
        let backoff = Duration::from_millis(backoff_ms);
        debug!(peer = %self.local_peer_id, backoff_ms, "failover backoff starting");

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = self.cancel.notified() => {
                debug!(peer = %self.local_peer_id, "failover wait cancelled, a dominating claim arrived");
                return;
            }
        }

        let (claims, current_epoch, still_waiting) = {
            let inner = self.inner.lock().await;
            (
                inner.claims_during_wait.clone(),
                inner.current_relay.as_ref().map(|r| r.epoch).unwrap_or(0),
                inner.state == FailoverState::Waiting,
            )
        };
        if !still_waiting {
            return;
        }

        for claim in &claims {
            let dominates = claim.epoch > current_epoch
                || (claim.epoch == current_epoch + 1
                    && (claim.score > local_score
                        || (claim.score == local_score && claim.peer_id < self.local_peer_id)));
            if dominates {
                let mut inner = self.inner.lock().await;
                inner.current_relay = Some(claim.clone());
                inner.local_is_relay = false;
                inner.offline_count = 0;
                inner.state = FailoverState::Idle;
                return;
            }
        }

        {
            let mut inner = self.inner.lock().await;
            inner.state = FailoverState::Electing;
        }
        let new_epoch = current_epoch + 1;
        let winner = elect();
        match winner {
            Some((peer_id, score)) if peer_id == self.local_peer_id => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.state = FailoverState::Transitioning;
                    inner.current_relay =
                        Some(RelayClaim { peer_id: self.local_peer_id.clone(), epoch: new_epoch, score });
                    inner.local_is_relay = true;
                    inner.offline_count = 0;
                    inner.state = FailoverState::Idle;
                }
                (self.on_become_relay)(new_epoch, score);
            }
            _ => {
                self.inner.lock().await.state = FailoverState::Idle;
            }
        }
    }

    /// Receiving a claim from peer `peer_id` at epoch `epoch` with score
    /// `score` (§4.5). The compare is asymmetric by design: only the
    /// current Relay re-runs the score compare at an equal epoch — a
    /// non-Relay peer simply adopts any claim at a newer epoch, or at an
    /// equal epoch with the tie-break in the claimant's favor.
    pub async fn receive_claim(&self, peer_id: &str, epoch: u64, score: u8, local_score: u8) {
        let mut inner = self.inner.lock().await;
        if inner.state == FailoverState::Waiting {
            inner.claims_during_wait.push(RelayClaim { peer_id: peer_id.to_string(), epoch, score });
        }
        let current_epoch = inner.current_relay.as_ref().map(|r| r.epoch).unwrap_or(0);
        let local_is_relay = inner.local_is_relay;
        let yields = epoch > current_epoch
            || (epoch == current_epoch
                && ((local_is_relay && score > local_score)
                    || (score == local_score && peer_id > self.local_peer_id.as_str())));
        if !yields {
            return;
        }

        let was_relay = local_is_relay;
        let claim = RelayClaim { peer_id: peer_id.to_string(), epoch, score };
        inner.current_relay = Some(claim.clone());
        inner.local_is_relay = false;
        inner.offline_count = 0;
        let should_cancel = inner.state != FailoverState::Idle;
        inner.state = FailoverState::Idle;
        drop(inner);

        if should_cancel {
            self.cancel.notify_waiters();
        }
        if was_relay {
            (self.on_conflict)(&claim.peer_id, claim.epoch, claim.score);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    fn test_config() -> FailoverConfig {
        FailoverConfig {
            backoff_per_point_ms: 10,
            max_backoff_ms: 2000,
            claim_timeout_ms: 500,
            offline_threshold: 1,
        }
    }

    /// Among three peers racing to replace the same offline Relay, only
    /// the highest-scored one ever becomes Relay for the new epoch.
    #[tokio::test(start_paused = true)]
    async fn failover_race_only_highest_score_wins() {
        let (tx, mut rx) = mpsc::unbounded_channel::<RelayClaim>();
        let became_relay = Arc::new(StdMutex::new(Vec::<String>::new()));

        let make = |peer_id: &'static str, score: u8| {
            let became = became_relay.clone();
            let tx = tx.clone();
            Arc::new(FailoverManager::new(test_config(), peer_id, move |epoch, s| {
                became.lock().unwrap().push(peer_id.to_string());
                let _ = tx.send(RelayClaim { peer_id: peer_id.to_string(), epoch, score: s });
            }, |_, _, _| {}))
        };

        let fm90 = make("p90", 90);
        let fm70 = make("p70", 70);
        let fm50 = make("p50", 50);
        for fm in [&fm90, &fm70, &fm50] {
            fm.set_current_relay("old-relay", 0, 100).await;
        }

        // Only the winning peer ever broadcasts a claim, so the relay loop
        // exits after fanning out exactly one message.
        let broadcaster = {
            let fm90 = fm90.clone();
            let fm70 = fm70.clone();
            let fm50 = fm50.clone();
            tokio::spawn(async move {
                if let Some(claim) = rx.recv().await {
                    for (fm, local_score) in [(&fm90, 90u8), (&fm70, 70u8), (&fm50, 50u8)] {
                        fm.receive_claim(&claim.peer_id, claim.epoch, claim.score, local_score).await;
                    }
                }
            })
        };

        tokio::join!(
            fm90.handle_relay_offline("old-relay", 90, || Some(("p90".to_string(), 90))),
            fm70.handle_relay_offline("old-relay", 70, || Some(("p70".to_string(), 70))),
            fm50.handle_relay_offline("old-relay", 50, || Some(("p50".to_string(), 50))),
        );

        drop(tx);
        broadcaster.await.unwrap();

        let became = became_relay.lock().unwrap();
        assert_eq!(became.as_slice(), ["p90"], "only the highest-scored peer becomes relay");
        assert_eq!(fm90.current_epoch().await, 1);
        assert_eq!(fm70.current_relay().await.unwrap().peer_id, "p90");
        assert_eq!(fm50.current_relay().await.unwrap().peer_id, "p90");
    }

    #[tokio::test]
    async fn conflict_reported_when_local_relay_yields() {
        let conflicts = Arc::new(StdMutex::new(Vec::<String>::new()));
        let conflicts_clone = conflicts.clone();
        let fm = FailoverManager::new(
            test_config(),
            "local",
            |_, _| {},
            move |peer_id, _epoch, _score| {
                conflicts_clone.lock().unwrap().push(peer_id.to_string());
            },
        );
        fm.set_current_relay("local", 1, 50).await;
        assert!(fm.is_local_relay().await);

        fm.receive_claim("other", 1, 80, 50).await;
        assert!(!fm.is_local_relay().await);
        assert_eq!(conflicts.lock().unwrap().as_slice(), ["other"]);
    }

    #[tokio::test]
    async fn non_relay_does_not_report_conflict() {
        let conflicts = Arc::new(StdMutex::new(Vec::<String>::new()));
        let conflicts_clone = conflicts.clone();
        let fm = FailoverManager::new(
            test_config(),
            "local",
            |_, _| {},
            move |peer_id, _epoch, _score| {
                conflicts_clone.lock().unwrap().push(peer_id.to_string());
            },
        );
        fm.set_current_relay("someone-else", 1, 50).await;
        fm.receive_claim("other", 2, 80, 50).await;
        assert!(conflicts.lock().unwrap().is_empty());
    }
}
