//! Per-peer/room atomic counters, bitrate windows, loss rate (§2).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const BITRATE_WINDOW: Duration = Duration::from_secs(5);

/// A point-in-time view of [`TrafficStats`], cheap to clone and log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrafficStatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_lost: u64,
    pub bitrate_bps: u64,
}

/// Atomic counters plus a rolling byte-sample window for bitrate estimation.
/// No locks on the increment path; the window deque is the one piece of
/// mutable state that needs a mutex, and it's only touched by senders, never
/// by readers computing `loss_rate`/`snapshot`.
pub struct TrafficStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_lost: AtomicU64,
    window: Mutex<VecDeque<(Instant, u64)>>,
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficStats {
    pub fn new() -> Self {
        Self {
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            window: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        let now = Instant::now();
        let mut window = self.window.lock().expect("stats mutex poisoned");
        window.push_back((now, bytes as u64));
        while let Some((ts, _)) = window.front() {
            if now.duration_since(*ts) > BITRATE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_lost(&self, count: u64) {
        self.packets_lost.fetch_add(count, Ordering::Relaxed);
    }

    /// Average bits-per-second sent over the trailing [`BITRATE_WINDOW`].
    pub fn bitrate_bps(&self) -> u64 {
        let window = self.window.lock().expect("stats mutex poisoned");
        if window.len() < 2 {
            return 0;
        }
        let total_bytes: u64 = window.iter().map(|(_, b)| b).sum();
        let span = window.back().unwrap().0.duration_since(window.front().unwrap().0);
        if span.is_zero() {
            return 0;
        }
        ((total_bytes as f64 * 8.0) / span.as_secs_f64()) as u64
    }

    pub fn loss_rate(&self) -> f64 {
        let sent = self.packets_sent.load(Ordering::Relaxed);
        let lost = self.packets_lost.load(Ordering::Relaxed);
        if sent + lost == 0 {
            return 0.0;
        }
        lost as f64 / (sent + lost) as f64
    }

    pub fn snapshot(&self) -> TrafficStatsSnapshot {
        TrafficStatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            bitrate_bps: self.bitrate_bps(),
        }
    }
}
