//! Counters and gauges for the memory layer.
//!
//! Lock-free `AtomicU64` values incremented on the hot path and read when an
//! operator asks for a snapshot. An outage shows up here (growing outbox
//! depth, dead letters) rather than as a user-facing error.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::breaker::CircuitStateKind;

/// Shared metrics registry. One instance per application, behind an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    /// Context window served from memory.
    pub window_hits: AtomicU64,
    /// Context window requested for a cold session.
    pub window_misses: AtomicU64,
    /// Cold sessions rebuilt from durable history.
    pub rehydrations: AtomicU64,
    pub durable_writes_ok: AtomicU64,
    pub durable_writes_failed: AtomicU64,
    /// Calls short-circuited by an open breaker.
    pub breaker_rejections: AtomicU64,
    pub outbox_enqueued: AtomicU64,
    pub replay_delivered: AtomicU64,
    pub replay_retried: AtomicU64,
    pub dead_letters: AtomicU64,
    /// Gauge: entries currently pending in the outbox.
    pub outbox_depth: AtomicU64,
    /// Gauge: see [`CircuitStateKind::as_gauge`].
    pub breaker_state: AtomicU64,
}

impl MemoryMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            window_hits: AtomicU64::new(0),
            window_misses: AtomicU64::new(0),
            rehydrations: AtomicU64::new(0),
            durable_writes_ok: AtomicU64::new(0),
            durable_writes_failed: AtomicU64::new(0),
            breaker_rejections: AtomicU64::new(0),
            outbox_enqueued: AtomicU64::new(0),
            replay_delivered: AtomicU64::new(0),
            replay_retried: AtomicU64::new(0),
            dead_letters: AtomicU64::new(0),
            outbox_depth: AtomicU64::new(0),
            breaker_state: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_outbox_depth(&self, depth: usize) {
        self.outbox_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn set_breaker_state(&self, state: CircuitStateKind) {
        self.breaker_state.store(state.as_gauge(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            window_hits: load(&self.window_hits),
            window_misses: load(&self.window_misses),
            rehydrations: load(&self.rehydrations),
            durable_writes_ok: load(&self.durable_writes_ok),
            durable_writes_failed: load(&self.durable_writes_failed),
            breaker_rejections: load(&self.breaker_rejections),
            outbox_enqueued: load(&self.outbox_enqueued),
            replay_delivered: load(&self.replay_delivered),
            replay_retried: load(&self.replay_retried),
            dead_letters: load(&self.dead_letters),
            outbox_depth: load(&self.outbox_depth),
            breaker_state: load(&self.breaker_state),
        }
    }
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub window_hits: u64,
    pub window_misses: u64,
    pub rehydrations: u64,
    pub durable_writes_ok: u64,
    pub durable_writes_failed: u64,
    pub breaker_rejections: u64,
    pub outbox_enqueued: u64,
    pub replay_delivered: u64,
    pub replay_retried: u64,
    pub dead_letters: u64,
    pub outbox_depth: u64,
    pub breaker_state: u64,
}

impl MetricsSnapshot {
    /// Window hit ratio in `[0, 1]`; zero before any request.
    pub fn window_hit_ratio(&self) -> f64 {
        let total = self.window_hits + self.window_misses;
        if total == 0 {
            0.0
        } else {
            self.window_hits as f64 / total as f64
        }
    }
}
