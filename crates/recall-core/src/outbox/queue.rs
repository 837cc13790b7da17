//! Outbox queue: enqueue on the request path, replay in the background.
//!
//! Every state change is appended to the [`OutboxLog`] before the in-memory
//! queue reflects it, so a crash at any point leaves a log that folds back to
//! a superset of what was pending. Replays are serialized by `replay_lock`;
//! the pending lock is never held across a delivery.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use recall_types::error::OutboxError;
use recall_types::outbox::{DeadLetterEntry, OutboxEntry, OutboxEvent, OutboxRecord};

use super::log::{fold_records, OutboxLog};
use super::retry::RetryPolicy;
use crate::metrics::MemoryMetrics;

/// Outcome of one delivery attempt, reported by the replay callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The attempt ran and failed; counts toward the retry budget.
    Failed(String),
    /// The dependency is known to be unavailable; nothing was attempted.
    /// Ends the current cycle without touching any entry.
    Deferred,
}

/// What one replay cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Entries left untouched because a delivery was deferred.
    pub deferred: usize,
    /// Entries still inside their backoff window.
    pub not_yet_due: usize,
}

impl ReplayReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

pub struct OutboxQueue<L> {
    log: L,
    policy: RetryPolicy,
    pending: Mutex<VecDeque<OutboxEntry>>,
    replay_lock: Mutex<()>,
    /// Set while the log may hold records beyond what is pending.
    log_dirty: AtomicBool,
    metrics: Arc<MemoryMetrics>,
}

impl<L: OutboxLog> OutboxQueue<L> {
    /// Open the queue, recovering entries left by a previous process.
    ///
    /// Recovered entries are due immediately regardless of their recorded
    /// backoff; their attempt counts carry over.
    pub async fn open(
        log: L,
        policy: RetryPolicy,
        metrics: Arc<MemoryMetrics>,
    ) -> Result<Self, OutboxError> {
        let now = Utc::now();
        let records = log.load().await?;
        let log_dirty = AtomicBool::new(!records.is_empty());
        let mut recovered = fold_records(records);
        for entry in &mut recovered {
            entry.next_attempt_at = entry.next_attempt_at.min(now);
        }
        if !recovered.is_empty() {
            info!(entries = recovered.len(), "Recovered pending outbox entries");
        }
        metrics.set_outbox_depth(recovered.len());

        Ok(Self {
            log,
            policy,
            pending: Mutex::new(recovered.into()),
            replay_lock: Mutex::new(()),
            log_dirty,
            metrics,
        })
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Buffer a payload for later delivery.
    ///
    /// The entry is always queued in memory. An `Err` means the log append
    /// failed: the entry will still replay in this process but would not
    /// survive a restart.
    pub async fn enqueue(&self, payload: serde_json::Value) -> Result<Uuid, OutboxError> {
        let entry = OutboxEntry::new(payload, Utc::now());
        let id = entry.id;
        let record = OutboxRecord::new(
            OutboxEvent::Enqueued {
                entry: entry.clone(),
            },
            entry.enqueued_at,
        );

        let mut pending = self.pending.lock().await;
        self.log_dirty.store(true, Ordering::SeqCst);
        let appended = self.log.append(&record).await;
        pending.push_back(entry);
        MemoryMetrics::incr(&self.metrics.outbox_enqueued);
        self.metrics.set_outbox_depth(pending.len());
        drop(pending);

        debug!(%id, "Enqueued outbox entry");
        appended.map(|()| id)
    }

    pub async fn depth(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Snapshot of pending entries in enqueue order.
    pub async fn pending(&self) -> Vec<OutboxEntry> {
        self.pending.lock().await.iter().cloned().collect()
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, OutboxError> {
        self.log.load_dead_letters().await
    }

    /// Run one replay cycle over due entries, in enqueue order.
    ///
    /// Never fails: log write errors are logged and the in-memory state moves
    /// on, except that an entry is only dropped for exhaustion once its dead
    /// letter is durably written.
    pub async fn replay<F, Fut>(&self, mut deliver: F) -> ReplayReport
    where
        F: FnMut(serde_json::Value) -> Fut,
        Fut: Future<Output = Delivery>,
    {
        let _replaying = self.replay_lock.lock().await;
        let now = Utc::now();
        let snapshot = self.pending().await;
        let mut report = ReplayReport::default();

        for (index, entry) in snapshot.iter().enumerate() {
            if !entry.is_due(now) {
                report.not_yet_due += 1;
                continue;
            }

            match deliver(entry.payload.clone()).await {
                Delivery::Delivered => {
                    self.append_or_warn(OutboxEvent::Delivered { id: entry.id })
                        .await;
                    self.remove(entry.id).await;
                    report.delivered += 1;
                    MemoryMetrics::incr(&self.metrics.replay_delivered);
                }
                Delivery::Failed(reason) => {
                    let attempts = entry.attempts + 1;
                    if self.policy.is_exhausted(attempts) && self.dead_letter(entry, attempts, &reason).await {
                        report.dead_lettered += 1;
                    } else {
                        self.schedule_retry(entry.id, attempts, reason).await;
                        report.retried += 1;
                    }
                }
                Delivery::Deferred => {
                    report.deferred = snapshot[index..]
                        .iter()
                        .filter(|e| e.is_due(now))
                        .count();
                    report.not_yet_due += snapshot.len() - index - report.deferred;
                    break;
                }
            }
        }

        self.compact_if_drained().await;

        if !report.is_idle() {
            info!(
                delivered = report.delivered,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                deferred = report.deferred,
                "Outbox replay cycle finished"
            );
        }
        report
    }

    async fn schedule_retry(&self, id: Uuid, attempts: u32, last_error: String) {
        let next_attempt_at = self.policy.next_attempt_at(attempts, Utc::now());
        self.append_or_warn(OutboxEvent::RetryScheduled {
            id,
            attempts,
            next_attempt_at,
            last_error: last_error.clone(),
        })
        .await;

        let mut pending = self.pending.lock().await;
        if let Some(entry) = pending.iter_mut().find(|e| e.id == id) {
            entry.attempts = attempts;
            entry.next_attempt_at = next_attempt_at;
            entry.last_error = Some(last_error);
        }
        MemoryMetrics::incr(&self.metrics.replay_retried);
    }

    /// Move an exhausted entry to the dead-letter sink. Returns false (entry
    /// kept) if the dead letter could not be written.
    async fn dead_letter(&self, entry: &OutboxEntry, attempts: u32, reason: &str) -> bool {
        let dead_letter = DeadLetterEntry {
            entry: OutboxEntry {
                attempts,
                last_error: Some(reason.to_string()),
                ..entry.clone()
            },
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        };
        if let Err(e) = self.log.append_dead_letter(&dead_letter).await {
            warn!(id = %entry.id, error = %e, "Failed to write dead letter, keeping entry");
            return false;
        }

        self.append_or_warn(OutboxEvent::DeadLettered { id: entry.id })
            .await;
        self.remove(entry.id).await;
        MemoryMetrics::incr(&self.metrics.dead_letters);
        warn!(id = %entry.id, attempts, reason, "Outbox entry moved to dead-letter sink");
        true
    }

    async fn remove(&self, id: Uuid) {
        let mut pending = self.pending.lock().await;
        pending.retain(|e| e.id != id);
        self.metrics.set_outbox_depth(pending.len());
    }

    async fn append_or_warn(&self, event: OutboxEvent) {
        let record = OutboxRecord::new(event, Utc::now());
        self.log_dirty.store(true, Ordering::SeqCst);
        if let Err(e) = self.log.append(&record).await {
            warn!(error = %e, "Failed to append outbox event");
        }
    }

    /// Truncate the log once nothing is pending. Idle cycles over an
    /// already-empty log leave the file alone.
    async fn compact_if_drained(&self) {
        let pending = self.pending.lock().await;
        if !pending.is_empty() || !self.log_dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.log.compact(&[]).await {
            self.log_dirty.store(true, Ordering::SeqCst);
            warn!(error = %e, "Failed to compact outbox log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryOutboxLog;
    use serde_json::json;
    use std::time::Duration;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base: Duration::ZERO,
            cap: Duration::ZERO,
        }
    }

    async fn queue(log: InMemoryOutboxLog, max_retries: u32) -> OutboxQueue<InMemoryOutboxLog> {
        OutboxQueue::open(log, policy(max_retries), Arc::new(MemoryMetrics::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_grows_depth_and_log() {
        let log = InMemoryOutboxLog::new();
        let q = queue(log.clone(), 5).await;
        q.enqueue(json!({"n": 1})).await.unwrap();
        q.enqueue(json!({"n": 2})).await.unwrap();

        assert_eq!(q.depth().await, 2);
        assert_eq!(log.record_count(), 2);
        assert_eq!(q.metrics.snapshot().outbox_depth, 2);
    }

    #[tokio::test]
    async fn replay_delivers_in_enqueue_order_and_drains() {
        let log = InMemoryOutboxLog::new();
        let q = queue(log.clone(), 5).await;
        for n in 0..3 {
            q.enqueue(json!(n)).await.unwrap();
        }

        let mut seen = Vec::new();
        let report = q
            .replay(|payload| {
                seen.push(payload);
                async { Delivery::Delivered }
            })
            .await;

        assert_eq!(report.delivered, 3);
        assert_eq!(seen, vec![json!(0), json!(1), json!(2)]);
        assert_eq!(q.depth().await, 0);
        // Drained queue compacts the log.
        assert_eq!(log.record_count(), 0);
    }

    #[tokio::test]
    async fn idle_cycles_leave_the_log_alone() {
        let log = InMemoryOutboxLog::new();
        let q = queue(log.clone(), 5).await;
        q.replay(|_| async { Delivery::Delivered }).await;
        assert_eq!(log.compaction_count(), 0);

        q.enqueue(json!("x")).await.unwrap();
        q.replay(|_| async { Delivery::Delivered }).await;
        assert_eq!(log.compaction_count(), 1);

        for _ in 0..3 {
            assert!(q.replay(|_| async { Delivery::Delivered }).await.is_idle());
        }
        assert_eq!(log.compaction_count(), 1);
    }

    #[tokio::test]
    async fn leftover_records_are_compacted_after_restart() {
        let log = InMemoryOutboxLog::new();
        {
            let q = queue(log.clone(), 5).await;
            q.enqueue(json!("x")).await.unwrap();
            log.set_compact_failing(true);
            q.replay(|_| async { Delivery::Delivered }).await;
            assert_eq!(log.record_count(), 2);
        }

        log.set_compact_failing(false);
        let q = queue(log.clone(), 5).await;
        assert_eq!(q.depth().await, 0);
        assert!(q.replay(|_| async { Delivery::Delivered }).await.is_idle());
        assert_eq!(log.record_count(), 0);
        assert_eq!(log.compaction_count(), 1);
    }

    #[tokio::test]
    async fn failure_increments_attempts() {
        let q = queue(InMemoryOutboxLog::new(), 5).await;
        q.enqueue(json!("x")).await.unwrap();

        let report = q
            .replay(|_| async { Delivery::Failed("db down".into()) })
            .await;
        assert_eq!(report.retried, 1);

        let pending = q.pending().await;
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("db down"));
    }

    #[tokio::test]
    async fn exhausted_entry_moves_to_dead_letters() {
        let q = queue(InMemoryOutboxLog::new(), 2).await;
        q.enqueue(json!("doomed")).await.unwrap();

        q.replay(|_| async { Delivery::Failed("e1".into()) }).await;
        let report = q.replay(|_| async { Delivery::Failed("e2".into()) }).await;

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(q.depth().await, 0);
        let dead = q.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "e2");
        assert_eq!(dead[0].entry.attempts, 2);
        assert_eq!(dead[0].entry.payload, json!("doomed"));
    }

    #[tokio::test]
    async fn entry_kept_when_dead_letter_write_fails() {
        let log = InMemoryOutboxLog::new();
        let q = queue(log.clone(), 1).await;
        q.enqueue(json!("x")).await.unwrap();

        log.set_dead_letter_failing(true);
        let report = q.replay(|_| async { Delivery::Failed("boom".into()) }).await;
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(q.depth().await, 1);

        log.set_dead_letter_failing(false);
        let report = q.replay(|_| async { Delivery::Failed("boom".into()) }).await;
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(q.depth().await, 0);
    }

    #[tokio::test]
    async fn deferred_stops_cycle_without_counting() {
        let q = queue(InMemoryOutboxLog::new(), 5).await;
        q.enqueue(json!(1)).await.unwrap();
        q.enqueue(json!(2)).await.unwrap();

        let mut calls = 0;
        let report = q
            .replay(|_| {
                calls += 1;
                async { Delivery::Deferred }
            })
            .await;

        assert_eq!(calls, 1);
        assert_eq!(report.deferred, 2);
        assert!(q.pending().await.iter().all(|e| e.attempts == 0));
    }

    #[tokio::test]
    async fn entries_in_backoff_are_skipped() {
        let log = InMemoryOutboxLog::new();
        let q = OutboxQueue::open(
            log,
            RetryPolicy {
                max_retries: 5,
                base: Duration::from_secs(60),
                cap: Duration::from_secs(60),
            },
            Arc::new(MemoryMetrics::new()),
        )
        .await
        .unwrap();
        q.enqueue(json!("x")).await.unwrap();

        q.replay(|_| async { Delivery::Failed("down".into()) }).await;
        let report = q.replay(|_| async { Delivery::Delivered }).await;
        assert_eq!(report.not_yet_due, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(q.depth().await, 1);
    }

    #[tokio::test]
    async fn restart_recovers_pending_entries() {
        let log = InMemoryOutboxLog::new();
        {
            let q = queue(log.clone(), 5).await;
            q.enqueue(json!("a")).await.unwrap();
            q.enqueue(json!("b")).await.unwrap();
            q.replay(|p| async move {
                if p == json!("a") {
                    Delivery::Delivered
                } else {
                    Delivery::Failed("down".into())
                }
            })
            .await;
        }

        let q = queue(log, 5).await;
        let pending = q.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, json!("b"));
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].is_due(Utc::now()));
    }

    #[tokio::test]
    async fn failed_log_append_still_queues_in_memory() {
        let log = InMemoryOutboxLog::new();
        let q = queue(log.clone(), 5).await;
        log.set_append_failing(true);

        assert!(q.enqueue(json!("x")).await.is_err());
        assert_eq!(q.depth().await, 1);
    }
}
