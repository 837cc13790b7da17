//! Hybrid conversation manager: the memory layer's public facade.
//!
//! Every turn lands in the in-memory window first, synchronously. The durable
//! write that follows is gated by the circuit breaker and bounded by a
//! timeout; when it is short-circuited or fails, the turn goes to the outbox
//! and the background replay loop delivers it later. Nothing on this path
//! returns an error to the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use recall_types::chat::{
    ChatContextWindow, ConversationMessage, HistoryQuery, TurnPayload, MAX_HISTORY_LIMIT,
};

use crate::breaker::{BreakerError, BreakerStatus, CircuitBreaker};
use crate::conversation::manager::ConversationManager;
use crate::metrics::MemoryMetrics;
use crate::outbox::{Delivery, OutboxLog, OutboxQueue, ReplayReport};
use crate::persistence::{ConversationStore, PersistenceService};

/// Everything the durable path needs. Absent in memory-only mode.
pub struct DurableBackend<S, L> {
    pub persistence: Arc<PersistenceService<S>>,
    pub breaker: Arc<CircuitBreaker>,
    pub outbox: Arc<OutboxQueue<L>>,
    /// Upper bound on one store call; expiry counts as a breaker failure.
    pub write_timeout: Duration,
}

impl<S, L> Clone for DurableBackend<S, L> {
    fn clone(&self) -> Self {
        Self {
            persistence: Arc::clone(&self.persistence),
            breaker: Arc::clone(&self.breaker),
            outbox: Arc::clone(&self.outbox),
            write_timeout: self.write_timeout,
        }
    }
}

pub struct HybridConversationManager<S, L> {
    conversation: Arc<ConversationManager>,
    durable: Option<DurableBackend<S, L>>,
    metrics: Arc<MemoryMetrics>,
}

impl<S, L> HybridConversationManager<S, L>
where
    S: ConversationStore + 'static,
    L: OutboxLog + 'static,
{
    pub fn new(
        conversation: Arc<ConversationManager>,
        durable: Option<DurableBackend<S, L>>,
        metrics: Arc<MemoryMetrics>,
    ) -> Self {
        if durable.is_none() {
            info!("Durable conversation storage disabled, running memory-only");
        }
        Self {
            conversation,
            durable,
            metrics,
        }
    }

    /// A manager that behaves exactly like a plain [`ConversationManager`].
    pub fn memory_only(conversation: Arc<ConversationManager>, metrics: Arc<MemoryMetrics>) -> Self {
        Self::new(conversation, None, metrics)
    }

    pub fn conversation(&self) -> &ConversationManager {
        &self.conversation
    }

    pub fn metrics(&self) -> &MemoryMetrics {
        &self.metrics
    }

    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }

    pub fn durable(&self) -> Option<&DurableBackend<S, L>> {
        self.durable.as_ref()
    }

    pub fn breaker_status(&self) -> Option<BreakerStatus> {
        self.durable.as_ref().map(|d| d.breaker.status())
    }

    /// Record one turn.
    ///
    /// A session that is cold in memory is first rebuilt from durable
    /// history, so the new turn lands after the stored ones. Once the
    /// in-memory append is done, cancelling the returned future can only
    /// abandon the wait on the durable attempt. That attempt runs on its
    /// own task and hands the turn to the outbox if it does not succeed.
    pub async fn add_turn(
        &self,
        session_id: &str,
        user_text: &str,
        assistant_text: &str,
        chunk_ids: Vec<String>,
    ) {
        if !self.conversation.has_session(session_id) {
            self.rehydrate(session_id).await;
        }
        let messages = self
            .conversation
            .add_turn(session_id, user_text, assistant_text, chunk_ids);

        let Some(durable) = self.durable.clone() else {
            return;
        };
        let payload = TurnPayload {
            session_id: session_id.to_string(),
            messages: messages.to_vec(),
        };
        let metrics = Arc::clone(&self.metrics);
        let task = tokio::spawn(async move { durable.persist_turn(payload, &metrics).await });
        if let Err(e) = task.await {
            warn!(session_id, error = %e, "Durable write task did not complete");
        }
    }

    /// The session's context window, rebuilt from durable history when the
    /// session is cold in memory.
    pub async fn get_context_window(&self, session_id: &str) -> ChatContextWindow {
        if self.conversation.has_session(session_id) {
            MemoryMetrics::incr(&self.metrics.window_hits);
            return self.conversation.get_context_window(session_id);
        }
        MemoryMetrics::incr(&self.metrics.window_misses);

        self.rehydrate(session_id).await;
        self.conversation.get_context_window(session_id)
    }

    /// Load the newest window's worth of stored messages into a cold
    /// session. Leaves the session untouched when nothing is stored, the
    /// read fails, or another caller warmed it first.
    async fn rehydrate(&self, session_id: &str) {
        let Some(durable) = &self.durable else {
            return;
        };
        let limit = u32::try_from(self.conversation.window_limit()).unwrap_or(MAX_HISTORY_LIMIT);
        match durable.read_recent(session_id, limit, &self.metrics).await {
            Ok(mut recent) if !recent.is_empty() => {
                recent.reverse();
                if self.conversation.hydrate(session_id, recent) {
                    MemoryMetrics::incr(&self.metrics.rehydrations);
                }
            }
            Ok(_) => {}
            Err(reason) => {
                debug!(session_id, %reason, "Could not rebuild window from durable history");
            }
        }
    }

    pub fn format_for_prompt(&self, window: &ChatContextWindow) -> String {
        self.conversation.format_for_prompt(window)
    }

    /// Window, budget truncation, and rendering for the prompt builder.
    pub async fn build_prompt_history(&self, session_id: &str) -> String {
        let window = self.get_context_window(session_id).await;
        let budgeted = self.conversation.truncate_to_budget(&window.messages);
        self.format_for_prompt(&ChatContextWindow {
            session_id: window.session_id,
            messages: budgeted.messages,
            total_tokens: budgeted.total_tokens,
        })
    }

    /// One page of durable history. Empty in memory-only mode or on error.
    pub async fn load_session_history(
        &self,
        session_id: &str,
        query: HistoryQuery,
    ) -> Vec<ConversationMessage> {
        match &self.durable {
            Some(durable) => durable.persistence.load_session_history(session_id, query).await,
            None => Vec::new(),
        }
    }

    /// One replay cycle over the outbox. A no-op in memory-only mode.
    pub async fn replay_outbox(&self) -> ReplayReport {
        match &self.durable {
            Some(durable) => durable.replay(&self.metrics).await,
            None => ReplayReport::default(),
        }
    }

    /// Replay the outbox every `interval` until `cancel` fires.
    pub fn spawn_replay_loop(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "Outbox replay loop started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Outbox replay loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        this.replay_outbox().await;
                    }
                }
            }
        })
    }
}

impl<S, L> DurableBackend<S, L>
where
    S: ConversationStore,
    L: OutboxLog,
{
    /// Breaker-gated, time-bounded write of one turn.
    async fn write_through(
        &self,
        turn: &TurnPayload,
        metrics: &MemoryMetrics,
    ) -> Result<(), BreakerError<String>> {
        let result = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(
                    self.write_timeout,
                    self.persistence
                        .try_save_messages(&turn.session_id, &turn.messages),
                )
                .await
                {
                    Ok(saved) => saved.map_err(|e| e.to_string()),
                    Err(_) => Err(format!(
                        "durable write timed out after {}ms",
                        self.write_timeout.as_millis()
                    )),
                }
            })
            .await;

        metrics.set_breaker_state(self.breaker.state_kind());
        match &result {
            Ok(()) => MemoryMetrics::incr(&metrics.durable_writes_ok),
            Err(BreakerError::Open(_)) => MemoryMetrics::incr(&metrics.breaker_rejections),
            Err(BreakerError::Inner(_)) => MemoryMetrics::incr(&metrics.durable_writes_failed),
        }
        result
    }

    async fn persist_turn(&self, turn: TurnPayload, metrics: &MemoryMetrics) {
        match self.write_through(&turn, metrics).await {
            Ok(()) => return,
            Err(BreakerError::Open(_)) => {
                debug!(session_id = %turn.session_id, "Circuit open, routing turn to outbox");
            }
            Err(BreakerError::Inner(reason)) => {
                warn!(session_id = %turn.session_id, %reason, "Durable write failed, routing turn to outbox");
            }
        }

        let payload = match serde_json::to_value(&turn) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session_id = %turn.session_id, error = %e, "Could not serialize turn for outbox");
                return;
            }
        };
        if let Err(e) = self.outbox.enqueue(payload).await {
            warn!(session_id = %turn.session_id, error = %e, "Outbox entry is held in memory only");
        }
    }

    /// The newest `limit` messages of a session, newest first.
    async fn read_recent(
        &self,
        session_id: &str,
        limit: u32,
        metrics: &MemoryMetrics,
    ) -> Result<Vec<ConversationMessage>, BreakerError<String>> {
        let result = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(
                    self.write_timeout,
                    self.persistence
                        .try_load_session_history(session_id, HistoryQuery::new(limit, 0, true)),
                )
                .await
                {
                    Ok(loaded) => loaded.map_err(|e| e.to_string()),
                    Err(_) => Err("history read timed out".to_string()),
                }
            })
            .await;
        metrics.set_breaker_state(self.breaker.state_kind());
        if matches!(result, Err(BreakerError::Open(_))) {
            MemoryMetrics::incr(&metrics.breaker_rejections);
        }
        result
    }

    async fn deliver(&self, payload: serde_json::Value, metrics: &MemoryMetrics) -> Delivery {
        let turn: TurnPayload = match serde_json::from_value(payload) {
            Ok(turn) => turn,
            Err(e) => return Delivery::Failed(format!("undecodable turn payload: {e}")),
        };
        match self.write_through(&turn, metrics).await {
            Ok(()) => Delivery::Delivered,
            Err(BreakerError::Open(_)) => Delivery::Deferred,
            Err(BreakerError::Inner(reason)) => Delivery::Failed(reason),
        }
    }

    async fn replay(&self, metrics: &MemoryMetrics) -> ReplayReport {
        self.outbox
            .replay(|payload| self.deliver(payload, metrics))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::RetryPolicy;
    use crate::testing::{InMemoryConversationStore, InMemoryOutboxLog};
    use recall_types::chat::MessageRole;
    use recall_types::config::ConversationConfig;
    use recall_types::error::RepositoryError;

    type TestManager = HybridConversationManager<InMemoryConversationStore, InMemoryOutboxLog>;

    fn conversation(max_turns: u32) -> Arc<ConversationManager> {
        Arc::new(
            ConversationManager::new(ConversationConfig {
                max_turns,
                ..ConversationConfig::default()
            })
            .unwrap(),
        )
    }

    async fn backend<S: ConversationStore>(
        store: S,
        log: InMemoryOutboxLog,
        failure_threshold: u32,
        metrics: &Arc<MemoryMetrics>,
    ) -> DurableBackend<S, InMemoryOutboxLog> {
        let outbox = OutboxQueue::open(
            log,
            RetryPolicy {
                max_retries: 5,
                base: Duration::ZERO,
                cap: Duration::ZERO,
            },
            Arc::clone(metrics),
        )
        .await
        .unwrap();
        DurableBackend {
            persistence: Arc::new(PersistenceService::new(store)),
            breaker: Arc::new(CircuitBreaker::new(
                "conversation_store",
                failure_threshold,
                Duration::from_secs(30),
            )),
            outbox: Arc::new(outbox),
            write_timeout: Duration::from_secs(2),
        }
    }

    async fn durable_manager(failure_threshold: u32) -> TestManager {
        let metrics = Arc::new(MemoryMetrics::new());
        let durable = backend(
            InMemoryConversationStore::new(),
            InMemoryOutboxLog::new(),
            failure_threshold,
            &metrics,
        )
        .await;
        HybridConversationManager::new(conversation(3), Some(durable), metrics)
    }

    fn store(mgr: &TestManager) -> &InMemoryConversationStore {
        mgr.durable().unwrap().persistence.store()
    }

    async fn outbox_depth(mgr: &TestManager) -> usize {
        mgr.durable().unwrap().outbox.depth().await
    }

    #[tokio::test]
    async fn memory_only_mode_records_turns() {
        let mgr: TestManager =
            HybridConversationManager::memory_only(conversation(3), Arc::new(MemoryMetrics::new()));
        mgr.add_turn("s1", "What is X?", "X is...", vec![]).await;

        let window = mgr.get_context_window("s1").await;
        assert_eq!(window.messages.len(), 2);
        assert!(window.total_tokens > 0);
        assert!(!mgr.is_durable());
        assert!(mgr.load_session_history("s1", HistoryQuery::default()).await.is_empty());
        assert!(mgr.replay_outbox().await.is_idle());
    }

    #[tokio::test]
    async fn healthy_store_receives_every_turn() {
        let mgr = durable_manager(5).await;
        mgr.add_turn("s1", "q", "a", vec!["c1".into()]).await;

        assert_eq!(store(&mgr).row_count(), 2);
        assert_eq!(outbox_depth(&mgr).await, 0);
        assert_eq!(mgr.metrics().snapshot().durable_writes_ok, 1);

        let history = mgr.load_session_history("s1", HistoryQuery::default()).await;
        assert_eq!(history[1].chunk_ids, vec!["c1"]);
    }

    #[tokio::test]
    async fn failing_store_routes_turns_to_outbox_then_replay_drains() {
        let mgr = durable_manager(5).await;
        store(&mgr).set_failing(true);

        for i in 0..3 {
            mgr.add_turn("s1", &format!("q{i}"), &format!("a{i}"), vec![]).await;
        }
        assert_eq!(outbox_depth(&mgr).await, 3);
        assert_eq!(mgr.get_context_window("s1").await.messages.len(), 6);
        assert_eq!(mgr.metrics().snapshot().durable_writes_failed, 3);

        store(&mgr).set_failing(false);
        let report = mgr.replay_outbox().await;
        assert_eq!(report.delivered, 3);
        assert_eq!(outbox_depth(&mgr).await, 0);
        assert_eq!(store(&mgr).row_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_skips_store_and_defers_replay() {
        let mgr = durable_manager(2).await;
        store(&mgr).set_failing(true);

        for i in 0..3 {
            mgr.add_turn("s1", &format!("q{i}"), &format!("a{i}"), vec![]).await;
        }
        // The cold-session history read and the first write trip the
        // circuit, so later turns never reach the store.
        assert_eq!(store(&mgr).insert_calls(), 1);
        assert_eq!(outbox_depth(&mgr).await, 3);
        assert_eq!(mgr.metrics().snapshot().breaker_rejections, 2);

        store(&mgr).set_failing(false);
        let report = mgr.replay_outbox().await;
        assert_eq!(report.deferred, 3);
        assert_eq!(outbox_depth(&mgr).await, 3);

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = mgr.replay_outbox().await;
        assert_eq!(report.delivered, 3);
        assert_eq!(outbox_depth(&mgr).await, 0);
        assert_eq!(store(&mgr).row_count(), 6);
    }

    #[tokio::test]
    async fn cold_session_is_rebuilt_from_history() {
        let metrics = Arc::new(MemoryMetrics::new());
        let durable = backend(InMemoryConversationStore::new(), InMemoryOutboxLog::new(), 5, &metrics).await;
        let first: TestManager =
            HybridConversationManager::new(conversation(2), Some(durable.clone()), Arc::clone(&metrics));
        for i in 0..4 {
            first.add_turn("s1", &format!("q{i}"), &format!("a{i}"), vec![]).await;
        }

        // Fresh in-memory state over the same store, as after a restart.
        let second: TestManager = HybridConversationManager::new(conversation(2), Some(durable), metrics);
        let window = second.get_context_window("s1").await;
        let contents: Vec<_> = window.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q2", "a2", "q3", "a3"]);
        assert_eq!(window.messages[0].role, MessageRole::User);
        assert_eq!(window.total_tokens, second.conversation().count_tokens(&window.messages));
        assert_eq!(second.metrics().snapshot().rehydrations, 1);

        // Warm now: served from memory.
        second.get_context_window("s1").await;
        assert_eq!(second.metrics().snapshot().window_hits, 1);
    }

    #[tokio::test]
    async fn turn_on_cold_session_follows_stored_history() {
        let metrics = Arc::new(MemoryMetrics::new());
        let durable = backend(InMemoryConversationStore::new(), InMemoryOutboxLog::new(), 5, &metrics).await;
        let first: TestManager =
            HybridConversationManager::new(conversation(3), Some(durable.clone()), Arc::clone(&metrics));
        for i in 0..2 {
            first.add_turn("s1", &format!("q{i}"), &format!("a{i}"), vec![]).await;
        }

        // Restarted process records before it ever reads the window.
        let second: TestManager = HybridConversationManager::new(conversation(3), Some(durable), metrics);
        second.add_turn("s1", "q2", "a2", vec![]).await;

        let window = second.get_context_window("s1").await;
        let contents: Vec<_> = window.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q0", "a0", "q1", "a1", "q2", "a2"]);
        assert!(window.messages.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        let snapshot = second.metrics().snapshot();
        assert_eq!(snapshot.rehydrations, 1);
        assert_eq!(snapshot.window_hits, 1);
        assert_eq!(snapshot.window_misses, 0);
        assert_eq!(store(&second).row_count(), 6);
    }

    #[tokio::test]
    async fn unknown_cold_session_is_empty() {
        let mgr = durable_manager(5).await;
        let window = mgr.get_context_window("nobody").await;
        assert!(window.is_empty());
        assert_eq!(window.total_tokens, 0);
    }

    struct SlowStore;

    impl ConversationStore for SlowStore {
        async fn insert_messages(
            &self,
            _session_id: &str,
            _messages: &[ConversationMessage],
        ) -> Result<(), RepositoryError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn fetch_history(
            &self,
            _session_id: &str,
            _query: HistoryQuery,
        ) -> Result<Vec<ConversationMessage>, RepositoryError> {
            Ok(Vec::new())
        }

        async fn count_messages(&self, _session_id: &str) -> Result<u64, RepositoryError> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_write_times_out_into_outbox() {
        let metrics = Arc::new(MemoryMetrics::new());
        let log = InMemoryOutboxLog::new();
        let durable = backend(SlowStore, log, 5, &metrics).await;
        let outbox = Arc::clone(&durable.outbox);
        let mgr = HybridConversationManager::new(conversation(3), Some(durable), Arc::clone(&metrics));

        mgr.add_turn("s1", "q", "a", vec![]).await;
        assert_eq!(outbox.depth().await, 1);
        assert_eq!(metrics.snapshot().durable_writes_failed, 1);
        assert_eq!(
            mgr.breaker_status().unwrap().last_error.as_deref(),
            Some("durable write timed out after 2000ms")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_caller_still_hands_turn_to_outbox() {
        let metrics = Arc::new(MemoryMetrics::new());
        let durable = backend(SlowStore, InMemoryOutboxLog::new(), 5, &metrics).await;
        let outbox = Arc::clone(&durable.outbox);
        let mgr = HybridConversationManager::new(conversation(3), Some(durable), metrics);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            mgr.add_turn("s1", "q", "a", vec![]),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(mgr.conversation().get_context_window("s1").messages.len(), 2);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(outbox.depth().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_loop_drains_until_cancelled() {
        let mgr = Arc::new(durable_manager(5).await);
        store(&mgr).set_failing(true);
        mgr.add_turn("s1", "q", "a", vec![]).await;
        assert_eq!(outbox_depth(&mgr).await, 1);

        store(&mgr).set_failing(false);
        let cancel = CancellationToken::new();
        let handle = mgr.spawn_replay_loop(Duration::from_secs(1), cancel.clone());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(outbox_depth(&mgr).await, 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn build_prompt_history_uses_window() {
        let mgr = durable_manager(5).await;
        mgr.add_turn("s1", "What is a prime?", "A number with two divisors.", vec![]).await;
        let rendered = mgr.build_prompt_history("s1").await;
        assert!(rendered.contains("Student: What is a prime?"));

        let first = mgr.build_prompt_history("fresh").await;
        assert_eq!(first, crate::conversation::prompt::FIRST_INTERACTION_MARKER);
    }
}
