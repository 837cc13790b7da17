//! End-to-end: hybrid manager over SQLite and the JSONL outbox, including
//! outage, restart, and recovery.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use recall_core::breaker::CircuitBreaker;
use recall_core::conversation::manager::ConversationManager;
use recall_core::hybrid::{DurableBackend, HybridConversationManager};
use recall_core::metrics::MemoryMetrics;
use recall_core::outbox::{OutboxQueue, RetryPolicy};
use recall_core::persistence::{ConversationStore, PersistenceService};
use recall_infra::outbox::JsonlOutboxLog;
use recall_infra::sqlite::persistence::SqliteConversationStore;
use recall_infra::sqlite::pool::{database_url, DatabasePool};
use recall_types::chat::{ConversationMessage, HistoryQuery};
use recall_types::config::ConversationConfig;
use recall_types::error::RepositoryError;
use tempfile::TempDir;

/// SQLite store with a switch that simulates an outage.
struct FlakyStore {
    inner: SqliteConversationStore,
    down: Arc<AtomicBool>,
}

impl FlakyStore {
    fn check(&self) -> Result<(), RepositoryError> {
        if self.down.load(Ordering::SeqCst) {
            Err(RepositoryError::Connection)
        } else {
            Ok(())
        }
    }
}

impl ConversationStore for FlakyStore {
    async fn insert_messages(
        &self,
        session_id: &str,
        messages: &[ConversationMessage],
    ) -> Result<(), RepositoryError> {
        self.check()?;
        self.inner.insert_messages(session_id, messages).await
    }

    async fn fetch_history(
        &self,
        session_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<ConversationMessage>, RepositoryError> {
        self.check()?;
        self.inner.fetch_history(session_id, query).await
    }

    async fn count_messages(&self, session_id: &str) -> Result<u64, RepositoryError> {
        self.inner.count_messages(session_id).await
    }
}

type Manager = HybridConversationManager<FlakyStore, JsonlOutboxLog>;

async fn open_manager(data_dir: &Path, down: &Arc<AtomicBool>) -> Manager {
    let pool = DatabasePool::new(&database_url(data_dir, "recall.db"))
        .await
        .unwrap();
    let metrics = Arc::new(MemoryMetrics::new());
    let log = JsonlOutboxLog::open(data_dir.join("outbox")).await.unwrap();
    let outbox = OutboxQueue::open(
        log,
        RetryPolicy {
            max_retries: 5,
            base: Duration::ZERO,
            cap: Duration::ZERO,
        },
        Arc::clone(&metrics),
    )
    .await
    .unwrap();

    let durable = DurableBackend {
        persistence: Arc::new(PersistenceService::new(FlakyStore {
            inner: SqliteConversationStore::new(pool),
            down: Arc::clone(down),
        })),
        breaker: Arc::new(CircuitBreaker::new(
            "conversation_store",
            5,
            Duration::from_secs(30),
        )),
        outbox: Arc::new(outbox),
        write_timeout: Duration::from_secs(2),
    };
    let conversation = ConversationManager::new(ConversationConfig::default()).unwrap();
    HybridConversationManager::new(Arc::new(conversation), Some(durable), metrics)
}

async fn stored_count(mgr: &Manager, session_id: &str) -> u64 {
    mgr.durable()
        .unwrap()
        .persistence
        .count_messages(session_id)
        .await
        .unwrap()
}

async fn outbox_depth(mgr: &Manager) -> usize {
    mgr.durable().unwrap().outbox.depth().await
}

#[tokio::test]
async fn outage_buffers_turns_and_replay_drains_them() {
    let dir = TempDir::new().unwrap();
    let down = Arc::new(AtomicBool::new(true));
    let mgr = open_manager(dir.path(), &down).await;

    for i in 0..3 {
        mgr.add_turn("s1", &format!("q{i}"), &format!("a{i}"), vec![])
            .await;
    }
    assert_eq!(outbox_depth(&mgr).await, 3);
    assert_eq!(mgr.get_context_window("s1").await.messages.len(), 6);
    assert_eq!(mgr.metrics().snapshot().outbox_depth, 3);

    down.store(false, Ordering::SeqCst);
    let report = mgr.replay_outbox().await;
    assert_eq!(report.delivered, 3);
    assert_eq!(outbox_depth(&mgr).await, 0);
    assert_eq!(stored_count(&mgr, "s1").await, 6);

    let history = mgr.load_session_history("s1", HistoryQuery::default()).await;
    let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["q0", "a0", "q1", "a1", "q2", "a2"]);
}

#[tokio::test]
async fn pending_turns_survive_restart() {
    let dir = TempDir::new().unwrap();
    let down = Arc::new(AtomicBool::new(true));
    {
        let mgr = open_manager(dir.path(), &down).await;
        mgr.add_turn("s1", "before crash", "buffered", vec!["c1".into()])
            .await;
        assert_eq!(outbox_depth(&mgr).await, 1);
        mgr.durable().unwrap().persistence.store().inner.pool().close().await;
    }

    down.store(false, Ordering::SeqCst);
    let mgr = open_manager(dir.path(), &down).await;
    assert_eq!(outbox_depth(&mgr).await, 1);

    mgr.replay_outbox().await;
    assert_eq!(outbox_depth(&mgr).await, 0);

    // Rebuilt from SQLite: the new process has no in-memory state.
    let window = mgr.get_context_window("s1").await;
    assert_eq!(window.messages.len(), 2);
    assert_eq!(window.messages[0].content, "before crash");
    assert_eq!(window.messages[1].chunk_ids, vec!["c1"]);
    assert_eq!(mgr.metrics().snapshot().rehydrations, 1);
}

#[tokio::test]
async fn first_turn_after_restart_extends_stored_history() {
    let dir = TempDir::new().unwrap();
    let down = Arc::new(AtomicBool::new(false));
    {
        let mgr = open_manager(dir.path(), &down).await;
        for i in 0..2 {
            mgr.add_turn("s1", &format!("q{i}"), &format!("a{i}"), vec![])
                .await;
        }
        mgr.durable().unwrap().persistence.store().inner.pool().close().await;
    }

    let mgr = open_manager(dir.path(), &down).await;
    mgr.add_turn("s1", "q2", "a2", vec![]).await;

    let window = mgr.get_context_window("s1").await;
    let contents: Vec<_> = window.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["q0", "a0", "q1", "a1", "q2", "a2"]);
    assert_eq!(stored_count(&mgr, "s1").await, 6);

    let history = mgr.load_session_history("s1", HistoryQuery::default()).await;
    assert_eq!(history, window.messages);
}

#[tokio::test]
async fn redelivery_of_a_stored_turn_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let down = Arc::new(AtomicBool::new(false));
    let mgr = open_manager(dir.path(), &down).await;

    mgr.add_turn("s1", "q", "a", vec![]).await;
    assert_eq!(stored_count(&mgr, "s1").await, 2);

    // Same messages delivered again, as a replay after a lost ack would.
    let window = mgr.get_context_window("s1").await;
    let persistence = &mgr.durable().unwrap().persistence;
    assert!(persistence.save_messages("s1", &window.messages).await);
    assert_eq!(stored_count(&mgr, "s1").await, 2);
}
