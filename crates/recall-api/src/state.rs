//! Application state wiring the memory layer together.
//!
//! Everything is constructed once here and shared through `Arc`s; nothing in
//! the library crates is a process-wide singleton.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use recall_core::breaker::CircuitBreaker;
use recall_core::conversation::manager::ConversationManager;
use recall_core::hybrid::{DurableBackend, HybridConversationManager};
use recall_core::metrics::MemoryMetrics;
use recall_core::outbox::{OutboxQueue, RetryPolicy};
use recall_core::persistence::PersistenceService;
use recall_infra::config::load_config;
use recall_infra::filesystem::{outbox_dir, resolve_data_dir};
use recall_infra::outbox::JsonlOutboxLog;
use recall_infra::sqlite::persistence::SqliteConversationStore;
use recall_infra::sqlite::pool::{database_url, DatabasePool};
use recall_infra::tokens::default_token_counter;
use recall_types::config::RecallConfig;

/// The hybrid manager pinned to the concrete infra adapters.
pub type ConcreteMemory = HybridConversationManager<SqliteConversationStore, JsonlOutboxLog>;

/// Name the breaker reports in status output and logs.
pub const STORE_BREAKER_NAME: &str = "conversation_store";

#[derive(Clone)]
pub struct AppState {
    pub memory: Arc<ConcreteMemory>,
    pub config: RecallConfig,
    pub data_dir: PathBuf,
    /// `None` in memory-only mode.
    pub db_pool: Option<DatabasePool>,
}

impl AppState {
    /// Initialize from the resolved data directory.
    pub async fn init() -> anyhow::Result<Self> {
        Self::init_at(&resolve_data_dir()).await
    }

    /// Load config from `data_dir`, open storage, and wire the memory layer.
    pub async fn init_at(data_dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_config(data_dir).await.context("invalid configuration")?;
        let metrics = Arc::new(MemoryMetrics::new());
        let conversation = Arc::new(ConversationManager::with_counter(
            config.conversation.clone(),
            default_token_counter(),
        )?);

        if !config.durability.enabled {
            return Ok(Self {
                memory: Arc::new(ConcreteMemory::memory_only(conversation, metrics)),
                config,
                data_dir: data_dir.to_path_buf(),
                db_pool: None,
            });
        }

        let db_url = database_url(data_dir, &config.durability.database_file);
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open database {db_url}"))?;

        let log_dir = outbox_dir(data_dir, &config);
        let log = JsonlOutboxLog::open(log_dir.clone())
            .await
            .with_context(|| format!("failed to open outbox at {}", log_dir.display()))?;
        let outbox = OutboxQueue::open(log, RetryPolicy::from(&config.outbox), Arc::clone(&metrics))
            .await
            .context("failed to recover outbox")?;

        let breaker = CircuitBreaker::from_config(STORE_BREAKER_NAME, &config.breaker);
        metrics.set_breaker_state(breaker.state_kind());

        let durable = DurableBackend {
            persistence: Arc::new(PersistenceService::new(SqliteConversationStore::new(
                db_pool.clone(),
            ))),
            breaker: Arc::new(breaker),
            outbox: Arc::new(outbox),
            write_timeout: config.durability.write_timeout(),
        };
        info!(data_dir = %data_dir.display(), "Durable conversation storage ready");

        Ok(Self {
            memory: Arc::new(ConcreteMemory::new(conversation, Some(durable), metrics)),
            config,
            data_dir: data_dir.to_path_buf(),
            db_pool: Some(db_pool),
        })
    }

    /// Close the database pools, waiting for in-flight queries.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.db_pool {
            pool.close().await;
        }
    }
}
