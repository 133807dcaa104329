//! Offline engine facade
//!
//! The operations the UI layer calls: enqueue, stats, manual sync, and
//! subscriptions to sync progress and connectivity.

use std::sync::Arc;

use crate::config::{ConfigError, EngineConfig};
use crate::db::{DbError, KvStore};
use crate::sync::api::{RemoteApi, SyncApiError};
use crate::sync::listeners::Subscription;
use crate::sync::manager::SyncManager;
use crate::sync::models::{EnqueueRequest, NetworkState, QueueItem, QueueStats, SyncEvent, SyncResult};
use crate::sync::network::{ConnectivitySource, NetworkMonitor};
use crate::sync::queue::{ClearFilter, DurableQueue, QueueError};
use crate::sync::scheduler::{BackgroundScheduler, SchedulerError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Api(#[from] SyncApiError),

    #[error(transparent)]
    Database(#[from] DbError),
}

pub struct OfflineEngine {
    queue: Arc<DurableQueue>,
    monitor: NetworkMonitor,
    manager: SyncManager,
    scheduler: BackgroundScheduler,
    pending_warn_threshold: usize,
}

impl OfflineEngine {
    /// Open the queue, start the connectivity monitor and the scheduler
    ///
    /// Without a source the monitor stays `unknown`: no automatic cycles,
    /// manual sync still attempts.
    pub async fn start(
        config: &EngineConfig,
        store: Arc<dyn KvStore>,
        api: Arc<dyn RemoteApi>,
        source: Option<Arc<dyn ConnectivitySource>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let queue = Arc::new(DurableQueue::open(store.clone(), config.retry.clone())?);
        let monitor = match source {
            Some(source) => NetworkMonitor::start(source, config.debounce()).await,
            None => NetworkMonitor::new(config.debounce()),
        };
        let manager = SyncManager::new(queue.clone(), api, monitor.clone(), config.sync_settings());

        let scheduler = BackgroundScheduler::new(store, manager.clone());
        scheduler.load_config().await?;
        if config.sync_interval_minutes > 0 {
            let current = scheduler.get_config().await;
            scheduler
                .update_config(true, config.sync_interval_minutes, current.sync_on_reconnect)
                .await?;
        }
        scheduler.start().await?;

        let stats = queue.stats()?;
        log::info!(
            "Offline engine started: {} pending, {} needing attention",
            stats.pending_count,
            stats.needs_attention()
        );

        Ok(Self {
            queue,
            monitor,
            manager,
            scheduler,
            pending_warn_threshold: config.pending_warn_threshold,
        })
    }

    /// Record an operation for later delivery
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<QueueItem, EngineError> {
        let item = self.queue.enqueue(request)?;

        let stats = self.queue.stats()?;
        if stats.over_threshold(self.pending_warn_threshold) {
            log::warn!(
                "Offline queue backlog: {} pending items (threshold {})",
                stats.pending_count,
                self.pending_warn_threshold
            );
        }
        Ok(item)
    }

    pub fn get_stats(&self) -> Result<QueueStats, EngineError> {
        Ok(self.queue.stats()?)
    }

    pub fn subscribe_to_sync<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.manager.subscribe(listener)
    }

    /// Manual sync; joins a running cycle instead of starting a second one
    pub async fn trigger_sync(&self) -> SyncResult {
        self.manager.trigger_sync().await
    }

    pub fn cancel_sync(&self) -> bool {
        self.manager.cancel_sync()
    }

    pub fn is_syncing(&self) -> bool {
        self.manager.is_running()
    }

    pub fn subscribe_to_network<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&NetworkState) + Send + Sync + 'static,
    {
        self.monitor.subscribe(listener)
    }

    pub fn network_state(&self) -> NetworkState {
        self.monitor.snapshot()
    }

    pub fn list_pending(&self, entity_type: Option<&str>) -> Result<Vec<QueueItem>, EngineError> {
        Ok(self.queue.list_pending(entity_type)?)
    }

    /// Every stored item, including those needing attention
    pub fn list_items(&self) -> Result<Vec<QueueItem>, EngineError> {
        Ok(self.queue.list_all()?)
    }

    pub fn get(&self, id: &str) -> Result<Option<QueueItem>, EngineError> {
        Ok(self.queue.get(id)?)
    }

    /// Dismiss items, e.g. an acknowledged conflict
    pub fn clear(&self, filter: &ClearFilter) -> Result<usize, EngineError> {
        Ok(self.queue.clear(filter)?)
    }

    /// Put failed or conflicting items back in line
    pub fn retry(&self, filter: &ClearFilter) -> Result<usize, EngineError> {
        Ok(self.queue.retry(filter)?)
    }

    pub fn scheduler(&self) -> &BackgroundScheduler {
        &self.scheduler
    }

    /// Stop automatic triggers, abort a running cycle and detach from the
    /// connectivity source. Requests already sent are still recorded.
    pub async fn shutdown(&self) {
        if let Err(e) = self.scheduler.stop().await {
            log::debug!("Scheduler stop: {}", e);
        }
        self.manager.cancel_sync();
        self.monitor.stop();
        log::info!("Offline engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::sync::models::{NetworkStatus, Operation, QueueStatus};
    use crate::sync::network::ChannelSource;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteApi for Recorder {
        async fn push(&self, item: &QueueItem) -> Result<(), SyncApiError> {
            self.seen.lock().unwrap().push(item.entity_id.clone());
            Ok(())
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            api_url: "https://api.example.com".to_string(),
            debounce_ms: 0,
            pending_warn_threshold: 1,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_manual_sync() {
        let api = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let engine = OfflineEngine::start(&config(), Arc::new(MemoryStore::new()), api.clone(), None)
            .await
            .unwrap();

        engine
            .enqueue(EnqueueRequest::new("batch", "b1", Operation::Create, serde_json::json!({})))
            .unwrap();
        engine
            .enqueue(EnqueueRequest::new("batch", "b2", Operation::Create, serde_json::json!({})))
            .unwrap();
        assert_eq!(engine.get_stats().unwrap().pending_count, 2);
        assert_eq!(engine.network_state().status, NetworkStatus::Unknown);

        let result = engine.trigger_sync().await;
        assert_eq!(result.succeeded, 2);
        assert_eq!(engine.get_stats().unwrap().total_count, 0);
        assert_eq!(api.seen.lock().unwrap().len(), 2);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_network_subscription() {
        let (source, tx) = ChannelSource::new(NetworkStatus::Offline);
        let api = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let engine = OfflineEngine::start(
            &config(),
            Arc::new(MemoryStore::new()),
            api,
            Some(Arc::new(source)),
        )
        .await
        .unwrap();
        assert_eq!(engine.network_state().status, NetworkStatus::Offline);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = engine.subscribe_to_network(move |state| seen2.lock().unwrap().push(state.status));

        tx.send(NetworkStatus::Online).unwrap();
        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![NetworkStatus::Online]);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_admin_operations() {
        let api = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let engine = OfflineEngine::start(&config(), Arc::new(MemoryStore::new()), api, None)
            .await
            .unwrap();

        let item = engine
            .enqueue(EnqueueRequest::new("batch", "b1", Operation::Update, serde_json::json!({})))
            .unwrap();
        assert_eq!(engine.get(&item.id).unwrap().map(|i| i.status), Some(QueueStatus::Pending));
        assert_eq!(engine.list_items().unwrap().len(), 1);

        assert_eq!(engine.retry(&ClearFilter::terminal()).unwrap(), 0);
        assert_eq!(engine.clear(&ClearFilter::ids([item.id.clone()])).unwrap(), 1);
        assert!(engine.get(&item.id).unwrap().is_none());

        engine.shutdown().await;
    }
}
