//! Background Sync Scheduler
//!
//! Starts sync cycles without a user action:
//! - On every stable transition to online (reconnect)
//! - Optionally on a periodic tick, while online with pending items
//!
//! Uses Tokio tasks for non-blocking background execution.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::listeners::Subscription;
use super::manager::SyncManager;
use super::models::{NetworkStatus, SyncResult};
use crate::db::{self, KvStore};

const CONFIG_SETTING: &str = "scheduler";
const MAX_INTERVAL_MINUTES: u64 = 1440;

/// Scheduler configuration stored in the settings namespace
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Periodic tick enabled
    pub enabled: bool,
    pub interval_minutes: u64,
    #[serde(default = "default_true")]
    pub sync_on_reconnect: bool,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            sync_on_reconnect: true,
            last_run: None,
        }
    }
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(1..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be 1-{} minutes, got {}",
            MAX_INTERVAL_MINUTES, interval_minutes
        )));
    }
    Ok(())
}

/// Background scheduler for automatic sync cycles
#[derive(Clone)]
pub struct BackgroundScheduler {
    store: Arc<dyn KvStore>,
    manager: SyncManager,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
    reconnect: Arc<StdMutex<Option<Subscription>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

impl BackgroundScheduler {
    pub fn new(store: Arc<dyn KvStore>, manager: SyncManager) -> Self {
        Self {
            store,
            manager,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
            reconnect: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from the settings namespace
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = db::get_setting(self.store.as_ref(), CONFIG_SETTING)
            .map_err(|e| SchedulerError::Database(e.to_string()))?
            .unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to the settings namespace
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        db::set_setting(self.store.as_ref(), CONFIG_SETTING, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start the reconnect trigger and, if enabled, the periodic tick
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let config = self.config.read().await.clone();
        if config.enabled {
            validate_interval(config.interval_minutes)?;
        }

        self.running.store(true, Ordering::SeqCst);

        if config.sync_on_reconnect {
            let subscription = self.watch_reconnect();
            *self.reconnect.lock().unwrap_or_else(|e| e.into_inner()) = Some(subscription);
        }

        if config.enabled {
            let scheduler = self.clone();
            let period = Duration::from_secs(60 * config.interval_minutes);
            let handle = tokio::spawn(async move {
                scheduler.scheduler_loop(period).await;
            });
            *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }

        log::info!(
            "Background scheduler started (periodic: {}, interval: {} minutes, on reconnect: {})",
            config.enabled,
            config.interval_minutes,
            config.sync_on_reconnect
        );
        Ok(())
    }

    /// Stop all automatic triggers. A cycle already running is not cancelled.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(handle) = self.task_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        if let Some(subscription) = self.reconnect.lock().unwrap_or_else(|e| e.into_inner()).take() {
            subscription.unsubscribe();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart the scheduler if it was running
    pub async fn update_config(
        &self,
        enabled: bool,
        interval_minutes: u64,
        sync_on_reconnect: bool,
    ) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
            config.sync_on_reconnect = sync_on_reconnect;
        }
        self.save_config().await?;

        if self.is_running() {
            // Ignore error if not running (race condition)
            let _ = self.stop().await;
            self.start().await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={} minutes, on reconnect={}",
            enabled,
            interval_minutes,
            sync_on_reconnect
        );
        Ok(())
    }

    fn watch_reconnect(&self) -> Subscription {
        let scheduler = self.clone();
        self.manager.monitor().subscribe(move |state| {
            if state.status != NetworkStatus::Online {
                return;
            }
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                log::warn!("Reconnected outside a Tokio runtime, sync not triggered");
                return;
            };

            let scheduler = scheduler.clone();
            runtime.spawn(async move {
                if scheduler.has_pending() {
                    log::info!("Connectivity restored, starting sync");
                    let result = scheduler.manager.trigger_sync().await;
                    scheduler.record_run(&result).await;
                }
            });
        })
    }

    /// Periodic tick loop (runs in spawned task)
    async fn scheduler_loop(&self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately; cycles start one period in
        interval.tick().await;

        log::info!("Scheduler loop started (interval: {:?})", period);

        loop {
            interval.tick().await;

            if !self.running.load(Ordering::SeqCst) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }
            if !self.manager.monitor().is_online() {
                log::debug!("Scheduled sync skipped: not online");
                continue;
            }
            if !self.has_pending() {
                continue;
            }

            log::info!("Background sync triggered by scheduler");
            let result = self.manager.trigger_sync().await;
            self.record_run(&result).await;
        }

        log::info!("Scheduler loop exited");
    }

    fn has_pending(&self) -> bool {
        match self.manager.queue().stats() {
            Ok(stats) => stats.pending_count > 0,
            Err(e) => {
                log::error!("Failed to read queue stats: {}", e);
                false
            }
        }
    }

    async fn record_run(&self, result: &SyncResult) {
        if result.is_aborted() {
            log::warn!("Background sync cycle {} aborted", result.cycle_id);
        } else {
            log::info!(
                "Background sync completed: succeeded={}, failed={}, conflicted={}, skipped={}",
                result.succeeded,
                result.failed,
                result.conflicted,
                result.skipped
            );
        }

        self.config.write().await.last_run = Some(Utc::now().to_rfc3339());
        if let Err(e) = self.save_config().await {
            log::error!("Failed to save last_run timestamp: {}", e);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
