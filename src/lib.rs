//! # Fieldsync
//!
//! Offline queue and synchronization engine for field data capture.
//! Writes made without connectivity are queued durably and replayed against
//! the remote API, in order per entity, once the device is back online.

pub mod config;
pub mod db;
pub mod engine;
pub mod sync;

pub use config::{ConfigError, EngineConfig};
pub use db::{Database, KvStore, MemoryStore};
pub use engine::{EngineError, OfflineEngine};

use std::path::PathBuf;
use std::sync::Arc;

use sync::{HttpProbe, SyncApiClient, SyncEvent};

// ============================================================================
// Host Process Entry Point
// ============================================================================

/// Run the engine headless until Ctrl-C
pub fn run() {
    // Load .env file for API settings
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            eprintln!("FATAL: Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let db_path = match resolve_db_path(&config) {
        Ok(path) => path,
        Err(e) => {
            log::error!("Failed to prepare data directory: {}", e);
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("Database path: {:?}", db_path);

    let db = match Database::new(db_path) {
        Ok(db) => db,
        Err(e) => {
            log::error!("Failed to initialize database: {}", e);
            eprintln!("FATAL: Database initialization failed: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("Database initialized successfully");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("FATAL: Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config, db)) {
        log::error!("Engine error: {}", e);
        eprintln!("FATAL: Engine error: {}", e);
        std::process::exit(1);
    }
}

fn resolve_db_path(config: &EngineConfig) -> Result<PathBuf, String> {
    let path = match &config.db_path {
        Some(path) => path.clone(),
        None => {
            let dirs = directories::ProjectDirs::from("com", "fieldsync", "fieldsync").ok_or(
                "Failed to get app directories. Please ensure HOME environment variable is set.",
            )?;
            dirs.data_dir().join("fieldsync.db")
        }
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create data directory at {:?}: {}", parent, e))?;
    }
    Ok(path)
}

async fn serve(config: EngineConfig, db: Database) -> Result<(), EngineError> {
    let api = SyncApiClient::new(&config.api_url, config.request_timeout())?;
    if let Some(token) = &config.api_token {
        api.set_token(token.clone()).await;
    }

    let probe = HttpProbe::new(config.probe_target(), config.probe_interval(), config.request_timeout());
    let engine = OfflineEngine::start(&config, Arc::new(db), Arc::new(api), Some(Arc::new(probe))).await?;

    engine.subscribe_to_sync(log_sync_event).detach();

    // Drain what an earlier run left behind
    let stats = engine.get_stats()?;
    if engine.network_state().is_online() && stats.pending_count > 0 {
        engine.trigger_sync().await;
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }

    engine.shutdown().await;
    Ok(())
}

fn log_sync_event(event: &SyncEvent) {
    match event {
        SyncEvent::ItemFailed { id, error, will_retry } => {
            log::warn!("Item {} failed ({}), will retry: {}", id, error, will_retry)
        }
        SyncEvent::ItemConflict { id, error } => {
            log::warn!("Item {} needs conflict resolution: {}", id, error)
        }
        SyncEvent::CycleAborted { cycle_id, reason } => {
            log::warn!("Cycle {} aborted: {}", cycle_id, reason)
        }
        other => log::debug!("Sync event: {}", other.name()),
    }
}
