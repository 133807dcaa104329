//! Sync Module - Offline Queue and Synchronization
//!
//! Captures mutating operations while the device is offline and replays
//! them against the remote API once connectivity returns:
//! - Durable queue (one store key per item, survives restarts)
//! - Debounced connectivity monitor
//! - Sync orchestrator (per-entity ordering, bounded concurrency)
//! - Background scheduler (sync on reconnect, optional periodic tick)
//!
//! Architecture:
//! - At-least-once delivery: the idempotency key lets the server drop replays
//! - Per-item retry with exponential backoff, evaluated across cycles
//! - Conflicts are surfaced, never resolved automatically

pub mod api;
pub mod codec;
pub mod listeners;
pub mod manager;
pub mod models;
pub mod network;
pub mod queue;
pub mod retry;
pub mod scheduler;


// Re-export commonly used types
pub use api::{RemoteApi, SyncApiClient, SyncApiError, IDEMPOTENCY_HEADER};
pub use listeners::{ListenerSet, Subscription};
pub use manager::{SyncManager, SyncSettings};
pub use models::{
    idempotency_key, AbortReason, CycleOutcome, EnqueueRequest, EntityKey, FailureKind,
    ItemOutcome, ItemSyncResult, NetworkState, NetworkStatus, Operation, QueueItem, QueueStats,
    QueueStatus, SkipReason, SyncEvent, SyncFailure, SyncResult,
};
pub use network::{ChannelSource, ConnectivityError, ConnectivitySource, HttpProbe, NetworkMonitor};
pub use queue::{ClearFilter, DurableQueue, QueueError};
pub use retry::RetryPolicy;
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
