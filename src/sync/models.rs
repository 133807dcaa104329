//! Sync Data Models - Offline Queue Structures
//!
//! Defines the data structures shared by the queue, the connectivity monitor
//! and the sync orchestrator.
//!
//! Data Categories:
//! - QueueItem: one deferred mutating operation
//! - QueueStats: derived counters, never persisted
//! - NetworkState: debounced connectivity view, never persisted
//! - SyncResult / SyncEvent: output of one sync cycle

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// ============================================================================
// Queue Items
// ============================================================================

/// Mutating operation carried by a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Queue item status
///
/// Transitions: `pending -> syncing -> {synced | failed | conflict}`,
/// `failed -> pending` while retries remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
    Conflict,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
        }
    }

    /// No automatic transition leaves these states
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Synced | Self::Failed | Self::Conflict)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Timeout, connection failure, throttling or server fault
    Network,
    /// Rejected payload (4xx)
    Validation,
    /// Optimistic-concurrency clash (409)
    Conflict,
    /// 401/403, aborts the whole cycle
    Auth,
    /// Corrupt or unreadable persisted entry
    Storage,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network)
    }
}

/// Last classified failure of a queue item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SyncFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Conflict, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Auth, message)
    }
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Logical entity an item targets; the unit of causal ordering
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Queue item stored under its own key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Unique for the item's lifetime (UUID v4)
    pub id: String,

    /// Business entity tag, opaque to the engine
    pub entity_type: String,

    /// Client-side logical id of the entity
    pub entity_id: String,

    pub operation: Operation,

    /// Request body, opaque to the engine
    pub payload: serde_json::Value,

    pub idempotency_key: String,

    pub status: QueueStatus,

    #[serde(default)]
    pub attempt_count: u32,

    #[serde(default)]
    pub last_error: Option<SyncFailure>,

    pub enqueued_at: DateTime<Utc>,

    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Insertion sequence, breaks `enqueued_at` ties
    #[serde(default)]
    pub seq: u64,
}

impl QueueItem {
    pub fn entity_key(&self) -> EntityKey {
        EntityKey {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
        }
    }

    /// Queue order: `enqueued_at` ascending, then insertion sequence
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.enqueued_at, self.seq)
    }
}

/// Request to enqueue one operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: serde_json::Value,

    /// Derived from entity type, id and operation when absent
    pub idempotency_key: Option<String>,
}

impl EnqueueRequest {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn resolved_idempotency_key(&self) -> String {
        self.idempotency_key
            .clone()
            .unwrap_or_else(|| idempotency_key(&self.entity_type, &self.entity_id, self.operation))
    }
}

/// Deterministic key for a logical intent (hex SHA-256)
pub fn idempotency_key(entity_type: &str, entity_id: &str, operation: Operation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(entity_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(operation.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Queue Statistics
// ============================================================================

/// Queue statistics, recomputed from a scan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: usize,
    pub syncing_count: usize,
    /// Always zero in practice: synced items are removed
    pub synced_count: usize,
    pub failed_count: usize,
    pub conflict_count: usize,
    pub total_count: usize,
    /// Age of the oldest pending item in seconds
    pub oldest_pending_age_secs: Option<i64>,
}

impl QueueStats {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a QueueItem>, now: DateTime<Utc>) -> Self {
        let mut stats = QueueStats::default();
        let mut oldest: Option<DateTime<Utc>> = None;

        for item in items {
            stats.total_count += 1;
            match item.status {
                QueueStatus::Pending => {
                    stats.pending_count += 1;
                    oldest = Some(oldest.map_or(item.enqueued_at, |o| o.min(item.enqueued_at)));
                }
                QueueStatus::Syncing => stats.syncing_count += 1,
                QueueStatus::Synced => stats.synced_count += 1,
                QueueStatus::Failed => stats.failed_count += 1,
                QueueStatus::Conflict => stats.conflict_count += 1,
            }
        }

        stats.oldest_pending_age_secs = oldest.map(|o| (now - o).num_seconds().max(0));
        stats
    }

    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.oldest_pending_age_secs.map(Duration::seconds)
    }

    /// Items still needing user attention
    pub fn needs_attention(&self) -> usize {
        self.failed_count + self.conflict_count
    }

    /// Backpressure signal for the UI
    pub fn over_threshold(&self, threshold: usize) -> bool {
        self.pending_count > threshold
    }
}

// ============================================================================
// Network State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub status: NetworkStatus,
    pub changed_at: DateTime<Utc>,
}

impl NetworkState {
    pub fn unknown() -> Self {
        Self { status: NetworkStatus::Unknown, changed_at: Utc::now() }
    }

    pub fn is_online(&self) -> bool {
        self.status == NetworkStatus::Online
    }
}

// ============================================================================
// Sync Cycle Output
// ============================================================================

/// Why an item was not attempted this cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SkipReason {
    /// An earlier item of the same entity did not reach success
    BlockedBy { id: String, status: QueueStatus },
    /// Retry delay since the last attempt has not elapsed
    BackingOff { until: DateTime<Utc> },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockedBy { id, status } => write!(f, "blocked by {} item {}", status, id),
            Self::BackingOff { until } => write!(f, "backing off until {}", until.to_rfc3339()),
        }
    }
}

/// Per-item outcome of one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ItemOutcome {
    Synced,
    Failed { error: SyncFailure, will_retry: bool },
    Conflict { error: SyncFailure },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSyncResult {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub outcome: ItemOutcome,
}

impl ItemSyncResult {
    pub fn new(item: &QueueItem, outcome: ItemOutcome) -> Self {
        Self {
            id: item.id.clone(),
            entity_type: item.entity_type.clone(),
            entity_id: item.entity_id.clone(),
            operation: item.operation,
            outcome,
        }
    }
}

/// Why a cycle stopped early
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AbortReason {
    /// Connectivity monitor reported offline mid-cycle
    Offline,
    /// Remote rejected credentials; re-authentication required
    Auth { message: String },
    /// Cancelled by the caller
    Cancelled,
    Internal { message: String },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => f.write_str("connectivity lost"),
            Self::Auth { message } => write!(f, "authentication required: {}", message),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CycleOutcome {
    Completed,
    Aborted { reason: AbortReason },
}

/// Result of one sync cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub cycle_id: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items: Vec<ItemSyncResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub conflicted: usize,
    pub skipped: usize,
    pub outcome: CycleOutcome,
}

impl SyncResult {
    pub fn new(
        cycle_id: u64,
        started_at: DateTime<Utc>,
        items: Vec<ItemSyncResult>,
        outcome: CycleOutcome,
    ) -> Self {
        let mut result = Self {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            items: Vec::new(),
            succeeded: 0,
            failed: 0,
            conflicted: 0,
            skipped: 0,
            outcome,
        };

        for item in &items {
            match item.outcome {
                ItemOutcome::Synced => result.succeeded += 1,
                ItemOutcome::Failed { .. } => result.failed += 1,
                ItemOutcome::Conflict { .. } => result.conflicted += 1,
                ItemOutcome::Skipped { .. } => result.skipped += 1,
            }
        }
        result.items = items;
        result
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Aborted { .. })
    }

    pub fn outcome_of(&self, id: &str) -> Option<&ItemOutcome> {
        self.items.iter().find(|i| i.id == id).map(|i| &i.outcome)
    }
}

/// Progress events, delivered in order:
/// `cycle-started`, item events, then one of `cycle-completed`/`cycle-aborted`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    CycleStarted { cycle_id: u64 },
    ItemSynced { id: String },
    ItemFailed { id: String, error: SyncFailure, will_retry: bool },
    ItemConflict { id: String, error: SyncFailure },
    ItemSkipped { id: String, reason: SkipReason },
    CycleCompleted { result: SyncResult },
    CycleAborted { cycle_id: u64, reason: AbortReason },
}

impl SyncEvent {
    pub fn for_item(result: &ItemSyncResult) -> Self {
        let id = result.id.clone();
        match &result.outcome {
            ItemOutcome::Synced => Self::ItemSynced { id },
            ItemOutcome::Failed { error, will_retry } => Self::ItemFailed {
                id,
                error: error.clone(),
                will_retry: *will_retry,
            },
            ItemOutcome::Conflict { error } => Self::ItemConflict { id, error: error.clone() },
            ItemOutcome::Skipped { reason } => Self::ItemSkipped { id, reason: reason.clone() },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CycleStarted { .. } => "cycle-started",
            Self::ItemSynced { .. } => "item-synced",
            Self::ItemFailed { .. } => "item-failed",
            Self::ItemConflict { .. } => "item-conflict",
            Self::ItemSkipped { .. } => "item-skipped",
            Self::CycleCompleted { .. } => "cycle-completed",
            Self::CycleAborted { .. } => "cycle-aborted",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn item(status: QueueStatus, enqueued_at: DateTime<Utc>) -> QueueItem {
        QueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: "batch".to_string(),
            entity_id: "b-1".to_string(),
            operation: Operation::Create,
            payload: serde_json::json!({}),
            idempotency_key: "k".to_string(),
            status,
            attempt_count: 0,
            last_error: None,
            enqueued_at,
            last_attempt_at: None,
            seq: 0,
        }
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let a = idempotency_key("batch", "b-1", Operation::Update);
        let b = idempotency_key("batch", "b-1", Operation::Update);
        let c = idempotency_key("batch", "b-1", Operation::Create);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);

        // Field boundaries are part of the key
        assert_ne!(
            idempotency_key("ab", "c", Operation::Create),
            idempotency_key("a", "bc", Operation::Create)
        );
    }

    #[test]
    fn test_stats_from_items() {
        let now = Utc::now();
        let items = vec![
            item(QueueStatus::Pending, now - Duration::seconds(120)),
            item(QueueStatus::Pending, now - Duration::seconds(10)),
            item(QueueStatus::Failed, now),
            item(QueueStatus::Conflict, now),
            item(QueueStatus::Syncing, now),
        ];

        let stats = QueueStats::from_items(&items, now);
        assert_eq!(stats.pending_count, 2);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.conflict_count, 1);
        assert_eq!(stats.syncing_count, 1);
        assert_eq!(stats.total_count, 5);
        assert_eq!(stats.oldest_pending_age_secs, Some(120));
        assert_eq!(stats.needs_attention(), 2);
        assert!(stats.over_threshold(1));
        assert!(!stats.over_threshold(2));
    }

    #[test]
    fn test_event_wire_names() {
        let event = SyncEvent::ItemSkipped {
            id: "x".to_string(),
            reason: SkipReason::BlockedBy { id: "y".to_string(), status: QueueStatus::Conflict },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "item-skipped");
        assert_eq!(json["reason"]["type"], "blocked-by");
        assert_eq!(event.name(), "item-skipped");
    }

    #[test]
    fn test_result_counts() {
        let now = Utc::now();
        let a = item(QueueStatus::Syncing, now);
        let b = item(QueueStatus::Syncing, now);
        let c = item(QueueStatus::Pending, now);

        let result = SyncResult::new(
            1,
            now,
            vec![
                ItemSyncResult::new(&a, ItemOutcome::Synced),
                ItemSyncResult::new(&b, ItemOutcome::Conflict { error: SyncFailure::conflict("409") }),
                ItemSyncResult::new(&c, ItemOutcome::Skipped {
                    reason: SkipReason::BlockedBy { id: b.id.clone(), status: QueueStatus::Conflict },
                }),
            ],
            CycleOutcome::Completed,
        );

        assert_eq!(result.succeeded, 1);
        assert_eq!(result.conflicted, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.failed, 0);
        assert!(!result.is_aborted());
        assert_eq!(result.outcome_of(&a.id), Some(&ItemOutcome::Synced));
    }
}
