//! Offline Queue Module - Durable log of pending operations
//!
//! Every mutating operation the app performs while offline (or before the
//! next sync) is captured here and survives process restarts.
//!
//! Features:
//! - One store key per item, single-key atomic writes only
//! - Idempotent enqueue (same key while pending collapses in place)
//! - Causal order by `enqueued_at`, ties broken by insertion sequence
//! - Retry ceiling, after which items become terminal `failed`
//! - Corrupt entries are logged and dropped, never block the queue
//! - Entries from a newer schema are skipped but kept in the store
//! - Items left `syncing` by a crash are reset to `pending` on open

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

use super::codec::{self, CodecError};
use super::models::{
    EnqueueRequest, FailureKind, QueueItem, QueueStats, QueueStatus, SyncFailure,
};
use super::retry::RetryPolicy;
use crate::db::{DbError, KvStore};

// ============================================================================
// Constants
// ============================================================================

/// Key namespace of queue entries
pub const QUEUE_PREFIX: &str = "queue/";

fn item_key(id: &str) -> String {
    format!("{}{}", QUEUE_PREFIX, id)
}

// ============================================================================
// Data Types
// ============================================================================

/// Selects items for administrative removal or manual retry
#[derive(Debug, Clone, Default)]
pub struct ClearFilter {
    /// Empty matches every status
    pub statuses: Vec<QueueStatus>,
    pub entity_type: Option<String>,
    /// Empty matches every id
    pub ids: Vec<String>,
}

impl ClearFilter {
    /// Terminal `failed` and `conflict` items
    pub fn terminal() -> Self {
        Self {
            statuses: vec![QueueStatus::Failed, QueueStatus::Conflict],
            ..Self::default()
        }
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: QueueStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn matches(&self, item: &QueueItem) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&item.status))
            && self.entity_type.as_deref().map_or(true, |t| t == item.entity_type)
            && (self.ids.is_empty() || self.ids.iter().any(|id| *id == item.id))
    }
}

/// Ordering cursor, guarded by the write lock
struct Cursor {
    seq: u64,
    last_enqueued_at: DateTime<Utc>,
}

// ============================================================================
// Durable Queue
// ============================================================================

/// Sole writer of queue state
pub struct DurableQueue {
    store: Arc<dyn KvStore>,
    policy: RetryPolicy,
    /// Serializes read-modify-write sequences within this process
    cursor: Mutex<Cursor>,
}

impl DurableQueue {
    /// Open the queue, recovering from an interrupted previous run
    pub fn open(store: Arc<dyn KvStore>, policy: RetryPolicy) -> Result<Self, QueueError> {
        let queue = Self {
            store,
            policy,
            cursor: Mutex::new(Cursor {
                seq: 0,
                last_enqueued_at: DateTime::<Utc>::MIN_UTC,
            }),
        };

        let items = queue.load_all()?;
        let mut recovered = 0;
        {
            let mut cursor = queue.lock_cursor();
            for item in &items {
                cursor.seq = cursor.seq.max(item.seq);
                cursor.last_enqueued_at = cursor.last_enqueued_at.max(item.enqueued_at);
            }
        }

        for mut item in items {
            // No attempt can be known to have completed
            if item.status == QueueStatus::Syncing {
                item.status = QueueStatus::Pending;
                queue.write(&item)?;
                recovered += 1;
            }
        }

        if recovered > 0 {
            log::warn!("Recovered {} interrupted queue items to pending", recovered);
        }
        log::info!("Offline queue opened");

        Ok(queue)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Add an operation to the queue
    ///
    /// A `pending` item with the same idempotency key is updated in place
    /// (same id, same position). A `syncing` one is left alone and the new
    /// write becomes a separate item ordered after it.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<QueueItem, QueueError> {
        if request.entity_type.trim().is_empty() || request.entity_id.trim().is_empty() {
            return Err(QueueError::InvalidRequest(
                "entity type and entity id are required".to_string(),
            ));
        }

        let key = request.resolved_idempotency_key();
        let mut cursor = self.lock_cursor();

        let existing = self
            .load_all()?
            .into_iter()
            .find(|item| item.idempotency_key == key && item.status == QueueStatus::Pending);

        if let Some(mut item) = existing {
            item.operation = request.operation;
            item.payload = request.payload;
            self.write(&item)?;

            log::info!(
                "Collapsed {} {} for {}/{} into queue item {}",
                item.operation.as_str(),
                key,
                item.entity_type,
                item.entity_id,
                item.id
            );
            return Ok(item);
        }

        // Monotonic even if the wall clock steps backwards
        let enqueued_at = Utc::now().max(cursor.last_enqueued_at);
        cursor.seq += 1;
        cursor.last_enqueued_at = enqueued_at;

        let item = QueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            operation: request.operation,
            payload: request.payload,
            idempotency_key: key,
            status: QueueStatus::Pending,
            attempt_count: 0,
            last_error: None,
            enqueued_at,
            last_attempt_at: None,
            seq: cursor.seq,
        };
        self.write(&item)?;

        log::info!(
            "Queued {} for {}/{} (id: {}, seq: {})",
            item.operation.as_str(),
            item.entity_type,
            item.entity_id,
            item.id,
            item.seq
        );
        Ok(item)
    }

    /// Pending items in queue order, optionally for one entity type
    pub fn list_pending(&self, entity_type: Option<&str>) -> Result<Vec<QueueItem>, QueueError> {
        let items = self
            .list_all()?
            .into_iter()
            .filter(|item| item.status == QueueStatus::Pending)
            .filter(|item| entity_type.map_or(true, |t| t == item.entity_type))
            .collect();
        Ok(items)
    }

    /// Every stored item in queue order
    pub fn list_all(&self) -> Result<Vec<QueueItem>, QueueError> {
        let mut items = self.load_all()?;
        items.sort_by_key(|item| item.order_key());
        Ok(items)
    }

    /// Get queue item by ID
    pub fn get(&self, id: &str) -> Result<Option<QueueItem>, QueueError> {
        let key = item_key(id);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(None);
        };
        Ok(self.decode_or_drop(&key, &raw))
    }

    /// `pending -> syncing`, stamping the attempt time
    pub fn mark_syncing(&self, id: &str) -> Result<QueueItem, QueueError> {
        let _guard = self.lock_cursor();
        let mut item = self.require(id)?;
        Self::check_transition(&item, QueueStatus::Pending, QueueStatus::Syncing)?;

        item.status = QueueStatus::Syncing;
        item.last_attempt_at = Some(Utc::now());
        self.write(&item)?;

        log::debug!("Queue item {} syncing (attempt {})", id, item.attempt_count + 1);
        Ok(item)
    }

    /// `syncing -> synced`; the item is removed
    pub fn mark_synced(&self, id: &str) -> Result<(), QueueError> {
        let _guard = self.lock_cursor();
        let item = self.require(id)?;
        Self::check_transition(&item, QueueStatus::Syncing, QueueStatus::Synced)?;

        self.store.remove(&item_key(id))?;

        log::info!("Queue item {} synced and removed", id);
        Ok(())
    }

    /// `syncing -> pending` without counting an attempt
    ///
    /// For items whose outcome could not be recorded. Returns `false` when
    /// the item is gone or no longer `syncing`.
    pub fn release_syncing(&self, id: &str) -> Result<bool, QueueError> {
        let _guard = self.lock_cursor();
        let Some(mut item) = self.get(id)? else {
            return Ok(false);
        };
        if item.status != QueueStatus::Syncing {
            return Ok(false);
        }

        item.status = QueueStatus::Pending;
        self.write(&item)?;

        log::warn!("Queue item {} released back to pending", id);
        Ok(true)
    }

    /// Record a failed attempt
    ///
    /// Retryable failures return the item to `pending` until the attempt
    /// ceiling; everything else is terminal `failed`. Auth failures are not
    /// the item's fault: it returns to `pending` and the attempt is not
    /// counted.
    pub fn mark_failed(&self, id: &str, error: SyncFailure) -> Result<QueueItem, QueueError> {
        let _guard = self.lock_cursor();
        let mut item = self.require(id)?;
        Self::check_transition(&item, QueueStatus::Syncing, QueueStatus::Failed)?;

        if error.kind == FailureKind::Auth {
            item.status = QueueStatus::Pending;
            item.last_error = Some(error);
            self.write(&item)?;
            log::info!("Queue item {} released after auth failure", id);
            return Ok(item);
        }

        item.attempt_count += 1;
        item.status = if error.kind.is_retryable() && !self.policy.exhausted(item.attempt_count) {
            QueueStatus::Pending
        } else {
            QueueStatus::Failed
        };
        log::warn!("Queue item {} failed: {}", id, error);
        item.last_error = Some(error);
        self.write(&item)?;

        if item.status == QueueStatus::Pending {
            log::info!(
                "Queue item {} will retry (attempt {}/{})",
                id,
                item.attempt_count + 1,
                self.policy.max_attempts
            );
        } else {
            log::warn!("Queue item {} is now failed after {} attempts", id, item.attempt_count);
        }

        Ok(item)
    }

    /// `syncing -> conflict`, terminal until cleared or retried
    pub fn mark_conflict(&self, id: &str, error: SyncFailure) -> Result<QueueItem, QueueError> {
        let _guard = self.lock_cursor();
        let mut item = self.require(id)?;
        Self::check_transition(&item, QueueStatus::Syncing, QueueStatus::Conflict)?;

        item.attempt_count += 1;
        item.status = QueueStatus::Conflict;
        log::warn!("Queue item {} conflicts with remote state: {}", id, error);
        item.last_error = Some(error);
        self.write(&item)?;

        Ok(item)
    }

    /// Get queue statistics
    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let items = self.load_all()?;
        Ok(QueueStats::from_items(&items, Utc::now()))
    }

    /// Administrative removal. Items currently `syncing` are never removed.
    pub fn clear(&self, filter: &ClearFilter) -> Result<usize, QueueError> {
        let _guard = self.lock_cursor();
        let mut deleted = 0;

        for item in self.load_all()? {
            if item.status == QueueStatus::Syncing || !filter.matches(&item) {
                continue;
            }
            if self.store.remove(&item_key(&item.id))? {
                deleted += 1;
            }
        }

        log::info!("Cleared {} queue items", deleted);
        Ok(deleted)
    }

    /// Reset matching terminal items for manual retry
    pub fn retry(&self, filter: &ClearFilter) -> Result<usize, QueueError> {
        let _guard = self.lock_cursor();
        let mut updated = 0;

        for mut item in self.load_all()? {
            let terminal = matches!(item.status, QueueStatus::Failed | QueueStatus::Conflict);
            if !terminal || !filter.matches(&item) {
                continue;
            }
            item.status = QueueStatus::Pending;
            item.attempt_count = 0;
            item.last_error = None;
            item.last_attempt_at = None;
            self.write(&item)?;
            updated += 1;
        }

        log::info!("Reset {} queue items for retry", updated);
        Ok(updated)
    }

    // ------------------------------------------------------------------------

    fn lock_cursor(&self) -> std::sync::MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn require(&self, id: &str) -> Result<QueueItem, QueueError> {
        self.get(id)?.ok_or_else(|| QueueError::ItemNotFound(id.to_string()))
    }

    fn check_transition(
        item: &QueueItem,
        expected: QueueStatus,
        to: QueueStatus,
    ) -> Result<(), QueueError> {
        if item.status != expected {
            return Err(QueueError::InvalidTransition {
                id: item.id.clone(),
                from: item.status,
                to,
            });
        }
        Ok(())
    }

    fn write(&self, item: &QueueItem) -> Result<(), QueueError> {
        let raw = codec::encode(item).map_err(|e| QueueError::Encode(e.to_string()))?;
        self.store.set(&item_key(&item.id), &raw)?;
        Ok(())
    }

    /// Scan every entry, dropping the ones that cannot be decoded.
    /// Entries from a newer schema are left in place.
    fn load_all(&self) -> Result<Vec<QueueItem>, QueueError> {
        let entries = self.store.list_prefix(QUEUE_PREFIX)?;
        Ok(entries
            .iter()
            .filter_map(|(key, raw)| self.decode_or_drop(key, raw))
            .collect())
    }

    fn decode_or_drop(&self, key: &str, raw: &str) -> Option<QueueItem> {
        let reason = match codec::decode(raw) {
            Ok(item) if item_key(&item.id) == key => return Some(item),
            Ok(item) => format!("entry holds item {}", item.id),
            Err(CodecError::UnsupportedSchema(version)) => {
                log::warn!("Skipping queue entry {} written by schema {}", key, version);
                return None;
            }
            Err(e) => e.to_string(),
        };

        log::warn!("Dropping corrupt queue entry {}: {}", key, reason);
        if let Err(e) = self.store.remove(key) {
            log::error!("Failed to drop corrupt queue entry {}: {}", key, e);
        }
        None
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("Failed to encode queue item: {0}")]
    Encode(String),

    #[error("Queue item not found: {0}")]
    ItemNotFound(String),

    #[error("Invalid transition for queue item {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: QueueStatus,
        to: QueueStatus,
    },

    #[error("Invalid enqueue request: {0}")]
    InvalidRequest(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, MemoryStore};
    use crate::sync::models::Operation;
    use serde_json::json;

    fn create_test_queue() -> (Arc<MemoryStore>, DurableQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = DurableQueue::open(store.clone(), RetryPolicy::default()).unwrap();
        (store, queue)
    }

    fn request(entity_id: &str, operation: Operation, payload: serde_json::Value) -> EnqueueRequest {
        EnqueueRequest::new("batch", entity_id, operation, payload)
    }

    fn assert_stats_consistent(store: &MemoryStore, queue: &DurableQueue) {
        let stats = queue.stats().unwrap();
        let sum = stats.pending_count
            + stats.syncing_count
            + stats.synced_count
            + stats.failed_count
            + stats.conflict_count;
        assert_eq!(sum, stats.total_count);
        assert_eq!(stats.total_count, store.list_prefix(QUEUE_PREFIX).unwrap().len());
    }

    #[test]
    fn test_queue_creation() {
        let (_, queue) = create_test_queue();
        let stats = queue.stats().unwrap();
        assert_eq!(stats.total_count, 0);
        assert!(stats.oldest_pending_age_secs.is_none());
    }

    #[test]
    fn test_enqueue_persists_one_key_per_item() {
        let (store, queue) = create_test_queue();

        let item = queue.enqueue(request("b-1", Operation::Create, json!({"qty": 1}))).unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.attempt_count, 0);

        let raw = store.get(&format!("queue/{}", item.id)).unwrap().unwrap();
        assert_eq!(codec::decode(&raw).unwrap(), item);
        assert_eq!(queue.stats().unwrap().pending_count, 1);
    }

    #[test]
    fn test_enqueue_rejects_missing_entity() {
        let (_, queue) = create_test_queue();
        let result = queue.enqueue(EnqueueRequest::new("", "b-1", Operation::Create, json!({})));
        assert!(matches!(result, Err(QueueError::InvalidRequest(_))));
    }

    #[test]
    fn test_idempotent_enqueue_collapses_pending() {
        let (_, queue) = create_test_queue();

        let first = queue
            .enqueue(request("b-1", Operation::Create, json!({"qty": 1})).with_idempotency_key("e1"))
            .unwrap();
        let second = queue
            .enqueue(request("b-1", Operation::Create, json!({"qty": 2})).with_idempotency_key("e1"))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.enqueued_at, second.enqueued_at);

        let pending = queue.list_pending(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, json!({"qty": 2}));
    }

    #[test]
    fn test_enqueue_while_syncing_creates_new_item() {
        let (_, queue) = create_test_queue();

        let first = queue
            .enqueue(request("b-1", Operation::Update, json!({"qty": 1})).with_idempotency_key("e1"))
            .unwrap();
        queue.mark_syncing(&first.id).unwrap();

        let second = queue
            .enqueue(request("b-1", Operation::Update, json!({"qty": 2})).with_idempotency_key("e1"))
            .unwrap();

        assert_ne!(first.id, second.id);
        assert!(second.order_key() > first.order_key());

        let pending = queue.list_pending(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
    }

    #[test]
    fn test_list_pending_order_and_filter() {
        let (_, queue) = create_test_queue();

        let a = queue.enqueue(request("b-1", Operation::Create, json!({}))).unwrap();
        let b = queue
            .enqueue(EnqueueRequest::new("inspection", "i-1", Operation::Create, json!({})))
            .unwrap();
        let c = queue.enqueue(request("b-1", Operation::Update, json!({}))).unwrap();

        let ids: Vec<_> = queue.list_pending(None).unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone(), c.id.clone()]);

        let batches: Vec<_> = queue
            .list_pending(Some("batch"))
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(batches, vec![a.id, c.id]);
    }

    #[test]
    fn test_transitions() {
        let (store, queue) = create_test_queue();
        let item = queue.enqueue(request("b-1", Operation::Create, json!({}))).unwrap();

        // Must go through syncing first
        assert!(matches!(
            queue.mark_synced(&item.id),
            Err(QueueError::InvalidTransition { .. })
        ));

        let syncing = queue.mark_syncing(&item.id).unwrap();
        assert_eq!(syncing.status, QueueStatus::Syncing);
        assert!(syncing.last_attempt_at.is_some());
        assert!(queue.list_pending(None).unwrap().is_empty());
        assert_stats_consistent(&store, &queue);

        queue.mark_synced(&item.id).unwrap();
        assert!(queue.get(&item.id).unwrap().is_none());
        assert_stats_consistent(&store, &queue);
        assert!(matches!(
            queue.mark_syncing(&item.id),
            Err(QueueError::ItemNotFound(_))
        ));
    }

    #[test]
    fn test_mark_failed_and_retry() {
        let (_, queue) = create_test_queue();
        let item = queue.enqueue(request("b-1", Operation::Update, json!({}))).unwrap();

        queue.mark_syncing(&item.id).unwrap();
        let updated = queue.mark_failed(&item.id, SyncFailure::network("timeout")).unwrap();

        assert_eq!(updated.status, QueueStatus::Pending);
        assert_eq!(updated.attempt_count, 1);
        assert_eq!(updated.last_error.unwrap().kind, FailureKind::Network);
    }

    #[test]
    fn test_max_retries() {
        let (_, queue) = create_test_queue();
        let item = queue.enqueue(request("b-1", Operation::Update, json!({}))).unwrap();

        for attempt in 1..=5 {
            queue.mark_syncing(&item.id).unwrap();
            let updated = queue.mark_failed(&item.id, SyncFailure::network("timeout")).unwrap();
            assert_eq!(updated.attempt_count, attempt);
        }

        let updated = queue.get(&item.id).unwrap().unwrap();
        assert_eq!(updated.status, QueueStatus::Failed);
        assert!(queue.list_pending(None).unwrap().is_empty());
        assert!(queue.mark_syncing(&item.id).is_err());
    }

    #[test]
    fn test_validation_failure_is_terminal() {
        let (_, queue) = create_test_queue();
        let item = queue.enqueue(request("b-1", Operation::Create, json!({}))).unwrap();

        queue.mark_syncing(&item.id).unwrap();
        let updated = queue
            .mark_failed(&item.id, SyncFailure::validation("qty must be positive"))
            .unwrap();

        assert_eq!(updated.status, QueueStatus::Failed);
        assert_eq!(updated.attempt_count, 1);
    }

    #[test]
    fn test_auth_failure_does_not_count() {
        let (_, queue) = create_test_queue();
        let item = queue.enqueue(request("b-1", Operation::Create, json!({}))).unwrap();

        queue.mark_syncing(&item.id).unwrap();
        let updated = queue.mark_failed(&item.id, SyncFailure::auth("401")).unwrap();

        assert_eq!(updated.status, QueueStatus::Pending);
        assert_eq!(updated.attempt_count, 0);
    }

    #[test]
    fn test_conflict_is_retained() {
        let (_, queue) = create_test_queue();
        let item = queue.enqueue(request("b-1", Operation::Create, json!({}))).unwrap();

        queue.mark_syncing(&item.id).unwrap();
        queue.mark_conflict(&item.id, SyncFailure::conflict("version 3 != 2")).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.conflict_count, 1);
        assert_eq!(stats.total_count, 1);
    }

    #[test]
    fn test_retry_failed_items() {
        let (_, queue) = create_test_queue();
        let item = queue.enqueue(request("b-1", Operation::Create, json!({}))).unwrap();
        queue.mark_syncing(&item.id).unwrap();
        queue.mark_failed(&item.id, SyncFailure::validation("bad")).unwrap();

        assert_eq!(queue.stats().unwrap().failed_count, 1);
        assert_eq!(queue.retry(&ClearFilter::terminal()).unwrap(), 1);

        let updated = queue.get(&item.id).unwrap().unwrap();
        assert_eq!(updated.status, QueueStatus::Pending);
        assert_eq!(updated.attempt_count, 0);
        assert!(updated.last_error.is_none());
    }

    #[test]
    fn test_clear_by_filter() {
        let (store, queue) = create_test_queue();

        let a = queue.enqueue(request("b-1", Operation::Create, json!({}))).unwrap();
        let b = queue.enqueue(request("b-2", Operation::Create, json!({}))).unwrap();
        let c = queue.enqueue(request("b-3", Operation::Create, json!({}))).unwrap();

        queue.mark_syncing(&a.id).unwrap();
        queue.mark_conflict(&a.id, SyncFailure::conflict("409")).unwrap();
        queue.mark_syncing(&b.id).unwrap();

        // Terminal only: the conflict goes, syncing and pending stay
        assert_eq!(queue.clear(&ClearFilter::terminal()).unwrap(), 1);
        // Syncing items are never cleared, even when named
        assert_eq!(queue.clear(&ClearFilter::ids([b.id.clone()])).unwrap(), 0);
        assert_eq!(queue.clear(&ClearFilter::ids([c.id.clone()])).unwrap(), 1);

        assert_eq!(queue.stats().unwrap().total_count, 1);
        assert_stats_consistent(&store, &queue);
    }

    #[test]
    fn test_corrupt_entries_are_dropped() {
        let (store, queue) = create_test_queue();
        let good = queue.enqueue(request("b-1", Operation::Create, json!({}))).unwrap();

        store.set("queue/garbage", "{not json").unwrap();
        store.set("queue/moved", &codec::encode(&good).unwrap()).unwrap();

        let pending = queue.list_pending(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, good.id);

        assert!(store.get("queue/garbage").unwrap().is_none());
        assert!(store.get("queue/moved").unwrap().is_none());
        assert_stats_consistent(&store, &queue);
    }

    #[test]
    fn test_newer_schema_entries_are_kept() {
        let (store, _) = create_test_queue();
        let future = r#"{"schema":2,"item":{"id":"x","entityType":"batch","entityId":"b-1"}}"#;
        store.set("queue/x", future).unwrap();

        let queue = DurableQueue::open(store.clone(), RetryPolicy::default()).unwrap();
        let item = queue.enqueue(request("b-2", Operation::Create, json!({}))).unwrap();

        let pending = queue.list_pending(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, item.id);
        assert!(queue.get("x").unwrap().is_none());
        assert_eq!(queue.clear(&ClearFilter::default()).unwrap(), 1);

        assert_eq!(store.get("queue/x").unwrap().as_deref(), Some(future));
    }

    #[test]
    fn test_release_syncing() {
        let (store, queue) = create_test_queue();
        let item = queue.enqueue(request("b-1", Operation::Create, json!({}))).unwrap();

        assert!(!queue.release_syncing(&item.id).unwrap());
        queue.mark_syncing(&item.id).unwrap();
        assert!(queue.release_syncing(&item.id).unwrap());

        let released = queue.get(&item.id).unwrap().unwrap();
        assert_eq!(released.status, QueueStatus::Pending);
        assert_eq!(released.attempt_count, 0);
        assert!(!queue.release_syncing("missing").unwrap());
        assert_stats_consistent(&store, &queue);
    }

    #[test]
    fn test_open_recovers_syncing_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let (first, second) = {
            let db: Arc<dyn KvStore> = Arc::new(Database::new(path.clone()).unwrap());
            let queue = DurableQueue::open(db, RetryPolicy::default()).unwrap();
            let first = queue.enqueue(request("b-1", Operation::Create, json!({}))).unwrap();
            let second = queue.enqueue(request("b-1", Operation::Update, json!({}))).unwrap();
            queue.mark_syncing(&first.id).unwrap();
            (first, second)
        };

        let db: Arc<dyn KvStore> = Arc::new(Database::new(path).unwrap());
        let queue = DurableQueue::open(db, RetryPolicy::default()).unwrap();

        let pending = queue.list_pending(None).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[1].id, second.id);

        // Sequence continues after the persisted maximum
        let third = queue.enqueue(request("b-2", Operation::Create, json!({}))).unwrap();
        assert!(third.seq > second.seq);
    }
}
