//! Sync Manager - Orchestrates synchronization cycles
//!
//! Drains the offline queue against the remote API:
//! - One cycle at a time per manager; a second trigger joins the running one
//! - Items of one entity go strictly in queue order, one request at a time
//! - Independent entities run concurrently up to the configured limit
//! - A failure that leaves an entity's item unsynced skips the rest of that
//!   entity for the cycle
//! - Going offline, an auth failure, or cancellation aborts the cycle;
//!   requests already sent still have their outcome written to the queue

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::api::{RemoteApi, SyncApiError};
use super::listeners::{ListenerSet, Subscription};
use super::models::{
    AbortReason, CycleOutcome, EntityKey, FailureKind, ItemOutcome, ItemSyncResult,
    NetworkStatus, QueueItem, QueueStatus, SkipReason, SyncEvent, SyncFailure, SyncResult,
};
use super::network::NetworkMonitor;
use super::queue::{DurableQueue, QueueError};
use super::retry::RetryPolicy;

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Entities synced concurrently
    pub concurrency: usize,
    /// Per-request bound; expiry counts as a network failure
    pub request_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

// ============================================================================
// Cycle Control
// ============================================================================

struct CycleControl {
    token: CancellationToken,
    /// First abort reason wins
    reason: OnceLock<AbortReason>,
}

impl CycleControl {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    fn abort(&self, reason: AbortReason) {
        if self.reason.set(reason.clone()).is_ok() {
            log::warn!("Aborting sync cycle: {}", reason);
        }
        self.token.cancel();
    }

    fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    fn reason(&self) -> AbortReason {
        self.reason.get().cloned().unwrap_or(AbortReason::Cancelled)
    }
}

struct RunningCycle {
    cycle_id: u64,
    control: Arc<CycleControl>,
    result: Shared<BoxFuture<'static, SyncResult>>,
}

type CycleSlot = Arc<StdMutex<Option<RunningCycle>>>;

/// Items left `syncing` because their outcome could not be recorded
type Stranded = Arc<StdMutex<HashSet<String>>>;

fn release_slot(slot: &StdMutex<Option<RunningCycle>>, cycle_id: u64) {
    let mut running = slot.lock().unwrap_or_else(|e| e.into_inner());
    if running.as_ref().map(|c| c.cycle_id) == Some(cycle_id) {
        *running = None;
    }
}

/// Frees the running slot even if the cycle task unwinds
struct CycleRelease {
    slot: CycleSlot,
    cycle_id: u64,
}

impl Drop for CycleRelease {
    fn drop(&mut self) {
        release_slot(&self.slot, self.cycle_id);
    }
}

// ============================================================================
// Cycle Planning
// ============================================================================

#[derive(Debug, Default)]
struct CyclePlan {
    /// Per-entity runs of due items, in queue order
    lines: Vec<Vec<QueueItem>>,
    skipped: Vec<ItemSyncResult>,
}

/// Split queue items (already in queue order) into per-entity lines
///
/// An entity is blocked from its first item that cannot be sent now: one
/// still in flight, one terminal `failed`/`conflict`, or one backing off.
/// Pending items behind the blocker are reported as skipped.
fn plan_cycle(items: &[QueueItem], policy: &RetryPolicy, now: DateTime<Utc>) -> CyclePlan {
    let mut plan = CyclePlan::default();
    let mut line_of: HashMap<EntityKey, usize> = HashMap::new();
    let mut blocked: HashMap<EntityKey, (String, QueueStatus)> = HashMap::new();

    for item in items {
        let key = item.entity_key();

        if let Some((id, status)) = blocked.get(&key) {
            if item.status == QueueStatus::Pending {
                plan.skipped.push(ItemSyncResult::new(
                    item,
                    ItemOutcome::Skipped {
                        reason: SkipReason::BlockedBy { id: id.clone(), status: *status },
                    },
                ));
            }
            continue;
        }

        match item.status {
            QueueStatus::Pending if policy.is_due(item, now) => {
                let lines = &mut plan.lines;
                let index = *line_of.entry(key).or_insert_with(|| {
                    lines.push(Vec::new());
                    lines.len() - 1
                });
                plan.lines[index].push(item.clone());
            }
            QueueStatus::Pending => {
                let until = policy.next_attempt_at(item).unwrap_or(now);
                plan.skipped.push(ItemSyncResult::new(
                    item,
                    ItemOutcome::Skipped { reason: SkipReason::BackingOff { until } },
                ));
                blocked.insert(key, (item.id.clone(), item.status));
            }
            QueueStatus::Syncing | QueueStatus::Failed | QueueStatus::Conflict => {
                blocked.insert(key, (item.id.clone(), item.status));
            }
            QueueStatus::Synced => {}
        }
    }

    plan
}

// ============================================================================
// Dispatch
// ============================================================================

enum Dispatched {
    Recorded(ItemSyncResult),
    /// Credentials rejected; the item went back to pending
    AuthRejected(SyncFailure),
}

enum Attempt {
    Finished(ItemSyncResult),
    /// Item was removed or changed state before dispatch
    Gone,
    /// Cycle aborted; stop the line
    Stopped,
}

/// Send one item and write the outcome back to the queue
async fn dispatch(
    queue: Arc<DurableQueue>,
    api: Arc<dyn RemoteApi>,
    item: QueueItem,
    timeout: Duration,
) -> Result<Dispatched, QueueError> {
    let response = match tokio::time::timeout(timeout, api.push(&item)).await {
        Ok(response) => response,
        Err(_) => Err(SyncApiError::Timeout),
    };

    let error = match response {
        Ok(()) => {
            queue.mark_synced(&item.id)?;
            return Ok(Dispatched::Recorded(ItemSyncResult::new(&item, ItemOutcome::Synced)));
        }
        Err(e) => e,
    };

    let failure = error.to_failure();
    let outcome = match failure.kind {
        FailureKind::Auth => {
            queue.mark_failed(&item.id, failure.clone())?;
            return Ok(Dispatched::AuthRejected(failure));
        }
        FailureKind::Conflict => {
            queue.mark_conflict(&item.id, failure.clone())?;
            ItemOutcome::Conflict { error: failure }
        }
        _ => {
            let updated = queue.mark_failed(&item.id, failure.clone())?;
            ItemOutcome::Failed {
                error: failure,
                will_retry: updated.status == QueueStatus::Pending,
            }
        }
    };

    Ok(Dispatched::Recorded(ItemSyncResult::new(&item, outcome)))
}

/// Queue status an outcome leaves the item in
fn status_after(outcome: &ItemOutcome) -> QueueStatus {
    match outcome {
        ItemOutcome::Synced => QueueStatus::Synced,
        ItemOutcome::Failed { will_retry: true, .. } | ItemOutcome::Skipped { .. } => {
            QueueStatus::Pending
        }
        ItemOutcome::Failed { will_retry: false, .. } => QueueStatus::Failed,
        ItemOutcome::Conflict { .. } => QueueStatus::Conflict,
    }
}

/// Put an item whose outcome was lost back to `pending`, or remember it for
/// the next cycle if the store refuses that too
fn release_or_strand(queue: &DurableQueue, stranded: &StdMutex<HashSet<String>>, id: String) {
    if let Err(e) = queue.release_syncing(&id) {
        log::error!("Failed to release queue item {}: {}", id, e);
        stranded.lock().unwrap_or_else(|p| p.into_inner()).insert(id);
    }
}

// ============================================================================
// Sync Manager
// ============================================================================

/// Sync manager - drives the queue against the remote API
#[derive(Clone)]
pub struct SyncManager {
    queue: Arc<DurableQueue>,
    api: Arc<dyn RemoteApi>,
    monitor: NetworkMonitor,
    settings: SyncSettings,
    events: ListenerSet<SyncEvent>,
    running: CycleSlot,
    stranded: Stranded,
    cycle_counter: Arc<AtomicU64>,
}

impl SyncManager {
    pub fn new(
        queue: Arc<DurableQueue>,
        api: Arc<dyn RemoteApi>,
        monitor: NetworkMonitor,
        settings: SyncSettings,
    ) -> Self {
        Self {
            queue,
            api,
            monitor,
            settings,
            events: ListenerSet::new(),
            running: Arc::new(StdMutex::new(None)),
            stranded: Arc::new(StdMutex::new(HashSet::new())),
            cycle_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    /// Observe cycle progress. No replay of earlier events.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Run a sync cycle, or join the one already running
    ///
    /// Item-level failures are reported in the result, never as errors.
    /// The cycle runs on its own task: dropping this future does not stop it.
    pub async fn trigger_sync(&self) -> SyncResult {
        let result = {
            let mut running = self.lock_running();
            match running.as_ref() {
                Some(cycle) => {
                    log::info!("Sync cycle {} already running, joining it", cycle.cycle_id);
                    cycle.result.clone()
                }
                None => {
                    let cycle_id = self.cycle_counter.fetch_add(1, Ordering::SeqCst) + 1;
                    let control = Arc::new(CycleControl::new());

                    let manager = self.clone();
                    let task_control = control.clone();
                    let handle = tokio::spawn(async move {
                        manager.run_cycle(cycle_id, task_control).await
                    });

                    let manager = self.clone();
                    let result = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => manager.fail_cycle(cycle_id, e.to_string()),
                        }
                    }
                    .boxed()
                    .shared();

                    *running = Some(RunningCycle {
                        cycle_id,
                        control,
                        result: result.clone(),
                    });
                    result
                }
            }
        };

        result.await
    }

    /// Abort the running cycle, if any
    pub fn cancel_sync(&self) -> bool {
        match self.lock_running().as_ref() {
            Some(cycle) => {
                cycle.control.abort(AbortReason::Cancelled);
                true
            }
            None => false,
        }
    }

    async fn run_cycle(&self, cycle_id: u64, control: Arc<CycleControl>) -> SyncResult {
        let _release = CycleRelease {
            slot: self.running.clone(),
            cycle_id,
        };
        let started_at = Utc::now();

        log::info!("Sync cycle {} started", cycle_id);
        self.events.emit(&SyncEvent::CycleStarted { cycle_id });

        let offline_control = control.clone();
        let _offline = self.monitor.subscribe(move |state| {
            if state.status == NetworkStatus::Offline {
                offline_control.abort(AbortReason::Offline);
            }
        });

        self.release_stranded();

        let mut results = Vec::new();
        match self.queue.list_all() {
            Ok(items) => {
                let plan = plan_cycle(&items, self.queue.policy(), Utc::now());
                log::info!(
                    "Sync cycle {}: {} entities to sync, {} items skipped",
                    cycle_id,
                    plan.lines.len(),
                    plan.skipped.len()
                );

                for skipped in plan.skipped {
                    self.events.emit(&SyncEvent::for_item(&skipped));
                    results.push(skipped);
                }

                let line_results: Vec<Vec<ItemSyncResult>> = stream::iter(plan.lines)
                    .map(|line| self.sync_line(line, control.clone()))
                    .buffer_unordered(self.settings.concurrency.max(1))
                    .collect()
                    .await;
                results.extend(line_results.into_iter().flatten());
            }
            Err(e) => control.abort(AbortReason::Internal { message: e.to_string() }),
        }

        let outcome = if control.is_aborted() {
            CycleOutcome::Aborted { reason: control.reason() }
        } else {
            CycleOutcome::Completed
        };
        let result = SyncResult::new(cycle_id, started_at, results, outcome);

        match &result.outcome {
            CycleOutcome::Completed => {
                log::info!(
                    "Sync cycle {} completed: succeeded={}, failed={}, conflicted={}, skipped={}",
                    cycle_id,
                    result.succeeded,
                    result.failed,
                    result.conflicted,
                    result.skipped
                );
                self.events.emit(&SyncEvent::CycleCompleted { result: result.clone() });
            }
            CycleOutcome::Aborted { reason } => {
                log::warn!(
                    "Sync cycle {} aborted ({}) after {} succeeded",
                    cycle_id,
                    reason,
                    result.succeeded
                );
                self.events.emit(&SyncEvent::CycleAborted {
                    cycle_id,
                    reason: reason.clone(),
                });
            }
        }

        release_slot(&self.running, cycle_id);
        result
    }

    /// Sync one entity's items in order
    async fn sync_line(&self, line: Vec<QueueItem>, control: Arc<CycleControl>) -> Vec<ItemSyncResult> {
        let mut results = Vec::new();
        let mut remaining = line.into_iter();

        while let Some(item) = remaining.next() {
            if control.is_aborted() {
                break;
            }

            let result = match self.attempt(item, &control).await {
                Attempt::Finished(result) => result,
                Attempt::Gone => continue,
                Attempt::Stopped => break,
            };

            self.events.emit(&SyncEvent::for_item(&result));
            let synced = result.outcome == ItemOutcome::Synced;
            let blocker = (result.id.clone(), status_after(&result.outcome));
            results.push(result);

            if synced {
                continue;
            }
            if control.is_aborted() {
                break;
            }

            // Later operations depend on this one
            for rest in remaining.by_ref() {
                let skipped = ItemSyncResult::new(
                    &rest,
                    ItemOutcome::Skipped {
                        reason: SkipReason::BlockedBy {
                            id: blocker.0.clone(),
                            status: blocker.1,
                        },
                    },
                );
                self.events.emit(&SyncEvent::for_item(&skipped));
                results.push(skipped);
            }
        }

        results
    }

    async fn attempt(&self, item: QueueItem, control: &CycleControl) -> Attempt {
        let item = match self.queue.mark_syncing(&item.id) {
            Ok(item) => item,
            Err(e @ (QueueError::ItemNotFound(_) | QueueError::InvalidTransition { .. })) => {
                log::info!("Queue item {} changed before dispatch: {}", item.id, e);
                return Attempt::Gone;
            }
            Err(e) => {
                control.abort(AbortReason::Internal { message: e.to_string() });
                return Attempt::Stopped;
            }
        };

        let queue = self.queue.clone();
        let api = self.api.clone();
        let stranded = self.stranded.clone();
        let timeout = self.settings.request_timeout;
        let id = item.id.clone();
        let task_id = id.clone();

        // Spawned so an abort never cancels a request already sent
        let handle = tokio::spawn(async move {
            let result = dispatch(queue.clone(), api, item, timeout).await;
            if let Err(e) = &result {
                log::error!("Failed to record outcome of queue item {}: {}", task_id, e);
                release_or_strand(&queue, &stranded, task_id);
            }
            result
        });

        let joined = tokio::select! {
            biased;
            joined = handle => joined,
            _ = control.token.cancelled() => {
                log::info!("Cycle aborted with a request in flight; its outcome will still be recorded");
                return Attempt::Stopped;
            }
        };

        match joined {
            Ok(Ok(Dispatched::Recorded(result))) => Attempt::Finished(result),
            Ok(Ok(Dispatched::AuthRejected(failure))) => {
                control.abort(AbortReason::Auth { message: failure.message });
                Attempt::Stopped
            }
            Ok(Err(e)) => {
                control.abort(AbortReason::Internal { message: e.to_string() });
                Attempt::Stopped
            }
            Err(e) => {
                release_or_strand(&self.queue, &self.stranded, id);
                control.abort(AbortReason::Internal { message: e.to_string() });
                Attempt::Stopped
            }
        }
    }

    /// Return items stranded by an earlier failed write-back to `pending`
    fn release_stranded(&self) {
        let ids: Vec<String> = {
            let mut stranded = self.stranded.lock().unwrap_or_else(|e| e.into_inner());
            stranded.drain().collect()
        };
        for id in ids {
            release_or_strand(&self.queue, &self.stranded, id);
        }
    }

    /// Result for a cycle whose task died
    fn fail_cycle(&self, cycle_id: u64, message: String) -> SyncResult {
        log::error!("Sync cycle {} task failed: {}", cycle_id, message);

        let reason = AbortReason::Internal { message };
        self.events.emit(&SyncEvent::CycleAborted {
            cycle_id,
            reason: reason.clone(),
        });
        release_slot(&self.running, cycle_id);
        SyncResult::new(cycle_id, Utc::now(), Vec::new(), CycleOutcome::Aborted { reason })
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<RunningCycle>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::Operation;
    use chrono::Duration as ChronoDuration;

    fn item(entity_id: &str, seq: u64, status: QueueStatus) -> QueueItem {
        QueueItem {
            id: format!("{}-{}", entity_id, seq),
            entity_type: "batch".to_string(),
            entity_id: entity_id.to_string(),
            operation: Operation::Update,
            payload: serde_json::json!({}),
            idempotency_key: format!("k-{}", seq),
            status,
            attempt_count: 0,
            last_error: None,
            enqueued_at: Utc::now(),
            last_attempt_at: None,
            seq,
        }
    }

    fn ids(line: &[QueueItem]) -> Vec<&str> {
        line.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn test_plan_groups_by_entity_in_order() {
        let items = vec![
            item("e1", 1, QueueStatus::Pending),
            item("e2", 2, QueueStatus::Pending),
            item("e1", 3, QueueStatus::Pending),
        ];

        let plan = plan_cycle(&items, &RetryPolicy::default(), Utc::now());
        assert_eq!(plan.lines.len(), 2);
        assert_eq!(ids(&plan.lines[0]), vec!["e1-1", "e1-3"]);
        assert_eq!(ids(&plan.lines[1]), vec!["e2-2"]);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_plan_blocks_behind_unresolved_items() {
        let items = vec![
            item("e1", 1, QueueStatus::Conflict),
            item("e1", 2, QueueStatus::Pending),
            item("e2", 3, QueueStatus::Syncing),
            item("e2", 4, QueueStatus::Pending),
            item("e3", 5, QueueStatus::Pending),
        ];

        let plan = plan_cycle(&items, &RetryPolicy::default(), Utc::now());
        assert_eq!(plan.lines.len(), 1);
        assert_eq!(ids(&plan.lines[0]), vec!["e3-5"]);

        assert_eq!(plan.skipped.len(), 2);
        assert_eq!(
            plan.skipped[0].outcome,
            ItemOutcome::Skipped {
                reason: SkipReason::BlockedBy { id: "e1-1".to_string(), status: QueueStatus::Conflict },
            }
        );
        assert_eq!(plan.skipped[1].id, "e2-4");
    }

    #[test]
    fn test_plan_defers_items_backing_off() {
        let now = Utc::now();
        let mut failing = item("e1", 1, QueueStatus::Pending);
        failing.attempt_count = 2;
        failing.last_attempt_at = Some(now);

        let items = vec![failing, item("e1", 2, QueueStatus::Pending), item("e2", 3, QueueStatus::Pending)];
        let plan = plan_cycle(&items, &RetryPolicy::default(), now);

        assert_eq!(plan.lines.len(), 1);
        assert_eq!(ids(&plan.lines[0]), vec!["e2-3"]);
        assert!(matches!(
            plan.skipped[0].outcome,
            ItemOutcome::Skipped { reason: SkipReason::BackingOff { .. } }
        ));
        assert!(matches!(
            plan.skipped[1].outcome,
            ItemOutcome::Skipped { reason: SkipReason::BlockedBy { .. } }
        ));

        // Once the delay has passed the item is due again
        let later = plan_cycle(&items, &RetryPolicy::default(), now + ChronoDuration::minutes(1));
        assert_eq!(later.lines.len(), 2);
        assert!(later.skipped.is_empty());
    }

    #[test]
    fn test_status_after_outcome() {
        let failure = SyncFailure::network("timeout");
        assert_eq!(
            status_after(&ItemOutcome::Failed { error: failure.clone(), will_retry: true }),
            QueueStatus::Pending
        );
        assert_eq!(
            status_after(&ItemOutcome::Failed { error: failure, will_retry: false }),
            QueueStatus::Failed
        );
        assert_eq!(
            status_after(&ItemOutcome::Conflict { error: SyncFailure::conflict("409") }),
            QueueStatus::Conflict
        );
    }
}
