//! Batch operations
//!
//! Bulk work (resync every user, push or pull everyone's fields) is
//! materialized into the persistent queue and drained by a background
//! worker task. Items execute independently: one failure is retried a
//! bounded number of times and then dropped with an event, never halting
//! the rest of the queue.

use crate::db::queue::{self, BatchTask};
use crate::services::meta::{MetaSync, SyncContext};
use crate::services::tags::TagSynchronizer;
use chrono::Utc;
use crmgate_common::events::{CrmEvent, EventBus};
use crmgate_common::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Attempts per item before it is dropped
const MAX_ATTEMPTS: i64 = 3;

/// Poll interval when the queue is idle and no wake signal arrives
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Named bulk operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperation {
    /// Refetch tags for every user
    UsersSync,
    /// Push every linked user's mapped fields to the CRM
    UsersMetaPush,
    /// Pull CRM fields for every linked user
    UsersMetaPull,
}

impl BatchOperation {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "users_sync" => Some(BatchOperation::UsersSync),
            "users_meta_push" => Some(BatchOperation::UsersMetaPush),
            "users_meta_pull" => Some(BatchOperation::UsersMetaPull),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOperation::UsersSync => "users_sync",
            BatchOperation::UsersMetaPush => "users_meta_push",
            BatchOperation::UsersMetaPull => "users_meta_pull",
        }
    }

    /// Materialize the eligible user list for this operation
    async fn eligible_user_ids(&self, db: &SqlitePool) -> Result<Vec<Uuid>> {
        match self {
            // A sync pass may discover contacts for unlinked users
            BatchOperation::UsersSync => crate::db::users::list_all_user_ids(db).await,
            // Meta operations need a confirmed contact link
            BatchOperation::UsersMetaPush | BatchOperation::UsersMetaPull => {
                crate::db::users::list_linked_user_ids(db).await
            }
        }
    }
}

/// Shared handle for waking and stopping the worker
#[derive(Clone)]
pub struct BatchController {
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl Default for BatchController {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchController {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Wake the worker to check the queue now
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Stop the worker permanently (service shutdown)
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Populate the queue for a bulk operation
///
/// `explicit_ids` narrows the run to the given users; otherwise the
/// operation's provider materializes the eligible list. Returns the
/// number of queued items. Zero means nothing was eligible; the caller
/// surfaces that as an abort and no work starts.
pub async fn init(
    db: &SqlitePool,
    event_bus: &EventBus,
    controller: &BatchController,
    operation: BatchOperation,
    shared_args: serde_json::Value,
    explicit_ids: Option<Vec<Uuid>>,
) -> Result<usize> {
    let user_ids = match explicit_ids {
        Some(ids) => ids,
        None => operation.eligible_user_ids(db).await?,
    };

    if user_ids.is_empty() {
        tracing::info!(operation = operation.as_str(), "No eligible records for batch");
        return Ok(0);
    }

    for user_id in &user_ids {
        let payload = serde_json::json!({
            "user_id": user_id.to_string(),
            "args": shared_args,
        });
        queue::enqueue(db, operation.as_str(), &payload).await?;
    }

    tracing::info!(
        operation = operation.as_str(),
        items = user_ids.len(),
        "Batch queue populated"
    );

    event_bus.emit_lossy(CrmEvent::BatchStarted {
        operation: operation.as_str().to_string(),
        item_count: user_ids.len(),
        timestamp: Utc::now(),
    });

    controller.wake();
    Ok(user_ids.len())
}

/// Remaining queue length for status polling
pub async fn status(db: &SqlitePool) -> Result<i64> {
    queue::remaining_count(db).await
}

/// Clear the queue and report how many items were discarded
///
/// An item already mid-execution finishes its current step; everything
/// still queued is dropped.
pub async fn cancel(db: &SqlitePool, event_bus: &EventBus) -> Result<i64> {
    let discarded = queue::clear_all(db).await?;

    tracing::info!(discarded, "Batch queue cancelled");

    event_bus.emit_lossy(CrmEvent::BatchCancelled {
        items_discarded: discarded as usize,
        timestamp: Utc::now(),
    });

    Ok(discarded)
}

/// Background worker draining the batch queue
pub struct BatchRunner {
    db: SqlitePool,
    tags: Arc<TagSynchronizer>,
    meta: Arc<MetaSync>,
    event_bus: EventBus,
    controller: BatchController,
}

impl BatchRunner {
    pub fn new(
        db: SqlitePool,
        tags: Arc<TagSynchronizer>,
        meta: Arc<MetaSync>,
        event_bus: EventBus,
        controller: BatchController,
    ) -> Self {
        Self {
            db,
            tags,
            meta,
            event_bus,
            controller,
        }
    }

    /// Spawn the worker loop
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tracing::info!("Batch worker started");
        let mut was_busy = false;

        loop {
            if self.controller.cancel.is_cancelled() {
                break;
            }

            let task = match queue::next_task(&self.db).await {
                Ok(task) => task,
                Err(e) => {
                    tracing::error!(error = %e, "Batch worker failed to read queue");
                    tokio::time::sleep(IDLE_POLL).await;
                    continue;
                }
            };

            match task {
                Some(task) => {
                    was_busy = true;
                    self.step(task).await;
                }
                None => {
                    if was_busy {
                        was_busy = false;
                        self.event_bus.emit_lossy(CrmEvent::BatchCompleted {
                            timestamp: Utc::now(),
                        });
                    }

                    tokio::select! {
                        _ = self.controller.cancel.cancelled() => break,
                        _ = self.controller.notify.notified() => {}
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
            }
        }

        tracing::info!("Batch worker stopped");
    }

    /// Execute one task and settle its queue row
    async fn step(&self, task: BatchTask) {
        let outcome = self.execute(&task).await;

        match outcome {
            Ok(()) => {
                if let Err(e) = queue::delete_task(&self.db, task.id).await {
                    tracing::error!(task_id = task.id, error = %e, "Failed to delete completed task");
                }
            }
            Err(message) => {
                tracing::warn!(
                    task_id = task.id,
                    operation = %task.operation,
                    attempts = task.attempts + 1,
                    error = %message,
                    "Batch item failed"
                );

                if task.attempts + 1 >= MAX_ATTEMPTS {
                    if let Err(e) = queue::delete_task(&self.db, task.id).await {
                        tracing::error!(task_id = task.id, error = %e, "Failed to drop exhausted task");
                    }

                    self.event_bus.emit_lossy(CrmEvent::BatchItemFailed {
                        operation: task.operation.clone(),
                        user_id: payload_user_id(&task.payload),
                        error: message,
                        timestamp: Utc::now(),
                    });
                } else if let Err(e) = queue::bump_attempts(&self.db, task.id).await {
                    tracing::error!(task_id = task.id, error = %e, "Failed to record attempt");
                }
            }
        }
    }

    async fn execute(&self, task: &BatchTask) -> std::result::Result<(), String> {
        let operation = BatchOperation::parse(&task.operation)
            .ok_or_else(|| format!("unknown operation '{}'", task.operation))?;

        let user_id =
            payload_user_id(&task.payload).ok_or_else(|| "payload missing user_id".to_string())?;

        match operation {
            BatchOperation::UsersSync => {
                self.tags
                    .get_tags(user_id, true, None)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            BatchOperation::UsersMetaPush => match self.meta.push(user_id, None).await {
                Ok(true) => Ok(()),
                Ok(false) => Err("push did not complete".to_string()),
                Err(e) => Err(e.to_string()),
            },
            BatchOperation::UsersMetaPull => {
                match self.meta.pull(user_id, SyncContext::System).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err("pull did not complete".to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
        }
    }
}

fn payload_user_id(payload: &serde_json::Value) -> Option<Uuid> {
    payload
        .get("user_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::{CrmConnection, MockCrm};
    use crate::db::settings::RuntimeOptions;
    use crate::db::test_pool;
    use crate::db::users::{ContactLink, UserRecord};
    use std::collections::HashMap;

    #[test]
    fn test_operation_parse_roundtrip() {
        for op in [
            BatchOperation::UsersSync,
            BatchOperation::UsersMetaPush,
            BatchOperation::UsersMetaPull,
        ] {
            assert_eq!(BatchOperation::parse(op.as_str()), Some(op));
        }
        assert_eq!(BatchOperation::parse("bogus"), None);
    }

    #[tokio::test]
    async fn test_init_with_no_eligible_records_returns_zero() {
        let pool = test_pool().await;
        let bus = EventBus::new(16);
        let controller = BatchController::new();

        let count = init(
            &pool,
            &bus,
            &controller,
            BatchOperation::UsersSync,
            serde_json::json!({}),
            None,
        )
        .await
        .unwrap();

        assert_eq!(count, 0);
        assert_eq!(status(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_init_enqueues_eligible_users() {
        let pool = test_pool().await;
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let controller = BatchController::new();

        for i in 0..3 {
            let user = UserRecord::new(format!("u{}@example.com", i), "subscriber");
            crate::db::users::insert_user(&pool, &user).await.unwrap();
        }

        let count = init(
            &pool,
            &bus,
            &controller,
            BatchOperation::UsersSync,
            serde_json::json!({}),
            None,
        )
        .await
        .unwrap();

        assert_eq!(count, 3);
        assert_eq!(status(&pool).await.unwrap(), 3);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type(), "BatchStarted");
    }

    #[tokio::test]
    async fn test_meta_operations_require_link() {
        let pool = test_pool().await;
        let bus = EventBus::new(16);
        let controller = BatchController::new();

        // One linked, one unlinked
        let mut linked = UserRecord::new("linked@example.com", "subscriber");
        linked.contact = ContactLink::Linked("c-1".to_string());
        crate::db::users::insert_user(&pool, &linked).await.unwrap();

        let unlinked = UserRecord::new("unlinked@example.com", "subscriber");
        crate::db::users::insert_user(&pool, &unlinked).await.unwrap();

        let count = init(
            &pool,
            &bus,
            &controller,
            BatchOperation::UsersMetaPush,
            serde_json::json!({}),
            None,
        )
        .await
        .unwrap();

        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_init_with_explicit_ids_skips_provider() {
        let pool = test_pool().await;
        let bus = EventBus::new(16);
        let controller = BatchController::new();

        let chosen = UserRecord::new("chosen@example.com", "subscriber");
        crate::db::users::insert_user(&pool, &chosen).await.unwrap();
        let other = UserRecord::new("other@example.com", "subscriber");
        crate::db::users::insert_user(&pool, &other).await.unwrap();

        let count = init(
            &pool,
            &bus,
            &controller,
            BatchOperation::UsersSync,
            serde_json::json!({}),
            Some(vec![chosen.user_id]),
        )
        .await
        .unwrap();

        assert_eq!(count, 1);
        let task = queue::next_task(&pool).await.unwrap().unwrap();
        assert_eq!(task.payload["user_id"], chosen.user_id.to_string());
    }

    #[tokio::test]
    async fn test_cancel_clears_queue() {
        let pool = test_pool().await;
        let bus = EventBus::new(16);
        let controller = BatchController::new();

        let user = UserRecord::new("a@example.com", "subscriber");
        crate::db::users::insert_user(&pool, &user).await.unwrap();

        init(
            &pool,
            &bus,
            &controller,
            BatchOperation::UsersSync,
            serde_json::json!({}),
            None,
        )
        .await
        .unwrap();
        assert_eq!(status(&pool).await.unwrap(), 1);

        let cleared = cancel(&pool, &bus).await.unwrap();
        assert_eq!(cleared, 1);
        assert_eq!(status(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_runner_drains_queue() {
        let pool = test_pool().await;
        let bus = EventBus::new(64);
        let controller = BatchController::new();
        let crm = Arc::new(MockCrm::new());
        let options = Arc::new(RuntimeOptions::default());

        let contact_id = crm.seed_contact("a@example.com", HashMap::new(), vec!["vip".to_string()]);
        let mut user = UserRecord::new("a@example.com", "subscriber");
        user.contact = ContactLink::Linked(contact_id);
        crate::db::users::insert_user(&pool, &user).await.unwrap();

        let tags = Arc::new(TagSynchronizer::new(
            pool.clone(),
            crm.clone() as Arc<dyn CrmConnection>,
            bus.clone(),
            options.clone(),
        ));
        let meta = Arc::new(MetaSync::new(
            pool.clone(),
            crm.clone() as Arc<dyn CrmConnection>,
            bus.clone(),
            options,
        ));

        init(
            &pool,
            &bus,
            &controller,
            BatchOperation::UsersSync,
            serde_json::json!({}),
            None,
        )
        .await
        .unwrap();

        let runner = BatchRunner::new(
            pool.clone(),
            tags,
            meta,
            bus.clone(),
            controller.clone(),
        );
        let handle = runner.spawn();

        // Wait for the queue to drain
        for _ in 0..50 {
            if status(&pool).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status(&pool).await.unwrap(), 0);

        let loaded = crate::db::users::get_user(&pool, user.user_id).await.unwrap().unwrap();
        let expected: crate::db::users::TagSet = ["vip".to_string()].into_iter().collect();
        assert_eq!(loaded.tags, Some(expected));

        controller.shutdown();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_runner_drops_poison_item_and_continues() {
        let pool = test_pool().await;
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let controller = BatchController::new();
        let crm = Arc::new(MockCrm::new());
        let options = Arc::new(RuntimeOptions::default());

        // Poison task referencing a user that does not exist
        queue::enqueue(
            &pool,
            "users_sync",
            &serde_json::json!({"user_id": Uuid::new_v4().to_string()}),
        )
        .await
        .unwrap();

        // And a healthy task behind it
        let contact_id = crm.seed_contact("ok@example.com", HashMap::new(), vec![]);
        let mut user = UserRecord::new("ok@example.com", "subscriber");
        user.contact = ContactLink::Linked(contact_id);
        crate::db::users::insert_user(&pool, &user).await.unwrap();
        queue::enqueue(
            &pool,
            "users_sync",
            &serde_json::json!({"user_id": user.user_id.to_string()}),
        )
        .await
        .unwrap();

        let tags = Arc::new(TagSynchronizer::new(
            pool.clone(),
            crm.clone() as Arc<dyn CrmConnection>,
            bus.clone(),
            options.clone(),
        ));
        let meta = Arc::new(MetaSync::new(
            pool.clone(),
            crm.clone() as Arc<dyn CrmConnection>,
            bus.clone(),
            options,
        ));

        let runner = BatchRunner::new(
            pool.clone(),
            tags,
            meta,
            bus.clone(),
            controller.clone(),
        );
        controller.wake();
        let handle = runner.spawn();

        for _ in 0..100 {
            if status(&pool).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status(&pool).await.unwrap(), 0, "queue drained despite poison item");

        let mut saw_item_failure = false;
        while let Ok(event) = rx.try_recv() {
            if event.event_type() == "BatchItemFailed" {
                saw_item_failure = true;
            }
        }
        assert!(saw_item_failure, "exhausted item must emit BatchItemFailed");

        controller.shutdown();
        let _ = handle.await;
    }
}
