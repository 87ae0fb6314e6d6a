//! Event types for the crmgate event system
//!
//! Provides shared event definitions and EventBus for the sync service.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// crmgate event types
///
/// Events are broadcast via EventBus and can be serialized for SSE
/// transmission. All events use this central enum for type safety and
/// exhaustive matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CrmEvent {
    /// Tags newly applied to a user (set difference: new − old)
    ///
    /// Triggers:
    /// - Automation: react to individual tag grants
    /// - SSE: update connected observers
    TagsApplied {
        /// Local user UUID
        user_id: Uuid,
        /// Tags that were not present before this sync
        tags: Vec<String>,
        /// When the change was persisted
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Tags removed from a user (set difference: old − new)
    ///
    /// Always fired after TagsApplied and before TagsChanged for the
    /// same sync pass.
    TagsRemoved {
        /// Local user UUID
        user_id: Uuid,
        /// Tags that are no longer present
        tags: Vec<String>,
        /// When the change was persisted
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Full tag set after a change (fired last in the sync pass)
    TagsChanged {
        /// Local user UUID
        user_id: Uuid,
        /// Complete new tag set
        tags: Vec<String>,
        /// When the change was persisted
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A sync pass found no difference between local and remote tags
    TagsUnchanged {
        /// Local user UUID
        user_id: Uuid,
        /// When the comparison ran
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Local profile fields pushed to the CRM
    MetaPushed {
        /// Local user UUID
        user_id: Uuid,
        /// Remote contact identifier
        contact_id: String,
        /// Field names included in the update
        fields: Vec<String>,
        /// When the remote update succeeded
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// CRM fields pulled into local storage
    MetaPulled {
        /// Local user UUID
        user_id: Uuid,
        /// Remote contact identifier
        contact_id: String,
        /// Field names written locally (guarded fields excluded)
        fields: Vec<String>,
        /// When the local write completed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A local user was resolved to a remote contact by email lookup
    ContactResolved {
        /// Local user UUID
        user_id: Uuid,
        /// Remote contact identifier (None when the CRM has no match)
        contact_id: Option<String>,
        /// When the lookup completed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A local user was created from an inbound webhook
    UserCreated {
        /// Local user UUID
        user_id: Uuid,
        /// Remote contact identifier
        contact_id: String,
        /// When the user row was inserted
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An inbound webhook passed validation and was dispatched
    WebhookReceived {
        /// Webhook action name
        action: String,
        /// Remote contact identifier
        contact_id: String,
        /// When the webhook was accepted
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An inbound webhook was discarded before dispatch
    ///
    /// Triggers:
    /// - Diagnostics: duplicate/conflicting lock classification
    WebhookRejected {
        /// Webhook action name (empty when unparseable)
        action: String,
        /// Rejection reason for the diagnostic body
        reason: String,
        /// When the webhook was rejected
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A batch operation was initialized with eligible items
    BatchStarted {
        /// Operation name (e.g. "users_sync")
        operation: String,
        /// Number of queued items
        item_count: usize,
        /// When the queue was populated
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A queued batch item failed after exhausting its retries
    ///
    /// Other items continue to run; the queue never halts on one item.
    BatchItemFailed {
        /// Operation name
        operation: String,
        /// Affected local user UUID (if the payload named one)
        user_id: Option<Uuid>,
        /// Error message details
        error: String,
        /// When the final attempt failed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The batch queue drained to empty
    BatchCompleted {
        /// When the last item finished
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The batch queue was cleared by an explicit cancel
    BatchCancelled {
        /// Number of items discarded
        items_discarded: usize,
        /// When the cancel was processed
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl CrmEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            CrmEvent::TagsApplied { .. } => "TagsApplied",
            CrmEvent::TagsRemoved { .. } => "TagsRemoved",
            CrmEvent::TagsChanged { .. } => "TagsChanged",
            CrmEvent::TagsUnchanged { .. } => "TagsUnchanged",
            CrmEvent::MetaPushed { .. } => "MetaPushed",
            CrmEvent::MetaPulled { .. } => "MetaPulled",
            CrmEvent::ContactResolved { .. } => "ContactResolved",
            CrmEvent::UserCreated { .. } => "UserCreated",
            CrmEvent::WebhookReceived { .. } => "WebhookReceived",
            CrmEvent::WebhookRejected { .. } => "WebhookRejected",
            CrmEvent::BatchStarted { .. } => "BatchStarted",
            CrmEvent::BatchItemFailed { .. } => "BatchItemFailed",
            CrmEvent::BatchCompleted { .. } => "BatchCompleted",
            CrmEvent::BatchCancelled { .. } => "BatchCancelled",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus for application-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CrmEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Returns a receiver that will receive all events emitted after
    /// subscription. Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<CrmEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: CrmEvent) -> Result<usize, broadcast::error::SendError<CrmEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    ///
    /// This is useful for non-critical events where it's acceptable if
    /// no component is currently listening.
    pub fn emit_lossy(&self, event: CrmEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    ///
    /// Useful for debugging and monitoring
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
