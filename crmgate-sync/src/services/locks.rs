//! Per-contact webhook locks
//!
//! Prevents two near-simultaneous webhooks for the same contact from
//! racing each other. Entries expire after a TTL so a crashed handler
//! eventually allows a retry (fail-open).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Lockable webhook actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    /// Full update: meta pull + tag sync
    Update,
    /// Tag sync only
    UpdateTags,
    /// User creation
    Add,
}

impl LockAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockAction::Update => "update",
            LockAction::UpdateTags => "update_tags",
            LockAction::Add => "add",
        }
    }
}

/// How a new request relates to the lock already held for its contact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockConflict {
    /// Same action already in flight
    Duplicate,
    /// A different, non-overlapping action is in flight
    Conflicting,
    /// The in-flight action already covers the requested one
    /// (a full update covers a tags-only update)
    Redundant,
}

struct LockEntry {
    action: LockAction,
    acquired: Instant,
}

/// In-process lock registry keyed by contact id
pub struct ContactLockRegistry {
    inner: Mutex<HashMap<String, LockEntry>>,
    ttl: Duration,
}

impl Default for ContactLockRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ContactLockRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Try to take the lock for a contact
    ///
    /// An expired entry counts as absent. On conflict the held entry is
    /// left untouched and the classification is returned.
    pub fn try_acquire(&self, contact_id: &str, action: LockAction) -> Result<(), LockConflict> {
        let mut locks = self.inner.lock().unwrap();

        if let Some(entry) = locks.get(contact_id) {
            if entry.acquired.elapsed() < self.ttl {
                return Err(classify(entry.action, action));
            }
            tracing::warn!(
                contact_id = %contact_id,
                action = entry.action.as_str(),
                "Expired webhook lock found; previous handler never completed"
            );
        }

        locks.insert(
            contact_id.to_string(),
            LockEntry {
                action,
                acquired: Instant::now(),
            },
        );
        Ok(())
    }

    /// Release the lock after the handler completes
    pub fn release(&self, contact_id: &str) {
        self.inner.lock().unwrap().remove(contact_id);
    }

    /// Whether a live lock exists for this contact
    pub fn is_locked(&self, contact_id: &str) -> bool {
        let locks = self.inner.lock().unwrap();
        locks
            .get(contact_id)
            .map(|e| e.acquired.elapsed() < self.ttl)
            .unwrap_or(false)
    }
}

fn classify(held: LockAction, requested: LockAction) -> LockConflict {
    if held == requested {
        return LockConflict::Duplicate;
    }
    // A full update already includes the tag sync a tags-only request wants
    if held == LockAction::Update && requested == LockAction::UpdateTags {
        return LockConflict::Redundant;
    }
    LockConflict::Conflicting
}
