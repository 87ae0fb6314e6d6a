//! In-memory CRM backend for tests
//!
//! Holds contacts and tag sets in a mutex-guarded map and counts every
//! adapter call, so tests can assert exactly which remote operations ran.

use super::{CrmCapabilities, CrmConnection, CrmError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct MockState {
    /// contact id -> field map
    contacts: HashMap<String, HashMap<String, String>>,
    /// contact id -> tag list
    tags: HashMap<String, Vec<String>>,
    /// email -> contact id
    email_index: HashMap<String, String>,
    next_id: u64,
}

/// Per-method call counters
#[derive(Debug, Default)]
pub struct CallCounts {
    pub get_contact_id: AtomicUsize,
    pub get_tags: AtomicUsize,
    pub apply_tags: AtomicUsize,
    pub remove_tags: AtomicUsize,
    pub load_contact: AtomicUsize,
    pub update_contact: AtomicUsize,
    pub add_contact: AtomicUsize,
}

/// Scripted CRM backend
pub struct MockCrm {
    state: Mutex<MockState>,
    pub calls: CallCounts,
    /// When set, every call fails with a network error
    pub fail_all: std::sync::atomic::AtomicBool,
    /// Cleared to simulate a CRM without contact creation
    pub can_add: std::sync::atomic::AtomicBool,
}

impl Default for MockCrm {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            calls: CallCounts::default(),
            fail_all: std::sync::atomic::AtomicBool::new(false),
            can_add: std::sync::atomic::AtomicBool::new(true),
        }
    }
}

impl MockCrm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a contact with an email, fields, and tags; returns its id
    pub fn seed_contact(
        &self,
        email: &str,
        fields: HashMap<String, String>,
        tags: Vec<String>,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("c-{}", state.next_id);
        let mut fields = fields;
        fields.insert("email".to_string(), email.to_string());
        state.contacts.insert(id.clone(), fields);
        state.tags.insert(id.clone(), tags);
        state.email_index.insert(email.to_string(), id.clone());
        id
    }

    /// Replace a contact's tag list (simulates remote-side changes)
    pub fn set_remote_tags(&self, contact_id: &str, tags: Vec<String>) {
        let mut state = self.state.lock().unwrap();
        state.tags.insert(contact_id.to_string(), tags);
    }

    /// Current remote tag list for assertions
    pub fn remote_tags(&self, contact_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.tags.get(contact_id).cloned().unwrap_or_default()
    }

    /// Current remote field map for assertions
    pub fn remote_fields(&self, contact_id: &str) -> HashMap<String, String> {
        let state = self.state.lock().unwrap();
        state.contacts.get(contact_id).cloned().unwrap_or_default()
    }

    fn check_failure(&self) -> Result<(), CrmError> {
        if self.fail_all.load(Ordering::SeqCst) {
            Err(CrmError::Network("mock failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CrmConnection for MockCrm {
    fn capabilities(&self) -> CrmCapabilities {
        CrmCapabilities {
            creates_tags: true,
            combined_updates: false,
            native_add: self.can_add.load(Ordering::SeqCst),
        }
    }

    async fn get_contact_id(&self, email: &str) -> Result<Option<String>, CrmError> {
        self.calls.get_contact_id.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        let state = self.state.lock().unwrap();
        Ok(state.email_index.get(email).cloned())
    }

    async fn get_tags(&self, contact_id: &str) -> Result<Vec<String>, CrmError> {
        self.calls.get_tags.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        let state = self.state.lock().unwrap();
        state
            .tags
            .get(contact_id)
            .cloned()
            .ok_or_else(|| CrmError::ContactNotFound(contact_id.to_string()))
    }

    async fn apply_tags(&self, tags: &[String], contact_id: &str) -> Result<(), CrmError> {
        self.calls.apply_tags.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        let entry = state
            .tags
            .get_mut(contact_id)
            .ok_or_else(|| CrmError::ContactNotFound(contact_id.to_string()))?;
        for tag in tags {
            if !entry.contains(tag) {
                entry.push(tag.clone());
            }
        }
        Ok(())
    }

    async fn remove_tags(&self, tags: &[String], contact_id: &str) -> Result<(), CrmError> {
        self.calls.remove_tags.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        let entry = state
            .tags
            .get_mut(contact_id)
            .ok_or_else(|| CrmError::ContactNotFound(contact_id.to_string()))?;
        entry.retain(|t| !tags.contains(t));
        Ok(())
    }

    async fn load_contact(&self, contact_id: &str) -> Result<HashMap<String, String>, CrmError> {
        self.calls.load_contact.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        let state = self.state.lock().unwrap();
        state
            .contacts
            .get(contact_id)
            .cloned()
            .ok_or_else(|| CrmError::ContactNotFound(contact_id.to_string()))
    }

    async fn update_contact(
        &self,
        contact_id: &str,
        fields: &HashMap<String, String>,
    ) -> Result<(), CrmError> {
        self.calls.update_contact.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        let entry = state
            .contacts
            .get_mut(contact_id)
            .ok_or_else(|| CrmError::ContactNotFound(contact_id.to_string()))?;
        for (key, value) in fields {
            entry.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn add_contact(&self, fields: &HashMap<String, String>) -> Result<String, CrmError> {
        self.calls.add_contact.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("c-{}", state.next_id);
        state.contacts.insert(id.clone(), fields.clone());
        state.tags.insert(id.clone(), Vec::new());
        if let Some(email) = fields.get("email") {
            state.email_index.insert(email.clone(), id.clone());
        }
        Ok(id)
    }
}
