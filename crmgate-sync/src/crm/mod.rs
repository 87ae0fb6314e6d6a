//! CRM adapter contract
//!
//! Every component talks to the remote CRM through the [`CrmConnection`]
//! trait. Capability differences between CRM backends are expressed as an
//! explicit flags struct instead of ad hoc method probing, so callers can
//! branch on a typed field.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod http;
pub mod mock;

pub use http::HttpCrm;
pub use mock::MockCrm;

/// CRM adapter errors
#[derive(Debug, Error)]
pub enum CrmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Contact not found: {0}")]
    ContactNotFound(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Capability flags for a CRM backend
///
/// Components branch on these instead of probing for optional methods.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrmCapabilities {
    /// Applying an unknown tag creates it remotely instead of failing
    pub creates_tags: bool,
    /// Contact creation and update share one upsert endpoint
    pub combined_updates: bool,
    /// Contacts can be created through the API at all
    pub native_add: bool,
}

/// Contract implemented by every CRM backend
///
/// All methods take opaque string identifiers; the contact id format is
/// owned by the remote system and never interpreted locally.
#[async_trait]
pub trait CrmConnection: Send + Sync {
    /// Capability flags for this backend
    fn capabilities(&self) -> CrmCapabilities;

    /// Look up a contact id by email address
    ///
    /// `Ok(None)` means the CRM has no contact with this email; this is a
    /// normal outcome, not an error.
    async fn get_contact_id(&self, email: &str) -> Result<Option<String>, CrmError>;

    /// Fetch the full tag set attached to a contact
    async fn get_tags(&self, contact_id: &str) -> Result<Vec<String>, CrmError>;

    /// Attach tags to a contact
    async fn apply_tags(&self, tags: &[String], contact_id: &str) -> Result<(), CrmError>;

    /// Detach tags from a contact
    async fn remove_tags(&self, tags: &[String], contact_id: &str) -> Result<(), CrmError>;

    /// Load a contact's field values
    async fn load_contact(&self, contact_id: &str) -> Result<HashMap<String, String>, CrmError>;

    /// Update a contact's field values
    async fn update_contact(
        &self,
        contact_id: &str,
        fields: &HashMap<String, String>,
    ) -> Result<(), CrmError>;

    /// Create a new contact, returning its id
    async fn add_contact(&self, fields: &HashMap<String, String>) -> Result<String, CrmError>;
}
