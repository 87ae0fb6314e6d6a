//! Generic REST CRM client
//!
//! Speaks a plain JSON contact API: contact lookup by email, tag list
//! fetch/apply/remove, and contact field load/update/create. Requests are
//! rate limited to stay inside typical CRM API quotas.

use super::{CrmCapabilities, CrmConnection, CrmError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const USER_AGENT: &str = "crmgate/0.1.0 (+https://crmgate.dev)";
const RATE_LIMIT_MS: u64 = 250; // 4 requests per second
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Contact search/creation response
#[derive(Debug, Deserialize)]
struct ContactEnvelope {
    id: String,
}

/// Contact search response (by email)
#[derive(Debug, Deserialize)]
struct ContactSearchResponse {
    contacts: Vec<ContactEnvelope>,
}

/// Tag list response
#[derive(Debug, Deserialize)]
struct TagListResponse {
    tags: Vec<String>,
}

/// Contact detail response
#[derive(Debug, Deserialize)]
struct ContactDetailResponse {
    #[serde(default)]
    fields: HashMap<String, String>,
}

/// Rate limiter enforcing a minimum interval between requests
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval_ms: u64) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    /// Wait if necessary to comply with rate limit
    async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::debug!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

/// REST CRM client
pub struct HttpCrm {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    rate_limiter: Arc<RateLimiter>,
}

impl HttpCrm {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, CrmError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| CrmError::Network(e.to_string()))?;

        let base_url = base_url.into();

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            rate_limiter: Arc::new(RateLimiter::new(RATE_LIMIT_MS)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map a non-success HTTP status to a CrmError
    async fn error_for(&self, response: reqwest::Response) -> CrmError {
        let status = response.status().as_u16();
        if status == 429 || status == 503 {
            return CrmError::RateLimitExceeded;
        }
        let error_text = response.text().await.unwrap_or_default();
        CrmError::Api(status, error_text)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, CrmError> {
        self.rate_limiter.wait().await;
        self.http_client
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| CrmError::Network(e.to_string()))
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, CrmError> {
        self.rate_limiter.wait().await;
        self.http_client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| CrmError::Network(e.to_string()))
    }
}

#[async_trait]
impl CrmConnection for HttpCrm {
    fn capabilities(&self) -> CrmCapabilities {
        CrmCapabilities {
            creates_tags: true,
            combined_updates: false,
            native_add: true,
        }
    }

    async fn get_contact_id(&self, email: &str) -> Result<Option<String>, CrmError> {
        let path = format!("/contacts?email={}", urlencode(email));
        let response = self.get(&path).await?;

        let status = response.status();
        if status == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(self.error_for(response).await);
        }

        let search: ContactSearchResponse = response
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;

        Ok(search.contacts.into_iter().next().map(|c| c.id))
    }

    async fn get_tags(&self, contact_id: &str) -> Result<Vec<String>, CrmError> {
        let path = format!("/contacts/{}/tags", urlencode(contact_id));
        let response = self.get(&path).await?;

        let status = response.status();
        if status == 404 {
            return Err(CrmError::ContactNotFound(contact_id.to_string()));
        }
        if !status.is_success() {
            return Err(self.error_for(response).await);
        }

        let list: TagListResponse = response
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;

        tracing::debug!(contact_id = %contact_id, count = list.tags.len(), "Fetched tags from CRM");
        Ok(list.tags)
    }

    async fn apply_tags(&self, tags: &[String], contact_id: &str) -> Result<(), CrmError> {
        let path = format!("/contacts/{}/tags", urlencode(contact_id));
        let body = serde_json::json!({ "tags": tags });
        let response = self.post_json(&path, &body).await?;

        let status = response.status();
        if status == 404 {
            return Err(CrmError::ContactNotFound(contact_id.to_string()));
        }
        if !status.is_success() {
            return Err(self.error_for(response).await);
        }
        Ok(())
    }

    async fn remove_tags(&self, tags: &[String], contact_id: &str) -> Result<(), CrmError> {
        let path = format!("/contacts/{}/tags/remove", urlencode(contact_id));
        let body = serde_json::json!({ "tags": tags });
        let response = self.post_json(&path, &body).await?;

        let status = response.status();
        if status == 404 {
            return Err(CrmError::ContactNotFound(contact_id.to_string()));
        }
        if !status.is_success() {
            return Err(self.error_for(response).await);
        }
        Ok(())
    }

    async fn load_contact(&self, contact_id: &str) -> Result<HashMap<String, String>, CrmError> {
        let path = format!("/contacts/{}", urlencode(contact_id));
        let response = self.get(&path).await?;

        let status = response.status();
        if status == 404 {
            return Err(CrmError::ContactNotFound(contact_id.to_string()));
        }
        if !status.is_success() {
            return Err(self.error_for(response).await);
        }

        let detail: ContactDetailResponse = response
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;

        Ok(detail.fields)
    }

    async fn update_contact(
        &self,
        contact_id: &str,
        fields: &HashMap<String, String>,
    ) -> Result<(), CrmError> {
        let path = format!("/contacts/{}", urlencode(contact_id));
        let body = serde_json::json!({ "fields": fields });
        let response = self.post_json(&path, &body).await?;

        let status = response.status();
        if status == 404 {
            return Err(CrmError::ContactNotFound(contact_id.to_string()));
        }
        if !status.is_success() {
            return Err(self.error_for(response).await);
        }

        tracing::info!(contact_id = %contact_id, fields = fields.len(), "Updated contact in CRM");
        Ok(())
    }

    async fn add_contact(&self, fields: &HashMap<String, String>) -> Result<String, CrmError> {
        let body = serde_json::json!({ "fields": fields });
        let response = self.post_json("/contacts", &body).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.error_for(response).await);
        }

        let created: ContactEnvelope = response
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;

        tracing::info!(contact_id = %created.id, "Created contact in CRM");
        Ok(created.id)
    }
}

/// Percent-encode a path/query component
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
