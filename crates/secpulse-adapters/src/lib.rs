//! Source adapter contract, registry, and the generic adapters shipped with secpulse.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secpulse_core::{Category, CollectedRecord, CollectionWindow, ParseEnumError, Severity};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod fixture;
pub mod http;
pub mod http_json;

pub use fixture::FixtureAdapter;
pub use http::{
    BackoffPolicy, FetchError, FetchRequest, HttpClientConfig, HttpFetcher, TokenBucketConfig,
};
pub use http_json::{HttpAuth, HttpJsonAdapter, HttpJsonConfig, OAuthClientConfig};

pub const CRATE_NAME: &str = "secpulse-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source {0} is not configured")]
    NotConfigured(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited by provider")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("malformed provider payload: {0}")]
    Parse(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus {
                status: status @ (401 | 403),
                url,
                ..
            } => AdapterError::Auth(format!("http status {status} for {url}")),
            FetchError::HttpStatus {
                status: 429,
                retry_after_secs,
                ..
            } => AdapterError::RateLimited { retry_after_secs },
            other => AdapterError::Network(other.to_string()),
        }
    }
}

/// Provider record in the common wire shape. Severity and category are parsed leniently.
#[derive(Debug, Clone, Deserialize)]
struct WireRecord {
    #[serde(default)]
    id: Option<WireId>,
    category: String,
    severity: String,
    #[serde(default)]
    status: Option<String>,
    title: String,
    #[serde(default)]
    description: Option<String>,
    occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

pub fn deterministic_record_id(source: &str, title: &str, occurred_at: DateTime<Utc>) -> String {
    let key = format!("{source}:{title}:{}", occurred_at.to_rfc3339());
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

/// Turn one provider JSON object into a [`CollectedRecord`] owned by `source`.
///
/// The original object is kept verbatim in `raw`. Records without an id get a
/// stable one derived from `(source, title, occurred_at)`.
pub fn normalize_record(source: &str, value: JsonValue) -> Result<CollectedRecord, AdapterError> {
    let wire: WireRecord = serde_json::from_value(value.clone())
        .map_err(|e| AdapterError::Parse(format!("record: {e}")))?;
    let category: Category = wire
        .category
        .parse()
        .map_err(|e: ParseEnumError| AdapterError::Parse(e.to_string()))?;
    let severity: Severity = wire
        .severity
        .parse()
        .map_err(|e: ParseEnumError| AdapterError::Parse(e.to_string()))?;
    let id = match wire.id {
        Some(WireId::Text(id)) if !id.trim().is_empty() => id.trim().to_string(),
        Some(WireId::Number(n)) => n.to_string(),
        _ => deterministic_record_id(source, &wire.title, wire.occurred_at),
    };

    Ok(CollectedRecord {
        id,
        source: source.to_string(),
        category,
        severity,
        status: wire
            .status
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "open".to_string()),
        title: wire.title,
        description: wire.description.unwrap_or_default(),
        occurred_at: wire.occurred_at,
        raw: value,
    })
}

pub fn normalize_records(
    source: &str,
    values: Vec<JsonValue>,
) -> Result<Vec<CollectedRecord>, AdapterError> {
    values
        .into_iter()
        .map(|value| normalize_record(source, value))
        .collect()
}

/// One external telemetry provider.
///
/// Adapters own their credentials and token refresh. The orchestrator only sees
/// normalized records or a typed error.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> &str;

    /// `false` means the source is missing credentials or inputs and must be skipped.
    fn is_configured(&self) -> bool;

    async fn fetch_batch(
        &self,
        window: &CollectionWindow,
    ) -> Result<Vec<CollectedRecord>, AdapterError>;
}

/// Ordered set of adapters, built once at startup.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("sources", &self.names())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an adapter. A later registration under the same source name replaces
    /// the earlier one in place.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        if let Some(slot) = self
            .adapters
            .iter_mut()
            .find(|existing| existing.source() == adapter.source())
        {
            *slot = adapter;
        } else {
            self.adapters.push(adapter);
        }
    }

    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, source: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.iter().find(|a| a.source() == source).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SourceAdapter>> {
        self.adapters.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.source().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, bool);

    #[async_trait]
    impl SourceAdapter for Named {
        fn source(&self) -> &str {
            self.0
        }

        fn is_configured(&self) -> bool {
            self.1
        }

        async fn fetch_batch(
            &self,
            _window: &CollectionWindow,
        ) -> Result<Vec<CollectedRecord>, AdapterError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn registry_keeps_registration_order_and_replaces_duplicates() {
        let registry = AdapterRegistry::new()
            .with(Arc::new(Named("edr", true)))
            .with(Arc::new(Named("mail", true)))
            .with(Arc::new(Named("edr", false)));

        assert_eq!(registry.names(), vec!["edr", "mail"]);
        assert!(!registry.get("edr").unwrap().is_configured());
        assert!(registry.get("tickets").is_none());
    }

    #[test]
    fn normalization_keeps_raw_and_derives_missing_ids() {
        let value = serde_json::json!({
            "category": "alerts",
            "severity": "CRIT",
            "title": "Beacon to known C2",
            "occurred_at": "2026-09-01T10:00:00Z",
            "vendor_field": 7
        });
        let first = normalize_record("edr", value.clone()).unwrap();
        let second = normalize_record("edr", value).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.category, Category::Alert);
        assert_eq!(first.severity, Severity::Critical);
        assert_eq!(first.status, "open");
        assert_eq!(first.raw["vendor_field"], 7);
        assert_ne!(normalize_record("mail", first.raw.clone()).unwrap().id, first.id);

        let numbered = normalize_record(
            "tickets",
            serde_json::json!({
                "id": 4411,
                "category": "ticket",
                "severity": "p3",
                "status": " Resolved ",
                "title": "Phish report",
                "occurred_at": "2026-09-02T00:00:00Z"
            }),
        )
        .unwrap();
        assert_eq!(numbered.id, "4411");
        assert_eq!(numbered.status, "resolved");

        let bad = normalize_record("edr", serde_json::json!({"title": "no fields"}));
        assert!(matches!(bad, Err(AdapterError::Parse(_))));
    }

    #[test]
    fn fetch_errors_map_to_adapter_taxonomy() {
        let auth: AdapterError = FetchError::HttpStatus {
            status: 403,
            url: "https://x".into(),
            retry_after_secs: None,
        }
        .into();
        assert!(matches!(auth, AdapterError::Auth(_)));

        let limited: AdapterError = FetchError::HttpStatus {
            status: 429,
            url: "https://x".into(),
            retry_after_secs: Some(30),
        }
        .into();
        assert!(matches!(
            limited,
            AdapterError::RateLimited {
                retry_after_secs: Some(30)
            }
        ));

        let server: AdapterError = FetchError::HttpStatus {
            status: 502,
            url: "https://x".into(),
            retry_after_secs: None,
        }
        .into();
        assert!(matches!(server, AdapterError::Network(_)));
    }
}
