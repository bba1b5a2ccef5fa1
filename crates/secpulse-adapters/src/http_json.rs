//! Generic adapter for providers that already speak the normalized record shape over HTTP.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::SecondsFormat;
use secpulse_core::{CollectedRecord, CollectionWindow};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::fixture::record_values;
use crate::http::{FetchError, FetchRequest, HttpFetcher};
use crate::{normalize_records, AdapterError, SourceAdapter};

/// Refresh this long before the provider-declared expiry.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;
/// Provider-declared lifetimes are capped here.
const MAX_TOKEN_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpAuth {
    None,
    Bearer(String),
    ClientCredentials(OAuthClientConfig),
    /// Credentials were declared but could not be resolved; carries the reason.
    Missing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpJsonConfig {
    pub source: String,
    pub base_url: String,
    pub endpoint: String,
    pub auth: HttpAuth,
    pub max_pages: usize,
}

impl HttpJsonConfig {
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.endpoint.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug)]
pub struct HttpJsonAdapter {
    config: HttpJsonConfig,
    http: Arc<HttpFetcher>,
    token: Mutex<Option<CachedToken>>,
}

impl HttpJsonAdapter {
    pub fn new(config: HttpJsonConfig, http: Arc<HttpFetcher>) -> Self {
        Self {
            config,
            http,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<Option<String>, AdapterError> {
        match &self.config.auth {
            HttpAuth::None => Ok(None),
            HttpAuth::Bearer(token) => Ok(Some(token.clone())),
            HttpAuth::Missing(reason) => Err(AdapterError::NotConfigured(format!(
                "{}: {reason}",
                self.config.source
            ))),
            HttpAuth::ClientCredentials(oauth) => {
                let mut cached = self.token.lock().await;
                if let Some(token) = cached.as_ref() {
                    if token.expires_at > Instant::now() + TOKEN_EXPIRY_SKEW {
                        return Ok(Some(token.access_token.clone()));
                    }
                }
                let fresh = self.request_token(oauth).await?;
                let access_token = fresh.access_token.clone();
                *cached = Some(fresh);
                Ok(Some(access_token))
            }
        }
    }

    async fn request_token(&self, oauth: &OAuthClientConfig) -> Result<CachedToken, AdapterError> {
        let mut form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), oauth.client_id.clone()),
            ("client_secret".to_string(), oauth.client_secret.clone()),
        ];
        if let Some(scope) = &oauth.scope {
            form.push(("scope".to_string(), scope.clone()));
        }
        let resp = self
            .http
            .fetch(&self.config.source, &FetchRequest::post_form(&oauth.token_url, form))
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus {
                    status: status @ (400 | 401 | 403),
                    url,
                    ..
                } => AdapterError::Auth(format!("token request rejected with {status} by {url}")),
                other => AdapterError::from(other),
            })?;
        let token: TokenResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| AdapterError::Parse(format!("token response: {e}")))?;
        debug!(source = %self.config.source, "refreshed access token");
        let ttl_secs = token
            .expires_in
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS)
            .min(MAX_TOKEN_TTL_SECS);
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(ttl_secs),
        })
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn fetch_page(
        &self,
        window: &CollectionWindow,
        token: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<(Vec<JsonValue>, Option<String>), AdapterError> {
        let mut request = FetchRequest::get(self.config.url())
            .query("since", window.since.to_rfc3339_opts(SecondsFormat::Secs, true))
            .query("until", window.until.to_rfc3339_opts(SecondsFormat::Secs, true));
        if let Some(cursor) = cursor {
            request = request.query("page", cursor);
        }
        if let Some(token) = token {
            request = request.bearer(token);
        }

        let resp = match self.http.fetch(&self.config.source, &request).await {
            Ok(resp) => resp,
            Err(err) => {
                let err = AdapterError::from(err);
                if matches!(err, AdapterError::Auth(_)) {
                    self.invalidate_token().await;
                }
                return Err(err);
            }
        };
        let payload: JsonValue = serde_json::from_slice(&resp.body)
            .map_err(|e| AdapterError::Parse(format!("{}: {e}", resp.final_url)))?;
        split_page(payload)
    }
}

fn split_page(payload: JsonValue) -> Result<(Vec<JsonValue>, Option<String>), AdapterError> {
    let next = match &payload {
        JsonValue::Object(map) => match map.get("next_page") {
            Some(JsonValue::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            _ => None,
        },
        _ => None,
    };
    Ok((record_values(payload)?, next))
}

#[async_trait]
impl SourceAdapter for HttpJsonAdapter {
    fn source(&self) -> &str {
        &self.config.source
    }

    fn is_configured(&self) -> bool {
        !self.config.base_url.trim().is_empty() && !matches!(self.config.auth, HttpAuth::Missing(_))
    }

    async fn fetch_batch(
        &self,
        window: &CollectionWindow,
    ) -> Result<Vec<CollectedRecord>, AdapterError> {
        let token = self.access_token().await?;
        let max_pages = self.config.max_pages.max(1);
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 1..=max_pages {
            let (values, next) = self
                .fetch_page(window, token.as_deref(), cursor.as_deref())
                .await?;
            records.extend(normalize_records(&self.config.source, values)?);
            match next {
                Some(next) if page < max_pages => cursor = Some(next),
                Some(_) => {
                    warn!(
                        source = %self.config.source,
                        max_pages,
                        "stopping pagination at page limit"
                    );
                    break;
                }
                None => break,
            }
        }
        Ok(records)
    }
}
