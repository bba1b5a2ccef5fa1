//! Environment configuration and the `sources.yaml` registry file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use secpulse_adapters::{
    AdapterRegistry, FixtureAdapter, HttpAuth, HttpFetcher, HttpJsonAdapter, HttpJsonConfig,
    OAuthClientConfig, SourceAdapter,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_SYNC_CRON: &str = "0 0 */6 * * *";
pub const DEFAULT_MAX_PAGES: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("source {name}: {message}")]
    InvalidSource { name: String, message: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub sources_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_crons: Vec<String>,
    pub source_timeout: Duration,
    pub lookback_hours: u32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    /// Outbound requests allowed per second across all adapters; 0 means unthrottled.
    pub http_requests_per_sec: u32,
    pub summary_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unparseable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            sources_file: lookup("SECPULSE_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            scheduler_enabled: lookup("SECPULSE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(false),
            sync_crons: lookup("SECPULSE_SYNC_CRONS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .filter(|crons| !crons.is_empty())
                .unwrap_or_else(|| vec![DEFAULT_SYNC_CRON.to_string()]),
            source_timeout: Duration::from_secs(parse_or(
                &lookup,
                "SECPULSE_SOURCE_TIMEOUT_SECS",
                60,
            )),
            lookback_hours: parse_or(&lookup, "SECPULSE_LOOKBACK_HOURS", 24),
            http_timeout_secs: parse_or(&lookup, "SECPULSE_HTTP_TIMEOUT_SECS", 20),
            user_agent: lookup("SECPULSE_USER_AGENT")
                .unwrap_or_else(|| format!("secpulse/{}", env!("CARGO_PKG_VERSION"))),
            http_requests_per_sec: parse_or(&lookup, "SECPULSE_HTTP_REQUESTS_PER_SEC", 0),
            summary_ttl_secs: parse_or(&lookup, "SECPULSE_SUMMARY_TTL_SECS", 300),
            cache_max_entries: parse_or(&lookup, "SECPULSE_CACHE_MAX_ENTRIES", 256),
            web_port: parse_or(&lookup, "SECPULSE_WEB_PORT", 8000),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesFile {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Fixture,
    HttpJson,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub client_id_env: Option<String>,
    #[serde(default)]
    pub client_secret_env: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    fn invalid(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::InvalidSource {
            name: self.source.clone(),
            message: message.into(),
        }
    }
}

impl SourcesFile {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Adapters plus any per-source timeout overrides declared next to them.
#[derive(Debug, Clone, Default)]
pub struct BuiltSources {
    pub registry: AdapterRegistry,
    pub timeouts: HashMap<String, Duration>,
}

/// Instantiate every enabled source. Relative fixture paths resolve against `base_dir`.
pub fn build_registry<F>(
    sources: &SourcesFile,
    base_dir: &Path,
    http: Arc<HttpFetcher>,
    lookup: F,
) -> Result<BuiltSources, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut built = BuiltSources::default();
    let mut seen = HashSet::new();

    for source in &sources.sources {
        if source.source.trim().is_empty() {
            return Err(source.invalid("source name must not be empty"));
        }
        if !seen.insert(source.source.clone()) {
            return Err(source.invalid("declared more than once"));
        }
        if !source.enabled {
            continue;
        }

        let adapter: Arc<dyn SourceAdapter> = match source.kind {
            SourceKind::Fixture => {
                let path = source
                    .path
                    .as_ref()
                    .ok_or_else(|| source.invalid("fixture sources need `path`"))?;
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    base_dir.join(path)
                };
                Arc::new(FixtureAdapter::new(&source.source, path))
            }
            SourceKind::HttpJson => {
                let base_url = source
                    .base_url
                    .clone()
                    .ok_or_else(|| source.invalid("http_json sources need `base_url`"))?;
                Arc::new(HttpJsonAdapter::new(
                    HttpJsonConfig {
                        source: source.source.clone(),
                        base_url,
                        endpoint: source.endpoint.clone().unwrap_or_default(),
                        auth: resolve_auth(source, &lookup)?,
                        max_pages: source.max_pages.unwrap_or(DEFAULT_MAX_PAGES),
                    },
                    http.clone(),
                ))
            }
        };

        if !adapter.is_configured() {
            warn!(
                source = %source.source,
                "source registered but not configured; it will be skipped"
            );
        }
        if let Some(secs) = source.timeout_secs {
            built
                .timeouts
                .insert(source.source.clone(), Duration::from_secs(secs.max(1)));
        }
        built.registry.register(adapter);
    }

    Ok(built)
}

fn resolve_auth<F>(source: &SourceConfig, lookup: &F) -> Result<HttpAuth, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

    if let Some(token_env) = &source.token_env {
        return Ok(match read(token_env) {
            Some(token) => HttpAuth::Bearer(token),
            None => HttpAuth::Missing(format!("{token_env} is not set")),
        });
    }

    match (&source.client_id_env, &source.client_secret_env) {
        (None, None) => Ok(HttpAuth::None),
        (Some(id_env), Some(secret_env)) => {
            let token_url = source
                .token_url
                .clone()
                .ok_or_else(|| source.invalid("client credentials need `token_url`"))?;
            Ok(match (read(id_env), read(secret_env)) {
                (Some(client_id), Some(client_secret)) => {
                    HttpAuth::ClientCredentials(OAuthClientConfig {
                        token_url,
                        client_id,
                        client_secret,
                        scope: source.scope.clone(),
                    })
                }
                _ => HttpAuth::Missing(format!("{id_env} or {secret_env} is not set")),
            })
        }
        _ => Err(source.invalid("set both `client_id_env` and `client_secret_env`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secpulse_adapters::HttpClientConfig;

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("fetcher"))
    }

    #[test]
    fn env_defaults_and_overrides() {
        let defaults = SyncConfig::default();
        assert!(defaults.database_url.is_none());
        assert_eq!(defaults.sync_crons, vec![DEFAULT_SYNC_CRON.to_string()]);
        assert_eq!(defaults.source_timeout, Duration::from_secs(60));
        assert_eq!(defaults.lookback_hours, 24);
        assert_eq!(defaults.web_port, 8000);

        let vars: HashMap<&str, &str> = [
            ("SECPULSE_SCHEDULER_ENABLED", "true"),
            ("SECPULSE_SYNC_CRONS", "0 0 6 * * *, 0 0 18 * * *"),
            ("SECPULSE_SOURCE_TIMEOUT_SECS", "5"),
            ("SECPULSE_SUMMARY_TTL_SECS", "not-a-number"),
            ("SECPULSE_HTTP_REQUESTS_PER_SEC", "4"),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert!(config.scheduler_enabled);
        assert_eq!(config.sync_crons.len(), 2);
        assert_eq!(config.source_timeout, Duration::from_secs(5));
        assert_eq!(config.summary_ttl_secs, 300);
        assert_eq!(config.http_requests_per_sec, 4);
    }

    #[test]
    fn registry_skips_disabled_sources_and_resolves_credentials() {
        let yaml = r#"
sources:
  - source: edr
    display_name: Endpoint detection
    kind: fixture
    path: fixtures/edr.json
    timeout_secs: 15
  - source: mail
    kind: http_json
    base_url: https://mail.example
    endpoint: /v1/events
    token_env: MAIL_TOKEN
  - source: tickets
    kind: http_json
    base_url: https://tickets.example
    client_id_env: TICKETS_ID
    client_secret_env: TICKETS_SECRET
    token_url: https://tickets.example/oauth/token
  - source: legacy
    kind: fixture
    path: legacy.json
    enabled: false
"#;
        let file = SourcesFile::parse(yaml, Path::new("sources.yaml")).unwrap();
        let vars: HashMap<&str, &str> = [("TICKETS_ID", "id"), ("TICKETS_SECRET", "s")]
            .into_iter()
            .collect();
        let built = build_registry(&file, Path::new("/srv/secpulse"), fetcher(), |k| {
            vars.get(k).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(built.registry.names(), vec!["edr", "mail", "tickets"]);
        assert!(!built.registry.get("mail").unwrap().is_configured());
        assert!(built.registry.get("tickets").unwrap().is_configured());
        assert_eq!(built.timeouts.get("edr"), Some(&Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn workspace_sources_file_loads_and_fixtures_parse() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let file = SourcesFile::load(&root.join("sources.yaml")).await.unwrap();
        let built = build_registry(&file, &root, fetcher(), |_| None).unwrap();
        assert_eq!(
            built.registry.names(),
            vec!["edr", "mail_gateway", "siem", "ticketing"]
        );

        let window = secpulse_core::CollectionWindow::lookback(24, chrono::Utc::now());
        let edr = built.registry.get("edr").unwrap();
        assert!(edr.is_configured());
        assert_eq!(edr.fetch_batch(&window).await.unwrap().len(), 4);
        let mail = built.registry.get("mail_gateway").unwrap();
        assert_eq!(mail.fetch_batch(&window).await.unwrap().len(), 2);
        assert!(!built.registry.get("siem").unwrap().is_configured());
    }

    #[test]
    fn duplicate_or_incomplete_sources_are_rejected() {
        let dup = SourcesFile::parse(
            "sources:\n  - {source: a, kind: fixture, path: a.json}\n  \
             - {source: a, kind: fixture, path: b.json}\n",
            Path::new("s.yaml"),
        )
        .unwrap();
        assert!(build_registry(&dup, Path::new("."), fetcher(), |_| None).is_err());

        let missing = SourcesFile::parse(
            "sources:\n  - {source: a, kind: http_json}\n",
            Path::new("s.yaml"),
        )
        .unwrap();
        assert!(matches!(
            build_registry(&missing, Path::new("."), fetcher(), |_| None),
            Err(ConfigError::InvalidSource { .. })
        ));
    }
}
