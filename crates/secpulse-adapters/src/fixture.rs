//! Adapter that replays a JSON file of provider records.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use secpulse_core::{CollectedRecord, CollectionWindow};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{normalize_records, AdapterError, SourceAdapter};

/// Reads a JSON array (or `{"records": [...]}`) from disk on every fetch.
///
/// Configured only while the file exists. The collection window is not applied;
/// the file is returned as one batch.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source: String,
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(source: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            path: path.into(),
        }
    }
}

pub(crate) fn record_values(payload: JsonValue) -> Result<Vec<JsonValue>, AdapterError> {
    match payload {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut map) => match map.remove("records") {
            Some(JsonValue::Array(items)) => Ok(items),
            _ => Err(AdapterError::Parse("expected a `records` array".to_string())),
        },
        _ => Err(AdapterError::Parse(
            "expected an array of records or an object with `records`".to_string(),
        )),
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source(&self) -> &str {
        &self.source
    }

    fn is_configured(&self) -> bool {
        self.path.is_file()
    }

    async fn fetch_batch(
        &self,
        _window: &CollectionWindow,
    ) -> Result<Vec<CollectedRecord>, AdapterError> {
        if !self.is_configured() {
            return Err(AdapterError::NotConfigured(self.source.clone()));
        }
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading fixture {}", self.path.display()))?;
        let payload: JsonValue = serde_json::from_str(&data)
            .map_err(|e| AdapterError::Parse(format!("{}: {e}", self.path.display())))?;
        let records = normalize_records(&self.source, record_values(payload)?)?;
        debug!(source = %self.source, records = records.len(), "loaded fixture batch");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn window() -> CollectionWindow {
        CollectionWindow::lookback(24, Utc::now())
    }

    #[tokio::test]
    async fn missing_file_means_not_configured() {
        let adapter = FixtureAdapter::new("edr", "/definitely/not/here.json");
        assert!(!adapter.is_configured());
        assert!(matches!(
            adapter.fetch_batch(&window()).await,
            Err(AdapterError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn reads_wrapped_records_and_stamps_source() {
        let mut file = NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"records": [
                {{"id": "a1", "source": "someone-else", "category": "alert", "severity": "high",
                  "title": "Suspicious login", "occurred_at": "2026-09-01T01:00:00Z"}}
            ]}}"#
        )
        .expect("write fixture");

        let adapter = FixtureAdapter::new("edr", file.path());
        assert!(adapter.is_configured());
        let records = adapter.fetch_batch(&window()).await.expect("fetch");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, "edr");
        assert_eq!(records[0].raw["source"], "someone-else");
    }

    #[tokio::test]
    async fn malformed_json_is_a_parse_error() {
        let mut file = NamedTempFile::new().expect("tempfile");
        write!(file, "{{ not json").expect("write fixture");
        let adapter = FixtureAdapter::new("edr", file.path());
        assert!(matches!(
            adapter.fetch_batch(&window()).await,
            Err(AdapterError::Parse(_))
        ));
    }
}
