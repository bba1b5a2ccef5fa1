use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use secpulse_adapters::{
    AdapterError, BackoffPolicy, HttpAuth, HttpClientConfig, HttpFetcher, HttpJsonAdapter,
    HttpJsonConfig, OAuthClientConfig, SourceAdapter,
};
use secpulse_core::{CollectionWindow, Severity};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> Arc<HttpFetcher> {
    Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::none(),
            ..HttpClientConfig::default()
        })
        .expect("fetcher"),
    )
}

fn window() -> CollectionWindow {
    let now = Utc.with_ymd_and_hms(2026, 9, 2, 0, 0, 0).single().unwrap();
    CollectionWindow::lookback(24, now)
}

fn adapter(server: &MockServer, auth: HttpAuth, max_pages: usize) -> HttpJsonAdapter {
    HttpJsonAdapter::new(
        HttpJsonConfig {
            source: "edr".into(),
            base_url: server.uri(),
            endpoint: "/v1/alerts".into(),
            auth,
            max_pages,
        },
        fetcher(),
    )
}

#[tokio::test]
async fn follows_pages_and_sends_window_bounds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/alerts"))
        .and(query_param("since", "2026-09-01T00:00:00Z"))
        .and(query_param("until", "2026-09-02T00:00:00Z"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [
                {"id": "a2", "category": "alert", "severity": "low", "title": "two", "occurred_at": "2026-09-01T12:00:00Z"}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/alerts"))
        .and(header("authorization", "Bearer static-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [
                {"id": "a1", "category": "alert", "severity": "critical", "title": "one", "occurred_at": "2026-09-01T11:00:00Z"}
            ],
            "next_page": 2
        })))
        .mount(&server)
        .await;

    let records = adapter(&server, HttpAuth::Bearer("static-token".into()), 5)
        .fetch_batch(&window())
        .await
        .expect("fetch");
    let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["a1", "a2"]);
    assert_eq!(records[0].severity, Severity::Critical);
}

#[tokio::test]
async fn client_credentials_token_is_cached_between_batches() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "t-1", "expires_in": 3600})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/alerts"))
        .and(header("authorization", "Bearer t-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&server)
        .await;

    let oauth = OAuthClientConfig {
        token_url: format!("{}/oauth/token", server.uri()),
        client_id: "id".into(),
        client_secret: "secret".into(),
        scope: None,
    };
    let adapter = adapter(&server, HttpAuth::ClientCredentials(oauth), 1);
    assert!(adapter.fetch_batch(&window()).await.expect("first").is_empty());
    assert!(adapter.fetch_batch(&window()).await.expect("second").is_empty());
}

#[tokio::test]
async fn oversized_token_lifetime_is_capped_not_overflowed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "forever", "expires_in": u64::MAX})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/alerts"))
        .and(header("authorization", "Bearer forever"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&server)
        .await;

    let oauth = OAuthClientConfig {
        token_url: format!("{}/oauth/token", server.uri()),
        client_id: "id".into(),
        client_secret: "secret".into(),
        scope: None,
    };
    let adapter = adapter(&server, HttpAuth::ClientCredentials(oauth), 1);
    assert!(adapter.fetch_batch(&window()).await.expect("first").is_empty());
    assert!(adapter.fetch_batch(&window()).await.expect("second").is_empty());
}

#[tokio::test]
async fn provider_failures_map_to_typed_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/alerts"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    let err = adapter(&server, HttpAuth::Bearer("expired".into()), 1)
        .fetch_batch(&window())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Auth(_)), "{err}");

    let throttled = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "12"))
        .mount(&throttled)
        .await;
    let err = adapter(&throttled, HttpAuth::None, 1)
        .fetch_batch(&window())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AdapterError::RateLimited {
            retry_after_secs: Some(12)
        }
    ));

    let garbled = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&garbled)
        .await;
    let err = adapter(&garbled, HttpAuth::None, 1)
        .fetch_batch(&window())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Parse(_)));
}

#[tokio::test]
async fn unresolved_credentials_mark_the_source_unconfigured() {
    let server = MockServer::start().await;
    let adapter = adapter(&server, HttpAuth::Missing("EDR_TOKEN is not set".into()), 1);
    assert!(!adapter.is_configured());
}
