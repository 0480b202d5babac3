//! Integration tests for the resilient client core.
//!
//! Remote peers are simulated with wiremock; backoff delays are shortened
//! through `HttpConfig`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::json;
use vpn_shop_core::{
    ShopError,
    tax::TaxClient,
    transport::{Authenticator, HttpConfig, ResilientClient, StaticToken},
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path},
};

fn fast_config() -> HttpConfig {
    HttpConfig { initial_backoff_ms: 20, max_backoff_ms: 100, ..HttpConfig::default() }
}

fn client(server: &MockServer) -> ResilientClient {
    ResilientClient::new("test", &server.uri(), StaticToken::bearer("secret"), &fast_config())
        .expect("valid config")
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.map_or(0, |requests| requests.len())
}

#[tokio::test]
async fn test_transient_failures_are_retried_with_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let client = client(&server);
    let url = client.endpoint("/data");
    let started = Instant::now();
    let response = client.execute("get_data", |http, _| http.get(&url)).await.unwrap();

    assert_eq!(response.body, "ok");
    assert_eq!(request_count(&server).await, 3);
    // 20ms after the first failure, 40ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn test_retries_exhausted_reports_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let client = client(&server);
    let url = client.endpoint("/data");
    let error = client.execute("get_data", |http, _| http.get(&url)).await.unwrap_err();

    assert!(
        matches!(error, ShopError::RetriesExhausted { attempts: 3, operation: "get_data", .. }),
        "unexpected {error:?}"
    );
    assert!(error.is_retryable());
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad username"))
        .mount(&server)
        .await;

    let client = client(&server);
    let url = client.endpoint("/data");
    let error = client.execute("post_data", |http, _| http.post(&url)).await.unwrap_err();

    match error {
        ShopError::Client { status, body, .. } => {
            assert_eq!(status, 422);
            assert_eq!(body, "bad username");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let url = client.endpoint("/data");
    client.execute("get_data", |http, _| http.get(&url)).await.unwrap();
}

#[tokio::test]
async fn test_auth_failure_reauthenticates_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let client = client(&server);
    let url = client.endpoint("/data");
    let response = client.execute("get_data", |http, _| http.get(&url)).await.unwrap();

    assert_eq!(response.body, "ok");
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn test_second_auth_failure_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let client = client(&server);
    let url = client.endpoint("/data");
    let error = client.execute("get_data", |http, _| http.get(&url)).await.unwrap_err();

    assert!(matches!(error, ShopError::Authentication { service: "test", .. }), "{error:?}");
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn test_not_found_maps_to_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client(&server);
    let url = client.endpoint("/data");
    let value: Option<serde_json::Value> =
        client.execute_optional_json("get_data", |http, _| http.get(&url)).await.unwrap();

    assert!(value.is_none());
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn test_decoding_error_keeps_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let client = client(&server);
    let url = client.endpoint("/data");
    let error = client
        .execute_json::<serde_json::Value, _>("get_data", |http, _| http.get(&url))
        .await
        .unwrap_err();

    assert!(
        matches!(&error, ShopError::Decoding { body, .. } if body == "<html>maintenance</html>"),
        "{error:?}"
    );
}

#[tokio::test]
async fn test_operation_timeout_bounds_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let config = HttpConfig { operation_timeout_secs: 1, ..fast_config() };
    let client = ResilientClient::new("test", &server.uri(), StaticToken::bearer("secret"), &config)
        .unwrap();
    let url = client.endpoint("/data");
    let error = client.execute("get_data", |http, _| http.get(&url)).await.unwrap_err();

    assert!(matches!(error, ShopError::Timeout(d) if d == Duration::from_secs(1)), "{error:?}");
}

async fn mount_login(server: &MockServer, delay: Duration) {
    Mock::given(method("POST"))
        .and(path("/auth/lkfl"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"token": "t1"})).set_delay(delay),
        )
        .mount(server)
        .await;
}

fn receipt() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"approvedReceiptUuid": "receipt-1"}))
}

async fn login_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/auth/lkfl")
        .count()
}

#[tokio::test]
async fn test_concurrent_callers_share_one_login() {
    let server = MockServer::start().await;
    mount_login(&server, Duration::from_millis(200)).await;
    Mock::given(method("POST"))
        .and(path("/income"))
        .and(header("authorization", "Bearer t1"))
        .respond_with(receipt())
        .mount(&server)
        .await;

    let tax = TaxClient::new(&server.uri(), "inn", "password", &fast_config()).unwrap();
    assert!(!tax.is_authenticated());

    let calls: Vec<_> = (0..10)
        .map(|_| {
            let tax = tax.clone();
            tokio::spawn(async move { tax.create_income(Decimal::new(15_000, 2), "VPN").await })
        })
        .collect();
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap().approved_receipt_uuid, "receipt-1");
    }

    assert_eq!(login_count(&server).await, 1);
    assert!(tax.is_authenticated());
}

/// Issues `t1`, `t2`, ... and counts how often it was asked.
#[derive(Debug)]
struct CountingAuth {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Authenticator for CountingAuth {
    async fn authenticate(&self, _http: &Client) -> vpn_shop_core::Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("t{n}"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_on_invalid_token_reauthenticate_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("authorization", "Bearer t1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("authorization", "Bearer t2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let calls = Arc::new(AtomicU32::new(0));
    let client = ResilientClient::new(
        "test",
        &server.uri(),
        CountingAuth { calls: calls.clone() },
        &fast_config(),
    )
    .unwrap();
    client.authenticate().await.unwrap();
    assert_eq!(client.cached_token().as_deref(), Some("t1"));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                let url = client.endpoint("/data");
                client.execute("get_data", |http, _| http.get(&url)).await
            })
        })
        .collect();
    let mut ok = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().body == "ok" {
            ok += 1;
        }
    }

    assert_eq!(ok, 10);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.cached_token().as_deref(), Some("t2"));
}

#[tokio::test]
async fn test_expired_tax_token_is_refreshed() {
    let server = MockServer::start().await;
    mount_login(&server, Duration::ZERO).await;
    Mock::given(method("POST"))
        .and(path("/income"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/income"))
        .respond_with(receipt())
        .mount(&server)
        .await;

    let tax = TaxClient::connect(&server.uri(), "inn", "password", &fast_config()).await.unwrap();
    let receipt = tax.create_income(Decimal::new(150, 0), "VPN").await.unwrap();

    assert_eq!(receipt.approved_receipt_uuid, "receipt-1");
    assert_eq!(login_count(&server).await, 2);
}

#[tokio::test]
async fn test_rejected_tax_login_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/lkfl"))
        .respond_with(ResponseTemplate::new(400).set_body_string("wrong password"))
        .mount(&server)
        .await;

    let result = TaxClient::connect(&server.uri(), "inn", "wrong", &fast_config()).await;

    assert!(matches!(result, Err(ShopError::Authentication { service: "tax", .. })));
    assert_eq!(login_count(&server).await, 1);
}
