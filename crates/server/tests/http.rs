//! HTTP surface tests: a real server in front of a mock Anthropic upstream.

use std::net::SocketAddr;

use axum::{Json, Router, response::IntoResponse, routing::post};
use indoc::indoc;
use lynkr_config::Config;
use lynkr_server::{ServeConfig, serve};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn mock_anthropic() -> SocketAddr {
    async fn handle(Json(body): Json<Value>) -> impl IntoResponse {
        let last_user = body["messages"]
            .as_array()
            .and_then(|messages| messages.last())
            .and_then(|message| message["content"].as_str())
            .unwrap_or_default()
            .to_string();

        Json(json!({
            "id": "msg_mock",
            "type": "message",
            "role": "assistant",
            "model": body["model"],
            "content": [{"type": "text", "text": format!("echo: {last_user}")}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 3}
        }))
    }

    let app = Router::new().route("/v1/messages", post(handle));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    address
}

async fn start_server(upstream: SocketAddr, shutdown: CancellationToken) -> SocketAddr {
    let dir = tempfile::tempdir().unwrap();

    let config_toml = format!(
        indoc! {r#"
            [llm]
            default_provider = "anthropic"

            [llm.providers.anthropic]
            type = "anthropic"
            api_key = "test-key"
            base_url = "http://{upstream}/v1"

            [audit]
            enabled = true
            log_path = "{dir}/audit.jsonl"
            dictionary_path = "{dir}/dictionary.jsonl"
        "#},
        upstream = upstream,
        dir = dir.path().display(),
    );

    // Leak the tempdir so the audit paths outlive the test server.
    std::mem::forget(dir);

    let config: Config = toml::from_str(&config_toml).unwrap();

    let (sender, receiver) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        serve(ServeConfig {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            config,
            shutdown_signal: shutdown,
            log_filter: "info".to_string(),
            version: "test".to_string(),
            bound_addr_sender: Some(sender),
        })
        .await
        .unwrap();
    });

    receiver.await.unwrap()
}

#[tokio::test]
async fn v1_messages_round_trips_through_the_proxy() {
    let upstream = mock_anthropic().await;
    let server = start_server(upstream, CancellationToken::new()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{server}/v1/messages"))
        .json(&json!({
            "model": "claude-3-5-sonnet",
            "messages": [{"role": "user", "content": "Say hi"}],
            "max_tokens": 64
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);

    assert_eq!(
        response.headers().get("X-Lynkr-Provider").unwrap().to_str().unwrap(),
        "anthropic"
    );
    assert_eq!(
        response.headers().get("X-Lynkr-Routing-Method").unwrap().to_str().unwrap(),
        "static"
    );
    assert_eq!(
        response.headers().get("X-Lynkr-Termination").unwrap().to_str().unwrap(),
        "completion"
    );

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["content"][0]["text"], "echo: Say hi");
}

#[tokio::test]
async fn status_reports_upstream_health_and_breakers() {
    let upstream = mock_anthropic().await;
    let server = start_server(upstream, CancellationToken::new()).await;

    let client = reqwest::Client::new();

    client
        .post(format!("http://{server}/v1/messages"))
        .json(&json!({
            "model": "claude-3-5-sonnet",
            "messages": [{"role": "user", "content": "Say hi"}],
            "max_tokens": 64
        }))
        .send()
        .await
        .unwrap();

    let response = client.get(format!("http://{server}/status")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    let anthropic = &body["upstreams"]["anthropic"];

    assert_eq!(anthropic["healthy"], true);
    assert_eq!(anthropic["health"]["consecutive_failures"], 0);
    assert!(anthropic["health"]["last_success"].is_string());
    assert_eq!(anthropic["breaker"]["state"], "closed");
    assert!(anthropic["breaker"]["requests"].as_u64().unwrap() >= 1);
    assert_eq!(anthropic["breaker"]["rejected"], 0);
}

#[tokio::test]
async fn health_flips_to_503_on_shutdown() {
    let upstream = mock_anthropic().await;
    let shutdown = CancellationToken::new();
    let server = start_server(upstream, shutdown.clone()).await;

    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{server}/health/live"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    shutdown.cancel();

    // The listener may already be gone; either a refused connection or a 503
    // counts as "not live".
    match client.get(format!("http://{server}/health/live")).send().await {
        Ok(response) => assert_eq!(response.status(), 503),
        Err(error) => assert!(error.is_connect() || error.is_request()),
    }
}

#[tokio::test]
async fn upstream_failures_surface_as_api_errors() {
    async fn failing(Json(_): Json<Value>) -> impl IntoResponse {
        (axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": "bad tool schema"})))
    }

    let app = Router::new().route("/v1/messages", post(failing));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let server = start_server(upstream, CancellationToken::new()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{server}/v1/messages"))
        .json(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "api_error");
}
