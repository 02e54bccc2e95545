//! One primitive over the shared HTTP pool: a JSON POST with optional retry
//! and streaming pass-through.

use std::time::Duration;

use axum::body::Bytes;
use futures::stream::BoxStream;
use lynkr_config::RetryConfig;
use rand::Rng;
use reqwest::RequestBuilder;

use crate::error::LlmError;

/// Raw upstream body stream handed back to the client untouched.
pub type ByteStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// A streaming upstream response. Never retried, never buffered.
pub struct StreamingResponse {
    /// Upstream status code.
    pub status: u16,
    /// Upstream `Content-Type`, usually `text/event-stream`.
    pub content_type: Option<String>,
    /// The raw body.
    pub stream: ByteStream,
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("stream", &"<stream>")
            .finish()
    }
}

/// Send a non-streaming JSON request, retrying transient failures with
/// exponential backoff and jitter. Returns the final response whatever its
/// status; callers map non-2xx bodies to the error taxonomy.
///
/// Retried classes: connect/socket errors, 5xx, and 429 with any
/// `Retry-After` honoured. Everything else returns immediately.
pub(crate) async fn send_with_retry(
    builder: RequestBuilder,
    label: &str,
    retry: &RetryConfig,
) -> Result<reqwest::Response, LlmError> {
    let mut delay = retry.initial_delay;
    let mut attempt = 0u32;

    loop {
        let Some(request) = builder.try_clone() else {
            // Non-clonable request bodies cannot be retried.
            return builder
                .send()
                .await
                .map_err(|e| LlmError::TransportError(format!("{label}: {e}")));
        };

        let outcome = request.send().await;

        match outcome {
            Ok(response) => {
                let status = response.status();
                let retryable = status.as_u16() == 429 || status.is_server_error();

                if !retryable || attempt >= retry.max_retries {
                    return Ok(response);
                }

                let wait = retry_after(&response).unwrap_or(delay);
                log::warn!("{label}: upstream returned {status}, retrying in {}ms", wait.as_millis());

                sleep_with_jitter(wait, retry.max_delay).await;
            }
            Err(error) => {
                if attempt >= retry.max_retries {
                    return Err(LlmError::TransportError(format!("{label}: {error}")));
                }

                log::warn!("{label}: transport error ({error}), retrying in {}ms", delay.as_millis());
                sleep_with_jitter(delay, retry.max_delay).await;
            }
        }

        attempt += 1;
        delay = (delay * 2).min(retry.max_delay);
    }
}

/// Send a streaming request. One POST, no retry, no buffering.
pub(crate) async fn send_streaming(builder: RequestBuilder, label: &str) -> Result<StreamingResponse, LlmError> {
    let response = builder
        .send()
        .await
        .map_err(|e| LlmError::TransportError(format!("{label}: {e}")))?;

    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        return Err(LlmError::HttpError {
            status: status.as_u16(),
            body,
        });
    }

    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    Ok(StreamingResponse {
        status: status.as_u16(),
        content_type,
        stream: Box::pin(response.bytes_stream()),
    })
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(http::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn sleep_with_jitter(base: Duration, max: Duration) {
    let jitter = Duration::from_millis(rand::rng().random_range(0..250));
    tokio::time::sleep((base + jitter).min(max)).await;
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
    use tokio::net::TcpListener;

    use super::*;
    use crate::http_client::http_client;

    async fn flaky(State(hits): State<Arc<AtomicU32>>) -> impl IntoResponse {
        if hits.fetch_add(1, Ordering::SeqCst) < 2 {
            (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response()
        } else {
            (StatusCode::OK, "{\"ok\":true}").into_response()
        }
    }

    async fn spawn(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{address}")
    }

    #[tokio::test]
    async fn transient_5xx_is_retried_within_budget() {
        let hits = Arc::new(AtomicU32::new(0));
        let url = spawn(Router::new().route("/x", post(flaky)).with_state(hits.clone())).await;

        let retry = RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        };

        let response = send_with_retry(http_client().post(format!("{url}/x")).json(&serde_json::json!({})), "test", &retry)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_response() {
        let hits = Arc::new(AtomicU32::new(0));
        let url = spawn(Router::new().route("/x", post(flaky)).with_state(hits.clone())).await;

        let retry = RetryConfig {
            max_retries: 1,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        };

        let response = send_with_retry(http_client().post(format!("{url}/x")).json(&serde_json::json!({})), "test", &retry)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let hits = Arc::new(AtomicU32::new(0));

        async fn bad_request(State(hits): State<Arc<AtomicU32>>) -> impl IntoResponse {
            hits.fetch_add(1, Ordering::SeqCst);
            (StatusCode::BAD_REQUEST, "nope")
        }

        let url = spawn(Router::new().route("/x", post(bad_request)).with_state(hits.clone())).await;

        let retry = RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        };

        let response = send_with_retry(http_client().post(format!("{url}/x")).json(&serde_json::json!({})), "test", &retry)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
