use axum::http::HeaderMap;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

/// Header name for user-provided API keys (BYOK - Bring Your Own Key).
const PROVIDER_API_KEY_HEADER: &str = "X-Provider-API-Key";

/// Header callers set to keep a failing request on its primary provider.
const DISABLE_FALLBACK_HEADER: &str = "X-Lynkr-Disable-Fallback";

/// Runtime context travelling with one request through dispatch.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// User-provided API key overriding the configured one.
    pub api_key: Option<SecretString>,

    /// Correlation id stamped on session turns and audit records.
    pub correlation_id: String,

    /// The caller opted out of provider fallback.
    pub fallback_disabled: bool,

    /// Incoming request headers.
    pub headers: HeaderMap,

    /// Cooperative shutdown signal. Cancelling aborts in-flight upstream
    /// calls; the result counts neither success nor failure on the breaker.
    pub shutdown: CancellationToken,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            api_key: None,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            fallback_disabled: false,
            headers: HeaderMap::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

impl RequestContext {
    /// Extract the request context from inbound headers.
    pub fn from_headers(headers: &HeaderMap, shutdown: CancellationToken) -> Self {
        let api_key = headers
            .get(PROVIDER_API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|key| SecretString::from(key.to_string()));

        let fallback_disabled = headers
            .get(DISABLE_FALLBACK_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("true") || value == "1");

        let correlation_id = headers
            .get("X-Correlation-Id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            api_key,
            correlation_id,
            fallback_disabled,
            headers: headers.clone(),
            shutdown,
        }
    }
}
