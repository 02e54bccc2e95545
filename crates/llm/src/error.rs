use std::time::Duration;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Failure taxonomy for the whole request pipeline, mapped onto HTTP
/// status codes and Anthropic-style error bodies.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The requested provider is not configured.
    #[error("Provider '{0}' is not configured")]
    ProviderUnavailable(String),

    /// The upstream returned a non-2xx status.
    #[error("Upstream error ({status}): {body}")]
    HttpError {
        /// Status returned by the upstream.
        status: u16,
        /// Raw upstream error body.
        body: String,
    },

    /// Socket, DNS or protocol-level failure talking to the upstream.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The upstream's circuit breaker is open.
    #[error("Circuit breaker open for '{provider}'")]
    CircuitOpen {
        /// Provider whose breaker rejected the call.
        provider: String,
        /// Time until the breaker allows a probe.
        retry_after: Duration,
    },

    /// A tool call was denied by policy. Never surfaces to the client; the
    /// orchestrator synthesises an `is_error` tool result instead.
    #[error("Tool call denied by policy: {0}")]
    PolicyDenied(String),

    /// The model repeated an identical tool call past the termination threshold.
    #[error("Tool call loop detected for '{tool}'")]
    ToolLoopDetected {
        /// Tool being called repeatedly.
        tool: String,
    },

    /// The loop exhausted its step budget.
    #[error("Maximum steps ({0}) exceeded")]
    MaxStepsExceeded(u32),

    /// The loop exhausted its tool call budget.
    #[error("Maximum tool calls ({0}) exceeded")]
    MaxToolCallsExceeded(u32),

    /// The upstream returned a body that is not valid JSON.
    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),

    /// The upstream returned JSON in an unrecognised shape.
    #[error("Unrecognised upstream schema: {0}")]
    SchemaError(String),

    /// The proxy is shutting down.
    #[error("Service is shutting down")]
    Shutdown,

    /// Internal error. If Some(message), it came from an upstream and can be
    /// shown; if None, details must not leak.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl LlmError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ProviderUnavailable(_) | Self::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::HttpError { status, .. } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            Self::TransportError(_) | Self::MalformedResponse(_) | Self::SchemaError(_) => StatusCode::BAD_GATEWAY,
            Self::PolicyDenied(_) => StatusCode::FORBIDDEN,
            Self::ToolLoopDetected { .. } | Self::MaxToolCallsExceeded(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::MaxStepsExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Wire-visible `error.type` string.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::HttpError { .. } => "api_error",
            Self::TransportError(_) => "transport_error",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::PolicyDenied(_) => "policy_denied",
            Self::ToolLoopDetected { .. } => "tool_call_loop_detected",
            Self::MaxStepsExceeded(_) => "max_steps_exceeded",
            Self::MaxToolCallsExceeded(_) => "max_tool_calls_exceeded",
            Self::MalformedResponse(_) => "malformed_response",
            Self::SchemaError(_) => "schema_error",
            Self::Shutdown => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the transport layer may retry this failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransportError(_) => true,
            Self::HttpError { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }

    /// Message that is safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(upstream)) => upstream.clone(),
            Self::Internal(None) => "Internal server error".to_string(),
            Self::HttpError { body, .. } => body.clone(),
            other => other.to_string(),
        }
    }
}

/// Anthropic-style error envelope.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    r#type: &'static str,
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    r#type: &'static str,
    message: String,
}

impl IntoResponse for LlmError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = ErrorResponse {
            r#type: "error",
            error: ErrorDetails {
                r#type: self.error_type(),
                message: self.client_message(),
            },
        };

        let mut response = (status, Json(body)).into_response();

        if let LlmError::CircuitOpen { retry_after, .. } = self
            && let Ok(value) = retry_after.as_secs().to_string().parse()
        {
            response.headers_mut().insert(http::header::RETRY_AFTER, value);
        }

        response
    }
}
