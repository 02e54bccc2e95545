//! Lynkr server library.
//!
//! Provides a reusable serve function for the binary and the integration
//! tests: wires configuration into the dispatcher, orchestrator, audit
//! logger and caches, and exposes the HTTP surface.

#![deny(missing_docs)]

mod load_shed;
mod logger;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use lynkr_agent::{Orchestrator, Outcome, OutcomeBody, PolicyGate, SessionRecorder, UnavailableToolRunner};
use lynkr_audit::AuditLogger;
use lynkr_cache::{ExactCache, HttpEmbeddingClient, SemanticCache};
use lynkr_config::Config;
use lynkr_llm::{CircuitBreakerRegistry, Dispatcher, HealthTracker, messages::ChatRequest, provider};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::load_shed::LoadShedder;

pub use logger::init as init_logger;

/// Configuration for serving Lynkr.
pub struct ServeConfig {
    /// The socket address the server binds to.
    pub listen_address: SocketAddr,
    /// The loaded Lynkr configuration.
    pub config: Config,
    /// Cancellation token for graceful shutdown.
    pub shutdown_signal: CancellationToken,
    /// Log filter string (e.g. "info" or "lynkr_llm=debug").
    pub log_filter: String,
    /// The version string to log on startup.
    pub version: String,
    /// Optional oneshot sender to report the bound address (useful when
    /// binding port 0).
    pub bound_addr_sender: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    dispatcher: Arc<Dispatcher>,
    audit: Option<Arc<AuditLogger>>,
    shedder: Arc<LoadShedder>,
    shutdown: CancellationToken,
    session_dir: Option<String>,
}

/// Starts and runs the Lynkr server with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        log_filter,
        version,
        bound_addr_sender,
    }: ServeConfig,
) -> anyhow::Result<()> {
    logger::init(&log_filter);

    log::info!("Lynkr {version}");

    let providers = provider::build_providers(&config.llm)
        .await
        .map_err(|e| anyhow::anyhow!("failed to initialize providers: {e}"))?;

    let dispatcher = Arc::new(Dispatcher::new(
        providers,
        Arc::new(CircuitBreakerRegistry::new(config.llm.circuit_breaker)),
        HealthTracker::new(),
        config.llm.clone(),
    ));

    let audit = if config.audit.enabled {
        Some(Arc::new(AuditLogger::open(config.audit.clone()).await?))
    } else {
        None
    };

    let exact_cache = config
        .cache
        .exact
        .enabled
        .then(|| Arc::new(ExactCache::new(&config.cache.exact)));

    let semantic_cache = config.cache.semantic.enabled.then(|| {
        let embeddings = HttpEmbeddingClient::from_config(&config.cache.semantic)
            .map(|client| Arc::new(client) as Arc<dyn lynkr_cache::EmbeddingClient>);

        Arc::new(SemanticCache::new(&config.cache.semantic, embeddings))
    });

    let orchestrator = Arc::new(Orchestrator::new(
        dispatcher.clone(),
        PolicyGate::new(&config.agent.policy),
        Arc::new(UnavailableToolRunner),
        audit.clone(),
        exact_cache,
        semantic_cache,
        None,
        config.agent.clone(),
        config.llm.clone(),
        shutdown_signal.clone(),
    ));

    let state = AppState {
        orchestrator,
        dispatcher,
        audit: audit.clone(),
        shedder: Arc::new(LoadShedder::new(config.server.load_shedding.clone())),
        shutdown: shutdown_signal.clone(),
        session_dir: config.agent.session_dir.clone(),
    };

    let app = Router::new()
        .route("/v1/messages", post(messages))
        .route("/status", get(status))
        .route(&config.server.health_path, get(health))
        .with_state(state);

    let listener = TcpListener::bind(listen_address).await?;
    let bound_addr = listener.local_addr()?;

    log::info!("listening on {bound_addr}");

    if let Some(sender) = bound_addr_sender
        && sender.send(bound_addr).is_err()
    {
        log::warn!("bound address receiver dropped");
    }

    let shutdown = shutdown_signal.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    // In-flight requests are done; drain the audit writer before exit.
    if let Some(audit) = audit {
        audit.close().await;
    }

    log::info!("shutdown complete");

    Ok(())
}

async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Response {
    if state.shedder.should_shed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "type": "error",
                "error": {"type": "overloaded", "message": "server is shedding load"}
            })),
        )
            .into_response();
    }

    let session_id = headers
        .get("X-Session-Id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let cwd = headers
        .get("X-Lynkr-Cwd")
        .and_then(|value| value.to_str().ok())
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let mut session = SessionRecorder::new(session_id, state.session_dir.as_deref());

    let outcome = state
        .orchestrator
        .process_message(payload, &headers, &mut session, &cwd)
        .await;

    outcome_response(outcome)
}

fn outcome_response(outcome: Outcome) -> Response {
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = match outcome.body {
        OutcomeBody::Json(body) => (status, Json(body)).into_response(),
        OutcomeBody::Stream(streaming) => {
            let mut response = Response::builder()
                .status(streaming.status)
                .body(Body::from_stream(streaming.stream))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());

            if let Some(content_type) = streaming.content_type
                && let Ok(value) = HeaderValue::from_str(&content_type)
            {
                response.headers_mut().insert(http::header::CONTENT_TYPE, value);
            }

            response
        }
    };

    for (name, value) in outcome.headers {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            response.headers_mut().insert(name, value);
        }
    }

    response
}

async fn health(State(state): State<AppState>) -> Response {
    if state.shutdown.is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response()
    } else {
        (StatusCode::OK, "ok").into_response()
    }
}

/// Per-upstream health and circuit breaker counters.
async fn status(State(state): State<AppState>) -> Response {
    let mut upstreams = serde_json::Map::new();

    for (name, snapshot) in state.dispatcher.breakers().snapshots() {
        let health = state.dispatcher.health().get(&name);

        upstreams.insert(
            name,
            serde_json::json!({
                "healthy": health.is_healthy(),
                "health": health,
                "breaker": snapshot,
            }),
        );
    }

    // Upstreams the breakers have not seen yet still show their health entry.
    for (name, health) in state.dispatcher.health().all() {
        upstreams.entry(name).or_insert_with(|| {
            serde_json::json!({
                "healthy": health.is_healthy(),
                "health": health,
            })
        });
    }

    Json(serde_json::json!({ "upstreams": upstreams })).into_response()
}
