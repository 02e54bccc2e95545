//! Canonical message schema, provider adapters and dispatch for Lynkr.
//!
//! The conversion flow follows this pattern:
//!
//! ```text
//! Client request → ChatRequest → sanitize → Dispatcher → Provider → ChatResponse
//! ```
//!
//! Providers are stateless translators between the canonical Anthropic-style
//! schema and each upstream's wire format. The dispatcher owns routing,
//! circuit breaking and fallback; the transport layer owns retries and the
//! shared connection pool.

mod breaker;
mod dispatch;
mod error;
mod health;
mod http_client;
pub mod messages;
pub mod provider;
mod request;
mod routing;
pub mod sanitize;
mod transport;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerRegistry};
pub use dispatch::{Dispatched, Dispatcher, FailureCategory, Reply};
pub use error::{LlmError, LlmResult as Result};
pub use health::{HealthTracker, UpstreamHealth};
pub use request::RequestContext;
pub use routing::{RoutingDecision, RoutingMethod, complexity_score};
pub use transport::{ByteStream, StreamingResponse};
