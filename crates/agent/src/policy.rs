//! Tool policy gate.
//!
//! Evaluated before every tool invocation. A denial never aborts the loop;
//! the orchestrator synthesises an `is_error` tool result carrying the
//! reason so the model can recover.

use std::{collections::HashMap, num::NonZeroU32};

use governor::{Quota, RateLimiter, clock::DefaultClock, state::keyed::DashMapStateStore};
use lynkr_config::PolicyConfig;
use lynkr_llm::messages::ToolCall;

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Outcome of one policy evaluation.
#[derive(Debug)]
pub struct PolicyDecision {
    /// Whether the call may execute.
    pub allowed: bool,
    /// Machine-readable denial code.
    pub code: Option<&'static str>,
    /// Human-readable denial reason.
    pub reason: Option<String>,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            code: None,
            reason: None,
        }
    }

    fn deny(code: &'static str, reason: String) -> Self {
        Self {
            allowed: false,
            code: Some(code),
            reason: Some(reason),
        }
    }
}

/// Deny-lists and per-tool rate limits. Rate limits are scoped per-tool
/// per-session: the limiter key is `(session, tool)`.
pub struct PolicyGate {
    deny: Vec<String>,
    limiters: HashMap<String, KeyedLimiter>,
}

impl PolicyGate {
    /// Build the gate from configuration.
    pub fn new(config: &PolicyConfig) -> Self {
        let mut limiters = HashMap::new();

        for (tool, limit) in &config.rate_limits {
            let Some(burst) = NonZeroU32::new(limit.limit) else {
                log::warn!("rate limit for '{tool}' has zero burst; skipping");
                continue;
            };

            let period = limit.interval / limit.limit.max(1);
            let Some(quota) = Quota::with_period(period) else {
                log::warn!("rate limit for '{tool}' has zero period; skipping");
                continue;
            };

            limiters.insert(tool.clone(), RateLimiter::keyed(quota.allow_burst(burst)));
        }

        Self {
            deny: config.deny.iter().map(|name| name.to_lowercase()).collect(),
            limiters,
        }
    }

    /// Evaluate one tool call for a session.
    pub fn evaluate(&self, call: &ToolCall, session_id: &str) -> PolicyDecision {
        let lowered = call.name.to_lowercase();

        if self.deny.contains(&lowered) {
            return PolicyDecision::deny("policy_denied", format!("tool '{}' is denied by policy", call.name));
        }

        if let Some(limiter) = self.limiters.get(&lowered).or_else(|| self.limiters.get(&call.name)) {
            let key = format!("{session_id}:{lowered}");

            if limiter.check_key(&key).is_err() {
                return PolicyDecision::deny(
                    "rate_limited",
                    format!("tool '{}' exceeded its rate limit for this session", call.name),
                );
            }
        }

        PolicyDecision::allow()
    }
}
