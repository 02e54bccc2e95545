//! The agent loop: model → tool → model until completion or a guard fires.

use std::{
    path::Path,
    sync::Arc,
    time::Instant,
};

use http::HeaderMap;
use lynkr_audit::{AuditLogger, AuditRecord};
use lynkr_cache::{ExactCache, SemanticCache, SemanticKey};
use lynkr_config::{AgentConfig, LlmConfig};
use lynkr_llm::{
    Dispatched, Dispatcher, LlmError, Reply, RequestContext, StreamingResponse,
    messages::{ChatRequest, ChatResponse, ContentBlock, Message, MessageContent, Role, SystemPrompt, ToolCall, ToolResultContent},
    sanitize,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::{
    guard::{self, GuardAction, SignatureTracker},
    memory::{self, MemoryProvider},
    policy::PolicyGate,
    session::{SessionRecorder, TurnKind},
    tools::{ToolContext, ToolOutcome, ToolRunner, is_server_side},
};

/// Why the loop ended, exposed to the caller via `X-Lynkr-Termination`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TerminationReason {
    /// The model produced a final message.
    Completion,
    /// Non-server-side tool calls were returned to the client.
    ToolUse,
    /// The response is a raw upstream stream.
    Streaming,
    /// The upstream body was not JSON.
    NonJsonResponse,
    /// The upstream failed.
    ApiError,
    /// The upstream returned JSON in an unrecognised shape.
    MalformedResponse,
    /// The model repeated an identical tool call past the threshold.
    ToolCallLoop,
    /// The pre-request guard broke a loop carried across requests.
    ToolLoopGuard,
    /// The per-request tool execution budget ran out.
    MaxToolCallsExceeded,
    /// The step or duration budget ran out.
    MaxSteps,
    /// The proxy is shutting down.
    Shutdown,
}

/// Response payload of one processed message.
pub enum OutcomeBody {
    /// A JSON body.
    Json(Value),
    /// A raw upstream stream, passed through untouched.
    Stream(StreamingResponse),
}

/// Result of `process_message`.
pub struct Outcome {
    /// HTTP status to answer with.
    pub status: u16,
    /// Body.
    pub body: OutcomeBody,
    /// Response headers (routing metadata and termination reason).
    pub headers: Vec<(String, String)>,
    /// Why the loop ended.
    pub termination: TerminationReason,
}

impl Outcome {
    fn json(status: u16, body: Value, headers: Vec<(String, String)>, termination: TerminationReason) -> Self {
        let mut headers = headers;
        headers.push(("X-Lynkr-Termination".to_string(), termination.to_string()));

        Self {
            status,
            body: OutcomeBody::Json(body),
            headers,
            termination,
        }
    }

    fn error(error: &LlmError, headers: Vec<(String, String)>, termination: TerminationReason) -> Self {
        Self::json(
            error.status_code().as_u16(),
            json!({
                "type": "error",
                "error": {
                    "type": error.error_type(),
                    "message": error.client_message(),
                }
            }),
            headers,
            termination,
        )
    }
}

/// Per-request driver of the model-tool cycle.
///
/// All shared state (dispatcher, breakers, caches, audit) is constructed at
/// startup and injected; the orchestrator itself holds no request state.
pub struct Orchestrator {
    dispatcher: Arc<Dispatcher>,
    policy: PolicyGate,
    tools: Arc<dyn ToolRunner>,
    audit: Option<Arc<AuditLogger>>,
    exact_cache: Option<Arc<ExactCache>>,
    semantic_cache: Option<Arc<SemanticCache>>,
    memory: Option<Arc<dyn MemoryProvider>>,
    agent_config: AgentConfig,
    llm_config: LlmConfig,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Assemble the orchestrator from its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        policy: PolicyGate,
        tools: Arc<dyn ToolRunner>,
        audit: Option<Arc<AuditLogger>>,
        exact_cache: Option<Arc<ExactCache>>,
        semantic_cache: Option<Arc<SemanticCache>>,
        memory: Option<Arc<dyn MemoryProvider>>,
        agent_config: AgentConfig,
        llm_config: LlmConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            policy,
            tools,
            audit,
            exact_cache,
            semantic_cache,
            memory,
            agent_config,
            llm_config,
            shutdown,
        }
    }

    /// Process one inbound request end to end.
    pub async fn process_message(
        &self,
        payload: ChatRequest,
        headers: &HeaderMap,
        session: &mut SessionRecorder,
        cwd: &Path,
    ) -> Outcome {
        let context = RequestContext::from_headers(headers, self.shutdown.child_token());

        // Pre-sanitisation loop guard: a conversation arriving with a pile of
        // unanswered tool results is a loop carried across requests.
        let guard_threshold = self.agent_config.limits.tool_result_guard_threshold as usize;
        if guard_threshold > 0 && guard::tool_results_since_last_user_text(&payload) >= guard_threshold {
            let response = ChatResponse::synthetic(&payload.model, guard::summarize_tool_results(&payload));

            session.append(
                "assistant",
                TurnKind::SystemWarning,
                "ok",
                response.text(),
                json!({"guard": "tool_loop_guard"}),
            );

            log::warn!("tool loop guard fired before any upstream call");

            return Outcome::json(
                200,
                serde_json::to_value(&response).unwrap_or_default(),
                Vec::new(),
                TerminationReason::ToolLoopGuard,
            );
        }

        let mut request = sanitize::clean(&payload, &self.llm_config);

        if let Some(text) = request.last_user_text() {
            session.append("user", TurnKind::Message, "ok", text, Value::Null);
        }

        self.audit_request(&request, &context);

        // Cache hits short-circuit the loop entirely.
        let exact_key = self.exact_cache.as_ref().map(|_| ExactCache::key(&request));

        if let (Some(cache), Some(key)) = (&self.exact_cache, &exact_key)
            && let Some(hit) = cache.get(key)
        {
            session.append("assistant", TurnKind::Message, "ok", hit.text(), json!({"cache": "exact"}));
            return Outcome::json(
                200,
                serde_json::to_value(&hit).unwrap_or_default(),
                Vec::new(),
                TerminationReason::Completion,
            );
        }

        let mut semantic_key: Option<SemanticKey> = None;
        if let Some(cache) = &self.semantic_cache {
            semantic_key = cache.prepare(&request).await;

            if let Some(key) = &semantic_key
                && let Some(hit) = cache.lookup(key)
            {
                session.append("assistant", TurnKind::Message, "ok", hit.text(), json!({"cache": "semantic"}));
                return Outcome::json(
                    200,
                    serde_json::to_value(&hit).unwrap_or_default(),
                    Vec::new(),
                    TerminationReason::Completion,
                );
            }
        }

        let started = Instant::now();
        let limits = self.agent_config.limits.clone();
        let mut steps = 0u32;
        let mut tool_calls_executed = 0u32;
        let mut tracker = SignatureTracker::new(limits.tool_loop_warning_threshold);
        let mut routing_headers: Vec<(String, String)> = Vec::new();

        loop {
            if self.shutdown.is_cancelled() {
                session.append("assistant", TurnKind::Error, "shutdown", "service shutting down", Value::Null);
                return Outcome::error(&LlmError::Shutdown, routing_headers, TerminationReason::Shutdown);
            }

            if steps >= limits.max_steps || started.elapsed() >= limits.max_duration {
                session.append("assistant", TurnKind::Error, "max_steps", "step or duration budget exhausted", Value::Null);

                return Outcome::json(
                    504,
                    json!({
                        "type": "error",
                        "error": {
                            "type": "max_steps_exceeded",
                            "message": format!("request exceeded {} steps or {}ms", limits.max_steps, limits.max_duration.as_millis()),
                        },
                        "metrics": {
                            "steps": steps,
                            "tool_calls_executed": tool_calls_executed,
                            "elapsed_ms": started.elapsed().as_millis() as u64,
                        }
                    }),
                    routing_headers,
                    TerminationReason::MaxSteps,
                );
            }

            if steps == 0 {
                self.first_iteration_hooks(&mut request).await;
            }

            let dispatched = match self.dispatcher.dispatch(request.clone(), &context).await {
                Ok(dispatched) => dispatched,
                Err(LlmError::Shutdown) => {
                    session.append("assistant", TurnKind::Error, "shutdown", "service shutting down", Value::Null);
                    return Outcome::error(&LlmError::Shutdown, routing_headers, TerminationReason::Shutdown);
                }
                Err(error) => {
                    session.append("assistant", TurnKind::Error, "error", error.to_string(), Value::Null);

                    let termination = match &error {
                        LlmError::MalformedResponse(_) => TerminationReason::NonJsonResponse,
                        LlmError::SchemaError(_) => TerminationReason::MalformedResponse,
                        _ => TerminationReason::ApiError,
                    };

                    return Outcome::error(&error, routing_headers, termination);
                }
            };

            steps += 1;
            routing_headers = routing_metadata(&dispatched);

            let response = match dispatched.reply {
                Reply::Stream(stream) => {
                    session.append("assistant", TurnKind::Message, "streaming", "", Value::Null);

                    let mut headers = routing_headers;
                    headers.push(("X-Lynkr-Termination".to_string(), TerminationReason::Streaming.to_string()));

                    return Outcome {
                        status: 200,
                        body: OutcomeBody::Stream(stream),
                        headers,
                        termination: TerminationReason::Streaming,
                    };
                }
                Reply::Message(response) => *response,
            };

            self.audit_response(&response, &dispatched.actual_provider, &context);

            let calls = response.tool_calls();

            if calls.is_empty() {
                session.append(
                    "assistant",
                    TurnKind::Message,
                    "ok",
                    response.text(),
                    json!({"provider": dispatched.actual_provider}),
                );

                if let (Some(cache), Some(key)) = (&self.exact_cache, exact_key.clone()) {
                    cache.store(key, &response);
                }
                if let (Some(cache), Some(key)) = (&self.semantic_cache, semantic_key.take()) {
                    cache.store(key, &response);
                }

                return Outcome::json(
                    200,
                    serde_json::to_value(&response).unwrap_or_default(),
                    routing_headers,
                    TerminationReason::Completion,
                );
            }

            let call_names: Vec<&str> = calls.iter().map(|call| call.name.as_str()).collect();

            // Hybrid split: hand non-server-side calls back to the client.
            if self.agent_config.tool_execution_mode.splits_to_client()
                && calls.iter().any(|call| !is_server_side(&call.name))
            {
                session.append(
                    "assistant",
                    TurnKind::ToolRequest,
                    "passthrough",
                    response.text(),
                    json!({"tools": call_names}),
                );

                return Outcome::json(
                    200,
                    serde_json::to_value(&response).unwrap_or_default(),
                    routing_headers,
                    TerminationReason::ToolUse,
                );
            }

            session.append(
                "assistant",
                TurnKind::ToolRequest,
                "ok",
                response.text(),
                json!({"tools": call_names}),
            );

            request.messages.push(Message {
                role: Role::Assistant,
                content: MessageContent::Blocks(response.content.clone()),
            });

            let turn = match self
                .run_tool_turn(&calls, &mut tracker, &mut tool_calls_executed, session, cwd, &request)
                .await
            {
                Ok(turn) => turn,
                Err(outcome) => return finalize(*outcome, routing_headers),
            };

            let mut blocks = turn.result_blocks;
            if let Some(warning) = turn.warning {
                session.append("user", TurnKind::SystemWarning, "warned", &warning, Value::Null);
                blocks.push(ContentBlock::Text { text: warning });
            }

            request.messages.push(Message {
                role: Role::User,
                content: MessageContent::Blocks(blocks),
            });
        }
    }

    /// Execute every tool call of one assistant turn.
    ///
    /// Multiple `task` calls in the same turn run concurrently; everything
    /// else runs in declaration order. Results are reassembled in call order.
    async fn run_tool_turn(
        &self,
        calls: &[ToolCall],
        tracker: &mut SignatureTracker,
        tool_calls_executed: &mut u32,
        session: &mut SessionRecorder,
        cwd: &Path,
        request: &ChatRequest,
    ) -> Result<ToolTurn, Box<Outcome>> {
        enum Plan<'c> {
            Denied(&'c ToolCall, String),
            Run(&'c ToolCall),
        }

        let mut warning = None;
        let mut plan = Vec::with_capacity(calls.len());

        for call in calls {
            let decision = self.policy.evaluate(call, session.id());

            if !decision.allowed {
                let reason = decision.reason.unwrap_or_else(|| "denied by policy".to_string());
                log::info!("policy denied tool '{}': {reason}", call.name);
                plan.push(Plan::Denied(call, reason));
                continue;
            }

            match tracker.observe(call) {
                GuardAction::Proceed => plan.push(Plan::Run(call)),
                GuardAction::Warn => {
                    warning = Some(tracker.warning_text(call));
                    plan.push(Plan::Run(call));
                }
                GuardAction::Terminate => {
                    // Keep the full conversation for postmortems; this is the
                    // one guard that hides a model gone in circles.
                    log::error!(
                        "tool call loop terminated on '{}'; conversation: {}",
                        call.name,
                        serde_json::to_string(&request.messages).unwrap_or_default()
                    );

                    session.append(
                        "assistant",
                        TurnKind::Error,
                        "tool_call_loop",
                        format!("identical call to '{}' repeated past the limit", call.name),
                        Value::Null,
                    );

                    return Err(Box::new(Outcome::error(
                        &LlmError::ToolLoopDetected { tool: call.name.clone() },
                        Vec::new(),
                        TerminationReason::ToolCallLoop,
                    )));
                }
            }
        }

        let context = ToolContext {
            session_id: session.id().to_string(),
            cwd: cwd.to_path_buf(),
            request_messages: request.messages.clone(),
        };

        // Concurrent fan-out for subagent calls, when there is more than one.
        let task_calls: Vec<&ToolCall> = plan
            .iter()
            .filter_map(|entry| match entry {
                Plan::Run(call) if call.name.eq_ignore_ascii_case("task") => Some(*call),
                _ => None,
            })
            .collect();
        let concurrent_tasks = task_calls.len() > 1;

        let mut task_outcomes: std::collections::HashMap<String, ToolOutcome> = if concurrent_tasks {
            let futures = task_calls.iter().map(|call| self.tools.execute(call, &context));
            futures::future::join_all(futures)
                .await
                .into_iter()
                .map(|outcome| (outcome.id.clone(), outcome))
                .collect()
        } else {
            std::collections::HashMap::new()
        };

        let mut result_blocks = Vec::with_capacity(calls.len());

        for entry in plan {
            let outcome = match entry {
                Plan::Denied(call, reason) => ToolOutcome {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    ok: false,
                    status: "denied".to_string(),
                    content: reason,
                    metadata: Value::Null,
                },
                Plan::Run(call) => {
                    let outcome = if concurrent_tasks && call.name.eq_ignore_ascii_case("task") {
                        task_outcomes
                            .remove(&call.id)
                            .unwrap_or_else(|| ToolOutcome::error(call, "subagent produced no outcome"))
                    } else {
                        self.tools.execute(call, &context).await
                    };

                    *tool_calls_executed += 1;

                    if *tool_calls_executed > self.agent_config.limits.max_tool_calls {
                        session.append(
                            "assistant",
                            TurnKind::Error,
                            "max_tool_calls",
                            "tool call budget exhausted",
                            Value::Null,
                        );

                        return Err(Box::new(Outcome::error(
                            &LlmError::MaxToolCallsExceeded(self.agent_config.limits.max_tool_calls),
                            Vec::new(),
                            TerminationReason::MaxToolCallsExceeded,
                        )));
                    }

                    outcome
                }
            };

            session.append(
                "tool",
                TurnKind::ToolResult,
                &outcome.status,
                outcome.content.clone(),
                json!({"tool": outcome.name, "ok": outcome.ok}),
            );

            result_blocks.push(ContentBlock::ToolResult {
                tool_use_id: outcome.id,
                content: ToolResultContent::Text(outcome.content),
                is_error: (!outcome.ok).then_some(true),
            });
        }

        Ok(ToolTurn { result_blocks, warning })
    }

    /// First-iteration request mutations: memory recall into the system
    /// prompt, delegation guidance when a subagent tool is declared, and
    /// termination guidance for tool use.
    async fn first_iteration_hooks(&self, request: &mut ChatRequest) {
        if let Some(memory) = &self.memory
            && let Some(last_user) = request.last_user_text()
        {
            let memories = memory.recall(&last_user).await;

            if let Some(section) = memory::format_memories(&memories) {
                let system = match &request.system {
                    Some(existing) => format!("{section}\n{}", existing.flatten()),
                    None => section,
                };
                request.system = Some(SystemPrompt::Text(system));
            }
        }

        let has_task_tool = request
            .tools
            .as_ref()
            .is_some_and(|tools| tools.iter().any(|tool| tool.name.eq_ignore_ascii_case("task")));

        if has_task_tool {
            append_system_line(
                request,
                "Delegate self-contained subtasks to the 'task' tool; several independent tasks may be requested in one turn.",
            );
        }

        if request.tool_count() > 0 {
            append_system_line(
                request,
                "When you have enough information to answer, reply with text instead of calling more tools.",
            );
        }
    }

    fn audit_request(&self, request: &ChatRequest, context: &RequestContext) {
        let Some(audit) = &self.audit else {
            return;
        };

        let system = request.system.as_ref().map(SystemPrompt::flatten).unwrap_or_default();
        let transcript = request
            .messages
            .iter()
            .map(|message| format!("{:?}: {}", message.role, message.content.flatten_text()))
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut record = AuditRecord::new("llm_request", &context.correlation_id)
            .field("user_messages", lynkr_audit::strip_empty_user_turns(&transcript))
            .field("tool_count", request.tool_count() as u64);
        record.model = Some(request.model.clone());

        if !system.is_empty() {
            record = record.field("system_prompt", system);
        }

        audit.record(record);
    }

    fn audit_response(&self, response: &ChatResponse, provider: &str, context: &RequestContext) {
        let Some(audit) = &self.audit else {
            return;
        };

        let mut record = AuditRecord::new("llm_response", &context.correlation_id)
            .field("response", serde_json::to_string(response).unwrap_or_default())
            .field("stop_reason", json!(response.stop_reason))
            .field("input_tokens", response.usage.input_tokens)
            .field("output_tokens", response.usage.output_tokens);
        record.provider = Some(provider.to_string());
        record.model = Some(response.model.clone());

        audit.record(record);
    }
}

struct ToolTurn {
    result_blocks: Vec<ContentBlock>,
    warning: Option<String>,
}

fn append_system_line(request: &mut ChatRequest, line: &str) {
    let system = match &request.system {
        Some(existing) => format!("{}\n{line}", existing.flatten()),
        None => line.to_string(),
    };
    request.system = Some(SystemPrompt::Text(system));
}

fn routing_metadata(dispatched: &Dispatched) -> Vec<(String, String)> {
    let decision = &dispatched.decision;
    let mut headers = vec![
        ("X-Lynkr-Routing-Method".to_string(), decision.method.to_string()),
        ("X-Lynkr-Provider".to_string(), dispatched.actual_provider.clone()),
        ("X-Lynkr-Routing-Reason".to_string(), decision.reason.clone()),
    ];

    if let Some(score) = decision.score {
        headers.push(("X-Lynkr-Complexity-Score".to_string(), format!("{score:.3}")));
    }
    if let Some(threshold) = decision.threshold {
        headers.push(("X-Lynkr-Complexity-Threshold".to_string(), format!("{threshold:.3}")));
    }

    headers
}

fn finalize(mut outcome: Outcome, routing_headers: Vec<(String, String)>) -> Outcome {
    let mut headers = routing_headers;
    headers.append(&mut outcome.headers);
    outcome.headers = headers;
    outcome
}
