//! Agent execution engine (§4.6–§4.7): the agent loop state machine run as
//! a cancellable task, the run registry used for `chat.abort`, and the
//! `ChatService` RPC adapter backing `chat.send/abort/history/inject`.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use {
    async_trait::async_trait,
    serde_json::{Value, json},
    tokio::{
        sync::{RwLock, oneshot},
        task::JoinHandle,
    },
    tracing::warn,
};

use {
    moltis_agents::{
        prompt::build_system_prompt,
        providers::ProviderRegistry,
        runner::{OnEvent, RunnerEvent, run_agent_loop_with_context},
        tool_registry::ToolRegistry,
    },
    moltis_config::schema::GatewayConfig,
    moltis_protocol::error_codes,
    moltis_sessions::{SessionKey, message::PersistedMessage, store::SessionStore},
    moltis_service_traits::{ChatService, ServiceResult},
};

use crate::{
    broadcast::{self, BroadcastOpts},
    state::GatewayState,
};

fn new_run_id() -> String {
    format!("run-{:016x}", rand::random::<u64>())
}

fn field<'a>(params: &'a Value, name: &str) -> ServiceResult<&'a str> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing '{name}'").into())
}

/// Default agent and session key used for `chat.send` calls that name
/// neither `agentId` nor `sessionKey` explicitly (the browser UI's main
/// chat).
fn default_session_key(agent_id: &str) -> String {
    SessionKey::new(agent_id, "ui", "direct", "default").into_string()
}

/// Map a run failure onto a short, provider-payload-free message for
/// `agent.run.failed`, per the error-classification table: context-overflow
/// and format errors get an actionable hint, rate/overload is retryable,
/// everything else collapses to a generic internal message.
fn classify_run_error(err: &anyhow::Error) -> (String, String, bool) {
    let text = err.to_string().to_lowercase();
    if text.contains("context") && (text.contains("overflow") || text.contains("too long") || text.contains("maximum context")) {
        (error_codes::FAILED_PRECONDITION.into(), "context overflow — try /new to start a fresh session".into(), false)
    } else if text.contains("429") || text.contains("overloaded") || text.contains("rate limit") {
        (error_codes::UNAVAILABLE.into(), "the model provider is busy, please try again shortly".into(), true)
    } else if text.contains("401") || text.contains("403") || text.contains("billing") || text.contains("insufficient_quota") {
        (error_codes::UNAVAILABLE.into(), "the model provider rejected the request (check provider credentials)".into(), false)
    } else if text.contains("conflict") || text.contains("invalid request") && text.contains("message") {
        (error_codes::FAILED_PRECONDITION.into(), "session history conflict — try /new to start a fresh session".into(), false)
    } else {
        warn!(error = %err, "agent run failed");
        (error_codes::INTERNAL.into(), "the agent run failed unexpectedly".into(), false)
    }
}

struct RunHandle {
    session_key: String,
    task: JoinHandle<()>,
}

/// `agentId → loop` is implicit (every run resolves its own provider from
/// config); what this owns is the `runId → cancel handle` registry from
/// §4.7, keyed so `chat.abort` can cancel by run id or by session.
///
/// Holds the gateway state as a [`Weak`] rather than an [`Arc`]: the state's
/// `Services` bundle owns this router (via `LiveChatService`), so a strong
/// back-reference would be a cycle neither side ever drops.
pub struct AgentRouter {
    state: Weak<GatewayState>,
    config: Arc<GatewayConfig>,
    sessions: Arc<SessionStore>,
    providers: Arc<ProviderRegistry>,
    tools: Arc<ToolRegistry>,
    runs: RwLock<HashMap<String, RunHandle>>,
}

impl AgentRouter {
    pub fn new(
        state: Weak<GatewayState>,
        config: Arc<GatewayConfig>,
        sessions: Arc<SessionStore>,
        providers: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            config,
            sessions,
            providers,
            tools,
            runs: RwLock::new(HashMap::new()),
        })
    }

    fn resolve_agent_spec(&self, agent_id: &str) -> moltis_config::schema::AgentSpec {
        self.config.agents.get(agent_id).cloned().unwrap_or_default()
    }

    /// `INIT → LOAD_SESSION → PROVIDER_STREAM → … → FINALIZE → SAVE_SESSION`.
    /// Spawns the run as a cancellable task and registers it before
    /// returning, so a `chat.abort` racing the caller can never miss it, then
    /// awaits the run's own completion signal and returns the finished
    /// `{text, usage, toolCallsMade}` payload — `chat.send`'s response is the
    /// final content, not an immediate `{runId}` acknowledgement.
    ///
    /// If a `chat.abort` wins the race, the task is killed before it sends
    /// its completion signal; the sender is dropped and this returns an
    /// error instead of hanging.
    pub async fn start_run(self: &Arc<Self>, agent_id: String, session_key: String, message: String) -> ServiceResult {
        let agent_spec = self.resolve_agent_spec(&agent_id);
        let provider = self.providers.get(&agent_spec.model).ok_or_else(|| {
            format!("no provider available for agent '{agent_id}' (model: {})", agent_spec.model)
        })?;

        let history = self.sessions.read(&session_key).await.map_err(|e| e.to_string())?;
        let system_prompt = build_system_prompt(
            &self.tools,
            provider.supports_tools(),
            Some(&self.config.identity),
            Some(&self.config.user),
            None,
            None,
        );

        let run_id = new_run_id();
        let Some(state) = self.state.upgrade() else {
            return Err("gateway shutting down".into());
        };
        let sessions = Arc::clone(&self.sessions);
        let tools = Arc::clone(&self.tools);
        let router = Arc::clone(self);
        let sk = session_key.clone();
        let rid = run_id.clone();
        let user_message = message.clone();
        let model = agent_spec.model.clone();
        let provider_id = agent_spec.provider_id.clone();
        let (done_tx, done_rx) = oneshot::channel::<ServiceResult>();

        let task = tokio::spawn(async move {
            broadcast::broadcast(
                &state,
                "agent.run.started",
                json!({ "runId": rid, "sessionKey": sk }),
                BroadcastOpts::default(),
            )
            .await;

            let on_event: OnEvent = {
                let state = Arc::clone(&state);
                let rid = rid.clone();
                Box::new(move |event| {
                    let state = Arc::clone(&state);
                    let rid = rid.clone();
                    let (event_name, payload) = match event {
                        RunnerEvent::Iteration(_) => return,
                        RunnerEvent::TextDelta(delta) => ("chat.chunk", json!({ "runId": rid, "delta": delta })),
                        RunnerEvent::ToolCallStart { id, name, arguments } => {
                            ("tool.call", json!({ "runId": rid, "id": id, "name": name, "arguments": arguments }))
                        },
                        RunnerEvent::ToolCallEnd { id, name, success, error, result } => (
                            "tool.result",
                            json!({ "runId": rid, "id": id, "name": name, "success": success, "error": error, "result": result }),
                        ),
                    };
                    tokio::spawn(async move {
                        broadcast::broadcast(&state, event_name, payload, BroadcastOpts::default()).await;
                    });
                })
            };

            let run_result = run_agent_loop_with_context(
                provider,
                &tools,
                &system_prompt,
                &user_message,
                Some(&on_event),
                Some(history),
                None,
            )
            .await;

            let outcome: ServiceResult = match run_result {
                Ok(run) if run.iteration_cap_exceeded => {
                    broadcast::broadcast(
                        &state,
                        "agent.run.failed",
                        json!({
                            "runId": rid,
                            "sessionKey": sk,
                            "error": { "code": error_codes::FAILED_PRECONDITION, "message": "iteration cap exceeded" },
                            "partialText": run.text,
                        }),
                        BroadcastOpts::default(),
                    )
                    .await;
                    Err("iteration cap exceeded".into())
                },
                Ok(run) => {
                    if let Err(e) = sessions
                        .append(&sk, &PersistedMessage::user(user_message.clone()).to_value())
                        .await
                    {
                        warn!(error = %e, session_key = %sk, "failed to persist user message");
                    }
                    if let Err(e) = sessions
                        .append(
                            &sk,
                            &PersistedMessage::assistant(
                                run.text.clone(),
                                model.clone(),
                                provider_id.clone(),
                                run.usage.input_tokens,
                                run.usage.output_tokens,
                                None,
                            )
                            .to_value(),
                        )
                        .await
                    {
                        warn!(error = %e, session_key = %sk, "failed to persist assistant message");
                    }
                    broadcast::broadcast(
                        &state,
                        "agent.run.completed",
                        json!({ "runId": rid, "sessionKey": sk, "text": run.text, "toolCallsMade": run.tool_calls_made }),
                        BroadcastOpts::default(),
                    )
                    .await;
                    Ok(json!({
                        "runId": rid,
                        "text": run.text,
                        "usage": { "inputTokens": run.usage.input_tokens, "outputTokens": run.usage.output_tokens },
                        "toolCallsMade": run.tool_calls_made,
                    }))
                },
                Err(err) => {
                    let (code, message, retryable) = classify_run_error(&err);
                    broadcast::broadcast(
                        &state,
                        "agent.run.failed",
                        json!({
                            "runId": rid,
                            "sessionKey": sk,
                            "error": { "code": code, "message": message, "retryable": retryable },
                        }),
                        BroadcastOpts::default(),
                    )
                    .await;
                    Err(message.into())
                },
            };

            let _ = done_tx.send(outcome);
            router.runs.write().await.remove(&rid);
        });

        self.runs.write().await.insert(run_id.clone(), RunHandle {
            session_key,
            task,
        });

        // Awaits the run's own completion signal rather than returning as
        // soon as the task is spawned — `chat.send`'s response is the
        // finished run, not an acknowledgement. If `chat.abort` wins the
        // race the task is killed before `done_tx.send` runs, the sender
        // drops, and this resolves to an error instead of hanging forever.
        done_rx.await.unwrap_or_else(|_| Err("run was aborted".into()))
    }

    /// Cancel by run id. `false` if the run is already gone — aborting
    /// twice is a no-op, not an error.
    pub async fn abort_run(&self, run_id: &str) -> bool {
        match self.runs.write().await.remove(run_id) {
            Some(run) => {
                run.task.abort();
                true
            },
            None => false,
        }
    }

    /// Cancel every run bound to `session_key`. Returns the run ids that
    /// were actually cancelled.
    pub async fn abort_runs_for_session(&self, session_key: &str) -> Vec<String> {
        let mut runs = self.runs.write().await;
        let ids: Vec<String> = runs
            .iter()
            .filter(|(_, r)| r.session_key == session_key)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(run) = runs.remove(id) {
                run.task.abort();
            }
        }
        ids
    }
}

/// Adapts [`AgentRouter`] and [`SessionStore`] to the [`ChatService`] RPC
/// surface.
pub struct LiveChatService {
    router: Arc<AgentRouter>,
    sessions: Arc<SessionStore>,
}

impl LiveChatService {
    pub fn new(router: Arc<AgentRouter>, sessions: Arc<SessionStore>) -> Self {
        Self { router, sessions }
    }
}

#[async_trait]
impl ChatService for LiveChatService {
    async fn send(&self, params: Value) -> ServiceResult {
        let message = field(&params, "message")?;
        let agent_id = params.get("agentId").and_then(|v| v.as_str()).unwrap_or("main");
        let session_key = params
            .get("sessionKey")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| default_session_key(agent_id));

        self.router.start_run(agent_id.to_string(), session_key, message.to_string()).await
    }

    async fn abort(&self, params: Value) -> ServiceResult {
        if let Some(run_id) = params.get("runId").and_then(|v| v.as_str()) {
            let aborted = self.router.abort_run(run_id).await;
            return Ok(json!({ "aborted": aborted, "runIds": if aborted { vec![run_id] } else { vec![] } }));
        }
        let session_key = field(&params, "sessionKey")?;
        let ids = self.router.abort_runs_for_session(session_key).await;
        Ok(json!({ "aborted": !ids.is_empty(), "runIds": ids }))
    }

    async fn history(&self, params: Value) -> ServiceResult {
        let session_key = field(&params, "sessionKey")?;
        let limit = params.get("limit").and_then(|v| v.as_u64()).map(|n| n as usize);
        let messages = match limit {
            Some(n) => self.sessions.read_last_n(session_key, n).await,
            None => self.sessions.read(session_key).await,
        }
        .map_err(|e| e.to_string())?;
        Ok(json!(messages))
    }

    async fn inject(&self, params: Value) -> ServiceResult {
        let session_key = field(&params, "sessionKey")?;
        let message = field(&params, "message")?;
        let label = params.get("label").and_then(|v| v.as_str());
        let text = match label {
            Some(label) => format!("[{label}] {message}"),
            None => message.to_string(),
        };
        self.sessions
            .append(session_key, &PersistedMessage::system(text).to_value())
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "injected": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_key_is_stable_per_agent() {
        assert_eq!(default_session_key("main"), "main:ui:direct:default");
    }

    #[test]
    fn classify_context_overflow() {
        let err = anyhow::anyhow!("Error: prompt is too long for context window");
        let (code, message, retryable) = classify_run_error(&err);
        assert_eq!(code, error_codes::FAILED_PRECONDITION);
        assert!(message.contains("/new"));
        assert!(!retryable);
    }

    #[test]
    fn classify_rate_limit_is_retryable() {
        let err = anyhow::anyhow!("provider stream error: 429 rate limit exceeded");
        let (code, _message, retryable) = classify_run_error(&err);
        assert_eq!(code, error_codes::UNAVAILABLE);
        assert!(retryable);
    }
}
