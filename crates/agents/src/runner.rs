use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    anyhow::Result,
    futures::StreamExt,
    tracing::{debug, info, trace, warn},
};

use crate::{
    model::{LlmProvider, StreamEvent, ToolCall, Usage},
    tool_registry::ToolRegistry,
};

/// Maximum number of `PROVIDER_STREAM` → tool-execution round trips before
/// giving up on a run.
const MAX_ITERATIONS: usize = 25;

/// Per-tool execution timeout. A tool call that runs longer than this is
/// treated as a failed call with `isError=true`.
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Error produced when an agent run cannot complete.
#[derive(Debug, thiserror::Error)]
pub enum AgentRunError {
    #[error("provider stream error: {0}")]
    Provider(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of running the agent loop to completion (`FINALIZE`).
#[derive(Debug)]
pub struct AgentRunResult {
    pub text: String,
    pub iterations: usize,
    pub tool_calls_made: usize,
    pub usage: Usage,
    /// True when `MAX_ITERATIONS` was exceeded; `text` holds partial content
    /// and the caller should emit `run.failed` with `FAILED_PRECONDITION`.
    pub iteration_cap_exceeded: bool,
}

/// Callback for streaming events out of the runner.
pub type OnEvent = Box<dyn Fn(RunnerEvent) + Send + Sync>;

/// Events emitted during the agent run, mapped by the caller onto the
/// gateway's `chat.chunk`/`tool.call`/`tool.result` wire events.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Iteration(usize),
    TextDelta(String),
    ToolCallStart {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolCallEnd {
        id: String,
        name: String,
        success: bool,
        error: Option<String>,
        result: Option<serde_json::Value>,
    },
}

/// A tool call accumulated incrementally from streamed provider events.
struct PendingToolCall {
    id: String,
    name: String,
    arguments_json: String,
}

/// Run one `PROVIDER_STREAM` turn to completion, accumulating text and tool
/// calls from the event stream. Returns the accumulated text, the ordered
/// tool calls (in the order their `ToolCallStart` arrived), and usage.
async fn stream_one_turn(
    provider: &Arc<dyn LlmProvider>,
    messages: Vec<serde_json::Value>,
    tool_schemas: &[serde_json::Value],
    native_tools: bool,
    on_event: Option<&OnEvent>,
) -> Result<(String, Vec<ToolCall>, Usage)> {
    let mut stream = if native_tools {
        provider.stream_with_tools(messages, tool_schemas.to_vec())
    } else {
        provider.stream(messages)
    };

    let mut text = String::new();
    let mut pending: HashMap<usize, PendingToolCall> = HashMap::new();
    let mut order: Vec<usize> = Vec::new();
    let mut usage = Usage {
        input_tokens: 0,
        output_tokens: 0,
    };

    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Delta(delta) => {
                text.push_str(&delta);
                if let Some(cb) = on_event {
                    cb(RunnerEvent::TextDelta(delta));
                }
            },
            StreamEvent::ToolCallStart { id, name, index } => {
                order.push(index);
                let _ = pending.insert(
                    index,
                    PendingToolCall {
                        id,
                        name,
                        arguments_json: String::new(),
                    },
                );
            },
            StreamEvent::ToolCallArgumentsDelta { index, delta } => {
                if let Some(call) = pending.get_mut(&index) {
                    call.arguments_json.push_str(&delta);
                }
            },
            StreamEvent::ToolCallComplete { index } => {
                trace!(index, "tool call arguments complete");
            },
            StreamEvent::Done(final_usage) => {
                usage = final_usage;
            },
            StreamEvent::Error(message) => {
                return Err(AgentRunError::Provider(message).into());
            },
        }
    }

    let tool_calls = order
        .into_iter()
        .filter_map(|index| pending.remove(&index))
        .map(|call| {
            let arguments = if call.arguments_json.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&call.arguments_json).unwrap_or(serde_json::json!({}))
            };
            ToolCall {
                id: call.id,
                name: call.name,
                arguments,
            }
        })
        .collect();

    Ok((text, tool_calls, usage))
}

/// Try to parse a tool call from the LLM's text response.
///
/// Providers without native tool-calling support are instructed (via the system
/// prompt) to emit a fenced block like:
///
/// ```tool_call
/// {"tool": "exec", "arguments": {"command": "ls"}}
/// ```
///
/// This function extracts that JSON and returns a synthetic `ToolCall` plus the
/// remaining text (if any) outside the fence.
fn parse_tool_call_from_text(text: &str) -> Option<(ToolCall, Option<String>)> {
    let start_marker = "```tool_call";
    let start = text.find(start_marker)?;
    let after_marker = start + start_marker.len();
    let rest = &text[after_marker..];
    let end = rest.find("```")?;
    let json_str = rest[..end].trim();

    let parsed: serde_json::Value = serde_json::from_str(json_str).ok()?;
    let tool_name = parsed["tool"].as_str()?.to_string();
    let arguments = parsed
        .get("arguments")
        .cloned()
        .unwrap_or(serde_json::json!({}));

    let id = format!("text-{:08x}", rand::random::<u32>());

    let before = text[..start].trim();
    let after_end = after_marker + end + 3;
    let after = if after_end < text.len() {
        text[after_end..].trim()
    } else {
        ""
    };
    let remaining = match (before.is_empty(), after.is_empty()) {
        (true, true) => None,
        (false, true) => Some(before.to_string()),
        (true, false) => Some(after.to_string()),
        (false, false) => Some(format!("{before}\n{after}")),
    };

    Some((
        ToolCall {
            id,
            name: tool_name,
            arguments,
        },
        remaining,
    ))
}

/// Execute a single tool call with a bounded timeout, returning the JSON
/// message content to append as the `tool` role message.
async fn execute_tool_call(
    tools: &ToolRegistry,
    tc: &ToolCall,
    tool_context: Option<&serde_json::Value>,
    on_event: Option<&OnEvent>,
) -> serde_json::Value {
    if let Some(cb) = on_event {
        cb(RunnerEvent::ToolCallStart {
            id: tc.id.clone(),
            name: tc.name.clone(),
            arguments: tc.arguments.clone(),
        });
    }

    let Some(tool) = tools.get(&tc.name) else {
        let err_str = format!("unknown tool: {}", tc.name);
        warn!(tool = %tc.name, id = %tc.id, "unknown tool requested by LLM");
        if let Some(cb) = on_event {
            cb(RunnerEvent::ToolCallEnd {
                id: tc.id.clone(),
                name: tc.name.clone(),
                success: false,
                error: Some(err_str.clone()),
                result: None,
            });
        }
        return serde_json::json!({ "isError": true, "error": err_str });
    };

    let mut args = tc.arguments.clone();
    if let (Some(ctx), Some(args_obj)) = (tool_context, args.as_object_mut())
        && let Some(ctx_obj) = ctx.as_object()
    {
        for (k, v) in ctx_obj {
            args_obj.insert(k.clone(), v.clone());
        }
    }

    let outcome = tokio::time::timeout(TOOL_TIMEOUT, tool.execute(args)).await;
    match outcome {
        Ok(Ok(val)) => {
            debug!(tool = %tc.name, id = %tc.id, "tool execution succeeded");
            if let Some(cb) = on_event {
                cb(RunnerEvent::ToolCallEnd {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    success: true,
                    error: None,
                    result: Some(val.clone()),
                });
            }
            serde_json::json!({ "result": val })
        },
        Ok(Err(e)) => {
            let err_str = e.to_string();
            warn!(tool = %tc.name, id = %tc.id, error = %err_str, "tool execution failed");
            if let Some(cb) = on_event {
                cb(RunnerEvent::ToolCallEnd {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    success: false,
                    error: Some(err_str.clone()),
                    result: None,
                });
            }
            serde_json::json!({ "isError": true, "error": err_str })
        },
        Err(_) => {
            warn!(tool = %tc.name, id = %tc.id, "tool execution timed out");
            if let Some(cb) = on_event {
                cb(RunnerEvent::ToolCallEnd {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    success: false,
                    error: Some("timed out".into()),
                    result: None,
                });
            }
            serde_json::json!({ "isError": true, "error": "timed out" })
        },
    }
}

/// Run the streaming agent loop: `PROVIDER_STREAM` → parse tool calls →
/// execute sequentially → append results → repeat, until the provider
/// returns no tool calls or the iteration cap is hit.
///
/// If `history` is provided, those messages are inserted between the system
/// prompt and the current user message, giving the LLM conversational context.
pub async fn run_agent_loop(
    provider: Arc<dyn LlmProvider>,
    tools: &ToolRegistry,
    system_prompt: &str,
    user_message: &str,
    on_event: Option<&OnEvent>,
    history: Option<Vec<serde_json::Value>>,
) -> Result<AgentRunResult> {
    run_agent_loop_with_context(
        provider,
        tools,
        system_prompt,
        user_message,
        on_event,
        history,
        None,
    )
    .await
}

/// Like `run_agent_loop` but accepts optional context values that are injected
/// into every tool call's parameters (e.g. `_session_key`).
pub async fn run_agent_loop_with_context(
    provider: Arc<dyn LlmProvider>,
    tools: &ToolRegistry,
    system_prompt: &str,
    user_message: &str,
    on_event: Option<&OnEvent>,
    history: Option<Vec<serde_json::Value>>,
    tool_context: Option<serde_json::Value>,
) -> Result<AgentRunResult> {
    let native_tools = provider.supports_tools();
    let tool_schemas = tools.list_schemas();

    info!(
        provider = provider.name(),
        model = provider.id(),
        native_tools,
        tools_count = tool_schemas.len(),
        "starting agent loop"
    );

    let mut messages: Vec<serde_json::Value> = vec![serde_json::json!({
        "role": "system",
        "content": system_prompt,
    })];
    if let Some(hist) = history {
        messages.extend(hist);
    }
    messages.push(serde_json::json!({
        "role": "user",
        "content": user_message,
    }));

    let mut iterations = 0;
    let mut total_tool_calls = 0;
    let mut total_input_tokens: u32 = 0;
    let mut total_output_tokens: u32 = 0;

    loop {
        iterations += 1;
        if iterations > MAX_ITERATIONS {
            warn!("agent loop exceeded max iterations ({})", MAX_ITERATIONS);
            let partial = messages
                .iter()
                .rev()
                .find(|m| m["role"].as_str() == Some("assistant"))
                .and_then(|m| m["content"].as_str())
                .unwrap_or_default()
                .to_string();
            return Ok(AgentRunResult {
                text: partial,
                iterations: iterations - 1,
                tool_calls_made: total_tool_calls,
                usage: Usage {
                    input_tokens: total_input_tokens,
                    output_tokens: total_output_tokens,
                },
                iteration_cap_exceeded: true,
            });
        }

        if let Some(cb) = on_event {
            cb(RunnerEvent::Iteration(iterations));
        }
        info!(
            iteration = iterations,
            messages_count = messages.len(),
            "calling LLM"
        );

        let (mut text, mut tool_calls, usage) =
            stream_one_turn(&provider, messages.clone(), &tool_schemas, native_tools, on_event)
                .await?;

        total_input_tokens = total_input_tokens.saturating_add(usage.input_tokens);
        total_output_tokens = total_output_tokens.saturating_add(usage.output_tokens);

        // Non-native providers emit tool calls as fenced text blocks.
        if !native_tools && tool_calls.is_empty() {
            if let Some((tc, remaining_text)) = parse_tool_call_from_text(&text) {
                info!(tool = %tc.name, "parsed tool call from text (non-native provider)");
                text = remaining_text.unwrap_or_default();
                tool_calls = vec![tc];
            }
        }

        if tool_calls.is_empty() {
            info!(
                iterations,
                tool_calls = total_tool_calls,
                "agent loop complete — returning text"
            );
            return Ok(AgentRunResult {
                text,
                iterations,
                tool_calls_made: total_tool_calls,
                usage: Usage {
                    input_tokens: total_input_tokens,
                    output_tokens: total_output_tokens,
                },
                iteration_cap_exceeded: false,
            });
        }

        let tool_calls_json: Vec<serde_json::Value> = tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": tc.arguments.to_string(),
                    }
                })
            })
            .collect();

        let mut assistant_msg = serde_json::json!({
            "role": "assistant",
            "tool_calls": tool_calls_json,
        });
        if !text.is_empty() {
            assistant_msg["content"] = serde_json::Value::String(text.clone());
        }
        messages.push(assistant_msg);

        // Tool calls within a single response execute sequentially, in
        // declared order, to keep session-history append order well-defined.
        for tc in &tool_calls {
            total_tool_calls += 1;
            let result = execute_tool_call(tools, tc, tool_context.as_ref(), on_event).await;
            messages.push(serde_json::json!({
                "role": "tool",
                "tool_call_id": tc.id,
                "content": result.to_string(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::model::{CompletionResponse, LlmProvider, StreamEvent, ToolCall, Usage},
        async_trait::async_trait,
        std::pin::Pin,
        tokio_stream::Stream,
    };

    #[test]
    fn test_parse_tool_call_basic() {
        let text = "```tool_call\n{\"tool\": \"exec\", \"arguments\": {\"command\": \"ls\"}}\n```";
        let (tc, remaining) = parse_tool_call_from_text(text).unwrap();
        assert_eq!(tc.name, "exec");
        assert_eq!(tc.arguments["command"], "ls");
        assert!(remaining.is_none());
    }

    #[test]
    fn test_parse_tool_call_with_surrounding_text() {
        let text = "I'll run ls for you.\n```tool_call\n{\"tool\": \"exec\", \"arguments\": {\"command\": \"ls\"}}\n```\nHere you go.";
        let (tc, remaining) = parse_tool_call_from_text(text).unwrap();
        assert_eq!(tc.name, "exec");
        let remaining = remaining.unwrap();
        assert!(remaining.contains("I'll run ls"));
        assert!(remaining.contains("Here you go"));
    }

    #[test]
    fn test_parse_tool_call_no_block() {
        let text = "I would run ls but I can't.";
        assert!(parse_tool_call_from_text(text).is_none());
    }

    #[test]
    fn test_parse_tool_call_invalid_json() {
        let text = "```tool_call\nnot json\n```";
        assert!(parse_tool_call_from_text(text).is_none());
    }

    /// A streaming mock provider driven by a fixed script of events per call.
    struct ScriptedProvider {
        turns: std::sync::Mutex<Vec<Vec<StreamEvent>>>,
        native_tools: bool,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "mock"
        }

        fn id(&self) -> &str {
            "mock-model"
        }

        fn supports_tools(&self) -> bool {
            self.native_tools
        }

        async fn complete(
            &self,
            _messages: &[serde_json::Value],
            _tools: &[serde_json::Value],
        ) -> Result<CompletionResponse> {
            unreachable!("streaming path only")
        }

        fn stream(
            &self,
            _messages: Vec<serde_json::Value>,
        ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
            let events = self.turns.lock().unwrap().remove(0);
            Box::pin(tokio_stream::iter(events))
        }
    }

    fn done(input: u32, output: u32) -> StreamEvent {
        StreamEvent::Done(Usage {
            input_tokens: input,
            output_tokens: output,
        })
    }

    #[tokio::test]
    async fn test_simple_text_response() {
        let provider = Arc::new(ScriptedProvider {
            turns: std::sync::Mutex::new(vec![vec![
                StreamEvent::Delta("Hello!".into()),
                done(10, 5),
            ]]),
            native_tools: false,
        });
        let tools = ToolRegistry::new();
        let result = run_agent_loop(provider, &tools, "You are a test bot.", "Hi", None, None)
            .await
            .unwrap();
        assert_eq!(result.text, "Hello!");
        assert_eq!(result.iterations, 1);
        assert_eq!(result.tool_calls_made, 0);
        assert!(!result.iteration_cap_exceeded);
    }

    struct EchoTool;

    #[async_trait]
    impl crate::tool_registry::AgentTool for EchoTool {
        fn name(&self) -> &str {
            "echo_tool"
        }

        fn description(&self) -> &str {
            "Echoes input"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        async fn execute(&self, params: serde_json::Value) -> Result<serde_json::Value> {
            Ok(params)
        }
    }

    #[tokio::test]
    async fn test_tool_call_loop() {
        let provider = Arc::new(ScriptedProvider {
            turns: std::sync::Mutex::new(vec![
                vec![
                    StreamEvent::ToolCallStart {
                        id: "call_1".into(),
                        name: "echo_tool".into(),
                        index: 0,
                    },
                    StreamEvent::ToolCallArgumentsDelta {
                        index: 0,
                        delta: "{\"text\": \"hi\"}".into(),
                    },
                    StreamEvent::ToolCallComplete { index: 0 },
                    done(10, 5),
                ],
                vec![StreamEvent::Delta("Done!".into()), done(20, 10)],
            ]),
            native_tools: true,
        });
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(EchoTool));

        let result = run_agent_loop(
            provider,
            &tools,
            "You are a test bot.",
            "Use the tool",
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.text, "Done!");
        assert_eq!(result.iterations, 2);
        assert_eq!(result.tool_calls_made, 1);
    }

    struct SlowTool;

    #[async_trait]
    impl crate::tool_registry::AgentTool for SlowTool {
        fn name(&self) -> &str {
            "slow_tool"
        }

        fn description(&self) -> &str {
            "Never returns"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, _params: serde_json::Value) -> Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::json!({}))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_timeout_produces_error_result() {
        let tools = ToolRegistry::new();
        let mut reg = tools;
        reg.register(Box::new(SlowTool));

        let tc = ToolCall {
            id: "call_slow".into(),
            name: "slow_tool".into(),
            arguments: serde_json::json!({}),
        };

        let result_fut = execute_tool_call(&reg, &tc, None, None);
        tokio::pin!(result_fut);

        tokio::time::advance(TOOL_TIMEOUT + Duration::from_secs(1)).await;
        let result = result_fut.await;
        assert_eq!(result["isError"], true);
        assert_eq!(result["error"], "timed out");
    }

    #[tokio::test]
    async fn test_iteration_cap_exceeded_returns_partial_without_panicking() {
        // Provider always emits a new tool call, never terminating the loop.
        let infinite_turns: Vec<Vec<StreamEvent>> = (0..MAX_ITERATIONS + 2)
            .map(|i| {
                vec![
                    StreamEvent::ToolCallStart {
                        id: format!("call_{i}"),
                        name: "echo_tool".into(),
                        index: 0,
                    },
                    StreamEvent::ToolCallArgumentsDelta {
                        index: 0,
                        delta: "{}".into(),
                    },
                    StreamEvent::ToolCallComplete { index: 0 },
                    done(1, 1),
                ]
            })
            .collect();
        let provider = Arc::new(ScriptedProvider {
            turns: std::sync::Mutex::new(infinite_turns),
            native_tools: true,
        });
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(EchoTool));

        let result = run_agent_loop(provider, &tools, "sys", "go", None, None)
            .await
            .unwrap();
        assert!(result.iteration_cap_exceeded);
        assert_eq!(result.iterations, MAX_ITERATIONS);
    }
}
