//! System prompt construction and workspace context-file bootstrapping.

use {
    crate::tool_registry::ToolRegistry,
    moltis_config::schema::{AgentIdentity, UserProfile},
};

/// Runtime context for the host process running the current agent turn.
#[derive(Debug, Clone, Default)]
pub struct PromptRuntimeContext {
    pub host: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub shell: Option<String>,
    /// Current date string (`YYYY-MM-DD`) for prompt context.
    pub today: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub session_key: Option<String>,
}

const TOOL_CALL_GUIDANCE: &str = concat!(
    "## How to call tools\n\n",
    "For a tool call, output ONLY this JSON block:\n\n",
    "```tool_call\n",
    "{\"tool\": \"<tool_name>\", \"arguments\": {<arguments>}}\n",
    "```\n\n",
    "No text before or after the block. After execution, continue normally.\n\n",
);
const TOOL_GUIDELINES: &str = concat!(
    "## Guidelines\n\n",
    "- Start with a normal conversational response. Do not call tools for greetings, small talk, ",
    "or questions you can answer directly.\n",
    "- Before tool calls, briefly state what you are about to do.\n",
    "- For multi-step tasks, execute one step at a time and check results before proceeding.\n",
    "- Be careful with destructive operations, confirm with the user first.\n",
);
const DEFAULT_TOOLS_PROMPT_PREFIX: &str =
    "You are a helpful assistant. You can use tools when needed.\n\n";
const DEFAULT_SOUL: &str =
    "Be genuinely helpful, direct, and honest. Keep responses focused on what was asked.";

/// Build the system prompt for an agent run: identity, user details, runtime,
/// tool listing (and calling convention for non-native-tool providers), and
/// guidelines. `context_block`, if present, is prepended as provided by
/// [`bootstrap_context_files`].
pub fn build_system_prompt(
    tools: &ToolRegistry,
    native_tools: bool,
    identity: Option<&AgentIdentity>,
    user: Option<&UserProfile>,
    runtime_context: Option<&PromptRuntimeContext>,
    context_block: Option<&str>,
) -> String {
    let tool_schemas = tools.list_schemas();
    let mut prompt = String::from(DEFAULT_TOOLS_PROMPT_PREFIX);

    if let Some(block) = context_block {
        prompt.push_str(block);
        prompt.push('\n');
    }

    append_identity_section(&mut prompt, identity);
    append_user_details_section(&mut prompt, user);
    append_runtime_section(&mut prompt, runtime_context);
    append_available_tools_section(&mut prompt, native_tools, &tool_schemas);
    append_tool_call_guidance(&mut prompt, native_tools, &tool_schemas);
    prompt.push_str(TOOL_GUIDELINES);

    prompt
}

fn append_identity_section(prompt: &mut String, identity: Option<&AgentIdentity>) {
    let Some(id) = identity else {
        return;
    };

    let mut parts = Vec::new();
    match (id.name.as_deref(), id.emoji.as_deref()) {
        (Some(name), Some(emoji)) => parts.push(format!("Your name is {name} {emoji}.")),
        (Some(name), None) => parts.push(format!("Your name is {name}.")),
        _ => {},
    }
    if let Some(creature) = id.creature.as_deref() {
        parts.push(format!("You are a {creature}."));
    }
    if let Some(vibe) = id.vibe.as_deref() {
        parts.push(format!("Your vibe: {vibe}."));
    }
    if !parts.is_empty() {
        prompt.push_str(&parts.join(" "));
        prompt.push('\n');
    }
    prompt.push_str("\n## Soul\n\n");
    prompt.push_str(id.soul.as_deref().unwrap_or(DEFAULT_SOUL));
    prompt.push_str("\n\n");
}

fn append_user_details_section(prompt: &mut String, user: Option<&UserProfile>) {
    let Some(user) = user else {
        return;
    };

    let mut emitted = false;
    if let Some(name) = user.name.as_deref() {
        prompt.push_str(&format!("The user's name is {name}.\n"));
        emitted = true;
    }
    if let Some(timezone) = user.timezone.as_deref() {
        prompt.push_str(&format!("The user's timezone is {timezone}.\n"));
        emitted = true;
    }
    if emitted {
        prompt.push('\n');
    }
}

fn append_runtime_section(prompt: &mut String, runtime_context: Option<&PromptRuntimeContext>) {
    let Some(runtime) = runtime_context else {
        return;
    };

    let mut parts = Vec::new();
    for (key, value) in [
        ("host", runtime.host.as_deref()),
        ("os", runtime.os.as_deref()),
        ("arch", runtime.arch.as_deref()),
        ("shell", runtime.shell.as_deref()),
        ("today", runtime.today.as_deref()),
        ("provider", runtime.provider.as_deref()),
        ("model", runtime.model.as_deref()),
        ("session", runtime.session_key.as_deref()),
    ] {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            parts.push(format!("{key}={value}"));
        }
    }
    if parts.is_empty() {
        return;
    }

    prompt.push_str("## Runtime\n\n");
    prompt.push_str(&format!("Host: {}\n\n", parts.join(" | ")));
}

fn append_available_tools_section(
    prompt: &mut String,
    native_tools: bool,
    tool_schemas: &[serde_json::Value],
) {
    if tool_schemas.is_empty() {
        return;
    }

    prompt.push_str("## Available Tools\n\n");
    if native_tools {
        // Native tool-calling providers already receive full schemas via the API.
        // Keep this section compact so we don't duplicate large JSON payloads.
        for schema in tool_schemas {
            let name = schema["name"].as_str().unwrap_or("unknown");
            let desc = schema["description"].as_str().unwrap_or("");
            let compact_desc = truncate_chars(desc, 160);
            if compact_desc.is_empty() {
                prompt.push_str(&format!("- `{name}`\n"));
            } else {
                prompt.push_str(&format!("- `{name}`: {compact_desc}\n"));
            }
        }
        prompt.push('\n');
        return;
    }

    for schema in tool_schemas {
        let name = schema["name"].as_str().unwrap_or("unknown");
        let desc = schema["description"].as_str().unwrap_or("");
        let params = &schema["parameters"];
        prompt.push_str(&format!(
            "### {name}\n{desc}\n\nParameters:\n```json\n{}\n```\n\n",
            serde_json::to_string(params).unwrap_or_default()
        ));
    }
}

fn append_tool_call_guidance(
    prompt: &mut String,
    native_tools: bool,
    tool_schemas: &[serde_json::Value],
) {
    if !native_tools && !tool_schemas.is_empty() {
        prompt.push_str(TOOL_CALL_GUIDANCE);
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.is_empty() || max_chars == 0 {
        return String::new();
    }
    let mut iter = text.chars();
    let taken: String = iter.by_ref().take(max_chars).collect();
    if iter.next().is_some() {
        format!("{taken}...")
    } else {
        taken
    }
}

/// Per-file limit for workspace context-file injection, in characters.
pub const CONTEXT_FILE_MAX_CHARS: usize = 20_000;
/// Total budget across all injected context files, in characters.
pub const CONTEXT_TOTAL_BUDGET_CHARS: usize = 24_000;
/// Files are skipped once the remaining total budget drops below this.
pub const CONTEXT_MIN_REMAINING_CHARS: usize = 64;

const TRUNCATION_MARKER: &str = "\n\n... [truncated] ...\n\n";

/// Truncate `text` to fit `limit` characters using a head/tail split: the
/// first 70% and last 20% of `limit` are kept, joined by a truncation
/// marker. Falls through unchanged when `text` already fits.
fn truncate_head_tail(text: &str, limit: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= limit || limit == 0 {
        return text.to_string();
    }

    let head_len = limit * 70 / 100;
    let tail_len = limit * 20 / 100;

    let chars: Vec<char> = text.chars().collect();
    let head: String = chars[..head_len.min(chars.len())].iter().collect();
    let tail_start = chars.len().saturating_sub(tail_len);
    let tail: String = chars[tail_start..].iter().collect();

    format!("{head}{TRUNCATION_MARKER}{tail}")
}

/// A workspace file read for context-file injection, prior to truncation.
pub struct ContextFile {
    pub path: String,
    pub content: String,
}

/// Build the synthetic system-message text for workspace context-file
/// injection: each file is truncated with [`truncate_head_tail`] against the
/// per-file limit, and files are skipped once the remaining total budget is
/// too small to be useful. Returns `None` when no files fit the budget.
#[must_use]
pub fn bootstrap_context_files(files: &[ContextFile]) -> Option<String> {
    let mut remaining = CONTEXT_TOTAL_BUDGET_CHARS;
    let mut out = String::new();

    for file in files {
        if remaining < CONTEXT_MIN_REMAINING_CHARS {
            break;
        }

        let per_file_limit = CONTEXT_FILE_MAX_CHARS.min(remaining);
        let truncated = truncate_head_tail(&file.content, per_file_limit);
        let consumed = truncated.chars().count();

        out.push_str(&format!("## {}\n\n{truncated}\n\n", file.path));
        remaining = remaining.saturating_sub(consumed);
    }

    if out.is_empty() { None } else { Some(out) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_prompt_does_not_include_tool_call_format() {
        let tools = ToolRegistry::new();
        let prompt = build_system_prompt(&tools, true, None, None, None, None);
        assert!(!prompt.contains("```tool_call"));
    }

    #[test]
    fn test_fallback_prompt_includes_tool_call_format() {
        let mut tools = ToolRegistry::new();
        struct Dummy;
        #[async_trait::async_trait]
        impl crate::tool_registry::AgentTool for Dummy {
            fn name(&self) -> &str {
                "test"
            }

            fn description(&self) -> &str {
                "A test tool"
            }

            fn parameters_schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "object", "properties": {}})
            }

            async fn execute(&self, _: serde_json::Value) -> anyhow::Result<serde_json::Value> {
                Ok(serde_json::json!({}))
            }
        }
        tools.register(Box::new(Dummy));

        let prompt = build_system_prompt(&tools, false, None, None, None, None);
        assert!(prompt.contains("```tool_call"));
        assert!(prompt.contains("### test"));
    }

    #[test]
    fn test_identity_and_user_injected() {
        let tools = ToolRegistry::new();
        let identity = AgentIdentity {
            name: Some("Momo".into()),
            emoji: Some("🦜".into()),
            creature: Some("parrot".into()),
            vibe: Some("cheerful and curious".into()),
            soul: None,
        };
        let user = UserProfile {
            name: Some("Alice".into()),
            timezone: Some("Europe/Paris".into()),
        };
        let prompt = build_system_prompt(&tools, true, Some(&identity), Some(&user), None, None);
        assert!(prompt.contains("Your name is Momo 🦜."));
        assert!(prompt.contains("You are a parrot."));
        assert!(prompt.contains("The user's name is Alice."));
        assert!(prompt.contains("The user's timezone is Europe/Paris."));
        assert!(prompt.contains("Be genuinely helpful"));
    }

    #[test]
    fn test_context_block_prepended() {
        let tools = ToolRegistry::new();
        let prompt =
            build_system_prompt(&tools, true, None, None, None, Some("## AGENTS.md\n\nfoo\n"));
        assert!(prompt.contains("## AGENTS.md"));
        assert!(prompt.find("AGENTS.md").unwrap() < prompt.find("Guidelines").unwrap());
    }

    #[test]
    fn bootstrap_returns_none_for_empty_input() {
        assert!(bootstrap_context_files(&[]).is_none());
    }

    #[test]
    fn bootstrap_keeps_short_files_unchanged() {
        let files = [ContextFile {
            path: "AGENTS.md".into(),
            content: "short content".into(),
        }];
        let out = bootstrap_context_files(&files).unwrap();
        assert!(out.contains("short content"));
        assert!(!out.contains("truncated"));
    }

    #[test]
    fn bootstrap_truncates_oversized_file_head_tail() {
        let content = "A".repeat(25_000) + "TAIL_MARKER";
        let files = [ContextFile {
            path: "big.md".into(),
            content,
        }];
        let out = bootstrap_context_files(&files).unwrap();
        assert!(out.contains("[truncated]"));
        assert!(out.contains("TAIL_MARKER"));
    }

    #[test]
    fn bootstrap_skips_files_once_budget_exhausted() {
        let files = vec![
            ContextFile {
                path: "first.md".into(),
                content: "A".repeat(CONTEXT_TOTAL_BUDGET_CHARS),
            },
            ContextFile {
                path: "second.md".into(),
                content: "should be skipped".into(),
            },
        ];
        let out = bootstrap_context_files(&files).unwrap();
        assert!(!out.contains("should be skipped"));
    }
}
