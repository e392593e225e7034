//! Inbound message processing: the glue between a channel message and an
//! agent run.
//!
//! Flow: resolve route → handle directive (short-circuit) → load session →
//! attach media → invoke agent → persist transcript → return reply.
//! Chunking and delivery to a channel's outbound adapter are separate steps
//! ([`crate::chunk`], [`crate::queue`]) the caller composes on top of
//! [`get_reply`] — the gateway's message bus is what does so in practice.

use std::sync::Arc;

use {
    moltis_agents::{
        prompt::build_system_prompt,
        providers::ProviderRegistry,
        runner::run_agent_loop_with_context,
        tool_registry::ToolRegistry,
    },
    moltis_common::types::{MsgContext, ReplyPayload},
    moltis_config::schema::{AgentSpec, GatewayConfig},
    moltis_routing::resolve_agent_route,
    moltis_sessions::SessionStore,
    tracing::{info, warn},
};

use crate::{
    directives::{Directive, parse_directive},
    Error, Result,
};

/// Collaborators the pipeline needs: routing/agent config, session storage,
/// the registered LLM providers, and the shared tool registry.
pub struct AutoReplyContext {
    pub config: Arc<GatewayConfig>,
    pub sessions: Arc<SessionStore>,
    pub providers: Arc<ProviderRegistry>,
    pub tools: Arc<ToolRegistry>,
}

/// System prompt used for the silent `/compact` summarization turn.
const COMPACT_SYSTEM_PROMPT: &str = "You summarize conversations. Produce a concise summary \
of the conversation below, preserving names, decisions, and open questions. Reply with the \
summary text only.";

/// Process an inbound message and produce a reply. Does not chunk or
/// deliver to a channel; the caller owns that (see `crate::chunk`/`crate::queue`).
pub async fn get_reply(ctx: &AutoReplyContext, msg: &MsgContext) -> Result<ReplyPayload> {
    info!(
        channel = %msg.channel,
        account_id = %msg.account_id,
        from = %msg.from,
        chat_type = ?msg.chat_type,
        session_key = %msg.session_key,
        "incoming message: {}",
        msg.body,
    );

    let route = resolve_agent_route(msg, &ctx.config)?;
    let key = route.session_key.as_str();

    let reply = if let Some(directive) = parse_directive(&msg.body) {
        handle_directive(ctx, &route.agent_id, key, directive).await?
    } else {
        run_agent_turn(ctx, &route.agent_id, key, msg).await?
    };

    Ok(reply)
}

fn resolve_agent_spec(ctx: &AutoReplyContext, agent_id: &str) -> AgentSpec {
    ctx.config.agents.get(agent_id).cloned().unwrap_or_default()
}

async fn run_agent_turn(
    ctx: &AutoReplyContext,
    agent_id: &str,
    session_key: &str,
    msg: &MsgContext,
) -> Result<ReplyPayload> {
    let agent_spec = resolve_agent_spec(ctx, agent_id);
    let provider = ctx.providers.get(&agent_spec.model).ok_or_else(|| Error::NoProvider {
        agent_id: agent_id.to_string(),
        model: agent_spec.model.clone(),
    })?;

    let history = ctx
        .sessions
        .read(session_key)
        .await
        .map_err(|e| Error::Session(e.to_string()))?;

    let user_message = build_user_message(msg).await;

    let native_tools = provider.supports_tools();
    let system_prompt = build_system_prompt(
        &ctx.tools,
        native_tools,
        Some(&ctx.config.identity),
        Some(&ctx.config.user),
        None,
        None,
    );

    let run = run_agent_loop_with_context(
        provider,
        &ctx.tools,
        &system_prompt,
        &user_message,
        None,
        Some(history),
        None,
    )
    .await
    .map_err(|e| Error::AgentRun(e.to_string()))?;

    ctx.sessions
        .append(
            session_key,
            &moltis_sessions::message::PersistedMessage::user_with_channel(
                msg.body.clone(),
                serde_json::json!({"channel": msg.channel, "from": msg.from}),
            )
            .to_value(),
        )
        .await
        .map_err(|e| Error::Session(e.to_string()))?;
    ctx.sessions
        .append(
            session_key,
            &moltis_sessions::message::PersistedMessage::assistant(
                run.text.clone(),
                agent_spec.model.clone(),
                agent_spec.provider_id.clone(),
                run.usage.input_tokens,
                run.usage.output_tokens,
                None,
            )
            .to_value(),
        )
        .await
        .map_err(|e| Error::Session(e.to_string()))?;

    Ok(ReplyPayload {
        text: run.text,
        media: None,
        reply_to_id: msg.reply_to_id.clone(),
        silent: false,
    })
}

/// Build the text sent to the agent loop. The underlying runner takes plain
/// text, so attachments are noted by name rather than ingested as
/// multimodal content; an attachment that no longer exists on disk is
/// dropped from the note instead of failing the turn.
async fn build_user_message(msg: &MsgContext) -> String {
    if msg.media.is_empty() {
        return msg.body.clone();
    }
    let mut present = Vec::with_capacity(msg.media.len());
    for path in &msg.media {
        match tokio::fs::metadata(path).await {
            Ok(_) => present.push(path.clone()),
            Err(err) => warn!(path, error = %err, "media attachment not readable, skipping"),
        }
    }
    if present.is_empty() {
        msg.body.clone()
    } else {
        format!("{}\n\n[attachments: {}]", msg.body, present.join(", "))
    }
}

async fn handle_directive(
    ctx: &AutoReplyContext,
    agent_id: &str,
    session_key: &str,
    directive: Directive,
) -> Result<ReplyPayload> {
    let text = match directive {
        Directive::New => {
            ctx.sessions
                .clear(session_key)
                .await
                .map_err(|e| Error::Session(e.to_string()))?;
            "Started a new session.".to_string()
        },
        Directive::Clear => {
            ctx.sessions
                .clear(session_key)
                .await
                .map_err(|e| Error::Session(e.to_string()))?;
            "Session cleared.".to_string()
        },
        Directive::Compact => compact_session(ctx, agent_id, session_key).await?,
        Directive::Context => {
            let count = ctx
                .sessions
                .count(session_key)
                .await
                .map_err(|e| Error::Session(e.to_string()))?;
            format!("session `{session_key}`: {count} messages")
        },
        Directive::Unknown(command) => format!("unknown command: /{command}"),
    };

    Ok(ReplyPayload {
        text,
        media: None,
        reply_to_id: None,
        silent: false,
    })
}

/// Silent summarization turn: replaces the transcript with a single system
/// message holding a condensed summary of everything before it.
async fn compact_session(ctx: &AutoReplyContext, agent_id: &str, session_key: &str) -> Result<String> {
    let history = ctx
        .sessions
        .read(session_key)
        .await
        .map_err(|e| Error::Session(e.to_string()))?;
    if history.is_empty() {
        return Ok("Nothing to compact.".to_string());
    }
    let message_count = history.len();

    let agent_spec = resolve_agent_spec(ctx, agent_id);
    let provider = ctx.providers.get(&agent_spec.model).ok_or_else(|| Error::NoProvider {
        agent_id: agent_id.to_string(),
        model: agent_spec.model.clone(),
    })?;

    let no_tools = ToolRegistry::new();
    let run = run_agent_loop_with_context(
        provider,
        &no_tools,
        COMPACT_SYSTEM_PROMPT,
        "Summarize the conversation above.",
        None,
        Some(history),
        None,
    )
    .await
    .map_err(|e| Error::AgentRun(e.to_string()))?;

    ctx.sessions
        .replace_history(
            session_key,
            vec![moltis_sessions::message::PersistedMessage::system(run.text).to_value()],
        )
        .await
        .map_err(|e| Error::Session(e.to_string()))?;

    Ok(format!("Compacted {message_count} messages into a summary."))
}
