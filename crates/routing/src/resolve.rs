use {crate::Result, moltis_common::types::MsgContext, moltis_config::GatewayConfig, tracing::debug};

/// Resolved route: which agent handles this message and the session key.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub agent_id: String,
    pub session_key: moltis_sessions::SessionKey,
}

/// Resolve which agent should handle a message, following the binding cascade.
///
/// Checked in order: exact peer binding, account binding
/// (`"{channel}:{accountId}"`), channel binding, then the configured default
/// agent. The session key is always built from the resolved agent id, the
/// message's channel, peer kind, and chat id, regardless of which tier of
/// the cascade matched.
pub fn resolve_agent_route(msg: &MsgContext, config: &GatewayConfig) -> Result<ResolvedRoute> {
    let account_key = format!("{}:{}", msg.channel, msg.account_id);

    let agent_id = config
        .routing
        .peer_bindings
        .get(&msg.from)
        .or_else(|| config.routing.account_bindings.get(&account_key))
        .or_else(|| config.routing.channel_bindings.get(&msg.channel))
        .cloned()
        .or_else(|| config.routing.default_agent_id.clone())
        .ok_or(crate::Error::NotConfigured)?;

    debug!(agent_id, channel = %msg.channel, from = %msg.from, "resolved agent route");

    let session_key = moltis_sessions::SessionKey::new(
        &agent_id,
        &msg.channel,
        msg.chat_type.as_str(),
        &msg.chat_id,
    );

    Ok(ResolvedRoute {
        agent_id,
        session_key,
    })
}
