//! Method router: maps an RPC method name onto the [`Services`] bundle,
//! enforcing the per-role policy engine and the `chat.send` rate limit.
//!
//! Dispatch itself never fails with a hard error for an unknown role/method
//! combination other than by returning `UNAUTHORIZED`/`INVALID_REQUEST` —
//! callers always get exactly one response frame.

use std::sync::Arc;

use moltis_protocol::{ErrorShape, error_codes, roles};
use serde_json::Value;

use crate::state::GatewayState;

/// Methods permitted regardless of connection state (even `pending_pairing`).
pub const ALWAYS_ALLOWED: &[&str] = &["connect", "health", "browser.pairing.status"];

/// Minimum role required for a method. Methods not listed default to
/// `operator` — the common case for mutating, non-security-sensitive calls.
fn min_role_for(method: &str) -> &'static str {
    match method {
        "connect" | "health" | "browser.pairing.status" | "status" | "chat.history"
        | "sessions.list" | "cron.list" | "cron.status" | "cron.runs" | "channels.list"
        | "channels.status" | "skills.list" | "skills.get" | "config.schema" => roles::VIEWER,

        "pairing.approve" | "pairing.revoke" | "config.apply" | "config.patch" => roles::ADMIN,

        _ => roles::OPERATOR,
    }
}

pub fn is_allowed(role: &str, method: &str) -> bool {
    if ALWAYS_ALLOWED.contains(&method) {
        return true;
    }
    roles::at_least(role, min_role_for(method))
}

/// Dispatch a single request method. `rate_limit_key` is the key the caller
/// should be charged against for `chat.send` (user_id if authenticated with
/// one, else connection id).
pub async fn dispatch(
    state: &Arc<GatewayState>,
    role: &str,
    rate_limit_key: &str,
    method: &str,
    params: Value,
) -> Result<Value, ErrorShape> {
    if !is_allowed(role, method) {
        return Err(ErrorShape::new(
            error_codes::UNAUTHORIZED,
            format!("role '{role}' may not call '{method}'"),
        ));
    }

    if method == "chat.send" && !state.rate_limiter.check(rate_limit_key) {
        return Err(ErrorShape::new(
            error_codes::INVALID_REQUEST,
            "rate limit exceeded",
        ));
    }

    let services = &state.services;
    let result = match method {
        "health" => services.system_info.health().await,
        "status" => services.system_info.status().await,

        "chat.send" => services.chat.send(params).await,
        "chat.abort" => services.chat.abort(params).await,
        "chat.history" => services.chat.history(params).await,
        "chat.inject" => services.chat.inject(params).await,

        "send" => services.channel.send(params).await,
        "channels.list" => services.channel.list().await,
        "channels.status" => services.channel.status().await,

        "sessions.list" => services.session.list().await,
        "sessions.reset" => services.session.reset(params).await,
        "sessions.delete" => services.session.delete(params).await,

        "cron.list" => services.cron.list().await,
        "cron.status" => services.cron.status().await,
        "cron.create" => services.cron.create(params).await,
        "cron.update" => services.cron.update(params).await,
        "cron.delete" => services.cron.delete(params).await,
        "cron.toggle" => services.cron.toggle(params).await,
        "cron.run" => services.cron.run(params).await,
        "cron.runs" => services.cron.runs(params).await,

        "pairing.request" => services.pairing.request(params).await,
        "pairing.approve" => services.pairing.approve(params).await,
        "pairing.list" => services.pairing.list().await,
        "pairing.revoke" => services.pairing.revoke(params).await,
        "browser.pairing.status" => services.pairing.status(params).await,

        "skills.list" => services.skills.list().await,
        "skills.get" => services.skills.get(params).await,
        "skills.update" => services.skills.update(params).await,

        "config.get" => services.config.get(params).await,
        "config.apply" => services.config.apply(params).await,
        "config.patch" => services.config.patch(params).await,
        "config.schema" => services.config.schema().await,

        "exec.approval.list" => services.exec_approval.list().await,
        "exec.approval.approve" => services.exec_approval.approve(params).await,
        "exec.approval.deny" => services.exec_approval.deny(params).await,

        "heartbeat.status" => services.system_info.heartbeat_status().await,
        "heartbeat.runs" => services.system_info.heartbeat_runs(params).await,

        _ => {
            return Err(ErrorShape::new(
                error_codes::INVALID_REQUEST,
                format!("unknown method: {method}"),
            ));
        },
    };

    result.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_may_read_health_and_status() {
        assert!(is_allowed(roles::VIEWER, "health"));
        assert!(is_allowed(roles::VIEWER, "status"));
        assert!(is_allowed(roles::VIEWER, "chat.history"));
    }

    #[test]
    fn viewer_may_not_send_chat() {
        assert!(!is_allowed(roles::VIEWER, "chat.send"));
    }

    #[test]
    fn operator_may_not_approve_pairing() {
        assert!(!is_allowed(roles::OPERATOR, "pairing.approve"));
        assert!(is_allowed(roles::ADMIN, "pairing.approve"));
    }

    #[test]
    fn unknown_method_is_not_always_allowed() {
        assert!(!ALWAYS_ALLOWED.contains(&"chat.send"));
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_method() {
        let config = Arc::new(moltis_config::schema::GatewayConfig::default());
        let state = GatewayState::new(config, moltis_service_traits::Services::default());
        let err = dispatch(&state, roles::ADMIN, "k", "nonsense.method", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn dispatch_enforces_rate_limit_on_chat_send() {
        let mut cfg = moltis_config::schema::GatewayConfig::default();
        cfg.rate_limit.requests_per_minute = 60;
        cfg.rate_limit.burst = 1;
        let config = Arc::new(cfg);
        let state = GatewayState::new(config, moltis_service_traits::Services::default());

        // First call consumes the only token; the underlying noop service
        // errors but that's still a dispatch, not a rate-limit rejection.
        let _ = dispatch(
            &state,
            roles::OPERATOR,
            "k1",
            "chat.send",
            serde_json::json!({}),
        )
        .await;
        let second = dispatch(
            &state,
            roles::OPERATOR,
            "k1",
            "chat.send",
            serde_json::json!({}),
        )
        .await;
        assert!(matches!(second, Err(e) if e.message == "rate limit exceeded"));
    }
}
