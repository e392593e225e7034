//! Service trait interfaces for domain services.
//!
//! Each trait has a `Noop` implementation that returns empty/default
//! responses, letting the gateway's method router come up before domain
//! crates are wired in (and letting tests exercise the router without a real
//! agent/session/channel stack behind it).

use {async_trait::async_trait, serde_json::Value};

/// Error type returned by service methods.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{message}")]
    Message { message: String },
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

impl ServiceError {
    #[must_use]
    pub fn message(message: impl std::fmt::Display) -> Self {
        Self::Message {
            message: message.to_string(),
        }
    }
}

impl From<String> for ServiceError {
    fn from(value: String) -> Self {
        Self::message(value)
    }
}

impl From<&str> for ServiceError {
    fn from(value: &str) -> Self {
        Self::message(value)
    }
}

impl From<ServiceError> for moltis_protocol::ErrorShape {
    fn from(err: ServiceError) -> Self {
        Self::new(moltis_protocol::error_codes::UNAVAILABLE, err.to_string())
    }
}

pub type ServiceResult<T = Value> = Result<T, ServiceError>;

// ── Sessions ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait SessionService: Send + Sync {
    async fn list(&self) -> ServiceResult;
    async fn reset(&self, params: Value) -> ServiceResult;
    async fn delete(&self, params: Value) -> ServiceResult;
}

pub struct NoopSessionService;

#[async_trait]
impl SessionService for NoopSessionService {
    async fn list(&self) -> ServiceResult {
        Ok(serde_json::json!([]))
    }

    async fn reset(&self, _p: Value) -> ServiceResult {
        Ok(serde_json::json!({}))
    }

    async fn delete(&self, _p: Value) -> ServiceResult {
        Ok(serde_json::json!({ "ok": true }))
    }
}

// ── Channels ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ChannelService: Send + Sync {
    async fn list(&self) -> ServiceResult;
    async fn status(&self) -> ServiceResult;
    async fn send(&self, params: Value) -> ServiceResult;
}

pub struct NoopChannelService;

#[async_trait]
impl ChannelService for NoopChannelService {
    async fn list(&self) -> ServiceResult {
        Ok(serde_json::json!([]))
    }

    async fn status(&self) -> ServiceResult {
        Ok(serde_json::json!({ "channels": [] }))
    }

    async fn send(&self, _p: Value) -> ServiceResult {
        Err("no channels configured".into())
    }
}

// ── Config ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ConfigService: Send + Sync {
    async fn get(&self, params: Value) -> ServiceResult;
    async fn apply(&self, params: Value) -> ServiceResult;
    async fn patch(&self, params: Value) -> ServiceResult;
    async fn schema(&self) -> ServiceResult;
}

pub struct NoopConfigService;

#[async_trait]
impl ConfigService for NoopConfigService {
    async fn get(&self, _p: Value) -> ServiceResult {
        Ok(serde_json::json!({}))
    }

    async fn apply(&self, _p: Value) -> ServiceResult {
        Ok(serde_json::json!({}))
    }

    async fn patch(&self, _p: Value) -> ServiceResult {
        Ok(serde_json::json!({}))
    }

    async fn schema(&self) -> ServiceResult {
        Ok(serde_json::json!({}))
    }
}

// ── Cron ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait CronService: Send + Sync {
    async fn list(&self) -> ServiceResult;
    async fn status(&self) -> ServiceResult;
    async fn create(&self, params: Value) -> ServiceResult;
    async fn update(&self, params: Value) -> ServiceResult;
    async fn delete(&self, params: Value) -> ServiceResult;
    async fn toggle(&self, params: Value) -> ServiceResult;
    async fn run(&self, params: Value) -> ServiceResult;
    async fn runs(&self, params: Value) -> ServiceResult;
}

pub struct NoopCronService;

#[async_trait]
impl CronService for NoopCronService {
    async fn list(&self) -> ServiceResult {
        Ok(serde_json::json!([]))
    }

    async fn status(&self) -> ServiceResult {
        Ok(serde_json::json!({ "running": false }))
    }

    async fn create(&self, _p: Value) -> ServiceResult {
        Err("cron not configured".into())
    }

    async fn update(&self, _p: Value) -> ServiceResult {
        Err("cron not configured".into())
    }

    async fn delete(&self, _p: Value) -> ServiceResult {
        Err("cron not configured".into())
    }

    async fn toggle(&self, _p: Value) -> ServiceResult {
        Err("cron not configured".into())
    }

    async fn run(&self, _p: Value) -> ServiceResult {
        Err("cron not configured".into())
    }

    async fn runs(&self, _p: Value) -> ServiceResult {
        Ok(serde_json::json!([]))
    }
}

// ── Chat ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ChatService: Send + Sync {
    async fn send(&self, params: Value) -> ServiceResult;
    async fn abort(&self, params: Value) -> ServiceResult;
    async fn history(&self, params: Value) -> ServiceResult;
    async fn inject(&self, params: Value) -> ServiceResult;
}

pub struct NoopChatService;

#[async_trait]
impl ChatService for NoopChatService {
    async fn send(&self, _p: Value) -> ServiceResult {
        Err("chat not configured".into())
    }

    async fn abort(&self, _p: Value) -> ServiceResult {
        Ok(serde_json::json!({ "ok": true, "aborted": false, "runIds": [] }))
    }

    async fn history(&self, _p: Value) -> ServiceResult {
        Ok(serde_json::json!([]))
    }

    async fn inject(&self, _p: Value) -> ServiceResult {
        Err("chat not configured".into())
    }
}

// ── Pairing ─────────────────────────────────────────────────────────────────

/// Device/sender pairing — both the gateway's "admin token not provided"
/// pairing flow and the channel-sender allowlist flow go through this trait.
#[async_trait]
pub trait PairingService: Send + Sync {
    async fn request(&self, params: Value) -> ServiceResult;
    async fn approve(&self, params: Value) -> ServiceResult;
    async fn list(&self) -> ServiceResult;
    async fn revoke(&self, params: Value) -> ServiceResult;
    /// Status of a pending pairing code, polled by the requesting client.
    async fn status(&self, params: Value) -> ServiceResult;
}

pub struct NoopPairingService;

#[async_trait]
impl PairingService for NoopPairingService {
    async fn request(&self, _p: Value) -> ServiceResult {
        Err("pairing not configured".into())
    }

    async fn approve(&self, _p: Value) -> ServiceResult {
        Err("pairing not configured".into())
    }

    async fn list(&self) -> ServiceResult {
        Ok(serde_json::json!([]))
    }

    async fn revoke(&self, _p: Value) -> ServiceResult {
        Err("pairing not configured".into())
    }

    async fn status(&self, _p: Value) -> ServiceResult {
        Ok(serde_json::json!({ "status": "unknown" }))
    }
}

// ── Skills ──────────────────────────────────────────────────────────────────

/// Named, config-driven tool bundles an agent can be granted. Deliberately
/// minimal compared to a full marketplace: installation and update just
/// flip entries in the agent's tool allowlist.
#[async_trait]
pub trait SkillsService: Send + Sync {
    async fn list(&self) -> ServiceResult;
    async fn get(&self, params: Value) -> ServiceResult;
    async fn update(&self, params: Value) -> ServiceResult;
}

pub struct NoopSkillsService;

#[async_trait]
impl SkillsService for NoopSkillsService {
    async fn list(&self) -> ServiceResult {
        Ok(serde_json::json!([]))
    }

    async fn get(&self, _p: Value) -> ServiceResult {
        Err("skill not found".into())
    }

    async fn update(&self, _p: Value) -> ServiceResult {
        Err("skills service not configured".into())
    }
}

// ── Exec Approvals ──────────────────────────────────────────────────────────

#[async_trait]
pub trait ExecApprovalService: Send + Sync {
    async fn list(&self) -> ServiceResult;
    async fn approve(&self, params: Value) -> ServiceResult;
    async fn deny(&self, params: Value) -> ServiceResult;
}

pub struct NoopExecApprovalService;

#[async_trait]
impl ExecApprovalService for NoopExecApprovalService {
    async fn list(&self) -> ServiceResult {
        Ok(serde_json::json!([]))
    }

    async fn approve(&self, _p: Value) -> ServiceResult {
        Err("approvals not configured".into())
    }

    async fn deny(&self, _p: Value) -> ServiceResult {
        Err("approvals not configured".into())
    }
}

// ── System Info ──────────────────────────────────────────────────────────────

/// Gateway-level introspection: liveness, connection counts, heartbeat state.
#[async_trait]
pub trait SystemInfoService: Send + Sync {
    async fn health(&self) -> ServiceResult;
    async fn status(&self) -> ServiceResult;
    async fn heartbeat_status(&self) -> ServiceResult;
    async fn heartbeat_runs(&self, params: Value) -> ServiceResult;
}

pub struct NoopSystemInfoService;

#[async_trait]
impl SystemInfoService for NoopSystemInfoService {
    async fn health(&self) -> ServiceResult {
        Ok(serde_json::json!({ "status": "ok" }))
    }

    async fn status(&self) -> ServiceResult {
        Ok(serde_json::json!({
            "hostname": "unknown",
            "version": "0.0.0",
            "connections": 0,
            "uptimeMs": 0,
        }))
    }

    async fn heartbeat_status(&self) -> ServiceResult {
        Ok(serde_json::json!({ "config": null }))
    }

    async fn heartbeat_runs(&self, _params: Value) -> ServiceResult {
        Ok(serde_json::json!([]))
    }
}

// ── Services bundle ─────────────────────────────────────────────────────────

use std::sync::Arc;

/// Bundle of all domain service trait objects, shared by the gateway's
/// method router. Transport code calls through this struct directly — no
/// string-based dispatch or RPC indirection between it and the domain
/// implementations.
pub struct Services {
    pub session: Arc<dyn SessionService>,
    pub channel: Arc<dyn ChannelService>,
    pub config: Arc<dyn ConfigService>,
    pub cron: Arc<dyn CronService>,
    pub chat: Arc<dyn ChatService>,
    pub pairing: Arc<dyn PairingService>,
    pub skills: Arc<dyn SkillsService>,
    pub exec_approval: Arc<dyn ExecApprovalService>,
    pub system_info: Arc<dyn SystemInfoService>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            session: Arc::new(NoopSessionService),
            channel: Arc::new(NoopChannelService),
            config: Arc::new(NoopConfigService),
            cron: Arc::new(NoopCronService),
            chat: Arc::new(NoopChatService),
            pairing: Arc::new(NoopPairingService),
            skills: Arc::new(NoopSkillsService),
            exec_approval: Arc::new(NoopExecApprovalService),
            system_info: Arc::new(NoopSystemInfoService),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_services_respond_without_panicking() {
        let services = Services::default();
        assert!(services.session.list().await.is_ok());
        assert!(services.chat.abort(serde_json::json!({})).await.is_ok());
        assert!(services.pairing.list().await.is_ok());
        assert!(services.system_info.health().await.is_ok());
    }

    #[test]
    fn service_error_converts_to_error_shape() {
        let err: moltis_protocol::ErrorShape = ServiceError::message("boom").into();
        assert_eq!(err.code, moltis_protocol::error_codes::UNAVAILABLE);
    }
}
