//! Live cron service wiring `moltis_cron::service::CronService` into the
//! gateway's RPC surface, plus heartbeat introspection (the heartbeat is
//! just the cron job at [`HEARTBEAT_JOB_ID`] with `system: true`).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::error;

use moltis_cron::{
    service::{CronService as CronScheduler, RunMode},
    types::{CronJobCreate, CronJobPatch},
};
use moltis_service_traits::{CronService, ServiceError, ServiceResult, SystemInfoService};

/// Well-known id the cron store reserves for the per-agent heartbeat job.
pub const HEARTBEAT_JOB_ID: &str = "system:heartbeat";

fn require_str<'a>(params: &'a Value, name: &str) -> ServiceResult<&'a str> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing '{name}'").into())
}

/// Gateway-facing cron service backed by the real scheduler.
pub struct LiveCronService {
    inner: Arc<CronScheduler>,
}

impl LiveCronService {
    pub fn new(inner: Arc<CronScheduler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl CronService for LiveCronService {
    async fn list(&self) -> ServiceResult {
        let jobs: Vec<_> = self
            .inner
            .list()
            .await
            .into_iter()
            .filter(|j| !j.system)
            .collect();
        Ok(serde_json::to_value(jobs)?)
    }

    async fn status(&self) -> ServiceResult {
        Ok(serde_json::to_value(self.inner.status().await)?)
    }

    async fn create(&self, params: Value) -> ServiceResult {
        let create: CronJobCreate = serde_json::from_value(params)
            .map_err(|e| ServiceError::message(format!("invalid job spec: {e}")))?;
        let job = self.inner.add(create).await.map_err(|e| {
            error!(error = %e, "cron create failed");
            ServiceError::message(e)
        })?;
        Ok(serde_json::to_value(job)?)
    }

    async fn update(&self, params: Value) -> ServiceResult {
        let id = require_str(&params, "id")?;
        let patch: CronJobPatch = serde_json::from_value(
            params.get("patch").cloned().unwrap_or_default(),
        )
        .map_err(|e| ServiceError::message(format!("invalid patch: {e}")))?;
        let job = self
            .inner
            .update(id, patch)
            .await
            .map_err(ServiceError::message)?;
        Ok(serde_json::to_value(job)?)
    }

    async fn delete(&self, params: Value) -> ServiceResult {
        let id = require_str(&params, "id")?;
        self.inner.remove(id).await.map_err(ServiceError::message)?;
        Ok(serde_json::json!({ "removed": id }))
    }

    async fn toggle(&self, params: Value) -> ServiceResult {
        let id = require_str(&params, "id")?;
        let enabled = params
            .get("enabled")
            .and_then(|v| v.as_bool())
            .ok_or("missing 'enabled'")?;
        let patch = CronJobPatch {
            enabled: Some(enabled),
            ..Default::default()
        };
        let job = self
            .inner
            .update(id, patch)
            .await
            .map_err(ServiceError::message)?;
        Ok(serde_json::to_value(job)?)
    }

    async fn run(&self, params: Value) -> ServiceResult {
        let id = require_str(&params, "id")?;
        let force = params
            .get("force")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let mode = if force { RunMode::Force } else { RunMode::Due };
        self.inner
            .run(id, mode)
            .await
            .map_err(ServiceError::message)?;
        Ok(serde_json::json!({ "ran": id }))
    }

    async fn runs(&self, params: Value) -> ServiceResult {
        let id = require_str(&params, "id")?;
        let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
        let runs = self
            .inner
            .runs(id, limit)
            .await
            .map_err(ServiceError::message)?;
        Ok(serde_json::to_value(runs)?)
    }
}

/// System info backed by the cron scheduler (for heartbeat introspection)
/// and a client-count callback (for connection counts).
pub struct LiveSystemInfoService {
    cron: Arc<CronScheduler>,
    hostname: String,
    version: String,
    started_at: std::time::Instant,
    client_count: Arc<dyn Fn() -> usize + Send + Sync>,
}

impl LiveSystemInfoService {
    pub fn new(
        cron: Arc<CronScheduler>,
        hostname: String,
        version: String,
        client_count: Arc<dyn Fn() -> usize + Send + Sync>,
    ) -> Self {
        Self {
            cron,
            hostname,
            version,
            started_at: std::time::Instant::now(),
            client_count,
        }
    }
}

#[async_trait]
impl SystemInfoService for LiveSystemInfoService {
    async fn health(&self) -> ServiceResult {
        Ok(serde_json::json!({ "status": "ok" }))
    }

    async fn status(&self) -> ServiceResult {
        Ok(serde_json::json!({
            "hostname": self.hostname,
            "version": self.version,
            "connections": (self.client_count)(),
            "uptimeMs": self.started_at.elapsed().as_millis() as u64,
        }))
    }

    async fn heartbeat_status(&self) -> ServiceResult {
        let job = self
            .cron
            .list()
            .await
            .into_iter()
            .find(|j| j.id == HEARTBEAT_JOB_ID);
        Ok(serde_json::json!({ "config": job }))
    }

    async fn heartbeat_runs(&self, params: Value) -> ServiceResult {
        let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
        let runs = self
            .cron
            .runs(HEARTBEAT_JOB_ID, limit)
            .await
            .unwrap_or_default();
        Ok(serde_json::to_value(runs)?)
    }
}
