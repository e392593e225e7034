//! Session management RPCs: list known session keys, reset (clear) one, or
//! delete one outright. Backed directly by [`moltis_sessions::SessionStore`]
//! — there is no separate metadata index here, `list` just scans the
//! transcript directory.

use std::sync::Arc;

use {async_trait::async_trait, serde_json::Value};

use {
    moltis_sessions::store::SessionStore,
    moltis_service_traits::{ServiceResult, SessionService},
};

fn field<'a>(params: &'a Value, name: &str) -> ServiceResult<&'a str> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing '{name}'").into())
}

pub struct LiveSessionService {
    sessions: Arc<SessionStore>,
}

impl LiveSessionService {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl SessionService for LiveSessionService {
    async fn list(&self) -> ServiceResult {
        let mut keys = self.sessions.list_keys();
        keys.sort();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let count = self.sessions.count(&key).await.map_err(|e| e.to_string())?;
            entries.push(serde_json::json!({ "sessionKey": key, "messageCount": count }));
        }
        Ok(Value::Array(entries.into_iter().collect()))
    }

    async fn reset(&self, params: Value) -> ServiceResult {
        let session_key = field(&params, "sessionKey")?;
        self.sessions.clear(session_key).await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "ok": true }))
    }

    async fn delete(&self, params: Value) -> ServiceResult {
        let session_key = field(&params, "sessionKey")?;
        self.sessions.clear(session_key).await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "ok": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_service() -> (LiveSessionService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().to_path_buf()));
        (LiveSessionService::new(store), dir)
    }

    #[tokio::test]
    async fn list_is_empty_for_fresh_store() {
        let (service, _dir) = temp_service();
        let result = service.list().await.unwrap();
        assert_eq!(result, serde_json::json!([]));
    }

    #[tokio::test]
    async fn reset_clears_transcript() {
        let (service, _dir) = temp_service();
        service
            .sessions
            .append("agent:ui:direct:default", &serde_json::json!({"role": "user", "content": "hi"}))
            .await
            .unwrap();

        service
            .reset(serde_json::json!({"sessionKey": "agent:ui:direct:default"}))
            .await
            .unwrap();

        let remaining = service.sessions.read("agent:ui:direct:default").await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn reset_requires_session_key() {
        let (service, _dir) = temp_service();
        let result = service.reset(serde_json::json!({})).await;
        assert!(result.is_err());
    }
}
