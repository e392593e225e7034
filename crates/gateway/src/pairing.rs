//! Sender pairing: lets a channel sender (or an unauthenticated browser
//! client, when no admin token is configured) get approved for operator
//! access without sharing the admin token.
//!
//! `RequestPairing` issues an 8-char alphanumeric code with a 10-minute TTL,
//! idempotent per `(senderId, channel)` while the existing code is still
//! live. `ApprovePairing` looks the code up, marks `(senderId, channel)`
//! paired, and fires a background `onApprove` callback so the originating
//! channel (or WS connection) can be notified.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, Weak},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {async_trait::async_trait, rand::Rng, serde::Serialize, serde_json::Value, tracing::info};

use moltis_service_traits::{PairingService, ServiceResult};

use crate::state::GatewayState;

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn generate_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::rng();
    (0..8)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingCode {
    pub code: String,
    pub sender_id: String,
    pub channel: String,
    pub chat_id: String,
    pub account_id: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairedDevice {
    pub sender_id: String,
    pub channel: String,
    pub approved_by: String,
    pub approved_at_ms: u64,
}

/// Fired once a code is approved, so the originating surface (a channel
/// adapter, a waiting browser tab) can react.
pub type OnApprove = Arc<dyn Fn(PendingCode, String) + Send + Sync>;

struct Inner {
    pending: HashMap<String, PendingCode>,
    paired: HashMap<(String, String), PairedDevice>,
}

pub struct PairingStore {
    inner: RwLock<Inner>,
    ttl: Duration,
    on_approve: RwLock<Option<OnApprove>>,
}

impl PairingStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                pending: HashMap::new(),
                paired: HashMap::new(),
            }),
            ttl,
            on_approve: RwLock::new(None),
        }
    }

    pub fn set_on_approve(&self, cb: OnApprove) {
        *self
            .on_approve
            .write()
            .expect("pairing on_approve lock poisoned") = Some(cb);
    }

    fn key_of(sender_id: &str, channel: &str) -> (String, String) {
        (sender_id.to_string(), channel.to_string())
    }

    /// Idempotent per `(sender_id, channel)` while a live code exists.
    pub fn request(
        &self,
        sender_id: &str,
        channel: &str,
        chat_id: &str,
        account_id: &str,
    ) -> PendingCode {
        let now = unix_ms();
        let mut inner = self.inner.write().expect("pairing store lock poisoned");

        if let Some(existing) = inner
            .pending
            .values()
            .find(|p| p.sender_id == sender_id && p.channel == channel && p.expires_at_ms > now)
        {
            return existing.clone();
        }

        let code = generate_code();
        let entry = PendingCode {
            code: code.clone(),
            sender_id: sender_id.to_string(),
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            account_id: account_id.to_string(),
            created_at_ms: now,
            expires_at_ms: now + self.ttl.as_millis() as u64,
        };
        inner.pending.insert(code, entry.clone());
        entry
    }

    /// `None` on unknown or expired code.
    pub fn approve(&self, code: &str, approved_by: &str) -> Option<PairedDevice> {
        let now = unix_ms();
        let (pending, device) = {
            let mut inner = self.inner.write().expect("pairing store lock poisoned");
            let entry = inner.pending.remove(code)?;
            if entry.expires_at_ms <= now {
                return None;
            }
            let device = PairedDevice {
                sender_id: entry.sender_id.clone(),
                channel: entry.channel.clone(),
                approved_by: approved_by.to_string(),
                approved_at_ms: now,
            };
            inner
                .paired
                .insert(Self::key_of(&entry.sender_id, &entry.channel), device.clone());
            (entry, device)
        };

        if let Some(cb) = self
            .on_approve
            .read()
            .expect("pairing on_approve lock poisoned")
            .clone()
        {
            let approved_by = approved_by.to_string();
            let pending = pending.clone();
            tokio::spawn(async move {
                cb(pending, approved_by);
            });
        }
        info!(sender_id = %device.sender_id, channel = %device.channel, "pairing approved");
        Some(device)
    }

    pub fn is_paired(&self, sender_id: &str, channel: &str) -> bool {
        self.inner
            .read()
            .expect("pairing store lock poisoned")
            .paired
            .contains_key(&Self::key_of(sender_id, channel))
    }

    pub fn list_pending(&self) -> Vec<PendingCode> {
        let now = unix_ms();
        self.inner
            .read()
            .expect("pairing store lock poisoned")
            .pending
            .values()
            .filter(|p| p.expires_at_ms > now)
            .cloned()
            .collect()
    }

    pub fn list_paired(&self) -> Vec<PairedDevice> {
        self.inner
            .read()
            .expect("pairing store lock poisoned")
            .paired
            .values()
            .cloned()
            .collect()
    }

    pub fn revoke(&self, sender_id: &str, channel: &str) -> bool {
        self.inner
            .write()
            .expect("pairing store lock poisoned")
            .paired
            .remove(&Self::key_of(sender_id, channel))
            .is_some()
    }

    pub fn status_of(&self, code: &str) -> &'static str {
        let now = unix_ms();
        let inner = self.inner.read().expect("pairing store lock poisoned");
        match inner.pending.get(code) {
            Some(p) if p.expires_at_ms > now => "pending",
            Some(_) => "expired",
            None => "unknown",
        }
    }
}

/// Adapts [`PairingStore`] to the [`PairingService`] RPC surface.
///
/// Holds the gateway state as a [`Weak`] rather than its `PairingStore`
/// directly: the state owns the one true `PairingStore` instance (also used
/// for connect-handshake role derivation, §4.1), and this service is itself
/// reachable through that same state's `Services` bundle, so a strong
/// back-reference would be a cycle.
pub struct LivePairingService {
    state: Weak<GatewayState>,
}

impl LivePairingService {
    pub fn new(state: Weak<GatewayState>) -> Self {
        Self { state }
    }

    fn store(&self) -> ServiceResult<Arc<PairingStore>> {
        self.state
            .upgrade()
            .map(|s| Arc::clone(&s.pairing))
            .ok_or_else(|| "gateway shutting down".into())
    }
}

fn field<'a>(params: &'a Value, name: &str) -> ServiceResult<&'a str> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing '{name}'").into())
}

#[async_trait]
impl PairingService for LivePairingService {
    async fn request(&self, params: Value) -> ServiceResult {
        let sender_id = field(&params, "senderId")?;
        let channel = field(&params, "channel")?;
        let chat_id = params.get("chatId").and_then(|v| v.as_str()).unwrap_or("");
        let account_id = params
            .get("accountId")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let pending = self.store()?.request(sender_id, channel, chat_id, account_id);
        Ok(serde_json::json!({
            "code": pending.code,
            "expiresAtMs": pending.expires_at_ms,
        }))
    }

    async fn approve(&self, params: Value) -> ServiceResult {
        let code = field(&params, "code")?;
        let approved_by = params
            .get("approvedBy")
            .and_then(|v| v.as_str())
            .unwrap_or("admin");
        let device = self
            .store()?
            .approve(code, approved_by)
            .ok_or_else(|| "pairing code not found or expired".to_string())?;
        serde_json::to_value(device).map_err(Into::into)
    }

    async fn list(&self) -> ServiceResult {
        let store = self.store()?;
        Ok(serde_json::json!({
            "pending": store.list_pending(),
            "paired": store.list_paired(),
        }))
    }

    async fn revoke(&self, params: Value) -> ServiceResult {
        let sender_id = field(&params, "senderId")?;
        let channel = field(&params, "channel")?;
        let revoked = self.store()?.revoke(sender_id, channel);
        Ok(serde_json::json!({ "revoked": revoked }))
    }

    async fn status(&self, params: Value) -> ServiceResult {
        let code = field(&params, "code")?;
        Ok(serde_json::json!({ "status": self.store()?.status_of(code) }))
    }
}
