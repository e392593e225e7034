//! Gateway WebSocket/RPC protocol definitions.
//!
//! Protocol version 3. All communication uses JSON frames over WebSocket.
//!
//! Frame types:
//! - `RequestFrame`  — client → gateway RPC call
//! - `ResponseFrame` — gateway → client RPC result
//! - `EventFrame`    — gateway → client server-push
//!
//! [`GatewayFrame`] is the discriminated-union view used when a connection's
//! read pump needs to sniff the frame kind before knowing which concrete
//! struct to construct a reply with; the flat `*Frame` structs are used when
//! the kind is already known (e.g. constructing a response).

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 3;
pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KB
pub const READ_DEADLINE_MS: u64 = 60_000; // 60s, reset on every frame
pub const PING_INTERVAL_MS: u64 = 30_000; // 30s
pub const WRITE_DEADLINE_MS: u64 = 10_000; // 10s
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5_000; // 5s
pub const RPC_ROUNDTRIP_TIMEOUT_MS: u64 = 10_000; // 10s, client-side
pub const DEDUPE_TTL_MS: u64 = 20 * 60 * 1000; // 20 min
pub const DEDUPE_MAX_ENTRIES: usize = 5_000;

// ── Error codes ──────────────────────────────────────────────────────────────

/// Stable error-code taxonomy. Implementers classify internal errors into one
/// of these by substring matching (the provider ecosystem doesn't give
/// structured codes reliably) before they ever cross the wire.
pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
    pub const FAILED_PRECONDITION: &str = "FAILED_PRECONDITION";
    pub const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const AGENT_TIMEOUT: &str = "AGENT_TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    pub fn retryable(mut self, after_ms: u64) -> Self {
        self.retryable = Some(true);
        self.retry_after_ms = Some(after_ms);
        self
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Client → gateway RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub r#type: String, // always "req"
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Gateway → client RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub r#type: String, // always "res"
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub r#type: String, // always "event"
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "stateVersion", skip_serializing_if = "Option::is_none")]
    pub state_version: Option<serde_json::Value>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            r#type: "event".into(),
            event: event.into(),
            payload: Some(payload),
            seq: Some(seq),
            state_version: None,
        }
    }
}

/// Discriminated union of all frame types, used to sniff an incoming frame's
/// kind before routing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "req")]
    Request(RequestFrameInner),
    #[serde(rename = "res")]
    Response(ResponseFrameInner),
    #[serde(rename = "event")]
    Event(EventFrameInner),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrameInner {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrameInner {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrameInner {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "stateVersion", skip_serializing_if = "Option::is_none")]
    pub state_version: Option<serde_json::Value>,
}

// ── Connect handshake ────────────────────────────────────────────────────────

/// Parameters sent by the client in the initial `connect` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "user_id", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "sender_id", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

/// Sent by the gateway after a successful (or pending-pairing) handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOk {
    pub protocol: u32,
    pub role: String,
    #[serde(rename = "user_id", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub server: ServerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// The non-authenticating response issued when a token is configured but not
/// provided and a pairing service is available (connect rule 4, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPairing {
    pub status: String, // always "pending_pairing"
    pub pairing_code: String,
    pub sender_id: String,
}

impl PendingPairing {
    pub fn new(pairing_code: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            status: "pending_pairing".into(),
            pairing_code: pairing_code.into(),
            sender_id: sender_id.into(),
        }
    }
}

// ── Roles and scopes ─────────────────────────────────────────────────────────

/// Strict hierarchy: `admin` ⊇ `operator` ⊇ `viewer` (§4.1).
pub mod roles {
    pub const ADMIN: &str = "admin";
    pub const OPERATOR: &str = "operator";
    pub const VIEWER: &str = "viewer";

    /// Role ordering: higher value implies every permission of lower roles.
    pub fn rank(role: &str) -> u8 {
        match role {
            ADMIN => 2,
            OPERATOR => 1,
            _ => 0,
        }
    }

    pub fn at_least(role: &str, required: &str) -> bool {
        rank(role) >= rank(required)
    }
}

pub mod scopes {
    pub const ADMIN: &str = "operator.admin";
    pub const READ: &str = "operator.read";
    pub const WRITE: &str = "operator.write";
    pub const APPROVALS: &str = "operator.approvals";
    pub const PAIRING: &str = "operator.pairing";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_roundtrip() {
        let f = RequestFrame {
            r#type: "req".into(),
            id: "1".into(),
            method: "health".into(),
            params: None,
        };
        let json = serde_json::to_string(&f).unwrap();
        let back: RequestFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.method, "health");
    }

    #[test]
    fn gateway_frame_sniffs_request() {
        let json = r#"{"type":"req","id":"1","method":"health"}"#;
        let frame: GatewayFrame = serde_json::from_str(json).unwrap();
        match frame {
            GatewayFrame::Request(inner) => assert_eq!(inner.method, "health"),
            _ => panic!("expected Request variant"),
        }
    }

    #[test]
    fn gateway_frame_sniffs_response_and_event() {
        let res: GatewayFrame =
            serde_json::from_str(r#"{"type":"res","id":"1","ok":true}"#).unwrap();
        assert!(matches!(res, GatewayFrame::Response(_)));

        let ev: GatewayFrame =
            serde_json::from_str(r#"{"type":"event","event":"heartbeat"}"#).unwrap();
        assert!(matches!(ev, GatewayFrame::Event(_)));
    }

    #[test]
    fn response_ok_and_err_are_exclusive() {
        let ok = ResponseFrame::ok("1", serde_json::json!({"a": 1}));
        assert!(ok.ok && ok.payload.is_some() && ok.error.is_none());

        let err = ResponseFrame::err("1", ErrorShape::new(error_codes::NOT_FOUND, "no such job"));
        assert!(!err.ok && err.payload.is_none() && err.error.is_some());
    }

    #[test]
    fn role_hierarchy() {
        assert!(roles::at_least(roles::ADMIN, roles::OPERATOR));
        assert!(roles::at_least(roles::OPERATOR, roles::VIEWER));
        assert!(!roles::at_least(roles::VIEWER, roles::OPERATOR));
    }
}
