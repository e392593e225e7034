use std::sync::Arc;

use moltis_protocol::EventFrame;
use tracing::{debug, warn};

use crate::state::GatewayState;

/// Minimum role required to receive a given event; unlisted events go to
/// every connected client regardless of role.
fn min_role_for(event: &str) -> &'static str {
    match event {
        "exec.approval.requested" | "exec.approval.resolved" => moltis_protocol::roles::OPERATOR,
        "pairing.requested" | "pairing.resolved" => moltis_protocol::roles::OPERATOR,
        _ => moltis_protocol::roles::VIEWER,
    }
}

#[derive(Default)]
pub struct BroadcastOpts {
    pub state_version: Option<serde_json::Value>,
}

/// Broadcast an event to every connected client holding the event's minimum
/// required role.
pub async fn broadcast(
    state: &Arc<GatewayState>,
    event: &str,
    payload: serde_json::Value,
    opts: BroadcastOpts,
) {
    let seq = state.next_seq();
    let mut frame = EventFrame::new(event, payload, seq);
    frame.state_version = opts.state_version;

    let json = match serde_json::to_string(&frame) {
        Ok(j) => j,
        Err(e) => {
            warn!("failed to serialize broadcast event: {e}");
            return;
        },
    };

    let min_role = min_role_for(event);
    debug!(
        event,
        seq,
        clients = state.client_count().await,
        "broadcasting event"
    );
    state.broadcast(&json, min_role).await;
}
