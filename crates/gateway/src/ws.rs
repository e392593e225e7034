use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use moltis_protocol::{
    ConnectParams, ErrorShape, GatewayFrame, HANDSHAKE_TIMEOUT_MS, HelloOk, MAX_PAYLOAD_BYTES,
    OUTBOUND_QUEUE_CAPACITY, PING_INTERVAL_MS, PROTOCOL_VERSION, PendingPairing,
    READ_DEADLINE_MS, ResponseFrame, ServerInfo, WRITE_DEADLINE_MS, error_codes,
};

use crate::{
    auth::{self, ConnectOutcome},
    router,
    state::{ConnectedClient, GatewayState},
};

fn new_conn_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Handle a single WebSocket connection through its full lifecycle:
/// handshake (role derivation) → message loop → cleanup.
pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, remote_addr: SocketAddr) {
    let conn_id = new_conn_id();
    info!(conn_id = %conn_id, remote_ip = %remote_addr.ip(), "ws: new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);

    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_millis(PING_INTERVAL_MS));
        ping_interval.tick().await; // first tick fires immediately; discard
        loop {
            tokio::select! {
                msg = client_rx.recv() => {
                    let Some(text) = msg else { break };
                    let sent = tokio::time::timeout(
                        Duration::from_millis(WRITE_DEADLINE_MS),
                        ws_tx.send(Message::Text(text.into())),
                    )
                    .await;
                    if matches!(sent, Err(_) | Ok(Err(_))) {
                        debug!(conn_id = %write_conn_id, "ws: write loop closed");
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    let sent = tokio::time::timeout(
                        Duration::from_millis(WRITE_DEADLINE_MS),
                        ws_tx.send(Message::Ping(Vec::new().into())),
                    )
                    .await;
                    if matches!(sent, Err(_) | Ok(Err(_))) {
                        break;
                    }
                }
            }
        }
    });

    // ── Handshake ─────────────────────────────────────────────────────────

    let connect_result = tokio::time::timeout(
        Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
        wait_for_connect(&mut ws_rx),
    )
    .await;

    let (request_id, params) = match connect_result {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => {
            warn!(conn_id = %conn_id, error = %e, "ws: handshake failed");
            write_handle.abort();
            return;
        },
        Err(_) => {
            warn!(conn_id = %conn_id, "ws: handshake timeout");
            write_handle.abort();
            return;
        },
    };

    let outcome = auth::derive_role(&state.config, &state.pairing, &params);

    match outcome {
        ConnectOutcome::PendingPairing { pairing_code, sender_id } => {
            let pending = PendingPairing::new(pairing_code, sender_id);
            let resp = ResponseFrame::ok(&request_id, serde_json::to_value(&pending).unwrap());
            let _ = client_tx.send(serde_json::to_string(&resp).unwrap()).await;
            info!(conn_id = %conn_id, "ws: pending pairing issued");
            run_pending_loop(&conn_id, &state, &mut ws_rx, &client_tx).await;
        },
        ConnectOutcome::Authenticated { role } => {
            let hello = HelloOk {
                protocol: PROTOCOL_VERSION,
                role: role.to_string(),
                user_id: params.user_id.clone(),
                server: ServerInfo {
                    name: "moltis-gateway".into(),
                    version: state.version.clone(),
                },
            };
            let resp = ResponseFrame::ok(&request_id, serde_json::to_value(&hello).unwrap());
            let _ = client_tx.send(serde_json::to_string(&resp).unwrap()).await;

            info!(conn_id = %conn_id, role = %role, "ws: handshake complete");

            let now = std::time::Instant::now();
            let rate_limit_key = params
                .user_id
                .clone()
                .unwrap_or_else(|| conn_id.clone());
            let client = ConnectedClient {
                conn_id: conn_id.clone(),
                role: role.to_string(),
                user_id: params.user_id.clone(),
                sender: client_tx.clone(),
                connected_at: now,
                last_activity: now,
            };
            state.register_client(client).await;

            run_authenticated_loop(&conn_id, &role, &rate_limit_key, &state, &mut ws_rx, &client_tx)
                .await;

            let duration = state
                .remove_client(&conn_id)
                .await
                .map(|c| c.connected_at.elapsed())
                .unwrap_or_default();
            info!(conn_id = %conn_id, duration_secs = duration.as_secs(), "ws: connection closed");
        },
    }

    write_handle.abort();
}

/// Message loop for an authenticated connection.
async fn run_authenticated_loop(
    conn_id: &str,
    role: &str,
    rate_limit_key: &str,
    state: &Arc<GatewayState>,
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    client_tx: &mpsc::Sender<String>,
) {
    loop {
        let read = tokio::time::timeout(Duration::from_millis(READ_DEADLINE_MS), ws_rx.next()).await;
        let msg = match read {
            Ok(Some(m)) => m,
            Ok(None) => break,
            Err(_) => {
                debug!(conn_id, "ws: read deadline exceeded");
                break;
            },
        };

        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id, error = %e, "ws: read error");
                break;
            },
        };

        if text.len() > MAX_PAYLOAD_BYTES {
            warn!(conn_id, size = text.len(), "ws: payload too large");
            continue;
        }

        let frame: GatewayFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(conn_id, error = %e, "ws: invalid frame");
                continue;
            },
        };

        if let Some(client) = state.clients.write().await.get_mut(conn_id) {
            client.touch();
        }

        let GatewayFrame::Request(req) = frame else {
            debug!(conn_id, "ws: ignoring non-request frame");
            continue;
        };

        let params = req.params.unwrap_or(serde_json::Value::Null);
        let response = match router::dispatch(state, role, rate_limit_key, &req.method, params).await
        {
            Ok(payload) => ResponseFrame::ok(&req.id, payload),
            Err(err) => ResponseFrame::err(&req.id, err),
        };
        let _ = client_tx
            .send(serde_json::to_string(&response).unwrap())
            .await;
    }
}

/// Restricted loop for a connection stuck in `pending_pairing`: only
/// `browser.pairing.status` is answered, everything else is `UNAUTHORIZED`.
async fn run_pending_loop(
    conn_id: &str,
    state: &Arc<GatewayState>,
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    client_tx: &mpsc::Sender<String>,
) {
    loop {
        let read = tokio::time::timeout(Duration::from_millis(READ_DEADLINE_MS), ws_rx.next()).await;
        let msg = match read {
            Ok(Some(m)) => m,
            Ok(None) => break,
            Err(_) => break,
        };
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(_) => break,
        };

        let frame: GatewayFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let GatewayFrame::Request(req) = frame else {
            continue;
        };

        let response = if req.method == "browser.pairing.status" {
            let params = req.params.unwrap_or(serde_json::Value::Null);
            match state.services.pairing.status(params).await {
                Ok(payload) => ResponseFrame::ok(&req.id, payload),
                Err(e) => ResponseFrame::err(&req.id, e.into()),
            }
        } else {
            ResponseFrame::err(
                &req.id,
                ErrorShape::new(error_codes::UNAUTHORIZED, "not yet paired"),
            )
        };
        let _ = client_tx
            .send(serde_json::to_string(&response).unwrap())
            .await;
    }
    debug!(conn_id, "ws: pending-pairing connection closed");
}

/// Wait for the first `connect` request frame.
async fn wait_for_connect(
    rx: &mut futures::stream::SplitStream<WebSocket>,
) -> anyhow::Result<(String, ConnectParams)> {
    while let Some(msg) = rx.next().await {
        let text = match msg? {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => anyhow::bail!("connection closed before handshake"),
            _ => continue,
        };

        let frame: GatewayFrame = serde_json::from_str(&text)?;
        match frame {
            GatewayFrame::Request(req) => {
                if req.method != "connect" {
                    anyhow::bail!("first message must be 'connect', got '{}'", req.method);
                }
                let params: ConnectParams =
                    serde_json::from_value(req.params.unwrap_or(serde_json::Value::Null))?;
                return Ok((req.id, params));
            },
            _ => anyhow::bail!("first message must be a request frame"),
        }
    }
    anyhow::bail!("connection closed before handshake")
}
