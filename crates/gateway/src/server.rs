//! HTTP/WebSocket listener. The gateway exposes exactly one URL, `/ws`; all
//! RPC and event traffic rides the WebSocket connection established there.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{ConnectInfo, State, ws::WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tracing::info;

use crate::{state::GatewayState, ws};

pub fn build_app(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade_handler))
        .with_state(state)
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_connection(socket, state, remote_addr))
}

/// Bind and serve until the process is signaled to stop.
pub async fn start_gateway(state: Arc<GatewayState>) -> anyhow::Result<()> {
    let bind_address = state.config.bind_address.clone();
    let app = build_app(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn app_builds_with_default_state() {
        let config = Arc::new(moltis_config::schema::GatewayConfig::default());
        let state = GatewayState::new(config, moltis_service_traits::Services::default());
        let _app = build_app(state);
    }
}
