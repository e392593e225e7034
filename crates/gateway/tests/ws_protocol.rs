//! Wire-level integration tests: a real `/ws` connection through `build_app`,
//! asserting literal request/response payloads rather than individual
//! module units.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use moltis_agents::{
    model::{CompletionResponse, LlmProvider, StreamEvent, Usage},
    providers::{ModelInfo, ProviderRegistry},
    tool_registry::ToolRegistry,
};
use moltis_config::schema::{AgentSpec, GatewayConfig};
use moltis_gateway::{
    chat::{AgentRouter, LiveChatService},
    server::build_app,
    session::LiveSessionService,
    state::GatewayState,
};
use moltis_service_traits::Services;
use moltis_sessions::store::SessionStore;

/// A single-turn mock provider recording how many times it was called.
struct MockProvider {
    text: String,
    calls: Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn id(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, _messages: &[Value], _tools: &[Value]) -> anyhow::Result<CompletionResponse> {
        unreachable!("streaming path only")
    }

    fn stream(
        &self,
        _messages: Vec<Value>,
    ) -> std::pin::Pin<Box<dyn tokio_stream::Stream<Item = StreamEvent> + Send + '_>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let events = vec![
            StreamEvent::Delta(self.text.clone()),
            StreamEvent::Done(Usage {
                input_tokens: 7,
                output_tokens: 3,
            }),
        ];
        Box::pin(tokio_stream::iter(events))
    }
}

/// Boots a gateway with a single mock-backed agent named `"default"` and
/// returns the bound address plus the call counter the mock increments.
async fn start_test_server(config: GatewayConfig) -> (SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let mut providers = ProviderRegistry::from_env();
    providers.register(
        ModelInfo {
            id: "mock-model".into(),
            provider: "mock".into(),
            display_name: "Mock".into(),
        },
        Arc::new(MockProvider {
            text: "hello from the mock".into(),
            calls: Arc::clone(&calls),
        }),
    );
    let providers = Arc::new(providers);

    let tmp = tempfile::tempdir().expect("tempdir");
    let sessions = Arc::new(SessionStore::new(tmp.path().to_path_buf()));
    let tools = Arc::new(ToolRegistry::new());
    let config = Arc::new(config);

    let state = GatewayState::new_cyclic(Arc::clone(&config), |weak| {
        let router = AgentRouter::new(weak.clone(), Arc::clone(&config), Arc::clone(&sessions), Arc::clone(&providers), Arc::clone(&tools));
        Services {
            session: Arc::new(LiveSessionService::new(Arc::clone(&sessions))),
            chat: Arc::new(LiveChatService::new(router, Arc::clone(&sessions))),
            ..Services::default()
        }
    });

    let app = build_app(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .expect("serve");
    });

    (addr, calls)
}

fn agent_config(token: Option<&str>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.connect_token = token.map(str::to_string);
    config.agents.insert(
        "default".into(),
        AgentSpec {
            id: "default".into(),
            model: "mock-model".into(),
            ..AgentSpec::default()
        },
    );
    config
}

#[tokio::test]
async fn connect_with_matching_token_yields_admin_hello() {
    let (addr, _calls) = start_test_server(agent_config(Some("abc"))).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.expect("connect");
    ws.send(Message::Text(
        json!({
            "type": "req",
            "id": "1",
            "method": "connect",
            "params": { "token": "abc", "user_id": "u1" },
        })
        .to_string()
        .into(),
    ))
    .await
    .expect("send connect");

    let msg = ws.next().await.expect("frame").expect("ws ok");
    let frame: Value = serde_json::from_str(msg.to_text().expect("text frame")).expect("valid json");

    assert_eq!(frame["type"], "res");
    assert_eq!(frame["id"], "1");
    assert_eq!(frame["ok"], true);
    assert_eq!(frame["payload"]["protocol"], 3);
    assert_eq!(frame["payload"]["role"], "admin");
    assert_eq!(frame["payload"]["user_id"], "u1");
    assert_eq!(frame["payload"]["server"]["name"], "moltis-gateway");
    assert!(frame["payload"]["server"]["version"].is_string());
}

#[tokio::test]
async fn chat_send_awaits_final_content_from_a_single_run() {
    let (addr, calls) = start_test_server(agent_config(None)).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.expect("connect");
    ws.send(Message::Text(
        json!({
            "type": "req",
            "id": "1",
            "method": "connect",
            "params": { "user_id": "u1" },
        })
        .to_string()
        .into(),
    ))
    .await
    .expect("send connect");
    let hello = ws.next().await.expect("frame").expect("ws ok");
    let hello: Value = serde_json::from_str(hello.to_text().expect("text frame")).expect("valid json");
    assert_eq!(hello["payload"]["role"], "operator");

    ws.send(Message::Text(
        json!({
            "type": "req",
            "id": "2",
            "method": "chat.send",
            "params": { "message": "hi", "agentId": "default" },
        })
        .to_string()
        .into(),
    ))
    .await
    .expect("send chat.send");

    let reply = ws.next().await.expect("frame").expect("ws ok");
    let reply: Value = serde_json::from_str(reply.to_text().expect("text frame")).expect("valid json");

    assert_eq!(reply["type"], "res");
    assert_eq!(reply["id"], "2");
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["payload"]["text"], "hello from the mock");
    assert_eq!(reply["payload"]["toolCallsMade"], 0);
    assert_eq!(reply["payload"]["usage"]["inputTokens"], 7);
    assert_eq!(reply["payload"]["usage"]["outputTokens"], 3);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}
