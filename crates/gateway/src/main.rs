//! Process entry point. No CLI subcommand framework: load config, wire the
//! domain services, start the cron scheduler, and serve `/ws` until
//! signaled to stop.

use std::sync::Arc;

use {
    moltis_agents::{providers::ProviderRegistry, tool_registry::ToolRegistry},
    moltis_auto_reply::reply::AutoReplyContext,
    moltis_channels::{
        ChannelOutbound, ChannelPlugin, registry::ChannelRegistry, store::ChannelStore,
        store_file::FileStore as ChannelFileStore,
    },
    moltis_cron::{
        heartbeat::resolve_heartbeat_prompt,
        service::{AgentTurnRequest, AgentTurnResult, CronService},
        store_file::FileStore as CronFileStore,
        types::{CronJobCreate, CronPayload, CronSchedule, SessionTarget},
    },
    moltis_gateway::{
        channel::{ChannelPipeline, LiveChannelService},
        chat::{AgentRouter, LiveChatService},
        cron::{HEARTBEAT_JOB_ID, LiveCronService, LiveSystemInfoService},
        pairing::{LivePairingService, PendingCode},
        server,
        session::LiveSessionService,
        state::GatewayState,
    },
    moltis_sessions::store::SessionStore,
    moltis_service_traits::Services,
    tokio::sync::RwLock,
    tracing::info,
};

fn session_key_for(agent_id: &str, target: &SessionTarget, job_id: &str) -> String {
    match target {
        SessionTarget::Main => format!("{agent_id}:ui:direct:default"),
        SessionTarget::Isolated => format!("{agent_id}:cron:job:{job_id}"),
        SessionTarget::Named(name) => format!("{agent_id}:cron:named:{name}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = Arc::new(moltis_config::discover_and_load());
    info!(bind_address = %config.bind_address, "starting gateway");

    let sessions = Arc::new(SessionStore::new(moltis_config::data_dir().join("sessions")));
    let providers = Arc::new(ProviderRegistry::from_env_with_config(&config.providers));
    let tools = Arc::new(ToolRegistry::new());

    let channel_store: Arc<dyn ChannelStore> =
        Arc::new(ChannelFileStore::new(moltis_config::data_dir().join("channels").join("channels.json")));
    let channel_registry = Arc::new(RwLock::new(ChannelRegistry::new()));

    let auto_reply = Arc::new(AutoReplyContext {
        config: Arc::clone(&config),
        sessions: Arc::clone(&sessions),
        providers: Arc::clone(&providers),
        tools: Arc::clone(&tools),
    });

    let cron_store = Arc::new(CronFileStore::default_path()?);

    let system_event_sessions = Arc::clone(&sessions);
    let on_system_event = Arc::new(move |text: String| {
        let sessions = Arc::clone(&system_event_sessions);
        tokio::spawn(async move {
            let message = moltis_sessions::message::PersistedMessage::system(text).to_value();
            if let Err(err) = sessions.append("main:ui:direct:default", &message).await {
                tracing::warn!(error = %err, "failed to persist cron system event");
            }
        });
    });

    let agent_turn_config = Arc::clone(&config);
    let agent_turn_providers = Arc::clone(&providers);
    let agent_turn_tools = Arc::clone(&tools);
    let agent_turn_sessions = Arc::clone(&sessions);
    let on_agent_turn = Arc::new(move |req: AgentTurnRequest| {
        let config = Arc::clone(&agent_turn_config);
        let providers = Arc::clone(&agent_turn_providers);
        let tools = Arc::clone(&agent_turn_tools);
        let sessions = Arc::clone(&agent_turn_sessions);
        Box::pin(async move {
            let agent_id = "main";
            let agent_spec = config.agents.get(agent_id).cloned().unwrap_or_default();
            let model = req.model.unwrap_or(agent_spec.model.clone());
            let provider = providers
                .get(&model)
                .ok_or_else(|| anyhow::anyhow!("no provider available for model '{model}'"))?;

            let session_key = session_key_for(agent_id, &req.session_target, "heartbeat");
            let history = sessions.read(&session_key).await.unwrap_or_default();
            let system_prompt = moltis_agents::prompt::build_system_prompt(
                &tools,
                provider.supports_tools(),
                Some(&config.identity),
                Some(&config.user),
                None,
                None,
            );

            let run = moltis_agents::runner::run_agent_loop_with_context(
                provider,
                &tools,
                &system_prompt,
                &req.message,
                None,
                Some(history),
                None,
            )
            .await?;

            Ok(AgentTurnResult {
                output: run.text,
                input_tokens: Some(run.usage.input_tokens as u64),
                output_tokens: Some(run.usage.output_tokens as u64),
            })
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<AgentTurnResult>> + Send>>
    });

    let cron = CronService::new(cron_store, on_system_event, on_agent_turn);
    cron.start().await?;

    if config.heartbeat.interval_secs > 0 && !cron.list().await.iter().any(|j| j.id == HEARTBEAT_JOB_ID) {
        let (prompt, _source) = resolve_heartbeat_prompt(None, None);
        cron.add(CronJobCreate {
            id: Some(HEARTBEAT_JOB_ID.to_string()),
            name: "heartbeat".into(),
            schedule: CronSchedule::Every { every_ms: config.heartbeat.interval_secs * 1000, anchor_ms: None },
            payload: CronPayload::AgentTurn {
                message: prompt,
                model: None,
                timeout_secs: None,
                deliver: false,
                channel: None,
                to: None,
            },
            session_target: SessionTarget::Main,
            delete_after_run: false,
            enabled: true,
            system: true,
            sandbox: Default::default(),
        })
        .await?;
    }

    // `AgentRouter` and `LivePairingService` both need to broadcast/read
    // through the very `GatewayState` their `Services` bundle is part of, so
    // the state is built with `new_cyclic`: the closure gets a `Weak` back
    // reference instead of a true ownership cycle.
    let hostname = hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_else(|| "unknown".into());
    let state = GatewayState::new_cyclic(Arc::clone(&config), |weak| {
        let router = AgentRouter::new(weak.clone(), Arc::clone(&config), Arc::clone(&sessions), Arc::clone(&providers), Arc::clone(&tools));
        let client_count_weak = weak.clone();
        Services {
            session: Arc::new(LiveSessionService::new(Arc::clone(&sessions))),
            channel: Arc::new(LiveChannelService::new(Arc::clone(&channel_registry), Arc::clone(&channel_store))),
            chat: Arc::new(LiveChatService::new(router, Arc::clone(&sessions))),
            cron: Arc::new(LiveCronService::new(Arc::clone(&cron))),
            pairing: Arc::new(LivePairingService::new(weak.clone())),
            system_info: Arc::new(LiveSystemInfoService::new(
                Arc::clone(&cron),
                hostname,
                env!("CARGO_PKG_VERSION").to_string(),
                Arc::new(move || client_count_weak.upgrade().map(|s| s.client_count_sync()).unwrap_or(0)),
            )),
            ..Services::default()
        }
    });

    let _pipeline = ChannelPipeline::new(Arc::clone(&state), Arc::clone(&channel_registry), Arc::clone(&channel_store), auto_reply);

    // §4.4: idle rate-limiter buckets are garbage-collected every 5 minutes.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(5 * 60));
            loop {
                tick.tick().await;
                state.rate_limiter.gc();
            }
        });
    }

    // §4.9: approving a pairing code notifies the originating channel.
    {
        let channel_registry = Arc::clone(&channel_registry);
        state.pairing.set_on_approve(Arc::new(move |pending: PendingCode, approved_by: String| {
            let channel_registry = Arc::clone(&channel_registry);
            tokio::spawn(async move {
                let registry = channel_registry.read().await;
                let Some(outbound) = registry.get(&pending.channel).and_then(|p| p.outbound()) else {
                    return;
                };
                let text = format!("You've been approved by {approved_by}. You can now chat here.");
                if let Err(err) = outbound.send_text(&pending.account_id, &pending.chat_id, &text).await {
                    tracing::warn!(error = %err, channel = %pending.channel, "failed to send pairing confirmation");
                }
            });
        }));
    }

    server::start_gateway(state).await
}
