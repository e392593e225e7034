//! Channel-to-agent pipeline (§4.8): pairing gate → dedup → debounce →
//! pending-history → session-key construction, then handoff to the agent
//! turn and reply delivery.
//!
//! Debounce buckets are flushed by a spawned task per arrival, guarded by a
//! per-key epoch so that only the task scheduled by the *last* arrival in a
//! burst actually performs the flush; earlier tasks see a stale epoch and
//! exit without doing anything.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    serde_json::Value,
    tokio::sync::{Mutex, RwLock},
    tracing::warn,
};

use {
    moltis_auto_reply::{
        chunk::{self, DEFAULT_MAX_CHUNK_LEN},
        queue::{self, DEFAULT_PACING},
        reply::{AutoReplyContext, get_reply},
    },
    moltis_channels::{
        ChannelOutbound, ChannelPlugin, gating, registry::ChannelRegistry, store::ChannelStore,
    },
    moltis_common::types::{InboundMessage, MsgContext, PeerKind},
    moltis_service_traits::{ChannelService, ServiceResult},
};

use crate::{
    bus::{MessageBus, OutboundDelivery},
    state::GatewayState,
};

/// How long a repeated pairing prompt to the same sender is suppressed.
const PAIRING_PROMPT_DEBOUNCE: Duration = Duration::from_secs(60);

fn field<'a>(params: &'a Value, name: &str) -> ServiceResult<&'a str> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing '{name}'").into())
}

// ── Pending-history buffer (stage 4) ─────────────────────────────────────────

#[derive(Debug, Clone)]
struct PendingEntry {
    sender: String,
    body: String,
    timestamp_ms: u64,
    message_id: String,
}

struct PendingHistory {
    groups: HashMap<String, VecDeque<PendingEntry>>,
    limit: usize,
}

impl PendingHistory {
    fn new(limit: usize) -> Self {
        Self {
            groups: HashMap::new(),
            limit,
        }
    }

    fn record(&mut self, key: &str, entry: PendingEntry) {
        let buf = self.groups.entry(key.to_string()).or_default();
        buf.push_back(entry);
        while buf.len() > self.limit.max(1) {
            buf.pop_front();
        }
    }

    fn take(&mut self, key: &str) -> Vec<PendingEntry> {
        self.groups.remove(key).map(Into::into).unwrap_or_default()
    }
}

fn format_history_prefix(entries: &[PendingEntry], body: &str) -> String {
    let joined = entries
        .iter()
        .map(|e| format!("{}: {}", e.sender, e.body))
        .collect::<Vec<_>>()
        .join("\n");
    format!("[Chat messages since your last reply - for context]\n{joined}\n\n[Your current message]\n{body}")
}

// ── Debounce buffer (stage 3) ────────────────────────────────────────────────

struct DebounceBucket {
    messages: Vec<InboundMessage>,
    epoch: u64,
}

#[derive(Default)]
struct DebounceState {
    buckets: HashMap<String, DebounceBucket>,
}

/// Join buffered bodies by newline, concatenate media, take every other
/// field from the last message in the burst.
fn merge_messages(mut messages: Vec<InboundMessage>) -> InboundMessage {
    let mut last = messages.pop().expect("merge_messages called with no messages");
    if !messages.is_empty() {
        let mut body = messages
            .iter()
            .map(|m| m.body.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        body.push('\n');
        body.push_str(&last.body);
        let mut media: Vec<String> = messages.into_iter().flat_map(|m| m.media).collect();
        media.extend(last.media.drain(..));
        last.body = body;
        last.media = media;
    }
    last
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Drives a single inbound message through the full pipeline and, once it
/// resolves to an agent turn, delivers the reply via the originating
/// channel's outbound adapter.
pub struct ChannelPipeline {
    state: Arc<GatewayState>,
    registry: Arc<RwLock<ChannelRegistry>>,
    store: Arc<dyn ChannelStore>,
    auto_reply: Arc<AutoReplyContext>,
    pending_history: Mutex<PendingHistory>,
    debounce: Mutex<DebounceState>,
    pairing_prompts: Mutex<HashMap<String, Instant>>,
    bus: Arc<MessageBus>,
}

enum PolicyDecision {
    Allow,
    OfferPairing,
    Drop,
}

impl ChannelPipeline {
    pub fn new(
        state: Arc<GatewayState>,
        registry: Arc<RwLock<ChannelRegistry>>,
        store: Arc<dyn ChannelStore>,
        auto_reply: Arc<AutoReplyContext>,
    ) -> Arc<Self> {
        let limit = state.config.pending_history_limit;
        let this = Arc::new(Self {
            state,
            registry,
            store,
            auto_reply,
            pending_history: Mutex::new(PendingHistory::new(limit)),
            debounce: Mutex::new(DebounceState::default()),
            pairing_prompts: Mutex::new(HashMap::new()),
            bus: Arc::new(MessageBus::new()),
        });
        tokio::spawn(Arc::clone(&this).run_inbound_consumer());
        tokio::spawn(Arc::clone(&this).run_outbound_consumer());
        this
    }

    /// Drains the inbound queue: one agent turn per resolved message,
    /// published onward to the outbound queue. Runs for the lifetime of
    /// the pipeline.
    async fn run_inbound_consumer(self: Arc<Self>) {
        while let Some(ctx) = self.bus.consume_inbound().await {
            let reply = match get_reply(&self.auto_reply, &ctx).await {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(error = %err, channel = %ctx.channel, chat_id = %ctx.chat_id, "agent turn failed");
                    continue;
                },
            };
            if reply.silent || reply.text.is_empty() {
                continue;
            }
            let item = OutboundDelivery {
                channel: ctx.channel.clone(),
                account_id: ctx.account_id.clone(),
                chat_id: ctx.chat_id.clone(),
                reply,
            };
            if self.bus.publish_outbound(item).await.is_err() {
                warn!("outbound queue closed, dropping reply");
                return;
            }
        }
    }

    /// Drains the outbound queue: chunk and deliver each reply through the
    /// originating channel's outbound adapter. Runs for the lifetime of
    /// the pipeline.
    async fn run_outbound_consumer(self: Arc<Self>) {
        while let Some(item) = self.bus.consume_outbound().await {
            let registry = self.registry.read().await;
            let Some(outbound) = registry.get(&item.channel).and_then(|p| p.outbound()) else {
                warn!(channel = %item.channel, "no outbound adapter registered for channel");
                continue;
            };
            let chunks = chunk::chunk_text(&item.reply.text, DEFAULT_MAX_CHUNK_LEN);
            if let Err(err) =
                queue::deliver_chunks(outbound, &item.account_id, &item.chat_id, &chunks, DEFAULT_PACING).await
            {
                warn!(error = %err, channel = %item.channel, chat_id = %item.chat_id, "failed to deliver reply");
            }
        }
    }

    /// Entry point for a channel adapter: runs the message through every
    /// pipeline stage, buffering or dropping it as the stage dictates.
    pub async fn handle_inbound(self: &Arc<Self>, msg: InboundMessage) {
        if self.gate_pairing(&msg).await {
            return;
        }

        let dedupe_key = format!("{}:{}:{}", msg.channel, msg.chat_id, msg.message_id);
        if self.state.dedupe.write().await.check_and_insert(&dedupe_key) {
            return;
        }

        let debounce_key = format!("{}:{}:{}", msg.channel, msg.chat_id, msg.sender_id);
        if msg.is_media_only() {
            self.flush_debounce(&debounce_key).await;
            self.process_merged(vec![msg]).await;
            return;
        }

        self.buffer_and_schedule(debounce_key, msg).await;
    }

    async fn gate_pairing(self: &Arc<Self>, msg: &InboundMessage) -> bool {
        if self.state.pairing.is_paired(&msg.sender_id, &msg.channel) {
            return false;
        }

        let stored = self.store.get(&msg.channel, &msg.account_id).await.ok().flatten();
        let decision = match &stored {
            Some(stored) => evaluate_policy(&stored.config, msg),
            None => PolicyDecision::Allow,
        };

        match decision {
            PolicyDecision::Allow => false,
            PolicyDecision::Drop => true,
            PolicyDecision::OfferPairing => {
                let pending =
                    self.state
                        .pairing
                        .request(&msg.sender_id, &msg.channel, &msg.chat_id, &msg.account_id);
                self.maybe_send_pairing_prompt(msg, &pending.code).await;
                true
            },
        }
    }

    async fn maybe_send_pairing_prompt(self: &Arc<Self>, msg: &InboundMessage, code: &str) {
        let key = format!("{}:{}", msg.channel, msg.sender_id);
        {
            let mut prompts = self.pairing_prompts.lock().await;
            if let Some(last) = prompts.get(&key)
                && last.elapsed() < PAIRING_PROMPT_DEBOUNCE
            {
                return;
            }
            prompts.insert(key, Instant::now());
        }

        let registry = self.registry.read().await;
        let Some(outbound) = registry.get(&msg.channel).and_then(|p| p.outbound()) else {
            return;
        };
        let text = format!(
            "You're not yet authorized to use this bot. Ask an operator to approve pairing code {code}."
        );
        if let Err(err) = outbound.send_text(&msg.account_id, &msg.chat_id, &text).await {
            warn!(error = %err, channel = %msg.channel, "failed to send pairing prompt");
        }
    }

    async fn buffer_and_schedule(self: &Arc<Self>, key: String, msg: InboundMessage) {
        let window = self.state.config.debounce_window_for(&msg.channel);
        let epoch = {
            let mut debounce = self.debounce.lock().await;
            let bucket = debounce
                .buckets
                .entry(key.clone())
                .or_insert_with(|| DebounceBucket {
                    messages: Vec::new(),
                    epoch: 0,
                });
            bucket.messages.push(msg);
            bucket.epoch += 1;
            bucket.epoch
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            this.fire_debounce(&key, epoch).await;
        });
    }

    async fn fire_debounce(self: &Arc<Self>, key: &str, epoch: u64) {
        let messages = {
            let mut debounce = self.debounce.lock().await;
            match debounce.buckets.get(key) {
                Some(bucket) if bucket.epoch == epoch => {
                    debounce.buckets.remove(key).map(|b| b.messages).unwrap_or_default()
                },
                // A newer arrival reset the epoch; its own task owns the flush.
                _ => return,
            }
        };
        if !messages.is_empty() {
            self.process_merged(messages).await;
        }
    }

    async fn flush_debounce(self: &Arc<Self>, key: &str) {
        let messages = {
            let mut debounce = self.debounce.lock().await;
            debounce.buckets.remove(key).map(|b| b.messages).unwrap_or_default()
        };
        if !messages.is_empty() {
            self.process_merged(messages).await;
        }
    }

    async fn process_merged(self: &Arc<Self>, messages: Vec<InboundMessage>) {
        let msg = merge_messages(messages);
        let group_key = format!("{}:{}", msg.channel, msg.chat_id);

        if !msg.addressed {
            if matches!(msg.peer_kind, PeerKind::Group | PeerKind::Topic) {
                self.pending_history.lock().await.record(&group_key, PendingEntry {
                    sender: msg.sender_name.clone().unwrap_or_else(|| msg.sender_id.clone()),
                    body: msg.body.clone(),
                    timestamp_ms: msg.timestamp_ms,
                    message_id: msg.message_id.clone(),
                });
            }
            return;
        }

        let pending = self.pending_history.lock().await.take(&group_key);
        let body = if pending.is_empty() {
            msg.body.clone()
        } else {
            format_history_prefix(&pending, &msg.body)
        };

        let ctx = MsgContext {
            channel: msg.channel.clone(),
            account_id: msg.account_id.clone(),
            from: msg.sender_id.clone(),
            sender_name: msg.sender_name.clone(),
            chat_type: msg.peer_kind,
            chat_id: msg.chat_id.clone(),
            session_key: String::new(),
            body,
            media: msg.media.clone(),
            reply_to_id: None,
        };

        // Session-key construction is done; hand off to the inbound queue
        // (§4.8 step 5) rather than running the agent turn in-process.
        // Blocks if the queue is full — that's the backpressure signal.
        if self.bus.publish_inbound(ctx).await.is_err() {
            warn!(channel = %msg.channel, chat_id = %msg.chat_id, "inbound queue closed, dropping message");
        }
    }
}

/// Read `dm_policy`/`group_policy` (plus the matching allowlist) out of a
/// stored channel account's opaque config blob.
fn evaluate_policy(config: &Value, msg: &InboundMessage) -> PolicyDecision {
    let is_direct = matches!(msg.peer_kind, PeerKind::Direct);
    let (policy_field, allowlist_field, default_policy) = if is_direct {
        ("dm_policy", "allowlist", "allowlist")
    } else {
        ("group_policy", "group_allowlist", "open")
    };

    let policy = config
        .get(policy_field)
        .and_then(|v| v.as_str())
        .unwrap_or(default_policy);

    match policy {
        "disabled" => PolicyDecision::Drop,
        "open" => PolicyDecision::Allow,
        _ => {
            let allowlist: Vec<String> = config
                .get(allowlist_field)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            if gating::is_allowed(&msg.sender_id, &allowlist) {
                PolicyDecision::Allow
            } else {
                PolicyDecision::OfferPairing
            }
        },
    }
}

// ── ChannelService RPC adapter ───────────────────────────────────────────────

/// Backs `channels.list/status/send`, operating generically against
/// whichever [`ChannelPlugin`]s are registered — no concrete channel types.
pub struct LiveChannelService {
    registry: Arc<RwLock<ChannelRegistry>>,
    store: Arc<dyn ChannelStore>,
}

impl LiveChannelService {
    pub fn new(registry: Arc<RwLock<ChannelRegistry>>, store: Arc<dyn ChannelStore>) -> Self {
        Self { registry, store }
    }
}

#[async_trait]
impl ChannelService for LiveChannelService {
    async fn list(&self) -> ServiceResult {
        let stored = self.store.list().await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!(
            stored
                .iter()
                .map(|c| serde_json::json!({
                    "channelType": c.channel_type,
                    "accountId": c.account_id,
                    "createdAt": c.created_at,
                    "updatedAt": c.updated_at,
                }))
                .collect::<Vec<_>>()
        ))
    }

    async fn status(&self) -> ServiceResult {
        let stored = self.store.list().await.map_err(|e| e.to_string())?;
        let registry = self.registry.read().await;
        let mut channels = Vec::with_capacity(stored.len());

        for c in &stored {
            let entry = match registry.get(&c.channel_type).and_then(|p| p.status()) {
                Some(status) => match status.probe(&c.account_id).await {
                    Ok(snap) => serde_json::json!({
                        "channelType": c.channel_type,
                        "accountId": c.account_id,
                        "connected": snap.connected,
                        "details": snap.details,
                    }),
                    Err(e) => serde_json::json!({
                        "channelType": c.channel_type,
                        "accountId": c.account_id,
                        "connected": false,
                        "details": e.to_string(),
                    }),
                },
                None => serde_json::json!({
                    "channelType": c.channel_type,
                    "accountId": c.account_id,
                    "connected": false,
                    "details": "channel plugin not registered",
                }),
            };
            channels.push(entry);
        }

        Ok(serde_json::json!({ "channels": channels }))
    }

    async fn send(&self, params: Value) -> ServiceResult {
        let channel = field(&params, "channel")?;
        let to = field(&params, "to")?;
        let message = field(&params, "message")?;
        let account_id = params.get("accountId").and_then(|v| v.as_str()).unwrap_or(channel);

        let registry = self.registry.read().await;
        let plugin = registry
            .get(channel)
            .ok_or_else(|| format!("unknown channel '{channel}'"))?;
        let outbound = plugin
            .outbound()
            .ok_or_else(|| format!("channel '{channel}' has no outbound adapter"))?;
        outbound
            .send_text(account_id, to, message)
            .await
            .map_err(|e| e.to_string())?;

        Ok(serde_json::json!({ "sent": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(body: &str, addressed: bool) -> InboundMessage {
        InboundMessage {
            channel: "telegram".into(),
            account_id: "acct".into(),
            sender_id: "u1".into(),
            sender_name: Some("Alice".into()),
            chat_id: "chat1".into(),
            peer_kind: PeerKind::Group,
            agent_hint: None,
            body: body.into(),
            media: Vec::new(),
            metadata: HashMap::new(),
            message_id: format!("m-{body}"),
            addressed,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn merge_joins_bodies_and_keeps_last_fields() {
        let mut b = msg("b", true);
        b.sender_name = Some("Bob".into());
        let merged = merge_messages(vec![msg("a", false), b]);
        assert_eq!(merged.body, "a\nb");
        assert_eq!(merged.sender_name.as_deref(), Some("Bob"));
    }

    #[test]
    fn pending_history_caps_at_limit() {
        let mut history = PendingHistory::new(2);
        for i in 0..5 {
            history.record("g1", PendingEntry {
                sender: "a".into(),
                body: format!("msg{i}"),
                timestamp_ms: 0,
                message_id: i.to_string(),
            });
        }
        let entries = history.take("g1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].body, "msg3");
        assert_eq!(entries[1].body, "msg4");
    }

    #[test]
    fn history_prefix_formats_context_block() {
        let entries = vec![PendingEntry {
            sender: "Alice".into(),
            body: "hi".into(),
            timestamp_ms: 0,
            message_id: "1".into(),
        }];
        let text = format_history_prefix(&entries, "status?");
        assert!(text.starts_with("[Chat messages since your last reply - for context]"));
        assert!(text.contains("Alice: hi"));
        assert!(text.ends_with("[Your current message]\nstatus?"));
    }

    #[test]
    fn open_policy_allows_unconditionally() {
        let config = serde_json::json!({ "dm_policy": "open" });
        let decision = evaluate_policy(&config, &msg("hi", true));
        assert!(matches!(decision, PolicyDecision::Allow));
    }

    #[test]
    fn disabled_policy_drops() {
        let config = serde_json::json!({ "group_policy": "disabled" });
        let mut m = msg("hi", true);
        m.peer_kind = PeerKind::Group;
        let decision = evaluate_policy(&config, &m);
        assert!(matches!(decision, PolicyDecision::Drop));
    }

    #[test]
    fn allowlist_policy_offers_pairing_when_not_listed() {
        let config = serde_json::json!({ "dm_policy": "allowlist", "allowlist": ["someone_else"] });
        let mut m = msg("hi", true);
        m.peer_kind = PeerKind::Direct;
        let decision = evaluate_policy(&config, &m);
        assert!(matches!(decision, PolicyDecision::OfferPairing));
    }
}
