//! Core message types that flow through the channel-to-agent pipeline.
//!
//! [`InboundMessage`] is what a channel adapter constructs from whatever wire
//! format it speaks. The pipeline (debounce → dedupe → pairing → pending
//! history → session-key) consumes it and produces a [`MsgContext`], which is
//! what actually reaches `get_reply`/the agent loop. [`ReplyPayload`] is the
//! result handed back to the channel adapter for delivery.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Coarse sender category for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    /// A 1:1 direct message.
    Direct,
    /// A multi-user chat.
    Group,
    /// A subthread of a group chat.
    Topic,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Topic => "topic",
        }
    }
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content a channel adapter produces for the pipeline to consume.
///
/// Immutable after construction; dropped once the pipeline has finished
/// processing it (merged into a debounce buffer, recorded into pending
/// history, or published to the inbound bus).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub account_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub chat_id: String,
    pub peer_kind: PeerKind,
    /// Non-default agent requested for this chat, if the channel binds one.
    pub agent_hint: Option<String>,
    pub body: String,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Channel-native message id, used for dedupe keys.
    pub message_id: String,
    /// True if the bot was addressed directly (mention, reply-to-bot, DM).
    #[serde(default)]
    pub addressed: bool,
    pub timestamp_ms: u64,
}

impl InboundMessage {
    /// True if this message carries no text (a pure-media message bypasses
    /// debounce buffering per the pipeline's stage 3 rule).
    pub fn is_media_only(&self) -> bool {
        self.body.trim().is_empty() && !self.media.is_empty()
    }
}

/// Context handed to the reply-producing entry point after the pipeline has
/// resolved pairing, dedupe, debounce, and the session key for a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgContext {
    pub channel: String,
    pub account_id: String,
    pub from: String,
    pub sender_name: Option<String>,
    pub chat_type: PeerKind,
    /// Destination for the reply: the group/DM chat id, distinct from
    /// `from` (the sender) for group messages.
    pub chat_id: String,
    pub session_key: String,
    pub body: String,
    #[serde(default)]
    pub media: Vec<String>,
    pub reply_to_id: Option<String>,
}

/// Content produced for delivery back to a channel adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub silent: bool,
}

/// Produced by the agent loop / RPC `send`; consumed by a channel adapter's
/// `SendMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub reply_to_id: Option<String>,
    pub stream_session_id: Option<String>,
}
