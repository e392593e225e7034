//! Channel plugin system.
//!
//! Each channel (Telegram, Discord, Slack, WhatsApp, etc.) implements the
//! ChannelPlugin trait with sub-traits for config, auth, inbound/outbound
//! messaging, status, and gateway lifecycle.

pub mod gating;
pub mod message_log;
pub mod plugin;
pub mod registry;
pub mod store;
pub mod store_file;

pub use plugin::{
    ChannelEvent, ChannelEventSink, ChannelHealthSnapshot, ChannelMessageMeta, ChannelOutbound,
    ChannelPlugin, ChannelReplyTarget, ChannelStatus, ChannelStreamOutbound, StreamEvent,
    StreamReceiver, StreamSender,
};

pub type Result<T> = anyhow::Result<T>;
