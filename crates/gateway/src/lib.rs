//! Gateway: the WebSocket RPC server, method router, and channel-to-agent
//! pipeline that ties the protocol, agent, session, channel, and cron crates
//! together into one running process.
//!
//! Lifecycle:
//! 1. Load + validate config (`moltis-config`)
//! 2. Construct the domain `Services` bundle (agents, sessions, channels, cron, ...)
//! 3. Build `GatewayState` (clients, dedupe cache, pairing store, rate limiter)
//! 4. Bind the HTTP listener and serve `/ws`
//! 5. Start the cron scheduler and channel adapters

pub mod auth;
pub mod broadcast;
pub mod bus;
pub mod channel;
pub mod chat;
pub mod cron;
pub mod pairing;
pub mod rate_limiter;
pub mod router;
pub mod server;
pub mod session;
pub mod state;
pub mod ws;
