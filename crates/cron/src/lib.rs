//! Scheduled agent runs with cron expressions.
//! Persistent storage at `<data_dir>/cron/jobs.json`.
//! Isolated agent execution (no session), optional delivery to a channel.

pub mod error;
pub mod heartbeat;
pub mod parse;
pub mod schedule;
pub mod service;
pub mod store;
pub mod store_file;
pub mod store_memory;
pub mod system_events;
pub mod types;

pub use error::{Error, Result};
