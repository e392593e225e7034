//! Session storage and management.
//!
//! A session is a transcript identified by a [`key::SessionKey`]
//! (`agentId:channel:peerKind:chatTag`). Transcripts are stored as JSONL
//! files (one message per line) under a per-agent base directory, with file
//! locking for concurrent append access; [`metadata`] keeps a small JSON
//! index alongside for fast `sessions.list` without reading every
//! transcript.

pub mod error;
pub mod key;
pub mod message;
pub mod metadata;
pub mod store;

pub use {error::Error, key::SessionKey, store::{SearchResult, SessionStore}};
