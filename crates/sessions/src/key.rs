//! Opaque session identifiers.
//!
//! Construction is the only contract: a [`SessionKey`] is
//! `agentId:channel:peerKind:chatTag`. Callers never parse the parts back out
//! to make routing decisions — the components are folded in at construction
//! time and the result is treated as an opaque string everywhere else.

use std::fmt;

/// `agentId:channel:peerKind:chatTag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(
        agent_id: impl AsRef<str>,
        channel: impl AsRef<str>,
        peer_kind: impl AsRef<str>,
        chat_tag: impl AsRef<str>,
    ) -> Self {
        Self(format!(
            "{}:{}:{}:{}",
            agent_id.as_ref(),
            channel.as_ref(),
            peer_kind.as_ref(),
            chat_tag.as_ref()
        ))
    }

    /// Wrap an already-constructed key string, e.g. one read back from disk
    /// or supplied verbatim by an RPC caller.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_is_injective() {
        let a = SessionKey::new("main", "telegram", "direct", "user:1");
        let b = SessionKey::new("main", "telegram", "direct", "user:2");
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "main:telegram:direct:user:1");
    }

    #[test]
    fn distinct_agents_differ() {
        let a = SessionKey::new("main", "telegram", "direct", "c1");
        let b = SessionKey::new("assistant", "telegram", "direct", "c1");
        assert_ne!(a, b);
    }
}
