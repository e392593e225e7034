//! Connect-time role derivation.
//!
//! Five rules, checked in order, produce the role a connection operates
//! under for its whole lifetime (roles never change mid-connection):
//!
//! 1. A connect token is configured and the client supplied a matching one → `admin`.
//! 2. No connect token is configured at all → `operator` (open install).
//! 3. The client's `sender_id` is already paired for the `"browser"` channel → `operator`.
//! 4. A token is configured, none was supplied, and pairing is available →
//!    issue a pairing code and report `pending_pairing` instead of
//!    authenticating.
//! 5. Otherwise → `viewer` (read-only).

use moltis_config::schema::GatewayConfig;
use moltis_protocol::{ConnectParams, roles};

use crate::pairing::PairingStore;

/// Channel name used for the browser/WS pairing flow (as opposed to
/// channel-sender pairing, which uses the channel's own name).
pub const BROWSER_CHANNEL: &str = "browser";

#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Authenticated { role: &'static str },
    PendingPairing { pairing_code: String, sender_id: String },
}

/// Constant-time string comparison, used for the connect token check.
pub fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

pub fn is_loopback(addr: &std::net::SocketAddr) -> bool {
    addr.ip().is_loopback()
}

pub fn derive_role(
    config: &GatewayConfig,
    pairing: &PairingStore,
    params: &ConnectParams,
) -> ConnectOutcome {
    let configured_token = config.connect_token.as_deref().filter(|t| !t.is_empty());

    // Rule 1: token configured and matches.
    if let Some(expected) = configured_token
        && let Some(supplied) = params.token.as_deref()
        && safe_equal(expected, supplied)
    {
        return ConnectOutcome::Authenticated { role: roles::ADMIN };
    }

    // Rule 2: no token configured at all.
    if configured_token.is_none() {
        return ConnectOutcome::Authenticated { role: roles::OPERATOR };
    }

    // Rule 3: sender already paired for the browser channel.
    if let Some(sender_id) = params.sender_id.as_deref()
        && pairing.is_paired(sender_id, BROWSER_CHANNEL)
    {
        return ConnectOutcome::Authenticated { role: roles::OPERATOR };
    }

    // Rule 4: token configured, none supplied — offer pairing.
    if params.token.is_none() {
        let sender_id = params
            .sender_id
            .clone()
            .unwrap_or_else(|| format!("anon-{:08x}", rand::random::<u32>()));
        let pending = pairing.request(&sender_id, BROWSER_CHANNEL, "", "");
        return ConnectOutcome::PendingPairing {
            pairing_code: pending.code,
            sender_id,
        };
    }

    // Rule 5: a token was supplied but didn't match.
    ConnectOutcome::Authenticated { role: roles::VIEWER }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config_with_token(token: Option<&str>) -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.connect_token = token.map(String::from);
        cfg
    }

    fn params(token: Option<&str>, sender_id: Option<&str>) -> ConnectParams {
        ConnectParams {
            token: token.map(String::from),
            user_id: None,
            sender_id: sender_id.map(String::from),
        }
    }

    #[test]
    fn matching_token_is_admin() {
        let cfg = config_with_token(Some("secret"));
        let pairing = PairingStore::new(Duration::from_secs(600));
        let outcome = derive_role(&cfg, &pairing, &params(Some("secret"), None));
        assert!(matches!(outcome, ConnectOutcome::Authenticated { role } if role == roles::ADMIN));
    }

    #[test]
    fn no_token_configured_is_operator() {
        let cfg = config_with_token(None);
        let pairing = PairingStore::new(Duration::from_secs(600));
        let outcome = derive_role(&cfg, &pairing, &params(None, None));
        assert!(matches!(outcome, ConnectOutcome::Authenticated { role } if role == roles::OPERATOR));
    }

    #[test]
    fn paired_sender_is_operator() {
        let cfg = config_with_token(Some("secret"));
        let pairing = PairingStore::new(Duration::from_secs(600));
        pairing.request("u1", BROWSER_CHANNEL, "", "");
        let code = pairing.list_pending()[0].code.clone();
        pairing.approve(&code, "admin");

        let outcome = derive_role(&cfg, &pairing, &params(None, Some("u1")));
        assert!(matches!(outcome, ConnectOutcome::Authenticated { role } if role == roles::OPERATOR));
    }

    #[test]
    fn missing_token_offers_pairing() {
        let cfg = config_with_token(Some("secret"));
        let pairing = PairingStore::new(Duration::from_secs(600));
        let outcome = derive_role(&cfg, &pairing, &params(None, Some("u2")));
        assert!(matches!(outcome, ConnectOutcome::PendingPairing { .. }));
    }

    #[test]
    fn wrong_token_is_viewer() {
        let cfg = config_with_token(Some("secret"));
        let pairing = PairingStore::new(Duration::from_secs(600));
        let outcome = derive_role(&cfg, &pairing, &params(Some("wrong"), None));
        assert!(matches!(outcome, ConnectOutcome::Authenticated { role } if role == roles::VIEWER));
    }
}
