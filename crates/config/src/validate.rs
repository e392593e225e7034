//! Configuration validation.
//!
//! Runs once at load time. Config errors are a startup concern: a bad value
//! here becomes a descriptive [`anyhow::Error`] before the server ever binds
//! a socket, not a runtime `ErrorShape` surfaced over the wire.

use crate::schema::GatewayConfig;

/// Severity level for a diagnostic, kept for API parity with tooling that
/// wants to report more than hard errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }
}

/// Validate a loaded [`GatewayConfig`], collecting every diagnostic rather
/// than failing on the first one.
pub fn validate_config(config: &GatewayConfig) -> ValidationResult {
    let mut diagnostics = Vec::new();

    if config.bind_address.parse::<std::net::SocketAddr>().is_err() {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path: "bind_address".into(),
            message: format!("not a valid socket address: {:?}", config.bind_address),
        });
    }

    if config.rate_limit.requests_per_minute == 0 {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path: "rate_limit.requests_per_minute".into(),
            message: "must be greater than zero".into(),
        });
    }

    if config.dedupe.max_size == 0 {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path: "dedupe.max_size".into(),
            message: "must be greater than zero".into(),
        });
    }

    if let Some(window) = &config.heartbeat.active_hours {
        if parse_active_hours(window).is_none() {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                path: "heartbeat.active_hours".into(),
                message: format!("expected \"hh:mm-hh:mm\", got {window:?}"),
            });
        }
    }

    for (id, agent) in &config.agents {
        if agent.max_iterations == 0 {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                path: format!("agents.{id}.max_iterations"),
                message: "must be greater than zero".into(),
            });
        }
        if agent.tool_timeout_secs == 0 {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                path: format!("agents.{id}.tool_timeout_secs"),
                message: "must be greater than zero".into(),
            });
        }
    }

    ValidationResult { diagnostics }
}

/// Validate a config, failing with a descriptive [`anyhow::Error`] joining
/// every error-severity diagnostic.
pub fn validate(config: &GatewayConfig) -> anyhow::Result<()> {
    let result = validate_config(config);
    if result.has_errors() {
        let joined = result
            .diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| format!("{}: {}", d.path, d.message))
            .collect::<Vec<_>>()
            .join("; ");
        anyhow::bail!("invalid config: {joined}");
    }
    Ok(())
}

/// Parse a `"hh:mm-hh:mm"` window, returning `(start_minutes, end_minutes)`
/// since midnight. Does not itself handle the midnight wrap-around; callers
/// compare the current time against both bounds.
pub fn parse_active_hours(window: &str) -> Option<(u32, u32)> {
    let (start, end) = window.split_once('-')?;
    Some((parse_hhmm(start)?, parse_hhmm(end)?))
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn rejects_bad_bind_address() {
        let mut cfg = GatewayConfig::default();
        cfg.bind_address = "not-an-address".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_zero_rate_limit() {
        let mut cfg = GatewayConfig::default();
        cfg.rate_limit.requests_per_minute = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn parses_active_hours() {
        assert_eq!(parse_active_hours("08:30-22:00"), Some((510, 1320)));
        assert_eq!(parse_active_hours("garbage"), None);
    }

    #[test]
    fn rejects_malformed_active_hours() {
        let mut cfg = GatewayConfig::default();
        cfg.heartbeat.active_hours = Some("25:00-10:00".into());
        assert!(validate(&cfg).is_err());
    }
}
