/// Config schema types: agent identity, agent specs, and the gateway's own
/// layered configuration.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Agent identity (name, emoji, creature, vibe, soul).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentIdentity {
    pub name: Option<String>,
    pub emoji: Option<String>,
    pub creature: Option<String>,
    pub vibe: Option<String>,
    /// Freeform personality / soul text injected into the system prompt.
    pub soul: Option<String>,
}

/// User profile collected during onboarding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub name: Option<String>,
    pub timezone: Option<String>,
}

/// Resolved identity combining agent identity and user profile.
/// Used as the API response for identity-related RPC methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub name: String,
    pub emoji: Option<String>,
    pub creature: Option<String>,
    pub vibe: Option<String>,
    pub soul: Option<String>,
    pub user_name: Option<String>,
}

impl ResolvedIdentity {
    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self {
            name: cfg.identity.name.clone().unwrap_or_else(|| "moltis".into()),
            emoji: cfg.identity.emoji.clone(),
            creature: cfg.identity.creature.clone(),
            vibe: cfg.identity.vibe.clone(),
            soul: cfg.identity.soul.clone(),
            user_name: cfg.user.name.clone(),
        }
    }
}

impl Default for ResolvedIdentity {
    fn default() -> Self {
        Self {
            name: "moltis".into(),
            emoji: None,
            creature: None,
            vibe: None,
            soul: None,
            user_name: None,
        }
    }
}

/// A single configured agent.
///
/// Resolved once from config and cached by the agent router; `id` is the
/// key other subsystems (cron, channels, routing) use to address this agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpec {
    pub id: String,
    pub display_name: String,
    /// Path to a file containing a persona/system-prompt fragment, relative
    /// to the config directory.
    pub system_prompt_file: Option<String>,
    pub max_iterations: usize,
    pub tool_timeout_secs: u64,
    pub provider_id: String,
    pub model: String,
    pub context_window: usize,
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            id: "default".into(),
            display_name: "Moltis".into(),
            system_prompt_file: None,
            max_iterations: 25,
            tool_timeout_secs: 30,
            provider_id: "anthropic".into(),
            model: "claude-sonnet-4-20250514".into(),
            context_window: 200_000,
        }
    }
}

/// Agent-binding cascade used by the router to pick which agent handles an
/// inbound channel message. Checked in precedence order: peer, then account,
/// then channel, then the default agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Exact sender-id → agent-id bindings. Highest precedence.
    pub peer_bindings: HashMap<String, String>,
    /// `"{channel}:{accountId}"` → agent-id bindings.
    pub account_bindings: HashMap<String, String>,
    /// `channel` → agent-id bindings (matches any account on that channel).
    pub channel_bindings: HashMap<String, String>,
    /// Fallback agent id when no binding matches.
    pub default_agent_id: Option<String>,
}

/// Rate-limit defaults applied per sender by the gateway's token bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 20,
            burst: 5,
        }
    }
}

/// Per-channel message debounce windows, plus a fallback default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub default_window_secs: u64,
    /// Overrides keyed by channel name (e.g. "telegram", "feishu").
    pub per_channel_secs: HashMap<String, u64>,
}

/// Inbound-message dedupe cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    pub ttl_secs: u64,
    pub max_size: usize,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            max_size: 10_000,
        }
    }
}

/// Scheduled heartbeat invocation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    /// `"hh:mm-hh:mm"`, wraps around midnight. `None` means always active.
    pub active_hours: Option<String>,
    pub timezone: Option<String>,
    pub ack_max_chars: usize,
}

/// LLM provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider-specific settings keyed by provider name.
    /// Known keys: "anthropic", "openai".
    #[serde(flatten)]
    pub providers: HashMap<String, ProviderEntry>,
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEntry {
    /// Whether this provider is enabled. Defaults to true.
    pub enabled: bool,
    /// Override the API key (optional; env var still takes precedence if set).
    pub api_key: Option<String>,
    /// Override the base URL.
    pub base_url: Option<String>,
    /// Default model ID for this provider.
    pub model: Option<String>,
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: None,
            model: None,
        }
    }
}

impl ProvidersConfig {
    /// Check if a provider is enabled (defaults to true if not configured).
    pub fn is_enabled(&self, name: &str) -> bool {
        self.providers.get(name).is_none_or(|e| e.enabled)
    }

    /// Get the configured entry for a provider, if any.
    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.get(name)
    }
}

/// The gateway's own top-level configuration, layered at load time from
/// built-in defaults, an optional config file, then `MOLTIS_*` environment
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_address: String,
    pub connect_token: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub debounce: DebounceConfig,
    pub dedupe: DedupeConfig,
    pub pending_history_limit: usize,
    pub pairing_ttl_secs: u64,
    pub cron_store_path: String,
    pub heartbeat: HeartbeatConfig,
    pub providers: ProvidersConfig,
    pub agents: HashMap<String, AgentSpec>,
    pub routing: RoutingConfig,
    pub identity: AgentIdentity,
    pub user: UserProfile,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:18790".into(),
            connect_token: None,
            rate_limit: RateLimitConfig::default(),
            debounce: DebounceConfig::default(),
            dedupe: DedupeConfig::default(),
            pending_history_limit: 200,
            pairing_ttl_secs: 300,
            cron_store_path: "cron.jsonl".into(),
            heartbeat: HeartbeatConfig {
                interval_secs: 3600,
                active_hours: None,
                timezone: None,
                ack_max_chars: 300,
            },
            providers: ProvidersConfig::default(),
            agents: HashMap::new(),
            routing: RoutingConfig::default(),
            identity: AgentIdentity::default(),
            user: UserProfile::default(),
        }
    }
}

impl GatewayConfig {
    /// Returns `true` once the agent and user identity have both been set.
    pub fn is_onboarded(&self) -> bool {
        self.identity.name.is_some() && self.user.name.is_some()
    }

    pub fn debounce_window_for(&self, channel: &str) -> std::time::Duration {
        let secs = self
            .debounce
            .per_channel_secs
            .get(channel)
            .copied()
            .unwrap_or(self.debounce.default_window_secs);
        std::time::Duration::from_secs(secs)
    }
}
