//! Configuration loading, validation, env substitution, and the config-file
//! watcher.
//!
//! Config files: `moltis.toml`, `moltis.yaml`, or `moltis.json`
//! Searched in `./` then `~/.config/moltis/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values. Layering order
//! is built-in defaults, then the file, then `MOLTIS_*` environment
//! overrides.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;
pub mod watcher;

pub use {
    loader::{
        apply_env_overrides, clear_config_dir, clear_data_dir, config_dir, data_dir,
        discover_and_load, find_or_default_config_path, load_config, save_config, set_config_dir,
        set_data_dir, update_config,
    },
    schema::{
        AgentIdentity, AgentSpec, DebounceConfig, DedupeConfig, GatewayConfig, HeartbeatConfig,
        ProviderEntry, ProvidersConfig, RateLimitConfig, ResolvedIdentity, RoutingConfig,
        UserProfile,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate, validate_config},
    watcher::{ConfigChanged, ConfigWatcher},
};
