use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::GatewayConfig, validate::validate};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["moltis.toml", "moltis.yaml", "moltis.yml", "moltis.json"];

fn dir_overrides() -> &'static Mutex<(Option<PathBuf>, Option<PathBuf>)> {
    static OVERRIDES: OnceLock<Mutex<(Option<PathBuf>, Option<PathBuf>)>> = OnceLock::new();
    OVERRIDES.get_or_init(|| Mutex::new((None, None)))
}

/// Override the config directory (used by tests and `--config-dir`).
pub fn set_config_dir(dir: PathBuf) {
    dir_overrides().lock().expect("dir override lock poisoned").0 = Some(dir);
}

/// Clear a previously-set config directory override.
pub fn clear_config_dir() {
    dir_overrides().lock().expect("dir override lock poisoned").0 = None;
}

/// Override the data directory (used by tests and `--data-dir`).
pub fn set_data_dir(dir: PathBuf) {
    dir_overrides().lock().expect("dir override lock poisoned").1 = Some(dir);
}

/// Clear a previously-set data directory override.
pub fn clear_data_dir() {
    dir_overrides().lock().expect("dir override lock poisoned").1 = None;
}

/// Returns the user-global config directory (`~/.config/moltis/`), honoring
/// any override set via [`set_config_dir`].
pub fn config_dir() -> PathBuf {
    if let Some(dir) = dir_overrides().lock().expect("dir override lock poisoned").0.clone() {
        return dir;
    }
    directories::ProjectDirs::from("", "", "moltis")
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".moltis"))
}

/// Returns the user-global data directory (`~/.local/share/moltis/`), honoring
/// any override set via [`set_data_dir`].
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dir_overrides().lock().expect("dir override lock poisoned").1.clone() {
        return dir;
    }
    directories::ProjectDirs::from("", "", "moltis")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".moltis/data"))
}

/// Find the first config file in standard locations: project-local, then
/// the user-global config directory.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir();
    for name in CONFIG_FILENAMES {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
    }

    None
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    find_config_file().unwrap_or_else(|| config_dir().join("moltis.toml"))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<GatewayConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// Load config from the given path (any supported format), applying
/// `${VAR}` substitution first.
pub fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Overlay `MOLTIS_*` environment variables onto a loaded config.
///
/// Each variable corresponds to a single scalar field; unset variables leave
/// the existing value untouched.
pub fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Ok(v) = std::env::var("MOLTIS_BIND_ADDRESS") {
        config.bind_address = v;
    }
    if let Ok(v) = std::env::var("MOLTIS_CONNECT_TOKEN") {
        config.connect_token = Some(v);
    }
    if let Some(v) = env_u32("MOLTIS_RATE_LIMIT_PER_MINUTE") {
        config.rate_limit.requests_per_minute = v;
    }
    if let Some(v) = env_u32("MOLTIS_RATE_LIMIT_BURST") {
        config.rate_limit.burst = v;
    }
    if let Some(v) = env_u64("MOLTIS_DEBOUNCE_DEFAULT_SECS") {
        config.debounce.default_window_secs = v;
    }
    if let Some(v) = env_u64("MOLTIS_DEDUPE_TTL_SECS") {
        config.dedupe.ttl_secs = v;
    }
    if let Some(v) = env_usize("MOLTIS_DEDUPE_MAX_SIZE") {
        config.dedupe.max_size = v;
    }
    if let Some(v) = env_usize("MOLTIS_PENDING_HISTORY_LIMIT") {
        config.pending_history_limit = v;
    }
    if let Some(v) = env_u64("MOLTIS_PAIRING_TTL_SECS") {
        config.pairing_ttl_secs = v;
    }
    if let Ok(v) = std::env::var("MOLTIS_CRON_STORE_PATH") {
        config.cron_store_path = v;
    }
    if let Some(v) = env_u64("MOLTIS_HEARTBEAT_INTERVAL_SECS") {
        config.heartbeat.interval_secs = v;
    }
    if let Ok(v) = std::env::var("MOLTIS_HEARTBEAT_ACTIVE_HOURS") {
        config.heartbeat.active_hours = Some(v);
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Discover and load config: built-in defaults, overlaid by an optional
/// config file, overlaid by `MOLTIS_*` environment variables.
///
/// Returns `GatewayConfig::default()` (with env overrides applied) if no
/// config file is found. A config file that fails to parse or validate logs
/// a warning and falls back to defaults rather than failing closed here;
/// callers that must fail fast on an invalid file should use
/// [`load_config`] directly.
pub fn discover_and_load() -> GatewayConfig {
    let mut config = if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                GatewayConfig::default()
            },
        }
    } else {
        debug!("no config file found, using defaults");
        GatewayConfig::default()
    };

    apply_env_overrides(&mut config);

    if let Err(e) = validate(&config) {
        warn!(error = %e, "config validation failed, using defaults");
        return GatewayConfig::default();
    }

    config
}

/// Serialize `config` to TOML and write it to the user-global config path.
///
/// Creates parent directories if needed. Returns the path written to.
pub fn save_config(config: &GatewayConfig) -> anyhow::Result<PathBuf> {
    let path = find_or_default_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str =
        toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))?;
    std::fs::write(&path, toml_str)?;
    debug!(path = %path.display(), "saved config");
    Ok(path)
}

/// Load the current config, apply `f`, validate, then persist it back to
/// disk. Returns the mutated config on success.
pub fn update_config(
    f: impl FnOnce(&mut GatewayConfig),
) -> anyhow::Result<GatewayConfig> {
    let mut config = discover_and_load();
    f(&mut config);
    validate(&config)?;
    save_config(&config)?;
    Ok(config)
}
