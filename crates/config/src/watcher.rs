//! Filesystem watcher for the config file.
//!
//! Watches the resolved config path for create/modify/remove events and
//! emits a single debounced [`ConfigChanged`] notification. The watcher
//! performs no parsing or validation itself — the receiver re-runs
//! [`crate::discover_and_load`] and decides what to do with the result.

use std::path::PathBuf;

use {
    anyhow::Result,
    notify_debouncer_full::{
        DebounceEventResult, Debouncer, RecommendedCache, new_debouncer, notify::RecursiveMode,
    },
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

/// Debounce window for coalescing bursts of filesystem events.
const DEBOUNCE_WINDOW: std::time::Duration = std::time::Duration::from_millis(500);

/// Event emitted by the config watcher.
#[derive(Debug, Clone)]
pub struct ConfigChanged;

/// Watches a config file for changes with debouncing.
pub struct ConfigWatcher {
    _debouncer: Debouncer<notify_debouncer_full::notify::RecommendedWatcher, RecommendedCache>,
}

impl ConfigWatcher {
    /// Start watching `path`. Returns the watcher and a receiver for
    /// [`ConfigChanged`] events.
    ///
    /// The watcher must be kept alive (not dropped) for events to continue.
    /// The parent directory is watched non-recursively so the watcher
    /// survives editors that replace the file via rename rather than
    /// in-place write.
    pub fn start(path: PathBuf) -> Result<(Self, mpsc::UnboundedReceiver<ConfigChanged>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watched_name = path
            .file_name()
            .map(|n| n.to_owned())
            .ok_or_else(|| anyhow::anyhow!("config path has no file name: {}", path.display()))?;

        let debouncer = new_debouncer(
            DEBOUNCE_WINDOW,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let mut changed = false;
                    for event in events {
                        for p in &event.paths {
                            if p.file_name() != Some(watched_name.as_os_str()) {
                                continue;
                            }

                            use notify_debouncer_full::notify::EventKind;
                            match event.kind {
                                EventKind::Create(_)
                                | EventKind::Modify(_)
                                | EventKind::Remove(_) => {
                                    debug!(path = %p.display(), "config watcher event");
                                    changed = true;
                                },
                                _ => {},
                            }
                        }
                    }
                    if changed {
                        let _ = tx.send(ConfigChanged);
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "config watcher error");
                    }
                },
            },
        )?;

        let mut watcher = Self {
            _debouncer: debouncer,
        };

        let dir = path.parent().unwrap_or(&path).to_path_buf();
        if dir.exists() {
            watcher._debouncer.watch(&dir, RecursiveMode::NonRecursive)?;
            info!(dir = %dir.display(), "config watcher: watching directory");
        }

        Ok((watcher, rx))
    }
}
