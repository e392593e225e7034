//! JSON file-backed index of session metadata.
//!
//! The transcript itself lives in the JSONL file managed by [`crate::store`];
//! this index holds the small, frequently-updated fields (label, message
//! count, archived flag) that `sessions.list` needs without reading every
//! transcript off disk.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A single session entry in the metadata index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: String,
    pub key: String,
    pub label: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub message_count: u32,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_binding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default)]
    pub version: u64,
}

/// JSON file-backed index mapping session key → [`SessionEntry`].
pub struct SessionMetadata {
    path: PathBuf,
    entries: HashMap<String, SessionEntry>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl SessionMetadata {
    /// Load metadata from disk, or create an empty index.
    pub fn load(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let data = fs::read_to_string(&path)?;
            serde_json::from_str(&data).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self { path, entries })
    }

    /// Persist metadata to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(&self.entries)?;
        fs::write(&self.path, data)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&SessionEntry> {
        self.entries.get(key)
    }

    /// Insert or update an entry. If the key doesn't exist, creates a new one.
    pub fn upsert(&mut self, key: &str, label: Option<String>) -> &SessionEntry {
        let now = now_ms();
        self.entries
            .entry(key.to_string())
            .and_modify(|e| {
                if let Some(ref l) = label
                    && e.label.as_deref() != Some(l)
                {
                    e.label = label.clone();
                    e.updated_at = now;
                    e.version += 1;
                }
            })
            .or_insert_with(|| SessionEntry {
                id: random_id(),
                key: key.to_string(),
                label,
                model: None,
                created_at: now,
                updated_at: now,
                message_count: 0,
                archived: false,
                channel_binding: None,
                preview: None,
                version: 0,
            })
    }

    pub fn set_model(&mut self, key: &str, model: Option<String>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.model = model;
            entry.updated_at = now_ms();
            entry.version += 1;
        }
    }

    /// Update message count and `updated_at`.
    pub fn touch(&mut self, key: &str, message_count: u32) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.message_count = message_count;
            entry.updated_at = now_ms();
            entry.version += 1;
        }
    }

    pub fn set_archived(&mut self, key: &str, archived: bool) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.archived = archived;
            entry.updated_at = now_ms();
            entry.version += 1;
        }
    }

    /// Bind a session to a channel chat, so future inbound messages from
    /// that chat resolve to this session key.
    pub fn set_channel_binding(&mut self, key: &str, binding: Option<String>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.channel_binding = binding;
            entry.updated_at = now_ms();
            entry.version += 1;
        }
    }

    pub fn set_preview(&mut self, key: &str, preview: Option<String>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.preview = preview;
            entry.updated_at = now_ms();
            entry.version += 1;
        }
    }

    /// Remove an entry. Returns the removed entry if it existed.
    pub fn remove(&mut self, key: &str) -> Option<SessionEntry> {
        self.entries.remove(key)
    }

    /// List all entries, oldest first.
    pub fn list(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|a| a.created_at);
        entries
    }

    /// Find the session bound to a given channel chat, if any.
    pub fn find_by_channel_binding(&self, binding: &str) -> Option<&SessionEntry> {
        self.entries
            .values()
            .find(|e| e.channel_binding.as_deref() == Some(binding))
    }
}

fn random_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
        .collect()
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let mut meta = SessionMetadata::load(path).unwrap();

        meta.upsert("main", None);
        meta.upsert("session:abc", Some("My Chat".to_string()));

        let list = meta.list();
        assert_eq!(list.len(), 2);
        let abc = list.iter().find(|e| e.key == "session:abc").unwrap();
        assert_eq!(abc.label.as_deref(), Some("My Chat"));
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");

        {
            let mut meta = SessionMetadata::load(path.clone()).unwrap();
            meta.upsert("main", Some("Main".to_string()));
            meta.save().unwrap();
        }

        let meta = SessionMetadata::load(path).unwrap();
        let entry = meta.get("main").unwrap();
        assert_eq!(entry.label.as_deref(), Some("Main"));
    }

    #[test]
    fn remove_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let mut meta = SessionMetadata::load(path).unwrap();

        meta.upsert("main", None);
        assert!(meta.get("main").is_some());
        meta.remove("main");
        assert!(meta.get("main").is_none());
    }

    #[test]
    fn touch_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let mut meta = SessionMetadata::load(path).unwrap();

        meta.upsert("main", None);
        meta.touch("main", 5);
        assert_eq!(meta.get("main").unwrap().message_count, 5);
        assert_eq!(meta.get("main").unwrap().version, 1);
    }

    #[test]
    fn channel_binding_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let mut meta = SessionMetadata::load(path).unwrap();

        meta.upsert("main:telegram:direct:u1", None);
        meta.set_channel_binding("main:telegram:direct:u1", Some("telegram:bot1:u1".into()));

        let found = meta.find_by_channel_binding("telegram:bot1:u1").unwrap();
        assert_eq!(found.key, "main:telegram:direct:u1");
        assert!(meta.find_by_channel_binding("nope").is_none());
    }
}
