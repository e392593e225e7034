//! JSON file-backed channel store with atomic writes, mirroring the cron
//! crate's job store.

use std::path::PathBuf;

use {
    anyhow::{Context, Result},
    async_trait::async_trait,
    tokio::fs,
};

use crate::store::{ChannelStore, StoredChannel};

pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn load_all(&self) -> Result<Vec<StoredChannel>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path).await?;
        serde_json::from_str(&data).context("failed to parse channels.json")
    }

    async fn atomic_write(&self, channels: &[StoredChannel]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(channels)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes()).await?;
        if fs::try_exists(&self.path).await.unwrap_or(false) {
            let bak = self.path.with_extension("json.bak");
            let _ = fs::rename(&self.path, &bak).await;
        }
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for FileStore {
    async fn list(&self) -> Result<Vec<StoredChannel>> {
        self.load_all().await
    }

    async fn get(&self, channel_type: &str, account_id: &str) -> Result<Option<StoredChannel>> {
        let channels = self.load_all().await?;
        Ok(channels
            .into_iter()
            .find(|c| c.channel_type == channel_type && c.account_id == account_id))
    }

    async fn upsert(&self, channel: StoredChannel) -> Result<()> {
        let mut channels = self.load_all().await?;
        match channels
            .iter()
            .position(|c| c.channel_type == channel.channel_type && c.account_id == channel.account_id)
        {
            Some(pos) => channels[pos] = channel,
            None => channels.push(channel),
        }
        self.atomic_write(&channels).await
    }

    async fn delete(&self, channel_type: &str, account_id: &str) -> Result<()> {
        let mut channels = self.load_all().await?;
        channels.retain(|c| !(c.channel_type == channel_type && c.account_id == account_id));
        self.atomic_write(&channels).await
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tempfile::TempDir};

    fn make_channel(channel_type: &str, account_id: &str) -> StoredChannel {
        StoredChannel {
            account_id: account_id.into(),
            channel_type: channel_type.into(),
            config: serde_json::json!({}),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path().join("channels.json"));

        store.upsert(make_channel("telegram", "acct-1")).await.unwrap();
        let found = store.get("telegram", "acct-1").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn upsert_replaces_existing() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path().join("channels.json"));

        store.upsert(make_channel("telegram", "acct-1")).await.unwrap();
        let mut updated = make_channel("telegram", "acct-1");
        updated.config = serde_json::json!({"dm_policy": "open"});
        store.upsert(updated).await.unwrap();

        let channels = store.list().await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].config, serde_json::json!({"dm_policy": "open"}));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path().join("channels.json"));

        store.upsert(make_channel("telegram", "acct-1")).await.unwrap();
        store.delete("telegram", "acct-1").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
