//! In-memory store for testing.

use std::{collections::HashMap, sync::Mutex};

use {
    anyhow::{Result, bail},
    async_trait::async_trait,
};

use crate::{
    store::CronStore,
    types::{CronJob, CronRunRecord},
};

/// In-memory store backed by `HashMap`. No persistence — for tests only.
pub struct InMemoryStore {
    jobs: Mutex<HashMap<String, CronJob>>,
    runs: Mutex<HashMap<String, Vec<CronRunRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CronStore for InMemoryStore {
    async fn load_jobs(&self) -> Result<Vec<CronJob>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.values().cloned().collect())
    }

    async fn save_job(&self, job: &CronJob) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.remove(id).is_none() {
            bail!("job not found: {id}");
        }
        Ok(())
    }

    async fn update_job(&self, job: &CronJob) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if !jobs.contains_key(&job.id) {
            bail!("job not found: {}", job.id);
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn append_run(&self, job_id: &str, run: &CronRunRecord) -> Result<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.entry(job_id.to_string())
            .or_default()
            .push(run.clone());
        Ok(())
    }

    async fn get_runs(&self, job_id: &str, limit: usize) -> Result<Vec<CronRunRecord>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let records = runs.get(job_id).cloned().unwrap_or_default();
        // Return the most recent `limit` entries.
        let start = records.len().saturating_sub(limit);
        Ok(records[start..].to_vec())
    }
}
