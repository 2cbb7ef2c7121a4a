use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use uuid::Uuid;

use super::db::DbHandle;
use super::models::{Job, JobUpdate};

/// Fresh job identifier: `job_` followed by 12 lowercase hex characters.
pub fn new_job_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("job_{}", &hex[..12])
}

/// Persistence for job records. Updates merge the set fields of a
/// `JobUpdate` and refresh `updated_at`; the last writer wins.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self) -> Result<Job>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>>;

    /// `None` when the job does not exist.
    async fn update(&self, job_id: &str, update: JobUpdate) -> Result<Option<Job>>;

    fn backend_name(&self) -> &'static str;
}

pub struct SqliteJobStore {
    db: DbHandle,
}

impl SqliteJobStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self) -> Result<Job> {
        let job = Job::new(new_job_id());
        let record = job.clone();
        self.db.call(move |db| db.insert_job(&record)).await?;
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let job_id = job_id.to_string();
        self.db.call(move |db| db.get_job(&job_id)).await
    }

    async fn update(&self, job_id: &str, update: JobUpdate) -> Result<Option<Job>> {
        let job_id = job_id.to_string();
        self.db
            .call(move |db| {
                let Some(mut job) = db.get_job(&job_id)? else {
                    return Ok(None);
                };
                job.apply(update);
                db.save_job(&job)?;
                Ok(Some(job))
            })
            .await
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

/// Process-local fallback. The lock is held for one map access at a time.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self) -> Result<Job> {
        let job = Job::new(new_job_id());
        let mut jobs = self.jobs.lock().map_err(|e| anyhow!("job store lock poisoned: {}", e))?;
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let jobs = self.jobs.lock().map_err(|e| anyhow!("job store lock poisoned: {}", e))?;
        Ok(jobs.get(job_id).cloned())
    }

    async fn update(&self, job_id: &str, update: JobUpdate) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().map_err(|e| anyhow!("job store lock poisoned: {}", e))?;
        Ok(jobs.get_mut(job_id).map(|job| {
            job.apply(update);
            job.clone()
        }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
