use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use shipyard_core::{LockOutcome, Persistence};

use super::MemoryPersistence;
use crate::{
    models::{Job, JobStatusUpdate, JobTransition},
    persistence::JobPersistence,
};

/// Jobs kept in memory, with a per-job row lock standing in for `FOR UPDATE NOWAIT`.
#[derive(Clone, Debug, Default)]
pub struct JobMemoryPersistence {
    jobs: MemoryPersistence<Job>,
    row_locks: Arc<Mutex<HashMap<String, Arc<RowLock<()>>>>>,
}

impl JobMemoryPersistence {
    fn row_lock(&self, job_id: &str) -> anyhow::Result<Arc<RowLock<()>>> {
        let mut row_locks = match self.row_locks.lock() {
            Ok(row_locks) => row_locks,
            Err(_) => return Err(anyhow::anyhow!("failed to acquire lock")),
        };

        Ok(Arc::clone(
            row_locks
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(RowLock::new(()))),
        ))
    }

    /// Forgets the row lock of a job once nobody holds or waits on it.
    fn release_row_lock(&self, job_id: &str, row_lock: Arc<RowLock<()>>) -> anyhow::Result<()> {
        let mut row_locks = match self.row_locks.lock() {
            Ok(row_locks) => row_locks,
            Err(_) => return Err(anyhow::anyhow!("failed to acquire lock")),
        };

        drop(row_lock);

        let unused = row_locks
            .get(job_id)
            .map(|row_lock| Arc::strong_count(row_lock) == 1)
            .unwrap_or(false);
        if unused {
            row_locks.remove(job_id);
        }

        Ok(())
    }

    async fn apply_update(
        &self,
        update: &JobStatusUpdate,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<JobTransition>> {
        let previous = match self.jobs.get_by_id(&update.job_id).await? {
            Some(job) => job,
            None => return Ok(None),
        };

        let mut current = previous.clone();
        current.apply(update, now);

        self.jobs.upsert(&current).await?;

        Ok(Some(JobTransition { previous, current }))
    }

    /// Holds the row lock of a job until the guard is dropped.
    pub async fn lock_row(&self, job_id: &str) -> anyhow::Result<OwnedMutexGuard<()>> {
        Ok(self.row_lock(job_id)?.lock_owned().await)
    }

    fn sort_newest_first(jobs: &mut [Job]) {
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
    }
}

#[async_trait]
impl Persistence<Job> for JobMemoryPersistence {
    async fn upsert(&self, job: &Job) -> anyhow::Result<u64> {
        self.jobs.upsert(job).await
    }

    async fn delete(&self, job_id: &str) -> anyhow::Result<u64> {
        self.jobs.delete(job_id).await
    }

    async fn get_by_id(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        self.jobs.get_by_id(job_id).await
    }

    async fn list(&self) -> anyhow::Result<Vec<Job>> {
        self.jobs.list().await
    }
}

#[async_trait]
impl JobPersistence for JobMemoryPersistence {
    async fn create_for_release(&self, job: &Job) -> anyhow::Result<u64> {
        self.jobs.upsert(job).await
    }

    async fn update_status(
        &self,
        update: &JobStatusUpdate,
        now: DateTime<Utc>,
    ) -> anyhow::Result<LockOutcome<Option<JobTransition>>> {
        let row_lock = self.row_lock(&update.job_id)?;
        let guard = match Arc::clone(&row_lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.release_row_lock(&update.job_id, row_lock)?;
                return Ok(LockOutcome::Contended);
            }
        };

        let transition = self.apply_update(update, now).await;

        drop(guard);
        self.release_row_lock(&update.job_id, row_lock)?;

        Ok(LockOutcome::Acquired(transition?))
    }

    async fn list_by_release(&self, release_id: &str) -> anyhow::Result<Vec<Job>> {
        let mut jobs = self.jobs.filter(|job| job.release_id == release_id)?;

        Self::sort_newest_first(&mut jobs);

        Ok(jobs)
    }

    async fn list_by_release_target(&self, release_target_id: &str) -> anyhow::Result<Vec<Job>> {
        let mut jobs = self
            .jobs
            .filter(|job| job.release_target_id == release_target_id)?;

        Self::sort_newest_first(&mut jobs);

        Ok(jobs)
    }

    async fn list_active_by_release_target(
        &self,
        release_target_id: &str,
    ) -> anyhow::Result<Vec<Job>> {
        let mut jobs = self.jobs.filter(|job| {
            job.release_target_id == release_target_id && job.status.is_active()
        })?;

        Self::sort_newest_first(&mut jobs);

        Ok(jobs)
    }
}
