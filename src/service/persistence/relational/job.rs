use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;

use shipyard_core::{LockOutcome, Persistence};

use super::is_lock_not_available;
use crate::{
    models::{Job, JobStatusUpdate, JobTransition},
    persistence::JobPersistence,
};

#[derive(Debug)]
pub struct JobRelationalPersistence {
    pub db: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    release_id: String,
    release_target_id: String,
    job_agent_id: Option<String>,
    job_agent_config: serde_json::Value,
    status: String,
    external_id: Option<String>,
    message: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> anyhow::Result<Self> {
        Ok(Self {
            id: row.id,
            release_id: row.release_id,
            release_target_id: row.release_target_id,
            job_agent_id: row.job_agent_id,
            job_agent_config: row.job_agent_config,
            status: row.status.parse()?,
            external_id: row.external_id,
            message: row.message,
            retry_count: row.retry_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn jobs_from_rows(rows: Vec<JobRow>) -> anyhow::Result<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

const UPSERT_JOB: &str = r#"
    INSERT INTO jobs
        (id, release_id, release_target_id, job_agent_id, job_agent_config, status,
         external_id, message, retry_count, created_at, updated_at, started_at, completed_at)
    VALUES
        ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
    ON CONFLICT (id) DO UPDATE SET
        status = $6,
        external_id = $7,
        message = $8,
        updated_at = $11,
        started_at = $12,
        completed_at = $13
"#;

fn bind_job<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    job: &'q Job,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&job.id)
        .bind(&job.release_id)
        .bind(&job.release_target_id)
        .bind(&job.job_agent_id)
        .bind(&job.job_agent_config)
        .bind(job.status.as_str())
        .bind(&job.external_id)
        .bind(&job.message)
        .bind(job.retry_count)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
}

#[async_trait]
impl Persistence<Job> for JobRelationalPersistence {
    #[tracing::instrument(name = "relational::job::upsert", skip_all)]
    async fn upsert(&self, job: &Job) -> anyhow::Result<u64> {
        let result = bind_job(sqlx::query(UPSERT_JOB), job)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::job::delete", skip_all)]
    async fn delete(&self, id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::job::get_by_id", skip_all)]
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;

        row.map(Job::try_from).transpose()
    }

    #[tracing::instrument(name = "relational::job::list", skip_all)]
    async fn list(&self) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs")
            .fetch_all(&*self.db)
            .await?;

        jobs_from_rows(rows)
    }
}

#[async_trait]
impl JobPersistence for JobRelationalPersistence {
    #[tracing::instrument(name = "relational::job::create_for_release", skip_all)]
    async fn create_for_release(&self, job: &Job) -> anyhow::Result<u64> {
        let mut tx = self.db.begin().await?;

        let result = bind_job(sqlx::query(UPSERT_JOB), job)
            .execute(&mut tx)
            .await?;

        sqlx::query(
            "INSERT INTO release_jobs (release_id, job_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(&job.release_id)
        .bind(&job.id)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::job::update_status", skip_all)]
    async fn update_status(
        &self,
        update: &JobStatusUpdate,
        now: DateTime<Utc>,
    ) -> anyhow::Result<LockOutcome<Option<JobTransition>>> {
        let mut tx = self.db.begin().await?;

        let fetched = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE id = $1 FOR UPDATE NOWAIT",
        )
        .bind(&update.job_id)
        .fetch_optional(&mut tx)
        .await;

        let row = match fetched {
            Ok(row) => row,
            Err(err) if is_lock_not_available(&err) => {
                tx.rollback().await?;
                return Ok(LockOutcome::Contended);
            }
            Err(err) => return Err(err.into()),
        };

        let previous = match row {
            Some(row) => Job::try_from(row)?,
            None => {
                tx.rollback().await?;
                return Ok(LockOutcome::Acquired(None));
            }
        };

        let mut current = previous.clone();
        current.apply(update, now);

        bind_job(sqlx::query(UPSERT_JOB), &current)
            .execute(&mut tx)
            .await?;

        tx.commit().await?;

        Ok(LockOutcome::Acquired(Some(JobTransition { previous, current })))
    }

    #[tracing::instrument(name = "relational::job::list_by_release", skip_all)]
    async fn list_by_release(&self, release_id: &str) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
                SELECT jobs.* FROM jobs
                INNER JOIN release_jobs ON release_jobs.job_id = jobs.id
                WHERE release_jobs.release_id = $1
                ORDER BY jobs.created_at DESC, jobs.id DESC
            "#,
        )
        .bind(release_id)
        .fetch_all(&*self.db)
        .await?;

        jobs_from_rows(rows)
    }

    #[tracing::instrument(name = "relational::job::list_by_release_target", skip_all)]
    async fn list_by_release_target(&self, release_target_id: &str) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
                SELECT * FROM jobs WHERE release_target_id = $1
                ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(release_target_id)
        .fetch_all(&*self.db)
        .await?;

        jobs_from_rows(rows)
    }

    #[tracing::instrument(name = "relational::job::list_active_by_release_target", skip_all)]
    async fn list_active_by_release_target(
        &self,
        release_target_id: &str,
    ) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
                SELECT * FROM jobs
                WHERE release_target_id = $1
                  AND status IN ('pending', 'in_progress', 'action_required')
                ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(release_target_id)
        .fetch_all(&*self.db)
        .await?;

        jobs_from_rows(rows)
    }
}
