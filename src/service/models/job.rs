use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::PersistableModel;
use std::{fmt, str::FromStr};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    ActionRequired,
    Successful,
    Failed,
    Cancelled,
    Skipped,
    InvalidJobAgent,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::ActionRequired => "action_required",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Skipped => "skipped",
            JobStatus::InvalidJobAgent => "invalid_job_agent",
        }
    }

    pub fn is_exited(&self) -> bool {
        matches!(
            self,
            JobStatus::Successful
                | JobStatus::Failed
                | JobStatus::Cancelled
                | JobStatus::Skipped
                | JobStatus::InvalidJobAgent
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_exited()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "action_required" => Ok(JobStatus::ActionRequired),
            "successful" => Ok(JobStatus::Successful),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "skipped" => Ok(JobStatus::Skipped),
            "invalid_job_agent" => Ok(JobStatus::InvalidJobAgent),
            _ => Err(anyhow::anyhow!("unknown job status: {}", s)),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub release_id: String,
    pub release_target_id: String,

    pub job_agent_id: Option<String>,
    #[serde(default)]
    pub job_agent_config: serde_json::Value,

    pub status: JobStatus,
    pub external_id: Option<String>,
    pub message: Option<String>,
    pub retry_count: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Applies a status report, stamping start and completion times on first entry.
    pub fn apply(&mut self, update: &JobStatusUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        self.updated_at = now;

        if update.external_id.is_some() {
            self.external_id = update.external_id.clone();
        }
        if update.message.is_some() {
            self.message = update.message.clone();
        }

        if self.started_at.is_none() && update.status != JobStatus::Pending {
            self.started_at = Some(now);
        }
        if self.completed_at.is_none() && update.status.is_exited() {
            self.completed_at = Some(now);
        }
    }
}

impl PersistableModel<Job> for Job {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}

/// A status report from a job agent.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JobStatusUpdate {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobTransition {
    pub previous: Job,
    pub current: Job,
}

impl JobTransition {
    pub fn just_completed(&self) -> bool {
        !self.previous.status.is_exited() && self.current.status.is_exited()
    }
}
