use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::OperationId;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Approval,
    Deployment,
    DeploymentVariable,
    DeploymentVersion,
    Environment,
    Evaluation,
    ExitHook,
    Job,
    JobUpdate,
    Policy,
    Release,
    ReleaseTarget,
    Resource,
    ResourceRelationship,
    Selector,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Approval => "approval",
            ModelType::Deployment => "deployment",
            ModelType::DeploymentVariable => "deployment_variable",
            ModelType::DeploymentVersion => "deployment_version",
            ModelType::Environment => "environment",
            ModelType::Evaluation => "evaluation",
            ModelType::ExitHook => "exit_hook",
            ModelType::Job => "job",
            ModelType::JobUpdate => "job_update",
            ModelType::Policy => "policy",
            ModelType::Release => "release",
            ModelType::ReleaseTarget => "release_target",
            ModelType::Resource => "resource",
            ModelType::ResourceRelationship => "resource_relationship",
            ModelType::Selector => "selector",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approval" => Ok(ModelType::Approval),
            "deployment" => Ok(ModelType::Deployment),
            "deployment_variable" => Ok(ModelType::DeploymentVariable),
            "deployment_version" => Ok(ModelType::DeploymentVersion),
            "environment" => Ok(ModelType::Environment),
            "evaluation" => Ok(ModelType::Evaluation),
            "exit_hook" => Ok(ModelType::ExitHook),
            "job" => Ok(ModelType::Job),
            "job_update" => Ok(ModelType::JobUpdate),
            "policy" => Ok(ModelType::Policy),
            "release" => Ok(ModelType::Release),
            "release_target" => Ok(ModelType::ReleaseTarget),
            "resource" => Ok(ModelType::Resource),
            "resource_relationship" => Ok(ModelType::ResourceRelationship),
            "selector" => Ok(ModelType::Selector),
            _ => Err(anyhow::anyhow!("unknown model type: {}", s)),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    /// A unit of work for a worker rather than a change notification.
    Requested,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Updated => "updated",
            EventType::Deleted => "deleted",
            EventType::Requested => "requested",
        }
    }
}

impl FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(EventType::Created),
            "updated" => Ok(EventType::Updated),
            "deleted" => Ok(EventType::Deleted),
            "requested" => Ok(EventType::Requested),
            _ => Err(anyhow::anyhow!("unknown event type: {}", s)),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Event {
    pub id: String,
    pub operation_id: OperationId,
    pub workspace_id: String,

    pub model_type: ModelType,
    pub event_type: EventType,

    /// Events sharing a dedup key collapse while one of them is still pending.
    pub dedup_key: Option<String>,

    pub serialized_previous_model: Option<serde_json::Value>,
    pub serialized_current_model: Option<serde_json::Value>,

    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn with_dedup_key(mut self, dedup_key: impl Into<String>) -> Self {
        self.dedup_key = Some(dedup_key.into());
        self
    }

    /// Copy of this event with a fresh id and timestamp, used to put the same unit of work
    /// back on the stream.
    pub fn requeued(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            ..self.clone()
        }
    }

    pub fn previous_model<Model: DeserializeOwned>(&self) -> anyhow::Result<Option<Model>> {
        match &self.serialized_previous_model {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn current_model<Model: DeserializeOwned>(&self) -> anyhow::Result<Option<Model>> {
        match &self.serialized_current_model {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn current_or_previous_model<Model: DeserializeOwned>(&self) -> anyhow::Result<Model> {
        if let Some(model) = self.current_model::<Model>()? {
            return Ok(model);
        }

        match self.previous_model::<Model>()? {
            Some(model) => Ok(model),
            None => Err(anyhow::anyhow!(
                "event {} received without previous or current model",
                self.id
            )),
        }
    }
}

pub fn make_dedup_key(model_type: ModelType, entity_id: &str) -> String {
    format!("{}:{}", model_type.as_str(), entity_id)
}

pub fn create_event<Model: Serialize>(
    previous_model: &Option<Model>,
    current_model: &Option<Model>,
    event_type: EventType,
    model_type: ModelType,
    workspace_id: &str,
    operation_id: &OperationId,
) -> anyhow::Result<Event> {
    let serialized_previous_model = match previous_model {
        Some(model) => Some(serde_json::to_value(model)?),
        None => None,
    };

    let serialized_current_model = match current_model {
        Some(model) => Some(serde_json::to_value(model)?),
        None => None,
    };

    Ok(Event {
        id: Uuid::new_v4().to_string(),
        operation_id: operation_id.clone(),
        workspace_id: workspace_id.to_string(),
        model_type,
        event_type,
        dedup_key: None,
        serialized_previous_model,
        serialized_current_model,
        timestamp: Utc::now(),
    })
}
