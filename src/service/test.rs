use chrono::{TimeZone, Utc};
use serde_json::json;
use shipyard_core::{Condition, StringOperator};
use std::collections::BTreeMap;

use crate::models::{
    Deployment, DeploymentVariable, DeploymentVersion, Environment, Job, JobStatus, Policy,
    PolicyTarget, Release, ReleaseTarget, Resource, ResourceToInsert, VariableValue,
    VersionStatus,
};

pub const WORKSPACE_FIXTURE_ID: &str = "workspace-fixture";
pub const SYSTEM_FIXTURE_ID: &str = "system-fixture";

pub fn get_resource_fixture(id: Option<&str>) -> Resource {
    let id = id.unwrap_or("resource-fixture").to_string();
    let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    Resource {
        identifier: format!("cluster/{}", id),
        name: id.clone(),
        id,
        workspace_id: WORKSPACE_FIXTURE_ID.to_owned(),
        provider_id: Some("provider-fixture".to_owned()),

        kind: "Kubernetes".to_owned(),
        version: "v1".to_owned(),

        metadata: BTreeMap::from([("region".to_owned(), "us-east-1".to_owned())]),
        variables: BTreeMap::new(),

        created_at,
        updated_at: created_at,
        deleted_at: None,
    }
}

/// A resource as a scanner would report it, in the fixture region.
pub fn get_scanned_resource_fixture(identifier: &str, kind: &str) -> ResourceToInsert {
    ResourceToInsert {
        name: identifier.to_owned(),
        kind: kind.to_owned(),
        version: "v1".to_owned(),
        identifier: identifier.to_owned(),
        metadata: BTreeMap::from([("region".to_owned(), "us-east-1".to_owned())]),
        variables: BTreeMap::new(),
    }
}

pub fn get_environment_fixture(id: Option<&str>) -> Environment {
    Environment {
        id: id.unwrap_or("environment-fixture").to_owned(),
        workspace_id: WORKSPACE_FIXTURE_ID.to_owned(),
        system_id: SYSTEM_FIXTURE_ID.to_owned(),
        name: "production".to_owned(),
        metadata: BTreeMap::new(),

        resource_selector: Some(Condition::Kind {
            value: "Kubernetes".to_owned(),
        }),

        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    }
}

pub fn get_deployment_fixture(id: Option<&str>) -> Deployment {
    Deployment {
        id: id.unwrap_or("deployment-fixture").to_owned(),
        workspace_id: WORKSPACE_FIXTURE_ID.to_owned(),
        system_id: SYSTEM_FIXTURE_ID.to_owned(),
        name: "api".to_owned(),

        resource_selector: None,

        job_agent_id: Some("job-agent-fixture".to_owned()),
        job_agent_config: json!({ "namespace": "default" }),

        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    }
}

/// A ready version of the deployment fixture; `tag` also names its id.
pub fn get_version_fixture(tag: Option<&str>) -> DeploymentVersion {
    let tag = tag.unwrap_or("1.0.0");
    let deployment = get_deployment_fixture(None);

    DeploymentVersion {
        id: format!("version-{}", tag),
        deployment_id: deployment.id,

        tag: tag.to_owned(),
        name: format!("api {}", tag),
        config: json!({}),
        metadata: BTreeMap::new(),

        status: VersionStatus::Ready,
        dependencies: vec![],

        created_at: Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap(),
    }
}

pub fn get_variable_fixture(key: Option<&str>) -> DeploymentVariable {
    let key = key.unwrap_or("replicas");
    let deployment = get_deployment_fixture(None);

    DeploymentVariable {
        id: format!("variable-{}", key),
        deployment_id: deployment.id,
        key: key.to_owned(),

        default_value: Some(json!(1)),
        values: vec![VariableValue {
            id: format!("variable-{}-us-east-1", key),
            value: json!(3),
            resource_selector: Some(Condition::Metadata {
                key: "region".to_owned(),
                operator: shipyard_core::MetadataOperator::Equals,
                value: Some("us-east-1".to_owned()),
            }),
            priority: 10,
        }],
    }
}

/// Release target joining the resource, environment and deployment fixtures.
pub fn get_release_target_fixture(id: Option<&str>) -> ReleaseTarget {
    let resource = get_resource_fixture(None);
    let environment = get_environment_fixture(None);
    let deployment = get_deployment_fixture(None);

    ReleaseTarget {
        id: id.unwrap_or("release-target-fixture").to_owned(),
        workspace_id: WORKSPACE_FIXTURE_ID.to_owned(),

        resource_id: resource.id,
        environment_id: environment.id,
        deployment_id: deployment.id,

        desired_version_id: None,

        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    }
}

pub fn get_release_fixture(id: Option<&str>) -> Release {
    let release_target = get_release_target_fixture(None);
    let version = get_version_fixture(None);

    Release {
        id: id.unwrap_or("release-fixture").to_owned(),
        release_target_id: release_target.id,
        version_id: version.id,
        variables: BTreeMap::from([("replicas".to_owned(), json!(3))]),
        created_at: Utc.with_ymd_and_hms(2024, 3, 2, 13, 0, 0).unwrap(),
    }
}

pub fn get_job_fixture(id: Option<&str>) -> Job {
    let release = get_release_fixture(None);
    let deployment = get_deployment_fixture(None);
    let created_at = Utc.with_ymd_and_hms(2024, 3, 2, 13, 0, 0).unwrap();

    Job {
        id: id.unwrap_or("job-fixture").to_owned(),
        release_id: release.id,
        release_target_id: release.release_target_id,

        job_agent_id: deployment.job_agent_id,
        job_agent_config: deployment.job_agent_config,

        status: JobStatus::Pending,
        external_id: None,
        message: None,
        retry_count: 0,

        created_at,
        updated_at: created_at,
        started_at: None,
        completed_at: None,
    }
}

/// Enabled policy with no rules whose single target selects the environment fixture.
pub fn get_policy_fixture(id: Option<&str>) -> Policy {
    let id = id.unwrap_or("policy-fixture").to_owned();
    let environment = get_environment_fixture(None);

    Policy {
        targets: vec![PolicyTarget {
            id: format!("{}-target", id),
            policy_id: id.clone(),
            resource_selector: None,
            deployment_selector: None,
            environment_selector: Some(Condition::Name {
                operator: StringOperator::Equals,
                value: environment.name,
            }),
        }],
        id,
        workspace_id: WORKSPACE_FIXTURE_ID.to_owned(),
        name: "policy fixture".to_owned(),
        priority: 0,
        enabled: true,

        deny_windows: vec![],
        version_selector: None,
        approvals: None,
        rollout: None,
        sequencing: None,
        retry: None,

        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    }
}
