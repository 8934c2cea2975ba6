use shipyard_core::EventStream;
use shipyard_postgresql_stream::PostgresqlEventStream;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

use crate::{
    config::ServiceConfig,
    persistence::PersistenceSet,
    policy::{
        ApprovalRule, DenyWindowRule, DependencyRule, PolicyEngine, RolloutRule, Rule,
        SequencingRule,
    },
    reconciliation::{JobLifecycle, Reconciler, ReleaseManager},
    services::{
        ApprovalService, DeploymentService, EnvironmentService, JobService, MembershipService,
        PolicyService, ReleaseService, ReleaseTargetService, ResourceService, VariableService,
        VersionService,
    },
};

/// Every service of the system wired to one persistence backend and one event stream.
#[derive(Debug)]
pub struct ServiceContext {
    pub event_stream: Arc<dyn EventStream>,

    pub approval_service: Arc<ApprovalService>,
    pub deployment_service: Arc<DeploymentService>,
    pub environment_service: Arc<EnvironmentService>,
    pub job_service: Arc<JobService>,
    pub membership_service: Arc<MembershipService>,
    pub policy_service: Arc<PolicyService>,
    pub release_service: Arc<ReleaseService>,
    pub release_target_service: Arc<ReleaseTargetService>,
    pub resource_service: Arc<ResourceService>,
    pub variable_service: Arc<VariableService>,
    pub version_service: Arc<VersionService>,

    pub policy_engine: Arc<PolicyEngine>,
    pub release_manager: Arc<ReleaseManager>,
    pub job_lifecycle: Arc<JobLifecycle>,
    pub reconciler: Arc<Reconciler>,
}

impl ServiceContext {
    pub fn new(persistence: PersistenceSet, event_stream: Arc<dyn EventStream>) -> Self {
        let PersistenceSet {
            approvals,
            deployments,
            environments,
            jobs,
            locks,
            memberships,
            policies,
            relationships,
            releases,
            release_targets,
            resources,
            variables,
            versions,
        } = persistence;

        let resource_service = Arc::new(ResourceService {
            persistence: resources,
            relationship_persistence: relationships,
            event_stream: Arc::clone(&event_stream),
        });

        let environment_service = Arc::new(EnvironmentService {
            persistence: environments,
            event_stream: Arc::clone(&event_stream),
        });

        let deployment_service = Arc::new(DeploymentService {
            persistence: deployments,
            event_stream: Arc::clone(&event_stream),
        });

        let policy_service = Arc::new(PolicyService {
            persistence: policies,
            event_stream: Arc::clone(&event_stream),
        });

        let version_service = Arc::new(VersionService {
            persistence: versions,
            event_stream: Arc::clone(&event_stream),
            deployment_service: Arc::clone(&deployment_service),
        });

        let variable_service = Arc::new(VariableService {
            persistence: variables,
            event_stream: Arc::clone(&event_stream),
            deployment_service: Arc::clone(&deployment_service),
        });

        let membership_service = Arc::new(MembershipService {
            persistence: memberships,
            release_target_persistence: Arc::clone(&release_targets),
            resource_service: Arc::clone(&resource_service),
            environment_service: Arc::clone(&environment_service),
            deployment_service: Arc::clone(&deployment_service),
            policy_service: Arc::clone(&policy_service),
        });

        let release_target_service = Arc::new(ReleaseTargetService {
            persistence: release_targets,
            lock_persistence: locks,
            event_stream: Arc::clone(&event_stream),
            deployment_service: Arc::clone(&deployment_service),
            environment_service: Arc::clone(&environment_service),
            membership_service: Arc::clone(&membership_service),
            resource_service: Arc::clone(&resource_service),
            version_service: Arc::clone(&version_service),
        });

        let approval_service = Arc::new(ApprovalService {
            persistence: approvals,
            event_stream: Arc::clone(&event_stream),
            environment_service: Arc::clone(&environment_service),
            release_target_service: Arc::clone(&release_target_service),
            version_service: Arc::clone(&version_service),
        });

        let release_service = Arc::new(ReleaseService {
            persistence: releases,
            event_stream: Arc::clone(&event_stream),
        });

        let job_service = Arc::new(JobService {
            persistence: jobs,
            event_stream: Arc::clone(&event_stream),
        });

        let rules: Vec<Box<dyn Rule>> = vec![
            Box::new(DenyWindowRule),
            Box::new(ApprovalRule {
                approval_service: Arc::clone(&approval_service),
            }),
            Box::new(DependencyRule {
                job_service: Arc::clone(&job_service),
                release_service: Arc::clone(&release_service),
                release_target_service: Arc::clone(&release_target_service),
                resource_service: Arc::clone(&resource_service),
                version_service: Arc::clone(&version_service),
            }),
            Box::new(RolloutRule),
            Box::new(SequencingRule {
                job_service: Arc::clone(&job_service),
                release_service: Arc::clone(&release_service),
            }),
        ];

        let policy_engine = Arc::new(PolicyEngine {
            rules,
            deployment_service: Arc::clone(&deployment_service),
            environment_service: Arc::clone(&environment_service),
            membership_service: Arc::clone(&membership_service),
            policy_service: Arc::clone(&policy_service),
            resource_service: Arc::clone(&resource_service),
            version_service: Arc::clone(&version_service),
        });

        let release_manager = Arc::new(ReleaseManager {
            policy_engine: Arc::clone(&policy_engine),
            release_service: Arc::clone(&release_service),
            release_target_service: Arc::clone(&release_target_service),
            variable_service: Arc::clone(&variable_service),
            version_service: Arc::clone(&version_service),
        });

        let job_lifecycle = Arc::new(JobLifecycle {
            event_stream: Arc::clone(&event_stream),
            policy_engine: Arc::clone(&policy_engine),
            deployment_service: Arc::clone(&deployment_service),
            job_service: Arc::clone(&job_service),
            release_service: Arc::clone(&release_service),
            release_target_service: Arc::clone(&release_target_service),
            resource_service: Arc::clone(&resource_service),
            version_service: Arc::clone(&version_service),
        });

        let reconciler = Arc::new(Reconciler {
            event_stream: Arc::clone(&event_stream),
            job_lifecycle: Arc::clone(&job_lifecycle),
            membership_service: Arc::clone(&membership_service),
            release_manager: Arc::clone(&release_manager),
            release_target_service: Arc::clone(&release_target_service),
        });

        Self {
            event_stream,

            approval_service,
            deployment_service,
            environment_service,
            job_service,
            membership_service,
            policy_service,
            release_service,
            release_target_service,
            resource_service,
            variable_service,
            version_service,

            policy_engine,
            release_manager,
            job_lifecycle,
            reconciler,
        }
    }

    /// PostgreSQL persistence and event stream, with migrations applied.
    pub async fn connect(config: &ServiceConfig) -> anyhow::Result<Self> {
        let db = Arc::new(
            PgPoolOptions::new()
                .max_connections(config.db_max_connections)
                .connect(&config.database_url)
                .await?,
        );

        sqlx::migrate!().run(&*db).await?;

        let event_stream = PostgresqlEventStream {
            dedup_ttl: chrono::Duration::from_std(config.dedup_ttl)?,
            ..PostgresqlEventStream::new(Arc::clone(&db), config.subscribers.clone())
        };

        Ok(Self::new(
            PersistenceSet::relational(db),
            Arc::new(event_stream),
        ))
    }

    /// Memory persistence with a subscriber-less memory stream, read with `receive("")`.
    #[cfg(test)]
    pub fn memory() -> Self {
        let event_stream = shipyard_memory_stream::MemoryEventStream::new()
            .expect("memory event stream");

        Self::new(PersistenceSet::memory(), Arc::new(event_stream))
    }

    /// Runs the reconciler in this process, without a separate `reconciler` binary: events
    /// are consumed as `consumer_id` until the stream is empty or `max_events` were
    /// processed. Returns how many events were handled. The first failing event stops the
    /// run and stays unacknowledged.
    pub async fn drain(&self, consumer_id: &str, max_events: usize) -> anyhow::Result<usize> {
        let mut processed = 0;

        while processed < max_events {
            let events = self.event_stream.receive(consumer_id).await?;
            if events.is_empty() {
                break;
            }

            for event in events.iter() {
                self.reconciler.process(event).await?;
                self.event_stream.delete(event, consumer_id).await?;
                processed += 1;
            }
        }

        Ok(processed)
    }
}
