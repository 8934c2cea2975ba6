mod approval;
mod catalog;
mod job;
mod lock;
mod membership;
mod policy;
mod release;
mod release_target;
mod resource;

pub use approval::ApprovalRelationalPersistence;
pub use catalog::{
    DeploymentRelationalPersistence, EnvironmentRelationalPersistence,
    VariableRelationalPersistence, VersionRelationalPersistence,
};
pub use job::JobRelationalPersistence;
pub use lock::LockRelationalPersistence;
pub use membership::MembershipRelationalPersistence;
pub use policy::PolicyRelationalPersistence;
pub use release::ReleaseRelationalPersistence;
pub use release_target::ReleaseTargetRelationalPersistence;
pub use resource::{RelationshipRelationalPersistence, ResourceRelationalPersistence};

/// SQLSTATE raised by `FOR UPDATE NOWAIT` when the row is locked elsewhere.
const LOCK_NOT_AVAILABLE: &str = "55P03";

pub(crate) fn is_lock_not_available(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE),
        _ => false,
    }
}

#[cfg(test)]
pub mod tests {
    use sqlx::{postgres::PgPoolOptions, PgPool};
    use std::sync::Arc;

    pub async fn ensure_fixtures() -> Arc<PgPool> {
        dotenvy::from_filename(".env.test").ok();

        let database_url = dotenvy::var("DATABASE_URL").unwrap();
        let db = Arc::new(
            PgPoolOptions::new()
                .max_connections(5)
                .connect(&database_url)
                .await
                .unwrap(),
        );

        sqlx::migrate!().run(&*db).await.unwrap();

        db
    }
}
