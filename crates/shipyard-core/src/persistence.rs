use async_trait::async_trait;

#[async_trait]
pub trait Persistence<Model>: Send + Sync {
    async fn upsert(&self, model: &Model) -> anyhow::Result<u64>;
    async fn delete(&self, model_id: &str) -> anyhow::Result<u64>;
    async fn get_by_id(&self, model_id: &str) -> anyhow::Result<Option<Model>>;
    async fn list(&self) -> anyhow::Result<Vec<Model>>;
}

pub trait PersistableModel<Model>: Clone + Send + Sync {
    fn get_id(&self) -> String;
}

/// Result of an operation guarded by a no-wait lock.
///
/// `Contended` means another worker currently holds the lock. It is not an error:
/// callers requeue the unit of work instead of blocking or failing it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LockOutcome<T> {
    Acquired(T),
    Contended,
}

impl<T> LockOutcome<T> {
    pub fn is_contended(&self) -> bool {
        matches!(self, LockOutcome::Contended)
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> LockOutcome<U> {
        match self {
            LockOutcome::Acquired(value) => LockOutcome::Acquired(f(value)),
            LockOutcome::Contended => LockOutcome::Contended,
        }
    }
}
