use async_trait::async_trait;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use shipyard_core::LockOutcome;

use crate::{
    models::{MembershipKind, MembershipScope},
    persistence::MembershipPersistence,
};

type MembershipRows = HashMap<MembershipScope, BTreeSet<String>>;

#[derive(Clone, Debug, Default)]
pub struct MembershipMemoryPersistence {
    rows: Arc<Mutex<MembershipRows>>,
    scope_locks: Arc<Mutex<HashSet<String>>>,
}

/// Holds a scope lock taken with [`MembershipMemoryPersistence::try_lock_scope`] until dropped.
#[derive(Debug)]
pub struct ScopeLockGuard {
    scope_locks: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for ScopeLockGuard {
    fn drop(&mut self) {
        if let Ok(mut scope_locks) = self.scope_locks.lock() {
            scope_locks.remove(&self.key);
        }
    }
}

impl MembershipMemoryPersistence {
    fn get_rows_locked(&self) -> anyhow::Result<MutexGuard<MembershipRows>> {
        match self.rows.lock() {
            Ok(locked_rows) => Ok(locked_rows),
            Err(_) => Err(anyhow::anyhow!("failed to acquire lock")),
        }
    }

    /// Takes the scope lock the way a concurrent replacement would; `None` if already held.
    pub fn try_lock_scope(&self, scope: &MembershipScope) -> anyhow::Result<Option<ScopeLockGuard>> {
        let mut scope_locks = match self.scope_locks.lock() {
            Ok(scope_locks) => scope_locks,
            Err(_) => return Err(anyhow::anyhow!("failed to acquire lock")),
        };

        let key = scope.lock_key();
        if !scope_locks.insert(key.clone()) {
            return Ok(None);
        }

        Ok(Some(ScopeLockGuard {
            scope_locks: Arc::clone(&self.scope_locks),
            key,
        }))
    }
}

#[async_trait]
impl MembershipPersistence for MembershipMemoryPersistence {
    async fn replace(
        &self,
        scope: &MembershipScope,
        entity_ids: &[String],
    ) -> anyhow::Result<LockOutcome<u64>> {
        let _guard = match self.try_lock_scope(scope)? {
            Some(guard) => guard,
            None => return Ok(LockOutcome::Contended),
        };

        let mut locked_rows = self.get_rows_locked()?;

        let entities: BTreeSet<String> = entity_ids.iter().cloned().collect();
        let inserted_count = entities.len() as u64;

        if entities.is_empty() {
            locked_rows.remove(scope);
        } else {
            locked_rows.insert(scope.clone(), entities);
        }

        Ok(LockOutcome::Acquired(inserted_count))
    }

    async fn list_entities(&self, scope: &MembershipScope) -> anyhow::Result<Vec<String>> {
        let locked_rows = self.get_rows_locked()?;

        Ok(locked_rows
            .get(scope)
            .map(|entities| entities.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_owners(
        &self,
        kind: MembershipKind,
        entity_id: &str,
    ) -> anyhow::Result<Vec<String>> {
        let locked_rows = self.get_rows_locked()?;

        let mut owners: Vec<String> = locked_rows
            .iter()
            .filter(|(scope, entities)| scope.kind == kind && entities.contains(entity_id))
            .map(|(scope, _)| scope.owner_id.clone())
            .collect();

        owners.sort();

        Ok(owners)
    }

    async fn delete_entity(&self, kind: MembershipKind, entity_id: &str) -> anyhow::Result<u64> {
        let mut locked_rows = self.get_rows_locked()?;

        let mut deleted_count = 0;
        for (scope, entities) in locked_rows.iter_mut() {
            if scope.kind == kind && entities.remove(entity_id) {
                deleted_count += 1;
            }
        }

        Ok(deleted_count)
    }
}
