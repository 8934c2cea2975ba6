use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::PersistableModel;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ReleaseTargetLock {
    pub id: String,
    pub release_target_id: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub unlocked_by: Option<String>,
}

impl ReleaseTargetLock {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.unlocked_at.is_some() {
            return false;
        }

        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

impl PersistableModel<ReleaseTargetLock> for ReleaseTargetLock {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}
