use chrono::{DateTime, Datelike, Duration, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use shipyard_core::{Condition, PersistableModel};

use super::{Deployment, Environment, Resource};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PolicyTarget {
    pub id: String,
    pub policy_id: String,

    pub resource_selector: Option<Condition>,
    pub deployment_selector: Option<Condition>,
    pub environment_selector: Option<Condition>,
}

impl PolicyTarget {
    /// A target with no selectors at all matches nothing; otherwise every selector that is
    /// present must match.
    pub fn matches(
        &self,
        resource: &Resource,
        environment: &Environment,
        deployment: &Deployment,
    ) -> bool {
        if self.resource_selector.is_none()
            && self.deployment_selector.is_none()
            && self.environment_selector.is_none()
        {
            return false;
        }

        let resource_matches = match &self.resource_selector {
            Some(selector) => selector.matches(resource),
            None => true,
        };
        let deployment_matches = match &self.deployment_selector {
            Some(selector) => selector.matches(deployment),
            None => true,
        };
        let environment_matches = match &self.environment_selector {
            Some(selector) => selector.matches(environment),
            None => true,
        };

        resource_matches && deployment_matches && environment_matches
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceFrequency {
    Hourly,
    Daily,
    Weekly,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Recurrence {
    pub frequency: RecurrenceFrequency,
    #[serde(default = "default_interval")]
    pub interval: u32,
    #[serde(default)]
    pub by_weekday: Vec<Weekday>,
    pub until: Option<DateTime<Utc>>,
}

fn default_interval() -> u32 {
    1
}

impl Recurrence {
    fn occurrence_covering(
        &self,
        first_start: DateTime<Utc>,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let interval = self.interval.max(1) as i64;

        let occurrence = match self.frequency {
            RecurrenceFrequency::Hourly => {
                Self::fixed_period_occurrence(first_start, Duration::hours(interval), duration, now)
            }
            RecurrenceFrequency::Daily => {
                Self::fixed_period_occurrence(first_start, Duration::days(interval), duration, now)
            }
            RecurrenceFrequency::Weekly if self.by_weekday.is_empty() => {
                Self::fixed_period_occurrence(first_start, Duration::weeks(interval), duration, now)
            }
            RecurrenceFrequency::Weekly => self.weekday_occurrence(first_start, duration, now),
        }?;

        match self.until {
            Some(until) if occurrence > until => None,
            _ => Some(occurrence),
        }
    }

    fn fixed_period_occurrence(
        first_start: DateTime<Utc>,
        period: Duration,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let period_seconds = period.num_seconds();
        let elapsed_seconds = (now - first_start).num_seconds();
        let latest = elapsed_seconds / period_seconds;
        let lookback = duration.num_seconds() / period_seconds;

        (0..=lookback.min(latest))
            .map(|back| first_start + Duration::seconds((latest - back) * period_seconds))
            .find(|start| *start <= now && now < *start + duration)
    }

    fn weekday_occurrence(
        &self,
        first_start: DateTime<Utc>,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let interval = self.interval.max(1) as i64;
        let first_date = first_start.date_naive();
        let anchor_week =
            first_date - Duration::days(first_date.weekday().num_days_from_monday() as i64);

        (0..=duration.num_days() + 1)
            .filter_map(|days_back| {
                let date = (now - Duration::days(days_back)).date_naive();
                if !self.by_weekday.contains(&date.weekday()) {
                    return None;
                }

                let week = date - Duration::days(date.weekday().num_days_from_monday() as i64);
                if ((week - anchor_week).num_days() / 7) % interval != 0 {
                    return None;
                }

                Some(Utc.from_utc_datetime(&date.and_time(first_start.time())))
            })
            .find(|start| *start >= first_start && *start <= now && now < *start + duration)
    }
}

/// A period during which no new release may roll out.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DenyWindow {
    pub name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub recurrence: Option<Recurrence>,
}

impl DenyWindow {
    /// End of the occurrence covering `now`, if any.
    pub fn active_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let duration = self.ends_at - self.starts_at;
        if now < self.starts_at || duration <= Duration::zero() {
            return None;
        }

        match &self.recurrence {
            None => (now < self.ends_at).then_some(self.ends_at),
            Some(recurrence) => recurrence
                .occurrence_covering(self.starts_at, duration, now)
                .map(|start| start + duration),
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.active_until(now).is_some()
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AnyApproval {
    pub min_approvals: u32,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct UserApproval {
    pub user_id: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RoleApproval {
    pub role_id: String,
    pub min_approvals: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ApprovalRequirements {
    pub any: Option<AnyApproval>,
    #[serde(default)]
    pub users: Vec<UserApproval>,
    #[serde(default)]
    pub roles: Vec<RoleApproval>,
}

impl ApprovalRequirements {
    pub fn is_empty(&self) -> bool {
        self.any.is_none() && self.users.is_empty() && self.roles.is_empty()
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RolloutRule {
    pub duration_seconds: i64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseSequencing {
    /// Hold newer versions back while a job is in flight.
    Wait,
    /// Let newer versions through and cancel in-flight jobs when they dispatch.
    Cancel,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RetryRule {
    pub max_retries: i32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Policy {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    pub enabled: bool,

    #[serde(default)]
    pub targets: Vec<PolicyTarget>,

    #[serde(default)]
    pub deny_windows: Vec<DenyWindow>,
    pub version_selector: Option<Condition>,
    pub approvals: Option<ApprovalRequirements>,
    pub rollout: Option<RolloutRule>,
    pub sequencing: Option<ReleaseSequencing>,
    pub retry: Option<RetryRule>,

    pub created_at: DateTime<Utc>,
}

impl Policy {
    pub fn validate(&self) -> anyhow::Result<()> {
        for target in self.targets.iter() {
            if target.policy_id != self.id {
                return Err(anyhow::anyhow!(
                    "policy target {} belongs to policy {}, not {}",
                    target.id,
                    target.policy_id,
                    self.id
                ));
            }

            for selector in [
                &target.resource_selector,
                &target.deployment_selector,
                &target.environment_selector,
            ]
            .into_iter()
            .flatten()
            {
                selector.validate()?;
            }
        }

        if let Some(selector) = &self.version_selector {
            selector.validate()?;
        }

        for deny_window in self.deny_windows.iter() {
            if deny_window.ends_at <= deny_window.starts_at {
                return Err(anyhow::anyhow!(
                    "deny window '{}' must end after it starts",
                    deny_window.name
                ));
            }
        }

        if let Some(rollout) = &self.rollout {
            if rollout.duration_seconds < 0 {
                return Err(anyhow::anyhow!("rollout duration must not be negative"));
            }
        }

        if let Some(retry) = &self.retry {
            if retry.max_retries < 0 {
                return Err(anyhow::anyhow!("max retries must not be negative"));
            }
        }

        Ok(())
    }

    /// Orders policies by priority, highest first, with ties broken by id.
    pub fn sort_by_priority(policies: &mut [Policy]) {
        policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    }
}

impl PersistableModel<Policy> for Policy {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_one_off_deny_window() {
        let window = DenyWindow {
            name: "freeze".to_owned(),
            starts_at: at(1, 9),
            ends_at: at(1, 17),
            recurrence: None,
        };

        assert!(!window.is_active(at(1, 8)));
        assert!(window.is_active(at(1, 9)));
        assert_eq!(window.active_until(at(1, 12)), Some(at(1, 17)));
        assert!(!window.is_active(at(1, 17)));
    }

    #[test]
    fn test_daily_recurring_deny_window() {
        let window = DenyWindow {
            name: "business-hours".to_owned(),
            starts_at: at(1, 9),
            ends_at: at(1, 17),
            recurrence: Some(Recurrence {
                frequency: RecurrenceFrequency::Daily,
                interval: 1,
                by_weekday: vec![],
                until: Some(at(10, 0)),
            }),
        };

        assert!(window.is_active(at(5, 10)));
        assert_eq!(window.active_until(at(5, 10)), Some(at(5, 17)));
        assert!(!window.is_active(at(5, 18)));
        assert!(!window.is_active(at(12, 10)));
    }

    #[test]
    fn test_weekly_deny_window_on_weekdays() {
        // 2024-01-01 is a Monday
        let window = DenyWindow {
            name: "weekend".to_owned(),
            starts_at: at(6, 0),
            ends_at: at(7, 0),
            recurrence: Some(Recurrence {
                frequency: RecurrenceFrequency::Weekly,
                interval: 1,
                by_weekday: vec![Weekday::Sat, Weekday::Sun],
                until: None,
            }),
        };

        assert!(window.is_active(at(13, 12)));
        assert!(window.is_active(at(14, 12)));
        assert!(!window.is_active(at(15, 12)));
        assert!(!window.is_active(at(5, 12)));
    }

    #[test]
    fn test_policy_sort_by_priority() {
        let policy = |id: &str, priority| Policy {
            id: id.to_owned(),
            workspace_id: "workspace".to_owned(),
            name: id.to_owned(),
            priority,
            enabled: true,
            targets: vec![],
            deny_windows: vec![],
            version_selector: None,
            approvals: None,
            rollout: None,
            sequencing: None,
            retry: None,
            created_at: Utc::now(),
        };

        let mut policies = vec![policy("b", 1), policy("c", 5), policy("a", 1)];
        Policy::sort_by_priority(&mut policies);

        let ids: Vec<&str> = policies.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
