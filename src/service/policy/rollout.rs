use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{Rule, RuleContext, RuleResult};
use crate::models::DeploymentVersion;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub fn fnv1a32(value: &str) -> u32 {
    value.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ byte as u32).wrapping_mul(FNV_PRIME)
    })
}

/// Identity of the release a candidate would become on a target.
pub fn rollout_key(release_target_id: &str, version_id: &str) -> String {
    format!("{}:{}", release_target_id, version_id)
}

/// Share of targets, 0 to 100, a version has reached `elapsed` into a rollout of
/// `duration_seconds`.
pub fn rollout_percentage(elapsed: Duration, duration_seconds: i64) -> f64 {
    if duration_seconds <= 0 {
        return 100.0;
    }

    let elapsed_seconds = elapsed.num_milliseconds().max(0) as f64 / 1000.0;
    (elapsed_seconds / duration_seconds as f64 * 100.0).min(100.0)
}

/// Bucket, 0 to 100, a release falls in.
pub fn rollout_bucket(key: &str) -> u32 {
    fnv1a32(key) % 101
}

/// Whether the release keyed `key` has entered a rollout of `duration_seconds` begun at
/// `released_at`, i.e. `bucket <= min(elapsed / duration * 100, 100)`.
pub fn is_rolled_out(
    key: &str,
    released_at: DateTime<Utc>,
    duration_seconds: i64,
    now: DateTime<Utc>,
) -> bool {
    if duration_seconds <= 0 {
        return true;
    }

    let elapsed_ms = (now - released_at).num_milliseconds().max(0) as i128;
    let bucket = rollout_bucket(key) as i128;

    bucket * duration_seconds as i128 * 1000 <= elapsed_ms * 100
}

/// Instant a release enters the rollout.
pub fn rolled_out_at(key: &str, released_at: DateTime<Utc>, duration_seconds: i64) -> DateTime<Utc> {
    let bucket = rollout_bucket(key) as i64;
    released_at + Duration::milliseconds(duration_seconds.max(0) * 10 * bucket)
}

fn describe_remaining(remaining: Duration) -> String {
    let minutes = remaining.num_minutes();

    if minutes >= 120 {
        format!("{} hours", minutes / 60)
    } else if minutes >= 1 {
        format!("{} minutes", minutes)
    } else {
        format!("{} seconds", remaining.num_seconds().max(1))
    }
}

/// Spreads a new version over the targets of a deployment in proportion to time elapsed
/// since the version was created.
#[derive(Debug, Default)]
pub struct RolloutRule;

#[async_trait]
impl Rule for RolloutRule {
    fn name(&self) -> &'static str {
        "rollout"
    }

    async fn filter(
        &self,
        context: &RuleContext,
        candidates: Vec<DeploymentVersion>,
    ) -> anyhow::Result<RuleResult> {
        let rollout = match context
            .policies
            .iter()
            .find_map(|policy| policy.rollout.as_ref())
        {
            Some(rollout) => rollout,
            None => return Ok(RuleResult::allow(candidates)),
        };

        let mut allowed = Vec::new();
        let mut first_reason = None;

        for candidate in candidates {
            let key = rollout_key(&context.release_target.id, &candidate.id);

            if is_rolled_out(
                &key,
                candidate.created_at,
                rollout.duration_seconds,
                context.now,
            ) {
                allowed.push(candidate);
                continue;
            }

            if first_reason.is_none() {
                let remaining = rolled_out_at(&key, candidate.created_at, rollout.duration_seconds)
                    - context.now;
                let percentage =
                    rollout_percentage(context.now - candidate.created_at, rollout.duration_seconds);
                first_reason = Some(format!(
                    "version {} is {:.0}% rolled out and reaches this target in about {}",
                    candidate.tag,
                    percentage,
                    describe_remaining(remaining)
                ));
            }
        }

        Ok(RuleResult {
            allowed,
            reason: first_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{Policy, RolloutRule as Rollout},
        policy::tests::rule_context,
        test::{get_policy_fixture, get_version_fixture},
    };
    use chrono::TimeZone;

    #[test]
    fn test_fnv1a32_vectors() {
        assert_eq!(fnv1a32(""), 0x811c_9dc5);
        assert_eq!(fnv1a32("a"), 0xe40c_292c);
        assert_eq!(fnv1a32("foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_rollout_percentage() {
        assert_eq!(rollout_percentage(Duration::seconds(30), 60), 50.0);
        assert_eq!(rollout_percentage(Duration::seconds(120), 60), 100.0);
        assert_eq!(rollout_percentage(Duration::seconds(-5), 60), 0.0);
        assert_eq!(rollout_percentage(Duration::zero(), 0), 100.0);
    }

    #[tokio::test]
    async fn test_fresh_version_waits_for_its_bucket() {
        let version = get_version_fixture(None);

        let mut context = rule_context();
        context.policies = vec![Policy {
            rollout: Some(Rollout {
                duration_seconds: 3600,
            }),
            ..get_policy_fixture(None)
        }];

        // the fixture target falls in bucket 42: 42% of an hour after creation
        context.now = version.created_at;
        let result = RolloutRule
            .filter(&context, vec![version.clone()])
            .await
            .unwrap();
        assert!(result.allowed.is_empty());
        assert_eq!(
            result.reason.as_deref(),
            Some("version 1.0.0 is 0% rolled out and reaches this target in about 25 minutes")
        );

        context.now = version.created_at + Duration::seconds(1500);
        let result = RolloutRule
            .filter(&context, vec![version.clone()])
            .await
            .unwrap();
        assert!(result.allowed.is_empty());
        assert!(result.reason.unwrap().ends_with("about 12 seconds"));

        context.now = version.created_at + Duration::seconds(1512);
        let result = RolloutRule
            .filter(&context, vec![version.clone()])
            .await
            .unwrap();
        assert_eq!(result.allowed, vec![version.clone()]);
        assert!(result.reason.is_none());

        context.policies[0].rollout = None;
        context.now = version.created_at;
        let result = RolloutRule.filter(&context, vec![version]).await.unwrap();
        assert_eq!(result.allowed.len(), 1);
    }

    #[test]
    fn test_rollout_is_monotonic() {
        let released_at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let duration_seconds = 3600;

        for key in ["target-1:version-1", "target-2:version-1", "target-3:version-9"] {
            let mut allowed_before = false;

            for minute in 0..=70 {
                let now = released_at + Duration::minutes(minute);
                let allowed = is_rolled_out(key, released_at, duration_seconds, now);

                assert!(allowed || !allowed_before, "{} regressed at minute {}", key, minute);
                allowed_before = allowed;
            }

            assert!(allowed_before);
            assert!(is_rolled_out(
                key,
                released_at,
                duration_seconds,
                rolled_out_at(key, released_at, duration_seconds)
            ));
        }
    }
}
