//! ClusterOperator condition helpers
//!
//! `lastTransitionTime` only moves when a condition's status changes, so a
//! resync that re-asserts the same state leaves the object untouched.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crd::Condition;

pub const CONDITION_TYPE_AVAILABLE: &str = "Available";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";
pub const CONDITION_TYPE_UPGRADEABLE: &str = "Upgradeable";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Update or add a condition. Returns true if anything changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status == status && existing.reason == reason && existing.message == message {
            return false;
        }
        if existing.status != status {
            existing.last_transition_time = stamp;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        return true;
    }

    conditions.push(Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_transition_time: stamp,
        reason: reason.to_string(),
        message: message.to_string(),
    });
    true
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(Condition::is_true)
        .unwrap_or(false)
}

/// Parsed `lastTransitionTime`, if well formed.
pub fn transition_time(condition: &Condition) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&condition.last_transition_time)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        let changed = set_condition(
            &mut conditions,
            CONDITION_TYPE_AVAILABLE,
            CONDITION_STATUS_TRUE,
            "AsExpected",
            "available",
            Utc::now(),
        );

        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert!(is_condition_true(&conditions, CONDITION_TYPE_AVAILABLE));
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_DEGRADED));
    }

    #[test]
    fn test_transition_time_moves_only_on_status_change() {
        let t0 = Utc::now();
        let mut conditions = Vec::new();
        set_condition(&mut conditions, CONDITION_TYPE_DEGRADED, CONDITION_STATUS_FALSE, "", "", t0);
        let first = conditions[0].last_transition_time.clone();

        // same status, new message
        let changed = set_condition(
            &mut conditions,
            CONDITION_TYPE_DEGRADED,
            CONDITION_STATUS_FALSE,
            "",
            "still fine",
            t0 + Duration::minutes(1),
        );
        assert!(changed);
        assert_eq!(conditions[0].last_transition_time, first);

        // identical
        assert!(!set_condition(
            &mut conditions,
            CONDITION_TYPE_DEGRADED,
            CONDITION_STATUS_FALSE,
            "",
            "still fine",
            t0 + Duration::minutes(2),
        ));

        set_condition(
            &mut conditions,
            CONDITION_TYPE_DEGRADED,
            CONDITION_STATUS_TRUE,
            "SyncingFailed",
            "boom",
            t0 + Duration::minutes(3),
        );
        assert_ne!(conditions[0].last_transition_time, first);
        let moved = transition_time(&conditions[0]).unwrap();
        assert_eq!(moved.timestamp(), (t0 + Duration::minutes(3)).timestamp());
    }

    #[test]
    fn test_find_condition() {
        let mut conditions = Vec::new();
        let now = Utc::now();
        set_condition(&mut conditions, CONDITION_TYPE_PROGRESSING, CONDITION_STATUS_TRUE, "Syncing", "", now);
        assert!(find_condition(&conditions, CONDITION_TYPE_PROGRESSING).is_some());
        assert!(find_condition(&conditions, CONDITION_TYPE_UPGRADEABLE).is_none());
    }
}
