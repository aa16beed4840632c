//! Standard condition handling for CRD statuses

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kubernetes-style status condition.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Ready` or `Validated`
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`
    pub status: String,
    /// Machine-readable reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the condition last flipped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Insert or replace the condition with the same type, stamping the
/// transition time when the status actually changes.
pub fn upsert_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                condition.last_transition_time = Some(Utc::now());
            } else {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(Utc::now());
            conditions.push(condition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(status: &str) -> Condition {
        Condition {
            type_: "Ready".into(),
            status: status.into(),
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    #[test]
    fn upsert_replaces_same_type() {
        let mut conditions = Vec::new();
        upsert_condition(&mut conditions, ready("False"));
        upsert_condition(&mut conditions, ready("True"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
    }

    #[test]
    fn transition_time_kept_when_status_unchanged() {
        let mut conditions = Vec::new();
        upsert_condition(&mut conditions, ready("True"));
        let first = conditions[0].last_transition_time;
        upsert_condition(&mut conditions, ready("True"));
        assert_eq!(conditions[0].last_transition_time, first);
    }
}
