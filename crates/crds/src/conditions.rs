//! Status conditions
//!
//! Kubernetes-style conditions recorded on `VirtualMachineImport` status.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Import finished (True) or failed permanently (False)
pub const CONDITION_SUCCEEDED: &str = "Succeeded";
/// Admission checks passed
pub const CONDITION_VALID: &str = "Valid";
/// Every source network and disk resolved through the mapping rules
pub const CONDITION_MAPPING_RULES_VERIFIED: &str = "MappingRulesVerified";
/// Import is progressing; the reason names the current step
pub const CONDITION_PROCESSING: &str = "Processing";
/// Prefix of the per-check condition types (`Validation.<check-id>`)
pub const CONDITION_VALIDATION_PREFIX: &str = "Validation.";
/// The configured OS mapping override could not be applied (False while built-ins are in use)
pub const CONDITION_OS_MAP_OVERRIDE: &str = "OSMapOverrideApplied";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "Succeeded", "Valid")
    #[serde(rename = "type")]
    pub condition_type: String,
    
    pub status: ConditionStatus,
    
    /// Machine-readable reason in CamelCase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    
    /// Last time the status changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: Some(reason.into()),
            message: Some(message.into()),
            last_transition_time: Some(Utc::now()),
        }
    }
}

/// Finds a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// Inserts or replaces a condition of the same type.
///
/// The previous transition time is kept when the status did not change, so
/// repeated passes that re-assert the same condition do not produce status churn.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.condition_type == condition.condition_type) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        let mut first = Condition::new(CONDITION_VALID, ConditionStatus::True, "Ok", "first");
        first.last_transition_time = Some(DateTime::<Utc>::from_timestamp(1_000, 0).unwrap());
        set_condition(&mut conditions, first);

        set_condition(&mut conditions, Condition::new(CONDITION_VALID, ConditionStatus::True, "Ok", "second"));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message.as_deref(), Some("second"));
        assert_eq!(conditions[0].last_transition_time.unwrap().timestamp(), 1_000);
    }

    #[test]
    fn test_set_condition_appends_new_type() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, Condition::new(CONDITION_VALID, ConditionStatus::True, "Ok", ""));
        set_condition(&mut conditions, Condition::new(CONDITION_PROCESSING, ConditionStatus::True, "Copying", ""));
        assert_eq!(conditions.len(), 2);
        assert!(find_condition(&conditions, CONDITION_PROCESSING).is_some());
    }
}
