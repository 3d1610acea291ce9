use super::crd::{Condition, ConditionStatus, ConditionType};
use chrono::{SubsecRound, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Current time at the second precision the API server stores
pub fn now() -> Time {
    Time(Utc::now().trunc_subsecs(0))
}

pub fn find(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Upsert a condition in place
///
/// `last_transition_time` only moves when the status value changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: &Time,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = Some(now.clone());
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        }
        None => conditions.push(Condition {
            type_,
            status,
            last_transition_time: Some(now.clone()),
            reason: reason.to_string(),
            message: message.to_string(),
        }),
    }
}
