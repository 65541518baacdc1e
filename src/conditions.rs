use crate::resources::CloudflareTunnel;
use chrono::prelude::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    Condition,
    Time,
};

const READY: &str = "Ready";

pub(crate) fn error_condition(
    current: &CloudflareTunnel,
    reason: impl ToString,
    message: impl ToString,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: READY.to_string(),
        status: "False".to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: transition_time(current, false),
        observed_generation,
    }
}

pub(crate) fn success_condition(current: &CloudflareTunnel, observed_generation: Option<i64>) -> Condition {
    Condition {
        type_: READY.to_string(),
        status: "True".to_string(),
        reason: "TunnelReady".to_string(),
        message: "Tunnel created and configured".to_string(),
        last_transition_time: transition_time(current, true),
        observed_generation,
    }
}

/// Keeps the previous transition time unless readiness flips.
fn transition_time(current: &CloudflareTunnel, ready: bool) -> Time {
    let last = current
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|condition| condition.type_ == READY));

    match last {
        Some(condition) if (condition.status == "True") == ready => condition.last_transition_time.clone(),
        _ => Time(Utc::now()),
    }
}

/// Replaces the condition of the same type, or appends it.
pub(crate) fn upsert_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}
