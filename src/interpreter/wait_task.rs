//! `WaitInstance` (spec §4.3.7): duration parsing only. Suspension and
//! resumption bookkeeping live on
//! [`crate::workflow::instance::WorkflowInstance`], since they require
//! writing an `OutboxRow` request and recognising resumption by the
//! presence of `rawOutput`.

use std::time::Duration;

use serde_json::Value;

use crate::workflow::error::WorkflowError;

/// Parse a `wait` value: either a structured `{days,hours,minutes,seconds,
/// milliseconds}` object or an ISO-8601 duration string (`P1DT2H30M15S`).
pub fn parse_duration(value: &Value) -> Result<Duration, WorkflowError> {
    match value {
        Value::Object(map) => {
            let days = field(map, "days");
            let hours = field(map, "hours");
            let minutes = field(map, "minutes");
            let seconds = field(map, "seconds");
            let millis = field(map, "milliseconds");
            let total_seconds = days * 86_400.0 + hours * 3_600.0 + minutes * 60.0 + seconds;
            Ok(Duration::from_secs_f64(total_seconds) + Duration::from_millis(millis as u64))
        }
        Value::String(s) => iso8601_duration::Duration::parse(s)
            .map_err(|_| WorkflowError::configuration(format!("invalid ISO-8601 duration `{s}`")))
            .and_then(|d| {
                d.to_std().ok_or_else(|| {
                    WorkflowError::configuration(format!("invalid ISO-8601 duration `{s}`"))
                })
            }),
        other => Err(WorkflowError::configuration(format!(
            "`wait` must be a duration object or ISO-8601 string, got {other}"
        ))),
    }
}

fn field(map: &serde_json::Map<String, Value>, key: &str) -> f64 {
    map.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_structured_duration() {
        let value = json!({"days": 1, "hours": 2, "minutes": 30, "seconds": 15});
        let duration = parse_duration(&value).unwrap();
        assert_eq!(duration.as_secs(), 95_415);
    }

    #[test]
    fn parses_iso8601_string() {
        let duration = parse_duration(&json!("PT30M")).unwrap();
        assert_eq!(duration.as_secs(), 1_800);
    }

    #[test]
    fn rejects_non_duration_values() {
        assert!(parse_duration(&json!(42)).is_err());
    }
}
