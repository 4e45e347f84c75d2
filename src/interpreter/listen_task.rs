//! `ListenInstance` (supplemented, SPEC_FULL §11): correlation-filter
//! matching only. Suspension (`WAITING`, no outbox row — parked in a
//! [`crate::persistence::ListenStore`] instead) and resumption on a
//! matching inbound event are driven by
//! [`crate::worker::consumer::Consumer::handle_event`].

use serde_json::Value;

use crate::workflow::task::ListenToSpec;

/// Whether `event` satisfies `to`'s correlation filter. `to.with` is a
/// key/value map compared the same way a `try/catch`'s `errors.with`
/// filter is: every declared key must be present in the event and equal.
///
/// `to.mode` doesn't change this: `with` is a single filter, not a list of
/// per-mode filters, so `One`/`Any`/`All` are presently indistinguishable
/// under this data model — the field is carried for forward compatibility
/// with a real per-filter-list `all`/`any`.
pub fn matches(to: &ListenToSpec, event: &Value) -> bool {
    to.with.iter().all(|(key, expected)| {
        event
            .get(key)
            .map(|actual| values_match(actual, expected))
            .unwrap_or(false)
    })
}

fn values_match(a: &Value, b: &Value) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::task::ListenMode;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn matches_when_every_filter_key_is_equal() {
        let mut with = BTreeMap::new();
        with.insert("type".to_string(), json!("order.created"));
        let to = ListenToSpec {
            mode: ListenMode::One,
            with,
        };
        assert!(matches(&to, &json!({"type": "order.created", "id": 1})));
        assert!(!matches(&to, &json!({"type": "order.cancelled"})));
    }

    #[test]
    fn an_empty_filter_matches_any_event() {
        let to = ListenToSpec {
            mode: ListenMode::Any,
            with: BTreeMap::new(),
        };
        assert!(matches(&to, &json!({"type": "anything"})));
    }
}
