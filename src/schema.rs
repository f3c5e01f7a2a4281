//! Envelope validation at the trust boundary of the control channel
//!
//! Anything read off the socket is an arbitrary JSON value until it passes
//! [`validate`]. The check is shallow: it enforces the
//! envelope shape and the closed kind set, and leaves payload contents to
//! whoever handles the specific kind.

use crate::error::{ControlError, Result};
use crate::types::{Envelope, MessageKind};
use serde_json::Value;

/// Check a candidate against the envelope contract, naming the failed rule
pub fn check(candidate: &Value) -> std::result::Result<(), &'static str> {
    let map = candidate.as_object().ok_or("message is not an object")?;

    let kind = match map.get("type") {
        None => return Err("missing 'type'"),
        Some(Value::String(kind)) => kind,
        Some(_) => return Err("'type' is not a string"),
    };
    if kind.parse::<MessageKind>().is_err() {
        return Err("'type' is not a known message kind");
    }

    if map.get("id").is_some_and(|v| !v.is_string()) {
        return Err("'id' is not a string");
    }
    if map.get("workerId").is_some_and(|v| !v.is_string()) {
        return Err("'workerId' is not a string");
    }
    if map.get("payload").is_some_and(|v| !v.is_object()) {
        return Err("'payload' is not an object");
    }

    Ok(())
}

/// Returns true when the candidate is a well-formed envelope
///
/// Never panics and never errors, whatever the input.
pub fn validate(candidate: &Value) -> bool {
    check(candidate).is_ok()
}

/// Parse and validate a raw inbound frame
pub fn parse_envelope(text: &str) -> Result<Envelope> {
    let value: Value = serde_json::from_str(text)?;
    into_envelope(value)
}

/// Validate an already-decoded value and convert it into an [`Envelope`]
pub fn into_envelope(value: Value) -> Result<Envelope> {
    check(&value).map_err(|reason| ControlError::Validation(reason.to_string()))?;
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_objects_rejected() {
        let cases = [
            json!("not an object"),
            json!(5),
            json!(1.5),
            json!(true),
            json!(null),
            json!([]),
            json!([{"type": "command"}]),
        ];
        for case in &cases {
            assert!(!validate(case), "accepted {case}");
        }
    }

    #[test]
    fn test_type_rules() {
        assert!(!validate(&json!({})));
        assert!(!validate(&json!({"type": 1})));
        assert!(!validate(&json!({"type": null})));
        assert!(!validate(&json!({"type": "bogus"})));
        assert!(!validate(&json!({"type": "COMMAND"})));

        for kind in MessageKind::ALL {
            assert!(validate(&json!({"type": kind.as_str()})), "rejected {kind}");
        }
    }

    #[test]
    fn test_optional_string_fields() {
        assert!(validate(&json!({"type": "command", "id": "abc", "payload": {}})));
        assert!(!validate(&json!({"type": "command", "id": 5})));
        assert!(!validate(&json!({"type": "command", "id": null})));
        assert!(!validate(&json!({"type": "command", "workerId": 7})));
        assert!(!validate(&json!({"type": "command", "workerId": ["w"]})));
        assert!(validate(&json!({"type": "event", "workerId": "w-1"})));
    }

    #[test]
    fn test_payload_must_be_object() {
        assert!(!validate(&json!({"type": "command", "payload": "skip"})));
        assert!(!validate(&json!({"type": "command", "payload": ["skip"]})));
        assert!(!validate(&json!({"type": "command", "payload": 3})));
        assert!(validate(&json!({"type": "command", "payload": {"action": "skip"}})));
    }

    #[test]
    fn test_payload_contents_not_inspected() {
        // No action, nested junk: still a structurally valid envelope
        assert!(validate(&json!({"type": "command", "payload": {"x": [1, {"y": null}]}})));
        assert!(validate(&json!({"type": "response", "extra": 42})));
    }

    #[test]
    fn test_check_names_the_rule() {
        assert_eq!(check(&json!({"type": "command", "id": 5})), Err("'id' is not a string"));
        assert_eq!(check(&json!({"id": "x"})), Err("missing 'type'"));
    }

    #[test]
    fn test_parse_envelope() {
        let env = parse_envelope(r#"{"type":"command","id":"abc","payload":{"action":"skip"}}"#)
            .unwrap();
        assert_eq!(env.kind(), MessageKind::Command);
        assert_eq!(env.id(), Some("abc"));
        assert_eq!(env.action(), Some("skip"));

        let err = parse_envelope(r#"{"type":"bogus"}"#).unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        let err = parse_envelope("{nope").unwrap_err();
        assert!(matches!(err, ControlError::Serialization(_)));
    }

    #[test]
    fn test_built_envelopes_validate() {
        let env = Envelope::command("skip", serde_json::Map::new()).with_worker_id("w-1");
        assert!(validate(&serde_json::to_value(&env).unwrap()));
    }
}
