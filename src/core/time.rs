//! Shared timestamp/event helpers for deterministic envelopes.

use serde_json::Value as JsonValue;
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    format!("{}Z", now_epoch_ms() / 1000)
}

/// Unix-epoch milliseconds. Action timestamps use this resolution.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Renders epoch milliseconds the same way `now_epoch_z` renders seconds.
pub fn ms_to_epoch_z(ms: u64) -> String {
    format!("{}Z", ms / 1000)
}

/// Next timestamp for an append-only sequence: never earlier than `last`.
pub fn monotonic_after(last: Option<u64>, now: u64) -> u64 {
    match last {
        Some(prev) if prev > now => prev,
        _ => now,
    }
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Standard command response envelope shape used across CLI surfaces.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_epoch_z_format() {
        let result = now_epoch_z();
        assert!(result.ends_with('Z'));
        let numeric_part = result.trim_end_matches('Z');
        assert!(numeric_part.parse::<u64>().is_ok());
    }

    #[test]
    fn test_monotonic_after_never_goes_backwards() {
        assert_eq!(monotonic_after(None, 10), 10);
        assert_eq!(monotonic_after(Some(5), 10), 10);
        assert_eq!(monotonic_after(Some(20), 10), 20);
    }

    #[test]
    fn test_new_event_id_is_valid_ulid() {
        let id = new_event_id();
        assert!(ulid::Ulid::from_string(&id).is_ok());
        assert_ne!(id, new_event_id());
    }

    #[test]
    fn test_command_envelope_with_extra() {
        let extra = serde_json::json!({"key": "value", "count": 42});
        let envelope = command_envelope("test", "ok", extra);
        assert_eq!(envelope["cmd"], "test");
        assert_eq!(envelope["status"], "ok");
        assert_eq!(envelope["envelope_version"], "1.0.0");
        assert_eq!(envelope["key"], "value");
        assert_eq!(envelope["count"], 42);
    }
}
