// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic redaction of secrets in log and event payloads.
//!
//! Applied centrally at the event-bus publish step and at audit/log sinks,
//! never ad hoc. Two rule classes:
//!
//! 1. **Field names**: any JSON object key matching the sensitive-name list
//!    has its value replaced wholesale.
//! 2. **Value patterns**: string values matching secret-shaped patterns
//!    (bearer tokens, signed token literals, long hex/base64 runs prefixed
//!    with a scheme) are masked even under innocent keys.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Replacement written over redacted values.
pub const MASK: &str = "[REDACTED]";

/// Object keys whose values are always redacted, regardless of content.
const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "access_token",
    "refresh_token",
    "capability_token",
    "secret",
    "client_secret",
    "password",
    "passphrase",
    "api_key",
    "apikey",
    "private_key",
    "signing_key",
    "authorization",
    "credential",
    "credentials",
];

static VALUE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Bearer / Basic authorization literals.
        r"(?i)^(bearer|basic)\s+\S+$",
        // Two-part signed token: base64url payload '.' base64url signature.
        r"^[A-Za-z0-9_-]{20,}\.[A-Za-z0-9_-]{20,}$",
        // Key-material prefixes.
        r"^(sk|pk|key)[-_][A-Za-z0-9_-]{16,}$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static redaction pattern must compile"))
    .collect()
});

fn key_is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|k| lower == *k || lower.ends_with(&format!("_{k}")))
}

fn value_is_secret_shaped(s: &str) -> bool {
    VALUE_PATTERNS.iter().any(|re| re.is_match(s))
}

/// Redact `value` in place.
///
/// The pass is deterministic: the same input always produces the same output,
/// so redacted payloads remain safely hashable and comparable.
pub fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if key_is_sensitive(key) {
                    *v = Value::String(MASK.into());
                } else {
                    redact_value(v);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_value(item);
            }
        }
        Value::String(s) => {
            if value_is_secret_shaped(s) {
                *value = Value::String(MASK.into());
            }
        }
        _ => {}
    }
}

/// Return a redacted copy of `value`.
#[must_use]
pub fn redacted(value: &Value) -> Value {
    let mut copy = value.clone();
    redact_value(&mut copy);
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_keys_are_masked() {
        let mut v = json!({"password": "hunter2", "api_key": "k-123", "note": "fine"});
        redact_value(&mut v);
        assert_eq!(v["password"], MASK);
        assert_eq!(v["api_key"], MASK);
        assert_eq!(v["note"], "fine");
    }

    #[test]
    fn suffixed_keys_are_masked() {
        let mut v = json!({"stripe_api_key": "sk-live", "db_password": "pw"});
        redact_value(&mut v);
        assert_eq!(v["stripe_api_key"], MASK);
        assert_eq!(v["db_password"], MASK);
    }

    #[test]
    fn nested_payloads_are_walked() {
        let mut v = json!({
            "outer": {"inner": {"secret": "s3cr3t"}},
            "list": [{"token": "abc"}]
        });
        redact_value(&mut v);
        assert_eq!(v["outer"]["inner"]["secret"], MASK);
        assert_eq!(v["list"][0]["token"], MASK);
    }

    #[test]
    fn bearer_values_masked_under_innocent_keys() {
        let mut v = json!({"header": "Bearer abcdef123456"});
        redact_value(&mut v);
        assert_eq!(v["header"], MASK);
    }

    #[test]
    fn two_part_token_literal_masked() {
        let payload = "a".repeat(24);
        let sig = "B".repeat(32);
        let mut v = json!({"blob": format!("{payload}.{sig}")});
        redact_value(&mut v);
        assert_eq!(v["blob"], MASK);
    }

    #[test]
    fn ordinary_strings_untouched() {
        let mut v = json!({"message": "step fetch completed in 120ms", "version": "1.2.0"});
        let before = v.clone();
        redact_value(&mut v);
        assert_eq!(v, before);
    }

    #[test]
    fn redaction_is_deterministic() {
        let input = json!({"token": "x", "data": {"password": "y"}});
        assert_eq!(redacted(&input), redacted(&input));
    }

    #[test]
    fn non_string_scalars_untouched() {
        let mut v = json!({"count": 7, "ratio": 0.5, "ok": true, "none": null});
        let before = v.clone();
        redact_value(&mut v);
        assert_eq!(v, before);
    }
}
