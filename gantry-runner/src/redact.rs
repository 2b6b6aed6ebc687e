//! Redaction of action configuration before it is logged

use std::collections::BTreeMap;

const SENSITIVE_MARKERS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passwd",
    "credential",
    "private_key",
    "access_key",
    "api_key",
    "apikey",
];

const REDACTED: &str = "****";

pub fn is_sensitive(key: &str) -> bool {
    let key = key.to_lowercase().replace('-', "_");
    SENSITIVE_MARKERS.iter().any(|m| key.contains(m))
}

/// Copy of the configuration with sensitive values replaced
pub fn redact_configuration(configuration: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    configuration
        .iter()
        .map(|(key, value)| {
            let value = if is_sensitive(key) {
                REDACTED.to_string()
            } else {
                value.clone()
            };
            (key.clone(), value)
        })
        .collect()
}

/// `key=value` pairs for a single log line
pub fn describe(configuration: &BTreeMap<String, String>) -> String {
    redact_configuration(configuration)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v.replace('\n', "; ")))
        .collect::<Vec<_>>()
        .join(", ")
}
