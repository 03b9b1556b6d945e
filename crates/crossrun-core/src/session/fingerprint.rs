//! Run-settings identity key.
//!
//! Two run-settings documents describe the same worker configuration
//! when their `environment` and `dataCollectors` sections are equal.
//! Formatting, key order, and unrelated sections never affect identity;
//! any difference in environment variables or collector configuration
//! always does.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SettingsFingerprint(String);

impl SettingsFingerprint {
    pub fn of(run_settings: &str) -> Self {
        match serde_json::from_str::<Value>(run_settings) {
            Ok(doc) => {
                let environment = doc.get("environment").cloned().unwrap_or(Value::Null);
                let collectors = doc.get("dataCollectors").cloned().unwrap_or(Value::Null);
                // JSON objects deserialize into sorted maps, so
                // re-serializing the picked sections yields a stable
                // key under reordering and reformatting.
                let key = serde_json::json!({
                    "environment": environment,
                    "dataCollectors": collectors,
                });
                Self(key.to_string())
            }
            // Not JSON: fall back to literal text identity.
            Err(_) => Self(run_settings.trim().to_string()),
        }
    }
}
