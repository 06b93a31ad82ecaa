//! Task command records

use super::{Bind, Model};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task. `local → remote → complete` on the happy
/// path; `cancelled` only from `local`/`remote` before side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Local,
    Remote,
    Complete,
    Cancelled,
}

/// A command from the client, persisted so progress survives restarts.
/// Dispatch keys off `constructor_name`; the payload is task-specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    pub constructor_name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub should_cancel: bool,
}

impl Task {
    pub fn field_str(&self, key: &str) -> String {
        self.data
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    pub fn field_array(&self, key: &str) -> Vec<serde_json::Value> {
        self.data
            .get(key)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    }
}

impl Model for Task {
    fn table() -> &'static str {
        "Task"
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn index_columns() -> &'static [&'static str] {
        &["status", "constructorName"]
    }

    fn index_values(&self) -> Vec<Bind> {
        let status = serde_json::to_value(self.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        vec![
            Bind::Text(status),
            Bind::Text(self.constructor_name.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(TaskStatus::Remote).unwrap(),
            serde_json::json!("remote")
        );
    }

    #[test]
    fn payload_accessors_tolerate_missing_fields() {
        let task = Task {
            id: "t1".into(),
            account_id: "a1".into(),
            version: 0,
            constructor_name: "ChangeUnreadTask".into(),
            status: TaskStatus::Local,
            data: serde_json::json!({"unread": true, "messageIds": ["m1"]}),
            error: None,
            should_cancel: false,
        };
        assert_eq!(task.field_str("missing"), "");
        assert_eq!(task.field_array("messageIds").len(), 1);
    }
}
