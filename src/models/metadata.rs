//! Plugin metadata

use super::{Bind, Model};
use serde::{Deserialize, Serialize};

/// A versioned per-plugin blob attached to a message, thread, or contact.
/// Rows are unique per `(accountId, objectId, pluginId)`; the id joins
/// the object id and plugin id. Unlike other models, `version` tracks the
/// identity service's version so stale stream deltas can be rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    pub plugin_id: String,
    pub object_id: String,
    pub object_type: String,
    #[serde(default)]
    pub value: serde_json::Value,
    /// Unix seconds at which the expiration worker emits a deadline
    /// delta; 0 means never.
    #[serde(default)]
    pub expiration: i64,
}

impl Model for Metadata {
    fn table() -> &'static str {
        "ModelPluginMetadata"
    }

    fn object_class() -> &'static str {
        "Metadata"
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
        &["pluginId", "objectId", "objectType", "expiration"]
    }

    fn index_values(&self) -> Vec<Bind> {
        vec![
            Bind::Text(self.plugin_id.clone()),
            Bind::Text(self.object_id.clone()),
            Bind::Text(self.object_type.clone()),
            Bind::Int(self.expiration),
        ]
    }
}

/// Metadata that arrived before the object it describes. Parked in a side
/// table and re-attached on the first save of a model with that id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedMetadata {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    pub plugin_id: String,
    pub object_id: String,
    pub object_type: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub expiration: i64,
}

impl DetachedMetadata {
    pub fn attach_key(account_id: &str, object_id: &str, plugin_id: &str) -> String {
        format!("{}-{}-{}", account_id, object_id, plugin_id)
    }
}

impl Model for DetachedMetadata {
    fn table() -> &'static str {
        "DetachedPluginMetadata"
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
        &["pluginId", "objectId"]
    }

    fn index_values(&self) -> Vec<Bind> {
        vec![
            Bind::Text(self.plugin_id.clone()),
            Bind::Text(self.object_id.clone()),
        ]
    }
}
