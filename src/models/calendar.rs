//! Calendars

use super::{Bind, Model};
use serde::{Deserialize, Serialize};

/// A CalDAV calendar collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Calendar {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    pub path: String,
    pub name: String,
    #[serde(default)]
    pub ctag: String,
    #[serde(default)]
    pub sync_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
}

impl Calendar {
    pub fn new(account_id: &str, path: &str, name: &str) -> Self {
        Calendar {
            id: crate::util::id_for_calendar(account_id, path),
            account_id: account_id.to_string(),
            version: 0,
            path: path.to_string(),
            name: name.to_string(),
            ctag: String::new(),
            sync_token: String::new(),
            color: None,
            description: None,
            read_only: false,
            order: None,
        }
    }
}

impl Model for Calendar {
    fn table() -> &'static str {
        "Calendar"
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
        &["path"]
    }

    fn index_values(&self) -> Vec<Bind> {
        vec![Bind::Text(self.path.clone())]
    }
}
