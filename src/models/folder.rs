//! Folders and Gmail labels

use super::{Bind, Model};
use serde::{Deserialize, Serialize};

/// Per-folder sync bookkeeping, persisted inside the folder's JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct FolderLocalStatus {
    pub uidnext: u32,
    #[serde(rename = "syncedMinUID")]
    pub synced_min_uid: u32,
    pub highestmodseq: u64,
    pub uidvalidity: u32,
    #[serde(rename = "uidvalidityResetCount")]
    pub uidvalidity_reset_count: u32,
    #[serde(rename = "lastShallow")]
    pub last_shallow: i64,
    #[serde(rename = "lastDeep")]
    pub last_deep: i64,
    #[serde(rename = "lastCleanup")]
    pub last_cleanup: i64,
    #[serde(rename = "bodiesPresent")]
    pub bodies_present: i64,
    #[serde(rename = "bodiesWanted")]
    pub bodies_wanted: i64,
    pub busy: bool,
}

impl FolderLocalStatus {
    /// True until the folder has seen its first STATUS response.
    pub fn is_unseeded(&self) -> bool {
        self.uidvalidity == 0
    }
}

/// A selectable container on the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,
    pub path: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub local_status: FolderLocalStatus,
    /// Hierarchy delimiter reported by LIST.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

fn default_delimiter() -> char {
    '/'
}

impl Folder {
    pub fn new(account_id: &str, path: &str, delimiter: char) -> Self {
        Folder {
            id: crate::util::id_for_folder(account_id, path),
            account_id: account_id.to_string(),
            version: 0,
            path: path.to_string(),
            role: String::new(),
            local_status: FolderLocalStatus::default(),
            delimiter,
        }
    }
}

impl Model for Folder {
    fn table() -> &'static str {
        "Folder"
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
        &["path", "role"]
    }

    fn index_values(&self) -> Vec<Bind> {
        vec![Bind::Text(self.path.clone()), Bind::Text(self.role.clone())]
    }
}

/// A Gmail label. Same shape as a folder, persisted to its own table so
/// role constraints and queries stay separate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label(pub Folder);

impl Label {
    pub fn new(account_id: &str, path: &str, delimiter: char) -> Self {
        Label(Folder::new(account_id, path, delimiter))
    }
}

impl Model for Label {
    fn table() -> &'static str {
        "Label"
    }

    fn id(&self) -> &str {
        &self.0.id
    }

    fn account_id(&self) -> &str {
        &self.0.account_id
    }

    fn version(&self) -> i64 {
        self.0.version
    }

    fn set_version(&mut self, version: i64) {
        self.0.version = version;
    }

    fn index_columns() -> &'static [&'static str] {
        &["path", "role"]
    }

    fn index_values(&self) -> Vec<Bind> {
        vec![
            Bind::Text(self.0.path.clone()),
            Bind::Text(self.0.role.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_ids_are_stable_per_account_and_path() {
        let a = Folder::new("acct", "INBOX", '/');
        let b = Folder::new("acct", "INBOX", '/');
        let c = Folder::new("acct2", "INBOX", '/');
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn local_status_round_trips_with_wire_names() {
        let mut status = FolderLocalStatus::default();
        status.synced_min_uid = 44;
        status.uidvalidity_reset_count = 2;
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["syncedMinUID"], 44);
        assert_eq!(v["uidvalidityResetCount"], 2);
        let back: FolderLocalStatus = serde_json::from_value(v).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn unseeded_until_first_status() {
        let folder = Folder::new("acct", "INBOX", '/');
        assert!(folder.local_status.is_unseeded());
    }
}
