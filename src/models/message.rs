//! Messages

use super::{file::File, Bind, Model};
use serde::{Deserialize, Serialize};

/// One participant in a message header.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EmailAddress {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// The mutable attributes a scan compares to decide whether a local
/// message needs an update. Labels are kept sorted so comparison is
/// order-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageAttributes {
    pub uid: u32,
    pub unread: bool,
    pub starred: bool,
    pub draft: bool,
    pub labels: Vec<String>,
}

impl MessageAttributes {
    pub fn new(uid: u32, unread: bool, starred: bool, draft: bool, mut labels: Vec<String>) -> Self {
        labels.sort();
        MessageAttributes {
            uid,
            unread,
            starred,
            draft,
            labels,
        }
    }
}

// Messages missing from a scan are not deleted immediately: their
// remoteUID is parked at a sentinel tagged with the sync loop's current
// phase, and only a message still unlinked after the phase toggles is
// truly removed.
const UNLINK_UID_BASE: u32 = u32::MAX - 2;

pub fn unlink_uid_for_phase(phase: u8) -> u32 {
    UNLINK_UID_BASE + phase as u32
}

pub fn is_unlinked_uid(uid: u32) -> bool {
    uid > UNLINK_UID_BASE
}

/// A single RFC 5322 item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    #[serde(default)]
    pub header_message_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub from: Vec<EmailAddress>,
    #[serde(default)]
    pub to: Vec<EmailAddress>,
    #[serde(default)]
    pub cc: Vec<EmailAddress>,
    #[serde(default)]
    pub bcc: Vec<EmailAddress>,
    #[serde(default)]
    pub reply_to: Vec<EmailAddress>,

    #[serde(default, rename = "gMsgId")]
    pub g_msg_id: String,
    #[serde(default)]
    pub unread: bool,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub draft: bool,

    /// UID in the remote folder; a phase-tagged sentinel while unlinked.
    #[serde(default, rename = "remoteUID")]
    pub remote_uid: u32,
    #[serde(default)]
    pub remote_folder_id: String,
    /// Sorted Gmail label names as reported by the server.
    #[serde(default, rename = "remoteXGMLabels")]
    pub remote_xgm_labels: Vec<String>,
    /// The folder the user sees. Diverges from `remote_folder_id` while a
    /// move is in flight.
    #[serde(default)]
    pub client_folder_id: String,

    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub files: Vec<File>,

    #[serde(default)]
    pub synced_at: i64,
    /// Optimistic-lock counter. While positive, remote-derived values may
    /// not overwrite this record.
    #[serde(default)]
    pub sync_unsaved_changes: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_header_message_id: Option<String>,
    /// Set on deletion placeholders left behind by DestroyDraft.
    #[serde(default)]
    pub hidden: bool,
}

impl Message {
    pub fn attributes(&self) -> MessageAttributes {
        MessageAttributes::new(
            self.remote_uid,
            self.unread,
            self.starred,
            self.draft,
            self.remote_xgm_labels.clone(),
        )
    }

    pub fn is_unlinked(&self) -> bool {
        is_unlinked_uid(self.remote_uid)
    }

    pub fn unlink(&mut self, phase: u8) {
        self.remote_uid = unlink_uid_for_phase(phase);
    }

    /// All recipient mailbox addresses, for the id hash.
    pub fn recipient_emails(&self) -> Vec<String> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(|a| a.email.clone())
            .collect()
    }

    pub fn attachment_count(&self) -> i64 {
        self.files.iter().filter(|f| !f.is_inline()).count() as i64
    }
}

impl Model for Message {
    fn table() -> &'static str {
        "Message"
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
        &[
            "headerMessageId",
            "subject",
            "gMsgId",
            "date",
            "draft",
            "unread",
            "starred",
            "remoteUID",
            "remoteFolderId",
            "clientFolderId",
            "threadId",
            "syncUnsavedChanges",
        ]
    }

    fn index_values(&self) -> Vec<Bind> {
        vec![
            Bind::Text(self.header_message_id.clone()),
            Bind::Text(self.subject.clone()),
            Bind::Text(self.g_msg_id.clone()),
            Bind::Int(self.date),
            Bind::Int(self.draft as i64),
            Bind::Int(self.unread as i64),
            Bind::Int(self.starred as i64),
            Bind::Int(self.remote_uid as i64),
            Bind::Text(self.remote_folder_id.clone()),
            Bind::Text(self.client_folder_id.clone()),
            Bind::Text(self.thread_id.clone()),
            Bind::Int(self.sync_unsaved_changes),
        ]
    }

    fn supports_metadata() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_compare_labels_order_insensitively() {
        let a = MessageAttributes::new(1, true, false, false, vec!["b".into(), "a".into()]);
        let b = MessageAttributes::new(1, true, false, false, vec!["a".into(), "b".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn unlink_sentinels_are_phase_distinct() {
        assert_ne!(unlink_uid_for_phase(1), unlink_uid_for_phase(2));
        assert!(is_unlinked_uid(unlink_uid_for_phase(1)));
        assert!(is_unlinked_uid(unlink_uid_for_phase(2)));
        assert!(!is_unlinked_uid(0));
        assert!(!is_unlinked_uid(4_000_000));
    }

    #[test]
    fn wire_field_names_match_protocol() {
        let msg = Message {
            id: "m1".into(),
            account_id: "a1".into(),
            version: 1,
            header_message_id: "<x@y>".into(),
            subject: "Hi".into(),
            date: 100,
            from: vec![],
            to: vec![],
            cc: vec![],
            bcc: vec![],
            reply_to: vec![],
            g_msg_id: "".into(),
            unread: true,
            starred: false,
            draft: false,
            remote_uid: 7,
            remote_folder_id: "f1".into(),
            remote_xgm_labels: vec![],
            client_folder_id: "f1".into(),
            thread_id: "t1".into(),
            snippet: "".into(),
            files: vec![],
            synced_at: 0,
            sync_unsaved_changes: 0,
            reply_to_header_message_id: None,
            hidden: false,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["remoteUID"], 7);
        assert_eq!(v["remoteFolderId"], "f1");
        assert_eq!(v["headerMessageId"], "<x@y>");
        assert_eq!(v["syncUnsavedChanges"], 0);
        assert!(v.get("replyToHeaderMessageId").is_none());
    }
}
