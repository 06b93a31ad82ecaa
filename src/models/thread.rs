//! Threads: aggregated rollups over messages

use super::{message::EmailAddress, Bind, Message, Model};
use serde::{Deserialize, Serialize};

const FIRST_TIMESTAMP_UNSET: i64 = i64::MAX;

/// Folder or label membership entry with refcounts. `_refs` counts the
/// messages contributing to this container, `_u` the unread among them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryRef {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub role: String,
    #[serde(rename = "_refs")]
    pub refs: i64,
    #[serde(rename = "_u")]
    pub unread: i64,
}

/// The per-message contribution captured before a message changes, so the
/// rollups can be decremented without re-reading every sibling.
#[derive(Debug, Clone, Default)]
pub struct MessageSnapshot {
    pub unread: bool,
    pub starred: bool,
    pub file_count: i64,
    pub client_folder_id: String,
    pub remote_xgm_labels: Vec<String>,
    pub in_all_mail: bool,
}

impl MessageSnapshot {
    pub fn of(msg: &Message, in_all_mail: bool) -> Self {
        MessageSnapshot {
            unread: msg.unread,
            starred: msg.starred,
            file_count: msg.attachment_count(),
            client_folder_id: msg.client_folder_id.clone(),
            remote_xgm_labels: msg.remote_xgm_labels.clone(),
            in_all_mail,
        }
    }
}

/// An aggregated view over messages sharing a Gmail thread id or
/// References chain. Counted attributes are maintained incrementally and
/// always equal the sum of the member messages' contributions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    pub subject: String,
    #[serde(default, rename = "gThrId")]
    pub g_thr_id: String,
    #[serde(default)]
    pub unread: i64,
    #[serde(default)]
    pub starred: i64,
    #[serde(default)]
    pub attachment_count: i64,
    #[serde(default)]
    pub in_all_mail: bool,

    #[serde(rename = "fmt")]
    pub first_message_timestamp: i64,
    #[serde(rename = "lmt")]
    pub last_message_timestamp: i64,
    #[serde(rename = "lmrt")]
    pub last_message_received_timestamp: i64,
    #[serde(rename = "lmst")]
    pub last_message_sent_timestamp: i64,
    /// True while `lmrt` holds a sent-message fallback value; replaced by
    /// the first received message encountered.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lmrt_is_fallback: bool,

    #[serde(default)]
    pub folders: Vec<CategoryRef>,
    #[serde(default)]
    pub labels: Vec<CategoryRef>,
    #[serde(default)]
    pub participants: Vec<EmailAddress>,
}

impl Thread {
    pub fn new(msg_id: &str, account_id: &str, subject: &str, g_thr_id: &str) -> Self {
        Thread {
            id: format!("t:{}", msg_id),
            account_id: account_id.to_string(),
            version: 0,
            subject: subject.to_string(),
            g_thr_id: g_thr_id.to_string(),
            unread: 0,
            starred: 0,
            attachment_count: 0,
            in_all_mail: false,
            first_message_timestamp: FIRST_TIMESTAMP_UNSET,
            last_message_timestamp: 0,
            last_message_received_timestamp: 0,
            last_message_sent_timestamp: 0,
            lmrt_is_fallback: false,
            folders: Vec::new(),
            labels: Vec::new(),
            participants: Vec::new(),
        }
    }

    /// Apply the delta between a message's previous contribution (`old`,
    /// None on first add) and its next state (`next`, None on removal).
    /// `next_in_all_mail` reflects the message's destination folder;
    /// `label_refs` resolves Gmail label names to category entries.
    pub fn apply_message_attribute_changes(
        &mut self,
        old: Option<&MessageSnapshot>,
        next: Option<&Message>,
        next_folder: Option<CategoryRef>,
        next_in_all_mail: bool,
        label_lookup: &dyn Fn(&str) -> Option<CategoryRef>,
    ) {
        if let Some(old) = old {
            self.unread -= old.unread as i64;
            self.starred -= old.starred as i64;
            self.attachment_count -= old.file_count;

            self.folders = Self::decrement_ref(
                std::mem::take(&mut self.folders),
                &old.client_folder_id,
                old.unread as i64,
            );
            for name in &old.remote_xgm_labels {
                if let Some(entry) = label_lookup(name) {
                    let contributes_unread = (old.unread && old.in_all_mail) as i64;
                    self.labels = Self::decrement_ref(
                        std::mem::take(&mut self.labels),
                        &entry.id,
                        contributes_unread,
                    );
                }
            }
        }

        if let Some(next) = next {
            self.unread += next.unread as i64;
            self.starred += next.starred as i64;
            self.attachment_count += next.attachment_count();

            if !next.draft && !next.hidden {
                if next.date > self.last_message_timestamp {
                    self.last_message_timestamp = next.date;
                }
                if next.date < self.first_message_timestamp {
                    self.first_message_timestamp = next.date;
                }

                let folder_role = next_folder.as_ref().map(|f| f.role.as_str()).unwrap_or("");
                let sent_by_user = folder_role == "sent" || folder_role == "drafts";
                if sent_by_user && next.date > self.last_message_sent_timestamp {
                    self.last_message_sent_timestamp = next.date;
                }
                let in_inbox = folder_role == "inbox" || folder_role == "all";
                if in_inbox || !sent_by_user {
                    if self.lmrt_is_fallback || next.date > self.last_message_received_timestamp {
                        self.lmrt_is_fallback = false;
                        self.last_message_received_timestamp = next.date;
                    }
                } else if self.last_message_received_timestamp == 0 {
                    // Never leave lmrt at zero: it sinks the thread to the
                    // bottom of list views. Use this value until a message
                    // that actually qualifies arrives.
                    self.lmrt_is_fallback = true;
                    self.last_message_received_timestamp = next.date;
                }
            }

            if let Some(folder) = next_folder {
                Self::increment_ref(&mut self.folders, folder, next.unread as i64);
            }
            for name in &next.remote_xgm_labels {
                if let Some(entry) = label_lookup(name) {
                    let contributes_unread = (next.unread && next_in_all_mail) as i64;
                    Self::increment_ref(&mut self.labels, entry, contributes_unread);
                }
            }

            let mut known: std::collections::HashSet<String> = self
                .participants
                .iter()
                .map(|p| p.email.clone())
                .collect();
            for addr in next.to.iter().chain(next.cc.iter()).chain(next.from.iter()) {
                if !addr.email.is_empty() && known.insert(addr.email.clone()) {
                    self.participants.push(addr.clone());
                }
            }
        }

        // A thread is in All Mail unless it sits entirely in spam or trash.
        let spam_or_trash = self
            .folders
            .iter()
            .filter(|f| f.role == "spam" || f.role == "trash")
            .count();
        self.in_all_mail = self.folders.len() > spam_or_trash;
    }

    fn decrement_ref(entries: Vec<CategoryRef>, id: &str, unread: i64) -> Vec<CategoryRef> {
        let mut next = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if entry.id != id {
                next.push(entry);
                continue;
            }
            if entry.refs > 1 {
                entry.refs -= 1;
                entry.unread -= unread;
                next.push(entry);
            }
            // refs dropping to zero removes the entry entirely
        }
        next
    }

    fn increment_ref(entries: &mut Vec<CategoryRef>, mut new_entry: CategoryRef, unread: i64) {
        for entry in entries.iter_mut() {
            if entry.id == new_entry.id {
                entry.refs += 1;
                entry.unread += unread;
                return;
            }
        }
        new_entry.refs = 1;
        new_entry.unread = unread;
        entries.push(new_entry);
    }
}

impl Model for Thread {
    fn table() -> &'static str {
        "Thread"
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
            "gThrId",
            "subject",
            "unread",
            "starred",
            "inAllMail",
            "lastMessageTimestamp",
            "lastMessageReceivedTimestamp",
            "lastMessageSentTimestamp",
            "firstMessageTimestamp",
            "hasAttachments",
        ]
    }

    fn index_values(&self) -> Vec<Bind> {
        vec![
            Bind::Text(self.g_thr_id.clone()),
            Bind::Text(self.subject.clone()),
            Bind::Int(self.unread),
            Bind::Int(self.starred),
            Bind::Int(self.in_all_mail as i64),
            Bind::Int(self.last_message_timestamp),
            Bind::Int(self.last_message_received_timestamp),
            Bind::Int(self.last_message_sent_timestamp),
            Bind::Int(self.first_message_timestamp),
            Bind::Int(self.attachment_count),
        ]
    }

    fn supports_metadata() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(unread: bool, starred: bool, date: i64) -> Message {
        Message {
            id: "m1".into(),
            account_id: "a1".into(),
            version: 0,
            header_message_id: "<m1@x>".into(),
            subject: "s".into(),
            date,
            from: vec![EmailAddress {
                name: "".into(),
                email: "from@x.com".into(),
            }],
            to: vec![EmailAddress {
                name: "".into(),
                email: "to@x.com".into(),
            }],
            cc: vec![],
            bcc: vec![],
            reply_to: vec![],
            g_msg_id: String::new(),
            unread,
            starred,
            draft: false,
            remote_uid: 4,
            remote_folder_id: "f-inbox".into(),
            remote_xgm_labels: vec![],
            client_folder_id: "f-inbox".into(),
            thread_id: "t:m1".into(),
            snippet: String::new(),
            files: vec![],
            synced_at: 0,
            sync_unsaved_changes: 0,
            reply_to_header_message_id: None,
            hidden: false,
        }
    }

    fn inbox_ref() -> CategoryRef {
        CategoryRef {
            id: "f-inbox".into(),
            path: "INBOX".into(),
            role: "inbox".into(),
            refs: 0,
            unread: 0,
        }
    }

    #[test]
    fn counters_track_add_and_remove() {
        let mut t = Thread::new("m1", "a1", "s", "");
        let msg = message(true, true, 500);
        t.apply_message_attribute_changes(None, Some(&msg), Some(inbox_ref()), true, &|_| None);
        assert_eq!(t.unread, 1);
        assert_eq!(t.starred, 1);
        assert_eq!(t.folders.len(), 1);
        assert_eq!(t.folders[0].refs, 1);
        assert!(t.in_all_mail);
        assert_eq!(t.participants.len(), 2);

        let snap = MessageSnapshot::of(&msg, true);
        t.apply_message_attribute_changes(Some(&snap), None, None, true, &|_| None);
        assert_eq!(t.unread, 0);
        assert_eq!(t.starred, 0);
        assert!(t.folders.is_empty());
        assert!(!t.in_all_mail);
    }

    #[test]
    fn flag_change_updates_counters_without_duplicating_refs() {
        let mut t = Thread::new("m1", "a1", "s", "");
        let mut msg = message(true, false, 500);
        t.apply_message_attribute_changes(None, Some(&msg), Some(inbox_ref()), true, &|_| None);

        let snap = MessageSnapshot::of(&msg, true);
        msg.unread = false;
        t.apply_message_attribute_changes(Some(&snap), Some(&msg), Some(inbox_ref()), true, &|_| {
            None
        });
        assert_eq!(t.unread, 0);
        assert_eq!(t.folders.len(), 1);
        assert_eq!(t.folders[0].refs, 1);
        assert_eq!(t.folders[0].unread, 0);
    }

    #[test]
    fn spam_only_thread_leaves_all_mail() {
        let mut t = Thread::new("m1", "a1", "s", "");
        let msg = message(false, false, 500);
        let spam = CategoryRef {
            id: "f-spam".into(),
            path: "Spam".into(),
            role: "spam".into(),
            refs: 0,
            unread: 0,
        };
        t.apply_message_attribute_changes(None, Some(&msg), Some(spam), false, &|_| None);
        assert!(!t.in_all_mail);
    }

    #[test]
    fn timestamps_follow_message_dates() {
        let mut t = Thread::new("m1", "a1", "s", "");
        let early = message(false, false, 100);
        let late = message(false, false, 900);
        t.apply_message_attribute_changes(None, Some(&early), Some(inbox_ref()), true, &|_| None);
        t.apply_message_attribute_changes(None, Some(&late), Some(inbox_ref()), true, &|_| None);
        assert_eq!(t.first_message_timestamp, 100);
        assert_eq!(t.last_message_timestamp, 900);
        assert_eq!(t.last_message_received_timestamp, 900);
    }

    #[test]
    fn sent_only_thread_uses_fallback_received_timestamp() {
        let mut t = Thread::new("m1", "a1", "s", "");
        let msg = message(false, false, 700);
        let sent = CategoryRef {
            id: "f-sent".into(),
            path: "Sent".into(),
            role: "sent".into(),
            refs: 0,
            unread: 0,
        };
        t.apply_message_attribute_changes(None, Some(&msg), Some(sent), true, &|_| None);
        assert_eq!(t.last_message_received_timestamp, 700);
        assert!(t.lmrt_is_fallback);

        let received = message(false, false, 300);
        t.apply_message_attribute_changes(None, Some(&received), Some(inbox_ref()), true, &|_| {
            None
        });
        assert_eq!(t.last_message_received_timestamp, 300);
        assert!(!t.lmrt_is_fallback);
    }
}
