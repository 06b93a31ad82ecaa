//! Task syncback engine
//!
//! Client mutations arrive as tasks and run in two phases: `perform_local`
//! applies the change to the store immediately (main dispatcher, inside a
//! transaction) and `perform_remote` replays it against the server
//! (foreground worker, free to block on network I/O). Remote completion
//! re-reads the affected models and releases their optimistic locks with a
//! silent save.

use crate::backoff::Policy;
use crate::config::{Account, Config, Identity};
use crate::error::{SyncError, SyncResult};
use crate::imap::ImapConnection;
use crate::models::thread::MessageSnapshot;
use crate::models::{Folder, Label, Message, Metadata, Task, TaskStatus, Thread};
use crate::processor::MailProcessor;
use crate::store::{MailStore, Query};
use crate::util;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a message stays locked against remote overwrites after a
/// local mutation.
const SYNC_LOCK_WINDOW_SECS: i64 = 24 * 60 * 60;
/// Completed tasks are kept around this long for the client to inspect.
const TASK_RETENTION_SECS: i64 = 7 * 24 * 60 * 60;
const EXPUNGE_LOCAL_BATCH: usize = 100;
const SENT_PROBE_TRIES: u32 = 5;

pub struct TaskProcessor {
    store: Arc<MailStore>,
    account: Arc<Account>,
    config: Arc<Config>,
    identity: Identity,
    http: reqwest::Client,
    smtp_token: Option<String>,
    seen_this_pass: HashSet<String>,
}

impl TaskProcessor {
    pub fn new(store: Arc<MailStore>, account: Arc<Account>, config: Arc<Config>) -> Self {
        Self::with_identity(store, account, config, Identity::default(), None)
    }

    pub fn with_identity(
        store: Arc<MailStore>,
        account: Arc<Account>,
        config: Arc<Config>,
        identity: Identity,
        smtp_token: Option<String>,
    ) -> Self {
        TaskProcessor {
            store,
            account,
            config,
            identity,
            http: reqwest::Client::new(),
            smtp_token,
            seen_this_pass: HashSet::new(),
        }
    }

    fn processor(&self) -> MailProcessor {
        MailProcessor::new(self.store.clone(), self.account.clone(), self.config.clone())
    }

    // ---- lifecycle ----

    /// Tasks still in `local` were interrupted mid-performLocal by a
    /// crash; their side effects are half-saved, so drop them rather than
    /// re-running.
    pub async fn cleanup_tasks_after_launch(&self) -> SyncResult<()> {
        let stuck: Vec<Task> = self
            .store
            .find_all(
                Query::new()
                    .equal("accountId", self.account.id.as_str())
                    .equal("status", "local"),
            )
            .await?;
        for task in &stuck {
            warn!(task = %task.id, "removing task interrupted before reaching remote phase");
            self.store.remove(task).await?;
        }
        Ok(())
    }

    /// Drop completed and cancelled tasks past the retention window.
    pub async fn cleanup_old_tasks(&self) -> SyncResult<()> {
        let cutoff = util::now_secs() - TASK_RETENTION_SECS;
        for status in ["complete", "cancelled"] {
            let old: Vec<Task> = self
                .store
                .find_all(
                    Query::new()
                        .equal("accountId", self.account.id.as_str())
                        .equal("status", status),
                )
                .await?;
            for task in &old {
                let created = task.data.get("_createdAt").and_then(Value::as_i64).unwrap_or(0);
                if created < cutoff {
                    self.store.remove(task).await?;
                }
            }
        }
        Ok(())
    }

    /// Soft-cancel: the remote phase checks the flag at dispatch.
    pub async fn cancel(&self, task_id: &str) -> SyncResult<()> {
        let mut tx = self.store.begin().await?;
        if let Some(mut task) = tx
            .find::<Task>(
                Query::new()
                    .equal("id", task_id)
                    .equal("accountId", self.account.id.as_str()),
            )
            .await?
        {
            task.should_cancel = true;
            tx.save(&mut task).await?;
        }
        tx.commit().await
    }

    // ---- perform local ----

    pub async fn perform_local(&self, task: &mut Task) -> SyncResult<()> {
        let cname = task.constructor_name.clone();
        info!(task = %task.id, task_type = %cname, "running performLocal");

        task.data["_createdAt"] = json!(util::now_secs());
        task.status = TaskStatus::Local;
        self.store.save(task).await?;

        let result: SyncResult<()> = async {
            if task.account_id != self.account.id {
                return Err(SyncError::other("task is for a different account"));
            }
            match cname.as_str() {
                "ChangeUnreadTask" => {
                    self.local_change_on_messages(task, |msg, data| {
                        msg.unread = data["unread"].as_bool().unwrap_or(false);
                    })
                    .await
                }
                "ChangeStarredTask" => {
                    self.local_change_on_messages(task, |msg, data| {
                        msg.starred = data["starred"].as_bool().unwrap_or(false);
                    })
                    .await
                }
                "ChangeFolderTask" => {
                    self.local_change_on_messages(task, |msg, data| {
                        if let Some(id) = data["folder"]["id"].as_str() {
                            msg.client_folder_id = id.to_string();
                        }
                    })
                    .await
                }
                "ChangeLabelsTask" => {
                    self.local_change_on_messages(task, |msg, data| {
                        apply_label_change(msg, data);
                    })
                    .await
                }
                "SyncbackDraftTask" => self.local_save_draft(task).await,
                "DestroyDraftTask" => self.local_destroy_draft(task).await,
                "SyncbackCategoryTask" => self.local_syncback_category(task).await,
                "SyncbackMetadataTask" => self.local_syncback_metadata(task).await,
                "ChangeRoleMappingTask" => self.local_change_role_mapping(task).await,
                "SyncbackContactTask" => self.local_upsert_model::<crate::models::Contact>(task, "contact").await,
                "SyncbackEventTask" => self.local_upsert_model::<crate::models::Event>(task, "event").await,
                "DestroyCategoryTask"
                | "DestroyContactTask"
                | "DestroyEventTask"
                | "SendDraftTask"
                | "SendFeatureUsageEventTask"
                | "ExpungeAllInFolderTask"
                | "GetMessageRFC2822Task" => Ok(()),
                other => {
                    error!(task_type = other, "unknown task type");
                    Ok(())
                }
            }
        }
        .await;

        match result {
            Ok(()) => task.status = TaskStatus::Remote,
            Err(err) => {
                error!(task = %task.id, error = %err, "performLocal failed");
                task.error = Some(err.to_task_error_json());
                task.status = TaskStatus::Complete;
            }
        }
        self.store.save(task).await
    }

    // ---- perform remote ----

    /// Run one batch of tasks sitting in `remote` that this pass hasn't
    /// touched yet. Returns how many ran; the caller loops until zero so
    /// tasks queued by other tasks run in the same pass.
    pub async fn perform_ready_remote(&mut self, conn: &mut ImapConnection) -> SyncResult<usize> {
        let ready: Vec<Task> = self
            .store
            .find_all(
                Query::new()
                    .equal("accountId", self.account.id.as_str())
                    .equal("status", "remote"),
            )
            .await?;
        let mut ran = 0;
        for mut task in ready {
            // Contact and event syncback runs in the DAV worker.
            if crate::dav::DAV_TASK_TYPES.contains(&task.constructor_name.as_str()) {
                continue;
            }
            if !self.seen_this_pass.insert(task.id.clone()) {
                continue;
            }
            self.perform_remote(&mut task, conn).await?;
            ran += 1;
        }
        if ran == 0 {
            self.seen_this_pass.clear();
        }
        Ok(ran)
    }

    pub async fn perform_remote(
        &self,
        task: &mut Task,
        conn: &mut ImapConnection,
    ) -> SyncResult<()> {
        let cname = task.constructor_name.clone();
        info!(task = %task.id, task_type = %cname, "running performRemote");

        if task.should_cancel {
            task.status = TaskStatus::Cancelled;
            return self.store.save(task).await;
        }

        let result: SyncResult<()> = async {
            match cname.as_str() {
                "ChangeUnreadTask" => {
                    self.remote_flag_change(task, conn, "\\Seen", |data| {
                        // \Seen is the inverse of unread
                        !data["unread"].as_bool().unwrap_or(false)
                    })
                    .await
                }
                "ChangeStarredTask" => {
                    self.remote_flag_change(task, conn, "\\Flagged", |data| {
                        data["starred"].as_bool().unwrap_or(false)
                    })
                    .await
                }
                "ChangeFolderTask" => self.remote_folder_move(task, conn).await,
                "ChangeLabelsTask" => self.remote_label_change(task, conn).await,
                "SyncbackDraftTask" => Ok(()), // drafts are not synced remotely
                "DestroyDraftTask" => self.remote_destroy_draft(task, conn).await,
                "SyncbackCategoryTask" => self.remote_syncback_category(task, conn).await,
                "DestroyCategoryTask" => self.remote_destroy_category(task, conn).await,
                "SendDraftTask" => self.remote_send_draft(task, conn).await,
                "SyncbackMetadataTask" => self.remote_syncback_metadata(task).await,
                "SendFeatureUsageEventTask" => self.remote_send_feature_usage(task).await,
                "ChangeRoleMappingTask" => Ok(()),
                "ExpungeAllInFolderTask" => self.remote_expunge_all(task, conn).await,
                "GetMessageRFC2822Task" => self.remote_get_rfc2822(task, conn).await,
                other => {
                    error!(task_type = other, "unknown task type");
                    Ok(())
                }
            }
        }
        .await;

        match result {
            Ok(()) => task.status = TaskStatus::Complete,
            Err(err) => {
                error!(task = %task.id, error = %err, "performRemote failed");
                task.error = Some(err.to_task_error_json());
                task.status = TaskStatus::Complete;
            }
        }
        self.store.save(task).await
    }

    /// Local phase of contact/event syncback: show the user's version
    /// immediately; the DAV worker lands it on the server.
    async fn local_upsert_model<M: crate::models::Model>(
        &self,
        task: &Task,
        key: &str,
    ) -> SyncResult<()> {
        let Some(payload) = task.data.get(key) else {
            return Err(SyncError::other(format!(
                "{} requires a `{}` payload",
                task.constructor_name, key
            )));
        };
        let mut model: M = serde_json::from_value(payload.clone())?;
        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx.find_by_id::<M>(model.id()).await? {
            model.set_version(existing.version());
        }
        tx.save(&mut model).await?;
        tx.commit().await
    }

    // ---- message loading ----

    async fn inflate_messages(&self, data: &Value) -> SyncResult<Vec<Message>> {
        if let Some(thread_ids) = data.get("threadIds").and_then(Value::as_array) {
            let ids: Vec<String> = thread_ids
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            self.store
                .find_all(Query::new().equal_any("threadId", &ids))
                .await
        } else if let Some(message_ids) = data.get("messageIds").and_then(Value::as_array) {
            let ids: Vec<String> = message_ids
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            self.store.find_all(Query::new().equal_any("id", &ids)).await
        } else {
            Ok(Vec::new())
        }
    }

    /// Shared performLocal runner: mutate each matched message, take the
    /// optimistic lock, and rebalance thread counters when the task
    /// addressed whole threads.
    async fn local_change_on_messages(
        &self,
        task: &Task,
        apply: impl Fn(&mut Message, &Value),
    ) -> SyncResult<()> {
        let data = task.data.clone();
        let mut messages = self.inflate_messages(&data).await?;
        let recompute_threads = data.get("threadIds").is_some();
        let labels = self.store.labels(&self.account.id).await?;

        let mut tx = self.store.begin().await?;
        for message in messages.iter_mut() {
            let folder = tx.find_by_id::<Folder>(&message.client_folder_id).await?;
            let in_all_mail = folder
                .as_ref()
                .map(|f| f.role != "spam" && f.role != "trash")
                .unwrap_or(true);
            let old = MessageSnapshot::of(message, in_all_mail);

            apply(message, &data);

            // Lock the record so sync can't revert the change before the
            // remote phase lands it.
            message.sync_unsaved_changes += 1;
            message.synced_at = util::now_secs() + SYNC_LOCK_WINDOW_SECS;
            tx.save(message).await?;

            if !recompute_threads {
                self.apply_thread_delta(&mut tx, &old, message, folder.as_ref(), &labels)
                    .await?;
            }
        }

        if recompute_threads {
            // We already have every message in memory; rebuild the
            // counters from scratch and fix any refcount drift.
            let thread_ids: Vec<String> = data["threadIds"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            for thread_id in thread_ids {
                let Some(mut thread) = tx.find_by_id::<Thread>(&thread_id).await? else {
                    continue;
                };
                thread.unread = 0;
                thread.starred = 0;
                thread.attachment_count = 0;
                thread.folders.clear();
                thread.labels.clear();
                for message in messages.iter().filter(|m| m.thread_id == thread_id) {
                    let folder = tx.find_by_id::<Folder>(&message.client_folder_id).await?;
                    let folder_ref = folder.as_ref().map(|f| crate::models::thread::CategoryRef {
                        id: f.id.clone(),
                        path: f.path.clone(),
                        role: f.role.clone(),
                        refs: 0,
                        unread: 0,
                    });
                    let in_all_mail = folder
                        .as_ref()
                        .map(|f| f.role != "spam" && f.role != "trash")
                        .unwrap_or(true);
                    let lookup = |name: &str| label_category_ref(&labels, name);
                    thread.apply_message_attribute_changes(
                        None,
                        Some(message),
                        folder_ref,
                        in_all_mail,
                        &lookup,
                    );
                }
                tx.save(&mut thread).await?;
            }
        }
        tx.commit().await
    }

    async fn apply_thread_delta(
        &self,
        tx: &mut crate::store::StoreTransaction<'_>,
        old: &MessageSnapshot,
        message: &Message,
        folder: Option<&Folder>,
        labels: &[Label],
    ) -> SyncResult<()> {
        if message.thread_id.is_empty() {
            return Ok(());
        }
        let Some(mut thread) = tx.find_by_id::<Thread>(&message.thread_id).await? else {
            return Ok(());
        };
        let folder_ref = folder.map(|f| crate::models::thread::CategoryRef {
            id: f.id.clone(),
            path: f.path.clone(),
            role: f.role.clone(),
            refs: 0,
            unread: 0,
        });
        let in_all_mail = folder
            .map(|f| f.role != "spam" && f.role != "trash")
            .unwrap_or(true);
        let lookup = |name: &str| label_category_ref(labels, name);
        thread.apply_message_attribute_changes(Some(old), Some(message), folder_ref, in_all_mail, &lookup);
        tx.save(&mut thread).await
    }

    /// Shared performRemote runner for flag changes: group messages by
    /// remote folder, STORE per folder, then release locks.
    async fn remote_flag_change(
        &self,
        task: &Task,
        conn: &mut ImapConnection,
        flag: &str,
        flag_set: impl Fn(&Value) -> bool,
    ) -> SyncResult<()> {
        let data = task.data.clone();
        let messages = self.inflate_messages(&data).await?;
        let add = flag_set(&data);

        for (path, group) in self.group_by_remote_folder(&messages).await? {
            conn.select(&path).await?;
            let uids: Vec<u32> = group.iter().map(|m| m.remote_uid).collect();
            let set = util::uid_set_string(&uids);
            if add {
                conn.add_flags(&set, flag).await?;
            } else {
                conn.remove_flags(&set, flag).await?;
            }
        }
        self.release_locks(&data, &HashMap::new()).await
    }

    async fn remote_label_change(&self, task: &Task, conn: &mut ImapConnection) -> SyncResult<()> {
        let data = task.data.clone();
        let messages = self.inflate_messages(&data).await?;
        let to_add = xgm_keys(&data["labelsToAdd"]);
        let to_remove = xgm_keys(&data["labelsToRemove"]);

        for (path, group) in self.group_by_remote_folder(&messages).await? {
            conn.select(&path).await?;
            let uids: Vec<u32> = group.iter().map(|m| m.remote_uid).collect();
            let set = util::uid_set_string(&uids);
            if !to_add.is_empty() {
                conn.add_gmail_labels(&set, &to_add).await?;
            }
            if !to_remove.is_empty() {
                conn.remove_gmail_labels(&set, &to_remove).await?;
            }
        }
        self.release_locks(&data, &HashMap::new()).await
    }

    async fn remote_folder_move(&self, task: &Task, conn: &mut ImapConnection) -> SyncResult<()> {
        let data = task.data.clone();
        let messages = self.inflate_messages(&data).await?;
        let dest_id = data["folder"]["id"]
            .as_str()
            .ok_or_else(|| SyncError::other("ChangeFolderTask requires folder.id"))?;
        let dest = self
            .store
            .find_by_id::<Folder>(dest_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Folder", dest_id))?;

        let mut remote_updates: HashMap<String, (String, u32)> = HashMap::new();
        for (path, group) in self.group_by_remote_folder(&messages).await? {
            let updates = move_messages_resilient(conn, &self.account, &path, &dest, &group).await?;
            remote_updates.extend(updates);
        }
        self.release_locks(&data, &remote_updates).await
    }

    /// Group messages by the path of their current remote folder.
    async fn group_by_remote_folder(
        &self,
        messages: &[Message],
    ) -> SyncResult<Vec<(String, Vec<Message>)>> {
        let mut by_folder: HashMap<String, Vec<Message>> = HashMap::new();
        for message in messages {
            if message.is_unlinked() || message.remote_uid == 0 {
                continue;
            }
            let Some(folder) = self.store.find_by_id::<Folder>(&message.remote_folder_id).await?
            else {
                continue;
            };
            by_folder.entry(folder.path).or_default().push(message.clone());
        }
        Ok(by_folder.into_iter().collect())
    }

    /// Re-read the affected messages inside a transaction, copy over any
    /// remote fields the action rewrote, and decrement the optimistic
    /// lock. Saved silently: nothing user-visible changed.
    async fn release_locks(
        &self,
        data: &Value,
        remote_updates: &HashMap<String, (String, u32)>,
    ) -> SyncResult<()> {
        let fresh = self.inflate_messages(data).await?;
        let mut tx = self.store.begin().await?;
        for mut message in fresh {
            if let Some((folder_id, uid)) = remote_updates.get(&message.id) {
                message.remote_folder_id = folder_id.clone();
                message.remote_uid = *uid;
            }
            message.sync_unsaved_changes = (message.sync_unsaved_changes - 1).max(0);
            if message.sync_unsaved_changes == 0 {
                message.synced_at = util::now_secs();
            }
            tx.save_silent(&mut message).await?;
        }
        tx.commit().await
    }

    // ---- drafts ----

    fn inflate_draft(&self, draft_json: &Value) -> SyncResult<Message> {
        let mut message: Message = serde_json::from_value(draft_json.clone())?;
        message.account_id = self.account.id.clone();
        message.draft = true;
        message.unread = false;
        if message.date == 0 {
            message.date = util::now_secs();
        }
        Ok(message)
    }

    async fn drafts_folder(&self) -> SyncResult<Folder> {
        let query = Query::new()
            .equal("accountId", self.account.id.as_str())
            .equal("role", "drafts");
        if let Some(folder) = self.store.find::<Folder>(query.clone()).await? {
            return Ok(folder);
        }
        if let Some(label) = self.store.find::<Label>(query).await? {
            return Ok(label.0);
        }
        Err(SyncError::not_found("Folder", "role=drafts"))
    }

    async fn local_save_draft(&self, task: &mut Task) -> SyncResult<()> {
        let draft_json = task.data["draft"].clone();
        let mut draft = self.inflate_draft(&draft_json)?;
        let drafts = self.drafts_folder().await?;
        draft.client_folder_id = drafts.id.clone();
        draft.remote_folder_id = drafts.id.clone();

        let body = draft_json["body"].as_str().unwrap_or_default().to_string();

        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx.find_by_id::<Message>(&draft.id).await? {
            draft.version = existing.version;
            draft.thread_id = existing.thread_id.clone();
        }
        tx.save(&mut draft).await?;
        tx.commit().await?;
        self.store.save_body(&draft.id, &body).await?;
        Ok(())
    }

    async fn local_destroy_draft(&self, task: &mut Task) -> SyncResult<()> {
        let header_message_id = task.field_str("headerMessageId");
        let drafts: Vec<Message> = self
            .store
            .find_all(
                Query::new()
                    .equal("accountId", self.account.id.as_str())
                    .equal("headerMessageId", header_message_id.as_str())
                    .equal("draft", true),
            )
            .await?;

        let trash = self
            .store
            .find::<Folder>(
                Query::new()
                    .equal("accountId", self.account.id.as_str())
                    .equal("role", "trash"),
            )
            .await?;

        // Replace the draft with a hidden placeholder in the trash so the
        // client sees it disappear immediately.
        let mut tx = self.store.begin().await?;
        for mut draft in drafts {
            draft.hidden = true;
            if let Some(trash) = &trash {
                draft.client_folder_id = trash.id.clone();
            }
            draft.sync_unsaved_changes += 1;
            draft.synced_at = util::now_secs() + SYNC_LOCK_WINDOW_SECS;
            tx.save(&mut draft).await?;
        }
        tx.commit().await
    }

    async fn remote_destroy_draft(&self, task: &Task, conn: &mut ImapConnection) -> SyncResult<()> {
        let header_message_id = task.field_str("headerMessageId");
        let drafts = self.drafts_folder().await?;
        conn.select(&drafts.path).await?;
        let uids = conn
            .uid_search(&format!("HEADER Message-ID {}", header_message_id))
            .await?;
        if uids.is_empty() {
            return Ok(());
        }
        let set = util::uid_set_string(&uids);
        conn.add_flags(&set, "\\Deleted").await?;
        conn.expunge().await?;
        Ok(())
    }

    // ---- categories ----

    async fn local_syncback_category(&self, task: &mut Task) -> SyncResult<()> {
        let path = task.data["path"]
            .as_str()
            .ok_or_else(|| SyncError::other("SyncbackCategoryTask requires path"))?
            .to_string();
        let is_label = self.account.is_gmail();

        let mut tx = self.store.begin().await?;
        if is_label {
            let mut label = Label::new(&self.account.id, &path, '/');
            tx.save(&mut label).await?;
            task.data["created"] = serde_json::to_value(&label)?;
        } else {
            let mut folder = Folder::new(&self.account.id, &path, '/');
            tx.save(&mut folder).await?;
            task.data["created"] = serde_json::to_value(&folder)?;
        }
        tx.commit().await
    }

    async fn remote_syncback_category(
        &self,
        task: &Task,
        conn: &mut ImapConnection,
    ) -> SyncResult<()> {
        let path = task.field_str("path");
        let existing_path = task.field_str("existingPath");
        if existing_path.is_empty() {
            conn.create_folder(&path).await?;
            info!(path = %path, "created folder");
        } else {
            conn.rename_folder(&existing_path, &path).await?;
            info!(from = %existing_path, to = %path, "renamed folder");
            // Re-key the local record: folder ids hash the path.
            let old_id = util::id_for_folder(&self.account.id, &existing_path);
            let mut tx = self.store.begin().await?;
            if let Some(folder) = tx.find_by_id::<Folder>(&old_id).await? {
                tx.remove(&folder).await?;
                let mut renamed = Folder::new(&self.account.id, &path, folder.delimiter);
                renamed.role = folder.role.clone();
                renamed.local_status = folder.local_status.clone();
                tx.save(&mut renamed).await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    async fn remote_destroy_category(
        &self,
        task: &Task,
        conn: &mut ImapConnection,
    ) -> SyncResult<()> {
        let path = task.data["folder"]["path"]
            .as_str()
            .or_else(|| task.data["path"].as_str())
            .ok_or_else(|| SyncError::other("DestroyCategoryTask requires path"))?
            .to_string();
        conn.delete_folder(&path).await?;
        let id = util::id_for_folder(&self.account.id, &path);
        let mut tx = self.store.begin().await?;
        if let Some(folder) = tx.find_by_id::<Folder>(&id).await? {
            tx.remove(&folder).await?;
        }
        if let Some(label) = tx.find_by_id::<Label>(&id).await? {
            tx.remove(&label).await?;
        }
        tx.commit().await
    }

    async fn local_change_role_mapping(&self, task: &mut Task) -> SyncResult<()> {
        let role = task.field_str("role");
        let path = task.field_str("path");
        let mut tx = self.store.begin().await?;

        // Only one folder per account may carry a role.
        let holders: Vec<Folder> = tx
            .find_all(
                Query::new()
                    .equal("accountId", self.account.id.as_str())
                    .equal("role", role.as_str()),
            )
            .await?;
        for mut holder in holders {
            holder.role = String::new();
            tx.save(&mut holder).await?;
        }

        let id = util::id_for_folder(&self.account.id, &path);
        let mut folder = tx
            .find_by_id::<Folder>(&id)
            .await?
            .ok_or_else(|| SyncError::not_found("Folder", path.as_str()))?;
        folder.role = role.clone();
        tx.save(&mut folder).await?;
        tx.commit().await
    }

    // ---- metadata ----

    async fn local_syncback_metadata(&self, task: &mut Task) -> SyncResult<()> {
        let object_id = task.field_str("modelId");
        let plugin_id = task.field_str("pluginId");
        let object_type = task.field_str("modelClassName");
        let value = task.data["value"].clone();
        let expiration = value.get("expiration").and_then(Value::as_i64).unwrap_or(0);

        let mut tx = self.store.begin().await?;
        let existing = tx
            .find::<Metadata>(
                Query::new()
                    .equal("accountId", self.account.id.as_str())
                    .equal("objectId", object_id.as_str())
                    .equal("pluginId", plugin_id.as_str()),
            )
            .await?;
        let mut metadata = existing.unwrap_or(Metadata {
            id: format!("{}-{}", object_id, plugin_id),
            account_id: self.account.id.clone(),
            version: 0,
            plugin_id,
            object_id,
            object_type,
            value: Value::Null,
            expiration: 0,
        });
        metadata.value = value;
        metadata.expiration = expiration;
        tx.save(&mut metadata).await?;
        tx.commit().await
    }

    async fn remote_syncback_metadata(&self, task: &Task) -> SyncResult<()> {
        let object_id = task.field_str("modelId");
        let plugin_id = task.field_str("pluginId");
        let object_type = task.field_str("modelClassName");
        let url = format!(
            "{}/metadata/{}/{}/{}",
            self.config.identity_server,
            self.account.id,
            urlencoding::encode(&object_id),
            urlencoding::encode(&plugin_id),
        );
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.identity.token, Some(""))
            .json(&json!({
                "objectType": object_type,
                "value": task.data["value"],
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SyncError::rejected(
                response.status().as_u16(),
                "identity service rejected metadata",
            ));
        }
        Ok(())
    }

    async fn remote_send_feature_usage(&self, task: &Task) -> SyncResult<()> {
        let url = format!("{}/api/feature_usage_event", self.config.identity_server);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.identity.token, Some(""))
            .json(&json!({ "feature": task.field_str("feature") }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SyncError::rejected(
                response.status().as_u16(),
                "identity service rejected usage event",
            ));
        }
        Ok(())
    }

    // ---- send ----

    async fn remote_send_draft(&self, task: &mut Task, conn: &mut ImapConnection) -> SyncResult<()> {
        // A send must never run twice. The bit is saved before the first
        // SMTP request; even a crash right after leaves the task burned.
        if task.data.get("_performRemoteRan").is_some() {
            return Ok(());
        }
        task.data["_performRemoteRan"] = json!(true);
        self.store.save(task).await?;

        let draft_json = task.data["draft"].clone();
        let draft = self.inflate_draft(&draft_json)?;
        let body = draft_json["body"].as_str().unwrap_or_default().to_string();
        let per_recipient = task.data.get("perRecipientBodies").cloned();
        let multisend = per_recipient.as_ref().map(|v| v.is_object()).unwrap_or(false);

        info!(message_id = %draft.header_message_id, multisend, "sending draft");

        let sent = self.sent_folder().await?;
        let transport = crate::smtp::build_transport(&self.account, self.smtp_token.as_deref())?;

        let self_body = if multisend {
            per_recipient.as_ref().unwrap()["self"]
                .as_str()
                .ok_or_else(|| {
                    SyncError::other("perRecipientBodies requires a `self` entry")
                })?
                .to_string()
        } else {
            body.clone()
        };
        let message_for_sent = crate::smtp::build_mime(&draft, &self_body, None, &self.config)?;
        let sent_bytes = message_for_sent.formatted();

        if multisend {
            let mut succeeded: Vec<String> = Vec::new();
            let bodies = per_recipient.as_ref().unwrap().as_object().unwrap();
            for (email, body_value) in bodies {
                if email == "self" {
                    continue;
                }
                let recipient = crate::models::EmailAddress {
                    name: String::new(),
                    email: email.clone(),
                };
                let message = crate::smtp::build_mime(
                    &draft,
                    body_value.as_str().unwrap_or_default(),
                    Some(&recipient),
                    &self.config,
                )?;
                match crate::smtp::send(&transport, message).await {
                    Ok(()) => succeeded.push(email.clone()),
                    Err(err) => {
                        if succeeded.is_empty() {
                            return Err(err);
                        }
                        return Err(SyncError::other(format!(
                            "send partially failed after {} recipients: {}",
                            succeeded.len(),
                            err
                        )));
                    }
                }
            }
        } else {
            crate::smtp::send(&transport, message_for_sent).await?;
        }

        // Scan the sent folder for what the SMTP gateway placed there.
        // Some servers file the message instantly, some take a few
        // seconds, some never do.
        let probe = Policy::sent_folder_probe();
        let mut found_uids: Vec<u32> = Vec::new();
        for attempt in 0..SENT_PROBE_TRIES {
            if attempt > 0 {
                let delay = probe.delay((attempt - 1) / 2);
                debug!(?delay, "waiting for sent folder to settle");
                tokio::time::sleep(delay).await;
            }
            if conn.select(&sent.path).await.is_err() {
                continue;
            }
            match conn
                .uid_search(&format!("HEADER Message-ID {}", draft.header_message_id))
                .await
            {
                Ok(uids) if !uids.is_empty() => {
                    found_uids = uids;
                    break;
                }
                _ => {}
            }
        }

        let mut sent_uid: u32 = 0;
        if multisend && !found_uids.is_empty() {
            // Per-recipient sends leave several copies with targeted
            // bodies; remove them all and append the `self` version.
            debug!(count = found_uids.len(), "removing gateway copies from sent folder");
            let set = util::uid_set_string(&found_uids);
            conn.add_flags(&set, "\\Deleted").await?;
            conn.expunge().await?;
        } else if !multisend && found_uids.len() == 1 {
            sent_uid = found_uids[0];
            debug!(uid = sent_uid, "found gateway copy in sent folder");
        }

        if sent_uid == 0 {
            debug!("appending message to sent folder");
            if let Err(err) = conn.append(&sent.path, &sent_bytes).await {
                warn!(error = %err, "could not append to sent folder; no metadata will attach");
            }
            if conn.select(&sent.path).await.is_ok() {
                if let Ok(uids) = conn
                    .uid_search(&format!("HEADER Message-ID {}", draft.header_message_id))
                    .await
                {
                    sent_uid = uids.into_iter().max().unwrap_or(0);
                }
            }
            if sent_uid != 0 {
                let set = sent_uid.to_string();
                let _ = conn.add_flags(&set, "\\Seen").await;

                // On Gmail, carry the thread's labels onto the new sent
                // message so the thread doesn't vanish from the inbox.
                if conn.is_gmail() && !draft.thread_id.is_empty() {
                    if let Some(thread) =
                        self.store.find_by_id::<Thread>(&draft.thread_id).await?
                    {
                        let xgm: Vec<String> = thread
                            .labels
                            .iter()
                            .filter(|l| l.role != "inbox")
                            .map(|l| xgm_key_for_category(&l.role, &l.path))
                            .collect();
                        if !xgm.is_empty() {
                            let _ = conn.add_gmail_labels(&set, &xgm).await;
                        }
                    }
                }
            }
        }

        // Remove the draft as close as possible to inserting the sent
        // message so the client doesn't flicker.
        let processor = self.processor();
        {
            let labels = self.store.labels(&self.account.id).await?;
            let mut tx = self.store.begin().await?;
            if let Some(local_draft) = tx.find_by_id::<Message>(&draft.id).await? {
                let folder = tx.find_by_id::<Folder>(&local_draft.client_folder_id).await?;
                processor
                    .remove_message(&mut tx, &local_draft, folder.as_ref(), &labels)
                    .await?;
            }
            tx.commit().await?;
        }

        if sent_uid == 0 {
            return Ok(());
        }

        // Pull the authoritative copy back down to pick up its thread id
        // and labels, then attach any draft metadata to it.
        conn.select(&sent.path).await?;
        let fetched = conn.fetch(&sent_uid.to_string(), true, None).await?;
        processor.ingest_heavy(&sent, &fetched.messages).await?;

        let local_sent = self
            .store
            .find::<Message>(
                Query::new()
                    .equal("remoteFolderId", sent.id.as_str())
                    .equal("remoteUID", sent_uid),
            )
            .await?;
        let Some(local_sent) = local_sent else {
            warn!("sent message did not ingest; metadata will not attach");
            return Ok(());
        };
        processor.ingest_body(&local_sent.id, &sent_bytes).await?;

        if let Some(metadata) = draft_json.get("metadata").and_then(Value::as_array) {
            for entry in metadata {
                let Some(plugin_id) = entry.get("pluginId").and_then(Value::as_str) else {
                    continue;
                };
                debug!(plugin = plugin_id, "queueing metadata attach for sent message");
                let mut follow_up = Task {
                    id: uuid::Uuid::new_v4().to_string(),
                    account_id: self.account.id.clone(),
                    version: 0,
                    constructor_name: "SyncbackMetadataTask".to_string(),
                    status: TaskStatus::Local,
                    data: json!({
                        "modelId": local_sent.id,
                        "modelClassName": "message",
                        "modelHeaderMessageId": local_sent.header_message_id,
                        "pluginId": plugin_id,
                        "value": entry.get("value").cloned().unwrap_or(Value::Null),
                    }),
                    error: None,
                    should_cancel: false,
                };
                self.perform_local(&mut follow_up).await?;
            }
        }
        Ok(())
    }

    async fn sent_folder(&self) -> SyncResult<Folder> {
        let query = Query::new()
            .equal("accountId", self.account.id.as_str())
            .equal("role", "sent");
        if let Some(folder) = self.store.find::<Folder>(query.clone()).await? {
            return Ok(folder);
        }
        if let Some(label) = self.store.find::<Label>(query).await? {
            return Ok(label.0);
        }
        Err(SyncError::not_found("Folder", "role=sent"))
    }

    // ---- expunge / raw fetch ----

    async fn remote_expunge_all(&self, task: &Task, conn: &mut ImapConnection) -> SyncResult<()> {
        let path = task.data["folder"]["path"]
            .as_str()
            .ok_or_else(|| SyncError::other("ExpungeAllInFolderTask requires folder.path"))?;
        let folder_id = task.data["folder"]["id"].as_str().unwrap_or_default();

        let status = conn.select(path).await?;
        // Some servers refuse unbounded UID ranges; sweep in windows.
        let chunk = self.account.quirks().expunge_chunk;
        let mut start: u32 = 1;
        let top = status.uidnext.max(2) - 1;
        while start <= top {
            let end = start.saturating_add(chunk - 1).min(top);
            conn.add_flags(&format!("{}:{}", start, end), "\\Deleted").await?;
            start = end.saturating_add(1);
        }
        conn.expunge().await?;
        info!(folder = path, "expunged folder");

        // Delete local messages in small batches with pauses so the
        // client can keep up with the unpersist flood.
        let labels = self.store.labels(&self.account.id).await?;
        let processor = self.processor();
        let all: Vec<Message> = self
            .store
            .find_all(
                Query::new()
                    .equal("accountId", self.account.id.as_str())
                    .equal("remoteFolderId", folder_id),
            )
            .await?;
        let folder = self.store.find_by_id::<Folder>(folder_id).await?;
        for block in all.chunks(EXPUNGE_LOCAL_BATCH) {
            let mut tx = self.store.begin().await?;
            for message in block {
                processor
                    .remove_message(&mut tx, message, folder.as_ref(), &labels)
                    .await?;
            }
            tx.commit().await?;
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok(())
    }

    async fn remote_get_rfc2822(&self, task: &Task, conn: &mut ImapConnection) -> SyncResult<()> {
        let message_id = task.field_str("messageId");
        let filepath = task.field_str("filepath");
        let message = self
            .store
            .find_by_id::<Message>(&message_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Message", message_id.as_str()))?;
        let folder = self
            .store
            .find_by_id::<Folder>(&message.remote_folder_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Folder", message.remote_folder_id.as_str()))?;
        conn.select(&folder.path).await?;
        let raw = conn
            .fetch_body(message.remote_uid)
            .await?
            .ok_or_else(|| SyncError::other("server returned no body"))?;
        std::fs::write(&filepath, raw)?;
        Ok(())
    }
}

/// Move messages, preferring MOVE, falling back to COPY+STORE+EXPUNGE.
/// Returns `message id → (dest folder id, new uid)` for every message
/// whose new UID could be determined.
async fn move_messages_resilient(
    conn: &mut ImapConnection,
    account: &Account,
    source_path: &str,
    dest: &Folder,
    messages: &[Message],
) -> SyncResult<HashMap<String, (String, u32)>> {
    conn.select(source_path).await?;
    let uids: Vec<u32> = messages.iter().map(|m| m.remote_uid).collect();
    let set = util::uid_set_string(&uids);

    let mut must_apply_attributes = false;
    let uidmap = if conn.supports_move() {
        conn.uid_move(&set, &dest.path).await?
    } else {
        let map = conn.uid_copy(&set, &dest.path).await?;
        conn.add_flags(&set, "\\Deleted").await?;
        conn.expunge().await?;
        // COPY does not preserve arbitrary flags on all servers.
        must_apply_attributes = true;
        map
    };

    let mut updates: HashMap<String, (String, u32)> = HashMap::new();
    match uidmap {
        Some(map) => {
            for message in messages {
                match map.get(&message.remote_uid) {
                    Some(new_uid) => {
                        updates.insert(message.id.clone(), (dest.id.clone(), *new_uid));
                    }
                    None => {
                        return Err(SyncError::other("move did not provide a new UID"));
                    }
                }
            }
        }
        None => {
            // No UIDPLUS: moves land at high UIDs, so fetch the tail of
            // the destination and re-match by computed message id.
            let status = conn.status(&dest.path).await?;
            let min = status
                .uidnext
                .saturating_sub(messages.len() as u32 * 2)
                .max(1);
            conn.select(&dest.path).await?;
            let fetched = conn.fetch(&format!("{}:*", min), true, None).await?;
            for item in &fetched.messages {
                let Some(header) = item.header.as_deref() else { continue };
                let Ok((headers, _)) = mailparse::parse_headers(header) else { continue };
                use mailparse::MailHeaderMap;
                let date = headers
                    .get_first_value("Date")
                    .and_then(|v| mailparse::dateparse(&v).ok())
                    .unwrap_or(0);
                let subject = headers.get_first_value("Subject").unwrap_or_default();
                let header_message_id =
                    headers.get_first_value("Message-ID").unwrap_or_default();
                let mut recipients: Vec<String> = Vec::new();
                for field in ["To", "Cc", "Bcc"] {
                    if let Some(value) = headers.get_first_value(field) {
                        if let Ok(list) = mailparse::addrparse(&value) {
                            for addr in list.iter() {
                                if let mailparse::MailAddr::Single(info) = addr {
                                    recipients.push(info.addr.clone());
                                }
                            }
                        }
                    }
                }
                let moved_id = util::id_for_message(
                    &account.id,
                    &dest.path,
                    item.uid,
                    &util::MessageIdParts {
                        date,
                        subject: &subject,
                        recipient_emails: recipients,
                        header_message_id: &header_message_id,
                    },
                );
                if let Some(message) = messages.iter().find(|m| m.id == moved_id) {
                    updates.insert(message.id.clone(), (dest.id.clone(), item.uid));
                }
            }
            for message in messages {
                if !updates.contains_key(&message.id) {
                    warn!(message = %message.id, "could not find new UID after move");
                }
            }
        }
    }

    if must_apply_attributes {
        conn.select(&dest.path).await?;
        for message in messages {
            let Some((_, new_uid)) = updates.get(&message.id) else { continue };
            let mut flags: Vec<&str> = Vec::new();
            if message.starred {
                flags.push("\\Flagged");
            }
            if !message.unread {
                flags.push("\\Seen");
            }
            if message.draft {
                flags.push("\\Draft");
            }
            if !flags.is_empty() {
                conn.add_flags(&new_uid.to_string(), &flags.join(" ")).await?;
            }
        }
    }
    Ok(updates)
}

/// Map a label's role/path to the Gmail X-GM-LABELS key.
fn xgm_key_for_category(role: &str, path: &str) -> String {
    match role {
        "inbox" => "\\Inbox".to_string(),
        "important" => "\\Important".to_string(),
        "starred" => "\\Starred".to_string(),
        "sent" => "\\Sent".to_string(),
        "drafts" => "\\Draft".to_string(),
        "all" => "\\All".to_string(),
        "spam" => "\\Spam".to_string(),
        "trash" => "\\Trash".to_string(),
        _ => path.to_string(),
    }
}

fn xgm_keys(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .map(|l| {
                    xgm_key_for_category(
                        l.get("role").and_then(Value::as_str).unwrap_or(""),
                        l.get("path").and_then(Value::as_str).unwrap_or(""),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Local projection of a label add/remove onto a message's label set.
fn apply_label_change(message: &mut Message, data: &Value) {
    let to_add = xgm_keys(&data["labelsToAdd"]);
    let to_remove = xgm_keys(&data["labelsToRemove"]);
    for label in to_add {
        if !message.remote_xgm_labels.contains(&label) {
            message.remote_xgm_labels.push(label);
        }
    }
    message.remote_xgm_labels.retain(|l| !to_remove.contains(l));
    message.remote_xgm_labels.sort();
}

fn label_category_ref(
    labels: &[Label],
    name: &str,
) -> Option<crate::models::thread::CategoryRef> {
    let resolved = match name {
        "\\Inbox" => "inbox",
        "\\Important" => "important",
        "\\Starred" => "starred",
        "\\Sent" => "sent",
        "\\Draft" | "\\Drafts" => "drafts",
        other => other,
    };
    labels
        .iter()
        .find(|l| {
            let folder = &l.0;
            if !folder.role.is_empty() {
                folder.role == resolved || folder.path.eq_ignore_ascii_case(resolved)
            } else {
                folder.path.eq_ignore_ascii_case(resolved)
            }
        })
        .map(|l| crate::models::thread::CategoryRef {
            id: l.0.id.clone(),
            path: l.0.path.clone(),
            role: l.0.role.clone(),
            refs: 0,
            unread: 0,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xgm_keys_map_roles_to_gmail_names() {
        let labels = json!([
            {"role": "inbox", "path": "INBOX"},
            {"role": "", "path": "Receipts"},
        ]);
        assert_eq!(xgm_keys(&labels), vec!["\\Inbox", "Receipts"]);
    }

    #[test]
    fn label_changes_apply_and_stay_sorted() {
        let mut message = Message {
            id: "m".into(),
            account_id: "a".into(),
            version: 0,
            header_message_id: String::new(),
            subject: String::new(),
            date: 0,
            from: vec![],
            to: vec![],
            cc: vec![],
            bcc: vec![],
            reply_to: vec![],
            g_msg_id: String::new(),
            unread: false,
            starred: false,
            draft: false,
            remote_uid: 1,
            remote_folder_id: String::new(),
            remote_xgm_labels: vec!["Receipts".into(), "Work".into()],
            client_folder_id: String::new(),
            thread_id: String::new(),
            snippet: String::new(),
            files: vec![],
            synced_at: 0,
            sync_unsaved_changes: 0,
            reply_to_header_message_id: None,
            hidden: false,
        };
        let data = json!({
            "labelsToAdd": [{"role": "important", "path": "[Gmail]/Important"}],
            "labelsToRemove": [{"role": "", "path": "Work"}],
        });
        apply_label_change(&mut message, &data);
        assert_eq!(message.remote_xgm_labels, vec!["\\Important", "Receipts"]);
    }
}
