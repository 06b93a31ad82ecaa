//! IMAP sync workers
//!
//! The background worker sweeps every folder: list reconciliation, chunked
//! initial backfill, CONDSTORE/QRESYNC fast path or the three-tier polling
//! scans, body caching, and cache cleanup. The foreground worker holds an
//! IDLE on the primary folder, drains the task queue's remote phase, and
//! services on-demand body fetches.

use super::{FetchedMessage, FolderStatus, ImapConnection, RemoteFolder};
use crate::backoff::{Backoff, Policy};
use crate::config::{Account, Config, Identity};
use crate::delta::{DeltaStreamItem, DEFAULT_FLUSH_WITHIN, DELTA_TYPE_PERSIST};
use crate::error::{SyncError, SyncResult};
use crate::models::message::unlink_uid_for_phase;
use crate::models::{Folder, Label, Message, MessageAttributes};
use crate::oauth::TokenManager;
use crate::processor::MailProcessor;
use crate::store::{MailStore, Query};
use crate::tasks::TaskProcessor;
use crate::util;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

const SYNC_LOOP_INTERVAL: Duration = Duration::from_secs(120);
const IDLE_TIMEOUT: Duration = Duration::from_secs(290);
const SHALLOW_SCAN_INTERVAL: i64 = 60 * 2;
const DEEP_SCAN_INTERVAL: i64 = 60 * 10;
const CACHE_CLEANUP_INTERVAL: i64 = 60 * 60;
const BODY_MAX_AGE: i64 = 24 * 60 * 60 * 90;
const BODY_PURGE_AFTER: i64 = 24 * 60 * 60 * 14;
const BODIES_PER_BATCH: i64 = 30;

const FIRST_CHUNK_SIZE: u32 = 750;
const CHUNK_SIZE: u32 = 5000;
const MAX_FULL_HEADERS_REQUEST_SIZE: usize = 1024;
const MODSEQ_TRUNCATION_THRESHOLD: u64 = 4000;
const MODSEQ_TRUNCATION_UID_COUNT: u32 = 12_000;
const SHALLOW_SCAN_DEPTH: i64 = 399;
const UNLINK_QUERY_CHUNK: usize = 200;

/// Wake signals and the on-demand body queue shared between the
/// dispatcher and the two workers.
#[derive(Clone, Default)]
pub struct SyncSignals {
    pub wake: Arc<Notify>,
    pub idle_interrupt: Arc<Notify>,
    body_queue: Arc<Mutex<Vec<String>>>,
}

impl SyncSignals {
    pub fn wake_workers(&self) {
        self.wake.notify_waiters();
        self.idle_interrupt.notify_waiters();
    }

    /// Push ids for immediate body fetch. The queue drains LIFO: the ids
    /// the user requested most recently are what they're looking at now.
    pub fn queue_bodies(&self, ids: Vec<String>) {
        self.body_queue.lock().extend(ids);
        self.idle_interrupt.notify_waiters();
    }

    fn pop_body(&self) -> Option<String> {
        self.body_queue.lock().pop()
    }
}

pub struct SyncWorker {
    store: Arc<MailStore>,
    account: Arc<Account>,
    config: Arc<Config>,
    identity: Identity,
    tokens: Arc<TokenManager>,
    signals: SyncSignals,
    processor: MailProcessor,
    connection: Option<ImapConnection>,
    unlink_phase: u8,
    iterations_since_launch: u64,
}

impl SyncWorker {
    pub fn new(
        store: Arc<MailStore>,
        account: Arc<Account>,
        config: Arc<Config>,
        identity: Identity,
        tokens: Arc<TokenManager>,
        signals: SyncSignals,
    ) -> Self {
        let processor = MailProcessor::new(store.clone(), account.clone(), config.clone());
        SyncWorker {
            store,
            account,
            config,
            identity,
            tokens,
            signals,
            processor,
            connection: None,
            unlink_phase: 1,
            iterations_since_launch: 0,
        }
    }

    async fn connection(&mut self) -> SyncResult<&mut ImapConnection> {
        if self.connection.is_none() {
            let token = self.tokens.token_for(&self.account).await?;
            let conn = ImapConnection::connect(&self.account, token.as_deref()).await?;
            self.connection = Some(conn);
        }
        Ok(self.connection.as_mut().unwrap())
    }

    fn drop_connection(&mut self) {
        self.connection = None;
    }

    /// Publish the connection-error indicator the client shows while the
    /// machine is offline; cleared on the next successful loop.
    fn publish_connection_state(&self, error: Option<&SyncError>) {
        let payload = serde_json::json!({
            "id": self.account.id,
            "connectionError": error.map(|e| e.to_string()),
        });
        self.store.delta_stream().emit(
            DeltaStreamItem::with_json(DELTA_TYPE_PERSIST, "Account", payload),
            DEFAULT_FLUSH_WITHIN,
        );
    }

    // ---- background ----

    pub async fn run_background(mut self) {
        let mut backoff = Backoff::new(Policy::imap_worker());
        loop {
            match self.sync_now().await {
                Ok(sync_again_immediately) => {
                    backoff.reset();
                    self.publish_connection_state(None);
                    if sync_again_immediately {
                        continue;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(SYNC_LOOP_INTERVAL) => {}
                        _ = self.signals.wake.notified() => {}
                    }
                }
                Err(err) if err.requires_reauth() => {
                    error!(account = %self.account.id, error = %err, "authentication failed; stopping background sync");
                    self.publish_connection_state(Some(&err));
                    return;
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(account = %self.account.id, error = %err, category = err.category(),
                          retry_in = ?delay, "sync loop failed");
                    if err.is_offline() {
                        self.publish_connection_state(Some(&err));
                    }
                    self.drop_connection();
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One full sweep of every folder. Returns true when there is more
    /// work to do immediately (backfill or body batches outstanding).
    pub async fn sync_now(&mut self) -> SyncResult<bool> {
        let mut sync_again_immediately = false;

        let mut folders = self.sync_folders_and_labels().await?;
        folders.sort_by_key(|f| util::role_priority(&f.role));

        for mut folder in folders {
            let initial_status = folder.local_status.clone();
            let remote = match self.connection().await?.status(&folder.path).await {
                Ok(status) => status,
                Err(err) => {
                    warn!(folder = %folder.path, error = %err, "unable to get folder status, skipping");
                    continue;
                }
            };

            let mut first_chunk = false;
            if folder.local_status.is_unseeded() {
                // Seed bookkeeping; the highestmodseq recorded now belongs
                // to the oldest synced block, so later CONDSTORE fetches
                // see everything that changed during backfill.
                let ls = &mut folder.local_status;
                ls.highestmodseq = remote.highestmodseq;
                ls.uidvalidity = remote.uidvalidity;
                ls.uidvalidity_reset_count = 0;
                ls.uidnext = remote.uidnext;
                ls.synced_min_uid = remote.uidnext;
                ls.last_shallow = 0;
                ls.last_deep = 0;
                first_chunk = true;
            }

            // With a custom container folder (ProtonMail bridge layout),
            // All Mail duplicates every message; skip it.
            if self.account.container_folder.is_some() && folder.path == "All Mail" {
                let now = util::now_secs();
                let ls = &mut folder.local_status;
                ls.last_shallow = now;
                ls.last_deep = now;
                ls.bodies_wanted = 0;
                ls.synced_min_uid = 1;
                ls.uidnext = remote.uidnext;
                self.save_folder_if_changed(&mut folder, &initial_status).await?;
                continue;
            }

            if folder.local_status.uidvalidity != remote.uidvalidity && !first_chunk {
                self.recover_from_uid_invalidity(&mut folder, &remote).await?;
                self.save_folder_if_changed(&mut folder, &initial_status).await?;
                continue;
            }

            // Initial backfill: grab the next chunk below syncedMinUID.
            let chunk_size = if first_chunk { FIRST_CHUNK_SIZE } else { CHUNK_SIZE };
            let mut synced_min_uid = folder.local_status.synced_min_uid;
            if synced_min_uid > 1 {
                let mut chunk_min = synced_min_uid.saturating_sub(chunk_size).max(1);
                if remote.message_count < chunk_size {
                    // Sparse UID space with few messages: take it all.
                    chunk_min = 1;
                }
                self.sync_folder_uid_range(&mut folder, chunk_min, synced_min_uid, true, None)
                    .await?;
                folder.local_status.synced_min_uid = chunk_min;
                synced_min_uid = chunk_min;
            }

            let use_qresync = {
                let conn = self.connection().await?;
                conn.supports_qresync()
            };
            if use_qresync {
                self.sync_folder_changes_via_condstore(&mut folder, &remote, true)
                    .await?;
            } else {
                self.sync_folder_via_scans(&mut folder, &remote).await?;
            }

            let mut more_to_do = false;
            if self.sync_message_bodies(&mut folder).await? {
                more_to_do = true;
            }
            if synced_min_uid > 1 {
                more_to_do = true;
            }

            let now = util::now_secs();
            if synced_min_uid == 1 && now - folder.local_status.last_cleanup > CACHE_CLEANUP_INTERVAL
            {
                self.clean_message_cache(&mut folder).await?;
                folder.local_status.last_cleanup = now;
            }

            folder.local_status.busy = more_to_do;
            sync_again_immediately = sync_again_immediately || more_to_do;
            self.save_folder_if_changed(&mut folder, &initial_status).await?;
        }

        // Everything just discovered missing was unlinked with the current
        // phase; deleting the other phase gives a moved message one full
        // cycle to reappear in its new folder.
        self.unlink_phase = if self.unlink_phase == 1 { 2 } else { 1 };
        self.processor
            .delete_messages_still_unlinked(self.unlink_phase)
            .await?;

        self.iterations_since_launch += 1;
        debug!(account = %self.account.id, "sync loop complete");
        Ok(sync_again_immediately)
    }

    async fn save_folder_if_changed(
        &self,
        folder: &mut Folder,
        initial: &crate::models::FolderLocalStatus,
    ) -> SyncResult<()> {
        if &folder.local_status != initial {
            self.store.save(folder).await?;
        }
        Ok(())
    }

    async fn recover_from_uid_invalidity(
        &mut self,
        folder: &mut Folder,
        remote: &FolderStatus,
    ) -> SyncResult<()> {
        warn!(folder = %folder.path, "UIDVALIDITY changed; unlinking and rebuilding UID map");
        let phase = self.unlink_phase;
        self.processor
            .unlink_messages_matching(
                Query::new().equal("remoteFolderId", folder.id.as_str()),
                phase,
            )
            .await?;
        // Re-scan the whole folder; the heavy fetch re-computes message
        // ids, which re-links every message that still exists.
        self.sync_folder_uid_range(folder, 1, u32::MAX, false, None)
            .await?;

        let ls = &mut folder.local_status;
        ls.uidvalidity_reset_count += 1;
        ls.highestmodseq = remote.highestmodseq;
        ls.uidvalidity = remote.uidvalidity;
        ls.uidnext = remote.uidnext;
        ls.synced_min_uid = 1;
        let now = util::now_secs();
        ls.last_shallow = now;
        ls.last_deep = now;
        Ok(())
    }

    async fn sync_folder_via_scans(
        &mut self,
        folder: &mut Folder,
        remote: &FolderStatus,
    ) -> SyncResult<()> {
        let remote_uidnext = remote.uidnext;
        let local_uidnext = folder.local_status.uidnext;
        let now = util::now_secs();

        let time_for_deep = self.iterations_since_launch > 0
            && now - folder.local_status.last_deep > DEEP_SCAN_INTERVAL;
        let time_for_shallow =
            !time_for_deep && now - folder.local_status.last_shallow > SHALLOW_SCAN_INTERVAL;

        // New arrivals are fetched heavy, and for the primary folders we
        // grab a few bodies immediately so snippets appear quickly.
        if remote_uidnext > local_uidnext {
            let mut synced: Vec<Message> = Vec::new();
            self.sync_folder_uid_range(folder, local_uidnext, remote_uidnext, true, Some(&mut synced))
                .await?;

            if folder.role == "inbox" || folder.role == "all" {
                synced.sort_by(|a, b| b.remote_uid.cmp(&a.remote_uid));
                for message in synced.into_iter().take(BODIES_PER_BATCH as usize) {
                    if self.store.claim_body(&message.id).await? {
                        self.fetch_and_ingest_body(&message).await;
                    }
                }
            }
            folder.local_status.uidnext = remote_uidnext;
        }

        if time_for_shallow {
            // Local uidnext: the range above already covered new arrivals.
            let mut bottom_uid = self
                .store
                .message_uid_at_depth(&folder.id, SHALLOW_SCAN_DEPTH, local_uidnext)
                .await?;
            if bottom_uid < folder.local_status.synced_min_uid {
                bottom_uid = folder.local_status.synced_min_uid;
            }
            if remote_uidnext > bottom_uid {
                self.sync_folder_uid_range(folder, bottom_uid, remote_uidnext, false, None)
                    .await?;
            }
            folder.local_status.last_shallow = util::now_secs();
            folder.local_status.uidnext = remote_uidnext;
        }

        if time_for_deep {
            let min = folder.local_status.synced_min_uid;
            self.sync_folder_uid_range(folder, min, u32::MAX, false, None)
                .await?;
            let now = util::now_secs();
            folder.local_status.last_shallow = now;
            folder.local_status.last_deep = now;
            folder.local_status.uidnext = remote_uidnext;
        }
        Ok(())
    }

    /// Reconcile `[min_uid, max_uid)` of a folder against the server.
    /// `max_uid == u32::MAX` means "to the end". A heavy request larger
    /// than the cap is downgraded to attributes-only, and the messages
    /// whose headers are still needed get a second, targeted fetch.
    async fn sync_folder_uid_range(
        &mut self,
        folder: &mut Folder,
        mut min_uid: u32,
        max_uid: u32,
        mut heavy: bool,
        mut collect: Option<&mut Vec<Message>>,
    ) -> SyncResult<()> {
        if min_uid == 0 {
            // "0" is not a valid start; servers answer with the last item.
            min_uid = 1;
        }
        let open_ended = max_uid == u32::MAX;
        let range_len = if open_ended { u32::MAX } else { max_uid.saturating_sub(min_uid) };
        if range_len as usize > MAX_FULL_HEADERS_REQUEST_SIZE {
            heavy = false;
        }
        if !open_ended && max_uid <= min_uid {
            return Ok(());
        }

        info!(folder = %folder.path, min_uid, max_uid, heavy, "syncing folder UID range");

        // Local attributes first: if the server fetch is slow, computing
        // deletions against a stale local set over-deletes.
        let local = self.local_attributes_in_range(folder, min_uid, max_uid).await?;

        let set = if open_ended {
            format!("{}:*", min_uid)
        } else {
            format!("{}:{}", min_uid, max_uid.saturating_sub(1))
        };
        let fetched = {
            let conn = self.connection().await?;
            conn.select(&folder.path).await?;
            conn.fetch(&set, heavy, None).await?
        };

        let mut seen: HashSet<u32> = HashSet::with_capacity(fetched.messages.len());
        let mut changed_light: Vec<FetchedMessage> = Vec::new();
        let mut heavy_items: Vec<FetchedMessage> = Vec::new();
        let mut heavy_needed: Vec<u32> = Vec::new();
        let mut heavy_needed_ideal = 0usize;

        for item in fetched.messages {
            seen.insert(item.uid);
            let incoming = MessageAttributes::new(
                item.uid,
                item.unread(),
                item.starred(),
                item.draft(),
                item.sorted_labels(),
            );
            match local.get(&item.uid) {
                Some(existing) if *existing == incoming => {}
                Some(_) => {
                    if heavy {
                        heavy_items.push(item);
                    } else {
                        changed_light.push(item);
                    }
                }
                None => {
                    if heavy {
                        heavy_items.push(item);
                    } else {
                        if heavy_needed.len() < MAX_FULL_HEADERS_REQUEST_SIZE {
                            heavy_needed.push(item.uid);
                        }
                        heavy_needed_ideal += 1;
                    }
                }
            }
        }

        if !heavy_items.is_empty() {
            self.processor.ingest_heavy(folder, &heavy_items).await?;
            if let Some(collect) = collect.as_deref_mut() {
                for item in &heavy_items {
                    if let Some(message) = self
                        .store
                        .find::<Message>(
                            Query::new()
                                .equal("remoteFolderId", folder.id.as_str())
                                .equal("remoteUID", item.uid),
                        )
                        .await?
                    {
                        collect.push(message);
                    }
                }
            }
        }

        if !changed_light.is_empty() {
            let missing = self.processor.ingest_attributes(folder, &changed_light).await?;
            for uid in missing {
                if heavy_needed.len() < MAX_FULL_HEADERS_REQUEST_SIZE {
                    heavy_needed.push(uid);
                }
                heavy_needed_ideal += 1;
            }
        }

        if !heavy && !heavy_needed.is_empty() {
            // The remainder past the cap is picked up by the next deep scan.
            info!(
                folder = %folder.path,
                fetching = heavy_needed.len(),
                needed = heavy_needed_ideal,
                "fetching full headers for new messages"
            );
            let set = util::uid_set_string(&heavy_needed);
            let second = self.connection().await?.fetch(&set, true, None).await?;
            self.processor.ingest_heavy(folder, &second.messages).await?;
        }

        // Whatever identities remain in the local set were not returned by
        // the server; park them on the unlink sentinel.
        let phase = self.unlink_phase;
        let missing: Vec<u32> = local
            .keys()
            .filter(|uid| !seen.contains(uid))
            .copied()
            .collect();
        for chunk in missing.chunks(UNLINK_QUERY_CHUNK) {
            let uids: Vec<i64> = chunk.iter().map(|u| *u as i64).collect();
            self.processor
                .unlink_messages_matching(
                    Query::new()
                        .equal("remoteFolderId", folder.id.as_str())
                        .equal_any("remoteUID", &uids),
                    phase,
                )
                .await?;
        }
        Ok(())
    }

    async fn local_attributes_in_range(
        &self,
        folder: &Folder,
        min_uid: u32,
        max_uid: u32,
    ) -> SyncResult<HashMap<u32, MessageAttributes>> {
        let mut query = Query::new()
            .equal("remoteFolderId", folder.id.as_str())
            .gte("remoteUID", min_uid);
        query = if max_uid == u32::MAX {
            query.lt("remoteUID", unlink_uid_for_phase(1))
        } else {
            query.lt("remoteUID", max_uid)
        };
        let messages: Vec<Message> = self.store.find_all(query).await?;
        Ok(messages
            .into_iter()
            .map(|m| (m.remote_uid, m.attributes()))
            .collect())
    }

    /// CONDSTORE fast path: one CHANGEDSINCE fetch applies new and changed
    /// messages; QRESYNC VANISHED reports deletions.
    async fn sync_folder_changes_via_condstore(
        &mut self,
        folder: &mut Folder,
        remote: &FolderStatus,
        must_sync_all: bool,
    ) -> SyncResult<()> {
        let local_uidnext = folder.local_status.uidnext;
        let local_modseq = folder.local_status.highestmodseq;

        if local_modseq == remote.highestmodseq && local_uidnext == remote.uidnext {
            return Ok(());
        }

        info!(
            folder = %folder.path,
            modseq_from = local_modseq, modseq_to = remote.highestmodseq,
            uidnext_from = local_uidnext, uidnext_to = remote.uidnext,
            "syncing changes via CONDSTORE"
        );

        // A huge modseq delta can produce a request that takes forever and
        // blocks the foreground worker; bound it to the most recent UIDs
        // and let the deep scan recover the rest.
        let mut bottom_uid = 1u32;
        if !must_sync_all
            && remote.highestmodseq.saturating_sub(local_modseq) > MODSEQ_TRUNCATION_THRESHOLD
        {
            bottom_uid = remote.uidnext.saturating_sub(MODSEQ_TRUNCATION_UID_COUNT).max(1);
            warn!(folder = %folder.path, bottom_uid, "CONDSTORE request truncated; deep scan will recover the rest");
        }

        let set = format!("{}:*", bottom_uid);
        let result = {
            let conn = self.connection().await?;
            conn.select(&folder.path).await?;
            conn.fetch(&set, true, Some(local_modseq)).await?
        };

        debug!(
            folder = %folder.path,
            changed = result.messages.len(),
            vanished = result.vanished.len(),
            "CONDSTORE changes"
        );

        self.processor.ingest_heavy(folder, &result.messages).await?;

        let phase = self.unlink_phase;
        for chunk in result.vanished.chunks(UNLINK_QUERY_CHUNK) {
            let uids: Vec<i64> = chunk.iter().map(|u| *u as i64).collect();
            self.processor
                .unlink_messages_matching(
                    Query::new()
                        .equal("remoteFolderId", folder.id.as_str())
                        .equal_any("remoteUID", &uids),
                    phase,
                )
                .await?;
        }

        folder.local_status.uidnext = remote.uidnext;
        folder.local_status.highestmodseq = remote.highestmodseq;
        Ok(())
    }

    // ---- folder list sweep ----

    /// Reconcile the folder/label list and role assignments; returns the
    /// selectable folders to sync, with Gmail labels persisted separately.
    async fn sync_folders_and_labels(&mut self) -> SyncResult<Vec<Folder>> {
        let container = self.account.container_folder_name();
        let mut remote_folders = self.connection().await?.list_folders().await?;
        let is_gmail = self.connection().await?.is_gmail();

        // Create the app-owned Snoozed folder server-side when missing.
        let have_snoozed = remote_folders.iter().any(|remote| {
            folder_role(&container, remote) == "snoozed"
        });
        if !have_snoozed {
            let delimiter = remote_folders
                .first()
                .map(|f| f.delimiter)
                .unwrap_or('/');
            let path = format!("{}{}Snoozed", container, delimiter);
            match self.connection().await?.create_folder(&path).await {
                Ok(()) => {
                    info!(path = %path, "created app folder");
                    remote_folders.push(RemoteFolder {
                        path,
                        delimiter,
                        attributes: Vec::new(),
                    });
                }
                Err(err) => warn!(error = %err, "could not create app folder"),
            }
        }

        remote_folders.retain(|f| !f.no_select());

        let account_query = Query::new().equal("accountId", self.account.id.as_str());
        let mut unused_folders: HashMap<String, Folder> = self
            .store
            .find_all::<Folder>(account_query.clone())
            .await?
            .into_iter()
            .map(|f| (f.id.clone(), f))
            .collect();
        let mut unused_labels: HashMap<String, Label> = self
            .store
            .find_all::<Label>(account_query)
            .await?
            .into_iter()
            .map(|l| (l.0.id.clone(), l))
            .collect();

        let mut folders_to_sync: Vec<Folder> = Vec::new();
        let mut labels_seen: Vec<Label> = Vec::new();

        let mut tx = self.store.begin().await?;
        for remote in &remote_folders {
            let id = util::id_for_folder(&self.account.id, &remote.path);

            // On Gmail, entries other than All/Trash/Spam are labels.
            let is_label = is_gmail
                && !remote.has_attribute("\\All")
                && !remote.has_attribute("\\Trash")
                && !remote.has_attribute("\\Spam")
                && !remote.has_attribute("\\Junk");

            if is_label {
                let label = match unused_labels.remove(&id) {
                    Some(label) => label,
                    None => {
                        let mut label = Label::new(&self.account.id, &remote.path, remote.delimiter);
                        tx.save(&mut label).await?;
                        label
                    }
                };
                labels_seen.push(label);
            } else {
                let folder = match unused_folders.remove(&id) {
                    Some(folder) => folder,
                    None => {
                        let mut folder = Folder::new(&self.account.id, &remote.path, remote.delimiter);
                        tx.save(&mut folder).await?;
                        folder
                    }
                };
                folders_to_sync.push(folder);
            }
        }

        // Assign roles: first by server flags, then by path.
        for role in ["inbox", "sent", "drafts", "all", "archive", "trash", "spam", "important", "starred", "snoozed"] {
            let assigned = folders_to_sync.iter().any(|f| f.role == role)
                || labels_seen.iter().any(|l| l.0.role == role);
            if assigned {
                continue;
            }
            for via_flags in [true, false] {
                let matched = remote_folders.iter().find(|remote| {
                    let found = if via_flags {
                        role_via_flags(remote)
                    } else {
                        &folder_role_via_path(&container, remote)
                    };
                    found == role
                });
                if let Some(remote) = matched {
                    let id = util::id_for_folder(&self.account.id, &remote.path);
                    if let Some(folder) = folders_to_sync.iter_mut().find(|f| f.id == id) {
                        folder.role = role.to_string();
                        tx.save(folder).await?;
                        break;
                    }
                    if let Some(label) = labels_seen.iter_mut().find(|l| l.0.id == id) {
                        label.0.role = role.to_string();
                        tx.save(label).await?;
                        break;
                    }
                }
            }
        }

        // Anything left was removed on the server.
        for (_, folder) in unused_folders {
            tx.remove(&folder).await?;
        }
        for (_, label) in unused_labels {
            tx.remove(&label).await?;
        }
        tx.commit().await?;

        Ok(folders_to_sync)
    }

    // ---- bodies ----

    async fn sync_message_bodies(&mut self, folder: &mut Folder) -> SyncResult<bool> {
        if !should_cache_bodies(folder) {
            return Ok(false);
        }
        let min_date = util::now_secs() - BODY_MAX_AGE;
        let ids = self
            .store
            .message_ids_needing_bodies(&folder.id, min_date, BODIES_PER_BATCH)
            .await?;

        let mut fetched_any = false;
        for id in ids {
            if !self.store.claim_body(&id).await? {
                continue; // another pass claimed it
            }
            let Some(message) = self.store.find_by_id::<Message>(&id).await? else {
                continue;
            };
            folder.local_status.bodies_present += 1;
            self.fetch_and_ingest_body(&message).await;
            fetched_any = true;
        }
        Ok(fetched_any)
    }

    /// Fetch and ingest one body. Fetch failures are logged and swallowed:
    /// messages (especially drafts) can vanish between the local query and
    /// the fetch, and the claimed row suppresses retries.
    async fn fetch_and_ingest_body(&mut self, message: &Message) {
        let folder = match self.store.find_by_id::<Folder>(&message.remote_folder_id).await {
            Ok(Some(folder)) => folder,
            _ => return,
        };
        let result: SyncResult<()> = async {
            let raw = {
                let conn = self.connection().await?;
                conn.select(&folder.path).await?;
                conn.fetch_body(message.remote_uid).await?
            };
            if let Some(raw) = raw {
                self.processor.ingest_body(&message.id, &raw).await?;
            }
            Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!(
                message = %message.id,
                folder = %folder.path,
                uid = message.remote_uid,
                error = %err,
                "unable to fetch message body"
            );
        }
    }

    async fn clean_message_cache(&mut self, folder: &mut Folder) -> SyncResult<()> {
        debug!(folder = %folder.path, "cleaning body cache and updating stats");
        let now = util::now_secs();
        let purged = self
            .store
            .purge_bodies(&folder.id, now - BODY_PURGE_AFTER, now - BODY_MAX_AGE)
            .await?;
        if purged > 0 {
            debug!(folder = %folder.path, purged, "purged cached bodies");
        }
        folder.local_status.bodies_present = self.store.count_bodies_present(&folder.id).await?;
        folder.local_status.bodies_wanted = if should_cache_bodies(folder) {
            self.store
                .count_bodies_wanted(&folder.id, now - BODY_MAX_AGE)
                .await?
        } else {
            0
        };
        Ok(())
    }

    // ---- foreground ----

    pub async fn run_foreground(mut self) {
        let mut backoff = Backoff::new(Policy::imap_worker());
        loop {
            match self.idle_cycle_iteration().await {
                Ok(()) => backoff.reset(),
                Err(err) if err.requires_reauth() => {
                    error!(account = %self.account.id, error = %err, "authentication failed; stopping foreground worker");
                    return;
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(account = %self.account.id, error = %err, retry_in = ?delay, "idle cycle failed");
                    self.drop_connection();
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn idle_cycle_iteration(&mut self) -> SyncResult<()> {
        // 1. On-demand body fetches, most recently requested first.
        while let Some(id) = self.signals.pop_body() {
            if let Some(message) = self.store.find_by_id::<Message>(&id).await? {
                debug!(message = %message.id, "fetching body on demand");
                let _ = self.store.claim_body(&message.id).await;
                self.fetch_and_ingest_body(&message).await;
            }
        }

        // 2. Drain tasks ready for their remote phase. Tasks created while
        // a task runs (SendDraft queueing SyncbackMetadata) run in the same
        // pass.
        {
            let smtp_token = self.tokens.token_for(&self.account).await?;
            self.connection().await?;
            let mut task_processor = TaskProcessor::with_identity(
                self.store.clone(),
                self.account.clone(),
                self.config.clone(),
                self.identity.clone(),
                smtp_token,
            );
            task_processor.cleanup_old_tasks().await?;
            loop {
                let conn = self.connection.as_mut().expect("connected above");
                let ran = task_processor.perform_ready_remote(conn).await?;
                if ran == 0 {
                    break;
                }
            }
        }

        // 3. Quick scan of the primary folder so new mail appears fast.
        let inbox = match self
            .store
            .find::<Folder>(
                Query::new()
                    .equal("accountId", self.account.id.as_str())
                    .equal("role", "inbox"),
            )
            .await?
        {
            Some(folder) => Some(folder),
            None => {
                self.store
                    .find::<Folder>(
                        Query::new()
                            .equal("accountId", self.account.id.as_str())
                            .equal("role", "all"),
                    )
                    .await?
            }
        };
        let Some(mut inbox) = inbox else {
            return Err(SyncError::other("no inbox or all folder to IDLE on"));
        };

        if !inbox.local_status.is_unseeded() {
            let initial_status = inbox.local_status.clone();
            let remote = self.connection().await?.status(&inbox.path).await?;
            if self.connection().await?.supports_condstore() {
                // Without QRESYNC this misses vanished messages until the
                // next shallow scan; acceptable.
                self.sync_folder_changes_via_condstore(&mut inbox, &remote, false)
                    .await?;
            } else {
                let bottom = self
                    .store
                    .message_uid_at_depth(&inbox.id, 100, remote.uidnext)
                    .await?
                    .max(inbox.local_status.synced_min_uid);
                if remote.uidnext > bottom {
                    self.sync_folder_uid_range(&mut inbox, bottom, remote.uidnext, false, None)
                        .await?;
                }
                inbox.local_status.last_shallow = util::now_secs();
                inbox.local_status.uidnext = remote.uidnext;
            }
            self.sync_message_bodies(&mut inbox).await?;
            self.save_folder_if_changed(&mut inbox, &initial_status).await?;
        }

        // 4. Hold IDLE until something happens.
        let idle_interrupt = self.signals.idle_interrupt.clone();
        let conn = self.connection().await?;
        conn.select(&inbox.path).await?;
        debug!(folder = %inbox.path, "idling");
        conn.idle(IDLE_TIMEOUT, &idle_interrupt).await?;
        Ok(())
    }
}

fn should_cache_bodies(folder: &Folder) -> bool {
    folder.role != "spam" && folder.role != "trash"
}

fn role_via_flags(remote: &RemoteFolder) -> &'static str {
    const FLAG_ROLES: [(&str, &str); 9] = [
        ("\\All", "all"),
        ("\\Sent", "sent"),
        ("\\Drafts", "drafts"),
        ("\\Junk", "spam"),
        ("\\Spam", "spam"),
        ("\\Important", "important"),
        ("\\Flagged", "starred"),
        ("\\Inbox", "inbox"),
        ("\\Trash", "trash"),
    ];
    for (flag, role) in FLAG_ROLES {
        if remote.has_attribute(flag) {
            return role;
        }
    }
    if remote.path.eq_ignore_ascii_case("INBOX") {
        return "inbox";
    }
    ""
}

fn folder_role_via_path(container: &str, remote: &RemoteFolder) -> String {
    util::role_for_folder_path(container, "", &remote.path, remote.delimiter)
}

fn folder_role(container: &str, remote: &RemoteFolder) -> String {
    let via_flags = role_via_flags(remote);
    if !via_flags.is_empty() {
        return via_flags.to_string();
    }
    folder_role_via_path(container, remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(path: &str, attrs: &[&str]) -> RemoteFolder {
        RemoteFolder {
            path: path.to_string(),
            delimiter: '/',
            attributes: attrs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn flags_take_precedence_over_paths() {
        let f = remote("Weird Name", &["\\Sent"]);
        assert_eq!(folder_role("[Mailspring]", &f), "sent");
    }

    #[test]
    fn paths_assign_roles_when_flags_are_absent() {
        assert_eq!(folder_role("[Mailspring]", &remote("INBOX", &[])), "inbox");
        assert_eq!(
            folder_role("[Mailspring]", &remote("[Gmail]/Spam", &[])),
            "spam"
        );
        assert_eq!(
            folder_role("[Mailspring]", &remote("[Mailspring]/Snoozed", &[])),
            "snoozed"
        );
        assert_eq!(folder_role("[Mailspring]", &remote("Projects", &[])), "");
    }

    #[test]
    fn spam_and_trash_skip_body_caching() {
        let mut folder = Folder::new("a", "Spam", '/');
        folder.role = "spam".into();
        assert!(!should_cache_bodies(&folder));
        folder.role = "inbox".into();
        assert!(should_cache_bodies(&folder));
    }
}
