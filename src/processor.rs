//! Message ingestion and thread bookkeeping
//!
//! Translates fetched IMAP data into store mutations: inserts and updates
//! with optimistic-lock respect, two-phase unlink/delete, thread rollup
//! maintenance, and body/attachment ingestion.

use crate::config::{Account, Config};
use crate::delta::{DeltaStreamItem, DELTA_TYPE_PERSIST};
use crate::error::SyncResult;
use crate::imap::FetchedMessage;
use crate::models::message::unlink_uid_for_phase;
use crate::models::thread::{CategoryRef, MessageSnapshot};
use crate::models::{EmailAddress, File, Folder, Label, Message, Model, Thread};
use crate::store::{MailStore, Query, StoreTransaction};
use crate::util;
use mailparse::MailHeaderMap;
use std::sync::Arc;
use tracing::{info, warn};

const SNIPPET_MAX_LEN: usize = 160;

/// Fields parsed out of a heavy fetch's header block.
struct ParsedHeader {
    date: i64,
    subject: String,
    header_message_id: String,
    from: Vec<EmailAddress>,
    to: Vec<EmailAddress>,
    cc: Vec<EmailAddress>,
    bcc: Vec<EmailAddress>,
    reply_to: Vec<EmailAddress>,
    references: Vec<String>,
}

pub struct MailProcessor {
    store: Arc<MailStore>,
    account: Arc<Account>,
    config: Arc<Config>,
}

impl MailProcessor {
    pub fn new(store: Arc<MailStore>, account: Arc<Account>, config: Arc<Config>) -> Self {
        MailProcessor {
            store,
            account,
            config,
        }
    }

    // ---- ingestion ----

    /// Ingest the results of a heavy fetch into `folder`. Returns the
    /// number of new messages created.
    pub async fn ingest_heavy(
        &self,
        folder: &Folder,
        fetched: &[FetchedMessage],
    ) -> SyncResult<usize> {
        let mut created = 0;
        let labels = self.store.labels(&self.account.id).await?;
        let mut last_yield = std::time::Instant::now();
        for item in fetched {
            // Never sit in a hard insert loop for more than ~250ms; readers
            // are waiting on the store.
            if last_yield.elapsed().as_millis() > 250 {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                last_yield = std::time::Instant::now();
            }
            let Some(header_bytes) = item.header.as_deref() else {
                continue;
            };
            let header = match parse_header(header_bytes) {
                Ok(header) => header,
                Err(err) => {
                    warn!(uid = item.uid, error = %err, "skipping unparseable header");
                    continue;
                }
            };

            let id = util::id_for_message(
                &self.account.id,
                &folder.path,
                item.uid,
                &util::MessageIdParts {
                    date: header.date,
                    subject: &header.subject,
                    recipient_emails: recipient_emails(&header),
                    header_message_id: &header.header_message_id,
                },
            );

            let mut tx = self.store.begin().await?;
            match tx.find_by_id::<Message>(&id).await? {
                Some(mut existing) => {
                    self.apply_remote_to_existing(&mut tx, &mut existing, folder, item, &labels)
                        .await?;
                }
                None => {
                    self.insert_new_message(&mut tx, folder, item, &header, id, &labels)
                        .await?;
                    created += 1;
                }
            }
            tx.commit().await?;
        }
        Ok(created)
    }

    /// Apply an attribute-only fetch: update flag/label changes on known
    /// messages and return the UIDs that have no local record (their
    /// headers still need fetching).
    pub async fn ingest_attributes(
        &self,
        folder: &Folder,
        fetched: &[FetchedMessage],
    ) -> SyncResult<Vec<u32>> {
        let mut missing = Vec::new();
        let labels = self.store.labels(&self.account.id).await?;
        for item in fetched {
            let mut tx = self.store.begin().await?;
            let existing = tx
                .find::<Message>(
                    Query::new()
                        .equal("remoteFolderId", folder.id.as_str())
                        .equal("remoteUID", item.uid),
                )
                .await?;
            match existing {
                Some(mut message) => {
                    self.apply_remote_to_existing(&mut tx, &mut message, folder, item, &labels)
                        .await?;
                    tx.commit().await?;
                }
                None => missing.push(item.uid),
            }
        }
        Ok(missing)
    }

    async fn insert_new_message(
        &self,
        tx: &mut StoreTransaction<'_>,
        folder: &Folder,
        item: &FetchedMessage,
        header: &ParsedHeader,
        id: String,
        labels: &[Label],
    ) -> SyncResult<()> {
        let mut message = Message {
            id,
            account_id: self.account.id.clone(),
            version: 0,
            header_message_id: header.header_message_id.clone(),
            subject: header.subject.clone(),
            date: header.date,
            from: header.from.clone(),
            to: header.to.clone(),
            cc: header.cc.clone(),
            bcc: header.bcc.clone(),
            reply_to: header.reply_to.clone(),
            g_msg_id: item.gm_msgid.map(|v| v.to_string()).unwrap_or_default(),
            unread: item.unread(),
            starred: item.starred(),
            draft: item.draft(),
            remote_uid: item.uid,
            remote_folder_id: folder.id.clone(),
            remote_xgm_labels: item.sorted_labels(),
            client_folder_id: folder.id.clone(),
            thread_id: String::new(),
            snippet: String::new(),
            files: Vec::new(),
            synced_at: util::now_secs(),
            sync_unsaved_changes: 0,
            reply_to_header_message_id: None,
            hidden: false,
        };

        let thread_id = self
            .resolve_thread_id(tx, &message, item.gm_thrid, &header.references)
            .await?;
        message.thread_id = thread_id;

        self.upsert_thread(tx, None, Some(&message), folder, labels, item.gm_thrid)
            .await?;
        tx.save(&mut message).await?;
        Ok(())
    }

    /// Bring an existing local record up to date with the server's view,
    /// honoring the optimistic lock: while `sync_unsaved_changes > 0`,
    /// only the remote linkage fields may be restored, silently.
    async fn apply_remote_to_existing(
        &self,
        tx: &mut StoreTransaction<'_>,
        message: &mut Message,
        folder: &Folder,
        item: &FetchedMessage,
        labels: &[Label],
    ) -> SyncResult<()> {
        let locked = message.sync_unsaved_changes > 0;
        let attrs = message.attributes();
        let incoming = crate::models::MessageAttributes::new(
            item.uid,
            item.unread(),
            item.starred(),
            item.draft(),
            item.sorted_labels(),
        );

        let was_unlinked = message.is_unlinked();
        let folder_changed = message.remote_folder_id != folder.id;

        if locked {
            if was_unlinked || folder_changed || message.remote_uid != item.uid {
                message.remote_uid = item.uid;
                message.remote_folder_id = folder.id.clone();
                tx.save_silent(message).await?;
            }
            return Ok(());
        }

        if !was_unlinked && !folder_changed && attrs == incoming {
            return Ok(());
        }

        let old_snapshot = MessageSnapshot::of(message, self.folder_in_all_mail(folder));
        message.remote_uid = item.uid;
        message.remote_folder_id = folder.id.clone();
        message.client_folder_id = folder.id.clone();
        message.unread = incoming.unread;
        message.starred = incoming.starred;
        message.draft = incoming.draft;
        message.remote_xgm_labels = incoming.labels;
        message.synced_at = util::now_secs();

        self.upsert_thread(tx, Some(&old_snapshot), Some(message), folder, labels, item.gm_thrid)
            .await?;
        if was_unlinked && attrs.unread == incoming.unread && attrs.starred == incoming.starred {
            // pure relink: nothing user-visible changed
            tx.save_silent(message).await?;
        } else {
            tx.save(message).await?;
        }
        Ok(())
    }

    fn folder_in_all_mail(&self, folder: &Folder) -> bool {
        folder.role != "spam" && folder.role != "trash"
    }

    // ---- threads ----

    async fn resolve_thread_id(
        &self,
        tx: &mut StoreTransaction<'_>,
        message: &Message,
        gm_thrid: Option<u64>,
        references: &[String],
    ) -> SyncResult<String> {
        if let Some(thrid) = gm_thrid {
            let existing = tx
                .find::<Thread>(
                    Query::new()
                        .equal("accountId", self.account.id.as_str())
                        .equal("gThrId", thrid.to_string()),
                )
                .await?;
            if let Some(thread) = existing {
                return Ok(thread.id);
            }
            return Ok(format!("t:{}", message.id));
        }

        // Walk References / In-Reply-To looking for a sibling we already
        // have. Scanning newest-first means the common case hits quickly.
        for reference in references.iter().rev() {
            let sibling = tx
                .find::<Message>(
                    Query::new()
                        .equal("accountId", self.account.id.as_str())
                        .equal("headerMessageId", reference.as_str()),
                )
                .await?;
            if let Some(sibling) = sibling {
                if !sibling.thread_id.is_empty() {
                    return Ok(sibling.thread_id);
                }
            }
        }
        Ok(format!("t:{}", message.id))
    }

    /// Update (or create) the thread for a message transition and persist
    /// it. `old` is None on insert, `next` is None on delete.
    async fn upsert_thread(
        &self,
        tx: &mut StoreTransaction<'_>,
        old: Option<&MessageSnapshot>,
        next: Option<&Message>,
        folder: &Folder,
        labels: &[Label],
        gm_thrid: Option<u64>,
    ) -> SyncResult<()> {
        let thread_id = match next.map(|m| m.thread_id.as_str()) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Ok(()), // removals go through remove_message
        };

        let mut thread = match tx.find_by_id::<Thread>(&thread_id).await? {
            Some(thread) => thread,
            None => {
                let next = next.expect("new thread requires a message");
                Thread::new(
                    &next.id,
                    &self.account.id,
                    &next.subject,
                    &gm_thrid.map(|v| v.to_string()).unwrap_or_default(),
                )
            }
        };

        let folder_ref = CategoryRef {
            id: folder.id.clone(),
            path: folder.path.clone(),
            role: folder.role.clone(),
            refs: 0,
            unread: 0,
        };
        let in_all_mail = self.folder_in_all_mail(folder);
        let lookup = label_lookup(labels);
        thread.apply_message_attribute_changes(
            old,
            next,
            next.map(|_| folder_ref),
            in_all_mail,
            &lookup,
        );
        tx.save(&mut thread).await?;
        Ok(())
    }

    /// Remove a message, updating its thread and deleting the thread when
    /// its last message leaves.
    pub async fn remove_message(
        &self,
        tx: &mut StoreTransaction<'_>,
        message: &Message,
        folder: Option<&Folder>,
        labels: &[Label],
    ) -> SyncResult<()> {
        if !message.thread_id.is_empty() {
            if let Some(mut thread) = tx.find_by_id::<Thread>(&message.thread_id).await? {
                let in_all_mail = folder.map(|f| self.folder_in_all_mail(f)).unwrap_or(true);
                let snapshot = MessageSnapshot::of(message, in_all_mail);
                let lookup = label_lookup(labels);
                thread.apply_message_attribute_changes(
                    Some(&snapshot),
                    None,
                    None,
                    in_all_mail,
                    &lookup,
                );
                let remaining = tx
                    .find_all::<Message>(
                        Query::new()
                            .equal("threadId", thread.id.as_str())
                            .not_equal("id", message.id.as_str()),
                    )
                    .await?;
                if remaining.is_empty() {
                    tx.remove(&thread).await?;
                } else {
                    tx.save(&mut thread).await?;
                }
            }
        }
        tx.remove(message).await?;
        Ok(())
    }

    // ---- two-phase deletion ----

    /// Park every message matched by `query` on the phase-tagged unlink
    /// sentinel. Emits no deltas; unlinking is invisible to the client.
    pub async fn unlink_messages_matching(&self, query: Query, phase: u8) -> SyncResult<usize> {
        let mut tx = self.store.begin().await?;
        let mut messages = tx.find_all::<Message>(query).await?;
        let count = messages.len();
        for message in messages.iter_mut() {
            if !message.is_unlinked() {
                message.unlink(phase);
                tx.save_silent(message).await?;
            }
        }
        tx.commit().await?;
        Ok(count)
    }

    /// Delete every message still parked on the `phase` sentinel. These
    /// have been missing for one complete extra sync loop.
    pub async fn delete_messages_still_unlinked(&self, phase: u8) -> SyncResult<usize> {
        let labels = self.store.labels(&self.account.id).await?;
        let mut tx = self.store.begin().await?;
        let doomed = tx
            .find_all::<Message>(
                Query::new()
                    .equal("accountId", self.account.id.as_str())
                    .equal("remoteUID", unlink_uid_for_phase(phase)),
            )
            .await?;
        let count = doomed.len();
        for message in &doomed {
            let folder = tx.find_by_id::<Folder>(&message.client_folder_id).await?;
            self.remove_message(&mut tx, message, folder.as_ref(), &labels)
                .await?;
        }
        tx.commit().await?;
        if count > 0 {
            info!(count, phase, "deleted messages still unlinked from phase");
        }
        Ok(count)
    }

    // ---- bodies and attachments ----

    /// Parse a fetched RFC 2822 body: store the displayable body, derive
    /// the snippet, write attachment blobs to disk, and emit the message
    /// delta with the body attached.
    pub async fn ingest_body(&self, message_id: &str, raw: &[u8]) -> SyncResult<()> {
        let parsed = mailparse::parse_mail(raw)?;

        let mut plain: Option<String> = None;
        let mut html: Option<String> = None;
        let mut files: Vec<(File, Vec<u8>)> = Vec::new();
        collect_parts(&parsed, &mut plain, &mut html, &mut files, message_id, &self.account.id)?;

        let body = html.clone().or_else(|| plain.clone()).unwrap_or_default();
        let snippet_source = plain.unwrap_or_else(|| strip_tags(html.as_deref().unwrap_or("")));
        let snippet = util::snippet_from_text(&snippet_source, SNIPPET_MAX_LEN);

        for (file, bytes) in &files {
            let dir = self.config.file_container_path(&file.id);
            if let Err(err) = std::fs::create_dir_all(&dir) {
                warn!(error = %err, "could not create attachment directory");
                continue;
            }
            let path = dir.join(file.safe_filename());
            if let Err(err) = std::fs::write(&path, bytes) {
                warn!(error = %err, path = %path.display(), "could not write attachment");
            }
        }

        self.store.save_body(message_id, &body).await?;

        let mut tx = self.store.begin().await?;
        if let Some(mut message) = tx.find_by_id::<Message>(message_id).await? {
            message.snippet = snippet;
            message.files = files.into_iter().map(|(f, _)| f).collect();
            tx.save(&mut message).await?;
            // The body lives outside the model row; merge it into this
            // flush's delta for the message.
            tx.emit(DeltaStreamItem::with_json(
                DELTA_TYPE_PERSIST,
                Message::object_class(),
                serde_json::json!({ "id": message_id, "body": body }),
            ));
        }
        tx.commit().await?;
        Ok(())
    }
}

fn label_lookup(labels: &[Label]) -> impl Fn(&str) -> Option<CategoryRef> + '_ {
    move |name: &str| {
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
                if resolved.starts_with('\\') {
                    false
                } else if !folder.role.is_empty() {
                    folder.role == resolved
                        || folder.role == format!("{}s", resolved)
                        || folder.path.eq_ignore_ascii_case(resolved)
                } else {
                    folder.path.eq_ignore_ascii_case(resolved)
                }
            })
            .map(|l| CategoryRef {
                id: l.0.id.clone(),
                path: l.0.path.clone(),
                role: l.0.role.clone(),
                refs: 0,
                unread: 0,
            })
    }
}

fn recipient_emails(header: &ParsedHeader) -> Vec<String> {
    header
        .to
        .iter()
        .chain(header.cc.iter())
        .chain(header.bcc.iter())
        .map(|a| a.email.clone())
        .collect()
}

fn parse_header(bytes: &[u8]) -> SyncResult<ParsedHeader> {
    let (headers, _) = mailparse::parse_headers(bytes)?;

    let date = headers
        .get_first_value("Date")
        .and_then(|v| mailparse::dateparse(&v).ok())
        .unwrap_or(0);
    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let header_message_id = headers.get_first_value("Message-ID").unwrap_or_default();

    let mut references: Vec<String> = headers
        .get_first_value("References")
        .map(|v| {
            v.split_whitespace()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if let Some(in_reply_to) = headers.get_first_value("In-Reply-To") {
        let in_reply_to = in_reply_to.trim().to_string();
        if !in_reply_to.is_empty() && !references.contains(&in_reply_to) {
            references.push(in_reply_to);
        }
    }

    Ok(ParsedHeader {
        date,
        subject,
        header_message_id,
        from: parse_addresses(&headers, "From"),
        to: parse_addresses(&headers, "To"),
        cc: parse_addresses(&headers, "Cc"),
        bcc: parse_addresses(&headers, "Bcc"),
        reply_to: parse_addresses(&headers, "Reply-To"),
        references,
    })
}

fn parse_addresses(headers: &[mailparse::MailHeader<'_>], name: &str) -> Vec<EmailAddress> {
    let Some(value) = headers.get_first_value(name) else {
        return Vec::new();
    };
    match mailparse::addrparse(&value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                mailparse::MailAddr::Single(info) => vec![EmailAddress {
                    name: info.display_name.clone().unwrap_or_default(),
                    email: info.addr.clone(),
                }],
                mailparse::MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|info| EmailAddress {
                        name: info.display_name.clone().unwrap_or_default(),
                        email: info.addr.clone(),
                    })
                    .collect(),
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn collect_parts(
    part: &mailparse::ParsedMail<'_>,
    plain: &mut Option<String>,
    html: &mut Option<String>,
    files: &mut Vec<(File, Vec<u8>)>,
    message_id: &str,
    account_id: &str,
) -> SyncResult<()> {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disposition = part.get_content_disposition();
        let filename = disposition.params.get("filename").cloned().or_else(|| {
            part.ctype.params.get("name").cloned()
        });

        let is_attachment =
            disposition.disposition == mailparse::DispositionType::Attachment || filename.is_some();

        if is_attachment {
            let bytes = part.get_body_raw()?;
            let mut file = File::new(
                account_id,
                message_id,
                filename.as_deref().unwrap_or("untitled"),
                "",
                &ctype,
                bytes.len() as i64,
            );
            if let Some(cid) = part.headers.get_first_value("Content-ID") {
                file.content_id = Some(cid.trim_matches(['<', '>']).to_string());
            }
            files.push((file, bytes));
        } else if ctype == "text/plain" && plain.is_none() {
            *plain = Some(part.get_body()?);
        } else if ctype == "text/html" && html.is_none() {
            *html = Some(part.get_body()?);
        }
    } else {
        for sub in &part.subparts {
            collect_parts(sub, plain, html, files, message_id, account_id)?;
        }
    }
    Ok(())
}

/// Crude tag stripper for snippet derivation when only HTML is present.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parse_extracts_threading_fields() {
        let raw = b"Date: Tue, 1 Aug 2023 10:00:00 +0000\r\n\
                    Subject: Quarterly report\r\n\
                    Message-ID: <m3@example.com>\r\n\
                    From: Ana <ana@example.com>\r\n\
                    To: Bo <bo@example.com>, Cy <cy@example.com>\r\n\
                    In-Reply-To: <m2@example.com>\r\n\
                    References: <m1@example.com> <m2@example.com>\r\n\r\n";
        let header = parse_header(raw).unwrap();
        assert_eq!(header.subject, "Quarterly report");
        assert_eq!(header.header_message_id, "<m3@example.com>");
        assert_eq!(header.to.len(), 2);
        assert_eq!(header.references.len(), 2);
        assert!(header.date > 0);
    }

    #[test]
    fn strip_tags_drops_markup() {
        assert_eq!(strip_tags("<p>Hello <b>world</b></p>"), "Hello world");
    }
}
