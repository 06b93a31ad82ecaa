//! CardDAV and CalDAV reconciliation
//!
//! Discovery runs SRV hints (delegated to the identity service) through
//! `.well-known` probing to principal and home-set lookups. Each cycle is
//! ctag-gated; changed collections sync via RFC 6578 sync-collection with
//! pagination, falling back to etag-list comparison on servers without it.

pub mod vcard;
pub mod xml;

use crate::backoff::{Backoff, Policy};
use crate::config::{Account, Config, Identity};
use crate::error::{SyncError, SyncResult};
use crate::models::event::DISTANT_FUTURE;
use crate::models::{
    Calendar, Contact, ContactBook, ContactGroup, Event, Task, TaskStatus,
    CONTACT_SOURCE_CARDDAV,
};
use crate::oauth::TokenManager;
use crate::store::{MailStore, Query};
use crate::util::{self, join_url, normalize_href};
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use vcard::VCard;
use xml::{parse_multistatus, Multistatus, ResponseItem};

const DAV_LOOP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const MULTIGET_CHUNK: usize = 90;
const SYNC_PAGE_LIMIT: usize = 100;
const SYNC_TOKEN_MAX_RETRIES: u32 = 1;
const AUTH_FAILURE_TOLERANCE: u32 = 3;
const CALENDAR_SYNC_PAST_MONTHS: i64 = 12;
const CALENDAR_SYNC_FUTURE_MONTHS: i64 = 18;
/// CalDAV REPORTs are debounced to respect per-day API quotas.
const CALENDAR_REPORT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Task types routed to this worker instead of the IMAP foreground
/// worker; their remote phase is DAV traffic.
pub const DAV_TASK_TYPES: [&str; 4] = [
    "SyncbackContactTask",
    "DestroyContactTask",
    "SyncbackEventTask",
    "DestroyEventTask",
];

struct CalendarSyncRange {
    start: i64,
    end: i64,
    start_str: String,
    end_str: String,
}

fn calendar_sync_range() -> CalendarSyncRange {
    let now = util::now_secs();
    let start = now - CALENDAR_SYNC_PAST_MONTHS * 30 * 24 * 60 * 60;
    let end = now + CALENDAR_SYNC_FUTURE_MONTHS * 30 * 24 * 60 * 60;
    let fmt = |t: i64| {
        Utc.timestamp_opt(t, 0)
            .single()
            .map(|dt| dt.format("%Y%m%dT%H%M%SZ").to_string())
            .unwrap_or_default()
    };
    CalendarSyncRange {
        start,
        end,
        start_str: fmt(start),
        end_str: fmt(end),
    }
}

pub struct DavWorker {
    store: Arc<MailStore>,
    account: Arc<Account>,
    config: Arc<Config>,
    identity: Identity,
    tokens: Arc<TokenManager>,
    http: reqwest::Client,

    cached_book: Option<ContactBook>,
    contacts_discovery_complete: bool,
    validation_failures: u32,

    cal_host: String,
    cal_principal: String,
}

impl DavWorker {
    pub fn new(
        store: Arc<MailStore>,
        account: Arc<Account>,
        config: Arc<Config>,
        identity: Identity,
        tokens: Arc<TokenManager>,
    ) -> Self {
        // Shortcuts for providers that implement CardDAV/CalDAV but expose
        // no SRV records pointing at them.
        let (cal_host, cal_principal) = if account.is_gmail() {
            (
                "https://apidata.googleusercontent.com".to_string(),
                format!("/caldav/v2/{}", account.email_address),
            )
        } else if account.settings.imap_host.contains("imap.mail.ru") {
            ("https://calendar.mail.ru".to_string(), "discover".to_string())
        } else if account.settings.imap_host.contains("imap.yandex") {
            ("https://caldav.yandex.ru".to_string(), "discover".to_string())
        } else {
            (String::new(), "discover".to_string())
        };

        DavWorker {
            store,
            account,
            config,
            identity,
            tokens,
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap_or_default(),
            cached_book: None,
            contacts_discovery_complete: false,
            validation_failures: 0,
            cal_host,
            cal_principal,
        }
    }

    /// Periodic reconciliation loop.
    pub async fn run_loop(mut self) {
        let mut backoff = Backoff::new(Policy::imap_worker());
        loop {
            match self.run().await {
                Ok(()) => {
                    backoff.reset();
                    tokio::time::sleep(DAV_LOOP_INTERVAL).await;
                }
                Err(err) if err.requires_reauth() => {
                    warn!(account = %self.account.id, error = %err, "DAV authentication failed; stopping worker");
                    return;
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(account = %self.account.id, error = %err, retry_in = ?delay, "DAV cycle failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub async fn run(&mut self) -> SyncResult<()> {
        self.process_dav_tasks().await?;
        self.run_contacts().await?;
        self.run_calendars().await?;
        Ok(())
    }

    // ---- HTTP plumbing ----

    async fn auth_header(&self) -> SyncResult<(String, String)> {
        if let Some(token) = self.tokens.token_for(&self.account).await? {
            Ok(("Authorization".to_string(), format!("Bearer {}", token)))
        } else {
            let raw = format!(
                "{}:{}",
                self.account.settings.imap_username, self.account.settings.imap_password
            );
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
            Ok(("Authorization".to_string(), format!("Basic {}", encoded)))
        }
    }

    async fn xml_request(
        &self,
        url: &str,
        method: &str,
        depth: &str,
        body: &str,
    ) -> SyncResult<(u16, Multistatus)> {
        let (header, value) = self.auth_header().await?;
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| SyncError::other("bad method"))?;
        debug!(%url, method = %method, "DAV request");
        let response = self
            .http
            .request(method, url)
            .header(header, value)
            .header("Depth", depth)
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(body.to_string())
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        match status {
            200..=299 | 507 => Ok((status, parse_multistatus(&text)?)),
            _ => {
                // Token errors carry their diagnosis in the body.
                if text.contains("valid-sync-token") {
                    return Err(SyncError::StaleSyncToken {
                        message: format!("{}: {}", status, text),
                    });
                }
                Err(SyncError::rejected(status, text))
            }
        }
    }

    async fn resource_request(
        &self,
        url: &str,
        method: &str,
        content_type: &str,
        body: &str,
        if_match: &str,
    ) -> SyncResult<String> {
        let (header, value) = self.auth_header().await?;
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| SyncError::other("bad method"))?;
        let mut request = self
            .http
            .request(method, url)
            .header(header, value)
            .header("Content-Type", content_type);
        if !if_match.is_empty() {
            request = request.header("If-Match", format!("\"{}\"", if_match.trim_matches('"')));
        }
        if !body.is_empty() {
            request = request.body(body.to_string());
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        if status == 412 {
            return Err(SyncError::EtagConflict {
                href: url.to_string(),
            });
        }
        if !(200..300).contains(&status) {
            return Err(SyncError::rejected(status, text));
        }
        Ok(text)
    }

    /// Probe a `.well-known` URL, following exactly one redirect. Returns
    /// an empty string when nothing useful came back.
    async fn expected_redirect(&self, url: &str) -> String {
        let Ok(response) = self.http.get(url).send().await else {
            return String::new();
        };
        if response.status().is_redirection() {
            if let Some(location) = response
                .headers()
                .get("Location")
                .and_then(|v| v.to_str().ok())
            {
                if location.contains("://") {
                    return location.to_string();
                }
                return join_url(url.split("/.well-known").next().unwrap_or(url), location);
            }
        }
        if response.status().is_success() {
            return url.to_string();
        }
        String::new()
    }

    // ---- contacts ----

    async fn run_contacts(&mut self) -> SyncResult<()> {
        if self.account.is_gmail() {
            // Google contacts sync via the People API, not CardDAV.
            return Ok(());
        }
        if self.contacts_discovery_complete && self.cached_book.is_none() {
            return Ok(());
        }

        if !self.contacts_discovery_complete {
            info!(account = %self.account.id, "performing CardDAV address book discovery");
            self.cached_book = self.resolve_address_book().await?;
            self.contacts_discovery_complete = true;
            self.validation_failures = 0;
            if self.cached_book.is_none() {
                return Ok(());
            }
        }

        match self.validate_cached_address_book().await {
            Ok(true) => {}
            Ok(false) => {
                info!("cached address book URL invalid; will rediscover next cycle");
                self.cached_book = None;
                self.contacts_discovery_complete = false;
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let book = self.cached_book.clone().expect("validated above");
        let stored: Option<ContactBook> = self
            .store
            .find(Query::new().equal("accountId", self.account.id.as_str()))
            .await?;
        let old_ctag = stored.as_ref().map(|b| b.ctag.clone()).unwrap_or_default();

        if !book.ctag.is_empty() && old_ctag == book.ctag {
            debug!(ctag = %book.ctag, "address book unchanged, skipping");
            return Ok(());
        }
        info!(from = %old_ctag, to = %book.ctag, "syncing address book");

        let used_sync_token = self.sync_address_book_with_token(&book, 0).await?;
        if !used_sync_token {
            self.sync_address_book_legacy(&book).await?;
        }

        // Record the ctag only after the cycle succeeds, so a crash
        // mid-sync re-runs it.
        let mut updated = book.clone();
        if let Some(stored) = self
            .store
            .find_by_id::<ContactBook>(&updated.id)
            .await?
        {
            updated.version = stored.version;
            updated.sync_token = stored.sync_token;
        }
        self.store.save(&mut updated).await?;
        self.cached_book = Some(updated);
        Ok(())
    }

    async fn validate_cached_address_book(&mut self) -> SyncResult<bool> {
        let Some(url) = self.cached_book.as_ref().map(|b| b.url.clone()) else {
            return Ok(false);
        };
        let result = self
            .xml_request(
                &url,
                "PROPFIND",
                "0",
                r#"<?xml version="1.0" encoding="UTF-8"?><d:propfind xmlns:d="DAV:" xmlns:cs="http://calendarserver.org/ns/"><d:prop><cs:getctag/></d:prop></d:propfind>"#,
            )
            .await;
        match result {
            Ok((_, doc)) => {
                let ctag = doc
                    .responses
                    .iter()
                    .map(|r| r.ctag.clone())
                    .find(|c| !c.is_empty());
                if let (Some(ctag), Some(book)) = (ctag, self.cached_book.as_mut()) {
                    book.ctag = ctag;
                }
                self.validation_failures = 0;
                Ok(true)
            }
            Err(SyncError::Rejected { status: 404, .. })
            | Err(SyncError::Rejected { status: 410, .. }) => Ok(false),
            Err(SyncError::Rejected { status: 401, .. })
            | Err(SyncError::Rejected { status: 403, .. }) => {
                self.validation_failures += 1;
                if self.validation_failures >= AUTH_FAILURE_TOLERANCE {
                    warn!(
                        failures = self.validation_failures,
                        "repeated auth failures validating address book; invalidating cache"
                    );
                    return Ok(false);
                }
                Err(SyncError::authentication("address book validation failed"))
            }
            Err(err) => Err(err),
        }
    }

    /// SRV hints → `.well-known` → principal → home-set → address books.
    async fn resolve_address_book(&self) -> SyncResult<Option<ContactBook>> {
        let existing: Option<ContactBook> = self
            .store
            .find(Query::new().equal("accountId", self.account.id.as_str()))
            .await?;
        if let Some(book) = &existing {
            if book.source != CONTACT_SOURCE_CARDDAV {
                return Ok(None);
            }
        }

        // SRV lookups are delegated so the binary isn't bound to a
        // resolver library.
        let domain = self
            .account
            .email_address
            .split('@')
            .nth(1)
            .unwrap_or_default();
        let response = self
            .http
            .post(format!("{}/api/resolve-dav-hosts", self.config.identity_server))
            .basic_auth(&self.identity.token, Some(""))
            .json(&json!({
                "domain": domain,
                "imapHost": self.account.settings.imap_host,
            }))
            .send()
            .await?;
        let hosts: serde_json::Value = response.json().await.unwrap_or(json!({}));
        let card_host = hosts
            .get("carddavHost")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if card_host.is_empty() {
            return Ok(existing);
        }

        let mut card_root = self
            .expected_redirect(&format!("https://{}/.well-known/carddav", card_host))
            .await;
        if card_root.is_empty() || card_root.contains("/.well-known") {
            // A loop back to .well-known means the redirect was circular;
            // fall back to the root.
            card_root = format!("https://{}/", card_host);
        }
        if self.account.quirks().well_known_is_dead_end
            && card_root.contains("mail.yahoo.com")
        {
            // Second redirect lands on the webmail page, not a DAV root.
            return Ok(existing);
        }

        let (_, principal_doc) = self
            .xml_request(
                &card_root,
                "PROPFIND",
                "0",
                r#"<?xml version="1.0" encoding="UTF-8"?><A:propfind xmlns:A="DAV:"><A:prop><A:current-user-principal/><A:principal-URL/><A:resourcetype/></A:prop></A:propfind>"#,
            )
            .await?;
        let principal = principal_doc
            .responses
            .iter()
            .find_map(|r| r.property_href("current-user-principal"))
            .unwrap_or_default()
            .to_string();
        let principal_url = join_url(&card_root, &principal);

        let (_, home_doc) = self
            .xml_request(
                &principal_url,
                "PROPFIND",
                "0",
                r#"<?xml version="1.0" encoding="UTF-8"?><A:propfind xmlns:A="DAV:"><A:prop><A:displayname/><A:resourcetype/><B:addressbook-home-set xmlns:B="urn:ietf:params:xml:ns:carddav"/></A:prop></A:propfind>"#,
            )
            .await?;
        let home = home_doc
            .responses
            .iter()
            .find_map(|r| r.property_href("addressbook-home-set"))
            .unwrap_or_default()
            .to_string();
        let home_url = join_url(&card_root, &home);

        let (_, books_doc) = self
            .xml_request(
                &home_url,
                "PROPFIND",
                "1",
                r#"<?xml version="1.0" encoding="UTF-8"?><d:propfind xmlns:d="DAV:" xmlns:cs="http://calendarserver.org/ns/"><d:prop><d:resourcetype /><d:displayname /><cs:getctag /></d:prop></d:propfind>"#,
            )
            .await?;

        let mut book = existing;
        for item in books_doc
            .responses
            .iter()
            .filter(|r| r.is_collection_of("addressbook"))
        {
            let url = join_url(&home_url, &item.href);
            let mut resolved =
                book.unwrap_or_else(|| ContactBook::new(&self.account.id, &url));
            resolved.source = CONTACT_SOURCE_CARDDAV.to_string();
            resolved.url = url;
            // The persisted ctag stays behind the server's until a cycle
            // completes, so the first sync actually runs.
            self.store.save(&mut resolved).await?;
            resolved.ctag = item.ctag.clone();
            book = Some(resolved);
        }
        Ok(book)
    }

    /// RFC 6578 sync. Returns false when the server doesn't support it and
    /// the legacy path should run.
    async fn sync_address_book_with_token(
        &mut self,
        book: &ContactBook,
        retry_count: u32,
    ) -> SyncResult<bool> {
        let stored: Option<ContactBook> = self.store.find_by_id(&book.id).await?;
        let mut sync_token = stored.map(|b| b.sync_token).unwrap_or_default();
        let is_initial = sync_token.is_empty();

        let mut needed_hrefs: Vec<String> = Vec::new();
        let mut deleted_hrefs: Vec<String> = Vec::new();
        let mut updated_groups: Vec<Contact> = Vec::new();

        let mut has_more = true;
        let mut pages = 0usize;
        while has_more && pages < SYNC_PAGE_LIMIT {
            pages += 1;
            let token_element = if sync_token.is_empty() {
                "<D:sync-token/>".to_string()
            } else {
                format!("<D:sync-token>{}</D:sync-token>", sync_token)
            };
            // Initial sync pulls etags only and multigets the bodies;
            // incremental changesets are small so the data rides along.
            let props = if is_initial {
                "<D:getetag/>"
            } else {
                "<D:getetag/><C:address-data/>"
            };
            let query = format!(
                r#"<?xml version="1.0" encoding="utf-8"?><D:sync-collection xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:carddav">{}<D:sync-level>1</D:sync-level><D:prop>{}</D:prop></D:sync-collection>"#,
                token_element, props
            );

            let (status, doc) = match self.xml_request(&book.url, "REPORT", "0", &query).await {
                Ok(result) => result,
                Err(SyncError::StaleSyncToken { .. })
                | Err(SyncError::Rejected { status: 403, .. })
                | Err(SyncError::Rejected { status: 409, .. })
                | Err(SyncError::Rejected { status: 410, .. }) => {
                    if sync_token.is_empty() || retry_count >= SYNC_TOKEN_MAX_RETRIES {
                        info!("sync-collection unsupported or failed; using legacy contact sync");
                        return Ok(false);
                    }
                    info!("sync token expired; retrying with a full sync");
                    let mut cleared = book.clone();
                    cleared.sync_token = String::new();
                    self.store.save(&mut cleared).await?;
                    return Box::pin(self.sync_address_book_with_token(&cleared, retry_count + 1))
                        .await;
                }
                Err(SyncError::Rejected { .. }) => {
                    info!("sync-collection unsupported; using legacy contact sync");
                    return Ok(false);
                }
                Err(err) => return Err(err),
            };

            // Pagination signals: HTTP 507, or a per-response 507 status.
            has_more = status == 507;
            for item in &doc.responses {
                match item.status_code() {
                    Some(507) => {
                        has_more = true;
                        debug!(page = pages, "sync-collection page truncated, continuing");
                    }
                    Some(404) => deleted_hrefs.push(item.href.clone()),
                    _ => {
                        if !item.body.is_empty() {
                            if let Some((contact, is_group)) =
                                self.inflate_contact(item, book).await?
                            {
                                if is_group {
                                    updated_groups.push(contact);
                                } else {
                                    let mut contact = contact;
                                    self.store.save(&mut contact).await?;
                                }
                            }
                        } else if !item.etag.is_empty() {
                            needed_hrefs.push(item.href.clone());
                        }
                    }
                }
            }
            if !doc.sync_token.is_empty() {
                sync_token = doc.sync_token;
            }
        }

        if pages >= SYNC_PAGE_LIMIT {
            warn!(pages, "sync-collection hit the page limit; sync may be incomplete");
        }
        info!(
            pages,
            needed = needed_hrefs.len(),
            deleted = deleted_hrefs.len(),
            "sync-collection complete for contacts"
        );

        // Newest first.
        needed_hrefs.reverse();
        for chunk in needed_hrefs.chunks(MULTIGET_CHUNK) {
            let hrefs: String = chunk
                .iter()
                .map(|h| format!("<d:href>{}</d:href>", h))
                .collect();
            let (_, doc) = self
                .xml_request(
                    &book.url,
                    "REPORT",
                    "1",
                    &format!(
                        r#"<c:addressbook-multiget xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:carddav"><d:prop><d:getetag /><c:address-data /></d:prop>{}</c:addressbook-multiget>"#,
                        hrefs
                    ),
                )
                .await?;
            let mut tx = self.store.begin().await?;
            for item in &doc.responses {
                if let Some((contact, is_group)) = self.inflate_contact(item, book).await? {
                    if is_group {
                        updated_groups.push(contact);
                    } else {
                        let mut contact = contact;
                        tx.save(&mut contact).await?;
                    }
                }
            }
            tx.commit().await?;
        }

        if !deleted_hrefs.is_empty() {
            self.delete_contacts_by_href(book, &deleted_hrefs).await?;
        }

        // Groups save after their members so referenced contacts exist.
        for mut group_contact in updated_groups {
            self.rebuild_contact_group(&group_contact).await?;
            self.store.save(&mut group_contact).await?;
        }

        if !sync_token.is_empty() {
            let mut updated = book.clone();
            if let Some(stored) = self.store.find_by_id::<ContactBook>(&book.id).await? {
                updated = stored;
            }
            if updated.sync_token != sync_token {
                updated.sync_token = sync_token;
                self.store.save(&mut updated).await?;
            }
        }
        Ok(true)
    }

    /// Legacy comparison: etags mutate on edit, so adds and changes look
    /// identical and deletions are local etags absent from the server.
    async fn sync_address_book_legacy(&mut self, book: &ContactBook) -> SyncResult<()> {
        let (_, doc) = self
            .xml_request(
                &book.url,
                "REPORT",
                "1",
                r#"<c:addressbook-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:carddav"><d:prop><d:getetag /></d:prop></c:addressbook-query>"#,
            )
            .await?;

        let mut remote: HashMap<String, String> = HashMap::new(); // etag -> href
        for item in &doc.responses {
            if !item.etag.is_empty() {
                remote.insert(item.etag.clone(), item.href.clone());
            }
        }

        let local: Vec<Contact> = self
            .store
            .find_all(Query::new().equal("bookId", book.id.as_str()))
            .await?;
        let local_etags: HashSet<String> = local.iter().map(|c| c.etag.clone()).collect();

        let mut needed: Vec<String> = remote
            .iter()
            .filter(|(etag, _)| !local_etags.contains(*etag))
            .map(|(_, href)| href.clone())
            .collect();
        let deleted: Vec<String> = local_etags
            .iter()
            .filter(|etag| !remote.contains_key(*etag))
            .cloned()
            .collect();

        if !needed.is_empty() || !deleted.is_empty() {
            info!(
                remote = remote.len(),
                local = local.len(),
                needed = needed.len(),
                deleted = deleted.len(),
                "legacy contact sync"
            );
        }

        needed.reverse();
        let mut updated_groups: Vec<Contact> = Vec::new();
        let mut deletions_pending = deleted;

        for chunk in needed.chunks(MULTIGET_CHUNK) {
            let hrefs: String = chunk
                .iter()
                .map(|h| format!("<d:href>{}</d:href>", h))
                .collect();
            let (_, doc) = self
                .xml_request(
                    &book.url,
                    "REPORT",
                    "1",
                    &format!(
                        r#"<c:addressbook-multiget xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:carddav"><d:prop><d:getetag /><c:address-data /></d:prop>{}</c:addressbook-multiget>"#,
                        hrefs
                    ),
                )
                .await?;

            let mut tx = self.store.begin().await?;
            if !deletions_pending.is_empty() {
                self.ingest_contact_deletions_tx(&mut tx, book, &deletions_pending)
                    .await?;
                deletions_pending.clear();
            }
            for item in &doc.responses {
                if let Some((contact, is_group)) = self.inflate_contact(item, book).await? {
                    if is_group {
                        updated_groups.push(contact);
                    } else {
                        let mut contact = contact;
                        tx.save(&mut contact).await?;
                    }
                }
            }
            tx.commit().await?;
        }

        // Upserts drive the deletion flush above; with nothing to fetch it
        // still has to run.
        if !deletions_pending.is_empty() {
            let mut tx = self.store.begin().await?;
            self.ingest_contact_deletions_tx(&mut tx, book, &deletions_pending)
                .await?;
            tx.commit().await?;
        }

        for mut group_contact in updated_groups {
            self.rebuild_contact_group(&group_contact).await?;
            self.store.save(&mut group_contact).await?;
        }
        Ok(())
    }

    async fn ingest_contact_deletions_tx(
        &self,
        tx: &mut crate::store::StoreTransaction<'_>,
        book: &ContactBook,
        etags: &[String],
    ) -> SyncResult<()> {
        for chunk in etags.chunks(100) {
            let etags: Vec<String> = chunk.to_vec();
            let doomed: Vec<Contact> = tx
                .find_all(
                    Query::new()
                        .equal("bookId", book.id.as_str())
                        .equal_any("etag", &etags),
                )
                .await?;
            for contact in &doomed {
                // A group carrier-contact may have a ContactGroup with the
                // same id; tear it down too.
                if let Some(group) = tx.find_by_id::<ContactGroup>(&contact.id).await? {
                    tx.remove(&group).await?;
                }
                tx.remove(contact).await?;
            }
        }
        Ok(())
    }

    async fn delete_contacts_by_href(
        &self,
        book: &ContactBook,
        hrefs: &[String],
    ) -> SyncResult<()> {
        let normalized: HashSet<String> = hrefs.iter().map(|h| normalize_href(h)).collect();
        let all: Vec<Contact> = self
            .store
            .find_all(Query::new().equal("bookId", book.id.as_str()))
            .await?;
        let mut tx = self.store.begin().await?;
        for contact in &all {
            let Some(info) = &contact.info else { continue };
            if info.href.is_empty() {
                continue;
            }
            if normalized.contains(&normalize_href(&info.href)) {
                if let Some(group) = tx.find_by_id::<ContactGroup>(&contact.id).await? {
                    tx.remove(&group).await?;
                }
                tx.remove(contact).await?;
            }
        }
        tx.commit().await
    }

    /// Build a Contact from one multistatus item carrying address-data.
    async fn inflate_contact(
        &self,
        item: &ResponseItem,
        book: &ContactBook,
    ) -> SyncResult<Option<(Contact, bool)>> {
        if item.body.is_empty() {
            if !item.etag.is_empty() {
                debug!(etag = %item.etag, "address book entry with empty body");
            }
            return Ok(None);
        }
        let card = VCard::parse(&item.body);
        if card.is_incomplete() {
            warn!("unable to decode vcard");
            return Ok(None);
        }
        let mut id = card.unique_id();
        if id.is_empty() {
            id = util::id_for_contact_href(&self.account.id, &item.href);
        }
        let email = card.emails().into_iter().next().unwrap_or_default();
        let name = card.formatted_name();
        let is_group = card.is_group();

        let mut contact = self
            .store
            .find_by_id::<Contact>(&id)
            .await?
            .unwrap_or(Contact {
                id,
                account_id: self.account.id.clone(),
                version: 0,
                name: String::new(),
                email: String::new(),
                source: CONTACT_SOURCE_CARDDAV.to_string(),
                refs: 1,
                hidden: false,
                book_id: String::new(),
                etag: String::new(),
                info: None,
            });
        contact.name = name;
        contact.email = email;
        contact.etag = item.etag.clone();
        contact.book_id = book.id.clone();
        contact.hidden = is_group;
        contact.info = Some(crate::models::contact::ContactInfo {
            vcf: item.body.clone(),
            href: item.href.clone(),
        });
        Ok(Some((contact, is_group)))
    }

    /// Project a carrier-contact into a ContactGroup whose membership is
    /// the card's MEMBER set.
    async fn rebuild_contact_group(&self, contact: &Contact) -> SyncResult<()> {
        let mut group = self
            .store
            .find_by_id::<ContactGroup>(&contact.id)
            .await?
            .unwrap_or(ContactGroup {
                id: contact.id.clone(),
                account_id: self.account.id.clone(),
                version: 0,
                name: String::new(),
                book_id: String::new(),
            });
        group.name = contact.name.clone();
        group.book_id = contact.book_id.clone();
        self.store.save(&mut group).await?;

        let card = VCard::parse(&contact.info.as_ref().map(|i| i.vcf.clone()).unwrap_or_default());
        if card.is_incomplete() {
            return Ok(());
        }
        self.store
            .set_group_members(&group.id, &card.members())
            .await
    }

    // ---- contact write path ----

    /// POST a new contact (or PUT an update with If-Match), then re-read
    /// the server's canonical version. Some servers rewrite the UID on
    /// POST, in which case the old local record is removed.
    pub async fn write_and_resync_contact(&self, contact: &Contact) -> SyncResult<()> {
        let book: ContactBook = self
            .store
            .find(Query::new().equal("accountId", self.account.id.as_str()))
            .await?
            .ok_or_else(|| SyncError::not_found("ContactBook", &self.account.id))?;

        let info = contact
            .info
            .clone()
            .ok_or_else(|| SyncError::other("contact has no vcf"))?;
        let mut href = info.href.clone();

        if href.is_empty() {
            let response = self
                .resource_request(&book.url, "POST", "text/vcard; charset=utf-8", &info.vcf, "")
                .await?;
            if let Ok(doc) = parse_multistatus(&response) {
                href = doc
                    .responses
                    .first()
                    .map(|r| r.href.clone())
                    .unwrap_or_default();
            }
        } else {
            let url = join_url(&book.url, &href);
            match self
                .resource_request(&url, "PUT", "text/vcard; charset=utf-8", &info.vcf, &contact.etag)
                .await
            {
                Ok(_) => {}
                // A 403 means our card was rejected; the re-read below
                // reverts it to the server's version.
                Err(SyncError::Rejected { status: 403, .. }) => {}
                Err(err) => return Err(err),
            }
        }

        if href.is_empty() {
            warn!("no href after contact write; skipping resync");
            return Ok(());
        }

        let (_, doc) = self
            .xml_request(
                &book.url,
                "REPORT",
                "1",
                &format!(
                    r#"<c:addressbook-multiget xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:carddav"><d:prop><d:getetag /><c:address-data /></d:prop><d:href>{}</d:href></c:addressbook-multiget>"#,
                    href
                ),
            )
            .await?;
        for item in &doc.responses {
            let Some((serverside, is_group)) = self.inflate_contact(item, &book).await? else {
                warn!("could not inflate contact from post-write REPORT");
                continue;
            };
            let mut serverside = serverside;
            if is_group {
                self.rebuild_contact_group(&serverside).await?;
            }
            self.store.save(&mut serverside).await?;
            if serverside.id != contact.id {
                // The server reassigned the UID; the save above created a
                // fresh record, so retire ours.
                self.store.remove(contact).await?;
            }
        }
        Ok(())
    }

    pub async fn delete_contact(&self, contact: &Contact) -> SyncResult<()> {
        if contact.source != CONTACT_SOURCE_CARDDAV {
            return Ok(());
        }
        let book: ContactBook = self
            .store
            .find(Query::new().equal("accountId", self.account.id.as_str()))
            .await?
            .ok_or_else(|| SyncError::not_found("ContactBook", &self.account.id))?;
        let Some(info) = &contact.info else {
            return Ok(());
        };
        if info.href.is_empty() {
            return Ok(());
        }
        let url = join_url(&book.url, &info.href);
        self.resource_request(&url, "DELETE", "text/vcard; charset=utf-8", "", &contact.etag)
            .await?;
        let mut tx = self.store.begin().await?;
        if let Some(group) = tx.find_by_id::<ContactGroup>(&contact.id).await? {
            tx.remove(&group).await?;
        }
        tx.remove(contact).await?;
        tx.commit().await
    }

    // ---- calendars ----

    async fn run_calendars(&mut self) -> SyncResult<()> {
        if self.cal_host.is_empty() {
            return Ok(());
        }
        let principal_url = join_url(&self.cal_host, &self.cal_principal);
        let (_, doc) = self
            .xml_request(
                &principal_url,
                "PROPFIND",
                "1",
                r#"<d:propfind xmlns:d="DAV:" xmlns:cs="http://calendarserver.org/ns/" xmlns:c="urn:ietf:params:xml:ns:caldav"><d:prop><d:resourcetype /><d:displayname /><cs:getctag /><c:supported-calendar-component-set /></d:prop></d:propfind>"#,
            )
            .await?;

        let local: Vec<Calendar> = self
            .store
            .find_all(Query::new().equal("accountId", self.account.id.as_str()))
            .await?;
        let mut unseen: HashMap<String, Calendar> =
            local.into_iter().map(|c| (c.id.clone(), c)).collect();

        for item in doc.responses.iter().filter(|r| r.supports_component("VEVENT")) {
            let path = item.href.clone();
            let id = util::id_for_calendar(&self.account.id, &path);
            let mut needs_sync = true;

            let mut calendar = match unseen.remove(&id) {
                Some(mut calendar) => {
                    if !item.ctag.is_empty() && calendar.ctag == item.ctag {
                        debug!(name = %calendar.name, "calendar unchanged, skipping");
                        needs_sync = false;
                    }
                    if calendar.name != item.displayname {
                        calendar.name = item.displayname.clone();
                        self.store.save(&mut calendar).await?;
                    }
                    calendar
                }
                None => {
                    let mut calendar = Calendar::new(&self.account.id, &path, &item.displayname);
                    if !item.color.is_empty() {
                        calendar.color = Some(item.color.clone());
                    }
                    self.store.save(&mut calendar).await?;
                    calendar
                }
            };

            if needs_sync {
                let url = join_url(&self.cal_host, &path);
                let used_token = self
                    .sync_calendar_with_token(&calendar, &url, 0)
                    .await?;
                if !used_token {
                    self.sync_calendar_legacy(&calendar, &url).await?;
                }
                if !item.ctag.is_empty() && calendar.ctag != item.ctag {
                    calendar.ctag = item.ctag.clone();
                    self.store.save(&mut calendar).await?;
                }
            }
        }

        // Calendars absent from the principal listing were deleted.
        for (_, calendar) in unseen {
            let events: Vec<Event> = self
                .store
                .find_all(Query::new().equal("calendarId", calendar.id.as_str()))
                .await?;
            let mut tx = self.store.begin().await?;
            for event in &events {
                tx.remove(event).await?;
            }
            tx.remove(&calendar).await?;
            tx.commit().await?;
        }
        Ok(())
    }

    async fn sync_calendar_with_token(
        &mut self,
        calendar: &Calendar,
        url: &str,
        retry_count: u32,
    ) -> SyncResult<bool> {
        let stored: Option<Calendar> = self.store.find_by_id(&calendar.id).await?;
        let mut sync_token = stored.map(|c| c.sync_token).unwrap_or_default();
        let is_initial = sync_token.is_empty();
        let range = calendar_sync_range();

        let mut needed_hrefs: Vec<String> = Vec::new();
        let mut deleted_hrefs: Vec<String> = Vec::new();

        let mut has_more = true;
        let mut pages = 0usize;
        while has_more && pages < SYNC_PAGE_LIMIT {
            pages += 1;
            let token_element = if sync_token.is_empty() {
                "<D:sync-token/>".to_string()
            } else {
                format!("<D:sync-token>{}</D:sync-token>", sync_token)
            };
            let props = if is_initial {
                "<D:getetag/>"
            } else {
                "<D:getetag/><C:calendar-data/>"
            };
            let query = format!(
                r#"<?xml version="1.0" encoding="utf-8"?><D:sync-collection xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">{}<D:sync-level>1</D:sync-level><D:prop>{}</D:prop></D:sync-collection>"#,
                token_element, props
            );

            tokio::time::sleep(CALENDAR_REPORT_DEBOUNCE).await;
            let (status, doc) = match self.xml_request(url, "REPORT", "0", &query).await {
                Ok(result) => result,
                Err(SyncError::StaleSyncToken { .. })
                | Err(SyncError::Rejected { status: 403, .. })
                | Err(SyncError::Rejected { status: 409, .. })
                | Err(SyncError::Rejected { status: 410, .. }) => {
                    if sync_token.is_empty() || retry_count >= SYNC_TOKEN_MAX_RETRIES {
                        info!("sync-collection unsupported or failed; using legacy calendar sync");
                        return Ok(false);
                    }
                    info!("calendar sync token expired; retrying with a full sync");
                    let mut cleared = calendar.clone();
                    cleared.sync_token = String::new();
                    self.store.save(&mut cleared).await?;
                    return Box::pin(self.sync_calendar_with_token(&cleared, url, retry_count + 1))
                        .await;
                }
                Err(SyncError::Rejected { .. }) => {
                    info!("sync-collection unsupported; using legacy calendar sync");
                    return Ok(false);
                }
                Err(err) => return Err(err),
            };

            has_more = status == 507;
            for item in &doc.responses {
                match item.status_code() {
                    Some(507) => has_more = true,
                    Some(404) => deleted_hrefs.push(item.href.clone()),
                    _ => {
                        if !item.body.is_empty() {
                            // Incremental data: only events overlapping the
                            // window are worth creating.
                            self.ingest_event(calendar, item, Some(&range)).await?;
                        } else if !item.etag.is_empty() {
                            needed_hrefs.push(item.href.clone());
                        }
                    }
                }
            }
            if !doc.sync_token.is_empty() {
                sync_token = doc.sync_token;
            }
        }

        if pages >= SYNC_PAGE_LIMIT {
            warn!(pages, "calendar sync-collection hit the page limit; sync may be incomplete");
        }

        needed_hrefs.reverse();
        for chunk in needed_hrefs.chunks(MULTIGET_CHUNK) {
            let hrefs: String = chunk
                .iter()
                .map(|h| format!("<D:href>{}</D:href>", h))
                .collect();
            tokio::time::sleep(CALENDAR_REPORT_DEBOUNCE).await;
            let (_, doc) = self
                .xml_request(
                    url,
                    "REPORT",
                    "1",
                    &format!(
                        r#"<c:calendar-multiget xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav"><d:prop><d:getetag /><c:calendar-data /></d:prop>{}</c:calendar-multiget>"#,
                        hrefs
                    ),
                )
                .await?;
            let mut tx = self.store.begin().await?;
            for item in &doc.responses {
                self.ingest_event_tx(&mut tx, calendar, item, None).await?;
            }
            tx.commit().await?;
        }

        if !deleted_hrefs.is_empty() {
            let normalized: HashSet<String> =
                deleted_hrefs.iter().map(|h| normalize_href(h)).collect();
            let all: Vec<Event> = self
                .store
                .find_all(Query::new().equal("calendarId", calendar.id.as_str()))
                .await?;
            let mut tx = self.store.begin().await?;
            for event in &all {
                if normalized.contains(&normalize_href(&event.href)) {
                    tx.remove(event).await?;
                }
            }
            tx.commit().await?;
        }

        if !sync_token.is_empty() {
            let mut updated = self
                .store
                .find_by_id::<Calendar>(&calendar.id)
                .await?
                .unwrap_or_else(|| calendar.clone());
            if updated.sync_token != sync_token {
                updated.sync_token = sync_token;
                self.store.save(&mut updated).await?;
            }
        }
        Ok(true)
    }

    /// Legacy calendar sync: a time-ranged calendar-query bounds the etag
    /// diff. Events outside the window are never fetched and count as
    /// deletions when present locally.
    async fn sync_calendar_legacy(&mut self, calendar: &Calendar, url: &str) -> SyncResult<()> {
        let range = calendar_sync_range();
        let query = format!(
            r#"<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav"><d:prop><d:getetag /></d:prop><c:filter><c:comp-filter name="VCALENDAR"><c:comp-filter name="VEVENT"><c:time-range start="{}" end="{}"/></c:comp-filter></c:comp-filter></c:filter></c:calendar-query>"#,
            range.start_str, range.end_str
        );
        tokio::time::sleep(CALENDAR_REPORT_DEBOUNCE).await;
        let (_, doc) = self.xml_request(url, "REPORT", "1", &query).await?;

        let mut remote: HashMap<String, String> = HashMap::new(); // normalized href -> etag
        for item in &doc.responses {
            if !item.etag.is_empty() {
                remote.insert(normalize_href(&item.href), item.etag.clone());
            }
        }

        let local: Vec<Event> = self
            .store
            .find_all(Query::new().equal("calendarId", calendar.id.as_str()))
            .await?;
        let mut needed_hrefs: Vec<String> = Vec::new();
        let mut deleted: Vec<Event> = Vec::new();

        let local_by_href: HashMap<String, &Event> = local
            .iter()
            .filter(|e| !e.href.is_empty())
            .map(|e| (normalize_href(&e.href), e))
            .collect();

        for (href, etag) in &remote {
            match local_by_href.get(href) {
                None => needed_hrefs.push(href.clone()),
                Some(event) if &event.etag != etag => needed_hrefs.push(href.clone()),
                Some(_) => {}
            }
        }
        for (href, event) in &local_by_href {
            if !remote.contains_key(href) {
                deleted.push((*event).clone());
            }
        }

        if !needed_hrefs.is_empty() || !deleted.is_empty() {
            info!(
                calendar = %calendar.name,
                remote = remote.len(),
                local = local.len(),
                needed = needed_hrefs.len(),
                removed = deleted.len(),
                "legacy calendar sync"
            );
        }

        needed_hrefs.reverse();
        for chunk in needed_hrefs.chunks(MULTIGET_CHUNK) {
            let hrefs: String = chunk
                .iter()
                .map(|h| format!("<D:href>{}</D:href>", h))
                .collect();
            tokio::time::sleep(CALENDAR_REPORT_DEBOUNCE).await;
            let (_, doc) = self
                .xml_request(
                    url,
                    "REPORT",
                    "1",
                    &format!(
                        r#"<c:calendar-multiget xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav"><d:prop><d:getetag /><c:calendar-data /></d:prop>{}</c:calendar-multiget>"#,
                        hrefs
                    ),
                )
                .await?;
            let mut tx = self.store.begin().await?;
            for item in &doc.responses {
                self.ingest_event_tx(&mut tx, calendar, item, None).await?;
            }
            // Replacement happens within one transaction: deletions ride
            // along with the upserts.
            if !deleted.is_empty() {
                for event in deleted.drain(..) {
                    tx.remove(&event).await?;
                }
            }
            tx.commit().await?;
        }

        if !deleted.is_empty() {
            let mut tx = self.store.begin().await?;
            for event in &deleted {
                tx.remove(event).await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    async fn ingest_event(
        &self,
        calendar: &Calendar,
        item: &ResponseItem,
        window: Option<&CalendarSyncRange>,
    ) -> SyncResult<()> {
        let mut tx = self.store.begin().await?;
        self.ingest_event_tx(&mut tx, calendar, item, window).await?;
        tx.commit().await
    }

    async fn ingest_event_tx(
        &self,
        tx: &mut crate::store::StoreTransaction<'_>,
        calendar: &Calendar,
        item: &ResponseItem,
        window: Option<&CalendarSyncRange>,
    ) -> SyncResult<()> {
        if item.etag.is_empty() || item.body.is_empty() {
            if !item.etag.is_empty() {
                debug!(etag = %item.etag, "calendar event with an empty body");
            }
            return Ok(());
        }
        let Some(parsed) = parse_ics_event(&item.body) else {
            debug!("calendar entry without a usable VEVENT");
            return Ok(());
        };
        if parsed.start == 0 {
            debug!("calendar event has no start time, discarding");
            return Ok(());
        }

        let existing = tx
            .find::<Event>(
                Query::new()
                    .equal("calendarId", calendar.id.as_str())
                    .equal("icsuid", parsed.uid.as_str()),
            )
            .await?;
        match existing {
            Some(mut event) => {
                // In-place update preserves the stable id across etag
                // churn.
                event.etag = item.etag.clone();
                event.href = item.href.clone();
                event.ics_data = item.body.clone();
                event.rs = parsed.start;
                event.re = parsed.end;
                event.status = parsed.status.clone();
                event.location = parsed.location.clone();
                event.participants = parsed.participants.clone();
                tx.save(&mut event).await?;
            }
            None => {
                if let Some(window) = window {
                    if !(parsed.start < window.end && parsed.end >= window.start) {
                        return Ok(());
                    }
                }
                let mut event = Event {
                    id: Event::build_id(
                        &self.account.id,
                        &calendar.id,
                        &parsed.uid,
                        &parsed.recurrence_id,
                    ),
                    account_id: self.account.id.clone(),
                    version: 0,
                    calendar_id: calendar.id.clone(),
                    etag: item.etag.clone(),
                    href: item.href.clone(),
                    ics_uid: parsed.uid.clone(),
                    recurrence_id: parsed.recurrence_id.clone(),
                    status: parsed.status.clone(),
                    ics_data: item.body.clone(),
                    rs: parsed.start,
                    re: parsed.end,
                    location: parsed.location.clone(),
                    participants: parsed.participants.clone(),
                };
                tx.save(&mut event).await?;
            }
        }
        Ok(())
    }

    // ---- event write path ----

    /// PUT the event (If-Match when updating), then read back the server's
    /// canonical version. 412 surfaces as an etag conflict.
    pub async fn write_and_resync_event(&self, event: &Event) -> SyncResult<()> {
        let calendar: Calendar = self
            .store
            .find_by_id(&event.calendar_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Calendar", &event.calendar_id))?;
        let calendar_url = join_url(&self.cal_host, &calendar.path);

        let href = if event.href.is_empty() {
            // Most servers name resources {uid}.ics.
            let uid = if event.ics_uid.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                event.ics_uid.clone()
            };
            format!("{}/{}.ics", calendar.path.trim_end_matches('/'), uid)
        } else {
            event.href.clone()
        };
        let full_url = join_url(&self.cal_host, &href);

        self.resource_request(
            &full_url,
            "PUT",
            "text/calendar; charset=utf-8",
            &event.ics_data,
            &event.etag,
        )
        .await?;

        let (_, doc) = self
            .xml_request(
                &calendar_url,
                "REPORT",
                "1",
                &format!(
                    r#"<c:calendar-multiget xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav"><d:prop><d:getetag /><c:calendar-data /></d:prop><d:href>{}</d:href></c:calendar-multiget>"#,
                    href
                ),
            )
            .await?;
        let mut tx = self.store.begin().await?;
        for item in &doc.responses {
            self.ingest_event_tx(&mut tx, &calendar, item, None).await?;
        }
        tx.commit().await?;
        info!(href = %href, "event syncback complete");
        Ok(())
    }

    pub async fn delete_event(&self, event: &Event) -> SyncResult<()> {
        let calendar: Calendar = self
            .store
            .find_by_id(&event.calendar_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Calendar", &event.calendar_id))?;
        let href = if event.href.is_empty() {
            if event.ics_uid.is_empty() {
                return Err(SyncError::other("cannot delete event without href or UID"));
            }
            format!("{}/{}.ics", calendar.path.trim_end_matches('/'), event.ics_uid)
        } else {
            event.href.clone()
        };
        let full_url = join_url(&self.cal_host, &href);
        self.resource_request(&full_url, "DELETE", "text/calendar; charset=utf-8", "", &event.etag)
            .await?;
        self.store.remove(event).await
    }

    // ---- DAV syncback tasks ----

    /// Contact and event mutations run their remote phase here; the IMAP
    /// foreground worker can't carry DAV traffic.
    async fn process_dav_tasks(&mut self) -> SyncResult<()> {
        let ready: Vec<Task> = self
            .store
            .find_all(
                Query::new()
                    .equal("accountId", self.account.id.as_str())
                    .equal("status", "remote")
                    .equal_any("constructorName", &DAV_TASK_TYPES),
            )
            .await?;
        for mut task in ready {
            if task.should_cancel {
                task.status = TaskStatus::Cancelled;
                self.store.save(&mut task).await?;
                continue;
            }
            let contact_id = payload_id(&task, "contactId", "contact");
            let event_id = payload_id(&task, "eventId", "event");
            let result: SyncResult<()> = async {
                match task.constructor_name.as_str() {
                    "SyncbackContactTask" => {
                        if let Some(contact) = self.store.find_by_id::<Contact>(&contact_id).await? {
                            self.write_and_resync_contact(&contact).await?;
                        }
                        Ok(())
                    }
                    "DestroyContactTask" => {
                        if let Some(contact) = self.store.find_by_id::<Contact>(&contact_id).await? {
                            self.delete_contact(&contact).await?;
                        }
                        Ok(())
                    }
                    "SyncbackEventTask" => {
                        if let Some(event) = self.store.find_by_id::<Event>(&event_id).await? {
                            self.write_and_resync_event(&event).await?;
                        }
                        Ok(())
                    }
                    "DestroyEventTask" => {
                        if let Some(event) = self.store.find_by_id::<Event>(&event_id).await? {
                            self.delete_event(&event).await?;
                        }
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            .await;
            match result {
                Ok(()) => task.status = TaskStatus::Complete,
                Err(err) => {
                    warn!(task = %task.id, error = %err, "DAV task failed");
                    task.error = Some(err.to_task_error_json());
                    task.status = TaskStatus::Complete;
                }
            }
            self.store.save(&mut task).await?;
        }
        Ok(())
    }
}

/// Model id from a task payload: a direct `{key}Id` field, or the id
/// embedded in the full model payload.
fn payload_id(task: &Task, id_key: &str, model_key: &str) -> String {
    let direct = task.field_str(id_key);
    if !direct.is_empty() {
        return direct;
    }
    task.data[model_key]["id"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

/// Times and identity parsed from one VEVENT.
struct ParsedIcsEvent {
    uid: String,
    recurrence_id: String,
    status: String,
    location: String,
    start: i64,
    end: i64,
    participants: Vec<crate::models::event::EventParticipant>,
}

fn parse_ics_event(ics: &str) -> Option<ParsedIcsEvent> {
    use icalendar::{Component, EventLike};

    let parsed: icalendar::Calendar = ics.parse().ok()?;
    let event = parsed.components.iter().find_map(|c| match c {
        icalendar::CalendarComponent::Event(e) => Some(e),
        _ => None,
    })?;

    let uid = event.get_uid().unwrap_or_default().to_string();
    let start = event.get_start().and_then(date_to_unix).unwrap_or(0);

    // Without an RRULE the end is DTEND (or DTSTART). With one, the
    // effective end is UNTIL; COUNT-bounded rules get the distant-future
    // sentinel rather than an expansion.
    let end = match event.property_value("RRULE") {
        None => event
            .get_end()
            .and_then(date_to_unix)
            .filter(|&e| e > 0)
            .unwrap_or(start),
        Some(rrule) => parse_rrule_until(rrule).unwrap_or(DISTANT_FUTURE),
    };

    let recurrence_id = event
        .property_value("RECURRENCE-ID")
        .unwrap_or_default()
        .to_string();
    let status = event
        .property_value("STATUS")
        .unwrap_or_default()
        .to_string();
    let location = event.get_location().unwrap_or_default().to_string();

    let participants = event
        .multi_properties()
        .get("ATTENDEE")
        .map(|attendees| {
            attendees
                .iter()
                .map(|p| crate::models::event::EventParticipant {
                    name: p
                        .params()
                        .get("CN")
                        .map(|v| v.value().to_string())
                        .unwrap_or_default(),
                    email: p
                        .value()
                        .strip_prefix("mailto:")
                        .unwrap_or(p.value())
                        .to_string(),
                    status: p
                        .params()
                        .get("PARTSTAT")
                        .map(|v| v.value().to_string())
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ParsedIcsEvent {
        uid,
        recurrence_id,
        status,
        location,
        start,
        end,
        participants,
    })
}

fn date_to_unix(value: icalendar::DatePerhapsTime) -> Option<i64> {
    use icalendar::{CalendarDateTime, DatePerhapsTime};
    match value {
        DatePerhapsTime::Date(date) => date
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive).timestamp()),
        DatePerhapsTime::DateTime(dt) => match dt {
            CalendarDateTime::Utc(dt) => Some(dt.timestamp()),
            CalendarDateTime::Floating(naive) => Some(Utc.from_utc_datetime(&naive).timestamp()),
            CalendarDateTime::WithTimezone { date_time, tzid } => {
                let tz: chrono_tz::Tz = tzid.parse().ok()?;
                tz.from_local_datetime(&date_time)
                    .single()
                    .map(|dt| dt.timestamp())
            }
        },
    }
}

fn parse_rrule_until(rrule: &str) -> Option<i64> {
    let until = rrule
        .split(';')
        .find_map(|part| part.strip_prefix("UNTIL="))?;
    let normalized = until.trim_end_matches('Z');
    let parsed = chrono::NaiveDateTime::parse_from_str(normalized, "%Y%m%dT%H%M%S")
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(normalized, "%Y%m%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    Some(Utc.from_utc_datetime(&parsed).timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_EVENT: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:evt-1\r\nDTSTART:20240501T090000Z\r\nDTEND:20240501T100000Z\r\nSTATUS:CONFIRMED\r\nLOCATION:Room 4\r\nATTENDEE;CN=Ana;PARTSTAT=ACCEPTED:mailto:ana@example.com\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn parses_simple_event() {
        let event = parse_ics_event(SIMPLE_EVENT).unwrap();
        assert_eq!(event.uid, "evt-1");
        assert!(event.start > 0);
        assert_eq!(event.end - event.start, 3600);
        assert_eq!(event.status, "CONFIRMED");
        assert_eq!(event.location, "Room 4");
        assert_eq!(event.participants.len(), 1);
        assert_eq!(event.participants[0].email, "ana@example.com");
        assert_eq!(event.participants[0].status, "ACCEPTED");
    }

    #[test]
    fn recurring_event_without_until_gets_sentinel_end() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:evt-2\r\nDTSTART:20240501T090000Z\r\nRRULE:FREQ=WEEKLY;COUNT=10\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let event = parse_ics_event(ics).unwrap();
        assert_eq!(event.end, DISTANT_FUTURE);
    }

    #[test]
    fn recurring_event_with_until_uses_it() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:evt-3\r\nDTSTART:20240501T090000Z\r\nRRULE:FREQ=WEEKLY;UNTIL=20240801T000000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let event = parse_ics_event(ics).unwrap();
        assert!(event.end < DISTANT_FUTURE);
        assert!(event.end > event.start);
    }

    #[test]
    fn event_without_dtstart_reports_zero_start() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:evt-4\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let event = parse_ics_event(ics).unwrap();
        assert_eq!(event.start, 0);
    }

    #[test]
    fn sync_window_spans_past_and_future() {
        let range = calendar_sync_range();
        let now = util::now_secs();
        assert!(range.start < now);
        assert!(range.end > now);
        assert!(range.start_str.ends_with('Z'));
    }
}
