//! IMAP session layer
//!
//! Wraps `async-imap` with the handful of raw-protocol exchanges the typed
//! API doesn't surface: `CHANGEDSINCE`/`VANISHED` fetches, Gmail
//! `X-GM-*` attributes, and UIDPLUS `COPYUID` mappings. All raw response
//! parsing goes through `imap_proto::parser::parse_response` and stays in
//! this module.

pub mod worker;

use crate::config::{Account, ConnectionSecurity};
use crate::error::{SyncError, SyncResult};
use futures::TryStreamExt;
use async_imap::types::Capability;
use imap_proto::types::{AttributeValue, Response, ResponseCode, UidSetMember};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

pub type TlsTransport = async_native_tls::TlsStream<Compat<TcpStream>>;
pub type PlainTransport = Compat<TcpStream>;

/// Bounds async-imap needs from an underlying stream.
pub trait Transport:
    futures::io::AsyncRead + futures::io::AsyncWrite + Unpin + Send + fmt::Debug
{
}
impl<T: futures::io::AsyncRead + futures::io::AsyncWrite + Unpin + Send + fmt::Debug> Transport
    for T
{
}

enum InnerSession {
    Tls(async_imap::Session<TlsTransport>),
    Plain(async_imap::Session<PlainTransport>),
}

/// Run a raw IMAP command and collect the raw bytes of every response line
/// up to and including the tagged completion, for commands whose untagged
/// data (`VANISHED`, `COPYUID`, ...) the typed `async-imap` API doesn't
/// surface.
async fn run_command_and_read_response<T: Transport>(
    session: &mut async_imap::Session<T>,
    command: &str,
) -> SyncResult<Vec<u8>> {
    let tag = session.run_command(command).await?;
    let mut bytes = Vec::new();
    loop {
        let resp = session
            .read_response()
            .await?
            .ok_or_else(|| SyncError::connection("connection closed while reading response"))?;
        bytes.extend_from_slice(resp.borrow_owner());
        if resp.request_id() == Some(&tag) {
            break;
        }
    }
    Ok(bytes)
}

macro_rules! with_session {
    ($conn:expr, $s:ident => $body:expr) => {
        match $conn
            .session
            .as_mut()
            .ok_or_else(|| SyncError::connection("IMAP session lost"))?
        {
            InnerSession::Tls($s) => $body,
            InnerSession::Plain($s) => $body,
        }
    };
}

/// XOAUTH2 SASL initial response.
struct XOAuth2 {
    user: String,
    token: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.token)
    }
}

/// A folder as reported by LIST.
#[derive(Debug, Clone)]
pub struct RemoteFolder {
    pub path: String,
    pub delimiter: char,
    pub attributes: Vec<String>,
}

impl RemoteFolder {
    pub fn has_attribute(&self, attr: &str) -> bool {
        self.attributes.iter().any(|a| a.eq_ignore_ascii_case(attr))
    }

    pub fn no_select(&self) -> bool {
        self.has_attribute("\\Noselect")
    }
}

/// STATUS response summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderStatus {
    pub uidnext: u32,
    pub uidvalidity: u32,
    pub highestmodseq: u64,
    pub message_count: u32,
}

/// One message's attributes (and optionally headers) from a fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchedMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub gm_labels: Option<Vec<String>>,
    pub gm_msgid: Option<u64>,
    pub gm_thrid: Option<u64>,
    pub modseq: Option<u64>,
    pub header: Option<Vec<u8>>,
}

impl FetchedMessage {
    fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }

    pub fn unread(&self) -> bool {
        !self.has_flag("\\Seen")
    }

    pub fn starred(&self) -> bool {
        self.has_flag("\\Flagged")
    }

    pub fn draft(&self) -> bool {
        self.has_flag("\\Draft")
    }

    pub fn sorted_labels(&self) -> Vec<String> {
        let mut labels = self.gm_labels.clone().unwrap_or_default();
        labels.sort();
        labels
    }
}

/// Result of a fetch that may carry QRESYNC vanished ranges.
#[derive(Debug, Default)]
pub struct FetchResult {
    pub messages: Vec<FetchedMessage>,
    pub vanished: Vec<u32>,
}

/// One authenticated IMAP connection. Owned by a single worker.
pub struct ImapConnection {
    session: Option<InnerSession>,
    capabilities: HashSet<String>,
    is_gmail: bool,
}

impl ImapConnection {
    pub async fn connect(account: &Account, oauth_token: Option<&str>) -> SyncResult<Self> {
        let settings = &account.settings;
        let security = settings.imap_security.unwrap_or_default();
        let addr = (settings.imap_host.as_str(), settings.imap_port);

        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| SyncError::connection(format!("{}: {}", settings.imap_host, e)))?;

        let session = match security {
            ConnectionSecurity::Ssl | ConnectionSecurity::Starttls => {
                let tls = async_native_tls::TlsConnector::new()
                    .danger_accept_invalid_certs(settings.imap_allow_insecure_ssl);
                let stream = tls
                    .connect(settings.imap_host.as_str(), tcp.compat())
                    .await
                    .map_err(|e| SyncError::connection(format!("TLS: {}", e)))?;
                let client = async_imap::Client::new(stream);
                InnerSession::Tls(Self::authenticate(client, account, oauth_token).await?)
            }
            ConnectionSecurity::None => {
                let client = async_imap::Client::new(tcp.compat());
                InnerSession::Plain(Self::authenticate(client, account, oauth_token).await?)
            }
        };

        let mut conn = ImapConnection {
            session: Some(session),
            capabilities: HashSet::new(),
            is_gmail: account.is_gmail(),
        };
        conn.load_capabilities().await?;

        if conn.is_gmail && !conn.has_capability("X-GM-EXT-1") {
            return Err(SyncError::GmailImapDisabled);
        }
        Ok(conn)
    }

    async fn authenticate<T: Transport>(
        mut client: async_imap::Client<T>,
        account: &Account,
        oauth_token: Option<&str>,
    ) -> SyncResult<async_imap::Session<T>> {
        let _greeting = client
            .read_response()
            .await?
            .ok_or_else(|| SyncError::connection("no IMAP greeting"))?;

        let settings = &account.settings;
        if let Some(token) = oauth_token {
            let auth = XOAuth2 {
                user: settings.imap_username.clone(),
                token: token.to_string(),
            };
            client
                .authenticate("XOAUTH2", auth)
                .await
                .map_err(|(e, _)| SyncError::authentication(e.to_string()))
        } else {
            client
                .login(&settings.imap_username, &settings.imap_password)
                .await
                .map_err(|(e, _)| SyncError::authentication(e.to_string()))
        }
    }

    async fn load_capabilities(&mut self) -> SyncResult<()> {
        let caps = with_session!(self, s => s.capabilities().await)?;
        self.capabilities = caps
            .iter()
            .map(|c| match c {
                Capability::Imap4rev1 => "IMAP4rev1".to_string(),
                Capability::Auth(mech) => format!("AUTH={}", mech),
                Capability::Atom(atom) => atom.to_string(),
            })
            .collect();
        Ok(())
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(cap))
    }

    pub fn supports_condstore(&self) -> bool {
        self.has_capability("CONDSTORE")
    }

    pub fn supports_qresync(&self) -> bool {
        self.has_capability("QRESYNC") && self.supports_condstore()
    }

    pub fn supports_uidplus(&self) -> bool {
        self.has_capability("UIDPLUS")
    }

    pub fn supports_move(&self) -> bool {
        self.has_capability("MOVE")
    }

    pub fn supports_idle(&self) -> bool {
        self.has_capability("IDLE")
    }

    pub fn is_gmail(&self) -> bool {
        self.is_gmail
    }

    // ---- folder operations ----

    pub async fn list_folders(&mut self) -> SyncResult<Vec<RemoteFolder>> {
        let names: Vec<async_imap::types::Name> = with_session!(self, s => {
            let stream = s.list(Some(""), Some("*")).await?;
            stream.try_collect().await
        })?;
        Ok(names
            .iter()
            .map(|name| RemoteFolder {
                path: name.name().to_string(),
                delimiter: name
                    .delimiter()
                    .and_then(|d| d.chars().next())
                    .unwrap_or('/'),
                attributes: name
                    .attributes()
                    .iter()
                    .map(|a| format!("{:?}", a).trim_matches('"').to_string())
                    .collect(),
            })
            .collect())
    }

    pub async fn select(&mut self, path: &str) -> SyncResult<FolderStatus> {
        let mailbox = if self.supports_condstore() {
            with_session!(self, s => s.select_condstore(path).await)?
        } else {
            with_session!(self, s => s.select(path).await)?
        };
        Ok(FolderStatus {
            uidnext: mailbox.uid_next.unwrap_or(0),
            uidvalidity: mailbox.uid_validity.unwrap_or(0),
            highestmodseq: mailbox.highest_modseq.unwrap_or(0),
            message_count: mailbox.exists,
        })
    }

    pub async fn status(&mut self, path: &str) -> SyncResult<FolderStatus> {
        let items = if self.supports_condstore() {
            "(MESSAGES UIDNEXT UIDVALIDITY HIGHESTMODSEQ)"
        } else {
            "(MESSAGES UIDNEXT UIDVALIDITY)"
        };
        let mailbox = with_session!(self, s => s.status(path, items).await)?;
        Ok(FolderStatus {
            uidnext: mailbox.uid_next.unwrap_or(0),
            uidvalidity: mailbox.uid_validity.unwrap_or(0),
            highestmodseq: mailbox.highest_modseq.unwrap_or(0),
            message_count: mailbox.exists,
        })
    }

    pub async fn create_folder(&mut self, path: &str) -> SyncResult<()> {
        with_session!(self, s => s.create(path).await)?;
        Ok(())
    }

    pub async fn rename_folder(&mut self, from: &str, to: &str) -> SyncResult<()> {
        with_session!(self, s => s.rename(from, to).await)?;
        Ok(())
    }

    pub async fn delete_folder(&mut self, path: &str) -> SyncResult<()> {
        with_session!(self, s => s.delete(path).await)?;
        Ok(())
    }

    // ---- fetches ----

    /// Fetch attributes (and headers when `heavy`) for a UID set. With
    /// `changed_since`, issues a CONDSTORE `CHANGEDSINCE` fetch; with
    /// QRESYNC advertised, also collects `VANISHED` ranges.
    pub async fn fetch(
        &mut self,
        uid_set: &str,
        heavy: bool,
        changed_since: Option<u64>,
    ) -> SyncResult<FetchResult> {
        let mut items: Vec<&str> = vec!["UID", "FLAGS"];
        if self.is_gmail {
            items.extend_from_slice(&["X-GM-LABELS", "X-GM-MSGID", "X-GM-THRID"]);
        }
        if heavy {
            items.extend_from_slice(&["INTERNALDATE", "BODY.PEEK[HEADER]"]);
        }
        let mut command = format!("UID FETCH {} ({})", uid_set, items.join(" "));
        if let Some(modseq) = changed_since {
            if self.supports_qresync() {
                command.push_str(&format!(" (CHANGEDSINCE {} VANISHED)", modseq));
            } else {
                command.push_str(&format!(" (CHANGEDSINCE {})", modseq));
            }
        }

        let bytes = with_session!(self, s => run_command_and_read_response(s, &command).await)?;
        parse_fetch_response(&bytes)
    }

    /// Fetch the full RFC 2822 body of one message.
    pub async fn fetch_body(&mut self, uid: u32) -> SyncResult<Option<Vec<u8>>> {
        let fetches: Vec<async_imap::types::Fetch> = with_session!(self, s => {
            let stream = s.uid_fetch(uid.to_string(), "(UID BODY.PEEK[])").await?;
            stream.try_collect().await
        })?;
        Ok(fetches
            .into_iter()
            .find_map(|f| f.body().map(|b| b.to_vec())))
    }

    pub async fn uid_search(&mut self, query: &str) -> SyncResult<Vec<u32>> {
        let uids = with_session!(self, s => s.uid_search(query).await)?;
        Ok(uids.into_iter().collect())
    }

    // ---- mutations ----

    async fn uid_store(&mut self, uid_set: &str, change: &str) -> SyncResult<()> {
        let _updates: Vec<async_imap::types::Fetch> = with_session!(self, s => {
            let stream = s.uid_store(uid_set, change).await?;
            stream.try_collect().await
        })?;
        Ok(())
    }

    pub async fn add_flags(&mut self, uid_set: &str, flags: &str) -> SyncResult<()> {
        self.uid_store(uid_set, &format!("+FLAGS ({})", flags)).await
    }

    pub async fn remove_flags(&mut self, uid_set: &str, flags: &str) -> SyncResult<()> {
        self.uid_store(uid_set, &format!("-FLAGS ({})", flags)).await
    }

    pub async fn add_gmail_labels(&mut self, uid_set: &str, labels: &[String]) -> SyncResult<()> {
        self.uid_store(uid_set, &format!("+X-GM-LABELS ({})", quote_labels(labels)))
            .await
    }

    pub async fn remove_gmail_labels(
        &mut self,
        uid_set: &str,
        labels: &[String],
    ) -> SyncResult<()> {
        self.uid_store(uid_set, &format!("-X-GM-LABELS ({})", quote_labels(labels)))
            .await
    }

    /// MOVE the set, returning the UIDPLUS mapping when the server
    /// provides one.
    pub async fn uid_move(
        &mut self,
        uid_set: &str,
        destination: &str,
    ) -> SyncResult<Option<HashMap<u32, u32>>> {
        let command = format!("UID MOVE {} \"{}\"", uid_set, destination);
        let bytes = with_session!(self, s => run_command_and_read_response(s, &command).await)?;
        Ok(parse_copyuid(&bytes))
    }

    /// COPY the set, returning the UIDPLUS mapping when available.
    pub async fn uid_copy(
        &mut self,
        uid_set: &str,
        destination: &str,
    ) -> SyncResult<Option<HashMap<u32, u32>>> {
        let command = format!("UID COPY {} \"{}\"", uid_set, destination);
        let bytes = with_session!(self, s => run_command_and_read_response(s, &command).await)?;
        Ok(parse_copyuid(&bytes))
    }

    pub async fn expunge(&mut self) -> SyncResult<()> {
        let _seqs: Vec<u32> = with_session!(self, s => {
            let stream = s.expunge().await?;
            stream.try_collect().await
        })?;
        Ok(())
    }

    pub async fn append(&mut self, folder: &str, content: &[u8]) -> SyncResult<()> {
        with_session!(self, s => s.append(folder, None, None, content).await)?;
        Ok(())
    }

    pub async fn close(&mut self) -> SyncResult<()> {
        with_session!(self, s => s.close().await)?;
        Ok(())
    }

    pub async fn noop(&mut self) -> SyncResult<()> {
        with_session!(self, s => s.noop().await)?;
        Ok(())
    }

    /// Enter IDLE on the selected folder until activity, timeout, or a
    /// wake signal from the dispatcher.
    pub async fn idle(&mut self, timeout: Duration, interrupt: &Notify) -> SyncResult<()> {
        if !self.supports_idle() {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = interrupt.notified() => {}
            }
            return self.noop().await;
        }

        let session = self
            .session
            .take()
            .ok_or_else(|| SyncError::connection("IMAP session lost"))?;
        match session {
            InnerSession::Tls(s) => {
                let s = Self::idle_inner(s, timeout, interrupt).await?;
                self.session = Some(InnerSession::Tls(s));
            }
            InnerSession::Plain(s) => {
                let s = Self::idle_inner(s, timeout, interrupt).await?;
                self.session = Some(InnerSession::Plain(s));
            }
        }
        Ok(())
    }

    async fn idle_inner<T: Transport>(
        session: async_imap::Session<T>,
        timeout: Duration,
        interrupt: &Notify,
    ) -> SyncResult<async_imap::Session<T>> {
        let mut handle = session.idle();
        handle.init().await?;
        {
            let (wait, _stop) = handle.wait_with_timeout(timeout);
            tokio::select! {
                result = wait => {
                    if let Err(err) = result {
                        debug!(error = %err, "IDLE wait ended with error");
                    }
                }
                _ = interrupt.notified() => {
                    debug!("IDLE interrupted by wake signal");
                }
            }
        }
        Ok(handle.done().await?)
    }

    pub async fn logout(&mut self) {
        let result: SyncResult<()> = async {
            with_session!(self, s => s.logout().await)?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            debug!(error = %err, "logout failed");
        }
        self.session = None;
    }
}

fn quote_labels(labels: &[String]) -> String {
    labels
        .iter()
        .map(|l| format!("\"{}\"", l.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Walk a buffered response, yielding parsed messages and vanished UIDs.
/// Unparseable lines are skipped; an abrupt disconnect mid-stream shows
/// up as a parse error on retryable classification.
fn parse_fetch_response(bytes: &[u8]) -> SyncResult<FetchResult> {
    let mut result = FetchResult::default();
    let mut rest = bytes;
    while !rest.is_empty() {
        match imap_proto::parser::parse_response(rest) {
            Ok((next, response)) => {
                match response {
                    Response::Fetch(_seq, attrs) => {
                        result.messages.push(fetched_message_from_attrs(&attrs));
                    }
                    Response::Vanished { uids, .. } => {
                        for range in uids {
                            for uid in range {
                                result.vanished.push(uid);
                            }
                        }
                    }
                    _ => {}
                }
                rest = next;
            }
            Err(_) => {
                // Skip one line and keep going; the tagged completion and
                // any unsolicited responses we don't model land here.
                match rest.iter().position(|&b| b == b'\n') {
                    Some(pos) => rest = &rest[pos + 1..],
                    None => break,
                }
            }
        }
    }
    // Drop records the server sent without a UID; nothing can be keyed.
    result.messages.retain(|m| m.uid != 0);
    Ok(result)
}

fn fetched_message_from_attrs(attrs: &[AttributeValue<'_>]) -> FetchedMessage {
    let mut msg = FetchedMessage::default();
    for attr in attrs {
        match attr {
            AttributeValue::Uid(uid) => msg.uid = *uid,
            AttributeValue::Flags(flags) => {
                msg.flags = flags.iter().map(|f| f.to_string()).collect();
            }
            AttributeValue::ModSeq(modseq) => msg.modseq = Some(*modseq),
            AttributeValue::GmailMsgId(id) => msg.gm_msgid = Some(*id),
            AttributeValue::GmailThrId(id) => msg.gm_thrid = Some(*id),
            AttributeValue::GmailLabels(labels) => {
                msg.gm_labels = Some(labels.iter().map(|l| l.to_string()).collect());
            }
            AttributeValue::Rfc822Header(Some(header)) => {
                msg.header = Some(header.to_vec());
            }
            AttributeValue::BodySection { data: Some(data), .. } => {
                // BODY.PEEK[HEADER] answers arrive as a body section
                if msg.header.is_none() {
                    msg.header = Some(data.to_vec());
                }
            }
            _ => {}
        }
    }
    msg
}

/// Extract a `COPYUID` source→destination UID mapping from a tagged OK.
fn parse_copyuid(bytes: &[u8]) -> Option<HashMap<u32, u32>> {
    let mut rest = bytes;
    while !rest.is_empty() {
        match imap_proto::parser::parse_response(rest) {
            Ok((next, response)) => {
                if let Response::Done {
                    code: Some(ResponseCode::CopyUid(_validity, src, dst)),
                    ..
                } = response
                {
                    let src = expand_uid_set(&src);
                    let dst = expand_uid_set(&dst);
                    if src.len() == dst.len() {
                        return Some(src.into_iter().zip(dst).collect());
                    }
                    warn!(
                        src = src.len(),
                        dst = dst.len(),
                        "COPYUID set lengths disagree; ignoring mapping"
                    );
                    return None;
                }
                rest = next;
            }
            Err(_) => match rest.iter().position(|&b| b == b'\n') {
                Some(pos) => rest = &rest[pos + 1..],
                None => break,
            },
        }
    }
    None
}

fn expand_uid_set(set: &[UidSetMember]) -> Vec<u32> {
    let mut uids = Vec::new();
    for member in set {
        match member {
            UidSetMember::Uid(uid) => uids.push(*uid),
            UidSetMember::UidRange(range) => uids.extend(range.clone()),
        }
    }
    uids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_response_parses_gmail_attributes() {
        let raw = b"* 1 FETCH (UID 17 FLAGS (\\Seen) X-GM-MSGID 1278455344230334865 X-GM-THRID 1278455344230334865 X-GM-LABELS (\"\\\\Inbox\" \"Receipts\"))\r\n\
                    * 2 FETCH (UID 18 FLAGS ())\r\n\
                    A4 OK Success\r\n";
        let result = parse_fetch_response(raw).unwrap();
        assert_eq!(result.messages.len(), 2);
        let first = &result.messages[0];
        assert_eq!(first.uid, 17);
        assert!(!first.unread());
        assert_eq!(first.gm_msgid, Some(1278455344230334865));
        let labels = first.gm_labels.as_ref().unwrap();
        assert!(labels.iter().any(|l| l == "Receipts"));
        assert!(result.messages[1].unread());
    }

    #[test]
    fn fetch_response_collects_vanished_ranges() {
        let raw = b"* VANISHED (EARLIER) 300:303,405\r\nA5 OK done\r\n";
        let result = parse_fetch_response(raw).unwrap();
        assert_eq!(result.vanished, vec![300, 301, 302, 303, 405]);
    }

    #[test]
    fn fetch_response_skips_garbage_lines() {
        let raw = b"* SOMETHING WEIRD\r\n* 3 FETCH (UID 9 FLAGS (\\Flagged))\r\n";
        let result = parse_fetch_response(raw).unwrap();
        assert_eq!(result.messages.len(), 1);
        assert!(result.messages[0].starred());
    }

    #[test]
    fn copyuid_mapping_zips_source_and_destination() {
        let raw = b"A6 OK [COPYUID 1022 5:7 101:103] Done\r\n";
        let map = parse_copyuid(raw).unwrap();
        assert_eq!(map.get(&5), Some(&101));
        assert_eq!(map.get(&6), Some(&102));
        assert_eq!(map.get(&7), Some(&103));
    }

    #[test]
    fn label_quoting_escapes_backslashes() {
        let quoted = quote_labels(&["\\Inbox".to_string(), "Work Stuff".to_string()]);
        assert_eq!(quoted, "\"\\\\Inbox\" \"Work Stuff\"");
    }
}
