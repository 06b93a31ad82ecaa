//! Shared utilities: stable ids, href normalization, role mapping, chunking

use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const BASE58_ALPHABET: &[u8; 58] =
    b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Number of hash bytes carried into an id. Enough to make collisions
/// implausible while keeping ids short in the client protocol.
const ID_HASH_PREFIX_LEN: usize = 30;

/// Messages dated after this point always use id scheme 1.
pub const SCHEMA_1_START_DATE: i64 = 1_518_652_800; // 2018-02-15

fn base58_encode(bytes: &[u8]) -> String {
    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = byte as u32;
        for d in digits.iter_mut() {
            let v = (*d as u32) * 256 + carry;
            *d = (v % 58) as u8;
            carry = v / 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    for &byte in bytes {
        if byte == 0 {
            digits.push(0);
        } else {
            break;
        }
    }
    digits
        .iter()
        .rev()
        .map(|&d| BASE58_ALPHABET[d as usize] as char)
        .collect()
}

/// SHA-256 the source string and base58-encode the 30-byte prefix.
pub fn hashed_id(src: &str) -> String {
    let digest = Sha256::digest(src.as_bytes());
    base58_encode(&digest[..ID_HASH_PREFIX_LEN])
}

/// Inputs for the message id hash, captured from the message header.
pub struct MessageIdParts<'a> {
    pub date: i64,
    pub subject: &'a str,
    /// to + cc + bcc mailbox addresses
    pub recipient_emails: Vec<String>,
    /// Empty when the Message-ID header was auto-generated by the parser.
    pub header_message_id: &'a str,
}

/// Stable message id. Scheme 1 hashes `{accountId, date, subject,
/// sorted-recipients, messageID}`; when the message carries no usable date
/// the folder path + UID stand in, which trades metadata survival across
/// moves for stability within the mailbox.
pub fn id_for_message(
    account_id: &str,
    folder_path: &str,
    uid: u32,
    parts: &MessageIdParts<'_>,
) -> String {
    let mut emails = parts.recipient_emails.clone();
    emails.sort();

    let mut src = String::with_capacity(128);
    src.push_str(account_id);
    src.push('-');
    if parts.date > 0 {
        src.push_str(&parts.date.to_string());
    } else {
        src.push_str(folder_path);
        src.push(':');
        src.push_str(&uid.to_string());
    }
    src.push_str(parts.subject);
    src.push('-');
    src.push_str(&emails.join(""));
    src.push('-');
    src.push_str(parts.header_message_id);
    hashed_id(&src)
}

pub fn id_for_folder(account_id: &str, folder_path: &str) -> String {
    hashed_id(&format!("{}:{}", account_id, folder_path))
}

pub fn id_for_calendar(account_id: &str, url: &str) -> String {
    hashed_id(&format!("{}:{}", account_id, url))
}

/// Event ids hash the iCalendar UID, not the etag, so modifications keep
/// the same local id. Exception instances mix in their recurrence id.
pub fn id_for_event(
    account_id: &str,
    calendar_id: &str,
    ics_uid: &str,
    recurrence_id: &str,
) -> String {
    let mut src = format!("{}-{}-{}", account_id, calendar_id, ics_uid);
    if !recurrence_id.is_empty() {
        src.push('-');
        src.push_str(recurrence_id);
    }
    hashed_id(&src)
}

pub fn id_for_file(message_id: &str, part_discriminator: &str) -> String {
    hashed_id(&format!("{}:{}", message_id, part_discriminator))
}

/// Fallback contact id when the vCard carries no UID.
pub fn id_for_contact_href(account_id: &str, href: &str) -> String {
    hashed_id(&format!("{}:{}", account_id, href))
}

// ---- DAV href handling ----

/// Percent-decode, tolerating malformed escapes by passing them through.
pub fn url_decode(encoded: &str) -> String {
    match urlencoding::decode(encoded) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => encoded.to_string(),
    }
}

/// The single comparison primitive for DAV hrefs: strip scheme/host,
/// percent-decode, drop trailing slashes. `normalize_href(absolute)` and
/// `normalize_href(path)` compare equal for any same-host reference.
pub fn normalize_href(href: &str) -> String {
    let mut result = href.to_string();
    if let Some(scheme_end) = result.find("://") {
        if let Some(path_start) = result[scheme_end + 3..].find('/') {
            result = result[scheme_end + 3 + path_start..].to_string();
        } else {
            result = "/".to_string();
        }
    }
    result = url_decode(&result);
    while result.len() > 1 && result.ends_with('/') {
        result.pop();
    }
    result
}

/// Canonical URL join: host + path without doubled slashes. `path` may be
/// absolute (host-relative) or a full URL, which wins outright.
pub fn join_url(host: &str, path: &str) -> String {
    if path.contains("://") {
        return path.to_string();
    }
    let base = host.trim_end_matches('/');
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base, path.trim_start_matches('/'))
}

// ---- Folder role mapping ----

/// Lowercased common folder paths and the roles they imply, across the
/// localizations the engine historically encountered.
static COMMON_FOLDER_ROLES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for (path, role) in [
        ("gel\u{f6}scht", "trash"),
        ("papierkorb", "trash"),
        ("papierkorb/trash", "trash"),
        ("gel\u{f6}schte elemente", "trash"),
        ("deleted items", "trash"),
        ("deleted messages", "trash"),
        ("papelera", "trash"),
        ("borradores", "trash"),
        ("корзина", "trash"),
        ("удаленные", "trash"),
        ("смiття", "trash"),
        ("kosz", "trash"),
        ("[gmail]/trash", "trash"),
        ("[imap]/trash", "trash"),
        ("trash", "trash"),
        ("roskaposti", "spam"),
        ("skr\u{e4}ppost", "spam"),
        ("spamverdacht", "spam"),
        ("spam", "spam"),
        ("[gmail]/spam", "spam"),
        ("[imap]/spam", "spam"),
        ("垃圾邮件", "spam"),
        ("junk", "spam"),
        ("junk mail", "spam"),
        ("junk e-mail", "spam"),
        ("junk email", "spam"),
        ("bulk mail", "spam"),
        ("спам", "spam"),
        ("inbox", "inbox"),
        ("dateneintrag", "archive"),
        ("archivio", "archive"),
        ("archive", "archive"),
        ("archiv", "archive"),
        ("postausgang", "sent"),
        ("sent", "sent"),
        ("sent items", "sent"),
        ("sent messages", "sent"),
        ("odeslan\u{e9}", "sent"),
        ("gesendet", "sent"),
        ("inviata", "sent"),
        ("enviados", "sent"),
        ("отправленные", "sent"),
        ("[gmail]/sent mail", "sent"),
        ("drafts", "drafts"),
        ("draft", "drafts"),
        ("brouillons", "drafts"),
        ("entw\u{fc}rfe", "drafts"),
        ("черновики", "drafts"),
        ("[gmail]/drafts", "drafts"),
        ("[gmail]/all mail", "all"),
        ("[gmail]/important", "important"),
        ("[gmail]/starred", "starred"),
        ("important", "important"),
        ("starred", "starred"),
    ] {
        m.insert(path, role);
    }
    m
});

/// Role implied by a folder path, after flag-based assignment found
/// nothing. Within the app-owned container subtree the leaf name IS the
/// role (`[Mailspring]/Snoozed` => `snoozed`).
pub fn role_for_folder_path(
    container_folder: &str,
    main_prefix: &str,
    path: &str,
    delimiter: char,
) -> String {
    let mut path = path.to_string();
    if !main_prefix.is_empty() && path.len() > main_prefix.len() && path.starts_with(main_prefix) {
        path = path[main_prefix.len()..].to_string();
    }
    if path.len() > 1 && path.starts_with(delimiter) {
        path = path[delimiter.len_utf8()..].to_string();
    }
    let path = path.to_lowercase();

    for prefix in ["mailspring", "[mailspring]"] {
        let full = format!("{}{}", prefix, delimiter);
        if path.len() > full.len() && path.starts_with(&full) {
            return path[full.len()..].to_string();
        }
    }
    if !container_folder.is_empty() {
        let full = format!("{}{}", container_folder.to_lowercase(), delimiter);
        if path.len() > full.len() && path.starts_with(&full) {
            return path[full.len()..].to_string();
        }
    }

    COMMON_FOLDER_ROLES
        .get(path.as_str())
        .map(|r| r.to_string())
        .unwrap_or_default()
}

/// Sync order for folders: primary mailboxes first.
pub fn role_priority(role: &str) -> usize {
    const ORDER: [&str; 7] = ["inbox", "sent", "drafts", "all", "archive", "trash", "spam"];
    ORDER.iter().position(|r| *r == role).unwrap_or(ORDER.len())
}

// ---- Misc ----

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Format a set of UIDs as an IMAP sequence-set, collapsing runs.
pub fn uid_set_string(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts: Vec<String> = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let start = sorted[i];
        let mut end = start;
        while i + 1 < sorted.len() && sorted[i + 1] == end + 1 {
            end = sorted[i + 1];
            i += 1;
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}:{}", start, end));
        }
        i += 1;
    }
    parts.join(",")
}

/// Filenames written beneath the files directory are sanitized to a
/// conservative character set.
pub fn safe_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Plaintext snippet for list views, derived at ingestion time.
pub fn snippet_from_text(text: &str, max_len: usize) -> String {
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() <= max_len {
        return collapsed;
    }
    let mut end = max_len;
    while end > 0 && !collapsed.is_char_boundary(end) {
        end -= 1;
    }
    collapsed[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base58_matches_known_vectors() {
        assert_eq!(base58_encode(b"hello"), "Cn8eVZg");
        assert_eq!(base58_encode(&[0, 0, 1]), "112");
        assert_eq!(base58_encode(&[]), "1");
    }

    #[test]
    fn message_ids_are_stable_across_uid_changes_when_dated() {
        let parts = MessageIdParts {
            date: 1_600_000_000,
            subject: "Hello",
            recipient_emails: vec!["b@x.com".into(), "a@x.com".into()],
            header_message_id: "<m1@x>",
        };
        let a = id_for_message("acct", "INBOX", 10, &parts);
        let b = id_for_message("acct", "INBOX", 17, &parts);
        assert_eq!(a, b);
    }

    #[test]
    fn message_ids_fall_back_to_folder_and_uid() {
        let parts = MessageIdParts {
            date: 0,
            subject: "",
            recipient_emails: vec![],
            header_message_id: "",
        };
        let a = id_for_message("acct", "INBOX", 10, &parts);
        let b = id_for_message("acct", "INBOX", 11, &parts);
        assert_ne!(a, b);
    }

    #[test]
    fn recipient_order_does_not_matter() {
        let p1 = MessageIdParts {
            date: 5,
            subject: "s",
            recipient_emails: vec!["a@x.com".into(), "b@x.com".into()],
            header_message_id: "<id>",
        };
        let p2 = MessageIdParts {
            date: 5,
            subject: "s",
            recipient_emails: vec!["b@x.com".into(), "a@x.com".into()],
            header_message_id: "<id>",
        };
        assert_eq!(
            id_for_message("a", "INBOX", 1, &p1),
            id_for_message("a", "INBOX", 2, &p2)
        );
    }

    #[test]
    fn normalize_href_round_trips() {
        assert_eq!(
            normalize_href("https://dav.example.com/books/ab%20c/"),
            "/books/ab c"
        );
        assert_eq!(normalize_href("/books/ab c"), "/books/ab c");
        assert_eq!(
            normalize_href("https://dav.example.com/books/x"),
            normalize_href("/books/x/")
        );
        assert_eq!(normalize_href("https://dav.example.com"), "/");
    }

    #[test]
    fn join_url_never_doubles_slashes() {
        assert_eq!(join_url("https://h.com/", "/cal/1.ics"), "https://h.com/cal/1.ics");
        assert_eq!(join_url("https://h.com", "cal/1.ics"), "https://h.com/cal/1.ics");
        assert_eq!(
            join_url("https://h.com", "https://other.com/x"),
            "https://other.com/x"
        );
    }

    #[test]
    fn roles_resolve_from_paths() {
        assert_eq!(role_for_folder_path("", "", "INBOX", '/'), "inbox");
        assert_eq!(role_for_folder_path("", "", "[Gmail]/Spam", '/'), "spam");
        assert_eq!(
            role_for_folder_path("", "", "[Mailspring]/Snoozed", '/'),
            "snoozed"
        );
        assert_eq!(
            role_for_folder_path("Keep", "", "Keep/Snoozed", '/'),
            "snoozed"
        );
        assert_eq!(
            role_for_folder_path("", "INBOX.", "INBOX.Sent", '.'),
            "sent"
        );
        assert_eq!(role_for_folder_path("", "", "Projects/2024", '/'), "");
    }

    #[test]
    fn role_priority_orders_primary_folders_first() {
        assert!(role_priority("inbox") < role_priority("sent"));
        assert!(role_priority("trash") < role_priority("spam"));
        assert!(role_priority("spam") < role_priority(""));
    }

    #[test]
    fn uid_sets_collapse_runs() {
        assert_eq!(uid_set_string(&[3, 1, 2, 7, 9, 8]), "1:3,7:9");
        assert_eq!(uid_set_string(&[5]), "5");
        assert_eq!(uid_set_string(&[5, 5, 6]), "5:6");
    }

    #[test]
    fn snippets_collapse_whitespace_and_truncate() {
        assert_eq!(snippet_from_text("a\n\n  b\tc", 160), "a b c");
        let long = "x".repeat(400);
        assert_eq!(snippet_from_text(&long, 160).len(), 160);
    }

    #[test]
    fn safe_filenames_strip_separators() {
        assert_eq!(safe_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(safe_filename(""), "untitled");
        assert_eq!(safe_filename("report (final).pdf"), "report (final).pdf");
    }
}
