//! SMTP transport and MIME assembly for outgoing drafts

use crate::config::{Account, Config, ConnectionSecurity};
use crate::error::{SyncError, SyncResult};
use crate::models::{EmailAddress, Message};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::info;

pub type SmtpTransport = AsyncSmtpTransport<Tokio1Executor>;

/// Build a transport for the account. OAuth accounts authenticate with
/// XOAUTH2 using the current access token.
pub fn build_transport(account: &Account, oauth_token: Option<&str>) -> SyncResult<SmtpTransport> {
    let settings = &account.settings;
    let security = settings.smtp_security.unwrap_or_default();

    let mut builder = match security {
        ConnectionSecurity::Ssl => SmtpTransport::relay(&settings.smtp_host)
            .map_err(|e| SyncError::connection(e.to_string()))?,
        ConnectionSecurity::Starttls | ConnectionSecurity::None => {
            SmtpTransport::starttls_relay(&settings.smtp_host)
                .map_err(|e| SyncError::connection(e.to_string()))?
        }
    };
    builder = builder.port(settings.smtp_port);

    builder = if let Some(token) = oauth_token {
        builder
            .authentication(vec![Mechanism::Xoauth2])
            .credentials(Credentials::new(
                settings.smtp_username.clone(),
                token.to_string(),
            ))
    } else {
        builder.credentials(Credentials::new(
            settings.smtp_username.clone(),
            settings.smtp_password.clone(),
        ))
    };

    Ok(builder.build())
}

fn to_mailbox(addr: &EmailAddress) -> SyncResult<Mailbox> {
    let formatted = if addr.name.is_empty() {
        addr.email.clone()
    } else {
        format!("{} <{}>", addr.name, addr.email)
    };
    formatted
        .parse()
        .map_err(|_| SyncError::other(format!("invalid address: {}", addr.email)))
}

/// Assemble the MIME message for a draft. `body_html` may differ from the
/// draft's stored body for per-recipient sends; `recipients_override`
/// restricts the envelope to a single recipient in that mode.
pub fn build_mime(
    draft: &Message,
    body_html: &str,
    recipients_override: Option<&EmailAddress>,
    config: &Config,
) -> SyncResult<lettre::Message> {
    let from = draft
        .from
        .first()
        .ok_or_else(|| SyncError::other("draft has no sender"))?;

    let mut builder = lettre::Message::builder()
        .from(to_mailbox(from)?)
        .subject(draft.subject.clone())
        .message_id(Some(draft.header_message_id.clone()))
        .user_agent("Mailspring".to_string());

    if let Some(single) = recipients_override {
        builder = builder.to(to_mailbox(single)?);
    } else {
        for addr in &draft.to {
            builder = builder.to(to_mailbox(addr)?);
        }
        for addr in &draft.cc {
            builder = builder.cc(to_mailbox(addr)?);
        }
        for addr in &draft.bcc {
            builder = builder.bcc(to_mailbox(addr)?);
        }
    }
    for addr in &draft.reply_to {
        builder = builder.reply_to(to_mailbox(addr)?);
    }
    if let Some(reply_to_id) = &draft.reply_to_header_message_id {
        builder = builder
            .in_reply_to(reply_to_id.clone())
            .references(reply_to_id.clone());
    }

    let html_part = SinglePart::html(body_html.to_string());
    let message = if draft.files.is_empty() {
        builder
            .multipart(MultiPart::alternative().singlepart(html_part))
            .map_err(|e| SyncError::other(e.to_string()))?
    } else {
        let mut inline_parts: Vec<SinglePart> = Vec::new();
        let mut attachment_parts: Vec<SinglePart> = Vec::new();
        for file in &draft.files {
            let path = config
                .file_container_path(&file.id)
                .join(file.safe_filename());
            let bytes = std::fs::read(&path).map_err(|e| {
                SyncError::other(format!("attachment missing: {}: {}", path.display(), e))
            })?;
            let content_type = ContentType::parse(&file.content_type)
                .unwrap_or(ContentType::parse("application/octet-stream").unwrap());
            match &file.content_id {
                Some(cid) => inline_parts
                    .push(Attachment::new_inline(cid.clone()).body(bytes, content_type)),
                None => attachment_parts
                    .push(Attachment::new(file.filename.clone()).body(bytes, content_type)),
            }
        }

        let mut related = MultiPart::related().singlepart(html_part);
        for part in inline_parts {
            related = related.singlepart(part);
        }
        let multipart = if attachment_parts.is_empty() {
            related
        } else {
            let mut mixed = MultiPart::mixed().multipart(related);
            for part in attachment_parts {
                mixed = mixed.singlepart(part);
            }
            mixed
        };
        builder
            .multipart(multipart)
            .map_err(|e| SyncError::other(e.to_string()))?
    };
    Ok(message)
}

/// Send one assembled message; wraps transport errors in the engine's
/// error type.
pub async fn send(transport: &SmtpTransport, message: lettre::Message) -> SyncResult<()> {
    info!("delivering message via SMTP");
    transport.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> Message {
        Message {
            id: "d1".into(),
            account_id: "a1".into(),
            version: 0,
            header_message_id: "<m1@x>".into(),
            subject: "Hello".into(),
            date: 0,
            from: vec![EmailAddress {
                name: "Ana".into(),
                email: "ana@example.com".into(),
            }],
            to: vec![EmailAddress {
                name: "".into(),
                email: "bo@example.com".into(),
            }],
            cc: vec![],
            bcc: vec![],
            reply_to: vec![],
            g_msg_id: String::new(),
            unread: false,
            starred: false,
            draft: true,
            remote_uid: 0,
            remote_folder_id: String::new(),
            remote_xgm_labels: vec![],
            client_folder_id: String::new(),
            thread_id: String::new(),
            snippet: String::new(),
            files: vec![],
            synced_at: 0,
            sync_unsaved_changes: 0,
            reply_to_header_message_id: Some("<m0@x>".into()),
            hidden: false,
        }
    }

    #[test]
    fn mime_carries_message_id_and_references() {
        let config = Config {
            config_dir: std::env::temp_dir(),
            identity_server: "https://id.example.com".into(),
        };
        let message = build_mime(&draft(), "<p>Hi</p>", None, &config).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("Message-ID"));
        assert!(formatted.contains("m1@x"));
        assert!(formatted.contains("In-Reply-To"));
        assert!(formatted.contains("Subject: Hello"));
    }

    #[test]
    fn recipient_override_restricts_envelope() {
        let config = Config {
            config_dir: std::env::temp_dir(),
            identity_server: "https://id.example.com".into(),
        };
        let target = EmailAddress {
            name: "".into(),
            email: "cy@example.com".into(),
        };
        let message = build_mime(&draft(), "<p>custom</p>", Some(&target), &config).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("cy@example.com"));
        assert!(!formatted.contains("bo@example.com"));
    }
}
