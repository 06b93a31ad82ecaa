//! Process and account configuration
//!
//! The engine is launched by the parent UI process with two environment
//! variables and receives the account (and identity) as JSON on stdin.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process-level configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for the store, attachments, and logs. Must exist and
    /// be writable.
    pub config_dir: PathBuf,
    /// Base URL of the identity service.
    pub identity_server: String,
}

impl Config {
    pub fn from_env() -> SyncResult<Self> {
        let config_dir = std::env::var("CONFIG_DIR_PATH")
            .map_err(|_| SyncError::other("CONFIG_DIR_PATH is required"))?;
        let identity_server = std::env::var("IDENTITY_SERVER")
            .map_err(|_| SyncError::other("IDENTITY_SERVER is required"))?;

        let config_dir = PathBuf::from(config_dir);
        if !config_dir.is_dir() {
            return Err(SyncError::other(format!(
                "CONFIG_DIR_PATH does not exist: {}",
                config_dir.display()
            )));
        }
        Ok(Self {
            config_dir,
            identity_server,
        })
    }

    pub fn database_path(&self, account_id: &str) -> PathBuf {
        self.config_dir.join(format!("edgehill-{}.db", account_id))
    }

    /// Attachment blobs fan out by the first four hex characters of the
    /// file id: `files/<aa>/<bb>/<id>/<safeFilename>`.
    pub fn file_container_path(&self, file_id: &str) -> PathBuf {
        let aa = file_id.get(0..2).unwrap_or("00");
        let bb = file_id.get(2..4).unwrap_or("00");
        self.config_dir.join("files").join(aa).join(bb).join(file_id)
    }
}

/// Security mode for a mail endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionSecurity {
    Ssl,
    Starttls,
    None,
}

impl Default for ConnectionSecurity {
    fn default() -> Self {
        ConnectionSecurity::Ssl
    }
}

/// Per-endpoint connection settings supplied by the parent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountSettings {
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_username: String,
    #[serde(default)]
    pub imap_password: String,
    #[serde(default)]
    pub imap_security: Option<ConnectionSecurity>,
    #[serde(default)]
    pub imap_allow_insecure_ssl: bool,

    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default)]
    pub smtp_security: Option<ConnectionSecurity>,
    #[serde(default)]
    pub smtp_allow_insecure_ssl: bool,

    /// OAuth refresh token; presence selects XOAUTH2 over password auth.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub refresh_client_id: Option<String>,
}

/// The account under sync. Supplied by the parent, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub provider: String,
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    pub settings: AccountSettings,
    /// Server-side subtree for app-owned folders; defaults per provider.
    #[serde(default, rename = "containerFolder")]
    pub container_folder: Option<String>,
}

impl Account {
    /// Returns the name of the first missing required field, or None.
    pub fn validate(&self) -> Option<&'static str> {
        let s = &self.settings;
        if s.refresh_token.is_none() && s.imap_password.is_empty() {
            return Some("imap_password or refresh_token");
        }
        if s.refresh_token.is_none() && s.smtp_password.is_empty() {
            return Some("smtp_password or refresh_token");
        }
        if s.imap_host.is_empty() || s.imap_username.is_empty() || s.imap_port == 0 {
            return Some("imap configuration");
        }
        if s.smtp_host.is_empty() || s.smtp_username.is_empty() || s.smtp_port == 0 {
            return Some("smtp configuration");
        }
        None
    }

    pub fn is_gmail(&self) -> bool {
        self.provider == "gmail"
    }

    pub fn uses_oauth(&self) -> bool {
        self.settings.refresh_token.is_some()
    }

    /// The server-side subtree under which app-owned folders (Snoozed)
    /// live. Gmail-style hosts use the bracketed form.
    pub fn container_folder_name(&self) -> String {
        if let Some(name) = &self.container_folder {
            return name.clone();
        }
        if self.is_gmail() {
            "[Mailspring]".to_string()
        } else {
            "Mailspring".to_string()
        }
    }

    pub fn quirks(&self) -> &'static ProviderQuirks {
        ProviderQuirks::for_host(&self.settings.imap_host)
    }
}

/// The identity record used as HTTP basic auth against the identity
/// service. Supplied by the parent alongside the account.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Identity {
    pub id: String,
    pub token: String,
}

/// Provider-specific behavioral quirks, keyed off the IMAP host suffix.
/// Hard-coded provider fingerprints in worker logic route through this
/// table instead.
#[derive(Debug, Clone)]
pub struct ProviderQuirks {
    /// Matched against the end of the IMAP hostname.
    pub host_suffixes: &'static [&'static str],
    /// Sent-folder placement can lag the SMTP transaction; probe this many
    /// times with doubling delays before APPENDing a copy ourselves.
    pub sent_folder_probe_attempts: u32,
    /// Some servers refuse `STORE` over unbounded UID ranges; chunk the
    /// expunge sweep at this many UIDs per request.
    pub expunge_chunk: u32,
    /// DAV discovery on this provider redirects `.well-known` to a generic
    /// webmail page; treat it as a dead end and probe the root instead.
    pub well_known_is_dead_end: bool,
}

static DEFAULT_QUIRKS: ProviderQuirks = ProviderQuirks {
    host_suffixes: &[],
    sent_folder_probe_attempts: 4,
    expunge_chunk: 50_000,
    well_known_is_dead_end: false,
};

static PROVIDER_QUIRKS: &[ProviderQuirks] = &[
    ProviderQuirks {
        host_suffixes: &["yahoo.com", "aol.com"],
        sent_folder_probe_attempts: 6,
        expunge_chunk: 50_000,
        well_known_is_dead_end: true,
    },
    ProviderQuirks {
        host_suffixes: &["office365.com", "outlook.com"],
        sent_folder_probe_attempts: 6,
        expunge_chunk: 50_000,
        well_known_is_dead_end: false,
    },
    ProviderQuirks {
        host_suffixes: &["yandex.com", "yandex.ru"],
        sent_folder_probe_attempts: 4,
        expunge_chunk: 10_000,
        well_known_is_dead_end: true,
    },
];

impl ProviderQuirks {
    pub fn for_host(host: &str) -> &'static ProviderQuirks {
        let host = host.to_ascii_lowercase();
        PROVIDER_QUIRKS
            .iter()
            .find(|q| q.host_suffixes.iter().any(|s| host.ends_with(s)))
            .unwrap_or(&DEFAULT_QUIRKS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_json() -> serde_json::Value {
        serde_json::json!({
            "id": "a1",
            "provider": "gmail",
            "emailAddress": "user@example.com",
            "settings": {
                "imap_host": "imap.gmail.com",
                "imap_port": 993,
                "imap_username": "user@example.com",
                "smtp_host": "smtp.gmail.com",
                "smtp_port": 465,
                "smtp_username": "user@example.com",
                "refresh_token": "tok"
            }
        })
    }

    #[test]
    fn account_parses_and_validates() {
        let account: Account = serde_json::from_value(account_json()).unwrap();
        assert!(account.validate().is_none());
        assert!(account.uses_oauth());
        assert_eq!(account.container_folder_name(), "[Mailspring]");
    }

    #[test]
    fn missing_password_is_reported() {
        let mut v = account_json();
        v["settings"]["refresh_token"] = serde_json::Value::Null;
        let v = {
            v["settings"]
                .as_object_mut()
                .unwrap()
                .remove("refresh_token");
            v
        };
        let account: Account = serde_json::from_value(v).unwrap();
        assert_eq!(account.validate(), Some("imap_password or refresh_token"));
    }

    #[test]
    fn quirks_match_host_suffix() {
        let q = ProviderQuirks::for_host("imap.mail.yahoo.com");
        assert!(q.well_known_is_dead_end);
        let q = ProviderQuirks::for_host("imap.example.org");
        assert!(!q.well_known_is_dead_end);
        assert_eq!(q.sent_folder_probe_attempts, 4);
    }
}
