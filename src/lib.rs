//! Mailsync engine
//!
//! The native synchronization engine behind the desktop mail client. For
//! one account it maintains a local queryable mirror of the mailbox
//! (folders, threads, messages, bodies, attachments) plus address books,
//! calendars, and events across IMAP, CardDAV, CalDAV, and SMTP, and
//! streams incremental deltas to the parent UI process as line-delimited
//! JSON on stdout.

pub mod backoff;
pub mod config;
pub mod dav;
pub mod delta;
pub mod dispatcher;
pub mod error;
pub mod imap;
pub mod metadata;
pub mod models;
pub mod oauth;
pub mod processor;
pub mod smtp;
pub mod store;
pub mod tasks;
pub mod util;

pub use config::{Account, Config, Identity};
pub use delta::{DeltaStream, DeltaStreamItem};
pub use error::{SyncError, SyncResult};
pub use store::{MailStore, Query};
