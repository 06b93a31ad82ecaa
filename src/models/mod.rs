//! Persisted entities
//!
//! Every model serializes to a single JSON `data` column plus a handful of
//! indexed columns declared through the [`Model`] trait. Models are plain
//! values: store hooks receive the store explicitly, and cross-entity
//! relationships (thread ↔ messages) are queries, not references.

pub mod calendar;
pub mod contact;
pub mod event;
pub mod file;
pub mod folder;
pub mod message;
pub mod metadata;
pub mod task;
pub mod thread;

pub use calendar::Calendar;
pub use contact::{Contact, ContactBook, ContactGroup, CONTACT_SOURCE_CARDDAV};
pub use event::Event;
pub use file::File;
pub use folder::{Folder, FolderLocalStatus, Label};
pub use message::{EmailAddress, Message, MessageAttributes};
pub use metadata::{DetachedMetadata, Metadata};
pub use task::{Task, TaskStatus};
pub use thread::Thread;

use serde::{de::DeserializeOwned, Serialize};

/// A value bound into an indexed column.
#[derive(Debug, Clone, PartialEq)]
pub enum Bind {
    Text(String),
    Int(i64),
    Null,
}

/// Capability surface the store needs from a persisted entity.
pub trait Model:
    Serialize + DeserializeOwned + Clone + Send + Sync + Unpin + 'static
{
    /// Physical table name.
    fn table() -> &'static str;

    /// Class name used in `persist` / `unpersist` deltas.
    fn object_class() -> &'static str {
        Self::table()
    }

    fn id(&self) -> &str;
    fn account_id(&self) -> &str;
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);

    /// Indexed columns beyond `id, data, accountId, version`, in bind order.
    fn index_columns() -> &'static [&'static str] {
        &[]
    }

    fn index_values(&self) -> Vec<Bind> {
        Vec::new()
    }

    /// Whether plugin metadata can attach to this model class.
    fn supports_metadata() -> bool {
        false
    }
}
