//! Plugin metadata synchronization
//!
//! A long-poll streaming worker ingests metadata deltas from the identity
//! service, and a per-account expiration worker emits deadline events when
//! metadata expires.

pub mod expiration;
pub mod stream;

pub use expiration::{ExpirationWaker, MetadataExpirationWorker};
pub use stream::MetadataStreamWorker;
