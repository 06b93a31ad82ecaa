//! Metadata expiration worker
//!
//! Sleeps until the nearest `expiration` timestamp, emits an expiration
//! delta for each expired record, and re-queries for the next deadline.
//! Writers saving metadata with an earlier expiration wake it early.

use crate::delta::{DeltaStreamItem, DELTA_TYPE_METADATA_EXPIRATION};
use crate::error::SyncResult;
use crate::models::{Contact, Message, Metadata, Model, Thread};
use crate::store::{MailStore, Query};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Let plugins finish loading before the first expiration event.
const STARTUP_DELAY: Duration = Duration::from_secs(15);
/// Re-scan at least this often even with no known deadline.
const MAX_SLEEP_SECS: i64 = 2 * 60 * 60;
/// Settle time after a wake so the committing transaction lands first.
const POST_WAKE_SETTLE: Duration = Duration::from_secs(1);

/// Shared wake handle. The wake time is read and written under one lock
/// so the "should I notify?" check can't race the sleeper re-arming it.
#[derive(Default)]
pub struct ExpirationWaker {
    wake_time: Mutex<i64>,
    notify: Notify,
}

impl ExpirationWaker {
    /// Called by writers that just saved metadata expiring at `expiration`.
    pub fn note_saved_expiration(&self, expiration: i64) {
        if expiration <= 0 {
            return;
        }
        let wake_time = self.wake_time.lock();
        if expiration < *wake_time {
            self.notify.notify_waiters();
        } else {
            debug!(
                expiration,
                wake_time = *wake_time,
                "expiration is later than the scheduled wake"
            );
        }
    }
}

pub struct MetadataExpirationWorker {
    store: Arc<MailStore>,
    account_id: String,
    waker: Arc<ExpirationWaker>,
}

impl MetadataExpirationWorker {
    pub fn new(store: Arc<MailStore>, account_id: String, waker: Arc<ExpirationWaker>) -> Self {
        MetadataExpirationWorker {
            store,
            account_id,
            waker,
        }
    }

    pub async fn run(self) {
        tokio::time::sleep(STARTUP_DELAY).await;
        loop {
            let next_wake = match self.scan_and_emit().await {
                Ok(next) => next,
                Err(err) => {
                    warn!(error = %err, "metadata expiration scan failed");
                    crate::util::now_secs() + 60
                }
            };

            {
                let mut wake_time = self.waker.wake_time.lock();
                *wake_time = next_wake;
            }
            let delay = (next_wake - crate::util::now_secs()).max(1) as u64;
            debug!(delay, "sleeping until next metadata expiration");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                _ = self.waker.notify.notified() => {}
            }
            tokio::time::sleep(POST_WAKE_SETTLE).await;
        }
    }

    /// Emit expiration deltas for everything due; returns the unix time of
    /// the next deadline.
    async fn scan_and_emit(&self) -> SyncResult<i64> {
        let now = crate::util::now_secs();
        let expired: Vec<Metadata> = self
            .store
            .find_all(
                Query::new()
                    .equal("accountId", self.account_id.as_str())
                    .gt("expiration", 0i64)
                    .lte("expiration", now),
            )
            .await?;

        let mut emitted = 0usize;
        for chunk in expired.chunks(100) {
            for metadata in chunk {
                if let Some(json) = self.model_json_for(metadata).await? {
                    info!(
                        object = %metadata.object_id,
                        object_type = %metadata.object_type,
                        "metadata expired"
                    );
                    self.store.delta_stream().emit(
                        DeltaStreamItem::with_json(
                            DELTA_TYPE_METADATA_EXPIRATION,
                            &object_class_for(&metadata.object_type),
                            json,
                        ),
                        Duration::from_millis(500),
                    );
                    emitted += 1;
                }
            }
            if chunk.len() == 100 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        let upcoming: Vec<Metadata> = self
            .store
            .find_all_ordered(
                Query::new()
                    .equal("accountId", self.account_id.as_str())
                    .gt("expiration", now),
                "expiration ASC",
                Some(1),
            )
            .await?;
        let mut next = upcoming
            .first()
            .map(|m| m.expiration)
            .unwrap_or(now + MAX_SLEEP_SECS);

        // After emitting, hold off a little so the client has time to
        // clear the metadata; otherwise we'd re-send on the next pass.
        let min_delay = if emitted > 0 { 15 } else { 5 };
        if next < now + min_delay {
            next = now + min_delay;
        }
        Ok(next)
    }

    async fn model_json_for(&self, metadata: &Metadata) -> SyncResult<Option<serde_json::Value>> {
        let json = match metadata.object_type.as_str() {
            "message" => self
                .store
                .find_by_id::<Message>(&metadata.object_id)
                .await?
                .map(|m| serde_json::to_value(&m))
                .transpose()?,
            "thread" => self
                .store
                .find_by_id::<Thread>(&metadata.object_id)
                .await?
                .map(|t| serde_json::to_value(&t))
                .transpose()?,
            "contact" => self
                .store
                .find_by_id::<Contact>(&metadata.object_id)
                .await?
                .map(|c| serde_json::to_value(&c))
                .transpose()?,
            _ => None,
        };
        // Attach the metadata payload so the client knows which plugin's
        // deadline fired.
        Ok(json.map(|mut value| {
            value["metadata"] = serde_json::json!([{
                "pluginId": metadata.plugin_id,
                "value": metadata.value,
                "version": metadata.version,
            }]);
            value
        }))
    }
}

fn object_class_for(object_type: &str) -> String {
    match object_type {
        "message" => Message::object_class().to_string(),
        "thread" => Thread::object_class().to_string(),
        "contact" => Contact::object_class().to_string(),
        other => other.to_string(),
    }
}
