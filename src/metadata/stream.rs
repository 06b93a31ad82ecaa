//! Metadata stream worker
//!
//! One long-poll HTTP connection to the identity service, cursor-based.
//! On first run it snapshots a head cursor, backfills existing metadata in
//! pages, and only then opens the streaming channel. The stream is
//! chunked newline-delimited JSON with lone-`\n` heartbeats.

use super::expiration::ExpirationWaker;
use crate::backoff::{Backoff, Policy};
use crate::config::{Account, Config, Identity};
use crate::error::{SyncError, SyncResult};
use crate::models::{Contact, DetachedMetadata, Message, Metadata, Thread};
use crate::store::{MailStore, Query};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const BACKFILL_PAGE_SIZE: usize = 500;
/// The server heartbeats every ~10 s; silence for this long means the
/// connection is dead.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct MetadataStreamWorker {
    store: Arc<MailStore>,
    account: Arc<Account>,
    config: Arc<Config>,
    identity: Identity,
    waker: Arc<ExpirationWaker>,
    http: reqwest::Client,
    cursor: String,
}

impl MetadataStreamWorker {
    pub fn new(
        store: Arc<MailStore>,
        account: Arc<Account>,
        config: Arc<Config>,
        identity: Identity,
        waker: Arc<ExpirationWaker>,
    ) -> Self {
        MetadataStreamWorker {
            store,
            account,
            config,
            identity,
            waker,
            http: reqwest::Client::new(),
            cursor: String::new(),
        }
    }

    fn cursor_key(&self) -> String {
        format!("cursor-{}", self.account.id)
    }

    pub async fn run(mut self) {
        if self.identity.token.is_empty() {
            info!("metadata sync disabled, not logged in");
            return;
        }
        self.cursor = self
            .store
            .get_kv(&self.cursor_key())
            .await
            .ok()
            .flatten()
            .unwrap_or_default();

        let mut backoff = Backoff::new(Policy::metadata_stream());
        loop {
            let result: SyncResult<()> = async {
                // No cursor yet: snapshot "now", then page through all
                // existing metadata. By the time the backfill finishes the
                // snapshot is stale but inclusive of everything since the
                // start.
                if self.cursor.is_empty() {
                    self.fetch_delta_cursor().await?;
                    let mut page = 0;
                    while self.fetch_metadata_page(page).await? {
                        page += 1;
                    }
                }
                self.stream_deltas().await
            }
            .await;

            match result {
                Ok(()) => {
                    // Stream closed cleanly; reconnect immediately.
                    backoff.reset();
                }
                Err(err) if err.is_retryable() => {
                    let delay = backoff.next_delay();
                    info!(error = %err, retry_in = ?delay, "metadata stream interrupted");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(error = %err, "metadata stream hit a non-retryable error");
                    std::process::abort();
                }
            }
        }
    }

    async fn identity_get(&self, path: &str) -> SyncResult<Value> {
        let url = format!("{}{}", self.config.identity_server, path);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.identity.token, Some(""))
            .send()
            .await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(SyncError::rejected(status, format!("GET {}", path)));
        }
        Ok(response.json().await?)
    }

    async fn fetch_delta_cursor(&mut self) -> SyncResult<()> {
        let head = self
            .identity_get(&format!("/deltas/{}/head", self.account.id))
            .await?;
        let cursor = match head.get("cursor") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => {
                return Err(SyncError::connection(
                    "/deltas/head did not return a cursor",
                ))
            }
        };
        self.set_cursor(cursor).await
    }

    async fn set_cursor(&mut self, cursor: String) -> SyncResult<()> {
        self.cursor = cursor;
        self.store.set_kv(&self.cursor_key(), &self.cursor).await
    }

    /// Returns true while more pages remain.
    async fn fetch_metadata_page(&mut self, page: usize) -> SyncResult<bool> {
        let path = format!(
            "/metadata/{}?limit={}&offset={}",
            self.account.id,
            BACKFILL_PAGE_SIZE,
            BACKFILL_PAGE_SIZE * page
        );
        let body = self.identity_get(&path).await?;
        let entries = body.as_array().cloned().unwrap_or_default();
        debug!(page, count = entries.len(), "metadata backfill page");
        for entry in &entries {
            self.apply_metadata_json(entry).await?;
        }
        Ok(entries.len() == BACKFILL_PAGE_SIZE)
    }

    async fn stream_deltas(&mut self) -> SyncResult<()> {
        let url = format!(
            "{}/deltas/{}/streaming?p={}&ih={}&cursor={}",
            self.config.identity_server,
            self.account.id,
            std::env::consts::OS,
            urlencoding::encode(&self.account.settings.imap_host),
            self.cursor,
        );
        info!("metadata delta stream starting");
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.identity.token, Some(""))
            .send()
            .await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(SyncError::rejected(status, "delta stream rejected"));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        loop {
            let chunk = match tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()).await {
                Err(_) => {
                    info!("metadata delta stream timed out");
                    return Ok(());
                }
                Ok(None) => {
                    info!("metadata delta stream closed");
                    return Ok(());
                }
                Ok(Some(Err(err))) => return Err(err.into()),
                Ok(Some(Ok(chunk))) => chunk,
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                if line.is_empty() {
                    continue; // heartbeat
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(delta) => self.on_delta(&delta).await?,
                    Err(err) => {
                        warn!(error = %err, "invalid JSON in server delta stream");
                    }
                }
            }
        }
    }

    async fn on_delta(&mut self, delta: &Value) -> SyncResult<()> {
        let class = delta.get("object").and_then(Value::as_str).unwrap_or("");
        if class != "metadata" {
            debug!(class, "delta of unexpected type");
            return Ok(());
        }
        if let Some(attributes) = delta.get("attributes") {
            self.apply_metadata_json(attributes).await?;
        }
        if let Some(cursor) = delta.get("cursor") {
            let cursor = match cursor {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => return Ok(()),
            };
            self.set_cursor(cursor).await?;
        }
        Ok(())
    }

    /// Version-gated upsert. Metadata for an object we don't have yet is
    /// parked in the detached side table and attached on that object's
    /// first save.
    pub async fn apply_metadata_json(&self, json: &Value) -> SyncResult<()> {
        let object_id = json
            .get("object_id")
            .or_else(|| json.get("objectId"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let object_type = json
            .get("object_type")
            .or_else(|| json.get("objectType"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let plugin_id = json
            .get("plugin_id")
            .or_else(|| json.get("pluginId"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let version = json.get("version").and_then(Value::as_i64).unwrap_or(0);
        let value = json.get("value").cloned().unwrap_or(Value::Null);
        let expiration = value
            .get("expiration")
            .and_then(Value::as_i64)
            .unwrap_or(0);

        if object_id.is_empty() || plugin_id.is_empty() {
            return Ok(());
        }
        debug!(version, object = %object_id, object_type = %object_type, "received metadata");

        let model_exists = self.model_exists(&object_type, &object_id).await?;

        let mut tx = self.store.begin().await?;
        if model_exists {
            let existing = tx
                .find::<Metadata>(
                    Query::new()
                        .equal("accountId", self.account.id.as_str())
                        .equal("objectId", object_id.as_str())
                        .equal("pluginId", plugin_id.as_str()),
                )
                .await?;
            if let Some(existing) = &existing {
                if version <= existing.version {
                    debug!(
                        incoming = version,
                        stored = existing.version,
                        "metadata version not newer, rejecting"
                    );
                    tx.commit().await?;
                    return Ok(());
                }
            }
            let mut metadata = existing.unwrap_or(Metadata {
                id: format!("{}-{}", object_id, plugin_id),
                account_id: self.account.id.clone(),
                version: 0,
                plugin_id,
                object_id,
                object_type,
                value: Value::Null,
                expiration: 0,
            });
            // The save bumps version by one; land exactly on the stream's
            // version so the gate compares server versions.
            metadata.version = version - 1;
            metadata.value = value;
            metadata.expiration = expiration;
            tx.save(&mut metadata).await?;
        } else {
            let mut detached = tx
                .find::<DetachedMetadata>(
                    Query::new()
                        .equal("accountId", self.account.id.as_str())
                        .equal("objectId", object_id.as_str())
                        .equal("pluginId", plugin_id.as_str()),
                )
                .await?
                .unwrap_or(DetachedMetadata {
                    id: DetachedMetadata::attach_key(&self.account.id, &object_id, &plugin_id),
                    account_id: self.account.id.clone(),
                    version: 0,
                    plugin_id,
                    object_id,
                    object_type,
                    value: Value::Null,
                    expiration: 0,
                });
            detached.version = version - 1;
            detached.value = value;
            detached.expiration = expiration;
            tx.save_silent(&mut detached).await?;
        }
        tx.commit().await?;

        self.waker.note_saved_expiration(expiration);
        Ok(())
    }

    async fn model_exists(&self, object_type: &str, object_id: &str) -> SyncResult<bool> {
        let query = Query::new()
            .equal("accountId", self.account.id.as_str())
            .equal("id", object_id);
        Ok(match object_type {
            "message" => self.store.count::<Message>(query).await? > 0,
            "thread" => self.store.count::<Thread>(query).await? > 0,
            "contact" => self.store.count::<Contact>(query).await? > 0,
            _ => false,
        })
    }
}
