//! Parent-process command dispatcher
//!
//! Reads line-delimited JSON from stdin, applies task `performLocal`
//! phases immediately, and wakes the workers. If stdin goes bad and stays
//! bad for 30 seconds the parent is gone and the process exits 141.

use crate::config::{Account, Config, Identity};
use crate::imap::worker::SyncSignals;
use crate::metadata::ExpirationWaker;
use crate::models::{Task, TaskStatus};
use crate::store::MailStore;
use crate::tasks::TaskProcessor;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

pub const EXIT_PARENT_GONE: i32 = 141;
const PARENT_LOSS_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Dispatcher {
    store: Arc<MailStore>,
    account: Arc<Account>,
    config: Arc<Config>,
    identity: Identity,
    signals: SyncSignals,
    expiration_waker: Arc<ExpirationWaker>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<MailStore>,
        account: Arc<Account>,
        config: Arc<Config>,
        identity: Identity,
        signals: SyncSignals,
        expiration_waker: Arc<ExpirationWaker>,
    ) -> Self {
        Dispatcher {
            store,
            account,
            config,
            identity,
            signals,
            expiration_waker,
        }
    }

    /// Runs until the parent disappears. Returns the process exit code.
    pub async fn run(self) -> i32 {
        let processor = TaskProcessor::with_identity(
            self.store.clone(),
            self.account.clone(),
            self.config.clone(),
            self.identity.clone(),
            None,
        );
        if let Err(err) = processor.cleanup_tasks_after_launch().await {
            warn!(error = %err, "task cleanup after launch failed");
        }

        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        let mut broken_since: Option<std::time::Instant> = None;

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    broken_since = None;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&line) {
                        Ok(packet) => self.handle_packet(&processor, packet).await,
                        Err(err) => warn!(error = %err, "unparseable line from parent"),
                    }
                }
                Ok(None) | Err(_) => {
                    // EOF or read failure. Give the parent a grace window
                    // before concluding it's gone.
                    let since = broken_since.get_or_insert_with(std::time::Instant::now);
                    if since.elapsed() >= PARENT_LOSS_TIMEOUT {
                        error!("parent stdin closed for 30s; exiting");
                        self.store.delta_stream().flush_buffer();
                        return EXIT_PARENT_GONE;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_packet(&self, processor: &TaskProcessor, packet: Value) {
        let packet_type = packet.get("type").and_then(Value::as_str).unwrap_or("");
        match packet_type {
            "queue-task" => {
                let Some(task_json) = packet.get("task") else {
                    warn!("queue-task packet without a task");
                    return;
                };
                let mut task = Task {
                    id: task_json
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    account_id: task_json
                        .get("accountId")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    version: 0,
                    constructor_name: task_json
                        .get("constructorName")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    status: TaskStatus::Local,
                    data: task_json.clone(),
                    error: None,
                    should_cancel: false,
                };
                if task.id.is_empty() {
                    task.id = uuid::Uuid::new_v4().to_string();
                }
                if let Err(err) = processor.perform_local(&mut task).await {
                    error!(task = %task.id, error = %err, "performLocal failed");
                }
                // Metadata saved with an expiration may move the deadline
                // forward.
                if task.constructor_name == "SyncbackMetadataTask" {
                    if let Some(exp) = task.data["value"]["expiration"].as_i64() {
                        self.expiration_waker.note_saved_expiration(exp);
                    }
                }
                // Wake the foreground worker so the remote phase runs now.
                self.signals.idle_interrupt.notify_waiters();
            }
            "cancel-task" => {
                let task_id = packet.get("taskId").and_then(Value::as_str).unwrap_or("");
                if let Err(err) = processor.cancel(task_id).await {
                    warn!(task = task_id, error = %err, "cancel failed");
                }
            }
            "wake-workers" => {
                info!("waking workers at parent request");
                self.signals.wake_workers();
            }
            "need-bodies" => {
                let ids: Vec<String> = packet
                    .get("ids")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                if !ids.is_empty() {
                    self.signals.queue_bodies(ids);
                }
            }
            "test-crash" => {
                error!("parent requested a crash");
                std::process::abort();
            }
            other => warn!(packet_type = other, "unknown packet from parent"),
        }
    }
}
