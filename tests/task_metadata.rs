//! Task performLocal semantics and metadata stream ingestion

mod common;

use common::{account, config, identity, open_store};
use mailsync::imap::FetchedMessage;
use mailsync::metadata::{ExpirationWaker, MetadataStreamWorker};
use mailsync::models::{Folder, Message, Metadata, Task, TaskStatus, Thread};
use mailsync::processor::MailProcessor;
use mailsync::store::Query;
use mailsync::tasks::TaskProcessor;
use serde_json::json;
use std::sync::Arc;

fn fetched(uid: u32, message_id: &str, subject: &str) -> FetchedMessage {
    let header = format!(
        "Date: Tue, 01 Aug 2023 10:00:00 +0000\r\n\
         Subject: {}\r\n\
         Message-ID: {}\r\n\
         From: Ana <ana@example.com>\r\n\
         To: Bo <bo@example.com>\r\n\r\n",
        subject, message_id
    );
    FetchedMessage {
        uid,
        flags: vec![],
        gm_labels: None,
        gm_msgid: None,
        gm_thrid: None,
        modseq: None,
        header: Some(header.into_bytes()),
    }
}

fn task(cname: &str, data: serde_json::Value) -> Task {
    Task {
        id: format!("task-{}", cname),
        account_id: "acct-1".to_string(),
        version: 0,
        constructor_name: cname.to_string(),
        status: TaskStatus::Local,
        data,
        error: None,
        should_cancel: false,
    }
}

#[tokio::test]
async fn change_unread_locks_messages_and_updates_threads() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _stream, _output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));
    let tasks = TaskProcessor::new(store.clone(), account(), config(&dir));

    let mut folder = Folder::new("acct-1", "INBOX", '/');
    folder.role = "inbox".to_string();
    store.save(&mut folder).await.unwrap();
    processor
        .ingest_heavy(&folder, &[fetched(5, "<m1@x>", "Subject")])
        .await
        .unwrap();

    let message: Message = store
        .find(Query::new().equal("remoteUID", 5u32))
        .await
        .unwrap()
        .unwrap();
    assert!(message.unread);

    let mut change = task(
        "ChangeUnreadTask",
        json!({"unread": false, "messageIds": [message.id]}),
    );
    tasks.perform_local(&mut change).await.unwrap();
    assert_eq!(change.status, TaskStatus::Remote);

    let updated: Message = store.find_by_id(&message.id).await.unwrap().unwrap();
    assert!(!updated.unread);
    assert_eq!(updated.sync_unsaved_changes, 1);
    assert!(updated.synced_at > mailsync::util::now_secs() + 23 * 60 * 60);

    let thread: Thread = store.find_by_id(&updated.thread_id).await.unwrap().unwrap();
    assert_eq!(thread.unread, 0);

    // The persisted task record survives for the remote phase.
    let stored: Task = store.find_by_id(&change.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Remote);
}

#[tokio::test]
async fn change_folder_reassigns_client_folder_only() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _stream, _output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));
    let tasks = TaskProcessor::new(store.clone(), account(), config(&dir));

    let mut inbox = Folder::new("acct-1", "INBOX", '/');
    inbox.role = "inbox".to_string();
    store.save(&mut inbox).await.unwrap();
    let mut archive = Folder::new("acct-1", "Archive", '/');
    archive.role = "archive".to_string();
    store.save(&mut archive).await.unwrap();

    processor
        .ingest_heavy(&inbox, &[fetched(5, "<m1@x>", "Move me")])
        .await
        .unwrap();
    let message: Message = store
        .find(Query::new().equal("remoteUID", 5u32))
        .await
        .unwrap()
        .unwrap();

    let mut change = task(
        "ChangeFolderTask",
        json!({"folder": {"id": archive.id, "path": "Archive"}, "messageIds": [message.id]}),
    );
    tasks.perform_local(&mut change).await.unwrap();

    let updated: Message = store.find_by_id(&message.id).await.unwrap().unwrap();
    // The user-visible folder moves immediately; the remote linkage only
    // changes when performRemote's MOVE lands.
    assert_eq!(updated.client_folder_id, archive.id);
    assert_eq!(updated.remote_folder_id, inbox.id);
    assert_eq!(updated.sync_unsaved_changes, 1);
}

#[tokio::test]
async fn crash_leftover_local_tasks_are_purged() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _stream, _output) = open_store(&dir).await;
    let tasks = TaskProcessor::new(store.clone(), account(), config(&dir));

    let mut stuck = task("ChangeUnreadTask", json!({"unread": true}));
    stuck.status = TaskStatus::Local;
    store.save(&mut stuck).await.unwrap();

    tasks.cleanup_tasks_after_launch().await.unwrap();
    assert!(store.find_by_id::<Task>(&stuck.id).await.unwrap().is_none());
}

#[tokio::test]
async fn role_mapping_keeps_roles_unique_per_account() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _stream, _output) = open_store(&dir).await;
    let tasks = TaskProcessor::new(store.clone(), account(), config(&dir));

    let mut old_archive = Folder::new("acct-1", "Old Archive", '/');
    old_archive.role = "archive".to_string();
    store.save(&mut old_archive).await.unwrap();
    let mut new_archive = Folder::new("acct-1", "2024/Archive", '/');
    store.save(&mut new_archive).await.unwrap();

    let mut change = task(
        "ChangeRoleMappingTask",
        json!({"role": "archive", "path": "2024/Archive"}),
    );
    tasks.perform_local(&mut change).await.unwrap();
    assert_eq!(change.status, TaskStatus::Remote);

    let holders: Vec<Folder> = store
        .find_all(
            Query::new()
                .equal("accountId", "acct-1")
                .equal("role", "archive"),
        )
        .await
        .unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].path, "2024/Archive");
}

#[tokio::test]
async fn cancelled_tasks_skip_their_remote_phase() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _stream, _output) = open_store(&dir).await;
    let tasks = TaskProcessor::new(store.clone(), account(), config(&dir));

    let mut change = task("GetMessageRFC2822Task", json!({"messageId": "nope"}));
    tasks.perform_local(&mut change).await.unwrap();
    tasks.cancel(&change.id).await.unwrap();

    let stored: Task = store.find_by_id(&change.id).await.unwrap().unwrap();
    assert!(stored.should_cancel);
}

#[tokio::test]
async fn metadata_stream_rejects_stale_versions() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _stream, _output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));

    let mut folder = Folder::new("acct-1", "INBOX", '/');
    store.save(&mut folder).await.unwrap();
    processor
        .ingest_heavy(&folder, &[fetched(5, "<m1@x>", "Tracked")])
        .await
        .unwrap();
    let message: Message = store
        .find(Query::new().equal("remoteUID", 5u32))
        .await
        .unwrap()
        .unwrap();

    let waker = Arc::new(ExpirationWaker::default());
    let worker = MetadataStreamWorker::new(store.clone(), account(), config(&dir), identity(), waker);

    // Deltas arrive as v1, v2, v1 (stale), v3.
    for version in [1i64, 2, 1, 3] {
        worker
            .apply_metadata_json(&json!({
                "objectId": message.id,
                "objectType": "message",
                "pluginId": "reminders",
                "version": version,
                "value": {"seen": version},
            }))
            .await
            .unwrap();
    }

    let stored: Metadata = store
        .find(
            Query::new()
                .equal("objectId", message.id.as_str())
                .equal("pluginId", "reminders"),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(stored.value["seen"], 3);
}

#[tokio::test]
async fn detached_metadata_attaches_on_first_save() {
    let dir = tempfile::tempdir().unwrap();
    let (store, stream, output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));

    let mut folder = Folder::new("acct-1", "INBOX", '/');
    store.save(&mut folder).await.unwrap();

    // Metadata arrives for a message the engine hasn't synced yet; we can
    // predict its id because the hash is deterministic.
    let parts = mailsync::util::MessageIdParts {
        date: mailparse::dateparse("Tue, 01 Aug 2023 10:00:00 +0000").unwrap(),
        subject: "Future",
        recipient_emails: vec!["bo@example.com".to_string()],
        header_message_id: "<m9@x>",
    };
    let future_id = mailsync::util::id_for_message("acct-1", "INBOX", 77, &parts);

    let waker = Arc::new(ExpirationWaker::default());
    let worker = MetadataStreamWorker::new(store.clone(), account(), config(&dir), identity(), waker);
    worker
        .apply_metadata_json(&json!({
            "objectId": future_id,
            "objectType": "message",
            "pluginId": "reminders",
            "version": 4,
            "value": {"remindAt": 12345},
        }))
        .await
        .unwrap();

    // Parked, not yet attached.
    assert!(store
        .find::<Metadata>(Query::new().equal("objectId", future_id.as_str()))
        .await
        .unwrap()
        .is_none());

    // The message lands; the parked metadata attaches on its first save.
    processor
        .ingest_heavy(&folder, &[fetched(77, "<m9@x>", "Future")])
        .await
        .unwrap();

    let attached: Metadata = store
        .find(Query::new().equal("objectId", future_id.as_str()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attached.plugin_id, "reminders");
    assert_eq!(attached.version, 4);
    assert_eq!(attached.value["remindAt"], 12345);

    let metadata_deltas = output.deltas_of_type(&stream, "persist", "Metadata");
    assert_eq!(metadata_deltas.len(), 1);
}

#[tokio::test]
async fn syncback_metadata_task_upserts_locally() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _stream, _output) = open_store(&dir).await;
    let tasks = TaskProcessor::new(store.clone(), account(), config(&dir));

    let mut change = task(
        "SyncbackMetadataTask",
        json!({
            "modelId": "m-1",
            "modelClassName": "message",
            "pluginId": "snooze",
            "value": {"expiration": 9999999999i64},
        }),
    );
    tasks.perform_local(&mut change).await.unwrap();
    assert_eq!(change.status, TaskStatus::Remote);

    let stored: Metadata = store
        .find(Query::new().equal("objectId", "m-1").equal("pluginId", "snooze"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.expiration, 9999999999);
}
