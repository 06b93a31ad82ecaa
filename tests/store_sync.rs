//! Store and reconciliation behavior against a real on-disk database

mod common;

use common::{account, config, open_store};
use mailsync::imap::FetchedMessage;
use mailsync::models::message::unlink_uid_for_phase;
use mailsync::models::{Folder, Message, Thread};
use mailsync::processor::MailProcessor;
use mailsync::store::Query;

fn fetched(uid: u32, message_id: &str, subject: &str, seen: bool) -> FetchedMessage {
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
        flags: if seen {
            vec!["\\Seen".to_string()]
        } else {
            vec![]
        },
        gm_labels: None,
        gm_msgid: None,
        gm_thrid: None,
        modseq: None,
        header: Some(header.into_bytes()),
    }
}

async fn seeded_inbox(store: &std::sync::Arc<mailsync::MailStore>) -> Folder {
    let mut folder = Folder::new("acct-1", "INBOX", '/');
    folder.role = "inbox".to_string();
    store.save(&mut folder).await.unwrap();
    folder
}

#[tokio::test]
async fn save_increments_version_and_emits_persist_delta() {
    let dir = tempfile::tempdir().unwrap();
    let (store, stream, output) = open_store(&dir).await;

    let mut folder = Folder::new("acct-1", "INBOX", '/');
    assert_eq!(folder.version, 0);
    store.save(&mut folder).await.unwrap();
    assert_eq!(folder.version, 1);
    store.save(&mut folder).await.unwrap();
    assert_eq!(folder.version, 2);

    let reloaded: Folder = store.find_by_id(&folder.id).await.unwrap().unwrap();
    assert_eq!(reloaded.version, 2);
    assert_eq!(reloaded.path, "INBOX");

    let deltas = output.deltas_of_type(&stream, "persist", "Folder");
    assert_eq!(deltas.len(), 1); // coalesced: one id appears once per flush
    assert_eq!(deltas[0]["modelJSONs"][0]["id"], folder.id);
}

#[tokio::test]
async fn rollback_discards_writes_and_deltas() {
    let dir = tempfile::tempdir().unwrap();
    let (store, stream, output) = open_store(&dir).await;

    let mut folder = Folder::new("acct-1", "Dropped", '/');
    {
        let mut tx = store.begin().await.unwrap();
        tx.save(&mut folder).await.unwrap();
        // dropped without commit
    }
    assert!(store
        .find_by_id::<Folder>(&folder.id)
        .await
        .unwrap()
        .is_none());
    assert!(output.deltas(&stream).is_empty());
}

#[tokio::test]
async fn ingest_creates_messages_and_threads() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _stream, _output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));
    let folder = seeded_inbox(&store).await;

    let created = processor
        .ingest_heavy(
            &folder,
            &[
                fetched(10, "<m1@x>", "Hello", false),
                fetched(11, "<m2@x>", "Other", true),
            ],
        )
        .await
        .unwrap();
    assert_eq!(created, 2);

    let messages: Vec<Message> = store
        .find_all(Query::new().equal("remoteFolderId", folder.id.as_str()))
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);

    let unread: Vec<&Message> = messages.iter().filter(|m| m.unread).collect();
    assert_eq!(unread.len(), 1);

    // Thread rollups equal the sum of message contributions.
    for message in &messages {
        let thread: Thread = store.find_by_id(&message.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.unread, message.unread as i64);
        assert_eq!(thread.folders.len(), 1);
        assert_eq!(thread.folders[0].refs, 1);
        assert!(thread.in_all_mail);
    }
}

#[tokio::test]
async fn replies_join_the_existing_thread() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _stream, _output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));
    let folder = seeded_inbox(&store).await;

    processor
        .ingest_heavy(&folder, &[fetched(10, "<m1@x>", "Hello", true)])
        .await
        .unwrap();

    let mut reply = fetched(11, "<m2@x>", "Re: Hello", false);
    let header = format!(
        "Date: Tue, 01 Aug 2023 11:00:00 +0000\r\n\
         Subject: Re: Hello\r\n\
         Message-ID: <m2@x>\r\n\
         In-Reply-To: <m1@x>\r\n\
         References: <m1@x>\r\n\
         From: Bo <bo@example.com>\r\n\
         To: Ana <ana@example.com>\r\n\r\n"
    );
    reply.header = Some(header.into_bytes());
    processor.ingest_heavy(&folder, &[reply]).await.unwrap();

    let messages: Vec<Message> = store
        .find_all(Query::new().equal("accountId", "acct-1"))
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].thread_id, messages[1].thread_id);

    let thread: Thread = store
        .find_by_id(&messages[0].thread_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(thread.unread, 1);
    assert_eq!(thread.folders[0].refs, 2);
}

#[tokio::test]
async fn second_ingest_without_changes_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (store, stream, output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));
    let folder = seeded_inbox(&store).await;

    let batch = vec![fetched(10, "<m1@x>", "Hello", false)];
    processor.ingest_heavy(&folder, &batch).await.unwrap();
    let first_pass = output.deltas(&stream).len();
    assert!(first_pass > 0);

    processor.ingest_heavy(&folder, &batch).await.unwrap();
    let second_pass = output.deltas(&stream).len();
    assert_eq!(first_pass, second_pass);
}

#[tokio::test]
async fn uid_validity_reset_rematches_by_message_identity() {
    let dir = tempfile::tempdir().unwrap();
    let (store, stream, output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));
    let folder = seeded_inbox(&store).await;

    // Seed UIDs 10..12.
    processor
        .ingest_heavy(
            &folder,
            &[
                fetched(10, "<m1@x>", "One", true),
                fetched(11, "<m2@x>", "Two", true),
                fetched(12, "<m3@x>", "Three", true),
            ],
        )
        .await
        .unwrap();
    let before: Vec<Message> = store
        .find_all(Query::new().equal("accountId", "acct-1"))
        .await
        .unwrap();
    let ids_before: std::collections::HashSet<String> =
        before.iter().map(|m| m.id.clone()).collect();

    // The server reset its UID namespace: unlink everything, then re-scan
    // finds the same messages at UIDs 17..19.
    processor
        .unlink_messages_matching(
            Query::new().equal("remoteFolderId", folder.id.as_str()),
            1,
        )
        .await
        .unwrap();
    processor
        .ingest_heavy(
            &folder,
            &[
                fetched(17, "<m1@x>", "One", true),
                fetched(18, "<m2@x>", "Two", true),
                fetched(19, "<m3@x>", "Three", true),
            ],
        )
        .await
        .unwrap();

    let after: Vec<Message> = store
        .find_all(Query::new().equal("accountId", "acct-1"))
        .await
        .unwrap();
    assert_eq!(after.len(), 3);
    let ids_after: std::collections::HashSet<String> =
        after.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids_before, ids_after, "local ids must survive the reset");
    let uids: std::collections::HashSet<u32> = after.iter().map(|m| m.remote_uid).collect();
    assert_eq!(uids, [17, 18, 19].into_iter().collect());

    // Nothing was deleted, and the relink was silent.
    assert!(output
        .deltas_of_type(&stream, "unpersist", "Message")
        .is_empty());

    // The deletion pass finds nothing still unlinked.
    let deleted = processor.delete_messages_still_unlinked(1).await.unwrap();
    assert_eq!(deleted, 0);
}

#[tokio::test]
async fn two_phase_deletion_deletes_only_after_a_full_extra_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let (store, stream, output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));
    let folder = seeded_inbox(&store).await;

    processor
        .ingest_heavy(&folder, &[fetched(10, "<m1@x>", "Doomed", true)])
        .await
        .unwrap();

    // Loop 1: the server stops returning the message; it is unlinked with
    // phase 1. The end-of-loop deletion targets the other phase, so the
    // message survives.
    processor
        .unlink_messages_matching(
            Query::new().equal("remoteFolderId", folder.id.as_str()),
            1,
        )
        .await
        .unwrap();
    let deleted = processor.delete_messages_still_unlinked(2).await.unwrap();
    assert_eq!(deleted, 0);
    assert!(output
        .deltas_of_type(&stream, "unpersist", "Message")
        .is_empty());

    let parked: Vec<Message> = store
        .find_all(
            Query::new().equal("remoteUID", unlink_uid_for_phase(1)),
        )
        .await
        .unwrap();
    assert_eq!(parked.len(), 1);

    // Loop 2: still missing; the phase toggles and the deletion pass now
    // targets phase 1.
    let deleted = processor.delete_messages_still_unlinked(1).await.unwrap();
    assert_eq!(deleted, 1);

    let remaining: Vec<Message> = store
        .find_all(Query::new().equal("accountId", "acct-1"))
        .await
        .unwrap();
    assert!(remaining.is_empty());
    assert_eq!(
        output.deltas_of_type(&stream, "unpersist", "Message").len(),
        1
    );
    // The thread left with its last message.
    assert_eq!(
        output.deltas_of_type(&stream, "unpersist", "Thread").len(),
        1
    );
}

#[tokio::test]
async fn relinked_message_is_spared_from_deletion() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _stream, _output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));
    let inbox = seeded_inbox(&store).await;
    let mut archive = Folder::new("acct-1", "Archive", '/');
    archive.role = "archive".to_string();
    store.save(&mut archive).await.unwrap();

    processor
        .ingest_heavy(&inbox, &[fetched(10, "<m1@x>", "Mover", true)])
        .await
        .unwrap();

    // The message vanishes from INBOX (unlinked, phase 1), then shows up
    // in Archive before the deletion pass: a server-side move.
    processor
        .unlink_messages_matching(Query::new().equal("remoteFolderId", inbox.id.as_str()), 1)
        .await
        .unwrap();
    processor
        .ingest_heavy(&archive, &[fetched(90, "<m1@x>", "Mover", true)])
        .await
        .unwrap();

    assert_eq!(processor.delete_messages_still_unlinked(1).await.unwrap(), 0);
    let messages: Vec<Message> = store
        .find_all(Query::new().equal("accountId", "acct-1"))
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].remote_folder_id, archive.id);
    assert_eq!(messages[0].remote_uid, 90);
}

#[tokio::test]
async fn locked_messages_resist_remote_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _stream, _output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));
    let folder = seeded_inbox(&store).await;

    processor
        .ingest_heavy(&folder, &[fetched(10, "<m1@x>", "Locked", true)])
        .await
        .unwrap();

    // The user marked it unread locally; the task engine locked it.
    let mut message: Message = store
        .find(Query::new().equal("remoteUID", 10u32))
        .await
        .unwrap()
        .unwrap();
    message.unread = true;
    message.sync_unsaved_changes = 1;
    store.save(&mut message).await.unwrap();

    // A remote scan still says \Seen; it must not clobber the local flag.
    processor
        .ingest_attributes(&folder, &[fetched(10, "<m1@x>", "Locked", true)])
        .await
        .unwrap();

    let reloaded: Message = store.find_by_id(&message.id).await.unwrap().unwrap();
    assert!(reloaded.unread);
    assert_eq!(reloaded.sync_unsaved_changes, 1);
}

#[tokio::test]
async fn body_claims_are_exclusive_and_counted() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _stream, _output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));
    let folder = seeded_inbox(&store).await;

    processor
        .ingest_heavy(&folder, &[fetched(10, "<m1@x>", "Body", true)])
        .await
        .unwrap();
    let message: Message = store
        .find(Query::new().equal("remoteUID", 10u32))
        .await
        .unwrap()
        .unwrap();

    assert!(store.claim_body(&message.id).await.unwrap());
    assert!(!store.claim_body(&message.id).await.unwrap());

    // A claimed-but-unfetched body does not count as present.
    assert_eq!(store.count_bodies_present(&folder.id).await.unwrap(), 0);
    store.save_body(&message.id, "<p>Hello</p>").await.unwrap();
    assert_eq!(store.count_bodies_present(&folder.id).await.unwrap(), 1);

    let now = mailsync::util::now_secs();
    let wanted = store
        .count_bodies_wanted(&folder.id, now - 90 * 24 * 60 * 60)
        .await
        .unwrap();
    assert!(store.count_bodies_present(&folder.id).await.unwrap() <= wanted.max(1));
}

#[tokio::test]
async fn body_ingestion_merges_body_into_message_delta() {
    let dir = tempfile::tempdir().unwrap();
    let (store, stream, output) = open_store(&dir).await;
    let processor = MailProcessor::new(store.clone(), account(), config(&dir));
    let folder = seeded_inbox(&store).await;

    processor
        .ingest_heavy(&folder, &[fetched(10, "<m1@x>", "Body", true)])
        .await
        .unwrap();
    let message: Message = store
        .find(Query::new().equal("remoteUID", 10u32))
        .await
        .unwrap()
        .unwrap();

    let raw = b"Subject: Body\r\nContent-Type: text/plain\r\n\r\nThe quick brown fox.";
    processor.ingest_body(&message.id, raw).await.unwrap();

    let deltas = output.deltas_of_type(&stream, "persist", "Message");
    let last = deltas.last().unwrap();
    let entity = last["modelJSONs"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["id"] == message.id)
        .unwrap();
    // The save omitted the body; the merged emission must still carry it.
    assert_eq!(entity["body"], "The quick brown fox.");
    assert_eq!(entity["snippet"], "The quick brown fox.");

    let stored = store.body(&message.id).await.unwrap().unwrap();
    assert_eq!(stored, "The quick brown fox.");
}
