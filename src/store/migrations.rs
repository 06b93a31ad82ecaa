//! Linear schema migrations keyed by `PRAGMA user_version`

use crate::error::SyncResult;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::info;

/// Each migration runs inside one transaction; `user_version` advances
/// only after the batch commits.
const MIGRATIONS: &[&[&str]] = &[
    // v1: base schema
    &[
        "CREATE TABLE IF NOT EXISTS Folder (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, path TEXT, role TEXT)",
        "CREATE TABLE IF NOT EXISTS Label (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, path TEXT, role TEXT)",
        "CREATE TABLE IF NOT EXISTS Message (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, headerMessageId TEXT, subject TEXT, gMsgId TEXT, date INTEGER, draft INTEGER, unread INTEGER, starred INTEGER, remoteUID INTEGER, remoteFolderId TEXT, clientFolderId TEXT, threadId TEXT, syncUnsavedChanges INTEGER)",
        "CREATE INDEX IF NOT EXISTS MessageFolderIdx ON Message (accountId, remoteFolderId, remoteUID)",
        "CREATE INDEX IF NOT EXISTS MessageThreadIdx ON Message (threadId)",
        "CREATE INDEX IF NOT EXISTS MessageHeaderIdx ON Message (accountId, headerMessageId)",
        "CREATE TABLE IF NOT EXISTS Thread (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, gThrId TEXT, subject TEXT, unread INTEGER, starred INTEGER, inAllMail INTEGER, lastMessageTimestamp INTEGER, lastMessageReceivedTimestamp INTEGER, lastMessageSentTimestamp INTEGER, firstMessageTimestamp INTEGER, hasAttachments INTEGER)",
        "CREATE INDEX IF NOT EXISTS ThreadGThrIdx ON Thread (accountId, gThrId)",
        "CREATE TABLE IF NOT EXISTS MessageBody (id TEXT PRIMARY KEY, value TEXT, fetchedAt INTEGER)",
        "CREATE TABLE IF NOT EXISTS File (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, messageId TEXT, filename TEXT)",
        "CREATE INDEX IF NOT EXISTS FileMessageIdx ON File (messageId)",
        "CREATE TABLE IF NOT EXISTS Contact (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, email TEXT, bookId TEXT, hidden INTEGER, source TEXT, etag TEXT, refs INTEGER)",
        "CREATE INDEX IF NOT EXISTS ContactEmailIdx ON Contact (accountId, email)",
        "CREATE TABLE IF NOT EXISTS ContactBook (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER)",
        "CREATE TABLE IF NOT EXISTS ContactGroup (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, bookId TEXT, name TEXT)",
        "CREATE TABLE IF NOT EXISTS ContactContactGroup (contactId TEXT, contactGroupId TEXT, PRIMARY KEY (contactId, contactGroupId))",
        "CREATE TABLE IF NOT EXISTS Calendar (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, path TEXT)",
        "CREATE TABLE IF NOT EXISTS Event (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, calendarId TEXT, icsuid TEXT, etag TEXT, rs INTEGER, re INTEGER)",
        "CREATE INDEX IF NOT EXISTS EventCalendarIdx ON Event (accountId, calendarId)",
        "CREATE INDEX IF NOT EXISTS EventUidIdx ON Event (accountId, icsuid)",
        "CREATE TABLE IF NOT EXISTS Task (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, status TEXT, constructorName TEXT)",
        "CREATE TABLE IF NOT EXISTS ModelPluginMetadata (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, pluginId TEXT, objectId TEXT, objectType TEXT, expiration INTEGER)",
        "CREATE INDEX IF NOT EXISTS MetadataObjectIdx ON ModelPluginMetadata (accountId, objectId)",
        "CREATE INDEX IF NOT EXISTS MetadataExpirationIdx ON ModelPluginMetadata (expiration)",
        "CREATE TABLE IF NOT EXISTS DetachedPluginMetadata (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, pluginId TEXT, objectId TEXT)",
        "CREATE INDEX IF NOT EXISTS DetachedObjectIdx ON DetachedPluginMetadata (accountId, objectId)",
        "CREATE TABLE IF NOT EXISTS State (id TEXT PRIMARY KEY, value TEXT)",
    ],
    // v2: adopt rows written by clients that used the historical
    // misspelled side-table name.
    &[
        "CREATE TABLE IF NOT EXISTS DetatchedPluginMetadata (id TEXT PRIMARY KEY, data TEXT, accountId TEXT, version INTEGER, pluginId TEXT, objectId TEXT)",
        "INSERT OR IGNORE INTO DetachedPluginMetadata SELECT * FROM DetatchedPluginMetadata",
        "DROP TABLE DetatchedPluginMetadata",
    ],
];

pub async fn run(pool: &SqlitePool) -> SyncResult<()> {
    let row = sqlx::query("PRAGMA user_version").fetch_one(pool).await?;
    let current: i64 = row.try_get(0)?;

    for (idx, statements) in MIGRATIONS.iter().enumerate() {
        let target = (idx + 1) as i64;
        if target <= current {
            continue;
        }
        info!(version = target, "running store migration");
        let mut tx = pool.begin().await?;
        for statement in *statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query(&format!("PRAGMA user_version = {}", target))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }
    Ok(())
}

pub const CURRENT_VERSION: i64 = MIGRATIONS.len() as i64;
