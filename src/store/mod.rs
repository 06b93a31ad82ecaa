//! Local persistence
//!
//! Single-file SQLite store shared by every worker. Models persist as one
//! JSON `data` column plus the indexed columns they declare; saves and
//! removals emit deltas through the store's stream handle. Deltas emitted
//! inside a transaction buffer until commit and are discarded on rollback.

pub mod migrations;
pub mod query;

pub use query::Query;

use crate::delta::{
    DeltaStream, DeltaStreamItem, DEFAULT_FLUSH_WITHIN, DELTA_TYPE_PERSIST, DELTA_TYPE_UNPERSIST,
};
use crate::error::SyncResult;
use crate::models::{Bind, DetachedMetadata, Label, Metadata, Model};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const VACUUM_TIME_KEY: &str = "VACUUM_TIME";
const VACUUM_INTERVAL_SECS: i64 = 14 * 24 * 60 * 60;

/// Memoised save statements keyed by table name.
static SAVE_SQL: Lazy<Mutex<HashMap<&'static str, Arc<String>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn save_sql_for<M: Model>() -> Arc<String> {
    let mut cache = SAVE_SQL.lock();
    cache
        .entry(M::table())
        .or_insert_with(|| {
            let mut columns = vec!["id", "data", "accountId", "version"];
            columns.extend_from_slice(M::index_columns());
            let placeholders = vec!["?"; columns.len()].join(",");
            Arc::new(format!(
                "REPLACE INTO {} ({}) VALUES ({})",
                M::table(),
                columns.join(","),
                placeholders
            ))
        })
        .clone()
}

fn bind_value<'q>(
    q: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &Bind,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        Bind::Text(s) => q.bind(s.clone()),
        Bind::Int(i) => q.bind(*i),
        Bind::Null => q.bind(None::<String>),
    }
}

pub struct MailStore {
    pool: SqlitePool,
    stream: Arc<DeltaStream>,
    label_generation: AtomicU64,
    label_cache: Mutex<Option<(u64, String, Vec<Label>)>>,
}

impl MailStore {
    pub async fn open(path: &Path, stream: Arc<DeltaStream>) -> SyncResult<Arc<Self>> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10))
            .pragma("page_size", "4096")
            .pragma("cache_size", "10000");

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;

        let store = Arc::new(MailStore {
            pool,
            stream,
            label_generation: AtomicU64::new(1),
            label_cache: Mutex::new(None),
        });
        store.vacuum_if_due().await?;
        Ok(store)
    }

    pub fn delta_stream(&self) -> &Arc<DeltaStream> {
        &self.stream
    }

    pub async fn begin(&self) -> SyncResult<StoreTransaction<'_>> {
        let tx = self.pool.begin().await?;
        Ok(StoreTransaction {
            tx,
            store: self,
            deltas: Vec::new(),
        })
    }

    // ---- reads ----

    pub async fn find<M: Model>(&self, q: Query) -> SyncResult<Option<M>> {
        let sql = format!("SELECT data FROM {}{} LIMIT 1", M::table(), q.sql());
        let mut query = sqlx::query(&sql);
        for b in q.binds() {
            query = bind_value(query, b);
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.map(|r| {
            let data: String = r.try_get("data")?;
            Ok(serde_json::from_str::<M>(&data)?)
        })
        .transpose()
    }

    pub async fn find_by_id<M: Model>(&self, id: &str) -> SyncResult<Option<M>> {
        self.find(Query::new().equal("id", id)).await
    }

    pub async fn find_all<M: Model>(&self, q: Query) -> SyncResult<Vec<M>> {
        self.find_all_ordered(q, "", None).await
    }

    pub async fn find_all_ordered<M: Model>(
        &self,
        q: Query,
        order_by: &str,
        limit: Option<i64>,
    ) -> SyncResult<Vec<M>> {
        let mut sql = format!("SELECT data FROM {}{}", M::table(), q.sql());
        if !order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        let mut query = sqlx::query(&sql);
        for b in q.binds() {
            query = bind_value(query, b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.try_get("data")?;
            match serde_json::from_str::<M>(&data) {
                Ok(model) => models.push(model),
                Err(err) => warn!(table = M::table(), error = %err, "skipping undecodable row"),
            }
        }
        Ok(models)
    }

    pub async fn count<M: Model>(&self, q: Query) -> SyncResult<i64> {
        let sql = format!("SELECT COUNT(*) AS n FROM {}{}", M::table(), q.sql());
        let mut query = sqlx::query(&sql);
        for b in q.binds() {
            query = bind_value(query, b);
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.try_get("n")?)
    }

    // ---- convenience single-op writes ----

    pub async fn save<M: Model>(&self, model: &mut M) -> SyncResult<()> {
        let mut tx = self.begin().await?;
        tx.save(model).await?;
        tx.commit().await
    }

    pub async fn save_silent<M: Model>(&self, model: &mut M) -> SyncResult<()> {
        let mut tx = self.begin().await?;
        tx.save_silent(model).await?;
        tx.commit().await
    }

    pub async fn remove<M: Model>(&self, model: &M) -> SyncResult<()> {
        let mut tx = self.begin().await?;
        tx.remove(model).await?;
        tx.commit().await
    }

    // ---- key/value state ----

    pub async fn get_kv(&self, key: &str) -> SyncResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM State WHERE id = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    pub async fn set_kv(&self, key: &str, value: &str) -> SyncResult<()> {
        sqlx::query("REPLACE INTO State (id, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- label cache ----

    /// Cached labels for the account, refreshed whenever a label save or
    /// removal bumps the generation counter.
    pub async fn labels(&self, account_id: &str) -> SyncResult<Vec<Label>> {
        let generation = self.label_generation.load(Ordering::Acquire);
        if let Some((cached_gen, cached_account, labels)) = &*self.label_cache.lock() {
            if *cached_gen == generation && cached_account == account_id {
                return Ok(labels.clone());
            }
        }
        let labels: Vec<Label> = self
            .find_all(Query::new().equal("accountId", account_id))
            .await?;
        *self.label_cache.lock() = Some((generation, account_id.to_string(), labels.clone()));
        Ok(labels)
    }

    pub fn bump_label_generation(&self) {
        self.label_generation.fetch_add(1, Ordering::AcqRel);
    }

    // ---- message bodies ----

    /// Write an empty row to claim the fetch; returns false when another
    /// pass already claimed or stored this body.
    pub async fn claim_body(&self, message_id: &str) -> SyncResult<bool> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO MessageBody (id, value, fetchedAt) VALUES (?, '', ?)")
                .bind(message_id)
                .bind(crate::util::now_secs())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn save_body(&self, message_id: &str, value: &str) -> SyncResult<()> {
        sqlx::query("REPLACE INTO MessageBody (id, value, fetchedAt) VALUES (?, ?, ?)")
            .bind(message_id)
            .bind(value)
            .bind(crate::util::now_secs())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn body(&self, message_id: &str) -> SyncResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM MessageBody WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    /// Delete body rows in one folder fetched before `fetched_before`
    /// whose messages are older than `message_date_before`. Drafts keep
    /// their bodies.
    pub async fn purge_bodies(
        &self,
        folder_id: &str,
        fetched_before: i64,
        message_date_before: i64,
    ) -> SyncResult<u64> {
        let result = sqlx::query(
            "DELETE FROM MessageBody WHERE fetchedAt < ? AND id IN \
             (SELECT id FROM Message WHERE remoteFolderId = ? AND draft = 0 AND date < ?)",
        )
        .bind(fetched_before)
        .bind(folder_id)
        .bind(message_date_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// The UID sitting `depth` messages down from `before_uid` in the
    /// folder, used to bound shallow scans to the most recent messages.
    pub async fn message_uid_at_depth(
        &self,
        folder_id: &str,
        depth: i64,
        before_uid: u32,
    ) -> SyncResult<u32> {
        let row = sqlx::query(
            "SELECT remoteUID FROM Message WHERE remoteFolderId = ? AND remoteUID < ? \
             ORDER BY remoteUID DESC LIMIT 1 OFFSET ?",
        )
        .bind(folder_id)
        .bind(before_uid as i64)
        .bind(depth)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .and_then(|r| r.try_get::<i64, _>("remoteUID").ok())
            .map(|v| v as u32)
            .unwrap_or(1))
    }

    pub async fn count_bodies_present(&self, folder_id: &str) -> SyncResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM Message \
             INNER JOIN MessageBody ON MessageBody.id = Message.id \
             WHERE Message.remoteFolderId = ? AND MessageBody.value != ''",
        )
        .bind(folder_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn count_bodies_wanted(
        &self,
        folder_id: &str,
        min_date: i64,
    ) -> SyncResult<i64> {
        let unlink_floor = crate::models::message::unlink_uid_for_phase(1) as i64;
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM Message \
             WHERE remoteFolderId = ? AND (date > ? OR draft = 1) \
             AND remoteUID > 0 AND remoteUID < ?",
        )
        .bind(folder_id)
        .bind(min_date)
        .bind(unlink_floor)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    /// Messages in the folder wanting a body that hasn't been claimed,
    /// newest first. Unlinked messages are scheduled for cleanup and are
    /// skipped.
    pub async fn message_ids_needing_bodies(
        &self,
        folder_id: &str,
        min_date: i64,
        limit: i64,
    ) -> SyncResult<Vec<String>> {
        let unlink_floor = crate::models::message::unlink_uid_for_phase(1) as i64;
        let rows = sqlx::query(
            "SELECT Message.id AS id FROM Message \
             LEFT JOIN MessageBody ON MessageBody.id = Message.id \
             WHERE Message.remoteFolderId = ? AND (Message.date > ? OR Message.draft = 1) \
             AND Message.remoteUID > 0 AND Message.remoteUID < ? \
             AND MessageBody.id IS NULL \
             ORDER BY Message.date DESC LIMIT ?",
        )
        .bind(folder_id)
        .bind(min_date)
        .bind(unlink_floor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.try_get("id").ok())
            .collect())
    }

    // ---- contact group membership ----

    pub async fn set_group_members(
        &self,
        group_id: &str,
        contact_ids: &[String],
    ) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM ContactContactGroup WHERE contactGroupId = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        for contact_id in contact_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO ContactContactGroup (contactId, contactGroupId) VALUES (?, ?)",
            )
            .bind(contact_id)
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn group_members(&self, group_id: &str) -> SyncResult<Vec<String>> {
        let rows = sqlx::query("SELECT contactId FROM ContactContactGroup WHERE contactGroupId = ?")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.try_get("contactId").ok())
            .collect())
    }

    // ---- maintenance ----

    async fn vacuum_if_due(&self) -> SyncResult<()> {
        let last: i64 = self
            .get_kv(VACUUM_TIME_KEY)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let now = crate::util::now_secs();
        if last == 0 {
            self.set_kv(VACUUM_TIME_KEY, &now.to_string()).await?;
            return Ok(());
        }
        if now - last > VACUUM_INTERVAL_SECS {
            // Stamp first so a failed VACUUM isn't retried every launch.
            self.set_kv(VACUUM_TIME_KEY, &now.to_string()).await?;
            info!("running periodic VACUUM");
            sqlx::query("VACUUM").execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// An open transaction. Saves and removals inside it queue their deltas;
/// `commit` hands them to the stream, dropping the transaction discards
/// them along with the writes.
pub struct StoreTransaction<'a> {
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
    store: &'a MailStore,
    deltas: Vec<DeltaStreamItem>,
}

impl<'a> StoreTransaction<'a> {
    pub async fn save<M: Model>(&mut self, model: &mut M) -> SyncResult<()> {
        self.save_inner(model, true).await
    }

    /// Save without a delta. Used when remote sync writes back fields the
    /// client already shows (nothing user-visible changed).
    pub async fn save_silent<M: Model>(&mut self, model: &mut M) -> SyncResult<()> {
        self.save_inner(model, false).await
    }

    async fn save_inner<M: Model>(&mut self, model: &mut M, emit: bool) -> SyncResult<()> {
        model.set_version(model.version() + 1);
        let data = serde_json::to_string(model)?;

        let sql = save_sql_for::<M>();
        let mut query = sqlx::query(&sql)
            .bind(model.id().to_string())
            .bind(data)
            .bind(model.account_id().to_string())
            .bind(model.version());
        for value in model.index_values() {
            query = bind_value(query, &value);
        }
        query.execute(&mut *self.tx).await?;

        if M::table() == Label::table() {
            self.store.bump_label_generation();
        }

        if emit {
            self.deltas.push(DeltaStreamItem::with_json(
                DELTA_TYPE_PERSIST,
                M::object_class(),
                serde_json::to_value(&*model)?,
            ));
        }

        if M::supports_metadata() && model.version() == 1 {
            self.attach_detached_metadata(model.account_id(), model.id())
                .await?;
        }
        Ok(())
    }

    /// Promote parked metadata rows onto a newly created model.
    async fn attach_detached_metadata(
        &mut self,
        account_id: &str,
        object_id: &str,
    ) -> SyncResult<()> {
        let rows = sqlx::query(
            "SELECT data FROM DetachedPluginMetadata WHERE accountId = ? AND objectId = ?",
        )
        .bind(account_id)
        .bind(object_id)
        .fetch_all(&mut *self.tx)
        .await?;
        if rows.is_empty() {
            return Ok(());
        }
        debug!(object_id, count = rows.len(), "attaching detached metadata");
        for row in rows {
            let data: String = row.try_get("data")?;
            let detached: DetachedMetadata = serde_json::from_str(&data)?;
            let metadata = Metadata {
                id: format!("{}-{}", detached.object_id, detached.plugin_id),
                account_id: detached.account_id,
                version: detached.version,
                plugin_id: detached.plugin_id,
                object_id: detached.object_id,
                object_type: detached.object_type,
                value: detached.value,
                expiration: detached.expiration,
            };
            let sql = save_sql_for::<Metadata>();
            let mut query = sqlx::query(&sql)
                .bind(metadata.id.clone())
                .bind(serde_json::to_string(&metadata)?)
                .bind(metadata.account_id.clone())
                .bind(metadata.version);
            for value in Model::index_values(&metadata) {
                query = bind_value(query, &value);
            }
            query.execute(&mut *self.tx).await?;

            self.deltas.push(DeltaStreamItem::with_json(
                DELTA_TYPE_PERSIST,
                Metadata::object_class(),
                serde_json::to_value(&metadata)?,
            ));
        }
        sqlx::query("DELETE FROM DetachedPluginMetadata WHERE accountId = ? AND objectId = ?")
            .bind(account_id)
            .bind(object_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn remove<M: Model>(&mut self, model: &M) -> SyncResult<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?", M::table());
        sqlx::query(&sql)
            .bind(model.id().to_string())
            .execute(&mut *self.tx)
            .await?;

        if M::table() == Label::table() {
            self.store.bump_label_generation();
        }

        self.deltas.push(DeltaStreamItem::with_json(
            DELTA_TYPE_UNPERSIST,
            M::object_class(),
            serde_json::to_value(model)?,
        ));
        Ok(())
    }

    // ---- in-transaction reads ----

    pub async fn find<M: Model>(&mut self, q: Query) -> SyncResult<Option<M>> {
        let sql = format!("SELECT data FROM {}{} LIMIT 1", M::table(), q.sql());
        let mut query = sqlx::query(&sql);
        for b in q.binds() {
            query = bind_value(query, b);
        }
        let row = query.fetch_optional(&mut *self.tx).await?;
        row.map(|r| {
            let data: String = r.try_get("data")?;
            Ok(serde_json::from_str::<M>(&data)?)
        })
        .transpose()
    }

    pub async fn find_by_id<M: Model>(&mut self, id: &str) -> SyncResult<Option<M>> {
        self.find(Query::new().equal("id", id)).await
    }

    pub async fn find_all<M: Model>(&mut self, q: Query) -> SyncResult<Vec<M>> {
        let sql = format!("SELECT data FROM {}{}", M::table(), q.sql());
        let mut query = sqlx::query(&sql);
        for b in q.binds() {
            query = bind_value(query, b);
        }
        let rows = query.fetch_all(&mut *self.tx).await?;
        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.try_get("data")?;
            models.push(serde_json::from_str::<M>(&data)?);
        }
        Ok(models)
    }

    /// Queue an additional delta to emit on commit (for payload keys that
    /// live outside the model row, like a freshly fetched body).
    pub fn emit(&mut self, item: DeltaStreamItem) {
        self.deltas.push(item);
    }

    pub async fn commit(self) -> SyncResult<()> {
        self.tx.commit().await?;
        for item in self.deltas {
            self.store.stream.emit(item, DEFAULT_FLUSH_WITHIN);
        }
        Ok(())
    }
}
