//! Backup catalog stored in SQLite
//!
//! One catalog per backup directory records every captured message, its
//! current UID, labels and flags, plus a few settings (schema version,
//! owning account, last seen UIDVALIDITY). Older catalogs are migrated
//! forward on open; anything older than [`MIN_SCHEMA_VERSION`] or newer than
//! [`SCHEMA_VERSION`] is refused.

use crate::headers::{header_message_id, MessageMeta};
use crate::{CoreError, CoreResult};
use mailkeep_imap::Uid;
use sqlx::{sqlite::SqlitePoolOptions, Connection, Executor, Pool, Sqlite, Transaction};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Catalog file inside the backup directory
pub const CATALOG_FILE: &str = "msg-db.sqlite";

/// Oldest schema that can still be migrated
pub const MIN_SCHEMA_VERSION: u32 = 2;

/// Schema written by this release
pub const SCHEMA_VERSION: u32 = 5;

const SETTING_VERSION: &str = "db_version";
const SETTING_OWNER: &str = "email_address";
const SETTING_UIDVALIDITY: &str = "uidvalidity";

const SCHEMA: &str = r#"
    CREATE TABLE messages (
        message_num INTEGER PRIMARY KEY,
        message_filename TEXT,
        message_to TEXT,
        message_from TEXT,
        message_subject TEXT,
        message_internaldate TEXT,
        rfc822_msgid TEXT
    );
    CREATE TABLE uids (message_num INTEGER UNIQUE, uid TEXT PRIMARY KEY);
    CREATE TABLE labels (message_num INTEGER, label TEXT);
    CREATE TABLE flags (message_num INTEGER, flag TEXT);
    CREATE UNIQUE INDEX labelidx ON labels (message_num, label);
    CREATE UNIQUE INDEX flagidx ON flags (message_num, flag);
    CREATE TABLE settings (name TEXT PRIMARY KEY, value TEXT);
"#;

/// Forward steps, keyed by the version they produce
const MIGRATIONS: &[(u32, &str)] = &[
    (
        3,
        r#"
        CREATE TABLE uids (message_num INTEGER UNIQUE, uid TEXT PRIMARY KEY);
        INSERT INTO uids (message_num, uid)
            SELECT message_num, CAST(message_num AS TEXT) FROM messages;
        "#,
    ),
    (4, "ALTER TABLE messages ADD COLUMN rfc822_msgid TEXT;"),
    (
        5,
        r#"
        DELETE FROM labels WHERE rowid NOT IN
            (SELECT MIN(rowid) FROM labels GROUP BY message_num, label);
        DELETE FROM flags WHERE rowid NOT IN
            (SELECT MIN(rowid) FROM flags GROUP BY message_num, flag);
        CREATE UNIQUE INDEX labelidx ON labels (message_num, label);
        CREATE UNIQUE INDEX flagidx ON flags (message_num, flag);
        "#,
    ),
];

/// What a run intends to do with the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Backup,
    Estimate,
    Reindex,
    /// Restores may use another account's backup
    Restore,
}

/// One server message as seen by an index rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub uid: Uid,
    pub message_id: Option<String>,
    /// Normalized internal date
    pub internal_date: String,
}

/// Outcome of rebuilding the UID index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Message-IDs read back from stored message files
    pub ids_derived: usize,
    pub matched: usize,
    /// Server messages matching more than one catalog row
    pub ambiguous: usize,
    /// Server messages matching nothing
    pub unmatched: usize,
}

/// A message waiting in the restore worklist
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RestoreEntry {
    pub message_num: i64,
    pub message_filename: String,
    pub message_internaldate: String,
}

/// The backup catalog
pub struct Catalog {
    pool: Pool<Sqlite>,
    root: PathBuf,
    version: u32,
    owner: Option<String>,
    uidvalidity: Option<u32>,
}

impl Catalog {
    /// Open the catalog of an existing backup in `root`
    ///
    /// Unlike [`Catalog::open_or_create`] nothing is created; a missing
    /// folder or catalog file is [`CoreError::FolderNotFound`].
    pub async fn open_existing(root: impl AsRef<Path>, owner: &str) -> CoreResult<Self> {
        let root = root.as_ref();
        if !root.join(CATALOG_FILE).is_file() {
            return Err(CoreError::FolderNotFound(format!(
                "{} (no backup there)",
                root.display()
            )));
        }
        Self::open_or_create(root, owner).await
    }

    /// Open the catalog in `root`, creating an empty one owned by `owner` if
    /// there is none
    ///
    /// Only the settings are read here. Call [`Catalog::check_compatible`]
    /// and, when needed, [`Catalog::migrate`] before touching messages.
    pub async fn open_or_create(root: impl AsRef<Path>, owner: &str) -> CoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let path = root.join(CATALOG_FILE);
        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        info!("Opening backup catalog at {}", path.display());

        // One writer, one connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await?;

        let mut catalog = Self {
            pool,
            root,
            version: 0,
            owner: None,
            uidvalidity: None,
        };

        match catalog.probe_version().await? {
            Some(version) => {
                catalog.version = version;
                if version > 1 {
                    catalog.load_settings().await?;
                }
                debug!("Catalog schema version {}", version);
            }
            None => catalog.create_schema(owner).await?,
        }

        Ok(catalog)
    }

    /// Schema version without touching message tables
    ///
    /// `None` for an empty database. A legacy store with messages but no
    /// settings table counts as version 1.
    async fn probe_version(&self) -> CoreResult<Option<u32>> {
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&self.pool)
                .await?;

        if tables.iter().any(|t| t == "settings") {
            let version: Option<String> =
                sqlx::query_scalar("SELECT value FROM settings WHERE name = ?")
                    .bind(SETTING_VERSION)
                    .fetch_optional(&self.pool)
                    .await?;
            let version = version.and_then(|v| v.trim().parse().ok()).unwrap_or(1);
            return Ok(Some(version));
        }

        if tables.iter().any(|t| t == "messages") {
            return Ok(Some(1));
        }

        Ok(None)
    }

    async fn load_settings(&mut self) -> CoreResult<()> {
        self.owner = self.setting(SETTING_OWNER).await?;
        self.uidvalidity = self
            .setting(SETTING_UIDVALIDITY)
            .await?
            .and_then(|v| v.trim().parse().ok());
        Ok(())
    }

    async fn setting(&self, name: &str) -> CoreResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM settings WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn create_schema(&mut self, owner: &str) -> CoreResult<()> {
        info!("Creating new backup catalog for {}", owner);

        let mut tx = self.pool.begin().await?;
        sqlx::query(SCHEMA).execute(&mut *tx).await?;
        put_setting(&mut *tx, SETTING_VERSION, &SCHEMA_VERSION.to_string()).await?;
        put_setting(&mut *tx, SETTING_OWNER, owner).await?;
        tx.commit().await?;

        self.version = SCHEMA_VERSION;
        self.owner = Some(owner.to_string());
        self.uidvalidity = None;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// UIDVALIDITY the stored UIDs belong to
    pub fn uidvalidity(&self) -> Option<u32> {
        self.uidvalidity
    }

    pub fn needs_migration(&self) -> bool {
        self.version < SCHEMA_VERSION
    }

    /// Refuse catalogs we cannot safely use for `purpose`
    pub fn check_compatible(&self, purpose: Purpose, owner: &str) -> CoreResult<()> {
        if self.version < MIN_SCHEMA_VERSION {
            return Err(CoreError::SchemaTooOld {
                found: self.version,
                minimum: MIN_SCHEMA_VERSION,
            });
        }
        if self.version > SCHEMA_VERSION {
            return Err(CoreError::SchemaTooNew {
                found: self.version,
                current: SCHEMA_VERSION,
            });
        }

        if purpose != Purpose::Restore {
            if let Some(stored) = &self.owner {
                if !stored.eq_ignore_ascii_case(owner) {
                    return Err(CoreError::OwnerMismatch {
                        stored: stored.clone(),
                        requested: owner.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Apply forward migrations up to [`SCHEMA_VERSION`]
    ///
    /// Each step commits on its own together with the new version number.
    /// `uidvalidity`, when given, is recorded once all steps are done.
    pub async fn migrate(&mut self, uidvalidity: Option<u32>) -> CoreResult<()> {
        if self.version < MIN_SCHEMA_VERSION {
            return Err(CoreError::SchemaTooOld {
                found: self.version,
                minimum: MIN_SCHEMA_VERSION,
            });
        }

        while self.version < SCHEMA_VERSION {
            let target = self.version + 1;
            let sql = MIGRATIONS
                .iter()
                .find(|(version, _)| *version == target)
                .map(|(_, sql)| *sql)
                .ok_or_else(|| {
                    CoreError::DatabaseError(format!("no migration to schema {}", target))
                })?;

            info!("Upgrading backup catalog to schema version {}", target);
            let mut tx = self.pool.begin().await?;
            sqlx::query(sql).execute(&mut *tx).await?;
            put_setting(&mut *tx, SETTING_VERSION, &target.to_string()).await?;
            tx.commit().await?;
            self.version = target;
        }

        if let Some(uidvalidity) = uidvalidity {
            self.set_uidvalidity(uidvalidity).await?;
        }
        Ok(())
    }

    pub async fn set_uidvalidity(&mut self, uidvalidity: u32) -> CoreResult<()> {
        put_setting(&self.pool, SETTING_UIDVALIDITY, &uidvalidity.to_string()).await?;
        self.uidvalidity = Some(uidvalidity);
        Ok(())
    }

    pub async fn message_count(&self) -> CoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn uid_count(&self) -> CoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM uids")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Local id currently mapped to `uid`
    pub async fn local_id(&self, uid: &Uid) -> CoreResult<Option<i64>> {
        let id = sqlx::query_scalar("SELECT message_num FROM uids WHERE uid = ?")
            .bind(uid.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// A UID counts as captured only while its message file exists
    pub async fn is_captured(&self, uid: &Uid) -> CoreResult<bool> {
        let filename: Option<Option<String>> = sqlx::query_scalar(
            "SELECT m.message_filename FROM uids u \
             JOIN messages m ON m.message_num = u.message_num WHERE u.uid = ?",
        )
        .bind(uid.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match filename.flatten() {
            Some(filename) => self.root.join(filename).is_file(),
            None => false,
        })
    }

    /// Stored labels and flags of one message
    pub async fn labels_and_flags(&self, message_num: i64) -> CoreResult<(Vec<String>, Vec<String>)> {
        let labels = sqlx::query_scalar("SELECT label FROM labels WHERE message_num = ? ORDER BY rowid")
            .bind(message_num)
            .fetch_all(&self.pool)
            .await?;
        let flags = sqlx::query_scalar("SELECT flag FROM flags WHERE message_num = ? ORDER BY rowid")
            .bind(message_num)
            .fetch_all(&self.pool)
            .await?;
        Ok((labels, flags))
    }

    /// Start a batch of writes that commit together
    pub async fn begin_batch(&self) -> CoreResult<CatalogBatch> {
        Ok(CatalogBatch {
            tx: self.pool.begin().await?,
            recorded: 0,
            refreshed: 0,
        })
    }

    /// Re-map server UIDs to catalog rows after a UIDVALIDITY change
    ///
    /// Rows still lacking a Message-ID get one read from their stored file
    /// first. A server message is mapped only when exactly one row shares
    /// its (Message-ID, internal date); everything else stays unmapped. The
    /// UID table is replaced as a whole.
    pub async fn rebuild_uid_index(
        &mut self,
        entries: &[IndexEntry],
        uidvalidity: u32,
    ) -> CoreResult<RebuildReport> {
        let mut report = RebuildReport {
            ids_derived: self.derive_message_ids().await?,
            ..Default::default()
        };

        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT message_num, rfc822_msgid, message_internaldate FROM messages \
             WHERE rfc822_msgid IS NOT NULL AND rfc822_msgid != '' \
             AND message_internaldate IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_key: HashMap<(String, String), Vec<i64>> = HashMap::new();
        for (message_num, message_id, internal_date) in rows {
            by_key
                .entry((message_id, internal_date))
                .or_default()
                .push(message_num);
        }

        let mut mapping: Vec<(i64, &Uid)> = Vec::new();
        let mut taken: HashSet<i64> = HashSet::new();
        for entry in entries {
            let Some(message_id) = &entry.message_id else {
                report.unmatched += 1;
                continue;
            };
            let key = (message_id.clone(), entry.internal_date.clone());
            match by_key.get(&key).map(Vec::as_slice) {
                Some([message_num]) if taken.insert(*message_num) => {
                    mapping.push((*message_num, &entry.uid));
                }
                Some([]) | None => report.unmatched += 1,
                Some(_) => {
                    warn!(
                        "UID {} ({}, {}) matches several backed up messages; leaving it unmapped",
                        entry.uid, message_id, entry.internal_date
                    );
                    report.ambiguous += 1;
                }
            }
        }
        report.matched = mapping.len();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM uids").execute(&mut *tx).await?;
        for (message_num, uid) in &mapping {
            sqlx::query("INSERT INTO uids (message_num, uid) VALUES (?, ?)")
                .bind(message_num)
                .bind(uid.as_str())
                .execute(&mut *tx)
                .await?;
        }
        put_setting(&mut *tx, SETTING_UIDVALIDITY, &uidvalidity.to_string()).await?;
        tx.commit().await?;
        self.uidvalidity = Some(uidvalidity);

        info!(
            "Rebuilt UID index: {} matched, {} ambiguous, {} unmatched",
            report.matched, report.ambiguous, report.unmatched
        );
        Ok(report)
    }

    /// Fill in Message-IDs for rows that predate the column
    async fn derive_message_ids(&self) -> CoreResult<usize> {
        let missing: Vec<(i64, Option<String>)> = sqlx::query_as(
            "SELECT message_num, message_filename FROM messages WHERE rfc822_msgid IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        if missing.is_empty() {
            return Ok(0);
        }
        info!("Reading Message-IDs of {} backed up messages", missing.len());

        let mut derived = 0;
        let mut tx = self.pool.begin().await?;
        for (message_num, filename) in missing {
            let Some(filename) = filename else { continue };
            let raw = match tokio::fs::read(self.root.join(&filename)).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Cannot read {}: {}", filename, e);
                    continue;
                }
            };
            // Empty string marks "looked, none there"
            let message_id = header_message_id(&raw).unwrap_or_default();
            sqlx::query("UPDATE messages SET rfc822_msgid = ? WHERE message_num = ?")
                .bind(&message_id)
                .bind(message_num)
                .execute(&mut *tx)
                .await?;
            derived += 1;
        }
        tx.commit().await?;
        Ok(derived)
    }

    /// Build the restore worklist, or keep the existing one when resuming
    ///
    /// With `labels`, only messages carrying one of them are queued.
    /// Returns the number of pending entries.
    pub async fn prepare_restore(&self, resume: bool, labels: &[String]) -> CoreResult<u64> {
        sqlx::query("CREATE TABLE IF NOT EXISTS restore_pending (message_num INTEGER PRIMARY KEY)")
            .execute(&self.pool)
            .await?;

        if resume {
            let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM restore_pending")
                .fetch_one(&self.pool)
                .await?;
            info!("Resuming restore with {} messages left", pending);
            return Ok(pending as u64);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM restore_pending")
            .execute(&mut *tx)
            .await?;

        if labels.is_empty() {
            sqlx::query("INSERT INTO restore_pending (message_num) SELECT message_num FROM messages")
                .execute(&mut *tx)
                .await?;
        } else {
            let placeholders = vec!["?"; labels.len()].join(", ");
            let sql = format!(
                "INSERT OR IGNORE INTO restore_pending (message_num) \
                 SELECT DISTINCT message_num FROM labels WHERE label IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for label in labels {
                query = query.bind(label);
            }
            query.execute(&mut *tx).await?;
        }

        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM restore_pending")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("{} messages queued for restore", pending);
        Ok(pending as u64)
    }

    /// Worklist entries in backup order
    pub async fn pending_restore(&self) -> CoreResult<Vec<RestoreEntry>> {
        let entries = sqlx::query_as::<_, RestoreEntry>(
            "SELECT m.message_num, m.message_filename, m.message_internaldate \
             FROM restore_pending p JOIN messages m ON m.message_num = p.message_num \
             ORDER BY m.message_num",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Drop a restored message from the worklist
    pub async fn finish_restore_entry(&self, message_num: i64) -> CoreResult<()> {
        sqlx::query("DELETE FROM restore_pending WHERE message_num = ?")
            .bind(message_num)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Writes that become visible together on [`CatalogBatch::commit`]
pub struct CatalogBatch {
    tx: Transaction<'static, Sqlite>,
    recorded: usize,
    refreshed: usize,
}

impl CatalogBatch {
    /// Record a captured message with its UID, labels and flags
    ///
    /// Runs in a savepoint, so a failure leaves the rest of the batch intact.
    /// Recording a UID again updates the existing row instead of adding one.
    pub async fn record_message(
        &mut self,
        meta: &MessageMeta,
        body_path: &str,
        uid: &Uid,
        labels: &[String],
        flags: &[String],
    ) -> CoreResult<i64> {
        let mut sp = self.tx.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT message_num FROM uids WHERE uid = ?")
            .bind(uid.as_str())
            .fetch_optional(&mut *sp)
            .await?;

        let message_num = match existing {
            Some(message_num) => {
                sqlx::query(
                    "UPDATE messages SET message_filename = ?, message_to = ?, message_from = ?, \
                     message_subject = ?, message_internaldate = ?, rfc822_msgid = ? \
                     WHERE message_num = ?",
                )
                .bind(body_path)
                .bind(&meta.to)
                .bind(&meta.from)
                .bind(&meta.subject)
                .bind(&meta.internal_date)
                .bind(meta.message_id.as_deref().unwrap_or_default())
                .bind(message_num)
                .execute(&mut *sp)
                .await?;
                sqlx::query("DELETE FROM labels WHERE message_num = ?")
                    .bind(message_num)
                    .execute(&mut *sp)
                    .await?;
                sqlx::query("DELETE FROM flags WHERE message_num = ?")
                    .bind(message_num)
                    .execute(&mut *sp)
                    .await?;
                message_num
            }
            None => {
                let message_num: i64 = sqlx::query_scalar(
                    "INSERT INTO messages (message_filename, message_to, message_from, \
                     message_subject, message_internaldate, rfc822_msgid) \
                     VALUES (?, ?, ?, ?, ?, ?) RETURNING message_num",
                )
                .bind(body_path)
                .bind(&meta.to)
                .bind(&meta.from)
                .bind(&meta.subject)
                .bind(&meta.internal_date)
                .bind(meta.message_id.as_deref().unwrap_or_default())
                .fetch_one(&mut *sp)
                .await?;
                sqlx::query("INSERT INTO uids (message_num, uid) VALUES (?, ?)")
                    .bind(message_num)
                    .bind(uid.as_str())
                    .execute(&mut *sp)
                    .await?;
                message_num
            }
        };

        for label in labels {
            sqlx::query("INSERT OR IGNORE INTO labels (message_num, label) VALUES (?, ?)")
                .bind(message_num)
                .bind(label)
                .execute(&mut *sp)
                .await?;
        }
        for flag in flags {
            sqlx::query("INSERT OR IGNORE INTO flags (message_num, flag) VALUES (?, ?)")
                .bind(message_num)
                .bind(flag)
                .execute(&mut *sp)
                .await?;
        }

        sp.commit().await?;
        self.recorded += 1;
        Ok(message_num)
    }

    /// Make the stored labels and flags of `uid` exactly `labels` and `flags`
    ///
    /// Returns `false` when the UID is not in the catalog.
    pub async fn refresh_labels_flags(
        &mut self,
        uid: &Uid,
        labels: &[String],
        flags: &[String],
    ) -> CoreResult<bool> {
        let message_num: Option<i64> = sqlx::query_scalar("SELECT message_num FROM uids WHERE uid = ?")
            .bind(uid.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        let Some(message_num) = message_num else {
            return Ok(false);
        };

        reconcile(&mut self.tx, "labels", "label", message_num, labels).await?;
        reconcile(&mut self.tx, "flags", "flag", message_num, flags).await?;
        self.refreshed += 1;
        Ok(true)
    }

    pub async fn commit(self) -> CoreResult<()> {
        debug!(
            "Committing batch: {} recorded, {} refreshed",
            self.recorded, self.refreshed
        );
        self.tx.commit().await?;
        Ok(())
    }
}

/// Delete what is no longer wanted, insert what is missing
async fn reconcile(
    tx: &mut Transaction<'static, Sqlite>,
    table: &str,
    column: &str,
    message_num: i64,
    wanted: &[String],
) -> CoreResult<()> {
    let stored: HashSet<String> = sqlx::query_scalar(&format!(
        "SELECT {} FROM {} WHERE message_num = ?",
        column, table
    ))
    .bind(message_num)
    .fetch_all(&mut **tx)
    .await?
    .into_iter()
    .collect();
    let wanted: HashSet<&str> = wanted.iter().map(String::as_str).collect();

    for value in stored.iter().filter(|v| !wanted.contains(v.as_str())) {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE message_num = ? AND {} = ?",
            table, column
        ))
        .bind(message_num)
        .bind(value)
        .execute(&mut **tx)
        .await?;
    }
    for value in wanted.iter().filter(|v| !stored.contains(**v)) {
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (message_num, {}) VALUES (?, ?)",
            table, column
        ))
        .bind(message_num)
        .bind(*value)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn put_setting<'e, E>(executor: E, name: &str, value: &str) -> CoreResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO settings (name, value) VALUES (?, ?) \
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
    )
    .bind(name)
    .bind(value)
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use tempfile::TempDir;

    const OWNER: &str = "someone@gmail.com";

    fn uid(n: u32) -> Uid {
        Uid::new(n.to_string()).unwrap()
    }

    fn meta(message_id: &str, date: &str) -> MessageMeta {
        MessageMeta {
            to: "to@example.com".into(),
            from: "from@example.com".into(),
            subject: "subject".into(),
            internal_date: date.into(),
            message_id: Some(message_id.into()),
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// A catalog as an older release left it
    async fn legacy_catalog(dir: &Path, version: Option<u32>) {
        let db_url = format!("sqlite:{}?mode=rwc", dir.join(CATALOG_FILE).display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await
            .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE messages (message_num INTEGER PRIMARY KEY, message_filename TEXT,
                message_to TEXT, message_from TEXT, message_subject TEXT, message_internaldate TEXT);
            CREATE TABLE labels (message_num INTEGER, label TEXT);
            CREATE TABLE flags (message_num INTEGER, flag TEXT);
            INSERT INTO messages VALUES (7, '2020/1/2/7.eml', 'a', 'b', 'c', '2020-01-02 10:00:00');
            INSERT INTO labels VALUES (7, 'work');
            INSERT INTO labels VALUES (7, 'work');
            INSERT INTO flags VALUES (7, '\Seen');
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        if let Some(version) = version {
            sqlx::query("CREATE TABLE settings (name TEXT PRIMARY KEY, value TEXT)")
                .execute(&pool)
                .await
                .unwrap();
            put_setting(&pool, SETTING_VERSION, &version.to_string()).await.unwrap();
            put_setting(&pool, SETTING_OWNER, OWNER).await.unwrap();
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let mut catalog = Catalog::open_or_create(dir.path(), OWNER).await.unwrap();
        assert_eq!(catalog.version(), SCHEMA_VERSION);
        assert_eq!(catalog.owner(), Some(OWNER));
        assert_eq!(catalog.uidvalidity(), None);
        catalog.set_uidvalidity(42).await.unwrap();
        drop(catalog);

        let catalog = Catalog::open_or_create(dir.path(), "other@gmail.com")
            .await
            .unwrap();
        assert_eq!(catalog.owner(), Some(OWNER));
        assert_eq!(catalog.uidvalidity(), Some(42));
        assert!(!catalog.needs_migration());
    }

    #[tokio::test]
    async fn test_open_existing_requires_a_backup() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("never-backed-up");

        let err = Catalog::open_existing(&missing, OWNER).await.err().unwrap();
        assert!(matches!(err, CoreError::FolderNotFound(_)));
        assert_eq!(err.exit_code(), 4);
        assert!(!missing.exists());

        std::fs::create_dir(&missing).unwrap();
        let err = Catalog::open_existing(&missing, OWNER).await.err().unwrap();
        assert!(matches!(err, CoreError::FolderNotFound(_)));
        assert!(!missing.join(CATALOG_FILE).exists());

        drop(Catalog::open_or_create(&missing, OWNER).await.unwrap());
        let catalog = Catalog::open_existing(&missing, OWNER).await.unwrap();
        assert_eq!(catalog.owner(), Some(OWNER));
    }

    #[tokio::test]
    async fn test_check_compatible() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_or_create(dir.path(), OWNER).await.unwrap();

        catalog.check_compatible(Purpose::Backup, "SomeOne@gmail.com").unwrap();
        let err = catalog
            .check_compatible(Purpose::Backup, "other@gmail.com")
            .unwrap_err();
        assert!(matches!(err, CoreError::OwnerMismatch { .. }));
        assert_eq!(err.exit_code(), 3);
        catalog
            .check_compatible(Purpose::Restore, "other@gmail.com")
            .unwrap();
    }

    #[tokio::test]
    async fn test_legacy_without_settings_is_too_old() {
        let dir = TempDir::new().unwrap();
        legacy_catalog(dir.path(), None).await;

        let catalog = Catalog::open_or_create(dir.path(), OWNER).await.unwrap();
        assert_eq!(catalog.version(), 1);
        let err = catalog.check_compatible(Purpose::Restore, OWNER).unwrap_err();
        assert!(matches!(err, CoreError::SchemaTooOld { found: 1, minimum: 2 }));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_newer_schema_is_refused() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_or_create(dir.path(), OWNER).await.unwrap();
        put_setting(&catalog.pool, SETTING_VERSION, "6").await.unwrap();
        drop(catalog);

        let catalog = Catalog::open_or_create(dir.path(), OWNER).await.unwrap();
        let err = catalog.check_compatible(Purpose::Backup, OWNER).unwrap_err();
        assert!(matches!(err, CoreError::SchemaTooNew { found: 6, current: 5 }));
    }

    #[tokio::test]
    async fn test_migrate_from_version_2() {
        let dir = TempDir::new().unwrap();
        legacy_catalog(dir.path(), Some(2)).await;

        let mut catalog = Catalog::open_or_create(dir.path(), OWNER).await.unwrap();
        catalog.check_compatible(Purpose::Backup, OWNER).unwrap();
        assert!(catalog.needs_migration());
        catalog.migrate(Some(99)).await.unwrap();

        assert_eq!(catalog.version(), SCHEMA_VERSION);
        assert_eq!(catalog.uidvalidity(), Some(99));
        assert_eq!(catalog.local_id(&uid(7)).await.unwrap(), Some(7));

        let (labels, flags) = catalog.labels_and_flags(7).await.unwrap();
        assert_eq!(labels, vec!["work"]);
        assert_eq!(flags, vec!["\\Seen"]);

        let msgid: Option<String> =
            sqlx::query_scalar("SELECT rfc822_msgid FROM messages WHERE message_num = 7")
                .fetch_one(&catalog.pool)
                .await
                .unwrap();
        assert_eq!(msgid, None);

        drop(catalog);
        let catalog = Catalog::open_or_create(dir.path(), OWNER).await.unwrap();
        assert_eq!(catalog.version(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_record_message_and_is_captured() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_or_create(dir.path(), OWNER).await.unwrap();

        let mut batch = catalog.begin_batch().await.unwrap();
        let id = batch
            .record_message(
                &meta("a@x", "2020-01-01 00:00:00"),
                "2020/1/1/5-10.eml",
                &uid(10),
                &strings(&["\\Inbox", "work", "work"]),
                &strings(&["\\Seen"]),
            )
            .await
            .unwrap();
        batch.commit().await.unwrap();

        assert_eq!(catalog.message_count().await.unwrap(), 1);
        assert_eq!(catalog.local_id(&uid(10)).await.unwrap(), Some(id));
        assert_eq!(catalog.labels_and_flags(id).await.unwrap().0, vec!["\\Inbox", "work"]);

        // Mapped, but the file is not there yet
        assert!(!catalog.is_captured(&uid(10)).await.unwrap());
        let file = dir.path().join("2020/1/1/5-10.eml");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"x").unwrap();
        assert!(catalog.is_captured(&uid(10)).await.unwrap());
        assert!(!catalog.is_captured(&uid(11)).await.unwrap());

        // Same UID again updates in place
        let mut batch = catalog.begin_batch().await.unwrap();
        let again = batch
            .record_message(
                &meta("a@x", "2020-01-01 00:00:00"),
                "2020/1/1/5-10.eml",
                &uid(10),
                &strings(&["work"]),
                &[],
            )
            .await
            .unwrap();
        batch.commit().await.unwrap();
        assert_eq!(again, id);
        assert_eq!(catalog.message_count().await.unwrap(), 1);
        assert_eq!(catalog.uid_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_uncommitted_batch_is_discarded() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_or_create(dir.path(), OWNER).await.unwrap();

        let mut batch = catalog.begin_batch().await.unwrap();
        batch
            .record_message(&meta("a@x", "2020-01-01 00:00:00"), "f.eml", &uid(1), &[], &[])
            .await
            .unwrap();
        drop(batch);

        assert_eq!(catalog.message_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_reconciles_exactly() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_or_create(dir.path(), OWNER).await.unwrap();

        let mut batch = catalog.begin_batch().await.unwrap();
        let id = batch
            .record_message(
                &meta("a@x", "2020-01-01 00:00:00"),
                "f.eml",
                &uid(3),
                &strings(&["\\Inbox", "old"]),
                &strings(&["\\Seen", "\\Flagged"]),
            )
            .await
            .unwrap();
        batch.commit().await.unwrap();

        let mut batch = catalog.begin_batch().await.unwrap();
        assert!(batch
            .refresh_labels_flags(&uid(3), &strings(&["\\Inbox", "new"]), &strings(&["\\Seen"]))
            .await
            .unwrap());
        assert!(!batch.refresh_labels_flags(&uid(4), &[], &[]).await.unwrap());
        batch.commit().await.unwrap();

        let (mut labels, flags) = catalog.labels_and_flags(id).await.unwrap();
        labels.sort();
        assert_eq!(labels, vec!["\\Inbox", "new"]);
        assert_eq!(flags, vec!["\\Seen"]);
    }

    #[tokio::test]
    async fn test_rebuild_uid_index() {
        let dir = TempDir::new().unwrap();
        let mut catalog = Catalog::open_or_create(dir.path(), OWNER).await.unwrap();

        let mut batch = catalog.begin_batch().await.unwrap();
        let unique = batch
            .record_message(&meta("one@x", "2020-01-01 00:00:00"), "1.eml", &uid(1), &[], &[])
            .await
            .unwrap();
        for n in 2..=3 {
            batch
                .record_message(&meta("dup@x", "2020-01-02 00:00:00"), "d.eml", &uid(n), &[], &[])
                .await
                .unwrap();
        }
        batch.commit().await.unwrap();

        // A message from before Message-IDs were recorded
        let file = dir.path().join("legacy.eml");
        std::fs::write(&file, b"Message-ID: <legacy@x>\r\nSubject: old\r\n\r\nbody\r\n").unwrap();
        sqlx::query(
            "INSERT INTO messages (message_num, message_filename, message_internaldate) \
             VALUES (50, 'legacy.eml', '2019-05-05 05:05:05')",
        )
        .execute(&catalog.pool)
        .await
        .unwrap();

        let entry = |n: u32, id: Option<&str>, date: &str| IndexEntry {
            uid: uid(n),
            message_id: id.map(str::to_string),
            internal_date: date.to_string(),
        };
        let entries = vec![
            entry(101, Some("one@x"), "2020-01-01 00:00:00"),
            entry(102, Some("dup@x"), "2020-01-02 00:00:00"),
            entry(103, Some("legacy@x"), "2019-05-05 05:05:05"),
            entry(104, Some("new@x"), "2021-01-01 00:00:00"),
            entry(105, None, "2021-01-01 00:00:00"),
        ];

        let report = catalog.rebuild_uid_index(&entries, 777).await.unwrap();
        assert_eq!(
            report,
            RebuildReport {
                ids_derived: 1,
                matched: 2,
                ambiguous: 1,
                unmatched: 2,
            }
        );
        assert_eq!(catalog.uidvalidity(), Some(777));
        assert_eq!(catalog.uid_count().await.unwrap(), 2);
        assert_eq!(catalog.local_id(&uid(101)).await.unwrap(), Some(unique));
        assert_eq!(catalog.local_id(&uid(103)).await.unwrap(), Some(50));
        assert_eq!(catalog.local_id(&uid(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_restore_worklist() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_or_create(dir.path(), OWNER).await.unwrap();

        let date = DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z").unwrap();
        let mut batch = catalog.begin_batch().await.unwrap();
        for n in 1..=4 {
            let labels = if n % 2 == 0 { strings(&["\\Inbox"]) } else { strings(&["work"]) };
            let meta = MessageMeta::from_raw(b"Subject: x\r\n\r\n", &date);
            batch
                .record_message(&meta, &format!("{}.eml", n), &uid(n), &labels, &[])
                .await
                .unwrap();
        }
        batch.commit().await.unwrap();

        assert_eq!(catalog.prepare_restore(false, &strings(&["\\Inbox"])).await.unwrap(), 2);
        assert_eq!(catalog.prepare_restore(false, &[]).await.unwrap(), 4);

        let pending = catalog.pending_restore().await.unwrap();
        assert_eq!(pending.len(), 4);
        assert_eq!(pending[0].message_filename, "1.eml");
        assert_eq!(pending[0].message_internaldate, "2020-01-01 00:00:00");

        catalog.finish_restore_entry(pending[0].message_num).await.unwrap();
        catalog.finish_restore_entry(pending[1].message_num).await.unwrap();
        assert_eq!(catalog.prepare_restore(true, &[]).await.unwrap(), 2);
        assert_eq!(catalog.pending_restore().await.unwrap()[0].message_filename, "3.eml");
    }
}
