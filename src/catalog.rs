//! Versioned catalog store.
//!
//! The single writer of URI, version and metadata rows. [`CatalogStore::drain`]
//! consumes the shared output queue inside one transaction, giving each
//! record its own savepoint so a failing record rolls back alone.
//!
//! Per record:
//!
//! 1. Resolve the domain and the URI, scoped by container for archive
//!    entries, creating either if absent. Re-observing a soft-deleted URI
//!    revives it.
//! 2. Diff URI metadata: empty incoming values are skipped, absent keys are
//!    inserted, changed values are updated with a fresh `modified`.
//! 3. Resolve the version. `latest` (or no `modified`) selects rank 1 of
//!    `modified DESC, id ASC`; an incoming `size` or `modified` that differs
//!    from that row means a new version instead. Otherwise the version is
//!    matched exactly on `(modified, size)`; no match means a new version
//!    row. A checksum arriving for an otherwise identical version is
//!    corrected in place.
//! 4. Diff version metadata like URI metadata, except empty values are
//!    written too.

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Connection, Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};

use crate::error::{CatalogError, Result};
use crate::models::{CatalogRecord, DrainStats, VersionRecord};

/// Milliseconds since the epoch, the unit of every bookkeeping timestamp.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A URI with its metadata and one selected version.
#[derive(Debug, Clone, Serialize)]
pub struct UriTree {
    pub uri_id: i64,
    pub uri: String,
    pub uri_type: String,
    pub domain: String,
    pub container: Option<String>,
    pub root: bool,
    pub added: i64,
    pub deleted: Option<i64>,
    pub metadata: BTreeMap<String, String>,
    pub version: Option<VersionTree>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionTree {
    pub version_id: i64,
    pub modified: Option<i64>,
    pub size: Option<i64>,
    pub checksum: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordStatus {
    Added,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy)]
struct Applied {
    uri_id: i64,
    status: RecordStatus,
    version_added: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct VersionOutcome {
    added: bool,
    changed: bool,
}

type UriKey = (i64, String, String);

/// Row-id cache for domains and URIs.
///
/// Ids learned inside a record's savepoint stay pending until the
/// savepoint is released; a rollback discards them.
#[derive(Debug, Default)]
struct RepositoryCache {
    domains: HashMap<String, i64>,
    uris: HashMap<UriKey, i64>,
    pending_domains: Vec<(String, i64)>,
    pending_uris: Vec<(UriKey, i64)>,
}

impl RepositoryCache {
    fn domain(&self, name: &str) -> Option<i64> {
        self.domains.get(name).copied().or_else(|| {
            self.pending_domains
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, id)| *id)
        })
    }

    fn uri(&self, key: &UriKey) -> Option<i64> {
        self.uris.get(key).copied().or_else(|| {
            self.pending_uris
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, id)| *id)
        })
    }

    fn stage_domain(&mut self, name: &str, id: i64) {
        self.pending_domains.push((name.to_string(), id));
    }

    fn stage_uri(&mut self, key: UriKey, id: i64) {
        self.pending_uris.push((key, id));
    }

    fn commit_pending(&mut self) {
        self.domains.extend(self.pending_domains.drain(..));
        self.uris.extend(self.pending_uris.drain(..));
    }

    fn discard_pending(&mut self) {
        self.pending_domains.clear();
        self.pending_uris.clear();
    }

    fn clear(&mut self) {
        self.discard_pending();
        self.domains.clear();
        self.uris.clear();
    }
}

pub struct CatalogStore {
    pool: SqlitePool,
    cache: RepositoryCache,
}

impl CatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            cache: RepositoryCache::default(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Consumes records until the queue is closed and empty, committing
    /// once at the end.
    pub async fn drain(
        &mut self,
        rx: async_channel::Receiver<CatalogRecord>,
    ) -> Result<DrainStats> {
        match self.drain_inner(rx).await {
            Ok(stats) => {
                tracing::info!(
                    added = stats.added,
                    updated = stats.updated,
                    unchanged = stats.unchanged,
                    failed = stats.failed,
                    "drain committed"
                );
                Ok(stats)
            }
            Err(err) => {
                // Nothing of this drain reached disk.
                self.cache.clear();
                Err(err)
            }
        }
    }

    async fn drain_inner(
        &mut self,
        rx: async_channel::Receiver<CatalogRecord>,
    ) -> Result<DrainStats> {
        let mut stats = DrainStats::default();
        let mut tx = self.pool.begin().await?;

        while let Ok(record) = rx.recv().await {
            let mut savepoint = Connection::begin(&mut *tx).await?;
            match self.apply(&mut savepoint, &record, now_ms()).await {
                Ok(applied) => {
                    savepoint.commit().await?;
                    self.cache.commit_pending();
                    match applied.status {
                        RecordStatus::Added => stats.added += 1,
                        RecordStatus::Updated => stats.updated += 1,
                        RecordStatus::Unchanged => stats.unchanged += 1,
                    }
                    if applied.version_added {
                        stats.versions_added += 1;
                    }
                }
                Err(err) => {
                    savepoint.rollback().await?;
                    self.cache.discard_pending();
                    stats.failed += 1;
                    tracing::warn!(
                        uri = %record.uri,
                        container = record.container().unwrap_or(""),
                        error = %err,
                        "record rolled back"
                    );
                }
            }
        }

        tx.commit().await?;
        Ok(stats)
    }

    /// Writes a single record in its own transaction. Returns the URI id.
    pub async fn upsert(&mut self, record: &CatalogRecord) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        match self.apply(&mut tx, record, now_ms()).await {
            Ok(applied) => {
                if let Err(err) = tx.commit().await {
                    self.cache.discard_pending();
                    return Err(err.into());
                }
                self.cache.commit_pending();
                Ok(applied.uri_id)
            }
            Err(err) => {
                self.cache.discard_pending();
                Err(err)
            }
        }
    }

    /// Creates the domain if absent and returns its id.
    pub async fn ensure_domain(&mut self, name: &str) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        let id = self.domain_id(&mut conn, name).await?;
        self.cache.commit_pending();
        Ok(id)
    }

    async fn apply(
        &mut self,
        conn: &mut SqliteConnection,
        record: &CatalogRecord,
        now: i64,
    ) -> Result<Applied> {
        let (uri_id, created) = match record.uri_id {
            Some(id) => {
                let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM uris WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *conn)
                    .await?;
                match exists {
                    Some(id) => (id, false),
                    None => return Err(CatalogError::UnknownUri(id)),
                }
            }
            None => {
                let domain_id = self.domain_id(conn, &record.domain).await?;
                self.uri_id(conn, domain_id, record, now).await?
            }
        };

        let mut changed = false;
        if !created {
            let revived = sqlx::query(
                "UPDATE uris SET deleted = NULL WHERE id = ? AND deleted IS NOT NULL",
            )
            .bind(uri_id)
            .execute(&mut *conn)
            .await?
            .rows_affected()
                > 0;
            if revived {
                tracing::debug!(uri = %record.uri, "uri reappeared");
                changed = true;
            }

            sqlx::query("UPDATE uris SET last_seen = ? WHERE id = ?")
                .bind(now)
                .bind(uri_id)
                .execute(&mut *conn)
                .await?;

            if record.root {
                let promoted = sqlx::query("UPDATE uris SET root = 1 WHERE id = ? AND root = 0")
                    .bind(uri_id)
                    .execute(&mut *conn)
                    .await?
                    .rows_affected();
                changed |= promoted > 0;
            }
        }

        changed |= upsert_uri_metadata(conn, uri_id, &record.metadata, now).await?;
        let version = upsert_version(conn, uri_id, &record.uri, &record.versions, now).await?;
        changed |= version.added || version.changed;

        let status = if created {
            RecordStatus::Added
        } else if changed {
            RecordStatus::Updated
        } else {
            RecordStatus::Unchanged
        };

        Ok(Applied {
            uri_id,
            status,
            version_added: version.added,
        })
    }

    async fn domain_id(&mut self, conn: &mut SqliteConnection, name: &str) -> Result<i64> {
        if let Some(id) = self.cache.domain(name) {
            return Ok(id);
        }

        sqlx::query("INSERT INTO domains (name, added) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .bind(now_ms())
            .execute(&mut *conn)
            .await?;
        let id: i64 = sqlx::query_scalar("SELECT id FROM domains WHERE name = ?")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;

        self.cache.stage_domain(name, id);
        Ok(id)
    }

    /// Returns the URI id and whether it was created.
    async fn uri_id(
        &mut self,
        conn: &mut SqliteConnection,
        domain_id: i64,
        record: &CatalogRecord,
        now: i64,
    ) -> Result<(i64, bool)> {
        let container = record.container().unwrap_or("").to_string();
        let key: UriKey = (domain_id, record.uri.clone(), container);
        if let Some(id) = self.cache.uri(&key) {
            return Ok((id, false));
        }

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM uris WHERE domain_id = ? AND uri = ? AND container = ?",
        )
        .bind(domain_id)
        .bind(&key.1)
        .bind(&key.2)
        .fetch_optional(&mut *conn)
        .await?;

        let (id, created) = match existing {
            Some(id) => (id, false),
            None => {
                let id = sqlx::query(
                    "INSERT INTO uris (domain_id, uri, uri_type, container, root, added, last_seen)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(domain_id)
                .bind(&key.1)
                .bind(&record.uri_type)
                .bind(&key.2)
                .bind(record.root)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await?
                .last_insert_rowid();
                (id, true)
            }
        };

        self.cache.stage_uri(key, id);
        Ok((id, created))
    }

    /// Id of the newest version of a URI; ties on `modified` go to the
    /// lowest id.
    pub async fn latest_version_id(&self, uri_id: i64) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        latest_version_id(&mut conn, uri_id).await
    }

    /// Soft-deletes URIs under `root` in `domain` not seen since `seen_since`.
    ///
    /// Archive entries whose container lies under the root are included.
    /// Registered roots are never swept. Returns the number of URIs marked.
    pub async fn sweep_missing(&self, domain: &str, root: &str, seen_since: i64) -> Result<u64> {
        let trimmed = root.trim_end_matches(&['/', '\\'][..]);
        let prefix = format!("{}{}", trimmed, std::path::MAIN_SEPARATOR);
        let prefix_len = prefix.chars().count() as i64;

        let swept = sqlx::query(
            "UPDATE uris SET deleted = ?
             WHERE deleted IS NULL
               AND root = 0
               AND last_seen < ?
               AND domain_id = (SELECT id FROM domains WHERE name = ?)
               AND (uri = ? OR substr(uri, 1, ?) = ?
                    OR container = ? OR substr(container, 1, ?) = ?)",
        )
        .bind(now_ms())
        .bind(seen_since)
        .bind(domain)
        .bind(trimmed)
        .bind(prefix_len)
        .bind(&prefix)
        .bind(trimmed)
        .bind(prefix_len)
        .bind(&prefix)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if swept > 0 {
            tracing::info!(root = %root, swept, "marked missing uris deleted");
        }
        Ok(swept)
    }

    /// Loads a URI (optionally container-scoped), its metadata, and either
    /// the version at `modified` or the latest one.
    pub async fn fetch_tree(
        &self,
        uri: &str,
        container: Option<&str>,
        modified: Option<i64>,
    ) -> Result<Option<UriTree>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT u.id, u.uri, u.uri_type, u.container, u.root, u.added, u.deleted, d.name AS domain
             FROM uris u JOIN domains d ON d.id = u.domain_id
             WHERE u.uri = ? AND u.container = ?
             ORDER BY u.id LIMIT 1",
        )
        .bind(uri)
        .bind(container.unwrap_or(""))
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let uri_id: i64 = row.get("id");
        let container: String = row.get("container");
        let metadata = load_metadata(&mut conn, "uri_metadata", "uri_id", uri_id).await?;

        let version_id = match modified {
            Some(modified) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM versions WHERE uri_id = ? AND modified = ? ORDER BY id DESC LIMIT 1",
                )
                .bind(uri_id)
                .bind(modified)
                .fetch_optional(&mut *conn)
                .await?
            }
            None => latest_version_id(&mut conn, uri_id).await?,
        };

        let version = match version_id {
            Some(version_id) => {
                let v = sqlx::query("SELECT modified, size, checksum FROM versions WHERE id = ?")
                    .bind(version_id)
                    .fetch_one(&mut *conn)
                    .await?;
                Some(VersionTree {
                    version_id,
                    modified: v.get("modified"),
                    size: v.get("size"),
                    checksum: v.get("checksum"),
                    metadata: load_metadata(&mut conn, "version_metadata", "version_id", version_id)
                        .await?,
                })
            }
            None => None,
        };

        Ok(Some(UriTree {
            uri_id,
            uri: row.get("uri"),
            uri_type: row.get("uri_type"),
            domain: row.get("domain"),
            container: (!container.is_empty()).then_some(container),
            root: row.get("root"),
            added: row.get("added"),
            deleted: row.get("deleted"),
            metadata,
            version,
        }))
    }
}

async fn latest_version_id(conn: &mut SqliteConnection, uri_id: i64) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM (
             SELECT id, RANK() OVER (PARTITION BY uri_id ORDER BY modified DESC, id ASC) AS rnk
             FROM versions WHERE uri_id = ?
         ) WHERE rnk = 1",
    )
    .bind(uri_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

/// `table` and `owner` are fixed identifiers from this module.
async fn load_metadata(
    conn: &mut SqliteConnection,
    table: &str,
    owner: &str,
    owner_id: i64,
) -> Result<BTreeMap<String, String>> {
    let rows = sqlx::query(&format!(
        "SELECT key, value FROM {} WHERE {} = ?",
        table, owner
    ))
    .bind(owner_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
        .collect())
}

/// Returns true when any key was inserted or updated.
async fn upsert_uri_metadata(
    conn: &mut SqliteConnection,
    uri_id: i64,
    incoming: &BTreeMap<String, String>,
    now: i64,
) -> Result<bool> {
    if incoming.values().all(|v| v.is_empty()) {
        return Ok(false);
    }
    let existing = load_metadata(conn, "uri_metadata", "uri_id", uri_id).await?;
    let mut changed = false;

    for (key, value) in incoming {
        if value.is_empty() {
            continue;
        }
        match existing.get(key) {
            None => {
                sqlx::query(
                    "INSERT INTO uri_metadata (uri_id, key, value, added, modified) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(uri_id)
                .bind(key)
                .bind(value)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await?;
                changed = true;
            }
            Some(old) if old != value => {
                sqlx::query(
                    "UPDATE uri_metadata SET value = ?, modified = ? WHERE uri_id = ? AND key = ?",
                )
                .bind(value)
                .bind(now)
                .bind(uri_id)
                .bind(key)
                .execute(&mut *conn)
                .await?;
                changed = true;
            }
            Some(_) => {}
        }
    }
    Ok(changed)
}

async fn upsert_version(
    conn: &mut SqliteConnection,
    uri_id: i64,
    uri: &str,
    version: &VersionRecord,
    now: i64,
) -> Result<VersionOutcome> {
    let mut outcome = VersionOutcome::default();

    let version_id = match version.modified {
        Some(modified) if !version.latest => {
            match_or_insert_version(conn, uri_id, Some(modified), version, now, &mut outcome)
                .await?
        }
        _ => match latest_version_id(conn, uri_id).await? {
            Some(id) => {
                let row = sqlx::query("SELECT modified, size FROM versions WHERE id = ?")
                    .bind(id)
                    .fetch_one(&mut *conn)
                    .await?;
                let stored_modified: Option<i64> = row.get("modified");
                let stored_size: Option<i64> = row.get("size");

                let size_differs = version.size.is_some() && version.size != stored_size;
                let modified_differs =
                    version.modified.is_some() && version.modified != stored_modified;
                if size_differs || modified_differs {
                    let modified = version.modified.or(stored_modified);
                    match_or_insert_version(conn, uri_id, modified, version, now, &mut outcome)
                        .await?
                } else {
                    id
                }
            }
            None => {
                if !version.version_metadata.is_empty() {
                    tracing::warn!(uri = %uri, "no version to attach metadata to, skipping");
                }
                return Ok(outcome);
            }
        },
    };

    if version.version_metadata.is_empty() {
        return Ok(outcome);
    }

    let existing = load_metadata(conn, "version_metadata", "version_id", version_id).await?;
    for (key, value) in &version.version_metadata {
        match existing.get(key) {
            None => {
                sqlx::query(
                    "INSERT INTO version_metadata (version_id, key, value, added, modified) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(version_id)
                .bind(key)
                .bind(value)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await?;
                outcome.changed = true;
            }
            Some(old) if old != value => {
                sqlx::query(
                    "UPDATE version_metadata SET value = ?, modified = ? WHERE version_id = ? AND key = ?",
                )
                .bind(value)
                .bind(now)
                .bind(version_id)
                .bind(key)
                .execute(&mut *conn)
                .await?;
                outcome.changed = true;
            }
            Some(_) => {}
        }
    }

    Ok(outcome)
}

/// Finds the version matching `(modified, size)` exactly, correcting its
/// checksum when one arrives, or inserts a new row.
async fn match_or_insert_version(
    conn: &mut SqliteConnection,
    uri_id: i64,
    modified: Option<i64>,
    version: &VersionRecord,
    now: i64,
    outcome: &mut VersionOutcome,
) -> Result<i64> {
    let row = sqlx::query(
        "SELECT id, checksum FROM versions WHERE uri_id = ? AND modified IS ? AND size IS ?",
    )
    .bind(uri_id)
    .bind(modified)
    .bind(version.size)
    .fetch_optional(&mut *conn)
    .await?;

    let id = match row {
        Some(row) => {
            let id: i64 = row.get("id");
            let stored: Option<String> = row.get("checksum");
            if version.checksum.is_some() && stored != version.checksum {
                sqlx::query("UPDATE versions SET checksum = ? WHERE id = ?")
                    .bind(&version.checksum)
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                outcome.changed = true;
            }
            id
        }
        None => {
            outcome.added = true;
            sqlx::query(
                "INSERT INTO versions (uri_id, modified, size, checksum, added) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(uri_id)
            .bind(modified)
            .bind(version.size)
            .bind(&version.checksum)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid()
        }
    };
    Ok(id)
}
