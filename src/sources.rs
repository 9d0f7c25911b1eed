//! Source registry: which root locations exist and which processors may
//! scan them.
//!
//! Registration persists the domain, the source row and the
//! source↔processor association, and asks the catalog store to create the
//! root URI. Only root sources enter the in-memory index that scans are
//! dispatched from; [`SourceRegistry::load_sources`] rebuilds that index
//! from the database at process start.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::catalog::CatalogStore;
use crate::error::{CatalogError, Result};
use crate::models::{CatalogRecord, PathDescriptor};
use crate::processor::LoadedProcessor;

/// How a source authenticates. Only `none` is exercised by local scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Token,
    Basic,
    OAuth,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::None => "none",
            AuthMode::Token => "token",
            AuthMode::Basic => "basic",
            AuthMode::OAuth => "oauth",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(AuthMode::None),
            "token" => Ok(AuthMode::Token),
            "basic" => Ok(AuthMode::Basic),
            "oauth" => Ok(AuthMode::OAuth),
            other => Err(format!("unknown auth mode: {}", other)),
        }
    }
}

/// One root uri in the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceEntry {
    pub domain: String,
    /// Processors authorised to scan this uri.
    pub processors: BTreeSet<String>,
}

/// All root sources of one artifact type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceGroup {
    pub processors: BTreeSet<String>,
    pub uris: BTreeMap<String, SourceEntry>,
}

/// A persisted source, for listing.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRow {
    pub uri: String,
    pub source_type: String,
    pub domain: String,
    pub auth: String,
    pub root: bool,
    pub processors: Vec<String>,
}

pub struct SourceRegistry {
    pool: SqlitePool,
    index: BTreeMap<String, SourceGroup>,
}

impl SourceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            index: BTreeMap::new(),
        }
    }

    /// Root sources by artifact type.
    pub fn index(&self) -> &BTreeMap<String, SourceGroup> {
        &self.index
    }

    /// Registers `uri` for `processor`, returning its resolved descriptor.
    ///
    /// Fails with `SourceInvalid` when the processor cannot classify the
    /// uri. A concurrent insert of the same source is not an error.
    pub async fn register_source(
        &mut self,
        store: &mut CatalogStore,
        processor: &LoadedProcessor,
        uri: &str,
        is_root: bool,
        auth: AuthMode,
    ) -> Result<PathDescriptor> {
        let descriptor = processor.processor.build_path(uri)?;
        let domain_id = store.ensure_domain(&descriptor.domain).await?;
        let source_id = self
            .source_id(domain_id, &descriptor, auth)
            .await?;

        sqlx::query(
            "INSERT INTO source_processor_map (source_id, processor_id, added)
             VALUES (?, ?, ?)
             ON CONFLICT(source_id, processor_id) DO NOTHING",
        )
        .bind(source_id)
        .bind(processor.id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        if is_root {
            store
                .upsert(&CatalogRecord {
                    processor_id: Some(processor.id),
                    domain: descriptor.domain.clone(),
                    uri_type: descriptor.kind.to_string(),
                    uri: descriptor.uri.clone(),
                    root: true,
                    ..CatalogRecord::default()
                })
                .await?;

            let group = self.index.entry(descriptor.kind.to_string()).or_default();
            let name = processor.processor.name().to_string();
            group.processors.insert(name.clone());
            let entry = group.uris.entry(descriptor.uri.clone()).or_default();
            entry.domain = descriptor.domain.clone();
            entry.processors.insert(name);
        }

        tracing::info!(
            uri = %descriptor.uri,
            kind = %descriptor.kind,
            processor = %processor.processor.name(),
            root = is_root,
            "source registered"
        );
        Ok(descriptor)
    }

    async fn source_id(
        &self,
        domain_id: i64,
        descriptor: &PathDescriptor,
        auth: AuthMode,
    ) -> Result<i64> {
        if let Some(id) = self.find_source(&descriptor.uri).await? {
            return Ok(id);
        }

        let inserted = sqlx::query(
            "INSERT INTO sources (domain_id, source_type, uri, auth, added) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(domain_id)
        .bind(descriptor.kind.as_str())
        .bind(&descriptor.uri)
        .bind(auth.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(err) => {
                let err = CatalogError::from(err);
                if !err.is_unique_violation() {
                    return Err(err);
                }
                tracing::debug!(uri = %descriptor.uri, "source inserted concurrently, re-fetching");
                self.find_source(&descriptor.uri)
                    .await?
                    .ok_or(err)
            }
        }
    }

    async fn find_source(&self, uri: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM sources WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// Rebuilds the index from live root sources and returns it.
    pub async fn load_sources(&mut self) -> Result<&BTreeMap<String, SourceGroup>> {
        let rows = sqlx::query(
            r#"
            SELECT s.uri, s.source_type, d.name AS domain, p.name AS processor
            FROM sources s
            JOIN domains d ON d.id = s.domain_id
            JOIN source_processor_map m ON m.source_id = s.id
            JOIN processors p ON p.id = m.processor_id
            JOIN uris u
                ON u.domain_id = s.domain_id AND u.uri = s.uri AND u.container = ''
            WHERE u.root = 1 AND u.deleted IS NULL
            ORDER BY s.source_type, s.uri
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut index: BTreeMap<String, SourceGroup> = BTreeMap::new();
        for row in rows {
            let source_type: String = row.get("source_type");
            let processor: String = row.get("processor");
            let group = index.entry(source_type).or_default();
            group.processors.insert(processor.clone());
            let entry = group.uris.entry(row.get("uri")).or_default();
            entry.domain = row.get("domain");
            entry.processors.insert(processor);
        }

        tracing::debug!(types = index.len(), "sources loaded");
        self.index = index;
        Ok(&self.index)
    }

    /// Every persisted source with its processors.
    pub async fn list_sources(&self) -> Result<Vec<SourceRow>> {
        let rows = sqlx::query(
            r#"
            SELECT s.uri, s.source_type, s.auth, d.name AS domain,
                   COALESCE(MAX(u.root), 0) AS root,
                   GROUP_CONCAT(p.name, ',') AS processors
            FROM sources s
            JOIN domains d ON d.id = s.domain_id
            LEFT JOIN source_processor_map m ON m.source_id = s.id
            LEFT JOIN processors p ON p.id = m.processor_id
            LEFT JOIN uris u
                ON u.domain_id = s.domain_id AND u.uri = s.uri AND u.container = ''
            GROUP BY s.id
            ORDER BY s.uri
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let processors: Option<String> = row.get("processors");
                let root: i64 = row.get("root");
                SourceRow {
                    uri: row.get("uri"),
                    source_type: row.get("source_type"),
                    domain: row.get("domain"),
                    auth: row.get("auth"),
                    root: root != 0,
                    processors: processors
                        .map(|p| p.split(',').map(str::to_string).collect())
                        .unwrap_or_default(),
                }
            })
            .collect())
    }
}
