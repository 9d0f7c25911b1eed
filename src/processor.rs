//! Processor capability contract and the registry that resolves, persists
//! and indexes processor implementations.
//!
//! A processor is either a scanner (turns a registered source into catalog
//! records by walking it) or a parser (turns cataloged URIs selected by its
//! declared filters into version metadata), or both. Implementations are
//! looked up by a symbolic reference such as `scanner.filesystem`; the
//! reference is a registry key, never a code-loading path.
//!
//! # Example
//!
//! ```rust
//! use artifact_catalog::config::ProcessorSettings;
//! use artifact_catalog::processor::ProcessorRegistry;
//!
//! let registry = ProcessorRegistry::with_builtins();
//! let scanner = registry
//!     .resolve("scanner.filesystem", &ProcessorSettings::default())
//!     .unwrap();
//! assert_eq!(scanner.name(), "filesystem_scanner");
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{ProcessorSettings, ThreadOverrides};
use crate::error::{CatalogError, Result};
use crate::extract;
use crate::models::{CatalogRecord, PathDescriptor, WorkItem};
use crate::scanner;

/// One criterion a parser uses to select cataloged URIs.
///
/// `table` names the table class (`uris`, `uri_metadata`,
/// `version_metadata`, or an accepted alias). `field` is the column
/// compared with `select`. For the metadata classes, `filter` further
/// restricts the row's `value` to the listed values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub table: String,
    pub field: String,
    pub select: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<String>>,
}

/// What a processor declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    /// Artifact types this processor handles (`folder`, `file`, `archived`, ...).
    #[serde(default)]
    pub artifact_types: Vec<String>,
    #[serde(default)]
    pub source_filters: Vec<FilterClause>,
    /// URI metadata keys pivoted into each parse work item.
    #[serde(default)]
    pub uri_metadata_keys: Vec<String>,
    /// Version metadata keys pivoted into each parse work item.
    #[serde(default)]
    pub version_metadata_keys: Vec<String>,
    #[serde(default)]
    pub threads: ThreadOverrides,
    /// Persisted to `processor_metadata` on first registration.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Outcome of scanning one source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub domain: String,
    pub root: String,
    /// Walk problems; a root with any is not swept for missing items.
    pub errors: usize,
}

/// The writing half of the shared output queue, stamped with the
/// emitting processor's id.
#[derive(Clone)]
pub struct RecordSink {
    tx: async_channel::Sender<CatalogRecord>,
    processor_id: Option<i64>,
}

impl RecordSink {
    pub fn new(tx: async_channel::Sender<CatalogRecord>, processor_id: Option<i64>) -> Self {
        Self { tx, processor_id }
    }

    /// Pushes a record, blocking while the queue is full.
    ///
    /// Returns `false` once the consumer has gone away; callers should stop
    /// producing.
    pub fn emit(&self, mut record: CatalogRecord) -> bool {
        if record.processor_id.is_none() {
            record.processor_id = self.processor_id;
        }
        self.tx.send_blocking(record).is_ok()
    }
}

/// The capability set every processor provides.
///
/// Per-item work is synchronous; the pipeline runs it on blocking worker
/// threads and owns the queues, so a processor never sees them directly.
pub trait Processor: Send + Sync {
    /// Unique processor name, persisted on the processor row.
    fn name(&self) -> &str;

    /// The registry key this processor was resolved from.
    fn reference(&self) -> &str;

    fn avail_config(&self) -> ProcessorConfig;

    /// Classifies and decomposes a source uri.
    fn build_path(&self, uri: &str) -> Result<PathDescriptor>;

    fn can_scan(&self) -> bool {
        false
    }

    /// Scans one registered source, emitting records for everything found.
    fn scan_item(&self, item: &WorkItem, sink: &RecordSink) -> Result<Option<ScanReport>> {
        let _ = (item, sink);
        Ok(None)
    }

    fn can_parse(&self) -> bool {
        false
    }

    /// Extracts metadata for one cataloged URI.
    fn parse_item(&self, item: &WorkItem, sink: &RecordSink) -> Result<()> {
        let _ = (item, sink);
        Ok(())
    }
}

/// Builds a processor instance from its settings.
pub type ProcessorFactory = fn(&ProcessorSettings) -> Result<Arc<dyn Processor>>;

/// A processor known to the catalog, with its row id.
#[derive(Clone)]
pub struct LoadedProcessor {
    pub id: i64,
    pub processor: Arc<dyn Processor>,
    pub settings: ProcessorSettings,
}

/// Resolves references to implementations and indexes loaded processors
/// by name and by artifact type.
pub struct ProcessorRegistry {
    factories: BTreeMap<String, ProcessorFactory>,
    processors: BTreeMap<String, LoadedProcessor>,
    by_type: BTreeMap<String, Vec<String>>,
}

impl ProcessorRegistry {
    /// An empty registry with no factories.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
            processors: BTreeMap::new(),
            by_type: BTreeMap::new(),
        }
    }

    /// A registry knowing the built-in scanner and parsers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.add_factory(scanner::REFERENCE, scanner::FilesystemScanner::factory);
        registry.add_factory(extract::DIGEST_REFERENCE, extract::digest_factory);
        registry.add_factory(extract::DOCX_REFERENCE, extract::docx_factory);
        registry
    }

    pub fn add_factory(&mut self, reference: &str, factory: ProcessorFactory) {
        self.factories.insert(reference.to_string(), factory);
    }

    /// References that [`resolve`](Self::resolve) accepts.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiates the implementation behind `reference`.
    pub fn resolve(
        &self,
        reference: &str,
        settings: &ProcessorSettings,
    ) -> Result<Arc<dyn Processor>> {
        let factory = self.factories.get(reference).ok_or_else(|| {
            CatalogError::failed_to_load(reference, "no implementation for this reference")
        })?;
        factory(settings).map_err(|err| match err {
            CatalogError::ClassFailedToLoad { .. } => err,
            other => CatalogError::failed_to_load(reference, other.to_string()),
        })
    }

    /// Persists the processor with its declared metadata and indexes it
    /// under each declared artifact type. Re-registering an existing name
    /// replaces its stored settings.
    pub async fn register(
        &mut self,
        pool: &SqlitePool,
        processor: Arc<dyn Processor>,
        settings: ProcessorSettings,
    ) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let declared = processor.avail_config();
        let settings_json = serde_json::to_string(&settings)?;

        sqlx::query(
            "INSERT INTO processors (name, reference, settings, added)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE
                 SET settings = excluded.settings, reference = excluded.reference",
        )
        .bind(processor.name())
        .bind(processor.reference())
        .bind(&settings_json)
        .bind(now)
        .execute(pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM processors WHERE name = ?")
            .bind(processor.name())
            .fetch_one(pool)
            .await?;

        for (key, value) in &declared.metadata {
            sqlx::query(
                "INSERT INTO processor_metadata (processor_id, key, value, added, modified)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(processor_id, key) DO NOTHING",
            )
            .bind(id)
            .bind(key)
            .bind(value)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await?;
        }

        tracing::info!(processor = %processor.name(), id, "processor registered");
        self.insert(id, processor, settings);
        Ok(id)
    }

    /// Rebuilds the registry from persisted processor rows.
    ///
    /// A row whose implementation cannot be instantiated is logged and
    /// skipped. Returns the number of processors loaded.
    pub async fn load(&mut self, pool: &SqlitePool) -> Result<usize> {
        let rows = sqlx::query("SELECT id, name, reference, settings FROM processors ORDER BY id")
            .fetch_all(pool)
            .await?;

        let mut loaded = 0;
        for row in rows {
            let id: i64 = row.get("id");
            let name: String = row.get("name");
            let reference: String = row.get("reference");
            let settings_json: String = row.get("settings");

            let settings: ProcessorSettings = match serde_json::from_str(&settings_json) {
                Ok(settings) => settings,
                Err(err) => {
                    tracing::error!(processor = %name, error = %err, "unreadable processor settings, skipping");
                    continue;
                }
            };

            match self.resolve(&reference, &settings) {
                Ok(processor) => {
                    if processor.name() != name {
                        tracing::warn!(
                            stored = %name,
                            resolved = %processor.name(),
                            "processor name changed since registration"
                        );
                    }
                    self.insert(id, processor, settings);
                    loaded += 1;
                }
                Err(err) => {
                    tracing::error!(processor = %name, reference = %reference, error = %err, "skipping processor");
                }
            }
        }
        Ok(loaded)
    }

    /// Indexes `processor_name` as a handler for `artifact_type`.
    pub fn add_type_handler(&mut self, artifact_type: &str, processor_name: &str) {
        let handlers = self.by_type.entry(artifact_type.to_string()).or_default();
        if !handlers.iter().any(|h| h == processor_name) {
            handlers.push(processor_name.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<&LoadedProcessor> {
        self.processors.get(name)
    }

    /// Processors declaring support for `artifact_type`, in registration order.
    pub fn handlers_for(&self, artifact_type: &str) -> Vec<&LoadedProcessor> {
        self.by_type
            .get(artifact_type)
            .map(|names| names.iter().filter_map(|n| self.processors.get(n)).collect())
            .unwrap_or_default()
    }

    pub fn processors(&self) -> impl Iterator<Item = &LoadedProcessor> {
        self.processors.values()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    fn insert(&mut self, id: i64, processor: Arc<dyn Processor>, settings: ProcessorSettings) {
        let name = processor.name().to_string();
        for artifact_type in processor.avail_config().artifact_types {
            self.add_type_handler(&artifact_type, &name);
        }
        self.processors.insert(
            name,
            LoadedProcessor {
                id,
                processor,
                settings,
            },
        );
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn pool(tmp: &TempDir) -> SqlitePool {
        let pool = db::connect_path(&tmp.path().join("catalog.sqlite"))
            .await
            .unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        pool
    }

    #[test]
    fn test_resolve_unknown_reference() {
        let registry = ProcessorRegistry::with_builtins();
        let err = registry
            .resolve("scanner.nowhere", &ProcessorSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, CatalogError::ClassFailedToLoad { .. }));
    }

    #[test]
    fn test_resolve_bad_options_fails_to_load() {
        let registry = ProcessorRegistry::with_builtins();
        let mut settings = ProcessorSettings::default();
        settings
            .options
            .insert("hash".into(), serde_json::json!("definitely"));
        let err = registry
            .resolve(scanner::REFERENCE, &settings)
            .err()
            .unwrap();
        assert!(matches!(err, CatalogError::ClassFailedToLoad { .. }));
    }

    #[test]
    fn test_builtins_declare_types() {
        let registry = ProcessorRegistry::with_builtins();
        let refs: Vec<&str> = registry.references().collect();
        assert_eq!(refs, vec!["parser.digest", "parser.docx", "scanner.filesystem"]);

        let scanner = registry
            .resolve(scanner::REFERENCE, &ProcessorSettings::default())
            .unwrap();
        assert!(scanner.can_scan());
        assert!(!scanner.can_parse());
        // Only parsers select work through source filters.
        assert!(scanner.avail_config().source_filters.is_empty());
        assert!(scanner
            .avail_config()
            .artifact_types
            .contains(&"folder".to_string()));

        let digest = registry
            .resolve(extract::DIGEST_REFERENCE, &ProcessorSettings::default())
            .unwrap();
        assert!(digest.can_parse());
        assert!(!digest.avail_config().source_filters.is_empty());
    }

    #[tokio::test]
    async fn test_register_then_reload() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        let mut registry = ProcessorRegistry::with_builtins();
        let scanner = registry
            .resolve(scanner::REFERENCE, &ProcessorSettings::default())
            .unwrap();
        let id = registry
            .register(&pool, scanner.clone(), ProcessorSettings::default())
            .await
            .unwrap();
        let again = registry
            .register(&pool, scanner, ProcessorSettings::default())
            .await
            .unwrap();
        assert_eq!(id, again);

        sqlx::query(
            "INSERT INTO processors (name, reference, settings, added) VALUES ('ghost', 'parser.ghost', '{}', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let mut reloaded = ProcessorRegistry::with_builtins();
        let count = reloaded.load(&pool).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(reloaded.get("filesystem_scanner").map(|p| p.id), Some(id));
        assert!(reloaded.get("ghost").is_none());
        assert_eq!(reloaded.handlers_for("folder").len(), 1);
        assert!(reloaded.handlers_for("archived").is_empty());
    }

    #[tokio::test]
    async fn test_reregister_replaces_stored_settings() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        let mut registry = ProcessorRegistry::with_builtins();
        let defaults = ProcessorSettings::default();
        let scanner = registry.resolve(scanner::REFERENCE, &defaults).unwrap();
        let id = registry.register(&pool, scanner, defaults).await.unwrap();

        let mut hashed = ProcessorSettings::default();
        hashed.options.insert("hash".into(), serde_json::json!(true));
        hashed.threads.count = Some(1);
        let scanner = registry.resolve(scanner::REFERENCE, &hashed).unwrap();
        let again = registry.register(&pool, scanner, hashed).await.unwrap();
        assert_eq!(id, again);

        let mut reloaded = ProcessorRegistry::with_builtins();
        assert_eq!(reloaded.load(&pool).await.unwrap(), 1);
        let loaded = reloaded.get("filesystem_scanner").unwrap();
        assert_eq!(loaded.settings.threads.count, Some(1));
        assert_eq!(
            loaded.settings.options.get("hash"),
            Some(&serde_json::json!(true))
        );
        assert_eq!(
            loaded.processor.avail_config().options.get("hash"),
            Some(&serde_json::json!(true))
        );
    }

    #[tokio::test]
    async fn test_register_persists_declared_metadata() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        let mut registry = ProcessorRegistry::with_builtins();
        let docx = registry
            .resolve(extract::DOCX_REFERENCE, &ProcessorSettings::default())
            .unwrap();
        let declared = docx.avail_config().metadata;
        let id = registry
            .register(&pool, docx, ProcessorSettings::default())
            .await
            .unwrap();

        let stored: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM processor_metadata WHERE processor_id = ?")
                .bind(id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(stored as usize, declared.len());
        assert!(!declared.is_empty());
    }
}
