//! Built-in filesystem scanner (`scanner.filesystem`).
//!
//! Walks a registered folder (or single file) and emits one catalog record
//! per artifact, followed by one record per entry of any recognised
//! archive. Walk options come from the processor's settings.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::ProcessorSettings;
use crate::error::{CatalogError, Result};
use crate::models::{
    ArtifactDescriptor, ArtifactUri, CatalogRecord, PathDescriptor, VersionRecord, WorkItem,
    CONTAINER_KEY,
};
use crate::processor::{Processor, ProcessorConfig, RecordSink, ScanReport};
use crate::walker::{self, WalkOptions};

pub const REFERENCE: &str = "scanner.filesystem";

pub struct FilesystemScanner {
    options: WalkOptions,
}

impl FilesystemScanner {
    pub fn new(options: WalkOptions) -> Self {
        Self { options }
    }

    /// Registry factory; `settings.options` deserialize into [`WalkOptions`].
    pub fn factory(settings: &ProcessorSettings) -> Result<Arc<dyn Processor>> {
        let options: WalkOptions =
            serde_json::from_value(Value::Object(settings.options.clone()))
                .map_err(|e| CatalogError::failed_to_load(REFERENCE, e.to_string()))?;
        Ok(Arc::new(Self::new(options)))
    }
}

impl Processor for FilesystemScanner {
    fn name(&self) -> &str {
        "filesystem_scanner"
    }

    fn reference(&self) -> &str {
        REFERENCE
    }

    fn avail_config(&self) -> ProcessorConfig {
        let options = match serde_json::to_value(&self.options) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        ProcessorConfig {
            options,
            artifact_types: vec!["folder".to_string(), "file".to_string()],
            metadata: BTreeMap::from([(
                "description".to_string(),
                "Walks local folders and archive containers".to_string(),
            )]),
            ..ProcessorConfig::default()
        }
    }

    fn build_path(&self, uri: &str) -> Result<PathDescriptor> {
        walker::build_path(uri)
    }

    fn can_scan(&self) -> bool {
        true
    }

    fn scan_item(&self, item: &WorkItem, sink: &RecordSink) -> Result<Option<ScanReport>> {
        let domain = item.domain.clone().unwrap_or_else(walker::local_domain);
        let mut walk = walker::walk(Path::new(&item.uri), &self.options)?;
        let mut emitted = 0usize;
        let mut closed = false;

        'walk: for descriptor in walk.by_ref() {
            for record in records_for(&descriptor, &domain) {
                if !sink.emit(record) {
                    closed = true;
                    break 'walk;
                }
                emitted += 1;
            }
        }

        let mut errors = walk.errors();
        if closed {
            tracing::warn!(root = %item.uri, "output queue closed, scan cut short");
            errors += 1;
        }
        tracing::debug!(root = %item.uri, emitted, errors, "scan finished");

        Ok(Some(ScanReport {
            domain,
            root: item.uri.clone(),
            errors,
        }))
    }
}

/// The record for an artifact followed by the records for its entries.
fn records_for(descriptor: &ArtifactDescriptor, domain: &str) -> Vec<CatalogRecord> {
    let mut records = Vec::with_capacity(1 + descriptor.entries.len());
    records.push(record_for(descriptor, domain));
    for entry in &descriptor.entries {
        records.push(record_for(entry, domain));
    }
    records
}

fn record_for(descriptor: &ArtifactDescriptor, domain: &str) -> CatalogRecord {
    let mut metadata = BTreeMap::new();
    metadata.insert("name".to_string(), descriptor.name.clone());
    metadata.insert("ext".to_string(), descriptor.ext.clone());

    let folder = match &descriptor.location {
        ArtifactUri::Plain(path) => path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default(),
        ArtifactUri::Archived { .. } => descriptor.folders.join("/"),
    };
    metadata.insert("folder".to_string(), folder);

    if let Some(container) = descriptor.location.container() {
        metadata.insert(CONTAINER_KEY.to_string(), container);
    }

    let stats = descriptor.stats.as_ref();
    if let Some(created) = stats.and_then(|s| s.created) {
        metadata.insert("created".to_string(), created.to_string());
    }

    CatalogRecord {
        processor_id: None,
        uri_id: None,
        domain: domain.to_string(),
        uri_type: descriptor.kind.to_string(),
        uri: descriptor.location.uri(),
        root: false,
        metadata,
        versions: VersionRecord {
            modified: stats.and_then(|s| s.modified),
            size: stats.map(|s| s.size as i64),
            checksum: descriptor.digest.clone(),
            latest: false,
            version_metadata: BTreeMap::new(),
        },
    }
}
