//! Metadata extraction for cataloged artifacts.
//!
//! Format-specific work sits behind the narrow [`Extractor`] contract:
//! bytes and extension in, key/value facts out. [`ParserProcessor`] turns
//! any extractor into a parse-capable [`Processor`] that selects URIs by
//! extension, fetches bytes lazily (from disk or from inside an archive)
//! and emits the facts as latest-version metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use crate::archive;
use crate::config::ProcessorSettings;
use crate::error::{CatalogError, Result};
use crate::models::{CatalogRecord, PathDescriptor, VersionRecord, WorkItem, CONTAINER_KEY};
use crate::processor::{FilterClause, Processor, ProcessorConfig, RecordSink};
use crate::walker;

pub const DIGEST_REFERENCE: &str = "parser.digest";
pub const DOCX_REFERENCE: &str = "parser.docx";

/// Maximum decompressed bytes to read from a single OOXML part.
const MAX_XML_ENTRY_BYTES: u64 = 8 * 1024 * 1024;

/// Extraction error. The parse worker logs it and moves on to the next item.
#[derive(Debug)]
pub enum ExtractError {
    Ooxml(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Ooxml(e) => write!(f, "OOXML extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// A format-specific metadata extractor.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    fn reference(&self) -> &str;

    /// Lowercased extensions (with leading dot) this extractor accepts.
    fn extensions(&self) -> Vec<String>;

    /// Keys [`extract`](Extractor::extract) may produce.
    fn metadata_keys(&self) -> Vec<String>;

    fn extract(&self, bytes: &[u8], ext: &str) -> Result<BTreeMap<String, String>, ExtractError>;
}

/// SHA-256, byte count and line count of text-like files.
pub struct DigestExtractor;

impl Extractor for DigestExtractor {
    fn name(&self) -> &str {
        "digest_parser"
    }

    fn reference(&self) -> &str {
        DIGEST_REFERENCE
    }

    fn extensions(&self) -> Vec<String> {
        [".txt", ".md", ".csv", ".log"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn metadata_keys(&self) -> Vec<String> {
        vec!["sha256".into(), "bytes".into(), "lines".into()]
    }

    fn extract(&self, bytes: &[u8], _ext: &str) -> Result<BTreeMap<String, String>, ExtractError> {
        let mut facts = BTreeMap::new();
        facts.insert("sha256".to_string(), hex::encode(Sha256::digest(bytes)));
        facts.insert("bytes".to_string(), bytes.len().to_string());

        let mut lines = bytes.iter().filter(|&&b| b == b'\n').count();
        if bytes.last().is_some_and(|&b| b != b'\n') {
            lines += 1;
        }
        facts.insert("lines".to_string(), lines.to_string());
        Ok(facts)
    }
}

/// Core document properties (`docProps/core.xml`) of a `.docx`.
pub struct DocxExtractor;

const CORE_PROPERTIES: &[(&[u8], &str)] = &[
    (b"title", "title"),
    (b"subject", "subject"),
    (b"creator", "creator"),
    (b"keywords", "keywords"),
    (b"description", "description"),
    (b"lastModifiedBy", "last_modified_by"),
    (b"revision", "revision"),
    (b"created", "created"),
    (b"modified", "modified"),
];

impl Extractor for DocxExtractor {
    fn name(&self) -> &str {
        "docx_parser"
    }

    fn reference(&self) -> &str {
        DOCX_REFERENCE
    }

    fn extensions(&self) -> Vec<String> {
        vec![".docx".to_string()]
    }

    fn metadata_keys(&self) -> Vec<String> {
        CORE_PROPERTIES.iter().map(|(_, k)| k.to_string()).collect()
    }

    fn extract(&self, bytes: &[u8], _ext: &str) -> Result<BTreeMap<String, String>, ExtractError> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
        let xml = read_zip_entry_bounded(&mut archive, "docProps/core.xml", MAX_XML_ENTRY_BYTES)?;
        extract_core_properties(&xml)
    }
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn extract_core_properties(xml: &[u8]) -> Result<BTreeMap<String, String>, ExtractError> {
    let mut facts = BTreeMap::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                let key = CORE_PROPERTIES
                    .iter()
                    .find(|(local, _)| e.local_name().as_ref() == *local)
                    .map(|(_, key)| *key);
                if let Some(key) = key {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        let value = te.unescape().unwrap_or_default().trim().to_string();
                        if !value.is_empty() {
                            facts.insert(key.to_string(), value);
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(facts)
}

/// Options shared by every extractor-backed parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserOptions {
    /// Artifacts larger than this are skipped.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_max_bytes() -> u64 {
    archive::DEFAULT_MAX_ENTRY_BYTES
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
        }
    }
}

/// A parse-capable processor wrapping one [`Extractor`].
pub struct ParserProcessor<E> {
    extractor: E,
    options: ParserOptions,
}

impl<E: Extractor> ParserProcessor<E> {
    pub fn new(extractor: E, options: ParserOptions) -> Self {
        Self { extractor, options }
    }

    fn from_settings(extractor: E, settings: &ProcessorSettings) -> Result<Self> {
        let options: ParserOptions =
            serde_json::from_value(Value::Object(settings.options.clone())).map_err(|e| {
                CatalogError::failed_to_load(extractor.reference(), e.to_string())
            })?;
        Ok(Self::new(extractor, options))
    }
}

impl<E: Extractor + 'static> Processor for ParserProcessor<E> {
    fn name(&self) -> &str {
        self.extractor.name()
    }

    fn reference(&self) -> &str {
        self.extractor.reference()
    }

    fn avail_config(&self) -> ProcessorConfig {
        let options = match serde_json::to_value(&self.options) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        ProcessorConfig {
            options,
            artifact_types: vec!["file".to_string(), "archived".to_string()],
            source_filters: vec![FilterClause {
                table: "uri_metadata".to_string(),
                field: "key".to_string(),
                select: Value::String("ext".to_string()),
                filter: Some(self.extractor.extensions()),
            }],
            uri_metadata_keys: vec!["name".into(), "ext".into(), CONTAINER_KEY.into()],
            version_metadata_keys: self.extractor.metadata_keys(),
            metadata: BTreeMap::from([(
                "extensions".to_string(),
                self.extractor.extensions().join(","),
            )]),
            ..ProcessorConfig::default()
        }
    }

    fn build_path(&self, uri: &str) -> Result<PathDescriptor> {
        walker::build_path(uri)
    }

    fn can_parse(&self) -> bool {
        true
    }

    fn parse_item(&self, item: &WorkItem, sink: &RecordSink) -> Result<()> {
        let location = item.location();
        let bytes = archive::read_artifact(&location, self.options.max_bytes)?;
        let ext = item.metadata.get("ext").map(String::as_str).unwrap_or("");
        let facts = self.extractor.extract(&bytes, ext)?;

        let mut metadata = BTreeMap::new();
        if let Some(container) = location.container() {
            metadata.insert(CONTAINER_KEY.to_string(), container);
        }

        let record = CatalogRecord {
            processor_id: None,
            uri_id: item.uri_id,
            domain: item.domain.clone().unwrap_or_else(walker::local_domain),
            uri_type: item.uri_type.clone(),
            uri: item.uri.clone(),
            root: false,
            metadata,
            versions: VersionRecord {
                latest: true,
                version_metadata: facts,
                ..VersionRecord::default()
            },
        };
        if !sink.emit(record) {
            tracing::warn!(uri = %location, "output queue closed, dropping parse result");
        }
        Ok(())
    }
}

pub fn digest_factory(settings: &ProcessorSettings) -> Result<Arc<dyn Processor>> {
    Ok(Arc::new(ParserProcessor::from_settings(DigestExtractor, settings)?))
}

pub fn docx_factory(settings: &ProcessorSettings) -> Result<Arc<dyn Processor>> {
    Ok(Arc::new(ParserProcessor::from_settings(DocxExtractor, settings)?))
}
