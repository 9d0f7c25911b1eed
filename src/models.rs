//! Core data models used throughout the catalog.
//!
//! These types describe the artifacts a walk discovers, the items that flow
//! through the pipeline queues, and the counters a drain reports.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// URI-metadata key linking an archive entry to its container's uri.
pub const CONTAINER_KEY: &str = "container";

/// The artifact types the engine routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Folder,
    File,
    /// An entry inside a zip/tar container.
    Archived,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Folder => "folder",
            ArtifactKind::File => "file",
            ArtifactKind::Archived => "archived",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "folder" => Ok(ArtifactKind::Folder),
            "file" => Ok(ArtifactKind::File),
            "archived" => Ok(ArtifactKind::Archived),
            other => Err(format!("unknown artifact type: {}", other)),
        }
    }
}

/// Where an artifact lives: directly on disk, or inside a container.
///
/// The same entry path may exist both on disk and inside an archive; the
/// container is part of the identity, so the two never collapse into one
/// catalog item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactUri {
    Plain(PathBuf),
    Archived { container: PathBuf, entry: String },
}

impl ArtifactUri {
    /// Rebuilds a location from a cataloged uri and its optional container link.
    pub fn from_parts(uri: &str, container: Option<&str>) -> Self {
        match container.filter(|c| !c.is_empty()) {
            Some(container) => ArtifactUri::Archived {
                container: PathBuf::from(container),
                entry: uri.to_string(),
            },
            None => ArtifactUri::Plain(PathBuf::from(uri)),
        }
    }

    /// The uri string stored in the catalog.
    pub fn uri(&self) -> String {
        match self {
            ArtifactUri::Plain(path) => path.to_string_lossy().to_string(),
            ArtifactUri::Archived { entry, .. } => entry.clone(),
        }
    }

    pub fn container(&self) -> Option<String> {
        match self {
            ArtifactUri::Plain(_) => None,
            ArtifactUri::Archived { container, .. } => {
                Some(container.to_string_lossy().to_string())
            }
        }
    }
}

impl fmt::Display for ArtifactUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactUri::Plain(path) => write!(f, "{}", path.display()),
            ArtifactUri::Archived { container, entry } => {
                write!(f, "{}!{}", container.display(), entry)
            }
        }
    }
}

/// Filesystem timestamps (unix seconds) and size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub accessed: Option<i64>,
    pub modified: Option<i64>,
    pub created: Option<i64>,
    pub size: u64,
}

/// One artifact yielded by a walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub kind: ArtifactKind,
    pub location: ArtifactUri,
    pub root: String,
    pub folders: Vec<String>,
    pub name: String,
    /// Lowercased, with the leading dot (`.txt`, `.tar.gz`); empty when absent.
    pub ext: String,
    pub stats: Option<FileStats>,
    /// Hex SHA-256 of the content, when hashing was requested.
    pub digest: Option<String>,
    /// Entries of a recognised container, each carrying the container path.
    pub entries: Vec<ArtifactDescriptor>,
}

/// The classification `build_path` produces for an arbitrary uri string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathDescriptor {
    /// Canonical uri after home/env expansion.
    pub uri: String,
    pub kind: ArtifactKind,
    pub domain: String,
    pub root: String,
    pub folders: Vec<String>,
    pub name: Option<String>,
    pub ext: Option<String>,
}

/// An item on a processor's input queue.
///
/// For scans this is a registered source; for parses it is a row returned
/// by the query builder, with the pivoted metadata columns in `metadata`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkItem {
    pub uri_id: Option<i64>,
    pub uri: String,
    pub uri_type: String,
    pub domain: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl WorkItem {
    pub fn location(&self) -> ArtifactUri {
        ArtifactUri::from_parts(
            &self.uri,
            self.metadata.get(CONTAINER_KEY).map(String::as_str),
        )
    }
}

/// Version-level part of a [`CatalogRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub modified: Option<i64>,
    pub size: Option<i64>,
    pub checksum: Option<String>,
    /// Resolve to the newest stored version instead of matching `modified`.
    pub latest: bool,
    pub version_metadata: BTreeMap<String, String>,
}

/// A normalized record on the shared output queue, drained into the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub processor_id: Option<i64>,
    pub uri_id: Option<i64>,
    pub domain: String,
    pub uri_type: String,
    pub uri: String,
    pub root: bool,
    /// URI-level key/values.
    pub metadata: BTreeMap<String, String>,
    pub versions: VersionRecord,
}

impl CatalogRecord {
    pub fn container(&self) -> Option<&str> {
        self.metadata
            .get(CONTAINER_KEY)
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }
}

/// Counters reported by a drain (and, for `deleted`, the sweep after it).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    /// URIs created.
    pub added: u64,
    /// Existing URIs that gained a version or had metadata change.
    pub updated: u64,
    pub unchanged: u64,
    /// URIs soft-deleted because a clean walk no longer saw them.
    pub deleted: u64,
    /// Records rolled back after an error.
    pub failed: u64,
    pub versions_added: u64,
}
