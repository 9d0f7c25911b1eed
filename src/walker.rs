//! Path walker: lazily enumerate a filesystem root into artifact descriptors.
//!
//! The walk is depth-first, sorted by file name, and never follows
//! symlinks. Containers recognised by [`crate::archive`] are listed and
//! their entries attached as nested descriptors; entry bytes are not read.
//!
//! Errors never end a walk. A missing root yields nothing; unreadable
//! subtrees, vanished files and corrupt archives are logged and skipped.
//! [`Walk::errors`] reports how many such problems were seen, so callers
//! can tell a clean walk from a partial one.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::archive::{self, ArchiveFormat};
use crate::error::{CatalogError, Result};
use crate::models::{ArtifactDescriptor, ArtifactKind, ArtifactUri, FileStats, PathDescriptor};

/// Options controlling what each descriptor carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkOptions {
    #[serde(default = "default_true")]
    pub split_folders: bool,
    #[serde(default = "default_true")]
    pub split_extension: bool,
    #[serde(default = "default_true")]
    pub stats: bool,
    /// Compute a SHA-256 digest of each file (requires `stats`).
    #[serde(default)]
    pub hash: bool,
    /// Skip hashing files larger than this.
    #[serde(default)]
    pub hash_max_bytes: Option<u64>,
    /// List entries of zip/tar containers.
    #[serde(default = "default_true")]
    pub archives: bool,
    /// Also yield sub-folders (the root itself is never yielded).
    #[serde(default)]
    pub include_folders: bool,
    /// When non-empty, only files matching one of these are yielded.
    /// Globs match case-insensitively, like extensions.
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            split_folders: true,
            split_extension: true,
            stats: true,
            hash: false,
            hash_max_bytes: None,
            archives: true,
            include_folders: false,
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
        }
    }
}

/// A lazy, non-restartable walk over one root.
pub struct Walk {
    root: PathBuf,
    inner: Option<walkdir::IntoIter>,
    options: WalkOptions,
    include: Option<GlobSet>,
    exclude: GlobSet,
    errors: usize,
}

/// Starts a walk. Fails only when a glob pattern is invalid.
pub fn walk(root: &Path, options: &WalkOptions) -> Result<Walk> {
    let include = if options.include_globs.is_empty() {
        None
    } else {
        Some(build_globset(&options.include_globs)?)
    };
    let exclude = build_globset(&options.exclude_globs)?;

    let mut errors = 0;
    let inner = if root.exists() {
        Some(
            WalkDir::new(root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter(),
        )
    } else {
        tracing::warn!(root = %root.display(), "walk root does not exist");
        errors += 1;
        None
    };

    Ok(Walk {
        root: root.to_path_buf(),
        inner,
        options: options.clone(),
        include,
        exclude,
        errors,
    })
}

impl Walk {
    /// Problems seen so far (missing root, unreadable entries, bad archives).
    pub fn errors(&self) -> usize {
        self.errors
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Iterator for Walk {
    type Item = ArtifactDescriptor;

    fn next(&mut self) -> Option<ArtifactDescriptor> {
        loop {
            let inner = self.inner.as_mut()?;
            let entry = match inner.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    // walkdir already skips the unreadable directory.
                    self.errors += 1;
                    tracing::warn!(
                        root = %self.root.display(),
                        path = ?err.path(),
                        error = %err,
                        "skipping unreadable path"
                    );
                    continue;
                }
            };

            let path = entry.path();
            let relative = path
                .strip_prefix(&self.root)
                .unwrap_or(path)
                .to_string_lossy()
                .to_string();
            let file_type = entry.file_type();

            if file_type.is_dir() {
                if entry.depth() == 0 {
                    continue;
                }
                if self.exclude.is_match(&relative) {
                    inner.skip_current_dir();
                    continue;
                }
                if !self.options.include_folders {
                    continue;
                }
            } else if !file_type.is_file() {
                // Symlinks and special files are not followed.
                continue;
            } else {
                if self.exclude.is_match(&relative) {
                    continue;
                }
                if let Some(include) = &self.include {
                    if !include.is_match(&relative) {
                        continue;
                    }
                }
            }

            match describe(path, &self.options, &mut self.errors) {
                Ok(descriptor) => return Some(descriptor),
                Err(err) => {
                    self.errors += 1;
                    tracing::warn!(path = %path.display(), error = %err, "skipping artifact");
                }
            }
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| CatalogError::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| CatalogError::Config(e.to_string()))
}

/// Builds the descriptor for one on-disk file or folder.
fn describe(path: &Path, options: &WalkOptions, errors: &mut usize) -> Result<ArtifactDescriptor> {
    let metadata = std::fs::metadata(path)?;
    let kind = if metadata.is_dir() {
        ArtifactKind::Folder
    } else {
        ArtifactKind::File
    };

    let parts = split_path(path);
    let (name, ext) = if options.split_extension && kind == ArtifactKind::File {
        split_extension(&parts.file_name)
    } else {
        (parts.file_name.clone(), String::new())
    };

    let stats = if options.stats {
        Some(FileStats {
            accessed: metadata.accessed().ok().and_then(unix_secs),
            modified: metadata.modified().ok().and_then(unix_secs),
            created: metadata.created().ok().and_then(unix_secs),
            size: metadata.len(),
        })
    } else {
        None
    };

    let digest = match &stats {
        Some(stats) if options.hash && kind == ArtifactKind::File => {
            let within_cap = options.hash_max_bytes.map_or(true, |max| stats.size <= max);
            if within_cap {
                Some(sha256_file(path)?)
            } else {
                None
            }
        }
        _ => None,
    };

    let mut entries = Vec::new();
    if options.archives && kind == ArtifactKind::File && ArchiveFormat::detect(path).is_some() {
        match archive::list_entries(path) {
            Ok(listed) => {
                let container_modified = stats.as_ref().and_then(|s| s.modified);
                entries = listed
                    .into_iter()
                    .map(|entry| describe_entry(path, entry, container_modified, options))
                    .collect();
            }
            Err(err) => {
                *errors += 1;
                tracing::warn!(path = %path.display(), error = %err, "could not list archive");
            }
        }
    }

    Ok(ArtifactDescriptor {
        kind,
        location: ArtifactUri::Plain(path.to_path_buf()),
        root: parts.root,
        folders: if options.split_folders {
            parts.folders
        } else {
            Vec::new()
        },
        name,
        ext,
        stats,
        digest,
        entries,
    })
}

fn describe_entry(
    container: &Path,
    entry: archive::ArchiveEntry,
    container_modified: Option<i64>,
    options: &WalkOptions,
) -> ArtifactDescriptor {
    let mut segments: Vec<String> = entry
        .path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let file_name = segments.pop().unwrap_or_default();
    let (name, ext) = if options.split_extension {
        split_extension(&file_name)
    } else {
        (file_name, String::new())
    };

    ArtifactDescriptor {
        kind: ArtifactKind::Archived,
        location: ArtifactUri::Archived {
            container: container.to_path_buf(),
            entry: entry.path,
        },
        root: String::new(),
        folders: if options.split_folders {
            segments
        } else {
            Vec::new()
        },
        name,
        ext,
        stats: options.stats.then(|| FileStats {
            accessed: None,
            modified: container_modified.or(entry.modified),
            created: None,
            size: entry.size,
        }),
        digest: None,
        entries: Vec::new(),
    }
}

struct PathParts {
    root: String,
    folders: Vec<String>,
    file_name: String,
}

fn split_path(path: &Path) -> PathParts {
    let mut root = String::new();
    let mut segments = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => root.push_str(&prefix.as_os_str().to_string_lossy()),
            Component::RootDir => root.push(std::path::MAIN_SEPARATOR),
            Component::Normal(part) => segments.push(part.to_string_lossy().to_string()),
            Component::CurDir | Component::ParentDir => {}
        }
    }
    let file_name = segments.pop().unwrap_or_default();
    PathParts {
        root,
        folders: segments,
        file_name,
    }
}

/// Splits `report.tar.gz` into (`report`, `.tar.gz`) and `a.TXT` into (`a`, `.txt`).
///
/// A leading dot is part of the name, so `.bashrc` has no extension.
pub fn split_extension(file_name: &str) -> (String, String) {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".tar.gz") && file_name.len() > ".tar.gz".len() {
        let cut = file_name.len() - ".tar.gz".len();
        return (file_name[..cut].to_string(), ".tar.gz".to_string());
    }
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => (
            file_name[..idx].to_string(),
            file_name[idx..].to_lowercase(),
        ),
        _ => (file_name.to_string(), String::new()),
    }
}

fn unix_secs(time: SystemTime) -> Option<i64> {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Expands a leading `~` and `$VAR` / `${VAR}` references.
///
/// Unknown variables are left as written.
pub fn expand_uri(uri: &str) -> String {
    let with_home = match uri.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') => {
            match dirs::home_dir() {
                Some(home) => format!("{}{}", home.display(), rest),
                None => uri.to_string(),
            }
        }
        _ => uri.to_string(),
    };

    let mut out = String::with_capacity(with_home.len());
    let mut chars = with_home.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = matches!(chars.peek(), Some((_, '{')));
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&(_, n)) = chars.peek() {
            if n.is_ascii_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        let closed = if braced {
            matches!(chars.next_if(|&(_, n)| n == '}'), Some(_))
        } else {
            true
        };
        match std::env::var(&name) {
            Ok(value) if !name.is_empty() && closed => out.push_str(&value),
            _ => {
                out.push('$');
                if braced {
                    out.push('{');
                }
                out.push_str(&name);
                if braced && closed {
                    out.push('}');
                }
            }
        }
    }
    out
}

/// The domain that on-disk artifacts of this machine belong to.
pub fn local_domain() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Classifies a uri as folder or file and decomposes it.
///
/// Home and environment references are expanded before any filesystem
/// test; existing paths are canonicalized so walks and registered roots
/// agree on one spelling.
pub fn build_path(uri: &str) -> Result<PathDescriptor> {
    let expanded = expand_uri(uri.trim());
    if !expanded.contains('/') && !expanded.contains('\\') {
        return Err(CatalogError::source_invalid(
            uri,
            "not understood as a filesystem path",
        ));
    }

    let path = PathBuf::from(&expanded);
    let metadata = std::fs::metadata(&path)
        .map_err(|e| CatalogError::source_invalid(uri, format!("not found: {}", e)))?;
    let kind = if metadata.is_dir() {
        ArtifactKind::Folder
    } else if metadata.is_file() {
        ArtifactKind::File
    } else {
        return Err(CatalogError::source_invalid(
            uri,
            "path failed file and folder test",
        ));
    };

    let canonical = std::fs::canonicalize(&path).unwrap_or(path);
    let parts = split_path(&canonical);
    let (name, ext) = match kind {
        ArtifactKind::File => {
            let (name, ext) = split_extension(&parts.file_name);
            (Some(name), Some(ext))
        }
        _ => (None, None),
    };
    let mut folders = parts.folders;
    if kind == ArtifactKind::Folder && !parts.file_name.is_empty() {
        folders.push(parts.file_name);
    }

    Ok(PathDescriptor {
        uri: canonical.to_string_lossy().to_string(),
        kind,
        domain: local_domain(),
        root: parts.root,
        folders,
        name,
        ext,
    })
}
