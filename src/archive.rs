//! Archive accessor: list the entries of a zip/tar container and read a
//! single entry's bytes on demand.
//!
//! Stateless: every call opens the container afresh, so descriptors can
//! carry a container path across threads without holding file handles.

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{CatalogError, Result};
use crate::models::ArtifactUri;

/// Upper bound for a single entry read when the caller has no opinion.
pub const DEFAULT_MAX_ENTRY_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    /// Recognises a container by its (case-insensitive) file name suffix.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

/// A file entry inside a container. Directories are never listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path of the entry inside the container, `/`-separated.
    pub path: String,
    pub size: u64,
    /// Entry mtime when the format records one (tar).
    pub modified: Option<i64>,
}

pub fn list_entries(container: &Path) -> Result<Vec<ArchiveEntry>> {
    let format = ArchiveFormat::detect(container)
        .ok_or_else(|| CatalogError::archive(container.display(), "not a recognised archive"))?;

    match format {
        ArchiveFormat::Zip => list_zip(container),
        ArchiveFormat::Tar | ArchiveFormat::TarGz => list_tar(container, format),
    }
}

/// Reads one entry, failing if it is missing or larger than `max_bytes`.
pub fn read_entry(container: &Path, entry: &str, max_bytes: u64) -> Result<Vec<u8>> {
    let format = ArchiveFormat::detect(container)
        .ok_or_else(|| CatalogError::archive(container.display(), "not a recognised archive"))?;

    match format {
        ArchiveFormat::Zip => read_zip_entry(container, entry, max_bytes),
        ArchiveFormat::Tar | ArchiveFormat::TarGz => {
            read_tar_entry(container, format, entry, max_bytes)
        }
    }
}

/// Fetches the bytes behind any artifact location, on disk or archived.
pub fn read_artifact(location: &ArtifactUri, max_bytes: u64) -> Result<Vec<u8>> {
    match location {
        ArtifactUri::Plain(path) => {
            let file = File::open(path)?;
            read_bounded(file, max_bytes)
                .map_err(|msg| CatalogError::archive(path.display(), msg))
        }
        ArtifactUri::Archived { container, entry } => read_entry(container, entry, max_bytes),
    }
}

fn list_zip(container: &Path) -> Result<Vec<ArchiveEntry>> {
    let file = File::open(container)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| CatalogError::archive(container.display(), e))?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| CatalogError::archive(container.display(), e))?;
        if entry.is_dir() {
            continue;
        }
        entries.push(ArchiveEntry {
            path: entry.name().to_string(),
            size: entry.size(),
            modified: None,
        });
    }
    Ok(entries)
}

fn read_zip_entry(container: &Path, name: &str, max_bytes: u64) -> Result<Vec<u8>> {
    let file = File::open(container)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| CatalogError::archive(container.display(), e))?;
    let entry = archive
        .by_name(name)
        .map_err(|e| CatalogError::archive(container.display(), format!("{}: {}", name, e)))?;
    read_bounded(entry, max_bytes)
        .map_err(|msg| CatalogError::archive(container.display(), format!("{}: {}", name, msg)))
}

fn open_tar(container: &Path, format: ArchiveFormat) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = BufReader::new(File::open(container)?);
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        _ => Box::new(file),
    };
    Ok(tar::Archive::new(reader))
}

fn list_tar(container: &Path, format: ArchiveFormat) -> Result<Vec<ArchiveEntry>> {
    let mut archive = open_tar(container, format)?;
    let mut entries = Vec::new();
    let iter = archive
        .entries()
        .map_err(|e| CatalogError::archive(container.display(), e))?;

    for entry in iter {
        let entry = entry.map_err(|e| CatalogError::archive(container.display(), e))?;
        let header = entry.header();
        if !header.entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| CatalogError::archive(container.display(), e))?;
        entries.push(ArchiveEntry {
            path: normalize_entry_path(&path.to_string_lossy()),
            size: header.size().unwrap_or(0),
            modified: header.mtime().ok().map(|m| m as i64),
        });
    }
    Ok(entries)
}

fn read_tar_entry(
    container: &Path,
    format: ArchiveFormat,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>> {
    let mut archive = open_tar(container, format)?;
    let iter = archive
        .entries()
        .map_err(|e| CatalogError::archive(container.display(), e))?;

    for entry in iter {
        let entry = entry.map_err(|e| CatalogError::archive(container.display(), e))?;
        let matches = entry
            .path()
            .map(|p| normalize_entry_path(&p.to_string_lossy()) == name)
            .unwrap_or(false);
        if matches && entry.header().entry_type().is_file() {
            return read_bounded(entry, max_bytes).map_err(|msg| {
                CatalogError::archive(container.display(), format!("{}: {}", name, msg))
            });
        }
    }

    Err(CatalogError::archive(
        container.display(),
        format!("entry not found: {}", name),
    ))
}

fn normalize_entry_path(path: &str) -> String {
    path.trim_start_matches("./").replace('\\', "/")
}

fn read_bounded<R: Read>(reader: R, max_bytes: u64) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::new();
    reader
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 > max_bytes {
        return Err(format!("exceeds size limit ({} bytes)", max_bytes));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.add_directory("docs/", zip::write::SimpleFileOptions::default())
            .unwrap();
        for (name, body) in files {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    fn write_tar(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder
                .append_data(&mut header, name, body.as_bytes())
                .unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn test_detect_formats() {
        assert_eq!(
            ArchiveFormat::detect(Path::new("/a/b.ZIP")),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("b.tar.gz")),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("b.tgz")),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("b.tar")),
            Some(ArchiveFormat::Tar)
        );
        assert_eq!(ArchiveFormat::detect(Path::new("b.txt")), None);
    }

    #[test]
    fn test_zip_lists_files_only() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bundle.zip");
        write_zip(&path, &[("docs/a.txt", "alpha"), ("b.md", "beta!")]);

        let entries = list_entries(&path).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["docs/a.txt", "b.md"]);
        assert_eq!(entries[1].size, 5);
    }

    #[test]
    fn test_zip_read_entry() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bundle.zip");
        write_zip(&path, &[("docs/a.txt", "alpha")]);

        let bytes = read_entry(&path, "docs/a.txt", 1024).unwrap();
        assert_eq!(bytes, b"alpha");
        assert!(read_entry(&path, "missing.txt", 1024).is_err());
    }

    #[test]
    fn test_read_entry_enforces_limit() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bundle.zip");
        write_zip(&path, &[("big.txt", "0123456789")]);

        assert!(read_entry(&path, "big.txt", 4).is_err());
        assert!(read_entry(&path, "big.txt", 10).is_ok());
    }

    #[test]
    fn test_tar_list_and_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bundle.tar");
        write_tar(&path, &[("notes/x.txt", "xray"), ("y.txt", "yankee")]);

        let entries = list_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "notes/x.txt");
        assert_eq!(entries[0].modified, Some(1_700_000_000));

        let bytes = read_entry(&path, "y.txt", 1024).unwrap();
        assert_eq!(bytes, b"yankee");
    }

    #[test]
    fn test_corrupt_archive_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.zip");
        std::fs::write(&path, b"definitely not a zip").unwrap();
        assert!(list_entries(&path).is_err());
    }
}
