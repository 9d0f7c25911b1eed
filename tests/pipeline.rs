use artifact_catalog::catalog::CatalogStore;
use artifact_catalog::config::ProcessorSettings;
use artifact_catalog::error::CatalogError;
use artifact_catalog::pipeline::{Pipeline, PipelineOptions, PipelineState};
use artifact_catalog::processor::ProcessorRegistry;
use artifact_catalog::sources::{AuthMode, SourceRegistry};
use artifact_catalog::{db, extract, migrate, scanner};
use filetime::FileTime;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Harness {
    _tmp: TempDir,
    root: PathBuf,
    registry: ProcessorRegistry,
    sources: SourceRegistry,
    store: CatalogStore,
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (name, body) in entries {
        zip.start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

/// A root with three files and a zip holding two entries, registered for
/// the filesystem scanner and the digest parser.
async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("files");
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("alpha.txt"), "one\ntwo\nthree\n").unwrap();
    fs::write(root.join("beta.md"), "# Beta\n").unwrap();
    fs::write(root.join("sub/gamma.bin"), [0u8, 1, 2, 3]).unwrap();
    write_zip(
        &root.join("bundle.zip"),
        &[("inner/x.txt", "x\n"), ("inner/y.csv", "a,b\n1,2\n")],
    );
    let root = root.canonicalize().unwrap();

    let pool = db::connect_path(&tmp.path().join("catalog.sqlite"))
        .await
        .unwrap();
    migrate::migrate_pool(&pool).await.unwrap();

    let mut registry = ProcessorRegistry::with_builtins();
    for reference in [scanner::REFERENCE, extract::DIGEST_REFERENCE] {
        let settings = ProcessorSettings::default();
        let processor = registry.resolve(reference, &settings).unwrap();
        registry.register(&pool, processor, settings).await.unwrap();
    }

    let mut store = CatalogStore::new(pool.clone());
    let mut sources = SourceRegistry::new(pool);
    let scanner = registry.get("filesystem_scanner").unwrap().clone();
    sources
        .register_source(
            &mut store,
            &scanner,
            root.to_str().unwrap(),
            true,
            AuthMode::None,
        )
        .await
        .unwrap();

    Harness {
        _tmp: tmp,
        root,
        registry,
        sources,
        store,
    }
}

impl Harness {
    async fn scan(&mut self) -> artifact_catalog::pipeline::RunReport {
        let mut pipeline = Pipeline::new(PipelineOptions::default());
        let report = pipeline
            .scan(&self.registry, &self.sources, &mut self.store)
            .await
            .unwrap();
        assert_eq!(pipeline.state(), PipelineState::Done);
        report
    }

    async fn parse(&mut self, types: &[&str]) -> artifact_catalog::error::Result<artifact_catalog::pipeline::RunReport> {
        let types: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        let mut pipeline = Pipeline::new(PipelineOptions::default());
        pipeline.parse(&self.registry, &mut self.store, &types).await
    }

    fn path(&self, relative: &str) -> String {
        self.root.join(relative).to_string_lossy().to_string()
    }
}

#[tokio::test]
async fn test_first_scan_catalogs_files_and_entries() {
    let mut h = harness().await;
    let report = h.scan().await;

    assert_eq!(report.groups, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.item_errors, 0);
    // three files, the zip, two entries
    assert_eq!(report.stats.added, 6);
    assert_eq!(report.stats.versions_added, 6);
    assert_eq!(report.stats.failed, 0);
    assert_eq!(report.stats.deleted, 0);

    let entry = h
        .store
        .fetch_tree("inner/x.txt", Some(h.path("bundle.zip").as_str()), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.uri_type, "archived");
    assert_eq!(entry.metadata.get("ext").map(String::as_str), Some(".txt"));
}

#[tokio::test]
async fn test_rescan_is_unchanged() {
    let mut h = harness().await;
    h.scan().await;
    let report = h.scan().await;

    assert_eq!(report.stats.added, 0);
    assert_eq!(report.stats.updated, 0);
    assert_eq!(report.stats.unchanged, 6);
    assert_eq!(report.stats.versions_added, 0);
    assert_eq!(report.stats.deleted, 0);
}

#[tokio::test]
async fn test_modified_file_gets_new_version() {
    let mut h = harness().await;
    h.scan().await;

    let alpha = h.root.join("alpha.txt");
    let before = fs::metadata(&alpha).unwrap();
    let mtime = FileTime::from_last_modification_time(&before);
    fs::write(&alpha, "one\ntwo\nthree\nfour\n").unwrap();
    filetime::set_file_mtime(&alpha, FileTime::from_unix_time(mtime.unix_seconds() + 120, 0))
        .unwrap();

    let report = h.scan().await;
    assert_eq!(report.stats.added, 0);
    assert_eq!(report.stats.updated, 1);
    assert_eq!(report.stats.versions_added, 1);

    let tree = h
        .store
        .fetch_tree(&h.path("alpha.txt"), None, None)
        .await
        .unwrap()
        .unwrap();
    let version = tree.version.unwrap();
    assert_eq!(version.modified, Some(mtime.unix_seconds() + 120));
    assert_eq!(version.size, Some(19));
}

#[tokio::test]
async fn test_removed_file_is_swept_and_comes_back() {
    let mut h = harness().await;
    h.scan().await;

    let gamma = h.root.join("sub/gamma.bin");
    fs::remove_file(&gamma).unwrap();
    let report = h.scan().await;
    assert_eq!(report.stats.deleted, 1);

    let tree = h
        .store
        .fetch_tree(&h.path("sub/gamma.bin"), None, None)
        .await
        .unwrap()
        .unwrap();
    assert!(tree.deleted.is_some());

    let root = h
        .store
        .fetch_tree(h.root.to_str().unwrap(), None, None)
        .await
        .unwrap()
        .unwrap();
    assert!(root.root);
    assert!(root.deleted.is_none());

    fs::write(&gamma, [0u8, 1, 2, 3]).unwrap();
    let report = h.scan().await;
    assert_eq!(report.stats.deleted, 0);
    assert_eq!(report.stats.added, 0);
    let tree = h
        .store
        .fetch_tree(&h.path("sub/gamma.bin"), None, None)
        .await
        .unwrap()
        .unwrap();
    assert!(tree.deleted.is_none());
}

#[tokio::test]
async fn test_parse_attaches_digest_metadata() {
    let mut h = harness().await;
    h.scan().await;

    let report = h.parse(&["file"]).await.unwrap();
    // alpha.txt and beta.md; gamma.bin has no extractor.
    assert_eq!(report.processed, 2);
    assert_eq!(report.item_errors, 0);
    assert_eq!(report.stats.updated, 2);
    assert_eq!(report.stats.versions_added, 0);

    let tree = h
        .store
        .fetch_tree(&h.path("alpha.txt"), None, None)
        .await
        .unwrap()
        .unwrap();
    let metadata = tree.version.unwrap().metadata;
    assert_eq!(metadata.get("lines").map(String::as_str), Some("3"));
    assert_eq!(metadata.get("bytes").map(String::as_str), Some("14"));
    assert!(metadata.contains_key("sha256"));

    let again = h.parse(&["file"]).await.unwrap();
    assert_eq!(again.stats.unchanged, 2);
    assert_eq!(again.stats.updated, 0);
}

#[tokio::test]
async fn test_parse_reads_archive_entries() {
    let mut h = harness().await;
    h.scan().await;

    let report = h.parse(&["archived"]).await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.item_errors, 0);

    let entry = h
        .store
        .fetch_tree("inner/y.csv", Some(h.path("bundle.zip").as_str()), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        entry.version.unwrap().metadata.get("lines").map(String::as_str),
        Some("2")
    );
}

#[tokio::test]
async fn test_parse_unknown_type_has_no_handler() {
    let mut h = harness().await;
    h.scan().await;

    let err = h.parse(&["spreadsheet"]).await.err().unwrap();
    assert!(matches!(err, CatalogError::NoHandler { ref artifact_type } if artifact_type == "spreadsheet"));

    // The scanner handles folders but cannot parse them.
    let err = h.parse(&["folder"]).await.err().unwrap();
    assert!(matches!(err, CatalogError::NoHandler { .. }));
}

#[tokio::test]
async fn test_cancelled_scan_skips_sweep() {
    let mut h = harness().await;
    h.scan().await;
    fs::remove_file(h.root.join("beta.md")).unwrap();

    let mut pipeline = Pipeline::new(PipelineOptions::default());
    pipeline.cancellation().cancel();
    let report = pipeline
        .scan(&h.registry, &h.sources, &mut h.store)
        .await
        .unwrap();
    assert_eq!(report.stats.deleted, 0);

    let tree = h
        .store
        .fetch_tree(&h.path("beta.md"), None, None)
        .await
        .unwrap()
        .unwrap();
    assert!(tree.deleted.is_none());
}
