use artifact_catalog::catalog::{now_ms, CatalogStore};
use artifact_catalog::models::{CatalogRecord, VersionRecord, CONTAINER_KEY};
use artifact_catalog::{db, migrate};
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::TempDir;

const DOMAIN: &str = "testhost";

async fn store(tmp: &TempDir) -> CatalogStore {
    let pool = db::connect_path(&tmp.path().join("catalog.sqlite"))
        .await
        .unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    CatalogStore::new(pool)
}

fn file_record(uri: &str, modified: i64, size: i64) -> CatalogRecord {
    CatalogRecord {
        domain: DOMAIN.to_string(),
        uri_type: "file".to_string(),
        uri: uri.to_string(),
        versions: VersionRecord {
            modified: Some(modified),
            size: Some(size),
            ..VersionRecord::default()
        },
        ..CatalogRecord::default()
    }
}

async fn drain_all(store: &mut CatalogStore, records: Vec<CatalogRecord>) -> artifact_catalog::models::DrainStats {
    let (tx, rx) = async_channel::bounded(records.len().max(1));
    for record in records {
        tx.send(record).await.unwrap();
    }
    drop(tx);
    store.drain(rx).await.unwrap()
}

async fn count(store: &CatalogStore, sql: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(sql)
        .fetch_one(store.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_new_then_unchanged_then_new_version() {
    let tmp = TempDir::new().unwrap();
    let mut store = store(&tmp).await;

    let stats = drain_all(&mut store, vec![file_record("/data/a.txt", 100, 10)]).await;
    assert_eq!(stats.added, 1);
    assert_eq!(stats.versions_added, 1);

    let stats = drain_all(&mut store, vec![file_record("/data/a.txt", 100, 10)]).await;
    assert_eq!(stats.added, 0);
    assert_eq!(stats.unchanged, 1);
    assert_eq!(stats.versions_added, 0);

    let stats = drain_all(&mut store, vec![file_record("/data/a.txt", 200, 12)]).await;
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.versions_added, 1);

    assert_eq!(count(&store, "SELECT COUNT(*) FROM uris").await, 1);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM versions").await, 2);

    let tree = store.fetch_tree("/data/a.txt", None, None).await.unwrap().unwrap();
    let version = tree.version.unwrap();
    assert_eq!(version.modified, Some(200));
    assert_eq!(version.size, Some(12));
}

#[tokio::test]
async fn test_same_mtime_different_size_is_a_new_version() {
    let tmp = TempDir::new().unwrap();
    let mut store = store(&tmp).await;

    let stats = drain_all(
        &mut store,
        vec![
            file_record("/data/a.txt", 100, 10),
            file_record("/data/a.txt", 100, 11),
        ],
    )
    .await;
    assert_eq!(stats.added, 1);
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.versions_added, 2);

    // Tie on modified: the lowest id is the latest.
    let uri_id = count(&store, "SELECT id FROM uris").await;
    let first = count(&store, "SELECT MIN(id) FROM versions").await;
    assert_eq!(store.latest_version_id(uri_id).await.unwrap(), Some(first));
}

#[tokio::test]
async fn test_checksum_corrected_in_place() {
    let tmp = TempDir::new().unwrap();
    let mut store = store(&tmp).await;

    store.upsert(&file_record("/data/a.txt", 100, 10)).await.unwrap();

    let mut hashed = file_record("/data/a.txt", 100, 10);
    hashed.versions.checksum = Some("abc123".into());
    let stats = drain_all(&mut store, vec![hashed]).await;
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.versions_added, 0);

    let tree = store.fetch_tree("/data/a.txt", None, None).await.unwrap().unwrap();
    assert_eq!(tree.version.unwrap().checksum.as_deref(), Some("abc123"));
    assert_eq!(count(&store, "SELECT COUNT(*) FROM versions").await, 1);
}

#[tokio::test]
async fn test_uri_metadata_skips_empty_values() {
    let tmp = TempDir::new().unwrap();
    let mut store = store(&tmp).await;

    let mut record = file_record("/data/notes", 100, 10);
    record.metadata.insert("name".into(), "notes".into());
    record.metadata.insert("ext".into(), String::new());
    store.upsert(&record).await.unwrap();

    let tree = store.fetch_tree("/data/notes", None, None).await.unwrap().unwrap();
    assert_eq!(tree.metadata.get("name").map(String::as_str), Some("notes"));
    assert!(!tree.metadata.contains_key("ext"));

    let first_modified =
        count(&store, "SELECT modified FROM uri_metadata WHERE key = 'name'").await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    // A changed value updates; an empty value never clears.
    record.metadata.insert("name".into(), "renamed".into());
    record.metadata.insert("ext".into(), String::new());
    let stats = drain_all(&mut store, vec![record]).await;
    assert_eq!(stats.updated, 1);

    let tree = store.fetch_tree("/data/notes", None, None).await.unwrap().unwrap();
    assert_eq!(tree.metadata.get("name").map(String::as_str), Some("renamed"));
    let refreshed =
        count(&store, "SELECT modified FROM uri_metadata WHERE key = 'name'").await;
    assert!(refreshed > first_modified);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM uri_metadata").await, 1);
}

#[tokio::test]
async fn test_version_metadata_attaches_to_latest() {
    let tmp = TempDir::new().unwrap();
    let mut store = store(&tmp).await;

    store.upsert(&file_record("/data/a.txt", 100, 10)).await.unwrap();
    let uri_id = store.upsert(&file_record("/data/a.txt", 300, 30)).await.unwrap();

    let mut parsed = CatalogRecord {
        uri_id: Some(uri_id),
        domain: DOMAIN.into(),
        uri_type: "file".into(),
        uri: "/data/a.txt".into(),
        versions: VersionRecord {
            latest: true,
            version_metadata: BTreeMap::from([("lines".to_string(), "3".to_string())]),
            ..VersionRecord::default()
        },
        ..CatalogRecord::default()
    };
    let stats = drain_all(&mut store, vec![parsed.clone()]).await;
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.versions_added, 0);

    let latest = store.fetch_tree("/data/a.txt", None, None).await.unwrap().unwrap();
    let version = latest.version.unwrap();
    assert_eq!(version.modified, Some(300));
    assert_eq!(version.metadata.get("lines").map(String::as_str), Some("3"));

    let older = store
        .fetch_tree("/data/a.txt", None, Some(100))
        .await
        .unwrap()
        .unwrap();
    assert!(older.version.unwrap().metadata.is_empty());

    // Version metadata keeps empty values.
    parsed
        .versions
        .version_metadata
        .insert("title".into(), String::new());
    drain_all(&mut store, vec![parsed]).await;
    let latest = store.fetch_tree("/data/a.txt", None, None).await.unwrap().unwrap();
    assert_eq!(
        latest.version.unwrap().metadata.get("title").map(String::as_str),
        Some("")
    );
}

#[tokio::test]
async fn test_container_scopes_identity() {
    let tmp = TempDir::new().unwrap();
    let mut store = store(&tmp).await;

    let on_disk = file_record("docs/readme.txt", 100, 10);
    let mut archived = file_record("docs/readme.txt", 100, 10);
    archived.uri_type = "archived".into();
    archived
        .metadata
        .insert(CONTAINER_KEY.into(), "/data/bundle.zip".into());

    let stats = drain_all(&mut store, vec![on_disk, archived]).await;
    assert_eq!(stats.added, 2);

    let plain = store.fetch_tree("docs/readme.txt", None, None).await.unwrap().unwrap();
    let inner = store
        .fetch_tree("docs/readme.txt", Some("/data/bundle.zip"), None)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(plain.uri_id, inner.uri_id);
    assert_eq!(plain.container, None);
    assert_eq!(inner.container.as_deref(), Some("/data/bundle.zip"));
    assert_eq!(inner.uri_type, "archived");
}

#[tokio::test]
async fn test_failing_record_rolls_back_alone() {
    let tmp = TempDir::new().unwrap();
    let mut store = store(&tmp).await;

    let mut orphan = file_record("/data/ghost.txt", 100, 1);
    orphan.uri_id = Some(9_999);

    let stats = drain_all(
        &mut store,
        vec![
            file_record("/data/a.txt", 100, 10),
            orphan,
            file_record("/data/b.txt", 100, 20),
        ],
    )
    .await;
    assert_eq!(stats.added, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM uris").await, 2);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM versions").await, 2);
}

#[tokio::test]
async fn test_constraint_violation_rolls_back_partial_writes() {
    let tmp = TempDir::new().unwrap();
    let mut store = store(&tmp).await;

    sqlx::query(
        "CREATE TRIGGER reject_size BEFORE INSERT ON versions WHEN NEW.size = 666
         BEGIN SELECT RAISE(ABORT, 'size rejected'); END",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let mut rejected = file_record("/data/bad.txt", 100, 666);
    rejected.metadata.insert("name".into(), "bad".into());

    let stats = drain_all(
        &mut store,
        vec![
            file_record("/data/a.txt", 100, 10),
            rejected.clone(),
            file_record("/data/b.txt", 100, 20),
        ],
    )
    .await;
    assert_eq!(stats.added, 2);
    assert_eq!(stats.failed, 1);
    // The uri row and its metadata were written before the version failed.
    assert_eq!(count(&store, "SELECT COUNT(*) FROM uris").await, 2);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM uri_metadata").await, 0);
    assert!(store.fetch_tree("/data/bad.txt", None, None).await.unwrap().is_none());

    sqlx::query("DROP TRIGGER reject_size")
        .execute(store.pool())
        .await
        .unwrap();

    // No stale id from the rolled-back savepoint is reused.
    let stats = drain_all(&mut store, vec![rejected]).await;
    assert_eq!(stats.added, 1);
    assert_eq!(stats.failed, 0);
    let tree = store.fetch_tree("/data/bad.txt", None, None).await.unwrap().unwrap();
    assert_eq!(tree.metadata.get("name").map(String::as_str), Some("bad"));
    assert_eq!(tree.version.unwrap().size, Some(666));
}

#[tokio::test]
async fn test_latest_record_with_new_size_adds_version() {
    let tmp = TempDir::new().unwrap();
    let mut store = store(&tmp).await;

    store.upsert(&file_record("/data/a.txt", 100, 10)).await.unwrap();

    let grown = CatalogRecord {
        domain: DOMAIN.into(),
        uri_type: "file".into(),
        uri: "/data/a.txt".into(),
        versions: VersionRecord {
            latest: true,
            size: Some(99),
            version_metadata: BTreeMap::from([("lines".to_string(), "9".to_string())]),
            ..VersionRecord::default()
        },
        ..CatalogRecord::default()
    };
    let stats = drain_all(&mut store, vec![grown.clone()]).await;
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.versions_added, 1);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM versions").await, 2);

    // Same mtime: the lowest id stays latest, the new row carries the metadata.
    let latest = store.fetch_tree("/data/a.txt", None, None).await.unwrap().unwrap();
    let latest = latest.version.unwrap();
    assert_eq!(latest.size, Some(10));
    assert!(latest.metadata.is_empty());
    let newest_id = count(&store, "SELECT MAX(id) FROM versions").await;
    assert_eq!(
        count(
            &store,
            &format!("SELECT COUNT(*) FROM version_metadata WHERE version_id = {}", newest_id)
        )
        .await,
        1
    );

    // Matching size resolves to the existing latest row.
    let same = CatalogRecord {
        versions: VersionRecord {
            latest: true,
            size: Some(10),
            ..VersionRecord::default()
        },
        ..grown
    };
    let stats = drain_all(&mut store, vec![same]).await;
    assert_eq!(stats.versions_added, 0);
    assert_eq!(stats.unchanged, 1);
}

#[tokio::test]
async fn test_sweep_marks_missing_and_rescan_revives() {
    let tmp = TempDir::new().unwrap();
    let mut store = store(&tmp).await;

    let mut root = CatalogRecord {
        domain: DOMAIN.into(),
        uri_type: "folder".into(),
        uri: "/data/root".into(),
        root: true,
        ..CatalogRecord::default()
    };
    store.upsert(&root).await.unwrap();
    store.upsert(&file_record("/data/root/keep.txt", 1, 1)).await.unwrap();
    store.upsert(&file_record("/data/root/gone.txt", 1, 1)).await.unwrap();
    store.upsert(&file_record("/data/root2/sibling.txt", 1, 1)).await.unwrap();
    let mut entry = file_record("inner.txt", 1, 1);
    entry
        .metadata
        .insert(CONTAINER_KEY.into(), "/data/root/gone.zip".into());
    store.upsert(&entry).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let pass_start = now_ms();
    tokio::time::sleep(Duration::from_millis(5)).await;

    root.root = false;
    store.upsert(&root).await.unwrap();
    store.upsert(&file_record("/data/root/keep.txt", 1, 1)).await.unwrap();

    let swept = store.sweep_missing(DOMAIN, "/data/root/", pass_start).await.unwrap();
    assert_eq!(swept, 2);

    let gone = store.fetch_tree("/data/root/gone.txt", None, None).await.unwrap().unwrap();
    assert!(gone.deleted.is_some());
    let inner = store
        .fetch_tree("inner.txt", Some("/data/root/gone.zip"), None)
        .await
        .unwrap()
        .unwrap();
    assert!(inner.deleted.is_some());

    let sibling = store.fetch_tree("/data/root2/sibling.txt", None, None).await.unwrap().unwrap();
    assert!(sibling.deleted.is_none());
    let root_tree = store.fetch_tree("/data/root", None, None).await.unwrap().unwrap();
    assert!(root_tree.deleted.is_none());
    assert!(root_tree.root);

    let stats = drain_all(&mut store, vec![file_record("/data/root/gone.txt", 1, 1)]).await;
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.added, 0);
    let gone = store.fetch_tree("/data/root/gone.txt", None, None).await.unwrap().unwrap();
    assert!(gone.deleted.is_none());
}

#[tokio::test]
async fn test_fetch_tree_missing_uri() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp).await;
    assert!(store.fetch_tree("/nowhere", None, None).await.unwrap().is_none());
}
