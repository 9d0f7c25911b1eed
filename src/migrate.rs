//! Idempotent schema creation for the catalog database.
//!
//! Row bookkeeping timestamps (`added`, `modified`, `last_seen`, `deleted`)
//! are unix milliseconds. `versions.modified` is the artifact's own
//! modification time in unix seconds.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates every table and index on an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    let tables = [
        r#"
        CREATE TABLE IF NOT EXISTS domains (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            added INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain_id INTEGER NOT NULL,
            source_type TEXT NOT NULL,
            uri TEXT NOT NULL UNIQUE,
            auth TEXT NOT NULL DEFAULT 'none'
                CHECK (auth IN ('none', 'token', 'basic', 'oauth')),
            added INTEGER NOT NULL,
            FOREIGN KEY (domain_id) REFERENCES domains(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS processors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            reference TEXT NOT NULL,
            settings TEXT NOT NULL DEFAULT '{}',
            added INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS processor_metadata (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            processor_id INTEGER NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            added INTEGER NOT NULL,
            modified INTEGER NOT NULL,
            UNIQUE(processor_id, key),
            FOREIGN KEY (processor_id) REFERENCES processors(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS source_processor_map (
            source_id INTEGER NOT NULL,
            processor_id INTEGER NOT NULL,
            added INTEGER NOT NULL,
            PRIMARY KEY (source_id, processor_id),
            FOREIGN KEY (source_id) REFERENCES sources(id),
            FOREIGN KEY (processor_id) REFERENCES processors(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS uris (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain_id INTEGER NOT NULL,
            uri TEXT NOT NULL,
            uri_type TEXT NOT NULL,
            container TEXT NOT NULL DEFAULT '',
            root INTEGER NOT NULL DEFAULT 0,
            added INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            deleted INTEGER,
            UNIQUE(domain_id, uri, container),
            FOREIGN KEY (domain_id) REFERENCES domains(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS uri_metadata (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uri_id INTEGER NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            added INTEGER NOT NULL,
            modified INTEGER NOT NULL,
            UNIQUE(uri_id, key),
            FOREIGN KEY (uri_id) REFERENCES uris(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uri_id INTEGER NOT NULL,
            modified INTEGER,
            size INTEGER,
            checksum TEXT,
            added INTEGER NOT NULL,
            UNIQUE(uri_id, modified, size),
            FOREIGN KEY (uri_id) REFERENCES uris(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS version_metadata (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version_id INTEGER NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            added INTEGER NOT NULL,
            modified INTEGER NOT NULL,
            UNIQUE(version_id, key),
            FOREIGN KEY (version_id) REFERENCES versions(id)
        )
        "#,
    ];

    for ddl in tables {
        sqlx::query(ddl).execute(pool).await?;
    }

    // Create indexes
    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_uris_domain_uri ON uris(domain_id, uri)",
        "CREATE INDEX IF NOT EXISTS idx_uris_container ON uris(container)",
        "CREATE INDEX IF NOT EXISTS idx_uri_metadata_key ON uri_metadata(key, value)",
        "CREATE INDEX IF NOT EXISTS idx_versions_uri_modified ON versions(uri_id, modified DESC)",
        "CREATE INDEX IF NOT EXISTS idx_version_metadata_key ON version_metadata(key, value)",
    ];
    for ddl in indexes {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}
