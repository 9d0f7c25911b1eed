//! Catalog statistics and health overview.
//!
//! Provides a quick summary of what's cataloged: domains, sources,
//! processors, live and deleted URIs, versions and metadata rows, plus a
//! per-type breakdown. Used by `acat stats` to confirm that scans and
//! parses are landing where expected.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Row counts across the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSummary {
    pub domains: i64,
    pub sources: i64,
    pub processors: i64,
    pub live_uris: i64,
    pub deleted_uris: i64,
    pub versions: i64,
    pub uri_metadata: i64,
    pub version_metadata: i64,
    pub by_type: Vec<TypeStats>,
}

/// Per-artifact-type breakdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeStats {
    pub uri_type: String,
    pub uris: i64,
    pub versions: i64,
    /// Most recent `last_seen`, unix milliseconds.
    pub last_seen: Option<i64>,
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(sql).fetch_one(pool).await?)
}

pub async fn summarize(pool: &SqlitePool) -> Result<CatalogSummary> {
    let mut summary = CatalogSummary {
        domains: count(pool, "SELECT COUNT(*) FROM domains").await?,
        sources: count(pool, "SELECT COUNT(*) FROM sources").await?,
        processors: count(pool, "SELECT COUNT(*) FROM processors").await?,
        live_uris: count(pool, "SELECT COUNT(*) FROM uris WHERE deleted IS NULL").await?,
        deleted_uris: count(pool, "SELECT COUNT(*) FROM uris WHERE deleted IS NOT NULL").await?,
        versions: count(pool, "SELECT COUNT(*) FROM versions").await?,
        uri_metadata: count(pool, "SELECT COUNT(*) FROM uri_metadata").await?,
        version_metadata: count(pool, "SELECT COUNT(*) FROM version_metadata").await?,
        by_type: Vec::new(),
    };

    let rows = sqlx::query(
        r#"
        SELECT
            u.uri_type,
            COUNT(DISTINCT u.id) AS uri_count,
            COUNT(v.id) AS version_count,
            MAX(u.last_seen) AS last_seen
        FROM uris u
        LEFT JOIN versions v ON v.uri_id = u.id
        WHERE u.deleted IS NULL
        GROUP BY u.uri_type
        ORDER BY uri_count DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    summary.by_type = rows
        .iter()
        .map(|row| TypeStats {
            uri_type: row.get("uri_type"),
            uris: row.get("uri_count"),
            versions: row.get("version_count"),
            last_seen: row.get("last_seen"),
        })
        .collect();

    Ok(summary)
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let summary = summarize(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Artifact Catalog — Database Stats");
    println!("=================================");
    println!();
    println!("  Database:          {}", config.db.path.display());
    println!("  Size:              {}", format_bytes(db_size));
    println!();
    println!("  Domains:           {}", summary.domains);
    println!("  Sources:           {}", summary.sources);
    println!("  Processors:        {}", summary.processors);
    println!(
        "  URIs:              {} live, {} deleted",
        summary.live_uris, summary.deleted_uris
    );
    println!("  Versions:          {}", summary.versions);
    println!("  URI metadata:      {}", summary.uri_metadata);
    println!("  Version metadata:  {}", summary.version_metadata);

    if !summary.by_type.is_empty() {
        println!();
        println!("  By type:");
        println!(
            "  {:<12} {:>8} {:>10}   {}",
            "TYPE", "URIS", "VERSIONS", "LAST SEEN"
        );
        println!("  {}", "-".repeat(50));

        for t in &summary.by_type {
            let seen_display = match t.last_seen {
                Some(ms) => format_ts_relative(ms / 1000),
                None => "never".to_string(),
            };
            println!(
                "  {:<12} {:>8} {:>10}   {}",
                t.uri_type, t.uris, t.versions, seen_display
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp (seconds) as a relative time string.
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
