//! Command-level glue for the `acat` binary.
//!
//! Opens the catalog (pool, schema, registries), runs one operation and
//! prints a human-readable summary to stdout.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;

use crate::catalog::CatalogStore;
use crate::config::Config;
use crate::db;
use crate::error::CatalogError;
use crate::migrate;
use crate::pipeline::{Pipeline, PipelineOptions, RunReport};
use crate::processor::{LoadedProcessor, ProcessorRegistry};
use crate::sources::{AuthMode, SourceRegistry};

/// Everything a command needs, loaded from the database.
pub struct Catalog {
    pub pool: SqlitePool,
    pub registry: ProcessorRegistry,
    pub sources: SourceRegistry,
    pub store: CatalogStore,
}

impl Catalog {
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;

        let mut registry = ProcessorRegistry::with_builtins();
        let loaded = registry.load(&pool).await?;
        let mut sources = SourceRegistry::new(pool.clone());
        sources.load_sources().await?;
        tracing::debug!(processors = loaded, "catalog opened");

        Ok(Self {
            store: CatalogStore::new(pool.clone()),
            pool,
            registry,
            sources,
        })
    }

    /// Finds a loaded processor by name or by reference.
    pub fn processor(&self, key: &str) -> Result<&LoadedProcessor, CatalogError> {
        self.registry
            .get(key)
            .or_else(|| {
                self.registry
                    .processors()
                    .find(|p| p.processor.reference() == key)
            })
            .ok_or_else(|| CatalogError::UnknownProcessor(key.to_string()))
    }
}

pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Database initialized successfully.");
    Ok(())
}

pub async fn run_processor_add(config: &Config, reference: &str) -> Result<()> {
    let mut catalog = Catalog::open(config).await?;
    let settings = config.processor_settings(reference);
    let processor = catalog.registry.resolve(reference, &settings)?;
    let name = processor.name().to_string();
    let id = catalog
        .registry
        .register(&catalog.pool, processor, settings)
        .await?;
    println!("processor {} registered (id {}, reference {})", name, id, reference);
    catalog.pool.close().await;
    Ok(())
}

pub async fn run_processor_list(config: &Config) -> Result<()> {
    let catalog = Catalog::open(config).await?;

    println!(
        "{:<4} {:<20} {:<20} {:<16} {:<5} {:<5}",
        "ID", "NAME", "REFERENCE", "TYPES", "SCAN", "PARSE"
    );
    for loaded in catalog.registry.processors() {
        let p = &loaded.processor;
        println!(
            "{:<4} {:<20} {:<20} {:<16} {:<5} {:<5}",
            loaded.id,
            p.name(),
            p.reference(),
            p.avail_config().artifact_types.join(","),
            p.can_scan(),
            p.can_parse()
        );
    }

    let known: Vec<&str> = catalog.registry.references().collect();
    println!();
    println!("available references: {}", known.join(", "));
    catalog.pool.close().await;
    Ok(())
}

pub async fn run_source_add(
    config: &Config,
    processor: &str,
    uri: &str,
    root: bool,
    auth: AuthMode,
) -> Result<()> {
    let mut catalog = Catalog::open(config).await?;
    let loaded = catalog.processor(processor)?.clone();
    let descriptor = catalog
        .sources
        .register_source(&mut catalog.store, &loaded, uri, root, auth)
        .await
        .with_context(|| format!("Failed to register source '{}'", uri))?;

    println!(
        "source {} registered ({}, domain {}, root {})",
        descriptor.uri, descriptor.kind, descriptor.domain, root
    );
    catalog.pool.close().await;
    Ok(())
}

pub async fn run_source_list(config: &Config) -> Result<()> {
    let catalog = Catalog::open(config).await?;
    let rows = catalog.sources.list_sources().await?;

    println!(
        "{:<8} {:<6} {:<6} {:<16} {:<24} URI",
        "TYPE", "ROOT", "AUTH", "DOMAIN", "PROCESSORS"
    );
    for row in rows {
        println!(
            "{:<8} {:<6} {:<6} {:<16} {:<24} {}",
            row.source_type,
            row.root,
            row.auth,
            row.domain,
            row.processors.join(","),
            row.uri
        );
    }
    catalog.pool.close().await;
    Ok(())
}

pub async fn run_scan(config: &Config) -> Result<RunReport> {
    let mut catalog = Catalog::open(config).await?;
    if catalog.sources.index().is_empty() {
        bail!("No root sources registered. Add one with `acat source add <processor> <uri> --root`.");
    }

    let mut pipeline = Pipeline::new(PipelineOptions::from_config(config));
    cancel_on_ctrl_c(&pipeline);
    let report = pipeline
        .scan(&catalog.registry, &catalog.sources, &mut catalog.store)
        .await?;

    print_report("scan", &report);
    catalog.pool.close().await;
    Ok(report)
}

pub async fn run_parse(config: &Config, artifact_types: &[String]) -> Result<RunReport> {
    let mut catalog = Catalog::open(config).await?;
    let mut pipeline = Pipeline::new(PipelineOptions::from_config(config));
    cancel_on_ctrl_c(&pipeline);
    let report = pipeline
        .parse(&catalog.registry, &mut catalog.store, artifact_types)
        .await?;

    print_report("parse", &report);
    catalog.pool.close().await;
    Ok(report)
}

pub async fn run_show(
    config: &Config,
    uri: &str,
    container: Option<&str>,
    modified: Option<i64>,
) -> Result<()> {
    let catalog = Catalog::open(config).await?;
    let Some(tree) = catalog.store.fetch_tree(uri, container, modified).await? else {
        bail!("No cataloged uri '{}'", uri);
    };
    println!("{}", serde_json::to_string_pretty(&tree)?);
    catalog.pool.close().await;
    Ok(())
}

fn cancel_on_ctrl_c(pipeline: &Pipeline) {
    let token = pipeline.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping workers");
            token.cancel();
        }
    });
}

fn print_report(phase: &str, report: &RunReport) {
    let s = &report.stats;
    println!("{} complete", phase);
    println!("  groups:          {}", report.groups);
    println!("  items processed: {}", report.processed);
    println!("  item errors:     {}", report.item_errors);
    println!("  added:           {}", s.added);
    println!("  updated:         {}", s.updated);
    println!("  unchanged:       {}", s.unchanged);
    println!("  deleted:         {}", s.deleted);
    println!("  failed:          {}", s.failed);
    println!("  versions added:  {}", s.versions_added);
}
