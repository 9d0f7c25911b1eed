//! # Artifact Catalog
//!
//! An incremental, versioned catalog of the artifacts found under registered
//! root locations: folders, files, and entries inside zip/tar archives.
//!
//! Pluggable processors do the work. Scanners walk root sources and emit one
//! record per artifact; parsers read cataloged artifacts and attach derived
//! metadata. Every record flows through a single bounded output queue into
//! the catalog store, which diffs it against what is already persisted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │   Sources    │──▶│   Pipeline    │──▶│ CatalogStore │
//! │  root uris   │   │ worker groups │   │   SQLite     │
//! └──────────────┘   └──────┬───────┘   └──────┬──────┘
//!                           │                  │
//!                  ┌────────┴───────┐          ▼
//!                  ▼                ▼     ┌──────────┐
//!            ┌──────────┐    ┌──────────┐ │  query   │
//!            │ scanner  │    │ extract  │ │ builder  │
//!            │ (walker) │    │ (parsers)│ └──────────┘
//!            └──────────┘    └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! acat init
//! acat processor add scanner.filesystem
//! acat source add filesystem_scanner ./docs --root
//! acat scan
//! acat stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Library error type |
//! | [`walker`] | Filesystem and archive walk |
//! | [`archive`] | Zip/tar entry listing and reading |
//! | [`processor`] | Processor trait and registry |
//! | [`scanner`] | Filesystem scanner processor |
//! | [`extract`] | Parser processors |
//! | [`sources`] | Source registry |
//! | [`query`] | Work-item query builder |
//! | [`catalog`] | Catalog store (upsert, versions, sweep) |
//! | [`pipeline`] | Worker groups and the output drain |
//! | [`stats`] | Catalog summary |
//! | [`commands`] | CLI command glue |
//! | [`logging`] | Tracing subscriber setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod archive;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod processor;
pub mod query;
pub mod scanner;
pub mod sources;
pub mod stats;
pub mod walker;
