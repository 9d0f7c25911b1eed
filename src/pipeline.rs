//! Scan/parse orchestration over bounded queues.
//!
//! ```text
//!  sources / query rows
//!         │ feeder (one per group)
//!         ▼
//!  ┌──────────────┐   ┌──────────────┐
//!  │ input queue  │   │ input queue  │   one per (artifact type, processor)
//!  └──┬────┬──────┘   └──┬───────────┘
//!     ▼    ▼             ▼
//!   worker worker      worker            threads.count each, blocking work
//!     └────┴──────┬──────┘
//!                 ▼
//!          output queue (shared) ──▶ CatalogStore::drain (single writer)
//! ```
//!
//! A run moves Idle → Dispatching → Draining → Done. The drain consumes
//! concurrently with the workers so bounded queues never stall dispatch;
//! it finishes once every group has returned and the output queue closes.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::{now_ms, CatalogStore};
use crate::config::{Config, ThreadSettings};
use crate::error::{CatalogError, Result};
use crate::models::{CatalogRecord, DrainStats, WorkItem};
use crate::processor::{LoadedProcessor, Processor, ProcessorRegistry, RecordSink, ScanReport};
use crate::query;
use crate::sources::SourceRegistry;

/// Artifact type parsed when a caller names none.
pub const DEFAULT_PARSE_TYPE: &str = "file";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Dispatching,
    Draining,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scan,
    Parse,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Thread settings for processors that declare none.
    pub defaults: ThreadSettings,
    pub queue_capacity: usize,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            defaults: config.threads,
            queue_capacity: config.pipeline.queue_capacity,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            defaults: ThreadSettings::default(),
            queue_capacity: 1024,
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub stats: DrainStats,
    /// Worker groups started.
    pub groups: usize,
    /// Work items handled without error.
    pub processed: u64,
    /// Work items whose processor call failed.
    pub item_errors: u64,
}

#[derive(Debug, Default)]
struct GroupResult {
    processed: u64,
    errors: u64,
    reports: Vec<ScanReport>,
}

impl GroupResult {
    fn merge(&mut self, other: GroupResult) {
        self.processed += other.processed;
        self.errors += other.errors;
        self.reports.extend(other.reports);
    }
}

pub struct Pipeline {
    options: PipelineOptions,
    state: PipelineState,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            options,
            state: PipelineState::Idle,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// A token that stops every worker after its current item.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_state(&mut self, state: PipelineState) {
        tracing::debug!(from = ?self.state, to = ?state, "pipeline state");
        self.state = state;
    }

    /// Effective threads: stored settings over declared defaults over the
    /// global default.
    fn threads_for(&self, loaded: &LoadedProcessor) -> ThreadSettings {
        let declared = loaded.processor.avail_config().threads;
        loaded
            .settings
            .threads
            .apply(declared.apply(self.options.defaults))
    }

    /// Scans every indexed root source with its processors, then sweeps
    /// cleanly walked roots for URIs that disappeared.
    pub async fn scan(
        &mut self,
        registry: &ProcessorRegistry,
        sources: &SourceRegistry,
        store: &mut CatalogStore,
    ) -> Result<RunReport> {
        let pass_start = now_ms();
        self.set_state(PipelineState::Dispatching);

        let (out_tx, out_rx) = async_channel::bounded(self.options.queue_capacity);
        let mut handles = Vec::new();

        for (artifact_type, group) in sources.index() {
            for name in &group.processors {
                let Some(loaded) = registry.get(name) else {
                    tracing::warn!(processor = %name, "processor for source is not loaded");
                    continue;
                };
                if !loaded.processor.can_scan() {
                    tracing::warn!(processor = %name, "processor cannot scan, skipping its sources");
                    continue;
                }

                let items: Vec<WorkItem> = group
                    .uris
                    .iter()
                    .filter(|(_, entry)| entry.processors.contains(name))
                    .map(|(uri, entry)| WorkItem {
                        uri: uri.clone(),
                        uri_type: artifact_type.clone(),
                        domain: Some(entry.domain.clone()),
                        ..WorkItem::default()
                    })
                    .collect();
                if items.is_empty() {
                    continue;
                }

                tracing::info!(
                    processor = %name,
                    artifact_type = %artifact_type,
                    sources = items.len(),
                    "dispatching scan"
                );
                handles.push(self.spawn_group(loaded, Phase::Scan, items, &out_tx));
            }
        }
        drop(out_tx);

        let (result, stats, groups) = self.run_groups(handles, store, out_rx).await?;
        let mut report = RunReport {
            stats,
            groups,
            processed: result.processed,
            item_errors: result.errors,
        };

        if self.cancel.is_cancelled() {
            tracing::warn!("scan cancelled, skipping missing-item sweep");
        } else if report.stats.failed > 0 {
            tracing::warn!(
                failed = report.stats.failed,
                "records failed to persist, skipping missing-item sweep"
            );
        } else {
            report.stats.deleted = sweep(store, &result.reports, pass_start).await?;
        }

        self.set_state(PipelineState::Done);
        Ok(report)
    }

    /// Parses cataloged URIs of the given artifact types with every
    /// parse-capable processor declared for them.
    ///
    /// Fails with `NoHandler` before dispatching anything if a type has no
    /// such processor.
    pub async fn parse(
        &mut self,
        registry: &ProcessorRegistry,
        store: &mut CatalogStore,
        artifact_types: &[String],
    ) -> Result<RunReport> {
        let types: Vec<String> = if artifact_types.is_empty() {
            vec![DEFAULT_PARSE_TYPE.to_string()]
        } else {
            artifact_types.to_vec()
        };

        let mut plan: Vec<(String, &LoadedProcessor)> = Vec::new();
        for artifact_type in &types {
            let handlers: Vec<&LoadedProcessor> = registry
                .handlers_for(artifact_type)
                .into_iter()
                .filter(|loaded| loaded.processor.can_parse())
                .collect();
            if handlers.is_empty() {
                return Err(CatalogError::NoHandler {
                    artifact_type: artifact_type.clone(),
                });
            }
            plan.extend(handlers.into_iter().map(|h| (artifact_type.clone(), h)));
        }

        self.set_state(PipelineState::Dispatching);
        let (out_tx, out_rx) = async_channel::bounded(self.options.queue_capacity);
        let mut handles = Vec::new();

        for (artifact_type, loaded) in plan {
            let items = parse_items(store, loaded.processor.as_ref(), &artifact_type).await?;
            if items.is_empty() {
                tracing::debug!(processor = %loaded.processor.name(), artifact_type = %artifact_type, "nothing to parse");
                continue;
            }
            tracing::info!(
                processor = %loaded.processor.name(),
                artifact_type = %artifact_type,
                items = items.len(),
                "dispatching parse"
            );
            handles.push(self.spawn_group(loaded, Phase::Parse, items, &out_tx));
        }
        drop(out_tx);

        let (result, stats, groups) = self.run_groups(handles, store, out_rx).await?;
        self.set_state(PipelineState::Done);
        Ok(RunReport {
            stats,
            groups,
            processed: result.processed,
            item_errors: result.errors,
        })
    }

    /// Starts one worker group: a feeder filling a bounded input queue and
    /// `threads.count` workers draining it into the output queue.
    fn spawn_group(
        &self,
        loaded: &LoadedProcessor,
        phase: Phase,
        items: Vec<WorkItem>,
        out_tx: &async_channel::Sender<CatalogRecord>,
    ) -> JoinHandle<GroupResult> {
        let threads = self.threads_for(loaded);
        let (in_tx, in_rx) = async_channel::bounded(self.options.queue_capacity);

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            for item in items {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = in_tx.send(item) => if sent.is_err() { break },
                }
            }
        });

        let workers: Vec<JoinHandle<GroupResult>> = (0..threads.count.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    loaded.processor.clone(),
                    phase,
                    in_rx.clone(),
                    RecordSink::new(out_tx.clone(), Some(loaded.id)),
                    threads,
                    self.cancel.clone(),
                ))
            })
            .collect();
        drop(in_rx);

        let name = loaded.processor.name().to_string();
        tokio::spawn(async move {
            let mut result = GroupResult::default();
            for worker in workers {
                match worker.await {
                    Ok(r) => result.merge(r),
                    Err(err) => tracing::error!(processor = %name, error = %err, "worker task failed"),
                }
            }
            tracing::debug!(processor = %name, processed = result.processed, errors = result.errors, "group finished");
            result
        })
    }

    /// Waits for every group while the store drains the output queue.
    async fn run_groups(
        &mut self,
        handles: Vec<JoinHandle<GroupResult>>,
        store: &mut CatalogStore,
        out_rx: async_channel::Receiver<CatalogRecord>,
    ) -> Result<(GroupResult, DrainStats, usize)> {
        let group_count = handles.len();
        let closer = out_rx.clone();
        let drain = store.drain(out_rx);
        tokio::pin!(drain);

        let groups = async {
            let mut result = GroupResult::default();
            for handle in handles {
                match handle.await {
                    Ok(r) => result.merge(r),
                    Err(err) => tracing::error!(error = %err, "worker group failed"),
                }
            }
            result
        };
        tokio::pin!(groups);

        let mut drained: Option<Result<DrainStats>> = None;
        let result = loop {
            tokio::select! {
                result = &mut groups => break result,
                stats = &mut drain, if drained.is_none() => {
                    // The drain only ends early on a store error.
                    self.cancel.cancel();
                    closer.close();
                    drained = Some(stats);
                }
            }
        };
        drop(closer);

        self.set_state(PipelineState::Draining);
        let stats = match drained {
            Some(stats) => stats?,
            None => drain.await?,
        };
        Ok((result, stats, group_count))
    }
}

async fn worker_loop(
    worker: usize,
    processor: Arc<dyn Processor>,
    phase: Phase,
    rx: async_channel::Receiver<WorkItem>,
    sink: RecordSink,
    threads: ThreadSettings,
    cancel: CancellationToken,
) -> GroupResult {
    let timeout = Duration::from_secs(threads.timeout_secs);
    let mut result = GroupResult::default();

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            received = tokio::time::timeout(timeout, rx.recv()) => match received {
                Ok(Ok(item)) => item,
                // Closed and empty.
                Ok(Err(_)) => break,
                Err(_) if threads.stop => {
                    tracing::debug!(processor = %processor.name(), worker, "queue empty, stopping");
                    break;
                }
                Err(_) => continue,
            },
        };

        let uri = item.uri.clone();
        let task_processor = processor.clone();
        let task_sink = sink.clone();
        let outcome = tokio::task::spawn_blocking(move || match phase {
            Phase::Scan => task_processor.scan_item(&item, &task_sink),
            Phase::Parse => task_processor.parse_item(&item, &task_sink).map(|_| None),
        })
        .await;

        match outcome {
            Ok(Ok(report)) => {
                result.processed += 1;
                result.reports.extend(report);
            }
            Ok(Err(err)) => {
                result.errors += 1;
                tracing::warn!(processor = %processor.name(), uri = %uri, error = %err, "item failed");
            }
            Err(err) => {
                result.errors += 1;
                tracing::error!(processor = %processor.name(), uri = %uri, error = %err, "item task panicked");
            }
        }
    }

    result
}

/// Work items for one parser and artifact type, deduplicated across its
/// filter clauses.
async fn parse_items(
    store: &CatalogStore,
    processor: &dyn Processor,
    artifact_type: &str,
) -> Result<Vec<WorkItem>> {
    let config = processor.avail_config();
    let queries = query::build_queries(
        &config.source_filters,
        &config.uri_metadata_keys,
        &config.version_metadata_keys,
    );
    if queries.is_empty() {
        tracing::warn!(processor = %processor.name(), "no usable source filters");
    }

    let mut seen = BTreeSet::new();
    let mut items = Vec::new();
    for query in queries {
        for item in query.fetch(store.pool()).await? {
            if item.uri_type != artifact_type {
                continue;
            }
            if item.uri_id.map_or(true, |id| seen.insert(id)) {
                items.push(item);
            }
        }
    }
    Ok(items)
}

/// Sweeps each root whose every scan reported no walk errors.
async fn sweep(store: &CatalogStore, reports: &[ScanReport], pass_start: i64) -> Result<u64> {
    let mut dirty = BTreeSet::new();
    let mut roots = BTreeSet::new();
    for report in reports {
        let key = (report.domain.clone(), report.root.clone());
        if report.errors > 0 {
            dirty.insert(key.clone());
        }
        roots.insert(key);
    }

    let mut deleted = 0;
    for (domain, root) in roots.difference(&dirty) {
        deleted += store.sweep_missing(domain, root, pass_start).await?;
    }
    for (_, root) in &dirty {
        tracing::info!(root = %root, "walk had errors, not sweeping");
    }
    Ok(deleted)
}
