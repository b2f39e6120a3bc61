//! Automatic full resync for new or changed handlers.
//!
//! A handler whose declared version differs from the persisted version
//! record gets every source replayed through the engine in resync mode.
//! The driver is a stepwise state machine so the worker can interleave
//! live notification processing between chunks.

use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

use serde_json::Value;
use tracing::info;

use qvarn_client::{optional, Resource, SearchQuery, Store};

use crate::engine::MapReduceEngine;
use crate::error::{Error, Result};
use crate::notifications::{Notification, ResourceChange};
use crate::reduce_stage::process_reduce;
use crate::topology::{HandlerSpec, Topology};

/// Resource type holding the handler version records.
pub const HANDLERS_TYPE: &str = "qvarnmr_handlers";

/// How many synthetic notifications (or keys) go through the engine per
/// step; live notifications are drained between steps.
pub const RESYNC_CHUNK_SIZE: usize = 100;

/// How many mapped rows are loaded at once while discovering distinct
/// keys. Plain id paging plus batched loads; a projected search over a
/// large table can time out in the store.
const KEY_SCAN_BATCH_SIZE: usize = 1000;

/// Persist the version a handler has been fully resynced to.
pub async fn update_handler_version(
    store: &dyn Store,
    instance: &str,
    target_resource_type: &str,
    source_resource_type: &str,
    version: i64,
) -> Result<()> {
    let state = optional(
        store
            .search_one(
                HANDLERS_TYPE,
                SearchQuery::new()
                    .exact("instance", instance)
                    .exact("target", target_resource_type)
                    .exact("source", source_resource_type),
            )
            .await,
    )?;

    let mut payload = Resource::new();
    payload.insert("instance".to_string(), Value::String(instance.to_string()));
    payload.insert(
        "target".to_string(),
        Value::String(target_resource_type.to_string()),
    );
    payload.insert(
        "source".to_string(),
        Value::String(source_resource_type.to_string()),
    );
    payload.insert("version".to_string(), Value::from(version));

    match state {
        None => {
            store.create(HANDLERS_TYPE, payload).await?;
        }
        Some(state) => {
            if let Some(revision) = state.get("revision") {
                payload.insert("revision".to_string(), revision.clone());
            }
            let id = state
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Config("handler version record without an id".to_string()))?;
            store.update(HANDLERS_TYPE, id, payload).await?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Map,
    Reduce,
}

#[derive(Debug, Clone)]
struct Job {
    kind: JobKind,
    target: String,
    source: String,
    version: i64,
}

enum Chunk {
    Notifications(Vec<Notification>),
    Keys(Vec<Value>),
}

struct ActiveJob {
    job: Job,
    chunks: VecDeque<Chunk>,
    started: Instant,
}

/// Handlers whose persisted version record is missing or differs from the
/// declared version, map handlers first.
async fn changed_handlers(
    store: &dyn Store,
    topology: &Topology,
    instance: &str,
    kind: JobKind,
) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for (target, source, spec) in topology.handlers() {
        let is_map = matches!(spec, HandlerSpec::Map(_));
        if (kind == JobKind::Map) != is_map {
            continue;
        }
        let state = optional(
            store
                .search_one(
                    HANDLERS_TYPE,
                    SearchQuery::new()
                        .exact("instance", instance)
                        .exact("target", target)
                        .exact("source", source),
                )
                .await,
        )?;
        let persisted = state.and_then(|s| s.get("version").and_then(Value::as_i64));
        if persisted != Some(spec.version()) {
            jobs.push(Job {
                kind,
                target: target.to_string(),
                source: source.to_string(),
                version: spec.version(),
            });
        }
    }
    Ok(jobs)
}

/// A planned resync run. Call [`ResyncRun::step`] until it returns
/// `false`; each step processes one chunk, and the caller may do other
/// work (drain live notifications) between steps.
pub struct ResyncRun {
    instance: String,
    jobs: VecDeque<Job>,
    current: Option<ActiveJob>,
}

impl ResyncRun {
    pub async fn plan(store: &dyn Store, topology: &Topology, instance: &str) -> Result<Self> {
        // Map handlers resync first: reduce resync reads mapped rows and
        // its version check requires them to be current.
        let mut jobs = changed_handlers(store, topology, instance, JobKind::Map).await?;
        jobs.extend(changed_handlers(store, topology, instance, JobKind::Reduce).await?);
        Ok(Self {
            instance: instance.to_string(),
            jobs: jobs.into(),
            current: None,
        })
    }

    /// Process the next chunk. Returns `false` when nothing is left.
    pub async fn step(&mut self, engine: &mut MapReduceEngine) -> Result<bool> {
        loop {
            match self.current.take() {
                None => {
                    let Some(job) = self.jobs.pop_front() else {
                        return Ok(false);
                    };
                    self.current = Some(activate(engine, job).await?);
                }
                Some(mut active) => match active.chunks.pop_front() {
                    None => {
                        self.finish(engine, &active).await?;
                    }
                    Some(chunk) => {
                        process_chunk(engine, &active.job, chunk).await?;
                        if active.chunks.is_empty() {
                            self.finish(engine, &active).await?;
                        } else {
                            self.current = Some(active);
                        }
                        return Ok(true);
                    }
                },
            }
        }
    }

    async fn finish(&self, engine: &MapReduceEngine, active: &ActiveJob) -> Result<()> {
        let store = engine.store();
        update_handler_version(
            store.as_ref(),
            &self.instance,
            &active.job.target,
            &active.job.source,
            active.job.version,
        )
        .await?;
        info!(
            source = %active.job.source,
            target = %active.job.target,
            version = active.job.version,
            kind = ?active.job.kind,
            elapsed_ms = active.started.elapsed().as_millis() as u64,
            "done full resync"
        );
        Ok(())
    }
}

async fn activate(engine: &MapReduceEngine, job: Job) -> Result<ActiveJob> {
    info!(
        source = %job.source,
        target = %job.target,
        version = job.version,
        kind = ?job.kind,
        "starting full resync"
    );
    let store = engine.store();
    let chunks = match job.kind {
        JobKind::Map => {
            let ids = store.get_list(&job.source).await?;
            ids.chunks(RESYNC_CHUNK_SIZE)
                .map(|chunk| {
                    Chunk::Notifications(
                        chunk
                            .iter()
                            .map(|id| {
                                Notification::synthetic(&job.source, ResourceChange::Updated, id)
                            })
                            .collect(),
                    )
                })
                .collect()
        }
        JobKind::Reduce => {
            let keys = distinct_keys(store.as_ref(), &job.source).await?;
            keys.chunks(RESYNC_CHUNK_SIZE)
                .map(|chunk| Chunk::Keys(chunk.to_vec()))
                .collect()
        }
    };
    Ok(ActiveJob {
        job,
        chunks,
        started: Instant::now(),
    })
}

/// All distinct `_mr_key` values of a mapped resource type, in first-seen
/// order.
async fn distinct_keys(store: &dyn Store, source_resource_type: &str) -> Result<Vec<Value>> {
    let ids = store.get_list(source_resource_type).await?;
    let mut seen = BTreeSet::new();
    let mut keys = Vec::new();
    for batch in ids.chunks(KEY_SCAN_BATCH_SIZE) {
        for row in store.get_multiple(source_resource_type, batch).await? {
            let key = row.get("_mr_key").cloned().unwrap_or(Value::Null);
            if seen.insert(key.to_string()) {
                keys.push(key);
            }
        }
    }
    Ok(keys)
}

async fn process_chunk(engine: &mut MapReduceEngine, job: &Job, chunk: Chunk) -> Result<()> {
    match chunk {
        Chunk::Notifications(notifications) => {
            engine.process_changes(notifications, true).await?;
        }
        Chunk::Keys(keys) => {
            let store = engine.store();
            let spec = engine
                .topology()
                .reduce_spec(&job.target, &job.source)
                .cloned()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no reduce handler registered for {} <- {}",
                        job.target, job.source
                    ))
                })?;
            let handlers = vec![(job.target.clone(), spec)];
            for key in keys {
                process_reduce(
                    store.as_ref(),
                    engine.topology(),
                    &job.source,
                    &key,
                    &handlers,
                    true,
                )
                .await?;
            }
        }
    }
    Ok(())
}
