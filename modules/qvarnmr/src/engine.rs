//! Orchestration: run notifications through the map stage, group the
//! touched keys, run the reduce stage, acknowledge what succeeded and
//! retry what failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use qvarn_client::{optional, SearchQuery, Store};

use crate::error::{Error, Result};
use crate::map_stage::process_map;
use crate::notifications::{ack, Notification, ResourceChange};
use crate::reduce_stage::process_reduce;
use crate::topology::Topology;

/// Wait at least this long before the first retry of a failed notification.
const RETRY_FIRST_DELAY: Duration = Duration::from_millis(250);
/// Wait at least this long (from the first failure) before the second retry.
const RETRY_SECOND_DELAY: Duration = Duration::from_millis(1500);

/// Lifecycle events emitted after each processed unit of work. The worker
/// subscribes its lease keep-alive here so the lease cannot time out while
/// a long batch is in progress. Callback errors abort the batch.
#[async_trait]
pub trait EngineEvents: Send + Sync {
    async fn map_handler_processed(&self) -> Result<()> {
        Ok(())
    }

    async fn reduce_handler_processed(&self) -> Result<()> {
        Ok(())
    }
}

struct RetryRecord {
    retries: u32,
    first_failed_at: Instant,
}

/// A reduce group: every notification for the same `(mapped type, key)`
/// is reduced at most once per processing cycle.
#[derive(Debug, Clone, PartialEq)]
struct GroupKey {
    resource_type: String,
    key: Value,
}

impl GroupKey {
    fn sort_key(&self) -> (String, String) {
        (self.resource_type.clone(), self.key.to_string())
    }
}

pub struct MapReduceEngine {
    store: Arc<dyn Store>,
    topology: Topology,
    raise_errors: bool,
    callbacks: Vec<Arc<dyn EngineEvents>>,
    failed: HashMap<String, RetryRecord>,
}

impl MapReduceEngine {
    pub fn new(store: Arc<dyn Store>, topology: Topology) -> Self {
        Self {
            store,
            topology,
            raise_errors: false,
            callbacks: Vec::new(),
            failed: HashMap::new(),
        }
    }

    /// Propagate handler failures instead of absorbing them into the retry
    /// ledger. For tests.
    pub fn with_raise_errors(mut self, raise_errors: bool) -> Self {
        self.raise_errors = raise_errors;
        self
    }

    pub fn add_callback(&mut self, callback: Arc<dyn EngineEvents>) {
        self.callbacks.push(callback);
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Run one batch of notifications through both stages. Returns the
    /// number of notifications fully processed (and acknowledged).
    pub async fn process_changes(
        &mut self,
        changes: Vec<Notification>,
        resync: bool,
    ) -> Result<usize> {
        info!(resync, "processing changes");
        let started = std::time::Instant::now();
        let changes = self.filter_retries(changes).await?;
        let (mapped, errors, reduce_changes) = self.process_map_handlers(changes, resync).await?;
        let (reduced, errors) = self
            .process_reduce_handlers(reduce_changes, errors, resync)
            .await?;
        info!(
            resync,
            mapped,
            reduced,
            errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "done processing changes"
        );
        Ok(mapped + reduced)
    }

    /// Apply the retry ledger: skip notifications whose backoff window has
    /// not passed yet, and give up (acknowledge and drop) notifications
    /// that already failed three times.
    async fn filter_retries(&mut self, changes: Vec<Notification>) -> Result<Vec<Notification>> {
        enum RetryAction {
            Process,
            Skip,
            GiveUp,
        }

        let mut to_process = Vec::new();
        for notification in changes {
            let Some(id) = notification.notification_id.clone() else {
                // Synthetic notifications are not retry-tracked.
                to_process.push(notification);
                continue;
            };
            let action = match self.failed.get(&id) {
                None => RetryAction::Process,
                Some(record) => {
                    let elapsed = record.first_failed_at.elapsed();
                    if record.retries == 0 && elapsed < RETRY_FIRST_DELAY {
                        debug!(notification = %id, elapsed_ms = elapsed.as_millis() as u64, "retry skipped, first backoff");
                        RetryAction::Skip
                    } else if record.retries == 1 && elapsed < RETRY_SECOND_DELAY {
                        debug!(notification = %id, elapsed_ms = elapsed.as_millis() as u64, "retry skipped, second backoff");
                        RetryAction::Skip
                    } else if record.retries > 1 {
                        RetryAction::GiveUp
                    } else {
                        debug!(
                            notification = %id,
                            resource_type = %notification.resource_type,
                            resource = %notification.resource_id,
                            retries = record.retries,
                            "retrying failed notification"
                        );
                        RetryAction::Process
                    }
                }
            };
            match action {
                RetryAction::Process => to_process.push(notification),
                RetryAction::Skip => {}
                RetryAction::GiveUp => {
                    debug!(notification = %id, "giving up after retries");
                    self.failed.remove(&id);
                    ack(self.store.as_ref(), &notification).await?;
                }
            }
        }
        Ok(to_process)
    }

    async fn report_success(&mut self, notifications: &[Notification]) -> Result<()> {
        for notification in notifications {
            if let Some(id) = &notification.notification_id {
                self.failed.remove(id);
            }
            ack(self.store.as_ref(), notification).await?;
        }
        Ok(())
    }

    async fn report_error(&mut self, notifications: &[Notification]) -> Result<()> {
        use std::collections::hash_map::Entry;

        for notification in notifications {
            let Some(id) = notification.notification_id.clone() else {
                continue;
            };
            let give_up = match self.failed.entry(id) {
                Entry::Vacant(entry) => {
                    entry.insert(RetryRecord {
                        retries: 0,
                        first_failed_at: Instant::now(),
                    });
                    false
                }
                Entry::Occupied(mut entry) => {
                    if entry.get().retries > 1 {
                        entry.remove();
                        true
                    } else {
                        entry.get_mut().retries += 1;
                        false
                    }
                }
            };
            if give_up {
                ack(self.store.as_ref(), notification).await?;
            }
        }
        Ok(())
    }

    async fn process_map_handlers(
        &mut self,
        changes: Vec<Notification>,
        resync: bool,
    ) -> Result<(usize, usize, Vec<(GroupKey, Notification)>)> {
        let mut changes_processed = 0;
        let mut errors = 0;
        let mut reduce_changes = Vec::new();

        for notification in changes {
            let map_result = {
                let handlers = self.topology.mappers_for(&notification.resource_type);
                if handlers.is_empty() {
                    Ok(0)
                } else {
                    process_map(
                        self.store.as_ref(),
                        &notification.resource_type,
                        notification.resource_change,
                        &notification.resource_id,
                        handlers,
                        resync,
                    )
                    .await
                }
            };

            match map_result {
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    error!(
                        resource_type = %notification.resource_type,
                        change = %notification.resource_change,
                        resource = %notification.resource_id,
                        error = %err,
                        "error while processing map handlers"
                    );
                    self.report_error(std::slice::from_ref(&notification)).await?;
                    errors += 1;
                    if self.raise_errors {
                        return Err(err);
                    }
                }
                Ok(_) => {
                    // DELETE notifications never feed the reduce queue:
                    // mapped rows are only tombstoned (which notifies the
                    // mapped type as an update), and by the time they are
                    // deleted for real nobody cares about them any more.
                    let should_reduce = self.topology.is_reduce_source(&notification.resource_type)
                        && notification.resource_change != ResourceChange::Deleted;
                    if should_reduce {
                        let row = optional(
                            self.store
                                .search_one(
                                    &notification.resource_type,
                                    SearchQuery::new()
                                        .exact("id", notification.resource_id.as_str())
                                        .show("_mr_key"),
                                )
                                .await,
                        )?;
                        match row {
                            None => {
                                warn!(
                                    resource_type = %notification.resource_type,
                                    resource = %notification.resource_id,
                                    "cannot find resource named in notification; it may be \
                                     deleted or not yet replicated"
                                );
                                self.report_error(std::slice::from_ref(&notification)).await?;
                                errors += 1;
                            }
                            Some(row) => {
                                let key = row.get("_mr_key").cloned().unwrap_or(Value::Null);
                                reduce_changes.push((
                                    GroupKey {
                                        resource_type: notification.resource_type.clone(),
                                        key,
                                    },
                                    notification,
                                ));
                            }
                        }
                    } else {
                        self.report_success(std::slice::from_ref(&notification)).await?;
                        changes_processed += 1;
                    }
                }
            }

            self.emit_map_handler_processed().await?;
        }

        Ok((changes_processed, errors, reduce_changes))
    }

    async fn process_reduce_handlers(
        &mut self,
        mut changes: Vec<(GroupKey, Notification)>,
        mut errors: usize,
        resync: bool,
    ) -> Result<(usize, usize)> {
        let mut changes_processed = 0;

        // Sorted group order keeps processing deterministic.
        changes.sort_by(|a, b| a.0.sort_key().cmp(&b.0.sort_key()));

        let mut index = 0;
        while index < changes.len() {
            let group_key = changes[index].0.clone();
            let mut group = Vec::new();
            while index < changes.len() && changes[index].0 == group_key {
                group.push(changes[index].1.clone());
                index += 1;
            }

            let reduce_result = {
                let handlers = self.topology.reducers_for(&group_key.resource_type);
                process_reduce(
                    self.store.as_ref(),
                    &self.topology,
                    &group_key.resource_type,
                    &group_key.key,
                    handlers,
                    resync,
                )
                .await
            };

            match reduce_result {
                Err(Error::VersionSkew { key }) => {
                    // Mapped rows for this key carry mixed versions; leave
                    // the notifications unacked until resync catches up.
                    debug!(
                        resource_type = %group_key.resource_type,
                        key = %key,
                        "incompatible mapped resource versions, postponing reduce"
                    );
                    self.report_error(&group).await?;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    error!(
                        resource_type = %group_key.resource_type,
                        key = %group_key.key,
                        error = %err,
                        "error while processing reduce handlers"
                    );
                    self.report_error(&group).await?;
                    errors += group.len();
                    if self.raise_errors {
                        return Err(err);
                    }
                }
                Ok(()) => {
                    // The reduce observed the tombstones; now the marked
                    // rows can be removed for real.
                    let deleted = self
                        .store
                        .search_ids(
                            &group_key.resource_type,
                            SearchQuery::new()
                                .exact("_mr_key", &group_key.key)
                                .exact("_mr_deleted", true),
                        )
                        .await?;
                    for id in &deleted {
                        self.store.delete(&group_key.resource_type, id).await?;
                    }

                    self.report_success(&group).await?;
                    changes_processed += group.len();
                }
            }

            self.emit_reduce_handler_processed().await?;
        }

        Ok((changes_processed, errors))
    }

    async fn emit_map_handler_processed(&self) -> Result<()> {
        for callback in &self.callbacks {
            callback.map_handler_processed().await?;
        }
        Ok(())
    }

    async fn emit_reduce_handler_processed(&self) -> Result<()> {
        for callback in &self.callbacks {
            callback.reduce_handler_processed().await?;
        }
        Ok(())
    }
}
