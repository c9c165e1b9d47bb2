//! Flush engine
//!
//! Turns drained records into one bulk write per model. Groups run
//! concurrently and each group's result is captured on its own, so a failing
//! collection never blocks or rolls back the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::operation::{OperationKind, OperationRecord};
use crate::db::{BulkWrite, BulkWriteResult, BulkWriteSummary, DocumentStore, UpdateSpec};
use crate::types::BufferError;

/// Records of one model, ordered creates, then updates, then deletes.
/// Insertion order is kept within each kind.
#[derive(Debug, Clone)]
pub struct ModelGroup {
    pub model: String,
    pub records: Vec<OperationRecord>,
}

impl ModelGroup {
    fn count(&self, kind: OperationKind) -> usize {
        self.records.iter().filter(|r| r.kind() == kind).count()
    }

    /// The bulk write this group is flushed as
    pub fn bulk_write(&self) -> BulkWrite {
        let mut write = BulkWrite::new(&self.model);
        for record in &self.records {
            match record.kind() {
                OperationKind::Create => {
                    write.creates.push(record.payload().cloned().unwrap_or_default());
                }
                OperationKind::Update => write.updates.push(UpdateSpec {
                    filter: record.filter().cloned().unwrap_or_default(),
                    update: record.payload().cloned().unwrap_or_default(),
                    upsert: record.options().upsert,
                }),
                OperationKind::Delete => {
                    write.deletes.push(record.filter().cloned().unwrap_or_default());
                }
            }
        }
        write
    }
}

/// Group records by model in order of each model's first appearance
pub fn group_records(records: Vec<OperationRecord>) -> Vec<ModelGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<ModelGroup> = Vec::new();

    for record in records {
        let slot = match index.get(record.model()) {
            Some(&slot) => slot,
            None => {
                index.insert(record.model().to_string(), groups.len());
                groups.push(ModelGroup {
                    model: record.model().to_string(),
                    records: Vec::new(),
                });
                groups.len() - 1
            }
        };
        groups[slot].records.push(record);
    }

    for group in &mut groups {
        // Stable: keeps insertion order inside each kind
        group.records.sort_by_key(|r| r.kind());
    }
    groups
}

/// Result of one model group's bulk write
#[derive(Debug, Clone, Serialize)]
pub struct GroupOutcome {
    pub model: String,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    /// Operations that were not applied
    pub failed: usize,
    /// Store counts when the store accepted the write
    pub summary: Option<BulkWriteSummary>,
    pub error: Option<String>,
}

impl GroupOutcome {
    pub fn operations(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Per-group results of one flush
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushReport {
    pub groups: Vec<GroupOutcome>,
    pub duration_ms: f64,
}

impl FlushReport {
    /// True when nothing was flushed
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.groups.iter().all(GroupOutcome::is_success)
    }

    pub fn group(&self, model: &str) -> Option<&GroupOutcome> {
        self.groups.iter().find(|g| g.model == model)
    }

    pub fn flushed_operations(&self) -> usize {
        self.groups.iter().map(|g| g.operations() - g.failed).sum()
    }

    pub fn failed_operations(&self) -> usize {
        self.groups.iter().map(|g| g.failed).sum()
    }

    /// One error per group with failed operations
    pub fn errors(&self) -> Vec<BufferError> {
        self.groups
            .iter()
            .filter_map(|g| {
                g.error.as_ref().map(|message| BufferError::FlushGroup {
                    model: g.model.clone(),
                    message: message.clone(),
                })
            })
            .collect()
    }
}

/// Which attempt a flush is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Records drained from the buffer
    Buffered,
    /// Dead-lettered records. A create rejected with a duplicate key was
    /// inserted by an earlier attempt and counts as applied.
    Redrive,
}

/// Applies grouped records to the document store
#[derive(Clone)]
pub struct FlushEngine {
    store: Arc<dyn DocumentStore>,
}

impl FlushEngine {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Write every group, returning the report and the records that were
    /// not applied
    pub async fn execute(
        &self,
        records: Vec<OperationRecord>,
        mode: FlushMode,
    ) -> (FlushReport, Vec<OperationRecord>) {
        let start = Instant::now();
        let groups = group_records(records);

        let writes = groups.iter().map(|group| {
            let write = group.bulk_write();
            let store = Arc::clone(&self.store);
            async move { store.bulk_write(&write).await }
        });
        let results = join_all(writes).await;

        let mut report = FlushReport::default();
        let mut failed = Vec::new();

        for (group, result) in groups.into_iter().zip(results) {
            let mut outcome = GroupOutcome {
                model: group.model.clone(),
                creates: group.count(OperationKind::Create),
                updates: group.count(OperationKind::Update),
                deletes: group.count(OperationKind::Delete),
                failed: 0,
                summary: None,
                error: None,
            };

            match result {
                Ok(result) => {
                    let rejected = rejected_records(&group, &result, mode);
                    outcome.summary = Some(result.summary);
                    if rejected.is_empty() {
                        debug!(
                            model = outcome.model,
                            operations = outcome.operations(),
                            "Flush group written"
                        );
                    } else {
                        let first = result
                            .failures
                            .first()
                            .map(|f| f.message.as_str())
                            .unwrap_or("unknown error");
                        error!(
                            model = outcome.model,
                            operations = outcome.operations(),
                            failed = rejected.len(),
                            error = first,
                            "Flush group partly failed"
                        );
                        outcome.failed = rejected.len();
                        outcome.error = Some(format!(
                            "{} of {} operations failed, first: {}",
                            rejected.len(),
                            outcome.operations(),
                            first
                        ));
                        failed.extend(rejected);
                    }
                }
                Err(e) => {
                    error!(
                        model = outcome.model,
                        operations = outcome.operations(),
                        error = %e,
                        "Flush group failed"
                    );
                    outcome.failed = outcome.operations();
                    outcome.error = Some(e.to_string());
                    failed.extend(group.records);
                }
            }
            report.groups.push(outcome);
        }

        report.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        (report, failed)
    }
}

/// Records of a group that the store reported as not applied
fn rejected_records(
    group: &ModelGroup,
    result: &BulkWriteResult,
    mode: FlushMode,
) -> Vec<OperationRecord> {
    let mut rejected = Vec::with_capacity(result.failures.len());
    for failure in &result.failures {
        let Some(record) = group.records.get(failure.index) else {
            warn!(
                model = group.model,
                index = failure.index,
                "Store reported a failure outside the write"
            );
            continue;
        };

        if mode == FlushMode::Redrive
            && record.kind() == OperationKind::Create
            && failure.is_duplicate_key()
        {
            warn!(
                op_id = %record.id(),
                model = group.model,
                "Redriven create already present, counted as applied"
            );
            continue;
        }
        rejected.push(record.clone());
    }
    rejected
}
