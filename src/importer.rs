// 🚚 Batch Import Orchestrator - CSV → validate → normalize → decide → persist
//
// The file is read in fixed-size chunks. Writes for a chunk are flushed in
// one `upsert_batch` at the chunk boundary. A key seen twice in one file is
// resolved against the batch-local cache (the first occurrence's pending
// write), never against a stale repository read.
//
// Failure policy:
//   - a bad row is reported and skipped
//   - a chunk that cannot be persisted is logged and skipped
//   - the run fails only if the source cannot be read, or every chunk failed

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Span};

use crate::blob::BlobStore;
use crate::change_detection::{decide, ChangeDecision, ChangedField};
use crate::db::Event;
use crate::error::{FieldError, PipelineError, RepositoryError, Result, RowError};
use crate::normalizer::normalize;
use crate::notification::{DispatchReport, NotificationDispatcher};
use crate::record::{EmployeeRecord, RawRow};
use crate::repository::{save_record, EmployeeRepository};
use crate::validation::FieldValidator;

/// Rows per chunk unless configured otherwise
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Actor recorded on audit events written by imports
pub const IMPORT_ACTOR: &str = "csv_import";

// ============================================================================
// OUTCOME
// ============================================================================

/// Structured result of one import run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportOutcome {
    /// Data rows read (blank rows excluded)
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Invalid rows plus rows that could not be persisted
    pub failed: usize,
    pub errors: Vec<RowError>,
    pub chunks: usize,
    pub chunks_failed: usize,
    #[serde(default)]
    pub notifications: DispatchReport,
}

impl ImportOutcome {
    pub fn succeeded(&self) -> usize {
        self.created + self.updated + self.unchanged
    }
}

// ============================================================================
// CHUNK STATE
// ============================================================================

/// A write waiting for the chunk flush
#[derive(Debug, Clone)]
struct PendingWrite {
    row: usize,
    record: EmployeeRecord,
    /// True while the key has never been persisted
    creates: bool,
    changes: Vec<ChangedField>,
}

#[derive(Default)]
struct Chunk {
    writes: Vec<PendingWrite>,
    /// natural_key → index in `writes`
    index: HashMap<String, usize>,
    persisted: usize,
    persistence_failures: usize,
}

impl Chunk {
    fn failed(&self) -> bool {
        self.persistence_failures > 0 && self.persisted == 0
    }
}

/// Records persisted during the run, latest version per natural key
#[derive(Default)]
struct ChangedRecords {
    records: Vec<EmployeeRecord>,
    /// natural_key → index in `records`
    index: HashMap<String, usize>,
}

impl ChangedRecords {
    fn insert(&mut self, record: EmployeeRecord) {
        match self.index.get(&record.natural_key) {
            Some(&i) => self.records[i] = record,
            None => {
                self.index.insert(record.natural_key.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    fn records(&self) -> &[EmployeeRecord] {
        &self.records
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct ImportOrchestrator {
    repo: Arc<dyn EmployeeRepository>,
    blobs: Arc<dyn BlobStore>,
    dispatcher: Option<Arc<NotificationDispatcher>>,
    validator: FieldValidator,
    chunk_size: usize,
    span: Span,
}

impl ImportOrchestrator {
    pub fn new(repo: Arc<dyn EmployeeRepository>, blobs: Arc<dyn BlobStore>) -> Self {
        ImportOrchestrator {
            repo,
            blobs,
            dispatcher: None,
            validator: FieldValidator::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            span: tracing::info_span!("import"),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Import the stored blob at `source_path` for `owner_id`
    pub fn run(&self, source_path: &str, owner_id: i64, cancel: &CancellationToken) -> Result<ImportOutcome> {
        self.run_observed(source_path, owner_id, cancel, &|_| {})
    }

    /// `run`, calling `progress` with the running tallies after every chunk
    pub fn run_observed(
        &self,
        source_path: &str,
        owner_id: i64,
        cancel: &CancellationToken,
        progress: &dyn Fn(&ImportOutcome),
    ) -> Result<ImportOutcome> {
        let reader = self.blobs.read(source_path).map_err(|e| PipelineError::SourceUnavailable {
            path: PathBuf::from(source_path),
            reason: e.to_string(),
        })?;

        self.run_reader(reader, source_path, owner_id, cancel, progress)
    }

    /// Import CSV content from any reader; `label` names the source in errors
    pub fn run_reader<R: Read>(
        &self,
        reader: R,
        label: &str,
        owner_id: i64,
        cancel: &CancellationToken,
        progress: &dyn Fn(&ImportOutcome),
    ) -> Result<ImportOutcome> {
        let unavailable = |reason: String| PipelineError::SourceUnavailable {
            path: PathBuf::from(label),
            reason,
        };

        let mut csv_reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::None)
            .from_reader(reader);

        // Normalized per row by `RawRow::from_pairs`
        let headers = csv_reader.headers().map_err(|e| unavailable(e.to_string()))?.clone();

        info!(parent: &self.span, source = label, owner_id, chunk_size = self.chunk_size, "import started");

        let mut outcome = ImportOutcome::default();
        // natural_key → latest known state (persisted or pending) for this run
        let mut seen: HashMap<String, EmployeeRecord> = HashMap::new();
        let mut changed = ChangedRecords::default();

        let mut records = csv_reader.records();
        let mut row_number = 0usize;
        let mut exhausted = false;

        while !exhausted {
            let mut chunk = Chunk::default();
            let mut rows_in_chunk = 0usize;

            while rows_in_chunk < self.chunk_size {
                // A cancel cuts the chunk short; what was buffered is still flushed
                if cancel.is_cancelled() {
                    break;
                }
                let Some(next) = records.next() else {
                    exhausted = true;
                    break;
                };
                row_number += 1;
                rows_in_chunk += 1;

                let record = match next {
                    Ok(record) => record,
                    Err(e) => {
                        if let csv::ErrorKind::Io(io) = e.kind() {
                            return Err(unavailable(io.to_string()));
                        }
                        outcome.processed += 1;
                        self.reject(&mut outcome, row_number, None, vec![FieldError::new("row", e.to_string())]);
                        continue;
                    }
                };

                let raw = RawRow::from_pairs(headers.iter().zip(record.iter()));
                if raw.is_blank() {
                    continue;
                }
                outcome.processed += 1;

                self.process_row(&raw, row_number, owner_id, &mut seen, &mut chunk, &mut outcome);
            }

            if rows_in_chunk > 0 {
                outcome.chunks += 1;
                self.flush(&mut chunk, &mut seen, &mut changed, &mut outcome);
                if chunk.failed() {
                    outcome.chunks_failed += 1;
                }

                debug!(
                    parent: &self.span,
                    chunk = outcome.chunks,
                    processed = outcome.processed,
                    created = outcome.created,
                    updated = outcome.updated,
                    failed = outcome.failed,
                    "chunk flushed"
                );
                progress(&outcome);
            }

            // Once the input is exhausted every row is committed: finish normally
            if !exhausted && cancel.is_cancelled() {
                warn!(parent: &self.span, processed = outcome.processed, "import cancelled at chunk boundary");
                self.notify(changed.records(), &mut outcome);
                return Err(PipelineError::Cancelled {
                    processed: outcome.processed,
                });
            }
        }

        if outcome.chunks_failed > 0 && outcome.chunks_failed == outcome.chunks {
            warn!(parent: &self.span, chunks = outcome.chunks, "every chunk failed to persist");
            return Err(PipelineError::AllChunksFailed {
                chunks: outcome.chunks,
            });
        }

        self.notify(changed.records(), &mut outcome);

        info!(
            parent: &self.span,
            processed = outcome.processed,
            created = outcome.created,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            failed = outcome.failed,
            "import finished"
        );

        Ok(outcome)
    }

    // ------------------------------------------------------------------------
    // Per row
    // ------------------------------------------------------------------------

    fn process_row(
        &self,
        raw: &RawRow,
        row: usize,
        owner_id: i64,
        seen: &mut HashMap<String, EmployeeRecord>,
        chunk: &mut Chunk,
        outcome: &mut ImportOutcome,
    ) {
        let document = Some(raw.document_digits()).filter(|d| !d.is_empty());

        let errors = self.validator.validate(raw);
        if !errors.is_empty() {
            self.reject(outcome, row, document, errors);
            return;
        }

        let normalized = match normalize(raw, owner_id) {
            Ok(record) => record,
            Err(e) => {
                self.reject(outcome, row, document, vec![e.to_field_error()]);
                return;
            }
        };

        let key = normalized.natural_key.clone();
        let existing = match seen.get(&key) {
            Some(known) => Some(known.clone()),
            None => match self.repo.find_by_key(&key) {
                Ok(found) => found,
                Err(e) => {
                    warn!(parent: &self.span, row, document = %key, error = %e, "lookup failed");
                    chunk.persistence_failures += 1;
                    self.reject(outcome, row, document, vec![FieldError::new("document", format!("lookup failed: {}", e))]);
                    return;
                }
            },
        };

        match decide(&normalized, existing.as_ref()) {
            ChangeDecision::Create(record) => {
                outcome.created += 1;
                seen.insert(key.clone(), record.clone());
                self.buffer(chunk, row, record, true, Vec::new());
            }
            ChangeDecision::UpdateWithChanges { new, changes, .. } => {
                outcome.updated += 1;
                seen.insert(key.clone(), new.clone());
                // A never-persisted key stays a create when coalesced
                let creates = !new.is_persisted();
                self.buffer(chunk, row, new, creates, changes);
            }
            ChangeDecision::UpdateNoChanges => {
                outcome.unchanged += 1;
            }
            ChangeDecision::Invalid(errors) => {
                self.reject(outcome, row, document, errors);
            }
        }
    }

    fn buffer(&self, chunk: &mut Chunk, row: usize, record: EmployeeRecord, creates: bool, changes: Vec<ChangedField>) {
        match chunk.index.get(&record.natural_key) {
            Some(&i) => {
                let pending = &mut chunk.writes[i];
                pending.row = row;
                pending.record = record;
                pending.changes.extend(changes);
            }
            None => {
                chunk.index.insert(record.natural_key.clone(), chunk.writes.len());
                chunk.writes.push(PendingWrite {
                    row,
                    record,
                    creates,
                    changes,
                });
            }
        }
    }

    fn reject(&self, outcome: &mut ImportOutcome, row: usize, document: Option<String>, errors: Vec<FieldError>) {
        debug!(parent: &self.span, row, errors = errors.len(), "row rejected");
        outcome.failed += 1;
        outcome.errors.push(RowError { row, document, errors });
    }

    // ------------------------------------------------------------------------
    // Chunk flush
    // ------------------------------------------------------------------------

    fn flush(
        &self,
        chunk: &mut Chunk,
        seen: &mut HashMap<String, EmployeeRecord>,
        changed: &mut ChangedRecords,
        outcome: &mut ImportOutcome,
    ) {
        if chunk.writes.is_empty() {
            return;
        }

        let to_write: Vec<EmployeeRecord> = chunk.writes.iter().map(|w| w.record.clone()).collect();

        let (committed, failed) = match self.repo.upsert_batch(&to_write) {
            Ok(committed) => (committed, Vec::new()),
            Err(RepositoryError::Batch { failed, committed }) => (committed, failed),
            Err(e) => {
                let keys: Vec<&str> = to_write.iter().map(|r| r.natural_key.as_str()).collect();
                warn!(parent: &self.span, error = %e, keys = ?keys, "chunk write failed");
                let failed = to_write
                    .iter()
                    .map(|r| crate::error::FailedWrite {
                        natural_key: r.natural_key.clone(),
                        reason: e.to_string(),
                        conflict: false,
                    })
                    .collect();
                (Vec::new(), failed)
            }
        };

        let mut events = Vec::new();
        let mut saved_records = Vec::new();

        for saved in committed {
            if let Some(pending) = chunk.index.get(&saved.natural_key).map(|&i| &chunk.writes[i]) {
                events.push(audit_event(&saved, pending.creates, &pending.changes));
            }
            saved_records.push(saved);
        }

        for failure in failed {
            let Some(pending) = chunk.index.get(&failure.natural_key).map(|&i| chunk.writes[i].clone()) else {
                continue;
            };

            if failure.conflict {
                // Lost the create race to another writer: retry as an update
                match save_record(self.repo.as_ref(), &pending.record) {
                    Ok(result) => {
                        outcome.created = outcome.created.saturating_sub(1);
                        match result.saved {
                            Some(saved) => {
                                outcome.updated += 1;
                                let changes = match &result.decision {
                                    ChangeDecision::UpdateWithChanges { changes, .. } => changes.clone(),
                                    _ => Vec::new(),
                                };
                                events.push(audit_event(&saved, false, &changes));
                                saved_records.push(saved);
                            }
                            None => {
                                outcome.unchanged += 1;
                                chunk.persisted += 1;
                                if let Ok(Some(stored)) = self.repo.find_by_key(&failure.natural_key) {
                                    seen.insert(failure.natural_key.clone(), stored);
                                }
                            }
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(parent: &self.span, document = %failure.natural_key, error = %e, "conflict retry failed");
                    }
                }
            }

            warn!(parent: &self.span, row = pending.row, document = %failure.natural_key, reason = %failure.reason, "row not persisted");
            chunk.persistence_failures += 1;
            self.untally(outcome, &pending);
            seen.remove(&failure.natural_key);
            self.reject(
                outcome,
                pending.row,
                Some(failure.natural_key.clone()),
                vec![FieldError::new("document", format!("could not be saved: {}", failure.reason))],
            );
        }

        chunk.persisted += saved_records.len();

        if let Err(e) = self.repo.record_events(&events) {
            warn!(parent: &self.span, error = %e, "audit events not recorded");
        }

        for saved in saved_records {
            seen.insert(saved.natural_key.clone(), saved.clone());
            changed.insert(saved);
        }
    }

    /// Undo the decision tally of a pending write that never landed
    fn untally(&self, outcome: &mut ImportOutcome, pending: &PendingWrite) {
        if pending.creates {
            outcome.created = outcome.created.saturating_sub(1);
        } else {
            outcome.updated = outcome.updated.saturating_sub(1);
        }
    }

    fn notify(&self, changed: &[EmployeeRecord], outcome: &mut ImportOutcome) {
        if changed.is_empty() {
            return;
        }
        if let Some(dispatcher) = &self.dispatcher {
            outcome.notifications = dispatcher.dispatch(changed);
        }
    }
}

fn audit_event(saved: &EmployeeRecord, created: bool, changes: &[ChangedField]) -> Event {
    let event_type = if created { "employee_created" } else { "employee_updated" };
    let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
    Event::new(
        event_type,
        "employee",
        &saved.natural_key,
        serde_json::json!({
            "owner_id": saved.owner_id,
            "changed_fields": fields,
            "changes": changes,
            "record": saved.summary(),
        }),
        IMPORT_ACTOR,
    )
}
