// ⏱️ Async Job Wrapper - retries, timeout, cleanup, status registry
//
// Scheduled → Running → Completed
//                     → Retrying → Running ...      (attempt < max_attempts)
//                     → Failed                       (retries exhausted / fatal)
//
// The uploaded temp file is deleted exactly once: after the successful attempt
// or on the attempt that ends the job. Intermediate failures leave it in place
// for the next attempt to re-read.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

use crate::blob::{self, BlobStore};
use crate::config::JobsConfig;
use crate::db::{self, Database, Event};
use crate::error::{PipelineError, RepositoryError, Result, RowError};
use crate::importer::{ImportOrchestrator, ImportOutcome};
use crate::record::format_timestamp;

// ============================================================================
// JOB + STATE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportJob {
    pub job_id: String,
    pub owner_id: i64,
    /// Blob path of the uploaded CSV
    pub source_path: String,
}

impl ImportJob {
    pub fn new(owner_id: i64, source_path: impl Into<String>) -> Self {
        ImportJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            owner_id,
            source_path: source_path.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Running,
    /// Failed an attempt, waiting out the backoff
    Retrying,
    Completed,
    /// Permanently failed; no further attempts
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Retrying => "retrying",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<JobState> {
        match value {
            "scheduled" => Some(JobState::Scheduled),
            "running" => Some(JobState::Running),
            "retrying" => Some(JobState::Retrying),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RETRY POLICY
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after failed attempt n is `backoff[n - 1]`; the last entry repeats
    pub backoff: Vec<Duration>,
    /// Wall-clock budget for one attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_config(&JobsConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &JobsConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
            timeout: config.timeout(),
        }
    }

    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let index = failed_attempt.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

// ============================================================================
// JOB STORE (import_jobs table)
// ============================================================================

/// Answer to the status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStatus {
    pub job_id: String,
    pub owner_id: i64,
    pub status: JobState,
    pub attempts: u32,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub errors: Vec<RowError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_checksum: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        JobStore { db }
    }

    pub fn register(&self, job: &ImportJob) -> std::result::Result<(), RepositoryError> {
        let now = format_timestamp(Utc::now());
        let conn = db::lock(&self.db)?;
        conn.execute(
            "INSERT INTO import_jobs (job_id, owner_id, source_path, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![job.job_id, job.owner_id, job.source_path, JobState::Scheduled.as_str(), now],
        )?;
        Ok(())
    }

    pub fn set_checksum(&self, job_id: &str, checksum: &str) -> std::result::Result<(), RepositoryError> {
        let conn = db::lock(&self.db)?;
        conn.execute(
            "UPDATE import_jobs SET source_checksum = ?2 WHERE job_id = ?1",
            params![job_id, checksum],
        )?;
        Ok(())
    }

    pub fn mark_running(&self, job_id: &str, attempt: u32) -> std::result::Result<(), RepositoryError> {
        let now = format_timestamp(Utc::now());
        let conn = db::lock(&self.db)?;
        conn.execute(
            "UPDATE import_jobs SET status = ?2, attempts = ?3, updated_at = ?4 WHERE job_id = ?1",
            params![job_id, JobState::Running.as_str(), attempt, now],
        )?;
        Ok(())
    }

    /// Running tallies, written after every chunk
    pub fn record_progress(
        &self,
        job_id: &str,
        outcome: &ImportOutcome,
    ) -> std::result::Result<(), RepositoryError> {
        let errors = serde_json::to_string(&outcome.errors)?;
        let now = format_timestamp(Utc::now());
        let conn = db::lock(&self.db)?;
        conn.execute(
            "UPDATE import_jobs
             SET processed = ?2, created = ?3, updated = ?4, unchanged = ?5, failed = ?6,
                 errors = ?7, updated_at = ?8
             WHERE job_id = ?1",
            params![
                job_id,
                outcome.processed as i64,
                outcome.created as i64,
                outcome.updated as i64,
                outcome.unchanged as i64,
                outcome.failed as i64,
                errors,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn mark_retrying(&self, job_id: &str, reason: &str) -> std::result::Result<(), RepositoryError> {
        self.transition(job_id, JobState::Retrying, Some(reason))
    }

    pub fn mark_completed(
        &self,
        job_id: &str,
        outcome: &ImportOutcome,
    ) -> std::result::Result<(), RepositoryError> {
        self.record_progress(job_id, outcome)?;
        self.transition(job_id, JobState::Completed, None)
    }

    /// Terminal failure; also appended to the audit trail
    pub fn mark_failed(&self, job: &ImportJob, reason: &str, attempts: u32) -> std::result::Result<(), RepositoryError> {
        self.transition(&job.job_id, JobState::Failed, Some(reason))?;

        let event = Event::new(
            "import_failed",
            "import_job",
            &job.job_id,
            serde_json::json!({
                "owner_id": job.owner_id,
                "source_path": job.source_path,
                "attempts": attempts,
                "error": reason,
            }),
            "job_runner",
        );
        let conn = db::lock(&self.db)?;
        db::insert_event(&conn, &event)
    }

    pub fn status(&self, job_id: &str) -> std::result::Result<Option<ImportStatus>, RepositoryError> {
        let conn = db::lock(&self.db)?;
        let status = conn
            .query_row(
                "SELECT job_id, owner_id, status, attempts, processed, created, updated, unchanged,
                        failed, errors, last_error, source_checksum, created_at, updated_at
                 FROM import_jobs WHERE job_id = ?1",
                [job_id],
                row_to_status,
            )
            .optional()?;
        Ok(status)
    }

    fn transition(&self, job_id: &str, state: JobState, reason: Option<&str>) -> std::result::Result<(), RepositoryError> {
        let now = format_timestamp(Utc::now());
        let conn = db::lock(&self.db)?;
        conn.execute(
            "UPDATE import_jobs SET status = ?2, last_error = ?3, updated_at = ?4 WHERE job_id = ?1",
            params![job_id, state.as_str(), reason, now],
        )?;
        Ok(())
    }
}

fn row_to_status(row: &Row<'_>) -> rusqlite::Result<ImportStatus> {
    let status: String = row.get(2)?;
    let status = JobState::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown job status {}", status).into(),
        )
    })?;

    let errors: String = row.get(9)?;
    let errors: Vec<RowError> = serde_json::from_str(&errors)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(ImportStatus {
        job_id: row.get(0)?,
        owner_id: row.get(1)?,
        status,
        attempts: row.get(3)?,
        processed: row.get::<_, i64>(4)? as usize,
        created: row.get::<_, i64>(5)? as usize,
        updated: row.get::<_, i64>(6)? as usize,
        unchanged: row.get::<_, i64>(7)? as usize,
        failed: row.get::<_, i64>(8)? as usize,
        errors,
        last_error: row.get(10)?,
        source_checksum: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

// ============================================================================
// JOB RUNNER
// ============================================================================

/// Called once when a job ends in `Failed`
pub type FailureHook = Arc<dyn Fn(&ImportJob, &PipelineError) + Send + Sync>;

pub struct JobRunner {
    orchestrator: Arc<ImportOrchestrator>,
    blobs: Arc<dyn BlobStore>,
    store: Arc<JobStore>,
    policy: RetryPolicy,
    on_failure: Option<FailureHook>,
    span: Span,
}

impl JobRunner {
    pub fn new(
        orchestrator: Arc<ImportOrchestrator>,
        blobs: Arc<dyn BlobStore>,
        store: Arc<JobStore>,
        policy: RetryPolicy,
    ) -> Self {
        JobRunner {
            orchestrator,
            blobs,
            store,
            policy,
            on_failure: None,
            span: tracing::info_span!("job_runner"),
        }
    }

    pub fn with_failure_hook(mut self, hook: FailureHook) -> Self {
        self.on_failure = Some(hook);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `job` to a terminal state
    pub async fn execute(&self, job: &ImportJob) -> Result<ImportOutcome> {
        let span = tracing::info_span!(parent: &self.span, "job", job_id = %job.job_id, owner_id = job.owner_id);
        self.record_checksum(job, &span).await;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if let Err(e) = self.store.mark_running(&job.job_id, attempt) {
                warn!(parent: &span, error = %e, "job status not updated");
            }
            info!(parent: &span, attempt, max_attempts = self.policy.max_attempts, "attempt started");

            match self.attempt(job, &span).await {
                Ok(outcome) => {
                    self.cleanup(job, &span);
                    if let Err(e) = self.store.mark_completed(&job.job_id, &outcome) {
                        warn!(parent: &span, error = %e, "job status not updated");
                    }
                    info!(
                        parent: &span,
                        attempt,
                        created = outcome.created,
                        updated = outcome.updated,
                        failed = outcome.failed,
                        "job completed"
                    );
                    return Ok(outcome);
                }
                Err(e) if !e.is_retryable() || attempt >= self.policy.max_attempts => {
                    error!(parent: &span, attempt, error = %e, "job permanently failed");
                    self.cleanup(job, &span);
                    if let Err(store_err) = self.store.mark_failed(job, &e.to_string(), attempt) {
                        warn!(parent: &span, error = %store_err, "job status not updated");
                    }
                    if let Some(hook) = &self.on_failure {
                        hook(job, &e);
                    }
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.policy.backoff_for(attempt);
                    warn!(parent: &span, attempt, error = %e, delay_ms = delay.as_millis() as u64, "attempt failed, retrying");
                    if let Err(store_err) = self.store.mark_retrying(&job.job_id, &e.to_string()) {
                        warn!(parent: &span, error = %store_err, "job status not updated");
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(&self, job: &ImportJob, span: &Span) -> Result<ImportOutcome> {
        let cancel = CancellationToken::new();

        let orchestrator = Arc::clone(&self.orchestrator);
        let store = Arc::clone(&self.store);
        let token = cancel.clone();
        let job_id = job.job_id.clone();
        let source = job.source_path.clone();
        let owner_id = job.owner_id;
        let worker_span = span.clone();

        let mut handle = tokio::task::spawn_blocking(move || {
            orchestrator.run_observed(&source, owner_id, &token, &|outcome: &ImportOutcome| {
                if let Err(e) = store.record_progress(&job_id, outcome) {
                    warn!(parent: &worker_span, error = %e, "progress not recorded");
                }
            })
        });

        match tokio::time::timeout(self.policy.timeout, &mut handle).await {
            Ok(joined) => joined.map_err(|e| PipelineError::Worker(e.to_string()))?,
            Err(_) => {
                warn!(parent: span, timeout_secs = self.policy.timeout.as_secs(), "attempt timed out, cancelling");
                cancel.cancel();
                // Committed chunks stay; wait for the worker to stop at a chunk boundary
                match handle.await {
                    Ok(Ok(outcome)) => {
                        // Reached the end of the file before it saw the cancel
                        info!(parent: span, processed = outcome.processed, "attempt finished past its deadline, keeping the outcome");
                        Ok(outcome)
                    }
                    Ok(Err(PipelineError::Cancelled { .. })) => Err(PipelineError::TimedOut(self.policy.timeout)),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(PipelineError::Worker(e.to_string())),
                }
            }
        }
    }

    async fn record_checksum(&self, job: &ImportJob, span: &Span) {
        let blobs = Arc::clone(&self.blobs);
        let path = job.source_path.clone();
        let computed = tokio::task::spawn_blocking(move || blob::checksum(blobs.as_ref(), &path)).await;

        match computed {
            Ok(Ok(checksum)) => {
                debug!(parent: span, checksum = %checksum, "source checksum");
                if let Err(e) = self.store.set_checksum(&job.job_id, &checksum) {
                    warn!(parent: span, error = %e, "checksum not recorded");
                }
            }
            Ok(Err(e)) => warn!(parent: span, error = %e, "source checksum unavailable"),
            Err(e) => warn!(parent: span, error = %e, "checksum worker failed"),
        }
    }

    fn cleanup(&self, job: &ImportJob, span: &Span) {
        match self.blobs.delete(&job.source_path) {
            Ok(()) => debug!(parent: span, path = %job.source_path, "temp file deleted"),
            Err(e) => warn!(parent: span, path = %job.source_path, error = %e, "temp file not deleted"),
        }
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Hands a job to a worker and returns its id immediately
pub trait JobScheduler: Send + Sync {
    fn enqueue(&self, job: ImportJob) -> Result<String>;
}

/// In-process worker pool: one tokio task per job, at most `workers` running
pub struct JobQueue {
    runner: Arc<JobRunner>,
    permits: Arc<Semaphore>,
    runtime: tokio::runtime::Handle,
    tasks: Mutex<HashMap<String, JoinHandle<Result<ImportOutcome>>>>,
}

impl JobQueue {
    /// Must be called from within a tokio runtime
    pub fn new(runner: Arc<JobRunner>, workers: usize) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PipelineError::Worker(format!("job queue needs a tokio runtime: {}", e)))?;
        Ok(JobQueue {
            runner,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            runtime,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<JobStore> {
        self.runner.store()
    }

    /// Wait for a job enqueued by this queue to reach a terminal state
    pub async fn wait(&self, job_id: &str) -> Result<ImportOutcome> {
        let handle = {
            let mut tasks = self
                .tasks
                .lock()
                .map_err(|_| PipelineError::Worker("job table lock poisoned".to_string()))?;
            tasks.remove(job_id)
        };

        match handle {
            Some(handle) => handle.await.map_err(|e| PipelineError::Worker(e.to_string()))?,
            None => Err(PipelineError::Worker(format!("job {} is not tracked by this queue", job_id))),
        }
    }
}

impl JobScheduler for JobQueue {
    fn enqueue(&self, job: ImportJob) -> Result<String> {
        self.runner.store().register(&job)?;

        let job_id = job.job_id.clone();
        let runner = Arc::clone(&self.runner);
        let permits = Arc::clone(&self.permits);

        let handle = self.runtime.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Worker(e.to_string()))?;
            runner.execute(&job).await
        });

        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| PipelineError::Worker("job table lock poisoned".to_string()))?;
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(job_id.clone(), handle);

        Ok(job_id)
    }
}

// ============================================================================
// UPLOAD ENTRYPOINT
// ============================================================================

pub struct Uploads {
    blobs: Arc<dyn BlobStore>,
    scheduler: Arc<dyn JobScheduler>,
}

impl Uploads {
    pub fn new(blobs: Arc<dyn BlobStore>, scheduler: Arc<dyn JobScheduler>) -> Self {
        Uploads { blobs, scheduler }
    }

    /// Store the CSV under a fresh temp path and enqueue its import
    pub fn accept<R: Read>(&self, mut source: R, owner_id: i64) -> Result<String> {
        let path = self.blobs.store(&mut source, &blob::temp_upload_path())?;

        match self.scheduler.enqueue(ImportJob::new(owner_id, path.clone())) {
            Ok(job_id) => Ok(job_id),
            Err(e) => {
                let _ = self.blobs.delete(&path);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;
    use crate::error::BlobError;
    use crate::record::EmployeeRecord;
    use crate::repository::{EmployeeRepository, SqliteEmployeeRepository};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CSV: &str = "name,email,document,city,state,start_date\n\
                       John Doe,john@x.com,111.444.777-35,São Paulo,SP,2024-01-15\n\
                       Maria Silva,maria@x.com,123.456.789-09,Rio de Janeiro,RJ,2024-02-01\n";

    /// Local store that counts deletions
    struct CountingBlobStore {
        inner: LocalBlobStore,
        deletes: AtomicUsize,
    }

    impl BlobStore for CountingBlobStore {
        fn store(&self, reader: &mut dyn Read, path: &str) -> std::result::Result<String, BlobError> {
            self.inner.store(reader, path)
        }
        fn exists(&self, path: &str) -> bool {
            self.inner.exists(path)
        }
        fn read(&self, path: &str) -> std::result::Result<Box<dyn Read + Send>, BlobError> {
            self.inner.read(path)
        }
        fn delete(&self, path: &str) -> std::result::Result<(), BlobError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(path)
        }
    }

    /// Repository whose first `failures` batch writes fail as a busy database;
    /// every batch write takes at least `delay`
    struct FlakyRepository {
        inner: SqliteEmployeeRepository,
        failures: AtomicUsize,
        delay: Duration,
    }

    impl EmployeeRepository for FlakyRepository {
        fn find_by_key(&self, key: &str) -> std::result::Result<Option<EmployeeRecord>, RepositoryError> {
            self.inner.find_by_key(key)
        }
        fn create(&self, record: &EmployeeRecord) -> std::result::Result<EmployeeRecord, RepositoryError> {
            self.inner.create(record)
        }
        fn upsert_batch(&self, records: &[EmployeeRecord]) -> std::result::Result<Vec<EmployeeRecord>, RepositoryError> {
            std::thread::sleep(self.delay);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RepositoryError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                    Some("database is locked".to_string()),
                )));
            }
            self.inner.upsert_batch(records)
        }
        fn find_dirty(
            &self,
            owner_id: Option<i64>,
            window: chrono::Duration,
        ) -> std::result::Result<Vec<EmployeeRecord>, RepositoryError> {
            self.inner.find_dirty(owner_id, window)
        }
        fn clear_notification_flag(&self, ids: &[i64]) -> std::result::Result<(), RepositoryError> {
            self.inner.clear_notification_flag(ids)
        }
        fn clear_delivered(&self, delivered: &[&EmployeeRecord]) -> std::result::Result<usize, RepositoryError> {
            self.inner.clear_delivered(delivered)
        }
        fn record_events(&self, events: &[Event]) -> std::result::Result<(), RepositoryError> {
            self.inner.record_events(events)
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        db: Database,
        blobs: Arc<CountingBlobStore>,
        store: Arc<JobStore>,
        failures_seen: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(CountingBlobStore {
            inner: LocalBlobStore::new(dir.path()),
            deletes: AtomicUsize::new(0),
        });
        let db = db::open_in_memory().unwrap();
        Harness {
            _dir: dir,
            store: Arc::new(JobStore::new(db.clone())),
            db,
            blobs,
            failures_seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: vec![Duration::from_millis(5), Duration::from_millis(10)],
            timeout: Duration::from_secs(10),
        }
    }

    fn runner(h: &Harness, batch_failures: usize, policy: RetryPolicy) -> JobRunner {
        let repo = Arc::new(FlakyRepository {
            inner: SqliteEmployeeRepository::new(h.db.clone()),
            failures: AtomicUsize::new(batch_failures),
            delay: Duration::ZERO,
        });
        runner_for(h, ImportOrchestrator::new(repo, h.blobs.clone()), policy)
    }

    /// Every chunk write takes `delay`
    fn slow_runner(h: &Harness, delay: Duration, chunk_size: usize, policy: RetryPolicy) -> JobRunner {
        let repo = Arc::new(FlakyRepository {
            inner: SqliteEmployeeRepository::new(h.db.clone()),
            failures: AtomicUsize::new(0),
            delay,
        });
        runner_for(h, ImportOrchestrator::new(repo, h.blobs.clone()).with_chunk_size(chunk_size), policy)
    }

    fn runner_for(h: &Harness, orchestrator: ImportOrchestrator, policy: RetryPolicy) -> JobRunner {
        let orchestrator = Arc::new(orchestrator);
        let seen = h.failures_seen.clone();
        JobRunner::new(orchestrator, h.blobs.clone(), h.store.clone(), policy).with_failure_hook(Arc::new(
            move |_job: &ImportJob, _err: &PipelineError| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ))
    }

    fn upload(h: &Harness) -> ImportJob {
        let path = h.blobs.store(&mut CSV.as_bytes(), &blob::temp_upload_path()).unwrap();
        let job = ImportJob::new(1, path);
        h.store.register(&job).unwrap();
        job
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_for(1), Duration::from_secs(10));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(30));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(60));
        assert_eq!(policy.backoff_for(7), Duration::from_secs(60));
    }

    #[test]
    fn test_job_state_round_trip() {
        for state in [
            JobState::Scheduled,
            JobState::Running,
            JobState::Retrying,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert!(JobState::Completed.is_terminal());
        assert!(!JobState::Retrying.is_terminal());
    }

    #[tokio::test]
    async fn test_transient_failure_then_success_deletes_once() {
        let h = harness();
        let job = upload(&h);

        let outcome = runner(&h, 1, policy(3)).execute(&job).await.unwrap();

        assert_eq!(outcome.created, 2);
        assert_eq!(h.blobs.deletes.load(Ordering::SeqCst), 1);
        assert!(!h.blobs.exists(&job.source_path));

        let status = h.store.status(&job.job_id).unwrap().unwrap();
        assert_eq!(status.status, JobState::Completed);
        assert_eq!(status.attempts, 2);
        assert_eq!(status.created, 2);
        assert!(status.last_error.is_none());
        assert_eq!(status.source_checksum.map(|c| c.len()), Some(64));
        assert_eq!(h.failures_seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_permanently() {
        let h = harness();
        let job = upload(&h);

        let err = runner(&h, usize::MAX, policy(3)).execute(&job).await.unwrap_err();

        assert!(matches!(err, PipelineError::AllChunksFailed { chunks: 1 }));
        assert_eq!(h.blobs.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(h.failures_seen.load(Ordering::SeqCst), 1);

        let status = h.store.status(&job.job_id).unwrap().unwrap();
        assert_eq!(status.status, JobState::Failed);
        assert_eq!(status.attempts, 3);
        assert!(status.last_error.is_some());

        let conn = db::lock(&h.db).unwrap();
        let events = db::get_events_for_entity(&conn, "import_job", &job.job_id).unwrap();
        assert_eq!(events[0].event_type, "import_failed");
    }

    #[tokio::test]
    async fn test_attempt_finishing_past_deadline_completes() {
        let h = harness();
        let job = upload(&h);
        let policy = RetryPolicy {
            timeout: Duration::from_millis(50),
            ..policy(1)
        };

        // Single chunk: the write outlasts the deadline but the file is done
        let outcome = slow_runner(&h, Duration::from_millis(300), 1000, policy)
            .execute(&job)
            .await
            .unwrap();

        assert_eq!(outcome.created, 2);
        let status = h.store.status(&job.job_id).unwrap().unwrap();
        assert_eq!(status.status, JobState::Completed);
        assert_eq!(status.created, 2);
        assert_eq!(h.blobs.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(h.failures_seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_stops_at_next_chunk_boundary() {
        let h = harness();
        let job = upload(&h);
        let policy = RetryPolicy {
            timeout: Duration::from_millis(50),
            ..policy(1)
        };

        let err = slow_runner(&h, Duration::from_millis(300), 1, policy)
            .execute(&job)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::TimedOut(_)));
        assert!(err.is_retryable());

        // The chunk in flight committed; the second was never written
        let repo = SqliteEmployeeRepository::new(h.db.clone());
        assert_eq!(repo.count().unwrap(), 1);

        let status = h.store.status(&job.job_id).unwrap().unwrap();
        assert_eq!(status.status, JobState::Failed);
        assert_eq!(h.blobs.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(h.failures_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_source_is_not_retried() {
        let h = harness();
        let job = ImportJob::new(1, "temp/temp_csv_employee_missing.csv");
        h.store.register(&job).unwrap();

        let err = runner(&h, 0, policy(3)).execute(&job).await.unwrap_err();

        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
        let status = h.store.status(&job.job_id).unwrap().unwrap();
        assert_eq!(status.attempts, 1);
        assert_eq!(status.status, JobState::Failed);
        assert_eq!(h.failures_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_runs_uploaded_file() {
        let h = harness();
        let runner = Arc::new(runner(&h, 0, policy(1)));
        let queue = Arc::new(JobQueue::new(runner, 2).unwrap());
        let uploads = Uploads::new(h.blobs.clone(), queue.clone());

        let job_id = uploads.accept(CSV.as_bytes(), 7).unwrap();
        let outcome = queue.wait(&job_id).await.unwrap();

        assert_eq!(outcome.created, 2);
        let status = queue.store().status(&job_id).unwrap().unwrap();
        assert_eq!(status.status, JobState::Completed);
        assert_eq!(status.owner_id, 7);
        assert_eq!(h.blobs.deletes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_unknown_job_is_none() {
        let h = harness();
        assert!(h.store.status("nope").unwrap().is_none());
    }
}
