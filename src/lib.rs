// Employee Sync - Core Library
// CSV bulk reconciliation of employee records + owner notifications.
// Shared by the CLI, the API server and the integration tests.

pub mod error;
pub mod config;
pub mod logging;
pub mod states;           // Federative units (UF registry)
pub mod record;           // RawRow / EmployeeRecord
pub mod validation;       // Field Validator
pub mod normalizer;       // Record Normalizer
pub mod change_detection; // create / update / unchanged
pub mod db;               // SQLite schema, owners, audit events
pub mod repository;       // Reconciliation Repository
pub mod blob;             // Upload storage
pub mod notification;     // Notification Dispatcher + transports
pub mod importer;         // Batch Import Orchestrator
pub mod jobs;             // Async job wrapper, status, queue, uploads
pub mod app;              // Wiring for the binaries

// Re-export commonly used types
pub use error::{
    BlobError, FailedWrite, FieldError, NormalizationError, PipelineError,
    RepositoryError, RowError, SendError,
};
pub use config::PipelineConfig;
pub use app::Pipeline;
pub use states::BrazilianState;
pub use record::{EmployeeRecord, RawRow};
pub use validation::{is_valid_cpf, is_valid_email, FieldValidator};
pub use normalizer::normalize;
pub use change_detection::{decide, decide_in, diff, ChangeDecision, ChangedField};
pub use db::{
    open_database, open_in_memory, setup_database,
    get_owner, upsert_owner, insert_event, get_events_for_entity,
    Database, Event, Owner,
};
pub use repository::{
    save_record, EmployeeRepository, SaveOutcome, SqliteEmployeeRepository,
    DEFAULT_DIRTY_WINDOW_HOURS,
};
pub use blob::{BlobStore, LocalBlobStore};
pub use notification::{
    DispatchReport, LogSender, MessageSender, Notification, NotificationDispatcher,
    OutboxSender, OwnerDirectory, SqliteOwnerDirectory,
};
pub use importer::{ImportOrchestrator, ImportOutcome, DEFAULT_CHUNK_SIZE};
pub use jobs::{
    ImportJob, ImportStatus, JobQueue, JobRunner, JobScheduler, JobState, JobStore,
    RetryPolicy, Uploads,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
