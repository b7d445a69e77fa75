// 🔌 Wiring shared by the CLI and the API server

use std::sync::Arc;

use crate::blob::{BlobStore, LocalBlobStore};
use crate::config::PipelineConfig;
use crate::db::{self, Database};
use crate::error::{BlobError, Result};
use crate::importer::ImportOrchestrator;
use crate::jobs::{JobQueue, JobRunner, JobStore, RetryPolicy, Uploads};
use crate::notification::{LogSender, MessageSender, NotificationDispatcher, OutboxSender, SqliteOwnerDirectory};
use crate::repository::SqliteEmployeeRepository;

pub struct Pipeline {
    pub config: PipelineConfig,
    pub db: Database,
    pub repo: Arc<SqliteEmployeeRepository>,
    pub blobs: Arc<LocalBlobStore>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub jobs: Arc<JobStore>,
}

impl Pipeline {
    /// Open the database and storage directory named by `config`
    pub fn open(config: PipelineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.storage_dir).map_err(BlobError::from)?;
        let db = db::open_database(&config.database_path)?;
        Ok(Self::with_database(config, db))
    }

    pub fn with_database(config: PipelineConfig, db: Database) -> Self {
        let repo = Arc::new(SqliteEmployeeRepository::new(db.clone()));
        let blobs = Arc::new(LocalBlobStore::new(config.storage_dir.clone()));

        let dispatcher = NotificationDispatcher::new(
            repo.clone(),
            Arc::new(SqliteOwnerDirectory::new(db.clone())),
            sender_for(&config),
        );

        Pipeline {
            jobs: Arc::new(JobStore::new(db.clone())),
            dispatcher: Arc::new(dispatcher),
            repo,
            blobs,
            db,
            config,
        }
    }

    pub fn orchestrator(&self) -> ImportOrchestrator {
        ImportOrchestrator::new(self.repo.clone(), self.blobs.clone())
            .with_dispatcher(self.dispatcher.clone())
            .with_chunk_size(self.config.import.chunk_size)
    }

    pub fn runner(&self) -> JobRunner {
        let blobs: Arc<dyn BlobStore> = self.blobs.clone();
        JobRunner::new(
            Arc::new(self.orchestrator()),
            blobs,
            self.jobs.clone(),
            RetryPolicy::from_config(&self.config.jobs),
        )
    }

    /// Worker pool sized by `jobs.workers`; needs a tokio runtime
    pub fn queue(&self) -> Result<Arc<JobQueue>> {
        Ok(Arc::new(JobQueue::new(Arc::new(self.runner()), self.config.jobs.workers)?))
    }

    pub fn uploads(&self, queue: Arc<JobQueue>) -> Uploads {
        Uploads::new(self.blobs.clone(), queue)
    }
}

/// Outbox file when configured, structured log otherwise
fn sender_for(config: &PipelineConfig) -> Arc<dyn MessageSender> {
    match &config.notifications.outbox_path {
        Some(path) => Arc::new(OutboxSender::new(path.clone()).with_from(config.notifications.from_address.clone())),
        None => Arc::new(LogSender::new()),
    }
}
