// ⚙️ Pipeline configuration (TOML file + environment overrides)
//
// Resolution order: explicit path → EMPLOYEE_SYNC_CONFIG → built-in defaults.
// EMPLOYEE_SYNC_DATABASE / EMPLOYEE_SYNC_STORAGE override single settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, Result};

pub const CONFIG_ENV: &str = "EMPLOYEE_SYNC_CONFIG";
pub const DATABASE_ENV: &str = "EMPLOYEE_SYNC_DATABASE";
pub const STORAGE_ENV: &str = "EMPLOYEE_SYNC_STORAGE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    /// Root of the blob store (uploads land under `temp/`)
    pub storage_dir: PathBuf,
    pub log_level: String,
    pub import: ImportConfig,
    pub jobs: JobsConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub chunk_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    /// Delay before attempt n+1; the last entry repeats
    pub backoff_secs: Vec<u64>,
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub dirty_window_hours: i64,
    pub from_address: String,
    /// JSON-lines outbox; messages go to the log when unset
    pub outbox_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            database_path: PathBuf::from("employee_sync.db"),
            storage_dir: PathBuf::from("storage"),
            log_level: "info".to_string(),
            import: ImportConfig::default(),
            jobs: JobsConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            chunk_size: crate::importer::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            timeout_secs: 600,
            max_attempts: 3,
            backoff_secs: vec![10, 30, 60],
            workers: 4,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        NotificationConfig {
            dirty_window_hours: crate::repository::DEFAULT_DIRTY_WINDOW_HOURS,
            from_address: "no-reply@employee-sync.local".to_string(),
            outbox_path: None,
        }
    }
}

impl JobsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Vec<Duration> {
        self.backoff_secs.iter().map(|s| Duration::from_secs(*s)).collect()
    }
}

impl NotificationConfig {
    pub fn dirty_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.dirty_window_hours)
    }
}

impl PipelineConfig {
    /// Load from `path`, else `$EMPLOYEE_SYNC_CONFIG`, else defaults; then
    /// apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(file) => Self::from_file(&file)?,
            None => Self::default(),
        };

        if let Some(db) = std::env::var_os(DATABASE_ENV) {
            config.database_path = PathBuf::from(db);
        }
        if let Some(storage) = std::env::var_os(STORAGE_ENV) {
            config.storage_dir = PathBuf::from(storage);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("read {} failed: {}", path.display(), e)))?;
        Self::from_toml(&content)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PipelineError::Config(format!("parse TOML failed: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.import.chunk_size == 0 {
            return Err(PipelineError::Config("import.chunk_size must be at least 1".to_string()));
        }
        if self.jobs.max_attempts == 0 {
            return Err(PipelineError::Config("jobs.max_attempts must be at least 1".to_string()));
        }
        if self.jobs.workers == 0 {
            return Err(PipelineError::Config("jobs.workers must be at least 1".to_string()));
        }
        if self.jobs.timeout_secs == 0 {
            return Err(PipelineError::Config("jobs.timeout_secs must be at least 1".to_string()));
        }
        if self.notifications.dirty_window_hours <= 0 {
            return Err(PipelineError::Config(
                "notifications.dirty_window_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.import.chunk_size, 1000);
        assert_eq!(config.jobs.max_attempts, 3);
        assert_eq!(config.jobs.timeout(), Duration::from_secs(600));
        assert_eq!(
            config.jobs.backoff(),
            vec![Duration::from_secs(10), Duration::from_secs(30), Duration::from_secs(60)]
        );
        assert_eq!(config.notifications.dirty_window(), chrono::Duration::hours(24));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            database_path = "/var/lib/employee-sync/data.db"

            [jobs]
            workers = 8

            [notifications]
            outbox_path = "storage/outbox.jsonl"
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/var/lib/employee-sync/data.db"));
        assert_eq!(config.jobs.workers, 8);
        assert_eq!(config.jobs.max_attempts, 3);
        assert_eq!(config.import.chunk_size, 1000);
        assert_eq!(config.notifications.outbox_path, Some(PathBuf::from("storage/outbox.jsonl")));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = PipelineConfig::default();
        config.import.chunk_size = 0;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        let mut config = PipelineConfig::default();
        config.jobs.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("employee-sync.toml");
        std::fs::write(&path, "[import]\nchunk_size = 250\n").unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.import.chunk_size, 250);

        let missing = PipelineConfig::from_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(PipelineError::Config(_))));
    }
}
