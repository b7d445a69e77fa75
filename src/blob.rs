// 📦 Blob storage for uploaded files (local directory implementation)

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use crate::error::BlobError;

/// Directory (relative to the storage root) holding uploads awaiting import
pub const TEMP_DIR: &str = "temp";
pub const TEMP_PREFIX: &str = "temp_csv_employee_";

pub trait BlobStore: Send + Sync {
    /// Persist `reader` under `path`, returning the stored path
    fn store(&self, reader: &mut dyn Read, path: &str) -> Result<String, BlobError>;

    fn exists(&self, path: &str) -> bool;

    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>, BlobError>;

    fn delete(&self, path: &str) -> Result<(), BlobError>;
}

/// Fresh temporary path for an uploaded CSV
pub fn temp_upload_path() -> String {
    format!("{}/{}{}.csv", TEMP_DIR, TEMP_PREFIX, uuid::Uuid::new_v4())
}

/// SHA-256 of a stored blob (hex)
pub fn checksum(store: &dyn BlobStore, path: &str) -> Result<String, BlobError> {
    let mut reader = store.read(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// LOCAL FILESYSTEM STORE
// ============================================================================

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBlobStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a blob; rejects paths escaping the root
    pub fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(BlobError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStore for LocalBlobStore {
    fn store(&self, reader: &mut dyn Read, path: &str) -> Result<String, BlobError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&target)?;
        io::copy(reader, &mut file)?;
        Ok(path.to_string())
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>, BlobError> {
        let target = self.resolve(path)?;
        match File::open(&target) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, path: &str) -> Result<(), BlobError> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
