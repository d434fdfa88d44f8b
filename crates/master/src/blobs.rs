//! Opaque job-blob storage for the upload/download/cleanup side
//! channel. The master never inspects or extracts the bundle it's
//! handed — that's the slave's job — so this stores and serves raw
//! bytes keyed by job id, with no zip-awareness at all.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("no blob stored for job {0}")]
    NotFound(String),
    #[error("invalid job id {0}")]
    InvalidId(String),
    #[error("blob i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backed by a temp directory that is removed when the store is
/// dropped.
pub struct BlobStore {
    dir: tempfile::TempDir,
}

/// Job ids are always this crate's own short hex ids, but the HTTP path
/// segment is client-controlled — reject anything that isn't plain
/// alphanumerics/`-`/`_` before it ever reaches a filesystem path, so a
/// `job_id` like `../../etc/passwd` can't escape the blob directory.
fn is_safe_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl BlobStore {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    fn path_for(&self, job_id: &str) -> Result<PathBuf, BlobError> {
        if !is_safe_job_id(job_id) {
            return Err(BlobError::InvalidId(job_id.to_string()));
        }
        Ok(self.dir.path().join(format!("{job_id}.bin")))
    }

    pub fn store(&self, job_id: &str, bytes: &[u8]) -> Result<(), BlobError> {
        std::fs::write(self.path_for(job_id)?, bytes)?;
        Ok(())
    }

    pub fn load(&self, job_id: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(job_id)?;
        if !path.exists() {
            return Err(BlobError::NotFound(job_id.to_string()));
        }
        Ok(std::fs::read(path)?)
    }

    pub fn remove(&self, job_id: &str) -> Result<(), BlobError> {
        let path = self.path_for(job_id)?;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}
