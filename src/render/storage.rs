use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::StorageError;

/// Filesystem store holding one `<job_id>.mp4` per finished job.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the storage root if needed.
    pub async fn init(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::Io {
                path: self.root.clone(),
                source,
            })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, job_id: &str) -> Result<PathBuf, StorageError> {
        if job_id.is_empty() || job_id.contains(['/', '\\']) || job_id.contains("..") {
            return Err(StorageError::InvalidJobId(job_id.to_string()));
        }
        Ok(self.root.join(format!("{job_id}.mp4")))
    }

    /// Take ownership of a rendered video. The source file is removed once
    /// the copy is in place.
    pub async fn put(&self, job_id: &str, source: &Path) -> Result<PathBuf, StorageError> {
        let target = self.path_for(job_id)?;
        self.init().await?;
        tokio::fs::copy(source, &target)
            .await
            .map_err(|e| StorageError::Io {
                path: target.clone(),
                source: e,
            })?;
        if let Err(e) = tokio::fs::remove_file(source).await {
            warn!(source = %source.display(), error = %e, "failed to remove spooled artifact");
        }
        debug!(job_id, path = %target.display(), "stored artifact");
        Ok(target)
    }

    /// Copy another job's video. `None` when the source job has no artifact.
    pub async fn clone_artifact(&self, source_job_id: &str, target_job_id: &str) -> Result<Option<PathBuf>, StorageError> {
        let Some(source) = self.get(source_job_id).await? else {
            return Ok(None);
        };
        let target = self.path_for(target_job_id)?;
        tokio::fs::copy(&source, &target)
            .await
            .map_err(|e| StorageError::Io {
                path: target.clone(),
                source: e,
            })?;
        Ok(Some(target))
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<PathBuf>, StorageError> {
        let path = self.path_for(job_id)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(path)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io { path, source: e }),
        }
    }

    /// Remove a job's video. Missing files are not an error.
    pub async fn delete(&self, job_id: &str) -> Result<(), StorageError> {
        let path = self.path_for(job_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io { path, source: e }),
        }
    }
}
