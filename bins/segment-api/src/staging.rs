/// Staging Area Manager
///
/// Owns the on-disk layout of a job: `inputs/<case>/ct.nii.gz` for the
/// uploaded volume and `outputs/<case>/` for whatever the worker writes.
///
/// `prepare` hands back a [`StagedJob`] guard. Its directories are removed
/// by `teardown()`, or by `Drop` when the guard goes away on any other
/// path (early return, panic, cancelled request future).

use segment_common::types::Job;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("failed to create staging directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("uploaded file {0} is missing")]
    MissingUpload(PathBuf),

    #[error("failed to place upload at {path}: {source}")]
    Place {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to receive upload: {0}")]
    Receive(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    work_root: PathBuf,
}

impl StagingArea {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
        }
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    /// Create the job's input directory and the shared output root.
    /// Safe to call when they already exist.
    pub async fn prepare(&self, job: Job) -> Result<StagedJob, StagingError> {
        for dir in [&job.input_dir, &job.output_root] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| StagingError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;
        }

        debug!(job_id = %job.id, input_dir = %job.input_dir.display(), "Staging prepared");

        Ok(StagedJob {
            job,
            released: false,
        })
    }
}

/// A job whose staging directories exist on disk
#[derive(Debug)]
pub struct StagedJob {
    job: Job,
    released: bool,
}

impl StagedJob {
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Move the received upload to the job's canonical input file.
    ///
    /// A plain rename is attempted first. When it fails for any reason other
    /// than a missing source (typically EXDEV when `uploads/` and `inputs/`
    /// live on different filesystems) the file is copied and the source
    /// removed.
    pub async fn place_input(&self, upload: &Path) -> Result<(), StagingError> {
        let target = &self.job.input_file;

        match tokio::fs::rename(upload, target).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StagingError::MissingUpload(upload.to_path_buf()));
            }
            Err(e) => {
                debug!(
                    job_id = %self.job.id,
                    error = %e,
                    "Rename failed, falling back to copy"
                );
                tokio::fs::copy(upload, target)
                    .await
                    .map_err(|source| StagingError::Place {
                        path: target.clone(),
                        source,
                    })?;
                if let Err(e) = tokio::fs::remove_file(upload).await {
                    warn!(upload = %upload.display(), error = %e, "Failed to remove upload after copy");
                }
            }
        }

        debug!(job_id = %self.job.id, path = %target.display(), "Input placed");
        Ok(())
    }

    /// Remove the job's input and output subdirectories. Never fails.
    pub async fn teardown(mut self) {
        self.released = true;
        for dir in [&self.job.input_dir, &self.job.output_dir] {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log_cleanup_failure(&self.job, dir, &e),
            }
        }
        debug!(job_id = %self.job.id, "Staging torn down");
    }
}

impl Drop for StagedJob {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Removal of a large output tree must not stall a runtime worker.
        let job = self.job.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_job_dirs(&job));
            }
            Err(_) => remove_job_dirs(&job),
        }
    }
}

fn remove_job_dirs(job: &Job) {
    for dir in [&job.input_dir, &job.output_dir] {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log_cleanup_failure(job, dir, &e),
        }
    }
    debug!(job_id = %job.id, "Staging released on drop");
}

fn log_cleanup_failure(job: &Job, dir: &Path, error: &io::Error) {
    warn!(
        job_id = %job.id,
        error_kind = "cleanup",
        path = %dir.display(),
        error = %error,
        "Failed to remove staging directory"
    );
}
