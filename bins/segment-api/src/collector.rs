// Result collection: names of the artifacts a finished worker left behind.
use segment_common::types::{ArtifactSet, Job};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectError {
    /// The worker exited cleanly but never created its artifact directory
    #[error("artifact directory {0} does not exist")]
    Missing(PathBuf),

    #[error("failed to read artifact directory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// List the entries of the job's artifact directory, sorted by name.
///
/// A missing directory is an error rather than an empty set, so a broken
/// worker cannot pass for one that found nothing to segment.
pub async fn collect(job: &Job) -> Result<ArtifactSet, CollectError> {
    let dir = &job.artifact_dir;
    let read_err = |source: io::Error| {
        if source.kind() == io::ErrorKind::NotFound {
            CollectError::Missing(dir.clone())
        } else {
            CollectError::Read {
                path: dir.clone(),
                source,
            }
        }
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_err)?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }

    names.sort();
    Ok(names)
}
