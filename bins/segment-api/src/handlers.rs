// HTTP route handlers for the segmentation API

use axum::{
    extract::{multipart::Field, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use segment_common::types::{combine_logs, Job, SegmentResponse};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collector;
use crate::engine::EngineError;
use crate::error::PipelineError;
use crate::staging::{StagedJob, StagingError};
use crate::AppState;

/// Multipart field carrying the volume
pub const UPLOAD_FIELD: &str = "file";

/// POST /segment - Run the segmentation worker on one uploaded volume
///
/// Received -> Staged -> Invoked -> Collected -> Responded. Staging is torn
/// down once the response is composed, whichever way the request went.
pub async fn segment(State(state): State<Arc<AppState>>, multipart: Multipart) -> Response {
    let upload = match receive_upload(multipart, &state.uploads_dir).await {
        Ok(Some(upload)) => upload,
        Ok(None) => {
            info!("Rejected request without a file");
            return PipelineError::Validation.into_response();
        }
        Err(e) => return fail(None, e),
    };

    let job = Job::new(state.staging.work_root());
    let job_id = job.id;

    let staged = match state.staging.prepare(job).await {
        Ok(staged) => staged,
        Err(e) => {
            upload.discard().await;
            return fail(Some(job_id), e.into());
        }
    };

    let response = match run_pipeline(&state, &staged, upload.path()).await {
        Ok(body) => {
            info!(
                job_id = %job_id,
                artifacts = body.segments.len(),
                "Segmentation completed"
            );
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => fail(Some(job_id), e),
    };

    upload.discard().await;
    staged.teardown().await;
    response
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn run_pipeline(
    state: &AppState,
    staged: &StagedJob,
    upload: &Path,
) -> Result<SegmentResponse, PipelineError> {
    let job = staged.job();

    staged.place_input(upload).await?;

    let invocation = state.invocation_for(job);
    info!(
        job_id = %job.id,
        backend = %invocation.descriptor.backend,
        image = %invocation.descriptor.image,
        "Invoking worker"
    );

    let start = Instant::now();
    let outcome = match state.engine.run(&invocation).await {
        Ok(outcome) => outcome,
        Err(EngineError::Timeout {
            elapsed_ms,
            stdout,
            stderr,
        }) => {
            return Err(PipelineError::WorkerTimeout {
                elapsed_ms,
                logs: combine_logs(&stdout, &stderr),
            });
        }
        Err(e @ EngineError::Launch(_)) => {
            return Err(PipelineError::Worker {
                reason: e.to_string(),
                logs: String::new(),
            });
        }
    };

    info!(
        job_id = %job.id,
        exit_code = outcome.exit_code,
        duration_ms = start.elapsed().as_millis() as u64,
        "Worker finished"
    );
    debug!(job_id = %job.id, stdout = %outcome.stdout, stderr = %outcome.stderr, "Worker output");

    let logs = outcome.logs();
    if !outcome.success() {
        return Err(PipelineError::Worker {
            reason: format!("worker exited with code {}", outcome.exit_code),
            logs,
        });
    }

    match collector::collect(job).await {
        Ok(segments) => Ok(SegmentResponse { segments, logs }),
        Err(source) => Err(PipelineError::Collect { source, logs }),
    }
}

/// Upload temp file under `uploads/`. Removed by `discard()`, or on drop
/// when the request future is abandoned mid-stream.
struct ReceivedUpload {
    path: PathBuf,
    discarded: bool,
}

impl ReceivedUpload {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            discarded: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file if it is still there (placement normally moved it).
    async fn discard(mut self) {
        self.discarded = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) => log_discard_failure(&self.path, &e),
        }
    }
}

impl Drop for ReceivedUpload {
    fn drop(&mut self) {
        if self.discarded {
            return;
        }
        let path = std::mem::take(&mut self.path);
        let remove = move || {
            if let Err(e) = std::fs::remove_file(&path) {
                log_discard_failure(&path, &e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

fn log_discard_failure(path: &Path, e: &std::io::Error) {
    if e.kind() != std::io::ErrorKind::NotFound {
        warn!(
            error_kind = "cleanup",
            upload = %path.display(),
            error = %e,
            "Failed to remove upload"
        );
    }
}

/// Stream the `file` field to `uploads/<uuid>`. `Ok(None)` when the request
/// carries no such field.
async fn receive_upload(
    mut multipart: Multipart,
    uploads_dir: &Path,
) -> Result<Option<ReceivedUpload>, PipelineError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(PipelineError::from_multipart)?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let original_name = field.file_name().unwrap_or("unnamed").to_string();

        tokio::fs::create_dir_all(uploads_dir)
            .await
            .map_err(StagingError::Receive)?;
        let upload = ReceivedUpload::new(uploads_dir.join(Uuid::new_v4().to_string()));

        return match write_field(&mut field, upload.path()).await {
            Ok(bytes) => {
                info!(file = %original_name, bytes, "File received");
                Ok(Some(upload))
            }
            Err(e) => {
                upload.discard().await;
                Err(e)
            }
        };
    }

    Ok(None)
}

async fn write_field(field: &mut Field<'_>, path: &Path) -> Result<u64, PipelineError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(StagingError::Receive)?;

    let mut written = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(PipelineError::from_multipart)?
    {
        file.write_all(&chunk).await.map_err(StagingError::Receive)?;
        written += chunk.len() as u64;
    }

    file.flush().await.map_err(StagingError::Receive)?;
    Ok(written)
}

fn fail(job_id: Option<Uuid>, e: PipelineError) -> Response {
    match job_id {
        Some(job_id) => error!(job_id = %job_id, error_kind = e.kind(), error = %e, "Segmentation failed"),
        None if e.is_client_error() => warn!(error_kind = e.kind(), error = %e, "Upload rejected"),
        None => error!(error_kind = e.kind(), error = %e, "Upload failed"),
    }
    e.into_response()
}
