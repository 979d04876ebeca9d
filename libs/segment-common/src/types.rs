use crate::layout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One upload being processed. The id doubles as the case id, so every
/// job gets its own staging subdirectories.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub input_dir: PathBuf,
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    pub artifact_dir: PathBuf,
}

impl Job {
    pub fn new(work_root: &Path) -> Self {
        Self::with_id(work_root, Uuid::new_v4())
    }

    pub fn with_id(work_root: &Path, id: Uuid) -> Self {
        let case_id = id.to_string();
        let input_root = layout::input_root(work_root);
        let output_root = layout::output_root(work_root);

        Self {
            id,
            input_dir: layout::case_input_dir(&input_root, &case_id),
            input_file: layout::case_input_file(&input_root, &case_id),
            output_dir: layout::case_output_dir(&output_root, &case_id),
            artifact_dir: layout::case_artifact_dir(&output_root, &case_id),
            input_root,
            output_root,
        }
    }

    pub fn case_id(&self) -> String {
        self.id.to_string()
    }
}

/// Exit status and captured streams of one worker run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl WorkerOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Diagnostic log returned to the caller: stdout followed by stderr.
    pub fn logs(&self) -> String {
        combine_logs(&self.stdout, &self.stderr)
    }
}

pub fn combine_logs(stdout: &str, stderr: &str) -> String {
    let mut logs = String::with_capacity(stdout.len() + stderr.len());
    logs.push_str(stdout);
    logs.push_str(stderr);
    logs
}

/// Artifact file names found in a job's output directory.
pub type ArtifactSet = Vec<String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentResponse {
    pub segments: ArtifactSet,
    pub logs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    pub logs: String,
}
