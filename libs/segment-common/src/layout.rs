use std::path::{Path, PathBuf};

// Staging layout semantics - naming rules only, no filesystem access.
// Keeps the API, the CLI and the worker script agreeing on where a case
// lives on disk and which variables carry it into the worker.

pub const INPUTS_DIR: &str = "inputs";
pub const OUTPUTS_DIR: &str = "outputs";
pub const UPLOADS_DIR: &str = "uploads";
pub const INPUT_FILE_NAME: &str = "ct.nii.gz";
pub const ARTIFACT_DIR_NAME: &str = "segmentations";

pub const ENV_CASE_ID: &str = "SEGMENT_CASE_ID";
pub const ENV_INPUT_ROOT: &str = "SEGMENT_INPUT_ROOT";
pub const ENV_OUTPUT_ROOT: &str = "SEGMENT_OUTPUT_ROOT";
pub const ENV_INPUT_FILE: &str = "SEGMENT_INPUT_FILE";
pub const ENV_OUTPUT_DIR: &str = "SEGMENT_OUTPUT_DIR";

/// `<root>/inputs`
pub fn input_root(work_root: &Path) -> PathBuf {
    work_root.join(INPUTS_DIR)
}

/// `<root>/outputs`
pub fn output_root(work_root: &Path) -> PathBuf {
    work_root.join(OUTPUTS_DIR)
}

/// `<root>/uploads`
pub fn uploads_dir(work_root: &Path) -> PathBuf {
    work_root.join(UPLOADS_DIR)
}

/// `<input_root>/<case>`
pub fn case_input_dir(input_root: &Path, case_id: &str) -> PathBuf {
    input_root.join(case_id)
}

/// `<input_root>/<case>/ct.nii.gz`
pub fn case_input_file(input_root: &Path, case_id: &str) -> PathBuf {
    case_input_dir(input_root, case_id).join(INPUT_FILE_NAME)
}

/// `<output_root>/<case>`
pub fn case_output_dir(output_root: &Path, case_id: &str) -> PathBuf {
    output_root.join(case_id)
}

/// `<output_root>/<case>/segmentations`
pub fn case_artifact_dir(output_root: &Path, case_id: &str) -> PathBuf {
    case_output_dir(output_root, case_id).join(ARTIFACT_DIR_NAME)
}

/// Environment handed to the worker, expressed in whatever path space the
/// worker sees (container mounts or host paths).
pub fn worker_env(input_root: &str, output_root: &str, case_id: &str) -> Vec<(String, String)> {
    let input_file = format!("{}/{}/{}", input_root, case_id, INPUT_FILE_NAME);
    let output_dir = format!("{}/{}/{}", output_root, case_id, ARTIFACT_DIR_NAME);

    vec![
        (ENV_CASE_ID.to_string(), case_id.to_string()),
        (ENV_INPUT_ROOT.to_string(), input_root.to_string()),
        (ENV_OUTPUT_ROOT.to_string(), output_root.to_string()),
        (ENV_INPUT_FILE.to_string(), input_file),
        (ENV_OUTPUT_DIR.to_string(), output_dir),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_paths() {
        let root = Path::new("/srv/segment");
        let inputs = input_root(root);
        let outputs = output_root(root);

        assert_eq!(
            case_input_file(&inputs, "abc"),
            PathBuf::from("/srv/segment/inputs/abc/ct.nii.gz")
        );
        assert_eq!(
            case_artifact_dir(&outputs, "abc"),
            PathBuf::from("/srv/segment/outputs/abc/segmentations")
        );
    }

    #[test]
    fn test_worker_env_uses_given_path_space() {
        let env = worker_env("/workspace/inputs", "/workspace/outputs", "case-1");

        assert!(env.contains(&(ENV_CASE_ID.to_string(), "case-1".to_string())));
        assert!(env.contains(&(
            ENV_INPUT_FILE.to_string(),
            "/workspace/inputs/case-1/ct.nii.gz".to_string()
        )));
        assert!(env.contains(&(
            ENV_OUTPUT_DIR.to_string(),
            "/workspace/outputs/case-1/segmentations".to_string()
        )));
    }
}
