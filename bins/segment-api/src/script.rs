// Task script materialization. The script is packaged with the binary and
// written once at startup; requests never re-render it.
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const TASK_SCRIPT: &str = include_str!("../../../scripts/run_inference.sh");

/// Write `body` to `path` with mode 0755 and return the absolute path.
pub fn materialize(path: &Path, body: &str) -> Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    fs::write(path, body)
        .with_context(|| format!("Failed to write task script to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to make {} executable", path.display()))?;
    }

    let path = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))?;

    info!(path = %path.display(), bytes = body.len(), "Task script materialized");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_materialize_writes_executable_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_inference.sh");

        let written = materialize(&path, TASK_SCRIPT).unwrap();

        assert!(written.is_absolute());
        assert_eq!(fs::read_to_string(&written).unwrap(), TASK_SCRIPT);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&written).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_materialize_overwrites_previous_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_inference.sh");
        fs::write(&path, "stale").unwrap();

        materialize(&path, "#!/bin/sh\necho fresh\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "#!/bin/sh\necho fresh\n");
    }

    #[test]
    fn test_materialize_fails_on_unwritable_target() {
        let dir = tempfile::tempdir().unwrap();
        // The target is an existing directory, so the write cannot succeed.
        let result = materialize(dir.path(), TASK_SCRIPT);
        assert!(result.is_err());
    }

    #[test]
    fn test_packaged_script_reads_paths_from_env() {
        assert!(TASK_SCRIPT.starts_with("#!/bin/bash"));
        assert!(TASK_SCRIPT.contains("SEGMENT_INPUT_FILE"));
        assert!(TASK_SCRIPT.contains("SEGMENT_OUTPUT_DIR"));
    }
}
