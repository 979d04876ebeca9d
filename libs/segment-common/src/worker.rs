// Worker descriptor - the static, versioned definition of how the
// segmentation worker is launched (image, mounts, entry command).
use crate::layout;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Run inside a container through the Docker daemon
    Docker,
    /// Run the script directly on the host
    Process,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Docker => write!(f, "docker"),
            Backend::Process => write!(f, "process"),
        }
    }
}

/// Where the worker expects its inputs, outputs and task script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mounts {
    #[serde(default = "default_input_mount")]
    pub input_root: String,
    #[serde(default = "default_output_mount")]
    pub output_root: String,
    #[serde(default = "default_script_mount")]
    pub script: String,
}

impl Default for Mounts {
    fn default() -> Self {
        Self {
            input_root: default_input_mount(),
            output_root: default_output_mount(),
            script: default_script_mount(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default = "default_backend")]
    pub backend: Backend,
    pub image: String,
    #[serde(default = "default_platform")]
    pub platform: Option<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub mounts: Mounts,
    #[serde(default = "default_script_path")]
    pub script_path: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
    #[serde(default)]
    pub cpu_limit: Option<f32>,
}

fn default_input_mount() -> String {
    "/workspace/inputs".to_string()
}

fn default_output_mount() -> String {
    "/workspace/outputs".to_string()
}

fn default_script_mount() -> String {
    "/tmp/run_inference.sh".to_string()
}

fn default_backend() -> Backend {
    Backend::Docker
}

fn default_platform() -> Option<String> {
    Some("linux/amd64".to_string())
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_script_path() -> PathBuf {
    PathBuf::from("run_inference.sh")
}

fn default_timeout_secs() -> u64 {
    3600
}

impl WorkerDescriptor {
    /// Load the descriptor from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Worker config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let descriptor: WorkerDescriptor = serde_json::from_str(content)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            bail!("Worker image must not be empty");
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be greater than zero");
        }
        for (label, mount) in [
            ("input_root", &self.mounts.input_root),
            ("output_root", &self.mounts.output_root),
            ("script", &self.mounts.script),
        ] {
            if !mount.starts_with('/') {
                bail!("Mount '{}' must be an absolute path, got '{}'", label, mount);
            }
        }
        if let Some(cpu) = self.cpu_limit {
            if cpu <= 0.0 {
                bail!("cpu_limit must be positive");
            }
        }
        Ok(())
    }

    /// Memory limit in bytes, as Docker expects it
    pub fn memory_limit_bytes(&self) -> Option<i64> {
        self.memory_limit_mb.map(|mb| (mb as i64) * 1024 * 1024)
    }

    /// CPU limit in nano-CPUs, as Docker expects it
    pub fn nano_cpus(&self) -> Option<i64> {
        self.cpu_limit.map(|cpu| (cpu as f64 * 1_000_000_000.0) as i64)
    }
}

/// Launch descriptor for one job: host paths bound onto the worker's layout.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub case_id: String,
    pub host_input_root: PathBuf,
    pub host_output_root: PathBuf,
    pub host_script: PathBuf,
    pub descriptor: WorkerDescriptor,
}

impl WorkerInvocation {
    /// Docker bind specs; the script is mounted read-only.
    pub fn binds(&self) -> Vec<String> {
        let mounts = &self.descriptor.mounts;
        vec![
            format!("{}:{}", self.host_input_root.display(), mounts.input_root),
            format!("{}:{}", self.host_output_root.display(), mounts.output_root),
            format!("{}:{}:ro", self.host_script.display(), mounts.script),
        ]
    }

    /// Environment as seen from inside the container
    pub fn container_env(&self) -> Vec<String> {
        let mounts = &self.descriptor.mounts;
        layout::worker_env(&mounts.input_root, &mounts.output_root, &self.case_id)
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    /// Environment for a worker running directly on the host
    pub fn host_env(&self) -> Vec<(String, String)> {
        layout::worker_env(
            &self.host_input_root.to_string_lossy(),
            &self.host_output_root.to_string_lossy(),
            &self.case_id,
        )
    }

    /// Container entry command
    pub fn container_command(&self) -> Vec<String> {
        vec![
            self.descriptor.shell.clone(),
            "-c".to_string(),
            startup_command(&self.descriptor.mounts.script),
        ]
    }

    /// Host entry command for the process backend
    pub fn host_command(&self) -> Vec<String> {
        vec![
            self.descriptor.shell.clone(),
            "-c".to_string(),
            startup_command(&self.host_script.to_string_lossy()),
        ]
    }

    /// Equivalent `docker run` command line, for operators auditing a launch
    pub fn docker_cli(&self) -> Vec<String> {
        let mut args = vec!["docker".to_string(), "run".to_string()];
        if let Some(platform) = &self.descriptor.platform {
            args.push("--platform".to_string());
            args.push(platform.clone());
        }
        args.push("--rm".to_string());
        for bind in self.binds() {
            args.push("-v".to_string());
            args.push(bind);
        }
        for env in self.container_env() {
            args.push("-e".to_string());
            args.push(env);
        }
        args.push(self.descriptor.image.clone());
        args.extend(self.container_command());
        args
    }
}

/// Startup sequence run by the worker shell:
/// 1. ensure the case directories exist under both mounts
/// 2. relax their permissions (only this case's, other jobs share the roots)
/// 3. make the script executable (skipped when it already is, so a
///    read-only mount of an executable script works)
/// 4. replace the shell with the script, so killing the worker's pid
///    reaches the script itself
///
/// Case specific values travel through the environment, never through
/// this string.
pub fn startup_command(script: &str) -> String {
    let script = shell_quote(script);
    format!(
        "mkdir -p \"${out}/${case}\" \"${inp}/${case}\" && chmod -R 777 \"${out}/${case}\" \"${inp}/${case}\" && (test -x {s} || chmod +x {s}) && exec {s}",
        out = layout::ENV_OUTPUT_ROOT,
        inp = layout::ENV_INPUT_ROOT,
        case = layout::ENV_CASE_ID,
        s = script,
    )
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
