/// Job Executor - Worker Invocation Backends
///
/// **Core Responsibility:**
/// Launch the segmentation worker for one job, wait for it, and capture its
/// exit status together with stdout/stderr.
///
/// **Boundary:**
/// - The engine knows HOW the worker runs (Docker container or host process)
/// - It does NOT look at the artifacts the worker produced
/// - A non-zero exit is an outcome, not an error; only launch failures and
///   timeouts come back as `EngineError`
///
/// Both backends enforce the descriptor's timeout and kill the worker when it
/// expires. Nothing is retried.

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use segment_common::types::WorkerOutcome;
use segment_common::worker::{Backend, WorkerInvocation};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maximum stdout or stderr size captured per stream (10 MiB)
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Grace period for draining pipes once the worker has exited or been killed
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error("worker timed out after {elapsed_ms}ms")]
    Timeout {
        elapsed_ms: u64,
        stdout: String,
        stderr: String,
    },
}

/// Selected worker backend
pub enum WorkerEngine {
    Docker(DockerEngine),
    Process(ProcessEngine),
}

impl WorkerEngine {
    pub fn for_backend(backend: Backend) -> Result<Self, EngineError> {
        match backend {
            Backend::Docker => Ok(WorkerEngine::Docker(DockerEngine::connect()?)),
            Backend::Process => Ok(WorkerEngine::Process(ProcessEngine)),
        }
    }

    pub async fn run(&self, invocation: &WorkerInvocation) -> Result<WorkerOutcome, EngineError> {
        match self {
            WorkerEngine::Docker(engine) => engine.run(invocation).await,
            WorkerEngine::Process(engine) => engine.run(invocation).await,
        }
    }
}

/// Container cleanup guard - guarantees container removal on drop
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self { docker, container_id }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Drop cannot await; hand removal to the runtime.
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove worker container");
            }
        });
    }
}

/// Docker-based worker backend
///
/// 1. Pulls the worker image if it is not present
/// 2. Creates the container with the three bind mounts, platform and
///    optional CPU/memory limits
/// 3. Streams stdout/stderr until the container stops
/// 4. Reads the exit code
/// 5. Force-removes the container (the equivalent of `docker run --rm`)
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Launch(format!("failed to connect to Docker daemon: {}", e)))?;
        Ok(Self { docker })
    }

    /// Ensure the worker image is available locally, pulling it on a miss
    async fn ensure_image(&self, image: &str, platform: Option<&str>) -> Result<(), EngineError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            platform: platform.unwrap_or_default(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| EngineError::Launch(format!("failed to pull image '{}': {}", image, e)))?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    pub async fn run(&self, invocation: &WorkerInvocation) -> Result<WorkerOutcome, EngineError> {
        let descriptor = &invocation.descriptor;
        let image = descriptor.image.clone();
        let container_name = format!("segment-{}", invocation.case_id);

        self.ensure_image(&image, descriptor.platform.as_deref()).await?;

        let config = Config {
            image: Some(image.clone()),
            cmd: Some(invocation.container_command()),
            env: Some(invocation.container_env()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(invocation.binds()),
                memory: descriptor.memory_limit_bytes(),
                nano_cpus: descriptor.nano_cpus(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: descriptor.platform.clone(),
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| EngineError::Launch(format!("failed to create container: {}", e)))?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EngineError::Launch(format!("failed to start container: {}", e)))?;

        info!(
            case_id = %invocation.case_id,
            container = %container_name,
            image = %image,
            "Worker container started"
        );

        let timeout = Duration::from_secs(descriptor.timeout_secs);
        let mut stdout = String::new();
        let mut stderr = String::new();

        // Buffers live outside the future so partial output survives a timeout.
        let execution = async {
            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });

            let mut logs_stream = self.docker.logs(&container_id, logs_options);
            while let Some(output) = logs_stream.next().await {
                match output {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(case_id = %invocation.case_id, error = %e, "Error reading container logs");
                        break;
                    }
                }
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };

            let mut wait_stream = self.docker.wait_container(&container_id, Some(wait_options));
            match wait_stream.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                // bollard reports a non-zero exit as an error carrying the code
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(EngineError::Launch(format!(
                    "failed to read container exit code: {}",
                    e
                ))),
                None => Err(EngineError::Launch(
                    "no wait response from container".to_string(),
                )),
            }
        };

        let result = tokio::time::timeout(timeout, execution).await;
        let duration_ms = start_time.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(exit_code)) => {
                debug!(case_id = %invocation.case_id, exit_code, "Container exited");
                Ok(WorkerOutcome {
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    case_id = %invocation.case_id,
                    timeout_secs = descriptor.timeout_secs,
                    "Worker timed out, killing container"
                );
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(case_id = %invocation.case_id, error = %e, "Failed to kill timed-out container");
                }
                Err(EngineError::Timeout {
                    elapsed_ms: duration_ms,
                    stdout,
                    stderr,
                })
            }
        }
    }
}

/// Host process backend: runs the same startup command with the same
/// environment contract, only with host paths instead of mounts.
///
/// The worker gets its own process group. When the run ends (exit, timeout
/// or a dropped request future) the whole group is killed, so background
/// children cannot outlive the job or hold its output pipes open.
pub struct ProcessEngine;

impl ProcessEngine {
    pub async fn run(&self, invocation: &WorkerInvocation) -> Result<WorkerOutcome, EngineError> {
        let command = invocation.host_command();
        let Some((program, args)) = command.split_first() else {
            return Err(EngineError::Launch("empty worker command".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(invocation.host_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Launch(format!("failed to spawn {}: {}", program, e)))?;
        let mut group = ProcessGroup::of(child.id());

        info!(case_id = %invocation.case_id, pid = child.id(), "Worker process started");

        // Read pipes in their own tasks so `child.wait()` can borrow `child`.
        let stdout = Capture::default();
        let stderr = Capture::default();
        let stdout_task = tokio::spawn(read_stream(child.stdout.take(), stdout.clone()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take(), stderr.clone()));

        let timeout = Duration::from_secs(invocation.descriptor.timeout_secs);
        let waited = tokio::time::timeout(timeout, child.wait()).await;

        group.kill();
        if waited.is_err() {
            warn!(
                case_id = %invocation.case_id,
                timeout_secs = invocation.descriptor.timeout_secs,
                "Worker timed out, process group killed"
            );
            // Reap the shell
            if let Err(e) = child.kill().await {
                warn!(case_id = %invocation.case_id, error = %e, "Failed to kill timed-out worker");
            }
        }
        tokio::join!(drain(stdout_task), drain(stderr_task));

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match waited {
            Ok(Ok(status)) => Ok(WorkerOutcome {
                // Killed by a signal: no exit code
                exit_code: status.code().map(i64::from).unwrap_or(-1),
                stdout: stdout.into_string(),
                stderr: stderr.into_string(),
                duration_ms: elapsed_ms,
            }),
            Ok(Err(e)) => Err(EngineError::Launch(format!("failed to wait for worker: {}", e))),
            Err(_) => Err(EngineError::Timeout {
                elapsed_ms,
                stdout: stdout.into_string(),
                stderr: stderr.into_string(),
            }),
        }
    }
}

/// Process group led by the worker shell; SIGKILLed on `kill()` or drop.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(pid: Option<u32>) -> Self {
        // pgid 0 would address our own group
        let pgid = pid.and_then(|p| i32::try_from(p).ok()).filter(|p| *p > 0);
        Self { pgid }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        // Safety: kill(2) with a negative pid only signals that group. ESRCH
        // once every member has exited is expected and ignored.
        #[cfg(unix)]
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Output captured from one pipe, capped at [`MAX_OUTPUT_BYTES`]. Shared with
/// the reader task so partial output survives an abandoned read.
#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn push(&self, bytes: &[u8]) {
        let mut buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
        buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn into_string(self) -> String {
        let buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Read a stream to EOF. Past the cap the pipe is still drained so the
/// writer never blocks on it.
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>, capture: Capture) {
    let Some(mut handle) = handle else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match handle.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => capture.push(&chunk[..n]),
        }
    }
}

/// Give a reader task [`DRAIN_GRACE`] to hit EOF, then abandon it. A process
/// that escaped the group may still hold the pipe.
async fn drain(mut task: JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segment_common::worker::WorkerDescriptor;
    use std::path::Path;

    fn process_invocation(root: &Path, script_body: &str, timeout_secs: u64) -> WorkerInvocation {
        let script = root.join("run_inference.sh");
        std::fs::write(&script, script_body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let json = format!(
            r#"{{ "name": "stub", "version": "0", "backend": "process", "image": "none",
                 "shell": "/bin/sh", "timeout_secs": {} }}"#,
            timeout_secs
        );

        WorkerInvocation {
            case_id: "case-1".to_string(),
            host_input_root: root.join("inputs"),
            host_output_root: root.join("outputs"),
            host_script: script,
            descriptor: WorkerDescriptor::from_json(&json).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_process_success_captures_streams() {
        let root = tempfile::tempdir().unwrap();
        let inv = process_invocation(
            root.path(),
            "#!/bin/sh\nprintf 'hello\\n'\nprintf 'warn\\n' >&2\n",
            30,
        );

        let outcome = ProcessEngine.run(&inv).await.unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(outcome.stderr, "warn\n");
        assert_eq!(outcome.logs(), "hello\nwarn\n");
    }

    #[tokio::test]
    async fn test_process_nonzero_exit_is_an_outcome() {
        let root = tempfile::tempdir().unwrap();
        let inv = process_invocation(root.path(), "#!/bin/sh\necho boom >&2\nexit 3\n", 30);

        let outcome = ProcessEngine.run(&inv).await.unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stderr, "boom\n");
    }

    #[tokio::test]
    async fn test_process_startup_creates_mount_points_and_env() {
        let root = tempfile::tempdir().unwrap();
        let inv = process_invocation(
            root.path(),
            "#!/bin/sh\nmkdir -p \"$SEGMENT_OUTPUT_DIR\"\necho \"$SEGMENT_CASE_ID\"\n",
            30,
        );

        let outcome = ProcessEngine.run(&inv).await.unwrap();

        assert!(outcome.success(), "logs: {}", outcome.logs());
        assert_eq!(outcome.stdout, "case-1\n");
        assert!(root.path().join("inputs/case-1").is_dir());
        assert!(root.path().join("outputs/case-1/segmentations").is_dir());
    }

    #[tokio::test]
    async fn test_process_timeout_kills_worker() {
        let root = tempfile::tempdir().unwrap();
        let marker = root.path().join("finished");
        let inv = process_invocation(
            root.path(),
            &format!("#!/bin/sh\necho started\nsleep 3\ntouch '{}'\n", marker.display()),
            1,
        );

        let start = Instant::now();
        let result = ProcessEngine.run(&inv).await;

        assert!(start.elapsed() < Duration::from_secs(3));
        match result {
            Err(EngineError::Timeout { elapsed_ms, stdout, .. }) => {
                assert!(elapsed_ms >= 1000);
                assert_eq!(stdout, "started\n");
            }
            other => panic!("expected timeout, got {:?}", other),
        }

        // Outlive the script's own sleep: a surviving worker would write it now.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!marker.exists(), "worker kept running after the timeout");
    }

    #[tokio::test]
    async fn test_process_background_children_do_not_hold_the_job() {
        let root = tempfile::tempdir().unwrap();
        let marker = root.path().join("late");
        let inv = process_invocation(
            root.path(),
            &format!(
                "#!/bin/sh\n(sleep 3; touch '{}') &\nsleep 30 &\necho done\nexit 0\n",
                marker.display()
            ),
            1,
        );

        let start = Instant::now();
        let outcome = ProcessEngine.run(&inv).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(outcome.success());
        assert_eq!(outcome.stdout, "done\n");

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!marker.exists(), "background child outlived the job");
    }

    #[tokio::test]
    async fn test_process_output_is_capped() {
        let root = tempfile::tempdir().unwrap();
        let inv = process_invocation(
            root.path(),
            "#!/bin/sh\nhead -c 11000000 /dev/zero | tr '\\0' 'x'\n",
            30,
        );

        let outcome = ProcessEngine.run(&inv).await.unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.stdout.len(), MAX_OUTPUT_BYTES);
    }

    #[tokio::test]
    async fn test_process_missing_shell_is_launch_error() {
        let root = tempfile::tempdir().unwrap();
        let mut inv = process_invocation(root.path(), "#!/bin/sh\n", 30);
        inv.descriptor.shell = "/nonexistent/shell".to_string();

        let result = ProcessEngine.run(&inv).await;
        assert!(matches!(result, Err(EngineError::Launch(_))));
    }

    #[tokio::test]
    #[ignore] // Requires Docker and the alpine image
    async fn test_docker_runs_worker() {
        let root = tempfile::tempdir().unwrap();
        let mut inv = process_invocation(
            root.path(),
            "#!/bin/sh\nmkdir -p \"$SEGMENT_OUTPUT_DIR\"\ntouch \"$SEGMENT_OUTPUT_DIR/liver.nii.gz\"\n",
            120,
        );
        inv.descriptor.backend = Backend::Docker;
        inv.descriptor.image = "alpine:3.20".to_string();
        inv.descriptor.platform = None;
        std::fs::create_dir_all(&inv.host_input_root).unwrap();
        std::fs::create_dir_all(&inv.host_output_root).unwrap();

        let engine = DockerEngine::connect().unwrap();
        let outcome = engine.run(&inv).await.unwrap();

        assert!(outcome.success(), "logs: {}", outcome.logs());
        assert!(root
            .path()
            .join("outputs/case-1/segmentations/liver.nii.gz")
            .exists());
    }
}
