// CLI commands for managing the segmentation worker configuration
use anyhow::{bail, Context, Result};
use segment_common::layout;
use segment_common::worker::{Backend, Mounts, WorkerDescriptor, WorkerInvocation};
use std::fs;
use std::path::{Path, PathBuf};

const TASK_SCRIPT: &str = include_str!("../../../scripts/run_inference.sh");

fn parse_backend(backend: &str) -> Result<Backend> {
    match backend.to_lowercase().as_str() {
        "docker" => Ok(Backend::Docker),
        "process" => Ok(Backend::Process),
        other => bail!("Invalid backend '{}'. Valid options: docker, process", other),
    }
}

fn default_descriptor(image: &str, backend: Backend) -> WorkerDescriptor {
    WorkerDescriptor {
        name: "suprem".to_string(),
        version: "1".to_string(),
        backend,
        image: image.to_string(),
        platform: Some("linux/amd64".to_string()),
        shell: "/bin/bash".to_string(),
        mounts: Mounts::default(),
        script_path: PathBuf::from("run_inference.sh"),
        timeout_secs: 3600,
        memory_limit_mb: None,
        cpu_limit: None,
    }
}

/// Initialize a project with a worker descriptor and the task script
pub fn init_project(path: &str, image: &str, backend: &str, force: bool) -> Result<()> {
    println!("🚀 Initializing segmentation project at: {}", path);

    let backend = parse_backend(backend)?;
    let project_path = Path::new(path);

    for dir in ["config", "scripts", "public"] {
        let dir_path = project_path.join(dir);
        fs::create_dir_all(&dir_path)
            .with_context(|| format!("Failed to create directory: {}", dir))?;
        println!("  ✅ Created: {}", dir);
    }

    let descriptor = default_descriptor(image, backend);
    descriptor.validate()?;
    let json_content = serde_json::to_string_pretty(&descriptor)?;
    write_file(&project_path.join("config/worker.json"), &json_content, force)?;
    write_file(&project_path.join("scripts/run_inference.sh"), TASK_SCRIPT, force)?;

    println!("✅ Project initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Review config/worker.json (image, mounts, timeout)");
    println!("  2. segment-cli render --config config/worker.json");
    println!("  3. Start segment-api with SEGMENT_WORKER_CONFIG pointing at the descriptor");

    Ok(())
}

fn write_file(path: &Path, content: &str, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("  ⏭  Kept existing: {}", path.display());
        return Ok(());
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("  ✅ Created: {}", path.display());
    Ok(())
}

/// Validate a worker descriptor and summarize it
pub fn check_config(config: &str) -> Result<()> {
    let descriptor = WorkerDescriptor::load(Path::new(config))?;

    println!("✅ {} is valid", config);
    println!("  Worker:   {} v{}", descriptor.name, descriptor.version);
    println!("  Backend:  {}", descriptor.backend);
    println!("  Image:    {}", descriptor.image);
    if let Some(platform) = &descriptor.platform {
        println!("  Platform: {}", platform);
    }
    println!("  Timeout:  {}s", descriptor.timeout_secs);
    println!("  Mounts:   {} | {} | {} (ro)",
        descriptor.mounts.input_root, descriptor.mounts.output_root, descriptor.mounts.script);

    Ok(())
}

/// Print the invocation the API would perform for a case
pub fn render_invocation(config: &str, work_root: &str, case_id: Option<&str>) -> Result<()> {
    let descriptor = WorkerDescriptor::load(Path::new(config))?;
    let invocation = build_invocation(descriptor, Path::new(work_root), case_id)?;

    println!("# case {}", invocation.case_id);
    println!("{}", render_command(&invocation));
    Ok(())
}

fn build_invocation(
    descriptor: WorkerDescriptor,
    work_root: &Path,
    case_id: Option<&str>,
) -> Result<WorkerInvocation> {
    let work_root = if work_root.is_absolute() {
        work_root.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to read current directory")?
            .join(work_root)
    };

    let case_id = case_id
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Ok(WorkerInvocation {
        case_id,
        host_input_root: layout::input_root(&work_root),
        host_output_root: layout::output_root(&work_root),
        host_script: work_root.join(&descriptor.script_path),
        descriptor,
    })
}

fn render_command(invocation: &WorkerInvocation) -> String {
    match invocation.descriptor.backend {
        Backend::Docker => join_args(&invocation.docker_cli()),
        Backend::Process => {
            let mut args: Vec<String> = vec!["env".to_string()];
            args.extend(invocation.host_env().into_iter().map(|(k, v)| format!("{}={}", k, v)));
            args.extend(invocation.host_command());
            join_args(&args)
        }
    }
}

fn join_args(args: &[String]) -> String {
    args.iter().map(|a| quote_arg(a)).collect::<Vec<_>>().join(" ")
}

fn quote_arg(arg: &str) -> String {
    let plain = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c));
    if plain && !arg.is_empty() {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}
