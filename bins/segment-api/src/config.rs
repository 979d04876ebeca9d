// Process configuration for the segmentation API, read from the environment
use anyhow::{Context, Result};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub work_root: PathBuf,
    pub static_dir: PathBuf,
    pub worker_config: PathBuf,
    pub max_upload_bytes: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_addr = lookup("SEGMENT_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string());
        let work_root = lookup("SEGMENT_WORK_ROOT").unwrap_or_else(|| ".".to_string());
        let static_dir = lookup("SEGMENT_STATIC_DIR").unwrap_or_else(|| "public".to_string());
        let worker_config =
            lookup("SEGMENT_WORKER_CONFIG").unwrap_or_else(|| "config/worker.json".to_string());

        let max_upload_mb: usize = match lookup("SEGMENT_MAX_UPLOAD_MB") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("SEGMENT_MAX_UPLOAD_MB must be an integer, got '{}'", raw))?,
            None => 1024,
        };

        Ok(Self {
            bind_addr,
            work_root: PathBuf::from(work_root),
            static_dir: PathBuf::from(static_dir),
            worker_config: PathBuf::from(worker_config),
            max_upload_bytes: max_upload_mb * 1024 * 1024,
        })
    }
}
