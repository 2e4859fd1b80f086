//! Local backend: every machine is a scratch directory on this host.
//!
//! Commands run through the configured shell with the machine directory as
//! the working directory, so a payload dropped onto a machine is reachable as
//! `./<file>` exactly as it would be on a real remote host. Boot configs are
//! written to `<machine dir>/boot.conf`; a `console.log` placed in the
//! machine directory is reported as the machine's console output.
//!
//! # Example Configuration
//!
//! ```toml
//! [platforms.local]
//! type = "local"
//! shell = "/bin/bash"
//!
//! [platforms.local.env]
//! CONVOY_EXTRA = "1"
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Backend, Cluster, ClusterOptions, ExecResult, Machine, ProviderError, ProviderResult};
use crate::bootconf::UserData;
use crate::config::LocalPlatformConfig;
use crate::harness::lock;

/// Name of the rendered boot config inside each machine directory.
pub const BOOT_CONFIG: &str = "boot.conf";

/// Name of the file read by [`Machine::console_output`].
pub const CONSOLE_LOG: &str = "console.log";

pub struct LocalBackend {
    name: String,
    config: Arc<LocalPlatformConfig>,
}

impl LocalBackend {
    pub fn new(name: impl Into<String>, config: LocalPlatformConfig) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_cluster(&self, opts: &ClusterOptions) -> ProviderResult<Arc<dyn Cluster>> {
        tokio::fs::create_dir_all(&opts.output_dir).await?;
        info!(cluster = %opts.name, dir = %opts.output_dir.display(), "Created local cluster");
        Ok(Arc::new(LocalCluster {
            name: opts.name.clone(),
            dir: opts.output_dir.clone(),
            config: self.config.clone(),
            machines: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }))
    }
}

pub struct LocalCluster {
    name: String,
    dir: PathBuf,
    config: Arc<LocalPlatformConfig>,
    machines: Mutex<Vec<Arc<LocalMachine>>>,
    destroyed: AtomicBool,
}

#[async_trait]
impl Cluster for LocalCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discovery_url(&self, size: usize) -> ProviderResult<String> {
        let dir = self.dir.join("discovery").join(Uuid::new_v4().simple().to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(format!("file://{}?size={}", absolute(&dir).display(), size))
    }

    async fn new_machine(&self, config: Option<&UserData>) -> ProviderResult<Arc<dyn Machine>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ProviderError::CreateFailed(format!(
                "cluster {} already destroyed",
                self.name
            )));
        }

        let id = Uuid::new_v4().simple().to_string();
        let dir = self.dir.join(&id);
        tokio::fs::create_dir_all(&dir).await?;
        if let Some(config) = config {
            tokio::fs::write(dir.join(BOOT_CONFIG), config.as_str()).await?;
        }

        let machine = Arc::new(LocalMachine {
            id,
            dir: absolute(&dir),
            config: self.config.clone(),
        });
        debug!(cluster = %self.name, machine = %machine.id, "Created local machine");
        lock(&self.machines).push(machine.clone());
        Ok(machine)
    }

    fn machines(&self) -> Vec<Arc<dyn Machine>> {
        lock(&self.machines)
            .iter()
            .map(|m| m.clone() as Arc<dyn Machine>)
            .collect()
    }

    async fn destroy(&self) -> ProviderResult<()> {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            info!(
                cluster = %self.name,
                machines = lock(&self.machines).len(),
                "Destroyed local cluster"
            );
        }
        Ok(())
    }
}

pub struct LocalMachine {
    id: String,
    dir: PathBuf,
    config: Arc<LocalPlatformConfig>,
}

impl LocalMachine {
    /// The machine's working directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Machine for LocalMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> &str {
        "127.0.0.1"
    }

    fn private_ip(&self) -> &str {
        "127.0.0.1"
    }

    async fn ssh(&self, cmd: &str) -> ProviderResult<ExecResult> {
        let start = Instant::now();

        let mut process = tokio::process::Command::new(&self.config.shell);
        process.arg("-c").arg(cmd);
        process.current_dir(&self.dir);
        for (key, value) in &self.config.env {
            process.env(key, value);
        }
        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let output = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            process.output(),
        )
        .await
        .map_err(|_| ProviderError::Timeout(format!("{cmd:?} on {}", self.id)))?
        .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        })
    }

    async fn drop_file(&self, local: &Path) -> ProviderResult<()> {
        let file_name = local.file_name().ok_or_else(|| {
            ProviderError::CopyFailed(format!("{} has no file name", local.display()))
        })?;
        tokio::fs::copy(local, self.dir.join(file_name))
            .await
            .map_err(|e| ProviderError::CopyFailed(format!("{}: {}", local.display(), e)))?;
        Ok(())
    }

    async fn console_output(&self) -> ProviderResult<String> {
        match tokio::fs::read_to_string(self.dir.join(CONSOLE_LOG)).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
