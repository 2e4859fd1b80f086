//! Backends that provision clusters of machines.
//!
//! The orchestrator only talks to the three traits defined here:
//!
//! ```text
//! Backend ──new_cluster()──► Cluster ──new_machine()──► Machine
//!                              │                          │
//!                              ├ discovery_url(size)      ├ ssh(cmd)
//!                              ├ machines()               ├ drop_file(path)
//!                              └ destroy()                └ console_output()
//! ```
//!
//! # Built-in Backends
//!
//! | Backend | Module | Description |
//! |---------|--------|-------------|
//! | Local | [`local`] | Machines are directories on this host |
//! | Command | [`command`] | Lifecycle delegated to shell templates |
//!
//! Everything else (cloud APIs, hypervisors) plugs in through the
//! `command` backend or a custom [`Backend`] implementation.

pub mod command;
pub mod local;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bootconf::UserData;
use crate::config::{Config, PlatformConfig};
use crate::harness::TestError;
use crate::retry::Retryable;

/// Result type for backend operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors raised by backends.
///
/// - **Retryable**: `Timeout`, `Connection`
/// - **Fatal**: everything else
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Failed to create a cluster or machine.
    #[error("Failed to create machine: {0}")]
    CreateFailed(String),

    /// The command could not be run at all. A command that runs and exits
    /// non-zero is not an error; see [`ExecResult::exit_code`].
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    #[error("Failed to copy file: {0}")]
    CopyFailed(String),

    #[error("Failed to destroy: {0}")]
    DestroyFailed(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Provider-specific error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Timeout(_) | ProviderError::Connection(_))
    }
}

impl From<ProviderError> for TestError {
    fn from(e: ProviderError) -> Self {
        TestError::Other(anyhow::Error::new(e))
    }
}

/// A command line to run on a machine.
///
/// ```
/// use convoy::platform::Command;
///
/// let cmd = Command::new("./convoy-agent").args(["run", "basic.native", "Check PID 1"]);
/// assert_eq!(cmd.to_shell_string(), "./convoy-agent run basic.native 'Check PID 1'");
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The program and arguments, each escaped for a POSIX shell.
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_string())
    }
}

/// Escape a string for use in a shell command.
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip)]
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Parameters for a new cluster.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Used to label the cluster's resources.
    pub name: String,
    /// Where the backend keeps machine state, boot configs and logs.
    pub output_dir: PathBuf,
    pub architecture: Option<String>,
    pub distribution: Option<String>,
}

impl ClusterOptions {
    pub fn new(name: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            output_dir: output_dir.into(),
            architecture: None,
            distribution: None,
        }
    }

    pub fn with_architecture(mut self, arch: Option<String>) -> Self {
        self.architecture = arch;
        self
    }

    pub fn with_distribution(mut self, distro: Option<String>) -> Self {
        self.distribution = distro;
        self
    }
}

/// Factory for clusters.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The platform name this backend was configured under.
    fn name(&self) -> &str;

    async fn new_cluster(&self, opts: &ClusterOptions) -> ProviderResult<Arc<dyn Cluster>>;
}

/// A group of machines owned by one test.
#[async_trait]
pub trait Cluster: Send + Sync {
    fn name(&self) -> &str;

    /// A token machines use to find each other at boot.
    async fn discovery_url(&self, size: usize) -> ProviderResult<String>;

    /// Boots one machine with the given (already rendered) boot config.
    async fn new_machine(&self, config: Option<&UserData>) -> ProviderResult<Arc<dyn Machine>>;

    /// Every machine created so far, in creation order.
    fn machines(&self) -> Vec<Arc<dyn Machine>>;

    /// Tears down every machine.
    async fn destroy(&self) -> ProviderResult<()>;
}

/// One running machine.
#[async_trait]
pub trait Machine: Send + Sync {
    fn id(&self) -> &str;

    fn ip(&self) -> &str;

    fn private_ip(&self) -> &str;

    /// Runs a shell command on the machine.
    async fn ssh(&self, cmd: &str) -> ProviderResult<ExecResult>;

    /// Copies a local file into the remote user's working directory,
    /// keeping its file name and mode.
    async fn drop_file(&self, local: &Path) -> ProviderResult<()>;

    /// The machine's serial console log, if the backend captures one.
    async fn console_output(&self) -> ProviderResult<String> {
        Ok(String::new())
    }
}

/// Resolves a platform name to a backend.
///
/// # Errors
///
/// Fails when `name` is neither configured nor built in.
pub fn new_backend(name: &str, config: &Config) -> anyhow::Result<Arc<dyn Backend>> {
    match config.platform(name) {
        Some(PlatformConfig::Local(c)) => Ok(Arc::new(local::LocalBackend::new(name, c))),
        Some(PlatformConfig::Command(c)) => Ok(Arc::new(command::CommandBackend::new(name, c))),
        None => bail!(
            "unknown platform {:?} (available: {})",
            name,
            config.platform_names().join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("simple"), "simple");
        assert_eq!(shell_escape("./convoy-agent"), "./convoy-agent");
        assert_eq!(shell_escape("with space"), "'with space'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn test_exec_result_combined() {
        let r = ExecResult {
            exit_code: 1,
            stdout: "out\n".into(),
            stderr: "err\n".into(),
            duration: Duration::ZERO,
        };
        assert!(!r.success());
        assert_eq!(r.combined(), "out\nerr");

        let r = ExecResult {
            stderr: "only err".into(),
            ..Default::default()
        };
        assert_eq!(r.combined(), "only err");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ProviderError::Timeout("x".into()).is_retryable());
        assert!(ProviderError::Connection("x".into()).is_retryable());
        assert!(!ProviderError::CreateFailed("x".into()).is_retryable());
    }

    #[test]
    fn test_new_backend() {
        let config = Config::default();
        let backend = new_backend("local", &config).unwrap();
        assert_eq!(backend.name(), "local");

        let err = new_backend("gce", &config).err().unwrap();
        assert!(err.to_string().contains("unknown platform \"gce\""));
    }
}
