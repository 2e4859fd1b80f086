//! Configuration schema definitions for convoy.
//!
//! Every table is optional; an empty file (or no file at all) yields a
//! configuration that runs against the built-in `local` platform.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── ConvoyConfig           - Run settings (parallelism, output, target)
//! ├── RetryConfig            - Per-call-site retry policies
//! ├── platforms.<name>       - Tagged enum selecting a backend
//! │   ├── Local              - Machines are directories on this host
//! │   └── Command            - Lifecycle driven by shell templates
//! └── ReportConfig           - Extra report files
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [convoy]
/// parallel = 4
/// output_dir = "_convoy_temp"
/// architecture = "amd64"
///
/// [retry]
/// ssh_attempts = 5
///
/// [platforms.local]
/// type = "local"
///
/// [platforms.lab]
/// type = "command"
/// create_command = "./lab.sh create {cluster} {name} {config}"
/// exec_command = "./lab.sh exec {machine_id} {command}"
/// copy_command = "./lab.sh copy {machine_id} {local_path}"
/// destroy_command = "./lab.sh destroy {machine_id}"
///
/// [report]
/// junit = "test-results/junit.xml"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub convoy: ConvoyConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Named backends, selected with `--platform`.
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Core run settings.
///
/// | Field | Default |
/// |-------|---------|
/// | `parallel` | 10 |
/// | `output_dir` | `_convoy_temp` |
/// | `cluster_splay_ms` | 2000 |
/// | `teardown_delay_ms` | 2000 |
/// | `verbose` | true |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConvoyConfig {
    /// Maximum number of tests running at once.
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    /// Wiped and recreated at the start of every run.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Distribution tag of the image under test.
    pub distribution: Option<String>,

    /// Architecture of the image under test.
    pub architecture: Option<String>,

    /// Upper bound of the random delay before each cluster is created.
    #[serde(default = "default_splay_ms")]
    pub cluster_splay_ms: u64,

    /// Pause between the end of a test body and cluster teardown.
    #[serde(default = "default_teardown_delay_ms")]
    pub teardown_delay_ms: u64,

    /// Extra directories searched for the `convoy-agent` payload, before
    /// the built-in candidates.
    #[serde(default)]
    pub payload_paths: Vec<PathBuf>,

    /// Print `=== RUN` lines and the logs of passing tests.
    #[serde(default = "default_true")]
    pub verbose: bool,
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            output_dir: default_output_dir(),
            distribution: None,
            architecture: None,
            cluster_splay_ms: default_splay_ms(),
            teardown_delay_ms: default_teardown_delay_ms(),
            payload_paths: Vec::new(),
            verbose: true,
        }
    }
}

fn default_parallel() -> usize {
    10
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("_convoy_temp")
}

fn default_splay_ms() -> u64 {
    2000
}

fn default_teardown_delay_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

/// Retry policies for transient infrastructure failures.
///
/// | Call site | Attempts | Delay |
/// |-----------|----------|-------|
/// | SSH (payload copy, version probe) | 5 | 2s |
/// | Machine creation | 3 | 10s |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_ssh_attempts")]
    pub ssh_attempts: u32,

    #[serde(default = "default_ssh_delay_ms")]
    pub ssh_delay_ms: u64,

    #[serde(default = "default_create_attempts")]
    pub create_attempts: u32,

    #[serde(default = "default_create_delay_ms")]
    pub create_delay_ms: u64,
}

impl RetryConfig {
    pub fn ssh_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.ssh_attempts, Duration::from_millis(self.ssh_delay_ms))
    }

    pub fn create_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.create_attempts,
            Duration::from_millis(self.create_delay_ms),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ssh_attempts: default_ssh_attempts(),
            ssh_delay_ms: default_ssh_delay_ms(),
            create_attempts: default_create_attempts(),
            create_delay_ms: default_create_delay_ms(),
        }
    }
}

fn default_ssh_attempts() -> u32 {
    5
}

fn default_ssh_delay_ms() -> u64 {
    2000
}

fn default_create_attempts() -> u32 {
    3
}

fn default_create_delay_ms() -> u64 {
    10_000
}

/// Backend configuration.
///
/// The `type` field selects the variant:
///
/// ```toml
/// [platforms.local]
/// type = "local"
///
/// [platforms.lab]
/// type = "command"
/// # ...
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlatformConfig {
    Local(LocalPlatformConfig),

    Command(CommandPlatformConfig),
}

impl PlatformConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            PlatformConfig::Local(_) => "local",
            PlatformConfig::Command(_) => "command",
        }
    }
}

/// Machines are scratch directories on this host and commands run through
/// a local shell. Useful for developing tests and for exercising the
/// harness itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalPlatformConfig {
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Extra environment for every command.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Per-command timeout.
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

impl Default for LocalPlatformConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            env: HashMap::new(),
            timeout_secs: default_command_timeout(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_command_timeout() -> u64 {
    3600
}

/// Machine lifecycle delegated to user-supplied shell commands.
///
/// # Placeholders
///
/// | Placeholder | Available in | Value |
/// |-------------|--------------|-------|
/// | `{cluster}` | all | cluster name |
/// | `{name}` | `create_command` | machine label |
/// | `{config}` | `create_command` | path of the rendered boot config |
/// | `{machine_id}` | exec, copy, console, destroy | id printed by `create_command` |
/// | `{command}` | `exec_command` | shell-quoted remote command |
/// | `{local_path}` | `copy_command` | file to copy |
/// | `{size}` | `discovery_command` | cluster size |
///
/// `status_command`, when set, is polled after `create_command` until it
/// reports the machine done. It prints `pending`, `running` or `done` on its
/// last line, or `{"state": ..., "errors": [...], "failed": ...}`.
///
/// `create_command` prints either a bare machine id or a JSON object
/// `{"id": ..., "ip": ..., "private_ip": ...}` on its last line.
/// `exec_command` may print `{"exit_code": ..., "stdout": ..., "stderr": ...}`
/// on its last line; otherwise its own exit status and output are used.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandPlatformConfig {
    pub create_command: String,

    pub exec_command: String,

    pub copy_command: String,

    pub destroy_command: String,

    /// Prints the discovery token. Without it a random token is generated.
    pub discovery_command: Option<String>,

    /// Prints the machine's console log.
    pub console_command: Option<String>,

    /// Reports whether a machine has finished booting.
    pub status_command: Option<String>,

    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    /// How long a new machine may take to boot and accept commands.
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,

    /// Run `true` through `exec_command` until it succeeds before handing a
    /// new machine to the test.
    #[serde(default)]
    pub wait_for_exec: bool,

    /// Working directory for every template.
    pub working_dir: Option<PathBuf>,

    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_status_interval() -> u64 {
    5
}

fn default_boot_timeout() -> u64 {
    600
}

/// Extra report files, on top of the `test.tap` summary always written to
/// the output directory.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportConfig {
    pub tap: Option<PathBuf>,

    pub junit: Option<PathBuf>,

    pub json: Option<PathBuf>,
}
