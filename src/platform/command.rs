//! Command backend: machine lifecycle driven by shell templates.
//!
//! This backend integrates convoy with any provisioning tool that has a
//! command line (cloud CLIs, hypervisor wrappers, lab scripts). Each step of
//! the lifecycle is a template from [`CommandPlatformConfig`] with
//! `{placeholder}` substitution.
//!
//! # Command Protocol
//!
//! 1. **create_command**: boots a machine, prints its id (or
//!    `{"id": ..., "ip": ..., "private_ip": ...}`) on the last line of stdout
//! 2. **exec_command**: runs `{command}` on `{machine_id}`; may print
//!    `{"exit_code": 0, "stdout": "...", "stderr": "..."}` on its last line
//! 3. **copy_command**: copies `{local_path}` to `{machine_id}`
//! 4. **destroy_command**: tears down `{machine_id}`
//!
//! When `status_command` is configured, machine creation does not return
//! until polling it reports `done`; with `wait_for_exec` it also waits until
//! `exec_command` can run `true` on the new machine.
//!
//! Templates are split into words with shell quoting rules and executed
//! directly, without an intermediate shell.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Backend, Cluster, ClusterOptions, ExecResult, Machine, ProviderError, ProviderResult};
use crate::bootconf::UserData;
use crate::config::CommandPlatformConfig;
use crate::harness::lock;
use crate::pending::{Operation, OperationState, OperationStatus, Pending, PendingError};
use crate::retry::retry_until;

/// Runs template commands as child processes.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            working_dir: None,
            timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs `command` and captures its output. A non-zero exit is returned
    /// in the result, not as an error.
    pub async fn run(&self, command: &str) -> ProviderResult<ExecResult> {
        let parts = shell_words::split(command)
            .map_err(|e| ProviderError::ExecFailed(format!("{command:?}: {e}")))?;
        let Some((program, args)) = parts.split_first() else {
            return Err(ProviderError::ExecFailed("empty command".to_string()));
        };

        debug!("Running command: {:?}", parts);
        let start = Instant::now();

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ProviderError::Timeout(format!("{program} timed out")))?
            .map_err(|e| ProviderError::ExecFailed(format!("Failed to run {program}: {e}")))?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        })
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn last_line(s: &str) -> Option<&str> {
    s.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

/// Uses the JSON result protocol when the last stdout line carries it.
fn parse_exec_output(raw: ExecResult) -> ExecResult {
    let parsed = last_line(&raw.stdout)
        .filter(|l| l.starts_with('{'))
        .and_then(|l| serde_json::from_str::<ExecResult>(l).ok());
    match parsed {
        Some(mut result) => {
            result.duration = raw.duration;
            result
        }
        None => raw,
    }
}

#[derive(Debug, Deserialize)]
struct CreatedMachine {
    id: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    private_ip: Option<String>,
}

fn parse_created(stdout: &str) -> Option<CreatedMachine> {
    let line = last_line(stdout)?;
    if line.starts_with('{') {
        return serde_json::from_str(line).ok();
    }
    Some(CreatedMachine {
        id: line.to_string(),
        ip: None,
        private_ip: None,
    })
}

#[derive(Debug, Deserialize)]
struct StatusLine {
    state: String,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    failed: bool,
}

fn parse_state(s: &str) -> anyhow::Result<OperationState> {
    match s.trim().to_ascii_lowercase().as_str() {
        "pending" => Ok(OperationState::Pending),
        "running" => Ok(OperationState::Running),
        "done" => Ok(OperationState::Done),
        other => bail!("unknown machine state {other:?}"),
    }
}

fn parse_status(stdout: &str) -> anyhow::Result<OperationStatus> {
    let line = last_line(stdout).ok_or_else(|| anyhow!("status command printed nothing"))?;
    if !line.starts_with('{') {
        return Ok(OperationStatus::new(parse_state(line)?));
    }
    let parsed: StatusLine = serde_json::from_str(line)?;
    let mut status = OperationStatus::new(parse_state(&parsed.state)?).with_failed(parsed.failed);
    status.errors = parsed.errors;
    Ok(status)
}

/// Boot progress of one machine, as reported by `status_command`.
struct BootStatus {
    runner: Arc<ShellRunner>,
    command: String,
}

#[async_trait]
impl Operation for BootStatus {
    async fn poll(&self) -> anyhow::Result<OperationStatus> {
        let result = self.runner.run(&self.command).await?;
        if !result.success() {
            bail!(
                "status command exited with {}: {}",
                result.exit_code,
                result.combined()
            );
        }
        parse_status(&result.stdout)
    }
}

pub struct CommandBackend {
    name: String,
    config: Arc<CommandPlatformConfig>,
    runner: Arc<ShellRunner>,
}

impl CommandBackend {
    pub fn new(name: impl Into<String>, config: CommandPlatformConfig) -> Self {
        let mut runner = ShellRunner::new().with_timeout(Duration::from_secs(config.timeout_secs));
        if let Some(dir) = &config.working_dir {
            runner = runner.with_working_dir(dir.clone());
        }
        Self {
            name: name.into(),
            config: Arc::new(config),
            runner: Arc::new(runner),
        }
    }
}

#[async_trait]
impl Backend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_cluster(&self, opts: &ClusterOptions) -> ProviderResult<Arc<dyn Cluster>> {
        tokio::fs::create_dir_all(&opts.output_dir).await?;
        Ok(Arc::new(CommandCluster {
            name: cluster_label(&opts.name),
            dir: std::path::absolute(&opts.output_dir)?,
            config: self.config.clone(),
            runner: self.runner.clone(),
            machines: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        }))
    }
}

/// `basic.ssh` → `basic-ssh-1a2b3c4d`: safe for hostnames and resource tags.
fn cluster_label(test_name: &str) -> String {
    let base: String = test_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", base.trim_matches('-'), &suffix[..8])
}

pub struct CommandCluster {
    name: String,
    dir: PathBuf,
    config: Arc<CommandPlatformConfig>,
    runner: Arc<ShellRunner>,
    machines: Mutex<Vec<Arc<CommandMachine>>>,
    counter: AtomicUsize,
    destroyed: AtomicBool,
}

#[async_trait]
impl Cluster for CommandCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discovery_url(&self, size: usize) -> ProviderResult<String> {
        let Some(template) = &self.config.discovery_command else {
            return Ok(format!(
                "convoy://{}/{}?size={}",
                self.name,
                Uuid::new_v4().simple(),
                size
            ));
        };

        let cmd = template
            .replace("{cluster}", &self.name)
            .replace("{size}", &size.to_string());
        let result = self.runner.run(&cmd).await?;
        if !result.success() {
            return Err(ProviderError::CreateFailed(format!(
                "discovery command failed: {}",
                result.combined()
            )));
        }
        last_line(&result.stdout)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::CreateFailed("discovery command printed nothing".into()))
    }

    async fn new_machine(&self, config: Option<&UserData>) -> ProviderResult<Arc<dyn Machine>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ProviderError::CreateFailed(format!(
                "cluster {} already destroyed",
                self.name
            )));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{}", self.name, n);
        let config_path = self.dir.join(format!("{name}.conf"));
        tokio::fs::write(&config_path, config.map(UserData::as_str).unwrap_or_default()).await?;

        let cmd = self
            .config
            .create_command
            .replace("{cluster}", &self.name)
            .replace("{name}", &name)
            .replace(
                "{config}",
                &shell_words::quote(&config_path.to_string_lossy()),
            );
        info!(cluster = %self.name, machine = %name, "Creating machine");
        let result = self.runner.run(&cmd).await?;
        if !result.success() {
            return Err(ProviderError::CreateFailed(format!(
                "{name}: create command exited with {}: {}",
                result.exit_code,
                result.stderr.trim()
            )));
        }
        let created = parse_created(&result.stdout).ok_or_else(|| {
            ProviderError::CreateFailed(format!("{name}: create command returned no machine id"))
        })?;

        let machine = Arc::new(CommandMachine {
            ip: created.ip.unwrap_or_default(),
            private_ip: created.private_ip.unwrap_or_default(),
            id: created.id,
            cluster: self.name.clone(),
            config: self.config.clone(),
            runner: self.runner.clone(),
        });
        lock(&self.machines).push(machine.clone());
        self.wait_for_boot(&machine).await?;
        Ok(machine)
    }

    fn machines(&self) -> Vec<Arc<dyn Machine>> {
        lock(&self.machines)
            .iter()
            .map(|m| m.clone() as Arc<dyn Machine>)
            .collect()
    }

    async fn destroy(&self) -> ProviderResult<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let machines = lock(&self.machines).clone();
        let results = futures::future::join_all(machines.iter().map(|m| m.destroy())).await;

        let mut failures = Vec::new();
        for (m, result) in machines.iter().zip(results) {
            if let Err(e) = result {
                warn!(machine = %m.id, "Destroy failed: {}", e);
                failures.push(format!("{}: {}", m.id, e));
            }
        }
        info!(cluster = %self.name, machines = machines.len(), "Destroyed cluster");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProviderError::DestroyFailed(failures.join("; ")))
        }
    }
}

impl CommandCluster {
    async fn wait_for_boot(&self, m: &CommandMachine) -> ProviderResult<()> {
        let timeout = Duration::from_secs(self.config.boot_timeout_secs);
        let interval = Duration::from_secs(self.config.status_interval_secs);

        if let Some(template) = &self.config.status_command {
            let status = BootStatus {
                runner: self.runner.clone(),
                command: m.template(template),
            };
            Pending::new(format!("boot {}", m.id), status)
                .with_interval(interval)
                .with_timeout(timeout)
                .wait()
                .await
                .map_err(|e| match e {
                    PendingError::TimedOut { .. } => ProviderError::Timeout(e.to_string()),
                    _ => ProviderError::CreateFailed(e.to_string()),
                })?;
        }

        if self.config.wait_for_exec {
            retry_until("wait for exec", timeout, interval, || async move {
                let out = m.ssh("true").await?;
                if out.success() {
                    Ok(())
                } else {
                    Err(ProviderError::Connection(format!(
                        "{} not accepting commands: {}",
                        m.id,
                        out.combined()
                    )))
                }
            })
            .await?;
        }
        Ok(())
    }
}

pub struct CommandMachine {
    id: String,
    ip: String,
    private_ip: String,
    cluster: String,
    config: Arc<CommandPlatformConfig>,
    runner: Arc<ShellRunner>,
}

impl CommandMachine {
    fn template(&self, template: &str) -> String {
        template
            .replace("{cluster}", &self.cluster)
            .replace("{machine_id}", &self.id)
    }

    async fn destroy(&self) -> ProviderResult<()> {
        let result = self.runner.run(&self.template(&self.config.destroy_command)).await?;
        if !result.success() {
            return Err(ProviderError::DestroyFailed(result.combined()));
        }
        Ok(())
    }
}

#[async_trait]
impl Machine for CommandMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> &str {
        &self.ip
    }

    fn private_ip(&self) -> &str {
        &self.private_ip
    }

    async fn ssh(&self, cmd: &str) -> ProviderResult<ExecResult> {
        let shell_cmd = self
            .template(&self.config.exec_command)
            .replace("{command}", &shell_words::quote(cmd));
        debug!(machine = %self.id, "exec: {}", cmd);
        Ok(parse_exec_output(self.runner.run(&shell_cmd).await?))
    }

    async fn drop_file(&self, local: &Path) -> ProviderResult<()> {
        let shell_cmd = self
            .template(&self.config.copy_command)
            .replace("{local_path}", &shell_words::quote(&local.to_string_lossy()));
        let result = self.runner.run(&shell_cmd).await?;
        if !result.success() {
            return Err(ProviderError::CopyFailed(format!(
                "{} to {}: {}",
                local.display(),
                self.id,
                result.combined()
            )));
        }
        Ok(())
    }

    async fn console_output(&self) -> ProviderResult<String> {
        let Some(template) = &self.config.console_command else {
            return Ok(String::new());
        };
        let result = self.runner.run(&self.template(template)).await?;
        Ok(result.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(create: &str, exec: &str) -> CommandPlatformConfig {
        CommandPlatformConfig {
            create_command: create.to_string(),
            exec_command: exec.to_string(),
            copy_command: "true {machine_id} {local_path}".to_string(),
            destroy_command: "true {machine_id}".to_string(),
            discovery_command: None,
            console_command: None,
            status_command: None,
            status_interval_secs: 0,
            boot_timeout_secs: 5,
            wait_for_exec: false,
            working_dir: None,
            timeout_secs: 30,
        }
    }

    #[test]
    fn test_parse_created() {
        let m = parse_created("booting...\nm-123\n").unwrap();
        assert_eq!(m.id, "m-123");
        assert!(m.ip.is_none());

        let m = parse_created(r#"{"id": "i-9", "ip": "10.0.0.9", "private_ip": "192.168.0.9"}"#)
            .unwrap();
        assert_eq!(m.id, "i-9");
        assert_eq!(m.private_ip.as_deref(), Some("192.168.0.9"));

        assert!(parse_created("\n\n").is_none());
    }

    #[test]
    fn test_parse_exec_output_json() {
        let raw = ExecResult {
            exit_code: 0,
            stdout: "noise\n{\"exit_code\": 2, \"stdout\": \"x\", \"stderr\": \"y\"}\n".into(),
            stderr: String::new(),
            duration: Duration::from_secs(1),
        };
        let parsed = parse_exec_output(raw);
        assert_eq!(parsed.exit_code, 2);
        assert_eq!(parsed.stdout, "x");
        assert_eq!(parsed.duration, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_exec_output_plain() {
        let raw = ExecResult {
            exit_code: 1,
            stdout: "plain\n".into(),
            ..Default::default()
        };
        assert_eq!(parse_exec_output(raw).stdout, "plain\n");
    }

    #[test]
    fn test_cluster_label() {
        let label = cluster_label("basic.ssh/Sub Test");
        assert!(label.starts_with("basic-ssh-sub-test-"));
        assert_eq!(label.len(), "basic-ssh-sub-test-".len() + 8);
    }

    #[tokio::test]
    async fn test_lifecycle_through_templates() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(
            "echo",
            config(
                r#"echo '{"id":"{name}","ip":"10.1.1.1"}'"#,
                "sh -c {command}",
            ),
        );
        let cluster = backend
            .new_cluster(&ClusterOptions::new("basic.ssh", tmp.path()))
            .await
            .unwrap();

        let m = cluster
            .new_machine(Some(&UserData::new("name: $name")))
            .await
            .unwrap();
        assert!(m.id().ends_with("-0"));
        assert_eq!(m.ip(), "10.1.1.1");

        let conf = std::fs::read_to_string(tmp.path().join(format!("{}.conf", m.id()))).unwrap();
        assert_eq!(conf, "name: $name");

        let out = m.ssh("echo 'hi there'; exit 4").await.unwrap();
        assert_eq!(out.exit_code, 4);
        assert_eq!(out.stdout, "hi there\n");

        m.drop_file(Path::new("/etc/hostname")).await.unwrap();
        assert!(cluster.discovery_url(2).await.unwrap().ends_with("?size=2"));
        cluster.destroy().await.unwrap();
        assert!(cluster.new_machine(None).await.is_err());
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("booting\nrunning\n").unwrap(), OperationStatus::running());
        assert!(parse_status("DONE").unwrap().is_done());
        assert!(parse_status("rebooting").is_err());
        assert!(parse_status("").is_err());

        let s = parse_status(r#"{"state": "done", "errors": ["QUOTA"], "failed": true}"#).unwrap();
        assert!(s.is_done());
        assert!(s.failed);
        assert_eq!(s.errors, vec!["QUOTA".to_string()]);
    }

    #[tokio::test]
    async fn test_waits_for_boot_status_and_exec() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config("echo {name}", "sh -c {command}");
        cfg.status_command = Some("echo done".to_string());
        cfg.wait_for_exec = true;
        let cluster = CommandBackend::new("lab", cfg)
            .new_cluster(&ClusterOptions::new("boot", tmp.path()))
            .await
            .unwrap();
        assert!(cluster.new_machine(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_boot_errors_fail_creation() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config("echo {name}", "sh -c {command}");
        cfg.status_command =
            Some(r#"echo '{"state": "done", "errors": ["ZONE_EXHAUSTED"]}'"#.to_string());
        let cluster = CommandBackend::new("lab", cfg)
            .new_cluster(&ClusterOptions::new("boot", tmp.path()))
            .await
            .unwrap();

        let err = cluster.new_machine(None).await.err().unwrap();
        assert!(matches!(err, ProviderError::CreateFailed(ref m) if m.contains("ZONE_EXHAUSTED")));
        assert_eq!(cluster.machines().len(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new("broken", config("false", "sh -c {command}"));
        let cluster = backend
            .new_cluster(&ClusterOptions::new("t", tmp.path()))
            .await
            .unwrap();
        assert!(matches!(
            cluster.new_machine(None).await,
            Err(ProviderError::CreateFailed(_))
        ));
    }
}
