//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use convoy::bootconf::UserData;
use convoy::orchestrator::Settings;
use convoy::platform::{
    Backend, Cluster, ClusterOptions, ExecResult, Machine, ProviderError, ProviderResult,
};
use convoy::retry::RetryPolicy;

/// Decides the result of a remote command.
pub type Responder = Arc<dyn Fn(&str) -> ExecResult + Send + Sync>;

/// Everything the fake backend observed, shared across its clusters.
#[derive(Default)]
pub struct Recorder {
    pub clusters: AtomicUsize,
    pub destroys: AtomicUsize,
    pub configs: Mutex<Vec<Option<String>>>,
    pub commands: Mutex<Vec<String>>,
    pub dropped: Mutex<Vec<PathBuf>>,
}

impl Recorder {
    pub fn configs(&self) -> Vec<Option<String>> {
        self.configs.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

/// In-memory backend whose machines answer commands through a [`Responder`].
pub struct FakeBackend {
    pub recorder: Arc<Recorder>,
    /// Machine creation fails once this many machines exist in a cluster.
    fail_after: Option<usize>,
    /// Clusters whose name contains this string cannot be created.
    broken: Option<String>,
    console: String,
    responder: Responder,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
            fail_after: None,
            broken: None,
            console: String::new(),
            responder: Arc::new(|_| ExecResult::default()),
        }
    }

    pub fn failing_after(mut self, machines: usize) -> Self {
        self.fail_after = Some(machines);
        self
    }

    pub fn breaking(mut self, name: &str) -> Self {
        self.broken = Some(name.to_string());
        self
    }

    pub fn with_console(mut self, console: &str) -> Self {
        self.console = console.to_string();
        self
    }

    pub fn responding(mut self, f: impl Fn(&str) -> ExecResult + Send + Sync + 'static) -> Self {
        self.responder = Arc::new(f);
        self
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn new_cluster(&self, opts: &ClusterOptions) -> ProviderResult<Arc<dyn Cluster>> {
        if self.broken.as_deref().is_some_and(|b| opts.name.contains(b)) {
            return Err(ProviderError::CreateFailed(format!("{} is broken", opts.name)));
        }
        let n = self.recorder.clusters.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeCluster {
            name: format!("{}-{n}", opts.name),
            recorder: self.recorder.clone(),
            fail_after: self.fail_after,
            console: self.console.clone(),
            responder: self.responder.clone(),
            machines: Mutex::new(Vec::new()),
        }))
    }
}

pub struct FakeCluster {
    name: String,
    recorder: Arc<Recorder>,
    fail_after: Option<usize>,
    console: String,
    responder: Responder,
    machines: Mutex<Vec<Arc<dyn Machine>>>,
}

#[async_trait]
impl Cluster for FakeCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discovery_url(&self, size: usize) -> ProviderResult<String> {
        Ok(format!("https://discovery.test/{}?size={size}", self.name))
    }

    async fn new_machine(&self, config: Option<&UserData>) -> ProviderResult<Arc<dyn Machine>> {
        let mut machines = self.machines.lock().unwrap();
        if self.fail_after.is_some_and(|n| machines.len() >= n) {
            return Err(ProviderError::CreateFailed("quota exceeded".to_string()));
        }
        self.recorder
            .configs
            .lock()
            .unwrap()
            .push(config.map(|c| c.as_str().to_string()));

        let machine: Arc<dyn Machine> = Arc::new(FakeMachine {
            id: format!("{}-m{}", self.name, machines.len()),
            recorder: self.recorder.clone(),
            console: self.console.clone(),
            responder: self.responder.clone(),
        });
        machines.push(machine.clone());
        Ok(machine)
    }

    fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.machines.lock().unwrap().clone()
    }

    async fn destroy(&self) -> ProviderResult<()> {
        self.recorder.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeMachine {
    id: String,
    recorder: Arc<Recorder>,
    console: String,
    responder: Responder,
}

#[async_trait]
impl Machine for FakeMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> &str {
        "192.0.2.1"
    }

    fn private_ip(&self) -> &str {
        "10.0.0.1"
    }

    async fn ssh(&self, cmd: &str) -> ProviderResult<ExecResult> {
        self.recorder.commands.lock().unwrap().push(cmd.to_string());
        Ok((self.responder)(cmd))
    }

    async fn drop_file(&self, local: &Path) -> ProviderResult<()> {
        self.recorder.dropped.lock().unwrap().push(local.to_path_buf());
        Ok(())
    }

    async fn console_output(&self) -> ProviderResult<String> {
        Ok(self.console.clone())
    }
}

/// A `Write` sink tests can read back.
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

/// Settings with every delay disabled, writing under `dir`.
pub fn fast_settings(dir: &Path) -> Settings {
    Settings::new(dir.join("out"))
        .with_parallel(4)
        .with_cluster_splay(std::time::Duration::ZERO)
        .with_teardown_delay(std::time::Duration::ZERO)
        .with_ssh_retry(RetryPolicy::once())
        .with_create_retry(RetryPolicy::once())
}

/// Creates an empty payload binary in `dir` so payload search succeeds.
pub fn fake_payload(dir: &Path) -> PathBuf {
    let path = dir.join(convoy::orchestrator::payload::AGENT_BINARY);
    std::fs::write(&path, "#!/bin/sh\n").unwrap();
    path
}

pub fn exit(code: i32, stdout: &str) -> ExecResult {
    ExecResult {
        exit_code: code,
        stdout: stdout.to_string(),
        ..Default::default()
    }
}
