//! Cluster test orchestration.
//!
//! The orchestrator turns each selected [`TestDescriptor`] into one top-level
//! harness test that owns a freshly provisioned cluster for its lifetime.
//!
//! # Execution Flow
//!
//! ```text
//!   Registry ──select()──► RunnableSet ──(version probe?)──► RunnableSet
//!                                                                │
//!                                      one top-level test each   ▼
//!   ┌────────────────────────────────────────────────────────────────┐
//!   │ parallel() ─► splay ─► new_cluster ─► discovery + render       │
//!   │   ─► new_machine × N ─► drop payload ─► desc.run(TestCluster)  │
//!   │   ─► teardown delay ─► console checks ─► destroy (always once) │
//!   └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Setup failures (cluster or machine creation, missing payload) fail only
//! the test that hit them; the rest of the run continues. Destroy errors are
//! logged and never change a test's outcome.
//!
//! # Example
//!
//! ```no_run
//! use convoy::config::Config;
//! use convoy::orchestrator::{Orchestrator, Settings};
//! use convoy::platform::new_backend;
//! use convoy::registry::Criteria;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let registry = convoy::suites::builtin()?;
//!     let backend = new_backend("local", &config)?;
//!
//!     let result = Orchestrator::new(backend, Settings::from_config(&config))
//!         .run(&registry, Criteria::new("basic.*", "local"))
//!         .await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod cluster;
pub mod console;
pub mod payload;

use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use futures::future::join_all;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bootconf::{DISCOVERY_TOKEN, UserData, instance_name};
use crate::config::{Config, expand_path};
use crate::harness::{H, RunResult, Suite, SuiteOptions, TestFnResult};
use crate::platform::{Backend, Cluster, ClusterOptions};
use crate::registry::{Criteria, Registry, TestDescriptor, Version, needs_version_probe, select};
use crate::report::{JUnitReporter, JsonReporter, MultiReporter, TapReporter};
use crate::retry::{RetryPolicy, retry};

pub use cluster::{Target, TestCluster};

/// Name of the throwaway cluster directory used to read the OS version.
pub const PROBE_DIR: &str = "probe-version";

const OS_RELEASE_COMMAND: &str = "grep ^VERSION_ID= /etc/os-release";

/// Knobs for one orchestrated run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub parallel: usize,
    /// Wiped and recreated at the start of the run.
    pub output_dir: PathBuf,
    pub verbose: bool,
    pub architecture: Option<String>,
    pub distribution: Option<String>,
    /// Upper bound of the random delay before each cluster is created.
    pub cluster_splay: Duration,
    /// Pause between the test body returning and cluster teardown.
    pub teardown_delay: Duration,
    /// Searched for the payload binary before the default locations.
    pub payload_paths: Vec<PathBuf>,
    /// Also look next to the executable and in the system payload directory.
    pub payload_default_dirs: bool,
    pub ssh_retry: RetryPolicy,
    pub create_retry: RetryPolicy,
    pub tap: Option<PathBuf>,
    pub junit: Option<PathBuf>,
    pub json: Option<PathBuf>,
}

impl Settings {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            parallel: 1,
            output_dir: output_dir.into(),
            verbose: true,
            architecture: None,
            distribution: None,
            cluster_splay: Duration::ZERO,
            teardown_delay: Duration::ZERO,
            payload_paths: Vec::new(),
            payload_default_dirs: true,
            ssh_retry: RetryPolicy::default(),
            create_retry: RetryPolicy::default(),
            tap: None,
            junit: None,
            json: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let c = &config.convoy;
        Self {
            parallel: c.parallel,
            output_dir: expand_path(&c.output_dir),
            verbose: c.verbose,
            architecture: c.architecture.clone(),
            distribution: c.distribution.clone(),
            cluster_splay: Duration::from_millis(c.cluster_splay_ms),
            teardown_delay: Duration::from_millis(c.teardown_delay_ms),
            payload_paths: c.payload_paths.iter().map(|p| expand_path(p)).collect(),
            payload_default_dirs: true,
            ssh_retry: config.retry.ssh_policy(),
            create_retry: config.retry.create_policy(),
            tap: config.report.tap.as_deref().map(expand_path),
            junit: config.report.junit.as_deref().map(expand_path),
            json: config.report.json.as_deref().map(expand_path),
        }
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_cluster_splay(mut self, splay: Duration) -> Self {
        self.cluster_splay = splay;
        self
    }

    pub fn with_teardown_delay(mut self, delay: Duration) -> Self {
        self.teardown_delay = delay;
        self
    }

    pub fn with_payload_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.payload_paths.push(dir.into());
        self
    }

    /// Restricts the payload search to [`Settings::payload_paths`].
    pub fn only_payload_paths(mut self) -> Self {
        self.payload_default_dirs = false;
        self
    }

    pub fn with_ssh_retry(mut self, policy: RetryPolicy) -> Self {
        self.ssh_retry = policy;
        self
    }

    pub fn with_create_retry(mut self, policy: RetryPolicy) -> Self {
        self.create_retry = policy;
        self
    }

    pub fn with_tap(mut self, path: impl Into<PathBuf>) -> Self {
        self.tap = Some(path.into());
        self
    }
}

/// Runs selected cluster tests against one backend.
pub struct Orchestrator {
    runner: Runner,
    out: Option<Box<dyn Write + Send>>,
    token: CancellationToken,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn Backend>, settings: Settings) -> Self {
        let target = Target {
            architecture: settings.architecture.clone(),
            distribution: settings.distribution.clone(),
        };
        Self {
            runner: Runner {
                backend,
                settings: Arc::new(settings),
                target: Arc::new(target),
            },
            out: None,
            token: CancellationToken::new(),
        }
    }

    /// Redirects harness progress output (stdout by default).
    pub fn with_output(mut self, out: impl Write + Send + 'static) -> Self {
        self.out = Some(Box::new(out));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.runner.settings
    }

    /// Selects tests from `registry` and runs each on its own cluster.
    ///
    /// # Errors
    ///
    /// Fails on an invalid pattern, a failed version probe, or when the
    /// output directory cannot be prepared. Test failures are reported in
    /// the returned [`RunResult`].
    pub async fn run(mut self, registry: &Registry, mut criteria: Criteria) -> Result<RunResult> {
        let target = Arc::make_mut(&mut self.runner.target);
        if criteria.architecture.is_some() {
            target.architecture = criteria.architecture.clone();
        } else {
            criteria.architecture = target.architecture.clone();
        }
        if criteria.distribution.is_some() {
            target.distribution = criteria.distribution.clone();
        } else {
            criteria.distribution = target.distribution.clone();
        }

        let mut set = select(registry, &criteria)?;
        if criteria.version.is_zero() && needs_version_probe(&set, &criteria.pattern) {
            let version = self.probe_version().await?;
            info!(%version, "Probed OS version");
            criteria = criteria.with_version(version);
            set = select(registry, &criteria)?;
        }
        info!(
            pattern = %criteria.pattern,
            platform = %criteria.platform,
            tests = set.len(),
            "Selected tests"
        );

        let settings = self.runner.settings.clone();
        let mut suite = Suite::new(
            SuiteOptions::new(&settings.output_dir)
                .with_parallel(settings.parallel)
                .with_verbose(settings.verbose),
        )
        .with_reporter(Arc::new(reporters(&settings)))
        .with_cancellation(self.token.clone());
        if let Some(out) = self.out.take() {
            suite = suite.with_output(out);
        }

        for (name, desc) in set {
            let runner = self.runner.clone();
            suite.add(name, move |h| async move { runner.run_test(h, desc).await });
        }

        suite.run().await
    }

    /// Runs one descriptor as the body of the top-level test `h`.
    pub async fn run_test(&self, h: H, desc: Arc<TestDescriptor>) -> TestFnResult {
        self.runner.run_test(h, desc).await
    }

    /// Boots one throwaway machine and reads its `VERSION_ID`.
    pub async fn probe_version(&self) -> Result<Version> {
        self.runner.probe_version().await
    }
}

fn reporters(settings: &Settings) -> MultiReporter {
    let mut multi = MultiReporter::new().with_reporter(TapReporter::in_dir(&settings.output_dir));
    if let Some(path) = &settings.tap {
        multi = multi.with_reporter(TapReporter::new(path.clone()));
    }
    if let Some(path) = &settings.junit {
        multi = multi.with_reporter(JUnitReporter::new(path.clone()));
    }
    if let Some(path) = &settings.json {
        multi = multi.with_reporter(JsonReporter::new(path.clone()));
    }
    multi
}

#[derive(Clone)]
struct Runner {
    backend: Arc<dyn Backend>,
    settings: Arc<Settings>,
    target: Arc<Target>,
}

impl Runner {
    fn cluster_options(&self, name: &str, dir: PathBuf) -> ClusterOptions {
        ClusterOptions::new(name, dir)
            .with_architecture(self.target.architecture.clone())
            .with_distribution(self.target.distribution.clone())
    }

    async fn probe_version(&self) -> Result<Version> {
        let opts = self.cluster_options(PROBE_DIR, self.settings.output_dir.join(PROBE_DIR));
        let cluster = retry("create probe cluster", &self.settings.create_retry, || {
            self.backend.new_cluster(&opts)
        })
        .await
        .context("Failed to create version probe cluster")?;

        let probed = self.read_version(&cluster).await;
        if let Err(e) = cluster.destroy().await {
            error!(cluster = %cluster.name(), error = %e, "Failed to destroy probe cluster");
        }
        probed
    }

    async fn read_version(&self, cluster: &Arc<dyn Cluster>) -> Result<Version> {
        let m = retry("create probe machine", &self.settings.create_retry, || {
            cluster.new_machine(None)
        })
        .await
        .context("Failed to create version probe machine")?;

        let out = retry("read os-release", &self.settings.ssh_retry, || {
            m.ssh(OS_RELEASE_COMMAND)
        })
        .await
        .context("Failed to read /etc/os-release")?;
        if !out.success() {
            anyhow::bail!("{OS_RELEASE_COMMAND:?} exited with {}: {}", out.exit_code, out.combined());
        }
        Ok(Version::from_os_release(out.stdout.trim())?)
    }

    async fn run_test(&self, h: H, desc: Arc<TestDescriptor>) -> TestFnResult {
        h.parallel().await?;
        if desc.fail_fast {
            h.set_fail_fast(true);
        }

        let splay = self.splay();
        if !splay.is_zero() {
            debug!(test = %desc.name, splay_ms = splay.as_millis() as u64, "Delaying cluster creation");
            tokio::time::sleep(splay).await;
        }

        let dir = h
            .output_dir()
            .map_err(|e| h.fatal(format!("Cluster failed: creating output directory: {e}")))?;
        let opts = self.cluster_options(&desc.name, dir);
        let cluster = retry("create cluster", &self.settings.create_retry, || {
            self.backend.new_cluster(&opts)
        })
        .await
        .map_err(|e| h.fatal(format!("Cluster failed: {e}")))?;
        info!(test = %desc.name, cluster = %cluster.name(), "Cluster created");

        let tc = TestCluster::new(h.clone(), cluster.clone(), desc.clone(), self.target.clone());
        let outcome = AssertUnwindSafe(self.setup_and_run(&tc, &desc))
            .catch_unwind()
            .await;

        if !self.settings.teardown_delay.is_zero() {
            tokio::time::sleep(self.settings.teardown_delay).await;
        }
        console::check_consoles(&h, &cluster, &desc).await;
        if let Err(e) = cluster.destroy().await {
            error!(test = %desc.name, cluster = %cluster.name(), error = %e, "Failed to destroy cluster");
        }

        match outcome {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    fn splay(&self) -> Duration {
        let max = self.settings.cluster_splay.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    async fn setup_and_run(&self, tc: &TestCluster, desc: &TestDescriptor) -> TestFnResult {
        if desc.cluster_size > 0 {
            self.create_machines(tc, desc).await?;
        }
        if !desc.native_funcs.is_empty() {
            self.deploy_payload(tc).await?;
        }

        let body = (desc.run)(tc.clone());
        match desc.timeout {
            Some(limit) => match tokio::time::timeout(limit, body).await {
                Ok(result) => result,
                Err(_) => Err(tc.fatal(format!("Test timed out after {limit:?}"))),
            },
            None => body.await,
        }
    }

    async fn create_machines(&self, tc: &TestCluster, desc: &TestDescriptor) -> TestFnResult {
        let cluster = tc.cluster();
        let size = desc.cluster_size;

        let discovery = match &desc.user_data {
            Some(ud) if ud.contains(DISCOVERY_TOKEN) => Some(
                retry("discovery url", &self.settings.create_retry, || {
                    cluster.discovery_url(size)
                })
                .await
                .map_err(|e| tc.fatal(format!("Failed to create discovery endpoint: {e}")))?,
            ),
            _ => None,
        };

        let configs: Vec<Option<UserData>> = (0..size)
            .map(|i| {
                desc.user_data
                    .as_ref()
                    .map(|ud| ud.render(discovery.as_deref(), &instance_name(i)))
            })
            .collect();

        let policy = self.settings.create_retry;
        let created = join_all(configs.iter().map(|config| {
            retry("create machine", &policy, move || cluster.new_machine(config.as_ref()))
        }))
        .await;

        for result in created {
            result.map_err(|e| tc.fatal(format!("Cluster failed starting machines: {e}")))?;
        }
        debug!(test = %desc.name, machines = size, "Machines created");
        Ok(())
    }

    async fn deploy_payload(&self, tc: &TestCluster) -> TestFnResult {
        let found = if self.settings.payload_default_dirs {
            payload::find_payload(
                &self.settings.payload_paths,
                self.target.architecture.as_deref(),
            )
        } else {
            payload::find_in(&self.settings.payload_paths)
        };
        let path = found.map_err(|e| tc.fatal(e.to_string()))?;

        for m in tc.machines() {
            retry("drop payload", &self.settings.ssh_retry, || m.drop_file(&path))
                .await
                .map_err(|e| {
                    tc.fatal(format!("dropping {} onto {}: {e}", path.display(), m.id()))
                })?;
        }
        if tc.machines().is_empty() {
            warn!(test = %tc.descriptor().name, "Native functions declared but no machines to copy them to");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let config = crate::config::load_config_str(
            r#"
            [convoy]
            parallel = 3
            output_dir = "out"
            architecture = "arm64"
            cluster_splay_ms = 0

            [retry]
            ssh_attempts = 2

            [report]
            tap = "run.tap"
            "#,
        )
        .unwrap();

        let s = Settings::from_config(&config);
        assert_eq!(s.parallel, 3);
        assert_eq!(s.output_dir, PathBuf::from("out"));
        assert_eq!(s.architecture.as_deref(), Some("arm64"));
        assert!(s.cluster_splay.is_zero());
        assert_eq!(s.teardown_delay, Duration::from_secs(2));
        assert_eq!(s.ssh_retry.attempts, 2);
        assert_eq!(s.tap, Some(PathBuf::from("run.tap")));
        assert!(s.junit.is_none());
        assert!(s.payload_default_dirs);
        assert!(!s.only_payload_paths().payload_default_dirs);
    }

    #[test]
    fn test_reporters_always_include_tap() {
        let s = Settings::new("out");
        assert_eq!(reporters(&s).len(), 1);
        let s = s.with_tap("extra.tap");
        assert_eq!(reporters(&s).len(), 2);
    }
}
