//! The handle a cluster test body receives.

use std::future::Future;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use super::payload::AGENT_BINARY;
use crate::harness::{H, TestFnResult};
use crate::platform::{Cluster, Command, ExecResult, Machine, ProviderResult};
use crate::registry::TestDescriptor;

/// Architecture and distribution of the image under test.
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub architecture: Option<String>,
    pub distribution: Option<String>,
}

impl Target {
    fn matches_any(&self, exclusions: &[String]) -> bool {
        [&self.architecture, &self.distribution]
            .into_iter()
            .flatten()
            .any(|t| exclusions.contains(t))
    }
}

/// A running test plus the cluster it owns.
///
/// Derefs to [`H`], so `c.log(..)`, `c.error(..)` and `c.fatal(..)` work
/// directly on the cluster handle.
#[derive(Clone)]
pub struct TestCluster {
    h: H,
    cluster: Arc<dyn Cluster>,
    desc: Arc<TestDescriptor>,
    target: Arc<Target>,
}

impl TestCluster {
    pub fn new(
        h: H,
        cluster: Arc<dyn Cluster>,
        desc: Arc<TestDescriptor>,
        target: Arc<Target>,
    ) -> Self {
        Self {
            h,
            cluster,
            desc,
            target,
        }
    }

    pub fn h(&self) -> &H {
        &self.h
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn descriptor(&self) -> &TestDescriptor {
        &self.desc
    }

    /// Every machine in the cluster, in creation order.
    pub fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.cluster.machines()
    }

    /// Native functions this test declares that are not excluded on the
    /// current target.
    pub fn native_funcs(&self) -> Vec<String> {
        self.desc
            .native_funcs
            .iter()
            .filter(|(_, f)| !self.target.matches_any(&f.exclusions))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The command line that runs native function `func` of this test.
    pub fn native_command(&self, func: &str) -> Command {
        Command::new(format!("./{AGENT_BINARY}")).args(["run", self.desc.name.as_str(), func])
    }

    /// Runs native function `func` on `m` as a sub-test named `func`.
    ///
    /// The remote output is logged either way; a non-zero exit status or a
    /// transport error fails the sub-test. Returns `false` on failure.
    pub async fn run_native(&self, func: &str, m: &Arc<dyn Machine>) -> bool {
        let known = self.desc.native_func(func).is_some();
        let command = self.native_command(func).to_shell_string();
        let test = self.desc.name.clone();
        let func_name = func.to_string();
        let m = m.clone();

        self.run(func, move |c| async move {
            if !known {
                return Err(c.fatal(format!(
                    "test {test:?} has no native function {func_name:?}"
                )));
            }
            debug!(machine = %m.id(), "{}", command);
            match m.ssh(&command).await {
                Ok(out) => {
                    let combined = out.combined();
                    if !combined.is_empty() {
                        c.log(&combined);
                    }
                    if !out.success() {
                        c.error(format!(
                            "{AGENT_BINARY} failed on {}: exit status {}",
                            m.id(),
                            out.exit_code
                        ));
                    }
                }
                Err(e) => c.error(format!("{AGENT_BINARY} failed on {}: {}", m.id(), e)),
            }
            Ok(())
        })
        .await
    }

    /// Runs `body` as a sub-test that shares this cluster.
    pub async fn run<F, Fut>(&self, name: &str, body: F) -> bool
    where
        F: FnOnce(TestCluster) -> Fut + Send + 'static,
        Fut: Future<Output = TestFnResult> + Send + 'static,
    {
        let cluster = self.cluster.clone();
        let desc = self.desc.clone();
        let target = self.target.clone();
        self.h
            .run(name, move |h| body(TestCluster::new(h, cluster, desc, target)))
            .await
    }

    /// Runs `cmd` on `m`.
    pub async fn ssh(&self, m: &Arc<dyn Machine>, cmd: &str) -> ProviderResult<ExecResult> {
        m.ssh(cmd).await
    }

    /// Runs `cmd` on `m` and returns its trimmed stdout. Any failure ends the
    /// test with the command's output.
    pub async fn must_ssh(&self, m: &Arc<dyn Machine>, cmd: &str) -> TestFnResult<String> {
        match m.ssh(cmd).await {
            Ok(out) if out.success() => Ok(out.stdout.trim().to_string()),
            Ok(out) => Err(self.fatal(format!(
                "{cmd:?} on {} exited with {}: {}",
                m.id(),
                out.exit_code,
                out.combined()
            ))),
            Err(e) => Err(self.fatal(format!("{cmd:?} on {} failed: {}", m.id(), e))),
        }
    }

    /// Copies a local file onto `m`.
    pub async fn drop_file(&self, m: &Arc<dyn Machine>, local: &Path) -> TestFnResult {
        m.drop_file(local)
            .await
            .map_err(|e| self.fatal(format!("copying {} to {}: {}", local.display(), m.id(), e)))
    }
}

impl Deref for TestCluster {
    type Target = H;

    fn deref(&self) -> &H {
        &self.h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_exclusions() {
        let t = Target {
            architecture: Some("arm64".into()),
            distribution: None,
        };
        assert!(t.matches_any(&["arm64".to_string()]));
        assert!(!t.matches_any(&["s390x".to_string()]));
        assert!(!Target::default().matches_any(&["arm64".to_string()]));
    }
}
