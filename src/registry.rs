//! Catalog of registered cluster tests.
//!
//! A [`Registry`] is built once at startup by explicit [`Registry::register`]
//! calls and then shared read-only with the selector and the orchestrator.
//! Descriptors are immutable after registration and are handed around as
//! `Arc<TestDescriptor>` so spawned test tasks can own them.
//!
//! ```
//! use convoy::registry::{Registry, TestDescriptor};
//!
//! let mut registry = Registry::new();
//! registry
//!     .register(TestDescriptor::new("basic.ping", |_c| async { Ok(()) }).with_cluster_size(1))
//!     .unwrap();
//!
//! assert!(registry.get("basic.ping").is_some());
//! ```

pub mod select;
pub mod version;

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::bootconf::UserData;
use crate::harness::TestFnResult;
use crate::orchestrator::TestCluster;

pub use select::{Criteria, RunnableSet, SelectError, needs_version_probe, select};
pub use version::{Version, VersionError};

/// Entry point of a cluster test.
pub type TestFn = Arc<dyn Fn(TestCluster) -> BoxFuture<'static, TestFnResult> + Send + Sync>;

/// Payload-side body of a native function. Runs on the target machine inside
/// `convoy-agent`.
pub type NativeFn = fn() -> anyhow::Result<()>;

/// Errors raised while populating a [`Registry`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("test {0:?} already registered")]
    Duplicate(String),

    #[error("test {test:?} declares native function {func:?} more than once")]
    DuplicateNative { test: String, func: String },

    #[error("test name must not be empty")]
    EmptyName,
}

/// Capability requirements a test declares about its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// The test reaches out to the internet and is skipped with `--no-net`.
    RequiresInternet,
    /// Do not fail the test when a machine console shows an emergency shell.
    NoEmergencyShellCheck,
}

/// A remotely invocable function shipped inside the payload binary.
#[derive(Clone)]
pub struct NativeFunc {
    pub func: NativeFn,
    /// Architectures or distributions on which this function is not offered.
    pub exclusions: Vec<String>,
}

impl NativeFunc {
    pub fn new(func: NativeFn) -> Self {
        Self {
            func,
            exclusions: Vec::new(),
        }
    }

    pub fn excluding<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusions.extend(targets.into_iter().map(Into::into));
        self
    }

    /// Returns `true` if the function is excluded on `target`.
    pub fn excluded_on(&self, target: &str) -> bool {
        self.exclusions.iter().any(|e| e == target)
    }
}

/// Immutable description of one registrable test.
#[derive(Clone)]
pub struct TestDescriptor {
    pub name: String,
    pub description: String,
    pub run: TestFn,
    /// Machines created before `run` is called; 0 means the test provisions
    /// its own.
    pub cluster_size: usize,
    /// Native functions in declaration order.
    pub native_funcs: Vec<(String, NativeFunc)>,
    pub user_data: Option<UserData>,

    pub platforms: Vec<String>,
    pub exclude_platforms: Vec<String>,
    pub architectures: Vec<String>,
    pub exclude_architectures: Vec<String>,
    pub distros: Vec<String>,
    pub exclude_distros: Vec<String>,

    /// Inclusive lower bound; zero disables it.
    pub min_version: Version,
    /// Exclusive upper bound; zero disables it.
    pub end_version: Version,

    /// Only runs when requested by exact name.
    pub manual: bool,
    /// Skip remaining sub-tests once one has failed.
    pub fail_fast: bool,

    pub tags: Vec<String>,
    /// The test only runs when this tag is explicitly requested.
    pub required_tag: Option<String>,
    pub flags: Vec<Flag>,
    pub timeout: Option<Duration>,
}

impl TestDescriptor {
    /// Creates a descriptor with no restrictions and an empty cluster.
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(TestCluster) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestFnResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            run: Arc::new(move |c| Box::pin(run(c))),
            cluster_size: 0,
            native_funcs: Vec::new(),
            user_data: None,
            platforms: Vec::new(),
            exclude_platforms: Vec::new(),
            architectures: Vec::new(),
            exclude_architectures: Vec::new(),
            distros: Vec::new(),
            exclude_distros: Vec::new(),
            min_version: Version::zero(),
            end_version: Version::zero(),
            manual: false,
            fail_fast: false,
            tags: Vec::new(),
            required_tag: None,
            flags: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_cluster_size(mut self, size: usize) -> Self {
        self.cluster_size = size;
        self
    }

    pub fn with_native(mut self, name: impl Into<String>, func: NativeFunc) -> Self {
        self.native_funcs.push((name.into(), func));
        self
    }

    pub fn with_user_data(mut self, user_data: impl Into<UserData>) -> Self {
        self.user_data = Some(user_data.into());
        self
    }

    pub fn with_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms.extend(platforms.into_iter().map(Into::into));
        self
    }

    pub fn excluding_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_platforms
            .extend(platforms.into_iter().map(Into::into));
        self
    }

    pub fn with_architectures<I, S>(mut self, arches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.architectures.extend(arches.into_iter().map(Into::into));
        self
    }

    pub fn excluding_architectures<I, S>(mut self, arches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_architectures
            .extend(arches.into_iter().map(Into::into));
        self
    }

    pub fn with_distros<I, S>(mut self, distros: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.distros.extend(distros.into_iter().map(Into::into));
        self
    }

    pub fn excluding_distros<I, S>(mut self, distros: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_distros
            .extend(distros.into_iter().map(Into::into));
        self
    }

    /// Restricts the test to OS versions in `[min, end)`.
    pub fn with_version_range(mut self, min: Version, end: Version) -> Self {
        self.min_version = min;
        self.end_version = end;
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_required_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tag = Some(tag.into());
        self
    }

    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flags.push(flag);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Returns `true` if either end of the version range is bounded.
    pub fn has_version_range(&self) -> bool {
        !self.min_version.is_zero() || !self.end_version.is_zero()
    }

    pub fn native_func(&self, name: &str) -> Option<&NativeFunc> {
        self.native_funcs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }

    pub fn native_func_names(&self) -> impl Iterator<Item = &str> {
        self.native_funcs.iter().map(|(n, _)| n.as_str())
    }
}

impl fmt::Debug for TestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDescriptor")
            .field("name", &self.name)
            .field("cluster_size", &self.cluster_size)
            .field(
                "native_funcs",
                &self.native_func_names().collect::<Vec<_>>(),
            )
            .field("platforms", &self.platforms)
            .field("manual", &self.manual)
            .field("fail_fast", &self.fail_fast)
            .finish_non_exhaustive()
    }
}

/// Append-only catalog of tests keyed by unique name.
#[derive(Debug, Default)]
pub struct Registry {
    tests: BTreeMap<String, Arc<TestDescriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor to the catalog.
    ///
    /// # Errors
    ///
    /// Fails if the name is empty, already registered, or if the descriptor
    /// declares the same native function twice. Nothing is inserted on error.
    pub fn register(&mut self, desc: TestDescriptor) -> Result<(), RegistryError> {
        if desc.name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.tests.contains_key(&desc.name) {
            return Err(RegistryError::Duplicate(desc.name));
        }

        let mut seen = HashSet::new();
        for name in desc.native_func_names() {
            if !seen.insert(name) {
                return Err(RegistryError::DuplicateNative {
                    test: desc.name.clone(),
                    func: name.to_string(),
                });
            }
        }

        self.tests.insert(desc.name.clone(), Arc::new(desc));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TestDescriptor>> {
        self.tests.get(name)
    }

    /// Iterates descriptors in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TestDescriptor>> {
        self.tests.values()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}
