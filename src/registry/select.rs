//! Filtering the registry down to the tests that apply to one target.

use std::collections::BTreeMap;
use std::sync::Arc;

use glob::Pattern;

use super::{Flag, Registry, TestDescriptor, Version};

/// Tests chosen for one invocation, keyed by name.
pub type RunnableSet = BTreeMap<String, Arc<TestDescriptor>>;

/// Error returned when selection cannot be performed.
#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("invalid test pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// What the caller is asking to run, and where.
#[derive(Debug, Clone)]
pub struct Criteria {
    /// Glob matched against test names. A pattern equal to a test name is an
    /// exact request and bypasses the manual and version filters.
    pub pattern: String,
    pub platform: String,
    pub architecture: Option<String>,
    pub distribution: Option<String>,
    /// OS version of the target; zero when unknown.
    pub version: Version,
    /// `tag` requires the tag, `!tag` excludes it.
    pub tags: Vec<String>,
    /// When false, tests flagged [`Flag::RequiresInternet`] are dropped.
    pub allow_net: bool,
}

impl Criteria {
    pub fn new(pattern: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            platform: platform.into(),
            architecture: None,
            distribution: None,
            version: Version::zero(),
            tags: Vec::new(),
            allow_net: true,
        }
    }

    pub fn with_architecture(mut self, arch: impl Into<String>) -> Self {
        self.architecture = Some(arch.into());
        self
    }

    pub fn with_distribution(mut self, distro: impl Into<String>) -> Self {
        self.distribution = Some(distro.into());
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn without_net(mut self) -> Self {
        self.allow_net = false;
        self
    }

    fn is_exact(&self, name: &str) -> bool {
        self.pattern == name
    }

    fn wanted_tags(&self) -> impl Iterator<Item = &str> {
        self.tags
            .iter()
            .filter(|t| !t.starts_with('!'))
            .map(String::as_str)
    }

    fn unwanted_tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().filter_map(|t| t.strip_prefix('!'))
    }
}

/// Returns the descriptors from `registry` that should run for `criteria`.
///
/// An empty result is not an error.
pub fn select(registry: &Registry, criteria: &Criteria) -> Result<RunnableSet, SelectError> {
    let pattern = Pattern::new(&criteria.pattern).map_err(|source| SelectError::Pattern {
        pattern: criteria.pattern.clone(),
        source,
    })?;

    let mut set = RunnableSet::new();
    for desc in registry.iter() {
        let exact = criteria.is_exact(&desc.name);
        if !exact && !pattern.matches(&desc.name) {
            continue;
        }
        if accepts(desc, criteria, exact) {
            set.insert(desc.name.clone(), desc.clone());
        }
    }
    Ok(set)
}

/// Returns `true` when the set contains a sweep-selected test whose version
/// range is bounded, so the target's OS version must be known.
pub fn needs_version_probe(set: &RunnableSet, pattern: &str) -> bool {
    set.values()
        .any(|d| d.name != pattern && d.has_version_range())
}

fn accepts(desc: &TestDescriptor, criteria: &Criteria, exact: bool) -> bool {
    if desc.manual && !exact {
        return false;
    }

    if !exact
        && criteria
            .version
            .outside_range(&desc.min_version, &desc.end_version)
    {
        return false;
    }

    if !allowed(&criteria.platform, &desc.platforms, &desc.exclude_platforms) {
        return false;
    }

    if let Some(arch) = &criteria.architecture {
        if !allowed(arch, &desc.architectures, &desc.exclude_architectures) {
            return false;
        }
    }

    if let Some(distro) = &criteria.distribution {
        if !allowed(distro, &desc.distros, &desc.exclude_distros) {
            return false;
        }
    }

    if !criteria.allow_net && desc.has_flag(Flag::RequiresInternet) {
        return false;
    }

    tags_accept(desc, criteria, exact)
}

fn tags_accept(desc: &TestDescriptor, criteria: &Criteria, exact: bool) -> bool {
    if criteria
        .unwanted_tags()
        .any(|t| desc.tags.iter().any(|d| d == t))
    {
        return false;
    }

    if let Some(required) = &desc.required_tag {
        if !exact && !criteria.wanted_tags().any(|t| t == required) {
            return false;
        }
    }

    let mut wanted = criteria.wanted_tags().peekable();
    if wanted.peek().is_none() {
        return true;
    }
    wanted.any(|t| desc.tags.iter().any(|d| d == t) || desc.required_tag.as_deref() == Some(t))
}

fn allowed(target: &str, allow: &[String], deny: &[String]) -> bool {
    (allow.is_empty() || allow.iter().any(|a| a == target)) && !deny.iter().any(|d| d == target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TestDescriptor;

    fn desc(name: &str) -> TestDescriptor {
        TestDescriptor::new(name, |_c| async { Ok(()) })
    }

    fn registry(descs: Vec<TestDescriptor>) -> Registry {
        let mut r = Registry::new();
        for d in descs {
            r.register(d).unwrap();
        }
        r
    }

    fn names(set: &RunnableSet) -> Vec<&str> {
        set.keys().map(String::as_str).collect()
    }

    #[test]
    fn test_manual_only_on_exact_name() {
        let r = registry(vec![desc("coreos.manual.foo").manual(), desc("coreos.basic")]);

        let sweep = select(&r, &Criteria::new("*", "qemu")).unwrap();
        assert_eq!(names(&sweep), ["coreos.basic"]);

        let exact = select(&r, &Criteria::new("coreos.manual.foo", "qemu")).unwrap();
        assert_eq!(names(&exact), ["coreos.manual.foo"]);
    }

    #[test]
    fn test_version_range_only_filters_sweeps() {
        let r = registry(vec![
            desc("old.only").with_version_range(Version::zero(), Version::new([30])),
            desc("any"),
        ]);
        let version = Version::new([39]);

        let sweep = select(&r, &Criteria::new("*", "qemu").with_version(version.clone())).unwrap();
        assert_eq!(names(&sweep), ["any"]);

        let exact = select(&r, &Criteria::new("old.only", "qemu").with_version(version)).unwrap();
        assert_eq!(names(&exact), ["old.only"]);

        // unknown version never filters
        let unknown = select(&r, &Criteria::new("*", "qemu")).unwrap();
        assert_eq!(names(&unknown), ["any", "old.only"]);
    }

    #[test]
    fn test_platform_allow_and_exclude() {
        let r = registry(vec![
            desc("aws.only").with_platforms(["aws"]),
            desc("not.qemu").excluding_platforms(["qemu"]),
            desc("anywhere"),
        ]);

        let qemu = select(&r, &Criteria::new("*", "qemu")).unwrap();
        assert_eq!(names(&qemu), ["anywhere"]);

        let aws = select(&r, &Criteria::new("*", "aws")).unwrap();
        assert_eq!(names(&aws), ["anywhere", "aws.only", "not.qemu"]);

        // exact requests still honour platform restrictions
        let exact = select(&r, &Criteria::new("aws.only", "qemu")).unwrap();
        assert!(exact.is_empty());
    }

    #[test]
    fn test_architecture_and_distribution() {
        let r = registry(vec![
            desc("x86").with_architectures(["x86_64"]),
            desc("no.s390x").excluding_architectures(["s390x"]),
            desc("fcos").with_distros(["fcos"]),
            desc("not.rhcos").excluding_distros(["rhcos"]),
        ]);

        let c = Criteria::new("*", "qemu")
            .with_architecture("s390x")
            .with_distribution("rhcos");
        assert!(select(&r, &c).unwrap().is_empty());

        let c = Criteria::new("*", "qemu")
            .with_architecture("x86_64")
            .with_distribution("fcos");
        assert_eq!(names(&select(&r, &c).unwrap()), ["fcos", "no.s390x", "not.rhcos", "x86"]);

        // no target architecture or distribution means no restriction
        assert_eq!(select(&r, &Criteria::new("*", "qemu")).unwrap().len(), 4);
    }

    #[test]
    fn test_glob_pattern() {
        let r = registry(vec![desc("basic.ssh"), desc("basic.native"), desc("net.ping")]);
        let set = select(&r, &Criteria::new("basic.*", "local")).unwrap();
        assert_eq!(names(&set), ["basic.native", "basic.ssh"]);

        let none = select(&r, &Criteria::new("nothing.*", "local")).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_bad_pattern_is_error() {
        let r = registry(vec![desc("a")]);
        let err = select(&r, &Criteria::new("[", "local")).unwrap_err();
        assert!(err.to_string().contains("invalid test pattern"));
    }

    #[test]
    fn test_tags_and_network() {
        let r = registry(vec![
            desc("net").with_tag("network").with_flag(Flag::RequiresInternet),
            desc("disk").with_tag("storage"),
            desc("secret").with_required_tag("special"),
        ]);

        let all = select(&r, &Criteria::new("*", "local")).unwrap();
        assert_eq!(names(&all), ["disk", "net"]);

        let storage = select(&r, &Criteria::new("*", "local").with_tags(["storage"])).unwrap();
        assert_eq!(names(&storage), ["disk"]);

        let not_net = select(&r, &Criteria::new("*", "local").with_tags(["!network"])).unwrap();
        assert_eq!(names(&not_net), ["disk"]);

        let offline = select(&r, &Criteria::new("*", "local").without_net()).unwrap();
        assert_eq!(names(&offline), ["disk"]);

        let special = select(&r, &Criteria::new("*", "local").with_tags(["special"])).unwrap();
        assert_eq!(names(&special), ["secret"]);

        let exact = select(&r, &Criteria::new("secret", "local")).unwrap();
        assert_eq!(names(&exact), ["secret"]);
    }

    #[test]
    fn test_needs_version_probe() {
        let r = registry(vec![
            desc("ranged").with_version_range(Version::new([36]), Version::zero()),
            desc("plain"),
        ]);

        let sweep = select(&r, &Criteria::new("*", "local")).unwrap();
        assert!(needs_version_probe(&sweep, "*"));

        let exact = select(&r, &Criteria::new("ranged", "local")).unwrap();
        assert!(!needs_version_probe(&exact, "ranged"));

        let plain = select(&r, &Criteria::new("plain", "local")).unwrap();
        assert!(!needs_version_probe(&plain, "p*"));
    }
}
