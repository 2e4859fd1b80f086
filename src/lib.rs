//! convoy: parallel integration tests on short-lived clusters of OS images.
//!
//! A run selects tests from a [`Registry`], gives each one its own cluster
//! from a pluggable [`Backend`], and drives the test bodies through a
//! nested, bounded-parallel test tree.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Registry**: Test descriptors and the selector that filters them
//! - **Harness**: The parallel test tree with fail-fast and skip semantics
//! - **Orchestrator**: Cluster lifecycle and native-function dispatch
//! - **Platform**: Backends that provision clusters and machines
//! - **Worker**: Bounded fan-out across machines with first-error capture
//! - **Pending / Retry**: Polling and retry helpers for slow infrastructure
//! - **Report**: TAP, JSON and JUnit XML results
//!
//! # Example
//!
//! ```no_run
//! use convoy::config::load_or_default;
//! use convoy::orchestrator::{Orchestrator, Settings};
//! use convoy::platform::new_backend;
//! use convoy::registry::Criteria;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_or_default(std::path::Path::new("convoy.toml"))?;
//!     let backend = new_backend("local", &config)?;
//!     let result = Orchestrator::new(backend, Settings::from_config(&config))
//!         .run(&convoy::suites::builtin()?, Criteria::new("basic.*", "local"))
//!         .await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod bootconf;
pub mod config;
pub mod harness;
pub mod orchestrator;
pub mod pending;
pub mod platform;
pub mod registry;
pub mod report;
pub mod retry;
pub mod suites;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use harness::{H, RunResult, TestError, TestFnResult};
pub use orchestrator::{Orchestrator, TestCluster};
pub use platform::{Backend, Cluster, Machine};
pub use registry::{Registry, TestDescriptor};
pub use report::Reporter;
