//! convoy CLI - run cluster integration tests against OS images.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use convoy::config::{self, Config, PlatformConfig};
use convoy::orchestrator::{Orchestrator, Settings};
use convoy::platform::new_backend;
use convoy::registry::{Criteria, Registry, Version};
use convoy::report::print_summary;
use convoy::suites;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Parallel integration tests on short-lived clusters", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "convoy.toml")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests matching a glob pattern
    Run(RunArgs),

    /// List registered tests
    List {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration file
    Validate,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Glob matched against test names; an exact name also selects manual tests
    #[arg(default_value = "*")]
    pattern: String,

    /// Platform to run on
    #[arg(short, long, default_value = "local")]
    platform: String,

    /// Output directory, wiped at the start of the run
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Maximum number of tests running at once
    #[arg(long)]
    parallel: Option<usize>,

    /// Also write TAP results here
    #[arg(long)]
    tap: Option<PathBuf>,

    /// JUnit XML output path
    #[arg(long)]
    junit: Option<PathBuf>,

    /// JSON report output path
    #[arg(long)]
    json: Option<PathBuf>,

    /// Target architecture
    #[arg(long)]
    arch: Option<String>,

    /// Target distribution
    #[arg(long)]
    distro: Option<String>,

    /// OS version of the target; probed when needed and not given
    #[arg(long)]
    os_version: Option<Version>,

    /// Require a tag, or exclude it with a leading `!`
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Skip tests that need internet access
    #[arg(long)]
    no_net: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => run_tests(&cli.config, args).await,
        Commands::List { json } => list_tests(json),
        Commands::Validate => validate_config(&cli.config),
    }
}

async fn run_tests(config_path: &Path, args: RunArgs) -> Result<()> {
    let mut config = config::load_or_default(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let registry = suites::builtin()?;
    let backend = new_backend(&args.platform, &config)?;
    info!(platform = %backend.name(), "Using platform");

    let settings = Settings::from_config(&config);
    let output_dir = settings.output_dir.clone();
    let result = Orchestrator::new(backend, settings)
        .run(&registry, criteria(&args, &config))
        .await?;

    print_summary(&result);
    let verdict = if result.success() { "PASS" } else { "FAIL" };
    println!("{verdict}, output in {}", output_dir.display());
    std::process::exit(result.exit_code());
}

fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(dir) = &args.output_dir {
        config.convoy.output_dir = dir.clone();
    }
    if let Some(parallel) = args.parallel {
        config.convoy.parallel = parallel;
    }
    if let Some(arch) = &args.arch {
        config.convoy.architecture = Some(arch.clone());
    }
    if let Some(distro) = &args.distro {
        config.convoy.distribution = Some(distro.clone());
    }
    if args.tap.is_some() {
        config.report.tap = args.tap.clone();
    }
    if args.junit.is_some() {
        config.report.junit = args.junit.clone();
    }
    if args.json.is_some() {
        config.report.json = args.json.clone();
    }
}

fn criteria(args: &RunArgs, config: &Config) -> Criteria {
    let mut criteria = Criteria::new(&args.pattern, &args.platform).with_tags(args.tags.clone());
    if let Some(arch) = &config.convoy.architecture {
        criteria = criteria.with_architecture(arch);
    }
    if let Some(distro) = &config.convoy.distribution {
        criteria = criteria.with_distribution(distro);
    }
    if let Some(version) = &args.os_version {
        criteria = criteria.with_version(version.clone());
    }
    if args.no_net {
        criteria = criteria.without_net();
    }
    criteria
}

#[derive(Serialize)]
struct ListedTest<'a> {
    name: &'a str,
    description: &'a str,
    cluster_size: usize,
    platforms: &'a [String],
    exclude_platforms: &'a [String],
    manual: bool,
    native_funcs: Vec<&'a str>,
}

fn list_tests(json: bool) -> Result<()> {
    let registry: Registry = suites::builtin()?;
    let tests: Vec<ListedTest<'_>> = registry
        .iter()
        .map(|d| ListedTest {
            name: &d.name,
            description: &d.description,
            cluster_size: d.cluster_size,
            platforms: &d.platforms,
            exclude_platforms: &d.exclude_platforms,
            manual: d.manual,
            native_funcs: d.native_func_names().collect(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&tests)?);
        return Ok(());
    }

    println!("{:<24} {:<12} {}", "Test Name", "Platforms", "Description");
    for t in &tests {
        let platforms = if t.platforms.is_empty() {
            "all".to_string()
        } else {
            t.platforms.join(",")
        };
        let manual = if t.manual { " (manual)" } else { "" };
        println!("{:<24} {:<12} {}{}", t.name, platforms, t.description, manual);
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_or_default(config_path).and_then(|c| c.validate().map(|()| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Parallel: {}", config.convoy.parallel);
    println!("  Output dir: {}", config.convoy.output_dir.display());
    println!(
        "  SSH retries: {} x {}ms",
        config.retry.ssh_attempts, config.retry.ssh_delay_ms
    );
    println!("Platforms:");
    for name in config.platform_names() {
        let kind = match config.platform(&name) {
            Some(PlatformConfig::Local(_)) => "local",
            Some(PlatformConfig::Command(_)) => "command",
            None => "unknown",
        };
        println!("  {name} ({kind})");
    }
    Ok(())
}
