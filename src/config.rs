//! Configuration loading for convoy.
//!
//! Configuration lives in a TOML file (`convoy.toml` by default). The file
//! is optional: without it every setting takes its default and only the
//! built-in `local` platform is available. Command-line flags override what
//! the file says.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or does
/// not match the schema.
///
/// # Example
///
/// ```no_run
/// use convoy::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("convoy.toml"))?;
/// println!("Parallel: {}", config.convoy.parallel);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// ```
/// use convoy::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [convoy]
///     parallel = 4
///
///     [platforms.dev]
///     type = "local"
/// "#)?;
///
/// assert_eq!(config.convoy.parallel, 4);
/// assert!(config.platforms.contains_key("dev"));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads `path` if it exists, otherwise returns the defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

/// Expands a leading `~` in a configured path.
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

impl Config {
    /// The configuration of platform `name`. `local` is always available.
    pub fn platform(&self, name: &str) -> Option<PlatformConfig> {
        match self.platforms.get(name) {
            Some(p) => Some(p.clone()),
            None if name == "local" => Some(PlatformConfig::Local(LocalPlatformConfig::default())),
            None => None,
        }
    }

    /// Names of every usable platform, sorted.
    pub fn platform_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.platforms.keys().cloned().collect();
        if !self.platforms.contains_key("local") {
            names.push("local".to_string());
            names.sort();
        }
        names
    }

    /// Checks settings that deserialization alone cannot.
    pub fn validate(&self) -> Result<()> {
        if self.convoy.parallel == 0 {
            bail!("convoy.parallel must be at least 1");
        }
        for (name, platform) in &self.platforms {
            if let PlatformConfig::Command(cmd) = platform {
                for (field, template) in [
                    ("create_command", &cmd.create_command),
                    ("exec_command", &cmd.exec_command),
                    ("copy_command", &cmd.copy_command),
                    ("destroy_command", &cmd.destroy_command),
                ] {
                    if template.trim().is_empty() {
                        bail!("platforms.{name}.{field} must not be empty");
                    }
                }
                if !cmd.exec_command.contains("{command}") {
                    bail!("platforms.{name}.exec_command must contain {{command}}");
                }
                if !cmd.copy_command.contains("{local_path}") {
                    bail!("platforms.{name}.copy_command must contain {{local_path}}");
                }
            }
        }
        Ok(())
    }
}
