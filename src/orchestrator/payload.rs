//! Locating the native-function payload binary on the controller.

use std::path::{Path, PathBuf};

/// File name of the payload binary, on the controller and on the machine.
pub const AGENT_BINARY: &str = "convoy-agent";

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("{AGENT_BINARY} not found (searched: {})", format_searched(.searched))]
    NotFound { searched: Vec<PathBuf> },
}

fn format_searched(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Directories searched for the payload, most specific first.
pub fn candidate_dirs(extra: &[PathBuf], arch: Option<&str>) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = extra.to_vec();
    dirs.push(PathBuf::from("."));

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir.clone());
        if let Some(arch) = arch {
            dirs.push(exe_dir.join(arch));
        }
    }
    if let Some(arch) = arch {
        dirs.push(Path::new("/usr/lib/convoy").join(arch));
    }
    dirs
}

/// Returns the first `convoy-agent` found in `dirs`.
pub fn find_in(dirs: &[PathBuf]) -> Result<PathBuf, PayloadError> {
    dirs.iter()
        .map(|d| d.join(AGENT_BINARY))
        .find(|p| p.is_file())
        .ok_or_else(|| PayloadError::NotFound {
            searched: dirs.to_vec(),
        })
}

/// Finds the payload for `arch`, looking in `extra` before the default
/// locations.
pub fn find_payload(extra: &[PathBuf], arch: Option<&str>) -> Result<PathBuf, PayloadError> {
    find_in(&candidate_dirs(extra, arch))
}
