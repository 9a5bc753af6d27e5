//! Filesystem helpers used around experiment runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::core::errors::{KilnError, Result};

const MB: f64 = 1024.0 * 1024.0;

/// Output directories larger than this trigger a warning at run start.
const WARN_LIMIT_MB: f64 = 100.0;

/// Convert relative paths to absolute paths.
///
/// Entries whose value does not exist on disk are left untouched.
pub fn rel_to_abs_paths(paths: &HashMap<String, PathBuf>) -> HashMap<String, PathBuf> {
    paths
        .iter()
        .map(|(name, path)| {
            let resolved = if path.exists() && path.is_relative() {
                path.canonicalize().unwrap_or_else(|_| path.clone())
            } else {
                path.clone()
            };
            (name.clone(), resolved)
        })
        .collect()
}

/// All files under `path`, recursively.
pub fn collect_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.exists() {
        return Err(KilnError::configuration(format!(
            "{} does not exist",
            path.display()
        )));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| {
            KilnError::io(
                format!("walking {}", path.display()),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walkdir loop")),
            )
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Size of a file or directory in MB. Symlinks are not followed.
pub fn dir_size_mb(path: &Path) -> Result<f64> {
    let mut bytes = 0u64;
    if path.is_dir() {
        for file in collect_files(path)? {
            if let Ok(meta) = file.symlink_metadata() {
                if meta.file_type().is_file() {
                    bytes += meta.len();
                }
            }
        }
    } else {
        bytes = path
            .symlink_metadata()
            .map_err(|e| KilnError::io(format!("stat {}", path.display()), e))?
            .len();
    }
    Ok(bytes as f64 / MB)
}

/// Prepare the filesystem for a run: create the output directory and warn
/// if an existing one has grown large.
pub fn check_system_reqs(output_path: &Path) -> Result<()> {
    if output_path.exists() {
        let size = dir_size_mb(output_path)?;
        if size > WARN_LIMIT_MB {
            warn!(
                path = %output_path.display(),
                size_mb = size,
                "output directory is getting large; consider removing old runs"
            );
        }
    } else {
        std::fs::create_dir_all(output_path)
            .map_err(|e| KilnError::io(format!("create {}", output_path.display()), e))?;
    }
    Ok(())
}
