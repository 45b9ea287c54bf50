//! Locating the proxy-core executable

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Directory searched when none is given
pub const DEFAULT_CORE_DIR: &str = "lib";

/// File name prefix of the proxy-core executable
pub const DEFAULT_CORE_PREFIX: &str = "clash";

/// Find exactly one executable in `dir` whose name starts with `prefix`
///
/// The candidate must pass a `-v` self check; a binary built for another
/// platform fails here instead of at the first instance start.
pub async fn locate_executable(dir: &Path, prefix: &str) -> Result<PathBuf> {
    let candidates = find_candidates(dir, prefix);

    let candidate = match candidates.as_slice() {
        [] => {
            return Err(Error::ExecutableNotFound {
                dir: dir.to_path_buf(),
                prefix: prefix.to_string(),
            })
        }
        [only] => only.clone(),
        _ => {
            return Err(Error::AmbiguousExecutable {
                dir: dir.to_path_buf(),
                candidates,
            })
        }
    };

    let path = candidate.canonicalize().unwrap_or(candidate);
    self_check(&path).await?;
    info!(path = %path.display(), "using proxy core");
    Ok(path)
}

fn find_candidates(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(prefix))
        })
        .collect();
    candidates.sort();
    candidates
}

async fn self_check(path: &Path) -> Result<()> {
    let output = Command::new(path)
        .arg("-v")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::InvalidExecutable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(Error::InvalidExecutable {
            path: path.to_path_buf(),
            reason: format!("`-v` exited with {}", output.status),
        });
    }

    debug!(
        version = %String::from_utf8_lossy(&output.stdout).trim(),
        "proxy core self check passed"
    );
    Ok(())
}
