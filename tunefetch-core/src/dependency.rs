//! Locating the external stream helper.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::config::{data_dir, AdvancedSettings};
use crate::error::DependencyError;

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of probing the configured helper with `--version`.
#[derive(Debug, Clone)]
pub struct HelperCheck {
    pub configured: PathBuf,
    pub resolved: Option<PathBuf>,
    pub version: Option<String>,
    pub problem: Option<String>,
}

impl HelperCheck {
    fn unavailable(configured: &Path, resolved: Option<PathBuf>, problem: impl Into<String>) -> Self {
        Self {
            configured: configured.to_path_buf(),
            resolved,
            version: None,
            problem: Some(problem.into()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.problem.is_none()
    }

    pub fn display_name(&self) -> String {
        self.resolved
            .as_deref()
            .unwrap_or(&self.configured)
            .display()
            .to_string()
    }
}

pub async fn check_helper(settings: &AdvancedSettings) -> Result<HelperCheck, DependencyError> {
    let configured = settings.helper_path.as_path();
    let Some(resolved) = resolve_binary(configured) else {
        return Ok(HelperCheck::unavailable(configured, None, "command not found"));
    };

    let mut command = Command::new(&resolved);
    command.arg("--version").kill_on_drop(true);

    let output = match timeout(VERSION_TIMEOUT, command.output()).await {
        Err(_) => {
            return Ok(HelperCheck::unavailable(
                configured,
                Some(resolved),
                "version check timed out",
            ))
        }
        Ok(Err(error)) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(HelperCheck::unavailable(configured, None, "command not found"))
        }
        Ok(Err(error)) => {
            return Err(DependencyError::Spawn {
                binary: resolved.display().to_string(),
                source: error,
            })
        }
        Ok(Ok(output)) => output,
    };

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        let problem = version_line(&stderr).unwrap_or("version check failed").to_string();
        return Ok(HelperCheck::unavailable(configured, Some(resolved), problem));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = version_line(&stdout)
        .or_else(|| version_line(&stderr))
        .map(str::to_string);

    Ok(HelperCheck {
        configured: configured.to_path_buf(),
        resolved: Some(resolved),
        version,
        problem: None,
    })
}

/// Finds the helper executable.
///
/// A candidate with more than one path component is taken literally. A bare
/// name is looked up next to the running executable, then in the `bin`
/// directory under the application data dir, then on `PATH`.
pub fn resolve_binary(candidate: &Path) -> Option<PathBuf> {
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let name = candidate.file_name()?;
    for dir in search_dirs() {
        #[cfg(target_os = "windows")]
        {
            let with_exe = dir.join(format!("{}.exe", name.to_string_lossy()));
            if with_exe.is_file() {
                return Some(with_exe);
            }
        }

        let path = dir.join(name);
        if path.is_file() {
            return Some(path);
        }
    }

    which::which(candidate).ok()
}

fn search_dirs() -> Vec<PathBuf> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    exe_dir.into_iter().chain([data_dir().join("bin")]).collect()
}

fn version_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}
