//! Path utilities for wmhub
//!
//! XDG Base Directory compliant locations for runtime state and logs, plus
//! discovery of the window manager's IPC socket.

use std::path::PathBuf;

use directories::ProjectDirs;

use crate::error::{HubError, Result};

/// Application identifier for XDG directories
const APP_NAME: &str = "wmhub";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Get the runtime directory
///
/// Location: `$XDG_RUNTIME_DIR/wmhub` or `/tmp/wmhub-$UID`
pub fn runtime_dir() -> PathBuf {
    if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg_runtime).join(APP_NAME)
    } else {
        // Fallback to /tmp with UID for security
        // SAFETY: getuid() is always safe to call
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
    }
}

/// Get the state directory
///
/// Location: `$XDG_STATE_HOME/wmhub` or `~/.local/state/wmhub`
pub fn state_dir() -> PathBuf {
    project_dirs()
        .and_then(|p| p.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(runtime_dir)
}

/// Get the log directory
///
/// Location: `$XDG_STATE_HOME/wmhub/log`
pub fn log_dir() -> PathBuf {
    state_dir().join("log")
}

/// Discover the window manager's IPC socket path
///
/// Checks `$I3SOCK` then `$SWAYSOCK`, then asks the window manager itself
/// via `i3 --get-socketpath`.
pub fn wm_socket_path() -> Result<PathBuf> {
    for var in ["I3SOCK", "SWAYSOCK"] {
        if let Ok(path) = std::env::var(var) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
    }
    let output = std::process::Command::new("i3")
        .arg("--get-socketpath")
        .output()
        .map_err(|e| HubError::config(format!("failed to run i3 --get-socketpath: {}", e)))?;
    if !output.status.success() {
        return Err(HubError::config("i3 --get-socketpath exited with failure"));
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() {
        return Err(HubError::config("i3 --get-socketpath returned nothing"));
    }
    Ok(PathBuf::from(path))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &PathBuf) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_dir_ends_with_app_name() {
        let dir = runtime_dir();
        let s = dir.to_string_lossy();
        assert!(s.contains(APP_NAME));
    }

    #[test]
    fn test_log_dir_under_state_dir() {
        assert!(log_dir().starts_with(state_dir()));
        assert!(log_dir().ends_with("log"));
    }

    #[test]
    fn test_ensure_dir_creates() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        // Idempotent
        ensure_dir(&nested).unwrap();
    }
}
