//! Small helpers shared across modules.

use std::path::PathBuf;

/// Resolve the user's home directory from `$HOME`.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Expand a leading `~` to the home directory.
///
/// - `"~"` → `"/home/user"`
/// - `"~/.kube/config"` → `"/home/user/.kube/config"`
/// - Anything else (including `~other`) passes through unchanged.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = home_dir() {
            if path == "~" {
                return home;
            }
            return home.join(&path[2..]);
        }
    }
    PathBuf::from(path)
}
