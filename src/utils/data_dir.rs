//! Global data directory for logs and local state.
//!
//! Defaults to `~/.peerlink/` but can be overridden via `--data-dir`.
//! Initialized once at startup via `init()`.

use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const DEFAULT_DIR_NAME: &str = ".peerlink";

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Pick the data directory: `custom` if given, otherwise `~/.peerlink/`.
pub fn resolve(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => dirs::home_dir()
            .map(|home| home.join(DEFAULT_DIR_NAME))
            .context("no home directory found; pass --data-dir"),
    }
}

/// Resolve, create and install the global data directory.
pub fn init(custom: Option<&Path>) -> Result<&'static Path> {
    let dir = resolve(custom)?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create data directory {}", dir.display()))?;
    DATA_DIR
        .set(dir)
        .map_err(|_| anyhow!("data directory already initialized"))?;
    get().context("data directory not set")
}

/// The global data directory, if `init()` has run.
pub fn get() -> Option<&'static Path> {
    DATA_DIR.get().map(PathBuf::as_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_path_wins() {
        let p = Path::new("/tmp/peerlink-test");
        assert_eq!(resolve(Some(p)).unwrap(), p);
    }

    #[test]
    fn default_lives_under_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolve(None).unwrap(), home.join(".peerlink"));
        }
    }
}
