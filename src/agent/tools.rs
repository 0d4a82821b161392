//! Locating the `adb` and `scrcpy` binaries.

use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;
use which::which;

use crate::agent::config::Config;
use crate::error::ErrorCode;

pub const ADB: &str = "adb";
pub const SCRCPY: &str = "scrcpy";

const HOMEBREW_PREFIXES: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin"];

/// Resolved locations of both external binaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub adb: PathBuf,
    pub scrcpy: PathBuf,
}

/// Explicit path first, then `PATH`, then well-known install locations.
pub fn find_tool(tool: &str, explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        // A configured path is authoritative even when it is wrong.
        return path.is_file().then(|| path.to_path_buf());
    }

    if let Ok(path) = which(tool) {
        return Some(path);
    }

    fallback_locations(tool).into_iter().find(|candidate| candidate.is_file())
}

fn fallback_locations(tool: &str) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if tool == ADB {
        for root in android_sdk_roots() {
            candidates.push(root.join("platform-tools").join(ADB));
        }
    }
    for prefix in HOMEBREW_PREFIXES {
        candidates.push(Path::new(prefix).join(tool));
    }
    candidates
}

pub fn android_sdk_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    let mut push_root = |path: PathBuf| {
        if path.exists() && !roots.contains(&path) {
            roots.push(path);
        }
    };

    if let Ok(path) = env::var("ANDROID_HOME") {
        push_root(PathBuf::from(path));
    }
    if let Ok(path) = env::var("ANDROID_SDK_ROOT") {
        push_root(PathBuf::from(path));
    }
    if let Some(home) = dirs::home_dir() {
        push_root(home.join("Library/Android/sdk"));
        push_root(home.join("Android/Sdk"));
    }
    roots
}

pub fn find_adb(config: &Config) -> Result<PathBuf, ErrorCode> {
    let found = find_tool(ADB, config.adb_path.as_deref());
    debug!(?found, "adb lookup");
    found.ok_or(ErrorCode::MissingDependency)
}

pub fn find_scrcpy(config: &Config) -> Result<PathBuf, ErrorCode> {
    let found = find_tool(SCRCPY, config.scrcpy_path.as_deref());
    debug!(?found, "scrcpy lookup");
    found.ok_or(ErrorCode::MissingDependency)
}

/// Both binaries, or MissingDependency before any device is touched
pub fn require_toolchain(config: &Config) -> Result<Toolchain, ErrorCode> {
    Ok(Toolchain {
        adb: find_adb(config)?,
        scrcpy: find_scrcpy(config)?,
    })
}
