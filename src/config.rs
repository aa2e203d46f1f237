//! Run configuration (component A1).
//!
//! The original tooling resolved its external tool paths and package identity via bare module
//! globals read once at import time. An owned struct built once in `main` and threaded through is
//! the equivalent here: same resolution rules, no global mutable state.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// Resolved paths and environment-derived settings for one run. Directory layout mirrors the
/// original's hardcoded module-level constants (`patch_cache_dir`, `temp_extract_dir`,
/// `chunk_temp_dir`, `outdir`) — this crate keeps them fixed relative to the working directory
/// rather than making them independently configurable, since nothing in this system's interface
/// calls for relocating them.
#[derive(Debug, Clone)]
pub struct Config {
    pub zstd_executable: String,
    pub bsdiff_executable: String,
    pub package_name: String,
    pub package_variant: Option<String>,
    pub testdata_dir: PathBuf,
    pub patch_cache_dir: PathBuf,
    pub extract_dir: PathBuf,
    pub chunk_temp_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Config {
    /// Resolve executables and package identity from the environment, and fail fast — matching
    /// the original's module-level `shutil.which` checks — rather than deferring the error to
    /// first subprocess use.
    pub fn from_env() -> Result<Self> {
        let zstd_executable = std::env::var("ZSTD").unwrap_or_else(|_| "zstd".to_string());
        let bsdiff_executable =
            std::env::var("MAA_BSDIFF").unwrap_or_else(|_| "maa_bsdiff".to_string());

        which(&zstd_executable)
            .ok_or_else(|| anyhow::anyhow!("ZSTD executable not found: {zstd_executable}"))?;
        which(&bsdiff_executable)
            .ok_or_else(|| anyhow::anyhow!("MAA_BSDIFF executable not found: {bsdiff_executable}"))?;

        let package_name = std::env::var("MAA_PACKAGE_NAME").unwrap_or_else(|_| "MAA".to_string());
        let package_variant = match std::env::var("MAA_PACKAGE_VARIANT") {
            Ok(v) if v.is_empty() => None,
            Ok(v) => Some(v),
            Err(_) => Some("win-x64".to_string()),
        };

        Ok(Config {
            zstd_executable,
            bsdiff_executable,
            package_name,
            package_variant,
            testdata_dir: PathBuf::from("testdata"),
            patch_cache_dir: PathBuf::from("cache/patch_cache"),
            extract_dir: PathBuf::from("cache/pkg_extract"),
            chunk_temp_dir: PathBuf::from("output/temp"),
            output_dir: PathBuf::from("output"),
        })
    }
}

/// A minimal `PATH`-search, equivalent to `shutil.which` for our purposes: we only need to know
/// an executable exists somewhere searchable, not its resolved absolute path.
fn which(executable: &str) -> Option<PathBuf> {
    let candidate = Path::new(executable);
    if candidate.is_absolute() || candidate.components().count() > 1 {
        return if candidate.is_file() {
            Some(candidate.to_path_buf())
        } else {
            None
        };
    }

    let path_var = std::env::var_os("PATH")?;
    let exe_names: Vec<String> = if cfg!(windows) {
        ["", ".exe", ".cmd", ".bat"]
            .iter()
            .map(|ext| format!("{executable}{ext}"))
            .collect()
    } else {
        vec![executable.to_string()]
    };

    for dir in std::env::split_paths(&path_var) {
        for name in &exe_names {
            let full = dir.join(name);
            if full.is_file() {
                return Some(full);
            }
        }
    }
    None
}

/// Validate that both required env-overridable executables are resolvable, without constructing
/// a full [`Config`]. Used by tests that only care about the failure path.
pub fn require_executable(name: &str) -> Result<()> {
    if which(name).is_none() {
        bail!("required executable not found on PATH: {name}");
    }
    Ok(())
}
