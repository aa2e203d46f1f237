//! Single-file package extraction, memoised per `(package identity, entry name)` so that the
//! same file is never pulled out of its archive twice across the whole run (component C4's
//! `OnceCache` applied to component C1's `Package`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::cache::OnceCache;
use crate::package::{validate_relative_path, Package};

pub struct Extractor {
    cache: OnceCache<(String, String), PathBuf>,
    extract_root: PathBuf,
}

impl Extractor {
    pub fn new(extract_root: impl Into<PathBuf>) -> Self {
        Extractor {
            cache: OnceCache::new(),
            extract_root: extract_root.into(),
        }
    }

    /// Extract `name` from `pkg` to a stable on-disk path and return it, doing the actual I/O at
    /// most once per `(pkg.full_name(), name)` for the lifetime of this `Extractor`.
    pub fn extract(&self, pkg: &dyn Package, name: &str) -> Result<PathBuf> {
        let key = (pkg.full_name(), name.to_string());
        self.cache.get_or_compute(key, || self.extract_uncached(pkg, name))
    }

    fn extract_uncached(&self, pkg: &dyn Package, name: &str) -> Result<PathBuf> {
        validate_relative_path(name)?;
        let entry = pkg
            .entry(name)
            .with_context(|| format!("entry not found: {name} in {}", pkg.full_name()))?;

        let target_dir = self.extract_root.join(pkg.full_name()).join(pkg.version());
        let target_path = target_dir.join(archive_relative_path(name));
        if let Some(parent) = target_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create extract dir: {}", parent.display()))?;
        }

        let data = pkg.open_bytes(name)?;
        crate::io_util::safe_write_bytes(&target_path, &data)?;
        set_mtime(&target_path, entry.mtime)?;

        Ok(target_path)
    }
}

fn archive_relative_path(name: &str) -> PathBuf {
    PathBuf::from(name.replace('\\', "/"))
}

#[cfg(unix)]
fn set_mtime(path: &Path, mtime: i64) -> Result<()> {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    let time = if mtime >= 0 {
        UNIX_EPOCH + Duration::from_secs(mtime as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs((-mtime) as u64)
    };
    filetime::set_file_mtime(path, filetime::FileTime::from_system_time(time))
        .with_context(|| format!("failed to set mtime on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mtime(_path: &Path, _mtime: i64) -> Result<()> {
    Ok(())
}
