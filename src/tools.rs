//! Subprocess wrappers around the external `zstd` and `bsdiff` tools (component C3).
//!
//! Every entry point writes through [`crate::io_util::SafeWriter`]-style atomic output: the
//! subprocess is told to write to a temp path beside the real target, and only a successful exit
//! status causes the rename into place.

use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

use crate::config::Config;

const ZSTD_LEVEL: &str = "-22";

/// In-process bulk compression of a byte buffer (used for the manifest chunk, where round-
/// tripping through a subprocess and temp files would be pure overhead).
pub fn zstd_compress_bytes(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::encode_all(data, 22).context("failed to zstd-compress in-memory buffer")
}

/// `zstd --patch-from <orig> <new> -o <patchfile>`, atomically.
pub fn zstd_generate_patch(
    config: &Config,
    orig_file: &Path,
    new_file: &Path,
    patchfile: &Path,
) -> Result<()> {
    let temp = temp_sibling(patchfile);
    run_checked(
        Command::new(&config.zstd_executable)
            .args(["-q", "--ultra", ZSTD_LEVEL, "-f", "--patch-from"])
            .arg(orig_file)
            .arg(new_file)
            .arg("-o")
            .arg(&temp),
        "zstd patch generation",
    )?;
    std::fs::rename(&temp, patchfile).with_context(|| {
        format!(
            "failed to rename zstd patch {} to {}",
            temp.display(),
            patchfile.display()
        )
    })
}

/// `maa_bsdiff <orig> <new> <patchfile>`, atomically.
pub fn bsdiff_generate_patch(
    config: &Config,
    orig_file: &Path,
    new_file: &Path,
    patchfile: &Path,
) -> Result<()> {
    let temp = temp_sibling(patchfile);
    run_checked(
        Command::new(&config.bsdiff_executable)
            .arg(orig_file)
            .arg(new_file)
            .arg(&temp),
        "bsdiff patch generation",
    )?;
    std::fs::rename(&temp, patchfile).with_context(|| {
        format!(
            "failed to rename bsdiff patch {} to {}",
            temp.display(),
            patchfile.display()
        )
    })
}

/// Decompress a whole zstd frame held in memory, used when reading back a cached patch to embed
/// it in a chunk.
pub fn zstd_decompress_bytes(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(data).context("failed to zstd-decompress in-memory buffer")
}

fn run_checked(cmd: &mut Command, what: &str) -> Result<()> {
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to launch {what}"))?;
    if !output.status.success() {
        bail!(
            "{what} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(&format!(".tmp{:x}", std::process::id()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_compress_and_decompress_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let compressed = zstd_compress_bytes(&data).unwrap();
        let decompressed = zstd_decompress_bytes(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn temp_sibling_stays_in_same_directory() {
        let path = Path::new("/some/dir/output.bin");
        let temp = temp_sibling(path);
        assert_eq!(temp.parent(), path.parent());
        assert!(temp.file_name().unwrap().to_string_lossy().starts_with("output.bin.tmp"));
    }
}
