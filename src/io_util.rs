//! Safe atomic I/O and streaming hashing (component C2).

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use sha2::{Digest, Sha256};

/// `write_file(path, data)`: write the whole buffer atomically.
pub fn safe_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    let mut w = SafeWriter::create(path)?;
    w.write_all(data)?;
    w.finish()
}

/// A writer that scopes the acquisition of a temp file beside its target. On success, the
/// temp file atomically replaces the target; on any failure path (including a panic unwind),
/// `Drop` unlinks the temp file so no partial artifact is left behind.
pub struct SafeWriter {
    file: Option<BufWriter<File>>,
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
}

impl SafeWriter {
    pub fn create(final_path: impl Into<PathBuf>) -> Result<Self> {
        let final_path = final_path.into();
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        let temp_path = temp_path_for(&final_path);
        let file = File::create(&temp_path)
            .with_context(|| format!("failed to create temp file: {}", temp_path.display()))?;
        Ok(SafeWriter {
            file: Some(BufWriter::new(file)),
            temp_path: Some(temp_path),
            final_path,
        })
    }

    /// Finish writing: flush, close, and atomically rename into place.
    pub fn finish(mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().context("failed to flush temp file")?;
        }
        if let Some(temp_path) = self.temp_path.take() {
            std::fs::rename(&temp_path, &self.final_path).with_context(|| {
                format!(
                    "failed to rename {} to {}",
                    temp_path.display(),
                    self.final_path.display()
                )
            })?;
        }
        Ok(())
    }
}

impl Write for SafeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.as_mut().expect("write after finish").write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.file.as_mut().expect("write after finish").flush()
    }
}

impl Drop for SafeWriter {
    fn drop(&mut self) {
        if let Some(temp_path) = self.temp_path.take() {
            let _ = std::fs::remove_file(temp_path);
        }
    }
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let pid = std::process::id();
    let rand_suffix: u32 = rand::thread_rng().gen_range(0..=0x7FFF_FFFF);
    let mut name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(&format!(".tmp{pid:X}{rand_suffix:08X}"));
    final_path.with_file_name(name)
}

/// Stream-hash a file's contents with SHA-256, reading in 64 KiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;
    let mut reader = std::io::BufReader::with_capacity(65536, file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    loop {
        let n = reader
            .read(&mut buffer)
            .with_context(|| format!("failed to read file while hashing: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory buffer, for data that is already resident (e.g. the manifest chunk).
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Human-readable size, matching the original's `format_size`.
pub fn format_size(size: u64) -> String {
    let size = size as f64;
    if size < 1024.0 {
        return format!("{size:.0} B");
    }
    let size = size / 1024.0;
    if size < 1024.0 {
        return format!("{size:.1} KiB");
    }
    let size = size / 1024.0;
    if size < 1024.0 {
        return format!("{size:.1} MiB");
    }
    let size = size / 1024.0;
    format!("{size:.1} GiB")
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}
