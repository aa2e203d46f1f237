//! Chunk builder (component C9).
//!
//! Builds the three kinds of tar chunk that go into a delta package: one per prior version's
//! patch base (binary patches plus replaced/added files), one "patch fallback" chunk carrying the
//! target-version bytes of every file any delta chunk patches, and one terminal "unchanged"
//! chunk. Intermediate chunks are written without the tar end-of-archive marker so the
//! amalgamator can concatenate their compressed bodies back-to-back; only the terminal chunk
//! carries a real EOF.

use std::collections::HashMap;
use std::io::Cursor;

use anyhow::{Context, Result};
use tar::{EntryType, Header};

use crate::extract::Extractor;
use crate::io_util::sha256_file;
use crate::manifest::{ChunkManifest, PatchFileRecord, PatchType};
use crate::package::Package;
use crate::patch_select::{CachedBinaryPatch, PatchFileKey};
use crate::planner::{FileActionRecord, PackageContentDiff};
use crate::tools;

fn base_header(size: u64) -> Header {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header
}

fn append_json(builder: &mut tar::Builder<Vec<u8>>, arcname: &str, value: &impl serde::Serialize) -> Result<()> {
    let bytes = serde_json::to_vec(value).context("failed to serialize chunk JSON")?;
    let mut header = base_header(bytes.len() as u64);
    builder
        .append_data(&mut header, arcname, Cursor::new(bytes))
        .with_context(|| format!("failed to append tar entry: {arcname}"))
}

fn append_package_entry(
    builder: &mut tar::Builder<Vec<u8>>,
    pkg: &dyn Package,
    name: &str,
) -> Result<()> {
    let entry = pkg
        .entry(name)
        .with_context(|| format!("entry not found: {name}"))?;
    let data = pkg.open_bytes(name)?;
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(entry.size);
    header.set_mode(entry.mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(entry.mtime.max(0) as u64);
    builder
        .append_data(&mut header, name, Cursor::new(data))
        .with_context(|| format!("failed to append tar entry: {name}"))
}

fn append_cached_file(builder: &mut tar::Builder<Vec<u8>>, arcname: &str, path: &std::path::Path) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("failed to read cached file: {}", path.display()))?;
    let mut header = base_header(data.len() as u64);
    builder
        .append_data(&mut header, arcname, Cursor::new(data))
        .with_context(|| format!("failed to append tar entry: {arcname}"))
}

/// One finished delta chunk: its manifest (embedded as JSON inside the tar, and also returned for
/// the human-readable report) plus the raw (uncompressed) tar bytes.
pub struct BuiltChunk {
    pub manifest: ChunkManifest,
    pub tar_bytes: Vec<u8>,
}

/// Build the tar for one prior version's patch base: `chunk_manifest.json`, every cached binary
/// patch payload this version needs, and every file it must receive wholesale (add/replace).
/// Written without an EOF marker.
pub fn create_delta_chunk(
    package_name: &str,
    latest_pkg: &dyn Package,
    pkgs: &HashMap<String, &dyn Package>,
    delta_record: &PackageContentDiff,
    patch_strategy: &HashMap<PatchFileKey, CachedBinaryPatch>,
    extractor: &Extractor,
) -> Result<BuiltChunk> {
    let patch_base = &delta_record.patch_base_version;
    let mut chunk_manifest = ChunkManifest {
        patch_base: patch_base.clone(),
        base: delta_record.base_version.clone(),
        remove_files: Vec::new(),
        patch_files: Vec::new(),
    };

    let mut builder = tar::Builder::new(Vec::new());
    let mut pending_files: Vec<(std::path::PathBuf, String)> = Vec::new();

    for action in &delta_record.actions {
        match action {
            FileActionRecord::RemoveFile(path) => {
                chunk_manifest.remove_files.push(path.clone());
            }
            FileActionRecord::PatchFile { from_version, path } => {
                let key = PatchFileKey {
                    from_version: from_version.clone(),
                    path: path.clone(),
                };
                let patch = patch_strategy
                    .get(&key)
                    .with_context(|| format!("no patch strategy chosen for {path} from {from_version}"))?;

                let old_file = extractor.extract(pkgs[from_version], path)?;
                let old_size = std::fs::metadata(&old_file)?.len();
                let old_hash = format!("sha256:{}", sha256_file(&old_file)?);

                let (new_size, new_hash) = if patch.patch_type == PatchType::Copy {
                    (old_size, old_hash.clone())
                } else {
                    let new_file = extractor.extract(pkgs[&patch.to_version], path)?;
                    let new_size = std::fs::metadata(&new_file)?.len();
                    let new_hash = format!("sha256:{}", sha256_file(&new_file)?);
                    (new_size, new_hash)
                };

                let archive_path = if let Some(cached_deltafile) = &patch.cached_deltafile {
                    let patch_hash = sha256_file(cached_deltafile)?;
                    let basename = std::path::Path::new(path)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.clone());
                    let archive_path =
                        format!(".maa_update/temp/{basename}.{}.{}", &patch_hash[..8], patch.patch_type);
                    pending_files.push((cached_deltafile.clone(), archive_path.clone()));
                    archive_path
                } else {
                    String::new()
                };

                chunk_manifest.patch_files.push(PatchFileRecord {
                    file: path.clone(),
                    patch: archive_path,
                    patch_type: patch.patch_type,
                    old_hash,
                    old_size,
                    new_version: patch.to_version.clone(),
                    new_hash,
                    new_size,
                });
            }
            FileActionRecord::AddFile(_) | FileActionRecord::ReplaceFile(_) => {}
        }
    }

    let manifest_arcname =
        format!(".maa_update/delta/{package_name}/{patch_base}/chunk_manifest.json");
    append_json(&mut builder, &manifest_arcname, &chunk_manifest)?;

    for (filename, archive_path) in &pending_files {
        append_cached_file(&mut builder, archive_path, filename)?;
    }

    for action in &delta_record.actions {
        match action {
            FileActionRecord::AddFile(path) | FileActionRecord::ReplaceFile(path) => {
                append_package_entry(&mut builder, latest_pkg, path)?;
            }
            _ => {}
        }
    }

    // Deliberately not calling finish(): into_inner() flushes the buffered entries without
    // writing the two zero-filled end-of-archive blocks, so this chunk's bytes can be
    // concatenated with the next one downstream.
    let tar_bytes = builder.into_inner().context("failed to finalize delta chunk tar buffer")?;

    Ok(BuiltChunk {
        manifest: chunk_manifest,
        tar_bytes,
    })
}

/// Build the "patch fallback" chunk: the target-version bytes of every file that any delta chunk
/// patches, deduplicated by path. A consumer falls back to this chunk plus a plain copy if it
/// cannot apply a binary patch (corrupted cache, unsupported tool version, etc). Written without
/// an EOF marker.
pub fn create_patch_fallback_chunk(
    latest_pkg: &dyn Package,
    patch_strategy: &HashMap<PatchFileKey, CachedBinaryPatch>,
) -> Result<Vec<u8>> {
    let mut patched_files: Vec<&str> = patch_strategy.keys().map(|k| k.path.as_str()).collect();
    patched_files.sort_unstable();
    patched_files.dedup();

    let mut builder = tar::Builder::new(Vec::new());
    for path in patched_files {
        append_package_entry(&mut builder, latest_pkg, path)?;
    }
    builder
        .into_inner()
        .context("failed to finalize patch fallback chunk tar buffer")
}

/// Build the terminal "unchanged files" chunk, carrying every file never modified across the
/// whole version history. This is the last chunk in the container, so its tar stream does carry a
/// real EOF marker.
pub fn create_unchanged_chunk(latest_pkg: &dyn Package, unchanged_names: &[String]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for name in unchanged_names {
        append_package_entry(&mut builder, latest_pkg, name)?;
    }
    builder.finish().context("failed to write tar end-of-archive marker")?;
    builder
        .into_inner()
        .context("failed to finalize unchanged chunk tar buffer")
}

/// Compress a chunk's raw tar bytes, the one place `zstd` touches a whole chunk body at once.
pub fn compress_chunk(tar_bytes: &[u8]) -> Result<Vec<u8>> {
    tools::zstd_compress_bytes(tar_bytes)
}
