//! Patch-strategy selector (component C8) — the densest piece of the pipeline.
//!
//! For every file a prior version needs patched, this walks the changelog of all the versions
//! that file has ever changed at, looks for a shortcut ("forward-hop": the file's exact bytes
//! reappear at some later version, so a plain copy beats any binary diff — handles the classic
//! `A -> B -> A` rollback), and otherwise generates `zstd` and `bsdiff` candidate patches
//! concurrently and keeps whichever compresses smallest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;

use crate::config::Config;
use crate::extract::Extractor;
use crate::manifest::PatchType;
use crate::package::{Package, PackageEntry};
use crate::planner::{FileActionRecord, PackageContentDiff};
use crate::tools;

/// Identifies one patchable file as seen from a specific prior version — the dict key the
/// original keyed its per-file strategy table on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchFileKey {
    pub from_version: String,
    pub path: String,
}

/// One candidate (or chosen) patch for a [`PatchFileKey`].
#[derive(Debug, Clone)]
pub struct CachedBinaryPatch {
    pub patch_file: PatchFileKey,
    pub to_version: String,
    pub patch_type: PatchType,
    /// `None` for a `copy` strategy, which carries no patch payload of its own.
    pub cached_deltafile: Option<PathBuf>,
    pub estimated_compressed_size: u64,
}

struct FileChangeRecord {
    since_version: String,
    dedup_key: PackageEntry,
}

/// Build the per-file patch strategy table: one [`CachedBinaryPatch`] per [`PatchFileKey`] found
/// across `delta_records`, chosen by smallest estimated compressed size with `copy < zstd <
/// bsdiff` as a tie-break.
pub fn find_best_patch(
    pkgs: &HashMap<String, &dyn Package>,
    delta_records: &[PackageContentDiff],
    latest_version: &str,
    sorted_previous_versions: &[String],
    config: &Config,
    patch_cache_dir: &Path,
    extractor: &Extractor,
) -> Result<HashMap<PatchFileKey, CachedBinaryPatch>> {
    let mut file_changelog: HashMap<String, Vec<FileChangeRecord>> = HashMap::new();
    let mut file_hash_to_version_map: HashMap<(String, PackageEntry), Vec<String>> = HashMap::new();

    for delta_record in delta_records.iter().rev() {
        for action in &delta_record.actions {
            if let FileActionRecord::PatchFile { from_version, path } = action {
                let file_info = pkgs[from_version]
                    .entry(path)
                    .with_context(|| format!("missing entry {path} in {from_version}"))?
                    .clone();
                file_changelog
                    .entry(path.clone())
                    .or_default()
                    .push(FileChangeRecord {
                        since_version: from_version.clone(),
                        dedup_key: file_info.clone(),
                    });
                file_hash_to_version_map
                    .entry((path.clone(), file_info))
                    .or_default()
                    .push(from_version.clone());
            }
        }
    }

    for path in file_changelog.keys().cloned().collect::<Vec<_>>() {
        let file_info = pkgs[latest_version]
            .entry(&path)
            .with_context(|| format!("missing entry {path} in {latest_version}"))?
            .clone();
        file_hash_to_version_map
            .entry((path, file_info))
            .or_default()
            .push(latest_version.to_string());
    }

    let mut each_patch: HashMap<PatchFileKey, Vec<CachedBinaryPatch>> = HashMap::new();
    let mut candidate_jobs: Vec<CandidateJob> = Vec::new();

    for delta_record in delta_records {
        for action in &delta_record.actions {
            let (from_version, path) = match action {
                FileActionRecord::PatchFile { from_version, path } => (from_version, path),
                _ => continue,
            };
            let key = PatchFileKey {
                from_version: from_version.clone(),
                path: path.clone(),
            };
            let source_file_info = pkgs[from_version]
                .entry(path)
                .with_context(|| format!("missing entry {path} in {from_version}"))?
                .clone();

            let mut target_versions = vec![latest_version.to_string()];
            let source_version_index = sorted_previous_versions
                .iter()
                .position(|v| v == from_version)
                .with_context(|| format!("version not in ordering: {from_version}"))?;

            if let Some(changes) = file_changelog.get(path) {
                for change in changes {
                    let since_index = sorted_previous_versions
                        .iter()
                        .position(|v| v == &change.since_version);
                    if let Some(since_index) = since_index {
                        if since_index >= source_version_index {
                            continue;
                        }
                    }
                    if &change.since_version == from_version {
                        continue;
                    }
                    if !target_versions.contains(&change.since_version) {
                        target_versions.push(change.since_version.clone());
                    }
                }
            }

            let versions_with_source_file: Vec<&String> = file_hash_to_version_map
                .get(&(path.clone(), source_file_info.clone()))
                .into_iter()
                .flatten()
                .filter(|v| target_versions.contains(v))
                .collect();

            if let Some(forward_to_version) = versions_with_source_file.last() {
                each_patch.entry(key.clone()).or_default().push(CachedBinaryPatch {
                    patch_file: key,
                    to_version: (*forward_to_version).clone(),
                    patch_type: PatchType::Copy,
                    cached_deltafile: None,
                    estimated_compressed_size: 0,
                });
                continue;
            }

            let mut dedup_set: std::collections::HashSet<PackageEntry> = std::collections::HashSet::new();
            let mut dedupped_target_versions = Vec::new();
            for version in &target_versions {
                let target_file_info = pkgs[version]
                    .entry(path)
                    .with_context(|| format!("missing entry {path} in {version}"))?
                    .clone();
                if dedup_set.contains(&target_file_info) {
                    continue;
                }
                dedup_set.insert(target_file_info);
                dedupped_target_versions.push(version.clone());
            }

            for version in dedupped_target_versions {
                let orig_file = extractor.extract(pkgs[from_version], path)?;
                let new_file = extractor.extract(pkgs[&version], path)?;
                let target_file_info = pkgs[&version]
                    .entry(path)
                    .with_context(|| format!("missing entry {path} in {version}"))?
                    .clone();
                candidate_jobs.push(CandidateJob {
                    key: key.clone(),
                    to_version: version,
                    orig_file,
                    new_file,
                    old_entry: source_file_info.clone(),
                    new_entry: target_file_info,
                });
            }
        }
    }

    let results: Vec<Result<CachedBinaryPatch>> = candidate_jobs
        .par_iter()
        .flat_map(|job| {
            vec![
                make_patch_zstd(config, patch_cache_dir, job),
                make_patch_bsdiff(config, patch_cache_dir, job),
            ]
        })
        .collect();

    for result in results {
        let patch = result?;
        each_patch.entry(patch.patch_file.clone()).or_default().push(patch);
    }

    let resolved = each_patch
        .into_iter()
        .map(|(key, mut candidates)| {
            candidates.sort_by_key(|c| (c.estimated_compressed_size, patch_type_rank(c.patch_type)));
            (key, candidates.into_iter().next().expect("at least one candidate was generated"))
        })
        .collect();

    Ok(resolved)
}

fn patch_type_rank(t: PatchType) -> u8 {
    match t {
        PatchType::Copy => 0,
        PatchType::Zstd => 1,
        PatchType::Bsdiff => 2,
    }
}

struct CandidateJob {
    key: PatchFileKey,
    to_version: String,
    orig_file: PathBuf,
    new_file: PathBuf,
    old_entry: PackageEntry,
    new_entry: PackageEntry,
}

fn patch_filename(
    patch_cache_dir: &Path,
    key: &PatchFileKey,
    old_entry: &PackageEntry,
    new_entry: &PackageEntry,
    ext: &str,
) -> PathBuf {
    let basename = Path::new(&key.path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| key.path.clone());
    let filename = format!(
        "{basename}-{}-{}{ext}",
        old_entry.content_key(),
        new_entry.content_key()
    );
    patch_cache_dir.join(&key.from_version).join(filename)
}

fn make_patch_zstd(config: &Config, patch_cache_dir: &Path, job: &CandidateJob) -> Result<CachedBinaryPatch> {
    let patch_path = patch_filename(patch_cache_dir, &job.key, &job.old_entry, &job.new_entry, ".zst");
    if !patch_path.exists() {
        if let Some(parent) = patch_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tools::zstd_generate_patch(config, &job.orig_file, &job.new_file, &patch_path)?;
    }
    let mut patch_size = std::fs::metadata(&patch_path)?.len();

    // A zstd stream has a floor of roughly 100 bytes/MiB of logical input regardless of how
    // similar the files are; below that floor, compressing the patch itself can still shrink it.
    let new_size = std::fs::metadata(&job.new_file)?.len();
    if (patch_size as f64) < (new_size as f64) * 0.0002 {
        let nested_path = {
            let mut p = patch_path.clone().into_os_string();
            p.push(".zst");
            PathBuf::from(p)
        };
        if !nested_path.exists() {
            let compressed = tools::zstd_compress_bytes(&std::fs::read(&patch_path)?)?;
            crate::io_util::safe_write_bytes(&nested_path, &compressed)?;
        }
        patch_size = std::fs::metadata(&nested_path)?.len();
    }

    Ok(CachedBinaryPatch {
        patch_file: job.key.clone(),
        to_version: job.to_version.clone(),
        patch_type: PatchType::Zstd,
        cached_deltafile: Some(patch_path),
        estimated_compressed_size: patch_size,
    })
}

fn make_patch_bsdiff(config: &Config, patch_cache_dir: &Path, job: &CandidateJob) -> Result<CachedBinaryPatch> {
    let patch_path = patch_filename(patch_cache_dir, &job.key, &job.old_entry, &job.new_entry, ".bsdiffx");
    if !patch_path.exists() {
        if let Some(parent) = patch_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tools::bsdiff_generate_patch(config, &job.orig_file, &job.new_file, &patch_path)?;
    }
    let patch_size = std::fs::metadata(&patch_path)?.len();
    Ok(CachedBinaryPatch {
        patch_file: job.key.clone(),
        to_version: job.to_version.clone(),
        patch_type: PatchType::Bsdiff,
        cached_deltafile: Some(patch_path),
        estimated_compressed_size: patch_size,
    })
}
