//! File-history planner (component C7).
//!
//! Walks backward from the target version through each previous version and decides, per file,
//! what a consumer on that version needs to do to reach the target: patch a changed binary, copy
//! a replaced small file wholesale, add a new file, or remove one that no longer exists.

use std::collections::{HashMap, HashSet};

use crate::package::Package;

/// One per-file action a consumer on some prior version must take to reach the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileActionRecord {
    AddFile(String),
    ReplaceFile(String),
    RemoveFile(String),
    PatchFile { from_version: String, path: String },
}

impl FileActionRecord {
    pub fn path(&self) -> &str {
        match self {
            FileActionRecord::AddFile(p)
            | FileActionRecord::ReplaceFile(p)
            | FileActionRecord::RemoveFile(p) => p,
            FileActionRecord::PatchFile { path, .. } => path,
        }
    }
}

/// The set of actions a consumer currently on `patch_base_version` (or any version in
/// `base_version` not yet covered by an earlier, more specific record) must apply.
#[derive(Debug, Clone)]
pub struct PackageContentDiff {
    pub base_version: Vec<String>,
    pub patch_base_version: String,
    pub actions: Vec<FileActionRecord>,
}

/// The full backward walk from target to every previous version, plus the set of file names that
/// never changed across the whole history (eligible for the terminal unchanged-files chunk).
#[derive(Debug, Clone)]
pub struct PackageContentVersionHistory {
    pub version_changes: Vec<PackageContentDiff>,
    pub unchanged_entries: Vec<String>,
}

/// A file is binary-patch-eligible by extension, matching the original's coarse heuristic:
/// `.dll`/`.exe` files are usually large and benefit from a binary patch; everything else that
/// changes is cheap enough to just replace wholesale.
pub fn needs_binary_patch(name: &str) -> bool {
    name.ends_with(".dll") || name.ends_with(".exe")
}

/// `version_order`: target version first, then previous versions in the same order produced by
/// [`crate::ordering::sort_versions`] — this function does not reorder them further.
pub fn generate_file_history(
    version_order: &[String],
    packages: &HashMap<String, &dyn Package>,
) -> PackageContentVersionHistory {
    let (latest, previous) = version_order
        .split_first()
        .expect("version_order must contain at least the target version");

    let latest_pkg = packages[latest];
    let latest_entries: HashSet<_> = latest_pkg.entries().iter().cloned().collect();
    let latest_names: HashSet<&str> = latest_pkg.entries().iter().map(|e| e.name.as_str()).collect();

    let mut global_replaced_names: HashSet<String> = HashSet::new();
    let mut global_removed_names: HashSet<String> = HashSet::new();
    let mut last_changed_entries: HashSet<crate::package::PackageEntry> = HashSet::new();

    let mut changed_names: HashSet<String> = HashSet::new();
    let mut processed_versions: Vec<String> = Vec::new();

    let mut delta_records: Vec<PackageContentDiff> = Vec::new();

    for version in previous {
        let current_pkg = packages[version];
        let current_entries = current_pkg.entries();
        let current_names: HashSet<&str> = current_entries.iter().map(|e| e.name.as_str()).collect();

        let mut changed_entries: HashSet<crate::package::PackageEntry> = HashSet::new();

        let for_version: Vec<String> = previous
            .iter()
            .filter(|v| !processed_versions.contains(v))
            .cloned()
            .collect();
        debug_assert!(for_version.contains(version));

        let mut actions = Vec::new();
        for entry in current_entries {
            let entry_name = entry.name.as_str();
            if latest_entries.contains(entry) {
                continue;
            }
            if latest_names.contains(entry_name) {
                if needs_binary_patch(entry_name) {
                    actions.push(FileActionRecord::PatchFile {
                        from_version: version.clone(),
                        path: entry_name.to_string(),
                    });
                    if !last_changed_entries.contains(entry) {
                        changed_entries.insert(entry.clone());
                    }
                } else if !global_replaced_names.contains(entry_name) {
                    global_replaced_names.insert(entry_name.to_string());
                    actions.push(FileActionRecord::ReplaceFile(entry_name.to_string()));
                }
                changed_names.insert(entry_name.to_string());
            } else if !global_removed_names.contains(entry_name) {
                global_removed_names.insert(entry_name.to_string());
                actions.push(FileActionRecord::RemoveFile(entry_name.to_string()));
            }
        }

        let mut new_names: Vec<&str> = latest_names.difference(&current_names).copied().collect();
        new_names.sort_unstable();
        for entry_name in new_names {
            if !global_replaced_names.contains(entry_name) {
                actions.push(FileActionRecord::AddFile(entry_name.to_string()));
                global_replaced_names.insert(entry_name.to_string());
            }
            changed_names.insert(entry_name.to_string());
        }

        last_changed_entries = changed_entries;

        delta_records.push(PackageContentDiff {
            base_version: for_version,
            patch_base_version: version.clone(),
            actions,
        });
        processed_versions.insert(0, version.clone());
    }

    let mut unchanged_entries: Vec<String> = latest_names
        .iter()
        .filter(|n| !changed_names.contains(**n))
        .map(|n| n.to_string())
        .collect();
    unchanged_entries.sort_unstable();

    PackageContentVersionHistory {
        version_changes: delta_records,
        unchanged_entries,
    }
}
