//! White-box, end-to-end coverage of the delta pipeline: build small synthetic package archives
//! on disk, push them through planning, patch-strategy selection, chunk construction and
//! amalgamation exactly as `main.rs` does, and inspect the resulting container byte-for-byte.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use delta_maker::amalgamator::AmalgamatedPatch;
use delta_maker::chunks::{compress_chunk, create_delta_chunk, create_patch_fallback_chunk, create_unchanged_chunk};
use delta_maker::config::Config;
use delta_maker::extract::Extractor;
use delta_maker::manifest::{ChunkTarget, DeltaPackageManifest, FallbackKind, PatchType};
use delta_maker::ordering::sort_versions;
use delta_maker::package::{Package, PackageEntry, ZipPackage};
use delta_maker::patch_select::{find_best_patch, CachedBinaryPatch, PatchFileKey};
use delta_maker::planner::generate_file_history;
use delta_maker::{io_util, tools};

fn write_zip_fixture(path: &Path, files: &[(&str, &[u8])]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in files {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

fn test_config(root: &Path) -> Config {
    Config {
        zstd_executable: "zstd".to_string(),
        bsdiff_executable: "maa_bsdiff".to_string(),
        package_name: "MAA".to_string(),
        package_variant: None,
        testdata_dir: root.join("testdata"),
        patch_cache_dir: root.join("cache/patch_cache"),
        extract_dir: root.join("cache/pkg_extract"),
        chunk_temp_dir: root.join("output/temp"),
        output_dir: root.join("output"),
    }
}

/// Tolerant of a missing or truncated end-of-archive trailer, since every chunk but the last one
/// in this pipeline is written without one.
fn read_tar_entries(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut entries_iter = archive.entries().unwrap();
    let mut out = Vec::new();
    loop {
        let mut entry = match entries_iter.next() {
            Some(Ok(entry)) => entry,
            Some(Err(_)) | None => break,
        };
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).unwrap();
        out.push((path, buf));
    }
    out
}

fn find_entry<'a>(entries: &'a [(String, Vec<u8>)], name: &str) -> &'a [u8] {
    &entries
        .iter()
        .find(|(n, _)| n == name)
        .unwrap_or_else(|| panic!("tar entry not found: {name}"))
        .1
}

/// S1 and invariant 6: a version that contributes nothing but an empty delta record still gets
/// one, unchanged files land in the terminal chunk, and the built container's header and offsets
/// are internally consistent with its own manifest.
#[test]
fn trivial_identity_produces_empty_delta_record_and_self_consistent_container() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    write_zip_fixture(&config.testdata_dir.join("MAA-1.0.zip"), &[("README.txt", b"hello world")]);
    write_zip_fixture(&config.testdata_dir.join("MAA-2.0.zip"), &[("README.txt", b"hello world")]);

    let v1 = ZipPackage::open(&config.testdata_dir.join("MAA-1.0.zip"), "MAA", "1.0", None).unwrap();
    let v2 = ZipPackage::open(&config.testdata_dir.join("MAA-2.0.zip"), "MAA", "2.0", None).unwrap();
    let v1_dyn: &dyn Package = &v1;
    let v2_dyn: &dyn Package = &v2;
    let mut pkgs: HashMap<String, &dyn Package> = HashMap::new();
    pkgs.insert("1.0".to_string(), v1_dyn);
    pkgs.insert("2.0".to_string(), v2_dyn);

    let version_order = vec!["2.0".to_string(), "1.0".to_string()];
    let history = generate_file_history(&version_order, &pkgs);

    assert_eq!(history.version_changes.len(), 1);
    assert_eq!(history.version_changes[0].patch_base_version, "1.0");
    assert!(history.version_changes[0].actions.is_empty());
    assert_eq!(history.unchanged_entries, vec!["README.txt".to_string()]);

    let sorted_previous = vec!["1.0".to_string()];
    let extractor = Extractor::new(&config.extract_dir);
    let patch_strategy = find_best_patch(
        &pkgs,
        &history.version_changes,
        "2.0",
        &sorted_previous,
        &config,
        &config.patch_cache_dir,
        &extractor,
    )
    .unwrap();
    assert!(patch_strategy.is_empty());

    let delta_chunk = create_delta_chunk("MAA", v2_dyn, &pkgs, &history.version_changes[0], &patch_strategy, &extractor).unwrap();
    let delta_compressed = compress_chunk(&delta_chunk.tar_bytes).unwrap();

    let fallback_tar = create_patch_fallback_chunk(v2_dyn, &patch_strategy).unwrap();
    let fallback_compressed = compress_chunk(&fallback_tar).unwrap();

    let unchanged_tar = create_unchanged_chunk(v2_dyn, &history.unchanged_entries).unwrap();
    let unchanged_compressed = compress_chunk(&unchanged_tar).unwrap();

    let manifest = delta_maker::manifest::PackageManifest {
        name: "MAA".to_string(),
        version: "2.0".to_string(),
        variant: None,
    };
    let mut amal = AmalgamatedPatch::new(manifest, sorted_previous.clone());
    amal.add_chunk(ChunkTarget::Versions(vec!["1.0".to_string()]), delta_compressed);
    amal.add_chunk(ChunkTarget::Literal(FallbackKind::PatchFallback), fallback_compressed);
    amal.add_chunk(ChunkTarget::Literal(FallbackKind::Fallback), unchanged_compressed);

    let outfile = dir.path().join("MAA-2.0-delta.tar.zst");
    amal.build(&outfile).unwrap();

    let bytes = std::fs::read(&outfile).unwrap();
    assert_eq!(&bytes[0..4], &[0x5A, 0x2A, 0x4D, 0x18]);
    assert_eq!(&bytes[4..8], &8u32.to_le_bytes());
    assert_eq!(&bytes[8..12], b"MUE1");
    let manifest_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;

    let manifest_chunk = tools::zstd_decompress_bytes(&bytes[16..16 + manifest_len]).unwrap();
    let manifest_entries = read_tar_entries(&manifest_chunk);
    let package_manifest_bytes = find_entry(&manifest_entries, ".maa_update/packages/MAA/manifest.json");
    let package_manifest: delta_maker::manifest::PackageManifest =
        serde_json::from_slice(package_manifest_bytes).unwrap();
    assert_eq!(package_manifest.version, "2.0");

    let delta_manifest_bytes = find_entry(&manifest_entries, ".maa_update/delta/MAA/2.0/delta_manifest.json");
    let delta_manifest: DeltaPackageManifest = serde_json::from_slice(delta_manifest_bytes).unwrap();
    assert_eq!(delta_manifest.for_version, vec!["1.0".to_string()]);
    assert_eq!(delta_manifest.chunks.len(), 3);

    let body = &bytes[16 + manifest_len..];
    for chunk in &delta_manifest.chunks {
        let start = chunk.offset as usize;
        let end = start + chunk.size as usize;
        let slice = &body[start..end];
        assert_eq!(chunk.hash, format!("sha256:{}", io_util::sha256_bytes(slice)));
    }
    // Chunks are laid out back-to-back with no gaps: the next chunk's offset is exactly the
    // previous one's offset plus its size.
    let mut expected_offset = 0u64;
    for chunk in &delta_manifest.chunks {
        assert_eq!(chunk.offset, expected_offset);
        expected_offset += chunk.size;
    }
    assert_eq!(expected_offset, body.len() as u64);
}

/// S3: a file that exists only in the target version is added wholesale, with no patch record.
#[test]
fn pure_add_lands_new_file_in_chunk_with_no_patch_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    write_zip_fixture(&config.testdata_dir.join("MAA-1.0.zip"), &[("a.txt", b"A")]);
    write_zip_fixture(&config.testdata_dir.join("MAA-2.0.zip"), &[("a.txt", b"A"), ("new.txt", b"new-content")]);

    let v1 = ZipPackage::open(&config.testdata_dir.join("MAA-1.0.zip"), "MAA", "1.0", None).unwrap();
    let v2 = ZipPackage::open(&config.testdata_dir.join("MAA-2.0.zip"), "MAA", "2.0", None).unwrap();
    let v1_dyn: &dyn Package = &v1;
    let v2_dyn: &dyn Package = &v2;
    let mut pkgs: HashMap<String, &dyn Package> = HashMap::new();
    pkgs.insert("1.0".to_string(), v1_dyn);
    pkgs.insert("2.0".to_string(), v2_dyn);

    let version_order = vec!["2.0".to_string(), "1.0".to_string()];
    let history = generate_file_history(&version_order, &pkgs);
    assert_eq!(history.version_changes.len(), 1);
    let record = &history.version_changes[0];
    assert_eq!(
        record.actions,
        vec![delta_maker::planner::FileActionRecord::AddFile("new.txt".to_string())]
    );
    assert_eq!(history.unchanged_entries, vec!["a.txt".to_string()]);

    let extractor = Extractor::new(&config.extract_dir);
    let patch_strategy: HashMap<PatchFileKey, CachedBinaryPatch> = HashMap::new();
    let chunk = create_delta_chunk("MAA", v2_dyn, &pkgs, record, &patch_strategy, &extractor).unwrap();

    assert!(chunk.manifest.remove_files.is_empty());
    assert!(chunk.manifest.patch_files.is_empty());

    let entries = read_tar_entries(&chunk.tar_bytes);
    assert_eq!(find_entry(&entries, "new.txt"), b"new-content");
    assert!(entries.iter().any(|(n, _)| n == ".maa_update/delta/MAA/1.0/chunk_manifest.json"));

    let fallback_tar = create_patch_fallback_chunk(v2_dyn, &patch_strategy).unwrap();
    assert!(fallback_tar.is_empty());
}

/// S4: a file absent from the target version is recorded for removal, with no file payload.
#[test]
fn pure_remove_records_removed_file_with_no_payload() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    write_zip_fixture(&config.testdata_dir.join("MAA-1.0.zip"), &[("a.txt", b"A"), ("old.txt", b"gone")]);
    write_zip_fixture(&config.testdata_dir.join("MAA-2.0.zip"), &[("a.txt", b"A")]);

    let v1 = ZipPackage::open(&config.testdata_dir.join("MAA-1.0.zip"), "MAA", "1.0", None).unwrap();
    let v2 = ZipPackage::open(&config.testdata_dir.join("MAA-2.0.zip"), "MAA", "2.0", None).unwrap();
    let v1_dyn: &dyn Package = &v1;
    let v2_dyn: &dyn Package = &v2;
    let mut pkgs: HashMap<String, &dyn Package> = HashMap::new();
    pkgs.insert("1.0".to_string(), v1_dyn);
    pkgs.insert("2.0".to_string(), v2_dyn);

    let version_order = vec!["2.0".to_string(), "1.0".to_string()];
    let history = generate_file_history(&version_order, &pkgs);
    let record = &history.version_changes[0];
    assert_eq!(
        record.actions,
        vec![delta_maker::planner::FileActionRecord::RemoveFile("old.txt".to_string())]
    );

    let extractor = Extractor::new(&config.extract_dir);
    let patch_strategy: HashMap<PatchFileKey, CachedBinaryPatch> = HashMap::new();
    let chunk = create_delta_chunk("MAA", v2_dyn, &pkgs, record, &patch_strategy, &extractor).unwrap();

    assert_eq!(chunk.manifest.remove_files, vec!["old.txt".to_string()]);
    assert!(chunk.manifest.patch_files.is_empty());

    let entries = read_tar_entries(&chunk.tar_bytes);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, ".maa_update/delta/MAA/1.0/chunk_manifest.json");
}

/// Forward-hop / "A -> B -> A" rollback: a prior version whose file content recurs verbatim at
/// a *more recent but still-patched* version gets a zero-cost `copy` pointed at that version
/// instead of a real binary diff against latest.
///
/// Chain (oldest to newest): 0.9=B, 1.0=A, 2.0=B, 3.0(latest)=A for `app.dll`. 1.0 matches latest
/// exactly and gets no action at all. 2.0 and 0.9 both differ from latest and get `PatchFile`
/// actions; since 0.9's content (B) reappears at 2.0, and 2.0 is itself a tracked patch target,
/// 0.9 copies from 2.0 rather than diffing against latest.
#[test]
fn forward_hop_chooses_copy_to_nearer_version_with_identical_content() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let content_a = vec![0xAAu8; 4096];
    let content_b = vec![0xBBu8; 4096];

    write_zip_fixture(&config.testdata_dir.join("MAA-3.0.zip"), &[("app.dll", &content_a)]);
    write_zip_fixture(&config.testdata_dir.join("MAA-2.0.zip"), &[("app.dll", &content_b)]);
    write_zip_fixture(&config.testdata_dir.join("MAA-1.0.zip"), &[("app.dll", &content_a)]);
    write_zip_fixture(&config.testdata_dir.join("MAA-0.9.zip"), &[("app.dll", &content_b)]);

    let v3 = ZipPackage::open(&config.testdata_dir.join("MAA-3.0.zip"), "MAA", "3.0", None).unwrap();
    let v2 = ZipPackage::open(&config.testdata_dir.join("MAA-2.0.zip"), "MAA", "2.0", None).unwrap();
    let v1 = ZipPackage::open(&config.testdata_dir.join("MAA-1.0.zip"), "MAA", "1.0", None).unwrap();
    let v0 = ZipPackage::open(&config.testdata_dir.join("MAA-0.9.zip"), "MAA", "0.9", None).unwrap();
    let mut pkgs: HashMap<String, &dyn Package> = HashMap::new();
    pkgs.insert("3.0".to_string(), &v3 as &dyn Package);
    pkgs.insert("2.0".to_string(), &v2 as &dyn Package);
    pkgs.insert("1.0".to_string(), &v1 as &dyn Package);
    pkgs.insert("0.9".to_string(), &v0 as &dyn Package);

    let version_order = vec!["3.0".to_string(), "2.0".to_string(), "1.0".to_string(), "0.9".to_string()];
    let history = generate_file_history(&version_order, &pkgs);
    assert_eq!(history.version_changes.len(), 3);
    assert!(history.version_changes[1].actions.is_empty(), "1.0 matches latest, expects no action");

    let sorted_previous = vec!["2.0".to_string(), "1.0".to_string(), "0.9".to_string()];

    // Pre-seed the cache for the one real diff this scenario needs (2.0 -> 3.0), so
    // `find_best_patch` never shells out to an external tool.
    let old_entry = pkgs["2.0"].entry("app.dll").unwrap().clone();
    let new_entry = pkgs["3.0"].entry("app.dll").unwrap().clone();
    seed_patch_cache(&config, "2.0", "app.dll", &old_entry, &new_entry, 100, 50);

    let extractor = Extractor::new(&config.extract_dir);
    let patch_strategy = find_best_patch(
        &pkgs,
        &history.version_changes,
        "3.0",
        &sorted_previous,
        &config,
        &config.patch_cache_dir,
        &extractor,
    )
    .unwrap();

    let copy_patch = &patch_strategy[&PatchFileKey {
        from_version: "0.9".to_string(),
        path: "app.dll".to_string(),
    }];
    assert_eq!(copy_patch.patch_type, PatchType::Copy);
    assert_eq!(copy_patch.to_version, "2.0");
    assert!(copy_patch.cached_deltafile.is_none());
    assert_eq!(copy_patch.estimated_compressed_size, 0);

    let real_diff_patch = &patch_strategy[&PatchFileKey {
        from_version: "2.0".to_string(),
        path: "app.dll".to_string(),
    }];
    assert_eq!(real_diff_patch.to_version, "3.0");
    assert_ne!(real_diff_patch.patch_type, PatchType::Copy);
}

/// S5: with both binary-patch candidates already cached, the smaller one wins regardless of type.
#[test]
fn binary_patch_choice_prefers_smaller_precomputed_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let old_content = vec![1u8; 2048];
    let new_content = vec![2u8; 2048];
    write_zip_fixture(&config.testdata_dir.join("MAA-1.0.zip"), &[("app.exe", &old_content)]);
    write_zip_fixture(&config.testdata_dir.join("MAA-2.0.zip"), &[("app.exe", &new_content)]);

    let v1 = ZipPackage::open(&config.testdata_dir.join("MAA-1.0.zip"), "MAA", "1.0", None).unwrap();
    let v2 = ZipPackage::open(&config.testdata_dir.join("MAA-2.0.zip"), "MAA", "2.0", None).unwrap();
    let mut pkgs: HashMap<String, &dyn Package> = HashMap::new();
    pkgs.insert("1.0".to_string(), &v1 as &dyn Package);
    pkgs.insert("2.0".to_string(), &v2 as &dyn Package);

    let version_order = vec!["2.0".to_string(), "1.0".to_string()];
    let history = generate_file_history(&version_order, &pkgs);
    let sorted_previous = vec!["1.0".to_string()];

    let old_entry = pkgs["1.0"].entry("app.exe").unwrap().clone();
    let new_entry = pkgs["2.0"].entry("app.exe").unwrap().clone();
    let bsdiff_path = seed_patch_cache(&config, "1.0", "app.exe", &old_entry, &new_entry, 100, 50);

    let extractor = Extractor::new(&config.extract_dir);
    let patch_strategy = find_best_patch(
        &pkgs,
        &history.version_changes,
        "2.0",
        &sorted_previous,
        &config,
        &config.patch_cache_dir,
        &extractor,
    )
    .unwrap();

    let chosen = &patch_strategy[&PatchFileKey {
        from_version: "1.0".to_string(),
        path: "app.exe".to_string(),
    }];
    assert_eq!(chosen.patch_type, PatchType::Bsdiff);
    assert_eq!(chosen.estimated_compressed_size, 50);

    let chunk = create_delta_chunk(
        "MAA",
        &v2 as &dyn Package,
        &pkgs,
        &history.version_changes[0],
        &patch_strategy,
        &extractor,
    )
    .unwrap();
    let record = &chunk.manifest.patch_files[0];
    assert_eq!(record.patch_type, PatchType::Bsdiff);
    let patch_hash = io_util::sha256_bytes(&std::fs::read(&bsdiff_path).unwrap());
    assert_eq!(record.patch, format!(".maa_update/temp/app.exe.{}.bsdiff", &patch_hash[..8]));

    let entries = read_tar_entries(&chunk.tar_bytes);
    assert_eq!(find_entry(&entries, &record.patch), std::fs::read(&bsdiff_path).unwrap());
}

/// Writes `zstd_size`/`bsdiff_size` bytes of filler at the exact cache paths `find_best_patch`
/// would otherwise generate by invoking external tools, so tests never depend on `zstd` or
/// `maa_bsdiff` being installed. Mirrors `patch_select::patch_filename`'s naming scheme.
fn seed_patch_cache(
    config: &Config,
    from_version: &str,
    path: &str,
    old_entry: &PackageEntry,
    new_entry: &PackageEntry,
    zstd_size: usize,
    bsdiff_size: usize,
) -> PathBuf {
    let basename = Path::new(path).file_name().unwrap().to_string_lossy().into_owned();
    let dir = config.patch_cache_dir.join(from_version);
    std::fs::create_dir_all(&dir).unwrap();

    let zst_path = dir.join(format!("{basename}-{}-{}.zst", old_entry.content_key(), new_entry.content_key()));
    std::fs::write(&zst_path, vec![0u8; zstd_size]).unwrap();

    let bsdiff_path = dir.join(format!("{basename}-{}-{}.bsdiffx", old_entry.content_key(), new_entry.content_key()));
    std::fs::write(&bsdiff_path, vec![1u8; bsdiff_size]).unwrap();

    bsdiff_path
}

fn diff_table(table: &'static [(&'static str, &'static str, usize)]) -> impl Fn(&str, &str) -> usize {
    move |a: &str, b: &str| {
        table
            .iter()
            .find(|&&(x, y, _)| x == a && y == b)
            .map(|&(_, _, d)| d)
            .unwrap_or(1000)
    }
}

/// S6: two nonlinear versions, each inserted at the cheapest surrounding gap; later-inserted
/// ("2.5", processed first since insertion walks the list in reverse) settles before "1.5" is
/// considered, and "1.5" still finds its own cheap gap afterwards.
#[test]
fn nonlinear_versions_are_each_inserted_at_their_cheapest_gap() {
    let linear = vec!["1.0".to_string(), "2.0".to_string(), "3.0".to_string()];
    let nonlinear = vec!["1.5".to_string(), "2.5".to_string()];
    let diff = diff_table(&[
        ("2.0", "2.5", 1),
        ("2.5", "3.0", 1),
        ("1.0", "1.5", 1),
        ("1.5", "2.0", 1),
    ]);

    let result = sort_versions(&linear, &nonlinear, diff);
    assert_eq!(result, vec!["1.0", "1.5", "2.0", "2.5", "3.0"]);
}

/// Invariant 2 (ordering determinism): feeding the same nonlinear set through the ordering pass a
/// second time, against its own prior output, reproduces that output exactly — each nonlinear
/// version gets filtered back out of the base chain before being reinserted at the same gap.
#[test]
fn ordering_is_idempotent_when_rerun_with_the_same_nonlinear_set() {
    let linear = vec!["1.0".to_string(), "2.0".to_string(), "3.0".to_string()];
    let nonlinear = vec!["1.5".to_string()];
    let diff = diff_table(&[("1.0", "1.5", 1), ("1.5", "2.0", 1)]);

    let first_pass = sort_versions(&linear, &nonlinear, &diff);
    let second_pass = sort_versions(&first_pass, &nonlinear, &diff);
    assert_eq!(first_pass, second_pass);
}
