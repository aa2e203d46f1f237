use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rayon::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use delta_maker::amalgamator::AmalgamatedPatch;
use delta_maker::cache::DiffCache;
use delta_maker::config::Config;
use delta_maker::extract::Extractor;
use delta_maker::manifest::{ChunkTarget, FallbackKind, PackageManifest};
use delta_maker::package::{open_default_package, Package, ZipPackage};
use delta_maker::pkgdiff::package_diff;
use delta_maker::pool::{self, CancellationToken};
use delta_maker::{chunks, io_util, ordering, patch_select, planner};

/// Builds a self-describing delta update package from a target version and a set of previous
/// versions it should be able to patch from.
#[derive(Parser)]
#[command(name = "delta-maker", version, about)]
struct Cli {
    /// Text file of versions: first line is the target version, the rest are previous versions.
    versions_file: PathBuf,
    /// Text file listing the subset of previous versions considered nonlinear (order indicates
    /// insertion priority; the last line is inserted first).
    nonlinear_versions_file: PathBuf,
}

fn read_version_list(path: &PathBuf) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read version list: {}", path.display()))?;
    Ok(text
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let token = CancellationToken::new();

    pool::run_cancellable(token.clone(), move || run(cli, token)).await
}

fn run(cli: Cli, token: CancellationToken) -> Result<()> {
    let start = Instant::now();

    let versions = read_version_list(&cli.versions_file)?;
    let (latest, previous) = versions
        .split_first()
        .context("versions file must contain at least one version (the target)")?;
    let previous: Vec<String> = previous.to_vec();
    let nonlinear_versions = read_version_list(&cli.nonlinear_versions_file)?;

    let config = Config::from_env()?;
    fs::create_dir_all(&config.patch_cache_dir).context("failed to create patch cache dir")?;
    fs::create_dir_all(&config.extract_dir).context("failed to create package extract dir")?;
    fs::create_dir_all(&config.chunk_temp_dir).context("failed to create chunk temp dir")?;
    fs::create_dir_all(&config.output_dir).context("failed to create output dir")?;

    let mut report = String::new();
    report.push_str(&format!("Target version: {latest}\n"));
    report.push_str("Previous versions:\n");
    for version in &previous {
        report.push_str(&format!("  {version}\n"));
    }

    let owned_packages: Vec<(String, ZipPackage)> = versions
        .iter()
        .map(|version| {
            let pkg = open_default_package(
                &config.testdata_dir,
                &config.package_name,
                version,
                config.package_variant.as_deref(),
            )
            .with_context(|| format!("failed to open package version {version}"))?;
            Ok((version.clone(), pkg))
        })
        .collect::<Result<Vec<_>>>()?;

    let pkgs: HashMap<String, &dyn Package> = owned_packages
        .iter()
        .map(|(version, pkg)| (version.clone(), pkg as &dyn Package))
        .collect();

    token.check()?;

    let diff_cache: DiffCache<(String, String), usize> = DiffCache::new(640);
    let sorted_previous = ordering::sort_versions(&previous, &nonlinear_versions, |a, b| {
        diff_cache.get_or_compute((a.to_string(), b.to_string()), || package_diff(pkgs[a], pkgs[b]).len())
    });

    info!(target_version = latest, previous = sorted_previous.len(), "version order computed");
    report.push_str("Sorted previous versions:\n");
    for version in &sorted_previous {
        report.push_str(&format!("  {version}\n"));
    }
    report.push('\n');

    // `generate_file_history` and `find_best_patch` both consume `sorted_previous` in the exact
    // order `sort_versions` returns it — the original never reorders it a second time.
    let mut version_order = vec![latest.clone()];
    version_order.extend(sorted_previous.iter().cloned());
    let history = planner::generate_file_history(&version_order, &pkgs);

    info!(
        delta_records = history.version_changes.len(),
        unchanged = history.unchanged_entries.len(),
        "file history planned"
    );

    for delta_record in &history.version_changes {
        report.push_str(&format!("To update from version {:?}\n", delta_record.base_version));
        for action in &delta_record.actions {
            report.push_str(&format!("  {action:?}\n"));
        }
        report.push('\n');
    }

    token.check()?;

    let extractor = Extractor::new(&config.extract_dir);
    let patch_strategy = patch_select::find_best_patch(
        &pkgs,
        &history.version_changes,
        latest,
        &sorted_previous,
        &config,
        &config.patch_cache_dir,
        &extractor,
    )?;

    info!(patches = patch_strategy.len(), "patch strategy selected");
    report.push_str("Binary patch strategy:\n");
    let mut keys: Vec<_> = patch_strategy.keys().collect();
    keys.sort_by_key(|k| sorted_previous.iter().position(|v| v == &k.from_version).unwrap_or(usize::MAX));
    for key in keys {
        let patch = &patch_strategy[key];
        report.push_str(&format!(
            "  {}/{} \t->\t {} \t({}, est. compressed {})\n",
            key.from_version,
            key.path,
            patch.to_version,
            patch.patch_type,
            io_util::format_size(patch.estimated_compressed_size)
        ));
    }
    report.push_str("Unchanged files:\n");
    for name in &history.unchanged_entries {
        report.push_str(&format!("  KEEP     {name}\n"));
    }

    token.check()?;

    let latest_pkg = pkgs[latest];

    // Delta chunks, the patch fallback chunk and the unchanged chunk don't depend on each other,
    // so all three build concurrently on rayon's pool rather than one after another.
    let (delta_result, fallback_result) = rayon::join(
        || -> Result<Vec<_>> {
            history
                .version_changes
                .par_iter()
                .map(|delta_record| {
                    let built = chunks::create_delta_chunk(
                        &config.package_name,
                        latest_pkg,
                        &pkgs,
                        delta_record,
                        &patch_strategy,
                        &extractor,
                    )?;
                    let compressed = chunks::compress_chunk(&built.tar_bytes)?;
                    info!(patch_base = delta_record.patch_base_version, bytes = compressed.len(), "delta chunk built");
                    Ok::<_, anyhow::Error>((delta_record.base_version.clone(), compressed))
                })
                .collect()
        },
        || -> Result<(Vec<u8>, Vec<u8>)> {
            let (patch_fallback, unchanged) = rayon::join(
                || -> Result<Vec<u8>> {
                    let tar = chunks::create_patch_fallback_chunk(latest_pkg, &patch_strategy)?;
                    let compressed = chunks::compress_chunk(&tar)?;
                    info!(bytes = compressed.len(), "patch fallback chunk built");
                    Ok(compressed)
                },
                || -> Result<Vec<u8>> {
                    let tar = chunks::create_unchanged_chunk(latest_pkg, &history.unchanged_entries)?;
                    let compressed = chunks::compress_chunk(&tar)?;
                    info!(bytes = compressed.len(), "unchanged chunk built");
                    Ok(compressed)
                },
            );
            Ok((patch_fallback?, unchanged?))
        },
    );
    let built_chunks = delta_result?;
    let (patch_fallback_compressed, unchanged_compressed) = fallback_result?;

    token.check()?;

    info!("amalgamating delta package");
    let package_manifest = PackageManifest {
        name: config.package_name.clone(),
        version: latest.clone(),
        variant: config.package_variant.clone(),
    };
    let mut amal = AmalgamatedPatch::new(package_manifest, sorted_previous.clone());
    for (base_version, compressed) in built_chunks {
        amal.add_chunk(ChunkTarget::Versions(base_version), compressed);
    }
    amal.add_chunk(ChunkTarget::Literal(FallbackKind::PatchFallback), patch_fallback_compressed);
    amal.add_chunk(ChunkTarget::Literal(FallbackKind::Fallback), unchanged_compressed);

    let mut filename = format!("{}-{latest}", config.package_name);
    if let Some(variant) = &config.package_variant {
        filename.push('-');
        filename.push_str(variant);
    }
    filename.push_str("-delta.tar.zst");
    let outfile = config.output_dir.join(&filename);
    amal.build(&outfile)?;

    let elapsed = start.elapsed();
    let output_size = fs::metadata(&outfile).map(|m| m.len()).unwrap_or(0);
    report.push_str(&format!(
        "\nDelta package written to {} ({})\nTime elapsed: {:.3}s\n",
        outfile.display(),
        io_util::format_size(output_size),
        elapsed.as_secs_f64()
    ));

    println!("{report}");
    fs::write(config.output_dir.join("delta_report.txt"), &report)
        .context("failed to write delta_report.txt")?;

    info!(output = %outfile.display(), size = output_size, elapsed_s = elapsed.as_secs_f64(), "delta package complete");

    Ok(())
}
