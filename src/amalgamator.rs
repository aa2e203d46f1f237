//! Amalgamator / container writer (component C10).
//!
//! The final artifact is a zstd "skippable frame" header, followed by one small zstd-compressed
//! tar (the manifest chunk: the package manifest plus the delta manifest listing every chunk's
//! offset/size/hash), followed by the concatenated bodies of the chunks produced by
//! [`crate::chunks`] — each already independently zstd-compressed, so a consumer can seek
//! straight to the one chunk it needs without decompressing the others.

use std::io::Cursor;

use anyhow::{Context, Result};
use tar::{EntryType, Header};

use crate::io_util::{sha256_bytes, SafeWriter};
use crate::manifest::{Chunk, ChunkTarget, DeltaPackageManifest, PackageManifest};
use crate::tools::zstd_compress_bytes;

/// Skippable-frame magic for variant 0xA: little-endian `0x184D2A5A`.
const SKIPPABLE_MAGIC: [u8; 4] = [0x5A, 0x2A, 0x4D, 0x18];
/// ASCII tag identifying this container format, stored inside the skippable frame.
const FORMAT_TAG: &[u8; 4] = b"MUE1";

pub struct AmalgamatedPatch {
    manifest: PackageManifest,
    for_version: Vec<String>,
    chunks: Vec<(Chunk, Vec<u8>)>,
    offset: u64,
}

impl AmalgamatedPatch {
    pub fn new(manifest: PackageManifest, for_version: Vec<String>) -> Self {
        AmalgamatedPatch {
            manifest,
            for_version,
            chunks: Vec::new(),
            offset: 0,
        }
    }

    /// Register one already-compressed chunk body at the current running offset.
    pub fn add_chunk(&mut self, target: ChunkTarget, compressed_chunk: Vec<u8>) {
        let size = compressed_chunk.len() as u64;
        let chunk = Chunk {
            target,
            offset: self.offset,
            size,
            hash: format!("sha256:{}", sha256_bytes(&compressed_chunk)),
        };
        self.offset += size;
        self.chunks.push((chunk, compressed_chunk));
    }

    /// Write the whole container to `outfile`, atomically.
    pub fn build(self, outfile: &std::path::Path) -> Result<()> {
        let delta_manifest = DeltaPackageManifest {
            for_version: self.for_version,
            chunks: self.chunks.iter().map(|(c, _)| c.clone()).collect(),
        };

        let manifest_chunk_bytes = build_manifest_chunk(&self.manifest, &delta_manifest)?;
        let compressed_manifest_chunk = zstd_compress_bytes(&manifest_chunk_bytes)
            .context("failed to compress manifest chunk")?;

        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(&SKIPPABLE_MAGIC);
        header.extend_from_slice(&8u32.to_le_bytes());
        header.extend_from_slice(FORMAT_TAG);
        header.extend_from_slice(&(compressed_manifest_chunk.len() as u32).to_le_bytes());

        let mut writer = SafeWriter::create(outfile)?;
        use std::io::Write;
        writer.write_all(&header)?;
        writer.write_all(&compressed_manifest_chunk)?;
        for (_, body) in &self.chunks {
            writer.write_all(body)?;
        }
        writer.finish()
    }
}

fn build_manifest_chunk(
    manifest: &PackageManifest,
    delta_manifest: &DeltaPackageManifest,
) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let manifest_bytes = serde_json::to_vec(manifest).context("failed to serialize package manifest")?;
    let delta_manifest_bytes =
        serde_json::to_vec(delta_manifest).context("failed to serialize delta manifest")?;

    append_json(
        &mut builder,
        &format!(".maa_update/packages/{}/manifest.json", manifest.name),
        &manifest_bytes,
    )?;
    append_json(
        &mut builder,
        &format!(
            ".maa_update/delta/{}/{}/delta_manifest.json",
            manifest.name, manifest.version
        ),
        &delta_manifest_bytes,
    )?;

    builder.finish().context("failed to write manifest chunk tar trailer")?;
    builder.into_inner().context("failed to finalize manifest chunk tar buffer")
}

fn append_json(builder: &mut tar::Builder<Vec<u8>>, arcname: &str, bytes: &[u8]) -> Result<()> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder
        .append_data(&mut header, arcname, Cursor::new(bytes.to_vec()))
        .with_context(|| format!("failed to append tar entry: {arcname}"))
}
