//! The on-disk and in-archive JSON schema that consumers of a delta package depend on.
//!
//! These types are a direct port of the original `manifest.py` TypedDicts; field names and
//! optionality are part of the wire contract and must not be renamed casually.

use serde::{Deserialize, Serialize};

/// `patch_type` in a `PatchFile` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    Zstd,
    Bsdiff,
    Copy,
}

impl std::fmt::Display for PatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchType::Zstd => write!(f, "zstd"),
            PatchType::Bsdiff => write!(f, "bsdiff"),
            PatchType::Copy => write!(f, "copy"),
        }
    }
}

/// The target a chunk applies to: either a list of consumer versions, or one of the two
/// terminal fallback literals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkTarget {
    Versions(Vec<String>),
    Literal(FallbackKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    PatchFallback,
    Fallback,
}

/// One compressed tar unit in the final package file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub target: ChunkTarget,
    /// Offset relative to the start of the (compressed) manifest chunk.
    pub offset: u64,
    pub size: u64,
    pub hash: String,
}

/// `.maa_update/packages/<name>/manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// `.maa_update/delta/<name>/<version>/delta_manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaPackageManifest {
    pub for_version: Vec<String>,
    pub chunks: Vec<Chunk>,
}

/// One patchable-file record inside a `ChunkManifest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchFileRecord {
    pub file: String,
    /// Archive-internal path of the patch entry, or `""` for `copy` strategies.
    pub patch: String,
    pub patch_type: PatchType,
    pub old_hash: String,
    pub old_size: u64,
    pub new_version: String,
    pub new_hash: String,
    pub new_size: u64,
}

/// `.maa_update/delta/<name>/<patch_base>/chunk_manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub patch_base: String,
    pub base: Vec<String>,
    pub remove_files: Vec<String>,
    pub patch_files: Vec<PatchFileRecord>,
}
