//! Package provider and entry model (component C1).
//!
//! A [`Package`] is a named, versioned, optionally-varianted source archive. Its entries are
//! addressed purely by content for the purposes of equality: `mtime` and `mode` are carried for
//! informational use (e.g. writing tar headers) but never participate in identity comparisons,
//! so a repack that only touches timestamps never looks like a content change to the planner.

use std::io::{BufReader, Cursor, Read};
use std::path::{Component, Path};

use anyhow::{bail, Context, Result};

/// A single file entry inside a package, addressed by its archive-relative name.
///
/// `Eq`/`Hash`/`Ord` consider only `(name, size, checksum_type, checksum)` — `mtime` and `mode`
/// are excluded so that archive repacks which only touch metadata never register as content
/// changes.
#[derive(Debug, Clone)]
pub struct PackageEntry {
    pub name: String,
    pub size: u64,
    pub checksum_type: String,
    pub checksum: Vec<u8>,
    pub mtime: i64,
    pub mode: u32,
}

impl PartialEq for PackageEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.size == other.size
            && self.checksum_type == other.checksum_type
            && self.checksum == other.checksum
    }
}
impl Eq for PackageEntry {}

impl std::hash::Hash for PackageEntry {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.size.hash(state);
        self.checksum_type.hash(state);
        self.checksum.hash(state);
    }
}

impl PackageEntry {
    /// `sprintf("%08X", size) || hex(checksum[:4]).upper()` — the content key used to build
    /// deterministic patch cache filenames (see §4.8 step 3 of the spec).
    pub fn content_key(&self) -> String {
        let checksum_prefix: Vec<u8> = self.checksum.iter().take(4).copied().collect();
        let hex: String = checksum_prefix.iter().map(|b| format!("{b:02X}")).collect();
        format!("{:08X}{}", self.size, hex)
    }
}

/// A package: `(name, version, variant)` plus its indexed entry list.
pub trait Package: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn variant(&self) -> Option<&str>;
    fn entries(&self) -> &[PackageEntry];
    fn entry(&self, name: &str) -> Option<&PackageEntry>;
    /// Read the full contents of one entry into memory.
    fn open_bytes(&self, name: &str) -> Result<Vec<u8>>;

    /// `open(entry_or_name) → readable byte stream`, satisfied here by wrapping the fetched
    /// bytes in a `Cursor`.
    fn open(&self, name: &str) -> Result<Cursor<Vec<u8>>> {
        Ok(Cursor::new(self.open_bytes(name)?))
    }

    /// `<name>-<version>[-<variant>]`, used as the directory component under
    /// `cache/pkg_extract/`.
    fn full_name(&self) -> String {
        let mut parts = vec![self.name().to_string(), self.version().to_string()];
        if let Some(v) = self.variant() {
            parts.push(v.to_string());
        }
        parts.join("-")
    }
}

/// Reject paths that are absolute, contain `..`, or are reserved on the current platform.
/// Archive names are stored verbatim (see module docs); this check runs at the one place they
/// are turned into filesystem paths — extraction.
pub fn validate_relative_path(name: &str) -> Result<()> {
    let path = Path::new(name);
    if path.is_absolute() {
        bail!("path must be relative: {name}");
    }
    for component in path.components() {
        match component {
            Component::ParentDir => bail!("path traversal not allowed: {name}"),
            Component::Normal(part) => {
                if is_reserved_name(part.to_string_lossy().as_ref()) {
                    bail!("invalid path in this system: {name}");
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn is_reserved_name(part: &str) -> bool {
    const RESERVED: &[&str] = &[
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let stem = part.split('.').next().unwrap_or(part);
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(stem))
}

/// A package backed by a ZIP archive. Directory entries are skipped; mode defaults to
/// `0o100644` when the archive records no unix permission bits; mtime is the DOS timestamp
/// converted to seconds since epoch; checksum is the big-endian 4-byte CRC-32.
pub struct ZipPackage {
    name: String,
    version: String,
    variant: Option<String>,
    entries: Vec<PackageEntry>,
    archive: std::sync::Mutex<zip::ZipArchive<BufReader<std::fs::File>>>,
}

impl ZipPackage {
    pub fn open(
        path: &Path,
        name: impl Into<String>,
        version: impl Into<String>,
        variant: Option<String>,
    ) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open package archive: {}", path.display()))?;
        let mut archive = zip::ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("failed to read zip central directory: {}", path.display()))?;

        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let zipfile = archive
                .by_index(i)
                .with_context(|| format!("failed to read zip entry #{i} in {}", path.display()))?;
            if zipfile.is_dir() {
                continue;
            }
            let mode = zipfile.unix_mode().unwrap_or(0o100644);
            let mtime = dos_datetime_to_unix(zipfile.last_modified());
            let checksum = zipfile.crc32().to_be_bytes().to_vec();
            entries.push(PackageEntry {
                name: zipfile.name().to_string(),
                size: zipfile.size(),
                checksum_type: "crc32".to_string(),
                checksum,
                mtime,
                mode,
            });
        }

        Ok(ZipPackage {
            name: name.into(),
            version: version.into(),
            variant,
            entries,
            archive: std::sync::Mutex::new(archive),
        })
    }
}

impl Package for ZipPackage {
    fn name(&self) -> &str {
        &self.name
    }
    fn version(&self) -> &str {
        &self.version
    }
    fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }
    fn entries(&self) -> &[PackageEntry] {
        &self.entries
    }
    fn entry(&self, name: &str) -> Option<&PackageEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
    fn open_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let mut archive = self
            .archive
            .lock()
            .expect("zip archive mutex poisoned by a panicking thread");
        let mut zipfile = archive
            .by_name(name)
            .with_context(|| format!("entry not found in {}-{}: {name}", self.name, self.version))?;
        let mut buf = Vec::with_capacity(zipfile.size() as usize);
        zipfile
            .read_to_end(&mut buf)
            .with_context(|| format!("failed to read entry: {name}"))?;
        Ok(buf)
    }
}

/// Open the default package source for `(name, version, variant)`: a ZIP file at
/// `<testdata_dir>/<name>-<version>[-<variant>].zip`.
pub fn open_default_package(
    testdata_dir: &Path,
    name: &str,
    version: &str,
    variant: Option<&str>,
) -> Result<ZipPackage> {
    let mut filename = format!("{name}-{version}");
    if let Some(variant) = variant {
        filename.push('-');
        filename.push_str(variant);
    }
    filename.push_str(".zip");
    let path = testdata_dir.join(filename);
    ZipPackage::open(&path, name, version, variant.map(|v| v.to_string()))
}

/// Convert a `zip::DateTime` (MS-DOS date/time, UTC-naive) to seconds since the Unix epoch,
/// mirroring Python's `calendar.timegm(x.date_time)` used by the original implementation.
fn dos_datetime_to_unix(dt: zip::DateTime) -> i64 {
    let days = days_from_civil(dt.year() as i64, dt.month() as u32, dt.day() as u32);
    days * 86_400 + dt.hour() as i64 * 3_600 + dt.minute() as i64 * 60 + dt.second() as i64
}

/// Howard Hinnant's days-from-civil algorithm (proleptic Gregorian, days since 1970-01-01).
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64; // [0, 399]
    let mp = (m as i64 + 9) % 12; // [0, 11], Mar=0 .. Feb=11
    let doy = (153 * mp + 2) / 5 + d as i64 - 1; // [0, 365]
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy; // [0, 146096]
    era * 146_097 + doe - 719_468
}
