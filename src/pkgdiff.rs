//! Package diff (component C5).

use std::collections::HashSet;

use crate::package::Package;

/// Partitions the entry names of two packages: files only in `a`, only in `b`, present in both
/// but content-changed, and present in both unchanged.
#[derive(Debug, Clone, Default)]
pub struct PackageDiff {
    pub a_only: HashSet<String>,
    pub b_only: HashSet<String>,
    pub ab_diff: HashSet<String>,
    pub common: HashSet<String>,
}

impl PackageDiff {
    pub fn len(&self) -> usize {
        self.a_only.len() + self.b_only.len() + self.ab_diff.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Diff two packages by entry identity (`PackageEntry`'s content-only equality). A name common to
/// both whose entry differs lands in `ab_diff`; a name common to both with an identical entry
/// lands in `common`.
pub fn package_diff(a: &dyn Package, b: &dyn Package) -> PackageDiff {
    let a_names: HashSet<&str> = a.entries().iter().map(|e| e.name.as_str()).collect();
    let b_names: HashSet<&str> = b.entries().iter().map(|e| e.name.as_str()).collect();

    let common_names: HashSet<&str> = a_names.intersection(&b_names).copied().collect();

    let mut common = HashSet::new();
    let mut ab_diff = HashSet::new();
    for name in &common_names {
        let a_entry = a.entry(name).expect("name came from a's own entry list");
        let b_entry = b.entry(name).expect("name came from b's own entry list");
        if a_entry == b_entry {
            common.insert(name.to_string());
        } else {
            ab_diff.insert(name.to_string());
        }
    }

    let a_only = a_names.difference(&common_names).map(|s| s.to_string()).collect();
    let b_only = b_names.difference(&common_names).map(|s| s.to_string()).collect();

    PackageDiff {
        a_only,
        b_only,
        ab_diff,
        common,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PackageEntry;

    struct FakePackage {
        name: String,
        version: String,
        entries: Vec<PackageEntry>,
    }

    impl Package for FakePackage {
        fn name(&self) -> &str {
            &self.name
        }
        fn version(&self) -> &str {
            &self.version
        }
        fn variant(&self) -> Option<&str> {
            None
        }
        fn entries(&self) -> &[PackageEntry] {
            &self.entries
        }
        fn entry(&self, name: &str) -> Option<&PackageEntry> {
            self.entries.iter().find(|e| e.name == name)
        }
        fn open_bytes(&self, _name: &str) -> anyhow::Result<Vec<u8>> {
            unimplemented!("not needed for diff tests")
        }
    }

    fn entry(name: &str, checksum: u8) -> PackageEntry {
        PackageEntry {
            name: name.to_string(),
            size: 10,
            checksum_type: "crc32".into(),
            checksum: vec![checksum],
            mtime: 0,
            mode: 0,
        }
    }

    #[test]
    fn classifies_added_removed_changed_unchanged() {
        let a = FakePackage {
            name: "pkg".into(),
            version: "1".into(),
            entries: vec![entry("only_a.txt", 1), entry("shared.txt", 1), entry("changed.txt", 1)],
        };
        let b = FakePackage {
            name: "pkg".into(),
            version: "2".into(),
            entries: vec![entry("only_b.txt", 1), entry("shared.txt", 1), entry("changed.txt", 2)],
        };
        let diff = package_diff(&a, &b);
        assert_eq!(diff.a_only, HashSet::from(["only_a.txt".to_string()]));
        assert_eq!(diff.b_only, HashSet::from(["only_b.txt".to_string()]));
        assert_eq!(diff.ab_diff, HashSet::from(["changed.txt".to_string()]));
        assert_eq!(diff.common, HashSet::from(["shared.txt".to_string()]));
        assert_eq!(diff.len(), 3);
    }
}
