//! Static table of official white-listed VM images.

use crate::config::host_arch;

/// Which backend can boot this artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageBackend {
    Vm,
    Docker,
}

/// One official image: where to fetch it, what it contains, and the digest
/// that the downloaded artifact must match.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub id: &'static str,
    pub display_name: &'static str,
    pub version: &'static str,
    pub arch: &'static str,
    pub url: &'static str,
    pub artifact_name: &'static str,
    /// Archive member extracted as the flat boot disk.
    pub raw_member: &'static str,
    pub sha256: &'static str,
    pub size_bytes: u64,
    pub backend: ImageBackend,
}

const CATALOG: &[Descriptor] = &[
    Descriptor {
        id: "debian-13-nocloud-arm64",
        display_name: "Debian 13 NoCloud (arm64)",
        version: "20260112-2355",
        arch: "arm64",
        url: "https://cloud.debian.org/images/cloud/trixie/20260112-2355/debian-13-nocloud-arm64-20260112-2355.tar.xz",
        artifact_name: "debian-13-nocloud-arm64-20260112-2355.tar.xz",
        raw_member: "disk.raw",
        sha256: "78924c6035bd54d3c2b0048b8397bba26286979a4ba9e8c7ab74663fa0e9584e",
        size_bytes: 280_901_576,
        backend: ImageBackend::Vm,
    },
    Descriptor {
        id: "debian-13-nocloud-amd64",
        display_name: "Debian 13 NoCloud (amd64)",
        version: "20260112-2355",
        arch: "amd64",
        url: "https://cloud.debian.org/images/cloud/trixie/20260112-2355/debian-13-nocloud-amd64-20260112-2355.tar.xz",
        artifact_name: "debian-13-nocloud-amd64-20260112-2355.tar.xz",
        raw_member: "disk.raw",
        sha256: "d19b6f4b4b6662c992d70cdda2ab98fde41a9f59d6531384cf1748075ee4571b",
        size_bytes: 300_592_428,
        backend: ImageBackend::Vm,
    },
];

/// All official catalog entries.
pub fn list() -> Vec<Descriptor> {
    CATALOG.to_vec()
}

/// Entries compatible with the requested architecture. An empty arch means
/// the host architecture.
pub fn list_for_arch(arch: &str) -> Vec<Descriptor> {
    let arch = if arch.is_empty() { host_arch() } else { arch };
    CATALOG.iter().filter(|d| d.arch == arch).cloned().collect()
}

/// Look up a descriptor by id.
pub fn find_by_id(id: &str) -> Option<Descriptor> {
    CATALOG.iter().find(|d| d.id == id).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_by_id() {
        let desc = find_by_id("debian-13-nocloud-arm64").unwrap();
        assert_eq!(desc.arch, "arm64");
        assert_eq!(desc.raw_member, "disk.raw");
        assert_eq!(desc.sha256.len(), 64);
        assert!(find_by_id("missing").is_none());
    }

    #[test]
    fn test_list_for_arch() {
        let arm = list_for_arch("arm64");
        assert!(arm.iter().all(|d| d.arch == "arm64"));
        assert!(!arm.is_empty());

        let host = list_for_arch("");
        assert!(host.iter().all(|d| d.arch == host_arch()));
    }

    #[test]
    fn test_catalog_entries_are_well_formed() {
        for desc in list() {
            assert!(!desc.id.is_empty());
            assert!(desc.url.starts_with("https://"));
            assert!(desc.artifact_name.ends_with(".tar.xz"));
            assert_eq!(desc.sha256.len(), 64);
            assert!(desc.sha256.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(desc.size_bytes > 0);
        }
    }
}
