//! Host tool availability checks.
//!
//! The engine is a thin orchestrator over external binaries; better to fail
//! with install hints up front than three mounts deep into a session.

use anyhow::{bail, Result};

/// Tools the engine itself shells out to, with package hints.
/// Action-specific tools (apt-ftparchive, gpg, snap, chroot) are checked
/// lazily by the actions that need them.
const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mount", "mount"),
    ("umount", "mount"),
    ("losetup", "mount"),
    ("udevadm", "udev"),
    ("findmnt", "util-linux"),
    ("mksquashfs", "squashfs-tools"),
    ("unmkinitramfs", "initramfs-tools-core"),
    ("xorriso", "xorriso"),
    ("rsync", "rsync"),
    ("cp", "coreutils"),
    ("find", "findutils"),
    ("sort", "coreutils"),
    ("cpio", "cpio"),
    ("gzip", "gzip"),
];

/// Verify every engine-required tool resolves in PATH.
pub fn check_required_tools() -> Result<()> {
    let mut missing = Vec::new();
    for (tool, package) in REQUIRED_TOOLS {
        if which::which(tool).is_err() {
            missing.push(format!("{tool} (install '{package}')"));
        }
    }
    if !missing.is_empty() {
        bail!("missing required tools:\n  {}", missing.join("\n  "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_tools_present() {
        // cp/find/sort exist on any box running the test suite; the full
        // set may not, so only sanity-check the lookup machinery.
        assert!(which::which("cp").is_ok());
        assert!(which::which("nonexistent-tool-12345").is_err());
    }

    #[test]
    fn test_required_list_has_no_duplicates() {
        let mut names: Vec<&str> = REQUIRED_TOOLS.iter().map(|(t, _)| *t).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), REQUIRED_TOOLS.len());
    }
}
