//! Kernel replacement: install a different kernel package into the layer
//! that owns `/usr/lib/modules` and swap the boot kernel/initrd on the
//! outer tree to match.

use anyhow::{Context, Result};
use glob::glob;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::ActionArgs;
use crate::layers;
use crate::process::Cmd;
use crate::session::Session;

pub fn replace_kernel(session: &Session, args: &ActionArgs) -> Result<()> {
    let kernel_package = args.str("kernel_package");

    let layer = layers::find_modules_layer(session)?;
    println!("installing {kernel_package} into layer {layer}");
    let target = layers::edit_squashfs(session, &layer, true)?;

    session.run_cmd(
        Cmd::new("chroot")
            .arg_path(&target)
            .args(["apt-get", "update"]),
    )?;
    session.run_cmd(
        Cmd::new("chroot")
            .arg_path(&target)
            .args(["apt-get", "install", "--yes", kernel_package]),
    )?;

    let vmlinuz = newest_match(&target.join("boot"), "vmlinuz-*")
        .context("kernel package installed no vmlinuz")?;
    let initrd = newest_match(&target.join("boot"), "initrd.img-*")
        .context("kernel package installed no initrd")?;

    let arch = session.get_arch()?;
    let (kernel_rel, initrd_rel) = if arch == "s390x" {
        ("boot/kernel.ubuntu", "boot/initrd.ubuntu")
    } else {
        ("casper/vmlinuz", "casper/initrd")
    };
    fs::copy(&vmlinuz, session.p(format!("new/iso/{kernel_rel}"))?)?;
    fs::copy(&initrd, session.p(format!("new/iso/{initrd_rel}"))?)?;
    Ok(())
}

/// Newest (by mtime) file matching `pattern` inside `dir`.
fn newest_match(dir: &Path, pattern: &str) -> Option<PathBuf> {
    let full = dir.join(pattern);
    let mut best: Option<(SystemTime, PathBuf)> = None;
    for entry in glob(&full.to_string_lossy()).ok()?.flatten() {
        let mtime = entry.metadata().and_then(|m| m.modified()).ok()?;
        if best.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
            best = Some((mtime, entry));
        }
    }
    best.map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn test_newest_match_prefers_latest_mtime() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("vmlinuz-6.8.0-31-generic"), "old").unwrap();
        thread::sleep(Duration::from_millis(20));
        fs::write(dir.path().join("vmlinuz-6.8.0-40-generic"), "new").unwrap();

        let newest = newest_match(dir.path(), "vmlinuz-*").unwrap();
        assert!(newest.ends_with("vmlinuz-6.8.0-40-generic"));
    }

    #[test]
    fn test_newest_match_none_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(newest_match(dir.path(), "vmlinuz-*").is_none());
    }
}
