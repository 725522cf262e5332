//! Initrd unpacking and repacking.
//!
//! The outer tree's initrd is expanded once with `unmkinitramfs` and edited
//! through an overlay. Newer initrds are concatenations of cpio segments
//! (microcode in `early*`, the real thing in `main`); only the final `main`
//! segment is gzipped. Repacking rebuilds each segment with
//! `find . | LC_ALL=C sort | cpio -R 0:0 -o -H newc` and concatenates.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use crate::hooks::PreRepackHook;
use crate::mount::Lower;
use crate::process::{Cmd, SubprocessError};
use crate::session::{CacheValue, Session};

/// Outer-tree initrd location for the image's architecture.
pub fn initrd_rel_path(arch: &str) -> &'static str {
    if arch == "s390x" {
        "boot/initrd.ubuntu"
    } else {
        "casper/initrd"
    }
}

/// Unpack the initrd into `old/initrd` and stack an overlay at
/// `new/<target>`; registers the repack hook. Unpacks at most once.
pub fn unpack_initrd(session: &Session, target: &str) -> Result<PathBuf> {
    if let Some(CacheValue::Path(path)) = session.cache_get("initrd") {
        return Ok(path);
    }

    let arch = session.get_arch()?;
    let initrd_rel = initrd_rel_path(&arch);
    let src = session.p(format!("old/iso/{initrd_rel}"))?;
    let lower = session.p("old/initrd")?;
    fs::create_dir_all(&lower)?;
    println!("unpacking initrd...");
    session.run_cmd(Cmd::new("unmkinitramfs").arg_path(&src).arg_path(&lower))?;

    let mountpoint = session.p(format!("new/{target}"))?;
    let overlay = session.add_overlay(Lower::from(lower.as_path()), Some(&mountpoint))?;
    let multi = mountpoint.join("early").is_dir();
    session.add_pre_repack_hook(PreRepackHook::InitrdRepack {
        overlay,
        initrd_rel: initrd_rel.to_string(),
        multi,
    });
    session.cache_put("initrd", CacheValue::Path(mountpoint.clone()));
    Ok(mountpoint)
}

/// Append one cpio segment built from `dir` to `out`, gzipping when
/// `compress` is set.
pub fn pack_for_initrd(dir: &Path, compress: bool, out: &fs::File) -> Result<()> {
    let mut find = Command::new("find")
        .arg(".")
        .current_dir(dir)
        .stdout(Stdio::piped())
        .spawn()
        .context("spawning find")?;

    let mut sort = Command::new("sort")
        .env("LC_ALL", "C")
        .stdin(Stdio::from(find.stdout.take().expect("stdout was piped")))
        .stdout(Stdio::piped())
        .spawn()
        .context("spawning sort")?;

    let mut cpio = Command::new("cpio")
        .args(["-R", "0:0", "-o", "-H", "newc"])
        .current_dir(dir)
        .stdin(Stdio::from(sort.stdout.take().expect("stdout was piped")))
        .stdout(Stdio::piped())
        .spawn()
        .context("spawning cpio")?;

    if compress {
        let mut gzip = Command::new("gzip")
            .stdin(Stdio::from(cpio.stdout.take().expect("stdout was piped")))
            .stdout(Stdio::from(out.try_clone()?))
            .spawn()
            .context("spawning gzip")?;
        check_stage("gzip", gzip.wait()?)?;
    } else {
        let mut stdout = cpio.stdout.take().expect("stdout was piped");
        let mut out = out.try_clone()?;
        io::copy(&mut stdout, &mut out)?;
    }

    check_stage("cpio", cpio.wait()?)?;
    check_stage("sort", sort.wait()?)?;
    check_stage("find", find.wait()?)?;
    Ok(())
}

fn check_stage(name: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    Err(SubprocessError {
        argv: vec![name.to_string()],
        code: status.code().unwrap_or(-1),
        stdout: String::new(),
        stderr: String::new(),
    }
    .into())
}

/// List the top-level segment directories of a multi-segment tree in pack
/// order.
pub fn segment_dirs(tree: &Path) -> Result<Vec<PathBuf>> {
    let mut segments: Vec<PathBuf> = fs::read_dir(tree)?
        .collect::<io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    if segments.is_empty() {
        bail!("unpacked initrd at {} is empty", tree.display());
    }
    segments.sort();
    Ok(segments)
}
