//! Source image attach/probe and final image emission.
//!
//! The source is attached to a loop device and its partitions probed for a
//! live filesystem (marked by `.disk/info`). The chosen partition is mounted
//! read-only under `old/iso` with the outer-tree overlay at `new/iso`.
//!
//! At repack time, ISO9660 sources are rebuilt with xorriso, reusing the
//! original El Torito boot metadata so the output boots exactly like the
//! input; anything else is treated as a raw disk image: copy, loop-mount,
//! rsync the new tree over the live partition.

use anyhow::{Context, Result};
use glob::glob;
use std::path::Path;

use crate::error::EditError;
use crate::mount::Lower;
use crate::process::Cmd;
use crate::session::Session;

/// Attach the source image, find its live filesystem and stack the outer
/// overlay. Must run before any action.
pub fn open_source(session: &Session) -> Result<()> {
    let device = session.add_loop(&session.source)?;
    session.run_capture(&["udevadm", "settle"])?;

    let live_dev = find_live_partition(session, &device, &session.source)?;

    let old_iso = session.p("old/iso")?;
    session.add_mount(None, &live_dev, Some(&old_iso), Some("ro"))?;
    let fstype = session
        .run_cmd_capture(Cmd::new("findmnt").args(["-no", "fstype"]).arg_path(&old_iso))?
        .stdout_trimmed()
        .to_string();

    let new_iso = session.p("new/iso")?;
    let overlay = session.add_overlay(Lower::from(old_iso.as_path()), Some(&new_iso))?;

    *session.outer_fstype.borrow_mut() = Some(fstype);
    *session.outer_overlay.borrow_mut() = Some(overlay);
    Ok(())
}

/// Probe every partition-like node under `device` for a live filesystem.
/// Trial mounts are read-only and discarded immediately; the first node
/// carrying `.disk/info` wins.
fn find_live_partition(session: &Session, device: &str, image: &Path) -> Result<String> {
    let mut candidates = Vec::new();
    for entry in glob(&format!("{device}p*"))? {
        candidates.push(entry?.to_string_lossy().into_owned());
    }
    candidates.sort();
    if candidates.is_empty() {
        // Unpartitioned images (plain ISOs) carry the filesystem directly.
        candidates.push(device.to_string());
    }

    for candidate in &candidates {
        let trial = session.tmpdir()?;
        let mount = match session.add_mount(None, candidate, Some(&trial), Some("ro")) {
            Ok(mount) => mount,
            Err(_) => continue,
        };
        let has_marker = mount.path.join(".disk/info").exists();
        session.umount(&mount.path)?;
        if has_marker {
            return Ok(candidate.clone());
        }
    }
    Err(EditError::NoLiveFilesystem(image.to_path_buf()).into())
}

/// Run the deferred hooks and, if the outer tree changed, emit the new
/// image at `dest`. Returns whether an output was produced.
pub fn repack(session: &Session, dest: &Path) -> Result<bool> {
    println!("running repack hooks");
    for hook in session.take_hooks_reversed() {
        hook.run(session)?;
    }

    let outer = session.outer_overlay()?;
    if outer.unchanged()? {
        return Ok(false);
    }

    let fstype = session.outer_fstype().context("outer fstype not probed")?;
    if fstype == "iso9660" {
        repack_iso(session, dest)?;
    } else {
        repack_raw(session, dest)?;
    }
    Ok(true)
}

/// Round-trip the original boot metadata through
/// `xorriso -report_el_torito as_mkisofs` so boot catalogs, hybrid MBR/GPT
/// and partition layout survive the rebuild.
fn repack_iso(session: &Session, dest: &Path) -> Result<()> {
    let report = session.run_cmd_capture(
        Cmd::new("xorriso")
            .arg("-indev")
            .arg_path(&session.source)
            .args(["-report_el_torito", "as_mkisofs"]),
    )?;
    let opts = shlex::split(&report.stdout)
        .context("tokenizing xorriso -report_el_torito output")?;

    println!("writing {}", dest.display());
    session.run_cmd(
        Cmd::new("xorriso")
            .args(["-as", "mkisofs"])
            .args(&opts)
            .arg("-o")
            .arg_path(dest)
            .args(["-V", "Ubuntu custom"])
            .arg_path(&session.p("new/iso")?),
    )?;
    Ok(())
}

/// Raw (non-ISO) images: duplicate the source, then rsync the outer tree
/// into the copy's live partition.
fn repack_raw(session: &Session, dest: &Path) -> Result<()> {
    println!("copying source image to {}", dest.display());
    session.run_cmd(
        Cmd::new("cp")
            .arg_path(&session.source)
            .arg_path(dest),
    )?;

    let device = session.add_loop(dest)?;
    session.run_capture(&["udevadm", "settle"])?;
    let live_dev = find_live_partition(session, &device, dest)?;

    let dest_mount = session.tmpdir()?;
    session.add_mount(None, &live_dev, Some(&dest_mount), None)?;
    println!("syncing new tree into {}", dest.display());
    session.run_cmd(
        Cmd::new("rsync")
            .arg("-axXvHAS")
            .arg(format!("{}/", session.p("new/iso")?.display()))
            .arg(format!("{}/", dest_mount.display())),
    )?;
    Ok(())
}
