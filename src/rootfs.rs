//! The combined "installed system view": every squash layer stacked under
//! one writable overlay, with chroot scaffolding on top.
//!
//! Anything an action writes through this overlay becomes a brand new top
//! layer at repack, and the boot-time layer pointer is moved to it.

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::hooks::PreRepackHook;
use crate::layers;
use crate::mount::Lower;
use crate::session::{CacheValue, Session};

/// Build (once) the all-layers overlay at `<root>/<target>` and register
/// the new-top-layer repack hook. Returns the merged mountpoint.
pub fn setup_rootfs(session: &Session, target: &str) -> Result<PathBuf> {
    if let Some(CacheValue::Path(path)) = session.cache_get("rootfs") {
        return Ok(path);
    }

    let names = layers::get_squash_names(session)?;
    if names.is_empty() {
        bail!("no squashfs layers found under casper/");
    }
    let mut lowers = Vec::new();
    for name in &names {
        lowers.push(Lower::Mount(layers::mount_squash(session, name)?));
    }
    let mountpoint = session.p(target)?;
    let overlay = session.add_overlay(Lower::Stack(lowers), Some(&mountpoint))?;

    let pointer = layers::get_layerfs_path(session)?;
    let new_name = new_top_name(&names, pointer.value.is_some());
    session.add_pre_repack_hook(PreRepackHook::RootfsRepack {
        overlay,
        new_name,
        pointer,
    });
    session.add_sys_mounts(&mountpoint)?;

    session.cache_put("rootfs", CacheValue::Path(mountpoint.clone()));
    Ok(mountpoint)
}

/// Name for the layer that will hold the overlay's upper.
///
/// Layered images get a `.custom` suffix on the current top. Plain casper
/// images mount every `casper/*.squashfs` in lexicographic order with the
/// last one winning, so bumping the first character of the current top
/// name makes the new file sort (and thus stack) above it.
fn new_top_name(names: &[String], layered: bool) -> String {
    let top = names.last().expect("names checked non-empty");
    if layered {
        format!("{top}.custom")
    } else {
        let mut chars = top.chars();
        let head = chars.next().expect("layer names are non-empty");
        match char::from_u32(head as u32 + 1) {
            Some(bumped) => format!("{bumped}{}", chars.as_str()),
            None => format!("{top}.custom"),
        }
    }
}
