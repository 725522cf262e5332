//! Deferred pre-repack work.
//!
//! Mutating operations do not materialize their results immediately; they
//! push a [`PreRepackHook`] instead. The repack driver pops the stack in
//! reverse registration order, which guarantees that chroot scaffolding
//! (pseudo filesystems, resolv.conf swaps) is gone before any layer is read
//! back into a new squashfs.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::cmdline;
use crate::initrd;
use crate::layers::{LayerfsPointer, PointerSource};
use crate::mount::OverlayMount;
use crate::process::Cmd;
use crate::session::{CacheValue, Session};

/// A deferred action registered during mutation; runs exactly once at repack.
#[derive(Debug)]
pub enum PreRepackHook {
    /// Unmount chroot pseudo filesystems and restore the target's own
    /// resolv.conf.
    SysTeardown {
        /// Mountpoints in creation order; unmounted in reverse.
        mounts: Vec<PathBuf>,
        /// `etc/resolv.conf` inside the target, to restore from its
        /// `.tmp` sibling.
        resolv_conf: Option<PathBuf>,
    },
    /// Rewrite one squashfs layer from its writable overlay.
    SquashRepack { name: String, overlay: OverlayMount },
    /// Emit the upper of the combined rootfs overlay as a new top layer and
    /// point the boot configuration at it.
    RootfsRepack {
        overlay: OverlayMount,
        new_name: String,
        pointer: LayerfsPointer,
    },
    /// Rebuild the initrd from its unpacked overlay.
    InitrdRepack {
        overlay: OverlayMount,
        /// Outer-tree initrd path (e.g. `casper/initrd`).
        initrd_rel: String,
        /// Whether the unpacked tree has `early`/`main` segments.
        multi: bool,
    },
}

impl PreRepackHook {
    pub fn run(self, session: &Session) -> Result<()> {
        match self {
            PreRepackHook::SysTeardown { mounts, resolv_conf } => {
                for mp in mounts.iter().rev() {
                    session.umount(mp)?;
                }
                if let Some(resolv) = resolv_conf {
                    let saved = resolv.with_extension("conf.tmp");
                    fs::rename(&saved, &resolv)
                        .with_context(|| format!("restoring {}", resolv.display()))?;
                }
                Ok(())
            }

            PreRepackHook::SquashRepack { name, overlay } => {
                scrub_transient_resolv(&overlay);
                if overlay.unchanged()? {
                    return Ok(());
                }
                let target = session.p(format!("new/iso/casper/{name}.squashfs"))?;
                if target.exists() {
                    fs::remove_file(&target)?;
                }
                println!("repacking {name}.squashfs...");
                session.run_cmd(
                    Cmd::new("mksquashfs")
                        .arg_path(&overlay.path)
                        .arg_path(&target),
                )?;
                Ok(())
            }

            PreRepackHook::RootfsRepack {
                overlay,
                new_name,
                pointer,
            } => {
                scrub_transient_resolv(&overlay);
                if overlay.unchanged()? {
                    return Ok(());
                }
                let target = session.p(format!("new/iso/casper/{new_name}.squashfs"))?;
                if target.exists() {
                    fs::remove_file(&target)?;
                }
                println!("packing new layer {new_name}.squashfs...");
                session.run_cmd(
                    Cmd::new("mksquashfs")
                        .arg_path(&overlay.upper)
                        .arg_path(&target),
                )?;
                match pointer.source {
                    PointerSource::Cmdline => {
                        cmdline::add_cmdline_arg(
                            session,
                            &format!("layerfs-path={new_name}.squashfs"),
                            false,
                        )?;
                    }
                    PointerSource::Initrd => {
                        let tree = match session.cache_get("initrd") {
                            Some(CacheValue::Path(p)) => p,
                            _ => anyhow::bail!("initrd tree missing for layer pointer update"),
                        };
                        let conf_dir = if tree.join("main").is_dir() {
                            tree.join("main/conf/conf.d")
                        } else {
                            tree.join("conf/conf.d")
                        };
                        fs::create_dir_all(&conf_dir)?;
                        fs::write(
                            conf_dir.join("default-layer.conf"),
                            format!("LAYERFS_PATH={new_name}.squashfs\n"),
                        )?;
                    }
                    PointerSource::None => {}
                }
                Ok(())
            }

            PreRepackHook::InitrdRepack {
                overlay,
                initrd_rel,
                multi,
            } => {
                if overlay.unchanged()? {
                    // Don't slowly repack the initrd if no changes were made.
                    return Ok(());
                }
                println!("repacking initrd...");
                let out_path = session.p(format!("new/iso/{initrd_rel}"))?;
                let out = fs::File::create(&out_path)
                    .with_context(|| format!("creating {}", out_path.display()))?;
                if multi {
                    for segment in initrd::segment_dirs(&overlay.path)? {
                        let name = segment
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        println!("  packing {name}");
                        initrd::pack_for_initrd(&segment, name == "main", &out)?;
                    }
                } else {
                    initrd::pack_for_initrd(&overlay.path, true, &out)?;
                }
                println!("  ... done");
                Ok(())
            }
        }
    }
}

/// Drop the resolv.conf artifacts that the sys-mount swap leaves in an
/// overlay upper, so an otherwise untouched layer still reads as unchanged
/// and the repacked layer ships its own resolv.conf.
fn scrub_transient_resolv(overlay: &OverlayMount) {
    let upper_etc = overlay.upper.join("etc");
    let upper_resolv = upper_etc.join("resolv.conf");

    if let Ok(meta) = fs::symlink_metadata(&upper_resolv) {
        if meta.file_type().is_file() {
            if let Ok(upper_bytes) = fs::read(&upper_resolv) {
                // Compare against the top-most lower that carries the file.
                for lower in overlay.lowers.iter().rev() {
                    let lower_resolv = lower.join("etc/resolv.conf");
                    if let Ok(lower_bytes) = fs::read(&lower_resolv) {
                        if lower_bytes == upper_bytes {
                            let _ = fs::remove_file(&upper_resolv);
                        }
                        break;
                    }
                }
            }
        }
    }
    // The rename dance can leave a whiteout behind.
    let leftover = upper_etc.join("resolv.conf.tmp");
    if fs::symlink_metadata(&leftover).is_ok() {
        let _ = fs::remove_file(&leftover);
    }
    let _ = fs::remove_dir(&upper_etc);
}
