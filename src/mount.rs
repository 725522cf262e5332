//! Typed wrappers for the mounts the editor stacks up.
//!
//! Plain, bind, squashfs and overlay mounts all go through [`Session::add_mount`]
//! so that every kernel mountpoint lands in the registry and is unmounted at
//! teardown. Overlay lower stacks compose recursively via [`Lower`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::hooks::PreRepackHook;
use crate::process::Cmd;
use crate::session::Session;

/// A plain mount created by the session.
#[derive(Debug, Clone)]
pub struct Mountpoint {
    /// Filesystem type, or None for autodetect.
    pub fstype: Option<String>,
    /// Device or pseudo-fs source.
    pub source: String,
    /// Kernel mountpoint.
    pub path: PathBuf,
    pub options: Option<String>,
}

/// An overlay mount with session-private upper and work directories.
#[derive(Debug, Clone)]
pub struct OverlayMount {
    /// Resolved lower directories, bottom-most first.
    pub lowers: Vec<PathBuf>,
    pub upper: PathBuf,
    pub work: PathBuf,
    /// Kernel mountpoint of the merged view.
    pub path: PathBuf,
}

impl OverlayMount {
    /// True iff nothing has been written through the overlay.
    ///
    /// An empty upper directory is a constant-time proxy for "no file was
    /// created, modified or whited-out".
    pub fn unchanged(&self) -> Result<bool> {
        Ok(fs::read_dir(&self.upper)?.next().is_none())
    }
}

/// What can serve as the lower side of an overlay.
///
/// Lists are ordered bottom-most first; a nested overlay contributes its own
/// lowers followed by its upper directory.
#[derive(Debug, Clone)]
pub enum Lower {
    Path(PathBuf),
    Mount(Mountpoint),
    Overlay(OverlayMount),
    Stack(Vec<Lower>),
}

impl Lower {
    fn flatten_into(&self, out: &mut Vec<PathBuf>) {
        match self {
            Lower::Path(p) => out.push(p.clone()),
            Lower::Mount(m) => out.push(m.path.clone()),
            Lower::Overlay(o) => {
                out.extend(o.lowers.iter().cloned());
                out.push(o.upper.clone());
            }
            Lower::Stack(list) => {
                for lower in list {
                    lower.flatten_into(out);
                }
            }
        }
    }

    /// Resolve to plain directories, bottom-most first.
    pub fn flatten(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }
}

impl From<PathBuf> for Lower {
    fn from(p: PathBuf) -> Self {
        Lower::Path(p)
    }
}

impl From<&Path> for Lower {
    fn from(p: &Path) -> Self {
        Lower::Path(p.to_path_buf())
    }
}

impl From<&Mountpoint> for Lower {
    fn from(m: &Mountpoint) -> Self {
        Lower::Mount(m.clone())
    }
}

impl From<&OverlayMount> for Lower {
    fn from(o: &OverlayMount) -> Self {
        Lower::Overlay(o.clone())
    }
}

impl From<Vec<Lower>> for Lower {
    fn from(list: Vec<Lower>) -> Self {
        Lower::Stack(list)
    }
}

/// Build the kernel-facing `lowerdir=` value: overlayfs wants the top-most
/// layer first, our stacks are bottom-most first.
pub fn lowerdir_string(lower: &Lower) -> String {
    let mut dirs = lower.flatten();
    dirs.reverse();
    let parts: Vec<String> = dirs
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    parts.join(":")
}

impl Session {
    /// Mount `source` at `mountpoint` (a fresh scratch dir when omitted),
    /// creating the mountpoint if needed and registering it for teardown.
    /// A `fstype` of None lets mount autodetect; the image prober relies
    /// on that.
    pub fn add_mount(
        &self,
        fstype: Option<&str>,
        source: &str,
        mountpoint: Option<&Path>,
        options: Option<&str>,
    ) -> Result<Mountpoint> {
        let path = match mountpoint {
            Some(mp) => mp.to_path_buf(),
            None => self.tmpdir()?,
        };
        if !path.is_dir() {
            fs::create_dir_all(&path)
                .with_context(|| format!("creating mountpoint {}", path.display()))?;
        }
        let mut cmd = Cmd::new("mount");
        if let Some(t) = fstype {
            cmd = cmd.args(["-t", t]);
        }
        cmd = cmd.arg(source);
        if let Some(o) = options {
            cmd = cmd.args(["-o", o]);
        }
        cmd = cmd.arg_path(&path);
        self.run_cmd_capture(cmd)?;
        self.mounts.borrow_mut().push(path.clone());
        Ok(Mountpoint {
            fstype: fstype.map(str::to_string),
            source: source.to_string(),
            path,
            options: options.map(str::to_string),
        })
    }

    /// Stack an overlay over `lowers` at `mountpoint` (a fresh scratch dir
    /// when omitted). Upper and work directories are allocated inside the
    /// session root, so they share a filesystem.
    pub fn add_overlay(&self, lowers: impl Into<Lower>, mountpoint: Option<&Path>) -> Result<OverlayMount> {
        let lower = lowers.into();
        let resolved = lower.flatten();
        let upper = self.tmpdir()?;
        let work = self.tmpdir()?;
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowerdir_string(&lower),
            upper.display(),
            work.display()
        );
        let mount = self.add_mount(Some("overlay"), "overlay", mountpoint, Some(&options))?;
        Ok(OverlayMount {
            lowers: resolved,
            upper,
            work,
            path: mount.path,
        })
    }

    /// Unmount `mountpoint` immediately and drop it from the registry.
    /// Used to discard failed trial mounts during image probing.
    pub fn umount(&self, mountpoint: &Path) -> Result<()> {
        self.run_cmd_capture(Cmd::new("umount").arg_path(mountpoint))?;
        self.mounts.borrow_mut().retain(|m| m != mountpoint);
        Ok(())
    }

    /// Prepare `mountpoint` for chroot use: kernel pseudo filesystems plus a
    /// usable resolv.conf. A pre-repack hook undoes all of it so none of
    /// these transient ingredients leak into a repacked layer.
    pub fn add_sys_mounts(&self, mountpoint: &Path) -> Result<()> {
        let mut mounts = Vec::new();
        for (fstype, rel) in [("devtmpfs", "dev"), ("devpts", "dev/pts"), ("proc", "proc")] {
            let mp = mountpoint.join(rel);
            mounts.push(self.add_mount(Some(fstype), fstype, Some(&mp), None)?.path);
        }
        for sub in sys_submounts(self)? {
            let rel = sub.target.trim_start_matches('/');
            let mp = mountpoint.join(rel);
            mounts.push(
                self.add_mount(Some(&sub.fstype), &sub.fstype, Some(&mp), Some(&sub.options))?
                    .path,
            );
        }

        // DNS inside the chroot: swap in the host's resolv.conf, restore on
        // repack.
        let mut resolv_conf = None;
        let resolv = mountpoint.join("etc/resolv.conf");
        if resolv.exists() || fs::symlink_metadata(&resolv).is_ok() {
            let saved = mountpoint.join("etc/resolv.conf.tmp");
            fs::rename(&resolv, &saved)?;
            fs::copy("/etc/resolv.conf", &resolv)
                .context("copying host resolv.conf into target")?;
            resolv_conf = Some(resolv);
        }

        self.add_pre_repack_hook(PreRepackHook::SysTeardown { mounts, resolv_conf });
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FindmntReport {
    filesystems: Vec<FindmntNode>,
}

#[derive(Debug, Deserialize)]
struct FindmntNode {
    target: String,
    fstype: String,
    options: String,
    #[serde(default)]
    children: Vec<FindmntNode>,
}

/// Flattened description of `/sys` and every submount below it, in
/// parent-before-child order so they can be re-created under a chroot.
struct SysMount {
    target: String,
    fstype: String,
    options: String,
}

fn sys_submounts(session: &Session) -> Result<Vec<SysMount>> {
    let result = session.run_cmd_capture(
        Cmd::new("findmnt").args(["--submounts", "/sys", "--json"]),
    )?;
    let report: FindmntReport =
        serde_json::from_str(&result.stdout).context("parsing findmnt --json output")?;
    let mut out = Vec::new();
    let mut stack: Vec<&FindmntNode> = report.filesystems.iter().collect();
    stack.reverse();
    while let Some(node) = stack.pop() {
        out.push(SysMount {
            target: node.target.clone(),
            fstype: node.fstype.clone(),
            options: node.options.clone(),
        });
        for child in node.children.iter().rev() {
            stack.push(child);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_lower_resolves_to_itself() {
        let lower = Lower::Stack(vec![Lower::Path(PathBuf::from("/x"))]);
        assert_eq!(lowerdir_string(&lower), "/x");
    }

    #[test]
    fn test_second_element_overlays_first() {
        let lower = Lower::Stack(vec![
            Lower::Path(PathBuf::from("/x")),
            Lower::Path(PathBuf::from("/y")),
        ]);
        // overlayfs reads lowerdir top-most first.
        assert_eq!(lowerdir_string(&lower), "/y:/x");
    }

    #[test]
    fn test_nested_overlay_contributes_lowers_then_upper() {
        let nested = OverlayMount {
            lowers: vec![PathBuf::from("/a"), PathBuf::from("/b")],
            upper: PathBuf::from("/u"),
            work: PathBuf::from("/w"),
            path: PathBuf::from("/merged"),
        };
        assert_eq!(lowerdir_string(&Lower::from(&nested)), "/u:/b:/a");

        let stacked = Lower::Stack(vec![
            Lower::from(&nested),
            Lower::Path(PathBuf::from("/top")),
        ]);
        assert_eq!(lowerdir_string(&stacked), "/top:/u:/b:/a");
    }

    #[test]
    fn test_mount_handle_as_lower() {
        let mount = Mountpoint {
            fstype: Some("squashfs".into()),
            source: "whatever".into(),
            path: PathBuf::from("/old/minimal"),
            options: None,
        };
        assert_eq!(lowerdir_string(&Lower::from(&mount)), "/old/minimal");
    }

    #[test]
    fn test_unchanged_tracks_upper_listing() {
        let dir = tempfile::tempdir().unwrap();
        let upper = dir.path().join("upper");
        fs::create_dir(&upper).unwrap();
        let overlay = OverlayMount {
            lowers: vec![],
            upper: upper.clone(),
            work: dir.path().join("work"),
            path: dir.path().join("merged"),
        };
        assert!(overlay.unchanged().unwrap());
        fs::write(upper.join("newfile"), "x").unwrap();
        assert!(!overlay.unchanged().unwrap());
    }

    #[test]
    fn test_findmnt_json_shape() {
        let json = r#"{
            "filesystems": [
                {"target": "/sys", "fstype": "sysfs", "options": "rw", "children": [
                    {"target": "/sys/kernel/security", "fstype": "securityfs", "options": "rw"},
                    {"target": "/sys/fs/cgroup", "fstype": "cgroup2", "options": "rw,nsdelegate"}
                ]}
            ]
        }"#;
        let report: FindmntReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.filesystems[0].children.len(), 2);
        assert_eq!(report.filesystems[0].children[1].fstype, "cgroup2");
    }
}
