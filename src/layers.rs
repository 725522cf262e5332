//! SquashFS layer discovery and per-layer editing.
//!
//! Layered images name their top squash file on the kernel command line
//! (`layerfs-path=`) or in the initrd's `default-layer.conf`; the chain of
//! layers below it follows from the dotted file name. Non-layered images
//! just stack everything under `casper/` in lexicographic order.

use anyhow::{bail, Result};
use glob::glob;
use std::fs;
use std::path::PathBuf;

use crate::cmdline;
use crate::hooks::PreRepackHook;
use crate::initrd;
use crate::mount::{Lower, Mountpoint};
use crate::session::{CacheValue, Session};

/// Where the boot-time top-layer pointer was found; tells the rootfs
/// composer where to write the updated pointer when a new layer is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerSource {
    None,
    Cmdline,
    Initrd,
}

#[derive(Debug, Clone)]
pub struct LayerfsPointer {
    pub value: Option<String>,
    pub source: PointerSource,
}

/// Locate the boot-time `layerfs-path` value. Tries the kernel command line
/// first; falls back to the initrd's `conf/conf.d/default-layer.conf`
/// (unpacking the initrd on demand). Memoized.
pub fn get_layerfs_path(session: &Session) -> Result<LayerfsPointer> {
    if let Some(CacheValue::Pointer(pointer)) = session.cache_get("layerfs-path") {
        return Ok(pointer);
    }

    let pointer = if let Some(value) = cmdline::get_cmdline_arg(session, "layerfs-path")? {
        LayerfsPointer {
            value: Some(value),
            source: PointerSource::Cmdline,
        }
    } else {
        let tree = initrd::unpack_initrd(session, "initrd")?;
        let mut found = None;
        for candidate in [
            tree.join("main/conf/conf.d/default-layer.conf"),
            tree.join("conf/conf.d/default-layer.conf"),
        ] {
            if let Ok(text) = fs::read_to_string(&candidate) {
                found = parse_default_layer_conf(&text);
                if found.is_some() {
                    break;
                }
            }
        }
        match found {
            Some(value) => LayerfsPointer {
                value: Some(value),
                source: PointerSource::Initrd,
            },
            None => LayerfsPointer {
                value: None,
                source: PointerSource::None,
            },
        }
    };

    session.cache_put("layerfs-path", CacheValue::Pointer(pointer.clone()));
    Ok(pointer)
}

/// The ordered chain of squash layer basenames, highest-precedence last.
/// Memoized.
pub fn get_squash_names(session: &Session) -> Result<Vec<String>> {
    if let Some(CacheValue::Names(names)) = session.cache_get("squash-names") {
        return Ok(names);
    }

    let pointer = get_layerfs_path(session)?;
    let names = match pointer.value {
        Some(ref layerfs_path) => names_from_layerfs_path(layerfs_path),
        None => {
            let pattern = session.p("old/iso/casper/*.squashfs")?;
            let mut names = Vec::new();
            for entry in glob(&pattern.to_string_lossy())? {
                let path = entry?;
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().into_owned());
                }
            }
            names.sort();
            names
        }
    };

    session.cache_put("squash-names", CacheValue::Names(names.clone()));
    Ok(names)
}

/// `a.b.c.squashfs` boots by stacking `a`, then `a.b`, then `a.b.c`.
fn names_from_layerfs_path(layerfs_path: &str) -> Vec<String> {
    let base = layerfs_path
        .strip_suffix(".squashfs")
        .unwrap_or(layerfs_path);
    let mut names = Vec::new();
    let mut acc = String::new();
    for part in base.split('.') {
        if !acc.is_empty() {
            acc.push('.');
        }
        acc.push_str(part);
        names.push(acc.clone());
    }
    names
}

/// Mount the named squash layer read-only at `old/<name>`. A name is
/// mounted at most once; later calls return the cached handle.
pub fn mount_squash(session: &Session, name: &str) -> Result<Mountpoint> {
    let key = format!("squash-{name}");
    if let Some(CacheValue::Mount(mount)) = session.cache_get(&key) {
        return Ok(mount);
    }

    let squash_file = session.p(format!("old/iso/casper/{name}.squashfs"))?;
    if !squash_file.exists() {
        bail!("no such squashfs layer: {}", squash_file.display());
    }
    let mountpoint = session.p(format!("old/{name}"))?;
    let mount = session.add_mount(
        Some("squashfs"),
        &squash_file.to_string_lossy(),
        Some(&mountpoint),
        None,
    )?;
    session.cache_put(&key, CacheValue::Mount(mount.clone()));
    Ok(mount)
}

/// Stack a writable overlay over the named layer at `new/<name>` and defer
/// a repack of that one squashfs. Idempotent; the overlay and its hook are
/// created at most once.
pub fn edit_squashfs(session: &Session, name: &str, add_sys_mounts: bool) -> Result<PathBuf> {
    let key = format!("edit-squashfs-{name}");
    if let Some(CacheValue::Path(path)) = session.cache_get(&key) {
        return Ok(path);
    }

    let squash = mount_squash(session, name)?;
    let target = session.p(format!("new/{name}"))?;
    let overlay = session.add_overlay(Lower::from(&squash), Some(&target))?;
    session.add_pre_repack_hook(PreRepackHook::SquashRepack {
        name: name.to_string(),
        overlay,
    });
    if add_sys_mounts {
        session.add_sys_mounts(&target)?;
    }
    session.cache_put(&key, CacheValue::Path(target.clone()));
    Ok(target)
}

/// Find the layer that carries the kernel modules, for kernel replacement.
pub fn find_modules_layer(session: &Session) -> Result<String> {
    for name in get_squash_names(session)? {
        let mount = mount_squash(session, &name)?;
        let modules = mount.path.join("usr/lib/modules");
        let has_modules = modules
            .read_dir()
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if has_modules {
            return Ok(name);
        }
    }
    Err(crate::error::EditError::NoModulesLayer.into())
}

/// Parse `LAYERFS_PATH=value` out of a default-layer.conf body.
fn parse_default_layer_conf(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix("LAYERFS_PATH="))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progressive_prefixes() {
        assert_eq!(
            names_from_layerfs_path("minimal.standard.live.squashfs"),
            vec!["minimal", "minimal.standard", "minimal.standard.live"]
        );
    }

    #[test]
    fn test_single_component() {
        assert_eq!(names_from_layerfs_path("minimal.squashfs"), vec!["minimal"]);
    }

    #[test]
    fn test_suffix_optional() {
        assert_eq!(names_from_layerfs_path("a.b"), vec!["a", "a.b"]);
    }

    #[test]
    fn test_parse_default_layer_conf() {
        let conf = "# casper layer selection\nLAYERFS_PATH=minimal.standard.squashfs\n";
        assert_eq!(
            parse_default_layer_conf(conf),
            Some("minimal.standard.squashfs".to_string())
        );
        assert_eq!(parse_default_layer_conf("OTHER=x\n"), None);
        assert_eq!(parse_default_layer_conf("LAYERFS_PATH=\n"), None);
    }

    #[test]
    fn test_squash_names_memoized_without_rescan() {
        let session = Session::new(std::path::Path::new("/dev/null"), false).unwrap();
        // Prime the caches directly; two successive calls must not touch the
        // filesystem again (there is nothing on disk to scan here).
        session.cache_put(
            "squash-names",
            CacheValue::Names(vec!["minimal".into(), "minimal.standard".into()]),
        );
        let first = get_squash_names(&session).unwrap();
        let second = get_squash_names(&session).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec!["minimal", "minimal.standard"]);
    }

    #[test]
    fn test_squash_names_from_casper_glob() {
        let session = Session::new(std::path::Path::new("/dev/null"), false).unwrap();
        session.cache_put(
            "layerfs-path",
            CacheValue::Pointer(LayerfsPointer {
                value: None,
                source: PointerSource::None,
            }),
        );
        let casper = session.p("old/iso/casper").unwrap();
        fs::create_dir_all(&casper).unwrap();
        fs::write(casper.join("filesystem.squashfs"), "").unwrap();
        fs::write(casper.join("installer.squashfs"), "").unwrap();
        assert_eq!(
            get_squash_names(&session).unwrap(),
            vec!["filesystem", "installer"]
        );
    }
}
