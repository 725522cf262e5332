//! Snap seeding: place a snap into the image's seed and re-run snapd
//! preseeding so first boot doesn't redo the work.

use anyhow::{bail, Context, Result};
use glob::glob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::ActionArgs;
use crate::process::Cmd;
use crate::rootfs;
use crate::session::{CacheValue, Session};

/// The slice of `meta/snap.yaml` we care about.
#[derive(Debug, Deserialize)]
struct SnapMeta {
    name: String,
    #[serde(default)]
    confinement: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Seed {
    snaps: Vec<SeedSnap>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SeedSnap {
    name: String,
    file: String,
    channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    classic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unasserted: Option<bool>,
    /// Fields snapd knows about and we don't; round-tripped untouched.
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

pub fn inject_snap(session: &Session, args: &ActionArgs) -> Result<()> {
    inject(session, Path::new(args.str("snap")), args.str("channel"))
}

/// Fetch a snap from the store and inject it.
pub fn add_snap_from_store(session: &Session, args: &ActionArgs) -> Result<()> {
    let snap_name = args.str("snap_name");
    let channel = args.str("channel");
    let download_dir = session.tmpdir()?;
    session.run_cmd(
        Cmd::new("snap")
            .arg("download")
            .arg(format!("--channel={channel}"))
            .arg(snap_name)
            .dir(&download_dir),
    )?;
    let pattern = download_dir.join("*.snap");
    let snap_path = glob(&pattern.to_string_lossy())?
        .next()
        .context("snap download produced no .snap file")??;
    inject(session, &snap_path, channel)
}

fn inject(session: &Session, snap_path: &Path, channel: &str) -> Result<()> {
    let root = rootfs::setup_rootfs(session, "rootfs")?;
    let seed_dir = root.join("var/lib/snapd/seed");
    if !seed_dir.is_dir() {
        bail!("image has no snap seed at var/lib/snapd/seed");
    }

    let mount = session.add_mount(
        Some("squashfs"),
        &snap_path.to_string_lossy(),
        None,
        None,
    )?;
    let meta: SnapMeta =
        serde_yaml::from_str(&fs::read_to_string(mount.path.join("meta/snap.yaml"))?)
            .context("parsing meta/snap.yaml")?;

    let snap_file = format!("{}_injected", meta.name);
    let mut new_snap = SeedSnap {
        name: meta.name.clone(),
        file: format!("{snap_file}.snap"),
        channel: channel.to_string(),
        classic: (meta.confinement.as_deref() == Some("classic")).then_some(true),
        unasserted: None,
        extra: BTreeMap::new(),
    };

    let seed_yaml = seed_dir.join("seed.yaml");
    let old_seed: Seed = serde_yaml::from_str(&fs::read_to_string(&seed_yaml)?)
        .context("parsing seed.yaml")?;

    // Drop any previously seeded revision of the same snap, files included.
    let mut snaps = Vec::new();
    for seeded in old_seed.snaps {
        if seeded.name == meta.name {
            let base = seeded.file.strip_suffix(".snap").unwrap_or(&seeded.file);
            for stale in [
                seed_dir.join(format!("snaps/{base}.snap")),
                seed_dir.join(format!("assertions/{base}.assert")),
            ] {
                if stale.exists() {
                    fs::remove_file(&stale)?;
                }
            }
        } else {
            snaps.push(seeded);
        }
    }

    fs::copy(snap_path, seed_dir.join(format!("snaps/{snap_file}.snap")))?;
    let assert_file = snap_path.with_extension("assert");
    if assert_file.exists() {
        fs::copy(
            &assert_file,
            seed_dir.join(format!("assertions/{snap_file}.assert")),
        )?;
    } else {
        new_snap.unasserted = Some(true);
    }

    snaps.push(new_snap);
    fs::write(&seed_yaml, serde_yaml::to_string(&Seed { snaps })?)?;

    // Re-run preseeding so the seed change takes effect on first boot.
    // The reset only needs to happen once however many snaps we inject.
    let root_str = root.to_string_lossy().into_owned();
    if !matches!(session.cache_get("preseed-done"), Some(CacheValue::Flag(true))) {
        session.run(&["/usr/lib/snapd/snap-preseed", "--reset", root_str.as_str()])?;
        session.cache_put("preseed-done", CacheValue::Flag(true));
    }
    session.run(&["/usr/lib/snapd/snap-preseed", root_str.as_str()])?;
    Ok(())
}
