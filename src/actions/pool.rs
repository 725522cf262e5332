//! Apt pool maintenance: adding debs, pulling packages from the archive,
//! installing into the rootfs, and re-signing the repository metadata.
//!
//! The pool indexes are regenerated with `apt-ftparchive`; the existing
//! Release file is merged field-by-field with the regenerated one so
//! image-specific fields survive while checksums are refreshed.

use anyhow::{bail, Context, Result};
use glob::glob;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use walkdir::WalkDir;

use super::ActionArgs;
use crate::mount::Lower;
use crate::process::{Cmd, SubprocessError};
use crate::session::Session;
use crate::{layers, rootfs};

pub fn add_debs_to_pool(session: &Session, args: &ActionArgs) -> Result<()> {
    let debs: Vec<PathBuf> = args.list("debs").iter().map(PathBuf::from).collect();
    add_debs(session, &debs)
}

/// Copy debs into `pool/main` and regenerate the `Packages.gz` and Release
/// indexes. Stale detached signatures are dropped; re-sign with the
/// sign-pool action if the image verifies its pool.
pub fn add_debs(session: &Session, debs: &[PathBuf]) -> Result<()> {
    let pool = session.p("new/iso/pool/main")?;
    fs::create_dir_all(&pool)?;
    for deb in debs {
        let name = deb
            .file_name()
            .with_context(|| format!("odd deb path {}", deb.display()))?;
        fs::copy(deb, pool.join(name))
            .with_context(|| format!("copying {}", deb.display()))?;
    }

    let arch = session.get_arch()?;
    let suite = session.get_suite()?;
    let new_iso = session.p("new/iso")?;

    let packages = session.run_cmd_capture(
        Cmd::new("apt-ftparchive")
            .args(["--md5=off", "--sha1=off", "packages", "pool/main"])
            .dir(&new_iso),
    )?;
    let packages_gz = session.p(format!("new/iso/dists/{suite}/main/binary-{arch}/Packages.gz"))?;
    if let Some(parent) = packages_gz.parent() {
        fs::create_dir_all(parent)?;
    }
    gzip_to_file(packages.stdout.as_bytes(), &packages_gz)?;

    let release_path = session.p(format!("new/iso/dists/{suite}/Release"))?;
    let old_release = Deb822::parse(&fs::read_to_string(&release_path)?);
    for stale in ["Release.gpg", "InRelease"] {
        let path = release_path.with_file_name(stale);
        if path.exists() {
            fs::remove_file(&path)?;
        }
    }

    let regenerated = session.run_cmd_capture(
        Cmd::new("apt-ftparchive")
            .args(["--md5=off", "--sha1=off", "--sha512=off", "release"])
            .arg(format!("dists/{suite}"))
            .dir(&new_iso),
    )?;
    let new_release = Deb822::parse(&regenerated.stdout);
    let merged = old_release.updated_from(&new_release);
    fs::write(&release_path, merged.render())?;
    Ok(())
}

/// Download `packages` (and any dependencies missing from the pool) via apt
/// in a throwaway chroot over all layers, then add them to the pool.
pub fn add_packages_to_pool(session: &Session, args: &ActionArgs) -> Result<()> {
    let packages = args.list("packages");
    if packages.is_empty() {
        bail!("add-packages-to-pool: no packages given");
    }

    let names = layers::get_squash_names(session)?;
    let mut lowers = Vec::new();
    for name in &names {
        lowers.push(Lower::Mount(layers::mount_squash(session, name)?));
    }
    // Scratch overlay, deliberately without a repack hook: apt state
    // accumulated here must not end up in any layer.
    let overlay = session.add_overlay(Lower::Stack(lowers), None)?;
    session.add_sys_mounts(&overlay.path)?;

    println!("  ** running apt update **");
    session.run_cmd(
        Cmd::new("chroot")
            .arg_path(&overlay.path)
            .args(["apt-get", "update"]),
    )?;
    println!("  ** apt update done **");

    let archive_rel = "tmp/pool-debs";
    fs::create_dir_all(overlay.path.join(archive_rel))?;
    session.run_cmd(
        Cmd::new("chroot")
            .arg_path(&overlay.path)
            .args(["apt-get", "install", "--download-only", "--yes"])
            .arg("-o")
            .arg(format!("Dir::Cache::archives=/{archive_rel}"))
            .args(packages),
    )?;

    let mut pool_debs = HashSet::new();
    let pool = session.p("new/iso/pool")?;
    for entry in WalkDir::new(&pool).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            pool_debs.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }

    let mut new_debs = Vec::new();
    for entry in fs::read_dir(overlay.path.join(archive_rel))? {
        let path = entry?.path();
        let is_deb = path.extension().map(|e| e == "deb").unwrap_or(false);
        if !is_deb {
            continue;
        }
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if !pool_debs.contains(&name) {
            new_debs.push(path);
        }
    }
    println!("adding {} new debs to pool", new_debs.len());
    add_debs(session, &new_debs)
}

/// Install debs straight into the combined rootfs (becoming part of the
/// new top layer).
pub fn install_debs(session: &Session, args: &ActionArgs) -> Result<()> {
    let root = rootfs::setup_rootfs(session, "rootfs")?;
    for deb in args.list("debs") {
        let deb = Path::new(deb);
        let name = deb
            .file_name()
            .with_context(|| format!("odd deb path {}", deb.display()))?
            .to_string_lossy()
            .into_owned();
        fs::copy(deb, root.join(&name))?;
        session.run_cmd(
            Cmd::new("chroot")
                .arg_path(&root)
                .args(["dpkg", "-i"])
                .arg(format!("/{name}")),
        )?;
        fs::remove_file(root.join(&name))?;
    }
    Ok(())
}

/// Re-sign every Release file in the outer tree with the given secret key,
/// producing both the detached `Release.gpg` and the inline `InRelease`.
pub fn sign_pool(session: &Session, args: &ActionArgs) -> Result<()> {
    let key = args.str("key");
    let gpg_home = session.tmpdir()?;
    let home = gpg_home.to_string_lossy().into_owned();

    session.run_cmd_capture(
        Cmd::new("gpg")
            .args(["--homedir", home.as_str(), "--batch", "--import", key]),
    )?;

    let pattern = session.p("new/iso/dists/*/Release")?;
    let mut signed = 0;
    for entry in glob(&pattern.to_string_lossy())? {
        let release = entry?;
        let release_gpg = release.with_file_name("Release.gpg");
        let inrelease = release.with_file_name("InRelease");
        for stale in [&release_gpg, &inrelease] {
            if stale.exists() {
                fs::remove_file(stale)?;
            }
        }
        session.run_cmd_capture(
            Cmd::new("gpg")
                .args(["--homedir", home.as_str(), "--batch", "--yes", "--armor"])
                .args(["--detach-sign", "--output"])
                .arg_path(&release_gpg)
                .arg_path(&release),
        )?;
        session.run_cmd_capture(
            Cmd::new("gpg")
                .args(["--homedir", home.as_str(), "--batch", "--yes"])
                .args(["--clearsign", "--output"])
                .arg_path(&inrelease)
                .arg_path(&release),
        )?;
        signed += 1;
    }
    if signed == 0 {
        bail!("sign-pool: no Release files found under new/iso/dists");
    }
    Ok(())
}

/// Pipe bytes through the gzip binary into `out`.
fn gzip_to_file(bytes: &[u8], out: &Path) -> Result<()> {
    let file = fs::File::create(out)?;
    let mut child = Command::new("gzip")
        .stdin(Stdio::piped())
        .stdout(Stdio::from(file))
        .spawn()
        .context("spawning gzip")?;
    {
        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin.write_all(bytes)?;
    }
    let status = child.wait()?;
    if !status.success() {
        return Err(SubprocessError {
            argv: vec!["gzip".to_string()],
            code: status.code().unwrap_or(-1),
            stdout: String::new(),
            stderr: String::new(),
        }
        .into());
    }
    Ok(())
}

/// A single deb822 paragraph, preserving field order and continuation
/// lines byte-for-byte.
#[derive(Debug, Clone)]
pub struct Deb822 {
    fields: Vec<(String, String)>,
}

impl Deb822 {
    pub fn parse(text: &str) -> Self {
        let mut fields: Vec<(String, String)> = Vec::new();
        for line in text.lines() {
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((_, value)) = fields.last_mut() {
                    value.push('\n');
                    value.push_str(line);
                }
            } else if let Some((key, rest)) = line.split_once(':') {
                fields.push((key.to_string(), rest.to_string()));
            }
        }
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim_start().lines().next().unwrap_or("").trim())
    }

    /// A copy of self where every field also present in `other` takes
    /// `other`'s value.
    pub fn updated_from(&self, other: &Deb822) -> Deb822 {
        let fields = self
            .fields
            .iter()
            .map(|(key, value)| {
                let value = other
                    .fields
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| value.clone());
                (key.clone(), value)
            })
            .collect();
        Deb822 { fields }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}
