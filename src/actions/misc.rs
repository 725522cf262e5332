//! Workspace plumbing actions: rootfs/squashfs/cmdline/initrd access,
//! an inspection shell, and host-file copies.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::ActionArgs;
use crate::process::Cmd;
use crate::session::Session;
use crate::{cmdline, initrd, layers, rootfs};

pub fn setup_rootfs(session: &Session, args: &ActionArgs) -> Result<()> {
    rootfs::setup_rootfs(session, args.str("target"))?;
    Ok(())
}

/// Drop into bash (or run one command) with the session root as cwd, for
/// poking at the mounted workspace.
pub fn shell(session: &Session, args: &ActionArgs) -> Result<()> {
    let mut cmd = Cmd::new("bash").dir(session.root());
    match args.opt_str("command") {
        Some(command) if !command.is_empty() => {
            cmd = cmd.args(["-c", command]);
        }
        _ => {}
    }
    session.run_cmd(cmd)?;
    Ok(())
}

pub fn cp(session: &Session, args: &ActionArgs) -> Result<()> {
    let source = Path::new(args.str("source"));
    let dest = session.p(args.str("dest"))?;
    fs::copy(source, &dest)
        .with_context(|| format!("copying {} to {}", source.display(), dest.display()))?;
    Ok(())
}

pub fn add_cmdline_arg(session: &Session, args: &ActionArgs) -> Result<()> {
    cmdline::add_cmdline_arg(session, args.str("arg"), args.flag("persist"))
}

pub fn edit_squashfs(session: &Session, args: &ActionArgs) -> Result<()> {
    layers::edit_squashfs(session, args.str("squash_name"), args.flag("add_sys_mounts"))?;
    Ok(())
}

/// Ship an autoinstall config in the installed-system root and boot the
/// live session with the (non-persistent) `autoinstall` argument.
pub fn add_autoinstall_config(session: &Session, args: &ActionArgs) -> Result<()> {
    let config = Path::new(args.str("autoinstall_config"));
    let root = rootfs::setup_rootfs(session, "rootfs")?;
    fs::copy(config, root.join("autoinstall.yaml"))
        .with_context(|| format!("copying {}", config.display()))?;
    cmdline::add_cmdline_arg(session, "autoinstall", false)
}

pub fn unpack_initrd(session: &Session, args: &ActionArgs) -> Result<()> {
    initrd::unpack_initrd(session, args.str("target"))?;
    Ok(())
}
