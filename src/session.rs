//! The edit session: one per invocation.
//!
//! A [`Session`] owns a private temp root, the registry of every kernel
//! resource created during the run (mounts, loop devices), the stack of
//! deferred pre-repack hooks, and a memoization map for derivations that
//! must be computed at most once (rootfs, initrd, layer names, ...).
//!
//! Everything the session creates is torn down on every exit path:
//! mounts are unmounted in reverse order (degrading to lazy unmount),
//! the temp root is deleted, loop devices are detached.

use anyhow::{bail, Context, Result};
use glob::glob;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use crate::error::EditError;
use crate::hooks::PreRepackHook;
use crate::layers::LayerfsPointer;
use crate::mount::{Mountpoint, OverlayMount};
use crate::process::{Cmd, CommandResult};

/// A loop device attached for the lifetime of the session.
#[derive(Debug, Clone)]
pub struct LoopDevice {
    pub device: String,
    pub backing: PathBuf,
}

/// A memoized derivation handle, keyed by name in [`Session::cache`].
#[derive(Debug, Clone)]
pub enum CacheValue {
    Path(PathBuf),
    Mount(Mountpoint),
    Overlay(OverlayMount),
    Names(Vec<String>),
    Pointer(LayerfsPointer),
    Flag(bool),
}

pub struct Session {
    /// The image being edited.
    pub source: PathBuf,
    /// Echo every subprocess invocation (temp root redacted to `${BASE}`).
    pub debug: bool,
    root: PathBuf,
    tmp: RefCell<Option<tempfile::TempDir>>,
    tmp_counter: Cell<u32>,
    pub(crate) mounts: RefCell<Vec<PathBuf>>,
    pub(crate) loops: RefCell<Vec<LoopDevice>>,
    hooks: RefCell<Vec<PreRepackHook>>,
    cache: RefCell<HashMap<String, CacheValue>>,
    /// Filesystem type of the live partition (e.g. "iso9660"), set by the opener.
    pub(crate) outer_fstype: RefCell<Option<String>>,
    /// The outer-tree overlay at `new/iso`, set by the opener.
    pub(crate) outer_overlay: RefCell<Option<OverlayMount>>,
    torn_down: Cell<bool>,
}

impl Session {
    pub fn new(source: &Path, debug: bool) -> Result<Self> {
        let tmp = tempfile::Builder::new()
            .prefix("liviso-")
            .tempdir()
            .context("creating session temp root")?;
        let root = tmp.path().to_path_buf();
        fs::create_dir(root.join(".tmp"))?;
        Ok(Self {
            source: source.to_path_buf(),
            debug,
            root,
            tmp: RefCell::new(Some(tmp)),
            tmp_counter: Cell::new(0),
            mounts: RefCell::new(Vec::new()),
            loops: RefCell::new(Vec::new()),
            hooks: RefCell::new(Vec::new()),
            cache: RefCell::new(HashMap::new()),
            outer_fstype: RefCell::new(None),
            outer_overlay: RefCell::new(None),
            torn_down: Cell::new(false),
        })
    }

    /// The session's private root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join `rel` onto the session root. Absolute components are rejected
    /// so unsanitized action arguments cannot escape the workspace.
    pub fn p(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        let rel = rel.as_ref();
        if rel.is_absolute() {
            return Err(EditError::AbsolutePath(rel.to_path_buf()).into());
        }
        Ok(self.root.join(rel))
    }

    /// Create a fresh scratch directory (mode 0755) under `<root>/.tmp`.
    pub fn tmpdir(&self) -> Result<PathBuf> {
        let n = self.tmp_counter.get();
        self.tmp_counter.set(n + 1);
        let dir = self.root.join(".tmp").join(format!("tmp{n}"));
        fs::DirBuilder::new().mode(0o755).create(&dir)?;
        Ok(dir)
    }

    /// Return a candidate scratch file path without creating the file.
    pub fn tmpfile(&self) -> PathBuf {
        let n = self.tmp_counter.get();
        self.tmp_counter.set(n + 1);
        self.root.join(".tmp").join(format!("file{n}"))
    }

    // -------------------------------------------------------------------
    // Subprocess invocation
    // -------------------------------------------------------------------

    /// Run a command, streaming its output to the terminal.
    pub fn run<S: AsRef<str>>(&self, argv: &[S]) -> Result<CommandResult> {
        self.run_cmd(Cmd::from_argv(argv))
    }

    /// Run a command, capturing stdout and stderr as UTF-8 text.
    pub fn run_capture<S: AsRef<str>>(&self, argv: &[S]) -> Result<CommandResult> {
        self.run_cmd_capture(Cmd::from_argv(argv))
    }

    /// Run a prepared [`Cmd`], streaming output.
    pub fn run_cmd(&self, cmd: Cmd) -> Result<CommandResult> {
        self.log_cmd(&cmd);
        cmd.run_interactive()
    }

    /// Run a prepared [`Cmd`], capturing output.
    pub fn run_cmd_capture(&self, cmd: Cmd) -> Result<CommandResult> {
        self.log_cmd(&cmd);
        cmd.run()
    }

    fn log_cmd(&self, cmd: &Cmd) {
        if !self.debug {
            return;
        }
        let base = self.root.to_string_lossy();
        let line: Vec<String> = cmd
            .argv()
            .iter()
            .map(|a| a.replace(base.as_ref(), "${BASE}"))
            .collect();
        eprintln!("+ {}", line.join(" "));
    }

    // -------------------------------------------------------------------
    // Resource registry
    // -------------------------------------------------------------------

    /// Attach `file` to a fresh loop device (with partition scanning) and
    /// register it for detach at teardown. Returns the device path.
    pub fn add_loop(&self, file: &Path) -> Result<String> {
        let result = self.run_cmd_capture(
            Cmd::new("losetup")
                .args(["--show", "--find", "--partscan"])
                .arg_path(file),
        )?;
        let device = result.stdout_trimmed().to_string();
        if device.is_empty() {
            bail!("losetup reported no device for {}", file.display());
        }
        self.loops.borrow_mut().push(LoopDevice {
            device: device.clone(),
            backing: file.to_path_buf(),
        });
        Ok(device)
    }

    /// Defer `hook` until repack. Hooks run in reverse registration order.
    pub fn add_pre_repack_hook(&self, hook: PreRepackHook) {
        self.hooks.borrow_mut().push(hook);
    }

    /// Drain the hook stack in execution (reverse registration) order.
    pub(crate) fn take_hooks_reversed(&self) -> Vec<PreRepackHook> {
        let mut hooks: Vec<PreRepackHook> = self.hooks.borrow_mut().drain(..).collect();
        hooks.reverse();
        hooks
    }

    // -------------------------------------------------------------------
    // Memoization
    // -------------------------------------------------------------------

    pub fn cache_get(&self, key: &str) -> Option<CacheValue> {
        self.cache.borrow().get(key).cloned()
    }

    pub fn cache_put(&self, key: &str, value: CacheValue) {
        self.cache.borrow_mut().insert(key.to_string(), value);
    }

    // -------------------------------------------------------------------
    // Image metadata
    // -------------------------------------------------------------------

    /// Architecture of the image: the second-to-last whitespace token of
    /// `.disk/info`.
    pub fn get_arch(&self) -> Result<String> {
        let info_path = self.p("new/iso/.disk/info")?;
        let info = fs::read_to_string(&info_path)
            .with_context(|| format!("reading {}", info_path.display()))?;
        let words: Vec<&str> = info.split_whitespace().collect();
        if words.len() < 2 {
            bail!("malformed .disk/info: {:?}", info.trim());
        }
        Ok(words[words.len() - 2].to_string())
    }

    /// The `Suite:` field of the image's apt Release file.
    pub fn get_suite(&self) -> Result<String> {
        let pattern = self.p("old/iso/dists/*/Release")?;
        for entry in glob(&pattern.to_string_lossy())? {
            let release = entry?;
            let text = fs::read_to_string(&release)?;
            for line in text.lines() {
                if let Some(value) = line.strip_prefix("Suite:") {
                    return Ok(value.trim().to_string());
                }
            }
        }
        bail!("no Suite: field found under old/iso/dists");
    }

    /// Filesystem type of the live partition, as probed by the image opener.
    pub fn outer_fstype(&self) -> Option<String> {
        self.outer_fstype.borrow().clone()
    }

    /// The outer-tree overlay (`new/iso`).
    pub fn outer_overlay(&self) -> Result<OverlayMount> {
        self.outer_overlay
            .borrow()
            .clone()
            .context("source image is not mounted")
    }

    // -------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------

    /// Release every kernel-visible resource the session created, in
    /// reverse creation order. Safe to call more than once; always runs
    /// to the end, degrading individual failures to warnings.
    pub fn teardown(&self) {
        if self.torn_down.replace(true) {
            return;
        }
        let mounts: Vec<PathBuf> = self.mounts.borrow_mut().drain(..).collect();
        for mp in mounts.iter().rev() {
            // Shared-subtree propagation can hold mounts busy; detach first.
            let _ = Cmd::new("mount")
                .arg("--make-rprivate")
                .arg_path(mp)
                .allow_fail()
                .run();
            let recursive = Cmd::new("umount").arg("-R").arg_path(mp).allow_fail().run();
            let ok = matches!(recursive, Ok(ref r) if r.success());
            if !ok {
                let _ = Cmd::new("umount").arg("-l").arg_path(mp).allow_fail().run();
            }
        }
        if let Some(tmp) = self.tmp.borrow_mut().take() {
            if let Err(err) = tmp.close() {
                eprintln!("warning: failed to remove session root: {err}");
            }
        }
        let loops: Vec<LoopDevice> = self.loops.borrow_mut().drain(..).collect();
        for lo in loops.iter().rev() {
            let result = Cmd::new("losetup")
                .arg("--detach")
                .arg(&lo.device)
                .allow_fail()
                .run();
            if !matches!(result, Ok(ref r) if r.success()) {
                eprintln!("warning: failed to detach {}", lo.device);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Backstop for panics and early returns; the driver calls
        // teardown() explicitly on the normal path.
        self.teardown();
    }
}
