//! Error taxonomy for the edit engine.
//!
//! Subprocess failures carry their own type ([`crate::process::SubprocessError`]);
//! everything else the engine can reject is an [`EditError`]. All errors
//! propagate to the top-level driver, which prints them and exits non-zero.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EditError {
    /// Malformed action invocation, prefixed with the action's dashed name.
    #[error("{0}")]
    Arg(String),

    /// An absolute component was passed to a session-relative path join.
    #[error("refusing absolute path component {0:?}")]
    AbsolutePath(PathBuf),

    /// No partition on the source image carries a live filesystem marker.
    #[error("no live filesystem found on {0}")]
    NoLiveFilesystem(PathBuf),

    /// replace-kernel could not find a squashfs layer with kernel modules.
    #[error("no squashfs layer contains /usr/lib/modules")]
    NoModulesLayer,
}
