//! Shared test utilities for liviso tests.
//!
//! Real sessions mount real filesystems and need root; these helpers build
//! the same workspace layout out of plain directories so the path, parsing
//! and memoization logic can be exercised unprivileged.

use std::fs;
use std::path::{Path, PathBuf};

use liviso::session::Session;

/// A session over a mock workspace, with builders for the files the
/// engine reads.
pub struct MockImage {
    pub session: Session,
}

impl MockImage {
    pub fn new() -> Self {
        let session = Session::new(Path::new("/nonexistent/in.iso"), false)
            .expect("failed to create session");
        Self { session }
    }

    fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.session.p(rel).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    /// Outer-tree grub.cfg with the given boot entry lines.
    pub fn with_grub(self, lines: &str) -> Self {
        self.write("new/iso/boot/grub/grub.cfg", lines);
        self
    }

    pub fn with_isolinux(self, lines: &str) -> Self {
        self.write("new/iso/isolinux/txt.cfg", lines);
        self
    }

    pub fn with_disk_info(self, line: &str) -> Self {
        self.write("new/iso/.disk/info", line);
        self
    }

    /// Empty squash files under old/iso/casper, as the non-layered glob
    /// fallback sees them.
    pub fn with_casper_squashfs(self, names: &[&str]) -> Self {
        for name in names {
            self.write(&format!("old/iso/casper/{name}.squashfs"), "");
        }
        self
    }

    pub fn with_release(self, suite: &str) -> Self {
        self.write(
            &format!("old/iso/dists/{suite}/Release"),
            &format!("Origin: Ubuntu\nSuite: {suite}\nCodename: {suite}\n"),
        );
        self
    }

    pub fn grub_contents(&self) -> String {
        fs::read_to_string(self.session.p("new/iso/boot/grub/grub.cfg").unwrap()).unwrap()
    }
}
