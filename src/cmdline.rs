//! Kernel command-line edits across the boot configs shipped on the image.
//!
//! Casper images carry the kernel command line in up to three places
//! depending on architecture and firmware; every line holding a `---`
//! delimiter is a boot entry. Arguments placed before the delimiter are seen
//! by the live-boot runtime only; arguments appended after the existing tail
//! persist into the installed system.

use anyhow::Result;
use std::fs;

use crate::session::Session;

/// Boot-config files that may carry kernel command lines, relative to the
/// outer tree.
const BOOT_CONFIGS: &[&str] = &[
    "boot/grub/grub.cfg",
    "isolinux/txt.cfg",
    "boot/parmfile.ubuntu",
];

/// Add `arg` to every boot entry of every boot config present on the image.
pub fn add_cmdline_arg(session: &Session, arg: &str, persist: bool) -> Result<()> {
    for rel in BOOT_CONFIGS {
        let path = session.p(format!("new/iso/{rel}"))?;
        if !path.exists() {
            continue;
        }
        println!("rewriting {rel}");
        let input = fs::read_to_string(&path)?;
        let mut output = String::new();
        for line in input.lines() {
            output.push_str(&rewrite_line(line, arg, persist));
            output.push('\n');
        }
        fs::write(&path, output)?;
    }
    Ok(())
}

/// Look `key` up across all boot entries; first `key=value` token wins.
pub fn get_cmdline_arg(session: &Session, key: &str) -> Result<Option<String>> {
    for rel in BOOT_CONFIGS {
        let path = session.p(format!("new/iso/{rel}"))?;
        if !path.exists() {
            continue;
        }
        let input = fs::read_to_string(&path)?;
        for line in input.lines() {
            if let Some(value) = find_arg_in_line(line, key) {
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}

fn rewrite_line(line: &str, arg: &str, persist: bool) -> String {
    if !line.contains("---") {
        return line.to_string();
    }
    if persist {
        format!("{} {}", line.trim_end(), arg)
    } else {
        let (before, after) = line.split_once("---").expect("checked above");
        format!("{} {} ---{}", before.trim_end(), arg, after)
    }
}

fn find_arg_in_line(line: &str, key: &str) -> Option<String> {
    if !line.contains("---") {
        return None;
    }
    let tokens = shlex::split(line)?;
    let prefix = format!("{key}=");
    tokens
        .iter()
        .find_map(|t| t.strip_prefix(&prefix).map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY: &str = "linux /casper/vmlinuz boot=casper quiet --- splash";

    #[test]
    fn test_non_persistent_inserts_before_delimiter() {
        assert_eq!(
            rewrite_line(ENTRY, "autoinstall", false),
            "linux /casper/vmlinuz boot=casper quiet autoinstall --- splash"
        );
    }

    #[test]
    fn test_persistent_appends_after_tail() {
        assert_eq!(
            rewrite_line(ENTRY, "autoinstall", true),
            "linux /casper/vmlinuz boot=casper quiet --- splash autoinstall"
        );
    }

    #[test]
    fn test_lines_without_delimiter_untouched() {
        let line = "menuentry \"Try or Install Ubuntu\" {";
        assert_eq!(rewrite_line(line, "autoinstall", false), line);
    }

    #[test]
    fn test_find_arg() {
        let line = "linux /casper/vmlinuz layerfs-path=minimal.standard.live.squashfs --- quiet";
        assert_eq!(
            find_arg_in_line(line, "layerfs-path"),
            Some("minimal.standard.live.squashfs".to_string())
        );
        assert_eq!(find_arg_in_line(line, "boot"), None);
    }

    #[test]
    fn test_find_arg_skips_plain_lines() {
        assert_eq!(find_arg_in_line("set timeout=5", "timeout"), None);
    }

    #[test]
    fn test_end_to_end_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        // A session whose outer tree holds a single grub.cfg.
        let session = Session::new(dir.path().join("src.iso").as_path(), false).unwrap();
        let grub_dir = session.p("new/iso/boot/grub").unwrap();
        fs::create_dir_all(&grub_dir).unwrap();
        fs::write(grub_dir.join("grub.cfg"), format!("{ENTRY}\n")).unwrap();

        add_cmdline_arg(&session, "autoinstall", false).unwrap();
        let rewritten = fs::read_to_string(grub_dir.join("grub.cfg")).unwrap();
        assert_eq!(
            rewritten,
            "linux /casper/vmlinuz boot=casper quiet autoinstall --- splash\n"
        );
        assert_eq!(
            get_cmdline_arg(&session, "boot").unwrap(),
            Some("casper".to_string())
        );
    }
}
