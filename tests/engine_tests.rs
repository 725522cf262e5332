//! Engine behavior tests that run unprivileged: command-line rewriting,
//! layer-name derivation, memoization, and session lifecycle. Anything
//! needing real mounts or loop devices is exercised manually against a
//! real image instead.

mod helpers;

use helpers::MockImage;
use liviso::layers::{self, LayerfsPointer, PointerSource};
use liviso::session::CacheValue;
use liviso::{cmdline, error::EditError};
use std::fs;

const GRUB_ENTRY: &str = "linux /casper/vmlinuz boot=casper quiet --- splash";

#[test]
fn non_persistent_cmdline_arg_lands_before_delimiter() {
    let img = MockImage::new().with_grub(&format!("{GRUB_ENTRY}\n"));
    cmdline::add_cmdline_arg(&img.session, "autoinstall", false).unwrap();
    assert_eq!(
        img.grub_contents(),
        "linux /casper/vmlinuz boot=casper quiet autoinstall --- splash\n"
    );
}

#[test]
fn persistent_cmdline_arg_lands_after_tail() {
    let img = MockImage::new().with_grub(&format!("{GRUB_ENTRY}\n"));
    cmdline::add_cmdline_arg(&img.session, "autoinstall", true).unwrap();
    assert_eq!(
        img.grub_contents(),
        "linux /casper/vmlinuz boot=casper quiet --- splash autoinstall\n"
    );
}

#[test]
fn cmdline_arg_rewrites_every_config_present() {
    let img = MockImage::new()
        .with_grub(&format!("{GRUB_ENTRY}\n"))
        .with_isolinux(&format!("  append vga=788 --- quiet\n{GRUB_ENTRY}\n"));
    cmdline::add_cmdline_arg(&img.session, "fsck.mode=skip", true).unwrap();
    let txt = fs::read_to_string(img.session.p("new/iso/isolinux/txt.cfg").unwrap()).unwrap();
    assert!(txt.contains("append vga=788 --- quiet fsck.mode=skip"));
    assert!(img.grub_contents().contains("splash fsck.mode=skip"));
}

#[test]
fn layerfs_path_found_on_kernel_command_line() {
    let img = MockImage::new().with_grub(
        "linux /casper/vmlinuz layerfs-path=minimal.standard.live.squashfs --- quiet\n",
    );
    let pointer = layers::get_layerfs_path(&img.session).unwrap();
    assert_eq!(pointer.source, PointerSource::Cmdline);
    assert_eq!(
        pointer.value.as_deref(),
        Some("minimal.standard.live.squashfs")
    );
}

#[test]
fn squash_names_accumulate_dotted_prefixes() {
    let img = MockImage::new().with_grub(
        "linux /casper/vmlinuz layerfs-path=minimal.standard.live.squashfs --- quiet\n",
    );
    assert_eq!(
        layers::get_squash_names(&img.session).unwrap(),
        vec!["minimal", "minimal.standard", "minimal.standard.live"]
    );
}

#[test]
fn squash_names_fall_back_to_casper_glob() {
    let img = MockImage::new()
        .with_grub(&format!("{GRUB_ENTRY}\n"))
        .with_casper_squashfs(&["installer", "filesystem"]);
    // No layerfs-path on the cmdline; pretend the initrd had none either.
    img.session.cache_put(
        "layerfs-path",
        CacheValue::Pointer(LayerfsPointer {
            value: None,
            source: PointerSource::None,
        }),
    );
    assert_eq!(
        layers::get_squash_names(&img.session).unwrap(),
        vec!["filesystem", "installer"]
    );
}

#[test]
fn squash_names_memoized_without_rescanning() {
    let img = MockImage::new()
        .with_grub(&format!("{GRUB_ENTRY}\n"))
        .with_casper_squashfs(&["filesystem"]);
    img.session.cache_put(
        "layerfs-path",
        CacheValue::Pointer(LayerfsPointer {
            value: None,
            source: PointerSource::None,
        }),
    );
    let first = layers::get_squash_names(&img.session).unwrap();
    // Remove the files; a second call must serve the memoized names.
    fs::remove_dir_all(img.session.p("old/iso/casper").unwrap()).unwrap();
    let second = layers::get_squash_names(&img.session).unwrap();
    assert_eq!(first, second);
}

#[test]
fn arch_and_suite_come_from_image_metadata() {
    let img = MockImage::new()
        .with_disk_info("Ubuntu-Server 24.04 LTS \"Noble Numbat\" - Release amd64 (20240423)\n")
        .with_release("noble");
    assert_eq!(img.session.get_arch().unwrap(), "amd64");
    assert_eq!(img.session.get_suite().unwrap(), "noble");
}

#[test]
fn absolute_paths_are_rejected() {
    let img = MockImage::new();
    let err = img.session.p("/etc/shadow").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EditError>(),
        Some(EditError::AbsolutePath(_))
    ));
}

#[test]
fn teardown_removes_session_root() {
    let img = MockImage::new();
    let root = img.session.root().to_path_buf();
    assert!(root.is_dir());
    img.session.teardown();
    assert!(!root.exists());
}

#[test]
fn session_drop_cleans_up_without_explicit_teardown() {
    let root = {
        let img = MockImage::new();
        img.session.root().to_path_buf()
    };
    assert!(!root.exists());
}

#[test]
fn scratch_dirs_are_distinct_and_nested_under_tmp() {
    let img = MockImage::new();
    let a = img.session.tmpdir().unwrap();
    let b = img.session.tmpdir().unwrap();
    assert_ne!(a, b);
    assert!(a.starts_with(img.session.root().join(".tmp")));
    assert!(b.is_dir());
    assert!(!img.session.tmpfile().exists());
}
