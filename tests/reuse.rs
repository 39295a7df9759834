mod common;

use std::fs;

use common::{entry_hunk, exit_42, test_linker};
use pepack::reuse::{Reuse, ReuseType};

fn temp_path(name: &str) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("pepack-test-{}-{}", std::process::id(), name));
    path
}

#[test]
fn test_save_load_save_is_byte_identical() {
    let path = temp_path("roundtrip.reuse");
    let mut linker = test_linker();
    linker.add_hunks(entry_hunk(&exit_42()));
    linker.reuse_type = ReuseType::Write;
    linker.reuse_path = path.to_string_lossy().into_owned();
    linker.link().unwrap();

    let first = fs::read(&path).unwrap();
    let loaded = Reuse::load(&path).unwrap().unwrap();
    loaded.save(&path).unwrap();
    let second = fs::read(&path).unwrap();
    assert_eq!(first, second);
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_reuse_records_order_and_hashsize() {
    let path = temp_path("contents.reuse");
    let mut linker = test_linker();
    linker.add_hunks(entry_hunk(&exit_42()));
    linker.reuse_type = ReuseType::Write;
    linker.reuse_path = path.to_string_lossy().into_owned();
    linker.link().unwrap();

    let reuse = Reuse::load(&path).unwrap().unwrap();
    assert!(reuse.hash_size() > 0);
    // The pinned import machinery leads the recorded order.
    assert_eq!(reuse.hunk_order()[0], "import loader");
    assert!(reuse.hunk_order().iter().any(|n| n == "entry"));
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_stable_reuse_reproduces_output() {
    let path = temp_path("stable.reuse");
    let image_a = {
        let mut linker = test_linker();
        linker.add_hunks(entry_hunk(&exit_42()));
        linker.reuse_type = ReuseType::Write;
        linker.reuse_path = path.to_string_lossy().into_owned();
        linker.link().unwrap()
    };
    let image_b = {
        let mut linker = test_linker();
        linker.add_hunks(entry_hunk(&exit_42()));
        linker.reuse_type = ReuseType::Stable;
        linker.reuse_path = path.to_string_lossy().into_owned();
        linker.link().unwrap()
    };
    assert_eq!(image_a, image_b);
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_missing_reuse_file_is_not_fatal() {
    let mut linker = test_linker();
    linker.add_hunks(entry_hunk(&exit_42()));
    linker.reuse_type = ReuseType::Improve;
    linker.reuse_path = temp_path("does-not-exist.reuse").to_string_lossy().into_owned();
    let image = linker.link().unwrap();
    assert!(!image.is_empty());
    // An improve run without a baseline writes the file for next time.
    let path = temp_path("does-not-exist.reuse");
    assert!(path.exists());
    fs::remove_file(path).unwrap();
}
