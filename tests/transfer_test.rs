//! End-to-end transfers over loopback TCP.
//!
//! A real SendSession pushes to a real RecvSession; the received tree must
//! match the source byte for byte and the block cache must end up empty.

use lanthrow::locale::Locale;
use lanthrow::streaming::{RecvReport, RecvSession, SendReport, SendSession, TaskConfig};
use std::fs;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

const LIMIT: u64 = 16 * 1024;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Small files, split files, an empty file and an empty directory.
fn make_tree(root: &Path) {
    fs::create_dir_all(root.join("sub").join("deeper")).unwrap();
    fs::create_dir_all(root.join("sub").join("empty_dir")).unwrap();
    fs::write(root.join("a.txt"), b"hello from the sender").unwrap();
    fs::write(root.join("empty.txt"), b"").unwrap();
    // 50KiB: 4 blocks of up to 16KiB
    fs::write(root.join("sub").join("b.bin"), pattern(50 * 1024, 1)).unwrap();
    // 20KiB: under 1.5x the limit, sent whole
    fs::write(root.join("sub").join("c.bin"), pattern(20 * 1024, 2)).unwrap();
    // exact multiple: 3 full blocks
    fs::write(root.join("sub").join("deeper").join("d.bin"), pattern(48 * 1024, 3)).unwrap();
}

fn collect_files(root: &Path, base: &Path, out: &mut Vec<PathBuf>) {
    for entry in fs::read_dir(root).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect_files(&path, base, out);
        } else {
            out.push(path.strip_prefix(base).unwrap().to_path_buf());
        }
    }
}

fn assert_same_tree(expected: &Path, actual: &Path) {
    let mut want = Vec::new();
    let mut got = Vec::new();
    collect_files(expected, expected, &mut want);
    collect_files(actual, actual, &mut got);
    want.sort();
    got.sort();
    assert_eq!(want, got);
    for rel in want {
        assert_eq!(
            fs::read(expected.join(&rel)).unwrap(),
            fs::read(actual.join(&rel)).unwrap(),
            "content differs: {}",
            rel.display()
        );
    }
}

fn transfer(src: &Path, save: &Path, cache: &Path, threads: usize, limit: u64) -> (SendReport, RecvReport) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = listener.local_addr().unwrap();
    let locale = Arc::new(Locale::builtin());

    let receiver = {
        let save = save.to_path_buf();
        let cache = cache.to_path_buf();
        let locale = locale.clone();
        thread::spawn(move || RecvSession::new(save, cache, locale).run(&listener, addr.ip(), |_| false))
    };

    let task = TaskConfig::scan(src).unwrap();
    let sent = SendSession::new(task, threads, limit, locale).run(addr).unwrap();
    let received = receiver.join().unwrap().unwrap();
    (sent, received)
}

#[test]
fn test_directory_transfer_three_threads() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("photos");
    make_tree(&src);
    let save = tmp.path().join("save");
    let cache = tmp.path().join("cache");

    let (sent, received) = transfer(&src, &save, &cache, 3, LIMIT);

    assert_eq!(sent.files, 5);
    assert_eq!(sent.split_files, 2);
    assert_eq!(sent.blocks, 4 + 3);
    assert_eq!(sent.bytes, 21 + 50 * 1024 + 20 * 1024 + 48 * 1024);

    assert_eq!(received.apex, save.join("photos"));
    assert_eq!(received.merged_files, 2);
    assert_eq!(received.files, 5);
    assert_eq!(received.dirs_created, 4);
    assert_eq!(received.dirs_skipped, 0);

    assert_same_tree(&src, &save.join("photos"));
    assert!(save.join("photos").join("sub").join("empty_dir").is_dir());
    assert_eq!(fs::read_dir(&cache).unwrap().count(), 0);
}

#[test]
fn test_single_file_task() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("movie.mkv");
    let content = pattern(100 * 1024, 9);
    fs::write(&src, &content).unwrap();
    let save = tmp.path().join("downloads");
    let cache = tmp.path().join("cache");

    let (sent, received) = transfer(&src, &save, &cache, 4, LIMIT);

    // 100KiB / 16KiB = 6 full blocks + remainder
    assert_eq!(sent.blocks, 7);
    assert_eq!(received.apex, save);
    assert_eq!(received.dirs_created, 0);
    assert_eq!(fs::read(save.join("movie.mkv")).unwrap(), content);
    assert_eq!(fs::read_dir(&cache).unwrap().count(), 0);
}

#[test]
fn test_more_threads_than_units() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("tiny");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("only.txt"), b"1").unwrap();
    let save = tmp.path().join("save");

    let (sent, received) = transfer(&src, &save, &tmp.path().join("cache"), 8, LIMIT);
    assert_eq!(sent.files, 1);
    assert_eq!(received.files, 1);
    assert_same_tree(&src, &save.join("tiny"));
}

#[test]
fn test_single_thread_many_blocks() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("one");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("big.bin"), pattern(300 * 1024, 4)).unwrap();
    let save = tmp.path().join("save");

    // 4KiB blocks, each exactly one raw frame
    let (sent, received) = transfer(&src, &save, &tmp.path().join("cache"), 1, 4096);
    assert_eq!(sent.blocks, 75);
    assert_eq!(received.merged_files, 1);
    assert_same_tree(&src, &save.join("one"));
}

#[test]
fn test_second_transfer_skips_existing_dirs() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("photos");
    make_tree(&src);
    let save = tmp.path().join("save");
    let cache = tmp.path().join("cache");

    transfer(&src, &save, &cache, 2, LIMIT);
    let (_, again) = transfer(&src, &save, &cache, 2, LIMIT);

    assert_eq!(again.dirs_created, 0);
    assert_eq!(again.dirs_skipped, 4);
    assert_same_tree(&src, &save.join("photos"));
}
