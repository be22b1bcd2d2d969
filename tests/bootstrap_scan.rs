use std::fs;

use diskqueue::header::encode_item;
use diskqueue::{DiskQueue, Error};
use tempfile::tempdir;

#[test]
fn existing_segments_are_listed_in_order() {
    let dir = tempdir().expect("tempdir");
    for name in ["0", "1", "2"] {
        fs::write(dir.path().join(name), b"").expect("create segment");
    }

    let queue = DiskQueue::with_capacity(1024, 0);
    queue.start(dir.path()).expect("start");
    assert_eq!(queue.list(), vec![0, 1, 2]);
}

#[test]
fn ids_sort_numerically() {
    let dir = tempdir().expect("tempdir");
    for name in ["10", "2", "1"] {
        fs::write(dir.path().join(name), b"").expect("create segment");
    }

    let queue = DiskQueue::with_capacity(1024, 0);
    queue.start(dir.path()).expect("start");
    assert_eq!(queue.list(), vec![1, 2, 10]);
}

#[test]
fn non_numeric_names_are_ignored() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("abc"), b"not a segment").expect("write abc");
    fs::write(dir.path().join("3.corrupt"), b"old").expect("write quarantined");
    fs::create_dir(dir.path().join("7")).expect("numeric subdir");

    let queue = DiskQueue::with_capacity(1024, 0);
    queue.start(dir.path()).expect("start");
    assert_eq!(queue.list(), vec![0]);
    queue.push_back(b"payload").expect("push");
    assert_eq!(queue.front_vec().expect("front"), b"payload");

    assert_eq!(fs::read(dir.path().join("abc")).expect("abc kept"), b"not a segment");
    assert!(dir.path().join("3.corrupt").exists());
}

#[test]
fn headerless_segments_are_retired_by_the_reader() {
    let dir = tempdir().expect("tempdir");
    for name in ["0", "1", "2"] {
        fs::write(dir.path().join(name), b"").expect("create segment");
    }

    let queue = DiskQueue::with_capacity(1024, 0);
    queue.start(dir.path()).expect("start");
    assert!(queue.front_vec().is_none());
    assert_eq!(queue.list(), vec![2]);
    assert!(!dir.path().join("0").exists());

    queue.push_back(b"late").expect("push");
    assert_eq!(queue.front_vec().expect("front"), b"late");
}

#[test]
fn missing_directory_is_created() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("fresh");
    let queue = DiskQueue::with_capacity(1024, 0);
    queue.start(&path).expect("start");

    assert!(path.is_dir());
    assert_eq!(queue.list(), vec![0]);
    assert_eq!(fs::read(path.join("0")).expect("segment 0"), vec![b'P', 1, 0]);
    assert_eq!(queue.disk_usage(), 3);
}

#[test]
fn full_segment_at_highest_id_fails_start() {
    let dir = tempdir().expect("tempdir");
    let mut bytes = vec![b'P', 1, 0];
    bytes.extend_from_slice(&encode_item(&[1u8; 64]).expect("encode"));
    fs::write(dir.path().join(u64::MAX.to_string()), &bytes).expect("write segment");

    let queue = DiskQueue::with_capacity(32, 0);
    assert!(matches!(queue.start(dir.path()), Err(Error::Corrupt(_))));
    assert!(!queue.is_running());
    assert!(!dir.path().join("0").exists());
}

#[test]
fn padded_and_plain_names_share_one_segment() {
    let dir = tempdir().expect("tempdir");
    {
        let queue = DiskQueue::with_capacity(1024, 0);
        queue.start(dir.path()).expect("start");
        queue.push_back(b"real").expect("push");
    }
    fs::write(dir.path().join("000"), b"stray").expect("write padded copy");

    let queue = DiskQueue::with_capacity(1024, 0);
    queue.start(dir.path()).expect("restart");
    assert_eq!(queue.list(), vec![0]);
    assert_eq!(queue.front_vec().expect("front"), b"real");
    assert!(queue.pop_front());
    assert!(queue.front_vec().is_none());
    assert_eq!(fs::read(dir.path().join("000")).expect("stray kept"), b"stray");
}
