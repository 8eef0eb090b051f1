//! Cross-process behavior: peers attached to the same share file,
//! coordinated only by the per-page file locks.
//!
//! Children are spawned by re-running this test binary with an exact
//! test-name filter and an environment marker; the worker tests are
//! no-ops in a normal run.

use std::process::Command;

use shmcache::{Cache, CacheOptions};
use tempfile::TempDir;

const SHARE_ENV: &str = "SHMCACHE_TEST_SHARE";
const ID_ENV: &str = "SHMCACHE_TEST_ID";

const WRITES_PER_CHILD: u32 = 2000;
const INCREMENTS_PER_CHILD: u32 = 300;

fn shared_options(share: &str) -> CacheOptions {
    CacheOptions::new()
        .share_file(share)
        .num_pages(13)
        .page_size(64 * 1024)
        .raw_values(true)
}

fn spawn_child(name: &str, share: &str, id: u32) -> std::process::Child {
    Command::new(std::env::current_exe().unwrap())
        .arg(name)
        .arg("--exact")
        .arg("--nocapture")
        .env(SHARE_ENV, share)
        .env(ID_ENV, id.to_string())
        .spawn()
        .unwrap()
}

/// Worker: bulk-insert a per-process key space. No-op unless spawned
/// as a child.
#[test]
fn disjoint_writer_child() {
    let Ok(share) = std::env::var(SHARE_ENV) else {
        return;
    };
    let id: u32 = std::env::var(ID_ENV).unwrap().parse().unwrap();

    let mut cache = Cache::new(shared_options(&share)).unwrap();
    for i in 0..WRITES_PER_CHILD {
        let key = format!("proc{id}-key{i}");
        let value = format!("proc{id}-val{i}");
        assert!(cache.set(key.as_bytes(), value.as_bytes()).unwrap());
    }
}

#[test]
fn disjoint_writers_never_lose_each_others_keys() {
    let dir = TempDir::new().unwrap();
    let share = dir.path().join("share").to_str().unwrap().to_string();

    // Create the file up front so the children race only for page
    // locks, not for initialisation.
    let mut cache = Cache::new(shared_options(&share)).unwrap();

    let children: Vec<_> = (0..2)
        .map(|id| spawn_child("disjoint_writer_child", &share, id))
        .collect();
    for mut child in children {
        assert!(child.wait().unwrap().success(), "writer child failed");
    }

    // Plenty of space for 4000 small entries across 13 × 64 KiB
    // pages, so every key must hit with its exact value.
    for id in 0..2u32 {
        for i in 0..WRITES_PER_CHILD {
            let key = format!("proc{id}-key{i}");
            let value = format!("proc{id}-val{i}");
            assert_eq!(
                cache.get(key.as_bytes()).unwrap(),
                Some(value.into_bytes()),
                "lost {key}"
            );
        }
    }

    // Every page passes the integrity check after the contention.
    drop(cache);
    let mut cache = Cache::new(shared_options(&share).test_file(true)).unwrap();
    assert_eq!(
        cache.get(b"proc0-key0").unwrap(),
        Some(b"proc0-val0".to_vec())
    );
}

/// Worker: repeatedly increment a shared counter with `get_and_set`.
/// No-op unless spawned as a child.
#[test]
fn increment_child() {
    let Ok(share) = std::env::var(SHARE_ENV) else {
        return;
    };

    let mut cache = Cache::new(shared_options(&share)).unwrap();
    for _ in 0..INCREMENTS_PER_CHILD {
        cache
            .get_and_set(b"counter", |_key, current| {
                let n: u64 = current
                    .map(|v| String::from_utf8(v).unwrap().parse().unwrap())
                    .unwrap_or(0);
                (n + 1).to_string().into_bytes()
            })
            .unwrap();
    }
}

#[test]
fn get_and_set_is_atomic_across_processes() {
    let dir = TempDir::new().unwrap();
    let share = dir.path().join("share").to_str().unwrap().to_string();
    let mut cache = Cache::new(shared_options(&share)).unwrap();

    let children: Vec<_> = (0..2)
        .map(|id| spawn_child("increment_child", &share, id))
        .collect();
    for mut child in children {
        assert!(child.wait().unwrap().success(), "increment child failed");
    }

    // Without the lock held across read-modify-write, interleavings
    // would lose increments.
    let total: u64 = String::from_utf8(cache.get(b"counter").unwrap().unwrap())
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(total, u64::from(2 * INCREMENTS_PER_CHILD));
}
