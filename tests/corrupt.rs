//! Corrupt-page detection and attach-time repair.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use shmcache::{Cache, CacheOptions, Error};
use tempfile::TempDir;

const NUM_PAGES: u32 = 3;
const PAGE_SIZE: u32 = 4096;

fn options(dir: &TempDir) -> CacheOptions {
    CacheOptions::new()
        .share_file(dir.path().join("share"))
        .num_pages(NUM_PAGES)
        .page_size(PAGE_SIZE)
        .raw_values(true)
}

fn keys() -> Vec<String> {
    (0..60u32).map(|i| format!("spread-key-{i}")).collect()
}

/// Zero the header of page 2, as a crashed writer might leave it.
fn smash_page_two(dir: &TempDir) {
    let mut file = OpenOptions::new()
        .write(true)
        .open(dir.path().join("share"))
        .unwrap();
    file.seek(SeekFrom::Start(u64::from(2 * PAGE_SIZE))).unwrap();
    file.write_all(&[0u8; 32]).unwrap();
}

#[test]
fn corruption_surfaces_without_the_integrity_pass() {
    let dir = TempDir::new().unwrap();
    {
        let mut cache = Cache::new(options(&dir)).unwrap();
        for key in keys() {
            cache.set(key.as_bytes(), key.as_bytes()).unwrap();
        }
    }
    smash_page_two(&dir);

    let mut cache = Cache::new(options(&dir)).unwrap();
    let mut corrupt_hits = 0;
    let mut healthy_key = None;
    for key in keys() {
        match cache.get(key.as_bytes()) {
            Ok(Some(value)) => {
                assert_eq!(value, key.clone().into_bytes());
                healthy_key.get_or_insert(key);
            }
            Ok(None) => panic!("healthy pages must not lose entries"),
            Err(Error::PageCorrupt { page }) => {
                assert_eq!(page, 2);
                corrupt_hits += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(corrupt_hits > 0, "no key landed on the smashed page");

    // The lock was released on the error path; healthy pages still
    // take writes.
    let healthy_key = healthy_key.expect("some key on a healthy page");
    assert!(cache.set(healthy_key.as_bytes(), b"still-works").unwrap());
}

#[test]
fn test_file_repairs_the_smashed_page_only() {
    let dir = TempDir::new().unwrap();
    {
        let mut cache = Cache::new(options(&dir)).unwrap();
        for key in keys() {
            cache.set(key.as_bytes(), key.as_bytes()).unwrap();
        }
    }
    smash_page_two(&dir);

    let mut cache = Cache::new(options(&dir).test_file(true)).unwrap();
    let mut hits = 0;
    let mut misses = 0;
    for key in keys() {
        match cache.get(key.as_bytes()).unwrap() {
            Some(value) => {
                assert_eq!(value, key.into_bytes());
                hits += 1;
            }
            None => misses += 1,
        }
    }
    // Page 2 was wiped; pages 0 and 1 kept their entries.
    assert!(misses > 0, "no key landed on the smashed page");
    assert!(hits > 0, "repair must not wipe healthy pages");
    assert_eq!(hits + misses, 60);

    // The repaired page is usable again.
    for key in keys() {
        cache.set(key.as_bytes(), b"rewritten").unwrap();
    }
    for key in keys() {
        assert_eq!(cache.get(key.as_bytes()).unwrap(), Some(b"rewritten".to_vec()));
    }
}

#[test]
fn test_file_leaves_a_healthy_file_alone() {
    let dir = TempDir::new().unwrap();
    {
        let mut cache = Cache::new(options(&dir)).unwrap();
        for key in keys() {
            cache.set(key.as_bytes(), key.as_bytes()).unwrap();
        }
    }

    let mut cache = Cache::new(options(&dir).test_file(true)).unwrap();
    for key in keys() {
        assert_eq!(cache.get(key.as_bytes()).unwrap(), Some(key.into_bytes()));
    }
}
