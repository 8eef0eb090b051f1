//! Embedder hooks: read-through, write-through, write-back flushing,
//! delete notification and the value codec.

use std::cell::RefCell;
use std::rc::Rc;

use shmcache::{
    Cache, CacheOptions, HookError, ValueCodec, WriteAction, FLAG_DIRTY,
};
use tempfile::TempDir;

fn base_options(dir: &TempDir) -> CacheOptions {
    CacheOptions::new()
        .share_file(dir.path().join("share"))
        .num_pages(3)
        .page_size(4096)
        .raw_values(true)
}

type WriteLog = Rc<RefCell<Vec<(Vec<u8>, Vec<u8>)>>>;

fn with_write_log(options: CacheOptions) -> (CacheOptions, WriteLog) {
    let log: WriteLog = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    let options = options.write_hook(move |key, value, _expire| {
        sink.borrow_mut().push((key.to_vec(), value.to_vec()));
        Ok(())
    });
    (options, log)
}

#[test]
fn write_back_flushes_exactly_once_on_empty() {
    let dir = TempDir::new().unwrap();
    let (options, log) = with_write_log(base_options(&dir).write_action(WriteAction::WriteBack));
    let mut cache = Cache::new(options).unwrap();

    cache.set(b"k", b"v").unwrap();
    assert!(log.borrow().is_empty(), "write-back must defer the hook");

    cache.empty(false).unwrap();
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(log.borrow()[0], (b"k".to_vec(), b"v".to_vec()));

    assert_eq!(cache.get(b"k").unwrap(), None);

    // Nothing left to flush.
    cache.empty(false).unwrap();
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn write_through_invokes_hook_on_every_set() {
    let dir = TempDir::new().unwrap();
    let (options, log) = with_write_log(base_options(&dir));
    let mut cache = Cache::new(options).unwrap();

    cache.set(b"a", b"1").unwrap();
    cache.set(b"b", b"2").unwrap();
    cache.set(b"a", b"3").unwrap();
    assert_eq!(log.borrow().len(), 3);
}

#[test]
fn clear_and_purge_invoke_no_hooks() {
    let dir = TempDir::new().unwrap();
    let (options, log) = with_write_log(base_options(&dir).write_action(WriteAction::WriteBack));
    let mut cache = Cache::new(options).unwrap();

    cache.set(b"k", b"v").unwrap();
    cache.purge().unwrap();
    cache.clear().unwrap();
    assert!(log.borrow().is_empty());
    assert_eq!(cache.get(b"k").unwrap(), None);
}

#[test]
fn unstorable_value_still_reaches_write_hook() {
    let dir = TempDir::new().unwrap();
    let (options, log) = with_write_log(base_options(&dir).write_action(WriteAction::WriteBack));
    let mut cache = Cache::new(options).unwrap();

    // Larger than a whole page; cannot be admitted.
    let huge = vec![0xabu8; 8192];
    assert!(!cache.set(b"huge", &huge).unwrap());
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(log.borrow()[0].0, b"huge".to_vec());
}

#[test]
fn failing_write_hook_is_contained() {
    let dir = TempDir::new().unwrap();
    let mut cache = Cache::new(
        base_options(&dir).write_hook(|_key, _value, _expire| Err(HookError::from("backing store down"))),
    )
    .unwrap();

    // Write-through hook fails, the cache keeps the value anyway.
    assert!(cache.set(b"k", b"v").unwrap());
    assert_eq!(cache.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn read_through_populates_the_page() {
    let dir = TempDir::new().unwrap();
    let calls = Rc::new(RefCell::new(0u32));
    let counter = Rc::clone(&calls);
    let mut cache = Cache::new(base_options(&dir).read_hook(move |key| {
        *counter.borrow_mut() += 1;
        assert_eq!(key, b"k");
        Ok(Some(b"from-store".to_vec()))
    }))
    .unwrap();

    assert_eq!(cache.get(b"k").unwrap(), Some(b"from-store".to_vec()));
    assert_eq!(*calls.borrow(), 1);

    // Second lookup is served from the page.
    assert_eq!(cache.get(b"k").unwrap(), Some(b"from-store".to_vec()));
    assert_eq!(*calls.borrow(), 1);
}

#[test]
fn failing_read_hook_is_a_plain_miss() {
    let dir = TempDir::new().unwrap();
    let mut cache =
        Cache::new(base_options(&dir).read_hook(|_key| Err(HookError::from("io error")))).unwrap();
    assert_eq!(cache.get(b"k").unwrap(), None);
}

#[test]
fn cache_not_found_memoises_misses() {
    let dir = TempDir::new().unwrap();
    let calls = Rc::new(RefCell::new(0u32));
    let counter = Rc::clone(&calls);
    let mut cache = Cache::new(
        base_options(&dir)
            .cache_not_found(true)
            .read_hook(move |_key| {
                *counter.borrow_mut() += 1;
                Ok(None)
            }),
    )
    .unwrap();

    for _ in 0..10 {
        assert_eq!(cache.get(b"absent").unwrap(), None);
    }
    // The marker expires after a second, so allow one re-ask across
    // the boundary.
    assert!(*calls.borrow() <= 2, "hook ran {} times", calls.borrow());
}

#[test]
fn delete_hook_reports_dirty_flag() {
    let dir = TempDir::new().unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let mut cache = Cache::new(
        base_options(&dir)
            .write_action(WriteAction::WriteBack)
            .delete_hook(move |key, flags| {
                sink.borrow_mut().push((key.to_vec(), flags));
                Ok(())
            }),
    )
    .unwrap();

    cache.set(b"k", b"v").unwrap();
    assert!(cache.remove(b"k").unwrap());
    // Removing a missing key does not notify.
    assert!(!cache.remove(b"k").unwrap());

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, b"k".to_vec());
    assert_ne!(seen[0].1 & FLAG_DIRTY, 0);
}

#[test]
fn empty_on_exit_flushes_at_drop() {
    let dir = TempDir::new().unwrap();
    let (options, log) = with_write_log(
        base_options(&dir)
            .write_action(WriteAction::WriteBack)
            .empty_on_exit(true),
    );
    {
        let mut cache = Cache::new(options).unwrap();
        cache.set(b"k", b"v").unwrap();
        assert!(log.borrow().is_empty());
    }
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(log.borrow()[0], (b"k".to_vec(), b"v".to_vec()));
}

struct XorCodec(u8);

impl ValueCodec for XorCodec {
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, HookError> {
        Ok(value.iter().map(|b| b ^ self.0).collect())
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, HookError> {
        Ok(stored.iter().map(|b| b ^ self.0).collect())
    }
}

#[test]
fn codec_applies_on_the_way_in_and_out() {
    let dir = TempDir::new().unwrap();
    let mut cache = Cache::new(
        CacheOptions::new()
            .share_file(dir.path().join("share"))
            .num_pages(3)
            .page_size(4096)
            .codec(XorCodec(0xaa)),
    )
    .unwrap();

    cache.set(b"k", b"plain").unwrap();
    assert_eq!(cache.get(b"k").unwrap(), Some(b"plain".to_vec()));

    // The iterator exposes stored bytes: encoded, not plain.
    let entry = cache.entries().next().unwrap().unwrap();
    assert_ne!(entry.value, b"plain".to_vec());
    assert_eq!(
        entry.value,
        b"plain".iter().map(|b| b ^ 0xaa).collect::<Vec<u8>>()
    );
}

#[test]
fn write_back_flush_decodes_victims() {
    let dir = TempDir::new().unwrap();
    let log: WriteLog = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    let mut cache = Cache::new(
        CacheOptions::new()
            .share_file(dir.path().join("share"))
            .num_pages(3)
            .page_size(4096)
            .codec(XorCodec(0x55))
            .write_action(WriteAction::WriteBack)
            .write_hook(move |key, value, _expire| {
                sink.borrow_mut().push((key.to_vec(), value.to_vec()));
                Ok(())
            }),
    )
    .unwrap();

    cache.set(b"k", b"secret").unwrap();
    cache.empty(false).unwrap();

    let log = log.borrow();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0], (b"k".to_vec(), b"secret".to_vec()));
}

#[test]
fn raw_values_bypass_the_codec() {
    let dir = TempDir::new().unwrap();
    let mut cache = Cache::new(
        CacheOptions::new()
            .share_file(dir.path().join("share"))
            .num_pages(3)
            .page_size(4096)
            .codec(XorCodec(0xaa))
            .raw_values(true),
    )
    .unwrap();

    cache.set(b"k", b"plain").unwrap();
    let entry = cache.entries().next().unwrap().unwrap();
    assert_eq!(entry.value, b"plain".to_vec());
}
