//! On-file binary layout of a cache page.
//!
//! All structs use fixed-size u32 fields with explicit offsets so the
//! layout is identical across compilations and processes. The format
//! is host-native (the file is never moved between hosts).
//!
//! A page is `page_size` bytes:
//!
//! ```text
//! [ 32-byte header | num_slots u32 slot directory | record heap ... ]
//! ```
//!
//! Each slot directory entry is either `SLOT_EMPTY` (0, never written,
//! terminates a probe), `SLOT_TOMBSTONE` (1, deleted, probe continues)
//! or a 4-aligned byte offset into the page at which an entry record
//! starts.

/// Magic constant at offset 0 of every page; anything else means the
/// page is corrupt.
pub const PAGE_MAGIC: u32 = 0x92F7_E3B1;

/// Size of the fixed page header.
pub const HEADER_SIZE: u32 = 32;

/// Fixed prefix of an entry record, before key and value bytes.
pub const ENTRY_HEADER_SIZE: u32 = 24;

/// Slot directory entry: never written.
pub const SLOT_EMPTY: u32 = 0;

/// Slot directory entry: deleted, reclaimed only by compaction.
pub const SLOT_TOMBSTONE: u32 = 1;

/// Entry flag bit: backing store has not seen this value yet
/// (write-back pending).
pub const FLAG_DIRTY: u32 = 1;

/// Entry flag bit: memoised read-through miss (`cache_not_found`).
pub const FLAG_NOT_FOUND: u32 = 2;

/// Page size bounds; `page_size` must be a power of two in this range.
pub const MIN_PAGE_SIZE: u32 = 4 * 1024;
pub const MAX_PAGE_SIZE: u32 = 1024 * 1024;

/// Page header at offset 0 of each page.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    pub magic: u32,      // 0..4
    pub num_slots: u32,  // 4..8   slot directory length
    pub free_slots: u32, // 8..12  directory entries that are 0 or 1
    pub old_slots: u32,  // 12..16 directory entries that are 1
    pub free_data: u32,  // 16..20 first byte past the record heap
    pub free_bytes: u32, // 20..24 bytes left between heap top and page end
    pub _reserved: [u32; 2], // 24..32
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == HEADER_SIZE as usize);

/// Fixed prefix of every entry record, followed by key then value
/// bytes. Records are padded so the next one starts 4-aligned.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EntryHeader {
    pub last_access: u32, // 0..4   seconds since epoch
    pub expire_time: u32, // 4..8   0, or absolute seconds since epoch
    pub slot_hash: u32,   // 8..12  stored to survive rehash on resize
    pub flags: u32,       // 12..16
    pub key_len: u32,     // 16..20
    pub value_len: u32,   // 20..24
}

const _: () = assert!(std::mem::size_of::<EntryHeader>() == ENTRY_HEADER_SIZE as usize);

/// Round a record length up to the next multiple of 4.
#[inline]
pub fn round_up4(len: u32) -> u32 {
    (len + 3) & !3
}

/// Stored length of a record with the given key/value sizes,
/// unpadded.
#[inline]
pub fn record_len(key_len: u32, value_len: u32) -> u32 {
    ENTRY_HEADER_SIZE + key_len + value_len
}

/// Byte offset of the first heap byte for a directory of `num_slots`.
#[inline]
pub fn heap_start(num_slots: u32) -> u32 {
    HEADER_SIZE + num_slots * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up4_boundaries() {
        assert_eq!(round_up4(0), 0);
        assert_eq!(round_up4(1), 4);
        assert_eq!(round_up4(4), 4);
        assert_eq!(round_up4(5), 8);
        assert_eq!(round_up4(31), 32);
    }

    #[test]
    fn record_len_includes_prefix() {
        assert_eq!(record_len(0, 0), 24);
        assert_eq!(record_len(5, 4), 33);
        assert_eq!(round_up4(record_len(5, 4)), 36);
    }

    #[test]
    fn heap_starts_after_directory() {
        assert_eq!(heap_start(89), 32 + 89 * 4);
    }
}
