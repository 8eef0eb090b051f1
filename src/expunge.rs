//! Expunge engine: expiry sweep, LRU eviction, slot-directory growth
//! and page compaction.
//!
//! Two-phase: [`calc_expunge`] decides which entries go and whether
//! the directory grows, without touching the page; [`do_expunge`]
//! rebuilds the directory and heap in temporary buffers and copies
//! them back in place, reclaiming tombstoned records as a side
//! effect. Victim records wanted for write-back must be copied out
//! between the two phases, before the rebuild overwrites them.

use crate::layout::{self, SLOT_TOMBSTONE};
use crate::page::PageCursor;

/// What to expunge from a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpungeMode {
    /// Only entries whose expiry has passed.
    Expired,
    /// Every live entry.
    All,
    /// Sized admission for a record of `len` key+value bytes: a page
    /// with both slot and heap headroom is left alone; otherwise
    /// expired entries go unconditionally and the oldest survivors
    /// are evicted until 40% of the heap is free.
    MakeRoom(u32),
}

/// Result of the calc phase: the directory size to rebuild with, the
/// record offsets to drop and the record offsets to keep.
#[derive(Debug)]
pub struct ExpungePlan {
    pub new_num_slots: u32,
    pub victims: Vec<u32>,
    pub keepers: Vec<u32>,
}

impl ExpungePlan {
    /// True when applying the plan would change nothing: no victims,
    /// no growth, and no tombstoned heap bytes to reclaim.
    pub fn is_noop(&self, cursor: &PageCursor) -> bool {
        self.victims.is_empty() && self.new_num_slots == cursor.num_slots && cursor.old_slots == 0
    }
}

/// Heap capacity of a page whose directory has `num_slots` entries.
fn heap_capacity(page_size: u32, num_slots: u32) -> u32 {
    page_size - layout::heap_start(num_slots)
}

/// Decide what to expunge. Returns `None` when the page needs no work
/// (only possible in [`ExpungeMode::MakeRoom`], when both headroom
/// tests pass).
pub fn calc_expunge(cursor: &PageCursor, mode: ExpungeMode, now: u32) -> Option<ExpungePlan> {
    if let ExpungeMode::MakeRoom(len) = mode {
        let kvlen = layout::round_up4(layout::record_len(len, 0));
        let empty_slots = cursor.free_slots - cursor.old_slots;
        if f64::from(empty_slots) / f64::from(cursor.num_slots) > 0.3 && cursor.free_bytes >= kvlen
        {
            return None;
        }
    }

    let mut victims = Vec::new();
    let mut keepers = Vec::new();
    let mut used_data: u32 = 0;

    for idx in 0..cursor.num_slots as usize {
        let offset = cursor.slot(idx);
        if offset <= SLOT_TOMBSTONE {
            continue;
        }
        if mode == ExpungeMode::All {
            victims.push(offset);
            continue;
        }
        let entry = cursor.entry(offset);
        if entry.expire_time != 0 && now >= entry.expire_time {
            victims.push(offset);
            continue;
        }
        used_data += layout::round_up4(layout::record_len(entry.key_len, entry.value_len));
        keepers.push(offset);
    }

    // Grow the directory (2n+1, pseudo-prime) when the kept entries
    // load it past 30% and either the mode is an admission, or the
    // kept data still fits beside the bigger directory. It never
    // shrinks.
    let mut new_num_slots = cursor.num_slots;
    if f64::from(keepers.len() as u32) / f64::from(cursor.num_slots) > 0.3 {
        let candidate = cursor.num_slots * 2 + 1;
        if u64::from(layout::heap_start(candidate)) <= u64::from(cursor.page_size()) {
            let fits = heap_capacity(cursor.page_size(), candidate) >= used_data;
            if fits || matches!(mode, ExpungeMode::MakeRoom(_)) {
                new_num_slots = candidate;
            }
        }
    }

    if let ExpungeMode::MakeRoom(_) = mode {
        // LRU: oldest survivors go first until 40% of the (possibly
        // regrown) heap is free. The sort is stable, so ties keep
        // directory order.
        let threshold = (0.6 * f64::from(heap_capacity(cursor.page_size(), new_num_slots))) as u32;
        keepers.sort_by_key(|&offset| cursor.entry(offset).last_access);
        let mut evicted = 0;
        while evicted < keepers.len() && used_data >= threshold {
            let offset = keepers[evicted];
            let entry = cursor.entry(offset);
            used_data -= layout::round_up4(layout::record_len(entry.key_len, entry.value_len));
            evicted += 1;
        }
        victims.extend(keepers.drain(..evicted));
    }

    Some(ExpungePlan {
        new_num_slots,
        victims,
        keepers,
    })
}

/// Rebuild the page per the plan: a zeroed directory of
/// `new_num_slots`, surviving records packed into a fresh heap and
/// re-slotted by their stored `slot_hash`, both copied back in place.
/// Header fields on the cursor are reset (`old_slots` drops to 0) and
/// the cursor marked dirty.
pub fn do_expunge(cursor: &mut PageCursor, plan: &ExpungePlan) {
    let new_num_slots = plan.new_num_slots;
    let page_size = cursor.page_size();
    let heap_start = layout::heap_start(new_num_slots);

    let mut new_dir = vec![0u32; new_num_slots as usize];
    let mut new_heap = vec![0u8; heap_capacity(page_size, new_num_slots) as usize];
    let mut new_offset: u32 = 0;

    for &offset in &plan.keepers {
        let entry = cursor.entry(offset);
        let kvlen = layout::record_len(entry.key_len, entry.value_len);

        let mut slot = (entry.slot_hash % new_num_slots) as usize;
        while new_dir[slot] != 0 {
            slot += 1;
            if slot == new_num_slots as usize {
                slot = 0;
            }
        }
        new_dir[slot] = heap_start + new_offset;

        let src = cursor.record_bytes(offset, kvlen);
        new_heap[new_offset as usize..new_offset as usize + kvlen as usize].copy_from_slice(src);
        new_offset += layout::round_up4(kvlen);
    }

    cursor.replace_directory_and_heap(&new_dir, &new_heap[..new_offset as usize]);
    cursor.num_slots = new_num_slots;
    cursor.free_slots = new_num_slots - plan.keepers.len() as u32;
    cursor.old_slots = 0;
    cursor.free_data = heap_start + new_offset;
    cursor.free_bytes = page_size - cursor.free_data;
    cursor.mark_dirty();
}
