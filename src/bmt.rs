//! Block mapping table window.
//!
//! Only one local area of the BMT is resident at a time. Entries map a logical
//! block to its data block and carry a per-page deletion bitmap.

use crate::config::{BaseType, EraseCount, Lbn, Vbn};

/// Get bit `idx` from a bitmap byte slice.
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    match bitmap.get(byte_idx) {
        Some(byte) => (byte >> (idx % 8)) & 1 == 1,
        None => false,
    }
}

pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    if let Some(byte) = bitmap.get_mut((idx / 8) as usize) {
        *byte |= 1 << (idx % 8);
    }
}

pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    if let Some(byte) = bitmap.get_mut((idx / 8) as usize) {
        *byte &= !(1 << (idx % 8));
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BmtEntry {
    pub data_vbn: Option<Vbn>,
    pub erase_count: EraseCount,
    deleted: Vec<u8>,
}

impl BmtEntry {
    /// An unassigned logical block: every page reads as deleted.
    pub fn unassigned(pages_per_block: BaseType) -> Self {
        BmtEntry {
            data_vbn: None,
            erase_count: 0,
            deleted: vec![0xff; (pages_per_block as usize).div_ceil(8)],
        }
    }

    pub fn is_deleted(&self, offset: BaseType) -> bool {
        self.data_vbn.is_none() || bitmap_get(&self.deleted, offset)
    }

    pub fn mark_deleted(&mut self, offset: BaseType) {
        bitmap_set(&mut self.deleted, offset);
    }

    pub fn mark_present(&mut self, offset: BaseType) {
        bitmap_clear(&mut self.deleted, offset);
    }

    /// Points the entry at a freshly assembled data block.
    pub fn assign(&mut self, vbn: Vbn, erase_count: EraseCount) {
        self.data_vbn = Some(vbn);
        self.erase_count = erase_count;
        self.deleted.fill(0xff);
    }

    /// Detaches the data block, returning it with its erase count.
    pub fn take(&mut self) -> Option<(Vbn, EraseCount)> {
        let vbn = self.data_vbn.take()?;
        self.deleted.fill(0xff);
        Some((vbn, self.erase_count))
    }
}

#[derive(Debug)]
pub struct BmtWindow {
    area: Option<BaseType>,
    first_lbn: Lbn,
    entries: Vec<BmtEntry>,
    dirty: bool,
}

impl BmtWindow {
    pub fn new() -> Self {
        BmtWindow {
            area: None,
            first_lbn: 0,
            entries: Vec::new(),
            dirty: false,
        }
    }

    pub fn area(&self) -> Option<BaseType> {
        self.area
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn entries(&self) -> &[BmtEntry] {
        &self.entries
    }

    pub fn install(&mut self, area: BaseType, first_lbn: Lbn, entries: Vec<BmtEntry>) {
        self.area = Some(area);
        self.first_lbn = first_lbn;
        self.entries = entries;
        self.dirty = false;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn contains(&self, lbn: Lbn) -> bool {
        self.area.is_some()
            && lbn >= self.first_lbn
            && ((lbn - self.first_lbn) as usize) < self.entries.len()
    }

    pub fn get(&self, lbn: Lbn) -> Option<&BmtEntry> {
        if !self.contains(lbn) {
            return None;
        }
        self.entries.get((lbn - self.first_lbn) as usize)
    }

    pub fn get_mut(&mut self, lbn: Lbn) -> Option<&mut BmtEntry> {
        if !self.contains(lbn) {
            return None;
        }
        self.dirty = true;
        self.entries.get_mut((lbn - self.first_lbn) as usize)
    }
}

impl Default for BmtWindow {
    fn default() -> Self {
        Self::new()
    }
}
