//! Metadata-store collaborator.
//!
//! Page layout of PMT/BMT pages on flash is the store's business; the core
//! hands whole log groups and BMT areas across this boundary.

use std::collections::HashMap;

use crate::bmt::BmtEntry;
use crate::config::{BaseType, Dgn, Lbn, MetaOffset};
use crate::error::MetaError;
use crate::log_group::LogGroup;

pub trait MetaStore {
    fn load_pmt(&mut self, dgn: Dgn, meta_offset: MetaOffset) -> Result<LogGroup, MetaError>;

    /// Persists a group's mapping table and returns where it now lives.
    fn store_pmt_context(&mut self, group: &LogGroup) -> Result<MetaOffset, MetaError>;

    fn load_bmt(&mut self, area: BaseType) -> Result<Vec<BmtEntry>, MetaError>;

    fn store_bmt(&mut self, area: BaseType, entries: &[BmtEntry]) -> Result<(), MetaError>;
}

/// Append-only in-memory store; every PMT store lands at a fresh offset.
pub struct MemMetaStore {
    pmt_pages: HashMap<MetaOffset, LogGroup>,
    next_offset: MetaOffset,
    bmt: Vec<Vec<BmtEntry>>,
    blocks_per_area: BaseType,

    pub pmt_loads: u64,
    pub pmt_stores: u64,
    pub bmt_loads: u64,
    pub bmt_stores: u64,
    fail_pmt_load: bool,
}

impl MemMetaStore {
    pub fn new(num_logical_blocks: BaseType, blocks_per_area: BaseType, pages_per_block: BaseType) -> Self {
        let num_areas = num_logical_blocks.div_ceil(blocks_per_area.max(1));
        let bmt = (0..num_areas)
            .map(|area| {
                let first: Lbn = area * blocks_per_area;
                let len = blocks_per_area.min(num_logical_blocks - first);
                vec![BmtEntry::unassigned(pages_per_block); len as usize]
            })
            .collect();

        MemMetaStore {
            pmt_pages: HashMap::new(),
            next_offset: 0,
            bmt,
            blocks_per_area,
            pmt_loads: 0,
            pmt_stores: 0,
            bmt_loads: 0,
            bmt_stores: 0,
            fail_pmt_load: false,
        }
    }

    pub fn blocks_per_area(&self) -> BaseType {
        self.blocks_per_area
    }

    /// Makes PMT loads fail until cleared.
    pub fn set_pmt_load_failure(&mut self, fail: bool) {
        self.fail_pmt_load = fail;
    }
}

impl MetaStore for MemMetaStore {
    fn load_pmt(&mut self, dgn: Dgn, meta_offset: MetaOffset) -> Result<LogGroup, MetaError> {
        if self.fail_pmt_load {
            return Err(MetaError::Corrupt(format!("injected PMT load failure for group {dgn}")));
        }
        let group = self
            .pmt_pages
            .get(&meta_offset)
            .ok_or(MetaError::PmtNotFound { dgn, offset: meta_offset })?;
        if group.dgn() != dgn {
            return Err(MetaError::Corrupt(format!(
                "PMT at offset {meta_offset} belongs to group {}, expected {dgn}",
                group.dgn()
            )));
        }
        self.pmt_loads += 1;
        Ok(group.clone())
    }

    fn store_pmt_context(&mut self, group: &LogGroup) -> Result<MetaOffset, MetaError> {
        let offset = self.next_offset;
        self.next_offset = self.next_offset.wrapping_add(1);
        self.pmt_pages.insert(offset, group.clone());
        self.pmt_stores += 1;
        Ok(offset)
    }

    fn load_bmt(&mut self, area: BaseType) -> Result<Vec<BmtEntry>, MetaError> {
        let entries = self
            .bmt
            .get(area as usize)
            .ok_or(MetaError::BmtAreaOutOfRange { area })?;
        self.bmt_loads += 1;
        Ok(entries.clone())
    }

    fn store_bmt(&mut self, area: BaseType, entries: &[BmtEntry]) -> Result<(), MetaError> {
        let slot = self
            .bmt
            .get_mut(area as usize)
            .ok_or(MetaError::BmtAreaOutOfRange { area })?;
        if slot.len() != entries.len() {
            return Err(MetaError::Corrupt(format!(
                "BMT area {area} holds {} entries, got {}",
                slot.len(),
                entries.len()
            )));
        }
        slot.clone_from_slice(entries);
        self.bmt_stores += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneConfig;

    #[test]
    fn pmt_store_then_load() {
        let cfg = ZoneConfig::default();
        let mut meta = MemMetaStore::new(cfg.num_logical_blocks, cfg.blocks_per_local_area, cfg.pages_per_block);
        let group = LogGroup::new(5, &cfg);
        let first = meta.store_pmt_context(&group).unwrap();
        let second = meta.store_pmt_context(&group).unwrap();
        assert_ne!(first, second);

        assert_eq!(meta.load_pmt(5, second).unwrap().dgn(), 5);
        assert!(matches!(meta.load_pmt(6, second), Err(MetaError::Corrupt(_))));
        assert!(matches!(meta.load_pmt(5, 99), Err(MetaError::PmtNotFound { .. })));
    }

    #[test]
    fn bmt_areas_round_trip() {
        let mut meta = MemMetaStore::new(24, 16, 8);
        assert_eq!(meta.load_bmt(0).unwrap().len(), 16);
        let mut tail = meta.load_bmt(1).unwrap();
        assert_eq!(tail.len(), 8);
        tail[2].assign(77, 4);
        meta.store_bmt(1, &tail).unwrap();
        assert_eq!(meta.load_bmt(1).unwrap()[2].data_vbn, Some(77));
        assert!(meta.load_bmt(2).is_err());
    }
}
