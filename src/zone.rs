//! Per-zone context.
//!
//! A [`Zone`] owns every structure the mapping and free-block managers touch:
//! the active and inactive log group lists, the PMT directory, the BMT window
//! and the free block list, plus its flash and metadata collaborators. All
//! entry points take `&mut self`; callers serialize access to a zone.

use crate::bmt::{BmtEntry, BmtWindow};
use crate::config::{BaseType, Dgn, EraseCount, Lbn, Vbn, ZoneConfig, MAX_ACTIVE_LBLKS};
use crate::error::{FlashError, FtlError, MetaError, Result};
use crate::flash::Flash;
use crate::free_list::FreeBlockList;
use crate::group_list::{GroupHandle, LogGroupList};
use crate::log_group::LogGroup;
use crate::mapping::update_pmt_cost;
use crate::meta::MetaStore;
use crate::pmt_dir::PmtDirectory;

/// Counters for the reclamation pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub reservations: u64,
    pub stalled_reservations: u64,
    pub gc_retired_logs: u64,
    pub inactive_compactions: u64,
    pub active_compactions: u64,
    pub inactive_merges: u64,
    pub active_merges: u64,
    pub switch_merges: u64,
    pub partial_merges: u64,
    pub full_merges: u64,
    pub pages_copied: u64,
    pub wear_level_moves: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveLogEntry {
    pub dgn: Dgn,
    pub vbn: Vbn,
    pub clean_page_offset: BaseType,
}

/// Crash-consistent summary handed to the metadata store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreeContext {
    pub num_free_blocks: u32,
    pub free_list_head: usize,
    pub num_active_log_blocks: u32,
    pub active_log_entries: Vec<ActiveLogEntry>,
}

pub struct Zone<F: Flash, M: MetaStore> {
    pub(crate) cfg: ZoneConfig,
    pub(crate) flash: F,
    pub(crate) meta: M,
    pub(crate) active: LogGroupList,
    pub(crate) inactive: LogGroupList,
    /// Single shared buffer for PMTs loaded only to answer a lookup.
    pub(crate) load_buffer: Option<LogGroup>,
    pub(crate) dir: PmtDirectory,
    pub(crate) bmt: BmtWindow,
    pub(crate) free: FreeBlockList,
    pub(crate) stats: ReclaimStats,
}

/// Unwraps a flash result, flagging codes that only broken state can produce.
pub(crate) fn flash_result<T>(r: std::result::Result<T, FlashError>) -> Result<T> {
    if let Err(e) = &r {
        debug_assert!(!e.is_logic_error(), "flash layer reported {e}");
    }
    r.map_err(FtlError::from)
}

impl<F: Flash, M: MetaStore> Zone<F, M> {
    /// Builds a freshly formatted zone: every physical block is free and no
    /// logical block has data.
    pub fn format(cfg: ZoneConfig, flash: F, meta: M) -> Result<Self> {
        cfg.validate()?;
        let mut free = FreeBlockList::new(cfg.max_free_slots, cfg.options.sorted_free_list);
        for vbn in 0..cfg.num_physical_blocks {
            free.add(vbn, 0)?;
        }
        info!(
            "zone formatted: {} physical blocks, {} logical blocks, {} data groups ({}:{})",
            cfg.num_physical_blocks,
            cfg.num_logical_blocks,
            cfg.num_groups(),
            cfg.blocks_per_group,
            cfg.logs_per_group
        );

        Ok(Zone {
            active: LogGroupList::with_capacity("active", cfg.active_pool_size),
            inactive: LogGroupList::with_capacity("inactive", cfg.inactive_pool_size),
            load_buffer: None,
            dir: PmtDirectory::new(cfg.num_groups(), cfg.ec_group_size),
            bmt: BmtWindow::new(),
            free,
            stats: ReclaimStats::default(),
            cfg,
            flash,
            meta,
        })
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.cfg
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn meta(&self) -> &M {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut M {
        &mut self.meta
    }

    pub fn stats(&self) -> ReclaimStats {
        self.stats
    }

    pub fn directory(&self) -> &PmtDirectory {
        &self.dir
    }

    pub fn free_list(&self) -> &FreeBlockList {
        &self.free
    }

    pub fn num_free_blocks(&self) -> u32 {
        self.free.len() as u32
    }

    /// Active groups, LRU first.
    pub fn active_dgns(&self) -> Vec<Dgn> {
        self.active.dgns()
    }

    pub fn inactive_dgns(&self) -> Vec<Dgn> {
        self.inactive.dgns()
    }

    /// A resident group, active list first.
    pub fn group(&self, dgn: Dgn) -> Option<&LogGroup> {
        if let Some(h) = self.active.find(dgn) {
            return Some(self.active.get(h));
        }
        self.inactive.find(dgn).map(|h| self.inactive.get(h))
    }

    pub fn free_context(&self) -> FreeContext {
        let mut entries = Vec::new();
        for h in self.active.iter_lru() {
            let group = self.active.get(h);
            for idx in group.logs_oldest_first() {
                let log = group.log(idx);
                if log.state.active && entries.len() < MAX_ACTIVE_LBLKS {
                    entries.push(ActiveLogEntry {
                        dgn: group.dgn(),
                        vbn: log.vbn,
                        clean_page_offset: log.clean_page_offset,
                    });
                }
            }
        }
        FreeContext {
            num_free_blocks: self.num_free_blocks(),
            free_list_head: self.free.head_index(),
            num_active_log_blocks: entries.len() as u32,
            active_log_entries: entries,
        }
    }

    /// Brings `dgn` to the head of the active list, loading or creating it.
    ///
    /// Room is made before the group is fetched, so a failed load leaves the
    /// lists consistent.
    pub(crate) fn activate_group(&mut self, dgn: Dgn) -> Result<GroupHandle> {
        if let Some(h) = self.active.find(dgn) {
            self.active.move_to_head(h);
            return Ok(h);
        }

        if self.active.is_full() {
            let Some(victim) = self.active.select_victim(Some(dgn)) else {
                return Err(FtlError::InvalidConfig("active pool has no evictable group".into()));
            };
            let victim_dgn = self.active.get(victim).dgn();
            self.demote_group(victim_dgn)?;
        }

        let group = if let Some(h) = self.inactive.find(dgn) {
            self.inactive.remove(h)
        } else if let Some(g) = self.take_load_buffer(dgn) {
            g
        } else if let Some(offset) = self.dir.search(dgn) {
            self.meta.load_pmt(dgn, offset)?
        } else {
            LogGroup::new(dgn, &self.cfg)
        };

        debug!("group {} promoted to active ({} logs)", dgn, group.num_logs());
        match self.active.insert_head(group) {
            Ok(h) => Ok(h),
            Err(_) => Err(FtlError::InvalidConfig("active pool refused a group after eviction".into())),
        }
    }

    /// Persists an active group and moves it into the inactive cache.
    pub(crate) fn demote_group(&mut self, dgn: Dgn) -> Result<()> {
        let Some(h) = self.active.find(dgn) else {
            return Ok(());
        };
        if self.active.get(h).num_logs() == 0 {
            self.release_group(h);
            return Ok(());
        }

        let mut snapshot = self.active.get(h).clone();
        snapshot.clear_active_flags();
        let offset = self.meta.store_pmt_context(&snapshot)?;
        self.dir.update(dgn, offset, snapshot.min_erase_count(), snapshot.min_erase_count_vbn());

        self.active.remove(h);
        self.invalidate_load_buffer(dgn);
        if self.inactive.is_full() {
            if let Some(tail) = self.inactive.tail() {
                let dropped = self.inactive.remove(tail);
                trace!("group {} dropped from inactive cache", dropped.dgn());
            }
        }
        debug!("group {} demoted to inactive (meta offset {})", dgn, offset);
        if self.inactive.insert_head(snapshot).is_err() {
            return Err(FtlError::InvalidConfig("inactive pool refused a group after eviction".into()));
        }
        Ok(())
    }

    /// Returns a group without logs to the pool and forgets it in the directory.
    pub(crate) fn release_group(&mut self, h: GroupHandle) {
        let group = self.active.remove(h);
        debug!("group {} released", group.dgn());
        self.dir.clear(group.dgn());
        self.invalidate_load_buffer(group.dgn());
    }

    pub(crate) fn invalidate_load_buffer(&mut self, dgn: Dgn) {
        self.take_load_buffer(dgn);
    }

    fn take_load_buffer(&mut self, dgn: Dgn) -> Option<LogGroup> {
        if self.load_buffer.as_ref().is_some_and(|g| g.dgn() == dgn) {
            return self.load_buffer.take();
        }
        None
    }

    /// Recomputes the group's cost and erase-count bookkeeping in the directory.
    pub(crate) fn refresh_group(&mut self, h: GroupHandle) {
        let group = self.active.get_mut(h);
        let cost = update_pmt_cost(group);
        let (dgn, min_ec, min_vbn) = (group.dgn(), group.min_erase_count(), group.min_erase_count_vbn());
        self.dir.set_cost(dgn, cost);
        self.dir.update_erase_count(dgn, min_ec, min_vbn);
    }

    /// Releases the group if its last log is gone. Returns true when released.
    pub(crate) fn release_if_empty(&mut self, h: GroupHandle) -> bool {
        if self.active.get(h).num_logs() == 0 {
            self.release_group(h);
            return true;
        }
        false
    }

    /// A copy of a non-active group, from the inactive cache or the metadata store.
    pub(crate) fn inactive_snapshot(&mut self, dgn: Dgn) -> Result<LogGroup> {
        if let Some(h) = self.inactive.find(dgn) {
            return Ok(self.inactive.get(h).clone());
        }
        if let Some(g) = self.load_buffer.as_ref().filter(|g| g.dgn() == dgn) {
            return Ok(g.clone());
        }
        let offset = self
            .dir
            .search(dgn)
            .ok_or(MetaError::PmtNotFound { dgn, offset: BaseType::MAX })?;
        let group = self.meta.load_pmt(dgn, offset)?;
        self.load_buffer = Some(group.clone());
        Ok(group)
    }

    /// Makes the BMT area holding `lbn` resident, writing back a dirty window first.
    pub(crate) fn ensure_bmt(&mut self, lbn: Lbn) -> Result<()> {
        let area = self.cfg.local_area_of(lbn);
        if self.bmt.area() == Some(area) {
            return Ok(());
        }
        if let (Some(old), true) = (self.bmt.area(), self.bmt.is_dirty()) {
            self.meta.store_bmt(old, self.bmt.entries())?;
            self.bmt.mark_clean();
        }
        let entries = self.meta.load_bmt(area)?;
        trace!("BMT window -> area {}", area);
        self.bmt.install(area, area * self.cfg.blocks_per_local_area, entries);
        Ok(())
    }

    pub(crate) fn bmt_entry(&mut self, lbn: Lbn) -> Result<&BmtEntry> {
        self.ensure_bmt(lbn)?;
        self.bmt
            .get(lbn)
            .ok_or_else(|| MetaError::Corrupt(format!("BMT window misses block {lbn}")).into())
    }

    pub(crate) fn bmt_entry_mut(&mut self, lbn: Lbn) -> Result<&mut BmtEntry> {
        self.ensure_bmt(lbn)?;
        self.bmt
            .get_mut(lbn)
            .ok_or_else(|| MetaError::Corrupt(format!("BMT window misses block {lbn}")).into())
    }

    /// Minimum erase count known to the zone: tracked logs and free blocks.
    pub fn global_min_erase_count(&self) -> Option<EraseCount> {
        let tracked = self.dir.global_min().map(|(ec, _, _)| ec);
        match (tracked, self.free.min_erase_count()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Writes every active group and the BMT window back to the metadata store.
    pub fn flush(&mut self) -> Result<()> {
        for dgn in self.active.dgns() {
            let Some(h) = self.active.find(dgn) else {
                continue;
            };
            if self.release_if_empty(h) {
                continue;
            }
            let mut snapshot = self.active.get(h).clone();
            snapshot.clear_active_flags();
            let offset = self.meta.store_pmt_context(&snapshot)?;
            self.dir.update(dgn, offset, snapshot.min_erase_count(), snapshot.min_erase_count_vbn());
            self.invalidate_load_buffer(dgn);
        }
        if let (Some(area), true) = (self.bmt.area(), self.bmt.is_dirty()) {
            self.meta.store_bmt(area, self.bmt.entries())?;
            self.bmt.mark_clean();
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ZoneOptions;
    use crate::flash::MemFlash;
    use crate::meta::MemMetaStore;

    pub(crate) type MemZone = Zone<MemFlash, MemMetaStore>;

    pub(crate) fn small_config() -> ZoneConfig {
        ZoneConfig {
            pages_per_block: 8,
            num_ways: 2,
            blocks_per_group: 1,
            logs_per_group: 4,
            num_logical_blocks: 16,
            num_physical_blocks: 40,
            blocks_per_local_area: 8,
            page_size: 16,
            active_pool_size: 2,
            inactive_pool_size: 2,
            max_free_slots: 40,
            ec_group_size: 4,
            wear_level_threshold: 8,
            free_block_threshold: 2,
            options: ZoneOptions {
                wear_leveling: false,
                mlc_fast_mode: false,
                sorted_free_list: false,
                gc_deleted_pages: false,
            },
        }
    }

    pub(crate) fn zone_with(cfg: ZoneConfig) -> MemZone {
        let flash = MemFlash::new(cfg.num_physical_blocks, cfg.pages_per_block, cfg.num_ways, cfg.page_size);
        let meta = MemMetaStore::new(cfg.num_logical_blocks, cfg.blocks_per_local_area, cfg.pages_per_block);
        Zone::format(cfg, flash, meta).unwrap()
    }

    #[test]
    fn format_fills_free_list() {
        let zone = zone_with(small_config());
        assert_eq!(zone.num_free_blocks(), 40);
        assert!(zone.active_dgns().is_empty());
        let ctx = zone.free_context();
        assert_eq!(ctx.num_free_blocks, 40);
        assert_eq!(ctx.num_active_log_blocks, 0);
    }

    #[test]
    fn activation_evicts_lru_into_inactive_cache() {
        let mut zone = zone_with(small_config());
        for dgn in 0..3 {
            let h = zone.activate_group(dgn).unwrap();
            zone.active.get_mut(h).alloc_log(30 + dgn, 0, false).unwrap();
            zone.refresh_group(h);
        }
        assert_eq!(zone.active_dgns(), vec![1, 2]);
        assert_eq!(zone.inactive_dgns(), vec![0]);
        assert!(zone.directory().search(0).is_some());

        // reactivation pulls the group back out of the cache
        zone.activate_group(0).unwrap();
        assert_eq!(zone.active_dgns(), vec![2, 0]);
        assert_eq!(zone.inactive_dgns(), vec![1]);
        assert_eq!(zone.group(0).unwrap().num_logs(), 1);
    }

    #[test]
    fn dropped_inactive_group_reloads_from_meta() {
        let mut zone = zone_with(small_config());
        for dgn in 0..5 {
            let h = zone.activate_group(dgn).unwrap();
            zone.active.get_mut(h).alloc_log(20 + dgn, 0, false).unwrap();
            zone.refresh_group(h);
        }
        assert_eq!(zone.inactive_dgns(), vec![1, 2]);
        assert!(zone.group(0).is_none());

        let loads = zone.meta().pmt_loads;
        zone.activate_group(0).unwrap();
        assert_eq!(zone.meta().pmt_loads, loads + 1);
        assert_eq!(zone.group(0).unwrap().log(0).vbn, 20);
    }

    #[test]
    fn failed_load_leaves_lists_consistent() {
        let mut zone = zone_with(small_config());
        for dgn in 0..5 {
            let h = zone.activate_group(dgn).unwrap();
            zone.active.get_mut(h).alloc_log(20 + dgn, 0, false).unwrap();
            zone.refresh_group(h);
        }
        zone.meta_mut().set_pmt_load_failure(true);
        assert!(zone.activate_group(0).is_err());
        zone.meta_mut().set_pmt_load_failure(false);

        let active = zone.active_dgns();
        let inactive = zone.inactive_dgns();
        assert!(!active.contains(&0) && !inactive.contains(&0));
        for dgn in &active {
            assert!(!inactive.contains(dgn));
        }
        zone.activate_group(0).unwrap();
        assert_eq!(zone.group(0).unwrap().num_logs(), 1);
    }

    #[test]
    fn empty_group_is_released_not_stored() {
        let mut zone = zone_with(small_config());
        zone.activate_group(3).unwrap();
        let stores = zone.meta().pmt_stores;
        zone.demote_group(3).unwrap();
        assert_eq!(zone.meta().pmt_stores, stores);
        assert!(zone.group(3).is_none());
    }

    #[test]
    fn bmt_window_writes_back_dirty_area() {
        let mut zone = zone_with(small_config());
        zone.bmt_entry_mut(2).unwrap().assign(33, 1);
        // block 9 lives in the second area
        assert_eq!(zone.bmt_entry(9).unwrap().data_vbn, None);
        assert_eq!(zone.meta().bmt_stores, 1);
        assert_eq!(zone.bmt_entry(2).unwrap().data_vbn, Some(33));
    }
}
