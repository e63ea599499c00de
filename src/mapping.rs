//! Mapping manager: LPN resolution, log selection and PMT maintenance.

use num_integer::Integer;

use crate::config::{BaseType, Dgn, Lpn, Vbn, Vpn, ZoneConfig};
use crate::error::{FtlError, Result};
use crate::flash::{Flash, Spare, FULL_PAGE};
use crate::group_list::GroupHandle;
use crate::log_group::LogGroup;
use crate::meta::MetaStore;
use crate::pmt_dir::{COST_JUST_STARTED, COST_MAX};
use crate::zone::{flash_result, Zone};

/// Upper bound on log allocation/merge rounds for a single page write.
const MAX_ALLOC_ROUNDS: usize = 64;

/// A page reserved for a write that has not been committed yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteSlot {
    pub dgn: Dgn,
    pub log_index: usize,
    pub vpn: Vpn,
}

/// Next way-aligned clean offset at or after `cursor` for `lpn`.
///
/// In MLC fast mode the offset also skips MSB rows; the skip is a whole way
/// row so alignment is kept.
pub fn next_clean_offset<F: Flash>(
    cfg: &ZoneConfig,
    flash: &F,
    vbn: Vbn,
    cursor: BaseType,
    lpn: Lpn,
    mlc_fast: bool,
) -> Option<BaseType> {
    let ways = i64::from(cfg.num_ways);
    let skip = (i64::from(lpn) % ways - i64::from(cursor) % ways).mod_floor(&ways);
    let mut offset = cursor + skip as BaseType;
    if mlc_fast {
        while offset < cfg.pages_per_block && !flash.is_lsb_page(cfg.vpn_of(vbn, offset)) {
            offset += cfg.num_ways;
        }
    }
    (offset < cfg.pages_per_block).then_some(offset)
}

/// Recomputes the group's minimum-valid log and returns its compaction cost.
///
/// Logs are scanned oldest to newest, so on a tie the newer log wins.
pub fn update_pmt_cost(group: &mut LogGroup) -> u32 {
    let pages_per_block = group.pages_per_block();
    let mut min: Option<(usize, u32)> = None;
    for idx in group.logs_oldest_first() {
        let valid = group.valid_pages(idx);
        if min.map_or(true, |(_, m)| valid <= m) {
            min = Some((idx, valid));
        }
    }
    group.min_valid_page_log_index = min.map(|(idx, _)| idx);

    let num_logs = group.num_logs() as u32;
    match (num_logs, min) {
        (0, _) | (_, None) => COST_MAX,
        (1, _) => COST_JUST_STARTED,
        (n, Some((_, min_valid))) => {
            let head_room = group
                .head()
                .map_or(0, |h| group.log(h).remaining_pages(pages_per_block));
            if head_room < min_valid {
                2 * pages_per_block / n
            } else {
                (min_valid + pages_per_block).saturating_sub(n)
            }
        }
    }
}

impl<F: Flash, M: MetaStore> Zone<F, M> {
    fn check_lpn(&self, lpn: Lpn) -> Result<()> {
        if lpn >= self.cfg.num_logical_pages() {
            return Err(FtlError::LpnOutOfRange { lpn });
        }
        Ok(())
    }

    /// Resolves a logical page to its newest physical copy.
    ///
    /// Lookup order is active list, inactive cache, persisted PMT, then BMT.
    /// A resident group that misses goes straight to the BMT: older PMT
    /// snapshots of the same group must not answer.
    pub fn resolve_for_read(&mut self, lpn: Lpn) -> Result<(Vpn, bool)> {
        self.check_lpn(lpn)?;
        let dgn = self.cfg.dgn_of(lpn);
        let lpo = self.cfg.lpo_of(lpn);

        if let Some(h) = self.active.find(dgn) {
            if let Some(vpn) = self.active.get(h).lookup_vpn(lpo) {
                return Ok((vpn, false));
            }
            return self.resolve_through_bmt(lpn);
        }
        if let Some(h) = self.inactive.find(dgn) {
            if let Some(vpn) = self.inactive.get(h).lookup_vpn(lpo) {
                return Ok((vpn, false));
            }
            return self.resolve_through_bmt(lpn);
        }

        let buffered = self.load_buffer.as_ref().is_some_and(|g| g.dgn() == dgn);
        if !buffered {
            if let Some(offset) = self.dir.search(dgn) {
                trace!("loading PMT of group {} from meta offset {}", dgn, offset);
                self.load_buffer = Some(self.meta.load_pmt(dgn, offset)?);
            }
        }
        if let Some(group) = self.load_buffer.as_ref().filter(|g| g.dgn() == dgn) {
            if let Some(vpn) = group.lookup_vpn(lpo) {
                return Ok((vpn, false));
            }
        }
        self.resolve_through_bmt(lpn)
    }

    fn resolve_through_bmt(&mut self, lpn: Lpn) -> Result<(Vpn, bool)> {
        let lbn = self.cfg.lbn_of(lpn);
        let offset = self.cfg.page_offset_of(lpn);
        let entry = self.bmt_entry(lbn)?;
        match entry.data_vbn {
            Some(vbn) => {
                let deleted = entry.is_deleted(offset);
                Ok((self.cfg.vpn_of(vbn, offset), deleted))
            }
            None => {
                // placeholder address; the caller must not trust its content
                let vbn = self.free.peek().map_or(0, |(vbn, _)| vbn);
                Ok((self.cfg.vpn_of(vbn, offset), true))
            }
        }
    }

    /// Computes the next writable page of a log for `lpn` and makes it the
    /// log's clean-page offset. `None` when the log has no room left.
    pub fn get_log_clean_page_number(&mut self, h: GroupHandle, log_idx: usize, lpn: Lpn) -> Option<Vpn> {
        let (vbn, cursor, mlc_fast) = {
            let log = self.active.get(h).log(log_idx);
            (log.vbn, log.clean_page_offset, log.state.mlc_fast)
        };
        let offset = next_clean_offset(&self.cfg, &self.flash, vbn, cursor, lpn, mlc_fast)?;
        if offset != cursor {
            trace!("log vbn {} skips {} -> {} for lpn {}", vbn, cursor, offset, lpn);
        }
        self.active.get_mut(h).log_mut(log_idx).clean_page_offset = offset;
        Some(self.cfg.vpn_of(vbn, offset))
    }

    /// Records a programmed page. Called once per successful program.
    pub fn update_pmt(&mut self, h: GroupHandle, log_idx: usize, lpn: Lpn, vpn: Vpn) {
        let lpo = self.cfg.lpo_of(lpn);
        let lbn = self.cfg.lbn_of(lpn);
        let offset = vpn % self.cfg.pages_per_block;
        let block_aligned = self.cfg.page_offset_of(lpn) == 0;

        let group = self.active.get_mut(h);
        debug_assert_eq!(group.log(log_idx).vbn, vpn / self.cfg.pages_per_block);
        group.map_page(lpo, log_idx, offset, lbn);
        let num_dblks = group.num_dblks(log_idx);
        let log = group.log_mut(log_idx);
        log.clean_page_offset = log.clean_page_offset.max(offset + 1);
        log.on_page_written(lpo, block_aligned, num_dblks);

        self.refresh_group(h);
    }

    /// Cheapest merge victim that is neither active nor listed in `exclude`.
    pub fn search_merge_victim_group(&mut self, exclude: &[Dgn]) -> Option<Dgn> {
        let mut masked = self.active.dgns();
        masked.extend_from_slice(exclude);
        self.dir.search_merge_victim(&masked)
    }

    /// Whether merging the group would do useful work.
    pub fn check_merge_victim(&mut self, group: &LogGroup) -> Result<bool> {
        match group.num_logs() {
            0 => Ok(false),
            1 => {
                let Some(idx) = group.head() else {
                    return Ok(false);
                };
                for &lbn in group.lbns(idx) {
                    if self.bmt_entry(lbn)?.data_vbn.is_some() {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    /// Picks (allocating or reclaiming as needed) the page `lpn` will be
    /// programmed at.
    /// Free blocks a single-log merge may need: one per data block the log
    /// spans.
    pub fn merge_headroom(&self) -> u32 {
        self.cfg.blocks_per_group
    }

    pub fn allocate_for_write(&mut self, lpn: Lpn) -> Result<WriteSlot> {
        self.check_lpn(lpn)?;
        let dgn = self.cfg.dgn_of(lpn);

        for _ in 0..MAX_ALLOC_ROUNDS {
            let h = self.activate_group(dgn)?;

            if let Some(head) = self.active.get(h).head() {
                if let Some(vpn) = self.get_log_clean_page_number(h, head, lpn) {
                    self.active.get_mut(h).log_mut(head).state.active = true;
                    return Ok(WriteSlot {
                        dgn,
                        log_index: head,
                        vpn,
                    });
                }
            }

            if self.active.get(h).is_full() {
                // no slot for a new log: merge one of ours first
                if !self.compact_log(h)? {
                    let needed = self.merge_requirement(h)?.max(1);
                    self.reserve_free_blocks(dgn, needed)?;
                    if self.num_free_blocks() < needed {
                        return Err(FtlError::NoSpace {
                            needed,
                            available: self.num_free_blocks(),
                        });
                    }
                }
                continue;
            }

            // the last `headroom` blocks are only handed to merges and compactions
            let headroom = self.merge_headroom();
            if self.num_free_blocks() <= headroom {
                let needed = headroom + 1;
                if self.reserve_free_blocks(dgn, needed)? >= needed {
                    continue;
                }
                let h = self.activate_group(dgn)?;
                if self.active.get(h).num_logs() > 0 && self.compact_log(h)? {
                    continue;
                }
                return Err(FtlError::NoSpace {
                    needed,
                    available: self.num_free_blocks(),
                });
            }

            let (vbn, ec) = self.get_free_blk()?;
            let mlc_fast = self.cfg.options.mlc_fast_mode;
            let group = self.active.get_mut(h);
            match group.alloc_log(vbn, ec, mlc_fast) {
                Some(idx) => debug!("group {} allocated log slot {} on block {} (ec {})", dgn, idx, vbn, ec),
                None => {
                    self.add_free_list(vbn, ec)?;
                    continue;
                }
            }
            self.refresh_group(h);
        }
        Err(FtlError::NoSpace {
            needed: 1,
            available: self.num_free_blocks(),
        })
    }

    /// Finishes a write reserved by [`Zone::allocate_for_write`] once the page
    /// has been programmed.
    pub fn commit_write(&mut self, slot: WriteSlot, lpn: Lpn) -> Result<()> {
        let h = self.active.find(slot.dgn).ok_or(FtlError::StaleWriteSlot { vpn: slot.vpn })?;
        self.update_pmt(h, slot.log_index, lpn, slot.vpn);
        Ok(())
    }

    pub fn write_page(&mut self, lpn: Lpn, data: &[u8]) -> Result<Vpn> {
        let slot = self.allocate_for_write(lpn)?;
        if let Err(e) = self.flash.program_page(slot.vpn, data, &Spare { lpn }) {
            warn!("program of lpn {} at vpn {} failed: {}", lpn, slot.vpn, e);
            // the page is burned either way
            if let Some(h) = self.active.find(slot.dgn) {
                let offset = slot.vpn % self.cfg.pages_per_block;
                let log = self.active.get_mut(h).log_mut(slot.log_index);
                log.clean_page_offset = log.clean_page_offset.max(offset + 1);
            }
            return flash_result(Err(e));
        }
        self.commit_write(slot, lpn)?;
        Ok(slot.vpn)
    }

    /// Reads a page into `buf`. Returns false (and zero-fills) for deleted pages.
    pub fn read_page(&mut self, lpn: Lpn, buf: &mut [u8]) -> Result<bool> {
        let (vpn, deleted) = self.resolve_for_read(lpn)?;
        if deleted {
            buf.fill(0);
            return Ok(false);
        }
        flash_result(self.flash.read_page(vpn, FULL_PAGE, buf))?;
        Ok(true)
    }

    /// Logically deletes a page.
    pub fn delete_page(&mut self, lpn: Lpn) -> Result<()> {
        self.check_lpn(lpn)?;
        let dgn = self.cfg.dgn_of(lpn);
        let known = self.active.contains(dgn) || self.inactive.contains(dgn) || self.dir.search(dgn).is_some();
        if known {
            let h = self.activate_group(dgn)?;
            if self.active.get_mut(h).unmap_page(self.cfg.lpo_of(lpn)).is_some() {
                self.refresh_group(h);
            }
        }
        let offset = self.cfg.page_offset_of(lpn);
        self.bmt_entry_mut(self.cfg.lbn_of(lpn))?.mark_deleted(offset);
        Ok(())
    }
}
