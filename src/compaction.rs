//! Copy-compaction and log merging for a single log group.
//!
//! Compaction drains the emptiest logs into one destination log. Merging
//! retires a log entirely by pushing its logical blocks back into the BMT,
//! either by switching a sequential log in as the data block or by
//! assembling a fresh data block from the newest copy of every page.

use crate::config::{BaseType, Lbn, Vbn, Vpn, ZoneConfig};
use crate::error::{FtlError, Result};
use crate::flash::{Flash, Spare};
use crate::group_list::GroupHandle;
use crate::log_block::LogMode;
use crate::log_group::LogGroup;
use crate::mapping::next_clean_offset;
use crate::meta::MetaStore;
use crate::zone::{flash_result, Zone};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    Existing(usize),
    NewLog,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionPlan {
    pub dest: Destination,
    /// Logs that fully drain into the destination, in copy order.
    pub sources: Vec<usize>,
}

impl CompactionPlan {
    pub fn gain(&self) -> usize {
        let spent = usize::from(self.dest == Destination::NewLog);
        self.sources.len().saturating_sub(spent)
    }
}

/// Finds a destination log and the source logs it can absorb whole.
///
/// Returns `None` unless the compaction would free at least one block.
pub fn plan_compaction<F: Flash>(
    cfg: &ZoneConfig,
    flash: &F,
    group: &LogGroup,
    free_head: Option<Vbn>,
    allow_new_log: bool,
) -> Option<CompactionPlan> {
    if group.num_logs() < 2 {
        return None;
    }

    let head = group.head()?;
    let (dest, vbn, mut cursor, mlc_fast) = if group.log(head).remaining_pages(cfg.pages_per_block) > 0 {
        let log = group.log(head);
        (Destination::Existing(head), log.vbn, log.clean_page_offset, log.state.mlc_fast)
    } else if allow_new_log && !group.is_full() {
        (Destination::NewLog, free_head?, 0, cfg.options.mlc_fast_mode)
    } else {
        return None;
    };

    let mut candidates: Vec<usize> = group
        .logs_oldest_first()
        .into_iter()
        .filter(|&idx| Destination::Existing(idx) != dest)
        .collect();
    candidates.sort_by_key(|&idx| group.valid_pages(idx));

    let mut sources = Vec::new();
    'next_log: for idx in candidates {
        let mut c = cursor;
        for lpo in group.pages_in_log(idx) {
            let lpn = cfg.lpn_of(group.dgn(), lpo);
            match next_clean_offset(cfg, flash, vbn, c, lpn, mlc_fast) {
                Some(offset) => c = offset + 1,
                None => break 'next_log,
            }
        }
        cursor = c;
        sources.push(idx);
    }

    let plan = CompactionPlan { dest, sources };
    (plan.gain() > 0).then_some(plan)
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum MergeKind {
    /// Nothing valid left, hand the block back.
    Retire,
    /// Sequential log at identity offsets for a single block.
    Switch { lbn: Lbn },
    Full { lbns: Vec<Lbn>, needed: u32 },
}

impl<F: Flash, M: MetaStore> Zone<F, M> {
    /// Whether an inactive group has a source/destination pair worth copying.
    pub fn check_inactive_compaction(&self, group: &LogGroup) -> bool {
        let free_head = self.free.peek().map(|(vbn, _)| vbn);
        plan_compaction(&self.cfg, &self.flash, group, free_head, true).is_some()
    }

    /// Copy-compacts an active group. Returns the net number of blocks freed.
    pub(crate) fn compact_group(&mut self, h: GroupHandle, allow_new_log: bool) -> Result<u32> {
        let free_head = self.free.peek().map(|(vbn, _)| vbn);
        let Some(plan) = plan_compaction(&self.cfg, &self.flash, self.active.get(h), free_head, allow_new_log) else {
            return Ok(0);
        };
        let dgn = self.active.get(h).dgn();

        let dest = match plan.dest {
            Destination::Existing(idx) => idx,
            Destination::NewLog => {
                let (vbn, ec) = self.get_free_blk()?;
                let mlc_fast = self.cfg.options.mlc_fast_mode;
                match self.active.get_mut(h).alloc_log(vbn, ec, mlc_fast) {
                    Some(idx) => idx,
                    None => {
                        self.add_free_list(vbn, ec)?;
                        return Ok(0);
                    }
                }
            }
        };

        let mut freed = 0u32;
        for src in &plan.sources {
            for lpo in self.active.get(h).pages_in_log(*src) {
                self.copy_page_to_log(h, lpo, dest)?;
            }
            let (vbn, ec) = self.active.get_mut(h).remove_log(*src);
            self.add_free_list(vbn, ec)?;
            freed += 1;
        }
        self.refresh_group(h);

        let gained = plan.gain() as u32;
        debug!(
            "group {} compacted {} logs into slot {} (net {} blocks)",
            dgn, freed, dest, gained
        );
        Ok(gained)
    }

    fn copy_page_to_log(&mut self, h: GroupHandle, lpo: BaseType, dest: usize) -> Result<()> {
        let lpn = self.cfg.lpn_of(self.active.get(h).dgn(), lpo);
        let Some(src) = self.active.get(h).lookup_vpn(lpo) else {
            return Ok(());
        };
        let Some(dst) = self.get_log_clean_page_number(h, dest, lpn) else {
            debug_assert!(false, "compaction destination ran out of room");
            return Err(FtlError::NoSpace { needed: 1, available: 0 });
        };
        if let Err(e) = self.flash.copyback(src, dst, &Spare { lpn }) {
            let log = self.active.get_mut(h).log_mut(dest);
            log.clean_page_offset = log.clean_page_offset.max(dst % self.cfg.pages_per_block + 1);
            return flash_result(Err(e));
        }
        self.update_pmt(h, dest, lpn, dst);
        self.stats.pages_copied += 1;
        Ok(())
    }

    fn merge_kind(&mut self, h: GroupHandle, log_idx: usize) -> Result<MergeKind> {
        let group = self.active.get(h);
        if group.valid_pages(log_idx) == 0 {
            return Ok(MergeKind::Retire);
        }
        let log = group.log(log_idx);
        let lbns = group.lbns(log_idx).to_vec();

        if log.state.mode == LogMode::Sequential && lbns.len() == 1 {
            let lbn = lbns[0];
            let base = (lbn - self.cfg.first_lbn_of_group(group.dgn())) * self.cfg.pages_per_block;
            let identity = (0..log.clean_page_offset).all(|off| group.lookup(base + off) == Some((log_idx, off)));
            if identity {
                return Ok(MergeKind::Switch { lbn });
            }
        }

        let mut with_data = Vec::new();
        let mut without_data = Vec::new();
        for lbn in lbns {
            if self.bmt_entry(lbn)?.data_vbn.is_some() {
                with_data.push(lbn);
            } else {
                without_data.push(lbn);
            }
        }
        // blocks with an old data block recycle it, so they go first
        let needed = (without_data.len() as u32).max(u32::from(!with_data.is_empty()));
        with_data.extend(without_data);
        Ok(MergeKind::Full { lbns: with_data, needed })
    }

    fn merge_victim_log(&mut self, h: GroupHandle) -> Option<usize> {
        self.refresh_group(h);
        let group = self.active.get(h);
        group.min_valid_page_log().or(group.tail())
    }

    /// Free blocks a merge of the group's cheapest log would consume up front.
    pub(crate) fn merge_requirement(&mut self, h: GroupHandle) -> Result<u32> {
        let Some(victim) = self.merge_victim_log(h) else {
            return Ok(0);
        };
        Ok(match self.merge_kind(h, victim)? {
            MergeKind::Full { needed, .. } => needed,
            MergeKind::Retire | MergeKind::Switch { .. } => 0,
        })
    }

    /// Retires the group's cheapest log by merging it into the BMT.
    ///
    /// Returns false when the free list cannot cover the merge. The handle is
    /// invalid afterwards if the group ran out of logs and was released.
    pub fn compact_log(&mut self, h: GroupHandle) -> Result<bool> {
        let Some(victim) = self.merge_victim_log(h) else {
            return Ok(false);
        };
        let merged = self.merge_log(h, victim)?;
        if merged {
            self.release_if_empty(h);
        }
        Ok(merged)
    }

    pub(crate) fn merge_log(&mut self, h: GroupHandle, log_idx: usize) -> Result<bool> {
        let dgn = self.active.get(h).dgn();
        match self.merge_kind(h, log_idx)? {
            MergeKind::Retire => {
                let (vbn, ec) = self.active.get_mut(h).remove_log(log_idx);
                self.add_free_list(vbn, ec)?;
                debug!("group {} retired empty log on block {}", dgn, vbn);
            }
            MergeKind::Switch { lbn } => self.switch_merge(h, log_idx, lbn)?,
            MergeKind::Full { lbns, needed } => {
                if self.num_free_blocks() < needed {
                    trace!("group {} merge needs {} free blocks, have {}", dgn, needed, self.num_free_blocks());
                    return Ok(false);
                }
                for lbn in &lbns {
                    self.merge_lbn(h, *lbn)?;
                }
                let group = self.active.get_mut(h);
                if !group.log(log_idx).is_free() && group.valid_pages(log_idx) == 0 {
                    let (vbn, ec) = group.remove_log(log_idx);
                    self.add_free_list(vbn, ec)?;
                }
                self.stats.full_merges += 1;
                debug!("group {} full merge of {} blocks", dgn, lbns.len());
            }
        }
        self.retire_empty_logs(h)?;
        self.refresh_group(h);
        Ok(true)
    }

    /// The data block copy of a page, unless the BMT marks it deleted.
    fn data_block_page(&mut self, lbn: Lbn, offset: BaseType) -> Result<Option<Vpn>> {
        let entry = self.bmt_entry(lbn)?;
        let vbn = entry.data_vbn.filter(|_| !entry.is_deleted(offset));
        Ok(vbn.map(|v| self.cfg.vpn_of(v, offset)))
    }

    /// Turns a sequential log into the data block of `lbn`, topping up the
    /// pages it never received.
    fn switch_merge(&mut self, h: GroupHandle, log_idx: usize, lbn: Lbn) -> Result<()> {
        let ppb = self.cfg.pages_per_block;
        let dgn = self.active.get(h).dgn();
        let base = (lbn - self.cfg.first_lbn_of_group(dgn)) * ppb;
        let (vbn, cursor) = {
            let log = self.active.get(h).log(log_idx);
            (log.vbn, log.clean_page_offset)
        };
        self.ensure_bmt(lbn)?;

        let mut present: Vec<bool> = (0..ppb).map(|off| off < cursor).collect();
        for off in cursor..ppb {
            let lpn = lbn * ppb + off;
            let src = match self.active.get(h).lookup_vpn(base + off) {
                Some(vpn) => Some(vpn),
                None => self.data_block_page(lbn, off)?,
            };
            let Some(src) = src else {
                continue;
            };
            if let Err(e) = self.flash.copyback(src, self.cfg.vpn_of(vbn, off), &Spare { lpn }) {
                let log = self.active.get_mut(h).log_mut(log_idx);
                log.clean_page_offset = off + 1;
                log.state.mode = LogMode::Random;
                return flash_result(Err(e));
            }
            present[off as usize] = true;
            self.stats.pages_copied += 1;
        }

        let group = self.active.get_mut(h);
        for off in 0..ppb {
            group.unmap_page(base + off);
        }
        group.forget_lbn(lbn);
        let (vbn, ec) = group.remove_log(log_idx);

        let entry = self.bmt_entry_mut(lbn)?;
        let old = entry.take();
        entry.assign(vbn, ec);
        for (off, _) in present.iter().enumerate().filter(|(_, p)| **p) {
            entry.mark_present(off as BaseType);
        }
        if let Some((old_vbn, old_ec)) = old {
            self.add_free_list(old_vbn, old_ec)?;
        }

        if cursor < ppb {
            self.stats.partial_merges += 1;
        } else {
            self.stats.switch_merges += 1;
        }
        debug!("group {} switched log block {} in for lbn {} (copied from {})", dgn, vbn, lbn, cursor);
        Ok(())
    }

    /// Assembles a new data block for `lbn` from the newest copy of each page.
    fn merge_lbn(&mut self, h: GroupHandle, lbn: Lbn) -> Result<()> {
        let ppb = self.cfg.pages_per_block;
        self.ensure_bmt(lbn)?;
        let (new_vbn, new_ec) = self.get_free_blk()?;

        let mut present = vec![false; ppb as usize];
        for off in 0..ppb {
            let lpn = lbn * ppb + off;
            let lpo = self.cfg.lpo_of(lpn);
            let src = match self.active.get(h).lookup_vpn(lpo) {
                Some(vpn) => Some(vpn),
                None => self.data_block_page(lbn, off)?,
            };
            let Some(src) = src else {
                continue;
            };
            if let Err(e) = self.flash.copyback(src, self.cfg.vpn_of(new_vbn, off), &Spare { lpn }) {
                // untouched mapping; the half-written block gets erased on reuse
                self.add_free_list(new_vbn, new_ec)?;
                return flash_result(Err(e));
            }
            present[off as usize] = true;
            self.stats.pages_copied += 1;
        }

        let group = self.active.get_mut(h);
        for off in 0..ppb {
            group.unmap_page(self.cfg.lpo_of(lbn * ppb + off));
        }
        group.forget_lbn(lbn);

        let entry = self.bmt_entry_mut(lbn)?;
        let old = entry.take();
        entry.assign(new_vbn, new_ec);
        for (off, _) in present.iter().enumerate().filter(|(_, p)| **p) {
            entry.mark_present(off as BaseType);
        }
        if let Some((old_vbn, old_ec)) = old {
            self.add_free_list(old_vbn, old_ec)?;
        }
        trace!("lbn {} merged into block {}", lbn, new_vbn);
        Ok(())
    }

    /// Hands back every written log that no longer maps a valid page.
    pub(crate) fn retire_empty_logs(&mut self, h: GroupHandle) -> Result<u32> {
        let group = self.active.get(h);
        let empty: Vec<usize> = group
            .logs_oldest_first()
            .into_iter()
            .filter(|&idx| group.valid_pages(idx) == 0 && group.log(idx).clean_page_offset > 0)
            .collect();
        for &idx in &empty {
            let (vbn, ec) = self.active.get_mut(h).remove_log(idx);
            self.add_free_list(vbn, ec)?;
        }
        Ok(empty.len() as u32)
    }
}
