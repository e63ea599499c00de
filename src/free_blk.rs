//! Free block manager: the free list front end and the reclamation cascade.
//!
//! [`Zone::reserve_free_blocks`] walks five steps from cheapest to most
//! expensive and stops at the first one that brings the free list up to the
//! target:
//!
//! 1. retire logs whose pages were all overwritten or deleted
//! 2. copy-compact inactive groups
//! 3. copy-compact active groups, cold groups first when wear leveling
//! 4. merge a log of the cheapest inactive group
//! 5. merge logs of active groups, LRU first
//!
//! Every productive step retires at least one log, so the loop always ends.

use crate::config::{Dgn, EraseCount, Vbn};
use crate::error::{FtlError, Result};
use crate::flash::Flash;
use crate::meta::MetaStore;
use crate::zone::{flash_result, Zone};

impl<F: Flash, M: MetaStore> Zone<F, M> {
    pub fn add_free_list(&mut self, vbn: Vbn, erase_count: EraseCount) -> Result<()> {
        self.free.add(vbn, erase_count)?;
        trace!("block {} (ec {}) -> free list, {} free", vbn, erase_count, self.free.len());
        Ok(())
    }

    /// Pops and erases the free list head.
    ///
    /// A block whose erase fails is not returned to the list.
    pub fn get_free_blk(&mut self) -> Result<(Vbn, EraseCount)> {
        let (vbn, erase_count) = self.free.pop().ok_or(FtlError::NoSpace { needed: 1, available: 0 })?;
        if let Err(e) = self.flash.erase(vbn) {
            warn!("erase of free block {} failed, block dropped: {}", vbn, e);
            return flash_result(Err(e));
        }
        Ok((vbn, erase_count.saturating_add(1)))
    }

    pub fn check_free_list_full(&self) -> bool {
        self.free.is_full()
    }

    fn short_of(&self, target: u32) -> bool {
        self.num_free_blocks() < target
    }

    /// Reclaims until `target` blocks are free or nothing is left to reclaim.
    ///
    /// Returns the number of free blocks afterwards, which may fall short of
    /// `target`. `dgn` is the group the caller is writing to; inactive steps
    /// leave it alone.
    pub fn reserve_free_blocks(&mut self, dgn: Dgn, target: u32) -> Result<u32> {
        if self.cfg.num_logical_blocks == 0 {
            error!("zone has no logical blocks, reservation cannot progress");
            return Err(FtlError::StructuralExhaustion);
        }
        if !self.short_of(target) {
            return Ok(self.num_free_blocks());
        }

        self.stats.reservations += 1;
        let start = self.num_free_blocks();
        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut worked = 0;
            if self.cfg.options.gc_deleted_pages {
                worked += self.gc_deleted_pages()?;
            }
            if self.short_of(target) {
                worked += self.compact_inactive_groups(dgn, target)?;
            }
            if self.short_of(target) {
                worked += self.compact_active_groups(target)?;
            }
            if self.short_of(target) {
                worked += self.merge_inactive_groups(dgn, target)?;
            }
            if self.short_of(target) {
                worked += self.merge_active_groups(target)?;
            }
            if !self.short_of(target) || worked == 0 {
                break;
            }
        }

        let free = self.num_free_blocks();
        if free < target {
            self.stats.stalled_reservations += 1;
            warn!(
                "reservation for group {} stalled at {} of {} free blocks after {} rounds",
                dgn, free, target, rounds
            );
        } else {
            info!("reserved {} free blocks for group {} ({} -> {}, {} rounds)", target, dgn, start, free, rounds);
        }
        Ok(free)
    }

    /// Grows the reservation one block at a time with a wear-leveling step
    /// before each increment.
    pub fn reserve_young_free_blocks(&mut self, dgn: Dgn, target: u32) -> Result<u32> {
        let mut step = self.num_free_blocks();
        while step < target {
            step += 1;
            self.wear_level(dgn)?;
            if self.reserve_free_blocks(dgn, step)? < step {
                break;
            }
        }
        Ok(self.num_free_blocks())
    }

    /// Step 1: hands back written logs of active groups that map no valid page.
    fn gc_deleted_pages(&mut self) -> Result<u32> {
        let mut retired = 0;
        for dgn in self.active.dgns() {
            let Some(h) = self.active.find(dgn) else {
                continue;
            };
            let n = self.retire_empty_logs(h)?;
            if n > 0 {
                self.refresh_group(h);
                self.release_if_empty(h);
                retired += n;
            }
        }
        if retired > 0 {
            debug!("deleted-page gc retired {} logs", retired);
            self.stats.gc_retired_logs += u64::from(retired);
        }
        Ok(retired)
    }

    /// Step 2: promotes inactive victims that have a compaction plan and
    /// compacts them.
    fn compact_inactive_groups(&mut self, dgn: Dgn, target: u32) -> Result<u32> {
        let mut tried = vec![dgn];
        let mut freed = 0;
        while self.short_of(target) {
            let Some(victim) = self.search_merge_victim_group(&tried) else {
                break;
            };
            tried.push(victim);
            let snapshot = self.inactive_snapshot(victim)?;
            if !self.check_inactive_compaction(&snapshot) {
                continue;
            }

            let h = self.activate_group(victim)?;
            let gained = self.compact_group(h, true)?;
            self.demote_group(victim)?;
            if gained > 0 {
                debug!("inactive group {} compacted, {} blocks freed", victim, gained);
                self.stats.inactive_compactions += 1;
                freed += gained;
            }
        }
        Ok(freed)
    }

    /// Step 3: compacts active groups with more than one log.
    ///
    /// Groups about to run out of write room go first, then the ones with
    /// fewer valid pages. With wear leveling on, a first pass skips groups
    /// holding a log much hotter than the zone minimum.
    fn compact_active_groups(&mut self, target: u32) -> Result<u32> {
        let ppb = self.cfg.pages_per_block;
        let mut ranked: Vec<(bool, u32, Dgn)> = self
            .active
            .iter_lru()
            .map(|h| self.active.get(h))
            .filter(|g| g.num_logs() > 1)
            .map(|g| {
                let almost_full = g.is_full() || g.head().map_or(true, |i| g.log(i).remaining_pages(ppb) == 0);
                (!almost_full, g.total_valid_pages(), g.dgn())
            })
            .collect();
        ranked.sort();

        let passes: &[bool] = if self.cfg.options.wear_leveling { &[true, false] } else { &[false] };
        let mut freed = 0;
        for &ec_aware in passes {
            for &(_, _, dgn) in &ranked {
                if !self.short_of(target) {
                    return Ok(freed);
                }
                let Some(h) = self.active.find(dgn) else {
                    continue;
                };
                if ec_aware && self.too_hot(self.active.get(h).max_log_erase_count()) {
                    trace!("group {} skipped by the erase-count aware pass", dgn);
                    continue;
                }
                let gained = self.compact_group(h, true)?;
                if gained > 0 {
                    self.stats.active_compactions += 1;
                    freed += gained;
                }
            }
        }
        Ok(freed)
    }

    fn too_hot(&self, max_ec: Option<EraseCount>) -> bool {
        match (max_ec, self.global_min_erase_count()) {
            (Some(max), Some(min)) => max > min.saturating_add(self.cfg.wear_level_threshold),
            _ => false,
        }
    }

    /// Step 4: merges a log of the cheapest inactive groups.
    fn merge_inactive_groups(&mut self, dgn: Dgn, target: u32) -> Result<u32> {
        let mut tried = vec![dgn];
        let mut merged = 0;
        while self.short_of(target) {
            let Some(victim) = self.search_merge_victim_group(&tried) else {
                break;
            };
            tried.push(victim);
            let snapshot = self.inactive_snapshot(victim)?;
            if !self.check_merge_victim(&snapshot)? {
                continue;
            }

            let h = self.activate_group(victim)?;
            let done = self.compact_log(h)?;
            self.demote_group(victim)?;
            if done {
                debug!("inactive group {} merged a log", victim);
                self.stats.inactive_merges += 1;
                merged += 1;
            }
        }
        Ok(merged)
    }

    /// Step 5: merges one log of every active group with more than one log,
    /// LRU first.
    fn merge_active_groups(&mut self, target: u32) -> Result<u32> {
        let mut merged = 0;
        for dgn in self.active.dgns() {
            if !self.short_of(target) {
                break;
            }
            let Some(h) = self.active.find(dgn) else {
                continue;
            };
            if self.active.get(h).num_logs() <= 1 {
                continue;
            }
            if self.compact_log(h)? {
                self.stats.active_merges += 1;
                merged += 1;
            }
        }
        Ok(merged)
    }

    /// Moves the coldest tracked log out of its group when the free list
    /// head has aged past it by more than the wear-level threshold.
    pub fn wear_level(&mut self, dgn: Dgn) -> Result<bool> {
        if !self.cfg.options.wear_leveling {
            return Ok(false);
        }
        let (Some((_, head_ec)), Some((min_ec, vbn, owner))) = (self.free.peek(), self.dir.global_min()) else {
            return Ok(false);
        };
        if head_ec <= min_ec.saturating_add(self.cfg.wear_level_threshold) {
            return Ok(false);
        }

        let h = self.activate_group(owner)?;
        let Some(idx) = self.active.get(h).find_log(vbn) else {
            return Ok(false);
        };
        if !self.merge_log(h, idx)? {
            return Ok(false);
        }
        self.release_if_empty(h);
        self.stats.wear_level_moves += 1;
        info!(
            "wear leveling moved block {} (ec {}) out of group {}, free head ec {} (writer {})",
            vbn, min_ec, owner, head_ec, dgn
        );
        Ok(true)
    }
}
