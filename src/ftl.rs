use byte_unit::Byte;

use crate::config::*;
use crate::error::{FtlError, Result};
use crate::flash::{Flash, MemFlash};
use crate::meta::{MemMetaStore, MetaStore};
use crate::zone::Zone;

/// Host-facing front end of one zone.
///
/// Keeps the free list above the zone's threshold before every write, the
/// way a request layer would.
pub struct Ftl<F: Flash, M: MetaStore> {
    zone: Zone<F, M>,
    host_writes: u64,
}

impl Ftl<MemFlash, MemMetaStore> {
    pub fn new_with_op(op: f64) -> Result<Self> {
        let cfg = ZoneConfig::with_op(DEFAULT_PHYSICAL_BLOCKS, op);
        let page_bytes = cfg.page_size;
        let physical = cfg.num_physical_blocks as usize * cfg.pages_per_block as usize * page_bytes;
        let user = cfg.num_logical_pages() as usize * page_bytes;

        trace!("physical blocks: {}, logical blocks: {}", cfg.num_physical_blocks, cfg.num_logical_blocks);
        trace!("Physical Capacity: {} bytes, {}", physical, Byte::from(physical).get_appropriate_unit(true).to_string());
        trace!("User Capacity: {} bytes, {}", user, Byte::from(user).get_appropriate_unit(true).to_string());

        Ftl::with_config(cfg)
    }

    pub fn with_config(cfg: ZoneConfig) -> Result<Self> {
        let flash = MemFlash::new(cfg.num_physical_blocks, cfg.pages_per_block, cfg.num_ways, cfg.page_size);
        let meta = MemMetaStore::new(cfg.num_logical_blocks, cfg.blocks_per_local_area, cfg.pages_per_block);
        Ok(Ftl::new(Zone::format(cfg, flash, meta)?))
    }

    /// Flash programs and copybacks per host page written.
    pub fn write_amplification(&self) -> f64 {
        if self.host_writes == 0 {
            return 0.;
        }
        let c = self.zone.flash().counters();
        (c.programs + c.copybacks) as f64 / self.host_writes as f64
    }

    /// Lowest and highest erase count over every physical block.
    pub fn erase_count_spread(&self) -> (EraseCount, EraseCount) {
        let flash = self.zone.flash();
        let counts = (0..self.zone.config().num_physical_blocks).map(|vbn| flash.erase_count(vbn));
        counts.fold((EraseCount::MAX, 0), |(lo, hi), ec| (lo.min(ec), hi.max(ec)))
    }
}

impl<F: Flash, M: MetaStore> Ftl<F, M> {
    pub fn new(zone: Zone<F, M>) -> Self {
        Ftl { zone, host_writes: 0 }
    }

    pub fn zone(&self) -> &Zone<F, M> {
        &self.zone
    }

    pub fn zone_mut(&mut self) -> &mut Zone<F, M> {
        &mut self.zone
    }

    pub fn host_writes(&self) -> u64 {
        self.host_writes
    }

    pub fn get_max_lba(&self) -> Lpn {
        self.zone.config().num_logical_pages().saturating_sub(1)
    }

    fn check_lba(&self, lpn: Lpn) -> Result<()> {
        if lpn >= self.zone.config().num_logical_pages() {
            return Err(FtlError::LpnOutOfRange { lpn });
        }
        Ok(())
    }

    pub fn write(&mut self, lpn: Lpn, data: &[u8]) -> Result<Vpn> {
        self.check_lba(lpn)?;
        let threshold = self.zone.config().free_block_threshold;
        if self.zone.num_free_blocks() < threshold {
            let dgn = self.zone.config().dgn_of(lpn);
            // a short reservation is fine while the target log still has room
            self.zone.reserve_free_blocks(dgn, threshold)?;
        }
        let vpn = self.zone.write_page(lpn, data)?;
        self.host_writes += 1;
        Ok(vpn)
    }

    /// Returns false for pages that were never written or got deleted.
    pub fn read(&mut self, lpn: Lpn, buf: &mut [u8]) -> Result<bool> {
        self.check_lba(lpn)?;
        self.zone.read_page(lpn, buf)
    }

    pub fn delete(&mut self, lpn: Lpn) -> Result<()> {
        self.check_lba(lpn)?;
        self.zone.delete_page(lpn)
    }

    /// Idle-time reclamation: tops the free list up to twice the write
    /// threshold, wear leveling along the way.
    pub fn background_reserve(&mut self) -> Result<u32> {
        let target = self.zone.config().free_block_threshold * 2;
        let dgn = self.zone.active_dgns().last().copied().unwrap_or(0);
        self.zone.reserve_young_free_blocks(dgn, target)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.zone.flush()
    }
}
