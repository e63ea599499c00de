use num_integer::Integer;

use crate::error::{FtlError, Result};

pub type BaseType = u32;

pub type Lpn = BaseType;
pub type Vpn = BaseType;
pub type Vbn = BaseType;
pub type Lbn = BaseType;
pub type Dgn = BaseType;
pub type EraseCount = BaseType;
pub type MetaOffset = BaseType;

/// Page-map entry that resolves through the BMT instead of a log.
pub const NULL_OFFSET: BaseType = BaseType::MAX;

pub const DEFAULT_PAGES_PER_BLOCK: BaseType = 64;
pub const DEFAULT_WAYS: BaseType = 4;
pub const DEFAULT_BLKS_PER_GROUP: BaseType = 2;
pub const DEFAULT_LOGS_PER_GROUP: BaseType = 4;
pub const DEFAULT_BLKS_PER_LOCAL_AREA: BaseType = 64;
pub const DEFAULT_PAGE_SIZE: usize = 512;
pub const DEFAULT_PHYSICAL_BLOCKS: BaseType = 1024;

pub const ACTIVE_LOG_GRP_POOL_SIZE: usize = 8;
pub const INACTIVE_LOG_GRP_POOL_SIZE: usize = 16;
pub const DEFAULT_PMT_EC_GRP_SIZE: BaseType = 8;
pub const MAX_ACTIVE_LBLKS: usize = ACTIVE_LOG_GRP_POOL_SIZE;

pub const DEFAULT_WEAR_LEVEL_THRESHOLD: EraseCount = 32;
pub const DEFAULT_FREE_BLOCK_THRESHOLD: BaseType = 4;

/// Runtime switches for behaviour that firmware builds usually pick at compile time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoneOptions {
    pub wear_leveling: bool,
    pub mlc_fast_mode: bool,
    pub sorted_free_list: bool,
    pub gc_deleted_pages: bool,
}

impl Default for ZoneOptions {
    fn default() -> Self {
        ZoneOptions {
            wear_leveling: true,
            mlc_fast_mode: false,
            sorted_free_list: false,
            gc_deleted_pages: true,
        }
    }
}

/// Geometry and policy of one zone.
///
/// `blocks_per_group` is the N of an N:K log group and `logs_per_group` the K.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneConfig {
    pub pages_per_block: BaseType,
    pub num_ways: BaseType,
    pub blocks_per_group: BaseType,
    pub logs_per_group: BaseType,
    pub num_logical_blocks: BaseType,
    pub num_physical_blocks: BaseType,
    pub blocks_per_local_area: BaseType,
    pub page_size: usize,

    pub active_pool_size: usize,
    pub inactive_pool_size: usize,
    pub max_free_slots: usize,

    pub ec_group_size: BaseType,
    pub wear_level_threshold: EraseCount,
    pub free_block_threshold: BaseType,

    pub options: ZoneOptions,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        ZoneConfig::with_op(DEFAULT_PHYSICAL_BLOCKS, 7.0)
    }
}

impl ZoneConfig {
    /// Derives the logical size from an over-provisioning percentage.
    ///
    /// The logical block count is rounded down to whole local areas so that no
    /// data group straddles a BMT window.
    pub fn with_op(num_physical_blocks: BaseType, op: f64) -> Self {
        let op_blocks = (num_physical_blocks as f64 * (op / 100.)).ceil() as BaseType;
        let usable = num_physical_blocks.saturating_sub(op_blocks.max(1));
        let area = DEFAULT_BLKS_PER_LOCAL_AREA.min(usable.max(DEFAULT_BLKS_PER_GROUP));
        let area = area - area % DEFAULT_BLKS_PER_GROUP;
        let num_logical_blocks = if area == 0 { 0 } else { usable - usable % area };

        ZoneConfig {
            pages_per_block: DEFAULT_PAGES_PER_BLOCK,
            num_ways: DEFAULT_WAYS,
            blocks_per_group: DEFAULT_BLKS_PER_GROUP,
            logs_per_group: DEFAULT_LOGS_PER_GROUP,
            num_logical_blocks,
            num_physical_blocks,
            blocks_per_local_area: area,
            page_size: DEFAULT_PAGE_SIZE,
            active_pool_size: ACTIVE_LOG_GRP_POOL_SIZE,
            inactive_pool_size: INACTIVE_LOG_GRP_POOL_SIZE,
            max_free_slots: num_physical_blocks as usize,
            ec_group_size: DEFAULT_PMT_EC_GRP_SIZE,
            wear_level_threshold: DEFAULT_WEAR_LEVEL_THRESHOLD,
            free_block_threshold: DEFAULT_FREE_BLOCK_THRESHOLD,
            options: ZoneOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(FtlError::InvalidConfig(reason.to_string()));

        if !self.pages_per_block.is_power_of_two() {
            return invalid("pages_per_block must be a power of two");
        }
        if self.num_ways == 0 || !Integer::is_multiple_of(&self.pages_per_block, &self.num_ways) {
            return invalid("pages_per_block must be a multiple of num_ways");
        }
        if !self.blocks_per_group.is_power_of_two() {
            return invalid("blocks_per_group must be a power of two");
        }
        if self.logs_per_group == 0 {
            return invalid("logs_per_group must be non-zero");
        }
        if !Integer::is_multiple_of(&self.num_logical_blocks, &self.blocks_per_group) {
            return invalid("num_logical_blocks must be a multiple of blocks_per_group");
        }
        if self.blocks_per_local_area == 0
            || !Integer::is_multiple_of(&self.blocks_per_local_area, &self.blocks_per_group)
        {
            return invalid("a local area must hold whole data groups");
        }
        if self.num_physical_blocks <= self.num_logical_blocks {
            return invalid("num_physical_blocks must exceed num_logical_blocks");
        }
        // merge headroom plus room for at least one log
        if self.num_physical_blocks - self.num_logical_blocks <= self.blocks_per_group {
            return invalid("spare blocks must exceed blocks_per_group");
        }
        if self.max_free_slots < self.num_physical_blocks as usize {
            return invalid("max_free_slots must cover every physical block");
        }
        if self.active_pool_size == 0 || self.inactive_pool_size == 0 {
            return invalid("log group pools must be non-empty");
        }
        if self.ec_group_size == 0 {
            return invalid("ec_group_size must be non-zero");
        }
        if self.page_size == 0 {
            return invalid("page_size must be non-zero");
        }
        Ok(())
    }

    pub fn block_shift(&self) -> u32 {
        self.pages_per_block.trailing_zeros()
    }

    pub fn group_shift(&self) -> u32 {
        self.block_shift() + self.blocks_per_group.trailing_zeros()
    }

    pub fn pages_per_group(&self) -> BaseType {
        self.pages_per_block * self.blocks_per_group
    }

    pub fn num_groups(&self) -> BaseType {
        self.num_logical_blocks / self.blocks_per_group
    }

    pub fn num_logical_pages(&self) -> BaseType {
        self.num_logical_blocks * self.pages_per_block
    }

    pub fn logs_per_group(&self) -> usize {
        self.logs_per_group as usize
    }

    pub fn dgn_of(&self, lpn: Lpn) -> Dgn {
        lpn >> self.group_shift()
    }

    /// Logical page offset inside the data group.
    pub fn lpo_of(&self, lpn: Lpn) -> BaseType {
        lpn & (self.pages_per_group() - 1)
    }

    pub fn lbn_of(&self, lpn: Lpn) -> Lbn {
        lpn >> self.block_shift()
    }

    /// Page offset inside the logical block.
    pub fn page_offset_of(&self, lpn: Lpn) -> BaseType {
        lpn & (self.pages_per_block - 1)
    }

    pub fn first_lbn_of_group(&self, dgn: Dgn) -> Lbn {
        dgn * self.blocks_per_group
    }

    pub fn lpn_of(&self, dgn: Dgn, lpo: BaseType) -> Lpn {
        (dgn << self.group_shift()) | lpo
    }

    pub fn local_area_of(&self, lbn: Lbn) -> BaseType {
        lbn / self.blocks_per_local_area
    }

    pub fn vpn_of(&self, vbn: Vbn, offset: BaseType) -> Vpn {
        vbn * self.pages_per_block + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ZoneConfig {
        ZoneConfig {
            pages_per_block: 8,
            num_ways: 2,
            blocks_per_group: 2,
            num_logical_blocks: 16,
            num_physical_blocks: 32,
            blocks_per_local_area: 8,
            max_free_slots: 32,
            ..ZoneConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = ZoneConfig::default();
        cfg.validate().unwrap();
        assert!(cfg.num_logical_blocks < cfg.num_physical_blocks);
        assert_eq!(cfg.num_logical_blocks % cfg.blocks_per_local_area, 0);
    }

    #[test]
    fn address_split() {
        let cfg = small();
        cfg.validate().unwrap();
        // 8 pages per block, 2 blocks per group -> 16 pages per group
        let lpn = 3 * 16 + 8 + 5;
        assert_eq!(cfg.dgn_of(lpn), 3);
        assert_eq!(cfg.lpo_of(lpn), 13);
        assert_eq!(cfg.lbn_of(lpn), 7);
        assert_eq!(cfg.page_offset_of(lpn), 5);
        assert_eq!(cfg.lpn_of(3, 13), lpn);
        assert_eq!(cfg.first_lbn_of_group(3), 6);
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut cfg = small();
        cfg.num_ways = 3;
        assert!(cfg.validate().is_err());

        let mut cfg = small();
        cfg.blocks_per_local_area = 3;
        assert!(cfg.validate().is_err());

        let mut cfg = small();
        cfg.num_physical_blocks = 16;
        assert!(cfg.validate().is_err());

        let mut cfg = small();
        cfg.max_free_slots = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn spare_must_cover_a_data_group() {
        let mut cfg = small();
        cfg.num_physical_blocks = 18;
        assert!(cfg.validate().is_err());
        cfg.num_physical_blocks = 19;
        cfg.validate().unwrap();
    }
}
