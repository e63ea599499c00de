#[macro_use]
extern crate log;

pub mod bmt;
pub mod compaction;
pub mod config;
pub mod error;
pub mod flash;
pub mod free_blk;
pub mod free_list;
pub mod ftl;
pub mod group_list;
pub mod log_block;
pub mod log_group;
pub mod mapping;
pub mod meta;
pub mod pmt_dir;
pub mod zone;

pub use config::{ZoneConfig, ZoneOptions};
pub use error::{FlashError, FtlError, MetaError, Result};
pub use flash::{Flash, MemFlash};
pub use ftl::Ftl;
pub use meta::{MemMetaStore, MetaStore};
pub use zone::{ReclaimStats, Zone};
