//! Error types for the mapping core and its collaborators.
//!
//! Flash failures are carried verbatim from the flash layer. Metadata failures
//! come from the metadata store. Everything the zone itself can detect lives in
//! [`FtlError`].

use thiserror::Error;

use crate::config::{Dgn, Lpn, MetaOffset, Vbn, Vpn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("read of page {vpn} failed")]
    ReadFailed { vpn: Vpn },

    #[error("program of page {vpn} failed")]
    ProgramFailed { vpn: Vpn },

    #[error("erase of block {vbn} failed")]
    EraseFailed { vbn: Vbn },

    #[error("copyback {src} -> {dst} failed")]
    CopybackFailed { src: Vpn, dst: Vpn },

    #[error("volume not opened")]
    VolumeNotOpened,

    #[error("invalid flash parameter: {0}")]
    InvalidParameter(String),
}

impl FlashError {
    /// Codes that can only come from broken internal state, never from the media.
    pub fn is_logic_error(&self) -> bool {
        matches!(self, FlashError::VolumeNotOpened | FlashError::InvalidParameter(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetaError {
    #[error("no PMT stored for group {dgn} at offset {offset}")]
    PmtNotFound { dgn: Dgn, offset: MetaOffset },

    #[error("BMT local area {area} out of range")]
    BmtAreaOutOfRange { area: u32 },

    #[error("corrupt metadata: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FtlError {
    #[error("flash error: {0}")]
    Flash(#[from] FlashError),

    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),

    #[error("invalid zone configuration: {0}")]
    InvalidConfig(String),

    #[error("logical page {lpn} is outside the zone")]
    LpnOutOfRange { lpn: Lpn },

    /// Reclamation could not reach the number of free blocks the caller needs.
    #[error("no space: needed {needed} free blocks, {available} available")]
    NoSpace { needed: u32, available: u32 },

    /// The zone has no logical blocks left to reclaim from.
    #[error("structural exhaustion: zone cannot make progress")]
    StructuralExhaustion,

    #[error("write slot at vpn {vpn} no longer belongs to an active group")]
    StaleWriteSlot { vpn: Vpn },

    #[error("free block list is full")]
    FreeListFull,

    #[error("block {vbn} is already on the free list")]
    DuplicateFreeBlock { vbn: Vbn },
}

pub type Result<T, E = FtlError> = std::result::Result<T, E>;
