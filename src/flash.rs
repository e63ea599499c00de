//! Flash-access collaborator.
//!
//! The mapping core only ever talks to NAND through [`Flash`]. [`MemFlash`] is
//! an in-memory NAND model that enforces erase-before-program, which the tests
//! and the workload driver run against.

use std::collections::HashSet;

use crate::config::{BaseType, EraseCount, Lpn, Vbn, Vpn};
use crate::error::FlashError;

/// Spare-area record written alongside every page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Spare {
    pub lpn: Lpn,
}

pub trait Flash {
    /// Reads the sectors selected by `sector_bitmap` into `buf`.
    fn read_page(&mut self, vpn: Vpn, sector_bitmap: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    fn program_page(&mut self, vpn: Vpn, data: &[u8], spare: &Spare) -> Result<(), FlashError>;

    fn erase(&mut self, vbn: Vbn) -> Result<(), FlashError>;

    /// Moves a page inside the chip, rewriting its spare area on the way.
    fn copyback(&mut self, src: Vpn, dst: Vpn, spare: &Spare) -> Result<(), FlashError>;

    /// MLC pages on the fast (LSB) half of a word line.
    fn is_lsb_page(&self, vpn: Vpn) -> bool;
}

/// Every sector of a page.
pub const FULL_PAGE: u32 = u32::MAX;

#[derive(Clone)]
struct MemPage {
    data: Vec<u8>,
    spare: Spare,
}

#[derive(Clone, Default)]
struct MemBlock {
    pages: Vec<Option<MemPage>>,
    erase_count: EraseCount,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlashCounters {
    pub reads: u64,
    pub programs: u64,
    pub erases: u64,
    pub copybacks: u64,
}

pub struct MemFlash {
    blocks: Vec<MemBlock>,
    pages_per_block: BaseType,
    num_ways: BaseType,
    page_size: usize,
    sector_size: usize,

    counters: FlashCounters,
    fail_erase: HashSet<Vbn>,
    fail_program: HashSet<Vbn>,
}

impl MemFlash {
    pub fn new(num_blocks: BaseType, pages_per_block: BaseType, num_ways: BaseType, page_size: usize) -> Self {
        let block = MemBlock {
            pages: vec![None; pages_per_block as usize],
            erase_count: 0,
        };
        MemFlash {
            blocks: vec![block; num_blocks as usize],
            pages_per_block,
            num_ways,
            page_size,
            sector_size: (page_size / 8).max(1),
            counters: FlashCounters::default(),
            fail_erase: HashSet::new(),
            fail_program: HashSet::new(),
        }
    }

    pub fn counters(&self) -> FlashCounters {
        self.counters
    }

    pub fn erase_count(&self, vbn: Vbn) -> EraseCount {
        self.blocks.get(vbn as usize).map_or(0, |b| b.erase_count)
    }

    /// Makes every later erase of `vbn` fail.
    pub fn inject_erase_failure(&mut self, vbn: Vbn) {
        self.fail_erase.insert(vbn);
    }

    /// Makes every later program into `vbn` fail.
    pub fn inject_program_failure(&mut self, vbn: Vbn) {
        self.fail_program.insert(vbn);
    }

    pub fn clear_failures(&mut self) {
        self.fail_erase.clear();
        self.fail_program.clear();
    }

    pub fn spare(&self, vpn: Vpn) -> Option<Spare> {
        let (vbn, offset) = self.split(vpn).ok()?;
        self.blocks[vbn].pages[offset].as_ref().map(|p| p.spare)
    }

    pub fn is_programmed(&self, vpn: Vpn) -> bool {
        self.spare(vpn).is_some()
    }

    fn split(&self, vpn: Vpn) -> Result<(usize, usize), FlashError> {
        let vbn = (vpn / self.pages_per_block) as usize;
        let offset = (vpn % self.pages_per_block) as usize;
        if vbn >= self.blocks.len() {
            return Err(FlashError::InvalidParameter(format!("vpn {vpn} beyond device")));
        }
        Ok((vbn, offset))
    }
}

impl Flash for MemFlash {
    fn read_page(&mut self, vpn: Vpn, sector_bitmap: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let (vbn, offset) = self.split(vpn)?;
        self.counters.reads += 1;

        let page = &self.blocks[vbn].pages[offset];
        for (sector, chunk) in buf.chunks_mut(self.sector_size).enumerate() {
            if sector < 32 && sector_bitmap & (1 << sector) == 0 {
                continue;
            }
            let start = sector * self.sector_size;
            match page {
                Some(p) => {
                    let end = (start + chunk.len()).min(p.data.len());
                    let src = p.data.get(start..end).unwrap_or(&[]);
                    chunk[..src.len()].copy_from_slice(src);
                    chunk[src.len()..].fill(0xff);
                }
                None => chunk.fill(0xff),
            }
        }
        Ok(())
    }

    fn program_page(&mut self, vpn: Vpn, data: &[u8], spare: &Spare) -> Result<(), FlashError> {
        let (vbn, offset) = self.split(vpn)?;
        if data.len() > self.page_size {
            return Err(FlashError::InvalidParameter(format!("{} bytes exceed page size", data.len())));
        }
        if self.fail_program.contains(&(vbn as Vbn)) {
            return Err(FlashError::ProgramFailed { vpn });
        }
        let page = &mut self.blocks[vbn].pages[offset];
        if page.is_some() {
            // NAND cannot overwrite without an erase.
            return Err(FlashError::ProgramFailed { vpn });
        }
        *page = Some(MemPage {
            data: data.to_vec(),
            spare: *spare,
        });
        self.counters.programs += 1;
        Ok(())
    }

    fn erase(&mut self, vbn: Vbn) -> Result<(), FlashError> {
        if vbn as usize >= self.blocks.len() {
            return Err(FlashError::InvalidParameter(format!("vbn {vbn} beyond device")));
        }
        if self.fail_erase.contains(&vbn) {
            return Err(FlashError::EraseFailed { vbn });
        }
        let block = &mut self.blocks[vbn as usize];
        block.pages.iter_mut().for_each(|p| *p = None);
        block.erase_count = block.erase_count.saturating_add(1);
        self.counters.erases += 1;
        Ok(())
    }

    fn copyback(&mut self, src: Vpn, dst: Vpn, spare: &Spare) -> Result<(), FlashError> {
        let (sb, so) = self.split(src)?;
        let (db, doff) = self.split(dst)?;
        let data = match &self.blocks[sb].pages[so] {
            Some(p) => p.data.clone(),
            None => return Err(FlashError::CopybackFailed { src, dst }),
        };
        if self.fail_program.contains(&(db as Vbn)) || self.blocks[db].pages[doff].is_some() {
            return Err(FlashError::CopybackFailed { src, dst });
        }
        self.blocks[db].pages[doff] = Some(MemPage { data, spare: *spare });
        self.counters.copybacks += 1;
        Ok(())
    }

    fn is_lsb_page(&self, vpn: Vpn) -> bool {
        // word lines alternate LSB and MSB one way-row at a time
        let offset = vpn % self.pages_per_block;
        (offset / self.num_ways) % 2 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_requires_erase() {
        let mut flash = MemFlash::new(4, 8, 2, 16);
        let spare = Spare { lpn: 3 };
        flash.program_page(9, b"hello", &spare).unwrap();
        assert_eq!(flash.program_page(9, b"again", &spare), Err(FlashError::ProgramFailed { vpn: 9 }));

        flash.erase(1).unwrap();
        flash.program_page(9, b"again", &spare).unwrap();
        assert_eq!(flash.erase_count(1), 1);
    }

    #[test]
    fn read_back_and_copyback() {
        let mut flash = MemFlash::new(4, 8, 2, 16);
        flash.program_page(0, b"abcd", &Spare { lpn: 7 }).unwrap();
        flash.copyback(0, 17, &Spare { lpn: 7 }).unwrap();

        let mut buf = [0u8; 16];
        flash.read_page(17, FULL_PAGE, &mut buf).unwrap();
        assert_eq!(&buf[..4], b"abcd");
        assert!(buf[4..].iter().all(|b| *b == 0xff));
        assert_eq!(flash.spare(17), Some(Spare { lpn: 7 }));

        assert!(flash.copyback(1, 18, &Spare { lpn: 8 }).is_err());
    }

    #[test]
    fn lsb_rows_alternate_per_way_row() {
        let flash = MemFlash::new(1, 16, 4, 16);
        let lsb: Vec<bool> = (0..16).map(|o| flash.is_lsb_page(o)).collect();
        assert!(lsb[0..4].iter().all(|b| *b));
        assert!(lsb[4..8].iter().all(|b| !*b));
        assert!(lsb[8..12].iter().all(|b| *b));
    }

    #[test]
    fn injected_erase_failure() {
        let mut flash = MemFlash::new(2, 4, 1, 8);
        flash.inject_erase_failure(1);
        assert_eq!(flash.erase(1), Err(FlashError::EraseFailed { vbn: 1 }));
        flash.clear_failures();
        flash.erase(1).unwrap();
    }
}
