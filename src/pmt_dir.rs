//! PMT directory: one entry per data group plus the merge-victim bitmap and
//! the wear-level buckets.

use crate::bmt::{bitmap_clear, bitmap_get, bitmap_set};
use crate::config::{BaseType, Dgn, EraseCount, MetaOffset, Vbn};

/// Cost of a group with no logs; never picked as a victim.
pub const COST_MAX: u32 = u32::MAX;
/// Cost of a group holding a single, freshly started log.
pub const COST_JUST_STARTED: u32 = u32::MAX - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmtDirEntry {
    pub meta_page_offset: Option<MetaOffset>,
    pub compaction_cost: u32,
    pub min_erase_count: EraseCount,
    pub min_erase_count_vbn: Option<Vbn>,
}

impl PmtDirEntry {
    const EMPTY: PmtDirEntry = PmtDirEntry {
        meta_page_offset: None,
        compaction_cost: COST_MAX,
        min_erase_count: EraseCount::MAX,
        min_erase_count_vbn: None,
    };
}

/// Minimum erase count over `DEFAULT_PMT_EC_GRP_SIZE` consecutive groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EcBucket {
    pub min_erase_count: EraseCount,
    pub vbn: Option<Vbn>,
    pub dgn: Option<Dgn>,
}

impl EcBucket {
    const EMPTY: EcBucket = EcBucket {
        min_erase_count: EraseCount::MAX,
        vbn: None,
        dgn: None,
    };
}

#[derive(Debug)]
pub struct PmtDirectory {
    entries: Vec<PmtDirEntry>,
    merge_victims: Vec<u8>,
    buckets: Vec<EcBucket>,
    bucket_size: BaseType,
    min_bucket: Option<usize>,
}

impl PmtDirectory {
    pub fn new(num_groups: BaseType, bucket_size: BaseType) -> Self {
        let num_buckets = num_groups.div_ceil(bucket_size.max(1)) as usize;
        PmtDirectory {
            entries: vec![PmtDirEntry::EMPTY; num_groups as usize],
            merge_victims: vec![0; (num_groups as usize).div_ceil(8)],
            buckets: vec![EcBucket::EMPTY; num_buckets],
            bucket_size: bucket_size.max(1),
            min_bucket: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, dgn: Dgn) -> &PmtDirEntry {
        &self.entries[dgn as usize]
    }

    /// Where the group's mapping table was last stored.
    pub fn search(&self, dgn: Dgn) -> Option<MetaOffset> {
        self.entries.get(dgn as usize)?.meta_page_offset
    }

    /// Records a fresh PMT store along with the group's coldest block.
    pub fn update(&mut self, dgn: Dgn, meta_offset: MetaOffset, min_ec: EraseCount, min_ec_vbn: Option<Vbn>) {
        self.entries[dgn as usize].meta_page_offset = Some(meta_offset);
        self.update_erase_count(dgn, min_ec, min_ec_vbn);
    }

    pub fn update_erase_count(&mut self, dgn: Dgn, min_ec: EraseCount, min_ec_vbn: Option<Vbn>) {
        let entry = &mut self.entries[dgn as usize];
        entry.min_erase_count = min_ec;
        entry.min_erase_count_vbn = min_ec_vbn;
        self.refresh_bucket(dgn, min_ec, min_ec_vbn);
    }

    /// Sets the compaction cost and the merge-victim flag in one go.
    pub fn set_cost(&mut self, dgn: Dgn, cost: u32) {
        self.entries[dgn as usize].compaction_cost = cost;
        if cost == COST_MAX {
            bitmap_clear(&mut self.merge_victims, dgn);
        } else {
            bitmap_set(&mut self.merge_victims, dgn);
        }
    }

    /// Drops every trace of a group that no longer holds logs.
    pub fn clear(&mut self, dgn: Dgn) {
        self.entries[dgn as usize] = PmtDirEntry::EMPTY;
        bitmap_clear(&mut self.merge_victims, dgn);
        self.refresh_bucket(dgn, EraseCount::MAX, None);
    }

    pub fn is_merge_victim(&self, dgn: Dgn) -> bool {
        bitmap_get(&self.merge_victims, dgn)
    }

    /// Cheapest flagged group, ignoring every DGN in `masked`.
    ///
    /// The masked flags are cleared for the duration of the scan and restored
    /// afterwards.
    pub fn search_merge_victim(&mut self, masked: &[Dgn]) -> Option<Dgn> {
        let saved: Vec<Dgn> = masked.iter().copied().filter(|&d| self.is_merge_victim(d)).collect();
        for &d in &saved {
            bitmap_clear(&mut self.merge_victims, d);
        }

        let mut best: Option<(u32, Dgn)> = None;
        for dgn in 0..self.entries.len() as Dgn {
            if !self.is_merge_victim(dgn) {
                continue;
            }
            let cost = self.entries[dgn as usize].compaction_cost;
            if cost != COST_MAX && best.map_or(true, |(c, _)| cost < c) {
                best = Some((cost, dgn));
            }
        }

        for &d in &saved {
            bitmap_set(&mut self.merge_victims, d);
        }
        best.map(|(_, dgn)| dgn)
    }

    /// Globally coldest tracked block: (erase count, vbn, owning group).
    pub fn global_min(&self) -> Option<(EraseCount, Vbn, Dgn)> {
        let b = self.buckets.get(self.min_bucket?)?;
        Some((b.min_erase_count, b.vbn?, b.dgn?))
    }

    pub fn bucket(&self, idx: usize) -> &EcBucket {
        &self.buckets[idx]
    }

    pub fn bucket_of(&self, dgn: Dgn) -> usize {
        (dgn / self.bucket_size) as usize
    }

    fn refresh_bucket(&mut self, dgn: Dgn, min_ec: EraseCount, vbn: Option<Vbn>) {
        let b = self.bucket_of(dgn);
        let bucket = self.buckets[b];

        if vbn.is_some() && min_ec < bucket.min_erase_count {
            self.buckets[b] = EcBucket {
                min_erase_count: min_ec,
                vbn,
                dgn: Some(dgn),
            };
        } else if bucket.dgn == Some(dgn) {
            // the owner changed, rescan the bucket
            self.buckets[b] = self.scan_bucket(b);
        }
        self.refresh_min_bucket();
    }

    fn scan_bucket(&self, b: usize) -> EcBucket {
        let start = b * self.bucket_size as usize;
        let end = (start + self.bucket_size as usize).min(self.entries.len());
        let mut out = EcBucket::EMPTY;
        for dgn in start..end {
            let e = &self.entries[dgn];
            if e.min_erase_count_vbn.is_some() && e.min_erase_count < out.min_erase_count {
                out = EcBucket {
                    min_erase_count: e.min_erase_count,
                    vbn: e.min_erase_count_vbn,
                    dgn: Some(dgn as Dgn),
                };
            }
        }
        out
    }

    fn refresh_min_bucket(&mut self) {
        self.min_bucket = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.vbn.is_some())
            .min_by_key(|(_, b)| b.min_erase_count)
            .map(|(i, _)| i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn victim_is_cheapest_unmasked() {
        let mut dir = PmtDirectory::new(16, 4);
        dir.set_cost(1, 40);
        dir.set_cost(3, 10);
        dir.set_cost(7, 25);
        assert_eq!(dir.search_merge_victim(&[]), Some(3));
        assert_eq!(dir.search_merge_victim(&[3]), Some(7));
        // masking restores the flag afterwards
        assert!(dir.is_merge_victim(3));
        assert_eq!(dir.search_merge_victim(&[3, 7, 1]), None);
    }

    #[test]
    fn max_cost_clears_flag() {
        let mut dir = PmtDirectory::new(8, 4);
        dir.set_cost(2, 5);
        assert!(dir.is_merge_victim(2));
        dir.set_cost(2, COST_MAX);
        assert!(!dir.is_merge_victim(2));
        assert_eq!(dir.search_merge_victim(&[]), None);
    }

    #[test]
    fn search_and_clear_entries() {
        let mut dir = PmtDirectory::new(8, 4);
        assert_eq!(dir.search(5), None);
        dir.update(5, 12, 3, Some(40));
        assert_eq!(dir.search(5), Some(12));
        assert_eq!(dir.entry(5).min_erase_count, 3);
        assert_eq!(dir.entry(5).min_erase_count_vbn, Some(40));
        dir.set_cost(5, 9);
        assert_eq!(dir.entry(5).compaction_cost, 9);
        dir.clear(5);
        assert_eq!(dir.entry(5).compaction_cost, COST_MAX);
        assert_eq!(dir.search(5), None);
        assert!(!dir.is_merge_victim(5));
        assert_eq!(dir.global_min(), None);
    }

    #[test]
    fn buckets_track_global_minimum() {
        let mut dir = PmtDirectory::new(16, 4);
        dir.update_erase_count(1, 9, Some(100));
        dir.update_erase_count(6, 4, Some(101));
        dir.update_erase_count(13, 7, Some(102));
        assert_eq!(dir.global_min(), Some((4, 101, 6)));

        // owner warms up: its bucket is rescanned and the minimum moves
        dir.update_erase_count(6, 20, Some(101));
        assert_eq!(dir.global_min(), Some((7, 102, 13)));

        dir.update_erase_count(5, 8, Some(103));
        assert_eq!(dir.bucket(1).dgn, Some(5));
        assert_eq!(dir.global_min(), Some((7, 102, 13)));
    }
}
