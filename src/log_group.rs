//! Log groups: up to K logs absorbing writes for N logical blocks.
//!
//! Logs live in a fixed K-slot array and are chained newest-to-oldest by
//! index (`head` is the newest, `tail` the oldest). The page map is indexed by
//! the logical page offset inside the group; a non-null entry encodes
//! `log_index * pages_per_block + offset_in_log`.

use crate::config::{BaseType, Dgn, EraseCount, Lbn, Vbn, Vpn, ZoneConfig, NULL_OFFSET};
use crate::log_block::Log;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogGroup {
    dgn: Dgn,
    num_logs: usize,
    head_index: Option<usize>,
    tail_index: Option<usize>,
    pub(crate) min_valid_page_log_index: Option<usize>,
    min_erase_count: EraseCount,
    min_erase_count_vbn: Option<Vbn>,

    logs: Vec<Log>,
    page_map: Vec<BaseType>,
    valid_pages: Vec<u32>,
    lbn_list: Vec<Vec<Lbn>>,

    pages_per_block: BaseType,
    num_ways: BaseType,
    blocks_per_group: BaseType,
}

impl LogGroup {
    pub fn new(dgn: Dgn, cfg: &ZoneConfig) -> Self {
        let k = cfg.logs_per_group();
        LogGroup {
            dgn,
            num_logs: 0,
            head_index: None,
            tail_index: None,
            min_valid_page_log_index: None,
            min_erase_count: EraseCount::MAX,
            min_erase_count_vbn: None,
            logs: (0..k).map(Log::free).collect(),
            page_map: vec![NULL_OFFSET; cfg.pages_per_group() as usize],
            valid_pages: vec![0; k * cfg.num_ways as usize],
            lbn_list: vec![Vec::with_capacity(cfg.blocks_per_group as usize); k],
            pages_per_block: cfg.pages_per_block,
            num_ways: cfg.num_ways,
            blocks_per_group: cfg.blocks_per_group,
        }
    }

    pub fn dgn(&self) -> Dgn {
        self.dgn
    }

    pub fn num_logs(&self) -> usize {
        self.num_logs
    }

    pub fn max_logs(&self) -> usize {
        self.logs.len()
    }

    pub fn is_full(&self) -> bool {
        self.num_logs == self.logs.len()
    }

    pub fn head(&self) -> Option<usize> {
        self.head_index
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail_index
    }

    pub fn min_valid_page_log(&self) -> Option<usize> {
        self.min_valid_page_log_index
    }

    pub fn min_erase_count(&self) -> EraseCount {
        self.min_erase_count
    }

    pub fn min_erase_count_vbn(&self) -> Option<Vbn> {
        self.min_erase_count_vbn
    }

    pub fn log(&self, idx: usize) -> &Log {
        &self.logs[idx]
    }

    pub fn log_mut(&mut self, idx: usize) -> &mut Log {
        &mut self.logs[idx]
    }

    /// Slots in use, oldest first.
    pub fn logs_oldest_first(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.num_logs);
        let mut cur = self.tail_index;
        while let Some(idx) = cur {
            out.push(idx);
            cur = self.logs[idx].prev_index;
        }
        out
    }

    pub fn find_log(&self, vbn: Vbn) -> Option<usize> {
        self.logs_oldest_first().into_iter().find(|&i| self.logs[i].vbn == vbn)
    }

    /// Binds a free slot to `vbn` and links it in as the newest log.
    pub fn alloc_log(&mut self, vbn: Vbn, erase_count: EraseCount, mlc_fast: bool) -> Option<usize> {
        let idx = self.logs.iter().position(Log::is_free)?;

        self.logs[idx].bind(vbn, erase_count, mlc_fast);
        self.logs[idx].next_index = self.head_index;
        if let Some(old_head) = self.head_index {
            self.logs[old_head].prev_index = Some(idx);
            self.logs[old_head].state.active = false;
        }
        self.head_index = Some(idx);
        if self.tail_index.is_none() {
            self.tail_index = Some(idx);
        }
        self.num_logs += 1;
        self.refresh_min_erase_count();
        Some(idx)
    }

    /// Unlinks an empty log and resets its slot, returning the block it held.
    pub fn remove_log(&mut self, idx: usize) -> (Vbn, EraseCount) {
        debug_assert!(!self.logs[idx].is_free(), "removing a free log slot");
        debug_assert_eq!(self.valid_pages(idx), 0, "removing a log that still maps pages");

        let (prev, next) = (self.logs[idx].prev_index, self.logs[idx].next_index);
        match prev {
            Some(p) => self.logs[p].next_index = next,
            None => self.head_index = next,
        }
        match next {
            Some(n) => self.logs[n].prev_index = prev,
            None => self.tail_index = prev,
        }

        let released = (self.logs[idx].vbn, self.logs[idx].erase_count);
        self.logs[idx].reset();
        let w = self.num_ways as usize;
        self.valid_pages[idx * w..(idx + 1) * w].fill(0);
        self.lbn_list[idx].clear();
        self.num_logs -= 1;
        if self.min_valid_page_log_index == Some(idx) {
            self.min_valid_page_log_index = None;
        }
        self.refresh_min_erase_count();
        released
    }

    fn refresh_min_erase_count(&mut self) {
        let min = self
            .logs
            .iter()
            .filter(|l| !l.is_free())
            .min_by_key(|l| l.erase_count);
        self.min_erase_count = min.map_or(EraseCount::MAX, |l| l.erase_count);
        self.min_erase_count_vbn = min.map(|l| l.vbn);
    }

    pub fn clear_active_flags(&mut self) {
        self.logs.iter_mut().for_each(|l| l.state.active = false);
    }

    pub fn max_log_erase_count(&self) -> Option<EraseCount> {
        self.logs.iter().filter(|l| !l.is_free()).map(|l| l.erase_count).max()
    }

    fn encode(&self, log_idx: usize, offset: BaseType) -> BaseType {
        log_idx as BaseType * self.pages_per_block + offset
    }

    fn decode(&self, entry: BaseType) -> Option<(usize, BaseType)> {
        if entry == NULL_OFFSET {
            return None;
        }
        Some(((entry / self.pages_per_block) as usize, entry % self.pages_per_block))
    }

    /// Where the page at group offset `lpo` lives, if a log holds it.
    pub fn lookup(&self, lpo: BaseType) -> Option<(usize, BaseType)> {
        self.decode(*self.page_map.get(lpo as usize)?)
    }

    pub fn lookup_vpn(&self, lpo: BaseType) -> Option<Vpn> {
        let (log_idx, offset) = self.lookup(lpo)?;
        Some(self.logs[log_idx].vbn * self.pages_per_block + offset)
    }

    fn counter(&mut self, log_idx: usize, offset: BaseType) -> &mut u32 {
        let w = self.num_ways as usize;
        &mut self.valid_pages[log_idx * w + (offset % self.num_ways) as usize]
    }

    /// Records that `lpo` now lives at `offset` in `log_idx`.
    ///
    /// Returns the previous location, whose valid counter has been dropped.
    pub fn map_page(&mut self, lpo: BaseType, log_idx: usize, offset: BaseType, lbn: Lbn) -> Option<(usize, BaseType)> {
        debug_assert!(!self.logs[log_idx].is_free(), "mapping into a free log");
        let previous = self.unmap_page(lpo);

        self.page_map[lpo as usize] = self.encode(log_idx, offset);
        *self.counter(log_idx, offset) += 1;

        let lbns = &mut self.lbn_list[log_idx];
        if !lbns.contains(&lbn) {
            debug_assert!(
                lbns.len() < self.blocks_per_group as usize,
                "log serves more data blocks than its group"
            );
            lbns.push(lbn);
        }
        previous
    }

    pub fn unmap_page(&mut self, lpo: BaseType) -> Option<(usize, BaseType)> {
        let previous = self.lookup(lpo)?;
        self.page_map[lpo as usize] = NULL_OFFSET;
        let counter = self.counter(previous.0, previous.1);
        debug_assert!(*counter > 0, "valid page counter underflow");
        *counter = counter.saturating_sub(1);
        Some(previous)
    }

    pub fn valid_pages(&self, log_idx: usize) -> u32 {
        let w = self.num_ways as usize;
        self.valid_pages[log_idx * w..(log_idx + 1) * w].iter().sum()
    }

    pub fn way_valid_pages(&self, log_idx: usize, way: usize) -> u32 {
        self.valid_pages[log_idx * self.num_ways as usize + way]
    }

    pub fn total_valid_pages(&self) -> u32 {
        self.valid_pages.iter().sum()
    }

    pub fn num_dblks(&self, log_idx: usize) -> usize {
        self.lbn_list[log_idx].len()
    }

    pub fn lbns(&self, log_idx: usize) -> &[Lbn] {
        &self.lbn_list[log_idx]
    }

    /// Forgets `lbn` in every log's block list once its pages left the logs.
    pub fn forget_lbn(&mut self, lbn: Lbn) {
        self.lbn_list.iter_mut().for_each(|l| l.retain(|&b| b != lbn));
    }

    /// Group offsets currently mapped into `log_idx`, ascending.
    pub fn pages_in_log(&self, log_idx: usize) -> Vec<BaseType> {
        (0..self.page_map.len() as BaseType)
            .filter(|&lpo| matches!(self.lookup(lpo), Some((l, _)) if l == log_idx))
            .collect()
    }

    pub fn pages_per_block(&self) -> BaseType {
        self.pages_per_block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ZoneConfig {
        ZoneConfig {
            pages_per_block: 8,
            num_ways: 2,
            blocks_per_group: 2,
            logs_per_group: 4,
            num_logical_blocks: 16,
            num_physical_blocks: 32,
            blocks_per_local_area: 8,
            max_free_slots: 32,
            ..ZoneConfig::default()
        }
    }

    #[test]
    fn logs_link_newest_at_head() {
        let mut g = LogGroup::new(1, &cfg());
        let a = g.alloc_log(10, 5, false).unwrap();
        let b = g.alloc_log(11, 2, false).unwrap();
        let c = g.alloc_log(12, 9, false).unwrap();
        assert_eq!(g.head(), Some(c));
        assert_eq!(g.tail(), Some(a));
        assert_eq!(g.logs_oldest_first(), vec![a, b, c]);
        assert_eq!(g.min_erase_count(), 2);
        assert_eq!(g.min_erase_count_vbn(), Some(11));

        assert_eq!(g.remove_log(b), (11, 2));
        assert_eq!(g.logs_oldest_first(), vec![a, c]);
        assert_eq!(g.min_erase_count(), 5);

        // the freed slot is reused first
        assert_eq!(g.alloc_log(13, 1, false), Some(b));
        assert_eq!(g.logs_oldest_first(), vec![a, c, b]);
    }

    #[test]
    fn pool_of_k_slots() {
        let mut g = LogGroup::new(0, &cfg());
        for vbn in 0..4 {
            assert!(g.alloc_log(vbn, 0, false).is_some());
        }
        assert!(g.is_full());
        assert_eq!(g.alloc_log(9, 0, false), None);
    }

    #[test]
    fn remap_moves_exactly_one_counter() {
        let mut g = LogGroup::new(0, &cfg());
        let a = g.alloc_log(10, 0, false).unwrap();
        let b = g.alloc_log(11, 0, false).unwrap();

        assert_eq!(g.map_page(3, a, 1, 0), None);
        assert_eq!(g.valid_pages(a), 1);
        assert_eq!(g.map_page(3, b, 0, 0), Some((a, 1)));
        assert_eq!(g.valid_pages(a), 0);
        assert_eq!(g.valid_pages(b), 1);
        assert_eq!(g.lookup_vpn(3), Some(11 * 8));
        assert_eq!(g.total_valid_pages(), 1);
        assert_eq!(g.pages_in_log(b), vec![3]);
        assert_eq!(g.pages_in_log(a), Vec::<BaseType>::new());
    }

    #[test]
    fn counters_track_ways() {
        let mut g = LogGroup::new(0, &cfg());
        let a = g.alloc_log(10, 0, false).unwrap();
        g.map_page(0, a, 0, 0);
        g.map_page(1, a, 1, 0);
        g.map_page(2, a, 3, 0);
        assert_eq!(g.way_valid_pages(a, 0), 1);
        assert_eq!(g.way_valid_pages(a, 1), 2);
        g.unmap_page(1);
        assert_eq!(g.way_valid_pages(a, 1), 1);
        assert_eq!(g.unmap_page(1), None);
    }

    #[test]
    fn lbn_list_deduplicates() {
        let mut g = LogGroup::new(2, &cfg());
        let a = g.alloc_log(10, 0, false).unwrap();
        g.map_page(0, a, 0, 4);
        g.map_page(1, a, 1, 4);
        g.map_page(9, a, 2, 5);
        assert_eq!(g.lbns(a), &[4, 5]);
        assert_eq!(g.num_dblks(a), 2);
        g.forget_lbn(4);
        assert_eq!(g.lbns(a), &[5]);
    }
}
