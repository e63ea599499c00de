//! Circular list of erase-ready blocks with their erase counts.

use crate::config::{EraseCount, Vbn};
use crate::error::{FtlError, Result};

#[derive(Debug)]
pub struct FreeBlockList {
    vbns: Vec<Vbn>,
    erase_counts: Vec<EraseCount>,
    head: usize,
    count: usize,
    sorted: bool,
}

impl FreeBlockList {
    /// `sorted` keeps the list ascending by erase count on every insert.
    pub fn new(max_free_slots: usize, sorted: bool) -> Self {
        FreeBlockList {
            vbns: vec![0; max_free_slots],
            erase_counts: vec![0; max_free_slots],
            head: 0,
            count: 0,
            sorted,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.vbns.len()
    }

    pub fn head_index(&self) -> usize {
        self.head
    }

    fn slot(&self, i: usize) -> usize {
        (self.head + i) % self.vbns.len()
    }

    pub fn peek(&self) -> Option<(Vbn, EraseCount)> {
        self.get(0)
    }

    pub fn get(&self, i: usize) -> Option<(Vbn, EraseCount)> {
        if i >= self.count {
            return None;
        }
        let s = self.slot(i);
        Some((self.vbns[s], self.erase_counts[s]))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Vbn, EraseCount)> + '_ {
        (0..self.count).filter_map(move |i| self.get(i))
    }

    pub fn contains(&self, vbn: Vbn) -> bool {
        self.iter().any(|(v, _)| v == vbn)
    }

    pub fn min_erase_count(&self) -> Option<EraseCount> {
        self.iter().map(|(_, ec)| ec).min()
    }

    pub fn add(&mut self, vbn: Vbn, erase_count: EraseCount) -> Result<()> {
        if self.is_full() {
            return Err(FtlError::FreeListFull);
        }
        if self.contains(vbn) {
            return Err(FtlError::DuplicateFreeBlock { vbn });
        }
        if self.sorted {
            self.insert_sorted(vbn, erase_count);
        } else {
            let s = self.slot(self.count);
            self.vbns[s] = vbn;
            self.erase_counts[s] = erase_count;
            self.count += 1;
        }
        Ok(())
    }

    /// Insertion sort by erase count, shifting whichever side is shorter.
    fn insert_sorted(&mut self, vbn: Vbn, erase_count: EraseCount) {
        let cap = self.vbns.len();
        let pos = self
            .iter()
            .position(|(_, ec)| ec > erase_count)
            .unwrap_or(self.count);

        if pos * 2 < self.count {
            // rotate the front one slot towards the head
            self.head = (self.head + cap - 1) % cap;
            for i in 0..pos {
                let (dst, src) = (self.slot(i), self.slot(i + 1));
                self.vbns[dst] = self.vbns[src];
                self.erase_counts[dst] = self.erase_counts[src];
            }
        } else {
            for i in (pos..self.count).rev() {
                let (dst, src) = (self.slot(i + 1), self.slot(i));
                self.vbns[dst] = self.vbns[src];
                self.erase_counts[dst] = self.erase_counts[src];
            }
        }
        let s = self.slot(pos);
        self.vbns[s] = vbn;
        self.erase_counts[s] = erase_count;
        self.count += 1;
    }

    pub fn pop(&mut self) -> Option<(Vbn, EraseCount)> {
        let out = self.peek()?;
        self.head = self.slot(1);
        self.count -= 1;
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_round_trip() {
        let mut list = FreeBlockList::new(4, false);
        list.add(7, 3).unwrap();
        assert_eq!(list.pop(), Some((7, 3)));
        assert!(list.is_empty());
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn rejects_duplicates_and_overflow() {
        let mut list = FreeBlockList::new(2, false);
        list.add(1, 0).unwrap();
        assert_eq!(list.add(1, 5), Err(FtlError::DuplicateFreeBlock { vbn: 1 }));
        list.add(2, 0).unwrap();
        assert_eq!(list.add(3, 0), Err(FtlError::FreeListFull));
    }

    #[test]
    fn wraps_around() {
        let mut list = FreeBlockList::new(3, false);
        for v in 0..3 {
            list.add(v, v).unwrap();
        }
        list.pop();
        list.pop();
        list.add(10, 0).unwrap();
        list.add(11, 0).unwrap();
        let order: Vec<Vbn> = list.iter().map(|(v, _)| v).collect();
        assert_eq!(order, vec![2, 10, 11]);
    }

    #[test]
    fn sorted_insert_from_both_sides() {
        let mut list = FreeBlockList::new(8, true);
        for (vbn, ec) in [(1, 10), (2, 30), (3, 20), (4, 5), (5, 25), (6, 30), (7, 1)] {
            list.add(vbn, ec).unwrap();
        }
        let ecs: Vec<EraseCount> = list.iter().map(|(_, ec)| ec).collect();
        assert_eq!(ecs, vec![1, 5, 10, 20, 25, 30, 30]);
        // equal counts keep arrival order
        let tail: Vec<Vbn> = list.iter().skip(5).map(|(v, _)| v).collect();
        assert_eq!(tail, vec![2, 6]);

        assert_eq!(list.pop(), Some((7, 1)));
        list.add(8, 2).unwrap();
        assert_eq!(list.peek(), Some((8, 2)));
        assert_eq!(list.min_erase_count(), Some(2));
    }
}
