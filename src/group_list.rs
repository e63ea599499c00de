//! Fixed-capacity pools of log groups arranged as LRU lists.
//!
//! The list owns every resident group; callers hold [`GroupHandle`]s, which
//! stay valid until the group is removed. Head is most recently used.

use crate::config::Dgn;
use crate::log_group::LogGroup;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupHandle(usize);

#[derive(Debug)]
struct Slot {
    group: Option<LogGroup>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
pub struct LogGroupList {
    name: &'static str,
    slots: Vec<Slot>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl LogGroupList {
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        LogGroupList {
            name,
            slots: (0..capacity)
                .map(|_| Slot {
                    group: None,
                    prev: None,
                    next: None,
                })
                .collect(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn find(&self, dgn: Dgn) -> Option<GroupHandle> {
        self.slots
            .iter()
            .position(|s| s.group.as_ref().is_some_and(|g| g.dgn() == dgn))
            .map(GroupHandle)
    }

    pub fn contains(&self, dgn: Dgn) -> bool {
        self.find(dgn).is_some()
    }

    pub fn get(&self, h: GroupHandle) -> &LogGroup {
        match self.slots[h.0].group.as_ref() {
            Some(g) => g,
            None => panic!("{} list: stale group handle {}", self.name, h.0),
        }
    }

    pub fn get_mut(&mut self, h: GroupHandle) -> &mut LogGroup {
        let name = self.name;
        match self.slots[h.0].group.as_mut() {
            Some(g) => g,
            None => panic!("{name} list: stale group handle {}", h.0),
        }
    }

    /// Places a group at the MRU end. Hands the group back when the pool is full.
    pub fn insert_head(&mut self, group: LogGroup) -> Result<GroupHandle, LogGroup> {
        debug_assert!(!self.contains(group.dgn()), "group listed twice");
        let Some(idx) = self.slots.iter().position(|s| s.group.is_none()) else {
            return Err(group);
        };
        self.slots[idx].group = Some(group);
        self.link_head(idx);
        self.len += 1;
        Ok(GroupHandle(idx))
    }

    /// Unlinks a group and returns its slot to the pool.
    pub fn remove(&mut self, h: GroupHandle) -> LogGroup {
        self.unlink(h.0);
        self.len -= 1;
        match self.slots[h.0].group.take() {
            Some(g) => g,
            None => panic!("{} list: removing empty slot {}", self.name, h.0),
        }
    }

    pub fn move_to_head(&mut self, h: GroupHandle) {
        if self.head == Some(h.0) {
            return;
        }
        self.unlink(h.0);
        self.link_head(h.0);
    }

    pub fn head(&self) -> Option<GroupHandle> {
        self.head.map(GroupHandle)
    }

    pub fn tail(&self) -> Option<GroupHandle> {
        self.tail.map(GroupHandle)
    }

    /// Least recently used group other than `exclude`.
    pub fn select_victim(&self, exclude: Option<Dgn>) -> Option<GroupHandle> {
        self.iter_lru()
            .find(|&h| Some(self.get(h).dgn()) != exclude)
    }

    /// Handles from LRU tail to MRU head.
    pub fn iter_lru(&self) -> impl Iterator<Item = GroupHandle> + '_ {
        let mut cur = self.tail;
        std::iter::from_fn(move || {
            let idx = cur?;
            cur = self.slots[idx].prev;
            Some(GroupHandle(idx))
        })
    }

    pub fn dgns(&self) -> Vec<Dgn> {
        self.iter_lru().map(|h| self.get(h).dgn()).collect()
    }

    fn link_head(&mut self, idx: usize) {
        self.slots[idx].prev = None;
        self.slots[idx].next = self.head;
        if let Some(old) = self.head {
            self.slots[old].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneConfig;

    fn list_with(dgns: &[Dgn], cap: usize) -> LogGroupList {
        let cfg = ZoneConfig::default();
        let mut list = LogGroupList::with_capacity("test", cap);
        for &d in dgns {
            list.insert_head(LogGroup::new(d, &cfg)).unwrap();
        }
        list
    }

    #[test]
    fn lru_order_and_capacity() {
        let mut list = list_with(&[1, 2, 3], 3);
        assert!(list.is_full());
        assert_eq!(list.capacity(), 3);
        assert_eq!(list.dgns(), vec![1, 2, 3]);

        let overflow = list.insert_head(LogGroup::new(4, &ZoneConfig::default()));
        assert_eq!(overflow.map_err(|g| g.dgn()), Err(4));

        let h = list.find(1).unwrap();
        list.move_to_head(h);
        assert_eq!(list.dgns(), vec![2, 3, 1]);
        assert_eq!(list.tail().map(|h| list.get(h).dgn()), Some(2));
    }

    #[test]
    fn moved_group_is_not_the_victim() {
        let mut list = list_with(&[5, 6, 7], 4);
        let h = list.find(5).unwrap();
        list.move_to_head(h);
        let v = list.select_victim(Some(5)).unwrap();
        assert_ne!(list.get(v).dgn(), 5);
        assert_eq!(list.get(v).dgn(), 6);

        let single = list_with(&[9], 2);
        assert_eq!(single.select_victim(Some(9)), None);
        assert_eq!(single.select_victim(None).map(|h| single.get(h).dgn()), Some(9));
    }

    #[test]
    fn remove_returns_slot_to_pool() {
        let mut list = list_with(&[1, 2], 2);
        let h = list.find(1).unwrap();
        let g = list.remove(h);
        assert_eq!(g.dgn(), 1);
        assert_eq!(list.len(), 1);
        assert_eq!(list.capacity(), 2);
        assert_eq!(list.dgns(), vec![2]);
        let h3 = list.insert_head(LogGroup::new(3, &ZoneConfig::default())).unwrap();
        assert_eq!(h3, h);
        assert_eq!(list.dgns(), vec![2, 3]);
    }
}
