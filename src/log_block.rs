//! A single log block bound to a log group.

use crate::config::{BaseType, EraseCount, Vbn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogMode {
    Free,
    Alloc,
    Sequential,
    Random,
}

/// Primary mode plus the two independent flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogState {
    pub mode: LogMode,
    pub active: bool,
    pub mlc_fast: bool,
}

impl LogState {
    pub const FREE: LogState = LogState {
        mode: LogMode::Free,
        active: false,
        mlc_fast: false,
    };

    pub fn is_free(&self) -> bool {
        self.mode == LogMode::Free
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Log {
    pub vbn: Vbn,
    pub erase_count: EraseCount,
    /// Next page the log may be programmed at.
    pub clean_page_offset: BaseType,
    pub state: LogState,
    pub last_logical_page_offset: Option<BaseType>,
    pub self_index: usize,
    pub prev_index: Option<usize>,
    pub next_index: Option<usize>,
}

impl Log {
    pub fn free(self_index: usize) -> Self {
        Log {
            vbn: 0,
            erase_count: 0,
            clean_page_offset: 0,
            state: LogState::FREE,
            last_logical_page_offset: None,
            self_index,
            prev_index: None,
            next_index: None,
        }
    }

    /// FREE -> ALLOC: binds a freshly erased block.
    pub fn bind(&mut self, vbn: Vbn, erase_count: EraseCount, mlc_fast: bool) {
        debug_assert!(self.state.is_free(), "binding a log slot that is in use");
        *self = Log::free(self.self_index);
        self.vbn = vbn;
        self.erase_count = erase_count;
        self.state = LogState {
            mode: LogMode::Alloc,
            active: false,
            mlc_fast,
        };
    }

    pub fn reset(&mut self) {
        *self = Log::free(self.self_index);
    }

    pub fn is_free(&self) -> bool {
        self.state.is_free()
    }

    pub fn remaining_pages(&self, pages_per_block: BaseType) -> BaseType {
        pages_per_block.saturating_sub(self.clean_page_offset)
    }

    /// Advances the mode after a page at group offset `lpo` lands in this log.
    ///
    /// `block_aligned` is true when the write hits the first page of its
    /// logical block; `num_dblks` is how many data blocks the log serves
    /// after this write.
    pub fn on_page_written(&mut self, lpo: BaseType, block_aligned: bool, num_dblks: usize) {
        let next = match self.state.mode {
            LogMode::Free => LogMode::Free,
            LogMode::Alloc if block_aligned => LogMode::Sequential,
            LogMode::Alloc => LogMode::Random,
            LogMode::Sequential => {
                let in_order = self.last_logical_page_offset.map(|prev| prev + 1) == Some(lpo);
                if in_order && num_dblks <= 1 {
                    LogMode::Sequential
                } else {
                    LogMode::Random
                }
            }
            LogMode::Random => LogMode::Random,
        };
        if next != self.state.mode {
            trace!("log vbn {} {:?} -> {:?} at lpo {}", self.vbn, self.state.mode, next, lpo);
        }
        self.state.mode = next;
        self.last_logical_page_offset = Some(lpo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound() -> Log {
        let mut log = Log::free(0);
        log.bind(7, 2, false);
        log
    }

    #[test]
    fn aligned_first_write_is_sequential() {
        let mut log = bound();
        assert_eq!(log.state.mode, LogMode::Alloc);
        log.on_page_written(8, true, 1);
        assert_eq!(log.state.mode, LogMode::Sequential);
        log.on_page_written(9, false, 1);
        assert_eq!(log.state.mode, LogMode::Sequential);
    }

    #[test]
    fn unaligned_first_write_is_random() {
        let mut log = bound();
        log.on_page_written(3, false, 1);
        assert_eq!(log.state.mode, LogMode::Random);
    }

    #[test]
    fn gap_or_second_block_breaks_sequence() {
        let mut log = bound();
        log.on_page_written(0, true, 1);
        log.on_page_written(2, false, 1);
        assert_eq!(log.state.mode, LogMode::Random);

        let mut log = bound();
        log.on_page_written(0, true, 1);
        log.on_page_written(1, false, 2);
        assert_eq!(log.state.mode, LogMode::Random);

        // terminal
        log.on_page_written(0, true, 1);
        assert_eq!(log.state.mode, LogMode::Random);
    }

    #[test]
    fn reset_returns_to_free() {
        let mut log = bound();
        log.clean_page_offset = 5;
        log.reset();
        assert!(log.is_free());
        assert_eq!(log.clean_page_offset, 0);
        assert_eq!(log.remaining_pages(8), 8);
    }
}
