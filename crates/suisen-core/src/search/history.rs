//! 履歴ヒューリスティック

use crate::types::{Move, FROM_INDEX_NUM};

/// βカットを起こした静かな手の履歴表
pub(crate) struct History {
    table: Vec<u32>,
}

impl History {
    pub fn new() -> History {
        History { table: vec![0; FROM_INDEX_NUM * 81] }
    }

    #[inline]
    fn index(mv: Move) -> usize {
        mv.from_index() * 81 + mv.to().index()
    }

    #[inline]
    pub fn get(&self, mv: Move) -> u32 {
        self.table[Self::index(mv)]
    }

    #[inline]
    pub fn add(&mut self, mv: Move, depth: u8) {
        let e = &mut self.table[Self::index(mv)];
        *e = e.saturating_add(depth as u32 * depth as u32);
    }

    pub fn clear(&mut self) {
        self.table.fill(0);
    }
}
