//! Sparse page store for the flat table views.
//!
//! Rows live in a dense `Vec<Option<_>>` sized to the display length, so a
//! page can be overwritten in place without disturbing neighbours that a
//! superseded pass never got to. Slots stay `None` until their page arrives.

use std::ops::Range;

use tracing::warn;

use crate::node::IndexRow;
use crate::types::{IndexState, NodeId};

pub struct PageTable {
    page_size: u64,
    cap: u64,
    rows: Vec<Option<IndexRow>>,
    total: u64,
    truncation_warned: bool,
}

impl PageTable {
    pub fn new(page_size: u64, cap: u64) -> PageTable {
        PageTable {
            page_size,
            cap,
            rows: Vec::new(),
            total: 0,
            truncation_warned: false,
        }
    }

    /// Remote row count, uncapped.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Rows actually materializable, `min(total, cap)`.
    pub fn display_len(&self) -> u64 {
        self.total.min(self.cap)
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Apply a fresh remote count. Shrinks or grows the slot vector while
    /// keeping whatever rows remain in range. Returns true the first time
    /// the count exceeds the display cap.
    pub fn set_total(&mut self, total: u64) -> bool {
        self.total = total;
        let display = self.display_len() as usize;
        self.rows.resize(display, None);
        if total > self.cap {
            if !self.truncation_warned {
                self.truncation_warned = true;
                warn!(total, cap = self.cap, "row count exceeds display cap, view truncated");
                return true;
            }
        } else {
            self.truncation_warned = false;
        }
        false
    }

    /// Store one page of rows starting at `offset`. Returns the index range
    /// actually written, clamped to the display length. Slots past the end
    /// of a short final page keep their previous contents.
    pub fn overwrite(&mut self, offset: u64, rows: Vec<IndexRow>) -> Range<u64> {
        let start = offset.min(self.display_len());
        let mut end = start;
        for (i, row) in rows.into_iter().enumerate() {
            let index = offset as usize + i;
            if index < self.rows.len() {
                self.rows[index] = Some(row);
                end = index as u64 + 1;
            }
        }
        start..end
    }

    pub fn row(&self, index: u64) -> Option<&IndexRow> {
        self.rows.get(index as usize).and_then(Option::as_ref)
    }

    /// Whether any slot of the page containing `offset` is unpopulated.
    pub fn page_missing(&self, offset: u64) -> bool {
        let start = (offset - offset % self.page_size) as usize;
        let end = (start + self.page_size as usize).min(self.rows.len());
        if start >= self.rows.len() {
            return false;
        }
        self.rows[start..end].iter().any(Option::is_none)
    }

    /// Materialized rows within `range`, skipping unpopulated slots.
    pub fn rows_in(&self, range: Range<u64>) -> Vec<&IndexRow> {
        let start = (range.start as usize).min(self.rows.len());
        let end = (range.end as usize).min(self.rows.len());
        self.rows[start..end].iter().filter_map(Option::as_ref).collect()
    }

    /// Apply an optimistic state to every row in `ids`.
    pub fn set_state(&mut self, ids: &[NodeId], state: IndexState) {
        for slot in self.rows.iter_mut().flatten() {
            if ids.contains(&slot.id()) {
                slot.set_state(state);
            }
        }
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.total = 0;
        self.truncation_warned = false;
    }
}
