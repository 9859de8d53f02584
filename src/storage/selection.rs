//! Lazily applied row selections.
//!
//! Instead of compacting a table after every filter, a [`RowSelection`]
//! records which rows survive as a bitmap plus one coarse flag per
//! morsel-sized segment, so consumers can skip or fast-path whole segments.

use crate::error::{Result, TesseraError};
use crate::pool::MORSEL_SIZE;
use crate::storage::Column;

/// Coarse per-segment summary of a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFlag {
    /// No row of the segment is selected.
    None,
    /// Every row of the segment is selected.
    All,
    /// Some rows are selected.
    Mixed,
}

/// Outcome of resolving a selection over one batch of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSelection {
    /// No row of the batch is selected.
    Skip,
    /// Every row of the batch is selected.
    All,
    /// The caller's mask buffer holds the per-row flags.
    Partial,
}

/// Row-selection bitmap with per-segment flags and popcounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSelection {
    words: Vec<u64>,
    flags: Vec<SegmentFlag>,
    counts: Vec<u32>,
    len: usize,
    selected: usize,
}

impl RowSelection {
    /// Selects every row.
    #[must_use]
    pub fn all(len: usize) -> Self {
        let mut words = vec![u64::MAX; len.div_ceil(64)];
        if len % 64 != 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u64 << (len % 64)) - 1;
            }
        }
        Self::from_words(words, len)
    }

    /// Selects the rows whose predicate value is true.
    #[must_use]
    pub fn from_predicate(pred: &[bool]) -> Self {
        let mut words = vec![0u64; pred.len().div_ceil(64)];
        for (w, chunk) in words.iter_mut().zip(pred.chunks(64)) {
            for (bit, &keep) in chunk.iter().enumerate() {
                *w |= u64::from(keep) << bit;
            }
        }
        Self::from_words(words, pred.len())
    }

    /// Selects rows from a boolean column; null rows are excluded.
    pub fn from_column(pred: &Column) -> Result<Self> {
        let Some(values) = pred.as_bool_slice() else {
            return Err(TesseraError::type_error("BOOL", pred.data_type().name()));
        };
        let mut sel = Self::from_predicate(values);
        if let Some(nulls) = pred.nulls() {
            for i in 0..sel.len {
                if nulls.is_null(i) {
                    sel.words[i >> 6] &= !(1u64 << (i & 63));
                }
            }
            sel.recompute();
        }
        Ok(sel)
    }

    fn from_words(words: Vec<u64>, len: usize) -> Self {
        let mut sel = Self {
            words,
            flags: Vec::new(),
            counts: Vec::new(),
            len,
            selected: 0,
        };
        sel.recompute();
        sel
    }

    /// Rebuilds segment flags and popcounts from the bitmap.
    fn recompute(&mut self) {
        let n_segments = self.len.div_ceil(MORSEL_SIZE);
        let words_per_segment = MORSEL_SIZE / 64;
        self.flags = Vec::with_capacity(n_segments);
        self.counts = Vec::with_capacity(n_segments);
        self.selected = 0;
        for seg in 0..n_segments {
            let first = seg * words_per_segment;
            let last = (first + words_per_segment).min(self.words.len());
            let count: u32 = self.words[first..last].iter().map(|w| w.count_ones()).sum();
            let seg_rows = (self.len - seg * MORSEL_SIZE).min(MORSEL_SIZE);
            self.flags.push(match count as usize {
                0 => SegmentFlag::None,
                c if c == seg_rows => SegmentFlag::All,
                _ => SegmentFlag::Mixed,
            });
            self.counts.push(count);
            self.selected += count as usize;
        }
    }

    /// Returns the number of rows covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the selection covers no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of selected rows.
    #[must_use]
    pub fn count(&self) -> usize {
        self.selected
    }

    /// Returns true if row `i` is selected.
    #[inline]
    #[must_use]
    pub fn is_selected(&self, i: usize) -> bool {
        (self.words[i >> 6] >> (i & 63)) & 1 == 1
    }

    /// Returns the coarse flag of segment `seg`.
    #[must_use]
    pub fn segment_flag(&self, seg: usize) -> SegmentFlag {
        self.flags[seg]
    }

    /// Returns the number of selected rows in segment `seg`.
    #[must_use]
    pub fn segment_count(&self, seg: usize) -> usize {
        self.counts[seg] as usize
    }

    /// Returns the number of segments.
    #[must_use]
    pub fn segments(&self) -> usize {
        self.flags.len()
    }

    /// Intersects two selections over the same rows.
    pub fn and(&self, other: &RowSelection) -> Result<Self> {
        if self.len != other.len {
            return Err(TesseraError::LengthMismatch {
                left: self.len,
                right: other.len,
            });
        }
        let words = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| a & b)
            .collect();
        Ok(Self::from_words(words, self.len))
    }

    /// Returns the selected row indices in ascending order.
    #[must_use]
    pub fn indices(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.selected);
        for (wi, &word) in self.words.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = w.trailing_zeros() as usize;
                out.push((wi * 64 + bit) as u32);
                w &= w - 1;
            }
        }
        out
    }

    /// Copies the selection of rows `start..start + len`.
    #[must_use]
    pub fn slice(&self, start: usize, len: usize) -> Self {
        let mut words = vec![0u64; len.div_ceil(64)];
        for i in (0..len).filter(|&i| self.is_selected(start + i)) {
            words[i >> 6] |= 1u64 << (i & 63);
        }
        Self::from_words(words, len)
    }

    /// Resolves rows `start..start + mask.len()`.
    ///
    /// Segment-aligned batches are answered from the coarse flags; otherwise
    /// the bitmap is consulted. `mask` is only written for
    /// [`BatchSelection::Partial`].
    pub fn resolve_batch(&self, start: usize, mask: &mut [bool]) -> BatchSelection {
        let len = mask.len();
        if start % MORSEL_SIZE == 0 && len <= MORSEL_SIZE {
            let seg = start / MORSEL_SIZE;
            match self.flags[seg] {
                SegmentFlag::None => return BatchSelection::Skip,
                SegmentFlag::All => return BatchSelection::All,
                SegmentFlag::Mixed => {}
            }
        }
        let mut hits = 0;
        for (i, m) in mask.iter_mut().enumerate() {
            *m = self.is_selected(start + i);
            hits += usize::from(*m);
        }
        match hits {
            0 => BatchSelection::Skip,
            h if h == len => BatchSelection::All,
            _ => BatchSelection::Partial,
        }
    }
}
