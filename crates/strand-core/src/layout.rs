use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use crate::error::{Error, Result};

// Layout: Where a matrix's elements live inside its buffer
//
// Matrices are 2-d and column-major. A view into a larger allocation is
// described by three numbers on top of its shape:
//
//   offset: index of element (0, 0) in the flat buffer
//   ld    : leading dimension: distance between the starts of two
//            consecutive columns (BLAS `lda`)
//
// For an owning matrix `ld == nrows` and `offset == 0`. Column slices move
// the offset by whole columns and stay contiguous. Row slices keep the
// parent's `ld` while shrinking `nrows`, so consecutive columns are no longer
// adjacent: that is the non-unit stride every kernel has to honour.
//
//   parent 4x3, ld=4          rows 1..3, all columns
//   [0 4 8 ]                  offset=1, nrows=2, ld=4
//   [1 5 9 ]  ─────────►      [1 5 9 ]
//   [2 6 10]                  [2 6 10]
//   [3 7 11]

/// Geometry of a (possibly strided) column-major view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    nrows: usize,
    ncols: usize,
    offset: usize,
    ld: usize,
}

impl Layout {
    /// Dense column-major layout starting at the beginning of a buffer.
    pub fn contiguous(nrows: usize, ncols: usize) -> Self {
        Layout {
            nrows,
            ncols,
            offset: 0,
            ld: nrows.max(1),
        }
    }

    /// Layout with explicit offset and leading dimension (for views).
    pub fn new(nrows: usize, ncols: usize, offset: usize, ld: usize) -> Self {
        Layout {
            nrows,
            ncols,
            offset,
            ld: ld.max(1),
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn ld(&self) -> usize {
        self.ld
    }

    pub fn elem_count(&self) -> usize {
        self.nrows * self.ncols
    }

    /// Whether the view's elements form one gap-free run in the buffer.
    pub fn is_contiguous(&self) -> bool {
        self.ld == self.nrows || self.ncols <= 1
    }

    /// Flat buffer index of element (row, col).
    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        self.offset + col * self.ld + row
    }

    /// One past the last buffer index the view can touch.
    pub fn end(&self) -> usize {
        if self.elem_count() == 0 {
            return self.offset;
        }
        self.index(self.nrows - 1, self.ncols - 1) + 1
    }

    /// Sub-view covering `rows` × `cols` (ranges relative to this view).
    pub fn slice(&self, rows: Range<usize>, cols: Range<usize>) -> Layout {
        Layout {
            nrows: rows.end - rows.start,
            ncols: cols.end - cols.start,
            offset: self.index(rows.start, cols.start),
            ld: self.ld,
        }
    }

    /// Same elements seen as a matrix of a different shape.
    ///
    /// Only valid for contiguous layouts; the caller checks that.
    pub fn reshape(&self, nrows: usize, ncols: usize) -> Layout {
        Layout::new(nrows, ncols, self.offset, nrows)
    }

    /// Iterate the flat buffer indices column by column.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.ncols).flat_map(move |c| {
            let start = self.offset + c * self.ld;
            start..start + self.nrows
        })
    }
}

// SliceSpec: one axis of a `Matrix::slice` call
//
// Rust ranges cover the unit-step cases directly (`..`, `a..b`, `a..`,
// `..b`); a bare `usize` selects one row or column. `.step(k)` exists so that
// strided requests can be expressed and rejected with a proper error rather
// than being silently impossible to write.

/// One axis of a slice request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceSpec {
    start: Option<usize>,
    stop: Option<usize>,
    step: Option<isize>,
}

impl SliceSpec {
    /// The whole axis.
    pub fn full() -> Self {
        SliceSpec {
            start: None,
            stop: None,
            step: None,
        }
    }

    /// Exactly one position.
    pub fn index(i: usize) -> Self {
        // usize::MAX is past the end of any axis, saturating keeps it rejected
        SliceSpec {
            start: Some(i),
            stop: Some(i.saturating_add(1)),
            step: None,
        }
    }

    /// Attach a step to this slice.
    pub fn step(mut self, step: isize) -> Self {
        self.step = Some(step);
        self
    }

    /// Resolve against an axis of length `len`.
    pub fn resolve(&self, len: usize, axis: &str) -> Result<Range<usize>> {
        if let Some(step) = self.step {
            if step != 1 {
                return Err(Error::UnsupportedSlice(format!(
                    "{axis} slice with step {step}, only unit steps are supported"
                )));
            }
        }
        let start = self.start.unwrap_or(0);
        let stop = self.stop.unwrap_or(len);
        if start > stop || stop > len {
            return Err(Error::UnsupportedSlice(format!(
                "{axis} range {start}..{stop} does not fit an axis of length {len}"
            )));
        }
        Ok(start..stop)
    }
}

impl From<RangeFull> for SliceSpec {
    fn from(_: RangeFull) -> Self {
        SliceSpec::full()
    }
}

impl From<Range<usize>> for SliceSpec {
    fn from(r: Range<usize>) -> Self {
        SliceSpec {
            start: Some(r.start),
            stop: Some(r.end),
            step: None,
        }
    }
}

impl From<RangeFrom<usize>> for SliceSpec {
    fn from(r: RangeFrom<usize>) -> Self {
        SliceSpec {
            start: Some(r.start),
            stop: None,
            step: None,
        }
    }
}

impl From<RangeTo<usize>> for SliceSpec {
    fn from(r: RangeTo<usize>) -> Self {
        SliceSpec {
            start: None,
            stop: Some(r.end),
            step: None,
        }
    }
}

impl From<usize> for SliceSpec {
    fn from(i: usize) -> Self {
        SliceSpec::index(i)
    }
}
