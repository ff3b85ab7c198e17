// Chunk: docs/chunks/text_storage - UTF-16 text storage and coordinates

//! Buffer coordinates.
//!
//! A `Point` is a zero-indexed (row, column) pair measured in UTF-16 code
//! units from the start of the row. Points are ordered lexicographically.
//!
//! Point arithmetic follows text traversal rules rather than plain
//! component-wise math: advancing a position by a multi-row delta lands on
//! the delta's column, not the sum of columns.

use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// A position in a text document as (row, column), both 0-indexed.
///
/// Columns count UTF-16 code units, so a character outside the basic
/// multilingual plane occupies two columns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Point {
    pub row: u32,
    pub column: u32,
}

impl Point {
    pub fn new(row: u32, column: u32) -> Self {
        Self { row, column }
    }

    /// The origin position (0, 0).
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.row == 0 && self.column == 0
    }
}

/// Advances `self` by the extent `delta`.
///
/// If `delta` spans rows, the result lands on `delta`'s column of the final
/// row; otherwise the columns accumulate. Saturating: positions clamped to
/// `u32::MAX` act as "past everything" and clip back into range.
impl Add for Point {
    type Output = Point;

    fn add(self, delta: Point) -> Point {
        if delta.row == 0 {
            Point::new(self.row, self.column.saturating_add(delta.column))
        } else {
            Point::new(self.row.saturating_add(delta.row), delta.column)
        }
    }
}

impl AddAssign for Point {
    fn add_assign(&mut self, delta: Point) {
        *self = *self + delta;
    }
}

/// Returns the extent separating `start` from `self`.
///
/// Inverse of `Add`: `start + (self - start) == self`. Requires
/// `start <= self`.
impl Sub for Point {
    type Output = Point;

    fn sub(self, start: Point) -> Point {
        debug_assert!(start <= self);
        if self.row == start.row {
            Point::new(0, self.column - start.column)
        } else {
            Point::new(self.row - start.row, self.column)
        }
    }
}

/// A half-open range of positions, `start <= end`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Point,
    pub end: Point,
}

impl Range {
    pub fn new(start: Point, end: Point) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// The traversal distance from `start` to `end`.
    pub fn extent(&self) -> Point {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}
