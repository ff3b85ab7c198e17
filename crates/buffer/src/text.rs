// Chunk: docs/chunks/text_storage - UTF-16 text storage and coordinates

//! UTF-16 text storage with row-indexed position lookup.
//!
//! `Text` owns a sequence of UTF-16 code units together with a sorted array
//! of row start offsets, giving O(log n) conversion between offsets and
//! (row, column) positions. `TextSlice` is a borrowed view of a sub-range.
//!
//! Clipping enforces CRLF atomicity: a `\r\n` pair is a single logical line
//! boundary, so no position may address the `\n`. Clipping a position that
//! lands between the two units moves it onto the `\r`. A lone `\r` that is
//! not followed by `\n` is ordinary content.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::point::{Point, Range};

pub(crate) const LF: u16 = b'\n' as u16;
pub(crate) const CR: u16 = b'\r' as u16;

/// A valid position together with its code-unit offset in the same text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClipResult {
    pub position: Point,
    pub offset: u32,
}

/// The terminator of a row: nothing (last row), `\n`, or `\r\n`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineEnding {
    None,
    Lf,
    CrLf,
}

impl LineEnding {
    /// The literal code units of this terminator.
    pub fn code_units(self) -> &'static [u16] {
        match self {
            LineEnding::None => &[],
            LineEnding::Lf => &[LF],
            LineEnding::CrLf => &[CR, LF],
        }
    }
}

/// Growable UTF-16 text with O(log n) offset/position conversion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Text {
    content: Vec<u16>,
    /// Offsets where each row starts. `line_offsets[0] == 0` always; every
    /// other entry points just past a `\n`.
    line_offsets: Vec<u32>,
}

impl Default for Text {
    fn default() -> Self {
        Self::new()
    }
}

impl Text {
    /// Creates an empty text.
    pub fn new() -> Self {
        Self {
            content: Vec::new(),
            line_offsets: vec![0],
        }
    }

    /// Creates a text from raw UTF-16 code units.
    pub fn from_units(content: Vec<u16>) -> Self {
        let mut line_offsets = vec![0];
        for (offset, &unit) in content.iter().enumerate() {
            if unit == LF {
                line_offsets.push(offset as u32 + 1);
            }
        }
        Self {
            content,
            line_offsets,
        }
    }

    /// Returns the underlying code units.
    pub fn units(&self) -> &[u16] {
        &self.content
    }

    /// Returns the total number of code units.
    pub fn size(&self) -> u32 {
        self.content.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Returns the position just past the last code unit.
    ///
    /// A trailing `\n` yields a final empty row with column 0.
    pub fn extent(&self) -> Point {
        let last_row_start = *self.line_offsets.last().expect("line_offsets is never empty");
        Point::new(self.line_offsets.len() as u32 - 1, self.size() - last_row_start)
    }

    /// Returns the code unit at a position, or `None` past the end.
    pub fn at(&self, position: Point) -> Option<u16> {
        let offset = self.clip_position(position).offset;
        self.content.get(offset as usize).copied()
    }

    pub(crate) fn first_unit(&self) -> Option<u16> {
        self.content.first().copied()
    }

    pub(crate) fn last_unit(&self) -> Option<u16> {
        self.content.last().copied()
    }

    /// Clips a position to the nearest valid position and returns it with
    /// its offset.
    ///
    /// The row is clamped to the last row and the column to the row's
    /// content length, which excludes the row terminator (`\n` or `\r\n`).
    pub fn clip_position(&self, position: Point) -> ClipResult {
        let last_row = self.line_offsets.len() as u32 - 1;
        let row = position.row.min(last_row);
        let row_start = self.line_offsets[row as usize];
        let row_content_end = if row == last_row {
            self.size()
        } else {
            let newline_offset = self.line_offsets[row as usize + 1] - 1;
            if newline_offset > row_start && self.content[newline_offset as usize - 1] == CR {
                newline_offset - 1
            } else {
                newline_offset
            }
        };
        let column = position.column.min(row_content_end - row_start);
        ClipResult {
            position: Point::new(row, column),
            offset: row_start + column,
        }
    }

    /// Returns the offset of a position, clipping it first.
    pub fn offset_for_position(&self, position: Point) -> u32 {
        self.clip_position(position).offset
    }

    /// Returns the position of an offset.
    pub fn position_for_offset(&self, offset: u32) -> Point {
        self.position_for_offset_from_row(offset, 0)
    }

    /// Returns the position of an offset, starting the row search at
    /// `min_row`.
    ///
    /// `min_row` is a hint: callers that know a lower bound for the row
    /// avoid re-scanning earlier rows. A stale hint falls back to a full
    /// search.
    pub fn position_for_offset_from_row(&self, offset: u32, min_row: u32) -> Point {
        let offset = offset.min(self.size());
        let hint_row = (min_row as usize).min(self.line_offsets.len() - 1);
        let row = if self.line_offsets[hint_row] <= offset {
            hint_row + self.line_offsets[hint_row..].partition_point(|&o| o <= offset) - 1
        } else {
            self.line_offsets.partition_point(|&o| o <= offset) - 1
        };
        let mut column = offset - self.line_offsets[row];
        // An offset addressing the `\n` of a `\r\n` collapses onto the `\r`.
        if column > 0
            && (offset as usize) < self.content.len()
            && self.content[offset as usize] == LF
            && self.content[offset as usize - 1] == CR
        {
            column -= 1;
        }
        Point::new(row as u32, column)
    }

    /// Replaces the range starting at `start` spanning `deleted_extent`
    /// with the contents of `inserted`.
    ///
    /// Row starts are maintained incrementally: entries inside the deleted
    /// range are dropped, entries for inserted newlines are spliced in, and
    /// the tail is shifted by the length delta.
    pub fn splice(&mut self, start: Point, deleted_extent: Point, inserted: TextSlice) {
        let start_offset = self.clip_position(start).offset;
        let end_offset = self.clip_position(start + deleted_extent).offset;
        let deleted_units = end_offset - start_offset;
        let inserted_units = inserted.size();

        self.content.splice(
            start_offset as usize..end_offset as usize,
            inserted.units().iter().copied(),
        );

        let first_affected = self.line_offsets.partition_point(|&o| o <= start_offset);
        let after_deleted = self.line_offsets.partition_point(|&o| o <= end_offset);
        let mut new_starts = Vec::new();
        for (index, &unit) in inserted.units().iter().enumerate() {
            if unit == LF {
                new_starts.push(start_offset + index as u32 + 1);
            }
        }
        let inserted_rows = new_starts.len();
        self.line_offsets.splice(first_affected..after_deleted, new_starts);

        let delta = inserted_units as i64 - deleted_units as i64;
        for offset in &mut self.line_offsets[first_affected + inserted_rows..] {
            *offset = (*offset as i64 + delta) as u32;
        }
    }

    /// Appends the contents of a slice of another text.
    pub fn append(&mut self, slice: TextSlice) {
        let base = self.size();
        self.content.extend_from_slice(slice.units());
        for (index, &unit) in slice.units().iter().enumerate() {
            if unit == LF {
                self.line_offsets.push(base + index as u32 + 1);
            }
        }
    }

    pub fn clear(&mut self) {
        self.content.clear();
        self.line_offsets.clear();
        self.line_offsets.push(0);
    }

    /// Returns a slice covering the whole text.
    pub fn as_slice(&self) -> TextSlice<'_> {
        TextSlice {
            text: self,
            start_position: Point::zero(),
            end_position: self.extent(),
            start_offset: 0,
            end_offset: self.size(),
        }
    }

    /// Returns a slice covering `range`, clipping both endpoints.
    pub fn slice(&self, range: Range) -> TextSlice<'_> {
        self.as_slice().slice(range)
    }
}

impl From<&str> for Text {
    fn from(string: &str) -> Self {
        Text::from_units(string.encode_utf16().collect())
    }
}

impl From<String> for Text {
    fn from(string: String) -> Self {
        Text::from(string.as_str())
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf16_lossy(&self.content))
    }
}

// Only the code units travel on the wire; the row index is rebuilt on
// deserialization.
impl Serialize for Text {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.content.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Text {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<u16>::deserialize(deserializer).map(Text::from_units)
    }
}

/// A read-only view of a contiguous sub-range of a `Text`.
#[derive(Clone, Copy, Debug)]
pub struct TextSlice<'a> {
    text: &'a Text,
    start_position: Point,
    end_position: Point,
    start_offset: u32,
    end_offset: u32,
}

impl<'a> TextSlice<'a> {
    /// The backing text. Used for identity comparison against a known base.
    pub fn text(&self) -> &'a Text {
        self.text
    }

    pub fn units(&self) -> &'a [u16] {
        &self.text.content[self.start_offset as usize..self.end_offset as usize]
    }

    pub fn size(&self) -> u32 {
        self.end_offset - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.start_offset == self.end_offset
    }

    /// The traversal distance from the slice start to its end.
    pub fn extent(&self) -> Point {
        self.end_position - self.start_position
    }

    pub fn front(&self) -> Option<u16> {
        self.units().first().copied()
    }

    pub fn back(&self) -> Option<u16> {
        self.units().last().copied()
    }

    /// Returns a sub-slice covering `range`, expressed relative to this
    /// slice's start. Endpoints are clipped to the slice bounds.
    pub fn slice(&self, range: Range) -> TextSlice<'a> {
        let start = self.clip_relative(range.start);
        let end = self.clip_relative(range.end);
        let end = if end.offset < start.offset { start } else { end };
        TextSlice {
            text: self.text,
            start_position: start.position,
            end_position: end.position,
            start_offset: start.offset,
            end_offset: end.offset,
        }
    }

    /// Returns the sub-slice spanning the first `extent` of this slice.
    pub fn prefix(&self, extent: Point) -> TextSlice<'a> {
        self.slice(Range {
            start: Point::zero(),
            end: extent,
        })
    }

    /// Returns the sub-slice starting `extent` into this slice.
    pub fn suffix(&self, extent: Point) -> TextSlice<'a> {
        self.slice(Range {
            start: extent,
            end: self.extent(),
        })
    }

    /// Returns a prefix of at most `max_units` code units.
    pub fn prefix_units(&self, max_units: u32) -> TextSlice<'a> {
        let end_offset = self.end_offset.min(self.start_offset + max_units);
        let end_position = self
            .text
            .position_for_offset_from_row(end_offset, self.start_position.row);
        TextSlice {
            text: self.text,
            start_position: self.start_position,
            end_position,
            start_offset: self.start_offset,
            end_offset,
        }
    }

    /// Returns the slice-relative position of a slice-relative offset.
    ///
    /// `min_row` is a slice-relative row search hint; see
    /// [`Text::position_for_offset_from_row`].
    pub fn position_for_offset(&self, offset: u32, min_row: u32) -> Point {
        let absolute = self.text.position_for_offset_from_row(
            (self.start_offset + offset).min(self.end_offset),
            self.start_position.row + min_row,
        );
        absolute - self.start_position
    }

    /// Copies the slice into an owned `Text`.
    pub fn to_text(&self) -> Text {
        Text::from_units(self.units().to_vec())
    }

    fn clip_relative(&self, position: Point) -> ClipResult {
        let absolute = self.text.clip_position(self.start_position + position);
        if absolute.offset <= self.start_offset {
            ClipResult {
                position: self.start_position,
                offset: self.start_offset,
            }
        } else if absolute.offset >= self.end_offset {
            ClipResult {
                position: self.end_position,
                offset: self.end_offset,
            }
        } else {
            absolute
        }
    }
}
