// Chunk: docs/chunks/layered_buffer - Layered text buffer with snapshots

//! The layered, snapshot-capable text buffer.
//!
//! A buffer is a chain of layers. The root of the chain (the *base* layer)
//! owns a materialized [`Text`]; every layer above it is a [`Patch`]
//! describing how that layer's content differs from the layer below.
//! Reads translate positions down the chain; edits splice into the top
//! layer's patch.
//!
//! A [`Snapshot`] pins the top and base layers that were current when it
//! was created, so reads against it keep answering from that version while
//! edits continue on newer layers. Dropping a snapshot releases the pins
//! and lets the buffer consolidate adjacent unpinned layers back into one.
//!
//! The buffer is single-threaded. Chunk callbacks receive borrowed slices
//! and must not reenter buffer mutation; this is enforced dynamically by
//! the interior `RefCell`s.

use std::cell::{Cell, RefCell};
use std::fmt::Write as _;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::patch::Patch;
use crate::point::{Point, Range};
use crate::regex::{MatchData, MatchResult, Regex};
use crate::text::{ClipResult, LineEnding, Text, TextSlice, CR, LF};

/// Bounds the code units copied into the search continuation buffer per
/// chunk iteration.
const MAX_CHUNK_SIZE_TO_COPY: u32 = 1024;

/// A failure while encoding or decoding the pending-change stream.
#[derive(Debug, thiserror::Error)]
pub enum ChangesError {
    /// `deserialize_changes` requires a buffer that is still a single base
    /// layer.
    #[error("buffer already has layers above its base")]
    BufferNotPristine,
    #[error("failed to encode changes: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode changes: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// The wire form of a buffer's pending changes: the top layer's geometry
/// plus one combined patch against the base text.
#[derive(Serialize, Deserialize)]
struct PendingChanges {
    size: u32,
    extent: Point,
    patch: Patch,
}

// ==================== Layer ====================

/// One level of edit history: either a materialized text (`text` present,
/// `uses_patch` false) or a patch over the layer below.
///
/// A layer may hold both a text and a live patch after squashing; the text
/// then matches the layer's effective content and the next consolidation
/// drops `uses_patch`.
struct Layer {
    previous: RefCell<Option<Rc<Layer>>>,
    text: RefCell<Option<Text>>,
    patch: RefCell<Patch>,
    uses_patch: Cell<bool>,
    extent: Cell<Point>,
    size: Cell<u32>,
    /// Live snapshots pinning this layer, as their top or their base.
    /// While non-zero the layer must not be squashed or dropped.
    snapshot_count: Cell<u32>,
}

fn previous_column(position: Point) -> Point {
    debug_assert!(position.column > 0);
    Point::new(position.row, position.column - 1)
}

impl Layer {
    fn with_text(text: Text) -> Self {
        Self {
            previous: RefCell::new(None),
            extent: Cell::new(text.extent()),
            size: Cell::new(text.size()),
            text: RefCell::new(Some(text)),
            patch: RefCell::new(Patch::new()),
            uses_patch: Cell::new(false),
            snapshot_count: Cell::new(0),
        }
    }

    fn on_top_of(previous: Rc<Layer>) -> Self {
        Self {
            extent: Cell::new(previous.extent()),
            size: Cell::new(previous.size()),
            previous: RefCell::new(Some(previous)),
            text: RefCell::new(None),
            patch: RefCell::new(Patch::new()),
            uses_patch: Cell::new(true),
            snapshot_count: Cell::new(0),
        }
    }

    fn extent(&self) -> Point {
        self.extent.get()
    }

    fn size(&self) -> u32 {
        self.size.get()
    }

    fn previous_layer(&self) -> Rc<Layer> {
        self.previous
            .borrow()
            .clone()
            .expect("a patch layer always has a layer below it")
    }

    fn is_above_layer(&self, other: &Rc<Layer>) -> bool {
        let mut layer = self.previous.borrow().clone();
        while let Some(current) = layer {
            if Rc::ptr_eq(&current, other) {
                return true;
            }
            layer = current.previous.borrow().clone();
        }
        false
    }

    // ==================== Position translation ====================

    fn character_at(&self, position: Point) -> Option<u16> {
        if !self.uses_patch.get() {
            return self.text.borrow().as_ref()?.at(position);
        }

        let patch = self.patch.borrow();
        let previous = self.previous_layer();
        match patch.change_starting_before_new_position(position) {
            None => previous.character_at(position),
            Some(change) if position < change.new_end => {
                change.new_text.at(position - change.new_start)
            }
            Some(change) => {
                previous.character_at(change.old_end + (position - change.new_end))
            }
        }
    }

    fn clip_position(&self, position: Point) -> ClipResult {
        // Clamp the row up front; translating an out-of-range row through
        // the patch would otherwise push the recursion out of bounds.
        let position = if position.row > self.extent().row {
            Point::new(self.extent().row, position.column)
        } else {
            position
        };

        if !self.uses_patch.get() {
            return self
                .text
                .borrow()
                .as_ref()
                .expect("a layer that does not use its patch holds a text")
                .clip_position(position);
        }

        let patch = self.patch.borrow();
        let previous = self.previous_layer();
        let change = match patch.change_starting_before_new_position(position) {
            None => return previous.clip_position(position),
            Some(change) => change,
        };

        let change_base_offset = previous.clip_position(change.old_start).offset;
        let change_current_offset = change_base_offset + change.preceding_new_text_size
            - change.preceding_old_text_size;

        if position < change.new_end {
            let within_change = change.new_text.clip_position(position - change.new_start);

            // The patch may have stitched a CRLF across its left boundary:
            // the inserted text starts with the LF while the CR lives on
            // the layer below. The only valid position is on the CR.
            if within_change.offset == 0 && change.old_start.column > 0 {
                if change.new_text.first_unit() == Some(LF)
                    && previous.character_at(previous_column(change.old_start)) == Some(CR)
                {
                    return ClipResult {
                        position: previous_column(change.new_start),
                        offset: change_current_offset - 1,
                    };
                }
            }

            ClipResult {
                position: change.new_start + within_change.position,
                offset: change_current_offset + within_change.offset,
            }
        } else {
            let base_location =
                previous.clip_position(change.old_end + (position - change.new_end));
            let distance_past_change = ClipResult {
                position: base_location.position - change.old_end,
                offset: base_location.offset - (change_base_offset + change.old_text_size),
            };

            // Same stitching on the right boundary: the change ends with a
            // CR (or exposes one just before its old range) and the layer
            // below continues with the LF.
            if distance_past_change.offset == 0 && base_location.offset < previous.size() {
                let previous_character = if change.new_text.size() > 0 {
                    change.new_text.last_unit()
                } else if change.old_start.column > 0 {
                    previous.character_at(previous_column(change.old_start))
                } else {
                    None
                };

                if previous_character == Some(CR)
                    && previous.character_at(base_location.position) == Some(LF)
                {
                    return ClipResult {
                        position: previous_column(change.new_end),
                        offset: change_current_offset + change.new_text.size() - 1,
                    };
                }
            }

            ClipResult {
                position: change.new_end + distance_past_change.position,
                offset: change_current_offset
                    + change.new_text.size()
                    + distance_past_change.offset,
            }
        }
    }

    fn position_for_offset(&self, offset: u32) -> Point {
        if let Some(text) = self.text.borrow().as_ref() {
            return text.position_for_offset(offset);
        }

        let patch = self.patch.borrow();
        let previous = self.previous_layer();
        patch.new_position_for_new_offset(
            offset,
            |old_position| previous.clip_position(old_position).offset,
            |old_offset| previous.position_for_offset(old_offset),
        )
    }

    // ==================== Chunk iteration ====================

    /// Walks the effective text of `[start, end)` as a sequence of slices,
    /// interleaving this layer's patched regions with the layer below.
    /// The callback returns true to stop; the stop propagates out.
    fn for_each_chunk_in_range<F>(&self, start: Point, end: Point, mut callback: F) -> bool
    where
        F: FnMut(TextSlice) -> bool,
    {
        self.each_chunk_in_range(start, end, &mut callback)
    }

    fn each_chunk_in_range(
        &self,
        start: Point,
        end: Point,
        callback: &mut dyn FnMut(TextSlice) -> bool,
    ) -> bool {
        let goal_position = self.clip_position(end).position;
        let mut current_position = self.clip_position(start).position;
        // Clipping both endpoints can invert a range that straddles the
        // end of the text (the row clamp is not monotone); such a range is
        // empty.
        if current_position > goal_position {
            current_position = goal_position;
        }

        if !self.uses_patch.get() {
            let text = self.text.borrow();
            let text = text
                .as_ref()
                .expect("a layer that does not use its patch holds a text");
            return callback(text.slice(Range {
                start: current_position,
                end: goal_position,
            }));
        }

        let patch = self.patch.borrow();
        let previous = self.previous_layer();

        let mut base_position;
        match patch.change_starting_before_new_position(current_position) {
            None => base_position = current_position,
            Some(change) if current_position < change.new_end => {
                let slice = change.new_text.slice(Range {
                    start: current_position - change.new_start,
                    end: Point::min(change.new_end, goal_position) - change.new_start,
                });
                if callback(slice) {
                    return true;
                }
                base_position = change.old_end;
                current_position = change.new_end;
            }
            Some(change) => {
                base_position = change.old_end + (current_position - change.new_end);
            }
        }

        for change in patch.changes_in_new_range(current_position, goal_position) {
            if base_position < change.old_start {
                if previous.each_chunk_in_range(base_position, change.old_start, callback) {
                    return true;
                }
            }

            let slice = change
                .new_text
                .as_slice()
                .prefix(Point::min(change.new_end, goal_position) - change.new_start);
            if callback(slice) {
                return true;
            }

            base_position = change.old_end;
            current_position = change.new_end;
        }

        if current_position < goal_position {
            return previous.each_chunk_in_range(
                base_position,
                base_position + (goal_position - current_position),
                callback,
            );
        }

        false
    }

    fn text_in_range(&self, range: Range) -> Text {
        let mut result = Text::new();
        self.for_each_chunk_in_range(range.start, range.end, |slice| {
            result.append(slice);
            false
        });
        result
    }

    fn chunks_in_range(&self, range: Range) -> Vec<Text> {
        let mut result = Vec::new();
        self.for_each_chunk_in_range(range.start, range.end, |slice| {
            result.push(slice.to_text());
            false
        });
        result
    }

    // ==================== Search ====================

    /// Runs `regex` incrementally over the chunk stream of `range`,
    /// invoking `callback` for every match until it returns true.
    fn scan_in_range(&self, regex: &Regex, range: Range, mut callback: impl FnMut(Range) -> bool) {
        let mut match_data = MatchData::new(regex);
        let range = Range {
            start: self.clip_position(range.start).position,
            end: self.clip_position(range.end).position,
        };

        let mut minimum_match_row: u32 = 0;
        let mut result: Option<Range> = None;
        let mut chunk_continuation = Text::new();
        let mut chunk_start_position = range.start;
        let mut last_search_end_position = range.start;
        let mut slice_to_search_start_position = range.start;

        self.for_each_chunk_in_range(range.start, range.end, |chunk| {
            let chunk_end_position = chunk_start_position + chunk.extent();
            while last_search_end_position < chunk_end_position {
                let remaining_chunk =
                    chunk.suffix(last_search_end_position - chunk_start_position);

                // A completed match ending in a CR is held back until the
                // next input is visible: if it begins with the LF of a
                // CRLF, the match's end point collapses onto the CR.
                if let Some(mut pending) = result.take() {
                    if remaining_chunk.front() == Some(LF) {
                        let carriage_return = Text::from("\r");
                        chunk_continuation.splice(
                            Point::zero(),
                            Point::zero(),
                            carriage_return.as_slice(),
                        );
                        slice_to_search_start_position.column -= 1;
                        pending.end.column -= 1;
                    }
                    if callback(pending) {
                        return true;
                    }
                }

                let search_continuation = !chunk_continuation.is_empty();
                if search_continuation {
                    chunk_continuation
                        .append(remaining_chunk.prefix_units(MAX_CHUNK_SIZE_TO_COPY));
                }
                let slice_to_search = if search_continuation {
                    chunk_continuation.as_slice()
                } else {
                    remaining_chunk
                };

                let slice_end_position =
                    slice_to_search_start_position + slice_to_search.extent();
                let match_result = regex.match_units(
                    slice_to_search.units(),
                    &mut match_data,
                    slice_end_position == range.end,
                );

                match match_result {
                    MatchResult::Error => {
                        chunk_continuation.clear();
                        return true;
                    }

                    MatchResult::None => {
                        last_search_end_position = slice_end_position;
                        slice_to_search_start_position = slice_end_position;
                        minimum_match_row = slice_to_search_start_position.row;
                        chunk_continuation.clear();
                    }

                    MatchResult::Partial { start_offset } => {
                        last_search_end_position = slice_end_position;
                        if !search_continuation || start_offset > 0 {
                            let partial_match_position = slice_to_search.position_for_offset(
                                start_offset,
                                minimum_match_row
                                    .saturating_sub(slice_to_search_start_position.row),
                            );
                            let tail =
                                slice_to_search.suffix(partial_match_position).to_text();
                            slice_to_search_start_position =
                                slice_to_search_start_position + partial_match_position;
                            minimum_match_row = slice_to_search_start_position.row;
                            chunk_continuation = tail;
                        }
                    }

                    MatchResult::Full {
                        start_offset,
                        end_offset,
                    } => {
                        let row_hint = minimum_match_row
                            .saturating_sub(slice_to_search_start_position.row);
                        let match_start_position =
                            slice_to_search.position_for_offset(start_offset, row_hint);
                        let match_end_position =
                            slice_to_search.position_for_offset(end_offset, row_hint);
                        let matched = Range {
                            start: slice_to_search_start_position + match_start_position,
                            end: slice_to_search_start_position + match_end_position,
                        };
                        let ended_at_cr = end_offset == slice_to_search.size()
                            && slice_to_search.back() == Some(CR);

                        minimum_match_row = matched.end.row;
                        last_search_end_position =
                            slice_to_search_start_position + match_end_position;
                        slice_to_search_start_position = last_search_end_position;
                        chunk_continuation.clear();

                        // A match can end inside territory that only the
                        // (now cleared) continuation covered; resume no
                        // earlier than the current chunk.
                        if last_search_end_position < chunk_start_position {
                            last_search_end_position = chunk_start_position;
                            slice_to_search_start_position = chunk_start_position;
                        }

                        if ended_at_cr {
                            result = Some(matched);
                            continue;
                        }
                        if callback(matched) {
                            return true;
                        }
                    }
                }
            }

            chunk_start_position = chunk_end_position;
            false
        });

        if let Some(pending) = result {
            callback(pending);
        } else {
            // A pattern that accepts empty input still matches an empty
            // range once, reported at the origin.
            let probe = regex.match_units(&[], &mut match_data, true);
            if matches!(
                probe,
                MatchResult::Partial { .. } | MatchResult::Full { .. }
            ) {
                callback(Range {
                    start: Point::zero(),
                    end: Point::zero(),
                });
            }
        }
    }

    fn search_in_range(&self, regex: &Regex, range: Range) -> Option<Range> {
        let mut result = None;
        self.scan_in_range(regex, range, |match_range| {
            result = Some(match_range);
            true
        });
        result
    }

    fn search_all_in_range(&self, regex: &Regex, range: Range) -> Vec<Range> {
        let mut result = Vec::new();
        self.scan_in_range(regex, range, |match_range| {
            result.push(match_range);
            false
        });
        result
    }

    // ==================== Comparison ====================

    /// True unless this layer's effective text equals `base`'s text.
    fn is_modified_relative_to(&self, base: &Layer) -> bool {
        if self.size() != base.size() {
            return true;
        }

        let base_text_ref = base.text.borrow();
        let base_text = match base_text_ref.as_ref() {
            Some(text) => text,
            None => return true,
        };

        let mut result = false;
        let mut start_offset = 0usize;
        self.for_each_chunk_in_range(Point::zero(), self.extent(), |chunk| {
            let units = chunk.units();
            // A chunk backed by the base text itself needs no comparison.
            if std::ptr::eq(chunk.text(), base_text) {
                start_offset += units.len();
                return false;
            }
            match base_text.units().get(start_offset..start_offset + units.len()) {
                Some(expected) if expected == units => {
                    start_offset += units.len();
                    false
                }
                _ => {
                    result = true;
                    true
                }
            }
        });
        result
    }
}

// ==================== Buffer ====================

struct BufferState {
    top: Rc<Layer>,
    base: Rc<Layer>,
}

/// An editable text document with cheap long-lived snapshots.
pub struct TextBuffer {
    state: Rc<RefCell<BufferState>>,
}

impl TextBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::from_text(Text::new())
    }

    /// Creates a buffer whose base layer owns `text`.
    pub fn from_text(text: Text) -> Self {
        let base = Rc::new(Layer::with_text(text));
        Self {
            state: Rc::new(RefCell::new(BufferState {
                top: base.clone(),
                base,
            })),
        }
    }

    // ==================== Accessors ====================

    /// Returns a copy of the base layer's text.
    pub fn base_text(&self) -> Text {
        let state = self.state.borrow();
        let text = state.base.text.borrow();
        text.as_ref()
            .expect("the base layer always holds a text")
            .clone()
    }

    pub fn extent(&self) -> Point {
        self.state.borrow().top.extent()
    }

    /// Total size in UTF-16 code units.
    pub fn size(&self) -> u32 {
        self.state.borrow().top.size()
    }

    /// Returns the length of `row` in code units, excluding its
    /// terminator, or `None` past the last row.
    pub fn line_length_for_row(&self, row: u32) -> Option<u32> {
        if row > self.extent().row {
            return None;
        }
        let state = self.state.borrow();
        Some(
            state
                .top
                .clip_position(Point::new(row, u32::MAX))
                .position
                .column,
        )
    }

    /// Returns the terminator of `row`, or `None` past the last row. The
    /// last row reports `LineEnding::None`.
    pub fn line_ending_for_row(&self, row: u32) -> Option<LineEnding> {
        if row > self.extent().row {
            return None;
        }
        let state = self.state.borrow();
        let mut result = LineEnding::None;
        state.top.for_each_chunk_in_range(
            Point::new(row, u32::MAX),
            Point::new(row + 1, 0),
            |slice| match slice.front() {
                Some(unit) => {
                    result = if unit == CR {
                        LineEnding::CrLf
                    } else {
                        LineEnding::Lf
                    };
                    true
                }
                None => false,
            },
        );
        Some(result)
    }

    /// Returns the content of `row` without its terminator, or `None`
    /// past the last row.
    pub fn line_for_row(&self, row: u32) -> Option<Text> {
        if row > self.extent().row {
            return None;
        }
        Some(self.text_in_range(Range {
            start: Point::new(row, 0),
            end: Point::new(row, u32::MAX),
        }))
    }

    /// Calls `callback` with the code units of `row`, avoiding a copy when
    /// the row is a single chunk. Returns `None` past the last row.
    pub fn with_line_for_row<R>(&self, row: u32, callback: impl FnOnce(&[u16]) -> R) -> Option<R> {
        if row > self.extent().row {
            return None;
        }
        let state = self.state.borrow();
        let line_end = state
            .top
            .clip_position(Point::new(row, u32::MAX))
            .position;

        let mut callback = Some(callback);
        let mut result = None;
        let mut accumulated: Vec<u16> = Vec::new();
        let mut slice_count = 0;
        let mut column = 0;
        state
            .top
            .for_each_chunk_in_range(Point::new(row, 0), line_end, |slice| {
                slice_count += 1;
                column += slice.size();
                if slice_count == 1 && column == line_end.column {
                    let callback = callback.take().expect("the fast path runs once");
                    result = Some(callback(slice.units()));
                    true
                } else {
                    accumulated.extend_from_slice(slice.units());
                    false
                }
            });

        match result {
            Some(value) => Some(value),
            None => {
                let callback = callback.take().expect("the fast path did not run");
                Some(callback(&accumulated))
            }
        }
    }

    /// Clips `position` to the nearest valid position.
    pub fn clip_position(&self, position: Point) -> ClipResult {
        self.state.borrow().top.clip_position(position)
    }

    pub fn position_for_offset(&self, offset: u32) -> Point {
        self.state.borrow().top.position_for_offset(offset)
    }

    /// Returns the entire document.
    pub fn text(&self) -> Text {
        let state = self.state.borrow();
        let extent = state.top.extent();
        state.top.text_in_range(Range {
            start: Point::zero(),
            end: extent,
        })
    }

    pub fn text_in_range(&self, range: Range) -> Text {
        self.state.borrow().top.text_in_range(range)
    }

    /// Returns the document's chunks as owned copies.
    pub fn chunks(&self) -> Vec<Text> {
        let state = self.state.borrow();
        let extent = state.top.extent();
        state.top.chunks_in_range(Range {
            start: Point::zero(),
            end: extent,
        })
    }

    // ==================== Mutation ====================

    /// Replaces the entire document.
    pub fn set_text(&mut self, new_text: impl Into<Text>) {
        let extent = self.extent();
        self.set_text_in_range(
            Range {
                start: Point::zero(),
                end: extent,
            },
            new_text,
        );
    }

    /// Replaces `old_range` (clipped) with `new_text`.
    ///
    /// If the top layer is frozen (it is the base, or a snapshot pins it),
    /// a new patch layer is pushed first so pinned layers stay immutable.
    pub fn set_text_in_range(&mut self, old_range: Range, new_text: impl Into<Text>) {
        let new_text = new_text.into();

        let top = {
            let mut state = self.state.borrow_mut();
            if Rc::ptr_eq(&state.top, &state.base) || state.top.snapshot_count.get() > 0 {
                log::trace!("pushing a patch layer above the frozen top layer");
                state.top = Rc::new(Layer::on_top_of(state.top.clone()));
            }
            state.top.clone()
        };

        let start = top.clip_position(old_range.start);
        let end = top.clip_position(old_range.end);
        let deleted_extent = end.position - start.position;
        let inserted_extent = new_text.extent();
        let inserted_size = new_text.size();
        let new_range_end = start.position + inserted_extent;
        let deleted_text_size = end.offset - start.offset;

        top.extent
            .set(new_range_end + (top.extent.get() - end.position));
        top.size
            .set(top.size.get() + inserted_size - deleted_text_size);
        top.patch.borrow_mut().splice(
            start.position,
            deleted_extent,
            inserted_extent,
            None,
            new_text,
            deleted_text_size,
        );

        // A replacement that reproduces the text below it exactly is
        // erased, so pristine buffers stay pristine.
        let collapse = {
            let patch = top.patch.borrow();
            match patch.change_starting_before_new_position(start.position) {
                Some(change) if change.old_text_size == change.new_text.size() => {
                    let previous = top.previous_layer();
                    let mut offset = 0usize;
                    let mut is_noop = true;
                    previous.for_each_chunk_in_range(
                        change.old_start,
                        change.old_end,
                        |chunk| {
                            let units = chunk.units();
                            match change
                                .new_text
                                .units()
                                .get(offset..offset + units.len())
                            {
                                Some(expected) if expected == units => {
                                    offset += units.len();
                                    false
                                }
                                _ => {
                                    is_noop = false;
                                    true
                                }
                            }
                        },
                    );
                    is_noop.then_some(change.old_start)
                }
                _ => None,
            }
        };
        if let Some(old_start) = collapse {
            top.patch
                .borrow_mut()
                .splice_old(old_start, Point::zero(), Point::zero());
        }

        // An unpinned top layer with an empty patch carries no
        // information; pop it so no-op edits leave the stack unchanged.
        if top.patch.borrow().is_empty()
            && top.text.borrow().is_none()
            && top.snapshot_count.get() == 0
        {
            if let Some(previous) = top.previous.borrow().clone() {
                self.state.borrow_mut().top = previous;
            }
        }
    }

    /// Replaces the buffer's base text, collapsing history when nothing
    /// pins it.
    pub fn reset(&mut self, new_base_text: impl Into<Text>) {
        let new_base_text = new_base_text.into();
        let in_place = {
            let state = self.state.borrow();
            state.top.previous.borrow().is_none() && state.top.snapshot_count.get() == 0
        };
        if in_place {
            let state = self.state.borrow();
            state.top.extent.set(new_base_text.extent());
            state.top.size.set(new_base_text.size());
            *state.top.text.borrow_mut() = Some(new_base_text);
            state.top.patch.borrow_mut().clear();
            state.top.uses_patch.set(false);
        } else {
            self.set_text(new_base_text);
            self.flush_changes();
        }
    }

    /// Materializes the top layer's text, promotes it to base, and
    /// consolidates the layer stack.
    pub fn flush_changes(&mut self) {
        let needs_flush = {
            let state = self.state.borrow();
            let is_none = state.top.text.borrow().is_none();
            is_none
        };
        if needs_flush {
            log::trace!("flushing pending changes into a materialized text");
            let full_text = self.text();
            {
                let mut state = self.state.borrow_mut();
                *state.top.text.borrow_mut() = Some(full_text);
                state.base = state.top.clone();
            }
            consolidate_layers(&self.state);
        }
    }

    // ==================== Search ====================

    /// Returns the first match of `regex`, if any.
    pub fn search(&self, regex: &Regex) -> Option<Range> {
        let state = self.state.borrow();
        let extent = state.top.extent();
        state.top.search_in_range(
            regex,
            Range {
                start: Point::zero(),
                end: extent,
            },
        )
    }

    /// Returns every match of `regex` in order.
    pub fn search_all(&self, regex: &Regex) -> Vec<Range> {
        let state = self.state.borrow();
        let extent = state.top.extent();
        state.top.search_all_in_range(
            regex,
            Range {
                start: Point::zero(),
                end: extent,
            },
        )
    }

    // ==================== Snapshots ====================

    /// Pins the current top and base layers and returns a read-only view
    /// of the buffer as of now.
    pub fn create_snapshot(&self) -> Snapshot {
        let state = self.state.borrow();
        state
            .top
            .snapshot_count
            .set(state.top.snapshot_count.get() + 1);
        state
            .base
            .snapshot_count
            .set(state.base.snapshot_count.get() + 1);
        Snapshot {
            state: self.state.clone(),
            layer: state.top.clone(),
            base_layer: state.base.clone(),
        }
    }

    /// True unless the document equals the base layer's text.
    pub fn is_modified(&self) -> bool {
        let state = self.state.borrow();
        state.top.is_modified_relative_to(&state.base)
    }

    /// True unless the document equals `snapshot`'s base text.
    pub fn is_modified_since(&self, snapshot: &Snapshot) -> bool {
        let state = self.state.borrow();
        state.top.is_modified_relative_to(&snapshot.base_layer)
    }

    // ==================== Introspection ====================

    /// The number of layers in the chain, including the root.
    pub fn layer_count(&self) -> usize {
        let state = self.state.borrow();
        let mut count = 1;
        let mut layer = state.top.previous.borrow().clone();
        while let Some(current) = layer {
            count += 1;
            layer = current.previous.borrow().clone();
        }
        count
    }

    /// Renders the layer stack as a Graphviz digraph, for debugging.
    pub fn get_dot_graph(&self) -> String {
        let state = self.state.borrow();
        let mut layers = Vec::new();
        let mut layer = Some(state.top.clone());
        while let Some(current) = layer {
            layers.push(current.clone());
            layer = current.previous.borrow().clone();
        }

        let mut result = String::from("digraph buffer {\n");
        for (index, layer) in layers.iter().rev().enumerate() {
            let mut flags = format!("snapshot count {}", layer.snapshot_count.get());
            if Rc::ptr_eq(layer, &state.base) {
                flags.push_str(", base");
            }
            if layer.uses_patch.get() {
                flags.push_str(", uses_patch");
            }
            let _ = writeln!(
                result,
                "  layer_{index} [shape=box, label=\"layer {index} ({flags}), {} changes\"]",
                layer.patch.borrow().change_count()
            );
            if let Some(text) = layer.text.borrow().as_ref() {
                let _ = writeln!(
                    result,
                    "  layer_{index}_text [label=\"text: {:?}\"]",
                    text.to_string()
                );
                let _ = writeln!(result, "  layer_{index} -> layer_{index}_text");
            }
            if index > 0 {
                let _ = writeln!(result, "  layer_{index} -> layer_{}", index - 1);
            }
        }
        result.push_str("}\n");
        result
    }

    // ==================== Change streams ====================

    /// Encodes the pending changes (everything above the base layer) as a
    /// byte stream.
    pub fn serialize_changes(&self) -> Result<Vec<u8>, ChangesError> {
        let state = self.state.borrow();
        let patch = compose_patches_above(&state.top, &state.base);
        let pending = PendingChanges {
            size: state.top.size(),
            extent: state.top.extent(),
            patch,
        };
        Ok(bincode::serde::encode_to_vec(
            &pending,
            bincode::config::standard(),
        )?)
    }

    /// Restores pending changes onto a pristine single-layer buffer.
    pub fn deserialize_changes(&mut self, bytes: &[u8]) -> Result<(), ChangesError> {
        let mut state = self.state.borrow_mut();
        let pristine =
            Rc::ptr_eq(&state.top, &state.base) && state.base.previous.borrow().is_none();
        if !pristine {
            return Err(ChangesError::BufferNotPristine);
        }

        let (pending, _): (PendingChanges, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        let layer = Layer::on_top_of(state.top.clone());
        layer.size.set(pending.size);
        layer.extent.set(pending.extent);
        *layer.patch.borrow_mut() = pending.patch;
        state.top = Rc::new(layer);
        log::trace!("restored pending changes above the base layer");
        Ok(())
    }

    /// Builds a patch that maps the current document back to `snapshot`'s
    /// base text. Each change's `old_text` is what the forward edits
    /// inserted and its `new_text` is the base content they replaced;
    /// applying the changes to the current text in reverse order restores
    /// the snapshot's base.
    pub fn get_inverted_changes(&self, snapshot: &Snapshot) -> Patch {
        let state = self.state.borrow();
        let combination = compose_patches_above(&state.top, &snapshot.base_layer);

        let base_text_ref = snapshot.base_layer.text.borrow();
        let base_text = base_text_ref
            .as_ref()
            .expect("a snapshot's base layer always holds a text");
        let base = base_text.as_slice();

        let mut result = Patch::new();
        for change in combination.changes() {
            result.splice(
                change.old_start,
                change.new_end - change.new_start,
                change.old_end - change.old_start,
                Some(change.new_text.clone()),
                base.slice(Range {
                    start: change.old_start,
                    end: change.old_end,
                })
                .to_text(),
                change.new_text.size(),
            );
        }
        result
    }
}

impl Default for TextBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TextBuffer {
    fn from(text: &str) -> Self {
        Self::from_text(Text::from(text))
    }
}

/// Composes the patches of every layer strictly above `bottom`, ordered
/// bottom-to-top. Empty when `top` is `bottom`.
fn compose_patches_above(top: &Rc<Layer>, bottom: &Rc<Layer>) -> Patch {
    let mut layers = Vec::new();
    let mut layer = top.clone();
    while !Rc::ptr_eq(&layer, bottom) {
        layers.push(layer.clone());
        let previous = layer.previous_layer();
        layer = previous;
    }
    match layers.last() {
        None => Patch::new(),
        Some(lowest) => {
            let mut composed = lowest.patch.borrow().clone();
            for layer in layers[..layers.len() - 1].iter().rev() {
                composed.combine(&layer.patch.borrow());
            }
            composed
        }
    }
}

// ==================== Snapshot ====================

/// A read-only view of a buffer at the moment it was created.
///
/// The snapshot pins its top and base layers; the buffer never mutates,
/// squashes, or drops a pinned layer. Dropping the snapshot releases the
/// pins and consolidates the layer stack.
pub struct Snapshot {
    state: Rc<RefCell<BufferState>>,
    layer: Rc<Layer>,
    base_layer: Rc<Layer>,
}

impl Snapshot {
    pub fn size(&self) -> u32 {
        self.layer.size()
    }

    pub fn extent(&self) -> Point {
        self.layer.extent()
    }

    /// Returns the length of `row` in code units, excluding its
    /// terminator, or `None` past the last row.
    pub fn line_length_for_row(&self, row: u32) -> Option<u32> {
        if row > self.extent().row {
            return None;
        }
        Some(
            self.layer
                .clip_position(Point::new(row, u32::MAX))
                .position
                .column,
        )
    }

    pub fn text(&self) -> Text {
        self.layer.text_in_range(Range {
            start: Point::zero(),
            end: self.extent(),
        })
    }

    pub fn text_in_range(&self, range: Range) -> Text {
        self.layer.text_in_range(range)
    }

    pub fn chunks(&self) -> Vec<Text> {
        self.layer.chunks_in_range(Range {
            start: Point::zero(),
            end: self.extent(),
        })
    }

    pub fn chunks_in_range(&self, range: Range) -> Vec<Text> {
        self.layer.chunks_in_range(range)
    }

    /// Returns the first match of `regex` in this snapshot's content.
    pub fn search(&self, regex: &Regex) -> Option<Range> {
        self.layer.search_in_range(
            regex,
            Range {
                start: Point::zero(),
                end: self.extent(),
            },
        )
    }

    /// Returns a copy of this snapshot's base text.
    pub fn base_text(&self) -> Text {
        self.base_layer
            .text
            .borrow()
            .as_ref()
            .expect("a snapshot's base layer always holds a text")
            .clone()
    }

    /// Materializes this snapshot's layer as a full text so reads against
    /// it stop traversing older layers; promotes it to the buffer's base
    /// when it is newer than the current base.
    pub fn flush_preceding_changes(&self) {
        if self.layer.text.borrow().is_some() {
            return;
        }
        let text = self.text();
        *self.layer.text.borrow_mut() = Some(text);
        {
            let mut state = self.state.borrow_mut();
            if self.layer.is_above_layer(&state.base) {
                state.base = self.layer.clone();
            }
        }
        consolidate_layers(&self.state);
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        assert!(
            self.layer.snapshot_count.get() > 0 && self.base_layer.snapshot_count.get() > 0,
            "snapshot count underflow"
        );
        self.layer
            .snapshot_count
            .set(self.layer.snapshot_count.get() - 1);
        self.base_layer
            .snapshot_count
            .set(self.base_layer.snapshot_count.get() - 1);
        if self.layer.snapshot_count.get() == 0 || self.base_layer.snapshot_count.get() == 0 {
            consolidate_layers(&self.state);
        }
    }
}

// ==================== Layer lifecycle ====================

/// Walks the chain from the top, squashing runs of adjacent unpinned
/// layers into their topmost member. A pinned layer interrupts the run, as
/// does anything a pinned layer transitively reads through.
fn consolidate_layers(state_cell: &RefCell<BufferState>) {
    let (top, mut base) = {
        let state = state_cell.borrow();
        (state.top.clone(), state.base.clone())
    };

    let mut layer = Some(top);
    let mut mutable_layers: Vec<Rc<Layer>> = Vec::new();
    let mut needed_by_layer_above = false;
    while let Some(current) = layer {
        if needed_by_layer_above || current.snapshot_count.get() > 0 {
            squash_layers(&mutable_layers, &mut base);
            mutable_layers.clear();
            needed_by_layer_above = true;
        } else {
            // A materialized layer no longer needs to read through its
            // patch; it is a self-contained base candidate.
            if current.text.borrow().is_some() {
                current.uses_patch.set(false);
            }
            mutable_layers.push(current.clone());
        }
        if !current.uses_patch.get() {
            needed_by_layer_above = false;
        }
        layer = current.previous.borrow().clone();
    }
    squash_layers(&mutable_layers, &mut base);

    state_cell.borrow_mut().base = base;
}

/// Collapses a run of adjacent unpinned layers (top-to-bottom order) into
/// `layers[0]`, which keeps its identity for anything still pointing at
/// it. If the run swallows the base layer, the representative becomes the
/// new base.
fn squash_layers(layers: &[Rc<Layer>], base: &mut Rc<Layer>) {
    if layers.len() < 2 {
        return;
    }
    log::trace!("squashing {} layers", layers.len());

    // Fold the patches of the layers above the topmost materialized text
    // into that text.
    let mut text: Option<Text> = None;
    let mut text_index = None;
    for (index, layer) in layers.iter().enumerate() {
        if layer.text.borrow().is_some() {
            text = layer.text.borrow_mut().take();
            text_index = Some(index);
            break;
        }
    }
    if let (Some(text), Some(text_index)) = (text.as_mut(), text_index) {
        for layer in layers[..text_index].iter().rev() {
            let patch = layer.patch.borrow();
            for change in patch.changes() {
                text.splice(
                    change.new_start,
                    change.old_end - change.old_start,
                    change.new_text.as_slice(),
                );
            }
        }
    }

    // Combine the run's patches bottom-to-top, unless the run bottoms out
    // at the root, where the merged text alone is authoritative.
    let previous = layers
        .last()
        .expect("the run has at least two layers")
        .previous
        .borrow()
        .clone();
    let patch = match &previous {
        Some(_) => {
            let mut patch = layers[layers.len() - 1].patch.take();
            for layer in layers[..layers.len() - 1].iter().rev() {
                patch.combine(&layer.patch.borrow());
            }
            patch
        }
        None => {
            debug_assert!(text.is_some(), "the root run must produce a text");
            Patch::new()
        }
    };

    let swallowed_base = layers[1..].iter().any(|layer| Rc::ptr_eq(layer, base));

    let target = &layers[0];
    *target.previous.borrow_mut() = previous;
    *target.text.borrow_mut() = text;
    *target.patch.borrow_mut() = patch;

    if swallowed_base {
        debug_assert!(target.text.borrow().is_some());
        target.uses_patch.set(false);
        *base = target.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(buffer: &TextBuffer) -> String {
        buffer.text().to_string()
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = TextBuffer::new();
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.extent(), Point::zero());
        assert_eq!(text_of(&buffer), "");
        assert_eq!(buffer.layer_count(), 1);
        assert!(!buffer.is_modified());
    }

    #[test]
    fn test_first_edit_pushes_a_layer() {
        let mut buffer = TextBuffer::from("abc");
        buffer.set_text_in_range(
            Range {
                start: Point::new(0, 1),
                end: Point::new(0, 2),
            },
            "X",
        );
        assert_eq!(text_of(&buffer), "aXc");
        assert_eq!(buffer.layer_count(), 2);

        // Later edits reuse the unpinned top layer.
        buffer.set_text_in_range(
            Range {
                start: Point::new(0, 2),
                end: Point::new(0, 3),
            },
            "Y",
        );
        assert_eq!(text_of(&buffer), "aXY");
        assert_eq!(buffer.layer_count(), 2);
    }

    #[test]
    fn test_noop_edit_keeps_buffer_pristine() {
        let mut buffer = TextBuffer::from("hello");
        buffer.set_text_in_range(
            Range {
                start: Point::new(0, 1),
                end: Point::new(0, 3),
            },
            "el",
        );
        assert_eq!(text_of(&buffer), "hello");
        assert!(!buffer.is_modified());
        assert_eq!(buffer.layer_count(), 1);
    }

    #[test]
    fn test_zero_width_noop_insert() {
        let mut buffer = TextBuffer::from("a\r\nb");
        buffer.set_text_in_range(
            Range {
                start: Point::new(0, 1),
                end: Point::new(0, 1),
            },
            "",
        );
        assert_eq!(text_of(&buffer), "a\r\nb");
        assert!(!buffer.is_modified());
        assert_eq!(buffer.layer_count(), 1);
    }

    #[test]
    fn test_flush_changes_promotes_top_to_base() {
        let mut buffer = TextBuffer::from("one");
        buffer.set_text(Text::from("two"));
        assert!(buffer.is_modified());
        buffer.flush_changes();
        assert!(!buffer.is_modified());
        assert_eq!(buffer.layer_count(), 1);
        assert_eq!(buffer.base_text().to_string(), "two");
    }

    #[test]
    fn test_reset_in_place_when_unpinned() {
        let mut buffer = TextBuffer::from("one");
        buffer.reset("two\nthree");
        assert_eq!(text_of(&buffer), "two\nthree");
        assert_eq!(buffer.layer_count(), 1);
        assert!(!buffer.is_modified());
        assert_eq!(buffer.extent(), Point::new(1, 5));
    }

    #[test]
    fn test_reset_with_live_snapshot_preserves_it() {
        let mut buffer = TextBuffer::from("one");
        let snapshot = buffer.create_snapshot();
        buffer.reset("two");
        assert_eq!(text_of(&buffer), "two");
        assert_eq!(snapshot.text().to_string(), "one");
        assert!(!buffer.is_modified());
    }

    #[test]
    fn test_dot_graph_lists_layers() {
        let mut buffer = TextBuffer::from("base");
        buffer.set_text_in_range(
            Range {
                start: Point::zero(),
                end: Point::zero(),
            },
            "x",
        );
        let graph = buffer.get_dot_graph();
        assert!(graph.starts_with("digraph buffer {"));
        assert!(graph.contains("layer 0"));
        assert!(graph.contains("layer 1"));
        assert!(graph.contains("base"));
    }

    #[test]
    fn test_deserialize_requires_pristine_buffer() {
        let mut source = TextBuffer::from("abc");
        source.set_text_in_range(
            Range {
                start: Point::new(0, 0),
                end: Point::new(0, 1),
            },
            "X",
        );
        let bytes = source.serialize_changes().unwrap();

        let mut edited = TextBuffer::from("abc");
        edited.set_text_in_range(
            Range {
                start: Point::new(0, 0),
                end: Point::new(0, 0),
            },
            "y",
        );
        assert!(matches!(
            edited.deserialize_changes(&bytes),
            Err(ChangesError::BufferNotPristine)
        ));
    }

    #[test]
    fn test_line_accessors_out_of_range() {
        let buffer = TextBuffer::from("ab\ncd");
        assert_eq!(buffer.line_length_for_row(0), Some(2));
        assert_eq!(buffer.line_length_for_row(1), Some(2));
        assert_eq!(buffer.line_length_for_row(2), None);
        assert_eq!(buffer.line_ending_for_row(2), None);
        assert!(buffer.line_for_row(2).is_none());
        assert!(buffer.with_line_for_row(2, |_| ()).is_none());
    }
}
