// Chunk: docs/chunks/edit_patch - Differential change container

//! A differential container of text changes.
//!
//! A `Patch` records how one version of a document (the *new* space) was
//! derived from the version below it (the *old* space) as a sorted set of
//! non-overlapping `Change` records. Positions outside every change map
//! identically between the two spaces.
//!
//! Changes are kept in a sorted `Vec`. Queries are binary searches;
//! mutations shift the coordinates of subsequent changes in bulk and
//! rebuild the cumulative size counters from the edit point. Changes whose
//! new ranges touch a spliced range are merged into it, so consecutive
//! edits at a caret coalesce into a single change.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::point::Point;
use crate::text::Text;

/// One change record: the old range it replaces, the new range and text
/// that replace it, and size bookkeeping for offset translation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub old_start: Point,
    pub old_end: Point,
    pub new_start: Point,
    pub new_end: Point,
    pub new_text: Text,
    /// The replaced old text, when the producer recorded it. Merging
    /// discards it.
    pub old_text: Option<Text>,
    /// Code units spanned by `[old_start, old_end)`.
    pub old_text_size: u32,
    /// Code units of old text covered by all preceding changes.
    pub preceding_old_text_size: u32,
    /// Code units of new text inserted by all preceding changes.
    pub preceding_new_text_size: u32,
}

/// A sorted set of non-overlapping changes mapping an old text to a new one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    changes: Vec<Change>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// All changes in ascending order.
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }

    /// Returns the last change whose new range starts at or before
    /// `position`.
    pub fn change_starting_before_new_position(&self, position: Point) -> Option<&Change> {
        let count = self
            .changes
            .partition_point(|change| change.new_start <= position);
        if count == 0 {
            return None;
        }
        Some(&self.changes[count - 1])
    }

    /// Returns the changes whose new ranges start strictly after `start`
    /// and before `end`.
    ///
    /// The change at or before `start` itself is excluded; callers obtain
    /// it with [`Self::change_starting_before_new_position`].
    pub fn changes_in_new_range(&self, start: Point, end: Point) -> &[Change] {
        let first = self
            .changes
            .partition_point(|change| change.new_start <= start);
        let past = self
            .changes
            .partition_point(|change| change.new_start < end)
            .max(first);
        &self.changes[first..past]
    }

    /// Translates a new-space offset to a new-space position.
    ///
    /// The patch does not know the old document, so the caller supplies
    /// lookups into it: `old_position_to_offset` and
    /// `old_offset_to_position`.
    pub fn new_position_for_new_offset(
        &self,
        offset: u32,
        old_position_to_offset: impl Fn(Point) -> u32,
        old_offset_to_position: impl Fn(u32) -> Point,
    ) -> Point {
        let new_start_offset = |change: &Change| {
            old_position_to_offset(change.old_start) + change.preceding_new_text_size
                - change.preceding_old_text_size
        };
        let count = self
            .changes
            .partition_point(|change| new_start_offset(change) <= offset);
        if count == 0 {
            return old_offset_to_position(offset);
        }

        let change = &self.changes[count - 1];
        let change_start_offset = new_start_offset(change);
        if offset < change_start_offset + change.new_text.size() {
            change.new_start
                + change
                    .new_text
                    .position_for_offset(offset - change_start_offset)
        } else {
            let old_offset = old_position_to_offset(change.old_start)
                + change.old_text_size
                + (offset - change_start_offset - change.new_text.size());
            let old_position = old_offset_to_position(old_offset);
            change.new_end + (old_position - change.old_end)
        }
    }

    /// Records that the new-space range starting at `new_splice_start` and
    /// spanning `deleted_extent` was replaced by `new_text` (spanning
    /// `inserted_extent`).
    ///
    /// `deleted_text_size` is the code-unit length of the replaced
    /// new-space range; it is required to keep `old_text_size` bookkeeping
    /// exact when the splice only partially overlaps existing changes.
    pub fn splice(
        &mut self,
        new_splice_start: Point,
        deleted_extent: Point,
        inserted_extent: Point,
        old_text: Option<Text>,
        new_text: Text,
        deleted_text_size: u32,
    ) {
        let deletion_end = new_splice_start + deleted_extent;
        let insertion_end = new_splice_start + inserted_extent;

        let first = self
            .changes
            .partition_point(|change| change.new_end < new_splice_start);
        let past = first
            + self.changes[first..].partition_point(|change| change.new_start <= deletion_end);

        let merged = if first == past {
            let old_start = self.old_position_before_index(first, new_splice_start);
            Change {
                old_start,
                old_end: old_start + deleted_extent,
                new_start: new_splice_start,
                new_end: insertion_end,
                new_text,
                old_text,
                old_text_size: deleted_text_size,
                preceding_old_text_size: 0,
                preceding_new_text_size: 0,
            }
        } else {
            let first_change = &self.changes[first];
            let last_change = &self.changes[past - 1];

            let mut merged_text = Text::new();
            if new_splice_start > first_change.new_start {
                merged_text.append(
                    first_change
                        .new_text
                        .as_slice()
                        .prefix(new_splice_start - first_change.new_start),
                );
            }
            merged_text.append(new_text.as_slice());
            if deletion_end < last_change.new_end {
                merged_text.append(
                    last_change
                        .new_text
                        .as_slice()
                        .suffix(deletion_end - last_change.new_start),
                );
            }

            let new_start = Point::min(first_change.new_start, new_splice_start);
            let old_start = if new_splice_start < first_change.new_start {
                self.old_position_before_index(first, new_splice_start)
            } else {
                first_change.old_start
            };
            let old_end = if deletion_end > last_change.new_end {
                last_change.old_end + (deletion_end - last_change.new_end)
            } else {
                last_change.old_end
            };

            // Units the merged changes contributed within the deleted
            // range; the remainder of `deleted_text_size` was unchanged
            // text, which corresponds one-to-one to old units.
            let mut covered_units = 0;
            let mut merged_old_size = 0;
            for change in &self.changes[first..past] {
                merged_old_size += change.old_text_size;
                let overlap_start = Point::max(new_splice_start, change.new_start);
                let overlap_end = Point::min(deletion_end, change.new_end);
                if overlap_start < overlap_end {
                    let start_offset = change
                        .new_text
                        .offset_for_position(overlap_start - change.new_start);
                    let end_offset = change
                        .new_text
                        .offset_for_position(overlap_end - change.new_start);
                    covered_units += end_offset - start_offset;
                }
            }

            let new_end = new_start + merged_text.extent();
            Change {
                old_start,
                old_end,
                new_start,
                new_end,
                new_text: merged_text,
                old_text: None,
                old_text_size: merged_old_size + (deleted_text_size - covered_units),
                preceding_old_text_size: 0,
                preceding_new_text_size: 0,
            }
        };

        // A change that maps nothing to nothing carries no information.
        let keep = !(merged.old_start == merged.old_end
            && merged.new_text.is_empty()
            && merged.old_text_size == 0);
        let kept = usize::from(keep);
        if keep {
            self.changes.splice(first..past, [merged]);
        } else {
            self.changes.drain(first..past);
        }

        for change in &mut self.changes[first + kept..] {
            change.new_start = insertion_end + (change.new_start - deletion_end);
            change.new_end = insertion_end + (change.new_end - deletion_end);
        }
        self.rebuild_preceding_sizes(first);
    }

    /// Records that the old-space range starting at `old_splice_start` and
    /// spanning `deleted_extent` was replaced by text spanning
    /// `inserted_extent`.
    ///
    /// Changes touching the spliced old range are dropped; the affected
    /// region reverts to the identity mapping. With zero extents this
    /// erases a change without disturbing its neighbours.
    pub fn splice_old(
        &mut self,
        old_splice_start: Point,
        deleted_extent: Point,
        inserted_extent: Point,
    ) {
        let deletion_end = old_splice_start + deleted_extent;
        let insertion_end = old_splice_start + inserted_extent;

        let first = self
            .changes
            .partition_point(|change| change.old_end < old_splice_start);
        let past = first
            + self.changes[first..].partition_point(|change| change.old_start <= deletion_end);

        // Bounds of the affected region in both spaces, and its old extent
        // after the splice (which is also its new extent: the region now
        // maps identically).
        let (affected_old_start, affected_old_end, new_span_end) = if first < past {
            let first_change = &self.changes[first];
            let last_change = &self.changes[past - 1];
            let affected_old_start = Point::min(old_splice_start, first_change.old_start);
            let affected_old_end = if deletion_end > last_change.old_end {
                insertion_end
            } else {
                insertion_end + (last_change.old_end - deletion_end)
            };
            let new_span_end = if deletion_end > last_change.old_end {
                last_change.new_end + (deletion_end - last_change.old_end)
            } else {
                last_change.new_end
            };
            (affected_old_start, affected_old_end, new_span_end)
        } else {
            (
                old_splice_start,
                insertion_end,
                self.new_position_before_index(first, deletion_end),
            )
        };
        let new_span_start = if first < past && self.changes[first].old_start <= old_splice_start {
            self.changes[first].new_start
        } else {
            self.new_position_before_index(first, old_splice_start)
        };
        let new_region_end = new_span_start + (affected_old_end - affected_old_start);

        self.changes.drain(first..past);
        for change in &mut self.changes[first..] {
            change.old_start = insertion_end + (change.old_start - deletion_end);
            change.old_end = insertion_end + (change.old_end - deletion_end);
            change.new_start = new_region_end + (change.new_start - new_span_end);
            change.new_end = new_region_end + (change.new_end - new_span_end);
        }
        self.rebuild_preceding_sizes(first);
    }

    /// Composes a patch that sits on top of this one: `above`'s old space
    /// is this patch's new space. After combining, `self` maps its own old
    /// space directly to `above`'s new space.
    pub fn combine(&mut self, above: &Patch) {
        // Splicing in reverse keeps the coordinates of the not-yet-spliced
        // (earlier) changes valid.
        for change in above.changes.iter().rev() {
            self.splice(
                change.old_start,
                change.old_end - change.old_start,
                change.new_end - change.new_start,
                change.old_text.clone(),
                change.new_text.clone(),
                change.old_text_size,
            );
        }
    }

    /// Composes a bottom-to-top sequence of patches into one.
    pub fn compose<'a>(patches: impl IntoIterator<Item = &'a Patch>) -> Patch {
        let mut iter = patches.into_iter();
        let mut result = match iter.next() {
            Some(first) => first.clone(),
            None => return Patch::new(),
        };
        for patch in iter {
            result.combine(patch);
        }
        result
    }

    /// Renders the change set as a Graphviz digraph.
    pub fn get_dot_graph(&self) -> String {
        let mut result = String::from("digraph patch {\n");
        for (index, change) in self.changes.iter().enumerate() {
            let _ = writeln!(
                result,
                "  change_{} [shape=box, label=\"old ({}, {})..({}, {}) -> new ({}, {})..({}, {}) {:?}\"]",
                index,
                change.old_start.row,
                change.old_start.column,
                change.old_end.row,
                change.old_end.column,
                change.new_start.row,
                change.new_start.column,
                change.new_end.row,
                change.new_end.column,
                change.new_text.to_string(),
            );
            if index > 0 {
                let _ = writeln!(result, "  change_{} -> change_{}", index - 1, index);
            }
        }
        result.push_str("}\n");
        result
    }

    /// The old-space position of a new-space position lying before the
    /// change at `index` (and after the change before it).
    fn old_position_before_index(&self, index: usize, position: Point) -> Point {
        if index == 0 {
            position
        } else {
            let change = &self.changes[index - 1];
            change.old_end + (position - change.new_end)
        }
    }

    /// The new-space position of an old-space position lying before the
    /// change at `index` (and after the change before it).
    fn new_position_before_index(&self, index: usize, position: Point) -> Point {
        if index == 0 {
            position
        } else {
            let change = &self.changes[index - 1];
            change.new_end + (position - change.old_end)
        }
    }

    fn rebuild_preceding_sizes(&mut self, from: usize) {
        let (mut old_sum, mut new_sum) = if from == 0 {
            (0, 0)
        } else {
            let previous = &self.changes[from - 1];
            (
                previous.preceding_old_text_size + previous.old_text_size,
                previous.preceding_new_text_size + previous.new_text.size(),
            )
        };
        for change in &mut self.changes[from..] {
            change.preceding_old_text_size = old_sum;
            change.preceding_new_text_size = new_sum;
            old_sum += change.old_text_size;
            new_sum += change.new_text.size();
        }
    }
}
