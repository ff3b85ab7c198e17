// Chunk: docs/chunks/layered_buffer - Layered text buffer with snapshots

//! Integration tests for snapshots and layer lifecycle.
//!
//! These verify that snapshots keep observing the document as of their
//! creation, that pinned layers survive edits, and that dropping the last
//! snapshot lets the layer stack consolidate back down.

use strata_buffer::{Point, Range, TextBuffer};

fn range(start_row: u32, start_column: u32, end_row: u32, end_column: u32) -> Range {
    Range {
        start: Point::new(start_row, start_column),
        end: Point::new(end_row, end_column),
    }
}

fn text_of(buffer: &TextBuffer) -> String {
    buffer.text().to_string()
}

#[test]
fn test_snapshot_survives_edits() {
    let mut buffer = TextBuffer::from("hello");
    let snapshot = buffer.create_snapshot();

    buffer.set_text_in_range(range(0, 0, 0, 5), "world");

    assert_eq!(text_of(&buffer), "world");
    assert_eq!(snapshot.text().to_string(), "hello");
    assert_eq!(buffer.layer_count(), 2);
    assert!(buffer.is_modified_since(&snapshot));

    drop(snapshot);
    assert_eq!(buffer.layer_count(), 1);
    assert_eq!(text_of(&buffer), "world");
}

#[test]
fn test_squash_preserves_text() {
    let mut buffer = TextBuffer::from("0123456789");
    for index in 0..20u32 {
        let column = index % 9;
        buffer.set_text_in_range(
            range(0, column, 0, column + 1),
            format!("{}", (index + 1) % 10).as_str(),
        );
    }
    let expected = text_of(&buffer);

    let snapshot = buffer.create_snapshot();
    drop(snapshot);

    assert_eq!(text_of(&buffer), expected);
    assert_eq!(buffer.layer_count(), 1);
    // Squashing folded the edits into the base text.
    assert!(!buffer.is_modified());
    assert_eq!(buffer.base_text().to_string(), expected);
}

#[test]
fn test_snapshot_reads() {
    let mut buffer = TextBuffer::from("alpha\nbeta\ngamma");
    let snapshot = buffer.create_snapshot();
    buffer.set_text_in_range(range(1, 0, 1, 4), "BETA");

    assert_eq!(snapshot.size(), 16);
    assert_eq!(snapshot.extent(), Point::new(2, 5));
    assert_eq!(snapshot.line_length_for_row(1), Some(4));
    assert_eq!(snapshot.line_length_for_row(3), None);
    assert_eq!(
        snapshot.text_in_range(range(1, 0, 1, 4)).to_string(),
        "beta"
    );
    assert_eq!(buffer.text_in_range(range(1, 0, 1, 4)).to_string(), "BETA");

    let concatenated: String = snapshot
        .chunks()
        .iter()
        .map(|chunk| chunk.to_string())
        .collect();
    assert_eq!(concatenated, "alpha\nbeta\ngamma");
    assert_eq!(snapshot.base_text().to_string(), "alpha\nbeta\ngamma");
}

#[test]
fn test_stacked_snapshots_pin_multiple_layers() {
    let mut buffer = TextBuffer::from("v0");
    let first = buffer.create_snapshot();

    buffer.set_text(String::from("v1"));
    let second = buffer.create_snapshot();

    buffer.set_text(String::from("v2"));
    assert_eq!(buffer.layer_count(), 3);

    assert_eq!(first.text().to_string(), "v0");
    assert_eq!(second.text().to_string(), "v1");
    assert_eq!(text_of(&buffer), "v2");

    // Dropping the newer snapshot first keeps the older one intact.
    drop(second);
    assert_eq!(first.text().to_string(), "v0");
    assert_eq!(text_of(&buffer), "v2");

    drop(first);
    assert_eq!(buffer.layer_count(), 1);
    assert_eq!(text_of(&buffer), "v2");
}

#[test]
fn test_two_snapshots_of_same_state() {
    let mut buffer = TextBuffer::from("shared");
    let first = buffer.create_snapshot();
    let second = buffer.create_snapshot();

    buffer.set_text(String::from("changed"));
    drop(first);
    // The second snapshot still pins the old layers.
    assert_eq!(second.text().to_string(), "shared");
    drop(second);
    assert_eq!(buffer.layer_count(), 1);
}

#[test]
fn test_flush_changes_after_snapshot_dropped() {
    let mut buffer = TextBuffer::from("start");
    let snapshot = buffer.create_snapshot();
    buffer.set_text(String::from("finish"));
    drop(snapshot);

    buffer.flush_changes();
    assert!(!buffer.is_modified());
    assert_eq!(buffer.base_text().to_string(), "finish");
    assert_eq!(buffer.layer_count(), 1);
}

#[test]
fn test_flush_preceding_changes_promotes_snapshot_layer() {
    let mut buffer = TextBuffer::from("one");
    buffer.set_text_in_range(range(0, 3, 0, 3), "!");
    let snapshot = buffer.create_snapshot();
    buffer.set_text_in_range(range(0, 4, 0, 4), "!");
    assert_eq!(text_of(&buffer), "one!!");

    snapshot.flush_preceding_changes();

    // The snapshot's layer became the new base; the buffer's pending
    // change is now just the second insertion.
    assert_eq!(buffer.base_text().to_string(), "one!");
    assert_eq!(snapshot.text().to_string(), "one!");
    assert_eq!(text_of(&buffer), "one!!");
    assert!(buffer.is_modified());
}

#[test]
fn test_is_modified_relative_to_base_and_snapshot() {
    let mut buffer = TextBuffer::from("same");
    assert!(!buffer.is_modified());

    let snapshot = buffer.create_snapshot();
    assert!(!buffer.is_modified_since(&snapshot));

    buffer.set_text_in_range(range(0, 0, 0, 0), "x");
    assert!(buffer.is_modified());
    assert!(buffer.is_modified_since(&snapshot));

    // Deleting the insertion restores the base content.
    buffer.set_text_in_range(range(0, 0, 0, 1), "");
    assert!(!buffer.is_modified());
    assert!(!buffer.is_modified_since(&snapshot));
}

#[test]
fn test_snapshot_text_is_stable_across_many_edits() {
    let mut buffer = TextBuffer::from("line one\nline two");
    let snapshot = buffer.create_snapshot();

    buffer.set_text_in_range(range(0, 0, 0, 4), "LINE");
    buffer.set_text_in_range(range(1, 5, 1, 8), "2");
    buffer.set_text_in_range(range(0, 8, 1, 0), " / ");
    assert_eq!(text_of(&buffer), "LINE one / line 2");

    assert_eq!(snapshot.text().to_string(), "line one\nline two");
    assert_eq!(snapshot.extent(), Point::new(1, 8));
}
