// Chunk: docs/chunks/edit_patch - Differential change container

//! Integration tests for change-stream serialization and inversion.
//!
//! Pending changes (everything above the base layer) round-trip through
//! the binary stream, and inverted change sets rebuild a snapshot's text
//! from the current document.

use strata_buffer::{ChangesError, Point, Range, Snapshot, Text, TextBuffer};

fn range(start_row: u32, start_column: u32, end_row: u32, end_column: u32) -> Range {
    Range {
        start: Point::new(start_row, start_column),
        end: Point::new(end_row, end_column),
    }
}

/// Applies an inverted change set to `text`, restoring the snapshot's
/// base content. Changes are applied in reverse so earlier coordinates
/// stay valid.
fn apply_inverted(buffer: &TextBuffer, snapshot: &Snapshot) -> Text {
    let inverted = buffer.get_inverted_changes(snapshot);
    let mut text = buffer.text();
    for change in inverted.changes().iter().rev() {
        text.splice(
            change.old_start,
            change.old_end - change.old_start,
            change.new_text.as_slice(),
        );
    }
    text
}

#[test]
fn test_round_trip_of_pending_changes() {
    let mut source = TextBuffer::from("the quick\nbrown fox");
    source.set_text_in_range(range(0, 4, 0, 9), "slow");
    source.set_text_in_range(range(1, 0, 1, 5), "red");
    source.set_text_in_range(range(0, 8, 1, 0), " ");
    assert_eq!(source.text().to_string(), "the slow red fox");

    let bytes = source.serialize_changes().unwrap();

    let mut restored = TextBuffer::from("the quick\nbrown fox");
    restored.deserialize_changes(&bytes).unwrap();

    assert_eq!(restored.text().to_string(), source.text().to_string());
    assert_eq!(restored.extent(), source.extent());
    assert_eq!(restored.size(), source.size());
    assert_eq!(restored.layer_count(), 2);
}

#[test]
fn test_round_trip_with_crlf_content() {
    let mut source = TextBuffer::from("a\r\nb\r\nc");
    source.set_text_in_range(range(1, 0, 1, 1), "B1\r\nB2");
    let bytes = source.serialize_changes().unwrap();

    let mut restored = TextBuffer::from("a\r\nb\r\nc");
    restored.deserialize_changes(&bytes).unwrap();
    assert_eq!(restored.text().to_string(), "a\r\nB1\r\nB2\r\nc");
    assert_eq!(restored.extent(), source.extent());
    assert_eq!(restored.size(), source.size());
}

#[test]
fn test_round_trip_with_stacked_layers() {
    // A pinned middle layer forces the pending changes to span two patch
    // layers; serialization composes them into one.
    let mut source = TextBuffer::from("abcdef");
    source.set_text_in_range(range(0, 1, 0, 3), "X");
    let snapshot = source.create_snapshot();
    source.set_text_in_range(range(0, 3, 0, 4), "YY");
    assert_eq!(source.text().to_string(), "aXdYYf");
    assert_eq!(source.layer_count(), 3);

    let bytes = source.serialize_changes().unwrap();
    drop(snapshot);

    let mut restored = TextBuffer::from("abcdef");
    restored.deserialize_changes(&bytes).unwrap();
    assert_eq!(restored.text().to_string(), "aXdYYf");
    assert_eq!(restored.size(), source.size());
    assert_eq!(restored.extent(), source.extent());
}

#[test]
fn test_round_trip_of_pristine_buffer() {
    let source = TextBuffer::from("untouched");
    let bytes = source.serialize_changes().unwrap();

    let mut restored = TextBuffer::from("untouched");
    restored.deserialize_changes(&bytes).unwrap();
    assert_eq!(restored.text().to_string(), "untouched");
    assert_eq!(restored.size(), source.size());
}

#[test]
fn test_deserialize_rejects_edited_buffer() {
    let mut source = TextBuffer::from("abc");
    source.set_text_in_range(range(0, 0, 0, 1), "X");
    let bytes = source.serialize_changes().unwrap();

    let mut target = TextBuffer::from("abc");
    target.set_text_in_range(range(0, 2, 0, 3), "y");
    assert!(matches!(
        target.deserialize_changes(&bytes),
        Err(ChangesError::BufferNotPristine)
    ));
}

#[test]
fn test_deserialize_rejects_garbage() {
    let mut buffer = TextBuffer::from("abc");
    assert!(matches!(
        buffer.deserialize_changes(&[0xff, 0xff, 0xff]),
        Err(ChangesError::Decode(_))
    ));
}

#[test]
fn test_deserialize_accepts_flushed_buffer() {
    // Flushing collapses the stack back to a single root layer, which is
    // a valid deserialization target again.
    let mut source = TextBuffer::from("base");
    source.set_text_in_range(range(0, 0, 0, 0), "x");
    let bytes = source.serialize_changes().unwrap();

    let mut target = TextBuffer::from("other");
    target.set_text(String::from("base"));
    target.flush_changes();
    target.deserialize_changes(&bytes).unwrap();
    assert_eq!(target.text().to_string(), "xbase");
}

#[test]
fn test_inverted_changes_restore_snapshot_text() {
    let mut buffer = TextBuffer::from("hello");
    let snapshot = buffer.create_snapshot();

    buffer.set_text_in_range(range(0, 0, 0, 5), "world");
    buffer.set_text_in_range(range(0, 5, 0, 5), "!!");
    assert_eq!(buffer.text().to_string(), "world!!");

    let restored = apply_inverted(&buffer, &snapshot);
    assert_eq!(restored.to_string(), "hello");
}

#[test]
fn test_inverted_changes_with_disjoint_edits() {
    let mut buffer = TextBuffer::from("aaaa bbbb");
    let snapshot = buffer.create_snapshot();

    buffer.set_text_in_range(range(0, 0, 0, 4), "X");
    assert_eq!(buffer.text().to_string(), "X bbbb");
    buffer.set_text_in_range(range(0, 2, 0, 6), "YY");
    assert_eq!(buffer.text().to_string(), "X YY");

    let inverted = buffer.get_inverted_changes(&snapshot);
    assert_eq!(inverted.change_count(), 2);
    // The inverse changes record what the forward edits inserted.
    assert_eq!(
        inverted.changes()[0].old_text.as_ref().unwrap().to_string(),
        "X"
    );
    assert_eq!(
        inverted.changes()[1].old_text.as_ref().unwrap().to_string(),
        "YY"
    );

    let restored = apply_inverted(&buffer, &snapshot);
    assert_eq!(restored.to_string(), "aaaa bbbb");
}

#[test]
fn test_inverted_changes_across_rows() {
    let mut buffer = TextBuffer::from("one\ntwo\nthree");
    let snapshot = buffer.create_snapshot();

    buffer.set_text_in_range(range(0, 3, 1, 0), " ");
    buffer.set_text_in_range(range(1, 0, 1, 5), "3");
    assert_eq!(buffer.text().to_string(), "one two\n3");

    let restored = apply_inverted(&buffer, &snapshot);
    assert_eq!(restored.to_string(), "one\ntwo\nthree");
}

#[test]
fn test_inverted_changes_across_stacked_layers() {
    let mut buffer = TextBuffer::from("stone");
    let snapshot = buffer.create_snapshot();

    buffer.set_text_in_range(range(0, 0, 0, 2), "SH");
    let pin = buffer.create_snapshot();
    buffer.set_text_in_range(range(0, 4, 0, 5), "INE");
    assert_eq!(buffer.text().to_string(), "SHonINE");
    assert_eq!(buffer.layer_count(), 3);

    let restored = apply_inverted(&buffer, &snapshot);
    assert_eq!(restored.to_string(), "stone");
    drop(pin);
}

#[test]
fn test_inverted_changes_empty_when_unmodified() {
    let buffer = TextBuffer::from("same");
    let snapshot = buffer.create_snapshot();
    let inverted = buffer.get_inverted_changes(&snapshot);
    assert!(inverted.is_empty());
}
