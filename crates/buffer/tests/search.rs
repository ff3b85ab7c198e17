// Chunk: docs/chunks/chunk_search - Incremental regex search over chunked text

//! Integration tests for regex search over the chunked document.
//!
//! Patch layers split the document into chunks, so these tests verify
//! matches that start, continue, and end across chunk boundaries, plus the
//! CRLF hold-over at a boundary.

use strata_buffer::{Point, Range, Regex, TextBuffer};

fn range(start_row: u32, start_column: u32, end_row: u32, end_column: u32) -> Range {
    Range {
        start: Point::new(start_row, start_column),
        end: Point::new(end_row, end_column),
    }
}

/// Builds a buffer whose effective text is "foobarbaz" served as the
/// chunks "foo", "bar", "baz".
fn chunked_foobarbaz() -> TextBuffer {
    let mut buffer = TextBuffer::from("fooXbaz");
    buffer.set_text_in_range(range(0, 3, 0, 4), "bar");
    assert!(buffer.chunks().len() == 3);
    buffer
}

#[test]
fn test_match_spanning_three_chunks() {
    let buffer = chunked_foobarbaz();
    let regex = Regex::new("oobarb").unwrap();
    assert_eq!(buffer.search(&regex), Some(range(0, 1, 0, 7)));
}

#[test]
fn test_match_restarting_after_failed_partial() {
    // "barb" begins matching inside the first chunk ("...b" is not
    // present), restarts at the patch chunk, and completes in the third.
    let buffer = chunked_foobarbaz();
    let regex = Regex::new("barb").unwrap();
    assert_eq!(buffer.search(&regex), Some(range(0, 3, 0, 7)));
}

#[test]
fn test_match_ending_in_cr_at_chunk_boundary() {
    // The patch serves "\r" as its own chunk, with the LF at the start of
    // the next chunk. The match's end point must land on the CR's column.
    let mut buffer = TextBuffer::from("aQ\nb");
    buffer.set_text_in_range(range(0, 1, 0, 2), "\r");
    assert_eq!(buffer.text().to_string(), "a\r\nb");

    let regex = Regex::new(".\\r").unwrap();
    let result = buffer.search(&regex).unwrap();
    assert_eq!(result.start, Point::new(0, 0));
    assert_eq!(result.end, Point::new(0, 1));
}

#[test]
fn test_search_all_across_chunk_boundaries() {
    let mut buffer = TextBuffer::from("abXab");
    buffer.set_text_in_range(range(0, 2, 0, 3), "ab");
    assert_eq!(buffer.text().to_string(), "ababab");

    let regex = Regex::new("ab").unwrap();
    assert_eq!(
        buffer.search_all(&regex),
        vec![
            range(0, 0, 0, 2),
            range(0, 2, 0, 4),
            range(0, 4, 0, 6),
        ]
    );
}

#[test]
fn test_search_without_match() {
    let buffer = chunked_foobarbaz();
    let regex = Regex::new("quux").unwrap();
    assert_eq!(buffer.search(&regex), None);
    assert!(buffer.search_all(&regex).is_empty());
}

#[test]
fn test_match_spanning_rows() {
    let mut buffer = TextBuffer::from("ab\ncd");
    buffer.set_text_in_range(range(1, 1, 1, 2), "D");
    assert_eq!(buffer.text().to_string(), "ab\ncD");

    let regex = Regex::new("b\\ncD").unwrap();
    assert_eq!(buffer.search(&regex), Some(range(0, 1, 1, 2)));
}

#[test]
fn test_empty_matching_pattern_reports_origin() {
    let buffer = TextBuffer::from("abc");
    let regex = Regex::new("x*").unwrap();
    assert_eq!(buffer.search(&regex), Some(range(0, 0, 0, 0)));
}

#[test]
fn test_empty_matching_pattern_on_empty_buffer() {
    let buffer = TextBuffer::new();
    let regex = Regex::new("a*").unwrap();
    assert_eq!(buffer.search(&regex), Some(range(0, 0, 0, 0)));

    let regex = Regex::new("a+").unwrap();
    assert_eq!(buffer.search(&regex), None);
}

#[test]
fn test_search_matches_patched_content_only() {
    let mut buffer = TextBuffer::from("needle in haystack");
    buffer.set_text_in_range(range(0, 0, 0, 6), "thread");
    let old = Regex::new("needle").unwrap();
    let new = Regex::new("thread").unwrap();

    assert_eq!(buffer.search(&old), None);
    assert_eq!(buffer.search(&new), Some(range(0, 0, 0, 6)));
}

#[test]
fn test_snapshot_search_sees_old_content() {
    let mut buffer = TextBuffer::from("needle in haystack");
    let snapshot = buffer.create_snapshot();
    buffer.set_text_in_range(range(0, 0, 0, 6), "thread");

    let regex = Regex::new("needle").unwrap();
    assert_eq!(snapshot.search(&regex), Some(range(0, 0, 0, 6)));
    assert_eq!(buffer.search(&regex), None);
}

#[test]
fn test_search_all_with_multirow_matches() {
    let mut buffer = TextBuffer::from("x1\nx2\nx3");
    buffer.set_text_in_range(range(1, 1, 1, 2), "9");
    assert_eq!(buffer.text().to_string(), "x1\nx9\nx3");

    let regex = Regex::new("x[0-9]").unwrap();
    assert_eq!(
        buffer.search_all(&regex),
        vec![
            range(0, 0, 0, 2),
            range(1, 0, 1, 2),
            range(2, 0, 2, 2),
        ]
    );
}

#[test]
fn test_greedy_match_does_not_split_at_chunk_boundary() {
    // "o+" must not stop at the "foo"/"bar" boundary with a short match;
    // the partial machinery carries it over and the full run is reported.
    let mut buffer = TextBuffer::from("fXoba");
    buffer.set_text_in_range(range(0, 1, 0, 2), "oo");
    assert_eq!(buffer.text().to_string(), "foooba");

    let regex = Regex::new("o+").unwrap();
    assert_eq!(buffer.search(&regex), Some(range(0, 1, 0, 4)));
}

#[test]
fn test_anchored_search() {
    // Anchors bind to the slice handed to each engine call, so this
    // exercises them on an unpatched single-chunk document.
    let buffer = TextBuffer::from("foobarbaz");
    assert_eq!(
        buffer.search(&Regex::new("^foo").unwrap()),
        Some(range(0, 0, 0, 3))
    );
    assert_eq!(
        buffer.search(&Regex::new("baz$").unwrap()),
        Some(range(0, 6, 0, 9))
    );
    assert_eq!(buffer.search(&Regex::new("^bar").unwrap()), None);
}
