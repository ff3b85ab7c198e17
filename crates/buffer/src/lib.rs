// Chunk: docs/chunks/layered_buffer - Layered text buffer with snapshots

//! strata-buffer: a layered, snapshot-capable text buffer.
//!
//! This crate provides an editable UTF-16 text document that hands out
//! cheap read-only snapshots. The document is a stack of *layers*: the
//! base layer owns a full text, and every layer above it is a patch over
//! the layer below. Snapshots pin the layers they read from, so they stay
//! valid and cheap while editing continues; dropping them lets the stack
//! collapse back down.
//!
//! # Overview
//!
//! The main type is [`TextBuffer`], which provides:
//! - Random-access edits addressed by (row, column) [`Point`]s
//! - CRLF-atomic position clipping and offset↔position conversion
//! - Chunked, copy-free traversal of any range of the document
//! - Incremental [`Regex`] search across chunk boundaries
//! - [`Snapshot`]s that observe the document as of their creation
//! - Serialization of pending changes against the base text
//!
//! # Example
//!
//! ```
//! use strata_buffer::{Point, Range, TextBuffer};
//!
//! let mut buffer = TextBuffer::from("hello world");
//! let snapshot = buffer.create_snapshot();
//!
//! buffer.set_text_in_range(
//!     Range {
//!         start: Point::new(0, 0),
//!         end: Point::new(0, 5),
//!     },
//!     "goodbye",
//! );
//!
//! assert_eq!(buffer.text().to_string(), "goodbye world");
//! assert_eq!(snapshot.text().to_string(), "hello world");
//! ```
//!
//! # CRLF atomicity
//!
//! A `\r\n` sequence is one logical line boundary. No valid [`Point`]
//! addresses the `\n`; clipping collapses such positions onto the `\r`,
//! and search results respect the same rule even when a match ends
//! between the two units at a chunk boundary.

mod patch;
mod point;
mod regex;
mod text;
mod text_buffer;

pub use patch::{Change, Patch};
pub use point::{Point, Range};
pub use regex::{MatchData, MatchResult, Regex, RegexError};
pub use text::{ClipResult, LineEnding, Text, TextSlice};
pub use text_buffer::{ChangesError, Snapshot, TextBuffer};
