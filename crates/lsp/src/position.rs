//! Conversions between rope char offsets and LSP positions.
//!
//! Servers negotiate one offset encoding during the handshake and every
//! position on that connection is expressed in it. Conversions are fallible:
//! out-of-bounds lines and offsets yield `None`, while in-bounds columns past
//! the end of a line clamp to the line's content end (before the newline), as
//! the protocol prescribes.

use lsp_types::{Position, PositionEncodingKind, Range};
use ropey::Rope;

/// Offset encoding used for LSP positions on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetEncoding {
	/// UTF-8 code units (bytes).
	Utf8,
	/// UTF-16 code units; the protocol default.
	#[default]
	Utf16,
	/// Unicode scalar values.
	Utf32,
}

impl OffsetEncoding {
	/// Map the negotiated [`PositionEncodingKind`] onto an encoding, `None`
	/// for kinds this crate does not understand.
	pub fn from_lsp(kind: &PositionEncodingKind) -> Option<Self> {
		match kind.as_str() {
			"utf-8" => Some(OffsetEncoding::Utf8),
			"utf-16" => Some(OffsetEncoding::Utf16),
			"utf-32" => Some(OffsetEncoding::Utf32),
			_ => None,
		}
	}
}

fn encoded_width(ch: char, encoding: OffsetEncoding) -> usize {
	match encoding {
		OffsetEncoding::Utf8 => ch.len_utf8(),
		OffsetEncoding::Utf16 => ch.len_utf16(),
		OffsetEncoding::Utf32 => 1,
	}
}

/// Convert an LSP position to a char index into `text`.
///
/// Returns `None` when the line is out of bounds. A column past the end of
/// the line clamps to the last content char of that line.
pub fn lsp_position_to_char(
	text: &Rope,
	position: Position,
	encoding: OffsetEncoding,
) -> Option<usize> {
	let line = position.line as usize;
	if line >= text.len_lines() {
		return None;
	}
	let line_start = text.line_to_char(line);
	let target = position.character as usize;
	let mut units = 0;
	let mut chars = 0;
	for ch in text.line(line).chars() {
		if units >= target || ch == '\n' || ch == '\r' {
			break;
		}
		units += encoded_width(ch, encoding);
		chars += 1;
	}
	Some(line_start + chars)
}

/// Convert a char index into `text` to an LSP position.
///
/// Returns `None` when the index is past the end of the rope.
pub fn char_to_lsp_position(
	text: &Rope,
	char_idx: usize,
	encoding: OffsetEncoding,
) -> Option<Position> {
	if char_idx > text.len_chars() {
		return None;
	}
	let line = text.char_to_line(char_idx);
	let line_start = text.line_to_char(line);
	let units: usize = text
		.slice(line_start..char_idx)
		.chars()
		.map(|ch| encoded_width(ch, encoding))
		.sum();
	Some(Position::new(line as u32, units as u32))
}

/// Convert an LSP range to a `(start, end)` char range.
pub fn lsp_range_to_char_range(
	text: &Rope,
	range: Range,
	encoding: OffsetEncoding,
) -> Option<(usize, usize)> {
	let start = lsp_position_to_char(text, range.start, encoding)?;
	let end = lsp_position_to_char(text, range.end, encoding)?;
	Some((start, end))
}

/// Convert a `(start, end)` char range to an LSP range.
pub fn char_range_to_lsp_range(
	text: &Rope,
	start: usize,
	end: usize,
	encoding: OffsetEncoding,
) -> Option<Range> {
	let start = char_to_lsp_position(text, start, encoding)?;
	let end = char_to_lsp_position(text, end, encoding)?;
	Some(Range::new(start, end))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn utf32_round_trip() {
		let text = Rope::from_str("hello\nworld\n");
		let idx = lsp_position_to_char(&text, Position::new(1, 2), OffsetEncoding::Utf32).unwrap();
		assert_eq!(idx, 8);
		let pos = char_to_lsp_position(&text, idx, OffsetEncoding::Utf32).unwrap();
		assert_eq!(pos, Position::new(1, 2));
	}

	#[test]
	fn utf16_counts_surrogate_pairs() {
		// The emoji takes two UTF-16 code units but is one rope char.
		let text = Rope::from_str("a😀b\n");
		let pos = char_to_lsp_position(&text, 2, OffsetEncoding::Utf16).unwrap();
		assert_eq!(pos, Position::new(0, 3));
		let idx = lsp_position_to_char(&text, Position::new(0, 3), OffsetEncoding::Utf16).unwrap();
		assert_eq!(idx, 2);
	}

	#[test]
	fn utf8_counts_bytes() {
		// 'é' is two bytes in UTF-8.
		let text = Rope::from_str("é x\n");
		let pos = char_to_lsp_position(&text, 1, OffsetEncoding::Utf8).unwrap();
		assert_eq!(pos, Position::new(0, 2));
		let idx = lsp_position_to_char(&text, Position::new(0, 2), OffsetEncoding::Utf8).unwrap();
		assert_eq!(idx, 1);
	}

	#[test]
	fn out_of_bounds_line_is_none() {
		let text = Rope::from_str("one\n");
		assert_eq!(
			lsp_position_to_char(&text, Position::new(5, 0), OffsetEncoding::Utf16),
			None
		);
	}

	#[test]
	fn out_of_bounds_char_is_none() {
		let text = Rope::from_str("one\n");
		assert_eq!(char_to_lsp_position(&text, 99, OffsetEncoding::Utf16), None);
	}

	#[test]
	fn column_clamps_to_line_content_end() {
		let text = Rope::from_str("ab\ncd\n");
		// Column 10 on line 0 clamps before the newline.
		let idx = lsp_position_to_char(&text, Position::new(0, 10), OffsetEncoding::Utf16).unwrap();
		assert_eq!(idx, 2);
	}

	#[test]
	fn range_conversion() {
		let text = Rope::from_str("fn main() {}\n");
		let range = Range::new(Position::new(0, 3), Position::new(0, 7));
		let (start, end) = lsp_range_to_char_range(&text, range, OffsetEncoding::Utf16).unwrap();
		assert_eq!((start, end), (3, 7));
		let back = char_range_to_lsp_range(&text, start, end, OffsetEncoding::Utf16).unwrap();
		assert_eq!(back, range);
	}
}
