use lsp_types::TextDocumentContentChangeEvent;

use crate::document::EditBatch;
use crate::position::{OffsetEncoding, char_range_to_lsp_range};

/// Computes incremental LSP change events for an edit batch.
///
/// Each produced event is addressed against the document state after the
/// previous events in the same batch, as the protocol requires, so the ops
/// are replayed against a scratch copy of the pre-edit text. Returns `None`
/// for whole-document replacements and for batches whose offsets cannot be
/// mapped; callers fall back to full-content sync.
pub fn content_changes_for_batch(
	batch: &EditBatch,
	encoding: OffsetEncoding,
) -> Option<Vec<TextDocumentContentChangeEvent>> {
	if batch.is_replace() {
		return None;
	}

	let mut scratch = batch.before.clone();
	let mut changes = Vec::with_capacity(batch.ops.len());
	// Shift from pre-edit offsets to scratch offsets, accumulated over ops.
	let mut delta = 0isize;

	for op in &batch.ops {
		let start = op.start.checked_add_signed(delta)?;
		let end = op.end.checked_add_signed(delta)?;
		if start > end || end > scratch.len_chars() {
			return None;
		}
		let range = char_range_to_lsp_range(&scratch, start, end, encoding)?;
		changes.push(TextDocumentContentChangeEvent {
			range: Some(range),
			range_length: None,
			text: op.text.clone(),
		});
		scratch.remove(start..end);
		scratch.insert(start, &op.text);
		delta += op.text.chars().count() as isize - (op.end - op.start) as isize;
	}

	Some(changes)
}

#[cfg(test)]
mod tests {
	use lsp_types::{Position, Range};
	use ropey::Rope;

	use super::*;
	use crate::document::EditOp;

	fn apply(before: &str, ops: Vec<EditOp>) -> EditBatch {
		let mut after = Rope::from(before);
		let mut delta = 0isize;
		for op in &ops {
			let start = op.start.checked_add_signed(delta).unwrap();
			let end = op.end.checked_add_signed(delta).unwrap();
			after.remove(start..end);
			after.insert(start, &op.text);
			delta += op.text.chars().count() as isize - (op.end - op.start) as isize;
		}
		EditBatch::new(Rope::from(before), after, ops)
	}

	#[test]
	fn test_insert_computes_correct_range() {
		let batch = apply(
			"hello\nworld\n",
			vec![EditOp {
				start: 6,
				end: 6,
				text: "beautiful ".to_string(),
			}],
		);

		let changes = content_changes_for_batch(&batch, OffsetEncoding::Utf16).unwrap();

		assert_eq!(changes.len(), 1);
		assert_eq!(
			changes[0].range,
			Some(Range::new(Position::new(1, 0), Position::new(1, 0)))
		);
		assert_eq!(changes[0].text, "beautiful ");
	}

	#[test]
	fn test_delete_line_computes_correct_range() {
		let batch = apply(
			"line1\nline2\nline3\n",
			vec![EditOp {
				start: 6,
				end: 12,
				text: String::new(),
			}],
		);

		let changes = content_changes_for_batch(&batch, OffsetEncoding::Utf16).unwrap();

		assert_eq!(changes.len(), 1);
		assert_eq!(
			changes[0].range,
			Some(Range::new(Position::new(1, 0), Position::new(2, 0)))
		);
		assert_eq!(changes[0].text, "");
	}

	#[test]
	fn test_multi_cursor_edit() {
		let batch = apply(
			"hello\nworld\n",
			vec![
				EditOp {
					start: 0,
					end: 0,
					text: "\n".to_string(),
				},
				EditOp {
					start: 6,
					end: 6,
					text: "X".to_string(),
				},
			],
		);

		let changes = content_changes_for_batch(&batch, OffsetEncoding::Utf16).unwrap();

		assert_eq!(changes.len(), 2);
		// First insert at the very start.
		assert_eq!(
			changes[0].range,
			Some(Range::new(Position::new(0, 0), Position::new(0, 0)))
		);
		assert_eq!(changes[0].text, "\n");
		// Second op is addressed against the text with the first insert
		// already applied, so line 1 has shifted to line 2.
		assert_eq!(
			changes[1].range,
			Some(Range::new(Position::new(2, 0), Position::new(2, 0)))
		);
		assert_eq!(changes[1].text, "X");
	}

	#[test]
	fn test_replace_batch_has_no_incremental_form() {
		let batch = EditBatch::replace(Rope::from("old"), Rope::from("new"));
		assert!(content_changes_for_batch(&batch, OffsetEncoding::Utf16).is_none());
	}

	#[test]
	fn test_out_of_bounds_op_has_no_incremental_form() {
		let batch = EditBatch::new(
			Rope::from("ab"),
			Rope::from("ab"),
			vec![EditOp {
				start: 5,
				end: 9,
				text: String::new(),
			}],
		);
		assert!(content_changes_for_batch(&batch, OffsetEncoding::Utf16).is_none());
	}
}
