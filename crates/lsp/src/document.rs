//! Documents as seen by the client host.
//!
//! Hosts describe each buffer with a [`DocumentInfo`]: its uri, its
//! classification tags (most specific first), the scope it belongs to, and a
//! text snapshot. Edits arrive as [`EditBatch`] values so that sessions can
//! produce either incremental or full-content change events from the same
//! input.

use std::path::Path;

use lsp_types::Url;
use ropey::Rope;

use crate::definition::ServerDefinition;
use crate::workspace::SessionScope;

/// A host document eligible for language server attachment.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
	pub uri: Url,
	/// Classification tags, most specific first.
	pub tags: Vec<String>,
	pub scope: SessionScope,
	/// Text snapshot at the time this descriptor was taken.
	pub text: Rope,
}

impl DocumentInfo {
	pub fn new(uri: Url, scope: SessionScope) -> Self {
		Self {
			uri,
			tags: Vec::new(),
			scope,
			text: Rope::new(),
		}
	}

	pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
		self.tags = tags.into_iter().map(Into::into).collect();
		self
	}

	pub fn text(mut self, text: impl Into<Rope>) -> Self {
		self.text = text.into();
		self
	}
}

/// Protocol language id for `doc` under `definition`.
///
/// Falls back from the definition's tag mapping to the uri's file extension,
/// then to `"plaintext"`.
pub(crate) fn language_id(definition: &ServerDefinition, doc: &DocumentInfo) -> String {
	if let Some(id) = definition.language_for_tags(&doc.tags) {
		return id.to_owned();
	}
	Path::new(doc.uri.path())
		.extension()
		.and_then(|ext| ext.to_str())
		.map(str::to_owned)
		.unwrap_or_else(|| "plaintext".to_owned())
}

/// One text edit addressed in pre-edit char offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOp {
	/// Start char offset in the pre-edit text.
	pub start: usize,
	/// End char offset (exclusive) in the pre-edit text. Equal to `start`
	/// for pure insertions.
	pub end: usize,
	/// Replacement text.
	pub text: String,
}

/// A group of edits applied atomically to a document.
///
/// `before` is the text the ops are addressed against and `after` the result
/// of applying them. Ops must be non-overlapping and sorted ascending by
/// `start`.
#[derive(Debug, Clone)]
pub struct EditBatch {
	pub before: Rope,
	pub after: Rope,
	pub ops: Vec<EditOp>,
}

impl EditBatch {
	pub fn new(before: Rope, after: Rope, ops: Vec<EditOp>) -> Self {
		Self { before, after, ops }
	}

	/// A whole-document replacement, for hosts that do not track individual
	/// edits. Sessions fall back to full-content sync for these.
	pub fn replace(before: Rope, after: Rope) -> Self {
		Self {
			before,
			after,
			ops: Vec::new(),
		}
	}

	pub fn is_replace(&self) -> bool {
		self.ops.is_empty()
	}
}
