//! Keeps one attached document in step with its server.
//!
//! Each attachment tracks the authoritative text, the protocol version
//! counter and the sync shape the server asked for. Changes flow through the
//! session dispatcher, so a request submitted after an edit always reaches
//! the server after the matching `didChange`.
//!
//! Saving runs the protocol's save participants: `willSave` first, then
//! `willSaveWaitUntil` when the server offers it. That request is bounded by
//! the definition's timeout and guarded by a circuit breaker, because a
//! server that hangs there would otherwise stall every save. After three
//! consecutive failures the breaker opens, the user is told once, and later
//! saves skip the server silently (falling back to plain formatting when the
//! definition asks for it).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use lsp_types::notification::{
	DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument, DidSaveTextDocument,
	WillSaveTextDocument,
};
use lsp_types::request::{Formatting, RangeFormatting, WillSaveWaitUntil};
use lsp_types::{
	DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
	DidSaveTextDocumentParams, DocumentFormattingParams, DocumentRangeFormattingParams,
	FormattingOptions, Range, TextDocumentContentChangeEvent, TextDocumentIdentifier,
	TextDocumentItem, TextDocumentSaveReason, TextEdit, Url, VersionedTextDocumentIdentifier,
	WillSaveTextDocumentParams,
};
use parking_lot::RwLock;
use ropey::Rope;
use tracing::{debug, warn};

use crate::capabilities::{self, SyncKind, SyncPolicy};
use crate::changes::content_changes_for_batch;
use crate::definition::ServerDefinition;
use crate::document::{DocumentInfo, EditBatch, language_id};
use crate::position::{OffsetEncoding, char_range_to_lsp_range};
use crate::session::{Dispatcher, ServerSession, Task};
use crate::workspace::SessionScope;
use crate::{Error, Result};


/// Consecutive `willSaveWaitUntil` failures before the breaker opens.
const WSWU_FAILURE_LIMIT: u32 = 3;

/// Sync state for one document attached to one session.
pub(crate) struct DocumentSync {
	uri: Url,
	tags: Vec<String>,
	scope: SessionScope,
	text: RwLock<Rope>,
	language_id: String,
	definition: Arc<ServerDefinition>,
	policy: SyncPolicy,
	/// Protocol version counter. `didOpen` carries 1; every `didChange`
	/// takes the next value.
	version: AtomicI32,
	/// Escalate the next `didChange` to a full-text sync after a failure
	/// left the server's copy behind.
	force_full: AtomicBool,
	wswu_failures: AtomicU32,
	wswu_warned: AtomicBool,
}

impl DocumentSync {
	pub(crate) fn new(
		doc: DocumentInfo,
		definition: &Arc<ServerDefinition>,
		policy: SyncPolicy,
	) -> Self {
		let language_id = language_id(definition, &doc);
		let DocumentInfo {
			uri,
			tags,
			scope,
			text,
		} = doc;
		Self {
			uri,
			tags,
			scope,
			text: RwLock::new(text),
			language_id,
			definition: Arc::clone(definition),
			policy,
			version: AtomicI32::new(1),
			force_full: AtomicBool::new(false),
			wswu_failures: AtomicU32::new(0),
			wswu_warned: AtomicBool::new(false),
		}
	}

	pub(crate) fn uri(&self) -> &Url {
		&self.uri
	}

	/// Snapshot for reattaching after a restart, carrying the current text.
	pub(crate) fn document(&self) -> DocumentInfo {
		DocumentInfo {
			uri: self.uri.clone(),
			tags: self.tags.clone(),
			scope: self.scope.clone(),
			text: self.text.read().clone(),
		}
	}

	pub(crate) fn open(&self, dispatcher: &Dispatcher) -> Result<()> {
		if !self.policy.open_close {
			return Ok(());
		}
		let item = TextDocumentItem {
			uri: self.uri.clone(),
			language_id: self.language_id.clone(),
			version: self.version.load(Ordering::SeqCst),
			text: self.text.read().to_string(),
		};
		debug!(target: "lsp", uri = %self.uri, language = %item.language_id, "didOpen");
		dispatcher.submit(Task::Notify {
			label: "didOpen",
			run: Box::new(move |proxy| {
				proxy.notify::<DidOpenTextDocument>(DidOpenTextDocumentParams {
					text_document: item,
				})
			}),
		})
	}

	/// Forward an edit batch.
	///
	/// Incremental sync sends the batch's operations against their pre-edit
	/// coordinates; full sync and whole-document replacements send the
	/// post-edit text. A batch that cannot be expressed incrementally
	/// degrades to a full sync rather than being dropped.
	pub(crate) fn changed(
		&self,
		dispatcher: &Dispatcher,
		batch: &EditBatch,
		encoding: OffsetEncoding,
	) -> Result<()> {
		*self.text.write() = batch.after.clone();
		if self.policy.kind == SyncKind::None {
			return Ok(());
		}
		let incremental = if self.policy.kind == SyncKind::Incremental
			&& !self.force_full.swap(false, Ordering::SeqCst)
		{
			content_changes_for_batch(batch, encoding)
		} else {
			None
		};
		let content_changes = incremental.unwrap_or_else(|| {
			vec![TextDocumentContentChangeEvent {
				range: None,
				range_length: None,
				text: batch.after.to_string(),
			}]
		});
		let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
		let uri = self.uri.clone();
		debug!(target: "lsp", uri = %uri, version, changes = content_changes.len(), "didChange");
		let outcome = dispatcher.submit(Task::Notify {
			label: "didChange",
			run: Box::new(move |proxy| {
				proxy.notify::<DidChangeTextDocument>(DidChangeTextDocumentParams {
					text_document: VersionedTextDocumentIdentifier { uri, version },
					content_changes,
				})
			}),
		});
		if outcome.is_err() {
			// The server's copy is now behind.
			self.force_full.store(true, Ordering::SeqCst);
		}
		outcome
	}

	/// Run the save participants. Returns edits for the host to apply to the
	/// buffer before writing.
	pub(crate) async fn will_save(
		&self,
		session: &Arc<ServerSession>,
		regions: Option<Vec<(usize, usize)>>,
	) -> Vec<TextEdit> {
		if self.policy.will_save {
			let uri = self.uri.clone();
			let send = session
				.notify("willSave", move |proxy| {
					proxy.notify::<WillSaveTextDocument>(WillSaveTextDocumentParams {
						text_document: TextDocumentIdentifier { uri },
						reason: TextDocumentSaveReason::MANUAL,
					})
				})
				.await;
			if let Err(err) = send {
				if !err.is_cancelled() {
					debug!(uri = %self.uri, error = %err, "willSave failed");
				}
			}
		}

		if self.policy.will_save_wait_until && self.breaker_closed() {
			match self.will_save_wait_until(session).await {
				Ok(edits) => {
					self.wswu_failures.store(0, Ordering::SeqCst);
					self.wswu_warned.store(false, Ordering::SeqCst);
					return edits;
				}
				Err(err) if err.is_cancelled() => return Vec::new(),
				Err(err) => {
					let failures = self.wswu_failures.fetch_add(1, Ordering::SeqCst) + 1;
					warn!(uri = %self.uri, error = %err, failures, "willSaveWaitUntil failed");
					if failures >= WSWU_FAILURE_LIMIT
						&& !self.wswu_warned.swap(true, Ordering::SeqCst)
					{
						session.notice(format!(
							"Save participation for {} is disabled after {failures} consecutive willSaveWaitUntil failures",
							self.definition.id
						));
					}
					return Vec::new();
				}
			}
		}

		if self.definition.format_on_save {
			return self.format_for_save(session, regions).await;
		}
		Vec::new()
	}

	/// Report a completed save. The saved text rides along only when the
	/// server asked for it during capability negotiation.
	pub(crate) fn saved(&self, dispatcher: &Dispatcher, text: &Rope) -> Result<()> {
		*self.text.write() = text.clone();
		let Some(include_text) = self.policy.save else {
			return Ok(());
		};
		let uri = self.uri.clone();
		let body = include_text.then(|| text.to_string());
		debug!(target: "lsp", uri = %uri, "didSave");
		dispatcher.submit(Task::Notify {
			label: "didSave",
			run: Box::new(move |proxy| {
				proxy.notify::<DidSaveTextDocument>(DidSaveTextDocumentParams {
					text_document: TextDocumentIdentifier { uri },
					text: body,
				})
			}),
		})
	}

	pub(crate) fn close(&self, dispatcher: &Dispatcher) -> Result<()> {
		if !self.policy.open_close {
			return Ok(());
		}
		let uri = self.uri.clone();
		debug!(target: "lsp", uri = %uri, "didClose");
		dispatcher.submit(Task::Notify {
			label: "didClose",
			run: Box::new(move |proxy| {
				proxy.notify::<DidCloseTextDocument>(DidCloseTextDocumentParams {
					text_document: TextDocumentIdentifier { uri },
				})
			}),
		})
	}

	fn breaker_closed(&self) -> bool {
		self.wswu_failures.load(Ordering::SeqCst) < WSWU_FAILURE_LIMIT
	}

	async fn will_save_wait_until(&self, session: &Arc<ServerSession>) -> Result<Vec<TextEdit>> {
		let uri = self.uri.clone();
		let timeout = self.definition.will_save_timeout();
		let submitted = session
			.execute("willSaveWaitUntil", move |proxy| async move {
				proxy
					.request::<WillSaveWaitUntil>(WillSaveTextDocumentParams {
						text_document: TextDocumentIdentifier { uri },
						reason: TextDocumentSaveReason::MANUAL,
					})
					.await
			})
			.await?;
		match tokio::time::timeout(timeout, submitted).await {
			Ok(result) => Ok(result?.unwrap_or_default()),
			// Dropping the handle on timeout cancels the dispatched work.
			Err(_) => Err(Error::Timeout("textDocument/willSaveWaitUntil", timeout)),
		}
	}

	async fn format_for_save(
		&self,
		session: &Arc<ServerSession>,
		regions: Option<Vec<(usize, usize)>>,
	) -> Vec<TextEdit> {
		let Some(caps) = session.capabilities() else {
			return Vec::new();
		};
		let encoding = session.offset_encoding();
		let options = FormattingOptions {
			tab_size: 4,
			insert_spaces: true,
			..Default::default()
		};

		// Dirty regions format selectively when the server can; otherwise
		// the whole document goes.
		let ranges = regions.and_then(|regions| {
			if !capabilities::supports_range_formatting(&caps) {
				return None;
			}
			let text = self.text.read();
			let mut out = Vec::new();
			for (start, end) in regions {
				out.push(char_range_to_lsp_range(&text, start, end, encoding)?);
			}
			Some(out)
		});

		let result = match ranges {
			Some(ranges) if !ranges.is_empty() => self.range_format(session, ranges, options).await,
			_ if capabilities::supports_formatting(&caps) => {
				self.full_format(session, options).await
			}
			_ => Ok(Vec::new()),
		};
		match result {
			Ok(edits) => edits,
			Err(err) => {
				if !err.is_cancelled() {
					debug!(uri = %self.uri, error = %err, "format on save failed");
				}
				Vec::new()
			}
		}
	}

	async fn full_format(
		&self,
		session: &Arc<ServerSession>,
		options: FormattingOptions,
	) -> Result<Vec<TextEdit>> {
		let uri = self.uri.clone();
		let submitted = session
			.execute("formatting", move |proxy| async move {
				proxy
					.request::<Formatting>(DocumentFormattingParams {
						text_document: TextDocumentIdentifier { uri },
						options,
						work_done_progress_params: Default::default(),
					})
					.await
			})
			.await?;
		Ok(submitted.await?.unwrap_or_default())
	}

	async fn range_format(
		&self,
		session: &Arc<ServerSession>,
		ranges: Vec<Range>,
		options: FormattingOptions,
	) -> Result<Vec<TextEdit>> {
		let mut edits = Vec::new();
		for range in ranges {
			let uri = self.uri.clone();
			let options = options.clone();
			let submitted = session
				.execute("rangeFormatting", move |proxy| async move {
					proxy
						.request::<RangeFormatting>(DocumentRangeFormattingParams {
							text_document: TextDocumentIdentifier { uri },
							range,
							options,
							work_done_progress_params: Default::default(),
						})
						.await
				})
				.await?;
			if let Some(mut batch) = submitted.await? {
				edits.append(&mut batch);
			}
		}
		Ok(edits)
	}
}
