//! Capability descriptors and negotiated capability state.
//!
//! Two halves live here: what we announce to servers
//! ([`client_capabilities`]) and what servers announced to us
//! ([`CapabilitySet`]). The set keeps the `initialize` result as an immutable
//! base and layers dynamic registrations over it in arrival order; the
//! effective view is recomposed from scratch on every change, so removing a
//! registration never needs an inverse patch.

use std::sync::Arc;

use lsp_types::{
	ClientCapabilities, CodeActionClientCapabilities, CodeActionKindLiteralSupport,
	CodeActionLiteralSupport, CodeActionOptions, CodeActionProviderCapability,
	CompletionClientCapabilities, CompletionItemCapability, CompletionItemCapabilityResolveSupport,
	CompletionItemTag, DiagnosticClientCapabilities, DidChangeWatchedFilesClientCapabilities,
	DocumentSymbolClientCapabilities, DynamicRegistrationClientCapabilities, FailureHandlingKind,
	GeneralClientCapabilities, HoverClientCapabilities, HoverProviderCapability,
	InlayHintClientCapabilities, MarkupKind, OneOf, PositionEncodingKind,
	PublishDiagnosticsClientCapabilities, Registration, RenameClientCapabilities, RenameOptions,
	ResourceOperationKind, ServerCapabilities, SignatureHelpClientCapabilities, TagSupport,
	TextDocumentClientCapabilities, TextDocumentSyncCapability, TextDocumentSyncClientCapabilities,
	TextDocumentSyncKind, TextDocumentSyncSaveOptions, WindowClientCapabilities,
	WorkspaceClientCapabilities, WorkspaceEditClientCapabilities,
	WorkspaceSymbolClientCapabilities,
};
use serde::de::DeserializeOwned;

use crate::JsonValue;

/// Capabilities this host announces during the `initialize` handshake.
pub fn client_capabilities(enable_snippets: bool) -> ClientCapabilities {
	ClientCapabilities {
		workspace: Some(WorkspaceClientCapabilities {
			apply_edit: Some(true),
			workspace_edit: Some(WorkspaceEditClientCapabilities {
				document_changes: Some(true),
				resource_operations: Some(vec![
					ResourceOperationKind::Create,
					ResourceOperationKind::Rename,
					ResourceOperationKind::Delete,
				]),
				failure_handling: Some(FailureHandlingKind::Abort),
				normalizes_line_endings: Some(false),
				..Default::default()
			}),
			did_change_configuration: Some(DynamicRegistrationClientCapabilities {
				dynamic_registration: Some(false),
			}),
			did_change_watched_files: Some(DidChangeWatchedFilesClientCapabilities {
				dynamic_registration: Some(true),
				..Default::default()
			}),
			symbol: Some(WorkspaceSymbolClientCapabilities {
				dynamic_registration: Some(false),
				..Default::default()
			}),
			execute_command: Some(DynamicRegistrationClientCapabilities {
				dynamic_registration: Some(false),
			}),
			workspace_folders: Some(true),
			configuration: Some(true),
			..Default::default()
		}),
		text_document: Some(TextDocumentClientCapabilities {
			synchronization: Some(TextDocumentSyncClientCapabilities {
				dynamic_registration: Some(false),
				will_save: Some(true),
				will_save_wait_until: Some(true),
				did_save: Some(true),
			}),
			completion: Some(CompletionClientCapabilities {
				completion_item: Some(CompletionItemCapability {
					snippet_support: Some(enable_snippets),
					deprecated_support: Some(true),
					insert_replace_support: Some(true),
					tag_support: Some(TagSupport {
						value_set: vec![CompletionItemTag::DEPRECATED],
					}),
					resolve_support: Some(CompletionItemCapabilityResolveSupport {
						properties: vec![
							"documentation".to_owned(),
							"detail".to_owned(),
							"additionalTextEdits".to_owned(),
						],
					}),
					..Default::default()
				}),
				context_support: Some(true),
				..Default::default()
			}),
			hover: Some(HoverClientCapabilities {
				content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
				..Default::default()
			}),
			signature_help: Some(SignatureHelpClientCapabilities {
				context_support: Some(true),
				..Default::default()
			}),
			document_symbol: Some(DocumentSymbolClientCapabilities {
				hierarchical_document_symbol_support: Some(true),
				..Default::default()
			}),
			code_action: Some(CodeActionClientCapabilities {
				code_action_literal_support: Some(CodeActionLiteralSupport {
					code_action_kind: CodeActionKindLiteralSupport {
						value_set: vec![
							"".to_owned(),
							"quickfix".to_owned(),
							"refactor".to_owned(),
							"refactor.extract".to_owned(),
							"refactor.inline".to_owned(),
							"refactor.rewrite".to_owned(),
							"source".to_owned(),
							"source.organizeImports".to_owned(),
						],
					},
				}),
				is_preferred_support: Some(true),
				disabled_support: Some(true),
				data_support: Some(true),
				..Default::default()
			}),
			rename: Some(RenameClientCapabilities {
				prepare_support: Some(true),
				..Default::default()
			}),
			publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
				related_information: Some(true),
				version_support: Some(true),
				..Default::default()
			}),
			inlay_hint: Some(InlayHintClientCapabilities {
				dynamic_registration: Some(false),
				..Default::default()
			}),
			diagnostic: Some(DiagnosticClientCapabilities {
				related_document_support: Some(true),
				..Default::default()
			}),
			..Default::default()
		}),
		window: Some(WindowClientCapabilities {
			work_done_progress: Some(true),
			..Default::default()
		}),
		general: Some(GeneralClientCapabilities {
			position_encodings: Some(vec![
				PositionEncodingKind::UTF8,
				PositionEncodingKind::UTF32,
				PositionEncodingKind::UTF16,
			]),
			..Default::default()
		}),
		..Default::default()
	}
}

/// Workspace folder support advertised by a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkspaceFolderSupport {
	pub supported: bool,
	/// Whether the server wants `didChangeWorkspaceFolders` notifications.
	pub change_notifications: bool,
}

pub fn workspace_folder_support(caps: &ServerCapabilities) -> WorkspaceFolderSupport {
	let Some(folders) = caps
		.workspace
		.as_ref()
		.and_then(|ws| ws.workspace_folders.as_ref())
	else {
		return WorkspaceFolderSupport::default();
	};
	WorkspaceFolderSupport {
		supported: folders.supported == Some(true),
		change_notifications: matches!(
			folders.change_notifications,
			Some(OneOf::Left(true)) | Some(OneOf::Right(_))
		),
	}
}

/// How a server wants document content synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncKind {
	#[default]
	None,
	Full,
	Incremental,
}

/// Snapshot of the sync-related server capabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncPolicy {
	pub kind: SyncKind,
	pub open_close: bool,
	pub will_save: bool,
	pub will_save_wait_until: bool,
	/// `Some` when the server wants `didSave`; the flag is whether to
	/// include the full text.
	pub save: Option<bool>,
}

impl SyncPolicy {
	pub fn of(caps: &ServerCapabilities) -> SyncPolicy {
		match caps.text_document_sync.as_ref() {
			None => SyncPolicy::default(),
			// The bare numeric form implies the legacy open/close/save
			// lifecycle.
			Some(TextDocumentSyncCapability::Kind(kind)) => SyncPolicy {
				kind: sync_kind(*kind),
				open_close: true,
				will_save: false,
				will_save_wait_until: false,
				save: Some(false),
			},
			Some(TextDocumentSyncCapability::Options(opts)) => SyncPolicy {
				kind: opts.change.map(sync_kind).unwrap_or_default(),
				open_close: opts.open_close.unwrap_or(false),
				will_save: opts.will_save.unwrap_or(false),
				will_save_wait_until: opts.will_save_wait_until.unwrap_or(false),
				save: opts.save.as_ref().and_then(|save| match save {
					TextDocumentSyncSaveOptions::Supported(true) => Some(false),
					TextDocumentSyncSaveOptions::Supported(false) => None,
					TextDocumentSyncSaveOptions::SaveOptions(opts) => {
						Some(opts.include_text.unwrap_or(false))
					}
				}),
			},
		}
	}
}

fn sync_kind(kind: TextDocumentSyncKind) -> SyncKind {
	match kind {
		TextDocumentSyncKind::FULL => SyncKind::Full,
		TextDocumentSyncKind::INCREMENTAL => SyncKind::Incremental,
		_ => SyncKind::None,
	}
}

#[derive(Debug, Clone)]
struct Overlay {
	id: String,
	method: String,
	options: Option<JsonValue>,
}

/// Negotiated capabilities of one running server.
///
/// Holds the `initialize` result as the immutable base plus the ordered list
/// of dynamic registrations currently in effect.
#[derive(Debug, Clone)]
pub struct CapabilitySet {
	base: ServerCapabilities,
	overlays: Vec<Overlay>,
	effective: Arc<ServerCapabilities>,
}

impl CapabilitySet {
	pub fn new(base: ServerCapabilities) -> Self {
		let effective = Arc::new(base.clone());
		Self {
			base,
			overlays: Vec::new(),
			effective,
		}
	}

	/// Current effective capabilities: the base with all overlays applied.
	pub fn snapshot(&self) -> Arc<ServerCapabilities> {
		Arc::clone(&self.effective)
	}

	/// Apply a `client/registerCapability` entry.
	pub fn register(&mut self, registration: Registration) {
		self.overlays.push(Overlay {
			id: registration.id,
			method: registration.method,
			options: registration.register_options,
		});
		self.recompose();
	}

	/// Remove a registration by id. Returns `false` for unknown ids, which
	/// are ignored.
	pub fn unregister(&mut self, id: &str) -> bool {
		let before = self.overlays.len();
		self.overlays.retain(|overlay| overlay.id != id);
		let removed = self.overlays.len() != before;
		if removed {
			self.recompose();
		}
		removed
	}

	/// Whether a dynamic registration for `method` is currently in effect.
	/// This also answers for methods without a provider slot in
	/// [`ServerCapabilities`], such as file watchers.
	pub fn has_registration(&self, method: &str) -> bool {
		self.overlays.iter().any(|overlay| overlay.method == method)
	}

	fn recompose(&mut self) {
		let mut caps = self.base.clone();
		for overlay in &self.overlays {
			apply_overlay(&mut caps, overlay);
		}
		self.effective = Arc::new(caps);
	}
}

fn parse_options<T: DeserializeOwned>(options: &Option<JsonValue>) -> Option<T> {
	options
		.clone()
		.and_then(|value| serde_json::from_value(value).ok())
}

fn apply_overlay(caps: &mut ServerCapabilities, overlay: &Overlay) {
	match overlay.method.as_str() {
		"textDocument/completion" => {
			caps.completion_provider = Some(parse_options(&overlay.options).unwrap_or_default());
		}
		"textDocument/hover" => {
			caps.hover_provider = Some(HoverProviderCapability::Simple(true));
		}
		"textDocument/definition" => {
			caps.definition_provider = Some(OneOf::Left(true));
		}
		"textDocument/references" => {
			caps.references_provider = Some(OneOf::Left(true));
		}
		"textDocument/documentSymbol" => {
			caps.document_symbol_provider = Some(OneOf::Left(true));
		}
		"textDocument/formatting" => {
			caps.document_formatting_provider = Some(OneOf::Left(true));
		}
		"textDocument/rangeFormatting" => {
			caps.document_range_formatting_provider = Some(OneOf::Left(true));
		}
		"textDocument/rename" => {
			caps.rename_provider = Some(match parse_options::<RenameOptions>(&overlay.options) {
				Some(opts) => OneOf::Right(opts),
				None => OneOf::Left(true),
			});
		}
		"textDocument/codeAction" => {
			caps.code_action_provider =
				Some(match parse_options::<CodeActionOptions>(&overlay.options) {
					Some(opts) => CodeActionProviderCapability::Options(opts),
					None => CodeActionProviderCapability::Simple(true),
				});
		}
		"textDocument/signatureHelp" => {
			caps.signature_help_provider =
				Some(parse_options(&overlay.options).unwrap_or_default());
		}
		"workspace/executeCommand" => {
			caps.execute_command_provider =
				Some(parse_options(&overlay.options).unwrap_or_default());
		}
		"workspace/symbol" => {
			caps.workspace_symbol_provider = Some(OneOf::Left(true));
		}
		// No provider slot to patch; the registration is still tracked by id
		// and visible through has_registration.
		_ => {}
	}
}

fn provided<T>(provider: &Option<OneOf<bool, T>>) -> bool {
	!matches!(provider, None | Some(OneOf::Left(false)))
}

pub fn supports_hover(caps: &ServerCapabilities) -> bool {
	!matches!(
		caps.hover_provider,
		None | Some(HoverProviderCapability::Simple(false))
	)
}

pub fn supports_completion(caps: &ServerCapabilities) -> bool {
	caps.completion_provider.is_some()
}

pub fn supports_definition(caps: &ServerCapabilities) -> bool {
	provided(&caps.definition_provider)
}

pub fn supports_references(caps: &ServerCapabilities) -> bool {
	provided(&caps.references_provider)
}

pub fn supports_document_symbol(caps: &ServerCapabilities) -> bool {
	provided(&caps.document_symbol_provider)
}

pub fn supports_formatting(caps: &ServerCapabilities) -> bool {
	provided(&caps.document_formatting_provider)
}

pub fn supports_range_formatting(caps: &ServerCapabilities) -> bool {
	provided(&caps.document_range_formatting_provider)
}

pub fn supports_rename(caps: &ServerCapabilities) -> bool {
	provided(&caps.rename_provider)
}

pub fn supports_workspace_symbol(caps: &ServerCapabilities) -> bool {
	provided(&caps.workspace_symbol_provider)
}

pub fn supports_code_action(caps: &ServerCapabilities) -> bool {
	!matches!(
		caps.code_action_provider,
		None | Some(CodeActionProviderCapability::Simple(false))
	)
}

pub fn supports_execute_command(caps: &ServerCapabilities) -> bool {
	caps.execute_command_provider.is_some()
}

pub fn supports_signature_help(caps: &ServerCapabilities) -> bool {
	caps.signature_help_provider.is_some()
}
