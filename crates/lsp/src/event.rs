//! Host-facing event surface.
//!
//! Server-initiated traffic that the host should see (diagnostics, progress,
//! log and show messages, workspace edits) is funneled through one
//! [`LspEventHandler`]. Handlers run on connection tasks and must stay cheap;
//! heavier work belongs on the host's own channels.

use std::sync::Arc;

use lsp_types::{Diagnostic, MessageType, ProgressParams, Url, WorkspaceEdit};

use crate::session::{SessionId, SessionState};

/// Callbacks for server-initiated traffic and session lifecycle changes.
///
/// All methods have no-op defaults so hosts implement only what they render.
pub trait LspEventHandler: Send + Sync {
	/// `textDocument/publishDiagnostics`.
	fn on_diagnostics(
		&self,
		_server: SessionId,
		_uri: Url,
		_version: Option<i32>,
		_diagnostics: Vec<Diagnostic>,
	) {
	}

	/// `$/progress`.
	fn on_progress(&self, _server: SessionId, _params: ProgressParams) {}

	/// `window/logMessage`.
	fn on_log_message(&self, _server: SessionId, _typ: MessageType, _message: String) {}

	/// `window/showMessage`.
	fn on_show_message(&self, _server: SessionId, _typ: MessageType, _message: String) {}

	/// A session changed lifecycle state.
	fn on_state_change(&self, _server: SessionId, _state: SessionState) {}

	/// `workspace/applyEdit`. Return `true` once the host has applied the
	/// edit; the server is answered accordingly.
	fn on_apply_edit(&self, _server: SessionId, _label: Option<&str>, _edit: &WorkspaceEdit) -> bool {
		false
	}

	/// One-time degradation notices meant for the user, such as a server's
	/// save participation being disabled after repeated timeouts.
	fn on_notice(&self, _server: SessionId, _message: String) {}
}

/// Shared, dynamically dispatched event handler.
pub type SharedEventHandler = Arc<dyn LspEventHandler>;

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEventHandler;

impl LspEventHandler for NoOpEventHandler {}
