//! Asynchronous multi-server [Language Server Protocol (LSP)][lsp] client host.
//!
//! [lsp]: https://microsoft.github.io/language-server-protocol/overviews/lsp/overview/
//!
//! This crate manages a fleet of language servers on behalf of a host
//! application. Each running server is a [`ServerSession`] that owns the child
//! process, the protocol connection, and a serialized dispatch queue. The
//! [`SessionRegistry`] maps documents and workspaces to sessions, starting
//! servers on demand and reusing running ones where their capabilities allow.
//! Fan-out requests across several servers go through the builders returned by
//! [`SessionRegistry::for_document`] and [`SessionRegistry::for_workspace`].
//!
//! - [`ServerSession`]: lifecycle and request dispatch for one server.
//! - [`SessionRegistry`]: definition table, tag mapping, session reuse.
//! - [`DispatchBuilder`]: collect/compute aggregation over matching sessions.
//! - [`CancellationTracker`]: host-side bulk cancellation of issued requests.
//!
//! Wire plumbing is delegated to [`async_lsp`]; this crate only decides which
//! servers run, what they are told, and in which order.

use std::sync::Arc;
use std::time::Duration;

/// Re-export of the [`lsp_types`] dependency of this crate.
pub use lsp_types;
pub use serde_json::Value as JsonValue;

mod cancel;
pub mod capabilities;
mod changes;
mod definition;
mod dispatch;
mod document;
mod event;
mod position;
mod registry;
mod router;
mod session;
mod sync;
#[cfg(test)]
mod testutil;
mod transport;
mod workspace;

pub use cancel::CancellationTracker;
pub use capabilities::{
	CapabilitySet, SyncKind, SyncPolicy, WorkspaceFolderSupport, client_capabilities,
};
pub use changes::content_changes_for_batch;
pub use definition::{DefinitionId, LaunchSpec, ServerDefinition};
pub use dispatch::{DispatchBuilder, non_empty};
pub use document::{DocumentInfo, EditBatch, EditOp};
pub use event::{LspEventHandler, NoOpEventHandler, SharedEventHandler};
pub use position::{
	OffsetEncoding, char_range_to_lsp_range, char_to_lsp_position, lsp_position_to_char,
	lsp_range_to_char_range,
};
pub use registry::{MemorySettings, SessionRegistry, SettingsStore};
pub use session::{ServerSession, SessionId, SessionProxy, SessionState, Submitted};
pub use transport::{ConnectionProvider, ProcessProvider, ServerIo};
pub use workspace::{FolderChange, SessionScope, Workspace, WorkspaceId};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
///
/// The enum is cloneable so that the outcome of one startup attempt can be
/// fanned out to every caller that joined it.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The byte transport failed: spawn error, broken pipe, or unexpected EOF.
	#[error("transport: {0}")]
	Transport(String),
	/// The server answered a request with a protocol-level error.
	#[error("{0}")]
	Server(#[from] async_lsp::ResponseError),
	/// A bounded wait elapsed before the operation completed.
	#[error("{0} timed out after {1:?}")]
	Timeout(&'static str, Duration),
	/// The operation was cancelled before it produced a result.
	///
	/// Cancellation is a cooperative signal, not a failure. It is rethrown
	/// unchanged across layers and never logged as an error.
	#[error("cancelled")]
	Cancelled,
	/// No reachable server advertises the capability the request needs.
	#[error("no server supports {0}")]
	CapabilityMismatch(&'static str),
	/// The session stopped before or while the operation was in flight.
	#[error("session stopped")]
	SessionStopped,
	/// The session's dispatch queue is full.
	#[error("dispatch queue full")]
	Backpressure,
	/// No server definition is registered under this id.
	#[error("unknown server definition {0}")]
	UnknownDefinition(DefinitionId),
	/// A request or response payload failed to (de)serialize.
	#[error("payload: {0}")]
	Json(Arc<serde_json::Error>),
}

impl From<async_lsp::Error> for Error {
	fn from(err: async_lsp::Error) -> Self {
		match err {
			async_lsp::Error::ServiceStopped => Error::SessionStopped,
			async_lsp::Error::Response(resp) => Error::Server(resp),
			async_lsp::Error::Deserialize(err) => Error::Json(Arc::new(err)),
			async_lsp::Error::Protocol(msg) => Error::Transport(msg),
			async_lsp::Error::Io(err) => Error::Transport(err.to_string()),
			async_lsp::Error::Eof => Error::Transport("connection closed".into()),
			async_lsp::Error::Routing(msg) => Error::Transport(msg),
			other => Error::Transport(other.to_string()),
		}
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Json(Arc::new(err))
	}
}

impl Error {
	/// Whether this is the cooperative cancellation signal.
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Error::Cancelled)
	}
}
