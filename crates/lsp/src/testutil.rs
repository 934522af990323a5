//! In-process scripted language servers for tests.
//!
//! [`ScriptedServers`] is a [`ConnectionProvider`] that wires every session to
//! a fake server over in-memory duplex pipes instead of spawning a process.
//! Each definition id maps to a [`ServerScript`]: canned request replies,
//! delays and hangs, plus a log of every message the fake server received, so
//! tests can assert on wire order without a real child process.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_lsp::router::Router;
use async_lsp::{ClientSocket, ErrorCode, MainLoop, ResponseError};
use async_trait::async_trait;
use lsp_types::request::WorkspaceFoldersRequest;
use lsp_types::{
	Diagnostic, InitializeResult, OneOf, ServerCapabilities, TextDocumentSyncCapability,
	TextDocumentSyncKind, TextDocumentSyncOptions, TextDocumentSyncSaveOptions, Url,
	WorkspaceFoldersServerCapabilities, WorkspaceServerCapabilities,
};
use parking_lot::Mutex;
use ropey::Rope;
use tokio::sync::{Notify, watch};
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

use crate::definition::ServerDefinition;
use crate::document::{DocumentInfo, EditBatch, EditOp};
use crate::event::{LspEventHandler, SharedEventHandler};
use crate::registry::{MemorySettings, SessionRegistry, SettingsStore};
use crate::session::{ServerSession, SessionId, SessionState};
use crate::transport::{ConnectionProvider, ServerIo};
use crate::workspace::SessionScope;
use crate::{Error, JsonValue, Result};

/// One message the fake server received, in arrival order.
#[derive(Debug, Clone)]
pub(crate) struct Recorded {
	pub method: String,
	pub params: JsonValue,
}

#[derive(Clone)]
enum Reply {
	Value(JsonValue),
	Error(String),
	After(Duration, JsonValue),
	Hang,
}

/// Behavior and observation surface of one fake server.
pub(crate) struct ServerScript {
	capabilities: Mutex<ServerCapabilities>,
	replies: Mutex<HashMap<String, Reply>>,
	log: Mutex<Vec<Recorded>>,
	/// Bumped once per recorded message; lets waiters sleep without polling.
	seq: watch::Sender<usize>,
	spawns: AtomicUsize,
	started: Notify,
	gate: Mutex<Option<Arc<Notify>>>,
	spawn_error: Mutex<Option<String>>,
	clients: Mutex<Vec<ClientSocket>>,
}

impl ServerScript {
	fn new() -> Self {
		let (seq, _) = watch::channel(0);
		Self {
			capabilities: Mutex::new(caps(sync_options())),
			replies: Mutex::new(HashMap::new()),
			log: Mutex::new(Vec::new()),
			seq,
			spawns: AtomicUsize::new(0),
			started: Notify::new(),
			gate: Mutex::new(None),
			spawn_error: Mutex::new(None),
			clients: Mutex::new(Vec::new()),
		}
	}

	/// Capabilities returned from the next `initialize`.
	pub(crate) fn set_capabilities(&self, caps: ServerCapabilities) {
		*self.capabilities.lock() = caps;
	}

	pub(crate) fn respond(&self, method: &str, value: JsonValue) {
		self.replies
			.lock()
			.insert(method.to_owned(), Reply::Value(value));
	}

	pub(crate) fn respond_after(&self, method: &str, delay: Duration, value: JsonValue) {
		self.replies
			.lock()
			.insert(method.to_owned(), Reply::After(delay, value));
	}

	pub(crate) fn fail(&self, method: &str, message: &str) {
		self.replies
			.lock()
			.insert(method.to_owned(), Reply::Error(message.to_owned()));
	}

	pub(crate) fn hang(&self, method: &str) {
		self.replies.lock().insert(method.to_owned(), Reply::Hang);
	}

	/// Drop a scripted reply, falling back to the default behavior.
	pub(crate) fn reset(&self, method: &str) {
		self.replies.lock().remove(method);
	}

	/// Make every spawn fail before any bytes flow.
	pub(crate) fn fail_spawns(&self, message: &str) {
		*self.spawn_error.lock() = Some(message.to_owned());
	}

	/// Hold spawns at the door until the returned handle is notified, one
	/// release per spawn.
	pub(crate) fn hold_spawns(&self) -> Arc<Notify> {
		let gate = Arc::new(Notify::new());
		*self.gate.lock() = Some(Arc::clone(&gate));
		gate
	}

	/// Resolve once `spawn` has been entered since the last call.
	pub(crate) async fn spawn_entered(&self) {
		self.started.notified().await;
	}

	pub(crate) fn spawn_count(&self) -> usize {
		self.spawns.load(Ordering::SeqCst)
	}

	/// Socket of the most recent incarnation, for server-initiated traffic.
	pub(crate) fn client(&self) -> ClientSocket {
		self.clients
			.lock()
			.last()
			.cloned()
			.expect("server was never spawned")
	}

	pub(crate) fn methods(&self) -> Vec<String> {
		self.log.lock().iter().map(|rec| rec.method.clone()).collect()
	}

	pub(crate) fn count(&self, method: &str) -> usize {
		self.log
			.lock()
			.iter()
			.filter(|rec| rec.method == method)
			.count()
	}

	/// Params of every received `method` message, in arrival order.
	pub(crate) fn params(&self, method: &str) -> Vec<JsonValue> {
		self.log
			.lock()
			.iter()
			.filter(|rec| rec.method == method)
			.map(|rec| rec.params.clone())
			.collect()
	}

	/// Resolve once at least `count` messages of `method` were received.
	pub(crate) async fn wait_for(&self, method: &str, count: usize) {
		let mut rx = self.seq.subscribe();
		loop {
			if self.count(method) >= count {
				return;
			}
			if rx.changed().await.is_err() {
				return;
			}
		}
	}

	/// Round trip through both mainloops. Once it resolves, everything the
	/// session put on the wire earlier has been handled by the fake server.
	pub(crate) async fn barrier(&self) {
		let _ = self.client().request::<WorkspaceFoldersRequest>(()).await;
	}

	/// Kill the current incarnation without a shutdown handshake, as a
	/// crashed server would.
	pub(crate) fn terminate(&self) {
		let _ = self.client().emit(StopLoop);
	}

	fn record(&self, method: &str, params: JsonValue) {
		self.log.lock().push(Recorded {
			method: method.to_owned(),
			params,
		});
		self.seq.send_modify(|n| *n += 1);
	}

	fn reply_for(&self, method: &str) -> Reply {
		if let Some(reply) = self.replies.lock().get(method) {
			return reply.clone();
		}
		match method {
			"initialize" => {
				let result = InitializeResult {
					capabilities: self.capabilities.lock().clone(),
					server_info: None,
				};
				Reply::Value(serde_json::to_value(result).unwrap())
			}
			"shutdown" => Reply::Value(JsonValue::Null),
			_ => Reply::Error(format!("method not found: {method}")),
		}
	}
}

struct ScriptState {
	script: Arc<ServerScript>,
}

/// Loopback event that makes the fake server's mainloop end abruptly.
struct StopLoop;

fn script_router(script: Arc<ServerScript>) -> Router<ScriptState> {
	let mut router = Router::new(ScriptState { script });
	router
		.event::<StopLoop>(|_, _| ControlFlow::Break(Ok(())))
		.unhandled_request(|st, req| {
			st.script.record(&req.method, req.params.clone());
			let reply = st.script.reply_for(&req.method);
			async move {
				match reply {
					Reply::Value(value) => Ok(value),
					Reply::Error(message) => {
						Err(ResponseError::new(ErrorCode::REQUEST_FAILED, message))
					}
					Reply::After(delay, value) => {
						tokio::time::sleep(delay).await;
						Ok(value)
					}
					Reply::Hang => {
						std::future::pending::<()>().await;
						Ok(JsonValue::Null)
					}
				}
			}
		})
		.unhandled_notification(|st, notif| {
			st.script.record(&notif.method, notif.params.clone());
			if notif.method == "exit" {
				ControlFlow::Break(Ok(()))
			} else {
				ControlFlow::Continue(())
			}
		});
	router
}

/// Connection provider backed by scripted in-process servers, one script per
/// definition id.
#[derive(Default)]
pub(crate) struct ScriptedServers {
	scripts: Mutex<HashMap<String, Arc<ServerScript>>>,
}

impl ScriptedServers {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Script for a definition id, created on first use.
	pub(crate) fn script(&self, id: &str) -> Arc<ServerScript> {
		Arc::clone(
			self.scripts
				.lock()
				.entry(id.to_owned())
				.or_insert_with(|| Arc::new(ServerScript::new())),
		)
	}
}

#[async_trait]
impl ConnectionProvider for ScriptedServers {
	async fn spawn(&self, definition: &ServerDefinition, _scope: &SessionScope) -> Result<ServerIo> {
		let script = self.script(definition.id.as_str());
		script.spawns.fetch_add(1, Ordering::SeqCst);
		script.started.notify_one();
		if let Some(message) = script.spawn_error.lock().clone() {
			return Err(Error::Transport(message));
		}
		let gate = script.gate.lock().clone();
		if let Some(gate) = gate {
			gate.notified().await;
		}

		let (editor_end, server_end) = tokio::io::duplex(64 * 1024);
		let (server_read, server_write) = tokio::io::split(server_end);
		let (mainloop, client) = {
			let script = Arc::clone(&script);
			MainLoop::new_server(move |_client| script_router(script))
		};
		script.clients.lock().push(client);
		tokio::spawn(async move {
			let _ = mainloop
				.run_buffered(server_read.compat(), server_write.compat_write())
				.await;
		});

		let (editor_read, editor_write) = tokio::io::split(editor_end);
		Ok(ServerIo {
			reader: Box::new(editor_read),
			writer: Box::new(editor_write),
			stderr: None,
			child: None,
		})
	}
}

/// Event handler that records what the host would have rendered.
#[derive(Default)]
pub(crate) struct RecordingHandler {
	pub notices: Mutex<Vec<String>>,
	pub diagnostics: Mutex<Vec<(Url, Vec<Diagnostic>)>>,
	pub states: Mutex<Vec<SessionState>>,
}

impl LspEventHandler for RecordingHandler {
	fn on_diagnostics(
		&self,
		_server: SessionId,
		uri: Url,
		_version: Option<i32>,
		diagnostics: Vec<Diagnostic>,
	) {
		self.diagnostics.lock().push((uri, diagnostics));
	}

	fn on_state_change(&self, _server: SessionId, state: SessionState) {
		self.states.lock().push(state);
	}

	fn on_notice(&self, _server: SessionId, message: String) {
		self.notices.lock().push(message);
	}
}

/// Everything a test needs: scripted servers, a recording event handler and a
/// registry wired to both.
pub(crate) struct Host {
	pub servers: Arc<ScriptedServers>,
	pub events: Arc<RecordingHandler>,
	pub registry: Arc<SessionRegistry>,
	pub settings: Arc<MemorySettings>,
}

impl Host {
	/// A standalone session outside the registry, sharing the host's scripts
	/// and event sink.
	pub(crate) fn session(
		&self,
		definition: ServerDefinition,
		scope: &SessionScope,
	) -> Arc<ServerSession> {
		ServerSession::new(
			Arc::new(definition),
			scope.clone(),
			Arc::clone(&self.servers) as Arc<dyn ConnectionProvider>,
			Arc::clone(&self.events) as SharedEventHandler,
		)
	}
}

pub(crate) fn host() -> Host {
	let _ = tracing_subscriber::fmt::try_init();
	let servers = ScriptedServers::new();
	let events = Arc::new(RecordingHandler::default());
	let settings = Arc::new(MemorySettings::default());
	let registry = Arc::new(SessionRegistry::new(
		Arc::clone(&servers) as Arc<dyn ConnectionProvider>,
		Arc::clone(&events) as SharedEventHandler,
		Arc::clone(&settings) as Arc<dyn SettingsStore>,
	));
	Host {
		servers,
		events,
		registry,
		settings,
	}
}

/// Definition serving documents tagged `plain`.
pub(crate) fn definition(id: &str) -> ServerDefinition {
	ServerDefinition::new(id, id).language("plain", "plaintext")
}

pub(crate) fn doc(uri: &str, scope: &SessionScope, text: &str) -> DocumentInfo {
	DocumentInfo::new(Url::parse(uri).unwrap(), scope.clone())
		.tags(["plain"])
		.text(text)
}

/// Batch applying `ops` to `before`.
pub(crate) fn edit_batch(before: &str, ops: Vec<EditOp>) -> EditBatch {
	let before = Rope::from(before);
	let mut after = before.clone();
	let mut delta = 0isize;
	for op in &ops {
		let start = op.start.checked_add_signed(delta).unwrap();
		let end = op.end.checked_add_signed(delta).unwrap();
		after.remove(start..end);
		after.insert(start, &op.text);
		delta += op.text.chars().count() as isize - (op.end - op.start) as isize;
	}
	EditBatch::new(before, after, ops)
}

pub(crate) fn sync_options() -> TextDocumentSyncOptions {
	TextDocumentSyncOptions {
		open_close: Some(true),
		change: Some(TextDocumentSyncKind::FULL),
		will_save: Some(false),
		will_save_wait_until: Some(false),
		save: Some(TextDocumentSyncSaveOptions::Supported(false)),
	}
}

pub(crate) fn caps(options: TextDocumentSyncOptions) -> ServerCapabilities {
	ServerCapabilities {
		text_document_sync: Some(TextDocumentSyncCapability::Options(options)),
		..Default::default()
	}
}

/// Capabilities that additionally accept workspace folders and their change
/// notifications.
pub(crate) fn folder_caps(options: TextDocumentSyncOptions) -> ServerCapabilities {
	ServerCapabilities {
		workspace: Some(WorkspaceServerCapabilities {
			workspace_folders: Some(WorkspaceFoldersServerCapabilities {
				supported: Some(true),
				change_notifications: Some(OneOf::Left(true)),
			}),
			file_operations: None,
		}),
		..caps(options)
	}
}

/// Ad-hoc request answered by scripted replies.
pub(crate) enum EchoRequest {}

impl lsp_types::request::Request for EchoRequest {
	type Params = JsonValue;
	type Result = Option<String>;
	const METHOD: &'static str = "test/echo";
}

/// Ad-hoc request carrying a list result, for aggregation tests.
pub(crate) enum ItemsRequest {}

impl lsp_types::request::Request for ItemsRequest {
	type Params = JsonValue;
	type Result = Option<Vec<i32>>;
	const METHOD: &'static str = "test/items";
}
