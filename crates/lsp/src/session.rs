//! One running language server and its lifecycle.
//!
//! A [`ServerSession`] owns the spawned process (or other transport), the
//! protocol mainloop, the negotiated capabilities and the set of attached
//! documents. Sessions move through a fixed set of states:
//!
//! ```text
//! Unstarted ── start ──▶ Starting ── handshake ──▶ Active
//!     │                     │                        │
//!     └── stop ──▶ Stopped  └──── stop / failure ────┤
//!                     ▲                              ▼
//!                     └────────── teardown ───── Stopping
//! ```
//!
//! `Stopping` never goes back to `Starting` directly; a restart waits for
//! `Stopped` first. Starting is single-winner: concurrent callers join the
//! in-flight attempt and share its outcome. Stopping is likewise
//! single-winner, and the polite shutdown handshake runs on a background
//! task so no caller blocks on a misbehaving server.
//!
//! All outbound traffic goes through the session's dispatcher, a bounded
//! queue with one worker, which keeps `didChange` notifications and the
//! requests that depend on them in submission order.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_lsp::ServerSocket;
use futures::FutureExt;
use futures::future::BoxFuture;
use lsp_types::notification::{DidChangeWorkspaceFolders, Exit, Initialized};
use lsp_types::request::{Initialize, Shutdown};
use lsp_types::{
	ClientInfo, DidChangeWorkspaceFoldersParams, InitializeParams, InitializedParams, Registration,
	ServerCapabilities, TextEdit, Url, WorkspaceFolder, WorkspaceFoldersChangeEvent,
};
use parking_lot::{Mutex, RwLock};
use ropey::Rope;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capabilities::{
	self, CapabilitySet, SyncPolicy, WorkspaceFolderSupport, client_capabilities,
};
use crate::definition::ServerDefinition;
use crate::document::{DocumentInfo, EditBatch};
use crate::event::SharedEventHandler;
use crate::position::OffsetEncoding;
use crate::router::{RouterContext, build_router};
use crate::sync::DocumentSync;
use crate::transport::{ConnectionProvider, establish};
use crate::workspace::SessionScope;
use crate::{Error, Result};

mod dispatcher;

pub(crate) use dispatcher::{Dispatcher, Task};

/// How long the polite shutdown handshake may take before the connection is
/// torn down regardless.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one session instance. Unique within the process and never
/// reused, including across restarts of the same definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "LSP#{}", self.0)
	}
}

/// Lifecycle state of a [`ServerSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Unstarted,
	Starting,
	Active,
	Stopping,
	Stopped,
}

/// A unit of work accepted by a session's dispatcher.
///
/// Awaiting yields the closure's result. Dropping an unfinished handle
/// cancels the work, as does [`cancel`](Self::cancel).
pub struct Submitted<T> {
	rx: oneshot::Receiver<Result<T>>,
	cancel: CancellationToken,
	finished: bool,
}

impl<T> Submitted<T> {
	pub(crate) fn new(rx: oneshot::Receiver<Result<T>>, cancel: CancellationToken) -> Self {
		Self {
			rx,
			cancel,
			finished: false,
		}
	}

	/// Cancel the work. The handle then resolves to [`Error::Cancelled`].
	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	/// Token that cancels this work when triggered.
	pub fn cancel_token(&self) -> CancellationToken {
		self.cancel.clone()
	}
}

impl<T> fmt::Debug for Submitted<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Submitted")
			.field("finished", &self.finished)
			.finish_non_exhaustive()
	}
}

impl<T> Future for Submitted<T> {
	type Output = Result<T>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.get_mut();
		match Pin::new(&mut this.rx).poll(cx) {
			Poll::Ready(Ok(result)) => {
				this.finished = true;
				Poll::Ready(result)
			}
			// The reply slot was dropped without an answer, which only
			// happens when the work was discarded before running.
			Poll::Ready(Err(_)) => {
				this.finished = true;
				Poll::Ready(Err(Error::Cancelled))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

impl<T> Drop for Submitted<T> {
	fn drop(&mut self) {
		if !self.finished {
			self.cancel.cancel();
		}
	}
}

/// Handle passed to dispatched closures for talking to the server.
///
/// Cloning is cheap; the proxy stays valid for the lifetime of the
/// connection it was created for and fails with
/// [`Error::SessionStopped`] afterwards.
#[derive(Clone)]
pub struct SessionProxy {
	socket: ServerSocket,
	session: Weak<ServerSession>,
	server: SessionId,
}

impl SessionProxy {
	/// Issue a typed request.
	///
	/// The request is placed on the wire before the returned future first
	/// suspends, so closures that call this before any other await keep the
	/// dispatcher's submission order.
	pub fn request<R>(
		&self,
		params: R::Params,
	) -> impl Future<Output = Result<R::Result>> + Send + 'static
	where
		R: lsp_types::request::Request,
		R::Params: Send + 'static,
		R::Result: Send + 'static,
	{
		let socket = self.socket.clone();
		async move { socket.request::<R>(params).await.map_err(Error::from) }
	}

	/// Send a typed notification. Delivery order follows call order.
	pub fn notify<N>(&self, params: N::Params) -> Result<()>
	where
		N: lsp_types::notification::Notification,
	{
		self.socket.notify::<N>(params).map_err(Error::from)
	}

	/// Effective capabilities of the session this proxy belongs to.
	pub fn capabilities(&self) -> Option<Arc<ServerCapabilities>> {
		self.session.upgrade().and_then(|session| session.capabilities())
	}

	/// Position encoding negotiated with the server.
	pub fn offset_encoding(&self) -> OffsetEncoding {
		self.session
			.upgrade()
			.map(|session| session.offset_encoding())
			.unwrap_or_default()
	}

	pub fn server(&self) -> SessionId {
		self.server
	}
}

impl fmt::Debug for SessionProxy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SessionProxy")
			.field("server", &self.server)
			.finish_non_exhaustive()
	}
}

/// State tied to one incarnation of the connection. Replaced wholesale on
/// restart, so stale handles can be told apart by generation.
struct LiveLink {
	generation: u64,
	socket: ServerSocket,
	dispatcher: Dispatcher,
	mainloop: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Armed while a start attempt is in flight on some caller's task. Dropping
/// it armed means that task went away mid-handshake; the attempt is then
/// declared cancelled and torn down.
struct StartAttempt {
	session: Arc<ServerSession>,
	armed: bool,
}

impl Drop for StartAttempt {
	fn drop(&mut self) {
		if self.armed {
			self.session
				.init_result
				.send_replace(Some(Err(Error::Cancelled)));
			self.session.begin_stop();
		}
	}
}

/// One language server instance bound to a scope.
pub struct ServerSession {
	id: SessionId,
	definition: Arc<ServerDefinition>,
	scope: SessionScope,
	provider: Arc<dyn ConnectionProvider>,
	handler: SharedEventHandler,
	state: watch::Sender<SessionState>,
	/// Outcome feed of the current start attempt. `None` while one is in
	/// flight; joiners wait on it instead of racing their own handshake.
	init_result: watch::Sender<Option<Result<()>>>,
	init_cancel: Mutex<Option<CancellationToken>>,
	live: Mutex<Option<Arc<LiveLink>>>,
	capabilities: RwLock<Option<CapabilitySet>>,
	encoding: RwLock<OffsetEncoding>,
	folder_support: RwLock<WorkspaceFolderSupport>,
	documents: Mutex<HashMap<Url, Arc<DocumentSync>>>,
	/// Scopes announced to this server: the one it was started for plus any
	/// adopted later via workspace folders.
	scopes: Mutex<Vec<SessionScope>>,
	idle: Mutex<Option<CancellationToken>>,
	generation: AtomicU64,
}

impl ServerSession {
	pub fn new(
		definition: Arc<ServerDefinition>,
		scope: SessionScope,
		provider: Arc<dyn ConnectionProvider>,
		handler: SharedEventHandler,
	) -> Arc<Self> {
		let (state, _) = watch::channel(SessionState::Unstarted);
		let (init_result, _) = watch::channel(None);
		Arc::new(Self {
			id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
			scopes: Mutex::new(vec![scope.clone()]),
			definition,
			scope,
			provider,
			handler,
			state,
			init_result,
			init_cancel: Mutex::new(None),
			live: Mutex::new(None),
			capabilities: RwLock::new(None),
			encoding: RwLock::new(OffsetEncoding::default()),
			folder_support: RwLock::new(WorkspaceFolderSupport::default()),
			documents: Mutex::new(HashMap::new()),
			idle: Mutex::new(None),
			generation: AtomicU64::new(0),
		})
	}

	pub fn id(&self) -> SessionId {
		self.id
	}

	pub fn definition(&self) -> &ServerDefinition {
		&self.definition
	}

	pub fn scope(&self) -> &SessionScope {
		&self.scope
	}

	pub fn state(&self) -> SessionState {
		*self.state.borrow()
	}

	pub fn is_active(&self) -> bool {
		self.state() == SessionState::Active
	}

	/// Watch lifecycle transitions.
	pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
		self.state.subscribe()
	}

	/// Effective capabilities, `None` unless the session is running. Dynamic
	/// registrations are folded in.
	pub fn capabilities(&self) -> Option<Arc<ServerCapabilities>> {
		self.capabilities.read().as_ref().map(CapabilitySet::snapshot)
	}

	/// Position encoding negotiated during `initialize`.
	pub fn offset_encoding(&self) -> OffsetEncoding {
		*self.encoding.read()
	}

	/// Whether this session may serve documents under `scope`.
	///
	/// True for the scope the session was started with, for singleton
	/// definitions, and for servers that accept additional workspace
	/// folders.
	pub fn can_operate(&self, scope: &SessionScope) -> bool {
		self.scope.matches(scope)
			|| self.definition.singleton
			|| self.folder_support.read().supported
	}

	/// Record a `client/registerCapability` entry.
	pub fn register_capability(&self, registration: Registration) {
		if let Some(set) = self.capabilities.write().as_mut() {
			set.register(registration);
		}
	}

	/// Drop a dynamic registration. Unknown ids return `false`.
	pub fn unregister_capability(&self, id: &str) -> bool {
		self.capabilities
			.write()
			.as_mut()
			.map(|set| set.unregister(id))
			.unwrap_or(false)
	}

	/// Whether a dynamic registration for `method` is in effect.
	pub fn has_registration(&self, method: &str) -> bool {
		self.capabilities
			.read()
			.as_ref()
			.map(|set| set.has_registration(method))
			.unwrap_or(false)
	}

	/// Workspace folders across every announced scope, deduplicated by uri.
	pub fn folders(&self) -> Vec<WorkspaceFolder> {
		let scopes = self.scopes.lock().clone();
		let mut folders: Vec<WorkspaceFolder> = Vec::new();
		for scope in &scopes {
			for folder in scope.folders() {
				if !folders.iter().any(|known| known.uri == folder.uri) {
					folders.push(folder);
				}
			}
		}
		folders
	}

	/// Start the session.
	///
	/// Idempotent while Active unless `force_restart` is set, in which case
	/// the running server is stopped and the fresh incarnation reopens every
	/// document that was attached. Joins an in-flight attempt instead of
	/// starting a second one; a failed handshake stops the session and every
	/// waiter sees the same error.
	pub async fn start(self: &Arc<Self>, force_restart: bool) -> Result<()> {
		loop {
			match self.state() {
				SessionState::Active => {
					if !force_restart {
						return Ok(());
					}
					let docs = self.capture_documents();
					self.stop();
					self.wait_stopped().await;
					if self.try_begin_start() {
						return self.run_init(docs).await;
					}
					// Someone restarted it first; join their attempt.
				}
				SessionState::Starting => return self.join_start().await,
				SessionState::Stopping => self.wait_stopped().await,
				SessionState::Unstarted | SessionState::Stopped => {
					if self.try_begin_start() {
						return self.run_init(Vec::new()).await;
					}
				}
			}
		}
	}

	/// Stop the session. The first caller wins and initiates teardown; the
	/// polite shutdown handshake continues on a background task. Use
	/// [`wait_stopped`](Self::wait_stopped) to observe completion.
	pub fn stop(self: &Arc<Self>) {
		self.begin_stop();
	}

	/// Resolve once the session reaches `Stopped`.
	pub async fn wait_stopped(&self) {
		let mut rx = self.state.subscribe();
		loop {
			if *rx.borrow_and_update() == SessionState::Stopped {
				return;
			}
			if rx.changed().await.is_err() {
				return;
			}
		}
	}

	/// Submit request-producing work to the dispatcher, starting the session
	/// first when necessary (bounded by the definition's activation
	/// timeout).
	///
	/// The closure runs on the dispatch worker in submission order; requests
	/// it issues before its first suspension point are therefore ordered
	/// with all other dispatched traffic, including document sync.
	pub async fn execute<T, Fut>(
		self: &Arc<Self>,
		label: &'static str,
		work: impl FnOnce(SessionProxy) -> Fut + Send + 'static,
	) -> Result<Submitted<T>>
	where
		T: Send + 'static,
		Fut: Future<Output = Result<T>> + Send + 'static,
	{
		self.execute_with_token(label, CancellationToken::new(), work)
			.await
	}

	pub(crate) async fn execute_with_token<T, Fut>(
		self: &Arc<Self>,
		label: &'static str,
		cancel: CancellationToken,
		work: impl FnOnce(SessionProxy) -> Fut + Send + 'static,
	) -> Result<Submitted<T>>
	where
		T: Send + 'static,
		Fut: Future<Output = Result<T>> + Send + 'static,
	{
		let live = self.ensure_active().await?;
		let (tx, rx) = oneshot::channel();
		let token = cancel.clone();
		let run = Box::new(move |proxy: &SessionProxy| -> BoxFuture<'static, ()> {
			let fut = work(proxy.clone());
			async move {
				tokio::select! {
					_ = token.cancelled() => {
						let _ = tx.send(Err(Error::Cancelled));
					}
					result = fut => {
						let _ = tx.send(result);
					}
				}
			}
			.boxed()
		});
		live.dispatcher.submit(Task::Call {
			label,
			cancel: cancel.clone(),
			run,
		})?;
		Ok(Submitted::new(rx, cancel))
	}

	/// Queue a notification-producing closure behind all previously
	/// submitted work. The closure runs synchronously on the dispatcher.
	pub async fn notify(
		self: &Arc<Self>,
		label: &'static str,
		work: impl FnOnce(&SessionProxy) -> Result<()> + Send + 'static,
	) -> Result<()> {
		let live = self.ensure_active().await?;
		live.dispatcher.submit(Task::Notify {
			label,
			run: Box::new(work),
		})
	}

	/// Attach a document, sending `textDocument/didOpen`. Idempotent per
	/// uri. Cancels a pending idle shutdown.
	pub async fn connect(self: &Arc<Self>, doc: DocumentInfo) -> Result<()> {
		let live = self.ensure_active().await?;
		self.attach_document(&live, doc)
	}

	/// Detach a document, sending `textDocument/didClose` while the server
	/// is still reachable. Arms the idle timer when this was the last one.
	pub fn disconnect(self: &Arc<Self>, uri: &Url) {
		let sync = self.documents.lock().remove(uri);
		let Some(sync) = sync else { return };
		if self.is_active() {
			if let Some(live) = self.live.lock().clone() {
				if let Err(err) = sync.close(&live.dispatcher) {
					if !err.is_cancelled() {
						debug!(server = %self.id, uri = %uri, error = %err, "didClose failed");
					}
				}
			}
		}
		if self.documents.lock().is_empty() && self.is_active() {
			self.arm_idle_timer();
		}
	}

	pub fn is_connected(&self, uri: &Url) -> bool {
		self.documents.lock().contains_key(uri)
	}

	pub fn document_count(&self) -> usize {
		self.documents.lock().len()
	}

	/// Forward an edit batch for an attached document.
	pub fn document_changed(&self, uri: &Url, batch: &EditBatch) {
		let sync = self.documents.lock().get(uri).cloned();
		let Some(sync) = sync else { return };
		let Some(live) = self.live.lock().clone() else { return };
		let encoding = self.offset_encoding();
		if let Err(err) = sync.changed(&live.dispatcher, batch, encoding) {
			if !err.is_cancelled() {
				warn!(server = %self.id, uri = %uri, error = %err, "didChange failed");
			}
		}
	}

	/// Run the save participants for a document: `willSave`, then either the
	/// server's `willSaveWaitUntil` edits or the format-on-save fallback.
	/// Returns edits for the host to apply before writing.
	pub async fn will_save(
		self: &Arc<Self>,
		uri: &Url,
		regions: Option<Vec<(usize, usize)>>,
	) -> Vec<TextEdit> {
		let sync = self.documents.lock().get(uri).cloned();
		let Some(sync) = sync else { return Vec::new() };
		sync.will_save(self, regions).await
	}

	/// Report a completed save, with the saved text when the server asked
	/// for it.
	pub fn did_save(&self, uri: &Url, text: &Rope) {
		let sync = self.documents.lock().get(uri).cloned();
		let Some(sync) = sync else { return };
		let Some(live) = self.live.lock().clone() else { return };
		if let Err(err) = sync.saved(&live.dispatcher, text) {
			if !err.is_cancelled() {
				warn!(server = %self.id, uri = %uri, error = %err, "didSave failed");
			}
		}
	}

	/// Announce an additional scope to a running server that accepts
	/// workspace folders, and follow its folder changes from now on.
	pub(crate) async fn adopt_scope(self: &Arc<Self>, scope: &SessionScope) -> Result<()> {
		{
			let mut scopes = self.scopes.lock();
			if scopes.iter().any(|known| known.matches(scope)) {
				return Ok(());
			}
			scopes.push(scope.clone());
		}
		if self.folder_support.read().change_notifications {
			let added = scope.folders();
			if !added.is_empty() {
				self.notify_folder_change(added, Vec::new()).await?;
			}
			self.spawn_folder_listener(scope.clone(), self.generation.load(Ordering::SeqCst));
		}
		Ok(())
	}

	/// Surface a user-facing notice through the event handler.
	pub(crate) fn notice(&self, message: String) {
		self.handler.on_notice(self.id, message);
	}

	fn capture_documents(&self) -> Vec<DocumentInfo> {
		self.documents.lock().values().map(|sync| sync.document()).collect()
	}

	async fn ensure_active(self: &Arc<Self>) -> Result<Arc<LiveLink>> {
		if self.state() != SessionState::Active {
			let timeout = self.definition.activation_timeout();
			match tokio::time::timeout(timeout, self.start(false)).await {
				Ok(result) => result?,
				Err(_) => return Err(Error::Timeout("session activation", timeout)),
			}
		}
		self.live.lock().clone().ok_or(Error::SessionStopped)
	}

	/// Claim the Starting state. The same critical section clears the
	/// previous attempt's outcome, so joiners that observe Starting never
	/// read a stale result.
	fn try_begin_start(&self) -> bool {
		let mut won = false;
		self.state.send_if_modified(|state| match *state {
			SessionState::Unstarted | SessionState::Stopped => {
				self.init_result.send_replace(None);
				*state = SessionState::Starting;
				won = true;
				true
			}
			_ => false,
		});
		if won {
			self.handler.on_state_change(self.id, SessionState::Starting);
		}
		won
	}

	async fn join_start(&self) -> Result<()> {
		let mut rx = self.init_result.subscribe();
		loop {
			let outcome = rx.borrow_and_update().clone();
			if let Some(result) = outcome {
				return result;
			}
			if rx.changed().await.is_err() {
				return Err(Error::SessionStopped);
			}
		}
	}

	async fn run_init(self: &Arc<Self>, reattach: Vec<DocumentInfo>) -> Result<()> {
		let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
		let cancel = CancellationToken::new();
		*self.init_cancel.lock() = Some(cancel.clone());

		// The attempt runs on the caller's task; if that caller is dropped
		// (activation timeout, host shutdown) the guard publishes a cancelled
		// outcome and tears the half-built connection down, so joiners never
		// wait on an attempt nobody is driving.
		let mut attempt = StartAttempt {
			session: Arc::clone(self),
			armed: true,
		};
		let result = tokio::select! {
			_ = cancel.cancelled() => Err(Error::Cancelled),
			result = self.init_sequence(generation, reattach, &cancel) => result,
		};
		attempt.armed = false;
		self.init_cancel.lock().take();

		match result {
			Ok(()) => {
				// Publish Active only if no stop won the race meanwhile.
				let activated = self.state.send_if_modified(|state| {
					if *state == SessionState::Starting {
						*state = SessionState::Active;
						true
					} else {
						false
					}
				});
				if activated {
					info!(
						server = %self.id,
						definition = %self.definition.id,
						scope = %self.scope.name(),
						"language server ready"
					);
					self.handler.on_state_change(self.id, SessionState::Active);
					self.init_result.send_replace(Some(Ok(())));
					Ok(())
				} else {
					self.init_result.send_replace(Some(Err(Error::Cancelled)));
					Err(Error::Cancelled)
				}
			}
			Err(err) => {
				self.init_result.send_replace(Some(Err(err.clone())));
				// A cancelled attempt was cancelled by a stop, and that stop
				// owns the teardown. Anything else failed on its own and may
				// still hold a process and tasks, so run the regular teardown.
				if !err.is_cancelled() {
					error!(
						server = %self.id,
						definition = %self.definition.id,
						error = %err,
						"language server failed to start"
					);
					self.begin_stop();
				}
				Err(err)
			}
		}
	}

	async fn init_sequence(
		self: &Arc<Self>,
		generation: u64,
		reattach: Vec<DocumentInfo>,
		cancel: &CancellationToken,
	) -> Result<()> {
		info!(
			server = %self.id,
			definition = %self.definition.id,
			command = %self.definition.launch.command,
			scope = %self.scope.name(),
			"starting language server"
		);
		let io = self.provider.spawn(&self.definition, &self.scope).await?;

		let context = RouterContext {
			session: Arc::downgrade(self),
			server: self.id,
			handler: Arc::clone(&self.handler),
		};
		let weak = Arc::downgrade(self);
		let connection = establish(io, build_router(context), self.id, move |result| {
			if let Some(session) = weak.upgrade() {
				session.connection_exited(generation, result);
			}
		});
		let socket = connection.socket.clone();
		let proxy = SessionProxy {
			socket: socket.clone(),
			session: Arc::downgrade(self),
			server: self.id,
		};
		// Stored before the handshake so a concurrent stop can tear the
		// connection down even when `initialize` never answers. A stop that
		// raced the spawn has already swept `live` and cancelled the token;
		// storing after its sweep would leave this incarnation running
		// unowned, so re-check under the lock and abort instead.
		let live = Arc::new(LiveLink {
			generation,
			socket: socket.clone(),
			dispatcher: Dispatcher::spawn(proxy),
			mainloop: Mutex::new(Some(connection.mainloop)),
		});
		{
			let mut slot = self.live.lock();
			if cancel.is_cancelled() {
				drop(slot);
				if let Some(handle) = live.mainloop.lock().take() {
					handle.abort();
				}
				return Err(Error::Cancelled);
			}
			*slot = Some(Arc::clone(&live));
		}

		#[allow(deprecated)]
		let params = InitializeParams {
			process_id: Some(std::process::id()),
			root_path: self
				.scope
				.root_path()
				.map(|path| path.display().to_string()),
			root_uri: self.scope.root_uri(),
			initialization_options: self.definition.initialization_options.clone(),
			capabilities: client_capabilities(self.definition.enable_snippets),
			// All announced scopes, so a restart keeps adopted folders.
			workspace_folders: Some(self.folders()),
			client_info: Some(ClientInfo {
				name: "tandem".into(),
				version: Some(env!("CARGO_PKG_VERSION").into()),
			}),
			..Default::default()
		};
		let init = socket.request::<Initialize>(params).await.map_err(Error::from)?;
		if let Some(info) = &init.server_info {
			debug!(
				server = %self.id,
				name = %info.name,
				version = info.version.as_deref().unwrap_or(""),
				"server identified itself"
			);
		}

		let encoding = init
			.capabilities
			.position_encoding
			.as_ref()
			.and_then(OffsetEncoding::from_lsp)
			.unwrap_or_default();
		let folder_support = capabilities::workspace_folder_support(&init.capabilities);
		*self.encoding.write() = encoding;
		*self.folder_support.write() = folder_support;
		*self.capabilities.write() = Some(CapabilitySet::new(init.capabilities));

		socket
			.notify::<Initialized>(InitializedParams {})
			.map_err(Error::from)?;

		// Reopen documents captured from the previous incarnation, yielding
		// between replays so the dispatch worker can drain.
		for doc in reattach {
			self.attach_document(&live, doc)?;
			tokio::task::yield_now().await;
		}

		if folder_support.change_notifications {
			let scopes = self.scopes.lock().clone();
			for scope in scopes {
				self.spawn_folder_listener(scope, generation);
			}
		}

		Ok(())
	}

	fn attach_document(&self, live: &Arc<LiveLink>, doc: DocumentInfo) -> Result<()> {
		if let Some(idle) = self.idle.lock().take() {
			idle.cancel();
		}
		let mut documents = self.documents.lock();
		if documents.contains_key(&doc.uri) {
			return Ok(());
		}
		let caps = self.capabilities().ok_or(Error::SessionStopped)?;
		let sync = Arc::new(DocumentSync::new(doc, &self.definition, SyncPolicy::of(&caps)));
		sync.open(&live.dispatcher)?;
		documents.insert(sync.uri().clone(), sync);
		Ok(())
	}

	/// Transition into Stopping and kick off teardown. Returns whether this
	/// caller won; losers observe the transition through the state watch.
	fn begin_stop(self: &Arc<Self>) -> bool {
		let mut direct = false;
		let mut teardown = false;
		self.state.send_if_modified(|state| match *state {
			SessionState::Unstarted => {
				*state = SessionState::Stopped;
				direct = true;
				true
			}
			SessionState::Starting | SessionState::Active => {
				*state = SessionState::Stopping;
				teardown = true;
				true
			}
			SessionState::Stopping | SessionState::Stopped => false,
		});
		if direct {
			self.handler.on_state_change(self.id, SessionState::Stopped);
		}
		if teardown {
			self.handler.on_state_change(self.id, SessionState::Stopping);
			self.run_teardown();
		}
		direct || teardown
	}

	fn run_teardown(self: &Arc<Self>) {
		// Interrupt an in-flight start and the idle timer.
		if let Some(cancel) = self.init_cancel.lock().take() {
			cancel.cancel();
		}
		if let Some(idle) = self.idle.lock().take() {
			idle.cancel();
		}

		let live = self.live.lock().take();
		*self.capabilities.write() = None;
		*self.encoding.write() = OffsetEncoding::default();
		*self.folder_support.write() = WorkspaceFolderSupport::default();

		// Detach documents, telling the server while it is still reachable.
		let docs: Vec<Arc<DocumentSync>> =
			self.documents.lock().drain().map(|(_, sync)| sync).collect();
		if let Some(live) = &live {
			for sync in &docs {
				if let Err(err) = sync.close(&live.dispatcher) {
					if !err.is_cancelled() {
						debug!(server = %self.id, error = %err, "didClose during stop failed");
					}
				}
			}
		}

		let session = Arc::clone(self);
		tokio::spawn(async move {
			if let Some(live) = live {
				let shutdown = live.socket.request::<Shutdown>(());
				match tokio::time::timeout(SHUTDOWN_GRACE, shutdown).await {
					Ok(Ok(())) => {}
					Ok(Err(err)) => {
						debug!(server = %session.id, error = %Error::from(err), "shutdown request failed");
					}
					Err(_) => debug!(server = %session.id, "shutdown request timed out"),
				}
				let _ = live.socket.notify::<Exit>(());
				let mainloop = live.mainloop.lock().take();
				if let Some(mut handle) = mainloop {
					if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
						handle.abort();
					}
				}
			}
			session.state.send_replace(SessionState::Stopped);
			session.handler.on_state_change(session.id, SessionState::Stopped);
			debug!(server = %session.id, "language server stopped");
		});
	}

	fn connection_exited(self: &Arc<Self>, generation: u64, result: Result<()>) {
		let current = self.live.lock().as_ref().map(|live| live.generation);
		if current != Some(generation) {
			// A stop or restart already moved past this incarnation.
			return;
		}
		match self.state() {
			SessionState::Stopping | SessionState::Stopped => {
				debug!(server = %self.id, "connection closed");
			}
			state => {
				match &result {
					Ok(()) => {
						warn!(server = %self.id, ?state, "language server connection ended unexpectedly");
					}
					Err(err) => {
						warn!(server = %self.id, ?state, error = %err, "language server connection failed");
					}
				}
				self.stop();
			}
		}
	}

	fn arm_idle_timer(self: &Arc<Self>) {
		let Some(timeout) = self.definition.idle_timeout_duration() else {
			return;
		};
		let token = CancellationToken::new();
		*self.idle.lock() = Some(token.clone());
		let weak = Arc::downgrade(self);
		tokio::spawn(async move {
			tokio::select! {
				_ = token.cancelled() => {}
				_ = tokio::time::sleep(timeout) => {
					let Some(session) = weak.upgrade() else { return };
					// A document may have raced the timer.
					if session.document_count() == 0 && session.is_active() {
						info!(server = %session.id, definition = %session.definition.id, "stopping idle language server");
						session.stop();
					}
				}
			}
		});
	}

	async fn notify_folder_change(
		self: &Arc<Self>,
		added: Vec<WorkspaceFolder>,
		removed: Vec<WorkspaceFolder>,
	) -> Result<()> {
		self.notify("didChangeWorkspaceFolders", move |proxy| {
			proxy.notify::<DidChangeWorkspaceFolders>(DidChangeWorkspaceFoldersParams {
				event: WorkspaceFoldersChangeEvent { added, removed },
			})
		})
		.await
	}

	fn spawn_folder_listener(self: &Arc<Self>, scope: SessionScope, generation: u64) {
		let Some(mut rx) = scope.subscribe_folders() else {
			return;
		};
		let weak = Arc::downgrade(self);
		tokio::spawn(async move {
			loop {
				match rx.recv().await {
					Ok(change) => {
						let Some(session) = weak.upgrade() else { break };
						if session.generation.load(Ordering::SeqCst) != generation
							|| !session.is_active()
						{
							break;
						}
						if let Err(err) =
							session.notify_folder_change(change.added, change.removed).await
						{
							if !err.is_cancelled() {
								warn!(server = %session.id, error = %err, "didChangeWorkspaceFolders failed");
							}
						}
					}
					Err(broadcast::error::RecvError::Lagged(missed)) => {
						warn!(missed, "workspace folder updates dropped");
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});
	}
}

impl fmt::Debug for ServerSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ServerSession")
			.field("id", &self.id)
			.field("definition", &self.definition.id)
			.field("scope", &self.scope.name())
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}
