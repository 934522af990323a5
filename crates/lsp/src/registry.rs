//! Session registry: which definitions exist, which sessions are alive, and
//! which of them serve a given document or scope.
//!
//! The registry is an explicit value owned by the host and passed by
//! reference; nothing here is process-global. Sessions are created lazily on
//! first resolve and dropped once they reach `Stopped`. The create path runs
//! a check-lock-recheck singleflight: racing resolvers for the same
//! (definition, scope) key, or for the same singleton definition from any
//! scope, share a single start attempt instead of spawning duplicate
//! servers, and a failed attempt hands every waiter the same error.
//!
//! Tag→definition mappings can be disabled and re-enabled at runtime; the
//! flags persist through the host's [`SettingsStore`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lsp_types::{TextEdit, Url};
use parking_lot::{Mutex, RwLock};
use ropey::Rope;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::definition::{DefinitionId, ServerDefinition};
use crate::dispatch::DispatchBuilder;
use crate::document::{DocumentInfo, EditBatch};
use crate::event::{NoOpEventHandler, SharedEventHandler};
use crate::session::{ServerSession, SessionState};
use crate::transport::{ConnectionProvider, ProcessProvider};
use crate::workspace::{ScopeKey, SessionScope};
use crate::{Error, Result};

#[cfg(test)]
mod tests;

/// String-keyed persistence seam for registry flags.
pub trait SettingsStore: Send + Sync {
	fn get(&self, key: &str) -> Option<String>;
	fn set(&self, key: &str, value: &str);
}

/// In-memory [`SettingsStore`] for hosts without persistence, and for tests.
#[derive(Debug, Default)]
pub struct MemorySettings {
	values: Mutex<HashMap<String, String>>,
}

impl SettingsStore for MemorySettings {
	fn get(&self, key: &str) -> Option<String> {
		self.values.lock().get(key).cloned()
	}

	fn set(&self, key: &str, value: &str) {
		self.values.lock().insert(key.to_owned(), value.to_owned());
	}
}

/// Singleflight key. The scope component is `None` for singleton
/// definitions, which serve every scope from one session and so must never
/// elect two leaders.
type StartKey = (DefinitionId, Option<ScopeKey>);
type InflightResult = Option<Result<Arc<ServerSession>>>;

/// Removes the singleflight entry when the leader is done or gone. A leader
/// dropped mid-start takes its sender with it, and waiting followers observe
/// the closed channel and retry.
struct StartGuard<'a> {
	registry: &'a SessionRegistry,
	key: StartKey,
	tx: Option<watch::Sender<InflightResult>>,
}

impl StartGuard<'_> {
	fn publish(mut self, result: Result<Arc<ServerSession>>) {
		if let Some(tx) = self.tx.take() {
			let _ = tx.send(Some(result));
		}
	}
}

impl Drop for StartGuard<'_> {
	fn drop(&mut self) {
		self.registry.inflight.lock().remove(&self.key);
	}
}

/// Tracks live sessions and resolves which of them serve a document or
/// scope. Thread-safe behind `Arc`.
pub struct SessionRegistry {
	definitions: RwLock<Vec<Arc<ServerDefinition>>>,
	sessions: Mutex<Vec<Arc<ServerSession>>>,
	/// Singleflight table for the create-if-absent path only.
	inflight: Mutex<HashMap<StartKey, watch::Receiver<InflightResult>>>,
	provider: Arc<dyn ConnectionProvider>,
	handler: SharedEventHandler,
	settings: Arc<dyn SettingsStore>,
	/// The host's open documents, kept current so re-enabled mappings can
	/// attach them with up-to-date text.
	open_docs: Mutex<HashMap<Url, DocumentInfo>>,
}

impl SessionRegistry {
	pub fn new(
		provider: Arc<dyn ConnectionProvider>,
		handler: SharedEventHandler,
		settings: Arc<dyn SettingsStore>,
	) -> Self {
		Self {
			definitions: RwLock::new(Vec::new()),
			sessions: Mutex::new(Vec::new()),
			inflight: Mutex::new(HashMap::new()),
			provider,
			handler,
			settings,
			open_docs: Mutex::new(HashMap::new()),
		}
	}

	/// Registry over spawned processes, with no event sink and in-memory
	/// settings.
	pub fn with_defaults() -> Self {
		Self::new(
			Arc::new(ProcessProvider),
			Arc::new(NoOpEventHandler),
			Arc::new(MemorySettings::default()),
		)
	}

	/// Register a definition, replacing any previous one with the same id.
	pub fn register_definition(&self, definition: ServerDefinition) {
		let definition = Arc::new(definition);
		let mut definitions = self.definitions.write();
		definitions.retain(|known| known.id != definition.id);
		definitions.push(definition);
	}

	pub fn definition(&self, id: &DefinitionId) -> Option<Arc<ServerDefinition>> {
		self.definitions
			.read()
			.iter()
			.find(|definition| &definition.id == id)
			.cloned()
	}

	pub fn definitions(&self) -> Vec<Arc<ServerDefinition>> {
		self.definitions.read().clone()
	}

	/// Currently tracked sessions, pruning stopped ones.
	pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
		self.snapshot()
	}

	/// Sessions that may serve the given scope.
	pub fn sessions_for_scope(&self, scope: &SessionScope) -> Vec<Arc<ServerSession>> {
		self.snapshot()
			.into_iter()
			.filter(|session| session.can_operate(scope))
			.collect()
	}

	/// Builder for a request fanned out over every session serving `doc`.
	pub fn for_document<'a>(&'a self, doc: &'a DocumentInfo) -> DispatchBuilder<'a> {
		DispatchBuilder::for_document(self, doc)
	}

	/// Builder for a request fanned out over every session operating on
	/// `scope`.
	pub fn for_workspace<'a>(&'a self, scope: &'a SessionScope) -> DispatchBuilder<'a> {
		DispatchBuilder::for_workspace(self, scope)
	}

	/// Resolve the session serving (scope, definition), creating and
	/// starting one when none exists.
	///
	/// Reuse goes through [`ServerSession::can_operate`], so a
	/// workspace-folder capable session picks up the new scope instead of a
	/// duplicate server being spawned. Concurrent resolvers for the same key
	/// share one start attempt; singleton definitions key by definition
	/// alone, so cross-scope racers coalesce too.
	pub async fn resolve(
		&self,
		scope: &SessionScope,
		definition: &DefinitionId,
	) -> Result<Arc<ServerSession>> {
		let definition = self
			.definition(definition)
			.ok_or_else(|| Error::UnknownDefinition(definition.clone()))?;
		let key: StartKey = (
			definition.id.clone(),
			(!definition.singleton).then(|| scope.key()),
		);

		enum Claim {
			Existing(Arc<ServerSession>),
			Leader(watch::Sender<InflightResult>),
			Follower(watch::Receiver<InflightResult>),
		}

		loop {
			if let Some(session) = self.find_operable(&definition.id, scope) {
				return self.reuse(session, scope).await;
			}

			let claim = {
				let mut inflight = self.inflight.lock();
				if let Some(rx) = inflight.get(&key) {
					Claim::Follower(rx.clone())
				} else if let Some(session) = self.find_operable(&definition.id, scope) {
					// A racing creator published between our check and this
					// lock.
					Claim::Existing(session)
				} else {
					let (tx, rx) = watch::channel(None);
					inflight.insert(key.clone(), rx);
					Claim::Leader(tx)
				}
			};

			match claim {
				Claim::Existing(session) => return self.reuse(session, scope).await,
				Claim::Leader(tx) => {
					let guard = StartGuard {
						registry: self,
						key: key.clone(),
						tx: Some(tx),
					};
					let result = self.create_and_start(Arc::clone(&definition), scope).await;
					guard.publish(result.clone());
					return result;
				}
				Claim::Follower(mut rx) => loop {
					let outcome = rx.borrow_and_update().clone();
					if let Some(result) = outcome {
						// A singleton leader may have started under another
						// scope; adopt ours the same way reuse does.
						return self.reuse(result?, scope).await;
					}
					if rx.changed().await.is_err() {
						// Leader vanished without publishing; start over.
						break;
					}
				},
			}
		}
	}

	/// Resolve every session serving a document: sessions it is already
	/// attached to, then one per enabled tag→definition mapping walking the
	/// document's tags from most specific to most general. A definition
	/// already matched is not resolved twice; per-definition failures are
	/// logged and skipped so one broken server does not block the rest.
	pub async fn resolve_for_document(&self, doc: &DocumentInfo) -> Vec<Arc<ServerSession>> {
		let mut matched: Vec<Arc<ServerSession>> = Vec::new();
		let mut matched_defs: HashSet<DefinitionId> = HashSet::new();

		for session in self.snapshot() {
			if session.is_connected(&doc.uri) {
				matched_defs.insert(session.definition().id.clone());
				matched.push(session);
			}
		}

		for tag in &doc.tags {
			for definition in self.definitions_for_tag(tag) {
				if matched_defs.contains(&definition.id) {
					continue;
				}
				if !self.mapping_enabled(tag, &definition.id) {
					debug!(tag, definition = %definition.id, "mapping disabled, skipping");
					continue;
				}
				matched_defs.insert(definition.id.clone());
				match self.resolve(&doc.scope, &definition.id).await {
					Ok(session) => matched.push(session),
					Err(err) if err.is_cancelled() => {}
					Err(err) => {
						warn!(
							definition = %definition.id,
							uri = %doc.uri,
							error = %err,
							"failed to resolve session for document"
						);
					}
				}
			}
		}
		matched
	}

	/// Sessions serving `doc`, attaching it to newly resolved ones so
	/// requests against the document are valid everywhere returned.
	pub async fn sessions_for_document(&self, doc: &DocumentInfo) -> Vec<Arc<ServerSession>> {
		let sessions = self.resolve_for_document(doc).await;
		for session in &sessions {
			if let Err(err) = session.connect(doc.clone()).await {
				if !err.is_cancelled() {
					warn!(
						server = %session.id(),
						uri = %doc.uri,
						error = %err,
						"failed to attach document"
					);
				}
			}
		}
		sessions
			.into_iter()
			.filter(|session| session.is_connected(&doc.uri))
			.collect()
	}

	/// Open a document: resolve matching definitions and attach it to their
	/// sessions. Returns the sessions now serving it.
	pub async fn open_document(&self, doc: DocumentInfo) -> Vec<Arc<ServerSession>> {
		self.open_docs.lock().insert(doc.uri.clone(), doc.clone());
		self.sessions_for_document(&doc).await
	}

	/// Forward an edit batch to every session the document is attached to.
	pub fn document_changed(&self, uri: &Url, batch: &EditBatch) {
		if let Some(doc) = self.open_docs.lock().get_mut(uri) {
			doc.text = batch.after.clone();
		}
		for session in self.snapshot() {
			if session.is_connected(uri) {
				session.document_changed(uri, batch);
			}
		}
	}

	/// Run save participants across attached sessions, concatenating their
	/// edits in session order.
	pub async fn will_save(
		&self,
		uri: &Url,
		regions: Option<Vec<(usize, usize)>>,
	) -> Vec<TextEdit> {
		let mut edits = Vec::new();
		for session in self.snapshot() {
			if session.is_connected(uri) {
				edits.extend(session.will_save(uri, regions.clone()).await);
			}
		}
		edits
	}

	/// Report a completed save to every attached session.
	pub fn did_save(&self, uri: &Url, text: &Rope) {
		if let Some(doc) = self.open_docs.lock().get_mut(uri) {
			doc.text = text.clone();
		}
		for session in self.snapshot() {
			if session.is_connected(uri) {
				session.did_save(uri, text);
			}
		}
	}

	/// Close a document everywhere and forget it.
	pub fn close_document(&self, uri: &Url) {
		self.open_docs.lock().remove(uri);
		for session in self.snapshot() {
			if session.is_connected(uri) {
				session.disconnect(uri);
			}
		}
	}

	/// Whether the tag→definition mapping is enabled. Defaults to enabled
	/// when the store has no entry.
	pub fn mapping_enabled(&self, tag: &str, definition: &DefinitionId) -> bool {
		self.settings
			.get(&mapping_key(tag, definition))
			.map(|value| value != "0")
			.unwrap_or(true)
	}

	/// Disable a mapping and detach matching open documents from sessions of
	/// that definition. The flag persists through the settings store.
	pub fn disable_mapping(&self, tag: &str, definition: &DefinitionId) {
		self.settings.set(&mapping_key(tag, definition), "0");
		let uris: Vec<Url> = self
			.open_docs
			.lock()
			.values()
			.filter(|doc| doc.tags.iter().any(|t| t == tag))
			.map(|doc| doc.uri.clone())
			.collect();
		for session in self.snapshot() {
			if &session.definition().id != definition {
				continue;
			}
			for uri in &uris {
				if session.is_connected(uri) {
					session.disconnect(uri);
				}
			}
		}
		info!(tag, %definition, "mapping disabled");
	}

	/// Re-enable a mapping and connect open documents that now match.
	pub async fn enable_mapping(&self, tag: &str, definition: &DefinitionId) {
		self.settings.set(&mapping_key(tag, definition), "1");
		let Some(known) = self.definition(definition) else {
			warn!(%definition, "cannot enable mapping for unknown definition");
			return;
		};
		if !known.serves_tag(tag) {
			warn!(tag, %definition, "definition does not serve tag");
			return;
		}
		let docs: Vec<DocumentInfo> = self
			.open_docs
			.lock()
			.values()
			.filter(|doc| doc.tags.iter().any(|t| t == tag))
			.cloned()
			.collect();
		for doc in docs {
			match self.resolve(&doc.scope, definition).await {
				Ok(session) => {
					if let Err(err) = session.connect(doc.clone()).await {
						if !err.is_cancelled() {
							warn!(
								server = %session.id(),
								uri = %doc.uri,
								error = %err,
								"failed to attach document"
							);
						}
					}
				}
				Err(err) => {
					if !err.is_cancelled() {
						warn!(%definition, error = %err, "failed to start session for re-enabled mapping");
					}
				}
			}
		}
		info!(tag, %definition, "mapping enabled");
	}

	/// Stop every tracked session and wait for teardown to finish. Intended
	/// for host shutdown.
	pub async fn shutdown_all(&self) {
		let sessions: Vec<Arc<ServerSession>> = std::mem::take(&mut *self.sessions.lock());
		for session in &sessions {
			session.stop();
		}
		for session in &sessions {
			session.wait_stopped().await;
		}
		info!(count = sessions.len(), "all language servers stopped");
	}

	async fn reuse(
		&self,
		session: Arc<ServerSession>,
		scope: &SessionScope,
	) -> Result<Arc<ServerSession>> {
		session.start(false).await?;
		if !session.scope().matches(scope) {
			session.adopt_scope(scope).await?;
		}
		Ok(session)
	}

	async fn create_and_start(
		&self,
		definition: Arc<ServerDefinition>,
		scope: &SessionScope,
	) -> Result<Arc<ServerSession>> {
		let session = ServerSession::new(
			definition,
			scope.clone(),
			Arc::clone(&self.provider),
			Arc::clone(&self.handler),
		);
		self.sessions.lock().push(Arc::clone(&session));
		debug!(
			server = %session.id(),
			definition = %session.definition().id,
			scope = %scope.name(),
			"session created"
		);
		session.start(false).await?;
		Ok(session)
	}

	fn find_operable(
		&self,
		definition: &DefinitionId,
		scope: &SessionScope,
	) -> Option<Arc<ServerSession>> {
		let mut sessions = self.sessions.lock();
		sessions.retain(|session| session.state() != SessionState::Stopped);
		sessions
			.iter()
			.find(|session| {
				&session.definition().id == definition && session.can_operate(scope)
			})
			.cloned()
	}

	fn definitions_for_tag(&self, tag: &str) -> Vec<Arc<ServerDefinition>> {
		self.definitions
			.read()
			.iter()
			.filter(|definition| definition.serves_tag(tag))
			.cloned()
			.collect()
	}

	fn snapshot(&self) -> Vec<Arc<ServerSession>> {
		let mut sessions = self.sessions.lock();
		sessions.retain(|session| session.state() != SessionState::Stopped);
		sessions.clone()
	}
}

impl std::fmt::Debug for SessionRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionRegistry")
			.field("definitions", &self.definitions.read().len())
			.field("sessions", &self.sessions.lock().len())
			.finish_non_exhaustive()
	}
}

fn mapping_key(tag: &str, definition: &DefinitionId) -> String {
	format!("lsp.mapping.{tag}.{definition}")
}
