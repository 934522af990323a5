//! Fan-out of one request across every eligible session.
//!
//! A [`DispatchBuilder`] is built from a document or a workspace scope, with
//! an optional capability filter, and then run in one of three shapes:
//! [`collect_all`](DispatchBuilder::collect_all) aggregates list results,
//! [`compute_all`](DispatchBuilder::compute_all) hands back one handle per
//! session, and [`compute_first`](DispatchBuilder::compute_first) races the
//! sessions for the first present answer.
//!
//! Absence is one consistent rule everywhere: `None` and empty collections
//! both count as no answer. Per-session errors never fail the aggregate;
//! they are logged and that session's contribution is dropped. Cancelling
//! (or dropping) an aggregate cancels the per-session work through child
//! tokens.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use lsp_types::ServerCapabilities;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::document::DocumentInfo;
use crate::registry::SessionRegistry;
use crate::session::{ServerSession, SessionId, SessionProxy, Submitted};
use crate::workspace::SessionScope;
use crate::{Error, Result};


/// Normalize a collection result to the rule that empty means absent.
pub fn non_empty<T>(result: Option<Vec<T>>) -> Option<Vec<T>> {
	result.filter(|items| !items.is_empty())
}

enum Target<'a> {
	Document(&'a DocumentInfo),
	Workspace(&'a SessionScope),
}

/// Selects the sessions a request fans out to.
pub struct DispatchBuilder<'a> {
	registry: &'a SessionRegistry,
	target: Target<'a>,
	filter: Option<fn(&ServerCapabilities) -> bool>,
	active_only: bool,
	cancel: CancellationToken,
}

impl<'a> DispatchBuilder<'a> {
	/// Target the sessions serving a document. Sessions that newly match
	/// get the document attached before any request runs.
	pub fn for_document(registry: &'a SessionRegistry, doc: &'a DocumentInfo) -> Self {
		Self {
			registry,
			target: Target::Document(doc),
			filter: None,
			active_only: false,
			cancel: CancellationToken::new(),
		}
	}

	/// Target every session that can operate on a scope.
	pub fn for_workspace(registry: &'a SessionRegistry, scope: &'a SessionScope) -> Self {
		Self {
			registry,
			target: Target::Workspace(scope),
			filter: None,
			active_only: false,
			cancel: CancellationToken::new(),
		}
	}

	/// Keep only sessions whose effective capabilities satisfy `filter`.
	/// Sessions without capabilities yet (not Active) never satisfy a
	/// filter.
	pub fn with_capability(mut self, filter: fn(&ServerCapabilities) -> bool) -> Self {
		self.filter = Some(filter);
		self
	}

	/// Skip sessions that are not currently Active instead of starting
	/// them.
	pub fn active_only(mut self) -> Self {
		self.active_only = true;
		self
	}

	/// Parent token for the fan-out. Cancelling it cancels every
	/// per-session request this builder submits.
	pub fn cancel_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// The first eligible session, for requests that target exactly one
	/// server.
	pub async fn require_one(self, what: &'static str) -> Result<Arc<ServerSession>> {
		self.eligible()
			.await
			.into_iter()
			.next()
			.ok_or(Error::CapabilityMismatch(what))
	}

	/// Invoke `f` on every eligible session and aggregate present results.
	///
	/// Absent and empty per-session results are dropped; per-session errors
	/// are logged and excluded. With zero eligible sessions this resolves
	/// immediately to an empty list.
	pub async fn collect_all<T, Fut>(
		self,
		label: &'static str,
		f: impl Fn(SessionProxy) -> Fut + Send + Clone + 'static,
	) -> Vec<T>
	where
		T: Send + 'static,
		Fut: Future<Output = Result<Option<Vec<T>>>> + Send + 'static,
	{
		let submitted = self.submit_all(label, f).await;
		let mut pending: FuturesUnordered<_> = submitted
			.into_iter()
			.map(|(server, handle)| async move { (server, handle.await) })
			.collect();
		let mut out = Vec::new();
		while let Some((server, result)) = pending.next().await {
			match result {
				Ok(Some(mut items)) if !items.is_empty() => out.append(&mut items),
				Ok(_) => {}
				Err(err) if err.is_cancelled() => {}
				Err(err) => debug!(server = %server, label, error = %err, "session dispatch failed"),
			}
		}
		out
	}

	/// Same fan-out, but hand back one handle per session for independent
	/// tracking.
	pub async fn compute_all<T, Fut>(
		self,
		label: &'static str,
		f: impl Fn(SessionProxy) -> Fut + Send + Clone + 'static,
	) -> Vec<(SessionId, Submitted<T>)>
	where
		T: Send + 'static,
		Fut: Future<Output = Result<T>> + Send + 'static,
	{
		self.submit_all(label, f).await
	}

	/// Race the sessions; the first present result wins.
	///
	/// An absent result from a fast session is skipped in favor of a later
	/// present one from a slower session. Resolves to `None` when no
	/// session produces a present result. Losers are cancelled.
	pub async fn compute_first<T, Fut>(
		self,
		label: &'static str,
		f: impl Fn(SessionProxy) -> Fut + Send + Clone + 'static,
	) -> Option<T>
	where
		T: Send + 'static,
		Fut: Future<Output = Result<Option<T>>> + Send + 'static,
	{
		let submitted = self.submit_all(label, f).await;
		let mut pending: FuturesUnordered<_> = submitted
			.into_iter()
			.map(|(server, handle)| async move { (server, handle.await) })
			.collect();
		while let Some((server, result)) = pending.next().await {
			match result {
				// Dropping the remaining handles cancels them.
				Ok(Some(value)) => return Some(value),
				Ok(None) => {}
				Err(err) if err.is_cancelled() => {}
				Err(err) => debug!(server = %server, label, error = %err, "session dispatch failed"),
			}
		}
		None
	}

	async fn submit_all<T, Fut>(
		&self,
		label: &'static str,
		f: impl Fn(SessionProxy) -> Fut + Send + Clone + 'static,
	) -> Vec<(SessionId, Submitted<T>)>
	where
		T: Send + 'static,
		Fut: Future<Output = Result<T>> + Send + 'static,
	{
		let sessions = self.eligible().await;
		let mut handles = Vec::with_capacity(sessions.len());
		for session in sessions {
			let child = self.cancel.child_token();
			let f = f.clone();
			match session
				.execute_with_token(label, child, move |proxy| f(proxy))
				.await
			{
				Ok(handle) => handles.push((session.id(), handle)),
				Err(err) if err.is_cancelled() => {}
				Err(err) => {
					debug!(server = %session.id(), label, error = %err, "failed to submit request");
				}
			}
		}
		handles
	}

	async fn eligible(&self) -> Vec<Arc<ServerSession>> {
		let sessions = match self.target {
			Target::Document(doc) => self.registry.sessions_for_document(doc).await,
			Target::Workspace(scope) => self.registry.sessions_for_scope(scope),
		};
		sessions
			.into_iter()
			.filter(|session| {
				if self.active_only && !session.is_active() {
					return false;
				}
				match self.filter {
					Some(filter) => session
						.capabilities()
						.map(|caps| filter(&caps))
						.unwrap_or(false),
					None => true,
				}
			})
			.collect()
	}
}
