//! Inbound message routing for one server connection.
//!
//! Each connection gets a router dispatching server-to-client traffic:
//! diagnostics and window messages to the host's event handler, capability
//! (un)registrations to the session's overlay set, and configuration /
//! workspace-folder requests answered from the definition and scope. Unknown
//! requests fall through to the default method-not-found response; unknown
//! notifications are logged and dropped.

use std::ops::ControlFlow;
use std::sync::Weak;

use async_lsp::router::Router;
use async_lsp::{ErrorCode, ResponseError};
use lsp_types::notification::{LogMessage, Progress, PublishDiagnostics, ShowMessage};
use lsp_types::request::{
	ApplyWorkspaceEdit, RegisterCapability, UnregisterCapability, WorkDoneProgressCreate,
	WorkspaceConfiguration, WorkspaceFoldersRequest,
};
use lsp_types::{ApplyWorkspaceEditResponse, MessageType};
use tracing::{debug, error, info, warn};

use crate::JsonValue;
use crate::event::SharedEventHandler;
use crate::session::{ServerSession, SessionId};

/// Per-connection state shared by the inbound handlers.
pub(crate) struct RouterContext {
	pub session: Weak<ServerSession>,
	pub server: SessionId,
	pub handler: SharedEventHandler,
}

/// Build the router handling server-initiated traffic for one connection.
pub(crate) fn build_router(context: RouterContext) -> Router<RouterContext> {
	let mut router = Router::new(context);
	router
		.notification::<PublishDiagnostics>(|ctx, params| {
			debug!(
				target: "lsp",
				server = %ctx.server,
				uri = %params.uri,
				count = params.diagnostics.len(),
				"publishDiagnostics"
			);
			ctx.handler
				.on_diagnostics(ctx.server, params.uri, params.version, params.diagnostics);
			ControlFlow::Continue(())
		})
		.notification::<Progress>(|ctx, params| {
			ctx.handler.on_progress(ctx.server, params);
			ControlFlow::Continue(())
		})
		.notification::<LogMessage>(|ctx, params| {
			match params.typ {
				MessageType::ERROR => {
					error!(target: "lsp", server = %ctx.server, "{}", params.message);
				}
				MessageType::WARNING => {
					warn!(target: "lsp", server = %ctx.server, "{}", params.message);
				}
				MessageType::INFO => {
					info!(target: "lsp", server = %ctx.server, "{}", params.message);
				}
				_ => debug!(target: "lsp", server = %ctx.server, "{}", params.message),
			}
			ctx.handler
				.on_log_message(ctx.server, params.typ, params.message);
			ControlFlow::Continue(())
		})
		.notification::<ShowMessage>(|ctx, params| {
			ctx.handler
				.on_show_message(ctx.server, params.typ, params.message);
			ControlFlow::Continue(())
		})
		.request::<WorkspaceConfiguration, _>(|ctx, params| {
			let settings = ctx
				.session
				.upgrade()
				.and_then(|session| session.definition().settings.clone());
			let result: Vec<JsonValue> = params
				.items
				.iter()
				.map(|item| lookup_section(settings.as_ref(), item.section.as_deref()))
				.collect();
			async move { Ok(result) }
		})
		.request::<WorkDoneProgressCreate, _>(|_ctx, _params| async move { Ok(()) })
		.request::<RegisterCapability, _>(|ctx, params| {
			let outcome = match ctx.session.upgrade() {
				Some(session) => {
					for registration in params.registrations {
						debug!(
							target: "lsp",
							server = %ctx.server,
							method = %registration.method,
							id = %registration.id,
							"capability registered"
						);
						session.register_capability(registration);
					}
					Ok(())
				}
				None => Err(ResponseError::new(
					ErrorCode::REQUEST_FAILED,
					"session is gone",
				)),
			};
			async move { outcome }
		})
		.request::<UnregisterCapability, _>(|ctx, params| {
			if let Some(session) = ctx.session.upgrade() {
				for unregistration in params.unregisterations {
					if !session.unregister_capability(&unregistration.id) {
						debug!(
							target: "lsp",
							server = %ctx.server,
							id = %unregistration.id,
							"unknown unregistration ignored"
						);
					}
				}
			}
			async move { Ok(()) }
		})
		.request::<WorkspaceFoldersRequest, _>(|ctx, _params| {
			let folders = ctx.session.upgrade().map(|session| session.folders());
			async move { Ok(folders) }
		})
		.request::<ApplyWorkspaceEdit, _>(|ctx, params| {
			let applied =
				ctx.handler
					.on_apply_edit(ctx.server, params.label.as_deref(), &params.edit);
			let response = ApplyWorkspaceEditResponse {
				applied,
				failure_reason: (!applied).then(|| "host did not apply the edit".to_owned()),
				failed_change: None,
			};
			async move { Ok(response) }
		})
		.unhandled_notification(|ctx, notif| {
			debug!(
				target: "lsp",
				server = %ctx.server,
				method = %notif.method,
				"unhandled notification"
			);
			ControlFlow::Continue(())
		});
	router
}

/// Resolve a dotted configuration section against the definition's settings.
fn lookup_section(settings: Option<&JsonValue>, section: Option<&str>) -> JsonValue {
	let Some(mut value) = settings else {
		return JsonValue::Null;
	};
	let Some(section) = section else {
		return value.clone();
	};
	if section.is_empty() {
		return value.clone();
	}
	for part in section.split('.') {
		match value.get(part) {
			Some(nested) => value = nested,
			None => return JsonValue::Null,
		}
	}
	value.clone()
}
