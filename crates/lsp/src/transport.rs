//! Byte transports for server connections.
//!
//! Sessions are connected to servers through a [`ConnectionProvider`], which
//! yields a pair of byte streams plus optional process plumbing. The default
//! [`ProcessProvider`] spawns the definition's command and speaks stdio;
//! tests substitute in-memory pipes. Everything above this module only sees
//! [`ServerIo`], so the protocol layer is transport-agnostic.

use std::fmt;
use std::process::Stdio;

use async_lsp::router::Router;
use async_lsp::{MainLoop, ServerSocket};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tracing::warn;

use crate::definition::ServerDefinition;
use crate::router::RouterContext;
use crate::session::SessionId;
use crate::workspace::SessionScope;
use crate::{Error, Result};

/// Byte streams of a spawned or connected server.
pub struct ServerIo {
	/// Server-to-client bytes (the server's stdout for processes).
	pub reader: Box<dyn AsyncRead + Send + Unpin>,
	/// Client-to-server bytes (the server's stdin for processes).
	pub writer: Box<dyn AsyncWrite + Send + Unpin>,
	/// Diagnostic stream drained into the log, when present.
	pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
	/// Child process handle when the provider spawned one. Dropping it
	/// kills the process.
	pub child: Option<Child>,
}

impl fmt::Debug for ServerIo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ServerIo")
			.field("has_stderr", &self.stderr.is_some())
			.field("has_child", &self.child.is_some())
			.finish_non_exhaustive()
	}
}

/// Source of byte transports for one server incarnation.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
	async fn spawn(&self, definition: &ServerDefinition, scope: &SessionScope) -> Result<ServerIo>;
}

/// Launches servers as child processes speaking stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessProvider;

#[async_trait]
impl ConnectionProvider for ProcessProvider {
	async fn spawn(&self, definition: &ServerDefinition, scope: &SessionScope) -> Result<ServerIo> {
		let launch = &definition.launch;
		let mut cmd = Command::new(&launch.command);
		cmd.args(&launch.args)
			.envs(&launch.env)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		if let Some(cwd) = launch.cwd.clone().or_else(|| scope.root_path()) {
			cmd.current_dir(cwd);
		}
		// Detach from our process group so terminal signals do not reach
		// the server.
		#[cfg(unix)]
		cmd.process_group(0);

		let mut child = cmd
			.spawn()
			.map_err(|err| Error::Transport(format!("failed to spawn {}: {err}", launch.command)))?;
		let stdin = child
			.stdin
			.take()
			.ok_or_else(|| Error::Transport("child stdin not captured".into()))?;
		let stdout = child
			.stdout
			.take()
			.ok_or_else(|| Error::Transport("child stdout not captured".into()))?;
		let stderr = child.stderr.take();

		Ok(ServerIo {
			reader: Box::new(stdout),
			writer: Box::new(stdin),
			stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
			child: Some(child),
		})
	}
}

/// A live protocol connection produced by [`establish`].
pub(crate) struct Connection {
	pub socket: ServerSocket,
	/// Join handle of the protocol main loop. Aborting it tears the
	/// connection down; the child handle is dropped (and killed) with it.
	pub mainloop: JoinHandle<()>,
}

/// Wire an established transport to a router and run the protocol loop.
///
/// `on_exit` fires exactly once when the loop ends. End-of-stream and other
/// transport failures are reported as errors; the caller decides whether the
/// exit was expected from its own lifecycle state.
pub(crate) fn establish(
	io: ServerIo,
	router: Router<RouterContext>,
	server: SessionId,
	on_exit: impl FnOnce(Result<()>) + Send + 'static,
) -> Connection {
	let (mainloop, socket) = MainLoop::new_client(move |_socket| router);

	if let Some(stderr) = io.stderr {
		let mut lines = BufReader::new(stderr).lines();
		tokio::spawn(async move {
			while let Ok(Some(line)) = lines.next_line().await {
				warn!(%server, stderr = %line, "language server stderr");
			}
		});
	}

	let reader = io.reader;
	let writer = io.writer;
	let child = io.child;
	let mainloop = tokio::spawn(async move {
		let result = mainloop
			.run_buffered(reader.compat(), writer.compat_write())
			.await;
		drop(child);
		on_exit(result.map_err(Error::from));
	});

	Connection { socket, mainloop }
}
