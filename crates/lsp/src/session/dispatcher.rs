//! Serialized outbound dispatch for one connection.
//!
//! Every session owns one bounded queue and one worker. Notification
//! closures run synchronously on the worker; request closures are polled
//! once inline, so any send they perform up to their first suspension point
//! hits the socket in queue order, and the remainder completes on its own
//! task without blocking the queue.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SessionProxy;
use crate::{Error, Result};

pub(crate) const QUEUE_CAPACITY: usize = 64;

type CallFn = Box<dyn FnOnce(&SessionProxy) -> BoxFuture<'static, ()> + Send>;
type NotifyFn = Box<dyn FnOnce(&SessionProxy) -> Result<()> + Send>;

pub(crate) enum Task {
	/// Request-producing work. Dropping an undispatched task drops its reply
	/// slot, which the submitter observes as cancellation.
	Call {
		label: &'static str,
		cancel: CancellationToken,
		run: CallFn,
	},
	/// Synchronous notification send.
	Notify {
		label: &'static str,
		run: NotifyFn,
	},
}

pub(crate) struct Dispatcher {
	tx: mpsc::Sender<Task>,
}

impl Dispatcher {
	/// Start the worker for one connection. The worker exits when every
	/// handle to the queue is gone.
	pub(crate) fn spawn(proxy: SessionProxy) -> Self {
		let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
		tokio::spawn(run_worker(rx, proxy));
		Self { tx }
	}

	/// Enqueue without waiting. A full queue reports backpressure; a closed
	/// one means the session stopped.
	pub(crate) fn submit(&self, task: Task) -> Result<()> {
		self.tx.try_send(task).map_err(|err| match err {
			mpsc::error::TrySendError::Full(_) => Error::Backpressure,
			mpsc::error::TrySendError::Closed(_) => Error::SessionStopped,
		})
	}
}

async fn run_worker(mut rx: mpsc::Receiver<Task>, proxy: SessionProxy) {
	while let Some(task) = rx.recv().await {
		match task {
			Task::Notify { label, run } => {
				if let Err(err) = run(&proxy) {
					if err.is_cancelled() {
						debug!(server = %proxy.server(), label, "notification cancelled");
					} else {
						warn!(server = %proxy.server(), label, error = %err, "notification failed");
					}
				}
			}
			Task::Call { label, cancel, run } => {
				if cancel.is_cancelled() {
					debug!(server = %proxy.server(), label, "request cancelled before dispatch");
					continue;
				}
				let mut fut = run(&proxy);
				// One inline poll orders the send; the rest runs elsewhere.
				if futures::poll!(&mut fut).is_pending() {
					tokio::spawn(fut);
				}
			}
		}
	}
}
