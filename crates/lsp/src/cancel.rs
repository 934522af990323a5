//! Host-side bulk cancellation of issued requests.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::session::Submitted;
use crate::{Error, Result};

/// Records the cancel handles of requests issued on behalf of one host
/// operation, so the whole batch can be revoked at once.
///
/// After [`cancel`](Self::cancel) the tracker stays cancelled: wrapping
/// further requests cancels them immediately and fails with
/// [`Error::Cancelled`], which callers rethrow unchanged.
#[derive(Debug, Default)]
pub struct CancellationTracker {
	inner: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
	cancelled: bool,
	tokens: Vec<CancellationToken>,
}

impl CancellationTracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a submitted request with this tracker.
	///
	/// If the tracker is already cancelled, the request is cancelled before
	/// this returns `Error::Cancelled`.
	pub fn wrap<T>(&self, submitted: Submitted<T>) -> Result<Submitted<T>> {
		{
			let mut inner = self.inner.lock();
			if !inner.cancelled {
				inner.tokens.push(submitted.cancel_token());
				return Ok(submitted);
			}
		}
		submitted.cancel();
		Err(Error::Cancelled)
	}

	/// Check the flag without recording anything, for callers that want to
	/// bail out before issuing a request.
	pub fn check(&self) -> Result<()> {
		if self.inner.lock().cancelled {
			return Err(Error::Cancelled);
		}
		Ok(())
	}

	pub fn is_cancelled(&self) -> bool {
		self.inner.lock().cancelled
	}

	/// Set the flag and cancel every recorded request.
	pub fn cancel(&self) {
		let tokens = {
			let mut inner = self.inner.lock();
			inner.cancelled = true;
			std::mem::take(&mut inner.tokens)
		};
		for token in tokens {
			token.cancel();
		}
	}
}

#[cfg(test)]
mod tests {
	use tokio::sync::oneshot;

	use super::*;

	fn pending_request() -> (Submitted<i32>, oneshot::Sender<Result<i32>>) {
		let (tx, rx) = oneshot::channel();
		let submitted = Submitted::new(rx, CancellationToken::new());
		(submitted, tx)
	}

	#[tokio::test]
	async fn test_cancel_revokes_recorded_requests() {
		let tracker = CancellationTracker::new();
		let (submitted, _tx) = pending_request();
		let submitted = tracker.wrap(submitted).unwrap();
		let token = submitted.cancel_token();

		assert!(!tracker.is_cancelled());
		tracker.cancel();
		assert!(tracker.is_cancelled());
		assert!(token.is_cancelled());
	}

	#[tokio::test]
	async fn test_wrap_after_cancel_fails() {
		let tracker = CancellationTracker::new();
		tracker.cancel();

		let (submitted, _tx) = pending_request();
		let token = submitted.cancel_token();
		assert!(matches!(tracker.wrap(submitted), Err(Error::Cancelled)));
		assert!(token.is_cancelled());
		assert!(tracker.check().is_err());
	}

	#[tokio::test]
	async fn test_completed_requests_pass_through() {
		let tracker = CancellationTracker::new();
		let (submitted, tx) = pending_request();
		let submitted = tracker.wrap(submitted).unwrap();
		tx.send(Ok(7)).unwrap();
		assert_eq!(submitted.await.unwrap(), 7);
	}
}
