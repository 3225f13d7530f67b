//! Interrupting a server while it waits.
//!
//! Dropping a `start()` or `stop()` future cancels it outright, which is the normal way to cancel
//! async work. An [`Interrupter`] is the gentler alternative: the interrupted operation notices at
//! its next wait, tells the lifecycle policy, does its cleanup, and returns
//! [`ServerError::Interrupted`](crate::errors::ServerError::Interrupted).

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{sync::Notify, time::sleep};
use tracing::trace;

/// Handle which interrupts whatever its server is currently waiting on.
///
/// An interrupt sent while nothing is waiting is kept until the next wait, which then returns
/// immediately; only one interrupt is kept.
#[derive(Clone, Debug, Default)]
pub struct Interrupter(Arc<Notify>);

impl Interrupter {
	/// Interrupt the current or next wait.
	pub fn interrupt(&self) {
		trace!("interrupt requested");
		self.0.notify_one();
	}

	/// Resolves when an interrupt is received, consuming it.
	pub(crate) async fn interrupted(&self) {
		self.0.notified().await;
	}

	/// Sleep for `duration`, or until interrupted.
	///
	/// Returns `false` if the sleep was interrupted.
	pub(crate) async fn sleep(&self, duration: Duration) -> bool {
		self.run(sleep(duration)).await.is_some()
	}

	/// Run a future to completion, or until interrupted.
	pub(crate) async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
		tokio::select! {
			biased;
			() = self.interrupted() => None,
			out = fut => Some(out),
		}
	}
}
