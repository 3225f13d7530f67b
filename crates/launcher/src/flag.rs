//! A flag that can be raised once to wake any number of tasks.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct Flag(Arc<watch::Sender<bool>>);

impl Default for Flag {
	fn default() -> Self {
		Self::new(false)
	}
}

impl Flag {
	pub fn new(value: bool) -> Self {
		Self(Arc::new(watch::Sender::new(value)))
	}

	pub fn raised(&self) -> bool {
		*self.0.borrow()
	}

	/// Raise the flag. Returns `true` if this call did the raising.
	pub fn raise(&self) -> bool {
		!self.0.send_replace(true)
	}

	/// Resolves once the flag is raised; immediately if it already is.
	pub async fn wait(&self) {
		let mut rx = self.0.subscribe();
		// the sender lives in self, so this can't fail while we borrow it
		let _ = rx.wait_for(|set| *set).await;
	}
}
