//! What to do when a server doesn't start or stop as expected.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
	destroyer::{ExitHookDestroyer, NullDestroyer, ProcessDestroyer},
	errors::{FailedToStop, StopFailure},
	server::DestroyHandle,
};

/// A strategy consulted by a [`LocalServer`](crate::server::LocalServer) at every failure point.
///
/// Hooks observe and react: whatever they do, the error which triggered them is still returned to
/// the caller. They're given the server's [`DestroyHandle`] so they can kill it.
pub trait LifecyclePolicy: Send + Sync {
	/// Called when starting failed, just before the error is returned.
	fn failed_to_start(&self, server: &DestroyHandle);

	/// Called for each problem while stopping.
	///
	/// Stopping carries on regardless. Returning an error makes `stop()` return it once it's done
	/// (if it's the first).
	fn failed_to_stop(&self, server: &DestroyHandle, cause: StopFailure) -> Result<(), FailedToStop>;

	/// A destroyer which will also track every process spawned for the server.
	///
	/// This must return the same destroyer every time.
	fn destroyer(&self) -> Arc<dyn ProcessDestroyer>;
}

/// The built-in lifecycle policies.
#[derive(Clone, Debug)]
pub enum Policy {
	/// Leave the server running whatever happens.
	///
	/// Failures to stop are returned as [`FailedToStop`] errors, unless `raise_on_stop_failure` is
	/// false.
	KeepRunningOnError {
		/// Whether failures to stop are errors.
		raise_on_stop_failure: bool,
	},

	/// Destroy the server when it fails to start or stop, or when the program is terminated.
	DestroyOnError {
		/// Tracks the server's processes.
		destroyer: Arc<ExitHookDestroyer>,
	},

	/// Destroy the server when it fails to start or stop, when the program is terminated, and when
	/// the policy is dropped.
	AlwaysDestroy {
		/// Tracks the server's processes.
		destroyer: Arc<ExitHookDestroyer>,
	},
}

impl Default for Policy {
	fn default() -> Self {
		Self::always_destroy()
	}
}

impl Policy {
	/// Leave the server running, raising failures to stop.
	#[must_use]
	pub const fn keep_running_on_error() -> Self {
		Self::KeepRunningOnError {
			raise_on_stop_failure: true,
		}
	}

	/// Destroy the server on errors and on termination.
	#[must_use]
	pub fn destroy_on_error() -> Self {
		Self::DestroyOnError {
			destroyer: Arc::new(ExitHookDestroyer::new()),
		}
	}

	/// Destroy the server on errors, on termination, and when dropped.
	#[must_use]
	pub fn always_destroy() -> Self {
		Self::AlwaysDestroy {
			destroyer: Arc::new(ExitHookDestroyer::on_drop()),
		}
	}
}

impl LifecyclePolicy for Policy {
	fn failed_to_start(&self, server: &DestroyHandle) {
		match self {
			Self::KeepRunningOnError { .. } => {
				debug!("server failed to start, leaving it running");
			}
			Self::DestroyOnError { .. } | Self::AlwaysDestroy { .. } => {
				warn!("server failed to start, destroying it");
				server.destroy();
			}
		}
	}

	fn failed_to_stop(&self, server: &DestroyHandle, cause: StopFailure) -> Result<(), FailedToStop> {
		match self {
			Self::KeepRunningOnError {
				raise_on_stop_failure: true,
			} => {
				warn!(%cause, "server failed to stop");
				Err(FailedToStop { cause })
			}
			Self::KeepRunningOnError {
				raise_on_stop_failure: false,
			} => {
				debug!(%cause, "server failed to stop, ignoring");
				Ok(())
			}
			Self::DestroyOnError { .. } | Self::AlwaysDestroy { .. } => {
				warn!(%cause, "server failed to stop, destroying it");
				server.destroy();
				Ok(())
			}
		}
	}

	fn destroyer(&self) -> Arc<dyn ProcessDestroyer> {
		match self {
			Self::KeepRunningOnError { .. } => Arc::new(NullDestroyer),
			Self::DestroyOnError { destroyer } | Self::AlwaysDestroy { destroyer } => {
				destroyer.clone()
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::{LifecyclePolicy, Policy};
	use crate::{
		destroyer::{ProcessDestroyer, ProcessHandle},
		errors::StopFailure,
		server::DestroyHandle,
	};

	#[test]
	fn keep_running_raises_stop_failures_by_default() {
		let policy = Policy::keep_running_on_error();
		let err = policy
			.failed_to_stop(&DestroyHandle::default(), StopFailure::Timeout(Default::default()))
			.unwrap_err();
		assert!(err.cause.is_timeout());
	}

	#[test]
	fn keep_running_can_swallow_stop_failures() {
		let policy = Policy::KeepRunningOnError {
			raise_on_stop_failure: false,
		};
		policy
			.failed_to_stop(&DestroyHandle::default(), StopFailure::Interrupted)
			.unwrap();
	}

	#[test]
	fn keep_running_tracks_nothing() {
		let destroyer = Policy::keep_running_on_error().destroyer();
		assert_eq!(destroyer.size(), -1);
		assert!(!destroyer.add(&ProcessHandle::new(None)));
	}

	#[test]
	fn destroying_policies_swallow_stop_failures() {
		for policy in [Policy::destroy_on_error(), Policy::always_destroy()] {
			policy
				.failed_to_stop(&DestroyHandle::default(), StopFailure::Interrupted)
				.unwrap();
			policy.failed_to_start(&DestroyHandle::default());
		}
	}

	#[test]
	fn destroyer_is_the_same_every_time() {
		let policy = Policy::destroy_on_error();
		let process = ProcessHandle::new(None);
		assert!(policy.destroyer().add(&process));
		assert!(!policy.destroyer().add(&process));
		assert_eq!(policy.destroyer().size(), 1);
	}

	#[test]
	fn only_always_destroy_kills_on_drop() {
		assert!(!Policy::keep_running_on_error().destroyer().kill_on_drop());
		assert!(!Policy::destroy_on_error().destroyer().kill_on_drop());
		assert!(Policy::always_destroy().destroyer().kill_on_drop());
	}

	#[test]
	fn always_destroy_destroys_when_dropped() {
		let process = ProcessHandle::new(None);
		let policy = Policy::always_destroy();
		policy.destroyer().add(&process);
		drop(policy);
		assert!(process.kill_requested().raised());
	}

	#[test]
	fn destroy_on_error_does_not_destroy_when_dropped() {
		let process = ProcessHandle::new(None);
		let policy = Policy::destroy_on_error();
		let destroyer: Arc<dyn ProcessDestroyer> = policy.destroyer();
		destroyer.add(&process);
		drop(destroyer);
		drop(policy);
		assert!(!process.kill_requested().raised());
	}
}
