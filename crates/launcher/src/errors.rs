//! Error types.

use std::{
	io::Error,
	path::PathBuf,
	sync::{Arc, OnceLock},
	time::Duration,
};

use miette::Diagnostic;
use thiserror::Error;

/// Convenience type for a [`std::io::Error`] which can be shared across threads.
pub type SyncIoError = Arc<OnceLock<Error>>;

/// Make a [`SyncIoError`] from a [`std::io::Error`].
#[must_use]
pub fn sync_io_error(err: Error) -> SyncIoError {
	let lock = OnceLock::new();
	lock.set(err).expect("unreachable: lock was just created");
	Arc::new(lock)
}

/// Errors returned by [`Server`](crate::server::Server) operations.
///
/// Errors from `start()` are always returned after the lifecycle policy has been told about them;
/// the policy may destroy the server in reaction, but never swallows the error.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ServerError {
	/// The server process could not be spawned.
	#[error("cannot spawn {}: {err}", prog.display())]
	#[diagnostic(code(redis_launcher::spawn))]
	Spawn {
		/// The program which failed to launch.
		prog: PathBuf,

		/// The underlying error.
		#[source]
		err: Error,
	},

	/// No connection could be made to the server within the configured number of attempts.
	#[error("couldn't connect to {addr} after {attempts} attempts ({elapsed:?})")]
	#[diagnostic(
		code(redis_launcher::connect),
		help("is the server listening on the configured port?")
	)]
	Connect {
		/// The address connections were attempted to.
		addr: String,

		/// How many attempts were made.
		attempts: u32,

		/// How long all the attempts took, including the sleeps between them.
		elapsed: Duration,

		/// The error from the last attempt, if there was one.
		#[source]
		last: Option<Error>,
	},

	/// The server accepted a connection but never answered the readiness probe positively.
	#[error("server was not ready to accept requests after {attempts} attempts (last reply: {last_reply:?})")]
	#[diagnostic(code(redis_launcher::not_ready))]
	NotReady {
		/// How many probes were sent.
		attempts: u32,

		/// The last reply read from the server.
		last_reply: String,
	},

	/// Generic I/O error, with some context.
	#[error("io({about}): {err}")]
	#[diagnostic(code(redis_launcher::io_error))]
	IoError {
		/// What it was about.
		about: &'static str,

		/// The I/O error which occurred.
		#[source]
		err: Error,
	},

	/// The operation was interrupted while waiting.
	#[error("interrupted while {during}")]
	#[diagnostic(code(redis_launcher::interrupted))]
	Interrupted {
		/// What was being waited on.
		during: &'static str,
	},

	/// The lifecycle policy decided a failure to stop is an error.
	#[error(transparent)]
	#[diagnostic(transparent)]
	FailedToStop(#[from] FailedToStop),
}

/// What went wrong while stopping a server.
///
/// This is handed to [`LifecyclePolicy::failed_to_stop`](crate::policy::LifecyclePolicy::failed_to_stop)
/// which decides whether it's worth raising.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum StopFailure {
	/// The shutdown command couldn't be delivered.
	///
	/// A refused connection usually means the server has already exited.
	#[error("cannot send shutdown command: {0}")]
	#[diagnostic(code(redis_launcher::stop::communication))]
	Communication(#[source] Error),

	/// The process was still running when the shutdown timeout elapsed.
	#[error("process did not exit within {0:?}")]
	#[diagnostic(code(redis_launcher::stop::timeout))]
	Timeout(Duration),

	/// The wait for the process to exit was interrupted.
	#[error("interrupted while waiting for the process to exit")]
	#[diagnostic(code(redis_launcher::stop::interrupted))]
	Interrupted,
}

impl StopFailure {
	/// Whether this is a [`StopFailure::Timeout`].
	#[must_use]
	pub const fn is_timeout(&self) -> bool {
		matches!(self, Self::Timeout(_))
	}
}

/// Error raised by a lifecycle policy when a server could not be stopped.
#[derive(Debug, Diagnostic, Error)]
#[error("failed to stop server")]
#[diagnostic(code(redis_launcher::failed_to_stop))]
pub struct FailedToStop {
	/// Why stopping failed.
	#[source]
	#[diagnostic_source]
	pub cause: StopFailure,
}

/// Errors from building a [`ServerConfig`](crate::config::ServerConfig).
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConfigError {
	/// A property key is reserved and must be set through its dedicated method.
	#[error("the {key:?} property is reserved")]
	#[diagnostic(
		code(redis_launcher::config::reserved_key),
		help("use the dedicated {key} setting instead")
	)]
	ReservedKey {
		/// The reserved key.
		key: String,
	},

	/// A property key is not usable in a line-based configuration.
	#[error("invalid property key {key:?}")]
	#[diagnostic(
		code(redis_launcher::config::invalid_key),
		help("keys must be non-empty and contain no whitespace")
	)]
	InvalidKey {
		/// The offending key.
		key: String,
	},

	/// A property value would spill onto more than one line of configuration.
	#[error("invalid value for property {key:?}: {value:?}")]
	#[diagnostic(
		code(redis_launcher::config::invalid_value),
		help("values can't contain line breaks")
	)]
	InvalidValue {
		/// The property key.
		key: String,

		/// The offending value.
		value: String,
	},

	/// No executable was given, and none is set in the environment.
	#[error("no redis-server executable configured")]
	#[diagnostic(
		code(redis_launcher::config::missing_command),
		help("set the {var} environment variable to the path of a redis-server executable")
	)]
	MissingCommand {
		/// The environment variable which was consulted.
		var: &'static str,
	},
}
