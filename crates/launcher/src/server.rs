//! The server controller.

use std::{
	future::Future,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	time::Duration,
};

use tokio::io::BufStream;
use tracing::{debug, trace, warn};

use crate::{
	config::{ConnectionProperties, ServerConfig},
	connect::connect,
	errors::{FailedToStop, ServerError},
	execution::{Completion, Execution},
	interrupt::Interrupter,
	policy::{LifecyclePolicy, Policy},
	ready::await_ready,
	shutdown::{shutdown, Shutdown},
};

/// How long `stop()` waits for a destroyed process to be reaped.
const REAP_GRACE: Duration = Duration::from_secs(1);

/// A server which can be started, stopped, and destroyed.
pub trait Server {
	/// Start the server, returning once it is reachable and answers requests.
	///
	/// Does nothing if the server is already started.
	fn start(&mut self) -> impl Future<Output = Result<(), ServerError>> + Send;

	/// Shut the server down, returning once its process has exited or been destroyed.
	///
	/// Does nothing if the server isn't started.
	fn stop(&mut self) -> impl Future<Output = Result<(), ServerError>> + Send;

	/// Forcibly terminate the server's process, if there is one.
	fn destroy(&self);
}

/// The management interface: start and stop, and nothing else.
pub trait Managed {
	/// See [`Server::start`].
	fn start(&mut self) -> impl Future<Output = Result<(), ServerError>> + Send;

	/// See [`Server::stop`].
	fn stop(&mut self) -> impl Future<Output = Result<(), ServerError>> + Send;
}

/// A handle which destroys the server's current process.
///
/// This can be cloned and moved to other tasks, and used while the server is starting or stopping.
#[derive(Clone, Debug, Default)]
pub struct DestroyHandle(Arc<Mutex<Execution>>);

impl DestroyHandle {
	fn lock(&self) -> MutexGuard<'_, Execution> {
		self.0.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Forcibly terminate the server's process, if there is one.
	///
	/// Never fails; does nothing if there's no process or it has exited.
	pub fn destroy(&self) {
		debug!("destroying server");
		self.lock().destroy();
	}
}

/// A redis server running on this host.
///
/// See the [crate documentation](crate) for an overview.
#[derive(Debug)]
pub struct LocalServer<P: LifecyclePolicy = Policy> {
	config: ServerConfig,
	props: ConnectionProperties,
	policy: P,
	execution: DestroyHandle,
	started: bool,
	interrupter: Interrupter,
}

impl<P: LifecyclePolicy> LocalServer<P> {
	/// A server which isn't started yet.
	pub fn new(config: ServerConfig, props: ConnectionProperties, policy: P) -> Self {
		Self {
			config,
			props,
			policy,
			execution: DestroyHandle::default(),
			started: false,
			interrupter: Interrupter::default(),
		}
	}

	/// Whether the server is started.
	///
	/// This doesn't mean the process is alive: it may have been destroyed or killed since.
	#[must_use]
	pub const fn is_started(&self) -> bool {
		self.started
	}

	/// The server's configuration.
	#[must_use]
	pub const fn config(&self) -> &ServerConfig {
		&self.config
	}

	/// The server's lifecycle policy.
	#[must_use]
	pub const fn policy(&self) -> &P {
		&self.policy
	}

	/// A handle which interrupts whatever the server is waiting on.
	///
	/// See the [`interrupt`](crate::interrupt) module.
	#[must_use]
	pub fn interrupter(&self) -> Interrupter {
		self.interrupter.clone()
	}

	/// A handle which destroys the server from elsewhere.
	#[must_use]
	pub fn destroy_handle(&self) -> DestroyHandle {
		self.execution.clone()
	}

	/// The completion handle of the current or last process, if one was spawned.
	#[must_use]
	pub fn completion(&self) -> Option<Completion> {
		self.execution.lock().completion().cloned()
	}

	/// Start the server, returning once it is reachable and answers `PING`.
	///
	/// Does nothing if the server is already started. The server counts as started as soon as a
	/// connection is made, so if the readiness probe fails a later [`stop()`](Self::stop) still
	/// shuts it down. On failure the policy's
	/// [`failed_to_start`](LifecyclePolicy::failed_to_start) hook is called, then the error is
	/// returned.
	pub async fn start(&mut self) -> Result<(), ServerError> {
		if self.started {
			trace!("server already started");
			return Ok(());
		}

		match self.try_start().await {
			Ok(()) => {
				debug!(address=%self.config.address(), "server started");
				Ok(())
			}
			Err(err) => {
				warn!(%err, "server failed to start");
				self.policy.failed_to_start(&self.execution);
				Err(err)
			}
		}
	}

	async fn try_start(&mut self) -> Result<(), ServerError> {
		let destroyer = self.policy.destroyer();
		self.execution.lock().start(&self.config, destroyer)?;

		let stream = connect(
			&self.config.address(),
			self.props.max_connection_attempts(),
			&self.interrupter,
		)
		.await?;
		self.started = true;

		let mut stream = BufStream::new(stream);
		await_ready(
			&mut stream,
			self.props.max_readiness_attempts(),
			&self.interrupter,
		)
		.await
	}

	/// Shut the server down.
	///
	/// Does nothing if the server isn't started. Otherwise sends `SHUTDOWN` and waits for the
	/// process to exit, for up to the shutdown timeout. Problems along the way are given to the
	/// policy's [`failed_to_stop`](LifecyclePolicy::failed_to_stop) hook, and don't stop the
	/// sequence: the process is always destroyed at the end, and the server is always left stopped.
	///
	/// Returns [`ServerError::Interrupted`] if interrupted, otherwise the first error from the
	/// policy, if any.
	pub async fn stop(&mut self) -> Result<(), ServerError> {
		if !self.started {
			trace!("server not started");
			return Ok(());
		}

		let completion = self.completion();
		let mut first_error: Option<FailedToStop> = None;

		let end = shutdown(
			&self.config.address(),
			completion.as_ref(),
			self.props.shutdown_timeout(),
			&self.interrupter,
			|cause| {
				if let Err(err) = self.policy.failed_to_stop(&self.execution, cause) {
					first_error.get_or_insert(err);
				}
			},
		)
		.await;

		self.execution.destroy();
		if let Some(completion) = completion {
			if completion.wait_timeout(REAP_GRACE).await.is_none() {
				debug!(grace=?REAP_GRACE, "process not reaped yet, leaving it");
			}
		}

		self.started = false;
		debug!("server stopped");

		if end == Shutdown::Interrupted {
			return Err(ServerError::Interrupted {
				during: "stopping",
			});
		}

		first_error.map_or(Ok(()), |err| Err(err.into()))
	}

	/// Forcibly terminate the server's process, if there is one.
	///
	/// This doesn't change whether the server is considered started.
	pub fn destroy(&self) {
		self.execution.destroy();
	}
}

impl<P: LifecyclePolicy> Server for LocalServer<P> {
	async fn start(&mut self) -> Result<(), ServerError> {
		Self::start(self).await
	}

	async fn stop(&mut self) -> Result<(), ServerError> {
		Self::stop(self).await
	}

	fn destroy(&self) {
		Self::destroy(self);
	}
}

impl<P: LifecyclePolicy> Managed for LocalServer<P> {
	async fn start(&mut self) -> Result<(), ServerError> {
		Self::start(self).await
	}

	async fn stop(&mut self) -> Result<(), ServerError> {
		Self::stop(self).await
	}
}
