use std::{
	sync::{Mutex, OnceLock, PoisonError},
	time::Duration,
};

use tokio::{runtime::Handle, time::timeout};
use tracing::{debug, trace, warn};

use super::{ProcessDestroyer, ProcessHandle, ProcessSet};
use crate::flag::Flag;

/// How long to wait for destroyed processes to exit before letting the program die.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// How many destroyers are listening for signals, program-wide.
static LISTENERS: Mutex<usize> = Mutex::new(0);

/// A destroyer which destroys its processes when the supervising program is terminated.
///
/// On the first [`add`](ProcessDestroyer::add), this spawns a task on the current Tokio runtime
/// which listens for termination signals: Ctrl-C everywhere, and additionally `SIGTERM` and
/// `SIGHUP` on Unix. When one arrives, every tracked process is destroyed, and once they've exited
/// (or a short grace period has passed) the signal is re-raised with its default disposition so the
/// program terminates as it would have without this destroyer.
///
/// Listening replaces the default handling of those signals. On Unix, once the last listening
/// destroyer is dropped, the default handling is put back, and it's swapped out again when another
/// destroyer starts listening. Anything else in the program which listens for these signals
/// through Tokio stops receiving them while no destroyer is listening.
///
/// With [`on_drop`](Self::on_drop), tracked processes are also destroyed when the destroyer is
/// dropped, which covers the program ending normally. Those processes are also spawned with
/// kill-on-drop, so they're killed if the runtime is shut down while they're still running.
/// Without it, processes outlive the runtime unless a signal arrives.
#[derive(Debug)]
pub struct ExitHookDestroyer {
	processes: ProcessSet,
	destroy_on_drop: bool,
	listening: OnceLock<bool>,
	dropped: Flag,
}

impl Default for ExitHookDestroyer {
	fn default() -> Self {
		Self::new()
	}
}

impl ExitHookDestroyer {
	/// Destroy tracked processes when the program is terminated by a signal.
	#[must_use]
	pub fn new() -> Self {
		Self::with_drop(false)
	}

	/// Destroy tracked processes when the program is terminated, or when this is dropped.
	#[must_use]
	pub fn on_drop() -> Self {
		Self::with_drop(true)
	}

	fn with_drop(destroy_on_drop: bool) -> Self {
		Self {
			processes: ProcessSet::new(),
			destroy_on_drop,
			listening: OnceLock::new(),
			dropped: Flag::default(),
		}
	}

	/// Whether this destroys its processes when dropped.
	#[must_use]
	pub const fn destroys_on_drop(&self) -> bool {
		self.destroy_on_drop
	}

	fn listen(&self) {
		self.listening.get_or_init(|| {
			let Ok(runtime) = Handle::try_current() else {
				warn!("no tokio runtime, processes will not be destroyed on termination signals");
				return false;
			};
			let _guard = runtime.enter();

			let mut listeners = LISTENERS.lock().unwrap_or_else(PoisonError::into_inner);
			if *listeners == 0 {
				dispositions::take_over();
			}

			let signals = match Signals::install() {
				Ok(signals) => signals,
				Err(err) => {
					warn!(%err, "cannot install signal handlers, processes will not be destroyed on termination");
					if *listeners == 0 {
						dispositions::give_back();
					}
					return false;
				}
			};
			*listeners += 1;
			drop(listeners);

			let processes = self.processes.clone();
			let dropped = self.dropped.clone();
			runtime.spawn(async move {
				tokio::select! {
					() = dropped.wait() => {
						trace!("exit hook destroyer dropped, no longer listening");
					}
					signal = signals.recv() => {
						warn!(?signal, "terminating: destroying supervised processes");
						destroy_and_wait(&processes, EXIT_GRACE).await;
						reraise(signal);
					}
				}
			});
			debug!("listening for termination signals");
			true
		});
	}

	fn stop_listening(&self) {
		if self.listening.get() != Some(&true) {
			return;
		}

		let mut listeners = LISTENERS.lock().unwrap_or_else(PoisonError::into_inner);
		*listeners = listeners.saturating_sub(1);
		if *listeners == 0 {
			debug!("last exit hook gone, restoring default signal handling");
			dispositions::give_back();
		}
	}
}

impl ProcessDestroyer for ExitHookDestroyer {
	fn add(&self, process: &ProcessHandle) -> bool {
		self.listen();
		self.processes.add(process)
	}

	fn remove(&self, process: &ProcessHandle) -> bool {
		self.processes.remove(process)
	}

	fn size(&self) -> isize {
		self.processes.size()
	}

	fn destroy_all(&self) {
		self.processes.destroy_all();
	}

	fn kill_on_drop(&self) -> bool {
		self.destroy_on_drop
	}
}

impl Drop for ExitHookDestroyer {
	fn drop(&mut self) {
		self.dropped.raise();
		self.stop_listening();
		if self.destroy_on_drop {
			debug!(count=%self.processes.size(), "exit hook destroyer dropped, destroying processes");
			self.processes.destroy_all();
		}
	}
}

/// Destroy every process in the set and wait until they've all exited, or `grace` has passed.
async fn destroy_and_wait(processes: &ProcessSet, grace: Duration) -> bool {
	let handles = processes.handles();
	for handle in &handles {
		handle.destroy();
	}

	let all_exited = async {
		for handle in &handles {
			handle.exited().wait().await;
		}
	};

	let exited = timeout(grace, all_exited).await.is_ok();
	if !exited {
		warn!(?grace, "supervised processes did not all exit in time");
	}
	exited
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Termination {
	Interrupt,
	#[cfg(unix)]
	Terminate,
	#[cfg(unix)]
	Hangup,
}

/// The termination signal streams, set up synchronously so the handlers are in place on return.
#[cfg(unix)]
struct Signals {
	int: tokio::signal::unix::Signal,
	term: tokio::signal::unix::Signal,
	hup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
	fn install() -> std::io::Result<Self> {
		use tokio::signal::unix::{signal, SignalKind};

		Ok(Self {
			int: signal(SignalKind::interrupt())?,
			term: signal(SignalKind::terminate())?,
			hup: signal(SignalKind::hangup())?,
		})
	}

	async fn recv(mut self) -> Termination {
		tokio::select! {
			_ = self.int.recv() => Termination::Interrupt,
			_ = self.term.recv() => Termination::Terminate,
			_ = self.hup.recv() => Termination::Hangup,
		}
	}
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
	#[allow(clippy::unnecessary_wraps)]
	fn install() -> std::io::Result<Self> {
		Ok(Self)
	}

	async fn recv(self) -> Termination {
		match tokio::signal::ctrl_c().await {
			Ok(()) => Termination::Interrupt,
			Err(err) => {
				warn!(%err, "cannot listen for ctrl-c, processes will not be destroyed on termination");
				std::future::pending().await
			}
		}
	}
}

/// Swapping the runtime's signal handlers with the default dispositions.
#[cfg(unix)]
mod dispositions {
	use std::sync::{Mutex, PoisonError};

	use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
	use tracing::warn;

	const SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

	/// Handlers set aside while the default dispositions are in place.
	static SET_ASIDE: Mutex<Vec<(Signal, SigAction)>> = Mutex::new(Vec::new());

	/// Put back any handlers set aside by [`give_back`].
	pub(super) fn take_over() {
		let mut set_aside = SET_ASIDE.lock().unwrap_or_else(PoisonError::into_inner);
		for (sig, action) in set_aside.drain(..) {
			// SAFETY: reinstating an action exactly as it was read back from the kernel
			if let Err(err) = unsafe { sigaction(sig, &action) } {
				warn!(%err, ?sig, "cannot reinstate signal handler");
			}
		}
	}

	/// Restore the default dispositions, keeping the current handlers aside.
	pub(super) fn give_back() {
		let mut set_aside = SET_ASIDE.lock().unwrap_or_else(PoisonError::into_inner);
		let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
		for sig in SIGNALS {
			// SAFETY: installing the default disposition, no handler code is involved
			match unsafe { sigaction(sig, &default) } {
				Ok(previous) if previous.handler() != SigHandler::SigDfl => {
					set_aside.push((sig, previous));
				}
				Ok(_) => {}
				Err(err) => warn!(%err, ?sig, "cannot restore default signal disposition"),
			}
		}
	}
}

#[cfg(not(unix))]
mod dispositions {
	pub(super) fn take_over() {}
	pub(super) fn give_back() {}
}

/// Restore the default behaviour for the signal and raise it again, killing the program.
#[cfg(unix)]
fn reraise(signal: Termination) {
	use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

	let sig = match signal {
		Termination::Interrupt => Signal::SIGINT,
		Termination::Terminate => Signal::SIGTERM,
		Termination::Hangup => Signal::SIGHUP,
	};

	let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
	// SAFETY: installing the default disposition, no handler code is involved
	if let Err(err) = unsafe { sigaction(sig, &default) } {
		warn!(%err, ?sig, "cannot restore default signal disposition");
	}

	unblock(sig);
	if let Err(err) = raise(sig) {
		warn!(%err, ?sig, "cannot re-raise signal, exiting instead");
	}

	std::process::exit(128 + sig as i32);
}

/// Let a signal through to this thread, in case it's masked.
#[cfg(unix)]
fn unblock(sig: nix::sys::signal::Signal) {
	let mut set = nix::sys::signal::SigSet::empty();
	set.add(sig);
	if let Err(err) = set.thread_unblock() {
		warn!(%err, ?sig, "cannot unblock signal");
	}
}

#[cfg(not(unix))]
fn reraise(_signal: Termination) {
	std::process::exit(0xC000_013A_u32 as i32);
}
