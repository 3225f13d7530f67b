//! Spawning the server process and keeping track of it.

use std::{
	num::NonZeroI64,
	process::ExitStatus,
	sync::{Arc, Weak},
	time::Duration,
};

use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
	process::{Child, ChildStdin},
	sync::watch,
	time::timeout,
};
use tracing::{debug, trace};

use crate::{
	config::{OutputSink, ServerConfig},
	destroyer::{CompositeDestroyer, ProcessDestroyer, ProcessHandle, ProcessSet},
	errors::{sync_io_error, ServerError, SyncIoError},
};

/// The end status of a process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ProcessEnd {
	/// The process ended successfully, with exit status = 0.
	Success,

	/// The process exited with a non-zero exit status.
	ExitError(NonZeroI64),

	/// The process was killed by a signal (Unix only).
	ExitSignal(i32),
}

impl From<ExitStatus> for ProcessEnd {
	#[cfg(unix)]
	fn from(es: ExitStatus) -> Self {
		use std::os::unix::process::ExitStatusExt;

		match (es.code(), es.signal()) {
			(Some(code), _) => {
				NonZeroI64::try_from(i64::from(code)).map_or(Self::Success, Self::ExitError)
			}
			(None, Some(signal)) => Self::ExitSignal(signal),
			(None, None) => Self::Success,
		}
	}

	#[cfg(not(unix))]
	fn from(es: ExitStatus) -> Self {
		match es.code().map(|code| NonZeroI64::try_from(i64::from(code))) {
			None | Some(Err(_)) => Self::Success,
			Some(Ok(code)) => Self::ExitError(code),
		}
	}
}

type Outcome = Result<ProcessEnd, SyncIoError>;

/// Asynchronous handle to the exit of a spawned process.
///
/// Clones observe the same process.
#[derive(Clone, Debug)]
pub struct Completion(watch::Receiver<Option<Outcome>>);

impl Completion {
	fn channel() -> (watch::Sender<Option<Outcome>>, Self) {
		let (tx, rx) = watch::channel(None);
		(tx, Self(rx))
	}

	/// Whether the process has exited (or waiting on it failed).
	#[must_use]
	pub fn has_result(&self) -> bool {
		self.0.borrow().is_some()
	}

	/// The exit status, if the process has exited.
	#[must_use]
	pub fn exit_status(&self) -> Option<ProcessEnd> {
		self.result().and_then(Result::ok)
	}

	/// The outcome of waiting on the process, if it's done.
	#[must_use]
	pub fn result(&self) -> Option<Outcome> {
		self.0.borrow().clone()
	}

	/// Wait for the process to exit.
	///
	/// Returns an error if waiting on the process failed, or if the task watching it went away
	/// (which happens when the runtime shuts down).
	pub async fn wait(&self) -> Outcome {
		let mut rx = self.0.clone();
		let outcome = match rx.wait_for(Option::is_some).await {
			Ok(outcome) => outcome.clone().unwrap_or_else(|| Err(monitor_gone())),
			Err(_) => Err(monitor_gone()),
		};
		outcome
	}

	/// Wait for the process to exit, for at most `duration`.
	///
	/// Returns `None` on timeout.
	pub async fn wait_timeout(&self, duration: Duration) -> Option<Outcome> {
		timeout(duration, self.wait()).await.ok()
	}
}

fn monitor_gone() -> SyncIoError {
	sync_io_error(std::io::Error::other(
		"process monitor stopped before the process exited",
	))
}

/// One spawn of the server process.
///
/// An execution has its own destroyer, which is combined with the one it's started with: either
/// [`Execution::destroy`] or the external destroyer can kill the process. Starting again replaces
/// the destroyer, and destroys any process still tracked from the previous start.
#[derive(Debug, Default)]
pub struct Execution {
	destroyer: ProcessSet,
	combined: Option<Arc<CompositeDestroyer>>,
	process: Option<ProcessHandle>,
	completion: Option<Completion>,
}

impl Execution {
	/// An execution which hasn't been started.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Spawn the process.
	///
	/// If the config has input, it's written to stdin, which is then closed. Stdout and stderr are
	/// drained in the background, into the config's sinks if it has any. The process is tracked by
	/// this execution's destroyer and by `external`.
	///
	/// Must be called from within a Tokio runtime.
	pub fn start(
		&mut self,
		config: &ServerConfig,
		external: Arc<dyn ProcessDestroyer>,
	) -> Result<Completion, ServerError> {
		if self.process.is_some() {
			debug!("execution restarted, destroying previous process");
			self.destroy();
		}

		self.destroyer = ProcessSet::new();
		let combined = Arc::new(CompositeDestroyer::new(vec![
			Arc::new(self.destroyer.clone()),
			external,
		]));

		let mut cmd = config.to_spawnable();
		cmd.kill_on_drop(combined.kill_on_drop());

		debug!(command=%config, "spawning server");
		let mut child = cmd.spawn().map_err(|err| ServerError::Spawn {
			prog: config.program.clone(),
			err,
		})?;

		let process = ProcessHandle::new(child.id());
		debug!(pid=?process.pid(), "spawned server");

		if let (Some(input), Some(stdin)) = (&config.input, child.stdin.take()) {
			tokio::spawn(feed(stdin, input.clone()));
		}
		if let Some(stdout) = child.stdout.take() {
			tokio::spawn(drain(stdout, config.stdout.clone(), "stdout"));
		}
		if let Some(stderr) = child.stderr.take() {
			tokio::spawn(drain(stderr, config.stderr.clone(), "stderr"));
		}

		combined.add(&process);

		let (done, completion) = Completion::channel();
		tokio::spawn(monitor(child, process.clone(), Arc::downgrade(&combined), done));

		self.combined = Some(combined);
		self.process = Some(process);
		self.completion = Some(completion.clone());
		Ok(completion)
	}

	/// The live process, if there is one.
	#[must_use]
	pub const fn process(&self) -> Option<&ProcessHandle> {
		self.process.as_ref()
	}

	/// The completion handle of the last start.
	#[must_use]
	pub const fn completion(&self) -> Option<&Completion> {
		self.completion.as_ref()
	}

	/// This execution's own destroyer.
	#[must_use]
	pub const fn destroyer(&self) -> &ProcessSet {
		&self.destroyer
	}

	/// Kill the process, if it's still tracked.
	///
	/// The process stops being tracked by every destroyer right away; the kill itself is delivered
	/// in the background. Safe to call any number of times, including before any start.
	pub fn destroy(&mut self) {
		let Some(process) = self.process.take() else {
			trace!("no process to destroy");
			return;
		};

		let tracked = self
			.combined
			.as_ref()
			.is_some_and(|destroyer| destroyer.remove(&process));
		if tracked {
			process.destroy();
		} else {
			trace!(pid=?process.pid(), "process no longer tracked, not destroying");
		}
	}
}

/// Write the input to the process, then close its stdin.
async fn feed(mut stdin: ChildStdin, input: String) {
	if let Err(err) = stdin.write_all(input.as_bytes()).await {
		debug!(%err, "cannot write configuration to stdin");
		return;
	}
	if let Err(err) = stdin.shutdown().await {
		trace!(%err, "cannot close stdin");
	}
	trace!(bytes=%input.len(), "wrote configuration to stdin");
}

/// Read an output stream until it closes, forwarding to the sink if there is one.
async fn drain<R: AsyncRead + Unpin>(mut stream: R, mut sink: Option<OutputSink>, name: &'static str) {
	let mut buf = vec![0; 2048];
	loop {
		match stream.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => {
				if let Some(tx) = &sink {
					if tx.send(buf[..n].to_vec()).is_err() {
						trace!(stream=%name, "capture closed, discarding further output");
						sink = None;
					}
				}
			}
			Err(err) => {
				trace!(stream=%name, %err, "read error, no longer draining");
				break;
			}
		}
	}
	trace!(stream=%name, "stream closed");
}

/// Own the child until it exits, delivering a kill if one is requested.
async fn monitor(
	mut child: Child,
	process: ProcessHandle,
	destroyer: Weak<CompositeDestroyer>,
	done: watch::Sender<Option<Outcome>>,
) {
	let exited = tokio::select! {
		status = child.wait() => Some(status),
		() = process.kill_requested().wait() => None,
	};

	let status = match exited {
		Some(status) => status,
		None => {
			process.record_kill();
			if let Err(err) = child.start_kill() {
				trace!(%err, "cannot kill process, it may have exited already");
			}
			child.wait().await
		}
	};

	let outcome = status
		.map(ProcessEnd::from)
		.map_err(sync_io_error);
	debug!(pid=?process.pid(), ?outcome, "process exited");

	// the execution, and its destroyers, may be gone by now
	if let Some(destroyer) = destroyer.upgrade() {
		destroyer.remove(&process);
	}
	done.send_replace(Some(outcome));
	process.exited().raise();
}

#[cfg(test)]
mod tests {
	use std::{sync::Arc, time::Duration};

	use tokio::sync::mpsc;

	use super::{Completion, Execution, ProcessEnd};
	use crate::{
		config::ServerConfig,
		destroyer::{NullDestroyer, ProcessDestroyer, ProcessSet},
		errors::ServerError,
	};

	fn command(program: &str, args: &[&str]) -> ServerConfig {
		ServerConfig {
			program: program.into(),
			args: args.iter().map(|s| (*s).to_string()).collect(),
			..ServerConfig::default()
		}
	}

	#[tokio::test]
	async fn spawn_error_names_program() {
		let mut exec = Execution::new();
		let err = exec
			.start(
				&command("/definitely/not/a/redis-server", &[]),
				Arc::new(NullDestroyer),
			)
			.unwrap_err();
		assert!(matches!(err, ServerError::Spawn { ref prog, .. } if prog.ends_with("redis-server")));
		assert!(exec.process().is_none());
	}

	#[tokio::test]
	async fn destroy_before_start_is_fine() {
		let mut exec = Execution::new();
		exec.destroy();
		exec.destroy();
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn completes_with_exit_status() {
		let mut exec = Execution::new();
		let completion = exec
			.start(&command("sh", &["-c", "exit 3"]), Arc::new(NullDestroyer))
			.unwrap();

		let end = completion
			.wait_timeout(Duration::from_secs(10))
			.await
			.expect("process should exit")
			.unwrap();
		assert_eq!(end, ProcessEnd::ExitError(3.try_into().unwrap()));
		assert!(completion.has_result());
		assert_eq!(completion.exit_status(), Some(end));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn destroy_kills_and_untracks() {
		let external = Arc::new(ProcessSet::new());
		let mut exec = Execution::new();
		let completion = exec
			.start(&command("sleep", &["60"]), external.clone())
			.unwrap();
		let process = exec.process().unwrap().clone();

		assert_eq!(external.size(), 1);
		assert_eq!(exec.destroyer().size(), 1);
		assert!(completion.wait_timeout(Duration::from_millis(50)).await.is_none());

		exec.destroy();
		assert_eq!(external.size(), 0);
		assert_eq!(exec.destroyer().size(), 0);
		assert!(exec.process().is_none());

		let end = completion
			.wait_timeout(Duration::from_secs(10))
			.await
			.expect("process should be killed")
			.unwrap();
		assert_eq!(end, ProcessEnd::ExitSignal(9));
		assert_eq!(process.kills(), 1);
		assert!(!process.is_alive());

		exec.destroy();
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn external_destroyer_can_kill() {
		let external = Arc::new(ProcessSet::new());
		let mut exec = Execution::new();
		let completion = exec
			.start(&command("sleep", &["60"]), external.clone())
			.unwrap();

		external.destroy_all();
		completion
			.wait_timeout(Duration::from_secs(10))
			.await
			.expect("process should be killed")
			.unwrap();

		// the monitor untracks the process once it's gone
		assert_eq!(external.size(), 0);
		assert_eq!(exec.destroyer().size(), 0);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn composite_destroy_kills_once() {
		let a = Arc::new(ProcessSet::new());
		let mut exec = Execution::new();
		let completion = exec
			.start(&command("sleep", &["60"]), a.clone())
			.unwrap();
		let process = exec.process().unwrap().clone();

		// both the execution's set and the external one destroy it
		a.destroy_all();
		exec.destroyer().destroy_all();

		completion
			.wait_timeout(Duration::from_secs(10))
			.await
			.expect("process should be killed")
			.unwrap();
		assert_eq!(process.kills(), 1);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn input_goes_to_stdin_and_output_to_sink() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let mut config = command("cat", &[]);
		config.input = Some("port 6379\nsave 60".into());
		config.stdout = Some(tx);

		let mut exec = Execution::new();
		let completion = exec.start(&config, Arc::new(NullDestroyer)).unwrap();
		drop(config);
		assert_eq!(
			completion
				.wait_timeout(Duration::from_secs(10))
				.await
				.expect("cat should exit at end of input")
				.unwrap(),
			ProcessEnd::Success
		);

		let mut output = Vec::new();
		while let Some(chunk) = rx.recv().await {
			output.extend(chunk);
		}
		assert_eq!(output, b"port 6379\nsave 60");
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn lots_of_output_does_not_block_the_process() {
		let mut exec = Execution::new();
		let completion = exec
			.start(
				&command("sh", &["-c", "head -c 1000000 /dev/zero; head -c 1000000 /dev/zero >&2"]),
				Arc::new(NullDestroyer),
			)
			.unwrap();
		assert_eq!(
			completion
				.wait_timeout(Duration::from_secs(10))
				.await
				.expect("process should not block on a full pipe")
				.unwrap(),
			ProcessEnd::Success
		);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn restarting_destroys_previous_process() {
		let mut exec = Execution::new();
		let first = exec
			.start(&command("sleep", &["60"]), Arc::new(NullDestroyer))
			.unwrap();
		let second = exec
			.start(&command("sleep", &["60"]), Arc::new(NullDestroyer))
			.unwrap();

		assert!(first.wait_timeout(Duration::from_secs(10)).await.is_some());
		assert!(!second.has_result());
		exec.destroy();
		assert!(second.wait_timeout(Duration::from_secs(10)).await.is_some());
	}

	#[tokio::test]
	async fn wait_resolves_with_published_outcome() {
		let (done, completion) = Completion::channel();
		let waiter = tokio::spawn({
			let completion = completion.clone();
			async move { completion.wait().await }
		});

		done.send_replace(Some(Ok(ProcessEnd::Success)));
		let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(outcome.unwrap(), ProcessEnd::Success);
		assert_eq!(completion.exit_status(), Some(ProcessEnd::Success));
	}

	#[tokio::test]
	async fn wait_errors_when_monitor_is_gone() {
		let (done, completion) = Completion::channel();
		drop(done);
		assert!(completion.wait().await.is_err());
		assert!(!completion.has_result());
	}

	/// The state letter of a process from procfs, or `None` if it's gone.
	#[cfg(target_os = "linux")]
	fn proc_state(pid: u32) -> Option<char> {
		let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
		stat.rsplit_once(')')?.1.trim_start().chars().next()
	}

	#[cfg(target_os = "linux")]
	fn spawn_then_drop_runtime(policy: &crate::policy::Policy) -> u32 {
		use crate::{destroyer::ProcessHandle, policy::LifecyclePolicy};

		let runtime = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.unwrap();
		let pid = runtime.block_on(async {
			let mut exec = Execution::new();
			exec.start(&command("sleep", &["30"]), policy.destroyer())
				.unwrap();
			exec.process().and_then(ProcessHandle::pid).unwrap()
		});
		drop(runtime);
		std::thread::sleep(Duration::from_millis(200));
		pid
	}

	#[cfg(target_os = "linux")]
	#[test]
	fn destroy_on_error_process_outlives_runtime() {
		let policy = crate::policy::Policy::destroy_on_error();
		let pid = spawn_then_drop_runtime(&policy);
		let state = proc_state(pid);
		let _ = std::process::Command::new("kill")
			.args(["-9", &pid.to_string()])
			.status();
		assert!(matches!(state, Some(s) if s != 'Z'), "state: {state:?}");
	}

	#[cfg(target_os = "linux")]
	#[test]
	fn always_destroy_process_dies_with_runtime() {
		let policy = crate::policy::Policy::always_destroy();
		let pid = spawn_then_drop_runtime(&policy);
		let state = proc_state(pid);
		assert!(matches!(state, None | Some('Z')), "state: {state:?}");
	}
}
