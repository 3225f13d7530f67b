//! How to run a server, and how hard to try talking to it.

use std::{ffi::OsString, fmt, path::PathBuf, process::Stdio, time::Duration};

use tokio::{process::Command as TokioCommand, sync::mpsc};
use tracing::trace;

use crate::errors::ConfigError;

/// The environment variable consulted for the server executable when none is given.
pub const COMMAND_VAR: &str = "REDIS_LAUNCHER_COMMAND";

/// The port redis listens on by default.
pub const DEFAULT_PORT: u16 = 6379;

/// Where captured output from the server process is sent, in chunks as it is read.
pub type OutputSink = mpsc::UnboundedSender<Vec<u8>>;

/// Everything needed to spawn a server and reach it.
///
/// This is usually built with a [`Configuration`], but can be filled in directly.
#[derive(Clone, Debug)]
pub struct ServerConfig {
	/// Path to the server executable.
	pub program: PathBuf,

	/// Arguments to pass to the executable.
	pub args: Vec<String>,

	/// The host to connect to. The server itself is always local.
	pub host: String,

	/// The port the server listens on.
	pub port: u16,

	/// Configuration written to the process's stdin, which is then closed.
	///
	/// When this is `None`, stdin is null.
	pub input: Option<String>,

	/// Receives everything the process writes to stdout. Discarded if `None`.
	pub stdout: Option<OutputSink>,

	/// Receives everything the process writes to stderr. Discarded if `None`.
	pub stderr: Option<OutputSink>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			program: PathBuf::from("redis-server"),
			args: Vec::new(),
			host: "localhost".into(),
			port: DEFAULT_PORT,
			input: None,
			stdout: None,
			stderr: None,
		}
	}
}

impl ServerConfig {
	/// The `host:port` address of the server.
	#[must_use]
	pub fn address(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Obtain a [`tokio::process::Command`].
	///
	/// Output streams are always piped so they can be drained; stdin is piped only if there's
	/// input to write.
	pub fn to_spawnable(&self) -> TokioCommand {
		trace!(program=?self.program, args=?self.args, "constructing command");

		let mut cmd = TokioCommand::new(&self.program);
		cmd.args(&self.args)
			.stdin(if self.input.is_some() {
				Stdio::piped()
			} else {
				Stdio::null()
			})
			.stdout(Stdio::piped())
			.stderr(Stdio::piped());

		#[cfg(unix)]
		{
			// Resets the sigmask of the process before we spawn it.
			//
			// Required from Rust 1.66:
			// https://github.com/rust-lang/rust/pull/101077
			use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
			unsafe {
				cmd.pre_exec(|| {
					let mut newset = SigSet::all();
					newset.remove(Signal::SIGHUP); // leave SIGHUP alone so nohup works
					sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&newset), None)?;
					Ok(())
				});
			}
		}

		cmd
	}
}

impl fmt::Display for ServerConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.program.display())?;
		for arg in &self.args {
			write!(f, " {arg}")?;
		}

		Ok(())
	}
}

/// Builder for a [`ServerConfig`].
///
/// There are two ways to configure the server:
///
/// - [`Configuration::builder()`] runs the command line as given. If the server should read a
///   `redis.conf` it goes in the arguments, and the port given here must match the one in the file.
/// - [`Configuration::programmatic()`] appends a `-` argument, so the server reads its config from
///   stdin, and writes `port <port>` followed by any [properties](Self::property) to it.
///
/// If no command is set, the [`REDIS_LAUNCHER_COMMAND`](COMMAND_VAR) environment variable is used.
#[derive(Clone, Debug, Default)]
#[must_use]
pub struct Configuration {
	programmatic: bool,
	command: Option<PathBuf>,
	args: Vec<String>,
	host: Option<String>,
	port: Option<u16>,
	properties: Vec<(String, String)>,
	stdout: Option<OutputSink>,
	stderr: Option<OutputSink>,
}

impl Configuration {
	/// A configuration which runs the command line as given.
	pub fn builder() -> Self {
		Self::default()
	}

	/// A configuration which is sent to the server over stdin.
	pub fn programmatic() -> Self {
		Self {
			programmatic: true,
			..Self::default()
		}
	}

	/// Whether the configuration will be sent over stdin.
	#[must_use]
	pub const fn is_programmatic(&self) -> bool {
		self.programmatic
	}

	/// Set the server executable.
	pub fn command(mut self, program: impl Into<PathBuf>) -> Self {
		self.command = Some(program.into());
		self
	}

	/// Add an argument to the command line.
	pub fn arg(mut self, arg: impl Into<String>) -> Self {
		self.args.push(arg.into());
		self
	}

	/// Add arguments to the command line.
	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	/// Set the host to connect to. Defaults to `localhost`.
	pub fn host(mut self, host: impl Into<String>) -> Self {
		self.host = Some(host.into());
		self
	}

	/// Set the port the server listens on. Defaults to [`DEFAULT_PORT`].
	pub fn port(mut self, port: u16) -> Self {
		self.port = Some(port);
		self
	}

	/// Set a configuration property, replacing any earlier value for the same key.
	///
	/// Setting a property makes the configuration programmatic. The `port` key is reserved: use
	/// [`port()`](Self::port) instead. Keys are single words, and values can't span lines.
	pub fn property(
		mut self,
		key: impl Into<String>,
		value: impl Into<String>,
	) -> Result<Self, ConfigError> {
		let key = key.into();
		if key.eq_ignore_ascii_case("port") {
			return Err(ConfigError::ReservedKey { key });
		}
		if key.is_empty() || key.chars().any(char::is_whitespace) {
			return Err(ConfigError::InvalidKey { key });
		}

		let value = value.into();
		if value.contains(['\r', '\n']) {
			return Err(ConfigError::InvalidValue { key, value });
		}

		if let Some(existing) = self.properties.iter_mut().find(|(k, _)| *k == key) {
			existing.1 = value;
		} else {
			self.properties.push((key, value));
		}

		self.programmatic = true;
		Ok(self)
	}

	/// Send the server's stdout to this channel.
	pub fn capture_stdout(mut self, sink: OutputSink) -> Self {
		self.stdout = Some(sink);
		self
	}

	/// Send the server's stderr to this channel.
	pub fn capture_stderr(mut self, sink: OutputSink) -> Self {
		self.stderr = Some(sink);
		self
	}

	/// Build the [`ServerConfig`].
	pub fn build(self) -> Result<ServerConfig, ConfigError> {
		self.build_with_env(|var| std::env::var_os(var))
	}

	fn build_with_env(
		self,
		env: impl FnOnce(&str) -> Option<OsString>,
	) -> Result<ServerConfig, ConfigError> {
		let program = match self.command {
			Some(program) => program,
			None => env(COMMAND_VAR)
				.filter(|cmd| !cmd.is_empty())
				.map(PathBuf::from)
				.ok_or(ConfigError::MissingCommand { var: COMMAND_VAR })?,
		};

		let port = self.port.unwrap_or(DEFAULT_PORT);
		let mut args = self.args;
		let input = if self.programmatic {
			args.push("-".into());
			let mut payload = format!("port {port}");
			for (key, value) in &self.properties {
				payload.push('\n');
				payload.push_str(key);
				payload.push(' ');
				payload.push_str(value);
			}
			Some(payload)
		} else {
			None
		};

		let config = ServerConfig {
			program,
			args,
			host: self.host.unwrap_or_else(|| "localhost".into()),
			port,
			input,
			stdout: self.stdout,
			stderr: self.stderr,
		};
		trace!(%config, port, programmatic=%self.programmatic, "built server config");
		Ok(config)
	}
}

/// How many times to try reaching the server, and how long to wait for it to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionProperties {
	max_connection_attempts: u32,
	max_readiness_attempts: u32,
	shutdown_timeout: Duration,
}

impl Default for ConnectionProperties {
	fn default() -> Self {
		Self {
			max_connection_attempts: 5,
			max_readiness_attempts: 5,
			shutdown_timeout: Duration::from_secs(10),
		}
	}
}

impl ConnectionProperties {
	/// Start from the defaults: 5 connection attempts, 5 readiness attempts, 10 second timeout.
	pub fn builder() -> ConnectionPropertiesBuilder {
		ConnectionPropertiesBuilder(Self::default())
	}

	/// How many times to try connecting before giving up. Always at least 1.
	#[must_use]
	pub const fn max_connection_attempts(&self) -> u32 {
		self.max_connection_attempts
	}

	/// How many times to probe for readiness before giving up. Always at least 1.
	#[must_use]
	pub const fn max_readiness_attempts(&self) -> u32 {
		self.max_readiness_attempts
	}

	/// How long to wait for the server to exit after asking it to shut down.
	#[must_use]
	pub const fn shutdown_timeout(&self) -> Duration {
		self.shutdown_timeout
	}
}

/// Builder for [`ConnectionProperties`].
#[derive(Clone, Copy, Debug)]
#[must_use]
pub struct ConnectionPropertiesBuilder(ConnectionProperties);

impl ConnectionPropertiesBuilder {
	/// Set the connection attempt budget. Zero is raised to one.
	pub fn max_connection_attempts(mut self, attempts: u32) -> Self {
		self.0.max_connection_attempts = attempts.max(1);
		self
	}

	/// Set the readiness attempt budget. Zero is raised to one.
	pub fn max_readiness_attempts(mut self, attempts: u32) -> Self {
		self.0.max_readiness_attempts = attempts.max(1);
		self
	}

	/// Set the shutdown timeout.
	pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
		self.0.shutdown_timeout = timeout;
		self
	}

	/// Finish building.
	#[must_use]
	pub const fn build(self) -> ConnectionProperties {
		self.0
	}
}
