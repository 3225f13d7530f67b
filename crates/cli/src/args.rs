use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum, ValueHint};
use miette::Result;
use redis_launcher::{
	config::{ConnectionProperties, ServerConfig, COMMAND_VAR},
	Configuration, Policy,
};

pub mod logging;

const OPTSET_SERVER: &str = "Server options";
const OPTSET_BEHAVIOUR: &str = "Behaviour options";
const OPTSET_DEBUGGING: &str = "Debugging options";

/// Run a local redis-server until told to stop.
///
/// The server is started, probed until it answers PING, and then left running. Without `--control`,
/// it's stopped when stdin closes. With `--control`, it's managed by sending line commands to a TCP
/// socket: `start`, `stop`, `destroy`, `status`, and `quit`.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
#[cfg_attr(debug_assertions, command(before_help = "⚠ DEBUG BUILD ⚠"))]
pub struct Args {
	/// Extra arguments to pass to the server executable
	///
	/// For example, the path to a redis.conf. When using `--set`, don't pass a configuration file
	/// here: the configuration is sent over stdin instead.
	#[arg(
		help_heading = OPTSET_SERVER,
		trailing_var_arg = true,
		allow_hyphen_values = true,
		value_name = "ARGS",
	)]
	pub server_args: Vec<String>,

	/// Path to the redis-server executable
	#[arg(
		long,
		env = COMMAND_VAR,
		help_heading = OPTSET_SERVER,
		value_hint = ValueHint::CommandName,
		value_name = "PATH",
	)]
	pub command: Option<PathBuf>,

	/// Port the server listens on
	///
	/// If the server reads a configuration file, this must match the port in that file.
	#[arg(
		long,
		short,
		help_heading = OPTSET_SERVER,
		default_value_t = redis_launcher::config::DEFAULT_PORT,
	)]
	pub port: u16,

	/// Host to connect to the server on
	#[arg(
		long,
		help_heading = OPTSET_SERVER,
		default_value = "localhost",
	)]
	pub host: String,

	/// Set a configuration property
	///
	/// Can be given multiple times. Setting any property makes the server read its configuration
	/// from stdin, starting with the port. The `port` key is reserved: use `--port` instead.
	#[arg(
		long = "set",
		help_heading = OPTSET_SERVER,
		value_name = "KEY=VALUE",
		value_parser = parse_property,
	)]
	pub properties: Vec<(String, String)>,

	/// Forward the server's stdout and stderr to ours
	///
	/// By default the server's output is read and discarded.
	#[arg(
		long,
		help_heading = OPTSET_SERVER,
	)]
	pub show_output: bool,

	/// What to do when the server fails to start or stop
	///
	/// **keep-running** leaves the server alone, and reports failures to stop as errors.
	/// **destroy-on-error** kills the server when something goes wrong, and when this program is
	/// interrupted or terminated. **always-destroy** additionally kills the server when this program
	/// exits, however that happens.
	#[arg(
		long,
		help_heading = OPTSET_BEHAVIOUR,
		value_enum,
		default_value_t = PolicyArg::AlwaysDestroy,
	)]
	pub policy: PolicyArg,

	/// How many times to try connecting to the server
	///
	/// Attempts are 100 milliseconds apart.
	#[arg(
		long,
		help_heading = OPTSET_BEHAVIOUR,
		default_value_t = 5,
		value_name = "N",
	)]
	pub connect_attempts: u32,

	/// How many times to check whether the server is ready
	///
	/// Checks are one second apart.
	#[arg(
		long,
		help_heading = OPTSET_BEHAVIOUR,
		default_value_t = 5,
		value_name = "N",
	)]
	pub readiness_attempts: u32,

	/// Time to wait for the server to exit after asking it to shut down
	///
	/// Takes a time span value such as "10s" or "1min 30s". When it's passed, the server is killed.
	#[arg(
		long,
		help_heading = OPTSET_BEHAVIOUR,
		default_value = "10s",
		value_parser = humantime::parse_duration,
		value_name = "TIMEOUT",
	)]
	pub shutdown_timeout: Duration,

	/// Listen for control commands on this address
	///
	/// Each connection sends one command per line and gets one reply line per command: `+OK` or
	/// `-ERR <message>`, or for `status`, `+STARTED` or `+STOPPED`. The server is not started until
	/// asked to, and `quit` stops it and exits.
	#[arg(
		long,
		help_heading = OPTSET_BEHAVIOUR,
		value_name = "ADDR",
	)]
	pub control: Option<SocketAddr>,

	#[command(flatten)]
	pub logging: logging::LoggingArgs,
}

/// The built-in lifecycle policies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
	KeepRunning,
	DestroyOnError,
	#[default]
	AlwaysDestroy,
}

impl PolicyArg {
	pub fn to_policy(self) -> Policy {
		match self {
			Self::KeepRunning => Policy::keep_running_on_error(),
			Self::DestroyOnError => Policy::destroy_on_error(),
			Self::AlwaysDestroy => Policy::always_destroy(),
		}
	}
}

fn parse_property(s: &str) -> Result<(String, String), String> {
	let (key, value) = s
		.split_once('=')
		.ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
	Ok((key.trim().to_string(), value.to_string()))
}

impl Args {
	/// Build the server configuration.
	pub fn server_config(&self) -> Result<ServerConfig> {
		let mut builder = Configuration::builder()
			.args(self.server_args.iter().cloned())
			.host(self.host.clone())
			.port(self.port);

		if let Some(command) = &self.command {
			builder = builder.command(command);
		}

		for (key, value) in &self.properties {
			builder = builder.property(key, value)?;
		}

		Ok(builder.build()?)
	}

	pub fn connection_properties(&self) -> ConnectionProperties {
		ConnectionProperties::builder()
			.max_connection_attempts(self.connect_attempts)
			.max_readiness_attempts(self.readiness_attempts)
			.shutdown_timeout(self.shutdown_timeout)
			.build()
	}
}
