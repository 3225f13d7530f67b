use std::{
	env::var,
	io::stderr,
	path::{Path, PathBuf},
};

use clap::{ArgAction, Parser, ValueHint};
use miette::{bail, Result};
use tokio::fs::metadata;
use tracing::{info, warn};
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};

#[derive(Debug, Clone, Parser)]
pub struct LoggingArgs {
	/// Log what the launcher is doing
	///
	/// Once: warnings, such as a server being destroyed after it failed to start. Twice: each
	/// lifecycle step (spawned, connected, ready, shutdown sent, exited). Three times: every
	/// connection attempt and readiness probe, with the server's replies. Four times: everything,
	/// pretty-printed.
	///
	/// $RUST_LOG takes precedence when set, and is the only way to see logs from argument parsing.
	#[arg(
		long,
		short,
		help_heading = super::OPTSET_DEBUGGING,
		action = ArgAction::Count,
		default_value = "0",
		num_args = 0,
	)]
	pub verbose: u8,

	/// Write logs to a file, as JSON lines
	///
	/// Implies '-vvv' unless a level is given. Without a value, or with a directory, logs go to
	/// 'redis-launcher.log' in that directory (default: the current one). Keeps the terminal free
	/// for the server's own output with '--show-output'.
	#[arg(
		long,
		help_heading = super::OPTSET_DEBUGGING,
		num_args = 0..=1,
		default_missing_value = ".",
		value_hint = ValueHint::AnyPath,
		value_name = "PATH",
	)]
	pub log_file: Option<PathBuf>,
}

pub fn preargs() -> bool {
	let mut log_on = false;

	if var("RUST_LOG").is_ok() {
		match tracing_subscriber::fmt::try_init() {
			Ok(()) => {
				warn!(RUST_LOG=?var("RUST_LOG").ok(), "logging configured from RUST_LOG");
				log_on = true;
			}
			Err(e) => eprintln!("redis-launcher: RUST_LOG is set but logging could not start, ignoring it\n{e}"),
		}
	}

	log_on
}

impl LoggingArgs {
	/// How verbose to be, counting a log file without `-v` as `-vvv`.
	fn level(&self) -> u8 {
		match (self.verbose, &self.log_file) {
			(0, Some(_)) => 3,
			(n, _) => n,
		}
	}
}

fn filter(level: u8) -> &'static str {
	match level {
		0 | 1 => "warn",
		2 => "info",
		3 => "debug",
		_ => "trace",
	}
}

/// Split a `--log-file` value into the directory and file name to write to.
async fn log_target(file: &Path) -> Result<(PathBuf, PathBuf)> {
	if metadata(file).await.is_ok_and(|info| info.is_dir()) {
		return Ok((file.to_owned(), PathBuf::from("redis-launcher.log")));
	}

	match (file.parent(), file.file_name()) {
		(Some(parent), Some(name)) => Ok((parent.into(), name.into())),
		_ => bail!("cannot use {} as a log file", file.display()),
	}
}

pub async fn postargs(args: &LoggingArgs) -> Result<Option<WorkerGuard>> {
	let level = args.level();
	if level == 0 {
		return Ok(None);
	}

	let (log_writer, guard) = if let Some(file) = &args.log_file {
		let (dir, name) = log_target(file).await?;
		non_blocking(rolling::never(dir, name))
	} else {
		non_blocking(stderr())
	};

	let mut builder = tracing_subscriber::fmt().with_env_filter(filter(level));
	if level > 2 {
		use tracing_subscriber::fmt::format::FmtSpan;
		builder = builder.with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);
	}

	let init = if args.log_file.is_some() {
		builder.json().with_writer(log_writer).try_init()
	} else if level > 3 {
		builder.pretty().with_writer(log_writer).try_init()
	} else {
		builder.with_writer(log_writer).try_init()
	};

	match init {
		Ok(()) => info!(level = filter(level), "logging initialised"),
		Err(e) => eprintln!("redis-launcher: logging could not start, carrying on without\n{e}"),
	}

	Ok(Some(guard))
}
