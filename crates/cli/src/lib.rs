#![deny(rust_2018_idioms)]
#![allow(clippy::missing_const_for_fn, clippy::future_not_send)]

use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr};
use redis_launcher::{config::OutputSink, LocalServer};
use tokio::{
	io::{AsyncWrite, AsyncWriteExt},
	net::TcpListener,
	sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::args::{logging, Args};

pub mod args;
pub mod control;

async fn init() -> Result<(Args, Option<tracing_appender::non_blocking::WorkerGuard>)> {
	let log_on = logging::preargs();
	let args = Args::parse();

	let guard = if log_on {
		warn!("ignoring logging options from args");
		None
	} else {
		logging::postargs(&args.logging).await?
	};

	Ok((args, guard))
}

/// Copy captured output to one of our own streams.
fn forward(mut out: impl AsyncWrite + Unpin + Send + 'static) -> OutputSink {
	let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
	tokio::spawn(async move {
		while let Some(chunk) = rx.recv().await {
			if out.write_all(&chunk).await.is_err() || out.flush().await.is_err() {
				break;
			}
		}
	});
	tx
}

pub async fn run() -> Result<()> {
	let (args, _guard) = init().await?;
	debug!(?args, "arguments");

	let mut config = args.server_config()?;
	if args.show_output {
		config.stdout = Some(forward(tokio::io::stdout()));
		config.stderr = Some(forward(tokio::io::stderr()));
	}

	info!(version=%env!("CARGO_PKG_VERSION"), command=%config, "launching server");
	let mut server = LocalServer::new(
		config,
		args.connection_properties(),
		args.policy.to_policy(),
	);

	if let Some(addr) = args.control {
		let listener = TcpListener::bind(addr)
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("binding control socket on {addr}"))?;
		info!(addr=?listener.local_addr().ok(), "listening for control commands");
		return control::serve(listener, server).await;
	}

	server.start().await?;
	info!(address=%server.config().address(), "server started, close stdin to stop it");

	// stdin closing is the signal to stop
	if let Err(err) = tokio::io::copy(&mut tokio::io::stdin(), &mut tokio::io::sink()).await {
		debug!(%err, "stdin error, stopping");
	}

	server.stop().await?;
	info!("server stopped");
	Ok(())
}
