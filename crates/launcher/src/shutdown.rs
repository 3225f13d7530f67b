use std::time::Duration;

use tokio::{io::AsyncWriteExt, net::TcpStream};
use tracing::{debug, trace};

use crate::{
	errors::StopFailure, execution::Completion, interrupt::Interrupter, reply::SHUTDOWN,
};

/// How the shutdown sequence ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Shutdown {
	/// The sequence ran to the end, whether or not the process exited.
	Completed,

	/// The sequence was interrupted. The failure has already been reported.
	Interrupted,
}

/// Ask the server to shut down, and wait up to `timeout` for the process to exit.
///
/// Failures don't stop the sequence: each one is reported to `failed` as it happens, and the
/// sequence carries on. If there's no completion to wait on, only the command is sent.
pub(crate) async fn shutdown(
	addr: &str,
	completion: Option<&Completion>,
	timeout: Duration,
	interrupter: &Interrupter,
	mut failed: impl FnMut(StopFailure),
) -> Shutdown {
	debug!(%addr, "sending shutdown command");
	match interrupter.run(send(addr)).await {
		None => {
			failed(StopFailure::Interrupted);
			return Shutdown::Interrupted;
		}
		Some(Err(err)) => {
			debug!(%err, "cannot send shutdown command");
			failed(StopFailure::Communication(err));
		}
		Some(Ok(())) => trace!("shutdown command sent"),
	}

	let Some(completion) = completion else {
		return Shutdown::Completed;
	};

	match interrupter.run(completion.wait_timeout(timeout)).await {
		None => {
			failed(StopFailure::Interrupted);
			Shutdown::Interrupted
		}
		Some(None) => {
			debug!(?timeout, "server did not exit in time");
			failed(StopFailure::Timeout(timeout));
			Shutdown::Completed
		}
		Some(Some(outcome)) => {
			debug!(?outcome, "server exited");
			Shutdown::Completed
		}
	}
}

/// Send the shutdown command on a fresh connection, which is closed afterwards.
async fn send(addr: &str) -> std::io::Result<()> {
	let mut stream = TcpStream::connect(addr).await?;
	stream.write_all(SHUTDOWN).await?;
	stream.flush().await
}
