use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::{
	errors::ServerError,
	interrupt::Interrupter,
	reply::{parse, PING, PONG},
};

/// How long to wait between readiness probes.
pub(crate) const READY_RETRY: Duration = Duration::from_secs(1);

/// Probe the server with `PING` until it replies `+PONG`, up to `max_attempts` times.
///
/// There's no wait after the last attempt.
pub(crate) async fn await_ready<S>(
	stream: &mut S,
	max_attempts: u32,
	interrupter: &Interrupter,
) -> Result<(), ServerError>
where
	S: AsyncBufRead + AsyncWrite + Unpin,
{
	let mut last_reply = String::new();

	for attempt in 1..=max_attempts {
		trace!(attempt, max_attempts, "probing server readiness");
		stream
			.write_all(PING)
			.await
			.map_err(|err| ServerError::IoError {
				about: "sending readiness probe",
				err,
			})?;
		stream.flush().await.map_err(|err| ServerError::IoError {
			about: "sending readiness probe",
			err,
		})?;

		last_reply = interrupter
			.run(parse(&mut *stream))
			.await
			.ok_or(ServerError::Interrupted {
				during: "probing readiness",
			})?
			.map_err(|err| ServerError::IoError {
				about: "reading readiness reply",
				err,
			})?;

		if last_reply == PONG {
			debug!(attempt, "server is ready");
			return Ok(());
		}

		trace!(attempt, reply=%last_reply, "server not ready");
		if attempt < max_attempts && !interrupter.sleep(READY_RETRY).await {
			return Err(ServerError::Interrupted {
				during: "probing readiness",
			});
		}
	}

	Err(ServerError::NotReady {
		attempts: max_attempts,
		last_reply,
	})
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::{
		io::{duplex, AsyncReadExt, AsyncWriteExt, BufStream, DuplexStream},
		time::Instant,
	};

	use super::{await_ready, READY_RETRY};
	use crate::{errors::ServerError, interrupt::Interrupter, reply::PING};

	/// Answer each probe with the next reply, counting probes.
	fn fake(replies: &'static [&'static str]) -> (BufStream<DuplexStream>, tokio::task::JoinHandle<usize>) {
		let (client, mut server) = duplex(1024);
		let task = tokio::spawn(async move {
			let mut probes = 0;
			let mut buf = vec![0; PING.len()];
			while server.read_exact(&mut buf).await.is_ok() {
				assert_eq!(buf, PING);
				let reply = replies[probes.min(replies.len() - 1)];
				probes += 1;
				if server.write_all(reply.as_bytes()).await.is_err() {
					break;
				}
			}
			probes
		});
		(BufStream::new(client), task)
	}

	#[tokio::test]
	async fn ready_on_first_pong() {
		let (mut stream, server) = fake(&["+PONG\r\n"]);
		await_ready(&mut stream, 5, &Interrupter::default())
			.await
			.unwrap();
		drop(stream);
		assert_eq!(server.await.unwrap(), 1);
	}

	#[tokio::test]
	async fn single_attempt_never_sleeps() {
		let (mut stream, server) = fake(&["-LOADING Redis is loading the dataset in memory\r\n"]);
		let start = Instant::now();
		let err = await_ready(&mut stream, 1, &Interrupter::default())
			.await
			.unwrap_err();
		assert!(start.elapsed() < READY_RETRY);

		assert!(
			matches!(err, ServerError::NotReady { attempts: 1, ref last_reply } if last_reply.starts_with("-LOADING")),
			"{err:?}"
		);
		drop(stream);
		assert_eq!(server.await.unwrap(), 1);
	}

	#[tokio::test]
	async fn retries_until_pong() {
		let (mut stream, server) = fake(&["-LOADING\r\n", "+PONG\r\n"]);
		let start = Instant::now();
		await_ready(&mut stream, 3, &Interrupter::default())
			.await
			.unwrap();
		assert!(start.elapsed() >= READY_RETRY);
		drop(stream);
		assert_eq!(server.await.unwrap(), 2);
	}

	#[tokio::test]
	async fn interrupt_during_backoff() {
		let (mut stream, _server) = fake(&["-LOADING\r\n"]);
		let int = Interrupter::default();
		let remote = int.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(50)).await;
			remote.interrupt();
		});

		let start = Instant::now();
		let err = await_ready(&mut stream, 5, &int).await.unwrap_err();
		assert!(matches!(err, ServerError::Interrupted { .. }), "{err:?}");
		assert!(start.elapsed() < READY_RETRY * 2);
	}
}
