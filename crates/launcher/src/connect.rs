use std::time::Duration;

use tokio::{net::TcpStream, time::Instant};
use tracing::{debug, trace};

use crate::{errors::ServerError, interrupt::Interrupter};

/// How long to wait between connection attempts.
pub(crate) const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Connect to the server, trying up to `max_attempts` times.
///
/// Every connection error is retried. There's no wait after the last attempt.
pub(crate) async fn connect(
	addr: &str,
	max_attempts: u32,
	interrupter: &Interrupter,
) -> Result<TcpStream, ServerError> {
	let start = Instant::now();
	let mut last = None;

	for attempt in 1..=max_attempts {
		trace!(%addr, attempt, max_attempts, "connecting to server");
		match interrupter.run(TcpStream::connect(addr)).await {
			None => return Err(ServerError::Interrupted { during: "connecting" }),
			Some(Ok(stream)) => {
				debug!(%addr, attempt, "connected to server");
				return Ok(stream);
			}
			Some(Err(err)) => {
				trace!(%addr, attempt, %err, "connection failed");
				last = Some(err);
			}
		}

		if attempt < max_attempts && !interrupter.sleep(CONNECT_RETRY).await {
			return Err(ServerError::Interrupted { during: "connecting" });
		}
	}

	Err(ServerError::Connect {
		addr: addr.into(),
		attempts: max_attempts,
		elapsed: start.elapsed(),
		last,
	})
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::{net::TcpListener, time::Instant};

	use super::{connect, CONNECT_RETRY};
	use crate::{errors::ServerError, interrupt::Interrupter};

	/// An address nothing is listening on, at least for a moment.
	async fn closed_addr() -> String {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		listener.local_addr().unwrap().to_string()
	}

	#[tokio::test]
	async fn connects_first_time() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap().to_string();
		connect(&addr, 1, &Interrupter::default()).await.unwrap();
	}

	#[tokio::test]
	async fn gives_up_after_max_attempts() {
		let addr = closed_addr().await;
		let start = Instant::now();
		let err = connect(&addr, 3, &Interrupter::default())
			.await
			.unwrap_err();

		let (attempts, elapsed, last) = match err {
			ServerError::Connect {
				attempts,
				elapsed,
				last,
				..
			} => (attempts, elapsed, last),
			other => panic!("expected a connect error, got {other:?}"),
		};
		assert_eq!(attempts, 3);
		assert!(last.is_some());
		// two sleeps, not three
		assert!(elapsed >= CONNECT_RETRY * 2);
		assert!(start.elapsed() < CONNECT_RETRY * 3 + Duration::from_secs(2));
	}

	#[tokio::test]
	async fn error_message_mentions_budget_and_time() {
		let addr = closed_addr().await;
		let err = connect(&addr, 1, &Interrupter::default())
			.await
			.unwrap_err();
		let message = err.to_string();
		assert!(message.contains("after 1 attempts"), "{message}");
		assert!(message.contains(&addr), "{message}");
	}

	#[tokio::test]
	async fn later_attempt_succeeds() {
		let addr = closed_addr().await;

		let late = addr.clone();
		let server = tokio::spawn(async move {
			tokio::time::sleep(CONNECT_RETRY * 2 + CONNECT_RETRY / 2).await;
			let listener = TcpListener::bind(late).await.unwrap();
			let (_conn, _) = listener.accept().await.unwrap();
			// no further attempts once connected
			tokio::time::timeout(Duration::from_millis(300), listener.accept())
				.await
				.is_err()
		});

		let stream = connect(&addr, 10, &Interrupter::default()).await.unwrap();
		assert!(server.await.unwrap());
		drop(stream);
	}

	#[tokio::test]
	async fn interrupt_stops_retrying() {
		let addr = closed_addr().await;
		let int = Interrupter::default();
		let remote = int.clone();
		tokio::spawn(async move {
			tokio::time::sleep(CONNECT_RETRY / 2).await;
			remote.interrupt();
		});

		let start = Instant::now();
		let err = connect(&addr, 1000, &int).await.unwrap_err();
		assert!(matches!(err, ServerError::Interrupted { .. }), "{err:?}");
		assert!(start.elapsed() < Duration::from_secs(5));
	}
}
