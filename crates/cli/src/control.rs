//! The control socket: start and stop the server remotely.

use std::{error::Error, str::FromStr, sync::Arc};

use miette::{IntoDiagnostic, Result, WrapErr};
use redis_launcher::{
	errors::ServerError,
	policy::LifecyclePolicy,
	server::{DestroyHandle, LocalServer, Managed},
};
use tokio::{
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
	net::{TcpListener, TcpStream},
	sync::{Mutex, Notify},
};
use tracing::{debug, info};

/// A server which can be controlled remotely.
pub trait Controlled: Managed + Send + 'static {
	fn is_started(&self) -> bool;
	fn destroy_handle(&self) -> DestroyHandle;
}

impl<P: LifecyclePolicy + 'static> Controlled for LocalServer<P> {
	fn is_started(&self) -> bool {
		Self::is_started(self)
	}

	fn destroy_handle(&self) -> DestroyHandle {
		Self::destroy_handle(self)
	}
}

/// A control command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
	Start,
	Stop,
	Destroy,
	Status,
	Quit,
}

impl FromStr for Request {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"start" => Ok(Self::Start),
			"stop" => Ok(Self::Stop),
			"destroy" => Ok(Self::Destroy),
			"status" => Ok(Self::Status),
			"quit" => Ok(Self::Quit),
			_ => Err(format!("unknown command {s:?}")),
		}
	}
}

/// Serve control connections until one of them asks to quit.
///
/// Quitting stops the server. Connections are handled concurrently, but requests which need the
/// server wait for each other; `destroy` doesn't, so it can cut short a start or stop in progress.
pub async fn serve<S: Controlled>(listener: TcpListener, server: S) -> Result<()> {
	let destroy = server.destroy_handle();
	let server = Arc::new(Mutex::new(server));
	let quit = Arc::new(Notify::new());

	loop {
		tokio::select! {
			() = quit.notified() => break,
			accepted = listener.accept() => {
				let (conn, peer) = accepted
					.into_diagnostic()
					.wrap_err("accepting control connection")?;
				debug!(%peer, "control connection opened");
				tokio::spawn(session(conn, server.clone(), destroy.clone(), quit.clone()));
			}
		}
	}

	info!("quitting");
	Ok(())
}

async fn session<S: Controlled>(
	conn: TcpStream,
	server: Arc<Mutex<S>>,
	destroy: DestroyHandle,
	quit: Arc<Notify>,
) {
	match converse(conn, &server, &destroy, &quit).await {
		Ok(()) => debug!("control connection closed"),
		Err(err) => debug!(%err, "control connection failed"),
	}
}

async fn converse<S: Controlled>(
	conn: TcpStream,
	server: &Mutex<S>,
	destroy: &DestroyHandle,
	quit: &Notify,
) -> std::io::Result<()> {
	let (read, mut write) = conn.into_split();
	let mut lines = BufReader::new(read).lines();

	while let Some(line) = lines.next_line().await? {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		let request = line.parse::<Request>();
		let quitting = request == Ok(Request::Quit);
		let reply = match request {
			Err(err) => format!("-ERR {err}"),
			Ok(request) => {
				info!(?request, "control request");
				respond(request, server, destroy).await
			}
		};

		write.write_all(reply.as_bytes()).await?;
		write.write_all(b"\r\n").await?;
		write.flush().await?;

		if quitting {
			quit.notify_one();
			break;
		}
	}

	Ok(())
}

async fn respond<S: Controlled>(request: Request, server: &Mutex<S>, destroy: &DestroyHandle) -> String {
	match request {
		Request::Start => reply(server.lock().await.start().await),
		Request::Stop | Request::Quit => reply(server.lock().await.stop().await),
		Request::Destroy => {
			destroy.destroy();
			"+OK".into()
		}
		Request::Status => String::from(if server.lock().await.is_started() {
			"+STARTED"
		} else {
			"+STOPPED"
		}),
	}
}

fn reply(result: Result<(), ServerError>) -> String {
	match result {
		Ok(()) => "+OK".into(),
		Err(err) => format!("-ERR {}", one_line(&err)),
	}
}

/// The error and its causes, on one line.
fn one_line(err: &dyn Error) -> String {
	let mut message = err.to_string();
	let mut source = err.source();
	while let Some(cause) = source {
		let cause_text = cause.to_string();
		if !message.contains(&cause_text) {
			message.push_str(": ");
			message.push_str(&cause_text);
		}
		source = cause.source();
	}
	message.replace(['\r', '\n'], " ")
}
