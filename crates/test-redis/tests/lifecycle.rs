use std::{net::TcpListener, time::Duration};

use redis_launcher::{
	config::{Configuration, ConnectionProperties, ServerConfig},
	errors::{ServerError, StopFailure},
	execution::{Completion, ProcessEnd},
	policy::Policy,
	server::LocalServer,
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpStream,
	sync::mpsc,
	time::timeout,
};
use tracing_test::traced_test;

const TEST_REDIS: &str = env!("CARGO_BIN_EXE_test-redis");

fn free_port() -> u16 {
	TcpListener::bind("127.0.0.1:0")
		.unwrap()
		.local_addr()
		.unwrap()
		.port()
}

fn with_args(port: u16, extra: &[&str]) -> ServerConfig {
	Configuration::builder()
		.command(TEST_REDIS)
		.args(["--port".to_string(), port.to_string()])
		.args(extra.iter().copied())
		.host("127.0.0.1")
		.port(port)
		.build()
		.unwrap()
}

fn props(readiness_attempts: u32, shutdown_timeout: Duration) -> ConnectionProperties {
	ConnectionProperties::builder()
		.max_connection_attempts(20)
		.max_readiness_attempts(readiness_attempts)
		.shutdown_timeout(shutdown_timeout)
		.build()
}

async fn ping(port: u16) -> String {
	let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
	conn.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
	let mut buf = [0; 64];
	let n = conn.read(&mut buf).await.unwrap();
	String::from_utf8_lossy(&buf[..n]).into_owned()
}

async fn exited(completion: &Completion) -> ProcessEnd {
	timeout(Duration::from_secs(5), completion.wait())
		.await
		.expect("process did not exit")
		.expect("waiting on process failed")
}

#[tokio::test]
#[traced_test]
async fn starts_answers_and_shuts_down() {
	let port = free_port();
	let mut server = LocalServer::new(
		with_args(port, &[]),
		props(5, Duration::from_secs(5)),
		Policy::always_destroy(),
	);

	server.start().await.unwrap();
	assert!(server.is_started());
	assert_eq!(ping(port).await, "+PONG\r\n");

	let completion = server.completion().unwrap();
	server.stop().await.unwrap();
	assert!(!server.is_started());
	assert_eq!(exited(&completion).await, ProcessEnd::Success);
	assert!(logs_contain("server started"));
}

#[tokio::test]
async fn programmatic_configuration_goes_over_stdin() {
	let port = free_port();
	let (tx, mut rx) = mpsc::unbounded_channel();
	let config = Configuration::programmatic()
		.command(TEST_REDIS)
		.host("127.0.0.1")
		.port(port)
		.property("save", "")
		.unwrap()
		.property("appendonly", "no")
		.unwrap()
		.capture_stdout(tx)
		.build()
		.unwrap();

	let mut server = LocalServer::new(config, props(5, Duration::from_secs(5)), Policy::always_destroy());
	server.start().await.unwrap();
	server.stop().await.unwrap();
	drop(server);

	let mut output = Vec::new();
	while let Ok(Some(chunk)) = timeout(Duration::from_secs(5), rx.recv()).await {
		output.extend(chunk);
	}
	let output = String::from_utf8(output).unwrap();
	assert!(output.contains("config save="), "{output}");
	assert!(output.contains("config appendonly=no"), "{output}");
	assert!(output.contains("Ready to accept connections"), "{output}");
}

#[tokio::test]
async fn slow_server_is_waited_for() {
	let port = free_port();
	let mut server = LocalServer::new(
		with_args(port, &["--startup-delay", "500"]),
		props(5, Duration::from_secs(5)),
		Policy::always_destroy(),
	);

	server.start().await.unwrap();
	assert_eq!(ping(port).await, "+PONG\r\n");
	server.stop().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn server_that_never_gets_ready_is_destroyed() {
	let port = free_port();
	let mut server = LocalServer::new(
		with_args(port, &["--never-ready"]),
		props(2, Duration::from_secs(5)),
		Policy::destroy_on_error(),
	);

	let err = server.start().await.unwrap_err();
	assert!(
		matches!(&err, ServerError::NotReady { attempts: 2, last_reply } if last_reply.starts_with("-LOADING")),
		"{err:?}"
	);

	let completion = server.completion().unwrap();
	assert!(matches!(exited(&completion).await, ProcessEnd::ExitSignal(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn ignored_shutdown_times_out_then_kills() {
	let port = free_port();
	let mut server = LocalServer::new(
		with_args(port, &["--ignore-shutdown"]),
		props(5, Duration::from_millis(300)),
		Policy::keep_running_on_error(),
	);

	server.start().await.unwrap();
	let completion = server.completion().unwrap();

	let err = server.stop().await.unwrap_err();
	assert!(
		matches!(&err, ServerError::FailedToStop(f) if matches!(f.cause, StopFailure::Timeout(_))),
		"{err:?}"
	);
	assert!(!server.is_started());
	assert!(matches!(exited(&completion).await, ProcessEnd::ExitSignal(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn dropping_always_destroy_server_kills_it() {
	let port = free_port();
	let mut server = LocalServer::new(
		with_args(port, &["--ignore-shutdown"]),
		props(5, Duration::from_secs(5)),
		Policy::always_destroy(),
	);

	server.start().await.unwrap();
	let completion = server.completion().unwrap();
	drop(server);

	assert!(matches!(exited(&completion).await, ProcessEnd::ExitSignal(_)));
}

#[tokio::test]
async fn wrong_port_fails_to_connect() {
	let port = free_port();
	let config = with_args(port, &[]);
	let config = ServerConfig {
		port: free_port(),
		..config
	};

	let mut server = LocalServer::new(
		config,
		ConnectionProperties::builder()
			.max_connection_attempts(3)
			.build(),
		Policy::always_destroy(),
	);

	let err = server.start().await.unwrap_err();
	assert!(
		matches!(err, ServerError::Connect { attempts: 3, .. }),
		"{err:?}"
	);
	assert!(!server.is_started());
}
