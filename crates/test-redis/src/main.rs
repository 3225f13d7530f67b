use std::{env::args, process::exit, time::Duration};

use tokio::{
	io::{stdin, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
	net::{TcpListener, TcpStream},
	time::sleep,
};

#[derive(Debug, Default)]
struct Options {
	port: u16,
	never_ready: bool,
	ignore_shutdown: bool,
	startup_delay: Option<Duration>,
	from_stdin: bool,
}

fn options() -> Options {
	let mut opts = Options {
		port: 6379,
		..Options::default()
	};

	let mut args = args().skip(1);
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--port" => {
				opts.port = args
					.next()
					.and_then(|p| p.parse().ok())
					.expect("expected a port after --port");
			}
			"--never-ready" => opts.never_ready = true,
			"--ignore-shutdown" => opts.ignore_shutdown = true,
			"--startup-delay" => {
				let ms = args
					.next()
					.and_then(|d| d.parse().ok())
					.expect("expected milliseconds after --startup-delay");
				opts.startup_delay = Some(Duration::from_millis(ms));
			}
			"-" => opts.from_stdin = true,
			other => panic!("unexpected argument {other:?}"),
		}
	}

	opts
}

/// Read `key value` lines from stdin, like redis-server does with `-`.
async fn read_config(opts: &mut Options) {
	let mut input = String::new();
	stdin()
		.read_to_string(&mut input)
		.await
		.expect("reading config from stdin");

	for line in input.lines() {
		let (key, value) = line.split_once(' ').unwrap_or((line, ""));
		if key == "port" {
			opts.port = value.trim().parse().expect("port in config is not a number");
		} else {
			println!("config {key}={value}");
		}
	}
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
	let mut opts = options();
	if opts.from_stdin {
		read_config(&mut opts).await;
	}

	if let Some(delay) = opts.startup_delay {
		sleep(delay).await;
	}

	let listener = TcpListener::bind(("127.0.0.1", opts.port))
		.await
		.expect("binding port");
	println!("Ready to accept connections tcp");

	loop {
		let (conn, _) = listener.accept().await.expect("accepting connection");
		tokio::spawn(serve(conn, opts.never_ready, opts.ignore_shutdown));
	}
}

async fn serve(conn: TcpStream, never_ready: bool, ignore_shutdown: bool) {
	let (read, mut write) = conn.into_split();
	let mut read = BufReader::new(read);

	while let Some(command) = read_command(&mut read).await {
		let reply: &[u8] = match command.to_ascii_uppercase().as_str() {
			"PING" if never_ready => b"-LOADING Redis is loading the dataset in memory\r\n",
			"PING" => b"+PONG\r\n",
			"SHUTDOWN" if ignore_shutdown => {
				eprintln!("ignoring shutdown");
				continue;
			}
			"SHUTDOWN" => {
				eprintln!("shutting down");
				exit(0);
			}
			_ => b"-ERR unknown command\r\n",
		};

		if write.write_all(reply).await.is_err() {
			break;
		}
	}
}

/// Read one command, either as a RESP array or inline, and return its name.
async fn read_command(read: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Option<String> {
	let mut line = String::new();
	if read.read_line(&mut line).await.ok()? == 0 {
		return None;
	}

	let Some(count) = line.trim_end().strip_prefix('*') else {
		return line.split_whitespace().next().map(String::from);
	};

	let count: usize = count.parse().ok()?;
	let mut name = None;
	for _ in 0..count {
		line.clear();
		read.read_line(&mut line).await.ok()?;
		line.clear();
		read.read_line(&mut line).await.ok()?;
		name.get_or_insert_with(|| line.trim_end().to_string());
	}
	name
}
