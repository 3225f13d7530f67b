//! The handshake protocol: the two commands sent to the server, and a minimal reply parser.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// `PING` as a RESP array.
pub const PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";

/// `SHUTDOWN` as a RESP array.
pub const SHUTDOWN: &[u8] = b"*1\r\n$8\r\nSHUTDOWN\r\n";

/// The reply to [`PING`] from a server which is ready.
pub const PONG: &str = "+PONG";

/// Read the first line of a reply.
///
/// Bytes are read one at a time and every byte which isn't `\r` or `\n` is kept. The line is
/// considered complete once both a `\r` and a `\n` have been seen, in any order and not
/// necessarily next to each other. If the stream ends first, whatever was read so far is returned.
///
/// Pass a buffered reader: this does one read call per byte.
pub async fn parse<R: AsyncRead + Unpin>(input: &mut R) -> std::io::Result<String> {
	let mut line = Vec::new();
	let mut seen_cr = false;
	let mut seen_lf = false;

	while !(seen_cr && seen_lf) {
		match input.read_u8().await {
			Ok(b'\r') => seen_cr = true,
			Ok(b'\n') => seen_lf = true,
			Ok(byte) => line.push(byte),
			Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
				trace!(read=%line.len(), "end of stream before end of reply");
				break;
			}
			Err(err) => return Err(err),
		}
	}

	Ok(String::from_utf8_lossy(&line).into_owned())
}
