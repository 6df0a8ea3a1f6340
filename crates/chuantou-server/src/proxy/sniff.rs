//! First-bytes protocol sniffing.
//!
//! A bounded peek at the start of a user TCP connection labels it `http`,
//! `websocket` or `tcp`. The label is advisory: byte forwarding treats all
//! three identically, and an HTTP request that does not fit the peek is
//! demoted to a plain byte pipe rather than parsed any further.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chuantou_core::{control::Headers, types::Protocol};
use tokio::{io::AsyncReadExt as _, net::TcpStream, time::timeout};

/// Peek window. An HTTP request is only treated as such when it fits here.
pub(crate) const SNIFF_MAX: usize = 1024;
/// Server-speaks-first protocols (SMTP, SSH banners) send nothing; give up
/// on sniffing quickly and treat the stream as raw TCP.
const SNIFF_WAIT: Duration = Duration::from_millis(300);

const METHODS: &[&str] = &[
	"GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "TRACE ", "CONNECT ",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpRequestHead {
	pub method: String,
	pub target: String,
	pub headers: Headers,
	/// Present only when the entire body was inside the peek.
	pub body: Option<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) struct Sniffed {
	pub protocol: Protocol,
	/// The peeked bytes, to be forwarded as the first data frame for
	/// `tcp`/`websocket` connections. Empty for fully captured `http`.
	pub initial: Bytes,
	pub http: Option<HttpRequestHead>,
}

pub(crate) async fn sniff(stream: &mut TcpStream) -> std::io::Result<Sniffed> {
	let mut buf = BytesMut::with_capacity(SNIFF_MAX);
	// A single read of the first chunk; short or absent data is fine.
	match timeout(SNIFF_WAIT, stream.read_buf(&mut buf)).await {
		Ok(Ok(_)) => {}
		Ok(Err(err)) => return Err(err),
		Err(_) => {}
	}
	Ok(classify(buf.freeze()))
}

pub(crate) fn classify(initial: Bytes) -> Sniffed {
	if !METHODS
		.iter()
		.any(|method| initial.starts_with(method.as_bytes()))
	{
		return Sniffed {
			protocol: Protocol::Tcp,
			initial,
			http: None,
		};
	}

	let Some(head) = parse_request(&initial) else {
		// Looks like HTTP but the head (or body) did not fit the peek.
		return Sniffed {
			protocol: Protocol::Tcp,
			initial,
			http: None,
		};
	};

	let is_websocket = head.headers.iter().any(|(name, value)| {
		name.eq_ignore_ascii_case("upgrade") && value.to_ascii_lowercase().contains("websocket")
	});
	if is_websocket {
		// Websocket upgrades flow as byte pipes; the parsed head only
		// feeds the advisory `wsHeaders` field.
		return Sniffed {
			protocol: Protocol::Websocket,
			initial,
			http: Some(head),
		};
	}

	Sniffed {
		protocol: Protocol::Http,
		initial: Bytes::new(),
		http: Some(head),
	}
}

/// Bounded textual split of an HTTP/1.x request. Returns `None` whenever
/// the request is not wholly inside the buffer, which demotes the
/// connection to a byte pipe.
fn parse_request(buf: &[u8]) -> Option<HttpRequestHead> {
	let head_end = find_head_end(buf)?;
	let head = std::str::from_utf8(&buf[..head_end]).ok()?;
	let mut lines = head.split("\r\n");

	let request_line = lines.next()?;
	let mut parts = request_line.split(' ');
	let method = parts.next()?.to_owned();
	let target = parts.next()?.to_owned();
	if !parts.next()?.starts_with("HTTP/") {
		return None;
	}

	let mut headers = Headers::new();
	for line in lines {
		if line.is_empty() {
			continue;
		}
		let (name, value) = line.split_once(':')?;
		headers.push((name.trim().to_owned(), value.trim().to_owned()));
	}

	let content_length = match headers
		.iter()
		.find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
	{
		Some((_, value)) => value.parse::<usize>().ok()?,
		None => 0,
	};
	let after_head = &buf[head_end + 4..];
	let body = match content_length {
		0 if after_head.is_empty() => None,
		// Pipelined extra bytes would be lost in http mode; bail out.
		0 => return None,
		n if after_head.len() == n => Some(after_head.to_vec()),
		_ => return None,
	};

	Some(HttpRequestHead {
		method,
		target,
		headers,
		body,
	})
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
	buf.windows(4).position(|window| window == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;
	use chuantou_core::types::Protocol;

	use super::classify;

	#[test]
	fn raw_bytes_are_tcp() {
		let sniffed = classify(Bytes::from_static(b"SSH-2.0-OpenSSH_9.6\r\n"));
		assert_eq!(sniffed.protocol, Protocol::Tcp);
		assert!(sniffed.http.is_none());
		assert_eq!(&sniffed.initial[..4], b"SSH-");
	}

	#[test]
	fn empty_peek_is_tcp() {
		let sniffed = classify(Bytes::new());
		assert_eq!(sniffed.protocol, Protocol::Tcp);
	}

	#[test]
	fn complete_get_is_http() {
		let sniffed = classify(Bytes::from_static(
			b"GET /events?id=1 HTTP/1.1\r\nHost: example\r\nAccept: */*\r\n\r\n",
		));
		assert_eq!(sniffed.protocol, Protocol::Http);
		assert!(sniffed.initial.is_empty());
		let head = sniffed.http.unwrap();
		assert_eq!(head.method, "GET");
		assert_eq!(head.target, "/events?id=1");
		assert_eq!(head.headers.len(), 2);
		assert!(head.body.is_none());
	}

	#[test]
	fn post_with_complete_body() {
		let sniffed = classify(Bytes::from_static(
			b"POST /api HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd",
		));
		let head = sniffed.http.unwrap();
		assert_eq!(head.body.as_deref(), Some(&b"abcd"[..]));
	}

	#[test]
	fn post_with_partial_body_is_demoted() {
		let sniffed = classify(Bytes::from_static(
			b"POST /api HTTP/1.1\r\nContent-Length: 1000\r\n\r\nabcd",
		));
		assert_eq!(sniffed.protocol, Protocol::Tcp);
		assert!(sniffed.http.is_none());
		assert!(!sniffed.initial.is_empty());
	}

	#[test]
	fn truncated_head_is_demoted() {
		let sniffed = classify(Bytes::from_static(b"GET / HTTP/1.1\r\nHost: exam"));
		assert_eq!(sniffed.protocol, Protocol::Tcp);
	}

	#[test]
	fn websocket_upgrade_detected() {
		let sniffed = classify(Bytes::from_static(
			b"GET /ws HTTP/1.1\r\nHost: example\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
		));
		assert_eq!(sniffed.protocol, Protocol::Websocket);
		// Upgrade bytes still flow on the data channel.
		assert!(!sniffed.initial.is_empty());
		assert!(sniffed.http.is_some());
	}
}
