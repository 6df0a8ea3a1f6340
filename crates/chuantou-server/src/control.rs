//! Per-control-link dispatcher.
//!
//! Each accepted control link runs this state machine:
//! `UNAUTH → (auth ok) → AUTHENTICATED → (close/timeout) → REMOVED`.
//! Before authentication only `auth` is accepted and the link is closed
//! after the auth window. Once authenticated, unknown message types are
//! logged and ignored so protocol extensions stay non-fatal.

use std::{
	io,
	net::SocketAddr,
	sync::Arc,
	time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{BufMut as _, Bytes, BytesMut};
use chuantou_core::{
	AbstractStream,
	control::{
		AuthResp, Body, ControlCodec, Envelope, Headers, HttpResponse, RegisterPayload,
		RegisterResp,
	},
	debug, info, warn,
};
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::{
	net::{TcpListener, UdpSocket},
	sync::mpsc,
	time::timeout,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
	ServerShared,
	proxy::{self, PortCtx},
	session::RegisterError,
};

const CONTROL_QUEUE: usize = 64;

pub(crate) async fn handle_control_link<S: AbstractStream + 'static>(
	shared: Arc<ServerShared>,
	stream: S,
	read_buf: BytesMut,
	peer: SocketAddr,
) -> eyre::Result<()> {
	let mut parts = FramedParts::new(stream, ControlCodec);
	parts.read_buf = read_buf;
	let mut framed = Framed::from_parts(parts);

	// UNAUTH: exactly one message, and it must be a valid auth.
	let first = timeout(shared.opts.auth_timeout, framed.next())
		.await
		.ok()
		.flatten();
	let (auth_id, token) = match first {
		Some(Ok(Envelope {
			id,
			body: Body::Auth(payload),
		})) => (id, payload.token),
		Some(Ok(envelope)) => {
			warn!(target: "[CONTROL]", "{peer} sent {} before auth", envelope.body.kind());
			return Ok(());
		}
		Some(Err(err)) => {
			warn!(target: "[CONTROL]", "{peer} sent invalid control data: {err}");
			return Ok(());
		}
		None => {
			debug!("{peer} closed or idled out before auth");
			return Ok(());
		}
	};

	let accepted = shared.opts.auth_tokens.is_empty() || shared.opts.auth_tokens.contains(&token);
	if !accepted {
		warn!(target: "[CONTROL]", "{peer} presented an invalid token");
		let _ = framed
			.send(Envelope::response_to(
				auth_id,
				Body::AuthResp(AuthResp {
					success: false,
					client_id: None,
					error: Some("Invalid token".to_string()),
				}),
			))
			.await;
		return Ok(());
	}

	let (control_tx, mut control_rx) = mpsc::channel::<Envelope>(CONTROL_QUEUE);
	let cancel = shared.ctx.token.child_token();
	let client_id = shared
		.sessions
		.create_session(control_tx.clone(), cancel.clone())
		.await;
	shared.sessions.authenticate(&client_id).await;

	framed
		.send(Envelope::response_to(
			auth_id,
			Body::AuthResp(AuthResp {
				success: true,
				client_id: Some(client_id.clone()),
				error: None,
			}),
		))
		.await?;
	info!(target: "[CONTROL]", "client {client_id} authenticated from {peer}");

	// AUTHENTICATED: interleave inbound messages with queued outbound
	// events until the socket or the session goes away.
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			outbound = control_rx.recv() => {
				let Some(envelope) = outbound else { break };
				if framed.send(envelope).await.is_err() {
					break;
				}
			}
			inbound = framed.next() => {
				match inbound {
					Some(Ok(envelope)) => {
						if let Some(reply) = dispatch(&shared, &client_id, &control_tx, envelope).await
							&& framed.send(reply).await.is_err()
						{
							break;
						}
					}
					Some(Err(err)) => {
						warn!(target: "[CONTROL]", "client {client_id} sent invalid control data: {err}");
						break;
					}
					None => break,
				}
			}
		}
	}

	shared.drop_session(&client_id, "control link closed").await;
	Ok(())
}

/// Handle one authenticated message, returning the direct reply if the
/// message calls for one.
async fn dispatch(
	shared: &Arc<ServerShared>,
	client_id: &str,
	control_tx: &mpsc::Sender<Envelope>,
	envelope: Envelope,
) -> Option<Envelope> {
	let Envelope { id, body } = envelope;
	match body {
		Body::Register(payload) => {
			let remote_port = payload.remote_port;
			let reply = match register_port(shared, client_id, &payload, control_tx).await {
				Ok(remote_url) => RegisterResp {
					success: true,
					remote_port: Some(remote_port),
					remote_url: Some(remote_url),
					error: None,
				},
				Err(err) => {
					info!(target: "[CONTROL]", "register {remote_port} for {client_id} rejected: {err}");
					RegisterResp {
						success: false,
						remote_port: Some(remote_port),
						remote_url: None,
						error: Some(err.to_string()),
					}
				}
			};
			Some(Envelope::response_to(id, Body::RegisterResp(reply)))
		}
		Body::Unregister(payload) => {
			if shared
				.sessions
				.unregister_port(client_id, payload.remote_port)
				.await
			{
				info!(target: "[CONTROL]", "client {client_id} unregistered port {}", payload.remote_port);
				None
			} else {
				Some(Envelope::response_to(
					id,
					Body::RegisterResp(RegisterResp {
						success: false,
						remote_port: Some(payload.remote_port),
						remote_url: None,
						error: Some("port not registered by this client".to_string()),
					}),
				))
			}
		}
		Body::Heartbeat(_) => {
			shared.sessions.update_heartbeat(client_id).await;
			Some(Envelope::response_to(
				id,
				Body::HeartbeatResp(chuantou_core::control::HeartbeatPayload {
					timestamp: now_millis(),
				}),
			))
		}
		Body::ConnectionClose(payload) => {
			close_connection(shared, client_id, &payload.connection_id).await;
			None
		}
		Body::HttpResponse(payload) => {
			deliver_http_response(shared, client_id, payload).await;
			None
		}
		Body::HttpResponseHeaders(payload) => {
			let head = http_head(payload.status_code, &payload.headers, None);
			push_user_bytes(shared, client_id, &payload.connection_id, head).await;
			None
		}
		Body::HttpResponseData(payload) => {
			match BASE64.decode(&payload.chunk) {
				Ok(chunk) => {
					push_user_bytes(shared, client_id, &payload.connection_id, chunk.into()).await;
				}
				Err(err) => {
					warn!(target: "[CONTROL]", "bad base64 chunk for {}: {err}", payload.connection_id);
				}
			}
			None
		}
		Body::HttpResponseEnd(payload) => {
			// Dropping the queue closes the user socket, which is how a
			// close-delimited response ends.
			close_connection(shared, client_id, &payload.connection_id).await;
			None
		}
		other => {
			debug!("ignoring {} from client {client_id}", other.kind());
			None
		}
	}
}

/// Register algorithm: range check, atomic reservation, bind outside the
/// critical section with rollback on failure, then start the listener.
async fn register_port(
	shared: &Arc<ServerShared>,
	client_id: &str,
	payload: &RegisterPayload,
	control_tx: &mpsc::Sender<Envelope>,
) -> Result<String, RegisterError> {
	let port = payload.remote_port;
	let cancel = shared.sessions.register_port(client_id, port).await?;

	let bind_addr = SocketAddr::new(shared.opts.host, port);
	let bound = async {
		let tcp = TcpListener::bind(bind_addr).await?;
		let udp = UdpSocket::bind(bind_addr).await?;
		io::Result::Ok((tcp, udp))
	}
	.await;
	let (tcp, udp) = match bound {
		Ok(sockets) => sockets,
		Err(err) => {
			shared.sessions.unregister_port(client_id, port).await;
			let message = match err.kind() {
				io::ErrorKind::AddrInUse => "port already in use".to_string(),
				io::ErrorKind::PermissionDenied => "permission denied".to_string(),
				_ => format!("failed to bind port: {err}"),
			};
			return Err(RegisterError::Bind { message });
		}
	};

	let ctx = PortCtx {
		shared: shared.clone(),
		client_id: client_id.to_owned(),
		port,
		control_tx: control_tx.clone(),
		cancel,
	};
	shared.ctx.tasks.spawn(proxy::run_port(ctx, tcp, udp));

	info!(target: "[CONTROL]", "client {client_id} registered port {port}");
	Ok(format!("{}:{}", shared.opts.public_host, port))
}

async fn close_connection(shared: &Arc<ServerShared>, client_id: &str, conn_id: &str) {
	match shared.sessions.connection(conn_id).await {
		Some(info) if info.client_id == client_id => {
			shared.sessions.remove_connection(conn_id).await;
			shared.udp.unregister_route(conn_id).await;
		}
		Some(_) => {
			warn!(target: "[CONTROL]", "client {client_id} tried to close foreign connection {conn_id}");
		}
		None => {}
	}
}

/// Write a complete buffered HTTP response to the user socket and close it.
async fn deliver_http_response(shared: &Arc<ServerShared>, client_id: &str, payload: HttpResponse) {
	let body = match payload.body.as_deref().map(|b| BASE64.decode(b)) {
		Some(Ok(body)) => body,
		Some(Err(err)) => {
			warn!(target: "[CONTROL]", "bad base64 body for {}: {err}", payload.connection_id);
			close_connection(shared, client_id, &payload.connection_id).await;
			return;
		}
		None => Vec::new(),
	};
	let head = http_head(payload.status_code, &payload.headers, Some(body.len()));
	let mut bytes = BytesMut::with_capacity(head.len() + body.len());
	bytes.put_slice(&head);
	bytes.put_slice(&body);
	push_user_bytes(shared, client_id, &payload.connection_id, bytes.freeze()).await;
	close_connection(shared, client_id, &payload.connection_id).await;
}

async fn push_user_bytes(
	shared: &Arc<ServerShared>,
	client_id: &str,
	conn_id: &str,
	bytes: Bytes,
) {
	let Some(info) = shared.sessions.connection(conn_id).await else {
		debug!("response bytes for unknown connection {conn_id}");
		return;
	};
	if info.client_id != client_id {
		warn!(target: "[CONTROL]", "client {client_id} wrote to foreign connection {conn_id}");
		return;
	}
	let Some(user_tx) = info.user_tx else {
		return;
	};
	// A stalled user socket must not wedge the whole control loop.
	match timeout(crate::STALL_GRACE, user_tx.send(bytes)).await {
		Ok(Ok(())) => {}
		Ok(Err(_)) => debug!("user side of {conn_id} already gone"),
		Err(_) => {
			warn!(target: "[CONTROL]", "user side of {conn_id} stalled, dropping connection");
			shared.sessions.remove_connection(conn_id).await;
		}
	}
}

/// Serialize a response head. The tunnel close-delimits every response, so
/// `Connection: close` is forced and any transport-level length headers the
/// client left in place are dropped in favour of our own.
fn http_head(status: u16, headers: &Headers, content_length: Option<usize>) -> Bytes {
	let mut head = BytesMut::with_capacity(256);
	head.put_slice(format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status)).as_bytes());
	for (name, value) in headers {
		if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
			continue;
		}
		head.put_slice(name.as_bytes());
		head.put_slice(b": ");
		head.put_slice(value.as_bytes());
		head.put_slice(b"\r\n");
	}
	if let Some(len) = content_length {
		head.put_slice(format!("Content-Length: {len}\r\n").as_bytes());
	}
	head.put_slice(b"Connection: close\r\n\r\n");
	head.freeze()
}

fn reason_phrase(status: u16) -> &'static str {
	match status {
		200 => "OK",
		201 => "Created",
		204 => "No Content",
		206 => "Partial Content",
		301 => "Moved Permanently",
		302 => "Found",
		304 => "Not Modified",
		400 => "Bad Request",
		401 => "Unauthorized",
		403 => "Forbidden",
		404 => "Not Found",
		405 => "Method Not Allowed",
		429 => "Too Many Requests",
		500 => "Internal Server Error",
		502 => "Bad Gateway",
		503 => "Service Unavailable",
		504 => "Gateway Timeout",
		_ => "",
	}
}

fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::{http_head, reason_phrase};

	#[test]
	fn head_serialization() {
		let head = http_head(
			200,
			&vec![
				("Content-Type".to_string(), "text/plain".to_string()),
				("content-length".to_string(), "999".to_string()),
			],
			Some(4),
		);
		let text = std::str::from_utf8(&head).unwrap();
		assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(text.contains("Content-Type: text/plain\r\n"));
		// The stale length is replaced by the actual one.
		assert!(!text.contains("999"));
		assert!(text.contains("Content-Length: 4\r\n"));
		assert!(text.ends_with("Connection: close\r\n\r\n"));
	}

	#[test]
	fn unknown_reason_is_empty() {
		assert_eq!(reason_phrase(299), "");
	}
}
