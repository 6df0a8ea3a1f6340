//! Per-user-connection forwarding: one task per accepted TCP connection,
//! pumping bytes between the user socket and the client's data channel.

use std::net::SocketAddr;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use chuantou_core::{
	control::{Body, ConnectionClose, Envelope, NewConnection},
	debug,
	frame::Frame,
	info, types::{Protocol, new_conn_id},
};
use tokio::{
	io::{AsyncReadExt as _, AsyncWriteExt as _},
	net::TcpStream,
	sync::mpsc,
	time::Instant,
};

use super::{
	PortCtx,
	sniff::{self, Sniffed},
};
use crate::{CONN_QUEUE_FRAMES, session::ConnectionInfo};

const READ_BUFFER: usize = 16 * 1024;

pub(crate) async fn handle_user_conn(ctx: PortCtx, mut stream: TcpStream, peer: SocketAddr) {
	let sniffed = match sniff::sniff(&mut stream).await {
		Ok(sniffed) => sniffed,
		Err(err) => {
			debug!("sniff on port {} failed: {err}", ctx.port);
			return;
		}
	};

	let conn_id = new_conn_id();
	let cancel = ctx.cancel.child_token();
	let (user_tx, mut user_rx) = mpsc::channel::<Bytes>(CONN_QUEUE_FRAMES);

	ctx.shared
		.sessions
		.add_connection(
			conn_id.clone(),
			ConnectionInfo {
				client_id: ctx.client_id.clone(),
				remote_port: ctx.port,
				protocol: sniffed.protocol,
				remote_address: peer,
				created_at: Instant::now(),
				user_tx: Some(user_tx),
			},
		)
		.await;
	info!(
		target: "[PROXY]",
		"connection {conn_id} ({}) from {peer} on port {}",
		sniffed.protocol,
		ctx.port
	);

	let announce = Envelope::request(Body::NewConnection(new_connection_message(
		&conn_id, &ctx, peer, &sniffed,
	)));
	if ctx.control_tx.send(announce).await.is_err() {
		// Control link gone: the session is being torn down, close silently.
		ctx.shared.sessions.remove_connection(&conn_id).await;
		return;
	}

	// HTTP connections are answered through `http_response*` control
	// messages; everything else flows as data-channel frames, starting
	// with the sniffed bytes.
	let is_http = sniffed.protocol == Protocol::Http;
	if !is_http && !sniffed.initial.is_empty() {
		let frame = Frame {
			conn_id: conn_id.clone(),
			payload: sniffed.initial.clone(),
		};
		if ctx.shared.data.send(&ctx.client_id, frame).await.is_err() {
			teardown(&ctx, &conn_id).await;
			return;
		}
	}

	let (mut read_half, mut write_half) = stream.into_split();
	let mut buf = vec![0u8; READ_BUFFER];
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			read = read_half.read(&mut buf) => {
				match read {
					Ok(0) => break,
					Ok(_) if is_http => {
						// A second pipelined request would land here; the
						// tunnel serves one cycle per connection.
						debug!("discarding extra request bytes on http connection {conn_id}");
					}
					Ok(n) => {
						let frame = Frame {
							conn_id: conn_id.clone(),
							payload: Bytes::copy_from_slice(&buf[..n]),
						};
						// Blocks while the data channel queue is full,
						// pausing this read loop.
						if ctx.shared.data.send(&ctx.client_id, frame).await.is_err() {
							break;
						}
					}
					Err(err) => {
						debug!("read from {peer} failed: {err}");
						break;
					}
				}
			}
			chunk = user_rx.recv() => {
				match chunk {
					Some(bytes) => {
						if write_half.write_all(&bytes).await.is_err() {
							break;
						}
					}
					None => {
						// Connection was removed from the registry; flush
						// and close the user side.
						let _ = write_half.shutdown().await;
						break;
					}
				}
			}
		}
	}

	teardown(&ctx, &conn_id).await;
}

/// Remove the connection and tell the client, unless someone already did.
async fn teardown(ctx: &PortCtx, conn_id: &str) {
	if ctx.shared.sessions.remove_connection(conn_id).await.is_some() {
		let _ = ctx
			.control_tx
			.send(Envelope::request(Body::ConnectionClose(ConnectionClose {
				connection_id: conn_id.to_owned(),
			})))
			.await;
	}
	info!(target: "[PROXY]", "connection {conn_id} closed");
}

fn new_connection_message(
	conn_id: &str,
	ctx: &PortCtx,
	peer: SocketAddr,
	sniffed: &Sniffed,
) -> NewConnection {
	let mut message = NewConnection {
		connection_id: conn_id.to_owned(),
		protocol: sniffed.protocol,
		remote_port: ctx.port,
		remote_address: peer.to_string(),
		url: None,
		method: None,
		headers: None,
		body: None,
		ws_headers: None,
	};
	match (sniffed.protocol, &sniffed.http) {
		(Protocol::Http, Some(head)) => {
			message.url = Some(head.target.clone());
			message.method = Some(head.method.clone());
			message.headers = Some(head.headers.clone());
			message.body = head.body.as_deref().map(|body| BASE64.encode(body));
		}
		(Protocol::Websocket, Some(head)) => {
			message.url = Some(head.target.clone());
			message.ws_headers = Some(head.headers.clone());
		}
		_ => {}
	}
	message
}
