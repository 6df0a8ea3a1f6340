//! Client half of the UDP data channel: one socket towards the server
//! (registered, kept alive for NAT rebinding) plus one local socket per
//! UDP logical connection.

use std::{collections::HashMap, sync::Arc};

use bytes::{Bytes, BytesMut};
use chuantou_core::{
	AppContext, debug,
	frame::{Datagram, DatagramCodec},
	info, warn,
};
use tokio::{net::UdpSocket, sync::Mutex};
use tokio_util::sync::CancellationToken;

use crate::registry::ProxyTarget;

const RECV_BUFFER: usize = 64 * 1024;
const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
/// Datagrams that arrive before the session's announcement is processed.
const PENDING_CAP_PACKETS: usize = 16;

#[derive(Default)]
struct UdpSessions {
	/// conn id → local socket (connected to the local service) and the
	/// token that stops its reply loop.
	locals: HashMap<String, (Arc<UdpSocket>, CancellationToken)>,
	pending: HashMap<String, Vec<Bytes>>,
}

pub struct UdpLink {
	socket: Arc<UdpSocket>,
	client_id: String,
	cancel: CancellationToken,
	ctx: Arc<AppContext>,
	sessions: Mutex<UdpSessions>,
}

impl UdpLink {
	/// Bind an ephemeral socket, point it at the server's UDP channel, and
	/// announce this client's data address.
	pub async fn start(
		server_addr: &str,
		client_id: &str,
		cancel: CancellationToken,
		ctx: &Arc<AppContext>,
	) -> eyre::Result<Arc<Self>> {
		let socket = UdpSocket::bind("0.0.0.0:0").await?;
		socket.connect(server_addr).await?;
		let socket = Arc::new(socket);

		let link = Arc::new(Self {
			socket: socket.clone(),
			client_id: client_id.to_owned(),
			cancel: cancel.clone(),
			ctx: ctx.clone(),
			sessions: Mutex::new(UdpSessions::default()),
		});
		link.send_control(&Datagram::Register {
			client_id: client_id.to_owned(),
		})
		.await;
		info!(target: "[UDP]", "UDP channel registered with {server_addr}");

		// Keepalive refreshes the server's address cache through NAT
		// rebinding.
		let keepalive = link.clone();
		let keepalive_cancel = cancel.clone();
		ctx.tasks.spawn(async move {
			let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
			interval.tick().await;
			loop {
				tokio::select! {
					_ = keepalive_cancel.cancelled() => break,
					_ = interval.tick() => {
						keepalive
							.send_control(&Datagram::Keepalive {
								client_id: keepalive.client_id.clone(),
							})
							.await;
					}
				}
			}
		});

		// Receive loop: server → local service.
		let recv = link.clone();
		ctx.tasks.spawn(async move {
			let mut buf = vec![0u8; RECV_BUFFER];
			loop {
				tokio::select! {
					_ = recv.cancel.cancelled() => break,
					received = recv.socket.recv(&mut buf) => {
						let len = match received {
							Ok(len) => len,
							Err(err) => {
								warn!(target: "[UDP]", "channel recv error: {err}");
								break;
							}
						};
						let mut datagram = BytesMut::from(&buf[..len]);
						match DatagramCodec::decode(&mut datagram) {
							Ok(Datagram::Data { conn_id, payload }) => {
								recv.deliver(&conn_id, payload).await;
							}
							Ok(_) => debug!("ignoring control datagram from server"),
							Err(err) => debug!("malformed datagram from server: {err}"),
						}
					}
				}
			}
		});

		Ok(link)
	}

	async fn send_control(&self, datagram: &Datagram) {
		send_datagram(&self.socket, datagram).await;
	}

	/// Open the local side of an announced UDP logical connection and start
	/// relaying replies back to the server.
	pub async fn open_session(&self, conn_id: &str, target: &ProxyTarget) {
		let local = match UdpSocket::bind("0.0.0.0:0").await {
			Ok(socket) => socket,
			Err(err) => {
				warn!(target: "[UDP]", "failed to bind local socket for {conn_id}: {err}");
				return;
			}
		};
		if let Err(err) = local.connect(target.local_addr()).await {
			warn!(target: "[UDP]", "failed to reach {} for {conn_id}: {err}", target.local_addr());
			return;
		}
		let local = Arc::new(local);
		let session_cancel = self.cancel.child_token();

		let backlog = {
			let mut sessions = self.sessions.lock().await;
			sessions
				.locals
				.insert(conn_id.to_owned(), (local.clone(), session_cancel.clone()));
			sessions.pending.remove(conn_id)
		};
		if let Some(backlog) = backlog {
			for payload in backlog {
				let _ = local.send(&payload).await;
			}
		}
		info!(target: "[UDP]", "UDP session {conn_id} -> {}", target.local_addr());

		// Reply loop: local service → server.
		let channel = self.socket.clone();
		let reply_conn = conn_id.to_owned();
		self.ctx.tasks.spawn(async move {
			let mut buf = vec![0u8; RECV_BUFFER];
			loop {
				tokio::select! {
					_ = session_cancel.cancelled() => break,
					received = local.recv(&mut buf) => {
						let len = match received {
							Ok(len) => len,
							Err(err) => {
								debug!("local UDP recv for {reply_conn} failed: {err}");
								break;
							}
						};
						send_datagram(&channel, &Datagram::Data {
							conn_id: reply_conn.clone(),
							payload: Bytes::copy_from_slice(&buf[..len]),
						})
						.await;
					}
				}
			}
		});
	}

	async fn deliver(&self, conn_id: &str, payload: Bytes) {
		let mut sessions = self.sessions.lock().await;
		if let Some((local, _)) = sessions.locals.get(conn_id).cloned() {
			drop(sessions);
			if let Err(err) = local.send(&payload).await {
				debug!("local UDP send for {conn_id} failed: {err}");
			}
			return;
		}
		// The first datagram usually races its own announcement.
		let backlog = sessions.pending.entry(conn_id.to_owned()).or_default();
		if backlog.len() < PENDING_CAP_PACKETS {
			backlog.push(payload);
		} else {
			debug!("dropping early datagram for {conn_id}");
		}
	}

	/// Forget a session and stop its reply loop.
	pub async fn close_session(&self, conn_id: &str) {
		let mut sessions = self.sessions.lock().await;
		if let Some((_, session_cancel)) = sessions.locals.remove(conn_id) {
			session_cancel.cancel();
		}
		sessions.pending.remove(conn_id);
	}
}

async fn send_datagram(socket: &UdpSocket, datagram: &Datagram) {
	let mut buf = BytesMut::new();
	if DatagramCodec::encode(datagram, &mut buf).is_ok()
		&& let Err(err) = socket.send(&buf).await
	{
		debug!("UDP channel send failed: {err}");
	}
}
