//! UDP sessions on a public port, keyed by user source address. Each
//! inbound datagram refreshes the session's idle timer; sessions idle past
//! the threshold are evicted and announced closed.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use chuantou_core::{
	control::{Body, ConnectionClose, Envelope, NewConnection},
	debug,
	frame::Datagram,
	info,
	types::{Protocol, new_conn_id},
};
use tokio::{net::UdpSocket, time::Instant};

use super::PortCtx;
use crate::{UDP_IDLE, session::ConnectionInfo, udp::UdpRoute};

#[derive(Debug)]
struct UdpSessionEntry {
	conn_id: String,
	last_seen: Instant,
}

/// Pure session bookkeeping, separate from the socket so the timing rules
/// are testable on their own.
#[derive(Debug, Default)]
pub(crate) struct UdpSessionTable {
	entries: HashMap<SocketAddr, UdpSessionEntry>,
}

impl UdpSessionTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Refresh the session for `addr`, creating one when absent. Returns
	/// the connection id and whether it was just created.
	pub fn touch(&mut self, addr: SocketAddr, now: Instant) -> (String, bool) {
		match self.entries.get_mut(&addr) {
			Some(entry) => {
				entry.last_seen = now;
				(entry.conn_id.clone(), false)
			}
			None => {
				let conn_id = new_conn_id();
				self.entries.insert(
					addr,
					UdpSessionEntry {
						conn_id: conn_id.clone(),
						last_seen: now,
					},
				);
				(conn_id, true)
			}
		}
	}

	/// Remove sessions idle longer than `idle` as of `now`.
	pub fn evict_idle(&mut self, idle: Duration, now: Instant) -> Vec<(SocketAddr, String)> {
		let expired: Vec<SocketAddr> = self
			.entries
			.iter()
			.filter(|(_, entry)| now.duration_since(entry.last_seen) > idle)
			.map(|(addr, _)| *addr)
			.collect();
		expired
			.into_iter()
			.filter_map(|addr| {
				self.entries
					.remove(&addr)
					.map(|entry| (addr, entry.conn_id))
			})
			.collect()
	}

	pub fn drain(&mut self) -> Vec<(SocketAddr, String)> {
		self.entries
			.drain()
			.map(|(addr, entry)| (addr, entry.conn_id))
			.collect()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}
}

pub(crate) async fn on_datagram(
	ctx: &PortCtx,
	table: &mut UdpSessionTable,
	socket: &Arc<UdpSocket>,
	peer: SocketAddr,
	payload: &[u8],
) {
	let (conn_id, is_new) = table.touch(peer, Instant::now());
	if is_new {
		ctx.shared
			.sessions
			.add_connection(
				conn_id.clone(),
				ConnectionInfo {
					client_id: ctx.client_id.clone(),
					remote_port: ctx.port,
					protocol: Protocol::Udp,
					remote_address: peer,
					created_at: Instant::now(),
					user_tx: None,
				},
			)
			.await;
		ctx.shared
			.udp
			.register_route(
				conn_id.clone(),
				UdpRoute {
					socket: socket.clone(),
					user_addr: peer,
					client_id: ctx.client_id.clone(),
				},
			)
			.await;
		info!(target: "[PROXY]", "UDP session {conn_id} from {peer} on port {}", ctx.port);
		let announce = Envelope::request(Body::NewConnection(NewConnection {
			connection_id: conn_id.clone(),
			protocol: Protocol::Udp,
			remote_port: ctx.port,
			remote_address: peer.to_string(),
			url: None,
			method: None,
			headers: None,
			body: None,
			ws_headers: None,
		}));
		if ctx.control_tx.send(announce).await.is_err() {
			return;
		}
	}

	let delivered = ctx
		.shared
		.udp
		.send_to_client(
			&ctx.client_id,
			&Datagram::Data {
				conn_id,
				payload: Bytes::copy_from_slice(payload),
			},
		)
		.await;
	if !delivered {
		debug!("dropping datagram from {peer}: client UDP channel unavailable");
	}
}

pub(crate) async fn evict_idle(ctx: &PortCtx, table: &mut UdpSessionTable) {
	for (peer, conn_id) in table.evict_idle(UDP_IDLE, Instant::now()) {
		debug!("UDP session {conn_id} from {peer} idled out");
		close_session(ctx, &conn_id).await;
	}
}

pub(crate) async fn evict_all(ctx: &PortCtx, table: &mut UdpSessionTable) {
	for (_, conn_id) in table.drain() {
		close_session(ctx, &conn_id).await;
	}
}

async fn close_session(ctx: &PortCtx, conn_id: &str) {
	ctx.shared.udp.unregister_route(conn_id).await;
	if ctx.shared.sessions.remove_connection(conn_id).await.is_some() {
		let _ = ctx
			.control_tx
			.send(Envelope::request(Body::ConnectionClose(ConnectionClose {
				connection_id: conn_id.to_owned(),
			})))
			.await;
	}
}
