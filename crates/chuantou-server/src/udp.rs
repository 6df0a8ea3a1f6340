//! UDP half of the data channel.
//!
//! Clients register their UDP source address with a `register` datagram and
//! keep it fresh with `keepalive`s, so the server can reach them through
//! NAT rebinding. Data datagrams carry one UDP payload per logical
//! connection; routes back to the public-port sockets are maintained by
//! the proxy listeners.

use std::{collections::HashMap, net::SocketAddr, sync::{Arc, OnceLock}};

use bytes::BytesMut;
use chuantou_core::{
	debug,
	frame::{Datagram, DatagramCodec},
	info, warn,
};
use tokio::{net::UdpSocket, sync::RwLock};

use crate::ServerShared;

const RECV_BUFFER: usize = 64 * 1024;

/// Where to deliver client→server datagrams for one UDP logical
/// connection: the public-port socket and the user's address on it.
#[derive(Clone)]
pub(crate) struct UdpRoute {
	pub socket: Arc<UdpSocket>,
	pub user_addr: SocketAddr,
	pub client_id: String,
}

#[derive(Default)]
pub(crate) struct UdpChannel {
	socket: OnceLock<Arc<UdpSocket>>,
	/// client id → current data address, with the reverse index kept in
	/// lockstep.
	clients: RwLock<HashMap<String, SocketAddr>>,
	by_addr: RwLock<HashMap<SocketAddr, String>>,
	routes: RwLock<HashMap<String, UdpRoute>>,
}

impl UdpChannel {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn attach(&self, socket: Arc<UdpSocket>) {
		let _ = self.socket.set(socket);
	}

	fn socket(&self) -> Option<&Arc<UdpSocket>> {
		self.socket.get()
	}

	async fn set_client_addr(&self, client_id: String, addr: SocketAddr) {
		let mut clients = self.clients.write().await;
		let mut by_addr = self.by_addr.write().await;
		if let Some(old) = clients.insert(client_id.clone(), addr) {
			by_addr.remove(&old);
		}
		by_addr.insert(addr, client_id);
	}

	async fn client_by_addr(&self, addr: &SocketAddr) -> Option<String> {
		self.by_addr.read().await.get(addr).cloned()
	}

	pub async fn remove_client(&self, client_id: &str) {
		let mut clients = self.clients.write().await;
		let mut by_addr = self.by_addr.write().await;
		if let Some(addr) = clients.remove(client_id) {
			by_addr.remove(&addr);
		}
		drop(by_addr);
		drop(clients);
		self.routes
			.write()
			.await
			.retain(|_, route| route.client_id != client_id);
	}

	pub async fn register_route(&self, conn_id: String, route: UdpRoute) {
		self.routes.write().await.insert(conn_id, route);
	}

	pub async fn unregister_route(&self, conn_id: &str) {
		self.routes.write().await.remove(conn_id);
	}

	/// Send a datagram to a client's registered data address.
	pub async fn send_to_client(&self, client_id: &str, datagram: &Datagram) -> bool {
		let Some(socket) = self.socket() else {
			return false;
		};
		let Some(addr) = self.clients.read().await.get(client_id).copied() else {
			debug!("no UDP data address for client {client_id}");
			return false;
		};
		let mut buf = BytesMut::new();
		if DatagramCodec::encode(datagram, &mut buf).is_err() {
			return false;
		}
		socket.send_to(&buf, addr).await.is_ok()
	}
}

/// Receive loop for the server's UDP channel socket.
pub(crate) async fn run(shared: Arc<ServerShared>) {
	let Some(socket) = shared.udp.socket().cloned() else {
		return;
	};
	let mut buf = vec![0u8; RECV_BUFFER];
	loop {
		tokio::select! {
			_ = shared.ctx.token.cancelled() => break,
			res = socket.recv_from(&mut buf) => {
				let (len, addr) = match res {
					Ok(v) => v,
					Err(err) => {
						warn!(target: "[UDP]", "channel recv error: {err}");
						continue;
					}
				};
				let mut datagram = BytesMut::from(&buf[..len]);
				match DatagramCodec::decode(&mut datagram) {
					Ok(datagram) => handle_datagram(&shared, addr, datagram).await,
					Err(err) => debug!("dropping malformed datagram from {addr}: {err}"),
				}
			}
		}
	}
}

async fn handle_datagram(shared: &Arc<ServerShared>, addr: SocketAddr, datagram: Datagram) {
	match datagram {
		Datagram::Register { client_id } => {
			if !shared.sessions.is_authenticated(&client_id).await {
				debug!("UDP register from {addr} for unknown client {client_id}");
				return;
			}
			info!(target: "[UDP]", "client {client_id} registered data address {addr}");
			shared.udp.set_client_addr(client_id, addr).await;
		}
		Datagram::Keepalive { client_id } => {
			if !shared.sessions.is_authenticated(&client_id).await {
				return;
			}
			shared.udp.set_client_addr(client_id, addr).await;
		}
		Datagram::Data { conn_id, payload } => {
			// Data requires a registered source address.
			let Some(client_id) = shared.udp.client_by_addr(&addr).await else {
				debug!("dropping UDP data from unregistered address {addr}");
				return;
			};
			let route = shared.udp.routes.read().await.get(&conn_id).cloned();
			match route {
				Some(route) if route.client_id == client_id => {
					if let Err(err) = route.socket.send_to(&payload, route.user_addr).await {
						debug!("UDP relay to {} failed: {err}", route.user_addr);
					}
				}
				Some(_) => {
					warn!(target: "[UDP]", "client {client_id} sent datagram for foreign connection {conn_id}");
				}
				None => debug!("UDP data for unknown connection {conn_id}"),
			}
		}
	}
}
