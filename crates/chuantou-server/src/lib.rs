//! Public-facing half of the tunnel: accepts control links and data
//! channels on one port, opens registered public ports, and splices user
//! traffic back to the owning client.

mod control;
mod data;
pub mod proxy;
pub mod session;
mod tls;
mod udp;

#[cfg(test)]
mod tests;

use std::{
	net::{IpAddr, Ipv4Addr, SocketAddr},
	path::PathBuf,
	sync::Arc,
	time::Duration,
};

use bytes::BytesMut;
use chuantou_core::{
	AbstractStream, AppContext,
	control::{Body, ConnectionClose, Envelope},
	frame::DATA_MAGIC,
	info, warn,
};
use eyre::{Context as _, bail};
use tokio::{io::AsyncReadExt as _, net::{TcpListener, UdpSocket}, time::timeout};

pub use crate::session::{SessionManager, Stats};
use crate::{data::DataChannelManager, udp::UdpChannel};

/// Per-logical-connection queue of bytes headed back to the user socket.
pub(crate) const CONN_QUEUE_FRAMES: usize = 64;
/// Outgoing frame queue per client data channel.
pub(crate) const DATA_QUEUE_FRAMES: usize = 256;
/// How long a blocked queue may stay blocked before the other end is
/// declared stalled.
pub(crate) const STALL_GRACE: Duration = Duration::from_secs(5);
/// Idle eviction threshold for UDP sessions.
pub(crate) const UDP_IDLE: Duration = Duration::from_secs(30);

pub struct TlsOpts {
	pub cert: PathBuf,
	pub key: PathBuf,
}

pub struct ServerOpts {
	/// Bind address for the control port and every proxy listener.
	pub host: IpAddr,
	/// TCP port carrying both the control link and the data channel; the
	/// same port number on UDP carries the UDP data channel.
	pub control_port: u16,
	/// Host name used when building `remoteUrl` in register responses.
	pub public_host: String,
	/// Accepted bearer tokens. Empty means accept-any (development).
	pub auth_tokens: Vec<String>,
	pub heartbeat_interval: Duration,
	pub session_timeout: Duration,
	/// Window for a fresh link to complete authentication.
	pub auth_timeout: Duration,
	pub tls: Option<TlsOpts>,
}

impl Default for ServerOpts {
	fn default() -> Self {
		Self {
			host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			control_port: 7000,
			public_host: "127.0.0.1".to_string(),
			auth_tokens: Vec::new(),
			heartbeat_interval: Duration::from_secs(30),
			session_timeout: Duration::from_secs(90),
			auth_timeout: Duration::from_secs(30),
			tls: None,
		}
	}
}

pub(crate) struct ServerShared {
	pub ctx: Arc<AppContext>,
	pub opts: ServerOpts,
	pub sessions: SessionManager,
	pub data: DataChannelManager,
	pub udp: UdpChannel,
}

impl ServerShared {
	/// Remove a session and everything hanging off it: control loop, port
	/// listeners, data channel, logical connections. Safe to call twice;
	/// the second call is a no-op.
	pub async fn drop_session(&self, client_id: &str, reason: &str) {
		let Some(removed) = self.sessions.remove_session(client_id).await else {
			return;
		};
		self.data.remove(client_id).await;
		self.udp.remove_client(client_id).await;
		info!(
			target: "[SESSION]",
			"removed session {client_id} ({reason}): {} ports, {} connections dropped",
			removed.ports.len(),
			removed.conns.len()
		);
	}

	/// Close every logical connection of a client without removing the
	/// session itself (data-channel loss).
	pub async fn close_client_connections(&self, client_id: &str) {
		let conns = self.sessions.connections_of(client_id).await;
		if conns.is_empty() {
			return;
		}
		let control_tx = self.sessions.control_tx(client_id).await;
		for (conn_id, _) in conns {
			self.sessions.remove_connection(&conn_id).await;
			self.udp.unregister_route(&conn_id).await;
			if let Some(tx) = &control_tx {
				let _ = tx
					.send(Envelope::request(Body::ConnectionClose(ConnectionClose {
						connection_id: conn_id,
					})))
					.await;
			}
		}
	}
}

pub struct TunnelServer {
	shared: Arc<ServerShared>,
}

impl TunnelServer {
	pub fn new(ctx: Arc<AppContext>, opts: ServerOpts) -> Self {
		Self {
			shared: Arc::new(ServerShared {
				ctx,
				opts,
				sessions: SessionManager::new(),
				data: DataChannelManager::new(),
				udp: UdpChannel::new(),
			}),
		}
	}

	pub async fn stats(&self) -> Stats {
		self.shared.sessions.stats().await
	}

	pub async fn sessions(&self) -> Vec<session::SessionSummary> {
		self.shared.sessions.sessions().await
	}

	/// Bind the control port (TCP + UDP) and serve until the context token
	/// is cancelled.
	pub async fn listen(&self) -> eyre::Result<()> {
		let shared = &self.shared;
		let addr = SocketAddr::new(shared.opts.host, shared.opts.control_port);

		let listener = TcpListener::bind(addr)
			.await
			.with_context(|| format!("Failed to bind control port on {addr}"))?;
		let local_addr = listener.local_addr()?;
		let udp_socket = UdpSocket::bind(local_addr)
			.await
			.with_context(|| format!("Failed to bind UDP channel on {local_addr}"))?;
		shared.udp.attach(Arc::new(udp_socket));

		let acceptor = match &shared.opts.tls {
			Some(tls) => Some(tls::acceptor(tls)?),
			None => None,
		};

		info!(target: "[SERVER]", "listening on {local_addr} (tls: {})", acceptor.is_some());

		let janitor_shared = shared.clone();
		shared.ctx.tasks.spawn(heartbeat_janitor(janitor_shared));
		let udp_shared = shared.clone();
		shared.ctx.tasks.spawn(udp::run(udp_shared));

		loop {
			tokio::select! {
				_ = shared.ctx.token.cancelled() => {
					info!(target: "[SERVER]", "shutting down");
					break;
				}
				res = listener.accept() => {
					let (stream, peer) = res.wrap_err("accept failed")?;
					let _ = stream.set_nodelay(true);
					let shared = shared.clone();
					let acceptor = acceptor.clone();
					shared.ctx.tasks.clone().spawn(async move {
						let result = match acceptor {
							Some(acceptor) => match acceptor.accept(stream).await {
								Ok(stream) => serve_stream(shared, stream, peer).await,
								Err(err) => {
									warn!(target: "[SERVER]", "TLS accept from {peer} failed: {err}");
									Ok(())
								}
							},
							None => serve_stream(shared, stream, peer).await,
						};
						if let Err(err) = result {
							warn!(target: "[SERVER]", "connection from {peer} ended with error: {err:#}");
						}
					});
				}
			}
		}

		Ok(())
	}
}

/// Tell control links and data channels apart by the first bytes of the
/// stream: the data channel always opens with the `CTDC` magic, a control
/// link with a JSON object.
async fn serve_stream<S: AbstractStream + 'static>(
	shared: Arc<ServerShared>,
	mut stream: S,
	peer: SocketAddr,
) -> eyre::Result<()> {
	let mut buf = BytesMut::with_capacity(1024);
	timeout(shared.opts.auth_timeout, async {
		while buf.len() < DATA_MAGIC.len() {
			let n = stream.read_buf(&mut buf).await?;
			if n == 0 {
				bail!("peer closed before identifying itself");
			}
		}
		eyre::Ok(())
	})
	.await
	.map_err(|_| eyre::eyre!("no data within the auth window"))??;

	if &buf[..DATA_MAGIC.len()] == DATA_MAGIC {
		data::handle_data_channel(shared, stream, buf, peer).await
	} else {
		control::handle_control_link(shared, stream, buf, peer).await
	}
}

async fn heartbeat_janitor(shared: Arc<ServerShared>) {
	let mut interval = tokio::time::interval(shared.opts.heartbeat_interval);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			_ = shared.ctx.token.cancelled() => break,
			_ = interval.tick() => {
				for client_id in shared.sessions.expired(shared.opts.session_timeout).await {
					warn!(target: "[SESSION]", "session {client_id} missed heartbeats");
					shared.drop_session(&client_id, "heartbeat timeout").await;
				}
			}
		}
	}
}
