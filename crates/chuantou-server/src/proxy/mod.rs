//! Per-public-port listeners. Each registered port runs one task accepting
//! user TCP connections and receiving user UDP datagrams, both spliced back
//! to the owning client.

mod sniff;
mod tcp;
mod udp;

pub(crate) use udp::UdpSessionTable;

use std::{sync::Arc, time::Duration};

use chuantou_core::{control::Envelope, info, warn};
use tokio::{
	net::{TcpListener, UdpSocket},
	sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::ServerShared;

const UDP_RECV_BUFFER: usize = 64 * 1024;
const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a port listener needs to reach the rest of the server.
#[derive(Clone)]
pub(crate) struct PortCtx {
	pub shared: Arc<ServerShared>,
	pub client_id: String,
	pub port: u16,
	pub control_tx: mpsc::Sender<Envelope>,
	pub cancel: CancellationToken,
}

pub(crate) async fn run_port(ctx: PortCtx, tcp: TcpListener, udp_socket: UdpSocket) {
	let udp_socket = Arc::new(udp_socket);
	let mut table = UdpSessionTable::new();
	let mut buf = vec![0u8; UDP_RECV_BUFFER];
	let mut sweep = tokio::time::interval(UDP_SWEEP_INTERVAL);
	sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	info!(target: "[PROXY]", "port {} open for client {}", ctx.port, ctx.client_id);
	loop {
		tokio::select! {
			_ = ctx.cancel.cancelled() => break,
			accepted = tcp.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						let _ = stream.set_nodelay(true);
						let conn_ctx = ctx.clone();
						ctx.shared.ctx.tasks.spawn(async move {
							tcp::handle_user_conn(conn_ctx, stream, peer).await;
						});
					}
					Err(err) => {
						warn!(target: "[PROXY]", "accept on port {} failed: {err}", ctx.port);
					}
				}
			}
			received = udp_socket.recv_from(&mut buf) => {
				match received {
					Ok((len, peer)) => {
						udp::on_datagram(&ctx, &mut table, &udp_socket, peer, &buf[..len]).await;
					}
					Err(err) => {
						warn!(target: "[PROXY]", "UDP recv on port {} failed: {err}", ctx.port);
					}
				}
			}
			_ = sweep.tick() => {
				udp::evict_idle(&ctx, &mut table).await;
			}
		}
	}

	// Port going away evicts every UDP session it still holds.
	udp::evict_all(&ctx, &mut table).await;
	info!(target: "[PROXY]", "port {} closed", ctx.port);
}
