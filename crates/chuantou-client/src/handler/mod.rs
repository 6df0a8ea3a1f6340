//! Unified per-connection handler.
//!
//! Consumes the controller's event stream and dispatches on the protocol
//! hint: `tcp` and `websocket` become raw byte pipes to the local service,
//! `http` becomes a full local round-trip, `udp` opens a datagram session.

pub mod http;
mod pipe;

use std::sync::Arc;

use chuantou_core::{
	AppContext,
	control::{Body, ConnectionClose, Envelope},
	info, types::Protocol, warn,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
	controller::TunnelEvent, data::DataLink, registry::ProxyRegistry, udp::UdpLink,
};

pub struct UnifiedHandler {
	registry: Arc<ProxyRegistry>,
	data: Arc<DataLink>,
	udp: Arc<UdpLink>,
	out_tx: mpsc::Sender<Envelope>,
	http: reqwest::Client,
	cancel: CancellationToken,
	ctx: Arc<AppContext>,
}

impl UnifiedHandler {
	pub fn new(
		registry: Arc<ProxyRegistry>,
		data: Arc<DataLink>,
		udp: Arc<UdpLink>,
		out_tx: mpsc::Sender<Envelope>,
		cancel: CancellationToken,
		ctx: Arc<AppContext>,
	) -> eyre::Result<Self> {
		let http = reqwest::Client::builder()
			.build()
			.map_err(|err| eyre::eyre!("http client: {err}"))?;
		Ok(Self {
			registry,
			data,
			udp,
			out_tx,
			http,
			cancel,
			ctx,
		})
	}

	pub async fn run(self, mut events_rx: mpsc::Receiver<TunnelEvent>) {
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				event = events_rx.recv() => {
					let Some(event) = event else { break };
					self.handle_event(event).await;
				}
			}
		}
	}

	async fn handle_event(&self, event: TunnelEvent) {
		match event {
			TunnelEvent::NewConnection(conn) => {
				let Some(target) = self.registry.get(conn.remote_port) else {
					warn!(
						target: "[HANDLER]",
						"connection {} for unknown port {}",
						conn.connection_id,
						conn.remote_port
					);
					let _ = self
						.out_tx
						.send(Envelope::request(Body::ConnectionClose(ConnectionClose {
							connection_id: conn.connection_id,
						})))
						.await;
					return;
				};
				info!(
					target: "[HANDLER]",
					"connection {} ({}) -> {}",
					conn.connection_id,
					conn.protocol,
					target.local_addr()
				);
				match conn.protocol {
					Protocol::Udp => {
						self.udp.open_session(&conn.connection_id, &target).await;
					}
					Protocol::Http => {
						let job = http::HttpJob {
							client: self.http.clone(),
							out_tx: self.out_tx.clone(),
							conn,
							target,
						};
						self.ctx.tasks.spawn(http::run_http(job));
					}
					Protocol::Tcp | Protocol::Websocket => {
						let job = pipe::PipeJob {
							data: self.data.clone(),
							out_tx: self.out_tx.clone(),
							conn_id: conn.connection_id,
							target,
							cancel: self.cancel.clone(),
						};
						self.ctx.tasks.spawn(pipe::run_pipe(job));
					}
				}
			}
			TunnelEvent::ConnectionClose(payload) => {
				self.data.table.remove(&payload.connection_id).await;
				self.udp.close_session(&payload.connection_id).await;
			}
			TunnelEvent::ConnectionError(payload) => {
				warn!(
					target: "[HANDLER]",
					"connection {} failed remotely: {}",
					payload.connection_id,
					payload.error
				);
				self.data.table.remove(&payload.connection_id).await;
				self.udp.close_session(&payload.connection_id).await;
			}
		}
	}
}
