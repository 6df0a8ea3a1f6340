//! Control-link controller.
//!
//! Owns the connection lifecycle
//! `IDLE → CONNECTING → OPEN → AUTHENTICATING → AUTHENTICATED → WAITING →
//! CONNECTING …`, correlates requests with responses by message id, drives
//! heartbeats, and schedules reconnection with exponential backoff and
//! jitter. Authentication rejection is terminal; transport loss is not.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use chuantou_core::{
	AbstractStream, AppContext,
	control::{
		AuthPayload, Body, ConnectionClose, ConnectionError, ControlCodec, Envelope,
		HeartbeatPayload, NewConnection, RegisterPayload,
	},
	debug, info, warn,
};
use eyre::eyre;
use futures_util::{SinkExt as _, StreamExt as _};
use rand::Rng as _;
use snafu::Snafu;
use tokio::{
	net::TcpStream,
	sync::{mpsc, oneshot},
	time::timeout,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use uuid::Uuid;

use crate::{
	ClientOpts, data::DataLink, handler::UnifiedHandler, registry::{ProxyRegistry, ProxyTarget},
	tls, udp::UdpLink,
};

const OUT_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 64;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const JITTER_MAX_MS: u64 = 1000;

/// How a correlated request can fail. The wire carries human-readable
/// strings; this is their classification at the edge, with the string kept
/// for display.
#[derive(Debug, Snafu)]
pub enum RequestError {
	#[snafu(display("request timed out"))]
	Timeout,
	#[snafu(display("control link lost"))]
	TransportLost,
	#[snafu(display("{message}"))]
	Rejected { message: String },
}

#[derive(Debug, Snafu)]
pub(crate) enum SessionError {
	#[snafu(display("authentication rejected: {message}"))]
	AuthRejected { message: String },
	#[snafu(display("{message}"))]
	Link { message: String },
}

fn link_err(message: impl Into<String>) -> SessionError {
	SessionError::Link {
		message: message.into(),
	}
}

/// Server-initiated messages, delivered to the unified handler as a typed
/// event stream.
#[derive(Debug)]
pub enum TunnelEvent {
	NewConnection(NewConnection),
	ConnectionClose(ConnectionClose),
	ConnectionError(ConnectionError),
}

/// Outstanding requests keyed by message id. Dropping an entry's sender
/// wakes the waiter with a transport-lost error.
#[derive(Debug, Default)]
pub struct PendingMap {
	inner: Mutex<HashMap<Uuid, oneshot::Sender<Body>>>,
}

impl PendingMap {
	pub fn insert(&self, id: Uuid) -> oneshot::Receiver<Body> {
		let (tx, rx) = oneshot::channel();
		self.inner
			.lock()
			.expect("pending lock poisoned")
			.insert(id, tx);
		rx
	}

	pub fn complete(&self, id: &Uuid, body: Body) -> bool {
		match self
			.inner
			.lock()
			.expect("pending lock poisoned")
			.remove(id)
		{
			Some(tx) => tx.send(body).is_ok(),
			None => false,
		}
	}

	pub fn evict(&self, id: &Uuid) {
		self.inner
			.lock()
			.expect("pending lock poisoned")
			.remove(id);
	}

	/// Reject every outstanding request (transport loss).
	pub fn fail_all(&self) {
		self.inner.lock().expect("pending lock poisoned").clear();
	}

	pub fn len(&self) -> usize {
		self.inner.lock().expect("pending lock poisoned").len()
	}
}

/// Backoff before reconnect attempt `attempts` (0-based), without jitter.
pub fn backoff_base(base: Duration, attempts: u32) -> Duration {
	base.saturating_mul(2u32.saturating_pow(attempts.min(16)))
		.min(MAX_RECONNECT_DELAY)
}

fn backoff_delay(base: Duration, attempts: u32) -> Duration {
	backoff_base(base, attempts)
		+ Duration::from_millis(rand::rng().random_range(0..JITTER_MAX_MS))
}

/// Split a server url into (`host:port`, host-for-sni, tls).
pub(crate) fn parse_server_url(url: &str) -> Result<(String, String, bool), SessionError> {
	let (use_tls, rest) = match url.split_once("://") {
		Some(("tls", rest)) => (true, rest),
		Some(("tcp", rest)) => (false, rest),
		Some((scheme, _)) => {
			return Err(link_err(format!("unsupported scheme {scheme}://")));
		}
		None => (false, url),
	};
	let Some((host, port)) = rest.rsplit_once(':') else {
		return Err(link_err(format!("server url {url} is missing a port")));
	};
	if host.is_empty() || port.parse::<u16>().is_err() {
		return Err(link_err(format!("invalid server url {url}")));
	}
	Ok((rest.to_owned(), host.to_owned(), use_tls))
}

pub struct Controller {
	ctx: Arc<AppContext>,
	opts: ClientOpts,
	registry: Arc<ProxyRegistry>,
	pending: Arc<PendingMap>,
}

impl Controller {
	pub fn new(ctx: Arc<AppContext>, opts: ClientOpts, registry: Arc<ProxyRegistry>) -> Self {
		Self {
			ctx,
			opts,
			registry,
			pending: Arc::new(PendingMap::default()),
		}
	}

	/// Connect, serve, reconnect. Returns `Ok(())` on cancellation, an
	/// error when authentication is rejected or the reconnect attempts run
	/// out.
	pub async fn run(&self) -> eyre::Result<()> {
		let mut attempts: u32 = 0;
		loop {
			if self.ctx.token.is_cancelled() {
				return Ok(());
			}
			match self.run_session().await {
				Ok(()) => {
					// The session authenticated and later lost its
					// transport; the backoff schedule starts over.
					attempts = 0;
				}
				Err(SessionError::AuthRejected { message }) => {
					return Err(eyre!("authentication rejected: {message}"));
				}
				Err(err) => {
					info!(target: "[CTRL]", "connection attempt failed: {err}");
				}
			}
			if self.ctx.token.is_cancelled() {
				return Ok(());
			}
			if attempts >= self.opts.max_reconnect_attempts {
				return Err(eyre!(
					"giving up after {attempts} failed reconnect attempts"
				));
			}
			let delay = backoff_delay(self.opts.reconnect_interval, attempts);
			attempts += 1;
			info!(
				target: "[CTRL]",
				"reconnecting in {:.1}s (attempt {attempts}/{})",
				delay.as_secs_f64(),
				self.opts.max_reconnect_attempts
			);
			tokio::select! {
				_ = self.ctx.token.cancelled() => return Ok(()),
				_ = tokio::time::sleep(delay) => {}
			}
		}
	}

	/// One connection generation: dial, auth, bring up the data channel and
	/// handler, then hold until the link dies or the context is cancelled.
	async fn run_session(&self) -> Result<(), SessionError> {
		let (addr, sni, use_tls) = parse_server_url(&self.opts.server_url)?;
		info!(target: "[CTRL]", "connecting to {addr}");

		let tcp = TcpStream::connect(&addr)
			.await
			.map_err(|err| link_err(format!("connect {addr}: {err}")))?;
		let _ = tcp.set_nodelay(true);
		let stream: Box<dyn AbstractStream> = if use_tls {
			Box::new(
				tls::connect(tcp, &sni, self.opts.skip_cert_verify)
					.await
					.map_err(|err| link_err(format!("tls handshake with {sni}: {err}")))?,
			)
		} else {
			Box::new(tcp)
		};

		let cancel = self.ctx.token.child_token();
		let (mut sink, mut messages) = Framed::new(stream, ControlCodec).split();
		let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(OUT_QUEUE);
		let (events_tx, events_rx) = mpsc::channel::<TunnelEvent>(EVENT_QUEUE);

		// Writer: queued envelopes onto the socket.
		let writer_cancel = cancel.clone();
		self.ctx.tasks.spawn(async move {
			loop {
				tokio::select! {
					_ = writer_cancel.cancelled() => break,
					envelope = out_rx.recv() => {
						let Some(envelope) = envelope else { break };
						if sink.send(envelope).await.is_err() {
							writer_cancel.cancel();
							break;
						}
					}
				}
			}
		});

		// Reader: resolves pending requests, forwards events. Its exit is
		// the link-loss signal for the whole generation.
		let pending = self.pending.clone();
		let reader_cancel = cancel.clone();
		self.ctx.tasks.spawn(async move {
			loop {
				tokio::select! {
					_ = reader_cancel.cancelled() => break,
					message = messages.next() => {
						match message {
							Some(Ok(envelope)) => route_incoming(&pending, &events_tx, envelope).await,
							Some(Err(err)) => {
								warn!(target: "[CTRL]", "invalid control message: {err}");
								break;
							}
							None => break,
						}
					}
				}
			}
			reader_cancel.cancel();
		});

		let result = self
			.session_body(&addr, &sni, use_tls, cancel.clone(), out_tx, events_rx)
			.await;
		cancel.cancel();
		self.pending.fail_all();
		result
	}

	async fn session_body(
		&self,
		addr: &str,
		sni: &str,
		use_tls: bool,
		cancel: CancellationToken,
		out_tx: mpsc::Sender<Envelope>,
		events_rx: mpsc::Receiver<TunnelEvent>,
	) -> Result<(), SessionError> {
		// AUTHENTICATING.
		let response = self
			.request(
				&out_tx,
				Body::Auth(AuthPayload {
					token: self.opts.token.clone(),
				}),
			)
			.await
			.map_err(|err| match err {
				RequestError::Rejected { message } => SessionError::AuthRejected { message },
				other => link_err(format!("auth: {other}")),
			})?;
		let client_id = match response {
			Body::AuthResp(resp) if resp.success => resp
				.client_id
				.ok_or_else(|| link_err("auth response missing client id"))?,
			Body::AuthResp(resp) => {
				return Err(SessionError::AuthRejected {
					message: resp
						.error
						.unwrap_or_else(|| "authentication failed".to_string()),
				});
			}
			_ => return Err(link_err("unexpected auth response type")),
		};
		info!(target: "[CTRL]", "authenticated as {client_id}");

		// From here on the session counts as authenticated: any failure ends
		// this generation but resets the backoff schedule, so the error is
		// logged rather than propagated.
		if let Err(err) = self
			.establish(addr, sni, use_tls, &client_id, &cancel, &out_tx, events_rx)
			.await
		{
			warn!(target: "[CTRL]", "session setup failed: {err:#}");
			return Ok(());
		}

		info!(target: "[CTRL]", "tunnel established");
		cancel.cancelled().await;
		info!(target: "[CTRL]", "control link lost");
		Ok(())
	}

	/// Post-auth bring-up: data channel, UDP channel, handler, heartbeat,
	/// registration replay.
	#[allow(clippy::too_many_arguments)]
	async fn establish(
		&self,
		addr: &str,
		sni: &str,
		use_tls: bool,
		client_id: &str,
		cancel: &CancellationToken,
		out_tx: &mpsc::Sender<Envelope>,
		events_rx: mpsc::Receiver<TunnelEvent>,
	) -> eyre::Result<()> {
		// Both halves of the data channel; their loss cancels the
		// generation, which schedules a reconnect.
		let data = DataLink::connect(
			addr,
			sni,
			use_tls,
			self.opts.skip_cert_verify,
			client_id,
			cancel.clone(),
			&self.ctx,
		)
		.await?;
		let udp = UdpLink::start(addr, client_id, cancel.clone(), &self.ctx).await?;

		let handler = UnifiedHandler::new(
			self.registry.clone(),
			data,
			udp,
			out_tx.clone(),
			cancel.clone(),
			self.ctx.clone(),
		)?;
		self.ctx.tasks.spawn(handler.run(events_rx));

		// Heartbeat, fire-and-forget.
		let heartbeat_tx = out_tx.clone();
		let heartbeat_cancel = cancel.clone();
		let heartbeat_interval = self.opts.heartbeat_interval;
		self.ctx.tasks.spawn(async move {
			let mut interval = tokio::time::interval(heartbeat_interval);
			interval.tick().await;
			loop {
				tokio::select! {
					_ = heartbeat_cancel.cancelled() => break,
					_ = interval.tick() => {
						let beat = Envelope::request(Body::Heartbeat(HeartbeatPayload {
							timestamp: now_millis(),
						}));
						if heartbeat_tx.send(beat).await.is_err() {
							break;
						}
					}
				}
			}
		});

		// Replay every registration the registry remembers; rejections are
		// surfaced but do not take the session down.
		for (remote_port, target) in self.registry.all() {
			match self.register_proxy(out_tx, remote_port, &target).await {
				Ok(remote_url) => {
					info!(target: "[CTRL]", "registered {remote_url} -> {}", target.local_addr());
				}
				Err(RequestError::Rejected { message }) => {
					warn!(target: "[CTRL]", "registration of port {remote_port} rejected: {message}");
				}
				Err(err) => {
					return Err(eyre::eyre!("register port {remote_port}: {err}"));
				}
			}
		}
		Ok(())
	}

	/// Send a correlated request and await its response.
	pub(crate) async fn request(
		&self,
		out_tx: &mpsc::Sender<Envelope>,
		body: Body,
	) -> Result<Body, RequestError> {
		let envelope = Envelope::request(body);
		let id = envelope.id;
		let rx = self.pending.insert(id);
		if out_tx.send(envelope).await.is_err() {
			self.pending.evict(&id);
			return Err(RequestError::TransportLost);
		}
		match timeout(self.opts.request_timeout, rx).await {
			Ok(Ok(body)) => Ok(body),
			Ok(Err(_)) => Err(RequestError::TransportLost),
			Err(_) => {
				self.pending.evict(&id);
				Err(RequestError::Timeout)
			}
		}
	}

	async fn register_proxy(
		&self,
		out_tx: &mpsc::Sender<Envelope>,
		remote_port: u16,
		target: &ProxyTarget,
	) -> Result<String, RequestError> {
		let body = Body::Register(RegisterPayload {
			remote_port,
			local_port: target.local_port,
			local_host: Some(target.local_host.clone()),
			protocol: target.protocol,
		});
		match self.request(out_tx, body).await? {
			Body::RegisterResp(resp) if resp.success => {
				Ok(resp.remote_url.unwrap_or_else(|| remote_port.to_string()))
			}
			Body::RegisterResp(resp) => Err(RequestError::Rejected {
				message: resp
					.error
					.unwrap_or_else(|| "registration rejected".to_string()),
			}),
			_ => Err(RequestError::Rejected {
				message: "unexpected response type".to_string(),
			}),
		}
	}
}

async fn route_incoming(
	pending: &PendingMap,
	events: &mpsc::Sender<TunnelEvent>,
	envelope: Envelope,
) {
	match envelope.body {
		body @ (Body::AuthResp(_) | Body::RegisterResp(_)) => {
			if !pending.complete(&envelope.id, body) {
				debug!("response for unknown request {}", envelope.id);
			}
		}
		// Heartbeats carry no response-waiting semantics.
		Body::HeartbeatResp(_) => {}
		Body::NewConnection(payload) => {
			let _ = events.send(TunnelEvent::NewConnection(payload)).await;
		}
		Body::ConnectionClose(payload) => {
			let _ = events.send(TunnelEvent::ConnectionClose(payload)).await;
		}
		Body::ConnectionError(payload) => {
			let _ = events.send(TunnelEvent::ConnectionError(payload)).await;
		}
		other => {
			debug!("ignoring {} from server", other.kind());
		}
	}
}

fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}
