//! Server half of the binary data channel.
//!
//! One physical stream per authenticated client carries every logical
//! connection's bytes as `(connId, payload)` frames. A second channel for
//! the same client replaces the first (last-writer-wins).

use std::{
	collections::HashMap,
	net::SocketAddr,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
};

use bytes::BytesMut;
use chuantou_core::{
	AbstractStream,
	control::{Body, ConnectionClose, Envelope},
	debug,
	frame::{Frame, FrameCodec, HANDSHAKE_ACCEPT, HANDSHAKE_REJECT, Handshake, HandshakeCodec},
	info, warn,
};
use eyre::bail;
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::{
	io::{AsyncReadExt as _, AsyncWriteExt as _},
	sync::{RwLock, mpsc},
	time::timeout,
};
use tokio_util::codec::{Decoder as _, FramedRead, FramedWrite};

use crate::{DATA_QUEUE_FRAMES, STALL_GRACE, ServerShared};

struct ChannelHandle {
	tx: mpsc::Sender<Frame>,
	epoch: u64,
}

#[derive(Default)]
pub(crate) struct DataChannelManager {
	channels: RwLock<HashMap<String, ChannelHandle>>,
	epochs: AtomicU64,
}

impl DataChannelManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Queue a frame for a client. Blocks when the channel's queue is full,
	/// which is what pauses upstream readers.
	pub async fn send(&self, client_id: &str, frame: Frame) -> eyre::Result<()> {
		let tx = {
			let channels = self.channels.read().await;
			match channels.get(client_id) {
				Some(handle) => handle.tx.clone(),
				None => bail!("no data channel for client {client_id}"),
			}
		};
		if tx.send(frame).await.is_err() {
			bail!("data channel for client {client_id} closed");
		}
		Ok(())
	}

	async fn replace(&self, client_id: &str, tx: mpsc::Sender<Frame>) -> u64 {
		let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
		let previous = self
			.channels
			.write()
			.await
			.insert(client_id.to_owned(), ChannelHandle { tx, epoch });
		if previous.is_some() {
			info!(target: "[DATA]", "replacing existing data channel for {client_id}");
		}
		epoch
	}

	/// Remove the entry only if it still belongs to this channel incarnation.
	async fn remove_if(&self, client_id: &str, epoch: u64) -> bool {
		let mut channels = self.channels.write().await;
		match channels.get(client_id) {
			Some(handle) if handle.epoch == epoch => {
				channels.remove(client_id);
				true
			}
			_ => false,
		}
	}

	pub async fn remove(&self, client_id: &str) {
		self.channels.write().await.remove(client_id);
	}
}

/// Serve one accepted data-channel stream: authenticate the handshake,
/// answer the status byte, then shuttle frames both ways until the stream
/// or the session dies.
pub(crate) async fn handle_data_channel<S: AbstractStream + 'static>(
	shared: Arc<ServerShared>,
	mut stream: S,
	mut buf: BytesMut,
	peer: SocketAddr,
) -> eyre::Result<()> {
	let handshake = timeout(shared.opts.auth_timeout, async {
		loop {
			if let Some(handshake) = HandshakeCodec.decode(&mut buf)? {
				return eyre::Ok(handshake);
			}
			if stream.read_buf(&mut buf).await? == 0 {
				bail!("stream closed during data-channel handshake");
			}
		}
	})
	.await
	.map_err(|_| eyre::eyre!("data-channel handshake timed out"))??;

	let Handshake { client_id } = handshake;
	let Some(cancel) = shared.sessions.session_token(&client_id).await else {
		warn!(target: "[DATA]", "handshake from {peer} for unknown client {client_id}");
		let _ = stream.write_all(&[HANDSHAKE_REJECT]).await;
		return Ok(());
	};
	if !shared.sessions.is_authenticated(&client_id).await {
		warn!(target: "[DATA]", "handshake from {peer} for unauthenticated client {client_id}");
		let _ = stream.write_all(&[HANDSHAKE_REJECT]).await;
		return Ok(());
	}
	stream.write_all(&[HANDSHAKE_ACCEPT]).await?;
	info!(target: "[DATA]", "data channel up for {client_id} from {peer}");

	let (tx, mut rx) = mpsc::channel::<Frame>(DATA_QUEUE_FRAMES);
	let epoch = shared.data.replace(&client_id, tx).await;

	let (read_half, write_half) = tokio::io::split(stream);
	let mut frames_in = FramedRead::new(read_half, FrameCodec);
	*frames_in.read_buffer_mut() = buf;
	let mut frames_out = FramedWrite::new(write_half, FrameCodec);

	// Writer: drains the queue onto the socket. A write blocked past the
	// grace period means the client has stopped draining; the whole client
	// is then considered stalled and disconnected.
	let writer_shared = shared.clone();
	let writer_client = client_id.clone();
	let writer_cancel = cancel.clone();
	shared.ctx.tasks.spawn(async move {
		loop {
			tokio::select! {
				_ = writer_cancel.cancelled() => break,
				frame = rx.recv() => {
					let Some(frame) = frame else { break };
					match timeout(STALL_GRACE, frames_out.send(frame)).await {
						Ok(Ok(())) => {}
						Ok(Err(err)) => {
							debug!("data channel write for {writer_client} failed: {err}");
							break;
						}
						Err(_) => {
							warn!(target: "[DATA]", "client {writer_client} stalled, disconnecting");
							writer_shared.drop_session(&writer_client, "data channel stalled").await;
							break;
						}
					}
				}
			}
		}
	});

	// Reader: routes inbound frames to the owning connection's user-side
	// queue. A queue blocked past the grace period drops that connection
	// only, not the client.
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			item = frames_in.next() => {
				match item {
					Some(Ok(frame)) => route_frame(&shared, &client_id, frame).await,
					Some(Err(err)) => {
						warn!(target: "[DATA]", "bad frame from {client_id}: {err}");
						break;
					}
					None => break,
				}
			}
		}
	}

	if shared.data.remove_if(&client_id, epoch).await {
		// Losing the data channel orphans every logical connection that
		// was multiplexed over it.
		shared.close_client_connections(&client_id).await;
		info!(target: "[DATA]", "data channel down for {client_id}");
	}
	Ok(())
}

async fn route_frame(shared: &Arc<ServerShared>, client_id: &str, frame: Frame) {
	let Some(info) = shared.sessions.connection(&frame.conn_id).await else {
		debug!("frame for unknown connection {}", frame.conn_id);
		return;
	};
	if info.client_id != client_id {
		warn!(target: "[DATA]", "client {client_id} sent frame for foreign connection {}", frame.conn_id);
		return;
	}
	let Some(user_tx) = info.user_tx else {
		debug!("frame for non-stream connection {}", frame.conn_id);
		return;
	};
	match timeout(STALL_GRACE, user_tx.send(frame.payload)).await {
		Ok(Ok(())) => {}
		Ok(Err(_)) => {
			// Forwarder already gone; the connection is being torn down.
		}
		Err(_) => {
			warn!(target: "[DATA]", "user side of {} stalled, dropping connection", frame.conn_id);
			if shared.sessions.remove_connection(&frame.conn_id).await.is_some()
				&& let Some(tx) = shared.sessions.control_tx(client_id).await
			{
				let _ = tx
					.send(Envelope::request(Body::ConnectionClose(ConnectionClose {
						connection_id: frame.conn_id,
					})))
					.await;
			}
		}
	}
}
