//! Client half of the binary data channel: dials the server's control
//! port, authenticates with the client id, then multiplexes logical
//! connections as frames.

use std::{collections::HashMap, sync::Arc};

use bytes::{Bytes, BytesMut};
use chuantou_core::{
	AbstractStream, AppContext, debug,
	frame::{Frame, FrameCodec, HANDSHAKE_ACCEPT, Handshake, HandshakeCodec},
	info, warn,
};
use eyre::bail;
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::{
	io::{AsyncReadExt as _, AsyncWriteExt as _},
	net::TcpStream,
	sync::{Mutex, mpsc},
};
use tokio_util::{
	codec::{Encoder as _, FramedRead, FramedWrite},
	sync::CancellationToken,
};

use crate::tls;

const OUT_QUEUE_FRAMES: usize = 256;
const CONN_QUEUE_FRAMES: usize = 64;
/// Bytes buffered for a connection whose `new_connection` announcement has
/// not been processed yet. The control link and the data channel are
/// separate sockets, so early frames are expected, not exceptional.
const PENDING_CAP_BYTES: usize = 256 * 1024;
const PENDING_CAP_CONNS: usize = 1024;

#[derive(Debug, Default)]
struct PendingBuffer {
	chunks: Vec<Bytes>,
	total: usize,
}

/// Routing table from connection id to the task consuming that
/// connection's bytes.
#[derive(Debug, Default)]
pub struct ConnTable {
	conns: Mutex<HashMap<String, mpsc::Sender<Bytes>>>,
	pending: Mutex<HashMap<String, PendingBuffer>>,
}

impl ConnTable {
	/// Claim a connection id, draining any frames that raced ahead of the
	/// announcement into the returned channel.
	pub async fn register(&self, conn_id: &str) -> mpsc::Receiver<Bytes> {
		let buffered = self.pending.lock().await.remove(conn_id);
		let backlog = buffered.as_ref().map_or(0, |b| b.chunks.len());
		let (tx, rx) = mpsc::channel(CONN_QUEUE_FRAMES.max(backlog + 1));
		if let Some(buffer) = buffered {
			for chunk in buffer.chunks {
				// Capacity covers the backlog, so this cannot block.
				let _ = tx.try_send(chunk);
			}
		}
		self.conns.lock().await.insert(conn_id.to_owned(), tx);
		rx
	}

	/// Deliver a frame payload. Blocks while the connection's queue is
	/// full, which backpressures the whole data channel reader by design.
	pub async fn deliver(&self, conn_id: &str, payload: Bytes) {
		let tx = self.conns.lock().await.get(conn_id).cloned();
		match tx {
			Some(tx) => {
				if tx.send(payload).await.is_err() {
					debug!("dropping frame for closing connection {conn_id}");
				}
			}
			None => {
				let mut pending = self.pending.lock().await;
				if pending.len() >= PENDING_CAP_CONNS {
					warn!(target: "[DATA]", "pending buffer full, dropping frame for {conn_id}");
					return;
				}
				let buffer = pending.entry(conn_id.to_owned()).or_default();
				if buffer.total + payload.len() > PENDING_CAP_BYTES {
					warn!(target: "[DATA]", "pending bytes for {conn_id} over cap, dropping frame");
					return;
				}
				buffer.total += payload.len();
				buffer.chunks.push(payload);
			}
		}
	}

	/// Forget a connection. Dropping the sender ends the consumer's
	/// receive loop.
	pub async fn remove(&self, conn_id: &str) {
		self.conns.lock().await.remove(conn_id);
		self.pending.lock().await.remove(conn_id);
	}
}

pub struct DataLink {
	tx: mpsc::Sender<Frame>,
	pub table: Arc<ConnTable>,
}

impl DataLink {
	/// Dial the server's data channel and authenticate with the client id.
	/// The spawned reader/writer cancel `cancel` when the channel dies,
	/// taking the whole connection generation with them.
	pub async fn connect(
		addr: &str,
		sni: &str,
		use_tls: bool,
		skip_cert_verify: bool,
		client_id: &str,
		cancel: CancellationToken,
		ctx: &Arc<AppContext>,
	) -> eyre::Result<Arc<Self>> {
		let tcp = TcpStream::connect(addr).await?;
		let _ = tcp.set_nodelay(true);
		let mut stream: Box<dyn AbstractStream> = if use_tls {
			Box::new(tls::connect(tcp, sni, skip_cert_verify).await?)
		} else {
			Box::new(tcp)
		};

		let mut handshake = BytesMut::new();
		HandshakeCodec.encode(
			Handshake {
				client_id: client_id.to_owned(),
			},
			&mut handshake,
		)?;
		stream.write_all(&handshake).await?;
		let status = stream.read_u8().await?;
		if status != HANDSHAKE_ACCEPT {
			bail!("server rejected the data channel handshake");
		}
		info!(target: "[DATA]", "data channel established");

		let table = Arc::new(ConnTable::default());
		let (tx, mut rx) = mpsc::channel::<Frame>(OUT_QUEUE_FRAMES);

		let (read_half, write_half) = tokio::io::split(stream);
		let mut frames_in = FramedRead::new(read_half, FrameCodec);
		let mut frames_out = FramedWrite::new(write_half, FrameCodec);

		let writer_cancel = cancel.clone();
		ctx.tasks.spawn(async move {
			loop {
				tokio::select! {
					_ = writer_cancel.cancelled() => break,
					frame = rx.recv() => {
						let Some(frame) = frame else { break };
						if frames_out.send(frame).await.is_err() {
							writer_cancel.cancel();
							break;
						}
					}
				}
			}
		});

		let reader_table = table.clone();
		let reader_cancel = cancel;
		ctx.tasks.spawn(async move {
			loop {
				tokio::select! {
					_ = reader_cancel.cancelled() => break,
					item = frames_in.next() => {
						match item {
							Some(Ok(frame)) => {
								reader_table.deliver(&frame.conn_id, frame.payload).await;
							}
							Some(Err(err)) => {
								warn!(target: "[DATA]", "bad frame from server: {err}");
								break;
							}
							None => break,
						}
					}
				}
			}
			// Data-channel loss tears the generation down.
			reader_cancel.cancel();
		});

		Ok(Arc::new(Self { tx, table }))
	}

	/// Queue a frame for the server. Blocks while the outgoing queue is
	/// full, pausing the caller's local read loop.
	pub async fn send(&self, frame: Frame) -> eyre::Result<()> {
		if self.tx.send(frame).await.is_err() {
			bail!("data channel closed");
		}
		Ok(())
	}
}
