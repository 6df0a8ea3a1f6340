//! Raw byte pipe between the data channel and a locally dialed TCP socket.
//! Used for `tcp` and `websocket` connections alike; the handler has no
//! protocol awareness here.

use bytes::Bytes;
use chuantou_core::{
	control::{Body, ConnectionClose, Envelope},
	debug,
	frame::Frame,
	warn,
};
use std::sync::Arc;
use tokio::{
	io::{AsyncReadExt as _, AsyncWriteExt as _},
	net::TcpStream,
	sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{data::DataLink, registry::ProxyTarget};

const READ_BUFFER: usize = 16 * 1024;

pub(crate) struct PipeJob {
	pub data: Arc<DataLink>,
	pub out_tx: mpsc::Sender<Envelope>,
	pub conn_id: String,
	pub target: ProxyTarget,
	pub cancel: CancellationToken,
}

pub(crate) async fn run_pipe(job: PipeJob) {
	// Claim the connection id before dialing so frames that raced ahead of
	// the announcement are buffered, not lost.
	let mut remote_rx = job.data.table.register(&job.conn_id).await;

	let local = match TcpStream::connect(job.target.local_addr()).await {
		Ok(stream) => stream,
		Err(err) => {
			warn!(
				target: "[PIPE]",
				"local dial {} for {} failed: {err}",
				job.target.local_addr(),
				job.conn_id
			);
			finish(&job).await;
			return;
		}
	};
	let _ = local.set_nodelay(true);

	let (mut read_half, mut write_half) = local.into_split();
	let mut buf = vec![0u8; READ_BUFFER];
	loop {
		tokio::select! {
			_ = job.cancel.cancelled() => break,
			read = read_half.read(&mut buf) => {
				match read {
					Ok(0) => break,
					Ok(n) => {
						let frame = Frame {
							conn_id: job.conn_id.clone(),
							payload: Bytes::copy_from_slice(&buf[..n]),
						};
						// Blocks while the data channel queue is full,
						// pausing this local read.
						if job.data.send(frame).await.is_err() {
							break;
						}
					}
					Err(err) => {
						debug!("local read for {} failed: {err}", job.conn_id);
						break;
					}
				}
			}
			chunk = remote_rx.recv() => {
				match chunk {
					Some(bytes) => {
						if write_half.write_all(&bytes).await.is_err() {
							break;
						}
					}
					None => {
						// Remote side closed; flush and shut the local
						// socket down.
						let _ = write_half.shutdown().await;
						break;
					}
				}
			}
		}
	}

	finish(&job).await;
}

async fn finish(job: &PipeJob) {
	job.data.table.remove(&job.conn_id).await;
	let _ = job
		.out_tx
		.send(Envelope::request(Body::ConnectionClose(ConnectionClose {
			connection_id: job.conn_id.clone(),
		})))
		.await;
}
