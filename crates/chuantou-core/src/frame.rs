//! Binary data-channel framing.
//!
//! The data channel is a raw byte stream separate from the JSON control
//! link. A stream starts with a single handshake frame:
//!
//! ```text
//! magic "CTDC" | clientIdLen u8 | clientId utf-8
//! ```
//!
//! answered by one status byte, then carries data frames:
//!
//! ```text
//! connIdLen u8 | connId utf-8 | payloadLen u32 BE | payload
//! ```
//!
//! The UDP half of the channel packs one frame per datagram, with a
//! leading kind byte.

use std::str;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use snafu::{ResultExt as _, ensure};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
	FrameTooLargeSnafu, IdTooLongSnafu, InvalidUtf8Snafu, MagicMismatchSnafu, ProtoError,
	TruncatedDatagramSnafu, UnknownDatagramKindSnafu,
};

pub const DATA_MAGIC: &[u8; 4] = b"CTDC";

/// Status byte sent by the server after the handshake frame.
pub const HANDSHAKE_ACCEPT: u8 = 0x00;
pub const HANDSHAKE_REJECT: u8 = 0x01;

/// Hard ceiling for a single frame payload. Forwarders read in chunks far
/// below this, so anything larger is a corrupt or hostile stream.
pub const MAX_FRAME_PAYLOAD: usize = 4 * 1024 * 1024;

const KIND_REGISTER: u8 = 0x01;
const KIND_KEEPALIVE: u8 = 0x02;
const KIND_DATA: u8 = 0x03;

fn put_id(id: &str, dst: &mut BytesMut) -> Result<(), ProtoError> {
	ensure!(id.len() <= u8::MAX as usize, IdTooLongSnafu { len: id.len() });
	dst.put_u8(id.len() as u8);
	dst.put_slice(id.as_bytes());
	Ok(())
}

/// One-time stream preamble naming the client the channel belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
	pub client_id: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
	type Error = ProtoError;
	type Item = Handshake;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < DATA_MAGIC.len() + 1 {
			return Ok(None);
		}
		ensure!(&src[..DATA_MAGIC.len()] == DATA_MAGIC, MagicMismatchSnafu);
		let id_len = src[DATA_MAGIC.len()] as usize;
		if src.len() < DATA_MAGIC.len() + 1 + id_len {
			return Ok(None);
		}
		src.advance(DATA_MAGIC.len() + 1);
		let id = src.split_to(id_len);
		let client_id = str::from_utf8(&id).context(InvalidUtf8Snafu)?.to_owned();
		Ok(Some(Handshake { client_id }))
	}
}

impl Encoder<Handshake> for HandshakeCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
		dst.reserve(DATA_MAGIC.len() + 1 + item.client_id.len());
		dst.put_slice(DATA_MAGIC);
		put_id(&item.client_id, dst)
	}
}

/// One `(connId, payload)` tuple on the TCP data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub conn_id: String,
	pub payload: Bytes,
}

/// Streaming frame parser/serializer.
///
/// The decoder either emits a complete frame or consumes nothing, so it is
/// insensitive to how the transport chunks the stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
	type Error = ProtoError;
	type Item = Frame;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.is_empty() {
			return Ok(None);
		}
		let id_len = src[0] as usize;
		let head = 1 + id_len + 4;
		if src.len() < head {
			return Ok(None);
		}
		let payload_len = u32::from_be_bytes([
			src[1 + id_len],
			src[1 + id_len + 1],
			src[1 + id_len + 2],
			src[1 + id_len + 3],
		]) as usize;
		ensure!(
			payload_len <= MAX_FRAME_PAYLOAD,
			FrameTooLargeSnafu {
				len: payload_len,
				max: MAX_FRAME_PAYLOAD
			}
		);
		if src.len() < head + payload_len {
			// Reserve for the remainder so the next read can complete the frame.
			src.reserve(head + payload_len - src.len());
			return Ok(None);
		}
		src.advance(1);
		let id = src.split_to(id_len);
		let conn_id = str::from_utf8(&id).context(InvalidUtf8Snafu)?.to_owned();
		src.advance(4);
		let payload = src.split_to(payload_len).freeze();
		Ok(Some(Frame { conn_id, payload }))
	}
}

impl Encoder<Frame> for FrameCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
		ensure!(
			item.payload.len() <= MAX_FRAME_PAYLOAD,
			FrameTooLargeSnafu {
				len: item.payload.len(),
				max: MAX_FRAME_PAYLOAD
			}
		);
		dst.reserve(1 + item.conn_id.len() + 4 + item.payload.len());
		put_id(&item.conn_id, dst)?;
		dst.put_u32(item.payload.len() as u32);
		dst.put_slice(&item.payload);
		Ok(())
	}
}

/// One datagram on the UDP half of the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
	/// Associates the sender's UDP source address with its client id.
	Register { client_id: String },
	/// Refreshes the cached source address (NAT rebinding tolerance).
	Keepalive { client_id: String },
	/// Payload for one UDP logical connection.
	Data { conn_id: String, payload: Bytes },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DatagramCodec;

impl DatagramCodec {
	/// Decode a whole datagram. UDP delivers complete packets, so unlike the
	/// stream codecs a short buffer is an error rather than a partial read.
	pub fn decode(buf: &mut BytesMut) -> Result<Datagram, ProtoError> {
		ensure!(buf.len() >= 2, TruncatedDatagramSnafu);
		let kind = buf.get_u8();
		let id_len = buf.get_u8() as usize;
		ensure!(buf.len() >= id_len, TruncatedDatagramSnafu);
		let id = buf.split_to(id_len);
		let id = str::from_utf8(&id).context(InvalidUtf8Snafu)?.to_owned();
		match kind {
			KIND_REGISTER => Ok(Datagram::Register { client_id: id }),
			KIND_KEEPALIVE => Ok(Datagram::Keepalive { client_id: id }),
			KIND_DATA => Ok(Datagram::Data {
				conn_id: id,
				payload: buf.split_to(buf.len()).freeze(),
			}),
			kind => UnknownDatagramKindSnafu { kind }.fail(),
		}
	}

	pub fn encode(item: &Datagram, dst: &mut BytesMut) -> Result<(), ProtoError> {
		match item {
			Datagram::Register { client_id } => {
				dst.reserve(2 + client_id.len());
				dst.put_u8(KIND_REGISTER);
				put_id(client_id, dst)
			}
			Datagram::Keepalive { client_id } => {
				dst.reserve(2 + client_id.len());
				dst.put_u8(KIND_KEEPALIVE);
				put_id(client_id, dst)
			}
			Datagram::Data { conn_id, payload } => {
				dst.reserve(2 + conn_id.len() + payload.len());
				dst.put_u8(KIND_DATA);
				put_id(conn_id, dst)?;
				dst.put_slice(payload);
				Ok(())
			}
		}
	}
}
