use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder as _, Encoder as _};
use uuid::Uuid;

use crate::{
	ProtoError,
	control::{AuthPayload, Body, ControlCodec, Envelope},
	frame::{Datagram, DatagramCodec, Frame, FrameCodec, Handshake, HandshakeCodec},
};

#[test]
fn control_wire_shape() -> eyre::Result<()> {
	let envelope = Envelope::response_to(
		Uuid::nil(),
		Body::Auth(AuthPayload {
			token: "secret".into(),
		}),
	);
	let mut buf = BytesMut::new();
	ControlCodec.encode(envelope, &mut buf)?;
	assert_eq!(
		"{\"id\":\"00000000-0000-0000-0000-000000000000\",\"type\":\"auth\",\"payload\":{\"token\":\"secret\"}}\n",
		std::str::from_utf8(&buf)?
	);
	Ok(())
}

#[test]
fn control_roundtrip_and_partial_lines() -> eyre::Result<()> {
	let envelope = Envelope::request(Body::Auth(AuthPayload {
		token: "secret".into(),
	}));
	let mut buf = BytesMut::new();
	ControlCodec.encode(envelope.clone(), &mut buf)?;

	// Feed everything except the newline: the decoder must hold.
	let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
	assert!(ControlCodec.decode(&mut partial)?.is_none());
	partial.extend_from_slice(b"\n");
	let decoded = ControlCodec.decode(&mut partial)?.unwrap();
	assert_eq!(decoded.id, envelope.id);
	assert!(matches!(decoded.body, Body::Auth(p) if p.token == "secret"));
	assert!(partial.is_empty());
	Ok(())
}

#[test]
fn control_rejects_garbage() {
	let mut buf = BytesMut::from(&b"not json\n"[..]);
	assert!(matches!(
		ControlCodec.decode(&mut buf),
		Err(ProtoError::InvalidJson { .. })
	));
}

/// Message types from newer peers decode to `Unknown` instead of erroring,
/// so receivers can log and move on.
#[test]
fn control_tolerates_unknown_types() -> eyre::Result<()> {
	let mut buf = BytesMut::from(
		&b"{\"id\":\"00000000-0000-0000-0000-000000000000\",\"type\":\"shiny_new_feature\",\"payload\":{\"x\":1}}\n"[..],
	);
	let decoded = ControlCodec.decode(&mut buf)?.unwrap();
	assert!(matches!(decoded.body, Body::Unknown { kind } if kind == "shiny_new_feature"));
	Ok(())
}

#[test]
fn handshake_roundtrip() -> eyre::Result<()> {
	let hs = Handshake {
		client_id: Uuid::nil().to_string(),
	};
	let mut buf = BytesMut::new();
	HandshakeCodec.encode(hs.clone(), &mut buf)?;
	assert_eq!(&buf[..4], b"CTDC");
	assert_eq!(buf[4] as usize, hs.client_id.len());

	let decoded = HandshakeCodec.decode(&mut buf)?.unwrap();
	assert_eq!(decoded, hs);
	assert!(buf.is_empty());
	Ok(())
}

#[test]
fn handshake_bad_magic() {
	let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
	assert!(matches!(
		HandshakeCodec.decode(&mut buf),
		Err(ProtoError::MagicMismatch)
	));
}

#[test]
fn frame_roundtrip() -> eyre::Result<()> {
	let frame = Frame {
		conn_id: "conn-1".into(),
		payload: Bytes::from_static(b"hello"),
	};
	let mut buf = BytesMut::new();
	FrameCodec.encode(frame.clone(), &mut buf)?;
	// connIdLen | connId | payloadLen BE | payload
	assert_eq!(buf[0] as usize, 6);
	assert_eq!(&buf[7..11], &5u32.to_be_bytes());

	let decoded = FrameCodec.decode(&mut buf)?.unwrap();
	assert_eq!(decoded, frame);
	assert!(buf.is_empty());
	Ok(())
}

/// Feeding the stream one byte at a time must produce the same frames as
/// feeding it in a single chunk.
#[test]
fn frame_parser_chunk_boundary_invariant() -> eyre::Result<()> {
	let frames = vec![
		Frame {
			conn_id: Uuid::nil().to_string(),
			payload: Bytes::from(vec![0xAB; 300]),
		},
		Frame {
			conn_id: "b".into(),
			payload: Bytes::new(),
		},
		Frame {
			conn_id: "conn-long".into(),
			payload: Bytes::from_static(b"tail"),
		},
	];
	let mut wire = BytesMut::new();
	for frame in &frames {
		FrameCodec.encode(frame.clone(), &mut wire)?;
	}

	// One chunk.
	let mut whole = BytesMut::from(&wire[..]);
	let mut got_whole = Vec::new();
	while let Some(frame) = FrameCodec.decode(&mut whole)? {
		got_whole.push(frame);
	}

	// One byte at a time.
	let mut trickle = BytesMut::new();
	let mut got_trickle = Vec::new();
	for byte in wire.iter() {
		trickle.extend_from_slice(&[*byte]);
		while let Some(frame) = FrameCodec.decode(&mut trickle)? {
			got_trickle.push(frame);
		}
	}

	assert_eq!(got_whole, frames);
	assert_eq!(got_trickle, frames);
	assert!(trickle.is_empty());
	Ok(())
}

#[test]
fn frame_rejects_oversized_payload() -> eyre::Result<()> {
	let mut buf = BytesMut::new();
	FrameCodec.encode(
		Frame {
			conn_id: "a".into(),
			payload: Bytes::from_static(b"x"),
		},
		&mut buf,
	)?;
	// Rewrite the length field to something absurd.
	let len_at = 1 + 1;
	buf[len_at..len_at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
	assert!(matches!(
		FrameCodec.decode(&mut buf),
		Err(ProtoError::FrameTooLarge { .. })
	));
	Ok(())
}

#[test]
fn datagram_roundtrip() -> eyre::Result<()> {
	let cases = vec![
		Datagram::Register {
			client_id: "client".into(),
		},
		Datagram::Keepalive {
			client_id: "client".into(),
		},
		Datagram::Data {
			conn_id: "conn".into(),
			payload: Bytes::from_static(b"datagram payload"),
		},
	];
	for case in cases {
		let mut buf = BytesMut::new();
		DatagramCodec::encode(&case, &mut buf)?;
		let decoded = DatagramCodec::decode(&mut buf)?;
		assert_eq!(decoded, case);
	}
	Ok(())
}

#[test]
fn datagram_unknown_kind() {
	let mut buf = BytesMut::from(&[0x7Fu8, 0x00][..]);
	assert!(matches!(
		DatagramCodec::decode(&mut buf),
		Err(ProtoError::UnknownDatagramKind { kind: 0x7F })
	));
}
