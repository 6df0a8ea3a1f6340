use std::str::Utf8Error;

use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtoError {
	#[snafu(display("Data channel magic mismatch"))]
	MagicMismatch,
	#[snafu(display("Identifier of {len} bytes exceeds the 255-byte wire limit"))]
	IdTooLong { len: usize },
	#[snafu(display("Frame payload of {len} bytes exceeds the {max}-byte limit"))]
	FrameTooLarge { len: usize, max: usize },
	#[snafu(display("Control message exceeds the {max}-byte limit"))]
	ControlMessageTooLarge { max: usize },
	#[snafu(display("Invalid control message JSON: {source}"))]
	InvalidJson { source: serde_json::Error },
	#[snafu(display("Identifier is not valid UTF-8"))]
	InvalidUtf8 { source: Utf8Error },
	#[snafu(display("Unknown datagram kind {kind:#04x}"))]
	UnknownDatagramKind { kind: u8 },
	#[snafu(display("Datagram truncated"))]
	TruncatedDatagram,
	Io { source: std::io::Error },
}

impl From<std::io::Error> for ProtoError {
	fn from(source: std::io::Error) -> Self {
		use snafu::IntoError as _;
		IoSnafu.into_error(source)
	}
}
