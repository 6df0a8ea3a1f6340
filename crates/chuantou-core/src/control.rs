//! Control-link message model and codec.
//!
//! Control messages are UTF-8 JSON objects of the shape
//! `{ "type": ..., "id": ..., "payload": ... }`, one object per line.
//! Requests carry a fresh message id; responses echo the id of the request
//! they answer.

use bytes::{BufMut as _, BytesMut};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, ensure};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::{
	ControlMessageTooLargeSnafu, InvalidJsonSnafu, ProtoError, types::Protocol,
};

/// Upper bound for a single control message on the wire. HTTP bodies ride
/// base64-encoded inside `new_connection`/`http_response`, so the limit is
/// deliberately generous.
pub const MAX_CONTROL_MESSAGE: usize = 4 * 1024 * 1024;

/// Header list used on the control link. A list of pairs rather than a map
/// so duplicate names (`Set-Cookie`) survive the round trip.
pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone)]
pub struct Envelope {
	pub id: Uuid,
	pub body: Body,
}

// `Envelope` is `Body`'s tagged object with the message id spliced in at
// the top level. Hand-written so the wire shape stays exactly
// `{ "id": ..., "type": ..., "payload": ... }`.
impl Serialize for Envelope {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		use serde::ser::{Error as _, SerializeMap as _};

		let body = serde_json::to_value(&self.body).map_err(S::Error::custom)?;
		let serde_json::Value::Object(body) = body else {
			return Err(S::Error::custom("control body must serialize to an object"));
		};
		let kind = body
			.get("type")
			.ok_or_else(|| S::Error::custom("control body missing type"))?;
		let payload = body
			.get("payload")
			.ok_or_else(|| S::Error::custom("control body missing payload"))?;
		let mut map = serializer.serialize_map(Some(3))?;
		map.serialize_entry("id", &self.id)?;
		map.serialize_entry("type", kind)?;
		map.serialize_entry("payload", payload)?;
		map.end()
	}
}

impl<'de> Deserialize<'de> for Envelope {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		use serde::de::Error as _;

		let mut object = serde_json::Map::deserialize(deserializer)?;
		let id = object
			.remove("id")
			.ok_or_else(|| D::Error::missing_field("id"))?;
		let id: Uuid = serde_json::from_value(id).map_err(D::Error::custom)?;
		let kind = object
			.get("type")
			.and_then(serde_json::Value::as_str)
			.ok_or_else(|| D::Error::missing_field("type"))?;
		// A type this build does not know is not a protocol error; peers
		// running newer versions may send extensions.
		if !KNOWN_TYPES.contains(&kind) {
			return Ok(Envelope {
				id,
				body: Body::Unknown {
					kind: kind.to_owned(),
				},
			});
		}
		let body: Body = serde_json::from_value(serde_json::Value::Object(object))
			.map_err(D::Error::custom)?;
		Ok(Envelope { id, body })
	}
}

const KNOWN_TYPES: &[&str] = &[
	"auth",
	"auth_resp",
	"register",
	"register_resp",
	"unregister",
	"heartbeat",
	"heartbeat_resp",
	"new_connection",
	"connection_close",
	"connection_error",
	"http_response",
	"http_response_headers",
	"http_response_data",
	"http_response_end",
];

impl Envelope {
	/// Wrap a body with a fresh message id.
	pub fn request(body: Body) -> Self {
		Self {
			id: Uuid::new_v4(),
			body,
		}
	}

	/// Wrap a body echoing the id of the request it answers.
	pub fn response_to(id: Uuid, body: Body) -> Self {
		Self { id, body }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Body {
	Auth(AuthPayload),
	AuthResp(AuthResp),
	Register(RegisterPayload),
	RegisterResp(RegisterResp),
	Unregister(UnregisterPayload),
	Heartbeat(HeartbeatPayload),
	HeartbeatResp(HeartbeatPayload),
	NewConnection(NewConnection),
	ConnectionClose(ConnectionClose),
	ConnectionError(ConnectionError),
	HttpResponse(HttpResponse),
	HttpResponseHeaders(HttpResponseHeaders),
	HttpResponseData(HttpResponseData),
	HttpResponseEnd(HttpResponseEnd),
	/// A message type this build does not know. Never sent; produced by the
	/// decoder so receivers can log and ignore protocol extensions.
	#[serde(skip)]
	Unknown { kind: String },
}

impl Body {
	/// Wire name of the message type, for logging.
	pub fn kind(&self) -> &'static str {
		match self {
			Body::Auth(_) => "auth",
			Body::AuthResp(_) => "auth_resp",
			Body::Register(_) => "register",
			Body::RegisterResp(_) => "register_resp",
			Body::Unregister(_) => "unregister",
			Body::Heartbeat(_) => "heartbeat",
			Body::HeartbeatResp(_) => "heartbeat_resp",
			Body::NewConnection(_) => "new_connection",
			Body::ConnectionClose(_) => "connection_close",
			Body::ConnectionError(_) => "connection_error",
			Body::HttpResponse(_) => "http_response",
			Body::HttpResponseHeaders(_) => "http_response_headers",
			Body::HttpResponseData(_) => "http_response_data",
			Body::HttpResponseEnd(_) => "http_response_end",
			Body::Unknown { .. } => "unknown",
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
	pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResp {
	pub success: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
	pub remote_port: u16,
	pub local_port: u16,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub local_host: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub protocol: Option<Protocol>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResp {
	pub success: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remote_port: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remote_url: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterPayload {
	pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
	/// Sender clock, milliseconds since the Unix epoch.
	pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConnection {
	pub connection_id: String,
	pub protocol: Protocol,
	pub remote_port: u16,
	pub remote_address: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub method: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub headers: Option<Headers>,
	/// Base64 request body, present only when the whole request fit the peek.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub body: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ws_headers: Option<Headers>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionClose {
	pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionError {
	pub connection_id: String,
	pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
	pub connection_id: String,
	pub status_code: u16,
	pub headers: Headers,
	/// Base64 response body.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseHeaders {
	pub connection_id: String,
	pub status_code: u16,
	pub headers: Headers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseData {
	pub connection_id: String,
	/// Base64 chunk.
	pub chunk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseEnd {
	pub connection_id: String,
}

/// Newline-delimited JSON codec for the control link.
///
/// `serde_json` never emits a raw newline inside a serialized object, so a
/// single `\n` is an unambiguous message boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
	type Error = ProtoError;
	type Item = Envelope;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		loop {
			let Some(pos) = src.iter().position(|b| *b == b'\n') else {
				ensure!(
					src.len() <= MAX_CONTROL_MESSAGE,
					ControlMessageTooLargeSnafu {
						max: MAX_CONTROL_MESSAGE
					}
				);
				return Ok(None);
			};
			let line = src.split_to(pos + 1);
			let mut line = &line[..line.len() - 1];
			if line.last() == Some(&b'\r') {
				line = &line[..line.len() - 1];
			}
			if line.iter().all(u8::is_ascii_whitespace) {
				continue;
			}
			let envelope = serde_json::from_slice(line).context(InvalidJsonSnafu)?;
			return Ok(Some(envelope));
		}
	}
}

impl Encoder<Envelope> for ControlCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
		let json = serde_json::to_vec(&item).context(InvalidJsonSnafu)?;
		dst.reserve(json.len() + 1);
		dst.put_slice(&json);
		dst.put_u8(b'\n');
		Ok(())
	}
}
