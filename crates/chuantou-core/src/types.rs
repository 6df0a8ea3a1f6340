use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Advisory protocol tag attached to a logical connection.
///
/// The tag is derived from a bounded peek at the first bytes of a user
/// connection and only routes the client-side handling; `http` and
/// `websocket` degrade to `tcp` byte pipes whenever the peek is
/// inconclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Http,
	Websocket,
	Tcp,
	Udp,
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Protocol::Http => write!(f, "http"),
			Protocol::Websocket => write!(f, "websocket"),
			Protocol::Tcp => write!(f, "tcp"),
			Protocol::Udp => write!(f, "udp"),
		}
	}
}

/// Connection ids travel as UTF-8 strings on both the control link and the
/// binary data channel, so a `String` is the canonical form.
pub fn new_conn_id() -> String {
	Uuid::new_v4().to_string()
}

pub fn new_client_id() -> String {
	Uuid::new_v4().to_string()
}
