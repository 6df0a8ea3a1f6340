//! Conversion from the persistent configuration into the option structs
//! the server and client crates consume.

use chuantou_client::{ClientOpts, ProxyConf};
use chuantou_server::{ServerOpts, TlsOpts};
use eyre::Context as _;

use super::persistent::{ClientConf, ServerConf};

impl ServerConf {
	pub fn to_opts(&self) -> eyre::Result<ServerOpts> {
		let host = self
			.host
			.parse()
			.with_context(|| format!("invalid bind host {}", self.host))?;
		Ok(ServerOpts {
			host,
			control_port: self.control_port,
			public_host: self.public_host.clone(),
			auth_tokens: self.auth_tokens.clone(),
			heartbeat_interval: self.heartbeat_interval,
			session_timeout: self.session_timeout,
			tls: self.tls.as_ref().map(|tls| TlsOpts {
				cert: tls.cert.clone(),
				key: tls.key.clone(),
			}),
			..ServerOpts::default()
		})
	}
}

impl ClientConf {
	pub fn to_opts(&self) -> ClientOpts {
		ClientOpts {
			server_url: self.server_url.clone(),
			token: self.token.clone(),
			reconnect_interval: self.reconnect_interval,
			max_reconnect_attempts: self.max_reconnect_attempts,
			skip_cert_verify: self.skip_cert_verify,
			proxies: self
				.proxies
				.iter()
				.map(|proxy| ProxyConf {
					remote_port: proxy.remote_port,
					local_port: proxy.local_port,
					local_host: proxy
						.local_host
						.clone()
						.unwrap_or_else(|| "127.0.0.1".to_string()),
					protocol: proxy.protocol,
				})
				.collect(),
			..ClientOpts::default()
		}
	}
}
