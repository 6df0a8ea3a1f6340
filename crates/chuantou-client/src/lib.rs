//! NAT-side half of the tunnel: keeps a control link to the public server,
//! registers public ports, and bridges every announced connection to the
//! configured local service.

pub mod controller;
pub mod data;
pub mod handler;
pub mod registry;
mod tls;
mod udp;

#[cfg(test)]
mod tests;

use std::{sync::Arc, time::Duration};

use chuantou_core::{AppContext, types::Protocol};

use crate::{controller::Controller, registry::{ProxyRegistry, ProxyTarget}};

/// One entry of the initial registration list.
#[derive(Debug, Clone)]
pub struct ProxyConf {
	pub remote_port: u16,
	pub local_port: u16,
	pub local_host: String,
	pub protocol: Option<Protocol>,
}

#[derive(Debug, Clone)]
pub struct ClientOpts {
	/// Server control endpoint: `host:port`, optionally prefixed with
	/// `tcp://` or `tls://`.
	pub server_url: String,
	pub token: String,
	/// Base delay for exponential reconnect backoff.
	pub reconnect_interval: Duration,
	pub max_reconnect_attempts: u32,
	pub heartbeat_interval: Duration,
	pub request_timeout: Duration,
	/// Accept any server certificate on a `tls://` link (development).
	pub skip_cert_verify: bool,
	pub proxies: Vec<ProxyConf>,
}

impl Default for ClientOpts {
	fn default() -> Self {
		Self {
			server_url: "127.0.0.1:7000".to_string(),
			token: String::new(),
			reconnect_interval: Duration::from_secs(1),
			max_reconnect_attempts: 10,
			heartbeat_interval: Duration::from_secs(30),
			request_timeout: Duration::from_secs(30),
			skip_cert_verify: false,
			proxies: Vec::new(),
		}
	}
}

pub struct TunnelClient {
	controller: Controller,
}

impl TunnelClient {
	pub fn new(ctx: Arc<AppContext>, opts: ClientOpts) -> Self {
		let registry = Arc::new(ProxyRegistry::new());
		for proxy in &opts.proxies {
			registry.insert(
				proxy.remote_port,
				ProxyTarget {
					local_host: proxy.local_host.clone(),
					local_port: proxy.local_port,
					protocol: proxy.protocol,
				},
			);
		}
		let controller = Controller::new(ctx, opts, registry);
		Self { controller }
	}

	/// Run until the context token is cancelled, authentication is rejected,
	/// or the reconnect attempts are exhausted.
	pub async fn run(&self) -> eyre::Result<()> {
		self.controller.run().await
	}
}
