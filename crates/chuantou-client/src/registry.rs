//! Registry of the public ports this client has claimed and where each one
//! lands locally. Entries survive reconnects; the controller replays them
//! after every successful re-authentication.

use std::{collections::HashMap, sync::RwLock};

use chuantou_core::types::Protocol;

#[derive(Debug, Clone)]
pub struct ProxyTarget {
	pub local_host: String,
	pub local_port: u16,
	pub protocol: Option<Protocol>,
}

impl ProxyTarget {
	pub fn local_addr(&self) -> String {
		format!("{}:{}", self.local_host, self.local_port)
	}
}

#[derive(Debug, Default)]
pub struct ProxyRegistry {
	entries: RwLock<HashMap<u16, ProxyTarget>>,
}

impl ProxyRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, remote_port: u16, target: ProxyTarget) {
		self.entries
			.write()
			.expect("registry lock poisoned")
			.insert(remote_port, target);
	}

	pub fn remove(&self, remote_port: u16) -> Option<ProxyTarget> {
		self.entries
			.write()
			.expect("registry lock poisoned")
			.remove(&remote_port)
	}

	pub fn get(&self, remote_port: u16) -> Option<ProxyTarget> {
		self.entries
			.read()
			.expect("registry lock poisoned")
			.get(&remote_port)
			.cloned()
	}

	pub fn all(&self) -> Vec<(u16, ProxyTarget)> {
		let mut entries: Vec<_> = self
			.entries
			.read()
			.expect("registry lock poisoned")
			.iter()
			.map(|(port, target)| (*port, target.clone()))
			.collect();
		entries.sort_by_key(|(port, _)| *port);
		entries
	}
}
