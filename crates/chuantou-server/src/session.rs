//! Server-side session registry: the single source of truth for clients,
//! their registered public ports, and live logical connections.
//!
//! The maps use fine-grained `RwLock`s. Lock order is always
//! sessions → ports → connections; no method holds a later lock while
//! acquiring an earlier one.

use std::{
	collections::{HashMap, HashSet},
	net::SocketAddr,
	time::{Duration, SystemTime},
};

use bytes::Bytes;
use chuantou_core::{control::Envelope, types::Protocol};
use snafu::Snafu;
use tokio::{
	sync::{RwLock, mpsc},
	time::Instant,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
pub enum RegisterError {
	#[snafu(display("port {port} out of range (1024-65535)"))]
	PortOutOfRange { port: u16 },
	#[snafu(display("port already registered"))]
	PortOccupied,
	#[snafu(display("client not authenticated"))]
	NotAuthenticated,
	#[snafu(display("{message}"))]
	Bind { message: String },
}

/// Metadata for one logical connection. The user-side socket stays with its
/// forwarder task; `user_tx` is the bounded queue feeding bytes back to it.
/// UDP connections are routed through the UDP channel instead and carry no
/// queue.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
	pub client_id: String,
	pub remote_port: u16,
	pub protocol: Protocol,
	pub remote_address: SocketAddr,
	pub created_at: Instant,
	pub user_tx: Option<mpsc::Sender<Bytes>>,
}

#[derive(Debug)]
struct ClientSession {
	authenticated: bool,
	connected_at: SystemTime,
	last_heartbeat: Instant,
	ports: HashSet<u16>,
	conns: HashSet<String>,
	control_tx: mpsc::Sender<Envelope>,
	cancel: CancellationToken,
}

#[derive(Debug)]
struct PortBinding {
	client_id: String,
	cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
	pub auth_clients: usize,
	pub total_ports: usize,
	pub total_connections: usize,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
	pub client_id: String,
	pub connected_at: SystemTime,
	pub ports: Vec<u16>,
}

/// Everything that was torn off a removed session, so the caller can emit
/// close notifications without re-locking.
#[derive(Debug)]
pub struct RemovedSession {
	pub conns: Vec<(String, ConnectionInfo)>,
	pub ports: Vec<u16>,
}

#[derive(Debug, Default)]
pub struct SessionManager {
	sessions: RwLock<HashMap<String, ClientSession>>,
	ports: RwLock<HashMap<u16, PortBinding>>,
	connections: RwLock<HashMap<String, ConnectionInfo>>,
}

impl SessionManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Create a session record for a freshly accepted control link. The
	/// session starts unauthenticated; `cancel` is the root of everything
	/// spawned on behalf of this client.
	pub async fn create_session(
		&self,
		control_tx: mpsc::Sender<Envelope>,
		cancel: CancellationToken,
	) -> String {
		let client_id = chuantou_core::types::new_client_id();
		self.sessions.write().await.insert(
			client_id.clone(),
			ClientSession {
				authenticated: false,
				connected_at: SystemTime::now(),
				last_heartbeat: Instant::now(),
				ports: HashSet::new(),
				conns: HashSet::new(),
				control_tx,
				cancel,
			},
		);
		client_id
	}

	pub async fn authenticate(&self, client_id: &str) -> bool {
		match self.sessions.write().await.get_mut(client_id) {
			Some(session) => {
				session.authenticated = true;
				session.last_heartbeat = Instant::now();
				true
			}
			None => false,
		}
	}

	pub async fn is_authenticated(&self, client_id: &str) -> bool {
		self.sessions
			.read()
			.await
			.get(client_id)
			.is_some_and(|s| s.authenticated)
	}

	/// Child token of the session's root cancellation token, for tasks that
	/// must die with the session (data channel loops, forwarders).
	pub async fn session_token(&self, client_id: &str) -> Option<CancellationToken> {
		self.sessions
			.read()
			.await
			.get(client_id)
			.map(|s| s.cancel.child_token())
	}

	pub async fn control_tx(&self, client_id: &str) -> Option<mpsc::Sender<Envelope>> {
		self.sessions
			.read()
			.await
			.get(client_id)
			.map(|s| s.control_tx.clone())
	}

	/// Reserve a public port for a client: vacancy check and insert happen
	/// under one critical section. The actual socket bind happens outside;
	/// on bind failure the caller rolls back with [`unregister_port`].
	///
	/// Returns the cancellation token the port's listener must watch (a
	/// child of the session token).
	///
	/// [`unregister_port`]: Self::unregister_port
	pub async fn register_port(
		&self,
		client_id: &str,
		port: u16,
	) -> Result<CancellationToken, RegisterError> {
		if port < 1024 {
			return Err(RegisterError::PortOutOfRange { port });
		}
		let mut sessions = self.sessions.write().await;
		let session = sessions
			.get_mut(client_id)
			.filter(|s| s.authenticated)
			.ok_or(RegisterError::NotAuthenticated)?;
		let mut ports = self.ports.write().await;
		if ports.contains_key(&port) {
			return Err(RegisterError::PortOccupied);
		}
		let cancel = session.cancel.child_token();
		ports.insert(
			port,
			PortBinding {
				client_id: client_id.to_owned(),
				cancel: cancel.clone(),
			},
		);
		session.ports.insert(port);
		Ok(cancel)
	}

	/// Release a port if owned by `client_id`, cancelling its listener.
	pub async fn unregister_port(&self, client_id: &str, port: u16) -> bool {
		let mut sessions = self.sessions.write().await;
		let mut ports = self.ports.write().await;
		let owned = matches!(ports.get(&port), Some(binding) if binding.client_id == client_id);
		if !owned {
			return false;
		}
		if let Some(binding) = ports.remove(&port) {
			binding.cancel.cancel();
		}
		if let Some(session) = sessions.get_mut(client_id) {
			session.ports.remove(&port);
		}
		true
	}

	pub async fn add_connection(&self, conn_id: String, info: ConnectionInfo) {
		let mut sessions = self.sessions.write().await;
		if let Some(session) = sessions.get_mut(&info.client_id) {
			session.conns.insert(conn_id.clone());
		}
		self.connections.write().await.insert(conn_id, info);
	}

	pub async fn remove_connection(&self, conn_id: &str) -> Option<ConnectionInfo> {
		let mut sessions = self.sessions.write().await;
		let info = self.connections.write().await.remove(conn_id)?;
		if let Some(session) = sessions.get_mut(&info.client_id) {
			session.conns.remove(conn_id);
		}
		Some(info)
	}

	pub async fn connection(&self, conn_id: &str) -> Option<ConnectionInfo> {
		self.connections.read().await.get(conn_id).cloned()
	}

	pub async fn connections_of(&self, client_id: &str) -> Vec<(String, ConnectionInfo)> {
		self.connections
			.read()
			.await
			.iter()
			.filter(|(_, info)| info.client_id == client_id)
			.map(|(id, info)| (id.clone(), info.clone()))
			.collect()
	}

	pub async fn update_heartbeat(&self, client_id: &str) -> bool {
		match self.sessions.write().await.get_mut(client_id) {
			Some(session) => {
				session.last_heartbeat = Instant::now();
				true
			}
			None => false,
		}
	}

	pub async fn client_by_port(&self, port: u16) -> Option<String> {
		self.ports
			.read()
			.await
			.get(&port)
			.map(|b| b.client_id.clone())
	}

	pub async fn stats(&self) -> Stats {
		let auth_clients = self
			.sessions
			.read()
			.await
			.values()
			.filter(|s| s.authenticated)
			.count();
		let total_ports = self.ports.read().await.len();
		let total_connections = self.connections.read().await.len();
		Stats {
			auth_clients,
			total_ports,
			total_connections,
		}
	}

	pub async fn sessions(&self) -> Vec<SessionSummary> {
		self.sessions
			.read()
			.await
			.iter()
			.filter(|(_, s)| s.authenticated)
			.map(|(client_id, s)| {
				let mut ports: Vec<u16> = s.ports.iter().copied().collect();
				ports.sort_unstable();
				SessionSummary {
					client_id: client_id.clone(),
					connected_at: s.connected_at,
					ports,
				}
			})
			.collect()
	}

	/// Authenticated sessions whose last heartbeat is older than `timeout`.
	pub async fn expired(&self, timeout: Duration) -> Vec<String> {
		let now = Instant::now();
		self.sessions
			.read()
			.await
			.iter()
			.filter(|(_, s)| s.authenticated && now.duration_since(s.last_heartbeat) > timeout)
			.map(|(client_id, _)| client_id.clone())
			.collect()
	}

	/// Tear a session out of the registry. Cancels the session token, which
	/// takes the control loop, every port listener, and every forwarder with
	/// it. Returns what was removed so the caller can notify peers.
	pub async fn remove_session(&self, client_id: &str) -> Option<RemovedSession> {
		let mut sessions = self.sessions.write().await;
		let session = sessions.remove(client_id)?;
		session.cancel.cancel();

		let mut ports = self.ports.write().await;
		let mut removed_ports = Vec::new();
		for port in &session.ports {
			if let Some(binding) = ports.remove(port) {
				binding.cancel.cancel();
				removed_ports.push(*port);
			}
		}

		let mut connections = self.connections.write().await;
		let mut conns = Vec::new();
		for conn_id in &session.conns {
			if let Some(info) = connections.remove(conn_id) {
				conns.push((conn_id.clone(), info));
			}
		}

		Some(RemovedSession {
			conns,
			ports: removed_ports,
		})
	}
}
