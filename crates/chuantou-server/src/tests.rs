use std::time::Duration;

use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
	proxy::UdpSessionTable,
	session::{ConnectionInfo, RegisterError, SessionManager},
};

async fn auth_session(manager: &SessionManager) -> (String, CancellationToken) {
	let (tx, _rx) = mpsc::channel(8);
	let cancel = CancellationToken::new();
	let client_id = manager.create_session(tx, cancel.clone()).await;
	assert!(manager.authenticate(&client_id).await);
	(client_id, cancel)
}

fn conn_info(client_id: &str, port: u16) -> ConnectionInfo {
	ConnectionInfo {
		client_id: client_id.to_owned(),
		remote_port: port,
		protocol: chuantou_core::types::Protocol::Tcp,
		remote_address: "127.0.0.1:50000".parse().unwrap(),
		created_at: Instant::now(),
		user_tx: None,
	}
}

#[tokio::test]
async fn port_is_exclusive_between_clients() {
	let manager = SessionManager::new();
	let (a, _a_cancel) = auth_session(&manager).await;
	let (b, _b_cancel) = auth_session(&manager).await;

	manager.register_port(&a, 9000).await.unwrap();
	assert!(matches!(
		manager.register_port(&b, 9000).await,
		Err(RegisterError::PortOccupied)
	));
	assert_eq!(manager.client_by_port(9000).await.as_deref(), Some(a.as_str()));

	// Only the owner may release the port.
	assert!(!manager.unregister_port(&b, 9000).await);
	assert!(manager.unregister_port(&a, 9000).await);
	manager.register_port(&b, 9000).await.unwrap();
	assert_eq!(manager.client_by_port(9000).await.as_deref(), Some(b.as_str()));
}

#[tokio::test]
async fn low_ports_are_rejected() {
	let manager = SessionManager::new();
	let (client, _cancel) = auth_session(&manager).await;
	assert!(matches!(
		manager.register_port(&client, 80).await,
		Err(RegisterError::PortOutOfRange { port: 80 })
	));
}

#[tokio::test]
async fn register_requires_authentication() {
	let manager = SessionManager::new();
	let (tx, _rx) = mpsc::channel(8);
	let client_id = manager
		.create_session(tx, CancellationToken::new())
		.await;
	assert!(matches!(
		manager.register_port(&client_id, 9000).await,
		Err(RegisterError::NotAuthenticated)
	));
}

/// Any interleaving of concurrent registrations yields exactly one owner.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_has_single_winner() {
	let manager = std::sync::Arc::new(SessionManager::new());
	let mut clients = Vec::new();
	for _ in 0..8 {
		clients.push(auth_session(&manager).await.0);
	}

	let mut handles = Vec::new();
	for client_id in clients {
		let manager = manager.clone();
		handles.push(tokio::spawn(async move {
			manager.register_port(&client_id, 12000).await.is_ok()
		}));
	}
	let mut winners = 0;
	for handle in handles {
		if handle.await.unwrap() {
			winners += 1;
		}
	}
	assert_eq!(winners, 1);
	assert_eq!(manager.stats().await.total_ports, 1);
}

#[tokio::test]
async fn remove_session_tears_everything_down() {
	let manager = SessionManager::new();
	let (client, cancel) = auth_session(&manager).await;
	manager.register_port(&client, 9100).await.unwrap();
	manager
		.add_connection("conn-1".into(), conn_info(&client, 9100))
		.await;
	manager
		.add_connection("conn-2".into(), conn_info(&client, 9100))
		.await;

	let removed = manager.remove_session(&client).await.unwrap();
	assert!(cancel.is_cancelled());
	assert_eq!(removed.ports, vec![9100]);
	assert_eq!(removed.conns.len(), 2);

	let stats = manager.stats().await;
	assert_eq!(stats.auth_clients, 0);
	assert_eq!(stats.total_ports, 0);
	assert_eq!(stats.total_connections, 0);
	assert!(manager.client_by_port(9100).await.is_none());
	assert!(manager.remove_session(&client).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn stale_sessions_expire() {
	let manager = SessionManager::new();
	let (fresh, _f) = auth_session(&manager).await;
	let (stale, _s) = auth_session(&manager).await;

	tokio::time::advance(Duration::from_secs(70)).await;
	assert!(manager.update_heartbeat(&fresh).await);
	tokio::time::advance(Duration::from_secs(50)).await;

	// `stale` is 120 s quiet, `fresh` only 50 s.
	let expired = manager.expired(Duration::from_secs(90)).await;
	assert_eq!(expired, vec![stale]);
}

#[tokio::test]
async fn session_listing_reports_ports() {
	let manager = SessionManager::new();
	let (client, _cancel) = auth_session(&manager).await;
	manager.register_port(&client, 9300).await.unwrap();
	manager.register_port(&client, 9200).await.unwrap();

	let sessions = manager.sessions().await;
	assert_eq!(sessions.len(), 1);
	assert_eq!(sessions[0].client_id, client);
	assert_eq!(sessions[0].ports, vec![9200, 9300]);
}

#[tokio::test(start_paused = true)]
async fn udp_sessions_idle_out_and_restart_fresh() {
	let mut table = UdpSessionTable::new();
	let peer = "203.0.113.9:5353".parse().unwrap();
	let idle = Duration::from_secs(30);

	let (first, is_new) = table.touch(peer, Instant::now());
	assert!(is_new);

	// Refreshing within the window keeps the session alive.
	tokio::time::advance(Duration::from_secs(20)).await;
	let (same, is_new) = table.touch(peer, Instant::now());
	assert!(!is_new);
	assert_eq!(same, first);
	tokio::time::advance(Duration::from_secs(25)).await;
	assert!(table.evict_idle(idle, Instant::now()).is_empty());
	assert_eq!(table.len(), 1);

	// Past the idle threshold the session is evicted...
	tokio::time::advance(Duration::from_secs(31)).await;
	let evicted = table.evict_idle(idle, Instant::now());
	assert_eq!(evicted.len(), 1);
	assert_eq!(evicted[0].1, first);
	assert_eq!(table.len(), 0);

	// ...and the next datagram from the same source starts a new session
	// under a new connection id.
	let (second, is_new) = table.touch(peer, Instant::now());
	assert!(is_new);
	assert_ne!(second, first);
}
