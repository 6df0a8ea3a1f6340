use std::time::Duration;

use chuantou_core::control::{AuthResp, Body};
use uuid::Uuid;

use crate::{
	controller::{PendingMap, backoff_base, parse_server_url},
	handler::http::filter_hop_by_hop,
};

#[test]
fn hop_by_hop_filter_is_exact() {
	let headers = vec![
		("Host".to_string(), "example.com".to_string()),
		("Connection".to_string(), "keep-alive".to_string()),
		("Keep-Alive".to_string(), "timeout=5".to_string()),
		("Proxy-Authenticate".to_string(), "Basic".to_string()),
		("PROXY-AUTHORIZATION".to_string(), "Basic xyz".to_string()),
		("te".to_string(), "trailers".to_string()),
		("Trailers".to_string(), "Expires".to_string()),
		("Transfer-Encoding".to_string(), "chunked".to_string()),
		("Upgrade".to_string(), "h2c".to_string()),
		("Content-Type".to_string(), "text/html".to_string()),
		("X-Upgrade-Insecure".to_string(), "1".to_string()),
	];
	let filtered = filter_hop_by_hop(&headers);
	assert_eq!(
		filtered,
		vec![
			("Host".to_string(), "example.com".to_string()),
			("Content-Type".to_string(), "text/html".to_string()),
			// Similar names that are not in the list survive.
			("X-Upgrade-Insecure".to_string(), "1".to_string()),
		]
	);
}

#[test]
fn backoff_doubles_and_caps() {
	let base = Duration::from_secs(1);
	let expected = [1u64, 2, 4, 8, 16];
	for (attempts, secs) in expected.iter().enumerate() {
		assert_eq!(
			backoff_base(base, attempts as u32),
			Duration::from_secs(*secs)
		);
	}
	// Far past the cap, the delay pins to 60 s.
	assert_eq!(backoff_base(base, 12), Duration::from_secs(60));
	assert_eq!(backoff_base(base, u32::MAX), Duration::from_secs(60));
	assert_eq!(backoff_base(Duration::from_secs(5), 6), Duration::from_secs(60));
}

#[test]
fn server_url_forms() {
	assert_eq!(
		parse_server_url("example.com:7000").unwrap(),
		("example.com:7000".to_string(), "example.com".to_string(), false)
	);
	assert_eq!(
		parse_server_url("tcp://10.0.0.1:7000").unwrap(),
		("10.0.0.1:7000".to_string(), "10.0.0.1".to_string(), false)
	);
	assert_eq!(
		parse_server_url("tls://tunnel.example.com:7000").unwrap(),
		(
			"tunnel.example.com:7000".to_string(),
			"tunnel.example.com".to_string(),
			true
		)
	);
	assert!(parse_server_url("example.com").is_err());
	assert!(parse_server_url("ws://example.com:7000").is_err());
	assert!(parse_server_url("example.com:http").is_err());
}

#[tokio::test]
async fn pending_map_completes_by_id() {
	let pending = PendingMap::default();
	let id = Uuid::new_v4();
	let rx = pending.insert(id);

	// An unrelated id completes nothing.
	assert!(!pending.complete(
		&Uuid::new_v4(),
		Body::AuthResp(AuthResp {
			success: true,
			client_id: None,
			error: None,
		})
	));
	assert_eq!(pending.len(), 1);

	assert!(pending.complete(
		&id,
		Body::AuthResp(AuthResp {
			success: true,
			client_id: Some("c".into()),
			error: None,
		})
	));
	assert_eq!(pending.len(), 0);
	assert!(matches!(rx.await, Ok(Body::AuthResp(resp)) if resp.success));
}

#[tokio::test]
async fn pending_map_transport_loss_rejects_waiters() {
	let pending = PendingMap::default();
	let rx_a = pending.insert(Uuid::new_v4());
	let rx_b = pending.insert(Uuid::new_v4());
	pending.fail_all();
	assert!(rx_a.await.is_err());
	assert!(rx_b.await.is_err());
	assert_eq!(pending.len(), 0);
}

/// Message ids come from v4 uuids; two envelopes never collide.
#[test]
fn message_ids_are_unique() {
	use std::collections::HashSet;

	use chuantou_core::control::{AuthPayload, Envelope};

	let mut seen = HashSet::new();
	for _ in 0..10_000 {
		let envelope = Envelope::request(Body::Auth(AuthPayload {
			token: String::new(),
		}));
		assert!(seen.insert(envelope.id));
	}
}
