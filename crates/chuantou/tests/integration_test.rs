//! End-to-end tests: an in-process server, one or two in-process clients,
//! and plain sockets standing in for users and local services.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use chuantou_client::{ClientOpts, ProxyConf, TunnelClient};
use chuantou_core::AppContext;
use chuantou_server::{ServerOpts, TunnelServer};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream, UdpSocket},
	time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

/// Grab a free TCP port. Races with other binds are possible but rare
/// enough for tests.
async fn free_port() -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	listener.local_addr().unwrap().port()
}

async fn start_server(ctx: &Arc<AppContext>, auth_tokens: Vec<String>) -> (Arc<TunnelServer>, u16) {
	let control_port = free_port().await;
	let server = Arc::new(TunnelServer::new(
		ctx.clone(),
		ServerOpts {
			host: "127.0.0.1".parse().unwrap(),
			control_port,
			auth_tokens,
			..ServerOpts::default()
		},
	));
	let listen = server.clone();
	tokio::spawn(async move {
		let _ = listen.listen().await;
	});
	(server, control_port)
}

fn client_opts(control_port: u16, token: &str, proxies: Vec<ProxyConf>) -> ClientOpts {
	ClientOpts {
		server_url: format!("127.0.0.1:{control_port}"),
		token: token.to_string(),
		reconnect_interval: Duration::from_millis(100),
		max_reconnect_attempts: 3,
		proxies,
		..ClientOpts::default()
	}
}

fn proxy(remote_port: u16, local_port: u16) -> ProxyConf {
	ProxyConf {
		remote_port,
		local_port,
		local_host: "127.0.0.1".to_string(),
		protocol: None,
	}
}

async fn wait_for_ports(server: &TunnelServer, total_ports: usize) {
	timeout(WAIT, async {
		while server.stats().await.total_ports != total_ports {
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
	})
	.await
	.expect("registered port count not reached in time");
}

async fn wait_for_clients(server: &TunnelServer, auth_clients: usize) {
	timeout(WAIT, async {
		while server.stats().await.auth_clients != auth_clients {
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
	})
	.await
	.expect("authenticated client count not reached in time");
}

async fn wait_for_no_connections(server: &TunnelServer) {
	timeout(WAIT, async {
		while server.stats().await.total_connections != 0 {
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
	})
	.await
	.expect("connections not cleaned up in time");
}

/// Line responder: reads one line, answers PONG.
async fn spawn_pong_service() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut buf = [0u8; 64];
				let mut seen = Vec::new();
				while let Ok(n) = stream.read(&mut buf).await {
					if n == 0 {
						break;
					}
					seen.extend_from_slice(&buf[..n]);
					if seen.contains(&b'\n') {
						let _ = stream.write_all(b"PONG\n").await;
						seen.clear();
					}
				}
			});
		}
	});
	addr
}

async fn spawn_echo_service() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut buf = vec![0u8; 16 * 1024];
				while let Ok(n) = stream.read(&mut buf).await {
					if n == 0 {
						break;
					}
					if stream.write_all(&buf[..n]).await.is_err() {
						break;
					}
				}
			});
		}
	});
	addr
}

/// Responder that identifies itself with a fixed tag and closes.
async fn spawn_tag_service(tag: &'static [u8]) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut buf = [0u8; 64];
				let _ = stream.read(&mut buf).await;
				let _ = stream.write_all(tag).await;
			});
		}
	});
	addr
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn tcp_ping_pong_through_tunnel() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let (server, control_port) = start_server(&ctx, vec![]).await;

	let service = spawn_pong_service().await;
	let remote_port = free_port().await;
	let client = TunnelClient::new(
		ctx.clone(),
		client_opts(control_port, "", vec![proxy(remote_port, service.port())]),
	);
	tokio::spawn(async move {
		let _ = client.run().await;
	});

	wait_for_ports(&server, 1).await;

	let mut user = TcpStream::connect(("127.0.0.1", remote_port)).await?;
	user.write_all(b"PING\n").await?;
	let mut reply = [0u8; 5];
	timeout(WAIT, user.read_exact(&mut reply)).await??;
	assert_eq!(&reply, b"PONG\n");
	drop(user);

	// The logical connection is cleaned up on close.
	wait_for_no_connections(&server).await;

	ctx.token.cancel();
	Ok(())
}

/// End-to-end byte fidelity: what goes in comes back out, in order.
#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn tcp_bytes_survive_roundtrip() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let (server, control_port) = start_server(&ctx, vec![]).await;

	let service = spawn_echo_service().await;
	let remote_port = free_port().await;
	let client = TunnelClient::new(
		ctx.clone(),
		client_opts(control_port, "", vec![proxy(remote_port, service.port())]),
	);
	tokio::spawn(async move {
		let _ = client.run().await;
	});
	wait_for_ports(&server, 1).await;

	let payload: Vec<u8> = (0..128 * 1024).map(|i| (i * 31 % 251) as u8).collect();
	let user = TcpStream::connect(("127.0.0.1", remote_port)).await?;
	let (mut read_half, mut write_half) = user.into_split();

	let expected = payload.clone();
	let reader = tokio::spawn(async move {
		let mut got = vec![0u8; expected.len()];
		read_half.read_exact(&mut got).await.map(|_| got)
	});
	for chunk in payload.chunks(8 * 1024) {
		write_half.write_all(chunk).await?;
	}
	let got = timeout(WAIT, reader).await???;
	assert_eq!(got, payload);

	ctx.token.cancel();
	Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn invalid_token_is_terminal() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let (_server, control_port) = start_server(&ctx, vec!["good-token".to_string()]).await;

	let client = TunnelClient::new(ctx.clone(), client_opts(control_port, "bad", vec![]));
	let result = timeout(WAIT, client.run()).await?;
	let err = result.expect_err("auth should be rejected");
	assert!(err.to_string().contains("Invalid token"), "got: {err}");

	ctx.token.cancel();
	Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn port_conflict_rejected_without_harming_owner() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let (server, control_port) = start_server(&ctx, vec![]).await;

	let service_a = spawn_tag_service(b"A\n").await;
	let service_b = spawn_tag_service(b"B\n").await;
	let remote_port = free_port().await;

	let client_a = TunnelClient::new(
		ctx.clone(),
		client_opts(control_port, "", vec![proxy(remote_port, service_a.port())]),
	);
	tokio::spawn(async move {
		let _ = client_a.run().await;
	});
	wait_for_ports(&server, 1).await;

	// B wants the same public port; the registration is rejected but B's
	// session survives.
	let client_b = TunnelClient::new(
		ctx.clone(),
		client_opts(control_port, "", vec![proxy(remote_port, service_b.port())]),
	);
	tokio::spawn(async move {
		let _ = client_b.run().await;
	});
	wait_for_clients(&server, 2).await;
	tokio::time::sleep(Duration::from_millis(300)).await;
	assert_eq!(server.stats().await.total_ports, 1);

	// The port still belongs to A.
	let mut user = TcpStream::connect(("127.0.0.1", remote_port)).await?;
	user.write_all(b"hello\n").await?;
	let mut reply = [0u8; 2];
	timeout(WAIT, user.read_exact(&mut reply)).await??;
	assert_eq!(&reply, b"A\n");

	ctx.token.cancel();
	Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn http_request_roundtrip() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let (server, control_port) = start_server(&ctx, vec![]).await;

	// Minimal local HTTP service.
	let listener = TcpListener::bind("127.0.0.1:0").await?;
	let http_port = listener.local_addr()?.port();
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut buf = vec![0u8; 4096];
				let mut seen = Vec::new();
				loop {
					match stream.read(&mut buf).await {
						Ok(0) => return,
						Ok(n) => {
							seen.extend_from_slice(&buf[..n]);
							if seen.windows(4).any(|w| w == b"\r\n\r\n") {
								break;
							}
						}
						Err(_) => return,
					}
				}
				let _ = stream
					.write_all(
						b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
					)
					.await;
			});
		}
	});

	let remote_port = free_port().await;
	let client = TunnelClient::new(
		ctx.clone(),
		client_opts(control_port, "", vec![proxy(remote_port, http_port)]),
	);
	tokio::spawn(async move {
		let _ = client.run().await;
	});
	wait_for_ports(&server, 1).await;

	let mut user = TcpStream::connect(("127.0.0.1", remote_port)).await?;
	user.write_all(b"GET /greeting HTTP/1.1\r\nHost: tunnel.test\r\nAccept: */*\r\n\r\n")
		.await?;
	let mut response = Vec::new();
	timeout(WAIT, user.read_to_end(&mut response)).await??;
	let response = String::from_utf8_lossy(&response);
	assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {response}");
	assert!(response.contains("Content-Type: text/plain"));
	assert!(response.ends_with("hello"), "got: {response}");

	ctx.token.cancel();
	Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn udp_datagrams_roundtrip() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let (server, control_port) = start_server(&ctx, vec![]).await;

	// Local UDP echo.
	let echo = UdpSocket::bind("127.0.0.1:0").await?;
	let echo_port = echo.local_addr()?.port();
	tokio::spawn(async move {
		let mut buf = vec![0u8; 2048];
		while let Ok((n, peer)) = echo.recv_from(&mut buf).await {
			let _ = echo.send_to(&buf[..n], peer).await;
		}
	});

	let remote_port = free_port().await;
	let client = TunnelClient::new(
		ctx.clone(),
		client_opts(control_port, "", vec![proxy(remote_port, echo_port)]),
	);
	tokio::spawn(async move {
		let _ = client.run().await;
	});
	wait_for_ports(&server, 1).await;

	let user = UdpSocket::bind("127.0.0.1:0").await?;
	user.connect(("127.0.0.1", remote_port)).await?;
	user.send(b"marco").await?;
	let mut buf = [0u8; 32];
	let n = timeout(WAIT, user.recv(&mut buf)).await??;
	assert_eq!(&buf[..n], b"marco");

	// The datagram session registered a logical connection.
	assert_eq!(server.stats().await.total_connections, 1);

	ctx.token.cancel();
	Ok(())
}
