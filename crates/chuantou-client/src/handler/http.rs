//! HTTP round-trip handler: replays the announced request against the
//! local service and ships the response back over the control link, either
//! buffered in one message or streamed chunk by chunk.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chuantou_core::{
	control::{
		Body, Envelope, Headers, HttpResponse, HttpResponseData, HttpResponseEnd,
		HttpResponseHeaders, NewConnection,
	},
	debug, warn,
};
use futures_util::StreamExt as _;
use tokio::sync::mpsc;

use crate::registry::ProxyTarget;

/// The eight hop-by-hop header names (RFC 2616 §13.5.1). These describe a
/// single transport hop and must not cross the tunnel in either direction.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
	"connection",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailers",
	"transfer-encoding",
	"upgrade",
];

/// Drop hop-by-hop headers, case-insensitively, leaving everything else
/// untouched and in order.
pub fn filter_hop_by_hop(headers: &Headers) -> Headers {
	headers
		.iter()
		.filter(|(name, _)| {
			!HOP_BY_HOP_HEADERS
				.iter()
				.any(|hop| name.eq_ignore_ascii_case(hop))
		})
		.cloned()
		.collect()
}

pub(crate) struct HttpJob {
	pub client: reqwest::Client,
	pub out_tx: mpsc::Sender<Envelope>,
	pub conn: NewConnection,
	pub target: ProxyTarget,
}

pub(crate) async fn run_http(job: HttpJob) {
	let conn_id = job.conn.connection_id.clone();
	if let Err(err) = round_trip(&job).await {
		warn!(target: "[HTTP]", "round trip for {conn_id} failed: {err}");
		// Answer with a gateway error so the user is not left hanging.
		let _ = job
			.out_tx
			.send(Envelope::request(Body::HttpResponse(HttpResponse {
				connection_id: conn_id,
				status_code: 502,
				headers: vec![(
					"Content-Type".to_string(),
					"text/plain; charset=utf-8".to_string(),
				)],
				body: Some(BASE64.encode(format!("upstream request failed: {err}"))),
			})))
			.await;
	}
}

async fn round_trip(job: &HttpJob) -> eyre::Result<()> {
	let conn = &job.conn;
	let conn_id = &conn.connection_id;

	let path = conn.url.as_deref().unwrap_or("/");
	let url = format!("http://{}{}", job.target.local_addr(), path);
	let method = reqwest::Method::from_bytes(conn.method.as_deref().unwrap_or("GET").as_bytes())
		.map_err(|err| eyre::eyre!("bad method: {err}"))?;

	let mut request = job.client.request(method, &url);
	if let Some(headers) = &conn.headers {
		for (name, value) in filter_hop_by_hop(headers) {
			request = request.header(name, value);
		}
	}
	if let Some(body) = &conn.body {
		request = request.body(BASE64.decode(body)?);
	}

	let response = request.send().await?;
	let status_code = response.status().as_u16();
	let content_type = response
		.headers()
		.get(reqwest::header::CONTENT_TYPE)
		.and_then(|value| value.to_str().ok())
		.unwrap_or("")
		.to_ascii_lowercase();
	let raw_headers: Headers = response
		.headers()
		.iter()
		.map(|(name, value)| {
			(
				name.as_str().to_string(),
				String::from_utf8_lossy(value.as_bytes()).into_owned(),
			)
		})
		.collect();
	let headers = filter_hop_by_hop(&raw_headers);

	// "text/event-stream" and friends: ship the headers immediately and
	// stream each chunk as it arrives instead of buffering the body.
	if content_type.contains("stream") {
		send(job, Body::HttpResponseHeaders(HttpResponseHeaders {
			connection_id: conn_id.clone(),
			status_code,
			headers,
		}))
		.await;
		let mut body = response.bytes_stream();
		while let Some(chunk) = body.next().await {
			match chunk {
				Ok(chunk) => {
					send(job, Body::HttpResponseData(HttpResponseData {
						connection_id: conn_id.clone(),
						chunk: BASE64.encode(&chunk),
					}))
					.await;
				}
				Err(err) => {
					debug!("stream for {conn_id} ended with error: {err}");
					break;
				}
			}
		}
		send(job, Body::HttpResponseEnd(HttpResponseEnd {
			connection_id: conn_id.clone(),
		}))
		.await;
	} else {
		let body = response.bytes().await?;
		send(job, Body::HttpResponse(HttpResponse {
			connection_id: conn_id.clone(),
			status_code,
			headers,
			body: (!body.is_empty()).then(|| BASE64.encode(&body)),
		}))
		.await;
	}
	Ok(())
}

async fn send(job: &HttpJob, body: Body) {
	let _ = job.out_tx.send(Envelope::request(body)).await;
}
