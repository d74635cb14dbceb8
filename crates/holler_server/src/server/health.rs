#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use holler_protocol::wire::RankEntry;

use crate::server::session::SharedStore;

/// Default row count for `/channelz` when no `k` query parameter is given.
const DEFAULT_CHANNELZ_K: usize = 10;
const MAX_CHANNELZ_K: usize = 100;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState, store: SharedStore) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state, store).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState, store: SharedStore) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		let store = store.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone(), store.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn parse_k(query: Option<&str>) -> usize {
	let Some(query) = query else {
		return DEFAULT_CHANNELZ_K;
	};

	query
		.split('&')
		.find_map(|pair| pair.strip_prefix("k="))
		.and_then(|v| v.parse::<usize>().ok())
		.unwrap_or(DEFAULT_CHANNELZ_K)
		.min(MAX_CHANNELZ_K)
}

async fn handle_health(
	req: Request<Incoming>,
	state: HealthState,
	store: SharedStore,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(Response::builder()
			.status(StatusCode::METHOD_NOT_ALLOWED)
			.body(Full::new(Bytes::new()))
			.unwrap());
	}

	let path = req.uri().path();
	match path {
		"/healthz" => Ok(Response::builder()
			.status(StatusCode::OK)
			.body(Full::new(Bytes::from_static(b"ok")))
			.unwrap()),
		"/readyz" => {
			if state.is_ready() {
				Ok(Response::builder()
					.status(StatusCode::OK)
					.body(Full::new(Bytes::from_static(b"ready")))
					.unwrap())
			} else {
				Ok(Response::builder()
					.status(StatusCode::SERVICE_UNAVAILABLE)
					.body(Full::new(Bytes::from_static(b"not-ready")))
					.unwrap())
			}
		}
		// Read-only ranking query outside the real-time channel.
		"/channelz" => {
			let k = parse_k(req.uri().query());

			let ranks = store.lock().await.top_channels(k);
			let channels: Vec<RankEntry> = ranks
				.into_iter()
				.map(|r| RankEntry {
					channel: r.key.into_string(),
					count: r.count,
				})
				.collect();

			let body = serde_json::to_vec(&serde_json::json!({ "channels": channels })).unwrap_or_default();
			Ok(Response::builder()
				.status(StatusCode::OK)
				.header("content-type", "application/json")
				.body(Full::new(Bytes::from(body)))
				.unwrap())
		}
		_ => Ok(Response::builder()
			.status(StatusCode::NOT_FOUND)
			.body(Full::new(Bytes::new()))
			.unwrap()),
	}
}
