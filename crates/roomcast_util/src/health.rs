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

/// Shared readiness flags. `ready` flips once at startup; `degraded`
/// tracks whether the broker link is currently down.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	degraded: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			degraded: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn set_link_up(&self, up: bool) {
		self.degraded.store(!up, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	pub fn is_degraded(&self) -> bool {
		self.degraded.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn readiness(state: &HealthState) -> (StatusCode, &'static str) {
	if !state.is_ready() {
		(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
	} else if state.is_degraded() {
		// Still serving local traffic, so stay in rotation.
		(StatusCode::OK, "degraded")
	} else {
		(StatusCode::OK, "ready")
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
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
			let (status, body) = readiness(&state);
			Ok(Response::builder()
				.status(status)
				.body(Full::new(Bytes::from_static(body.as_bytes())))
				.unwrap())
		}
		_ => Ok(Response::builder()
			.status(StatusCode::NOT_FOUND)
			.body(Full::new(Bytes::new()))
			.unwrap()),
	}
}
