#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use roomcast_domain::GroupId;
use roomcast_store::MessageStore;
use tokio::net::TcpListener;
use tracing::warn;

/// Catch-up REST endpoint: `GET /messages/:groupId` returns that group's
/// stored messages, oldest first.
pub fn spawn_history_server(bind: SocketAddr, store: Arc<dyn MessageStore>) {
	tokio::spawn(async move {
		if let Err(err) = run_history_server(bind, store).await {
			warn!(error = %err, "history server stopped");
		}
	});
}

async fn run_history_server(bind: SocketAddr, store: Arc<dyn MessageStore>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	serve_history(listener, store).await
}

/// Serve the history endpoint on an already-bound listener.
pub async fn serve_history(listener: TcpListener, store: Arc<dyn MessageStore>) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let store = store.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_history(req, store.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "history connection error");
			}
		});
	}
}

async fn handle_history(req: Request<Incoming>, store: Arc<dyn MessageStore>) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &store).await)
}

async fn route(method: &Method, path: &str, store: &Arc<dyn MessageStore>) -> Response<Full<Bytes>> {
	if method == Method::OPTIONS {
		return respond(StatusCode::NO_CONTENT, Bytes::new(), None);
	}
	if method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new(), None);
	}

	// The group segment is the final one; nested paths are not routes.
	let group = match path.strip_prefix("/messages/") {
		Some(raw) if !raw.contains('/') => match GroupId::new(raw) {
			Ok(group) => group,
			Err(_) => return respond(StatusCode::NOT_FOUND, Bytes::from_static(b"Not Found"), None),
		},
		_ => return respond(StatusCode::NOT_FOUND, Bytes::from_static(b"Not Found"), None),
	};

	let rows = match store.list_messages(&group).await {
		Ok(rows) => rows,
		Err(e) => {
			warn!(group = %group, error = %e, "history query failed");
			return respond(
				StatusCode::INTERNAL_SERVER_ERROR,
				Bytes::from_static(b"Internal Server Error"),
				None,
			);
		}
	};

	match serde_json::to_vec(&rows) {
		Ok(body) => respond(StatusCode::OK, Bytes::from(body), Some("application/json")),
		Err(e) => {
			warn!(group = %group, error = %e, "history encode failed");
			respond(
				StatusCode::INTERNAL_SERVER_ERROR,
				Bytes::from_static(b"Internal Server Error"),
				None,
			)
		}
	}
}

/// Every response carries the CORS headers, error responses included.
fn respond(status: StatusCode, body: Bytes, content_type: Option<&'static str>) -> Response<Full<Bytes>> {
	let mut builder = Response::builder()
		.status(status)
		.header("Access-Control-Allow-Origin", "*")
		.header("Access-Control-Allow-Methods", "GET, POST, PUT, DELETE, OPTIONS")
		.header("Access-Control-Allow-Headers", "Content-Type, Authorization");

	if let Some(content_type) = content_type {
		builder = builder.header("Content-Type", content_type);
	}

	builder.body(Full::new(body)).unwrap()
}
