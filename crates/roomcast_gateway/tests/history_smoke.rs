#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use roomcast_domain::RoomId;
use roomcast_gateway::server::history::serve_history;
use roomcast_store::{MemoryStore, MessageStore, NewMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

async fn start_history(store: MemoryStore) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind history");
	let addr = listener.local_addr().expect("history addr");

	tokio::spawn(async move {
		let store: Arc<dyn MessageStore> = Arc::new(store);
		let _ = serve_history(listener, store).await;
	});

	addr
}

/// Raw HTTP/1.1 round trip; returns status, lowercased headers, body.
async fn http_get(addr: SocketAddr, path: &str) -> (u16, Vec<(String, String)>, String) {
	let mut stream = TcpStream::connect(addr).await.expect("connect history");
	let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
	stream.write_all(request.as_bytes()).await.expect("write request");

	let mut raw = Vec::new();
	timeout(Duration::from_secs(2), stream.read_to_end(&mut raw))
		.await
		.expect("expected a response within timeout")
		.expect("read response");
	let text = String::from_utf8(raw).expect("utf8 response");

	let (head, body) = text.split_once("\r\n\r\n").expect("header/body split");
	let mut lines = head.lines();
	let status_line = lines.next().expect("status line");
	let status: u16 = status_line
		.split_whitespace()
		.nth(1)
		.expect("status code")
		.parse()
		.expect("numeric status");
	let headers = lines
		.map(|line| {
			let (name, value) = line.split_once(':').expect("header line");
			(name.trim().to_ascii_lowercase(), value.trim().to_string())
		})
		.collect();

	(status, headers, body.to_string())
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
	let name = name.to_ascii_lowercase();
	headers.iter().find(|(n, _)| n == &name).map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn history_returns_ascending_rows_with_cors() {
	let store = MemoryStore::new();
	let group = store
		.create_group("General", RoomId::new("Room 1").expect("valid RoomId"))
		.expect("seed group");

	for content in ["one", "two", "three"] {
		store
			.insert_message(NewMessage {
				content: content.to_string(),
				sender_id: "alice".to_string(),
				group_id: group.id.clone(),
			})
			.await
			.expect("seed message");
	}

	let addr = start_history(store).await;

	let (status, headers, body) = http_get(addr, &format!("/messages/{}", group.id.as_str())).await;
	assert_eq!(status, 200);
	assert_eq!(header(&headers, "Access-Control-Allow-Origin"), Some("*"));
	assert_eq!(header(&headers, "Content-Type"), Some("application/json"));

	let rows: Vec<serde_json::Value> = serde_json::from_str(&body).expect("json body");
	let contents: Vec<&str> = rows.iter().map(|row| row["content"].as_str().expect("content")).collect();
	assert_eq!(contents, ["one", "two", "three"]);

	assert!(rows.iter().all(|row| row["createdAt"].is_string()));
	assert!(rows.iter().all(|row| row["senderId"] == "alice"));

	// A different, valid group id reads as empty, not as an error.
	let (status, _headers, body) = http_get(addr, "/messages/g-unknown").await;
	assert_eq!(status, 200);
	assert_eq!(body, "[]");
}

#[tokio::test]
async fn unmatched_routes_and_store_failures_map_to_http_errors() {
	let store = MemoryStore::new();
	let group = store
		.create_group("General", RoomId::new("Room 1").expect("valid RoomId"))
		.expect("seed group");
	let addr = start_history(store.clone()).await;

	let (status, headers, body) = http_get(addr, "/nope").await;
	assert_eq!((status, body.as_str()), (404, "Not Found"));
	assert_eq!(header(&headers, "Access-Control-Allow-Origin"), Some("*"));

	store.set_fail_lists(true);
	let (status, headers, body) = http_get(addr, &format!("/messages/{}", group.id.as_str())).await;
	assert_eq!((status, body.as_str()), (500, "Internal Server Error"));
	assert_eq!(header(&headers, "Access-Control-Allow-Origin"), Some("*"));
}
