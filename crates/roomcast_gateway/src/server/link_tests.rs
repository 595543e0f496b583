#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use roomcast_domain::RoomId;
use roomcast_protocol::DEFAULT_MAX_FRAME_BYTES;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::server::link::{
	BoxFuture, BrokerWs, LinkConfig, LinkStatus, OutboundBuffer, WsConnector, backoff_delay, dispatch_broker_text,
	spawn_broker_link,
};
use crate::server::registry::RoomRegistry;

fn room(id: &str) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

async fn wait_for_status(rx: &mut watch::Receiver<LinkStatus>, pred: impl Fn(&LinkStatus) -> bool) -> LinkStatus {
	*timeout(Duration::from_secs(2), rx.wait_for(|s| pred(s)))
		.await
		.expect("expected status change within timeout")
		.expect("status channel open")
}

/// One-shot broker stand-in that records every text frame it is sent.
async fn spawn_sink_broker() -> (Url, mpsc::Receiver<String>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind sink broker");
	let addr = listener.local_addr().expect("local addr");
	let (tx, rx) = mpsc::channel(64);

	tokio::spawn(async move {
		let Ok((stream, _)) = listener.accept().await else {
			return;
		};
		let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
			return;
		};
		while let Some(Ok(message)) = ws.next().await {
			if let Message::Text(text) = message
				&& tx.send(text.to_string()).await.is_err()
			{
				break;
			}
		}
	});

	let url = Url::parse(&format!("ws://{addr}")).expect("sink broker url");
	(url, rx)
}

fn failing_connector(calls: Arc<AtomicU32>) -> WsConnector {
	Arc::new(move |_url: Url| {
		calls.fetch_add(1, Ordering::SeqCst);
		Box::pin(async { Err(anyhow::anyhow!("injected connect failure")) }) as BoxFuture<'static, anyhow::Result<BrokerWs>>
	})
}

fn connector_failing_first(fail_first: u32) -> WsConnector {
	let calls = Arc::new(AtomicU32::new(0));
	Arc::new(move |url: Url| {
		let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
		Box::pin(async move {
			if call <= fail_first {
				return Err(anyhow::anyhow!("injected connect failure"));
			}
			let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str()).await?;
			Ok(ws)
		}) as BoxFuture<'static, anyhow::Result<BrokerWs>>
	})
}

#[test]
fn backoff_doubles_from_min_and_clamps_at_max() {
	let min = Duration::from_millis(100);
	let max = Duration::from_secs(10);

	assert_eq!(backoff_delay(0, min, max), Duration::from_millis(100));
	assert_eq!(backoff_delay(1, min, max), Duration::from_millis(200));
	assert_eq!(backoff_delay(3, min, max), Duration::from_millis(800));
	assert_eq!(backoff_delay(6, min, max), Duration::from_millis(6400));
	assert_eq!(backoff_delay(7, min, max), max);
	assert_eq!(backoff_delay(16, min, max), max);
	// Shift saturates; huge attempt counts stay clamped.
	assert_eq!(backoff_delay(u32::MAX, min, max), max);
}

#[test]
fn buffer_evicts_oldest_first_and_keeps_order() {
	let mut buffer = OutboundBuffer::new(3);
	for payload in ["a", "b", "c", "d", "e"] {
		buffer.push(Utf8Bytes::from(payload));
	}

	assert_eq!(buffer.len(), 3);
	assert_eq!(buffer.evicted(), 2);
	assert_eq!(buffer.pop_front().as_deref(), Some("c"));
	assert_eq!(buffer.pop_front().as_deref(), Some("d"));
	assert_eq!(buffer.pop_front().as_deref(), Some("e"));
	assert_eq!(buffer.pop_front(), None);
}

#[test]
fn buffer_push_front_restores_flush_order() {
	let mut buffer = OutboundBuffer::new(4);
	buffer.push(Utf8Bytes::from("one"));
	buffer.push(Utf8Bytes::from("two"));

	let popped = buffer.pop_front().expect("non-empty");
	buffer.push_front(popped);

	assert_eq!(buffer.pop_front().as_deref(), Some("one"));
	assert_eq!(buffer.pop_front().as_deref(), Some("two"));
}

#[tokio::test]
async fn buffered_payloads_flush_in_order_after_reconnect() {
	let (url, mut received) = spawn_sink_broker().await;

	let mut cfg = LinkConfig::new(url);
	cfg.reconnect_min_delay = Duration::from_millis(10);
	cfg.reconnect_max_delay = Duration::from_millis(50);
	cfg.outbound_buffer_capacity = 8;
	cfg.ws_connector = Some(connector_failing_first(2));

	let registry = RoomRegistry::new();
	let link = spawn_broker_link(cfg, registry);
	let mut status = link.status();

	// Sent while the link is still failing to connect.
	assert!(link.forward("one"));
	assert!(link.forward("two"));
	assert!(link.forward("three"));

	wait_for_status(&mut status, |s| *s == LinkStatus::Connected).await;

	for expected in ["one", "two", "three"] {
		let got = timeout(Duration::from_secs(1), received.recv())
			.await
			.expect("expected flushed payload within timeout")
			.expect("sink broker open");
		assert_eq!(got, expected);
	}

	// Live traffic after the flush keeps flowing in order.
	assert!(link.forward("four"));
	let got = timeout(Duration::from_secs(1), received.recv())
		.await
		.expect("expected live payload within timeout")
		.expect("sink broker open");
	assert_eq!(got, "four");
}

#[tokio::test]
async fn exhausted_after_bounded_attempts_and_forward_fails() {
	let calls = Arc::new(AtomicU32::new(0));

	let mut cfg = LinkConfig::new(Url::parse("ws://127.0.0.1:9").expect("url"));
	cfg.reconnect_min_delay = Duration::from_millis(5);
	cfg.reconnect_max_delay = Duration::from_millis(20);
	cfg.max_reconnect_attempts = Some(2);
	cfg.ws_connector = Some(failing_connector(Arc::clone(&calls)));

	let link = spawn_broker_link(cfg, RoomRegistry::new());
	let mut status = link.status();

	wait_for_status(&mut status, |s| *s == LinkStatus::Exhausted).await;
	assert_eq!(calls.load(Ordering::SeqCst), 2);

	// The link task is gone; the conduit rejects further payloads.
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert!(!link.forward("too late"));
}

#[tokio::test]
async fn dispatch_delivers_the_raw_text_verbatim() {
	let registry = RoomRegistry::new();
	let (tx, mut rx) = mpsc::channel(4);
	registry.join(room("Room 1"), 1, tx).await;

	// Extra field and spacing prove the bytes are not re-encoded.
	let raw = Utf8Bytes::from(
		"{\"type\":\"chat\", \"id\":\"m-1\",\"content\":\"Hello there\",\"senderId\":\"alice\",\
		\"groupId\":\"g-1\",\"createdAt\":\"2026-08-22T10:00:00Z\",\"roomId\":\"Room 1\",\"extra\":42}",
	);
	dispatch_broker_text(&registry, &raw, DEFAULT_MAX_FRAME_BYTES).await;

	let message = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected delivery within timeout")
		.expect("channel open");
	match message {
		Message::Text(text) => assert_eq!(text, raw),
		other => panic!("expected Text message, got: {other:?}"),
	}
}

#[tokio::test]
async fn dispatch_drops_malformed_and_foreign_room_broadcasts() {
	let registry = RoomRegistry::new();
	let (tx, mut rx) = mpsc::channel(4);
	registry.join(room("Room 1"), 1, tx).await;

	dispatch_broker_text(&registry, &Utf8Bytes::from("not json"), DEFAULT_MAX_FRAME_BYTES).await;
	dispatch_broker_text(&registry, &Utf8Bytes::from("{\"type\":\"nope\"}"), DEFAULT_MAX_FRAME_BYTES).await;

	let foreign = Utf8Bytes::from(
		"{\"type\":\"chat\",\"id\":\"m-2\",\"content\":\"hi\",\"senderId\":\"bob\",\
		\"groupId\":\"g-2\",\"createdAt\":\"2026-08-22T10:00:00Z\",\"roomId\":\"Room 2\"}",
	);
	dispatch_broker_text(&registry, &foreign, DEFAULT_MAX_FRAME_BYTES).await;

	let got_unexpected = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(got_unexpected.is_err(), "member received a broadcast it should not have");
}

#[tokio::test]
async fn dispatch_drops_oversized_broadcasts() {
	let registry = RoomRegistry::new();
	let (tx, mut rx) = mpsc::channel(4);
	registry.join(room("Room 1"), 1, tx).await;

	let valid = Utf8Bytes::from(
		"{\"type\":\"chat\",\"id\":\"m-3\",\"content\":\"hi\",\"senderId\":\"bob\",\
		\"groupId\":\"g-1\",\"createdAt\":\"2026-08-22T10:00:00Z\",\"roomId\":\"Room 1\"}",
	);
	// Budget of 4 bytes (2 * 2) rejects it before parsing.
	dispatch_broker_text(&registry, &valid, 2).await;

	let got_unexpected = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(got_unexpected.is_err(), "oversized broadcast was delivered");
}
