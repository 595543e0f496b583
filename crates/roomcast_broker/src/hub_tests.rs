#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::hub::{BroadcastOutcome, Hub, HubConfig};

fn hub(capacity: usize) -> Hub {
	Hub::new(HubConfig {
		link_queue_capacity: capacity,
		debug_logs: false,
	})
}

async fn recv_text(rx: &mut mpsc::Receiver<Message>) -> String {
	let message = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open");

	match message {
		Message::Text(text) => text.to_string(),
		other => panic!("expected Text message, got: {other:?}"),
	}
}

#[tokio::test]
async fn broadcast_reaches_every_link_including_the_originator() {
	let hub = hub(16);

	let (tx_a, mut rx_a) = mpsc::channel(16);
	let (tx_b, mut rx_b) = mpsc::channel(16);
	let (tx_c, mut rx_c) = mpsc::channel(16);
	hub.register(1, tx_a).await;
	hub.register(2, tx_b).await;
	hub.register(3, tx_c).await;

	// Link 1 is the originator; it still gets the copy back.
	let outcome = hub.broadcast(Message::text("payload")).await;
	assert_eq!(
		outcome,
		BroadcastOutcome {
			delivered: 3,
			dropped_full: 0,
			dropped_closed: 0,
		}
	);

	assert_eq!(recv_text(&mut rx_a).await, "payload");
	assert_eq!(recv_text(&mut rx_b).await, "payload");
	assert_eq!(recv_text(&mut rx_c).await, "payload");
}

#[tokio::test]
async fn full_link_queue_drops_without_blocking_the_rest() {
	let hub = hub(1);

	let (tx_slow, mut rx_slow) = mpsc::channel(1);
	let (tx_ok, mut rx_ok) = mpsc::channel(16);
	hub.register(1, tx_slow).await;
	hub.register(2, tx_ok).await;

	let first = hub.broadcast(Message::text("one")).await;
	assert_eq!(first.delivered, 2);

	// Slow link never drained; its queue of one is now full.
	let second = hub.broadcast(Message::text("two")).await;
	assert_eq!(second.delivered, 1);
	assert_eq!(second.dropped_full, 1);

	assert_eq!(recv_text(&mut rx_slow).await, "one");
	let starved = timeout(Duration::from_millis(50), rx_slow.recv()).await;
	assert!(starved.is_err(), "slow link unexpectedly received the dropped message");

	assert_eq!(recv_text(&mut rx_ok).await, "one");
	assert_eq!(recv_text(&mut rx_ok).await, "two");
}

#[tokio::test]
async fn unregister_stops_delivery_to_that_link() {
	let hub = hub(16);

	let (tx_a, mut rx_a) = mpsc::channel(16);
	let (tx_b, mut rx_b) = mpsc::channel(16);
	hub.register(1, tx_a).await;
	hub.register(2, tx_b).await;
	assert_eq!(hub.link_count().await, 2);

	hub.unregister(1).await;
	assert_eq!(hub.link_count().await, 1);

	let outcome = hub.broadcast(Message::text("after")).await;
	assert_eq!(outcome.delivered, 1);

	let gone = timeout(Duration::from_millis(50), rx_a.recv()).await;
	assert!(gone.is_err() || gone.unwrap().is_none(), "unregistered link received a broadcast");
	assert_eq!(recv_text(&mut rx_b).await, "after");
}

#[tokio::test]
async fn closed_receiver_counts_as_dropped_closed() {
	let hub = hub(16);

	let (tx_a, rx_a) = mpsc::channel(16);
	let (tx_b, mut rx_b) = mpsc::channel(16);
	hub.register(1, tx_a).await;
	hub.register(2, tx_b).await;
	drop(rx_a);

	let outcome = hub.broadcast(Message::text("still-going")).await;
	assert_eq!(outcome.delivered, 1);
	assert_eq!(outcome.dropped_closed, 1);
	assert_eq!(recv_text(&mut rx_b).await, "still-going");
}
