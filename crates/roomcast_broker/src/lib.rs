#![forbid(unsafe_code)]

pub mod hub;

#[cfg(test)]
mod hub_tests;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::hub::Hub;

/// Accept gateway links forever, one handler task per link.
pub async fn serve(listener: TcpListener, hub: Hub) -> anyhow::Result<()> {
	let mut next_link_id: u64 = 1;

	loop {
		let (stream, remote) = listener.accept().await?;

		let link_id = next_link_id;
		next_link_id += 1;
		metrics::counter!("roomcast_broker_links_total").increment(1);

		let hub = hub.clone();
		tokio::spawn(async move {
			info!(link_id, remote = %remote, "gateway link accepted");
			if let Err(e) = handle_link(link_id, stream, hub).await {
				warn!(link_id, error = %e, "gateway link exited with error");
			}
			info!(link_id, "gateway link closed");
		});
	}
}

async fn handle_link(link_id: u64, stream: TcpStream, hub: Hub) -> anyhow::Result<()> {
	let ws = tokio_tungstenite::accept_async(stream).await.context("websocket handshake")?;
	let (mut ws_tx, mut ws_rx) = ws.split();

	let (tx, mut rx) = mpsc::channel::<Message>(hub.link_queue_capacity());
	hub.register(link_id, tx.clone()).await;
	metrics::gauge!("roomcast_broker_links").increment(1.0);

	let writer = tokio::spawn(async move {
		while let Some(message) = rx.recv().await {
			if ws_tx.send(message).await.is_err() {
				break;
			}
		}
		let _ = ws_tx.close().await;
	});

	let result = async {
		while let Some(message) = ws_rx.next().await {
			match message.context("read from gateway link")? {
				Message::Text(text) => {
					let outcome = hub.broadcast(Message::Text(text)).await;
					metrics::counter!("roomcast_broker_broadcasts_total").increment(1);

					if outcome.dropped_full > 0 {
						metrics::counter!("roomcast_broker_broadcast_drops_total").increment(outcome.dropped_full as u64);
						debug!(link_id, dropped = outcome.dropped_full, "broadcast dropped on full link queues");
					}
				}
				Message::Ping(payload) => {
					let _ = tx.try_send(Message::Pong(payload));
				}
				Message::Close(_) => break,
				// The wire protocol is JSON text; anything else is noise.
				_ => {}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	hub.unregister(link_id).await;
	metrics::gauge!("roomcast_broker_links").decrement(1.0);
	writer.abort();

	result
}
