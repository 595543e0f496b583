#![forbid(unsafe_code)]

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use roomcast_domain::{RoomId, UserId};
use roomcast_protocol::{ChatEnvelope, ClientFrame, decode_client_frame, encode_envelope};
use roomcast_store::NewMessage;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::server::GatewayContext;

/// Drive one client websocket until it closes, then scrub the connection
/// from every room it joined.
pub(crate) async fn handle_connection(conn_id: u64, stream: TcpStream, ctx: GatewayContext) -> anyhow::Result<()> {
	let ws = tokio_tungstenite::accept_async(stream).await.context("websocket handshake")?;
	let (mut ws_tx, mut ws_rx) = ws.split();

	metrics::gauge!("roomcast_gateway_connections").increment(1.0);

	// Fan-out and handler replies go through this queue; the writer task
	// is the only place the socket is written.
	let (tx, mut rx) = mpsc::channel::<Message>(ctx.outbound_queue_capacity);
	let writer = tokio::spawn(async move {
		while let Some(message) = rx.recv().await {
			if ws_tx.send(message).await.is_err() {
				break;
			}
		}
		let _ = ws_tx.close().await;
	});

	while let Some(incoming) = ws_rx.next().await {
		match incoming {
			Ok(Message::Text(text)) => handle_client_text(conn_id, text.as_str(), &tx, &ctx).await,
			Ok(Message::Ping(payload)) => {
				let _ = tx.try_send(Message::Pong(payload));
			}
			Ok(Message::Close(_)) => break,
			Ok(_) => {}
			Err(e) => {
				debug!(conn_id, error = %e, "client read failed");
				break;
			}
		}
	}

	let left = ctx.registry.leave_all(conn_id).await;
	if !left.is_empty() {
		info!(conn_id, rooms = left.len(), "connection scrubbed from rooms");
	}

	metrics::gauge!("roomcast_gateway_connections").decrement(1.0);
	writer.abort();
	Ok(())
}

/// One inbound text frame. Malformed input is dropped without a reply;
/// chat work runs on its own task so a slow store call never stalls this
/// connection's reads.
pub(crate) async fn handle_client_text(conn_id: u64, raw: &str, tx: &mpsc::Sender<Message>, ctx: &GatewayContext) {
	let frame = match decode_client_frame(raw, ctx.max_frame_bytes) {
		Ok(frame) => frame,
		Err(e) => {
			metrics::counter!("roomcast_gateway_client_frames_malformed_total").increment(1);
			debug!(conn_id, error = %e, "malformed client frame dropped");
			return;
		}
	};

	match frame {
		ClientFrame::JoinRoom { room_id, user_id } => {
			let (Ok(room), Ok(user)) = (RoomId::new(room_id), UserId::new(user_id)) else {
				debug!(conn_id, "join-room with empty ids dropped");
				return;
			};

			if ctx.registry.join(room.clone(), conn_id, tx.clone()).await {
				metrics::counter!("roomcast_gateway_joins_total").increment(1);
				info!(conn_id, room = %room, user = %user, "joined room");
			} else {
				debug!(conn_id, room = %room, "repeat join, membership unchanged");
			}
		}
		ClientFrame::Chat { content, sender_id, group_id } => {
			metrics::counter!("roomcast_gateway_chats_total").increment(1);
			let ctx = ctx.clone();
			tokio::spawn(async move {
				handle_chat(ctx, content, sender_id, group_id).await;
			});
		}
	}
}

/// The chat pipeline: resolve the group, persist, forward to the broker.
/// Each step gates the next; any failure drops the message and nothing
/// reaches the broker. The sender gets no acknowledgment either way.
async fn handle_chat(ctx: GatewayContext, content: String, sender_id: String, group_id: String) {
	// Clients address chats by room id; the owning group record holds the
	// primary id the stored rows and envelope carry.
	let room = match RoomId::new(group_id) {
		Ok(room) => room,
		Err(_) => {
			metrics::counter!("roomcast_gateway_chats_dropped_total").increment(1);
			warn!("chat with an empty groupId dropped");
			return;
		}
	};

	let group = match ctx.directory.find_by_room_id(&room).await {
		Ok(Some(group)) => group,
		Ok(None) => {
			metrics::counter!("roomcast_gateway_chats_dropped_total").increment(1);
			warn!(room = %room, "chat for unknown group dropped");
			return;
		}
		Err(e) => {
			metrics::counter!("roomcast_gateway_chats_dropped_total").increment(1);
			warn!(room = %room, error = %e, "group lookup failed, chat dropped");
			return;
		}
	};

	let new_message = NewMessage {
		content,
		sender_id,
		group_id: group.id,
	};
	let stored = match ctx.store.insert_message(new_message).await {
		Ok(stored) => stored,
		Err(e) => {
			metrics::counter!("roomcast_gateway_chats_dropped_total").increment(1);
			warn!(room = %room, error = %e, "message insert failed, chat dropped");
			return;
		}
	};

	let envelope = ChatEnvelope {
		id: stored.id.into_string(),
		content: stored.content,
		sender_id: stored.sender_id,
		group_id: stored.group_id.into_string(),
		created_at: stored.created_at,
		room_id: room.into_string(),
	};

	let encoded = match encode_envelope(&envelope) {
		Ok(encoded) => encoded,
		Err(e) => {
			metrics::counter!("roomcast_gateway_chats_dropped_total").increment(1);
			warn!(error = %e, "envelope encode failed, chat dropped");
			return;
		}
	};

	if !ctx.link.forward(encoded) {
		metrics::counter!("roomcast_gateway_chats_dropped_total").increment(1);
		warn!("broker link rejected envelope");
	}
}
