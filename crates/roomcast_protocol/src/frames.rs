#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum accepted size of a single JSON text frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("invalid json frame: {0}")]
	Json(#[from] serde_json::Error),
}

/// Client → gateway frames, dispatched on the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
	/// `{"type":"join-room","roomId":...,"userId":...}`
	JoinRoom {
		room_id: String,
		user_id: String,
	},

	/// `{"type":"chat","content":...,"senderId":...,"groupId":...}`
	Chat {
		content: String,
		sender_id: String,
		group_id: String,
	},
}

/// Frames exchanged on the gateway↔broker link and broadcast to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BrokerFrame {
	Chat(ChatEnvelope),
}

/// Canonical chat envelope.
///
/// `id` and `created_at` come from the persistence write; `group_id` is the
/// persisted group's primary id while `room_id` is the client-facing room id
/// gateways filter on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEnvelope {
	pub id: String,
	pub content: String,
	pub sender_id: String,
	pub group_id: String,
	pub created_at: DateTime<Utc>,
	pub room_id: String,
}

/// Decode a client frame, rejecting oversized payloads before parsing.
pub fn decode_client_frame(raw: &str, max_frame_bytes: usize) -> Result<ClientFrame, FrameError> {
	if raw.len() > max_frame_bytes {
		return Err(FrameError::FrameTooLarge {
			len: raw.len(),
			max: max_frame_bytes,
		});
	}

	Ok(serde_json::from_str(raw)?)
}

/// Decode a broker frame, rejecting oversized payloads before parsing.
pub fn decode_broker_frame(raw: &str, max_frame_bytes: usize) -> Result<BrokerFrame, FrameError> {
	if raw.len() > max_frame_bytes {
		return Err(FrameError::FrameTooLarge {
			len: raw.len(),
			max: max_frame_bytes,
		});
	}

	Ok(serde_json::from_str(raw)?)
}

/// Encode an envelope as a tagged broker frame.
pub fn encode_envelope(env: &ChatEnvelope) -> Result<String, FrameError> {
	#[derive(Serialize)]
	#[serde(tag = "type", rename_all = "kebab-case")]
	enum BrokerFrameRef<'a> {
		Chat(&'a ChatEnvelope),
	}

	Ok(serde_json::to_string(&BrokerFrameRef::Chat(env))?)
}
