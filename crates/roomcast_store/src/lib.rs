#![forbid(unsafe_code)]

pub mod memory;
pub mod sql;

use chrono::{DateTime, Utc};
use roomcast_domain::{GroupId, MessageId, RoomId};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use sql::SqlStore;

/// Directory row for a chat group. `id` is the primary key referenced by
/// stored messages; `room_id` is the name clients join and address chats to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
	pub id: GroupId,
	pub name: String,
	pub room_id: RoomId,
}

/// Message as submitted for persistence. The store assigns the id and
/// timestamp; `sender_id` is stored as received, unvalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
	pub content: String,
	pub sender_id: String,
	pub group_id: GroupId,
}

/// Persisted message row, the authority for `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
	pub id: MessageId,
	pub content: String,
	pub sender_id: String,
	pub group_id: GroupId,
	pub created_at: DateTime<Utc>,
}

/// Lookup of group records by the room id clients address.
#[async_trait::async_trait]
pub trait GroupDirectory: Send + Sync + 'static {
	async fn find_by_room_id(&self, room_id: &RoomId) -> anyhow::Result<Option<GroupRecord>>;
}

/// Durable message storage. A successful insert is immediately visible
/// to `list_messages`.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync + 'static {
	/// Persist a message, assigning its id and timestamp.
	async fn insert_message(&self, message: NewMessage) -> anyhow::Result<StoredMessage>;

	/// All messages for a group, ascending by `created_at`.
	async fn list_messages(&self, group_id: &GroupId) -> anyhow::Result<Vec<StoredMessage>>;
}

#[cfg(test)]
mod tests {
	use chrono::TimeZone;

	use super::*;

	#[test]
	fn stored_message_serializes_with_wire_field_names() {
		let message = StoredMessage {
			id: MessageId::new("m-1").unwrap(),
			content: "Hello there".to_string(),
			sender_id: "alice".to_string(),
			group_id: GroupId::new("g-1").unwrap(),
			created_at: Utc.with_ymd_and_hms(2026, 8, 22, 10, 0, 0).unwrap(),
		};

		let value: serde_json::Value = serde_json::to_value(&message).unwrap();
		let object = value.as_object().unwrap();
		let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
		keys.sort_unstable();
		assert_eq!(keys, ["content", "createdAt", "groupId", "id", "senderId"]);
		assert_eq!(object["createdAt"], "2026-08-22T10:00:00Z");
	}
}
