#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use parking_lot::Mutex;
use roomcast_domain::{GroupId, MessageId, RoomId};
use uuid::Uuid;

use crate::{GroupDirectory, GroupRecord, MessageStore, NewMessage, StoredMessage};

/// In-process store for dev mode and tests. Groups are seeded up front;
/// lookup and insert failures can be injected per instance.
#[derive(Clone, Default)]
pub struct MemoryStore {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
	groups: Vec<GroupRecord>,
	messages: Vec<StoredMessage>,
	fail_lookups: bool,
	fail_inserts: bool,
	fail_lists: bool,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed a group, assigning its primary id.
	pub fn create_group(&self, name: impl Into<String>, room_id: RoomId) -> anyhow::Result<GroupRecord> {
		let record = GroupRecord {
			id: GroupId::new(Uuid::new_v4().to_string())?,
			name: name.into(),
			room_id,
		};
		self.inner.lock().groups.push(record.clone());
		Ok(record)
	}

	pub fn set_fail_lookups(&self, fail: bool) {
		self.inner.lock().fail_lookups = fail;
	}

	pub fn set_fail_inserts(&self, fail: bool) {
		self.inner.lock().fail_inserts = fail;
	}

	pub fn set_fail_lists(&self, fail: bool) {
		self.inner.lock().fail_lists = fail;
	}

	pub fn message_count(&self) -> usize {
		self.inner.lock().messages.len()
	}
}

#[async_trait::async_trait]
impl GroupDirectory for MemoryStore {
	async fn find_by_room_id(&self, room_id: &RoomId) -> anyhow::Result<Option<GroupRecord>> {
		let inner = self.inner.lock();
		if inner.fail_lookups {
			return Err(anyhow!("injected directory failure"));
		}
		Ok(inner.groups.iter().find(|g| &g.room_id == room_id).cloned())
	}
}

#[async_trait::async_trait]
impl MessageStore for MemoryStore {
	async fn insert_message(&self, message: NewMessage) -> anyhow::Result<StoredMessage> {
		let stored = StoredMessage {
			id: MessageId::new(Uuid::new_v4().to_string())?,
			content: message.content,
			sender_id: message.sender_id,
			group_id: message.group_id,
			created_at: Utc::now(),
		};

		let mut inner = self.inner.lock();
		if inner.fail_inserts {
			return Err(anyhow!("injected insert failure"));
		}
		inner.messages.push(stored.clone());
		Ok(stored)
	}

	async fn list_messages(&self, group_id: &GroupId) -> anyhow::Result<Vec<StoredMessage>> {
		let inner = self.inner.lock();
		if inner.fail_lists {
			return Err(anyhow!("injected list failure"));
		}
		let mut rows: Vec<StoredMessage> = inner.messages.iter().filter(|m| &m.group_id == group_id).cloned().collect();
		// Stable, so same-instant rows keep insertion order.
		rows.sort_by_key(|m| m.created_at);
		Ok(rows)
	}
}
