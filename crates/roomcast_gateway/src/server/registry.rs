#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use roomcast_domain::RoomId;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

/// Local room membership for one gateway instance. Constructed in `main`
/// and cloned into every handler; there is no process-global registry.
///
/// The outer map is guarded by one mutex; each room entry owns its member
/// map behind its own mutex, so mutation and delivery are serialized per
/// room. Membership changes (`join`, `leave_all`) keep the outer lock for
/// their whole critical section; `deliver` only touches it to grab the
/// entry.
#[derive(Clone, Default)]
pub struct RoomRegistry {
	inner: Arc<Mutex<Inner>>,
}

/// Per-delivery accounting. Closed and full members are skipped for that
/// message but stay registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
	pub delivered: usize,
	pub dropped_full: usize,
	pub dropped_closed: usize,
}

#[derive(Default)]
struct Inner {
	rooms: HashMap<RoomId, Arc<Mutex<RoomEntry>>>,

	/// Reverse index for exhaustive disconnect cleanup.
	rooms_by_conn: HashMap<u64, HashSet<RoomId>>,
}

#[derive(Default)]
struct RoomEntry {
	members: HashMap<u64, mpsc::Sender<Message>>,
}

impl RoomRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add a connection to a room, creating the room lazily. Re-joining
	/// replaces the stored sender and reports `false`.
	pub async fn join(&self, room: RoomId, conn_id: u64, tx: mpsc::Sender<Message>) -> bool {
		let mut inner = self.inner.lock().await;
		let entry = Arc::clone(inner.rooms.entry(room.clone()).or_default());
		inner.rooms_by_conn.entry(conn_id).or_default().insert(room);

		let mut entry = entry.lock().await;
		entry.members.insert(conn_id, tx).is_none()
	}

	/// Fan a message out to the members of one room. An unknown room is
	/// the expected filtering outcome, not an error.
	pub async fn deliver(&self, room: &RoomId, message: &Message) -> DeliveryOutcome {
		let entry = {
			let inner = self.inner.lock().await;
			match inner.rooms.get(room) {
				Some(entry) => Arc::clone(entry),
				None => return DeliveryOutcome::default(),
			}
		};

		let entry = entry.lock().await;
		let mut outcome = DeliveryOutcome::default();
		for (conn_id, tx) in entry.members.iter() {
			match tx.try_send(message.clone()) {
				Ok(()) => outcome.delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => {
					outcome.dropped_full += 1;
					debug!(conn_id, room = %room, "registry: dropped due to full member queue");
				}
				Err(mpsc::error::TrySendError::Closed(_)) => outcome.dropped_closed += 1,
			}
		}

		outcome
	}

	/// Remove a connection from every room it joined, deleting rooms that
	/// become empty. Returns the rooms it was removed from.
	pub async fn leave_all(&self, conn_id: u64) -> Vec<RoomId> {
		let mut inner = self.inner.lock().await;
		let Some(rooms) = inner.rooms_by_conn.remove(&conn_id) else {
			return Vec::new();
		};

		let mut left = Vec::with_capacity(rooms.len());
		for room in rooms {
			let Some(entry) = inner.rooms.get(&room).map(Arc::clone) else {
				continue;
			};

			let now_empty = {
				let mut entry = entry.lock().await;
				entry.members.remove(&conn_id);
				entry.members.is_empty()
			};

			if now_empty {
				inner.rooms.remove(&room);
			}

			left.push(room);
		}

		left
	}

	pub async fn member_count(&self, room: &RoomId) -> usize {
		let entry = {
			let inner = self.inner.lock().await;
			match inner.rooms.get(room) {
				Some(entry) => Arc::clone(entry),
				None => return 0,
			}
		};

		let entry = entry.lock().await;
		entry.members.len()
	}

	pub async fn room_count(&self) -> usize {
		self.inner.lock().await.rooms.len()
	}
}
