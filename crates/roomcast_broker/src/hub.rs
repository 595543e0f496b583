#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

/// Fan-out hub over the connected gateway links. The broker never parses
/// payloads or tracks rooms; every broadcast goes to every link, the
/// originator included.
#[derive(Clone)]
pub struct Hub {
	inner: Arc<Mutex<Inner>>,
	cfg: HubConfig,
}

/// Configuration for `Hub`.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Maximum number of queued messages per gateway link.
	pub link_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			link_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Per-broadcast delivery accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
	pub delivered: usize,
	pub dropped_full: usize,
	pub dropped_closed: usize,
}

#[derive(Default)]
struct Inner {
	links: HashMap<u64, mpsc::Sender<Message>>,
}

impl Hub {
	pub fn new(cfg: HubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	pub fn link_queue_capacity(&self) -> usize {
		self.cfg.link_queue_capacity
	}

	/// Register a gateway link's outbound sender.
	pub async fn register(&self, link_id: u64, tx: mpsc::Sender<Message>) {
		let mut inner = self.inner.lock().await;
		inner.links.insert(link_id, tx);

		if self.cfg.debug_logs {
			debug!(link_id, links = inner.links.len(), "hub: link registered");
		}
	}

	/// Drop a link. Safe to call for an id that was never registered.
	pub async fn unregister(&self, link_id: u64) {
		let mut inner = self.inner.lock().await;
		inner.links.remove(&link_id);

		if self.cfg.debug_logs {
			debug!(link_id, links = inner.links.len(), "hub: link unregistered");
		}
	}

	/// Rebroadcast one message to every registered link. The sender
	/// snapshot is taken under the lock and released before delivery, so
	/// register/unregister never wait on a slow fan-out. A full or closed
	/// link queue skips that link for this message only.
	pub async fn broadcast(&self, message: Message) -> BroadcastOutcome {
		let senders: Vec<(u64, mpsc::Sender<Message>)> = {
			let inner = self.inner.lock().await;
			inner.links.iter().map(|(id, tx)| (*id, tx.clone())).collect()
		};

		let mut outcome = BroadcastOutcome::default();
		for (link_id, tx) in senders {
			match tx.try_send(message.clone()) {
				Ok(()) => outcome.delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => {
					outcome.dropped_full += 1;

					if self.cfg.debug_logs {
						debug!(link_id, "hub: dropped due to full link queue");
					}
				}
				Err(mpsc::error::TrySendError::Closed(_)) => outcome.dropped_closed += 1,
			}
		}

		outcome
	}

	pub async fn link_count(&self) -> usize {
		self.inner.lock().await.links.len()
	}
}
