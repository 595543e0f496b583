#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use roomcast_protocol::{BrokerFrame, decode_broker_frame};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::server::registry::RoomRegistry;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub(crate) type BrokerWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub(crate) type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<BrokerWs>> + Send + Sync>;

/// Configuration for the gateway's broker link.
#[derive(Clone)]
pub struct LinkConfig {
	pub broker_url: Url,

	/// Reconnect backoff bounds.
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,

	/// Give up after this many consecutive failed connect attempts.
	/// `None` retries forever; the delay stays bounded either way.
	pub max_reconnect_attempts: Option<u32>,

	/// Capacity of the drop-oldest buffer holding outbound payloads while
	/// the link is down.
	pub outbound_buffer_capacity: usize,

	/// Upper bound applied to inbound broker frames.
	pub max_frame_bytes: usize,

	/// Test hook: replaces the real websocket connect.
	pub ws_connector: Option<WsConnector>,
}

impl LinkConfig {
	pub fn new(broker_url: Url) -> Self {
		Self {
			broker_url,
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			max_reconnect_attempts: None,
			outbound_buffer_capacity: 256,
			max_frame_bytes: roomcast_protocol::DEFAULT_MAX_FRAME_BYTES,
			ws_connector: None,
		}
	}
}

/// Observable link state, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
	Connecting,
	Connected,
	Reconnecting { attempt: u32 },
	Exhausted,
}

/// Cheap handle cloned into connection handlers. Forwarding never blocks;
/// a full conduit counts a drop.
#[derive(Clone)]
pub struct LinkHandle {
	outbound_tx: mpsc::Sender<Utf8Bytes>,
	status_rx: watch::Receiver<LinkStatus>,
}

impl LinkHandle {
	pub fn forward(&self, payload: impl Into<Utf8Bytes>) -> bool {
		match self.outbound_tx.try_send(payload.into()) {
			Ok(()) => true,
			Err(e) => {
				metrics::counter!("roomcast_gateway_link_forward_drops_total").increment(1);
				let reason = match e {
					mpsc::error::TrySendError::Full(_) => "full",
					mpsc::error::TrySendError::Closed(_) => "closed",
				};
				debug!(reason, "link conduit rejected payload");
				false
			}
		}
	}

	pub fn status(&self) -> watch::Receiver<LinkStatus> {
		self.status_rx.clone()
	}
}

/// Start the link task and hand back its forwarding handle.
pub fn spawn_broker_link(cfg: LinkConfig, registry: RoomRegistry) -> LinkHandle {
	let (outbound_tx, outbound_rx) = mpsc::channel(cfg.outbound_buffer_capacity);
	let (status_tx, status_rx) = watch::channel(LinkStatus::Connecting);

	tokio::spawn(run_link(cfg, registry, outbound_rx, status_tx));

	LinkHandle { outbound_tx, status_rx }
}

/// Conduit-only handle for tests that drive the pipeline directly.
#[cfg(test)]
pub(crate) fn test_link(capacity: usize) -> (LinkHandle, mpsc::Receiver<Utf8Bytes>) {
	let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
	let (_status_tx, status_rx) = watch::channel(LinkStatus::Connected);
	(LinkHandle { outbound_tx, status_rx }, outbound_rx)
}

async fn run_link(
	cfg: LinkConfig,
	registry: RoomRegistry,
	mut outbound_rx: mpsc::Receiver<Utf8Bytes>,
	status_tx: watch::Sender<LinkStatus>,
) {
	let connector = ws_connector(&cfg);
	let mut buffer = OutboundBuffer::new(cfg.outbound_buffer_capacity);
	let mut attempt: u32 = 0;
	let mut ever_connected = false;

	'outer: loop {
		if attempt == 0 && !ever_connected {
			status_tx.send_replace(LinkStatus::Connecting);
		} else {
			status_tx.send_replace(LinkStatus::Reconnecting { attempt });
		}

		let delay = if attempt == 0 {
			Duration::from_millis(0)
		} else {
			backoff_delay(attempt, cfg.reconnect_min_delay, cfg.reconnect_max_delay)
		};

		if delay > Duration::from_millis(0) {
			info!(delay_ms = delay.as_millis() as u64, attempt, "broker link: reconnecting after delay");
			if !park_and_spool(delay, &mut outbound_rx, &mut buffer).await {
				return;
			}
		}

		let mut ws = match (connector)(cfg.broker_url.clone()).await {
			Ok(ws) => ws,
			Err(e) => {
				attempt = attempt.saturating_add(1);
				warn!(error = %e, attempt, "broker link: connect failed");

				if cfg.max_reconnect_attempts.is_some_and(|max| attempt >= max) {
					warn!(attempt, "broker link: reconnect attempts exhausted");
					status_tx.send_replace(LinkStatus::Exhausted);
					return;
				}

				continue;
			}
		};

		attempt = 0;
		ever_connected = true;
		status_tx.send_replace(LinkStatus::Connected);
		info!(broker = %cfg.broker_url, "broker link: connected");

		if !flush_buffer(&mut ws, &mut buffer).await {
			continue;
		}

		loop {
			tokio::select! {
				payload = outbound_rx.recv() => {
					let Some(payload) = payload else {
						info!("broker link: all senders gone, shutting down");
						let _ = ws.close(None).await;
						return;
					};

					if let Err(e) = ws.send(Message::Text(payload.clone())).await {
						warn!(error = %e, "broker link: send failed, payload buffered for reconnect");
						buffer.push(payload);
						continue 'outer;
					}
				}

				incoming = ws.next() => {
					let Some(incoming) = incoming else {
						warn!("broker link: connection closed by broker");
						continue 'outer;
					};

					match incoming {
						Ok(Message::Text(text)) => dispatch_broker_text(&registry, &text, cfg.max_frame_bytes).await,
						Ok(Message::Ping(payload)) => {
							if ws.send(Message::Pong(payload)).await.is_err() {
								continue 'outer;
							}
						}
						Ok(Message::Close(_)) => {
							warn!("broker link: close frame from broker");
							continue 'outer;
						}
						Ok(_) => {}
						Err(e) => {
							warn!(error = %e, "broker link: read failed");
							continue 'outer;
						}
					}
				}
			}
		}
	}
}

/// Wait out the backoff delay while spooling outbound payloads into the
/// drop-oldest buffer. Returns false when every handle is gone.
async fn park_and_spool(delay: Duration, outbound_rx: &mut mpsc::Receiver<Utf8Bytes>, buffer: &mut OutboundBuffer) -> bool {
	let deadline = tokio::time::Instant::now() + delay;

	loop {
		tokio::select! {
			_ = tokio::time::sleep_until(deadline) => return true,
			payload = outbound_rx.recv() => {
				let Some(payload) = payload else {
					return false;
				};
				buffer.push(payload);
			}
		}
	}
}

/// Replay buffered payloads in arrival order. On failure the unsent
/// remainder stays buffered and the caller reconnects.
async fn flush_buffer(ws: &mut BrokerWs, buffer: &mut OutboundBuffer) -> bool {
	let backlog = buffer.len();
	if backlog > 0 {
		info!(backlog, evicted = buffer.evicted(), "broker link: flushing buffered payloads");
	}

	while let Some(payload) = buffer.pop_front() {
		if let Err(e) = ws.send(Message::Text(payload.clone())).await {
			warn!(error = %e, remaining = buffer.len() + 1, "broker link: flush interrupted");
			buffer.push_front(payload);
			return false;
		}
	}

	true
}

/// Route one broker broadcast to local members. The received text goes out
/// verbatim; parsing only determines the room.
pub(crate) async fn dispatch_broker_text(registry: &RoomRegistry, text: &Utf8Bytes, max_frame_bytes: usize) {
	metrics::counter!("roomcast_gateway_broker_frames_total").increment(1);

	// Envelopes outgrow client frames by a bounded margin.
	let frame = match decode_broker_frame(text.as_str(), max_frame_bytes.saturating_mul(2)) {
		Ok(frame) => frame,
		Err(e) => {
			metrics::counter!("roomcast_gateway_broker_frames_malformed_total").increment(1);
			debug!(error = %e, "broker link: malformed broadcast dropped");
			return;
		}
	};

	let BrokerFrame::Chat(envelope) = frame;
	let room = match envelope.room_id.parse() {
		Ok(room) => room,
		Err(_) => {
			metrics::counter!("roomcast_gateway_broker_frames_malformed_total").increment(1);
			debug!("broker link: broadcast without a usable roomId dropped");
			return;
		}
	};

	let outcome = registry.deliver(&room, &Message::Text(text.clone())).await;
	metrics::counter!("roomcast_gateway_fanout_deliveries_total").increment(outcome.delivered as u64);

	if outcome.delivered == 0 && outcome.dropped_full == 0 && outcome.dropped_closed == 0 {
		debug!(room = %room, "broker link: no local members for broadcast");
	}
}

fn ws_connector(cfg: &LinkConfig) -> WsConnector {
	if let Some(c) = &cfg.ws_connector {
		return c.clone();
	}

	Arc::new(|url: Url| Box::pin(async move { connect_broker_ws(url).await }) as BoxFuture<'static, anyhow::Result<BrokerWs>>)
}

async fn connect_broker_ws(url: Url) -> anyhow::Result<BrokerWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to broker")?;
	Ok(ws)
}

pub(crate) fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

/// Bounded queue that evicts its oldest entry on overflow.
pub(crate) struct OutboundBuffer {
	queue: VecDeque<Utf8Bytes>,
	capacity: usize,
	evicted: u64,
}

impl OutboundBuffer {
	pub(crate) fn new(capacity: usize) -> Self {
		Self {
			queue: VecDeque::with_capacity(capacity),
			capacity: capacity.max(1),
			evicted: 0,
		}
	}

	pub(crate) fn push(&mut self, payload: Utf8Bytes) {
		if self.queue.len() == self.capacity {
			self.queue.pop_front();
			self.evicted += 1;
			metrics::counter!("roomcast_gateway_link_evictions_total").increment(1);
			debug!(total_evicted = self.evicted, "broker link: buffer full, oldest payload evicted");
		}

		self.queue.push_back(payload);
	}

	pub(crate) fn push_front(&mut self, payload: Utf8Bytes) {
		self.queue.push_front(payload);
	}

	pub(crate) fn pop_front(&mut self) -> Option<Utf8Bytes> {
		self.queue.pop_front()
	}

	pub(crate) fn len(&self) -> usize {
		self.queue.len()
	}

	pub(crate) fn evicted(&self) -> u64 {
		self.evicted
	}
}
