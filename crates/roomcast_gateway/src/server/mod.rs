#![forbid(unsafe_code)]

pub mod connection;
pub mod history;
pub mod link;
pub mod registry;

#[cfg(test)]
mod link_tests;

use std::sync::Arc;

use roomcast_store::{GroupDirectory, MessageStore};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::link::LinkHandle;
use crate::server::registry::RoomRegistry;

/// Everything a connection handler needs, cloned once per connection.
/// Built in `main`; nothing in here is process-global.
#[derive(Clone)]
pub struct GatewayContext {
	pub registry: RoomRegistry,
	pub directory: Arc<dyn GroupDirectory>,
	pub store: Arc<dyn MessageStore>,
	pub link: LinkHandle,

	/// Capacity of each connection's outbound queue.
	pub outbound_queue_capacity: usize,
	pub max_frame_bytes: usize,
}

/// Accept client connections forever, one handler task per connection.
pub async fn serve(listener: TcpListener, ctx: GatewayContext) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = listener.accept().await?;

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("roomcast_gateway_connections_total").increment(1);

		let ctx = ctx.clone();
		tokio::spawn(async move {
			info!(conn_id, remote = %remote, "client connected");
			if let Err(e) = connection::handle_connection(conn_id, stream, ctx).await {
				warn!(conn_id, error = %e, "client connection exited with error");
			}
			info!(conn_id, "client disconnected");
		});
	}
}
