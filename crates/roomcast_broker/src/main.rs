#![forbid(unsafe_code)]

use std::net::SocketAddr;

use anyhow::Context;
use roomcast_broker::hub::{Hub, HubConfig};
use roomcast_broker::serve;
use roomcast_util::endpoint::WsEndpoint;
use roomcast_util::health::{HealthState, spawn_health_server};
use tokio::net::TcpListener;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: roomcast_broker [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: ws://127.0.0.1:3001)\n\
\t         Format: ws://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn env_nonempty(key: &str) -> Option<String> {
	std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = env_nonempty("ROOMCAST_BROKER_BIND").unwrap_or_else(|| "ws://127.0.0.1:3001".to_string());

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = WsEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,roomcast_broker=debug".to_string());

	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
		.with_target(false)
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	init_metrics(env_nonempty("ROOMCAST_BROKER_METRICS_BIND").as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = env_nonempty("ROOMCAST_BROKER_HEALTH_BIND") {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let mut hub_cfg = HubConfig::default();
	if let Some(raw) = env_nonempty("ROOMCAST_BROKER_LINK_QUEUE_CAPACITY") {
		match raw.parse::<usize>() {
			Ok(v) if v > 0 => hub_cfg.link_queue_capacity = v,
			_ => warn!(value = %raw, "invalid ROOMCAST_BROKER_LINK_QUEUE_CAPACITY (expected positive integer)"),
		}
	}

	let hub = Hub::new(hub_cfg);

	let listener = TcpListener::bind(bind_addr).await.context("bind broker listener")?;
	info!(bind = %bind_addr, "broker listening");

	health_state.mark_ready();

	serve(listener, hub).await
}
