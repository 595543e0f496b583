#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use roomcast_gateway::config::{default_config_path, load_gateway_config_from_path};
use roomcast_gateway::server::history::spawn_history_server;
use roomcast_gateway::server::link::{LinkConfig, LinkStatus, spawn_broker_link};
use roomcast_gateway::server::registry::RoomRegistry;
use roomcast_gateway::server::{GatewayContext, serve};
use roomcast_store::{GroupDirectory, MemoryStore, MessageStore, SqlStore};
use roomcast_util::endpoint::WsEndpoint;
use roomcast_util::health::{HealthState, spawn_health_server};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: roomcast_gateway [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: ws://127.0.0.1:3000)\n\
\t         Format: ws://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

/// `--bind` wins over the config file; both fall back to the default.
fn parse_args() -> Option<String> {
	let mut bind_endpoint: Option<String> = None;

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
				bind_endpoint = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind_endpoint
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,roomcast_gateway=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("roomcast_gateway");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
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

	let bind_arg = parse_args();

	let config_path = default_config_path()?;
	let cfg = load_gateway_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded gateway config (toml + env overrides)");

	init_metrics(cfg.gateway.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = cfg.gateway.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let bind_raw = bind_arg
		.or_else(|| cfg.gateway.bind.clone())
		.unwrap_or_else(|| "ws://127.0.0.1:3000".to_string());
	let bind = WsEndpoint::parse(&bind_raw).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});
	let bind_addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let (directory, store): (Arc<dyn GroupDirectory>, Arc<dyn MessageStore>) = match cfg.persistence.database_url.as_deref() {
		Some(database_url) => {
			let sql = SqlStore::connect(database_url).await?;
			sql.ensure_schema().await?;
			info!("sql store connected, schema ensured");
			let sql = Arc::new(sql);
			(sql.clone(), sql)
		}
		None => {
			warn!("no database_url configured; using the in-memory store (contents vanish on restart)");
			let memory = Arc::new(MemoryStore::new());
			(memory.clone(), memory)
		}
	};

	let broker_url = Url::parse(&cfg.gateway.broker_url)
		.with_context(|| format!("invalid broker_url: {}", cfg.gateway.broker_url))?;

	let registry = RoomRegistry::new();
	let mut link_cfg = LinkConfig::new(broker_url);
	link_cfg.reconnect_min_delay = cfg.link.reconnect_min_delay;
	link_cfg.reconnect_max_delay = cfg.link.reconnect_max_delay;
	link_cfg.max_reconnect_attempts = cfg.link.max_reconnect_attempts;
	link_cfg.outbound_buffer_capacity = cfg.link.outbound_buffer_capacity;
	link_cfg.max_frame_bytes = cfg.gateway.max_frame_bytes;
	let link = spawn_broker_link(link_cfg, registry.clone());

	// Mirror link state into readiness and a gauge. A gateway with its
	// link down keeps serving local rooms, degraded.
	{
		let health_state = health_state.clone();
		let mut status_rx = link.status();
		tokio::spawn(async move {
			loop {
				let status = *status_rx.borrow_and_update();
				let up = status == LinkStatus::Connected;
				health_state.set_link_up(up);
				metrics::gauge!("roomcast_gateway_link_up").set(if up { 1.0 } else { 0.0 });

				if status_rx.changed().await.is_err() {
					break;
				}
			}
		});
	}

	let history_addr: SocketAddr = cfg
		.gateway
		.history_bind
		.parse()
		.with_context(|| format!("invalid history bind address: {}", cfg.gateway.history_bind))?;
	spawn_history_server(history_addr, store.clone());
	info!(%history_addr, "history server listening");

	let ctx = GatewayContext {
		registry,
		directory,
		store,
		link,
		outbound_queue_capacity: cfg.gateway.outbound_queue_capacity,
		max_frame_bytes: cfg.gateway.max_frame_bytes,
	};

	let listener = TcpListener::bind(bind_addr).await.context("bind client listener")?;
	info!(bind = %bind_addr, "gateway listening");

	health_state.mark_ready();

	serve(listener, ctx).await
}
