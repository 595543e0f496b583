#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.roomcast/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".roomcast").join("config.toml"))
}

/// Load the gateway config from TOML and env overrides.
pub fn load_gateway_config() -> anyhow::Result<GatewayConfig> {
	let path = default_config_path()?;
	load_gateway_config_from_path(&path)
}

/// Same as `load_gateway_config` but with an explicit config path.
pub fn load_gateway_config_from_path(path: &Path) -> anyhow::Result<GatewayConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = GatewayConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Gateway config (v1).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
	pub gateway: GatewaySettings,
	pub link: LinkSettings,
	pub persistence: PersistenceSettings,
}

/// Settings for the client-facing side of the gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
	/// WebSocket bind endpoint (`ws://host:port`); a `--bind` arg wins.
	pub bind: Option<String>,
	/// Broker endpoint the gateway links to (`ws://host:port`).
	pub broker_url: String,
	/// History REST bind address (host:port).
	pub history_bind: String,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Maximum number of queued outbound messages per client connection.
	pub outbound_queue_capacity: usize,
	/// Maximum accepted client frame size in bytes.
	pub max_frame_bytes: usize,
}

/// Settings for the gateway to broker link.
#[derive(Debug, Clone)]
pub struct LinkSettings {
	/// Reconnect backoff bounds.
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// Capacity of the drop-oldest buffer used while the link is down.
	pub outbound_buffer_capacity: usize,
	/// Reconnect attempt cap. `None` keeps retrying forever; the delay
	/// stays bounded either way.
	pub max_reconnect_attempts: Option<u32>,
}

/// Persistence settings loaded by the gateway.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite:, postgres: or mysql:). Absent means the
	/// in-memory store.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	gateway: FileGatewaySettings,

	#[serde(default)]
	link: FileLinkSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileGatewaySettings {
	bind: Option<String>,
	broker_url: Option<String>,
	history_bind: Option<String>,
	health_bind: Option<String>,
	metrics_bind: Option<String>,
	outbound_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLinkSettings {
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	outbound_buffer_capacity: Option<usize>,
	max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

impl GatewayConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			gateway: GatewaySettings {
				bind: file.gateway.bind.filter(|s| !s.trim().is_empty()),
				broker_url: file
					.gateway
					.broker_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| "ws://127.0.0.1:3001".to_string()),
				history_bind: file
					.gateway
					.history_bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| "127.0.0.1:4000".to_string()),
				health_bind: file.gateway.health_bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.gateway.metrics_bind.filter(|s| !s.trim().is_empty()),
				outbound_queue_capacity: file.gateway.outbound_queue_capacity.filter(|v| *v > 0).unwrap_or(256),
				max_frame_bytes: file
					.gateway
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(roomcast_protocol::DEFAULT_MAX_FRAME_BYTES),
			},
			link: LinkSettings {
				reconnect_min_delay: file
					.link
					.reconnect_min_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(Duration::from_millis(500)),
				reconnect_max_delay: file
					.link
					.reconnect_max_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(Duration::from_secs(30)),
				outbound_buffer_capacity: file.link.outbound_buffer_capacity.filter(|v| *v > 0).unwrap_or(256),
				max_reconnect_attempts: file.link.max_reconnect_attempts,
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut GatewayConfig) {
	if let Ok(v) = std::env::var("ROOMCAST_GATEWAY_BROKER_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.gateway.broker_url = v;
			info!("gateway config: broker_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("ROOMCAST_HISTORY_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.gateway.history_bind = v;
			info!("gateway config: history_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("ROOMCAST_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.gateway.health_bind = Some(v);
			info!("gateway config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("ROOMCAST_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.gateway.metrics_bind = Some(v);
			info!("gateway config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("ROOMCAST_LINK_RECONNECT_MIN_DELAY_MS")
		&& let Ok(min_ms) = v.trim().parse::<u64>()
	{
		cfg.link.reconnect_min_delay = Duration::from_millis(min_ms);
		info!(min_ms, "link config: reconnect_min_delay overridden by env");
	}

	if let Ok(v) = std::env::var("ROOMCAST_LINK_RECONNECT_MAX_DELAY_MS")
		&& let Ok(max_ms) = v.trim().parse::<u64>()
	{
		cfg.link.reconnect_max_delay = Duration::from_millis(max_ms);
		info!(max_ms, "link config: reconnect_max_delay overridden by env");
	}

	if let Ok(v) = std::env::var("ROOMCAST_LINK_OUTBOUND_BUFFER")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.link.outbound_buffer_capacity = capacity;
		info!(capacity, "link config: outbound_buffer_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("ROOMCAST_LINK_MAX_RECONNECT_ATTEMPTS")
		&& let Ok(attempts) = v.trim().parse::<u32>()
	{
		cfg.link.max_reconnect_attempts = Some(attempts);
		info!(attempts, "link config: max_reconnect_attempts overridden by env");
	}

	if let Ok(v) = std::env::var("ROOMCAST_PERSISTENCE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if cfg.link.reconnect_min_delay > cfg.link.reconnect_max_delay {
		warn!(
			min_ms = cfg.link.reconnect_min_delay.as_millis(),
			max_ms = cfg.link.reconnect_max_delay.as_millis(),
			"link config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		std::mem::swap(&mut cfg.link.reconnect_min_delay, &mut cfg.link.reconnect_max_delay);
	}
}
