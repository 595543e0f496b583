#![forbid(unsafe_code)]

pub mod health;

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `ws://host:port` / `wss://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub host: String,
		pub port: u16,
		pub secure: bool,
	}

	impl WsEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Returns the full `ws://host:port` (or `wss://`) URL string.
		pub fn url(&self) -> String {
			let scheme = if self.secure { "wss" } else { "ws" };
			format!("{}://{}:{}", scheme, self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse a WebSocket endpoint string in the form `ws://host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let (rest, secure) = if let Some(rest) = s.strip_prefix("ws://") {
				(rest, false)
			} else if let Some(rest) = s.strip_prefix("wss://") {
				(rest, true)
			} else {
				return Err(format!("invalid endpoint (expected ws://host:port or wss://host:port): {s}"));
			};

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected ws://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected ws://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected ws://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like ws://[::1]:3001): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
				secure,
			})
		}
	}

	/// Validate `ws://host:port` or `wss://host:port`.
	pub fn validate_ws_endpoint(s: &str) -> Result<(), String> {
		let _ = WsEndpoint::parse(s)?;
		Ok(())
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_dns_hostname() {
			let e = WsEndpoint::parse("ws://broker.example.com:3001").unwrap();
			assert_eq!(e.host, "broker.example.com");
			assert_eq!(e.port, 3001);
			assert!(!e.secure);
			assert_eq!(e.hostport(), "broker.example.com:3001");
			assert_eq!(e.url(), "ws://broker.example.com:3001");
		}

		#[test]
		fn parses_ipv4() {
			let e = WsEndpoint::parse("ws://127.0.0.1:3001").unwrap();
			assert_eq!(e.host, "127.0.0.1");
			assert_eq!(e.port, 3001);
			assert_eq!(e.hostport(), "127.0.0.1:3001");
		}

		#[test]
		fn parses_secure_scheme() {
			let e = WsEndpoint::parse("wss://broker.example.com:443").unwrap();
			assert!(e.secure);
			assert_eq!(e.url(), "wss://broker.example.com:443");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = WsEndpoint::parse("ws://[::1]:3001").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.port, 3001);
			assert_eq!(e.hostport(), "[::1]:3001");
		}

		#[test]
		fn rejects_unbracketed_ipv6() {
			let err = WsEndpoint::parse("ws://::1:3001").unwrap_err();
			assert!(err.to_lowercase().contains("ipv6"));
		}

		#[test]
		fn rejects_other_schemes() {
			assert!(WsEndpoint::parse("http://127.0.0.1:3001").is_err());
			assert!(WsEndpoint::parse("127.0.0.1:3001").is_err());
		}

		#[test]
		fn rejects_path_query_fragment() {
			assert!(WsEndpoint::parse("ws://127.0.0.1:3001/").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:3001?x=y").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:3001#frag").is_err());
		}

		#[test]
		fn rejects_port_zero_and_missing_port() {
			assert!(WsEndpoint::parse("ws://127.0.0.1:0").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1").is_err());
		}

		#[test]
		fn to_socket_addr_if_ip_literal_accepts_ip_literals() {
			let e4 = WsEndpoint::parse("ws://127.0.0.1:3000").unwrap();
			let a4 = e4.to_socket_addr_if_ip_literal().unwrap();
			assert_eq!(a4.to_string(), "127.0.0.1:3000");

			let e6 = WsEndpoint::parse("ws://[::1]:3000").unwrap();
			let a6 = e6.to_socket_addr_if_ip_literal().unwrap();
			assert_eq!(a6.to_string(), "[::1]:3000");
		}

		#[test]
		fn to_socket_addr_if_ip_literal_rejects_dns() {
			let e = WsEndpoint::parse("ws://broker.example.com:3001").unwrap();
			assert!(e.to_socket_addr_if_ip_literal().is_err());
		}
	}
}
