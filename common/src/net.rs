// Copyright (C) 2023 QuerentAI LLC.
// This file is part of Querent.

// The Licensed Work is licensed under the Business Source License 1.1 (BSL 1.1).
// You may use this file in compliance with the BSL 1.1, subject to the following restrictions:
// 1. You may not use the Licensed Work for AI-related services, database services,
//    or any service or product offering that provides database, big data, or analytics
//    services to third parties unless explicitly authorized by QuerentAI LLC.
// 2. For more details, see the LICENSE file or visit https://mariadb.com/bsl11/.

// For inquiries about alternative licensing arrangements, please contact contact@querent.xyz.

// The Licensed Work is provided "AS IS", WITHOUT WARRANTY OF ANY KIND, express or implied,
// including but not limited to the warranties of merchantability, fitness for a particular purpose,
// and non-infringement. See the Business Source License for more details.

// This software includes code developed by QuerentAI LLC (https://querent.xyz).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A `host:port` pair identifying a node.
///
/// The host part is kept as a string: it can be an IP address or a DNS
/// name, and we never resolve it ourselves.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct HostAddr {
	host: String,
	port: u16,
}

#[derive(Debug, Error)]
#[error("invalid host address `{0}`, expected `host:port`")]
pub struct InvalidHostAddr(String);

impl HostAddr {
	pub fn new(host: impl ToString, port: u16) -> Self {
		HostAddr { host: host.to_string(), port }
	}

	pub fn host(&self) -> &str {
		&self.host
	}

	pub fn port(&self) -> u16 {
		self.port
	}
}

impl fmt::Display for HostAddr {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

impl FromStr for HostAddr {
	type Err = InvalidHostAddr;

	fn from_str(addr_str: &str) -> Result<Self, InvalidHostAddr> {
		let (host, port_str) =
			addr_str.rsplit_once(':').ok_or_else(|| InvalidHostAddr(addr_str.to_string()))?;
		if host.is_empty() {
			return Err(InvalidHostAddr(addr_str.to_string()));
		}
		let port = port_str.parse::<u16>().map_err(|_| InvalidHostAddr(addr_str.to_string()))?;
		Ok(HostAddr::new(host, port))
	}
}

impl From<HostAddr> for String {
	fn from(addr: HostAddr) -> String {
		addr.to_string()
	}
}

impl TryFrom<String> for HostAddr {
	type Error = InvalidHostAddr;

	fn try_from(addr_str: String) -> Result<Self, InvalidHostAddr> {
		addr_str.parse()
	}
}

#[cfg(test)]
mod tests {
	use super::HostAddr;

	#[test]
	fn test_host_addr_roundtrip() {
		let addr: HostAddr = "127.0.0.1:7626".parse().unwrap();
		assert_eq!(addr.host(), "127.0.0.1");
		assert_eq!(addr.port(), 7626);
		assert_eq!(addr.to_string(), "127.0.0.1:7626");
	}

	#[test]
	fn test_host_addr_rejects_garbage() {
		assert!("no-port".parse::<HostAddr>().is_err());
		assert!(":7626".parse::<HostAddr>().is_err());
		assert!("host:notaport".parse::<HostAddr>().is_err());
		assert!("host:99999".parse::<HostAddr>().is_err());
	}

	#[test]
	fn test_host_addr_serde_as_string() {
		let addr = HostAddr::new("node-1.internal", 7626);
		let json = serde_json::to_string(&addr).unwrap();
		assert_eq!(json, "\"node-1.internal:7626\"");
		let back: HostAddr = serde_json::from_str(&json).unwrap();
		assert_eq!(back, addr);
	}
}
