use std::{
	backtrace::Backtrace,
	fmt,
	net::{IpAddr, SocketAddr},
	str::FromStr,
};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AddressError {
	#[snafu(display("invalid host:port string {input}"))]
	InvalidHostPort {
		input:     String,
		backtrace: Backtrace,
	},

	#[snafu(display("invalid port in {input}"))]
	InvalidPort {
		input:     String,
		backtrace: Backtrace,
	},

	#[snafu(display("address carries neither ip nor domain"))]
	EmptyHost { backtrace: Backtrace },
}

/// Transfer network of an address. Only the two core networks exist here;
/// everything else the platform touches is mapped onto one of them at the
/// inbound boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
	Tcp,
	Udp,
}

impl Network {
	pub fn as_str(&self) -> &'static str {
		match self {
			Network::Tcp => "tcp",
			Network::Udp => "udp",
		}
	}
}

impl fmt::Display for Network {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Which of the host fields is authoritative. IP wins when both are present;
/// wire codecs rely on that ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
	Ipv4,
	Ipv6,
	Domain,
}

/// A destination: `(network, ip-or-domain, port)`.
///
/// At least one of `ip` and `domain` is populated. Both may be, after a DNS
/// resolution step; serializers then pick per [`HostKind`] precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
	pub ip:      Option<IpAddr>,
	pub domain:  Option<String>,
	pub port:    u16,
	pub network: Network,
}

impl Address {
	pub fn from_ip(network: Network, ip: IpAddr, port: u16) -> Self {
		Self {
			ip: Some(ip),
			domain: None,
			port,
			network,
		}
	}

	pub fn from_domain(network: Network, domain: impl Into<String>, port: u16) -> Self {
		Self {
			ip: None,
			domain: Some(domain.into()),
			port,
			network,
		}
	}

	pub fn from_socket_addr(network: Network, addr: SocketAddr) -> Self {
		Self::from_ip(network, addr.ip(), addr.port())
	}

	/// Parses `(network, "host:port")`. A host that parses as an IP literal
	/// populates the ip field, anything else becomes the domain.
	pub fn parse(network: Network, address: &str) -> Result<Self, AddressError> {
		let (host, port_str) = split_host_port(address).context(InvalidHostPortSnafu {
			input: address.to_string(),
		})?;
		let port = port_str.parse::<u16>().ok().context(InvalidPortSnafu {
			input: address.to_string(),
		})?;

		match IpAddr::from_str(host) {
			Ok(ip) => Ok(Self::from_ip(network, ip, port)),
			Err(_) => {
				ensure!(!host.is_empty(), EmptyHostSnafu);
				Ok(Self::from_domain(network, host, port))
			}
		}
	}

	pub fn host_kind(&self) -> HostKind {
		match self.ip {
			Some(IpAddr::V4(_)) => HostKind::Ipv4,
			Some(IpAddr::V6(_)) => HostKind::Ipv6,
			None => HostKind::Domain,
		}
	}

	pub fn is_ip_host(&self) -> bool {
		self.ip.is_some()
	}

	pub fn is_domain_host(&self) -> bool {
		!self.is_ip_host() && self.domain.is_some()
	}

	/// Replaces the host with a sniffed domain, dropping any resolved ip so
	/// routing sees the recovered name.
	pub fn with_domain(&self, domain: impl Into<String>) -> Self {
		Self {
			ip: None,
			domain: Some(domain.into()),
			port: self.port,
			network: self.network,
		}
	}

	pub fn with_network(&self, network: Network) -> Self {
		Self {
			network,
			..self.clone()
		}
	}

	fn ip_string(&self) -> String {
		match self.ip {
			Some(IpAddr::V6(ip)) => format!("[{ip}]"),
			Some(IpAddr::V4(ip)) => ip.to_string(),
			None => String::new(),
		}
	}

	fn host_preferring_ip(&self) -> String {
		if self.ip.is_some() {
			self.ip_string()
		} else {
			self.domain.clone().unwrap_or_default()
		}
	}

	fn host_preferring_domain(&self) -> String {
		if let Some(domain) = &self.domain {
			domain.clone()
		} else {
			self.ip_string()
		}
	}

	/// Canonical `network:host:port` key, ip taking precedence. Used for
	/// logging and as a stable map key.
	pub fn network_and_ip_preferred(&self) -> String {
		format!("{}:{}:{}", self.network, self.host_preferring_ip(), self.port)
	}

	/// Canonical `network:host:port` key, domain taking precedence. Used to
	/// key multiplexed bundles so every dispatch to one target shares one
	/// outer connection.
	pub fn network_and_domain_preferred(&self) -> String {
		format!("{}:{}:{}", self.network, self.host_preferring_domain(), self.port)
	}

	/// Socket form, available only for ip hosts.
	pub fn socket_addr(&self) -> Option<SocketAddr> {
		self.ip.map(|ip| SocketAddr::new(ip, self.port))
	}
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.network_and_domain_preferred())
	}
}

/// Splits `host:port`, handling `[v6]:port` bracketing.
fn split_host_port(input: &str) -> Option<(&str, &str)> {
	if let Some(rest) = input.strip_prefix('[') {
		let (host, tail) = rest.split_once(']')?;
		let port = tail.strip_prefix(':')?;
		return Some((host, port));
	}
	let idx = input.rfind(':')?;
	let (host, port) = input.split_at(idx);
	// A second colon without brackets means a bare v6 literal, not host:port.
	if host.contains(':') {
		return None;
	}
	Some((host, &port[1..]))
}
