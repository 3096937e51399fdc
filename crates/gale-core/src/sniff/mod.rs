mod http;
mod quic;
mod tls;

use std::{net::IpAddr, sync::Arc};

pub use http::sniff_http;
pub use quic::sniff_quic;
pub use tls::{parse_client_hello, sniff_tls};

use crate::{fakedns::FakeDnsPool, net::Network};

/// Application protocol recognized from a transport prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffProtocol {
	Fake,
	Http,
	Tls,
	Quic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffResult {
	pub protocol: SniffProtocol,
	pub domain:   String,
}

/// Why a sniffer produced no result.
///
/// `NeedMoreData` means the prefix was consistent with the protocol but too
/// short to finish parsing; `NotMatched` means it cannot be this protocol at
/// all. Registries try the next sniffer on either, but the split keeps the
/// wire parsers honest about truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffError {
	NeedMoreData,
	NotMatched,
}

/// One registered sniffer. The set is closed, so a plain enum beats a
/// trait object here.
#[derive(Clone)]
pub enum Sniffer {
	/// Reverse-maps a synthesized ip back to the domain it was issued for.
	Fake(Arc<FakeDnsPool>),
	Http,
	Tls,
	Quic,
}

impl Sniffer {
	pub fn protocol(&self) -> SniffProtocol {
		match self {
			Sniffer::Fake(_) => SniffProtocol::Fake,
			Sniffer::Http => SniffProtocol::Http,
			Sniffer::Tls => SniffProtocol::Tls,
			Sniffer::Quic => SniffProtocol::Quic,
		}
	}

	pub fn sniff(&self, prefix: &[u8], peer_ip: Option<IpAddr>) -> Result<SniffResult, SniffError> {
		match self {
			Sniffer::Fake(pool) => {
				let ip = peer_ip.ok_or(SniffError::NotMatched)?;
				let domain = pool.lookback(ip).ok_or(SniffError::NotMatched)?;
				Ok(SniffResult {
					protocol: SniffProtocol::Fake,
					domain,
				})
			}
			Sniffer::Http => sniff_http(prefix),
			Sniffer::Tls => sniff_tls(prefix),
			Sniffer::Quic => sniff_quic(prefix),
		}
	}
}

/// Ordered sniffer registry. Fake sniffers always run first, then the
/// network-specific wire sniffers.
#[derive(Clone, Default)]
pub struct SnifferSet {
	fake: Vec<Sniffer>,
	tcp:  Vec<Sniffer>,
	udp:  Vec<Sniffer>,
}

impl SnifferSet {
	/// The standard registry: HTTP and TLS over TCP, QUIC over UDP, plus an
	/// optional fake-DNS lookback.
	pub fn standard(fake_pool: Option<Arc<FakeDnsPool>>) -> Self {
		Self {
			fake: fake_pool.into_iter().map(Sniffer::Fake).collect(),
			tcp:  vec![Sniffer::Http, Sniffer::Tls],
			udp:  vec![Sniffer::Quic],
		}
	}

	/// Runs the registry over a buffered prefix. The first hit whose domain
	/// is an actual name (not an ip literal) wins.
	pub fn sniff(
		&self,
		prefix: &[u8],
		peer_ip: Option<IpAddr>,
		network: Network,
	) -> Option<SniffResult> {
		for sniffer in &self.fake {
			if let Ok(result) = sniffer.sniff(prefix, peer_ip) {
				return Some(result);
			}
		}

		let wire = match network {
			Network::Tcp => &self.tcp,
			Network::Udp => &self.udp,
		};
		for sniffer in wire {
			if let Ok(result) = sniffer.sniff(prefix, peer_ip) {
				if is_domain_name(&result.domain) {
					return Some(result);
				}
				return None;
			}
		}
		None
	}
}

/// A sniffed host only counts when it is a real name; an ip literal adds no
/// routing information over what the connection already has.
fn is_domain_name(host: &str) -> bool {
	!host.is_empty() && host.parse::<IpAddr>().is_err()
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn registry_rejects_ip_results() {
		let set = SnifferSet::standard(None);
		let request = b"GET / HTTP/1.1\r\nHost: 10.0.0.1:8080\r\n\r\n";
		assert_eq!(set.sniff(request, None, Network::Tcp), None);
	}

	#[test]
	fn registry_finds_http_host() {
		let set = SnifferSet::standard(None);
		let request = b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
		let result = set.sniff(request, None, Network::Tcp).unwrap();
		assert_eq!(result.protocol, SniffProtocol::Http);
		assert_eq!(result.domain, "example.com");
	}

	#[test]
	fn fake_lookback_takes_precedence() {
		let pool = Arc::new(crate::fakedns::FakeDnsPool::new(
			"198.18.0.0/15".parse().unwrap(),
			"fc00::/18".parse().unwrap(),
		));
		let ip = pool.allocate_v4("hidden.example").unwrap();

		let set = SnifferSet::standard(Some(pool));
		let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
		let result = set.sniff(request, Some(ip), Network::Tcp).unwrap();
		assert_eq!(result.protocol, SniffProtocol::Fake);
		assert_eq!(result.domain, "hidden.example");
	}
}
