use std::{backtrace::Backtrace, net::IpAddr, str::FromStr};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use snafu::prelude::*;
use tokio::io::AsyncRead;

use crate::{
	io::{BufferedSource, TransferError},
	net::{Address, HostKind, Network},
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AddressCodecError {
	#[snafu(display("unknown host type byte {value}"))]
	UnknownHostType {
		value:     u8,
		backtrace: Backtrace,
	},

	#[snafu(display("domain too long: {domain}"))]
	DomainTooLong {
		domain:    String,
		backtrace: Backtrace,
	},

	#[snafu(display("invalid domain name: {raw}"))]
	InvalidDomain {
		raw:       String,
		backtrace: Backtrace,
	},

	#[snafu(display("truncated address"))]
	Truncated { backtrace: Backtrace },

	#[snafu(display("address carries neither ip nor domain"))]
	HostMissing { backtrace: Backtrace },
}

impl From<AddressCodecError> for TransferError {
	fn from(value: AddressCodecError) -> Self {
		crate::io::MalformedSnafu {
			message: value.to_string(),
		}
		.build()
	}
}

/// Host discriminator on the wire, shared by every protocol in the platform
/// that carries an explicit destination.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum HostType {
	Ipv4   = 1,
	Domain = 2,
	Ipv6   = 3,
	#[num_enum(catch_all)]
	Other(u8),
}

impl From<HostKind> for HostType {
	fn from(value: HostKind) -> Self {
		match value {
			HostKind::Ipv4 => HostType::Ipv4,
			HostKind::Ipv6 => HostType::Ipv6,
			HostKind::Domain => HostType::Domain,
		}
	}
}

/// How payload moves once the session is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
	Stream,
	Packet,
}

impl From<Network> for TransferType {
	fn from(value: Network) -> Self {
		match value {
			Network::Tcp => TransferType::Stream,
			Network::Udp => TransferType::Packet,
		}
	}
}

/// Wire layout: `port (2, BE) || host-type (1) || host`, where host is four
/// octets for IPv4, sixteen for IPv6, or `len (1) || ascii` for a domain.
pub fn put_address(dst: &mut BytesMut, address: &Address) -> Result<(), AddressCodecError> {
	dst.put_u16(address.port);

	match address.ip {
		Some(IpAddr::V4(ip)) => {
			dst.put_u8(HostType::Ipv4.into());
			dst.put_slice(&ip.octets());
		}
		Some(IpAddr::V6(ip)) => {
			dst.put_u8(HostType::Ipv6.into());
			dst.put_slice(&ip.octets());
		}
		None => {
			let domain = address.domain.as_deref().context(HostMissingSnafu)?;
			ensure!(domain.len() <= u8::MAX as usize, DomainTooLongSnafu { domain });
			ensure!(
				is_valid_domain(domain),
				InvalidDomainSnafu { raw: domain }
			);
			dst.put_u8(HostType::Domain.into());
			dst.put_u8(domain.len() as u8);
			dst.put_slice(domain.as_bytes());
		}
	}
	Ok(())
}

/// Parses an address out of an in-memory buffer, advancing it.
pub fn get_address(src: &mut BytesMut, network: Network) -> Result<Address, AddressCodecError> {
	ensure!(src.len() >= 3, TruncatedSnafu);
	let port = src.get_u16();
	let host_type = HostType::from(src.get_u8());

	let host_len = match host_type {
		HostType::Ipv4 => 4,
		HostType::Ipv6 => 16,
		HostType::Domain => {
			ensure!(!src.is_empty(), TruncatedSnafu);
			src.get_u8() as usize
		}
		HostType::Other(value) => return UnknownHostTypeSnafu { value }.fail(),
	};
	ensure!(src.len() >= host_len, TruncatedSnafu);
	let host = src.split_to(host_len);

	build_address(network, host_type, &host, port)
}

/// Incremental byte feed for parsers that cannot see the full payload ahead
/// of time (a socket, or a socket behind a stream decryptor).
#[async_trait]
pub trait ByteChunkSource: Send {
	async fn next_exact(&mut self, n: usize) -> Result<Bytes, TransferError>;
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteChunkSource for BufferedSource<R> {
	async fn next_exact(&mut self, n: usize) -> Result<Bytes, TransferError> {
		self.read_exact(n).await
	}
}

/// Streaming flavor of [`get_address`], pulling exactly as many bytes as the
/// encoded form needs.
pub async fn read_address<S>(src: &mut S, network: Network) -> Result<Address, TransferError>
where
	S: ByteChunkSource + ?Sized,
{
	let head = src.next_exact(3).await?;
	let port = u16::from_be_bytes([head[0], head[1]]);
	let host_type = HostType::from(head[2]);

	let host = match host_type {
		HostType::Ipv4 => src.next_exact(4).await?,
		HostType::Ipv6 => src.next_exact(16).await?,
		HostType::Domain => {
			let len = src.next_exact(1).await?[0] as usize;
			src.next_exact(len).await?
		}
		HostType::Other(value) => {
			return Err(UnknownHostTypeSnafu { value }.build().into());
		}
	};

	Ok(build_address(network, host_type, &host, port)?)
}

fn build_address(
	network: Network,
	host_type: HostType,
	host: &[u8],
	port: u16,
) -> Result<Address, AddressCodecError> {
	match host_type {
		HostType::Ipv4 => {
			let octets: [u8; 4] = host.try_into().map_err(|_| TruncatedSnafu.build())?;
			Ok(Address::from_ip(network, IpAddr::from(octets), port))
		}
		HostType::Ipv6 => {
			let octets: [u8; 16] = host.try_into().map_err(|_| TruncatedSnafu.build())?;
			Ok(Address::from_ip(network, IpAddr::from(octets), port))
		}
		HostType::Domain => {
			let raw = String::from_utf8_lossy(host).to_string();
			// Some peers put an ip literal in the domain slot.
			if let Ok(ip) = IpAddr::from_str(&raw) {
				return Ok(Address::from_ip(network, ip, port));
			}
			ensure!(!raw.is_empty() && is_valid_domain(&raw), InvalidDomainSnafu { raw });
			Ok(Address::from_domain(network, raw, port))
		}
		HostType::Other(value) => UnknownHostTypeSnafu { value }.fail(),
	}
}

fn is_valid_domain(domain: &str) -> bool {
	domain.chars().all(|c| {
		c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_'
	})
}

#[cfg(test)]
mod test {
	use std::net::{Ipv4Addr, Ipv6Addr};

	use super::*;

	fn round_trip(address: Address) {
		let mut buf = BytesMut::new();
		put_address(&mut buf, &address).unwrap();
		let decoded = get_address(&mut buf, address.network).unwrap();
		assert_eq!(decoded, address);
		assert!(buf.is_empty());
	}

	#[test]
	fn encodes_every_host_kind() {
		round_trip(Address::from_ip(Network::Tcp, Ipv4Addr::new(1, 2, 3, 4).into(), 80));
		round_trip(Address::from_ip(Network::Udp, Ipv6Addr::LOCALHOST.into(), 53));
		round_trip(Address::from_domain(Network::Tcp, "example.com", 65535));
	}

	#[test]
	fn pins_domain_wire_bytes() {
		let mut buf = BytesMut::new();
		put_address(&mut buf, &Address::from_domain(Network::Tcp, "example", 443)).unwrap();
		assert_eq!(hex::encode(&buf), "01bb02076578616d706c65");
	}

	#[test]
	fn rejects_unknown_type_byte() {
		let mut buf = BytesMut::from(&[0x00u8, 0x50, 0x07, 0x01][..]);
		assert!(matches!(
			get_address(&mut buf, Network::Tcp).unwrap_err(),
			AddressCodecError::UnknownHostType { value: 7, .. }
		));
	}

	#[tokio::test]
	async fn streaming_parse_matches_buffered_parse() {
		let mut buf = BytesMut::new();
		put_address(&mut buf, &Address::from_domain(Network::Tcp, "api.test", 8443)).unwrap();

		let bytes = buf.freeze();
		let mut source = BufferedSource::new(bytes.as_ref());
		let address = read_address(&mut source, Network::Tcp).await.unwrap();
		assert_eq!(address.domain.as_deref(), Some("api.test"));
		assert_eq!(address.port, 8443);
	}
}
