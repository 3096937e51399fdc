use std::{
	collections::HashMap,
	net::IpAddr,
	sync::{Arc, Mutex},
};

use async_trait::async_trait;
use ipnet::{Ipv4Net, Ipv6Net};

use crate::{dns::DnsProvider, net::Network};

/// Synthesized-ip pool: hands out addresses from a configured range and
/// remembers which domain each one stands for, so a later connection to the
/// synthetic ip can be mapped back to the name.
pub struct FakeDnsPool {
	v4: Mutex<PoolShard<Ipv4Net>>,
	v6: Mutex<PoolShard<Ipv6Net>>,
}

struct PoolShard<N> {
	range:   N,
	next:    IpAddr,
	by_ip:   HashMap<IpAddr, String>,
}

impl FakeDnsPool {
	pub fn new(range_v4: Ipv4Net, range_v6: Ipv6Net) -> Self {
		Self {
			v4: Mutex::new(PoolShard {
				next: IpAddr::V4(range_v4.network()),
				range: range_v4,
				by_ip: HashMap::new(),
			}),
			v6: Mutex::new(PoolShard {
				next: IpAddr::V6(range_v6.network()),
				range: range_v6,
				by_ip: HashMap::new(),
			}),
		}
	}

	/// Issues the next v4 address of the range for `domain`, wrapping around
	/// when the range is exhausted.
	pub fn allocate_v4(&self, domain: &str) -> Option<IpAddr> {
		let mut shard = self.v4.lock().unwrap();
		let IpAddr::V4(current) = shard.next else {
			return None;
		};
		let candidate = next_v4(current, &shard.range);
		shard.next = IpAddr::V4(candidate);
		shard.by_ip.insert(IpAddr::V4(candidate), domain.to_string());
		Some(IpAddr::V4(candidate))
	}

	pub fn allocate_v6(&self, domain: &str) -> Option<IpAddr> {
		let mut shard = self.v6.lock().unwrap();
		let IpAddr::V6(current) = shard.next else {
			return None;
		};
		let candidate = next_v6(current, &shard.range);
		shard.next = IpAddr::V6(candidate);
		shard.by_ip.insert(IpAddr::V6(candidate), domain.to_string());
		Some(IpAddr::V6(candidate))
	}

	/// Maps a previously issued address back to its domain.
	pub fn lookback(&self, ip: IpAddr) -> Option<String> {
		match ip {
			IpAddr::V4(_) => self.v4.lock().unwrap().by_ip.get(&ip).cloned(),
			IpAddr::V6(_) => self.v6.lock().unwrap().by_ip.get(&ip).cloned(),
		}
	}
}

/// Resolver that answers every lookup from the synthesized pool. Traffic
/// sent to those addresses is mapped back to its domain by the fake
/// sniffer, so routing sees names even for clients that resolved early.
pub struct FakeDns {
	pool: Arc<FakeDnsPool>,
}

impl FakeDns {
	pub fn new(pool: Arc<FakeDnsPool>) -> Self {
		Self { pool }
	}
}

#[async_trait]
impl DnsProvider for FakeDns {
	async fn lookup_ip(&self, _network: Network, host: &str) -> eyre::Result<Vec<IpAddr>> {
		let v6 = self.pool.allocate_v6(host);
		let v4 = self.pool.allocate_v4(host);
		let answers: Vec<IpAddr> = v6.into_iter().chain(v4).collect();
		if answers.is_empty() {
			eyre::bail!("fake pool exhausted for {host}");
		}
		Ok(answers)
	}

	fn name(&self) -> &str {
		"fake"
	}
}

fn next_v4(current: std::net::Ipv4Addr, range: &Ipv4Net) -> std::net::Ipv4Addr {
	let stepped = std::net::Ipv4Addr::from(u32::from(current).wrapping_add(1));
	if range.contains(&stepped) {
		stepped
	} else {
		range.network()
	}
}

fn next_v6(current: std::net::Ipv6Addr, range: &Ipv6Net) -> std::net::Ipv6Addr {
	let stepped = std::net::Ipv6Addr::from(u128::from(current).wrapping_add(1));
	if range.contains(&stepped) {
		stepped
	} else {
		range.network()
	}
}
