use std::net::IpAddr;

use async_trait::async_trait;

use crate::net::Network;

/// Name resolution seam. Concrete resolver hierarchies (caches, DoH, hosts
/// files) live outside the core; the dispatch graph only needs this much.
/// The synthesized-address resolver in [`crate::fakedns`] is the one
/// in-tree implementation.
#[async_trait]
pub trait DnsProvider: Send + Sync {
	async fn lookup_ip(&self, network: Network, host: &str) -> eyre::Result<Vec<IpAddr>>;

	fn name(&self) -> &str;
}
