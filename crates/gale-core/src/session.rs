use rand::Rng;

use crate::net::Address;

/// Non-zero identifier of one dispatch chain. Random rather than sequential
/// so that log lines from concurrent connections do not collide.
pub fn new_id() -> u32 {
	let mut rng = rand::rng();
	loop {
		let id: u32 = rng.random();
		if id != 0 {
			return id;
		}
	}
}

/// Metadata of the inbound connection that started a dispatch chain.
#[derive(Debug, Clone)]
pub struct InboundMeta {
	/// Source address of the inbound connection.
	pub source:  Address,
	/// Local address the connection arrived on.
	pub gateway: Address,
	/// Tag of the inbound handler.
	pub tag:     String,
}

/// Per-connection attribute bag, created at the inbound entry and carried
/// through the dispatch graph until the outbound finishes.
#[derive(Debug, Clone)]
pub struct Content {
	pub id:      u32,
	pub inbound: InboundMeta,
	/// Set by the multiplexing client before it re-enters the dispatch graph,
	/// so the paired endpoint knows to speak the multiplexed protocol.
	pub mux:     bool,
}

impl Content {
	pub fn new(inbound: InboundMeta) -> Self {
		Self {
			id: new_id(),
			inbound,
			mux: false,
		}
	}
}

/// Input tuple of the router's lookup flavor.
#[derive(Debug, Clone)]
pub struct Lookup {
	pub domain:      String,
	pub inbound_tag: String,
}
