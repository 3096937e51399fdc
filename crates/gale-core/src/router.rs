use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;

use crate::{
	net::Address,
	session::{Content, Lookup},
};

/// Field of the dispatch tuple a condition applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
	SrcNetwork,
	DstNetwork,
	SrcIp,
	DstIp,
	DstDomain,
	SrcPort,
	DstPort,
	InboundTag,
	// Lookup flavor
	LookupDomain,
	LookupInboundTag,
}

/// How the string list of a condition is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
	Full,
	Sub,
	Regex,
}

/// One named test. A value matches when any list element matches; ip tests
/// are defined for `Full` mode only and check CIDR membership.
pub struct Test {
	pub field:   Field,
	pub mode:    MatchMode,
	pub strings: Vec<String>,
	pub cidrs:   Vec<IpNet>,
	regexes:     Vec<Regex>,
}

impl Test {
	pub fn new(field: Field, mode: MatchMode, strings: Vec<String>, cidrs: Vec<IpNet>) -> Self {
		let regexes = if mode == MatchMode::Regex {
			strings.iter().filter_map(|s| Regex::new(s).ok()).collect()
		} else {
			Vec::new()
		};
		Self {
			field,
			mode,
			strings,
			cidrs,
			regexes,
		}
	}

	fn match_string(&self, s: &str) -> bool {
		if s.is_empty() {
			return false;
		}
		match self.mode {
			MatchMode::Full => self.strings.iter().any(|t| t.eq_ignore_ascii_case(s)),
			MatchMode::Sub => self.strings.iter().any(|t| s.contains(t.as_str())),
			MatchMode::Regex => self.regexes.iter().any(|r| r.is_match(s)),
		}
	}

	fn match_ip(&self, ip: IpAddr) -> bool {
		match self.mode {
			MatchMode::Full => self.cidrs.iter().any(|c| c.contains(&ip)),
			_ => false,
		}
	}
}

/// AND of named tests.
pub struct Condition {
	pub tests: Vec<Test>,
}

impl Condition {
	pub fn new(tests: Vec<Test>) -> Self {
		Self { tests }
	}

	/// True when every test targeting `field` accepts the string value.
	fn accepts_string(&self, field: Field, value: &str) -> bool {
		self.tests
			.iter()
			.filter(|t| t.field == field)
			.all(|t| t.match_string(value))
	}

	/// Ip fields pass when either the CIDR list or the textual form matches.
	fn accepts_ip(&self, field: Field, ip: Option<IpAddr>) -> bool {
		self.tests.iter().filter(|t| t.field == field).all(|t| {
			match ip {
				Some(ip) => t.match_ip(ip) || t.match_string(&ip.to_string()),
				None => false,
			}
		})
	}
}

/// One routing rule: condition set plus the tag of the outbound it selects.
pub struct Rule {
	pub condition:    Condition,
	pub outbound_tag: String,
}

/// Ordered first-match-wins rule list, evaluated over either the dispatch
/// content tuple or a DNS lookup tuple.
#[derive(Default)]
pub struct Matcher {
	rules: Vec<Rule>,
}

impl Matcher {
	pub fn new(rules: Vec<Rule>) -> Self {
		Self { rules }
	}

	pub fn match_content(&self, content: &Content, address: &Address) -> Option<&str> {
		let src = &content.inbound.source;
		self.rules
			.iter()
			.find(|rule| {
				let c = &rule.condition;
				c.accepts_string(Field::SrcNetwork, src.network.as_str())
					&& c.accepts_string(Field::DstNetwork, address.network.as_str())
					&& c.accepts_ip(Field::SrcIp, src.ip)
					&& c.accepts_ip(Field::DstIp, address.ip)
					&& c.accepts_string(Field::DstDomain, address.domain.as_deref().unwrap_or(""))
					&& c.accepts_string(Field::SrcPort, &src.port.to_string())
					&& c.accepts_string(Field::DstPort, &address.port.to_string())
					&& c.accepts_string(Field::InboundTag, &content.inbound.tag)
			})
			.map(|rule| rule.outbound_tag.as_str())
	}

	pub fn match_lookup(&self, lookup: &Lookup) -> Option<&str> {
		self.rules
			.iter()
			.find(|rule| {
				let c = &rule.condition;
				c.accepts_string(Field::LookupDomain, &lookup.domain)
					&& c.accepts_string(Field::LookupInboundTag, &lookup.inbound_tag)
			})
			.map(|rule| rule.outbound_tag.as_str())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{net::Network, session::InboundMeta};

	fn content(src: &str) -> Content {
		Content::new(InboundMeta {
			source:  Address::parse(Network::Tcp, src).unwrap(),
			gateway: Address::parse(Network::Tcp, "127.0.0.1:1080").unwrap(),
			tag:     "entry".into(),
		})
	}

	fn rule(field: Field, mode: MatchMode, values: &[&str], tag: &str) -> Rule {
		Rule {
			condition:    Condition::new(vec![Test::new(
				field,
				mode,
				values.iter().map(|s| s.to_string()).collect(),
				Vec::new(),
			)]),
			outbound_tag: tag.into(),
		}
	}

	#[test]
	fn first_matching_rule_wins() {
		let matcher = Matcher::new(vec![
			rule(Field::DstDomain, MatchMode::Sub, &["ads."], "block"),
			rule(Field::SrcNetwork, MatchMode::Full, &["tcp", "udp"], "direct"),
		]);

		let content = content("10.0.0.5:40000");
		let blocked = Address::from_domain(Network::Tcp, "ads.example.com", 80);
		assert_eq!(matcher.match_content(&content, &blocked), Some("block"));

		let plain = Address::from_domain(Network::Tcp, "example.com", 80);
		assert_eq!(matcher.match_content(&content, &plain), Some("direct"));
	}

	#[test]
	fn no_rule_yields_no_tag() {
		let matcher = Matcher::new(vec![rule(
			Field::DstDomain,
			MatchMode::Full,
			&["only.example"],
			"x",
		)]);
		let plain = Address::from_domain(Network::Tcp, "other.example", 80);
		assert_eq!(matcher.match_content(&content("10.0.0.5:1"), &plain), None);
	}

	#[test]
	fn full_mode_is_case_insensitive() {
		let matcher = Matcher::new(vec![rule(
			Field::DstDomain,
			MatchMode::Full,
			&["Example.COM"],
			"hit",
		)]);
		let addr = Address::from_domain(Network::Tcp, "example.com", 443);
		assert_eq!(matcher.match_content(&content("10.0.0.5:1"), &addr), Some("hit"));
	}

	#[test]
	fn cidr_matches_destination_ip() {
		let matcher = Matcher::new(vec![Rule {
			condition:    Condition::new(vec![Test::new(
				Field::DstIp,
				MatchMode::Full,
				Vec::new(),
				vec!["10.0.0.0/8".parse().unwrap()],
			)]),
			outbound_tag: "lan".into(),
		}]);

		let inside = Address::from_ip(Network::Tcp, "10.1.2.3".parse().unwrap(), 22);
		assert_eq!(matcher.match_content(&content("9.9.9.9:1"), &inside), Some("lan"));

		let outside = Address::from_ip(Network::Tcp, "11.1.2.3".parse().unwrap(), 22);
		assert_eq!(matcher.match_content(&content("9.9.9.9:1"), &outside), None);
	}

	#[test]
	fn regex_mode_compiles_and_matches() {
		let matcher = Matcher::new(vec![rule(
			Field::DstDomain,
			MatchMode::Regex,
			&[r"^cdn\d+\."],
			"cdn",
		)]);
		let addr = Address::from_domain(Network::Tcp, "cdn3.example.com", 443);
		assert_eq!(matcher.match_content(&content("9.9.9.9:1"), &addr), Some("cdn"));
	}

	#[test]
	fn lookup_flavor_sees_only_its_fields() {
		let matcher = Matcher::new(vec![rule(
			Field::LookupDomain,
			MatchMode::Sub,
			&["internal."],
			"vpn",
		)]);
		let lookup = Lookup {
			domain:      "internal.service.example".into(),
			inbound_tag: "entry".into(),
		};
		assert_eq!(matcher.match_lookup(&lookup), Some("vpn"));
	}
}
