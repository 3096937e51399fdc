use std::{net::SocketAddr, path::Path};

use educe::Educe;
use eyre::WrapErr;
use figment::{
	Figment,
	providers::{Env, Format, Json},
};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level configuration document.
#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct Config {
	pub dns:       DnsConfig,
	pub inbounds:  Vec<InboundConfig>,
	pub outbounds: Vec<OutboundConfig>,
	pub rules:     Vec<RuleConfig>,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct DnsConfig {
	/// Synthesized-ip ranges for the fake resolver; absent disables it.
	pub fake: Option<FakeDnsConfig>,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct FakeDnsConfig {
	#[educe(Default(expression = "198.18.0.0/15".parse().unwrap()))]
	pub ipv4_range: Ipv4Net,

	#[educe(Default(expression = "fc00::/18".parse().unwrap()))]
	pub ipv6_range: Ipv6Net,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct InboundConfig {
	pub tag:      String,
	#[serde(flatten)]
	pub protocol: InboundProtocol,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum InboundProtocol {
	Vmess {
		listen:   SocketAddr,
		settings: VmessInboundSettings,
	},
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct VmessInboundSettings {
	pub users: Vec<VmessUserConfig>,

	/// Accept the pre-sealed header format as well. Off unless a peer
	/// genuinely cannot speak sealed headers.
	#[educe(Default = false)]
	#[serde(default)]
	pub allow_legacy: bool,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct VmessUserConfig {
	pub uuid: Uuid,

	#[educe(Default = 0)]
	#[serde(default)]
	pub alter_id: u16,

	#[educe(Default = SecurityConfig::Auto)]
	#[serde(default)]
	pub security: SecurityConfig,

	#[serde(default)]
	pub email: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Educe)]
#[educe(Default)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityConfig {
	#[educe(Default)]
	Auto,
	#[serde(rename = "aes-128-gcm")]
	Aes128Gcm,
	#[serde(rename = "chacha20-poly1305")]
	Chacha20Poly1305,
	Legacy,
	None,
	Zero,
}

impl From<SecurityConfig> for gale_vmess::Security {
	fn from(value: SecurityConfig) -> Self {
		match value {
			SecurityConfig::Auto => gale_vmess::Security::Auto,
			SecurityConfig::Aes128Gcm => gale_vmess::Security::Aes128Gcm,
			SecurityConfig::Chacha20Poly1305 => gale_vmess::Security::Chacha20Poly1305,
			SecurityConfig::Legacy => gale_vmess::Security::Legacy,
			SecurityConfig::None => gale_vmess::Security::None,
			SecurityConfig::Zero => gale_vmess::Security::Zero,
		}
	}
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OutboundConfig {
	pub tag:      String,
	#[serde(flatten)]
	pub protocol: OutboundProtocol,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum OutboundProtocol {
	Freedom,
	Vmess {
		settings: VmessOutboundSettings,
	},
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct VmessOutboundSettings {
	/// Server address as `host:port`.
	#[educe(Default = "127.0.0.1:10086")]
	pub address: String,

	pub uuid: Uuid,

	#[educe(Default = SecurityConfig::Auto)]
	#[serde(default)]
	pub security: SecurityConfig,

	/// Pack dispatches into multiplexed sessions over shared connections.
	#[educe(Default = false)]
	#[serde(default)]
	pub mux: bool,
}

/// One routing rule: any stated condition must hold; the first matching
/// rule selects the outbound.
#[derive(Debug, Deserialize, Serialize)]
pub struct RuleConfig {
	pub outbound: String,

	#[serde(default)]
	pub src_network: Option<RuleTest>,
	#[serde(default)]
	pub dst_network: Option<RuleTest>,
	#[serde(default)]
	pub src_ip: Option<RuleTest>,
	#[serde(default)]
	pub dst_ip: Option<RuleTest>,
	#[serde(default)]
	pub dst_domain: Option<RuleTest>,
	#[serde(default)]
	pub src_port: Option<RuleTest>,
	#[serde(default)]
	pub dst_port: Option<RuleTest>,
	#[serde(default)]
	pub inbound_tag: Option<RuleTest>,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct RuleTest {
	#[educe(Default = MatchModeConfig::Full)]
	#[serde(default)]
	pub mode: MatchModeConfig,

	#[serde(default)]
	pub values: Vec<String>,

	#[serde(default)]
	pub cidrs: Vec<ipnet::IpNet>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Educe)]
#[educe(Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchModeConfig {
	#[educe(Default)]
	Full,
	Sub,
	Regex,
}

impl From<MatchModeConfig> for gale_core::router::MatchMode {
	fn from(value: MatchModeConfig) -> Self {
		match value {
			MatchModeConfig::Full => gale_core::router::MatchMode::Full,
			MatchModeConfig::Sub => gale_core::router::MatchMode::Sub,
			MatchModeConfig::Regex => gale_core::router::MatchMode::Regex,
		}
	}
}

pub fn load(path: &Path) -> eyre::Result<Config> {
	Figment::new()
		.merge(Json::file(path))
		.merge(Env::prefixed("GALE_").split("__"))
		.extract()
		.wrap_err_with(|| format!("loading configuration from {}", path.display()))
}

/// A starter configuration: one sealed-header inbound, a direct outbound,
/// and a catch-all rule.
pub fn default_document() -> Config {
	Config {
		dns:       DnsConfig::default(),
		inbounds:  vec![InboundConfig {
			tag:      "vmess-in".into(),
			protocol: InboundProtocol::Vmess {
				listen:   "127.0.0.1:10086".parse().unwrap(),
				settings: VmessInboundSettings {
					users: vec![VmessUserConfig {
						uuid: Uuid::new_v4(),
						..VmessUserConfig::default()
					}],
					allow_legacy: false,
				},
			},
		}],
		outbounds: vec![OutboundConfig {
			tag:      "direct".into(),
			protocol: OutboundProtocol::Freedom,
		}],
		rules:     vec![RuleConfig {
			outbound:    "direct".into(),
			src_network: Some(RuleTest {
				mode:   MatchModeConfig::Full,
				values: vec!["tcp".into(), "udp".into()],
				cidrs:  Vec::new(),
			}),
			dst_network: None,
			src_ip: None,
			dst_ip: None,
			dst_domain: None,
			src_port: None,
			dst_port: None,
			inbound_tag: None,
		}],
	}
}
