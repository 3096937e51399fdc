use std::{path::PathBuf, sync::Arc};

use clap::Parser as _;
use gale_core::{
	dispatch::Dispatcher,
	fakedns::FakeDnsPool,
	freedom::Freedom,
	handler::{
		Dialers, Dispatch, InboundRegistry, Outbound, OutboundHandler, OutboundRegistry,
		StreamInbound,
	},
	info,
	net::{Address, Network},
	router::{Condition, Field, MatchMode, Matcher, Rule, Test},
	sniff::SnifferSet,
	transport::{SystemDialer, TcpHub},
};
use gale_mux::{MuxClient, MuxServer};
use gale_vmess::{User, UserValidator, VmessClient, VmessServer};
use tracing::Level;

use crate::conf::{
	Config, InboundProtocol, OutboundProtocol, RuleConfig, RuleTest, VmessInboundSettings,
};

mod cli;
mod conf;
mod log;

fn main() -> eyre::Result<()> {
	let cli = match cli::Cli::try_parse() {
		Ok(cli) => cli,
		Err(err) => {
			println!("{err:#}");
			return Ok(());
		}
	};

	if cli.version {
		println!("gale {}", env!("CARGO_PKG_VERSION"));
		return Ok(());
	}

	match cli.command {
		Some(cli::Commands::Init { output }) => {
			let document = conf::default_document();
			std::fs::write(&output, serde_json::to_string_pretty(&document)?)?;
			println!("wrote {}", output.display());
			return Ok(());
		}
		Some(cli::Commands::Check { file }) => {
			conf::load(&file)?;
			println!("{} is valid", file.display());
			return Ok(());
		}
		None => {}
	}

	let level = if cli.debug { Level::DEBUG } else { Level::INFO };
	log::init_log(level)?;

	let config_path = cli.config.unwrap_or_else(|| PathBuf::from("gale.json"));
	let config = conf::load(&config_path)?;

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(config))
}

async fn run(config: Config) -> eyre::Result<()> {
	info!(target: "[MAIN]", "gale starting");

	let fake_pool = config
		.dns
		.fake
		.as_ref()
		.map(|fake| Arc::new(FakeDnsPool::new(fake.ipv4_range, fake.ipv6_range)));

	let outbounds = Arc::new(build_outbounds(&config)?);
	let router = Arc::new(build_router(&config));
	let sniffers = SnifferSet::standard(fake_pool);

	let dispatcher = Arc::new(Dispatcher::new(outbounds, router, sniffers));
	// Multiplexed inbound sessions unpack right above the dispatcher.
	let dispatcher: Arc<dyn Dispatch> = Arc::new(MuxServer::new(dispatcher));

	let mut inbounds = InboundRegistry::default();
	let mut servers = tokio::task::JoinSet::new();
	for inbound in &config.inbounds {
		let InboundProtocol::Vmess { listen, settings } = &inbound.protocol;
		let handler = Arc::new(StreamInbound::new(
			inbound.tag.clone(),
			build_vmess_server(settings),
		));
		inbounds.insert(handler.clone());

		let listener = Arc::new(TcpHub::bind(*listen).await?);
		let dispatcher = dispatcher.clone();
		servers.spawn(async move { handler.serve(listener, dispatcher).await });
	}

	tokio::signal::ctrl_c().await?;
	info!(target: "[MAIN]", "shutting down");
	inbounds.close_all();
	servers.shutdown().await;
	Ok(())
}

fn build_vmess_server(settings: &VmessInboundSettings) -> Arc<VmessServer> {
	let validator = Arc::new(UserValidator::default());
	for user in &settings.users {
		let mut account = User::new(user.uuid, user.alter_id, user.security.into());
		if let Some(email) = &user.email {
			account = account.with_email(email.clone());
		}
		validator.add(account);
	}
	validator.spawn_refresh();

	let server = VmessServer::new(validator);
	Arc::new(if settings.allow_legacy {
		server.with_legacy_allowed()
	} else {
		server
	})
}

fn build_outbounds(config: &Config) -> eyre::Result<OutboundRegistry> {
	let dialers = Dialers {
		stream:   Arc::new(SystemDialer),
		datagram: Arc::new(SystemDialer),
	};

	let mut registry = OutboundRegistry::default();
	for outbound in &config.outbounds {
		let handler: Arc<dyn OutboundHandler> = match &outbound.protocol {
			OutboundProtocol::Freedom => Arc::new(Outbound::new(
				outbound.tag.clone(),
				Arc::new(Freedom),
				dialers.clone(),
			)),
			OutboundProtocol::Vmess { settings } => {
				let server = Address::parse(Network::Tcp, &settings.address)?;
				let client = Arc::new(VmessClient::new(
					server,
					User::new(settings.uuid, 0, settings.security.into()),
				));
				let handler: Arc<dyn OutboundHandler> =
					Arc::new(Outbound::new(outbound.tag.clone(), client, dialers.clone()));
				if settings.mux {
					Arc::new(MuxClient::new(handler))
				} else {
					handler
				}
			}
		};
		registry.insert(handler);
	}
	Ok(registry)
}

fn build_router(config: &Config) -> Matcher {
	let rules = config.rules.iter().map(build_rule).collect();
	Matcher::new(rules)
}

fn build_rule(rule: &RuleConfig) -> Rule {
	let mut tests = Vec::new();
	let mut push = |field: Field, test: &Option<RuleTest>| {
		if let Some(test) = test {
			tests.push(Test::new(
				field,
				MatchMode::from(test.mode),
				test.values.clone(),
				test.cidrs.clone(),
			));
		}
	};

	push(Field::SrcNetwork, &rule.src_network);
	push(Field::DstNetwork, &rule.dst_network);
	push(Field::SrcIp, &rule.src_ip);
	push(Field::DstIp, &rule.dst_ip);
	push(Field::DstDomain, &rule.dst_domain);
	push(Field::SrcPort, &rule.src_port);
	push(Field::DstPort, &rule.dst_port);
	push(Field::InboundTag, &rule.inbound_tag);

	Rule {
		condition:    Condition::new(tests),
		outbound_tag: rule.outbound.clone(),
	}
}
