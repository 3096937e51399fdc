use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
	buffer,
	debug, info,
	handler::{Dispatch, OutboundRegistry},
	net::Address,
	pipe::{Link, new_link},
	router::Matcher,
	session::Content,
	sniff::SnifferSet,
};

/// How long the first inbound payload may take to show up before dispatch
/// proceeds without it. Sniffing is opportunistic; a silent client must not
/// stall connection setup.
const FIRST_PAYLOAD_TIMEOUT: Duration = Duration::from_millis(100);

/// Binds fresh inbound links to outbound handlers: buffers a prefix, runs
/// the sniffers over it, routes, and hands the link off.
#[derive(Clone)]
pub struct Dispatcher {
	outbounds: Arc<OutboundRegistry>,
	router:    Arc<Matcher>,
	sniffers:  SnifferSet,
}

impl Dispatcher {
	pub fn new(outbounds: Arc<OutboundRegistry>, router: Arc<Matcher>, sniffers: SnifferSet) -> Self {
		Self {
			outbounds,
			router,
			sniffers,
		}
	}

	async fn run(&self, content: Content, mut address: Address, mut link: Link) {
		// Pull whatever the client sends first, bounded so a mute client
		// cannot block the dispatch.
		let prefix = match link.reader.read_timeout(FIRST_PAYLOAD_TIMEOUT).await {
			Ok(Some(mb)) => mb,
			Ok(None) => buffer::MultiBuffer::new(),
			Err(_) => buffer::MultiBuffer::new(),
		};

		if !prefix.is_empty() {
			let mut head = vec![0u8; buffer::SIZE.min(prefix.len())];
			let n = prefix.copy_to_slice(&mut head);
			if let Some(result) =
				self.sniffers.sniff(&head[..n], address.ip, address.network)
			{
				info!(
					target: "[DISPATCH]",
					"sniffed domain [{}] [{:?}] of [{}]",
					result.domain,
					result.protocol,
					address.network_and_domain_preferred()
				);
				address = address.with_domain(result.domain);
			}
		}
		// The consumed prefix goes back in front of the outbound's reads.
		link.reader.unread(prefix);

		let tag = match self.router.match_content(&content, &address) {
			Some(tag) => tag.to_string(),
			None => {
				debug!(
					target: "[DISPATCH]",
					"no matched outbound for [{}] [{}]",
					content.inbound.tag,
					address.network_and_domain_preferred()
				);
				return;
			}
		};

		let handler = match self.outbounds.get(&tag) {
			Some(handler) => handler,
			None => {
				debug!(target: "[DISPATCH]", "outbound handler not found [{tag}]");
				return;
			}
		};

		info!(
			target: "[DISPATCH]",
			"taking detour [{}] [{}] for [{}] [{}]",
			content.inbound.tag,
			tag,
			content.inbound.source.network_and_domain_preferred(),
			address.network_and_domain_preferred()
		);

		if let Err(err) = handler.dispatch(content, address, link).await {
			debug!(target: "[DISPATCH]", "dispatch through [{tag}] ended: {err:#}");
		}
	}
}

#[async_trait]
impl Dispatch for Dispatcher {
	async fn dispatch(&self, content: Content, address: Address) -> eyre::Result<Link> {
		let (inbound_link, outbound_link) = new_link();

		let this = self.clone();
		tokio::spawn(async move {
			// Dropping the link on any failed step closes the outbound half,
			// which the inbound side observes as end of stream.
			this.run(content, address, outbound_link).await;
		});

		Ok(inbound_link)
	}
}
