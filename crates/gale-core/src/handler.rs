use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
	debug, info,
	net::Address,
	pipe::{Link, new_link},
	session::{Content, InboundMeta},
	transport::{BoxedStream, DatagramDialer, LinkStream, StreamDialer, StreamListener},
};

/// The dispatch entry point. One instance exists per running system; every
/// inbound and the multiplexing server funnel through it.
#[async_trait]
pub trait Dispatch: Send + Sync {
	async fn dispatch(&self, content: Content, address: Address) -> eyre::Result<Link>;
}

/// An outbound handler bound to a tag. Given a link it performs protocol
/// encoding and the transport dial.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
	fn tag(&self) -> &str;

	async fn dispatch(&self, content: Content, address: Address, link: Link) -> eyre::Result<()>;
}

/// An inbound handler bound to a tag.
pub trait InboundHandler: Send + Sync {
	fn tag(&self) -> &str;

	fn close(&self);
}

/// Protocol encoder run by an outbound once the link is ready.
#[async_trait]
pub trait ProxyClient: Send + Sync {
	async fn process(
		&self,
		content: Content,
		address: Address,
		link: Link,
		dialers: &Dialers,
	) -> eyre::Result<()>;
}

/// Protocol decoder run by an inbound for every accepted raw connection.
#[async_trait]
pub trait ProxyServer: Send + Sync {
	async fn process(
		&self,
		content: Content,
		conn: BoxedStream,
		dispatcher: Arc<dyn Dispatch>,
	) -> eyre::Result<()>;
}

/// The dial functions an outbound hands to its proxy client.
#[derive(Clone)]
pub struct Dialers {
	pub stream:   Arc<dyn StreamDialer>,
	pub datagram: Arc<dyn DatagramDialer>,
}

/// Standard outbound: a proxy client plus its transport dialers.
pub struct Outbound {
	tag:     String,
	client:  Arc<dyn ProxyClient>,
	dialers: Dialers,
}

impl Outbound {
	pub fn new(tag: impl Into<String>, client: Arc<dyn ProxyClient>, dialers: Dialers) -> Self {
		Self {
			tag: tag.into(),
			client,
			dialers,
		}
	}
}

#[async_trait]
impl OutboundHandler for Outbound {
	fn tag(&self) -> &str {
		&self.tag
	}

	async fn dispatch(&self, content: Content, address: Address, link: Link) -> eyre::Result<()> {
		self.client.process(content, address, link, &self.dialers).await
	}
}

/// Stream dialer that tunnels through another outbound instead of the host
/// stack, which is how outbound chains are built.
pub struct ForwardDialer {
	via:     Arc<dyn OutboundHandler>,
	content: Content,
}

impl ForwardDialer {
	pub fn new(via: Arc<dyn OutboundHandler>, content: Content) -> Self {
		Self { via, content }
	}
}

#[async_trait]
impl StreamDialer for ForwardDialer {
	async fn dial(&self, _source: &Address, destination: &Address) -> eyre::Result<BoxedStream> {
		let (near, far) = new_link();
		let via = self.via.clone();
		let content = self.content.clone();
		let destination = destination.clone();
		tokio::spawn(async move {
			if let Err(err) = via.dispatch(content, destination, far).await {
				debug!(target: "[OUT]", "forward dial chain ended: {err:#}");
			}
		});
		Ok(Box::new(LinkStream::new(near)))
	}
}

/// Outbound lookup table. Populated during configuration load, read-only
/// afterwards.
#[derive(Default)]
pub struct OutboundRegistry {
	handlers: HashMap<String, Arc<dyn OutboundHandler>>,
}

impl OutboundRegistry {
	pub fn insert(&mut self, handler: Arc<dyn OutboundHandler>) {
		self.handlers.insert(handler.tag().to_string(), handler);
	}

	pub fn get(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
		self.handlers.get(tag).cloned()
	}
}

/// Inbound lookup table.
#[derive(Default)]
pub struct InboundRegistry {
	handlers: HashMap<String, Arc<dyn InboundHandler>>,
}

impl InboundRegistry {
	pub fn insert(&mut self, handler: Arc<dyn InboundHandler>) {
		self.handlers.insert(handler.tag().to_string(), handler);
	}

	pub fn get(&self, tag: &str) -> Option<Arc<dyn InboundHandler>> {
		self.handlers.get(tag).cloned()
	}

	pub fn close_all(&self) {
		for handler in self.handlers.values() {
			handler.close();
		}
	}
}

/// Stream inbound: accepts raw connections and runs the configured protocol
/// decoder over each, one task per connection.
pub struct StreamInbound {
	tag:    String,
	server: Arc<dyn ProxyServer>,
	cancel: CancellationToken,
}

impl StreamInbound {
	pub fn new(tag: impl Into<String>, server: Arc<dyn ProxyServer>) -> Self {
		Self {
			tag: tag.into(),
			server,
			cancel: CancellationToken::new(),
		}
	}

	/// Accept loop. Runs until [`InboundHandler::close`] is called or the
	/// listener dies.
	pub async fn serve(
		&self,
		listener: Arc<dyn StreamListener>,
		dispatcher: Arc<dyn Dispatch>,
	) -> eyre::Result<()> {
		let local = listener.local_addr()?;
		info!(target: "[IN]", "inbound [{}] listening on {}", self.tag, local);

		loop {
			let accepted = tokio::select! {
				_ = self.cancel.cancelled() => {
					info!(target: "[IN]", "inbound [{}] closed", self.tag);
					return Ok(());
				}
				accepted = listener.accept() => accepted,
			};
			let (conn, peer) = match accepted {
				Ok(pair) => pair,
				Err(err) => {
					debug!(target: "[IN]", "inbound [{}] accept failed: {err:#}", self.tag);
					continue;
				}
			};

			let content = Content::new(self.meta(peer, local));
			let server = self.server.clone();
			let dispatcher = dispatcher.clone();
			let tag = self.tag.clone();
			tokio::spawn(async move {
				if let Err(err) = server.process(content, conn, dispatcher).await {
					debug!(target: "[IN]", "inbound [{tag}] connection ended: {err:#}");
				}
			});
		}
	}

	fn meta(&self, peer: SocketAddr, local: SocketAddr) -> InboundMeta {
		InboundMeta {
			source:  Address::from_socket_addr(crate::net::Network::Tcp, peer),
			gateway: Address::from_socket_addr(crate::net::Network::Tcp, local),
			tag:     self.tag.clone(),
		}
	}
}

impl InboundHandler for StreamInbound {
	fn tag(&self) -> &str {
		&self.tag
	}

	fn close(&self) {
		self.cancel.cancel();
	}
}

#[cfg(test)]
mod test {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;
	use crate::{buffer::MultiBuffer, net::Network};

	/// Outbound that uppercases whatever flows through it.
	struct ShoutingOutbound;

	#[async_trait]
	impl OutboundHandler for ShoutingOutbound {
		fn tag(&self) -> &str {
			"shout"
		}

		async fn dispatch(
			&self,
			_content: Content,
			_address: Address,
			mut link: Link,
		) -> eyre::Result<()> {
			while let Some(mb) = link.reader.read().await {
				let loud: Vec<u8> = mb.to_bytes().iter().map(u8::to_ascii_uppercase).collect();
				link.writer.write(MultiBuffer::from_bytes(&loud)).await?;
			}
			link.writer.close();
			Ok(())
		}
	}

	#[tokio::test]
	async fn forward_dialer_tunnels_through_the_wrapped_outbound() {
		let content = Content::new(InboundMeta {
			source:  Address::parse(Network::Tcp, "10.0.0.1:40000").unwrap(),
			gateway: Address::parse(Network::Tcp, "127.0.0.1:1080").unwrap(),
			tag:     "entry".into(),
		});
		let dialer = ForwardDialer::new(Arc::new(ShoutingOutbound), content);

		let destination = Address::from_domain(Network::Tcp, "upstream.example", 443);
		let mut stream = dialer
			.dial(&destination, &destination)
			.await
			.expect("forward dial succeeds");

		stream.write_all(b"quiet words").await.unwrap();
		stream.shutdown().await.unwrap();

		let mut out = Vec::new();
		stream.read_to_end(&mut out).await.unwrap();
		assert_eq!(out, b"QUIET WORDS");
	}
}
