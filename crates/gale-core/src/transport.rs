use std::{
	net::SocketAddr,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
};

use async_trait::async_trait;
use eyre::WrapErr;
use tokio::{
	io::{AsyncRead, AsyncWrite, ReadBuf},
	net::{TcpListener, TcpStream, UdpSocket, lookup_host},
};
use tokio_util::sync::PollSender;

use crate::{
	AbstractStream,
	buffer::MultiBuffer,
	net::Address,
	pipe::{Link, PipeReader},
};

pub type BoxedStream = Box<dyn AbstractStream>;

/// Dial seam for stream transports. Implementations stack: a TLS dialer
/// wraps another `StreamDialer` the same way a TLS listener wraps a
/// listener.
#[async_trait]
pub trait StreamDialer: Send + Sync {
	async fn dial(&self, source: &Address, destination: &Address) -> eyre::Result<BoxedStream>;
}

/// Dial seam for datagram transports.
#[async_trait]
pub trait DatagramDialer: Send + Sync {
	async fn dial(&self, source: &Address, destination: &Address) -> eyre::Result<Arc<UdpSocket>>;
}

/// Accept seam. Layered transports wrap a listener and return a listener.
#[async_trait]
pub trait StreamListener: Send + Sync {
	async fn accept(&self) -> eyre::Result<(BoxedStream, SocketAddr)>;

	fn local_addr(&self) -> eyre::Result<SocketAddr>;
}

/// Plain TCP/UDP dialing through the host stack.
pub struct SystemDialer;

impl SystemDialer {
	async fn resolve(destination: &Address) -> eyre::Result<SocketAddr> {
		if let Some(sa) = destination.socket_addr() {
			return Ok(sa);
		}
		let domain = destination
			.domain
			.as_deref()
			.ok_or_else(|| eyre::eyre!("destination has no host"))?;
		lookup_host((domain, destination.port))
			.await
			.wrap_err_with(|| format!("resolving {domain}"))?
			.next()
			.ok_or_else(|| eyre::eyre!("no address for {domain}"))
	}
}

#[async_trait]
impl StreamDialer for SystemDialer {
	async fn dial(&self, _source: &Address, destination: &Address) -> eyre::Result<BoxedStream> {
		let target = Self::resolve(destination).await?;
		let stream = TcpStream::connect(target)
			.await
			.wrap_err_with(|| format!("connecting {target}"))?;
		stream.set_nodelay(true)?;
		Ok(Box::new(stream))
	}
}

#[async_trait]
impl DatagramDialer for SystemDialer {
	async fn dial(&self, _source: &Address, destination: &Address) -> eyre::Result<Arc<UdpSocket>> {
		let target = Self::resolve(destination).await?;
		let bind: SocketAddr = if target.is_ipv6() {
			"[::]:0".parse().unwrap()
		} else {
			"0.0.0.0:0".parse().unwrap()
		};
		let socket = UdpSocket::bind(bind).await?;
		socket.connect(target).await?;
		Ok(Arc::new(socket))
	}
}

/// Plain TCP accept hub.
pub struct TcpHub {
	listener: TcpListener,
}

impl TcpHub {
	pub async fn bind(addr: SocketAddr) -> eyre::Result<Self> {
		let listener = TcpListener::bind(addr)
			.await
			.wrap_err_with(|| format!("binding {addr}"))?;
		Ok(Self { listener })
	}
}

#[async_trait]
impl StreamListener for TcpHub {
	async fn accept(&self) -> eyre::Result<(BoxedStream, SocketAddr)> {
		let (stream, peer) = self.listener.accept().await?;
		stream.set_nodelay(true)?;
		Ok((Box::new(stream), peer))
	}

	fn local_addr(&self) -> eyre::Result<SocketAddr> {
		Ok(self.listener.local_addr()?)
	}
}

/// Exposes one side of a [`Link`] as an ordinary byte stream, which is how a
/// dispatch chain is spliced under a protocol that wants a socket.
pub struct LinkStream {
	reader: PipeReader,
	writer: PollSender<MultiBuffer>,
}

impl LinkStream {
	pub fn new(link: Link) -> Self {
		let Link { reader, writer } = link;
		Self {
			reader,
			writer: PollSender::new(
				writer
					.into_sender()
					.expect("link writer already closed"),
			),
		}
	}
}

impl AsyncRead for LinkStream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.reader).poll_read(cx, buf)
	}
}

impl AsyncWrite for LinkStream {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		match self.writer.poll_reserve(cx) {
			Poll::Ready(Ok(())) => {}
			Poll::Ready(Err(_)) => {
				return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
			}
			Poll::Pending => return Poll::Pending,
		}
		match self.writer.send_item(MultiBuffer::from_bytes(buf)) {
			Ok(()) => Poll::Ready(Ok(buf.len())),
			Err(_) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		self.writer.close();
		Poll::Ready(Ok(()))
	}
}
