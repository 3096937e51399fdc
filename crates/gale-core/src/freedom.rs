use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::WrapErr;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::UdpSocket,
};

use crate::{
	buffer::MultiBuffer,
	handler::{Dialers, ProxyClient},
	net::{Address, Network},
	pipe::Link,
	session::Content,
	transport::BoxedStream,
};

/// How long an idle datagram exchange is kept alive.
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// The direct outbound: dials the destination as-is and shuttles payload
/// without any re-encoding. Doubles as the terminal hop of every outbound
/// chain.
pub struct Freedom;

#[async_trait]
impl ProxyClient for Freedom {
	async fn process(
		&self,
		content: Content,
		address: Address,
		link: Link,
		dialers: &Dialers,
	) -> eyre::Result<()> {
		match address.network {
			Network::Tcp => {
				let stream = dialers
					.stream
					.dial(&content.inbound.source, &address)
					.await
					.wrap_err("direct dial failed")?;
				relay_stream(link, stream).await
			}
			Network::Udp => {
				let socket = dialers
					.datagram
					.dial(&content.inbound.source, &address)
					.await
					.wrap_err("direct udp dial failed")?;
				relay_datagrams(link, socket).await
			}
		}
	}
}

/// Runs both copy directions between a link and a byte stream. The stream's
/// write side is shut down when the link ends, and the link writer is closed
/// when the stream reaches end of stream.
pub async fn relay_stream(link: Link, stream: BoxedStream) -> eyre::Result<()> {
	let (mut read_half, mut write_half) = tokio::io::split(stream);
	let Link { mut reader, writer } = link;

	let uplink = async {
		while let Some(mb) = reader.read().await {
			for buf in mb {
				write_half.write_all(&buf).await?;
			}
			write_half.flush().await?;
		}
		write_half.shutdown().await?;
		Ok::<_, std::io::Error>(())
	};

	let downlink = async {
		let mut buf = vec![0u8; 8 * 1024];
		loop {
			let n = read_half.read(&mut buf).await?;
			if n == 0 {
				writer.close();
				return Ok(());
			}
			if writer.write(MultiBuffer::from_bytes(&buf[..n])).await.is_err() {
				// Inbound side is gone; nothing left to deliver to.
				return Ok::<_, std::io::Error>(());
			}
		}
	};

	tokio::try_join!(uplink, downlink)?;
	Ok(())
}

/// Datagram flavor: one pipe buffer is one datagram in both directions.
pub async fn relay_datagrams(link: Link, socket: Arc<UdpSocket>) -> eyre::Result<()> {
	let Link { mut reader, writer } = link;

	let uplink = {
		let socket = socket.clone();
		async move {
			while let Some(mb) = reader.read().await {
				for packet in mb {
					socket.send(&packet).await?;
				}
			}
			Ok::<_, std::io::Error>(())
		}
	};

	let downlink = async move {
		let mut buf = vec![0u8; 64 * 1024];
		loop {
			let n = match tokio::time::timeout(UDP_IDLE_TIMEOUT, socket.recv(&mut buf)).await {
				Ok(result) => result?,
				Err(_) => {
					writer.close();
					return Ok(());
				}
			};
			if writer.write(MultiBuffer::from_bytes(&buf[..n])).await.is_err() {
				return Ok::<_, std::io::Error>(());
			}
		}
	};

	tokio::try_join!(uplink, downlink)?;
	Ok(())
}

#[cfg(test)]
mod test {
	use std::net::SocketAddr;

	use tokio::net::{TcpListener, TcpStream};

	use super::*;
	use crate::{
		handler::Dialers,
		net::Network,
		pipe::new_link,
		session::{Content, InboundMeta},
		transport::SystemDialer,
	};

	fn content_for(peer: SocketAddr) -> Content {
		Content::new(InboundMeta {
			source:  Address::from_socket_addr(Network::Tcp, peer),
			gateway: Address::parse(Network::Tcp, "127.0.0.1:0").unwrap(),
			tag:     "test".into(),
		})
	}

	#[tokio::test]
	async fn direct_tcp_round_trip() -> eyre::Result<()> {
		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let echo_addr = listener.local_addr()?;
		tokio::spawn(async move {
			let (mut conn, _) = listener.accept().await.unwrap();
			let mut buf = vec![0u8; 64];
			let n = conn.read(&mut buf).await.unwrap();
			conn.write_all(&buf[..n]).await.unwrap();
		});

		let (near, far) = new_link();
		let dialers = Dialers {
			stream:   Arc::new(SystemDialer),
			datagram: Arc::new(SystemDialer),
		};
		let destination = Address::from_socket_addr(Network::Tcp, echo_addr);
		let content = content_for("127.0.0.1:55555".parse().unwrap());
		tokio::spawn(async move {
			let _ = Freedom.process(content, destination, far, &dialers).await;
		});

		let mut near = near;
		near.writer.write(MultiBuffer::from_bytes(b"echo me")).await?;
		near.writer.close();

		let got = near.reader.read().await.unwrap();
		assert_eq!(got.to_bytes().as_ref(), b"echo me");
		Ok(())
	}

	#[tokio::test]
	async fn stream_eof_closes_link_writer() -> eyre::Result<()> {
		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;
		tokio::spawn(async move {
			// Accept and immediately close.
			let _ = listener.accept().await;
		});

		let stream = TcpStream::connect(addr).await?;
		let (near, far) = new_link();
		tokio::spawn(async move {
			let _ = relay_stream(far, Box::new(stream)).await;
		});

		let mut near = near;
		near.writer.close();
		assert!(near.reader.read().await.is_none());
		Ok(())
	}
}
