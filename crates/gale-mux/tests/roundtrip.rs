use std::{
	sync::{Arc, Mutex},
	time::Duration,
};

use async_trait::async_trait;
use bytes::BytesMut;
use gale_core::{
	buffer::MultiBuffer,
	handler::{Dispatch, OutboundHandler},
	net::{Address, Network},
	pipe::{Link, new_link},
	session::{Content, InboundMeta},
};
use gale_mux::{FrameMetadata, MuxClient, MuxServer, SessionOptions, SessionStatus};
use tokio::sync::mpsc;

fn content() -> Content {
	Content::new(InboundMeta {
		source:  Address::parse(Network::Tcp, "10.0.0.1:40000").unwrap(),
		gateway: Address::parse(Network::Tcp, "127.0.0.1:1080").unwrap(),
		tag:     "entry".into(),
	})
}

/// Outbound that hands the outer link to the test instead of a transport.
struct CaptureOutbound {
	links: mpsc::UnboundedSender<Link>,
}

#[async_trait]
impl OutboundHandler for CaptureOutbound {
	fn tag(&self) -> &str {
		"capture"
	}

	async fn dispatch(&self, content: Content, _address: Address, link: Link) -> eyre::Result<()> {
		assert!(content.mux, "outer dispatch must carry the mux flag");
		self.links.send(link).ok();
		// Keep the dispatch alive; the test owns the link now.
		std::future::pending::<()>().await;
		Ok(())
	}
}

async fn read_all_frames(link: &mut Link, expected_frames: usize) -> Vec<u8> {
	let mut wire = Vec::new();
	let mut frames = 0;
	while frames < expected_frames {
		let mb = tokio::time::timeout(Duration::from_secs(2), link.reader.read())
			.await
			.expect("frame arrives in time")
			.expect("outer link still open");
		wire.extend_from_slice(&mb.to_bytes());
		frames += 1;
	}
	wire
}

#[test_log::test(tokio::test)]
async fn client_emits_new_chunk_end_for_one_session() {
	let (links_tx, mut links_rx) = mpsc::unbounded_channel();
	let client = Arc::new(MuxClient::new(Arc::new(CaptureOutbound { links: links_tx })));

	let (mut user, user_far) = new_link();
	user.writer
		.write(MultiBuffer::from_bytes(b"hello"))
		.await
		.unwrap();
	user.writer.close();

	let destination = Address::from_domain(Network::Tcp, "example", 443);
	let dispatch_client = client.clone();
	let dispatch_content = content();
	tokio::spawn(async move {
		let _ = dispatch_client
			.dispatch(dispatch_content, destination, user_far)
			.await;
	});

	let mut outer = links_rx.recv().await.expect("outer link opens");
	let wire = read_all_frames(&mut outer, 2).await;

	let expected = [
		"0010", "0001", "01", "01", // len, id 1, new, data
		"01", "01bb", "0207", &hex::encode(b"example"), // tcp example:443
		"0005", &hex::encode(b"hello"),
		"0004", "0001", "03", "00", // end
	]
	.concat();
	assert_eq!(hex::encode(wire), expected);
}

#[test_log::test(tokio::test)]
async fn sessions_to_one_target_share_the_outer_link() {
	let (links_tx, mut links_rx) = mpsc::unbounded_channel();
	let client = Arc::new(MuxClient::new(Arc::new(CaptureOutbound { links: links_tx })));

	let destination = Address::from_domain(Network::Tcp, "shared.example", 80);
	for _ in 0..2 {
		let (user, user_far) = new_link();
		let dispatch_client = client.clone();
		let dispatch_destination = destination.clone();
		let dispatch_content = content();
		tokio::spawn(async move {
			let _ = dispatch_client
				.dispatch(dispatch_content, dispatch_destination, user_far)
				.await;
		});
		// Keep the user side alive past the test assertions.
		std::mem::forget(user);
	}

	let _outer = links_rx.recv().await.expect("first dispatch opens the outer link");
	assert!(
		tokio::time::timeout(Duration::from_millis(300), links_rx.recv())
			.await
			.is_err(),
		"second dispatch must reuse the existing bundle"
	);
}

/// Dispatcher stub that records inner targets and echoes payload back.
struct EchoDispatcher {
	targets: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Dispatch for EchoDispatcher {
	async fn dispatch(&self, _content: Content, address: Address) -> eyre::Result<Link> {
		self.targets
			.lock()
			.unwrap()
			.push(address.network_and_domain_preferred());
		let (near, far) = new_link();
		tokio::spawn(async move {
			let Link { mut reader, writer } = far;
			while let Some(mb) = reader.read().await {
				if writer.write(mb).await.is_err() {
					return;
				}
			}
			writer.close();
		});
		Ok(near)
	}
}

fn encode_keep(id: u16, payload: &[u8]) -> MultiBuffer {
	let mut options = SessionOptions::default();
	options.set(SessionOptions::DATA);
	let meta = FrameMetadata {
		id,
		status: SessionStatus::Keep,
		options,
		target: None,
	};
	let mut wire = BytesMut::new();
	meta.encode(&mut wire).unwrap();
	wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
	wire.extend_from_slice(payload);
	MultiBuffer::from_buffer(wire.freeze())
}

fn encode_new(id: u16, target: &Address, payload: &[u8]) -> MultiBuffer {
	let mut options = SessionOptions::default();
	options.set(SessionOptions::DATA);
	let meta = FrameMetadata {
		id,
		status: SessionStatus::New,
		options,
		target: Some(target.clone()),
	};
	let mut wire = BytesMut::new();
	meta.encode(&mut wire).unwrap();
	wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
	wire.extend_from_slice(payload);
	MultiBuffer::from_buffer(wire.freeze())
}

async fn next_frame(link: &mut Link) -> (FrameMetadata, Vec<u8>) {
	let mut pending = BytesMut::new();
	loop {
		let mb = tokio::time::timeout(Duration::from_secs(2), link.reader.read())
			.await
			.expect("frame arrives in time")
			.expect("link open");
		pending.extend_from_slice(&mb.to_bytes());

		let mut src = gale_core::io::BufferedSource::new(&pending[..]);
		if let Ok(meta) = FrameMetadata::read_from(&mut src).await {
			let mut payload = Vec::new();
			if meta.options.has(SessionOptions::DATA) {
				if let Ok(len) = src.read_u16_be().await {
					if let Ok(data) = src.read_exact(len as usize).await {
						payload = data.to_vec();
					}
				}
			}
			return (meta, payload);
		}
	}
}

#[test_log::test(tokio::test)]
async fn server_dispatches_new_sessions_and_echoes_payload() {
	let targets = Arc::new(Mutex::new(Vec::new()));
	let server = MuxServer::new(Arc::new(EchoDispatcher {
		targets: targets.clone(),
	}));

	let mut mux_content = content();
	mux_content.mux = true;
	let carrier = Address::from_domain(Network::Tcp, "proxy.example", 443);
	let mut link = server.dispatch(mux_content, carrier).await.unwrap();

	let destination = Address::from_domain(Network::Tcp, "inner.example", 80);
	link.writer
		.write(encode_new(1, &destination, b"hello"))
		.await
		.unwrap();

	let (meta, payload) = next_frame(&mut link).await;
	assert_eq!(meta.id, 1);
	assert_eq!(meta.status, SessionStatus::Keep);
	assert_eq!(payload, b"hello");
	assert_eq!(
		targets.lock().unwrap().as_slice(),
		["tcp:inner.example:80".to_string()]
	);
}

#[test_log::test(tokio::test)]
async fn unknown_session_gets_an_end_and_the_link_survives() {
	let targets = Arc::new(Mutex::new(Vec::new()));
	let server = MuxServer::new(Arc::new(EchoDispatcher {
		targets: targets.clone(),
	}));

	let mut mux_content = content();
	mux_content.mux = true;
	let carrier = Address::from_domain(Network::Tcp, "proxy.example", 443);
	let mut link = server.dispatch(mux_content, carrier).await.unwrap();

	// Payload for a session that was never opened.
	link.writer.write(encode_keep(9, b"stray")).await.unwrap();

	let (meta, _) = next_frame(&mut link).await;
	assert_eq!(meta.id, 9);
	assert_eq!(meta.status, SessionStatus::End);
	assert!(!meta.options.has(SessionOptions::ERROR));

	// The connection must still work for a proper session afterwards.
	let destination = Address::from_domain(Network::Tcp, "after.example", 80);
	link.writer
		.write(encode_new(2, &destination, b"still here"))
		.await
		.unwrap();

	let (meta, payload) = next_frame(&mut link).await;
	assert_eq!(meta.id, 2);
	assert_eq!(meta.status, SessionStatus::Keep);
	assert_eq!(payload, b"still here");
}

#[test_log::test(tokio::test)]
async fn end_to_end_echo_through_client_and_server() {
	let targets = Arc::new(Mutex::new(Vec::new()));
	let dispatcher = Arc::new(MuxServer::new(Arc::new(EchoDispatcher {
		targets: targets.clone(),
	})));

	/// Couples the client's outer link straight into the server dispatcher,
	/// standing in for the encrypted transport between the two.
	struct Loopback {
		dispatcher: Arc<MuxServer>,
	}

	#[async_trait]
	impl OutboundHandler for Loopback {
		fn tag(&self) -> &str {
			"loopback"
		}

		async fn dispatch(
			&self,
			content: Content,
			address: Address,
			link: Link,
		) -> eyre::Result<()> {
			let server_link = self.dispatcher.dispatch(content, address).await?;
			let Link { mut reader, writer } = link;
			let Link {
				reader: mut server_reader,
				writer: server_writer,
			} = server_link;

			let uplink = async {
				while let Some(mb) = reader.read().await {
					if server_writer.write(mb).await.is_err() {
						break;
					}
				}
				server_writer.close();
			};
			let downlink = async {
				while let Some(mb) = server_reader.read().await {
					if writer.write(mb).await.is_err() {
						break;
					}
				}
				writer.close();
			};
			tokio::join!(uplink, downlink);
			Ok(())
		}
	}

	let client = Arc::new(MuxClient::new(Arc::new(Loopback { dispatcher })));

	let destination = Address::from_domain(Network::Tcp, "echo.example", 7);
	let (mut user, user_far) = new_link();
	let dispatch_client = client.clone();
	let dispatch_content = content();
	let dispatch_destination = destination.clone();
	tokio::spawn(async move {
		let _ = dispatch_client
			.dispatch(dispatch_content, dispatch_destination, user_far)
			.await;
	});

	user.writer
		.write(MultiBuffer::from_bytes(b"round and round"))
		.await
		.unwrap();

	let echoed = tokio::time::timeout(Duration::from_secs(2), user.reader.read())
		.await
		.expect("echo arrives")
		.expect("session open");
	assert_eq!(echoed.to_bytes().as_ref(), b"round and round");
	assert_eq!(
		targets.lock().unwrap().as_slice(),
		["tcp:echo.example:7".to_string()]
	);
}
