use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::IntoError;
use gale_core::{
	debug,
	handler::OutboundHandler,
	io::{BufferedSource, TimeoutReader, copy},
	net::Address,
	pipe::{Link, PipeReader, new_link},
	protocol::TransferType,
	session::Content,
};

use crate::{
	frame::{MuxError, SessionOptions, SessionStatus},
	reader::{drain_chunk, read_chunk},
	session::{Bundle, SessionsManager},
	writer::SessionWriter,
};

/// The first read of a fresh session waits this long so a new-session frame
/// can go out without payload when the application is slow to speak.
const FIRST_PAYLOAD_TIMEOUT: Duration = Duration::from_millis(100);

/// Client endpoint: an outbound wrapper that packs every dispatch it
/// receives into multiplexed sessions over shared outer connections.
pub struct MuxClient {
	inner:   Arc<dyn OutboundHandler>,
	manager: Arc<SessionsManager>,
}

impl MuxClient {
	/// Wraps `inner`; dispatches re-enter it exactly once per bundle with
	/// the multiplexing flag set on the content.
	pub fn new(inner: Arc<dyn OutboundHandler>) -> Self {
		Self {
			inner,
			manager: Arc::new(SessionsManager::default()),
		}
	}

	fn obtain_bundle(&self, content: &Content, address: &Address) -> Arc<Bundle> {
		let key = address.network_and_domain_preferred();
		let (outer, far) = new_link();
		let Link {
			reader: outer_reader,
			writer: outer_writer,
		} = outer;

		let fresh = Arc::new(Bundle::new(outer_writer));
		let (bundle, created) = self.manager.require_or_insert(&key, fresh);
		if !created {
			return bundle;
		}

		// Feed the far side of the outer link into the wrapped outbound.
		let inner = self.inner.clone();
		let mut forwarded = content.clone();
		forwarded.mux = true;
		let forward_address = address.clone();
		tokio::spawn(async move {
			if let Err(err) = inner.dispatch(forwarded, forward_address, far).await {
				debug!(target: "[MUX]", "outer connection ended: {err:#}");
			}
		});

		// Drive the server-to-client direction.
		let manager = self.manager.clone();
		let read_bundle = bundle.clone();
		tokio::spawn(async move {
			if let Err(err) = read_loop(read_bundle.clone(), outer_reader).await {
				debug!(target: "[MUX]", "read loop ended: {err:#}");
			}
			read_bundle.close_all();
			read_bundle.frames_out.close();
			manager.remove(&key);
		});

		bundle
	}
}

#[async_trait]
impl OutboundHandler for MuxClient {
	fn tag(&self) -> &str {
		self.inner.tag()
	}

	async fn dispatch(&self, content: Content, address: Address, link: Link) -> eyre::Result<()> {
		let transfer = TransferType::from(content.inbound.source.network);
		let bundle = self.obtain_bundle(&content, &address);

		let id = bundle.allocate_id();
		let Link { reader, writer } = link;
		bundle.insert(id, Arc::new(writer))?;

		let mut session =
			SessionWriter::opening(bundle.frames_out.clone(), id, address, transfer);
		let result = pump_session(&mut session, reader).await;
		if result.is_err() {
			session.mark_error();
		}
		// The response direction stays open: the session leaves the bundle
		// when the peer's end frame arrives, not when our uplink finishes.
		session.close().await;

		result.map_err(|err| eyre::eyre!("session ended: {err}"))
	}
}

/// Copies application payload into session frames. The bounded first read
/// lets the new-session frame go out alone when nothing arrives quickly.
async fn pump_session(
	session: &mut SessionWriter,
	mut reader: PipeReader,
) -> Result<(), gale_core::io::CopyError> {
	let mut first = TimeoutReader::new(&mut reader, FIRST_PAYLOAD_TIMEOUT);
	match copy(&mut first, session).await {
		Ok(()) => return Ok(()),
		Err(err) if err.is_read_timeout() => {
			session.write_meta_only().await.map_err(|source| {
				gale_core::io::WriteSideSnafu.into_error(source)
			})?;
		}
		Err(err) => return Err(err),
	}

	copy(&mut reader, session).await
}

/// Parses frames coming back from the server and routes payload into the
/// matching session links.
async fn read_loop(bundle: Arc<Bundle>, reader: PipeReader) -> Result<(), MuxError> {
	let mut src = BufferedSource::new(reader);

	loop {
		let meta = match crate::frame::FrameMetadata::read_from(&mut src).await {
			Ok(meta) => meta,
			// Outer connection is gone; normal teardown.
			Err(MuxError::FrameTransfer { .. }) => return Ok(()),
			Err(err) => return Err(err),
		};

		match meta.status {
			SessionStatus::KeepAlive | SessionStatus::New => {
				// Neither is expected on client ingress; keepalives are
				// no-ops and a stray new-session frame is just drained.
				if meta.options.has(SessionOptions::DATA) {
					drain_chunk(&mut src).await.context_frame()?;
				}
			}
			SessionStatus::Keep => {
				if !meta.options.has(SessionOptions::DATA) {
					continue;
				}
				let chunk = read_chunk(&mut src).await.context_frame()?;
				match bundle.get(meta.id) {
					Some(writer) => {
						if writer.write(chunk).await.is_err() {
							// Session sink is gone; tell the peer to stop.
							send_closing(&bundle, meta.id).await;
							if let Some(w) = bundle.remove(meta.id) {
								w.close();
							}
						}
					}
					None => send_closing(&bundle, meta.id).await,
				}
			}
			SessionStatus::End => {
				if let Some(writer) = bundle.remove(meta.id) {
					writer.close();
				}
				if meta.options.has(SessionOptions::DATA) {
					drain_chunk(&mut src).await.context_frame()?;
				}
			}
			SessionStatus::Other(_) => unreachable!("rejected by the frame parser"),
		}
	}
}

/// Emits a bare end frame to tell the peer a session it still references is
/// gone on this side.
pub(crate) async fn send_closing(bundle: &Bundle, id: crate::frame::SessionId) {
	let mut writer = SessionWriter::following(
		bundle.frames_out.clone(),
		id,
		TransferType::Stream,
	);
	writer.close().await;
}

/// Maps chunk-level transfer failures into the frame error domain.
trait FrameContext<T> {
	fn context_frame(self) -> Result<T, MuxError>;
}

impl<T> FrameContext<T> for Result<T, gale_core::io::TransferError> {
	fn context_frame(self) -> Result<T, MuxError> {
		self.map_err(|source| crate::frame::FrameTransferSnafu.into_error(source))
	}
}
