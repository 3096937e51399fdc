use std::sync::Arc;

use async_trait::async_trait;
use gale_core::{
	debug,
	handler::Dispatch,
	io::{BufferedSource, copy},
	net::Address,
	pipe::{Link, PipeReader, new_link},
	protocol::TransferType,
	session::Content,
};
use snafu::IntoError;

use crate::{
	client::send_closing,
	frame::{FrameMetadata, FrameTransferSnafu, MuxError, SessionOptions, SessionStatus},
	reader::{drain_chunk, read_chunk},
	session::Bundle,
	writer::SessionWriter,
};

/// Server endpoint: a dispatcher wrapper. Dispatches whose content carries
/// the multiplexing flag are unpacked into their logical sessions, each of
/// which re-enters the wrapped dispatcher on its own.
pub struct MuxServer {
	dispatcher: Arc<dyn Dispatch>,
}

impl MuxServer {
	pub fn new(dispatcher: Arc<dyn Dispatch>) -> Self {
		Self { dispatcher }
	}
}

#[async_trait]
impl Dispatch for MuxServer {
	async fn dispatch(&self, content: Content, address: Address) -> eyre::Result<Link> {
		if !content.mux {
			return self.dispatcher.dispatch(content, address).await;
		}

		let (inbound_link, outer) = new_link();
		let dispatcher = self.dispatcher.clone();
		tokio::spawn(async move {
			if let Err(err) = serve_connection(dispatcher, content, outer).await {
				debug!(target: "[MUX]", "connection ended: {err:#}");
			}
		});

		Ok(inbound_link)
	}
}

/// Frame loop of one inbound multiplexed connection.
async fn serve_connection(
	dispatcher: Arc<dyn Dispatch>,
	content: Content,
	outer: Link,
) -> Result<(), MuxError> {
	let transfer = TransferType::from(content.inbound.source.network);
	let Link { reader, writer } = outer;
	let bundle = Arc::new(Bundle::new(writer));
	let mut src = BufferedSource::new(reader);

	let result = loop {
		let meta = match FrameMetadata::read_from(&mut src).await {
			Ok(meta) => meta,
			// Client went away; tear everything down quietly.
			Err(MuxError::FrameTransfer { .. }) => break Ok(()),
			Err(err) => break Err(err),
		};

		let step = match meta.status {
			SessionStatus::New => {
				handle_new(&dispatcher, &content, &bundle, transfer, &meta, &mut src).await
			}
			SessionStatus::Keep => handle_keep(&bundle, &meta, &mut src).await,
			SessionStatus::End => {
				if let Some(writer) = bundle.remove(meta.id) {
					writer.close();
				}
				if meta.options.has(SessionOptions::DATA) {
					drain_chunk(&mut src)
						.await
						.map_err(|e| FrameTransferSnafu.into_error(e))
				} else {
					Ok(())
				}
			}
			SessionStatus::KeepAlive => {
				if meta.options.has(SessionOptions::DATA) {
					drain_chunk(&mut src)
						.await
						.map_err(|e| FrameTransferSnafu.into_error(e))
				} else {
					Ok(())
				}
			}
			SessionStatus::Other(_) => unreachable!("rejected by the frame parser"),
		};

		if let Err(err) = step {
			break Err(err);
		}
	};

	bundle.close_all();
	bundle.frames_out.close();
	result
}

/// Opens an inner dispatch for a fresh session and starts packing its
/// responses into keep frames.
async fn handle_new(
	dispatcher: &Arc<dyn Dispatch>,
	content: &Content,
	bundle: &Arc<Bundle>,
	transfer: TransferType,
	meta: &FrameMetadata,
	src: &mut BufferedSource<PipeReader>,
) -> Result<(), MuxError> {
	let target = meta.target.clone().expect("new frame carries a target");

	let mut inner_content = content.clone();
	inner_content.mux = false;
	let inner_link = match dispatcher.dispatch(inner_content, target).await {
		Ok(link) => link,
		Err(err) => {
			debug!(target: "[MUX]", "inner dispatch failed: {err:#}");
			if meta.options.has(SessionOptions::DATA) {
				drain_chunk(src)
					.await
					.map_err(|e| FrameTransferSnafu.into_error(e))?;
			}
			send_closing(bundle, meta.id).await;
			return Ok(());
		}
	};

	let Link {
		reader: mut inner_reader,
		writer: inner_writer,
	} = inner_link;
	bundle.insert(meta.id, Arc::new(inner_writer))?;

	// Response direction: inner link back to the client as keep frames.
	// The uplink writer stays in the bundle until the client's end frame;
	// the inner side finishing its responses does not end the session.
	let id = meta.id;
	let frames_out = bundle.frames_out.clone();
	tokio::spawn(async move {
		let mut session = SessionWriter::following(frames_out, id, transfer);
		if copy(&mut inner_reader, &mut session).await.is_err() {
			session.mark_error();
		}
		session.close().await;
	});

	// First payload, if the frame carried any.
	if meta.options.has(SessionOptions::DATA) {
		let chunk = read_chunk(src)
			.await
			.map_err(|e| FrameTransferSnafu.into_error(e))?;
		if let Some(writer) = bundle.get(meta.id) {
			if writer.write(chunk).await.is_err() {
				send_closing(bundle, meta.id).await;
				if let Some(w) = bundle.remove(meta.id) {
					w.close();
				}
			}
		}
	}
	Ok(())
}

/// Routes a payload frame into its session, or tells the peer the session
/// is unknown while keeping the connection aligned.
async fn handle_keep(
	bundle: &Arc<Bundle>,
	meta: &FrameMetadata,
	src: &mut BufferedSource<PipeReader>,
) -> Result<(), MuxError> {
	if !meta.options.has(SessionOptions::DATA) {
		return Ok(());
	}

	let chunk = read_chunk(src)
		.await
		.map_err(|e| FrameTransferSnafu.into_error(e))?;
	match bundle.get(meta.id) {
		Some(writer) => {
			if writer.write(chunk).await.is_err() {
				send_closing(bundle, meta.id).await;
				if let Some(w) = bundle.remove(meta.id) {
					w.close();
				}
			}
		}
		None => send_closing(bundle, meta.id).await,
	}
	Ok(())
}
