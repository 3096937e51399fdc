use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use gale_core::{
	buffer::MultiBuffer,
	io::{MultiBufferWriter, TransferError},
	net::Address,
	pipe::PipeWriter,
	protocol::TransferType,
};

use crate::frame::{
	FrameMetadata, STREAM_FRAME_SIZE, SessionId, SessionOptions, SessionStatus,
};

/// Emits the frames of one logical session onto the outer connection.
///
/// The first payload write produces a new-session frame carrying the target;
/// every following write is a keep frame. Closing emits exactly one end
/// frame, with the error option when the session died abnormally.
pub(crate) struct SessionWriter {
	out:       Arc<PipeWriter>,
	id:        SessionId,
	target:    Option<Address>,
	transfer:  TransferType,
	follow_up: bool,
	has_error: bool,
	closed:    bool,
}

impl SessionWriter {
	/// Writer that opens the session with a new-session frame.
	pub fn opening(
		out: Arc<PipeWriter>,
		id: SessionId,
		target: Address,
		transfer: TransferType,
	) -> Self {
		Self {
			out,
			id,
			target: Some(target),
			transfer,
			follow_up: false,
			has_error: false,
			closed: false,
		}
	}

	/// Writer for a session the peer opened; only emits keep and end frames.
	pub fn following(out: Arc<PipeWriter>, id: SessionId, transfer: TransferType) -> Self {
		Self {
			out,
			id,
			target: None,
			transfer,
			follow_up: true,
			has_error: false,
			closed: false,
		}
	}

	pub fn mark_error(&mut self) {
		self.has_error = true;
	}

	fn next_metadata(&mut self) -> FrameMetadata {
		let status = if self.follow_up {
			SessionStatus::Keep
		} else {
			self.follow_up = true;
			SessionStatus::New
		};
		FrameMetadata {
			id: self.id,
			status,
			options: SessionOptions::default(),
			target: if status == SessionStatus::New {
				self.target.clone()
			} else {
				None
			},
		}
	}

	/// Emits a frame with no payload. Used to open a session before any
	/// payload showed up.
	pub async fn write_meta_only(&mut self) -> Result<(), TransferError> {
		let meta = self.next_metadata();
		let mut head = BytesMut::new();
		meta.encode(&mut head)?;
		self.out.write(MultiBuffer::from_buffer(head.freeze())).await
	}

	async fn write_chunk(&mut self, chunk: MultiBuffer) -> Result<(), TransferError> {
		let mut meta = self.next_metadata();
		meta.options.set(SessionOptions::DATA);

		let mut head = BytesMut::new();
		meta.encode(&mut head)?;
		head.put_u16(chunk.len() as u16);

		let mut frame = MultiBuffer::from_buffer(head.freeze());
		frame.extend(chunk);
		self.out.write(frame).await
	}

	/// Emits the end frame and detaches from the outer connection.
	pub async fn close(&mut self) {
		if self.closed {
			return;
		}
		self.closed = true;

		let mut meta = FrameMetadata {
			id:      self.id,
			status:  SessionStatus::End,
			options: SessionOptions::default(),
			target:  None,
		};
		if self.has_error {
			meta.options.set(SessionOptions::ERROR);
		}
		// Not sending NEW before END is fine: the peer treats an unknown id
		// as already gone.
		self.follow_up = true;

		let mut head = BytesMut::new();
		if meta.encode(&mut head).is_ok() {
			let _ = self.out.write(MultiBuffer::from_buffer(head.freeze())).await;
		}
	}
}

#[async_trait]
impl MultiBufferWriter for SessionWriter {
	async fn write_mb(&mut self, mb: MultiBuffer) -> Result<(), TransferError> {
		if mb.is_empty() {
			return self.write_meta_only().await;
		}

		let mut mb = mb;
		while !mb.is_empty() {
			let chunk = match self.transfer {
				TransferType::Stream => mb.split_to(STREAM_FRAME_SIZE),
				TransferType::Packet => match mb.split_first() {
					Some(packet) => MultiBuffer::from_buffer(packet),
					None => break,
				},
			};
			self.write_chunk(chunk).await?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use gale_core::{net::Network, pipe::pipe};

	use super::*;

	async fn collect(reader: &mut gale_core::pipe::PipeReader) -> Vec<u8> {
		let mut out = Vec::new();
		while let Some(mb) = reader.read().await {
			out.extend_from_slice(&mb.to_bytes());
		}
		out
	}

	#[tokio::test]
	async fn lifecycle_emits_new_keep_end() {
		let (writer, mut reader) = pipe();
		let out = Arc::new(writer);
		let mut session = SessionWriter::opening(
			out.clone(),
			1,
			Address::from_domain(Network::Tcp, "example", 443),
			TransferType::Stream,
		);

		session
			.write_mb(MultiBuffer::from_bytes(b"hello"))
			.await
			.unwrap();
		session
			.write_mb(MultiBuffer::from_bytes(b"again"))
			.await
			.unwrap();
		session.close().await;
		out.close();

		let wire = collect(&mut reader).await;
		let expected = [
			// new + data, len 5 chunk
			"001000010101", "01", "01bb", "0207", &hex::encode(b"example"), "0005",
			&hex::encode(b"hello"),
			// keep + data, len 5 chunk
			"000400010201", "0005", &hex::encode(b"again"),
			// end
			"000400010300",
		]
		.concat();
		assert_eq!(hex::encode(wire), expected);
	}

	#[tokio::test]
	async fn error_close_sets_the_error_option() {
		let (writer, mut reader) = pipe();
		let out = Arc::new(writer);
		let mut session = SessionWriter::following(out.clone(), 7, TransferType::Stream);
		session.mark_error();
		session.close().await;
		session.close().await; // second close is a no-op
		out.close();

		let wire = collect(&mut reader).await;
		assert_eq!(hex::encode(wire), "000400070302");
	}

	#[tokio::test]
	async fn large_stream_writes_split_into_frames() {
		let (writer, mut reader) = pipe();
		let out = Arc::new(writer);
		let mut session = SessionWriter::following(out.clone(), 2, TransferType::Stream);

		session
			.write_mb(MultiBuffer::from_bytes(&vec![0xaa; STREAM_FRAME_SIZE + 100]))
			.await
			.unwrap();
		out.close();

		let wire = collect(&mut reader).await;
		// keep(8k chunk) + keep(100 chunk)
		let first_header = hex::encode([0x00, 0x04, 0x00, 0x02, 0x02, 0x01, 0x20, 0x00]);
		assert!(hex::encode(&wire).starts_with(&first_header));
		let second_at = 6 + 2 + STREAM_FRAME_SIZE;
		assert_eq!(
			hex::encode(&wire[second_at..second_at + 8]),
			"000400020201" // keep + data
				.to_string() + "0064" // 100 bytes
		);
	}

	#[tokio::test]
	async fn packet_writes_keep_datagram_boundaries() {
		let (writer, mut reader) = pipe();
		let out = Arc::new(writer);
		let mut session = SessionWriter::following(out.clone(), 3, TransferType::Packet);

		let mut two_packets = MultiBuffer::from_bytes(b"aaa");
		two_packets.extend(MultiBuffer::from_bytes(b"bb"));
		session.write_mb(two_packets).await.unwrap();
		out.close();

		let wire = collect(&mut reader).await;
		let expected = [
			"000400030201", "0003", &hex::encode(b"aaa"),
			"000400030201", "0002", &hex::encode(b"bb"),
		]
		.concat();
		assert_eq!(hex::encode(wire), expected);
	}
}
