use std::{
	collections::VecDeque,
	pin::Pin,
	sync::Mutex,
	task::{Context, Poll},
	time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
	io::{AsyncRead, ReadBuf},
	sync::mpsc,
};

use crate::{
	buffer::MultiBuffer,
	io::{ClosedPipeSnafu, MultiBufferReader, MultiBufferWriter, ReadTimeoutSnafu, TransferError},
};

/// Queue depth of a pipe, in multi-buffers. Writers park once the reader
/// falls this far behind.
const PIPE_DEPTH: usize = 16;

/// Creates one unidirectional pipe.
pub fn pipe() -> (PipeWriter, PipeReader) {
	let (tx, rx) = mpsc::channel(PIPE_DEPTH);
	(
		PipeWriter {
			tx: Mutex::new(Some(tx)),
		},
		PipeReader {
			rx,
			pending: VecDeque::new(),
		},
	)
}

/// Write-and-close half of a pipe.
///
/// Close is idempotent; writes after close fail with `ClosedPipe`. Dropping
/// the writer closes the pipe as well, so a panicking task cannot leave its
/// peer blocked forever.
pub struct PipeWriter {
	tx: Mutex<Option<mpsc::Sender<MultiBuffer>>>,
}

impl PipeWriter {
	pub async fn write(&self, mb: MultiBuffer) -> Result<(), TransferError> {
		let tx = self.tx.lock().unwrap().clone();
		match tx {
			Some(tx) => tx.send(mb).await.map_err(|_| ClosedPipeSnafu.build()),
			None => ClosedPipeSnafu.fail(),
		}
	}

	pub fn close(&self) {
		self.tx.lock().unwrap().take();
	}

	pub fn is_closed(&self) -> bool {
		match self.tx.lock().unwrap().as_ref() {
			Some(tx) => tx.is_closed(),
			None => true,
		}
	}

	/// Surrenders the raw channel handle, closing this writer. Used by the
	/// stream bridge, which drives the channel through its own poll cycle.
	pub fn into_sender(self) -> Option<mpsc::Sender<MultiBuffer>> {
		self.tx.lock().unwrap().take()
	}
}

/// Read half of a pipe.
///
/// End of stream is observed only after the writer has closed *and* every
/// queued multi-buffer has been drained. A timed-out read is a distinct
/// error, not end of stream.
pub struct PipeReader {
	rx:      mpsc::Receiver<MultiBuffer>,
	pending: VecDeque<Bytes>,
}

impl PipeReader {
	/// Reads the next multi-buffer, `None` on end of stream.
	pub async fn read(&mut self) -> Option<MultiBuffer> {
		if let Some(mb) = self.take_pending() {
			return Some(mb);
		}
		self.rx.recv().await
	}

	/// Like [`read`](Self::read) but bounded by `timeout`.
	pub async fn read_timeout(
		&mut self,
		timeout: Duration,
	) -> Result<Option<MultiBuffer>, TransferError> {
		if let Some(mb) = self.take_pending() {
			return Ok(Some(mb));
		}
		match tokio::time::timeout(timeout, self.rx.recv()).await {
			Ok(mb) => Ok(mb),
			Err(_) => ReadTimeoutSnafu.fail(),
		}
	}

	/// Puts data back at the front so the next read sees it first. The
	/// dispatcher uses this to replay the sniffed prefix.
	pub fn unread(&mut self, mb: MultiBuffer) {
		for buf in mb.into_iter().rev() {
			self.pending.push_front(buf);
		}
	}

	fn take_pending(&mut self) -> Option<MultiBuffer> {
		if self.pending.is_empty() {
			return None;
		}
		let mut mb = MultiBuffer::new();
		for buf in self.pending.drain(..) {
			mb.push(buf);
		}
		Some(mb)
	}
}

impl AsyncRead for PipeReader {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		loop {
			if let Some(front) = self.pending.front_mut() {
				let n = front.len().min(buf.remaining());
				buf.put_slice(&front.split_to(n));
				if front.is_empty() {
					self.pending.pop_front();
				}
				return Poll::Ready(Ok(()));
			}

			match self.rx.poll_recv(cx) {
				Poll::Ready(Some(mb)) => {
					for b in mb {
						self.pending.push_back(b);
					}
				}
				Poll::Ready(None) => return Poll::Ready(Ok(())),
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}

#[async_trait]
impl MultiBufferReader for PipeReader {
	async fn read_mb(&mut self) -> Result<Option<MultiBuffer>, TransferError> {
		Ok(self.read().await)
	}
}

#[async_trait]
impl MultiBufferWriter for PipeWriter {
	async fn write_mb(&mut self, mb: MultiBuffer) -> Result<(), TransferError> {
		self.write(mb).await
	}
}

#[async_trait]
impl MultiBufferWriter for &PipeWriter {
	async fn write_mb(&mut self, mb: MultiBuffer) -> Result<(), TransferError> {
		self.write(mb).await
	}
}

/// One end of an in-process bidirectional conduit.
pub struct Link {
	pub reader: PipeReader,
	pub writer: PipeWriter,
}

/// Creates a link pair wired back to back: whatever one side writes, the
/// other side reads.
pub fn new_link() -> (Link, Link) {
	let (w1, r1) = pipe();
	let (w2, r2) = pipe();

	let near = Link {
		reader: r1,
		writer: w2,
	};
	let far = Link {
		reader: r2,
		writer: w1,
	};
	(near, far)
}
