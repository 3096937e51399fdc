use std::{backtrace::Backtrace, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use snafu::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::buffer::MultiBuffer;

//-----------------------------------------------------------------------------
// Error Definitions
//-----------------------------------------------------------------------------

/// Failure of a single transfer step. `ReadTimeout` is deliberately its own
/// variant: callers fall through to the next processing stage on it, which
/// would be wrong for `ClosedPipe` or an underlying IO failure.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransferError {
	#[snafu(display("pipe is closed"))]
	ClosedPipe { backtrace: Backtrace },

	#[snafu(display("read timed out"))]
	ReadTimeout { backtrace: Backtrace },

	#[snafu(display("transport io failed"))]
	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},

	#[snafu(display("malformed payload: {message}"))]
	Malformed {
		message:   String,
		backtrace: Backtrace,
	},
}

impl TransferError {
	pub fn is_read_timeout(&self) -> bool {
		matches!(self, TransferError::ReadTimeout { .. })
	}
}

/// Direction-aware wrapper produced by [`copy`], so state machines can react
/// differently to a dead source and a dead sink.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CopyError {
	#[snafu(display("copy failed while reading"))]
	ReadSide { source: TransferError },

	#[snafu(display("copy failed while writing"))]
	WriteSide { source: TransferError },
}

impl CopyError {
	pub fn is_read_timeout(&self) -> bool {
		matches!(self, CopyError::ReadSide { source } if source.is_read_timeout())
	}

	pub fn is_write(&self) -> bool {
		matches!(self, CopyError::WriteSide { .. })
	}
}

//-----------------------------------------------------------------------------
// Transfer Traits
//-----------------------------------------------------------------------------

/// Source of ordered [`MultiBuffer`]s. `Ok(None)` is end of stream.
#[async_trait]
pub trait MultiBufferReader: Send {
	async fn read_mb(&mut self) -> Result<Option<MultiBuffer>, TransferError>;
}

/// Sink of ordered [`MultiBuffer`]s.
#[async_trait]
pub trait MultiBufferWriter: Send {
	async fn write_mb(&mut self, mb: MultiBuffer) -> Result<(), TransferError>;
}

#[async_trait]
impl<T: MultiBufferReader + ?Sized> MultiBufferReader for &mut T {
	async fn read_mb(&mut self) -> Result<Option<MultiBuffer>, TransferError> {
		(**self).read_mb().await
	}
}

#[async_trait]
impl<T: MultiBufferWriter + ?Sized> MultiBufferWriter for &mut T {
	async fn write_mb(&mut self, mb: MultiBuffer) -> Result<(), TransferError> {
		(**self).write_mb(mb).await
	}
}

/// Sink that swallows everything. Used to drain unwanted wire payload while
/// keeping the stream position correct.
pub struct Discard;

#[async_trait]
impl MultiBufferWriter for Discard {
	async fn write_mb(&mut self, _mb: MultiBuffer) -> Result<(), TransferError> {
		Ok(())
	}
}

/// Applies a deadline to every read of the wrapped reader.
///
/// Only meant for cancel-safe sources (pipe readers); a timed-out read must
/// not leave half-consumed state behind.
pub struct TimeoutReader<R> {
	inner:   R,
	timeout: Duration,
}

impl<R> TimeoutReader<R> {
	pub fn new(inner: R, timeout: Duration) -> Self {
		Self { inner, timeout }
	}
}

#[async_trait]
impl<R: MultiBufferReader> MultiBufferReader for TimeoutReader<R> {
	async fn read_mb(&mut self) -> Result<Option<MultiBuffer>, TransferError> {
		match tokio::time::timeout(self.timeout, self.inner.read_mb()).await {
			Ok(result) => result,
			Err(_) => ReadTimeoutSnafu.fail(),
		}
	}
}

/// Pumps `reader` into `writer` until end of stream. Errors keep their
/// direction so callers can distinguish a dead peer from a dead sink.
pub async fn copy<R, W>(reader: &mut R, writer: &mut W) -> Result<(), CopyError>
where
	R: MultiBufferReader + ?Sized,
	W: MultiBufferWriter + ?Sized,
{
	loop {
		let mb = match reader.read_mb().await.context(ReadSideSnafu)? {
			Some(mb) => mb,
			None => return Ok(()),
		};
		if mb.is_empty() {
			continue;
		}
		writer.write_mb(mb).await.context(WriteSideSnafu)?;
	}
}

//-----------------------------------------------------------------------------
// Buffered Byte Source
//-----------------------------------------------------------------------------

const FILL_SIZE: usize = 8 * 1024;

/// Byte-granular reading on top of an [`AsyncRead`], with a look-ahead buffer
/// that wire parsers (frame metadata, chunk lengths) pull exact counts from.
pub struct BufferedSource<R> {
	inner: R,
	buf:   BytesMut,
}

impl<R: AsyncRead + Unpin + Send> BufferedSource<R> {
	pub fn new(inner: R) -> Self {
		Self {
			inner,
			buf: BytesMut::with_capacity(FILL_SIZE),
		}
	}

	/// Pulls more data from the inner stream. `Ok(0)` means end of stream.
	async fn fill(&mut self) -> Result<usize, TransferError> {
		self.inner.read_buf(&mut self.buf).await.context(IoSnafu)
	}

	/// Reads exactly `n` bytes. A stream ending mid-way surfaces as an
	/// `UnexpectedEof` io error, never as a short read.
	pub async fn read_exact(&mut self, n: usize) -> Result<Bytes, TransferError> {
		while self.buf.len() < n {
			if self.fill().await? == 0 {
				return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
					.context(IoSnafu);
			}
		}
		Ok(self.buf.split_to(n).freeze())
	}

	/// Like [`read_exact`](Self::read_exact) but a clean end of stream right
	/// at the boundary yields `None` instead of an error. A stream ending
	/// with a partial item is still an error.
	pub async fn read_exact_opt(&mut self, n: usize) -> Result<Option<Bytes>, TransferError> {
		while self.buf.len() < n {
			if self.fill().await? == 0 {
				if self.buf.is_empty() {
					return Ok(None);
				}
				return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
					.context(IoSnafu);
			}
		}
		Ok(Some(self.buf.split_to(n).freeze()))
	}

	/// Reads between 1 and `n` bytes, or `None` on a clean end of stream.
	pub async fn read_at_most(&mut self, n: usize) -> Result<Option<Bytes>, TransferError> {
		if self.buf.is_empty() && self.fill().await? == 0 {
			return Ok(None);
		}
		let take = self.buf.len().min(n);
		Ok(Some(self.buf.split_to(take).freeze()))
	}

	pub async fn read_u16_be(&mut self) -> Result<u16, TransferError> {
		let b = self.read_exact(2).await?;
		Ok(u16::from_be_bytes([b[0], b[1]]))
	}

	/// Skips exactly `n` bytes.
	pub async fn skip(&mut self, n: usize) -> Result<(), TransferError> {
		let mut remaining = n;
		while remaining > 0 {
			let take = remaining.min(FILL_SIZE);
			self.read_exact(take).await?;
			remaining -= take;
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn exact_reads_span_fill_boundaries() -> eyre::Result<()> {
		let data: Vec<u8> = (0..=255u8).cycle().take(20_000).collect();
		let mut src = BufferedSource::new(&data[..]);

		let head = src.read_exact(10_000).await?;
		let tail = src.read_exact(10_000).await?;
		assert_eq!([head.as_ref(), tail.as_ref()].concat(), data);

		assert!(matches!(
			src.read_exact(1).await.unwrap_err(),
			TransferError::Io { .. }
		));
		Ok(())
	}

	#[tokio::test]
	async fn read_at_most_reports_clean_eof() -> eyre::Result<()> {
		let mut src = BufferedSource::new(&b"abc"[..]);
		assert_eq!(src.read_at_most(8).await?.unwrap().as_ref(), b"abc");
		assert!(src.read_at_most(8).await?.is_none());
		Ok(())
	}
}
