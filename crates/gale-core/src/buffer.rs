use bytes::{Bytes, BytesMut};

/// Capacity cap of a single buffer inside a [`MultiBuffer`].
pub const SIZE: usize = 2048;

/// An ordered run of small byte buffers, each at most [`SIZE`] bytes.
///
/// Links and protocol codecs shuttle these around instead of raw `Vec<u8>`
/// so that datagram boundaries survive a trip through a pipe: one datagram
/// is one buffer.
#[derive(Debug, Default, Clone)]
pub struct MultiBuffer {
	bufs: Vec<Bytes>,
}

impl MultiBuffer {
	pub fn new() -> Self {
		Self::default()
	}

	/// Splits `data` into `SIZE`-capped buffers.
	pub fn from_bytes(data: &[u8]) -> Self {
		let mut mb = MultiBuffer::new();
		for chunk in data.chunks(SIZE) {
			mb.bufs.push(Bytes::copy_from_slice(chunk));
		}
		mb
	}

	/// Wraps a single pre-built buffer without re-chunking. The caller is
	/// expected to keep datagram payloads within `u16` range; oversized
	/// buffers are legal for stream transfers.
	pub fn from_buffer(buf: Bytes) -> Self {
		let mut mb = MultiBuffer::new();
		if !buf.is_empty() {
			mb.bufs.push(buf);
		}
		mb
	}

	pub fn push(&mut self, buf: Bytes) {
		if !buf.is_empty() {
			self.bufs.push(buf);
		}
	}

	pub fn len(&self) -> usize {
		self.bufs.iter().map(Bytes::len).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.bufs.iter().all(Bytes::is_empty)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
		self.bufs.iter()
	}

	/// Appends every buffer of `other`, preserving order.
	pub fn extend(&mut self, other: MultiBuffer) {
		self.bufs.extend(other.bufs);
	}

	/// Takes up to `limit` bytes off the front, keeping the rest in place.
	pub fn split_to(&mut self, limit: usize) -> MultiBuffer {
		let mut taken = MultiBuffer::new();
		let mut remaining = limit;
		while remaining > 0 && !self.bufs.is_empty() {
			let front = &mut self.bufs[0];
			if front.len() <= remaining {
				remaining -= front.len();
				taken.bufs.push(self.bufs.remove(0));
			} else {
				taken.bufs.push(front.split_to(remaining));
				remaining = 0;
			}
		}
		taken
	}

	/// Detaches the first buffer, or `None` when empty.
	pub fn split_first(&mut self) -> Option<Bytes> {
		if self.bufs.is_empty() {
			None
		} else {
			Some(self.bufs.remove(0))
		}
	}

	/// Copies the whole content into one flat allocation.
	pub fn to_bytes(&self) -> Bytes {
		let mut out = BytesMut::with_capacity(self.len());
		for buf in &self.bufs {
			out.extend_from_slice(buf);
		}
		out.freeze()
	}

	/// Copies as much as fits into `dst`, returning the copied length.
	pub fn copy_to_slice(&self, dst: &mut [u8]) -> usize {
		let mut written = 0;
		for buf in &self.bufs {
			if written == dst.len() {
				break;
			}
			let n = (dst.len() - written).min(buf.len());
			dst[written..written + n].copy_from_slice(&buf[..n]);
			written += n;
		}
		written
	}
}

impl From<Bytes> for MultiBuffer {
	fn from(value: Bytes) -> Self {
		MultiBuffer::from_buffer(value)
	}
}

impl From<Vec<u8>> for MultiBuffer {
	fn from(value: Vec<u8>) -> Self {
		MultiBuffer::from_buffer(Bytes::from(value))
	}
}

impl IntoIterator for MultiBuffer {
	type IntoIter = std::vec::IntoIter<Bytes>;
	type Item = Bytes;

	fn into_iter(self) -> Self::IntoIter {
		self.bufs.into_iter()
	}
}
